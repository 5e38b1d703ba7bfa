//! Body digests
//!
//! The probe core only needs a byte-consuming sink with `update` and a
//! hex-encoded `finalize`; the concrete algorithm is chosen by the
//! front-end.

use md5::Digest as _;

/// Byte-consuming digest sink for downloaded bodies
pub trait BodyDigest: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize_hex(self: Box<Self>) -> String;
}

pub struct Md5Digest(md5::Md5);

impl BodyDigest for Md5Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

pub struct Sha1Digest(sha1::Sha1);

impl BodyDigest for Sha1Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

pub struct Crc32Digest(crc32fast::Hasher);

impl BodyDigest for Crc32Digest {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:08x}", self.0.finalize())
    }
}

/// Look up a digest by its CLI name: `md5`, `sha1` or `crc32`
pub fn by_name(name: &str) -> Option<Box<dyn BodyDigest>> {
    match name.to_ascii_lowercase().as_str() {
        "md5" => Some(Box::new(Md5Digest(md5::Md5::new()))),
        "sha1" => Some(Box::new(Sha1Digest(sha1::Sha1::new()))),
        "crc32" => Some(Box::new(Crc32Digest(crc32fast::Hasher::new()))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(name: &str, data: &[u8]) -> String {
        let mut d = by_name(name).unwrap();
        d.update(data);
        d.finalize_hex()
    }

    #[test]
    fn test_md5_known_vector() {
        assert_eq!(digest_of("md5", b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            digest_of("sha1", b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_crc32_known_vector() {
        assert_eq!(digest_of("crc32", b"123456789"), "cbf43926");
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut d = by_name("md5").unwrap();
        d.update(b"ab");
        d.update(b"c");
        assert_eq!(d.finalize_hex(), digest_of("md5", b"abc"));
    }

    #[test]
    fn test_unknown_name() {
        assert!(by_name("blake3").is_none());
    }
}
