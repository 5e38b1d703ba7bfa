//! Minimal m3u8 playlist model
//!
//! Parses just enough of RFC 8216 to drive a live probe: master playlists
//! (variant URIs), media playlists (segment URIs with sequence numbers,
//! target duration, the ENDLIST marker). Attribute lists beyond these are
//! ignored.

use super::DemuxError;

/// One segment entry of a media playlist
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: String,
    pub seq_id: u64,
    pub duration: f32,
}

/// Media playlist: the rolling segment window of a live stream, or the
/// full list of a finished one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub target_duration: f32,
    /// `#EXT-X-ENDLIST` present: a finished file, not a live stream
    pub closed: bool,
}

/// Master playlist: variant stream URIs in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MasterPlaylist {
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Parse a playlist body
pub fn parse(text: &str) -> Result<Playlist, DemuxError> {
    let mut lines = text.lines().map(str::trim);
    match lines.next() {
        Some(l) if l.starts_with("#EXTM3U") => {}
        _ => {
            return Err(DemuxError::InvalidPlaylist(
                "missing #EXTM3U header".to_string(),
            ))
        }
    }

    let mut master = MasterPlaylist::default();
    let mut media = MediaPlaylist::default();
    let mut media_sequence: u64 = 0;
    let mut next_seq: u64 = 0;
    let mut pending_variant = false;
    let mut pending_duration: Option<f32> = None;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = rest.trim().parse().map_err(|_| {
                DemuxError::InvalidPlaylist(format!("bad media sequence: {}", rest))
            })?;
            next_seq = media_sequence;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            media.target_duration = rest.trim().parse().unwrap_or(0.0);
        } else if line.starts_with("#EXT-X-ENDLIST") {
            media.closed = true;
        } else if line.starts_with("#EXT-X-STREAM-INF:") {
            pending_variant = true;
        } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let duration = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse().ok())
                .unwrap_or(0.0);
            pending_duration = Some(duration);
        } else if line.starts_with('#') {
            // unhandled tag
        } else if pending_variant {
            master.variants.push(line.to_string());
            pending_variant = false;
        } else if let Some(duration) = pending_duration.take() {
            media.segments.push(Segment {
                uri: line.to_string(),
                seq_id: next_seq,
                duration,
            });
            next_seq += 1;
        }
        // bare URI lines without a preceding EXTINF/STREAM-INF are dropped
    }

    if !master.variants.is_empty() {
        Ok(Playlist::Master(master))
    } else {
        Ok(Playlist::Media(media))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
http://example.com/hi/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=256000
http://example.com/lo/index.m3u8
";

    const LIVE_MEDIA: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:117
#EXTINF:2.000,
seg-117.ts
#EXTINF:2.000,
seg-118.ts
#EXTINF:1.960,
/abs/seg-119.ts
";

    const VOD_MEDIA: &str = "\
#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4.0,
a.ts
#EXTINF:4.0,
b.ts
#EXT-X-ENDLIST
";

    #[test]
    fn test_master_playlist() {
        let Playlist::Master(m) = parse(MASTER).unwrap() else {
            panic!("expected master");
        };
        assert_eq!(m.variants.len(), 2);
        assert_eq!(m.variants[0], "http://example.com/hi/index.m3u8");
    }

    #[test]
    fn test_live_media_playlist_sequencing() {
        let Playlist::Media(m) = parse(LIVE_MEDIA).unwrap() else {
            panic!("expected media");
        };
        assert!(!m.closed);
        assert_eq!(m.target_duration, 2.0);
        assert_eq!(m.segments.len(), 3);
        assert_eq!(m.segments[0].seq_id, 117);
        assert_eq!(m.segments[2].seq_id, 119);
        assert_eq!(m.segments[2].uri, "/abs/seg-119.ts");
        assert_eq!(m.segments[2].duration, 1.96);
    }

    #[test]
    fn test_vod_media_playlist_closed() {
        let Playlist::Media(m) = parse(VOD_MEDIA).unwrap() else {
            panic!("expected media");
        };
        assert!(m.closed);
        assert_eq!(m.segments.len(), 2);
        // no media-sequence tag: numbering starts at zero
        assert_eq!(m.segments[0].seq_id, 0);
        assert_eq!(m.segments[1].seq_id, 1);
    }

    #[test]
    fn test_missing_header_rejected() {
        assert!(matches!(
            parse("not a playlist"),
            Err(DemuxError::InvalidPlaylist(_))
        ));
    }
}
