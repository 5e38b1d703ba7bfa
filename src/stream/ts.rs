//! MPEG-TS parser
//!
//! Fixed 188-byte packets, sync byte `0x47`. The parser keeps the current
//! PAT and PMT and extracts one `AVPacket` per PES header that carries a
//! PTS; payload bytes beyond the header are never decoded.

use super::{AVPacket, DemuxError, PacketKind};

/// TS packet size on the wire
pub const TS_PACKET_SIZE: usize = 188;

/// First byte of every TS packet
pub const SYNC_BYTE: u8 = 0x47;

pub const STREAM_TYPE_AUDIO_AAC: u8 = 0x0f;
pub const STREAM_TYPE_VIDEO_H264: u8 = 0x1b;
pub const STREAM_TYPE_VIDEO_HEVC: u8 = 0x24;

/// Reserved / tables-we-ignore PIDs: CAT, TSDT, IPMP, SDT, EIT-ish, null
const IGNORED_PIDS: [u16; 6] = [0x01, 0x02, 0x03, 0x11, 0x42, 0x1fff];

/// PES stream ids that carry no standard header (program stream map,
/// padding, private_stream_2, ECM/EMM, directory, DSMCC, H.222.1 E)
const HEADERLESS_STREAM_IDS: [u8; 8] = [188, 190, 191, 240, 241, 255, 242, 248];

/// One PAT entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatProgram {
    pub program_number: u16,
    pub program_map_pid: u16,
}

/// One PMT elementary-stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub elementary_pid: u16,
    pub stream_type: u8,
}

/// Stateful TS packet parser
#[derive(Debug, Default)]
pub struct TsParser {
    pat: Vec<PatProgram>,
    pmt: Vec<PmtStream>,
}

impl TsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one 188-byte packet
    ///
    /// `Ok(None)` covers everything that is not an AV payload with a PTS:
    /// tables, adaptation-only packets, ignored PIDs, continuation
    /// packets.
    pub fn parse_packet(&mut self, data: &[u8]) -> Result<Option<AVPacket>, DemuxError> {
        if data.len() < TS_PACKET_SIZE || data[0] != SYNC_BYTE {
            return Err(DemuxError::InvalidTsPacket);
        }

        /*
         * sync_byte                        8 bit
         * transport_error_indicator        1 bit
         * payload_unit_start_indicator     1 bit
         * transport_priority               1 bit
         * pid                              13 bit
         * transport_scrambling_control     2 bit
         * adaptation_field_control         2 bit
         * continuity_count                 4 bit
         */
        let payload_unit_start = data[1] & 0x40 != 0;
        let pid = (u16::from(data[1] & 0x1f) << 8) | u16::from(data[2]);
        let adaptation_field_control = (data[3] & 0x30) >> 4;

        if IGNORED_PIDS.contains(&pid) {
            return Ok(None);
        }
        // 0: reserved, 2: adaptation field only, no payload
        if adaptation_field_control == 0 || adaptation_field_control == 2 {
            return Ok(None);
        }

        let mut payload = &data[4..];
        if adaptation_field_control == 3 {
            let len = payload[0] as usize;
            payload = &payload[1..];
            if len >= payload.len() {
                return Ok(None);
            }
            payload = &payload[len..];
        }

        if pid == 0 {
            let section = skip_pointer(payload, payload_unit_start);
            self.decode_pat(section);
            return Ok(None);
        }

        if self.pat.iter().any(|p| p.program_map_pid == pid) {
            let section = skip_pointer(payload, payload_unit_start);
            self.decode_pmt(section);
            return Ok(None);
        }

        let Some(stream) = self.pmt.iter().find(|s| s.elementary_pid == pid) else {
            return Ok(None);
        };
        if !payload_unit_start {
            return Ok(None);
        }
        let kind = match stream.stream_type {
            STREAM_TYPE_VIDEO_H264 | STREAM_TYPE_VIDEO_HEVC => PacketKind::Video,
            _ => PacketKind::Audio,
        };
        decode_pes(payload, kind)
    }

    fn decode_pat(&mut self, data: &[u8]) {
        if data.len() < 8 {
            return;
        }
        let section_length = ((data[1] & 0x0f) as i32) << 8 | data[2] as i32;
        let mut p = &data[8..];
        let mut programs = Vec::new();
        let mut i = 0i32;
        while i < section_length - 9 && p.len() >= 4 {
            let program_number = u16::from(p[0]) << 8 | u16::from(p[1]);
            if program_number != 0 {
                programs.push(PatProgram {
                    program_number,
                    program_map_pid: (u16::from(p[2]) << 8 | u16::from(p[3])) & 0x1fff,
                });
            }
            p = &p[4..];
            i += 4;
        }
        self.pat = programs;
    }

    fn decode_pmt(&mut self, data: &[u8]) {
        if data.len() < 12 {
            return;
        }
        let section_length = ((data[1] & 0x0f) as i32) << 8 | data[2] as i32;
        let program_info_length = ((data[10] & 0x0f) as usize) << 8 | data[11] as usize;
        if 12 + program_info_length > data.len() {
            return;
        }
        let mut p = &data[12 + program_info_length..];
        let mut streams = Vec::new();
        let mut i = 0i32;
        while i < section_length - 9 - 5 && p.len() >= 5 {
            let stream_type = p[0];
            let elementary_pid = (u16::from(p[1]) << 8 | u16::from(p[2])) & 0x1fff;
            let es_info_length = ((p[3] & 0x0f) as usize) << 8 | p[4] as usize;
            streams.push(PmtStream {
                elementary_pid,
                stream_type,
            });
            if 5 + es_info_length > p.len() {
                break;
            }
            p = &p[5 + es_info_length..];
            i += 5;
        }
        // an empty table never replaces a known-good one
        if !streams.is_empty() {
            self.pmt = streams;
        }
    }
}

fn skip_pointer(payload: &[u8], payload_unit_start: bool) -> &[u8] {
    if payload_unit_start && !payload.is_empty() {
        &payload[1..]
    } else {
        payload
    }
}

fn decode_pes(data: &[u8], kind: PacketKind) -> Result<Option<AVPacket>, DemuxError> {
    if data.len() < 9 {
        return Err(DemuxError::InvalidPesHeader);
    }

    /* packet_start_code_prefix               24 bslbf */
    let start_code = (u32::from(data[0]) << 16) | (u32::from(data[1]) << 8) | u32::from(data[2]);
    if start_code != 0x000001 {
        return Err(DemuxError::InvalidPesHeader);
    }

    let stream_id = data[3];
    // skip stream_id and PES_packet_length
    let p = &data[6..];

    if HEADERLESS_STREAM_IDS.contains(&stream_id) {
        return Ok(None);
    }
    if p[0] & 0xc0 != 0x80 {
        return Err(DemuxError::InvalidPesHeader);
    }

    /*
     * PTS_DTS_flags                            2  bslbf
     * ESCR_flag                                1  bslbf
     * ES_rate_flag                             1  bslbf
     * DSM_trick_mode_flag                      1  bslbf
     * additional_copy_info_flag                1  bslbf
     * PES_CRC_flag                             1  bslbf
     * PES_extension_flag                       1  bslbf
     */
    let pts_dts_flags = (p[1] & 0xc0) >> 6;
    if pts_dts_flags != 2 && pts_dts_flags != 3 {
        return Ok(None);
    }
    // skip marker, flags, PES_header_data_length
    let q = &p[3..];
    if q.len() < 5 {
        return Err(DemuxError::InvalidPesHeader);
    }

    /*
     * '0010' / '0011'                        4  bslbf
     * PTS [32..30]                           3  bslbf
     * marker_bit                             1  bslbf
     * PTS [29..15]                           15 bslbf
     * marker_bit                             1  bslbf
     * PTS [14..0]                            15 bslbf
     * marker_bit                             1  bslbf
     */
    if (q[0] & 0xf0) >> 4 != pts_dts_flags {
        return Err(DemuxError::InvalidPesHeader);
    }
    let pts: u64 = (u64::from((q[0] >> 1) & 0x07) << 30)
        | (u64::from(q[1]) << 22)
        | (u64::from((q[2] >> 1) & 0x7f) << 15)
        | (u64::from(q[3]) << 7)
        | u64::from(q[4] >> 1);

    // 90 kHz clock to milliseconds; the TS demuxer cannot tell key frames
    // apart without decoding payloads, so every packet is flagged
    Ok(Some(AVPacket {
        kind,
        pts: (pts / 90) as u32,
        keyframe: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packet(header: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(TS_PACKET_SIZE);
        pkt.extend_from_slice(&header);
        pkt.extend_from_slice(payload);
        pkt.resize(TS_PACKET_SIZE, 0xFF);
        pkt
    }

    /// PAT announcing program 1 with PMT on pid 0x100
    fn pat_packet() -> Vec<u8> {
        let section = [
            0x00, // table_id
            0xB0, 0x0D, // section_length = 13
            0x00, 0x01, // transport_stream_id
            0xC1, 0x00, 0x00, // version/current, section, last
            0x00, 0x01, // program_number = 1
            0xE1, 0x00, // program_map_pid = 0x100
            0x00, 0x00, 0x00, 0x00, // CRC (unchecked)
        ];
        let mut payload = vec![0x00]; // pointer_field
        payload.extend_from_slice(&section);
        ts_packet([SYNC_BYTE, 0x40, 0x00, 0x10], &payload)
    }

    /// PMT on pid 0x100: H.264 on pid 0x101, AAC on pid 0x102
    fn pmt_packet() -> Vec<u8> {
        let section = [
            0x02, // table_id
            0xB0, 0x18, // section_length = 24
            0x00, 0x01, // program_number
            0xC1, 0x00, 0x00, // version/current, section, last
            0xE1, 0x01, // PCR pid
            0xF0, 0x00, // program_info_length = 0
            STREAM_TYPE_VIDEO_H264, 0xE1, 0x01, 0xF0, 0x00,
            STREAM_TYPE_AUDIO_AAC, 0xE1, 0x02, 0xF0, 0x00,
            0x00, 0x00, 0x00, 0x00, // CRC (unchecked)
        ];
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        ts_packet([SYNC_BYTE, 0x41, 0x00, 0x10], &payload)
    }

    /// PES with a PTS of `pts_ms` milliseconds on the given pid
    fn pes_packet(pid: u16, pts_ms: u64) -> Vec<u8> {
        let pts = pts_ms * 90;
        let pts_bytes = [
            0x21 | (((pts >> 30) & 0x07) as u8) << 1,
            ((pts >> 22) & 0xff) as u8,
            ((((pts >> 15) & 0x7f) as u8) << 1) | 1,
            ((pts >> 7) & 0xff) as u8,
            (((pts & 0x7f) as u8) << 1) | 1,
        ];
        let mut payload = vec![
            0x00, 0x00, 0x01, // start code
            0xE0, // stream_id: video
            0x00, 0x00, // PES_packet_length
            0x80, // marker bits
            0x80, // PTS_DTS_flags = 2
            0x05, // PES_header_data_length
        ];
        payload.extend_from_slice(&pts_bytes);
        ts_packet(
            [SYNC_BYTE, 0x40 | (pid >> 8) as u8, (pid & 0xff) as u8, 0x10],
            &payload,
        )
    }

    fn primed_parser() -> TsParser {
        let mut parser = TsParser::new();
        assert_eq!(parser.parse_packet(&pat_packet()).unwrap(), None);
        assert_eq!(parser.parse_packet(&pmt_packet()).unwrap(), None);
        parser
    }

    #[test]
    fn test_rejects_bad_sync_byte() {
        let mut parser = TsParser::new();
        let mut pkt = pat_packet();
        pkt[0] = 0x48;
        assert_eq!(
            parser.parse_packet(&pkt),
            Err(DemuxError::InvalidTsPacket)
        );
    }

    #[test]
    fn test_rejects_short_packet() {
        let mut parser = TsParser::new();
        assert_eq!(
            parser.parse_packet(&[SYNC_BYTE, 0, 0, 0]),
            Err(DemuxError::InvalidTsPacket)
        );
    }

    #[test]
    fn test_pat_then_pmt_then_video_pes() {
        let mut parser = primed_parser();
        assert_eq!(parser.pat.len(), 1);
        assert_eq!(parser.pat[0].program_map_pid, 0x100);
        assert_eq!(parser.pmt.len(), 2);

        let pkt = parser.parse_packet(&pes_packet(0x101, 1000)).unwrap();
        assert_eq!(
            pkt,
            Some(AVPacket {
                kind: PacketKind::Video,
                pts: 1000,
                keyframe: true,
            })
        );
    }

    #[test]
    fn test_audio_pid_classified_audio() {
        let mut parser = primed_parser();
        let pkt = parser.parse_packet(&pes_packet(0x102, 40)).unwrap().unwrap();
        assert_eq!(pkt.kind, PacketKind::Audio);
        assert_eq!(pkt.pts, 40);
    }

    #[test]
    fn test_large_pts_uses_33_bits() {
        let mut parser = primed_parser();
        // beyond 32-bit ticks: 2^32 / 90 ms and change
        let pts_ms = 50_000_000;
        let pkt = parser.parse_packet(&pes_packet(0x101, pts_ms)).unwrap();
        assert_eq!(pkt.unwrap().pts, pts_ms as u32);
    }

    #[test]
    fn test_ignored_and_unknown_pids() {
        let mut parser = primed_parser();
        // null pid
        let null = ts_packet([SYNC_BYTE, 0x5f, 0xff, 0x10], &[0u8; 8]);
        assert_eq!(parser.parse_packet(&null).unwrap(), None);
        // unmapped pid
        let stray = ts_packet([SYNC_BYTE, 0x42, 0x00, 0x10], &[0u8; 8]);
        assert_eq!(parser.parse_packet(&stray).unwrap(), None);
    }

    #[test]
    fn test_adaptation_only_packet_skipped() {
        let mut parser = primed_parser();
        let pkt = ts_packet([SYNC_BYTE, 0x41, 0x01, 0x20], &[0u8; 8]);
        assert_eq!(parser.parse_packet(&pkt).unwrap(), None);
    }

    #[test]
    fn test_pes_bad_start_code() {
        let mut parser = primed_parser();
        let mut pkt = pes_packet(0x101, 0);
        pkt[6] = 0x02; // corrupt the 00 00 01 prefix
        assert_eq!(
            parser.parse_packet(&pkt),
            Err(DemuxError::InvalidPesHeader)
        );
    }

    #[test]
    fn test_pes_without_pts_is_soft_skip() {
        let mut parser = primed_parser();
        let payload = [
            0x00u8, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, /* no PTS */ 0x00,
        ];
        let pkt = ts_packet([SYNC_BYTE, 0x41, 0x01, 0x10], &payload);
        assert_eq!(parser.parse_packet(&pkt).unwrap(), None);
    }

    #[test]
    fn test_continuation_packet_skipped() {
        let mut parser = primed_parser();
        // same video pid, payload_unit_start clear
        let pkt = ts_packet([SYNC_BYTE, 0x01, 0x01, 0x10], &[0u8; 16]);
        assert_eq!(parser.parse_packet(&pkt).unwrap(), None);
    }

    #[test]
    fn test_empty_pmt_does_not_clobber() {
        let mut parser = primed_parser();
        // a PMT section with zero streams
        let section = [
            0x02, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x01, 0xF0, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        let pkt = ts_packet([SYNC_BYTE, 0x41, 0x00, 0x10], &payload);
        parser.parse_packet(&pkt).unwrap();
        assert_eq!(parser.pmt.len(), 2);
    }
}
