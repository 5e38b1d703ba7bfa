//! FLV demuxer
//!
//! Pulls an FLV byte stream over HTTP and turns its tag sequence into
//! `AVPacket`s. Only AVC NALU video tags and raw AAC audio tags become
//! packets; script tags, sequence headers and anything undecodable are
//! soft-skipped so a glitch in the stream never kills the probe.

use tokio::time::{sleep, Duration};

use crate::http::client::{self, Body, ClientOptions, Request};
use crate::net::ProbeConn;

use super::{AVPacket, DemuxError, Demuxer, PacketKind, StreamInfo, ERR_INVALID_HTTP_CODE,
    ERR_TCP_CONNECT_TIMEOUT};

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;

const FRAME_TYPE_KEYFRAME: u8 = 1;
const CODEC_AVC: u8 = 7;
/// AVCPacketType: one or more NALUs (0 is the sequence header)
const AVC_PACKET_NALU: u8 = 1;

const SOUND_FORMAT_AAC: u8 = 10;
/// AACPacketType: raw frame (0 is the AudioSpecificConfig)
const AAC_PACKET_RAW: u8 = 1;

/// Pause before retrying once the stream has hit EOF, so the soft-skip
/// loop stays cooperative until the probe timer fires
const EOF_BACKOFF: Duration = Duration::from_millis(100);

/// FLV-over-HTTP packet source
pub struct FlvDemux {
    url: url::Url,
    headers: Vec<(String, String)>,
    body: Option<Body>,
    header_bad: bool,
    eof: bool,
}

impl FlvDemux {
    pub fn new(url: url::Url, headers: Vec<(String, String)>) -> Self {
        Self {
            url,
            headers,
            body: None,
            header_bad: false,
            eof: false,
        }
    }

    /// Validate the 9-byte file header plus the leading PreviousTagSize0
    async fn read_file_header(body: &mut Body) -> bool {
        let mut hdr = [0u8; 9];
        if body.read_exact(&mut hdr).await.is_err() {
            return false;
        }
        if &hdr[0..3] != b"FLV" {
            return false;
        }
        let data_offset = u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]);
        if data_offset < 9 {
            return false;
        }
        // skip header extensions plus PreviousTagSize0
        let mut skip = (data_offset - 9) as usize + 4;
        let mut scratch = [0u8; 64];
        while skip > 0 {
            let n = skip.min(scratch.len());
            if body.read_exact(&mut scratch[..n]).await.is_err() {
                return false;
            }
            skip -= n;
        }
        true
    }
}

impl Demuxer for FlvDemux {
    async fn connect(&mut self) -> crate::Result<StreamInfo> {
        let mut info = StreamInfo::new();
        let req = Request {
            method: "GET".to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        };

        let mut resp = match client::send(ProbeConn::new(), &req, &ClientOptions::default()).await
        {
            Ok(resp) => resp,
            Err(failure) => {
                tracing::warn!(error = %failure.error, url = %self.url, "flv connect failed");
                info.err_code = ERR_TCP_CONNECT_TIMEOUT;
                return Ok(info);
            }
        };

        info.fill_connection(resp.body.conn(), resp.status);
        if resp.status != 200 {
            info.err_code = ERR_INVALID_HTTP_CODE;
            return Ok(info);
        }

        if !Self::read_file_header(&mut resp.body).await {
            self.header_bad = true;
            return Ok(info);
        }
        self.body = Some(resp.body);
        Ok(info)
    }

    async fn read(&mut self) -> Result<Option<AVPacket>, DemuxError> {
        if self.header_bad {
            return Err(DemuxError::InvalidFlvHeader);
        }
        let Some(body) = self.body.as_mut() else {
            return Err(DemuxError::InvalidFlvHeader);
        };
        if self.eof {
            sleep(EOF_BACKOFF).await;
            return Ok(None);
        }

        // tag header: type(1) size(3) timestamp(3+1) stream_id(3)
        let mut hdr = [0u8; 11];
        if body.read_exact(&mut hdr).await.is_err() {
            self.eof = true;
            return Ok(None);
        }
        let tag_type = hdr[0] & 0x1f;
        let data_size = u32::from_be_bytes([0, hdr[1], hdr[2], hdr[3]]) as usize;
        let timestamp =
            u32::from_be_bytes([hdr[7], hdr[4], hdr[5], hdr[6]]);

        let mut data = vec![0u8; data_size];
        if body.read_exact(&mut data).await.is_err() {
            self.eof = true;
            return Ok(None);
        }
        let mut prev_size = [0u8; 4];
        if body.read_exact(&mut prev_size).await.is_err() {
            self.eof = true;
        }

        Ok(parse_tag(tag_type, timestamp, &data))
    }

    fn close(&mut self) {
        // dropping the body closes the connection and aborts any
        // in-flight read
        self.body = None;
    }
}

/// Decode one tag body into a packet, if it is one the player cares about
fn parse_tag(tag_type: u8, timestamp: u32, data: &[u8]) -> Option<AVPacket> {
    match tag_type {
        TAG_VIDEO => {
            if data.len() < 5 {
                return None;
            }
            let frame_type = data[0] >> 4;
            let codec = data[0] & 0x0f;
            if codec != CODEC_AVC || data[1] != AVC_PACKET_NALU {
                return None;
            }
            // signed 24-bit composition time offset
            let cts = (i32::from_be_bytes([data[2], data[3], data[4], 0]) >> 8) as i64;
            let pts = (timestamp as i64 + cts) as u32;
            Some(AVPacket {
                kind: PacketKind::Video,
                pts,
                keyframe: frame_type == FRAME_TYPE_KEYFRAME,
            })
        }
        TAG_AUDIO => {
            if data.len() < 2 {
                return None;
            }
            let sound_format = data[0] >> 4;
            if sound_format != SOUND_FORMAT_AAC || data[1] != AAC_PACKET_RAW {
                return None;
            }
            Some(AVPacket {
                kind: PacketKind::Audio,
                pts: timestamp,
                keyframe: false,
            })
        }
        _ => None,
    }
}
