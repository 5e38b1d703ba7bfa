//! Live-stream probing
//!
//! This module provides:
//! - The shared packet/report model (`AVPacket`, `StreamInfo`)
//! - FLV and HLS (m3u8 + MPEG-TS) demuxers producing packet streams
//! - The virtual player that paces consumption and accounts rebuffers
//! - The prober that wires demuxer, player and timeout together

pub mod flv;
pub mod hls;
pub mod m3u8;
pub mod player;
pub mod prober;
pub mod ts;

use std::time::Instant;

use serde::Serialize;

use crate::net::{sockopt, ProbeConn, TcpInfo};

pub use flv::FlvDemux;
pub use hls::HlsDemux;
pub use player::VirtualPlayer;
pub use prober::Prober;

/// Report error code: TCP connect / request failed
pub const ERR_TCP_CONNECT_TIMEOUT: i32 = 1001;
/// Report error code: HTTP status was not 200
pub const ERR_INVALID_HTTP_CODE: i32 = 1002;
/// Report error code: demux or pipeline failure mid-probe
pub const ERR_INTERNAL: i32 = 1003;

/// Elementary stream flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
}

/// One demuxed audio/video packet; payloads are never kept, only the
/// presentation timestamp and keyframe flag matter to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AVPacket {
    pub kind: PacketKind,
    /// Presentation timestamp, milliseconds
    pub pts: u32,
    pub keyframe: bool,
}

/// One MPEG-TS segment referenced by a live playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsSegment {
    pub url: String,
    pub seq_id: u64,
}

/// Demux failures
///
/// Soft try-again is signalled by `Ok(None)` from [`Demuxer::read`];
/// these variants are fatal to the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    /// TS packet did not start with the 0x47 sync byte
    InvalidTsPacket,
    /// PES start code or flag nibble was wrong
    InvalidPesHeader,
    /// FLV body did not start with a valid file header
    InvalidFlvHeader,
    /// The playlist is a finished VOD file, not a live stream
    NotLiveM3u8File,
    /// Playlist or segment URL could not be worked with
    InvalidPlaylist(String),
    /// Transport-level failure fetching a segment
    Fetch(String),
}

impl std::fmt::Display for DemuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemuxError::InvalidTsPacket => write!(f, "invalid ts packet"),
            DemuxError::InvalidPesHeader => write!(f, "invalid pes header"),
            DemuxError::InvalidFlvHeader => write!(f, "invalid flv header"),
            DemuxError::NotLiveM3u8File => write!(f, "not live m3u8 file"),
            DemuxError::InvalidPlaylist(m) => write!(f, "invalid playlist: {}", m),
            DemuxError::Fetch(m) => write!(f, "segment fetch failed: {}", m),
        }
    }
}

impl std::error::Error for DemuxError {}

/// Protocol-specific packet source
///
/// `connect` performs the measured HTTP leg and returns the report
/// skeleton; `read` yields one packet, `Ok(None)` meaning "nothing this
/// time, try again".
#[allow(async_fn_in_trait)]
pub trait Demuxer {
    async fn connect(&mut self) -> crate::Result<StreamInfo>;
    async fn read(&mut self) -> Result<Option<AVPacket>, DemuxError>;
    fn close(&mut self);
}

/// Final report of one stream probe
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamInfo {
    /// Probe start, unix epoch milliseconds
    pub start_time_ms: u64,
    pub is_connected: bool,
    pub err_code: i32,
    pub dns_time_ms: u32,
    pub tcp_connect_time_ms: u32,
    pub tls_handshake_time_ms: u32,
    pub ttfb_ms: u32,
    pub first_video_pkt_time_ms: u32,
    pub first_audio_pkt_time_ms: u32,
    pub total_lag_time_ms: u32,
    pub total_lag_count: u32,
    pub video_fps: f32,
    pub lag_rate: f32,
    pub http_code: u16,
    pub remote_addr: String,
    pub local_addr: String,
    pub tcp_info: TcpInfo,
    #[serde(skip)]
    pub(crate) started: Option<Instant>,
}

impl StreamInfo {
    pub fn new() -> Self {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            start_time_ms: epoch_ms,
            started: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Milliseconds since the probe started
    pub(crate) fn elapsed_ms(&self) -> u32 {
        self.started
            .map(|s| s.elapsed().as_millis() as u32)
            .unwrap_or(0)
    }

    /// Copy the connection-phase observables out of a completed dial
    pub(crate) fn fill_connection(&mut self, conn: &ProbeConn, status: u16) {
        self.is_connected = true;
        let t = conn.phase_times();
        self.dns_time_ms = t.dns.as_millis() as u32;
        self.tcp_connect_time_ms = t.tcp.as_millis() as u32;
        self.tls_handshake_time_ms = t.tls.as_millis() as u32;
        self.ttfb_ms = t.ttfb.as_millis() as u32;
        self.remote_addr = conn
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.local_addr = conn.local_addr().map(|a| a.to_string()).unwrap_or_default();
        self.http_code = status;
        if let Some(sock) = conn.socket() {
            if let Ok((tcp, _)) = sockopt::tcp_info(sock) {
                self.tcp_info = tcp;
            }
        }
    }

    /// Pretty JSON with tab indentation, the report interchange format
    pub fn to_json(&self) -> String {
        crate::http::to_tab_json(self)
    }
}
