//! Portable TCP transport statistics
//!
//! The kernel's per-socket counters come back in an OS-specific layout
//! (`PlatformTcpInfo`); `normalize()` reduces them to the portable
//! [`TcpInfo`] record that every report embeds. `TcpInfo` also has a fixed
//! 16-byte little-endian wire form, used when a cooperating download
//! server appends its own view of the connection to a response body.

use serde::{Deserialize, Serialize};

/// Portable transport snapshot, all fields in milliseconds / packet counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpInfo {
    /// Smoothed round-trip time, milliseconds
    pub rtt_ms: u32,
    /// RTT variance, milliseconds
    pub rtt_var_ms: u32,
    /// Segments retransmitted over the connection lifetime
    pub retransmit_packets: u32,
    /// Segments sent (zero on Linux; callers may estimate from bytes/MSS)
    pub total_packets: u32,
}

/// Size of the on-wire encoding: four little-endian u32s
pub const TCP_INFO_WIRE_SIZE: usize = 16;

impl TcpInfo {
    /// Encode as the 16-byte little-endian wire record
    pub fn encode(&self) -> [u8; TCP_INFO_WIRE_SIZE] {
        let mut out = [0u8; TCP_INFO_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.rtt_ms.to_le_bytes());
        out[4..8].copy_from_slice(&self.rtt_var_ms.to_le_bytes());
        out[8..12].copy_from_slice(&self.retransmit_packets.to_le_bytes());
        out[12..16].copy_from_slice(&self.total_packets.to_le_bytes());
        out
    }

    /// Decode from the 16-byte little-endian wire record
    ///
    /// Returns `None` when the buffer is shorter than
    /// [`TCP_INFO_WIRE_SIZE`]; extra trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_INFO_WIRE_SIZE {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            rtt_ms: u32_at(0),
            rtt_var_ms: u32_at(4),
            retransmit_packets: u32_at(8),
            total_packets: u32_at(12),
        })
    }
}

/// Raw Linux `struct tcp_info`, as filled by `getsockopt(TCP_INFO)`
///
/// Declared through `tcpi_data_segs_out` so `tcpi_notsent_bytes` is
/// reachable; older kernels simply leave the tail zeroed.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct LinuxTcpInfo {
    pub tcpi_state: u8,
    pub tcpi_ca_state: u8,
    pub tcpi_retransmits: u8,
    pub tcpi_probes: u8,
    pub tcpi_backoff: u8,
    pub tcpi_options: u8,
    pub tcpi_wscale: u8,
    pub tcpi_app_limited: u8,
    pub tcpi_rto: u32,
    pub tcpi_ato: u32,
    pub tcpi_snd_mss: u32,
    pub tcpi_rcv_mss: u32,
    pub tcpi_unacked: u32,
    pub tcpi_sacked: u32,
    pub tcpi_lost: u32,
    pub tcpi_retrans: u32,
    pub tcpi_fackets: u32,
    pub tcpi_last_data_sent: u32,
    pub tcpi_last_ack_sent: u32,
    pub tcpi_last_data_recv: u32,
    pub tcpi_last_ack_recv: u32,
    pub tcpi_pmtu: u32,
    pub tcpi_rcv_ssthresh: u32,
    /// Smoothed RTT in microseconds
    pub tcpi_rtt: u32,
    pub tcpi_rttvar: u32,
    pub tcpi_snd_ssthresh: u32,
    pub tcpi_snd_cwnd: u32,
    pub tcpi_advmss: u32,
    pub tcpi_reordering: u32,
    pub tcpi_rcv_rtt: u32,
    pub tcpi_rcv_space: u32,
    pub tcpi_total_retrans: u32,
    pub tcpi_pacing_rate: u64,
    pub tcpi_max_pacing_rate: u64,
    pub tcpi_bytes_acked: u64,
    pub tcpi_bytes_received: u64,
    pub tcpi_segs_out: u32,
    pub tcpi_segs_in: u32,
    /// Bytes queued in the send buffer but not yet handed to the wire
    pub tcpi_notsent_bytes: u32,
    pub tcpi_min_rtt: u32,
    pub tcpi_data_segs_in: u32,
    pub tcpi_data_segs_out: u32,
}

/// Raw Darwin `struct tcp_connection_info`, as filled by
/// `getsockopt(TCP_CONNECTION_INFO)`
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DarwinTcpInfo {
    pub tcpi_state: u8,
    pub tcpi_snd_wscale: u8,
    pub tcpi_rcv_wscale: u8,
    pub __pad1: u8,
    pub tcpi_options: u32,
    pub tcpi_flags: u32,
    pub tcpi_rto: u32,
    pub tcpi_maxseg: u32,
    pub tcpi_snd_ssthresh: u32,
    pub tcpi_snd_cwnd: u32,
    pub tcpi_snd_wnd: u32,
    pub tcpi_snd_sbbytes: u32,
    pub tcpi_rcv_wnd: u32,
    pub tcpi_rttcur: u32,
    /// Smoothed RTT; the unit has drifted across macOS releases, we treat
    /// it as milliseconds
    pub tcpi_srtt: u32,
    pub tcpi_rttvar: u32,
    pub tcpi_tfo: u32,
    pub tcpi_txpackets: u64,
    pub tcpi_txbytes: u64,
    pub tcpi_txretransmitbytes: u64,
    pub tcpi_rxpackets: u64,
    pub tcpi_rxbytes: u64,
    pub tcpi_rxoutoforderbytes: u64,
    pub tcpi_txretransmitpackets: u64,
}

/// Raw Windows `TCP_ESTATS_PATH_ROD_v0`, as filled by
/// `GetPerTcpConnectionEStats(TcpConnectionEstatsPath)`
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct WindowsTcpInfo {
    pub fast_retran: u32,
    pub timeouts: u32,
    pub subsequent_timeouts: u32,
    pub cur_timeout_count: u32,
    pub abrupt_timeouts: u32,
    pub pkts_retrans: u32,
    pub bytes_retrans: u32,
    pub dup_acks_in: u32,
    pub sacks_rcvd: u32,
    pub sack_blocks_rcvd: u32,
    pub cong_signals: u32,
    pub pre_cong_sum_cwnd: u32,
    pub pre_cong_sum_rtt: u32,
    pub post_cong_sum_rtt: u32,
    pub post_cong_count_rtt: u32,
    pub ecn_signals: u32,
    pub ece_rcvd: u32,
    pub send_stall: u32,
    pub quench_rcvd: u32,
    pub retran_thresh: u32,
    pub snd_dup_ack_episodes: u32,
    pub sum_bytes_reordered: u32,
    pub non_recov_da: u32,
    pub non_recov_da_episodes: u32,
    pub ack_after_fr: u32,
    pub dsack_dups: u32,
    pub sample_rtt: u32,
    /// Smoothed RTT in milliseconds
    pub smoothed_rtt: u32,
    pub rtt_var: u32,
    pub max_rtt: u32,
    pub min_rtt: u32,
    pub sum_rtt: u32,
    pub count_rtt: u32,
    pub cur_rto: u32,
    pub max_rto: u32,
    pub min_rto: u32,
    pub cur_mss: u32,
    pub max_mss: u32,
    pub min_mss: u32,
    pub spurious_rto_detections: u32,
}

/// Per-OS raw snapshot, kept alongside the normalized record for callers
/// that need platform-only fields (e.g. Linux `tcpi_notsent_bytes`)
#[derive(Debug, Clone, Copy)]
pub enum PlatformTcpInfo {
    Linux(LinuxTcpInfo),
    Darwin(DarwinTcpInfo),
    Windows(WindowsTcpInfo),
}

impl PlatformTcpInfo {
    /// Reduce the raw snapshot to the portable record
    ///
    /// Linux reports RTT in microseconds, Darwin and Windows in
    /// milliseconds; the output is always milliseconds. `total_packets`
    /// stays zero on Linux and Windows (no direct counter in the source
    /// layout) and maps to `tcpi_txpackets` on Darwin.
    pub fn normalize(&self) -> TcpInfo {
        match self {
            PlatformTcpInfo::Linux(t) => TcpInfo {
                rtt_ms: t.tcpi_rtt / 1000,
                rtt_var_ms: t.tcpi_rttvar / 1000,
                retransmit_packets: t.tcpi_total_retrans,
                total_packets: 0,
            },
            PlatformTcpInfo::Darwin(t) => TcpInfo {
                rtt_ms: t.tcpi_srtt,
                rtt_var_ms: t.tcpi_rttvar,
                retransmit_packets: t.tcpi_txretransmitpackets as u32,
                total_packets: t.tcpi_txpackets as u32,
            },
            PlatformTcpInfo::Windows(t) => TcpInfo {
                rtt_ms: t.smoothed_rtt,
                rtt_var_ms: t.rtt_var,
                retransmit_packets: t.pkts_retrans,
                total_packets: 0,
            },
        }
    }

    /// Linux-only: bytes sitting in the send queue, not yet on the wire
    pub fn notsent_bytes(&self) -> Option<u32> {
        match self {
            PlatformTcpInfo::Linux(t) => Some(t.tcpi_notsent_bytes),
            _ => None,
        }
    }
}
