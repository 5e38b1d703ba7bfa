//! Transport layer: instrumented connection and kernel socket statistics
//!
//! This module provides:
//! - Portable TCP statistics records with per-OS raw layouts
//! - The platform `getsockopt` reader that fills them from a live socket
//! - The timestamping TCP/TLS endpoint probes dial through

pub mod conn;
pub mod sockopt;
pub mod tcpinfo;

pub use conn::{PhaseTimes, ProbeConn, RoundTime};
pub use sockopt::{tcp_info, SockoptError};
pub use tcpinfo::{PlatformTcpInfo, TcpInfo, TCP_INFO_WIRE_SIZE};
