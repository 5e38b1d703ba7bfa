//! System-ping invocation and output parsing
//!
//! The probes never speak ICMP themselves; they run the platform `ping`
//! tool and parse its textual output across the Linux and Darwin
//! dialects. The parsed reply TTLs feed the network-path hop estimate.

pub mod parser;
pub mod runner;

pub use parser::{parse, PingError, PingOutput, PingReply, PingStatistics};
pub use runner::sys_ping;
