//! # streampulse
//!
//! End-to-end quality probing for HTTP(S) downloads and live streams
//! (FLV over HTTP, HLS over HTTP).
//!
//! Every probe runs through an instrumented TCP/TLS connection that
//! timestamps each phase boundary (DNS, TCP handshake, TLS handshake,
//! time-to-first-byte) and, once the transfer is done, pulls transport
//! counters straight from the kernel socket. HTTP probes additionally run
//! a concurrent system ping for a network-path hop estimate and can
//! consume a cooperating server's in-band TCPINFO trailer; stream probes
//! feed a demuxer into a virtual player that estimates the frame rate and
//! accounts every rebuffer.
//!
//! ## Probing a download
//!
//! ```no_run
//! use streampulse::http::HttpPinger;
//!
//! # async fn example() -> streampulse::Result<()> {
//! let info = HttpPinger::get("http://example.com/file.bin")
//!     .sys_ping(true)
//!     .ping()
//!     .await?;
//! println!("{}", info.to_json());
//! # Ok(())
//! # }
//! ```
//!
//! ## Probing a live stream
//!
//! ```no_run
//! use streampulse::stream::Prober;
//!
//! # async fn example() -> streampulse::Result<()> {
//! let mut prober = Prober::new("http://example.com/live/channel.flv");
//! prober.probe_time_sec = 30;
//! let info = prober.probe().await?;
//! println!("fps={} lag_count={}", info.video_fps, info.total_lag_count);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod net;
pub mod ping;
pub mod server;
pub mod stream;

pub use error::{Error, Result};
pub use http::{HttpInfo, HttpPinger};
pub use net::{ProbeConn, TcpInfo};
pub use ping::{sys_ping, PingOutput};
pub use stream::{Prober, StreamInfo};
