//! Stream probe supervisor
//!
//! Picks a demuxer from the URL, runs the demux loop and the virtual
//! player as a producer/consumer pair over a bounded channel, and cuts
//! everything off when the probe timer fires. RTMP is deliberately not
//! implemented; only FLV and HLS over HTTP(S) are probed.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

use super::player::{VirtualPlayer, CHANNEL_CAPACITY};
use super::{Demuxer, FlvDemux, HlsDemux, StreamInfo, ERR_INTERNAL};

/// Stream probe configuration and entry point
#[derive(Debug, Clone)]
pub struct Prober {
    pub url: String,
    /// Player buffer target in milliseconds (clamped to 30 s)
    pub player_buffer_time_ms: u32,
    /// Wall-clock probe duration
    pub probe_time_sec: u32,
    /// Extra request headers for every HTTP exchange of this probe
    pub headers: Vec<(String, String)>,
}

impl Prober {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            player_buffer_time_ms: 0,
            probe_time_sec: 60,
            headers: Vec::new(),
        }
    }

    /// Run the probe to completion and return the report
    ///
    /// Only URL-level problems surface as `Err`; anything that fails once
    /// the probe is underway is reflected in the report instead.
    pub async fn probe(&self) -> Result<StreamInfo> {
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::UnsupportedProtocol(other.to_string())),
        }

        let ext = path_extension(url.path()).to_string();
        match ext.as_str() {
            "flv" => {
                self.run(FlvDemux::new(url, self.headers.clone())).await
            }
            "m3u8" => {
                self.run(HlsDemux::new(url, self.headers.clone())).await
            }
            _ => Err(Error::UnsupportedProtocol(self.url.clone())),
        }
    }

    async fn run<D: Demuxer>(&self, mut demux: D) -> Result<StreamInfo> {
        let info = demux.connect().await?;
        if !info.is_connected || info.err_code != 0 || info.http_code != 200 {
            demux.close();
            return Ok(info);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(self.player_buffer_time_ms, info, rx, cancel.clone());
        let player_handle = tokio::spawn(player.run());

        let deadline = tokio::time::sleep(std::time::Duration::from_secs(
            self.probe_time_sec as u64,
        ));
        tokio::pin!(deadline);

        let mut fatal = false;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                result = demux.read() => match result {
                    Ok(Some(pkt)) => {
                        if tx.send(pkt).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "demux ended the probe");
                        fatal = true;
                        break;
                    }
                }
            }
        }

        drop(tx);
        cancel.cancel();
        demux.close();

        let mut info = player_handle.await.unwrap_or_default();
        if fatal && info.err_code == 0 {
            info.err_code = ERR_INTERNAL;
        }
        Ok(info)
    }
}

/// Extension of the last path segment, without the dot
fn path_extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(i) => &name[i + 1..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_extension() {
        assert_eq!(path_extension("/live/stream.flv"), "flv");
        assert_eq!(path_extension("/a/b/index.m3u8"), "m3u8");
        assert_eq!(path_extension("/plain"), "");
        assert_eq!(path_extension("/dir.d/file"), "");
    }

    #[tokio::test]
    async fn test_rtmp_rejected() {
        let err = Prober::new("rtmp://host/live/key").probe().await;
        assert!(matches!(err, Err(Error::UnsupportedProtocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected() {
        let err = Prober::new("http://host/live/key.mp4").probe().await;
        assert!(matches!(err, Err(Error::UnsupportedProtocol(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_report() {
        // closed port: the report carries the error code, not an Err
        let prober = Prober::new("http://127.0.0.1:1/live/x.flv");
        let info = prober.probe().await.unwrap();
        assert!(!info.is_connected);
        assert_eq!(info.err_code, super::super::ERR_TCP_CONNECT_TIMEOUT);
    }
}
