//! HLS demuxer
//!
//! Two cooperating halves share one mutex-guarded state: a playlist
//! poller task that keeps re-fetching the m3u8 (following a master
//! playlist to its first variant) and enqueues newly-seen segments, and
//! the segment reader that downloads segments in sequence order and feeds
//! them through the MPEG-TS parser.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http::client::{self, ClientOptions, Request};
use crate::net::ProbeConn;

use super::ts::{TsParser, TS_PACKET_SIZE};
use super::{m3u8, AVPacket, DemuxError, Demuxer, StreamInfo, TsSegment,
    ERR_INVALID_HTTP_CODE, ERR_TCP_CONNECT_TIMEOUT};

/// Steady-state playlist refresh period (also the error backoff)
const POLL_PERIOD: Duration = Duration::from_secs(1);

/// First tick, and the tick right after a master-playlist redirect
const FAST_POLL: Duration = Duration::from_millis(1);

/// Reader sleep when the segment queue is empty
const EMPTY_QUEUE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct PollState {
    playlist: VecDeque<TsSegment>,
    second_m3u8_url: Option<Url>,
    /// Highest segment sequence id already enqueued; -1 before the first
    last_seq_id: i64,
    /// Set by the poller when the pipeline cannot continue
    fatal: Option<DemuxError>,
}

/// HLS (rolling m3u8 + MPEG-TS) packet source
pub struct HlsDemux {
    url: Url,
    headers: Vec<(String, String)>,
    state: Arc<Mutex<PollState>>,
    cancel: CancellationToken,
    parser: TsParser,
    buffer: Bytes,
}

impl HlsDemux {
    pub fn new(url: Url, headers: Vec<(String, String)>) -> Self {
        Self {
            url,
            headers,
            state: Arc::new(Mutex::new(PollState {
                last_seq_id: -1,
                ..Default::default()
            })),
            cancel: CancellationToken::new(),
            parser: TsParser::new(),
            buffer: Bytes::new(),
        }
    }

    fn spawn_poller(&self) {
        let url = self.url.clone();
        let headers = self.headers.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        // `scheme://host[:port]` prefix used for segment URI resolution
        let scheme = url.scheme().to_string();
        let authority = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            _ => String::new(),
        };

        tokio::spawn(async move {
            let mut delay = FAST_POLL;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }

                let target = state
                    .lock()
                    .unwrap()
                    .second_m3u8_url
                    .clone()
                    .unwrap_or_else(|| url.clone());

                delay = match client::fetch(&target, &headers, Some(POLL_PERIOD * 5)).await {
                    Ok((200, body)) => {
                        match ingest_playlist(&state, &scheme, &authority, &body) {
                            Ok(next) => next,
                            Err(fatal) => {
                                tracing::warn!(error = %fatal, "playlist poller stopping");
                                state.lock().unwrap().fatal = Some(fatal);
                                return;
                            }
                        }
                    }
                    Ok((code, _)) => {
                        tracing::debug!(code = code, url = %target, "playlist fetch status");
                        POLL_PERIOD
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, url = %target, "playlist fetch failed");
                        POLL_PERIOD
                    }
                };
            }
        });
    }

    async fn next_segment_body(&mut self) -> Result<Option<Bytes>, DemuxError> {
        let segment = {
            let mut state = self.state.lock().unwrap();
            if let Some(fatal) = state.fatal.take() {
                return Err(fatal);
            }
            state.playlist.pop_front()
        };
        let Some(segment) = segment else {
            sleep(EMPTY_QUEUE_WAIT).await;
            return Ok(None);
        };

        let url = Url::parse(&segment.url)
            .map_err(|e| DemuxError::InvalidPlaylist(format!("{}: {}", segment.url, e)))?;
        let (status, body) = client::fetch(&url, &self.headers, Some(POLL_PERIOD * 10))
            .await
            .map_err(|e| DemuxError::Fetch(e.to_string()))?;
        if status != 200 {
            tracing::debug!(code = status, seq = segment.seq_id, "segment fetch status");
            return Ok(None);
        }
        tracing::debug!(seq = segment.seq_id, bytes = body.len(), "fetched ts segment");
        Ok(Some(body))
    }
}

/// Fold one playlist body into the shared state; returns the next poll
/// delay
fn ingest_playlist(
    state: &Mutex<PollState>,
    scheme: &str,
    authority: &str,
    body: &[u8],
) -> Result<Duration, DemuxError> {
    let text = String::from_utf8_lossy(body);
    match m3u8::parse(&text)? {
        m3u8::Playlist::Master(master) => {
            let Some(variant) = master.variants.first() else {
                return Ok(POLL_PERIOD);
            };
            let resolved = Url::parse(variant).map_err(|e| {
                DemuxError::InvalidPlaylist(format!("variant {}: {}", variant, e))
            })?;
            tracing::debug!(variant = %resolved, "master playlist redirect");
            state.lock().unwrap().second_m3u8_url = Some(resolved);
            Ok(FAST_POLL)
        }
        m3u8::Playlist::Media(media) => {
            if media.closed {
                return Err(DemuxError::NotLiveM3u8File);
            }
            let mut state = state.lock().unwrap();
            for segment in &media.segments {
                if segment.seq_id as i64 <= state.last_seq_id {
                    continue;
                }
                // prefix resolution, kept string-based for result parity
                // with other probe implementations
                let uri = if segment.uri.starts_with("http://")
                    || segment.uri.starts_with("https://")
                {
                    segment.uri.clone()
                } else if segment.uri.starts_with('/') {
                    format!("{}://{}{}", scheme, authority, segment.uri)
                } else {
                    format!("{}://{}/{}", scheme, authority, segment.uri)
                };
                state.playlist.push_back(TsSegment {
                    url: uri,
                    seq_id: segment.seq_id,
                });
                state.last_seq_id = segment.seq_id as i64;
            }
            Ok(POLL_PERIOD)
        }
    }
}

impl Demuxer for HlsDemux {
    async fn connect(&mut self) -> crate::Result<StreamInfo> {
        let mut info = StreamInfo::new();
        let req = Request {
            method: "GET".to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        };

        let resp = match client::send(ProbeConn::new(), &req, &ClientOptions::default()).await {
            Ok(resp) => resp,
            Err(failure) => {
                tracing::warn!(error = %failure.error, url = %self.url, "hls connect failed");
                info.err_code = ERR_TCP_CONNECT_TIMEOUT;
                return Ok(info);
            }
        };

        info.fill_connection(resp.body.conn(), resp.status);
        if resp.status != 200 {
            info.err_code = ERR_INVALID_HTTP_CODE;
            return Ok(info);
        }

        // the measured connection is done; the poller refetches the
        // playlist on its own schedule
        self.spawn_poller();
        Ok(info)
    }

    async fn read(&mut self) -> Result<Option<AVPacket>, DemuxError> {
        if self.buffer.is_empty() {
            match self.next_segment_body().await? {
                Some(body) => self.buffer = body,
                None => return Ok(None),
            }
        }

        while self.buffer.len() >= TS_PACKET_SIZE {
            let packet = self.buffer.split_to(TS_PACKET_SIZE);
            if let Some(pkt) = self.parser.parse_packet(&packet)? {
                return Ok(Some(pkt));
            }
        }
        // trailing partial packet is dropped with the buffer
        self.buffer = Bytes::new();
        Ok(None)
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for HlsDemux {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_state() -> Mutex<PollState> {
        Mutex::new(PollState {
            last_seq_id: -1,
            ..Default::default()
        })
    }

    #[test]
    fn test_ingest_media_resolves_and_orders() {
        let state = fresh_state();
        let body = b"#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:2.0,\nseg5.ts\n#EXTINF:2.0,\n/live/seg6.ts\n#EXTINF:2.0,\nhttp://cdn.example.com/seg7.ts\n";
        let delay = ingest_playlist(&state, "http", "example.com:8080", body).unwrap();
        assert_eq!(delay, POLL_PERIOD);

        let s = state.lock().unwrap();
        let urls: Vec<_> = s.playlist.iter().map(|t| t.url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com:8080/seg5.ts",
                "http://example.com:8080/live/seg6.ts",
                "http://cdn.example.com/seg7.ts",
            ]
        );
        assert_eq!(s.last_seq_id, 7);
    }

    #[test]
    fn test_ingest_skips_already_seen() {
        let state = fresh_state();
        let body = b"#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:2.0,\nseg5.ts\n#EXTINF:2.0,\nseg6.ts\n";
        ingest_playlist(&state, "http", "h", body).unwrap();
        assert_eq!(state.lock().unwrap().playlist.len(), 2);

        // same window again plus one new segment
        let body = b"#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:5\n#EXTINF:2.0,\nseg5.ts\n#EXTINF:2.0,\nseg6.ts\n#EXTINF:2.0,\nseg7.ts\n";
        ingest_playlist(&state, "http", "h", body).unwrap();
        let s = state.lock().unwrap();
        assert_eq!(s.playlist.len(), 3);
        assert_eq!(s.playlist.back().unwrap().seq_id, 7);
    }

    #[test]
    fn test_ingest_master_sets_variant() {
        let state = fresh_state();
        let body =
            b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000\nhttp://example.com/v/index.m3u8\n";
        let delay = ingest_playlist(&state, "http", "example.com", body).unwrap();
        assert_eq!(delay, FAST_POLL);
        assert_eq!(
            state.lock().unwrap().second_m3u8_url.as_ref().unwrap().as_str(),
            "http://example.com/v/index.m3u8"
        );
    }

    #[test]
    fn test_ingest_closed_playlist_is_fatal() {
        let state = fresh_state();
        let body = b"#EXTM3U\n#EXTINF:2.0,\na.ts\n#EXT-X-ENDLIST\n";
        assert_eq!(
            ingest_playlist(&state, "http", "h", body),
            Err(DemuxError::NotLiveM3u8File)
        );
    }
}
