//! Virtual player
//!
//! Consumes demuxed packets through a bounded channel the way a real
//! player would: buffer first, estimate the video frame rate from the
//! first window of packets, then pace consumption at one frame per
//! inter-frame interval and account every stall as a rebuffer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
// tokio's Instant keeps the pacing testable under a paused clock
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{AVPacket, PacketKind, StreamInfo};

/// Demuxer-to-player channel capacity
pub const CHANNEL_CAPACITY: usize = 256;

/// Preallocated per-kind queue capacity
const QUEUE_CAPACITY: usize = 256;

/// Tick cadence before playback starts (and the assumed audio frame
/// duration for audio-only streams, where the real value is unknowable
/// without decoding)
const PREPLAY_TICK: Duration = Duration::from_millis(30);

/// Video packets observed before the frame rate is estimated
const FPS_WINDOW: usize = 60;

/// Upper clamp for the configured buffer target
const MAX_BUFFER_TARGET_MS: u32 = 30_000;

/// Frame-rate fallback when adjacent timestamps yield nothing usable
const FALLBACK_FPS: f32 = 30.0;

/// Bounded-buffer packet consumer with rebuffer accounting
pub struct VirtualPlayer {
    rx: mpsc::Receiver<AVPacket>,
    cancel: CancellationToken,
    buffer_target: Duration,
    info: StreamInfo,
}

impl VirtualPlayer {
    /// `buffer_time_ms` is clamped to `[0, 30_000]`
    pub fn new(
        buffer_time_ms: u32,
        info: StreamInfo,
        rx: mpsc::Receiver<AVPacket>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            cancel,
            buffer_target: Duration::from_millis(
                buffer_time_ms.min(MAX_BUFFER_TARGET_MS) as u64
            ),
            info,
        }
    }

    /// Run until cancellation, then finalize and return the report
    pub async fn run(mut self) -> StreamInfo {
        let mut vqueue: VecDeque<AVPacket> = VecDeque::with_capacity(QUEUE_CAPACITY);
        let mut aqueue: VecDeque<AVPacket> = VecDeque::with_capacity(QUEUE_CAPACITY);

        let mut frame_duration = PREPLAY_TICK;
        let audio_frame_duration = PREPLAY_TICK;
        let mut has_video = false;
        let mut has_audio = false;
        let mut started = false;
        let mut rebuffering = false;
        let mut play_start: Option<Instant> = None;
        let mut lag_start: Option<Instant> = None;
        let mut rx_closed = false;

        let mut ticker = new_ticker(PREPLAY_TICK);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                pkt = self.rx.recv(), if !rx_closed => {
                    let Some(pkt) = pkt else {
                        // producer gone; keep ticking so stalls keep
                        // accruing until the probe timer fires
                        rx_closed = true;
                        continue;
                    };
                    match pkt.kind {
                        PacketKind::Video => {
                            if !has_video {
                                has_video = true;
                                self.info.first_video_pkt_time_ms = self.info.elapsed_ms();
                                tracing::debug!(
                                    ms = self.info.first_video_pkt_time_ms,
                                    "first video packet"
                                );
                            }
                            vqueue.push_back(pkt);
                            if !started && vqueue.len() >= FPS_WINDOW {
                                let fps = estimate_fps(&vqueue);
                                self.info.video_fps = fps;
                                frame_duration = Duration::from_secs_f64(1.0 / fps as f64);
                                if frame_duration * vqueue.len() as u32 >= self.buffer_target {
                                    started = true;
                                    play_start = Some(Instant::now());
                                    ticker = new_ticker(frame_duration);
                                    if !self.buffer_target.is_zero() {
                                        let keep = (self.buffer_target.as_nanos()
                                            / frame_duration.as_nanos())
                                            as usize;
                                        vqueue.truncate(keep);
                                    }
                                    tracing::debug!(fps = fps, "playback started");
                                }
                            }
                        }
                        PacketKind::Audio => {
                            if !has_audio {
                                has_audio = true;
                                self.info.first_audio_pkt_time_ms = self.info.elapsed_ms();
                                tracing::debug!(
                                    ms = self.info.first_audio_pkt_time_ms,
                                    "first audio packet"
                                );
                            }
                            aqueue.push_back(pkt);
                            // audio-only stream: same gate as video, with
                            // the assumed audio frame duration
                            if !started && !has_video && aqueue.len() >= FPS_WINDOW {
                                frame_duration = audio_frame_duration;
                                if frame_duration * aqueue.len() as u32 >= self.buffer_target {
                                    started = true;
                                    play_start = Some(Instant::now());
                                    ticker = new_ticker(frame_duration);
                                }
                            }
                        }
                    }
                }

                _ = ticker.tick() => {
                    if !started {
                        continue;
                    }
                    if has_video {
                        // combined streams: audio rides along with video
                        aqueue.clear();
                    }
                    let (queue, duration) = if has_video {
                        (&mut vqueue, frame_duration)
                    } else if has_audio {
                        (&mut aqueue, audio_frame_duration)
                    } else {
                        continue;
                    };

                    let buffered = duration * queue.len() as u32;
                    if rebuffering && buffered >= self.buffer_target {
                        rebuffering = false;
                        if let Some(at) = lag_start.take() {
                            let lag = at.elapsed();
                            self.info.total_lag_time_ms += lag.as_millis() as u32;
                            tracing::debug!(ms = lag.as_millis() as u64, "rebuffer ended");
                        }
                    }
                    if rebuffering {
                        continue;
                    }

                    if queue.pop_front().is_none() {
                        rebuffering = true;
                        self.info.total_lag_count += 1;
                        lag_start = Some(Instant::now());
                        tracing::debug!(count = self.info.total_lag_count, "rebuffer started");
                    }
                }
            }
        }

        if started {
            if rebuffering {
                if let Some(at) = lag_start.take() {
                    self.info.total_lag_time_ms += at.elapsed().as_millis() as u32;
                }
            }
            let played_ms = play_start
                .map(|s| s.elapsed().as_millis() as f32)
                .unwrap_or(0.0);
            if played_ms > 0.0 {
                self.info.lag_rate =
                    (self.info.total_lag_time_ms as f32 / played_ms).min(1.0);
            }
        }

        self.info
    }
}

fn new_ticker(period: Duration) -> tokio::time::Interval {
    // interval_at skips the immediate first tick an interval would fire
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Estimate the frame rate from adjacent PTS deltas inside (0, 100) ms
fn estimate_fps(queue: &VecDeque<AVPacket>) -> f32 {
    let mut last = match queue.front() {
        Some(p) => p.pts as i64,
        None => return FALLBACK_FPS,
    };
    let mut count = 0i64;
    let mut total = 0i64;
    for pkt in queue.iter().skip(1) {
        let pts = pkt.pts as i64;
        let delta = pts - last;
        if delta > 0 && delta < 100 {
            total += delta;
            count += 1;
        }
        last = pts;
    }
    if total == 0 {
        FALLBACK_FPS
    } else {
        count as f32 * 1000.0 / total as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PacketKind;

    fn video(pts: u32) -> AVPacket {
        AVPacket {
            kind: PacketKind::Video,
            pts,
            keyframe: false,
        }
    }

    fn thirty_fps_window(n: usize) -> VecDeque<AVPacket> {
        (0..n).map(|i| video(i as u32 * 33)).collect()
    }

    #[test]
    fn test_fps_estimate_30fps() {
        let fps = estimate_fps(&thirty_fps_window(60));
        assert!((29.0..=31.0).contains(&fps), "fps={}", fps);
    }

    #[test]
    fn test_fps_estimate_ignores_jumps() {
        // a pts discontinuity mid-window must not skew the estimate
        let mut q = thirty_fps_window(30);
        let base = 100_000;
        q.extend((0..30).map(|i| video(base + i * 33)));
        let fps = estimate_fps(&q);
        assert!((29.0..=31.0).contains(&fps), "fps={}", fps);
    }

    #[test]
    fn test_fps_estimate_fallback() {
        // all identical timestamps: no usable deltas
        let q: VecDeque<AVPacket> = (0..60).map(|_| video(7)).collect();
        assert_eq!(estimate_fps(&q), FALLBACK_FPS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filling_needs_window_and_buffer_target() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(0, StreamInfo::new(), rx, cancel.clone());
        let handle = tokio::spawn(player.run());

        // below the 60-packet window: playback must not start
        for i in 0..30u32 {
            tx.send(video(i * 33)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let info = handle.await.unwrap();
        assert_eq!(info.video_fps, 0.0);
        assert_eq!(info.total_lag_count, 0);
        assert_eq!(info.lag_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smooth_stream_no_lag() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(0, StreamInfo::new(), rx, cancel.clone());
        let handle = tokio::spawn(player.run());

        // feed 5 seconds of 30 fps video fast enough that the queue never
        // runs dry
        for i in 0..150u32 {
            tx.send(video(i * 33)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        let info = handle.await.unwrap();
        assert!((29.0..=31.0).contains(&info.video_fps), "fps={}", info.video_fps);
        assert!(info.first_video_pkt_time_ms < 1000);
        assert_eq!(info.total_lag_count, 0);
        assert_eq!(info.total_lag_time_ms, 0);
        assert!(info.lag_rate < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starved_stream_accounts_lag() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(0, StreamInfo::new(), rx, cancel.clone());
        let handle = tokio::spawn(player.run());

        // exactly the fps window, then nothing: the queue drains in about
        // two seconds and the player stalls
        for i in 0..60u32 {
            tx.send(video(i * 33)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let info = handle.await.unwrap();
        assert!(info.total_lag_count >= 1);
        assert!(info.total_lag_time_ms > 0);
        assert!(info.lag_rate > 0.0);
        assert!(info.lag_rate <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_count_zero_means_lag_time_zero() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(1000, StreamInfo::new(), rx, cancel.clone());
        let handle = tokio::spawn(player.run());

        for i in 0..240u32 {
            tx.send(video(i * 33)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let info = handle.await.unwrap();
        assert_eq!(info.total_lag_count == 0, info.total_lag_time_ms == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_only_stream_starts_playing() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let player = VirtualPlayer::new(0, StreamInfo::new(), rx, cancel.clone());
        let handle = tokio::spawn(player.run());

        for i in 0..120u32 {
            tx.send(AVPacket {
                kind: PacketKind::Audio,
                pts: i * 23,
                keyframe: false,
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let info = handle.await.unwrap();
        assert!(info.first_audio_pkt_time_ms < 1000);
        assert_eq!(info.first_video_pkt_time_ms, 0);
        // playback began, so a lag rate is defined even if zero
        assert!(info.lag_rate >= 0.0);
    }
}
