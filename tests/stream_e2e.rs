//! End-to-end FLV stream probe against an in-process live source.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use streampulse::stream::Prober;

/// One FLV tag: header(11) + data + PreviousTagSize(4)
fn flv_tag(tag_type: u8, timestamp: u32, data: &[u8]) -> Vec<u8> {
    let size = data.len() as u32;
    let mut tag = Vec::with_capacity(15 + data.len());
    tag.push(tag_type);
    tag.extend_from_slice(&size.to_be_bytes()[1..4]);
    tag.extend_from_slice(&timestamp.to_be_bytes()[1..4]);
    tag.push((timestamp >> 24) as u8);
    tag.extend_from_slice(&[0, 0, 0]); // stream id
    tag.extend_from_slice(data);
    tag.extend_from_slice(&(11 + size).to_be_bytes());
    tag
}

/// AVC NALU video tag body; keyframe switches the frame-type nibble
fn video_body(keyframe: bool) -> Vec<u8> {
    let first = if keyframe { 0x17 } else { 0x27 };
    vec![first, 0x01, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC]
}

/// Serve one HTTP client with a 30 fps live FLV stream until it hangs up
async fn serve_flv(listener: TcpListener) {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut buf = vec![0u8; 4096];
    let _ = sock.read(&mut buf).await;

    // EOF-framed response: header, FLV file header, PreviousTagSize0
    sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
    sock.write_all(&[b'F', b'L', b'V', 0x01, 0x05, 0x00, 0x00, 0x00, 0x09])
        .await
        .unwrap();
    sock.write_all(&0u32.to_be_bytes()).await.unwrap();

    let mut pts: u32 = 0;
    // burst enough frames to fill the fps-estimation window, then pace
    for i in 0..70u32 {
        let tag = flv_tag(9, pts, &video_body(i % 30 == 0));
        if sock.write_all(&tag).await.is_err() {
            return;
        }
        pts += 33;
    }
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));
    loop {
        ticker.tick().await;
        let tag = flv_tag(9, pts, &video_body(pts % 990 == 0));
        if sock.write_all(&tag).await.is_err() {
            return;
        }
        pts += 33;
    }
}

#[tokio::test]
async fn flv_stream_probe_reports_fps_without_lag() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_flv(listener));

    let mut prober = Prober::new(&format!("http://{}/live/test.flv", addr));
    prober.player_buffer_time_ms = 0;
    prober.probe_time_sec = 4;

    let info = prober.probe().await.unwrap();
    assert!(info.is_connected, "report: {}", info.to_json());
    assert_eq!(info.http_code, 200);
    assert_eq!(info.err_code, 0);
    assert!(
        (25.0..=35.0).contains(&info.video_fps),
        "fps={}",
        info.video_fps
    );
    assert_eq!(info.total_lag_count, 0, "report: {}", info.to_json());
    assert_eq!(info.total_lag_time_ms, 0);
    assert!(info.lag_rate < 0.01);
}

#[tokio::test]
async fn flv_probe_of_non_flv_body_sets_internal_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = sock.read(&mut buf).await;
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nnot-a-flv")
            .await
            .unwrap();
    });

    let mut prober = Prober::new(&format!("http://{}/live/test.flv", addr));
    prober.probe_time_sec = 2;

    let info = prober.probe().await.unwrap();
    assert!(info.is_connected);
    assert_eq!(info.err_code, streampulse::stream::ERR_INTERNAL);
}
