//! End-to-end probe scenarios against the in-process demo server.

use std::time::Duration;

use streampulse::http::{digest_by_name, HttpPinger};
use streampulse::server::{DemoServer, MAX_LENGTH};

async fn start_server() -> std::net::SocketAddr {
    let server = DemoServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

#[tokio::test]
async fn plain_http_probe_downloads_default_length() {
    let addr = start_server().await;
    let info = HttpPinger::get(&format!("http://{}/qn_download", addr))
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();

    assert_eq!(info.code, 200, "report: {}", info.to_json());
    assert_eq!(info.total_size, MAX_LENGTH as u64);
    assert_eq!(info.error, "");
    assert!(info.total_time_ms >= info.ttfb_ms as u64);
    assert!(info.speed_kb_s > 0.0);
    assert_eq!(info.domain, "127.0.0.1");
    assert_eq!(info.port, addr.port());
}

#[tokio::test]
async fn server_trailer_probe_populates_server_stats() {
    let addr = start_server().await;
    let info = HttpPinger::get(&format!("http://{}/qn_download", addr))
        .server_support(true)
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();

    assert_eq!(info.code, 200, "report: {}", info.to_json());
    // the trailer is part of the declared length
    assert_eq!(info.total_size, MAX_LENGTH as u64);
    assert_eq!(info.error, "");
    // either the kernel reported segments or the byte estimate kicked in
    assert!(info.server_tcp_info.total_packets >= 1);
    if info.server_tcp_info.retransmit_packets == 0 {
        assert_eq!(info.loss, 0.0);
    } else {
        assert!(info.loss > 0.0);
    }
}

#[tokio::test]
async fn custom_length_and_hash() {
    let addr = start_server().await;
    let info = HttpPinger::get(&format!("http://{}/qn_download", addr))
        .header("X-QN-QOT-LEN", "65536")
        .body_digest(digest_by_name("md5"))
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();

    assert_eq!(info.code, 200);
    assert_eq!(info.total_size, 65536);
    // 64 KiB of zero bytes
    assert_eq!(info.hash, "fcd6bcb56c1689fcef28b57c22475bad");
}

#[tokio::test]
async fn oversize_length_is_clamped() {
    let addr = start_server().await;
    let info = HttpPinger::get(&format!("http://{}/qn_download", addr))
        .header("X-QN-QOT-LEN", "999999999")
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();

    assert_eq!(info.code, 200);
    assert_eq!(info.total_size, MAX_LENGTH as u64);
}

#[tokio::test]
async fn non_integer_length_is_416() {
    let addr = start_server().await;
    let info = HttpPinger::get(&format!("http://{}/qn_download", addr))
        .header("X-QN-QOT-LEN", "two-megabytes")
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();

    assert_eq!(info.code, 416);
    assert_eq!(info.total_size, 0);
}

#[tokio::test]
async fn redirect_followed_when_enabled() {
    let addr = start_server().await;
    let target = format!("http://{}/hello", addr);
    let url = format!("http://{}/redirect?q={}", addr, target);

    let info = HttpPinger::get(&url)
        .follow_redirect(true)
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();
    assert_eq!(info.code, 200);
    assert_eq!(info.total_size, 5);
    assert_eq!(info.rounds.len(), 1);

    let info = HttpPinger::get(&url)
        .follow_redirect(false)
        .timeout(Some(Duration::from_secs(30)))
        .ping()
        .await
        .unwrap();
    assert_eq!(info.code, 301);
}
