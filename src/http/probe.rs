//! HTTP probe orchestrator
//!
//! Drives one HTTP request through the instrumented connection, runs a
//! concurrent system ping against the resolved remote IP, optionally
//! consumes the cooperating server's in-band TCPINFO trailer, harvests
//! kernel socket statistics, and assembles the final [`HttpInfo`] report.
//!
//! Failure policy: anything that goes wrong after the request is underway
//! is recorded in the report's `error`/`ping_error` fields and the probe
//! still returns a populated report. Only pre-request problems (bad URL,
//! unsupported scheme) surface as a top-level error.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::http::client::{self, ClientOptions, Request};
use crate::http::digest::BodyDigest;
use crate::net::{sockopt, ProbeConn, RoundTime, TcpInfo, TCP_INFO_WIRE_SIZE};
use crate::ping::sys_ping;

/// Request header asking a cooperating server for the TCPINFO trailer
pub const REQUIRE_HEADER: &str = "X-HTTPPING-REQUIRE";

/// Response header confirming the trailer is present
pub const TCPINFO_HEADER: &str = "X-HTTPPING-TCPINFO";

/// Assumed MSS when estimating a packet count from a byte count
pub const ASSUMED_MSS: u64 = 1460;

/// Final report of one HTTP probe
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpInfo {
    pub client_tcp_info: TcpInfo,
    pub server_tcp_info: TcpInfo,
    pub domain: String,
    pub ip: String,
    pub port: u16,
    pub code: u16,
    pub hops: u32,
    pub dns_time_ms: u32,
    pub connect_time_ms: u32,
    pub tls_handshake_time_ms: u32,
    pub ttfb_ms: u32,
    pub retransmit_packets: u32,
    /// bytes per adjusted millisecond, numerically kB/s
    pub speed_kb_s: f32,
    pub total_size: u64,
    pub total_time_ms: u64,
    pub error: String,
    pub ping_error: String,
    pub hash: String,
    pub loss: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rounds: Vec<RoundTime>,
}

impl HttpInfo {
    /// Pretty JSON with tab indentation, the report interchange format
    pub fn to_json(&self) -> String {
        to_tab_json(self)
    }
}

/// Serialize any report record as tab-indented pretty JSON
pub fn to_tab_json<T: Serialize>(value: &T) -> String {
    let mut out = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
    if value.serialize(&mut ser).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}

/// Network-path hop estimate from a reply TTL
///
/// Senders start at a power-of-two-ish initial TTL; the estimate is the
/// distance to the smallest bucket holding the observed value.
pub fn hops(ttl: u32) -> u32 {
    for bucket in [64u32, 128, 256, 512] {
        if ttl <= bucket {
            return bucket - ttl;
        }
    }
    0
}

struct PingOutcome {
    hops: Option<u32>,
    error: String,
}

/// HTTP probe configuration and entry point
pub struct HttpPinger {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    /// Run a concurrent system ping against the resolved remote IP
    pub sys_ping: bool,
    /// Local source address for both the TCP dial and the ping
    pub src_addr: Option<String>,
    /// Ask the server for the in-band TCPINFO trailer
    pub server_support: bool,
    /// Optional digest fed with the body bytes
    pub body_digest: Option<Box<dyn BodyDigest>>,
    /// Follow redirects instead of returning the first response
    pub follow_redirect: bool,
    /// End-to-end budget for the HTTP exchange including the body
    pub timeout: Option<Duration>,
    /// Dial this IP instead of resolving the URL host
    pub pin_ip: Option<IpAddr>,
    /// Verify TLS certificates
    pub verify_host: bool,
    pub user_agent: Option<String>,
}

impl HttpPinger {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            sys_ping: false,
            src_addr: None,
            server_support: false,
            body_digest: None,
            follow_redirect: false,
            timeout: None,
            pin_ip: None,
            verify_host: false,
            user_agent: None,
        }
    }

    pub fn sys_ping(mut self, enabled: bool) -> Self {
        self.sys_ping = enabled;
        self
    }

    pub fn src_addr(mut self, addr: Option<String>) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn server_support(mut self, enabled: bool) -> Self {
        self.server_support = enabled;
        self
    }

    pub fn body_digest(mut self, digest: Option<Box<dyn BodyDigest>>) -> Self {
        self.body_digest = digest;
        self
    }

    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.follow_redirect = follow;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Run the probe and return the populated report
    pub async fn ping(mut self) -> Result<HttpInfo> {
        let mut info = HttpInfo::default();

        let mut req = Request::get(&self.url)?;
        req.method = self.method.clone();
        req.headers = std::mem::take(&mut self.headers);
        if self.server_support {
            req = req.header(REQUIRE_HEADER, "TCPINFO");
        }
        match req.url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::UnsupportedProtocol(other.to_string())),
        }

        let (ping_tx, mut ping_rx) = mpsc::channel::<PingOutcome>(1);
        let mut conn = ProbeConn::new()
            .source_addr(self.src_addr.clone())
            .pin_ip(self.pin_ip)
            .verify_host(self.verify_host);
        if self.sys_ping {
            let src = self.src_addr.clone();
            conn = conn.ping_hook(move |ip| {
                tokio::spawn(async move {
                    let outcome = run_sys_ping(ip, src.as_deref()).await;
                    let _ = ping_tx.send(outcome).await;
                });
            });
        }

        let mut opts = ClientOptions {
            follow_redirects: self.follow_redirect,
            ..Default::default()
        };
        if let Some(ua) = &self.user_agent {
            opts.user_agent = ua.clone();
        }

        let digest = self.body_digest.take();
        let server_support = self.server_support;
        let exchange = exchange(conn, req, opts, digest, server_support, &mut info);
        let ok = match self.timeout {
            Some(t) => match tokio::time::timeout(t, exchange).await {
                Ok(ok) => ok,
                Err(_) => {
                    info.error = "request timed out".to_string();
                    false
                }
            },
            None => exchange.await,
        };

        if !ok {
            return Ok(info);
        }

        // the ping child bounds itself (single reply, 5 s ceiling)
        if self.sys_ping {
            if let Some(outcome) = ping_rx.recv().await {
                if let Some(h) = outcome.hops {
                    info.hops = h;
                }
                info.ping_error = outcome.error;
            }
        }

        Ok(info)
    }
}

async fn run_sys_ping(ip: IpAddr, src: Option<&str>) -> PingOutcome {
    match sys_ping(&ip.to_string(), 1, 5, 1, src).await {
        Ok(po) => match po.replies.first() {
            Some(reply) => PingOutcome {
                hops: Some(hops(reply.ttl)),
                error: String::new(),
            },
            None => PingOutcome {
                hops: None,
                error: "ping wait more than 5s".to_string(),
            },
        },
        Err(e) => PingOutcome {
            hops: None,
            error: e.to_string(),
        },
    }
}

fn fill_endpoint(info: &mut HttpInfo, conn: &ProbeConn) {
    info.domain = conn.domain().to_string();
    if let Some(remote) = conn.remote_addr() {
        info.ip = remote.ip().to_string();
        info.port = remote.port();
        info.dns_time_ms = conn.phase_times().dns.as_millis() as u32;
    }
}

/// Run the request and body phases, writing every observable into `info`.
/// Returns false when the probe ended early (error already recorded).
async fn exchange(
    conn: ProbeConn,
    req: Request,
    opts: ClientOptions,
    mut digest: Option<Box<dyn BodyDigest>>,
    server_support: bool,
    info: &mut HttpInfo,
) -> bool {
    let mut resp = match client::send(conn, &req, &opts).await {
        Ok(resp) => resp,
        Err(failure) => {
            fill_endpoint(info, &failure.conn);
            info.rounds = failure.conn.rounds().to_vec();
            info.error = failure.error.to_string();
            return false;
        }
    };

    fill_endpoint(info, resp.body.conn());
    {
        let t = resp.body.conn().phase_times();
        info.connect_time_ms = t.tcp.as_millis() as u32;
        info.tls_handshake_time_ms = t.tls.as_millis() as u32;
        info.ttfb_ms = t.ttfb.as_millis() as u32;
    }
    info.code = resp.status;

    let trailer = server_support
        && resp
            .header(TCPINFO_HEADER)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
    let content_length = resp.content_length();

    let read_result: std::io::Result<()> = async {
        match content_length {
            Some(cl) if trailer && cl > 0 => {
                // the declared length reserves its tail for the record
                let payload = cl.saturating_sub(TCP_INFO_WIRE_SIZE as u64);
                resp.body.copy_n(payload, |_| {}).await?;
                let mut tail = [0u8; TCP_INFO_WIRE_SIZE];
                resp.body.read_exact(&mut tail).await?;
                if let Some(server) = TcpInfo::decode(&tail) {
                    info.server_tcp_info = server;
                }
                Ok(())
            }
            Some(cl) if cl > 0 => {
                resp.body
                    .copy_n(cl, |chunk| {
                        if let Some(d) = digest.as_mut() {
                            d.update(chunk);
                        }
                    })
                    .await?;
                Ok(())
            }
            _ => {
                resp.body
                    .copy_all(|chunk| {
                        if let Some(d) = digest.as_mut() {
                            d.update(chunk);
                        }
                    })
                    .await?;
                Ok(())
            }
        }
    }
    .await;

    let body_read = resp.body.delivered();
    info.total_size = body_read;
    info.rounds = resp.body.conn().rounds().to_vec();

    if let Err(e) = read_result {
        info.error = e.to_string();
        return false;
    }

    match resp.body.conn().socket() {
        Some(sock) => match sockopt::tcp_info(sock) {
            Ok((tcp, _raw)) => info.client_tcp_info = tcp,
            Err(e) => info.error = e.to_string(),
        },
        None => info.error = sockopt::SockoptError::InvalidSocket.to_string(),
    }

    if trailer && content_length.map(|cl| cl != 0).unwrap_or(false) {
        if info.server_tcp_info.total_packets == 0 {
            info.server_tcp_info.total_packets = (body_read / ASSUMED_MSS).max(1) as u32;
        }
        if info.server_tcp_info.retransmit_packets != 0 {
            info.loss = info.server_tcp_info.retransmit_packets as f32
                / info.server_tcp_info.total_packets.max(1) as f32
                * 100.0;
            info.retransmit_packets = info.server_tcp_info.retransmit_packets;
        }
    }

    let t = resp.body.conn().phase_times();
    info.ttfb_ms = t.ttfb.as_millis() as u32;
    info.total_time_ms = t.since_connect.unwrap_or_default().as_millis() as u64;
    // measure from the last write so tiny responses (first read == end)
    // still get a denominator; subtract one RTT for the request leg
    let mut denom_ms =
        t.since_last_write.unwrap_or_default().as_millis() as i64 - info.client_tcp_info.rtt_ms as i64;
    if denom_ms <= 0 {
        denom_ms = 1;
    }
    info.speed_kb_s = (body_read as f64 / denom_ms as f64) as f32;

    if let Some(d) = digest.take() {
        info.hash = d.finalize_hex();
    }

    true
}

/// Probe a URL with defaults: system ping on, no source address
pub async fn ping_simple(url: &str) -> Result<HttpInfo> {
    ping_get(url, true, None).await
}

/// Probe a URL with an explicit ping toggle and source address
pub async fn ping_get(url: &str, sys_ping: bool, src_addr: Option<String>) -> Result<HttpInfo> {
    HttpPinger::get(url)
        .sys_ping(sys_ping)
        .src_addr(src_addr)
        .ping()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hops_buckets() {
        assert_eq!(hops(64), 0);
        assert_eq!(hops(128), 0);
        assert_eq!(hops(256), 0);
        assert_eq!(hops(63), 1);
        assert_eq!(hops(1), 63);
        assert_eq!(hops(54), 10);
        assert_eq!(hops(118), 10);
        assert_eq!(hops(250), 6);
    }

    #[test]
    fn test_hops_in_documented_ranges() {
        for ttl in 1..=255u32 {
            let h = hops(ttl);
            assert!(h < 256, "ttl={} hops={}", ttl, h);
        }
    }

    #[test]
    fn test_tab_json_shape() {
        let info = HttpInfo {
            code: 200,
            domain: "example.com".to_string(),
            ..Default::default()
        };
        let json = info.to_json();
        assert!(json.contains("\n\t\"code\": 200"));
        assert!(json.contains("\"domain\": \"example.com\""));
        // empty round history stays out of the report
        assert!(!json.contains("rounds"));
    }

    #[test]
    fn test_unsupported_scheme_is_pre_request_error() {
        let err = tokio_test::block_on(HttpPinger::get("ftp://example.com/f").ping());
        assert!(matches!(err, Err(Error::UnsupportedProtocol(_))));
    }

    #[tokio::test]
    async fn test_probe_records_error_but_returns_report() {
        // nothing listens on this port; dial fails, report still comes back
        let info = HttpPinger::get("http://127.0.0.1:1/down")
            .timeout(Some(Duration::from_secs(5)))
            .ping()
            .await
            .unwrap();
        assert_eq!(info.code, 0);
        assert!(!info.error.is_empty());
        assert_eq!(info.domain, "127.0.0.1");
    }
}
