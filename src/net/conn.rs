//! Instrumented TCP/TLS connection
//!
//! [`ProbeConn`] is the single endpoint every probe runs through. It looks
//! like a plain byte stream to the HTTP layer above it while recording a
//! timestamp at every boundary that matters: DNS resolve, TCP handshake,
//! TLS handshake, last write, first read. After a transfer completes the
//! probe pulls kernel transport statistics from the still-open socket via
//! [`crate::net::sockopt`].
//!
//! Local ports are picked deterministically from a process-global atomic
//! counter (`51200 + n % 12800`), with an unbounded retry on
//! `EADDRINUSE`; callers bound the overall attempt with their own
//! deadline. Each dial attempt itself has a hard 1 second budget.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::error::{Error, Result};

/// Hard per-attempt dial budget
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Base of the deterministic local-port window
const LOCAL_PORT_BASE: u32 = 51200;

/// Width of the deterministic local-port window
const LOCAL_PORT_RANGE: u32 = 12800;

/// Process-global counter behind the local-port selection
static LOCAL_PORT_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_local_port() -> u16 {
    let n = LOCAL_PORT_COUNTER.fetch_add(1, Ordering::Relaxed);
    (LOCAL_PORT_BASE + (n % LOCAL_PORT_RANGE)) as u16
}

/// Per-leg timing snapshot, captured when the connection redials for a
/// redirect
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundTime {
    pub domain: String,
    pub ip: String,
    pub port: u16,
    pub dns_ms: u32,
    pub connect_ms: u32,
    pub tls_ms: u32,
    pub ttfb_ms: u32,
    pub total_bytes: u64,
    pub total_ms: u64,
}

/// Timestamps shared between the timed TCP stream (which may sit under a
/// TLS session) and the owning connection
#[derive(Debug, Default)]
struct TimingFields {
    dns: Duration,
    tcp: Duration,
    tls: Duration,
    connect_start: Option<Instant>,
    last_write: Option<Instant>,
    first_read: Option<Instant>,
    bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TimingState {
    fields: Mutex<TimingFields>,
}

impl TimingState {
    fn on_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut f = self.fields.lock().unwrap();
        f.bytes += n as u64;
        if f.first_read.is_none() {
            f.first_read = Some(Instant::now());
        }
    }

    fn on_write(&self) {
        self.fields.lock().unwrap().last_write = Some(Instant::now());
    }

    fn reset_first_read(&self) {
        self.fields.lock().unwrap().first_read = None;
    }

    fn set_dns(&self, d: Duration) {
        self.fields.lock().unwrap().dns = d;
    }

    fn set_tcp(&self, start: Instant, d: Duration) {
        let mut f = self.fields.lock().unwrap();
        f.connect_start = Some(start);
        f.tcp = d;
    }

    fn set_tls(&self, d: Duration) {
        self.fields.lock().unwrap().tls = d;
    }
}

/// Read/write timing snapshot of a connection
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimes {
    pub dns: Duration,
    pub tcp: Duration,
    pub tls: Duration,
    /// Interval from the last write to the first subsequent read
    pub ttfb: Duration,
    /// Wall clock since the TCP connect started, if it did
    pub since_connect: Option<Duration>,
    /// Wall clock since the last write, if any
    pub since_last_write: Option<Duration>,
    /// Bytes read off the socket (TLS record overhead included on HTTPS)
    pub bytes: u64,
}

/// TCP stream that stamps the shared timing state on every read and write
#[derive(Debug)]
pub(crate) struct TimedTcp {
    inner: TcpStream,
    state: Arc<TimingState>,
}

impl AsyncRead for TimedTcp {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.state.on_read(buf.filled().len() - before);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for TimedTcp {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.state.on_write();
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum Transport {
    Plain(TimedTcp),
    Tls(Box<tokio_native_tls::TlsStream<TimedTcp>>),
}

type PingHook = Box<dyn FnOnce(IpAddr) + Send + Sync + 'static>;

/// Timestamping TCP/TLS endpoint with deterministic dialing and
/// redial history
pub struct ProbeConn {
    transport: Option<Transport>,
    state: Arc<TimingState>,
    rounds: Vec<RoundTime>,
    domain: String,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    /// User-supplied source address; `:0` is appended when portless
    source_addr: Option<String>,
    /// Rewrite the dialed host to this IP, keeping the port
    pin_ip: Option<IpAddr>,
    verify_host: bool,
    ping_hook: Option<PingHook>,
}

impl Default for ProbeConn {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeConn {
    pub fn new() -> Self {
        Self {
            transport: None,
            state: Arc::new(TimingState::default()),
            rounds: Vec::new(),
            domain: String::new(),
            remote: None,
            local: None,
            source_addr: None,
            pin_ip: None,
            verify_host: false,
            ping_hook: None,
        }
    }

    /// Bind outgoing connections to this local address
    pub fn source_addr(mut self, addr: Option<String>) -> Self {
        self.source_addr = addr.filter(|a| !a.is_empty());
        self
    }

    /// Dial this IP regardless of what the URL's host resolves to
    pub fn pin_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.pin_ip = ip;
        self
    }

    /// Verify TLS certificates against the host name (off by default,
    /// probes usually want to reach misconfigured edges too)
    pub fn verify_host(mut self, verify: bool) -> Self {
        self.verify_host = verify;
        self
    }

    /// Run this hook with the resolved remote IP on the first dial
    pub fn ping_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(IpAddr) + Send + Sync + 'static,
    {
        self.ping_hook = Some(Box::new(hook));
        self
    }

    /// Resolve and connect, recording DNS and TCP handshake timings
    ///
    /// A previous endpoint, if any, is snapshotted into the round history
    /// and closed first.
    pub async fn dial(&mut self, host: &str, port: u16) -> Result<()> {
        self.domain = host.to_string();
        let target = match self.pin_ip {
            Some(ip) => ip.to_string(),
            None => host.to_string(),
        };

        let dns_start = Instant::now();
        let remote = lookup_host((target.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", target),
                ))
            })?;
        self.state.set_dns(dns_start.elapsed());

        let first_dial = self.transport.is_none();
        if !first_dial {
            self.record_prev();
            self.transport = None;
        }
        if first_dial {
            if let Some(hook) = self.ping_hook.take() {
                hook(remote.ip());
            }
        }

        self.state.reset_first_read();
        let stream = self.connect(remote).await?;
        tracing::debug!(host = host, remote = %remote, "connected");
        self.remote = Some(remote);
        self.local = stream.local_addr().ok();
        self.transport = Some(Transport::Plain(TimedTcp {
            inner: stream,
            state: Arc::clone(&self.state),
        }));
        Ok(())
    }

    /// Dial and then upgrade to TLS against `host`, recording the
    /// handshake time and resetting the first-read stamp so TTFB is
    /// measured from the first post-handshake read
    pub async fn dial_tls(&mut self, host: &str, port: u16) -> Result<()> {
        self.dial(host, port).await?;
        let Some(Transport::Plain(timed)) = self.transport.take() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "no tcp stream to upgrade",
            )));
        };

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!self.verify_host)
            .danger_accept_invalid_hostnames(!self.verify_host)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let hs_start = Instant::now();
        let tls = connector
            .connect(host, timed)
            .await
            .map_err(Error::Tls)?;
        self.state.set_tls(hs_start.elapsed());
        self.state.reset_first_read();
        self.transport = Some(Transport::Tls(Box::new(tls)));
        Ok(())
    }

    async fn connect(&self, remote: SocketAddr) -> Result<TcpStream> {
        if let Some(src) = &self.source_addr {
            let mut addr = src.clone();
            if !addr.contains(':') {
                addr.push_str(":0");
            }
            let local: SocketAddr = addr.parse().map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad source address {}", src),
                ))
            })?;
            let socket = self.new_socket(remote)?;
            socket.bind(local)?;
            return self.connect_once(socket, remote).await.map_err(Error::Io);
        }

        // Deterministic local ports: walk the counter window until a bind
        // and connect both succeed. EADDRINUSE just advances the counter;
        // the caller's deadline bounds the loop.
        loop {
            let port = next_local_port();
            let socket = self.new_socket(remote)?;
            let local: SocketAddr = if remote.is_ipv4() {
                (std::net::Ipv4Addr::UNSPECIFIED, port).into()
            } else {
                (std::net::Ipv6Addr::UNSPECIFIED, port).into()
            };
            if let Err(e) = socket.bind(local) {
                if e.kind() == io::ErrorKind::AddrInUse {
                    continue;
                }
                return Err(Error::Io(e));
            }
            match self.connect_once(socket, remote).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn new_socket(&self, remote: SocketAddr) -> Result<TcpSocket> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        socket.map_err(Error::Io)
    }

    async fn connect_once(&self, socket: TcpSocket, remote: SocketAddr) -> io::Result<TcpStream> {
        let start = Instant::now();
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, socket.connect(remote)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", remote),
                ))
            }
        };
        self.state.set_tcp(start, start.elapsed());
        Ok(stream)
    }

    /// Append the current leg to the round history
    pub fn record_prev(&mut self) {
        let t = self.phase_times();
        self.rounds.push(RoundTime {
            domain: self.domain.clone(),
            ip: self.remote.map(|a| a.ip().to_string()).unwrap_or_default(),
            port: self.remote.map(|a| a.port()).unwrap_or_default(),
            dns_ms: t.dns.as_millis() as u32,
            connect_ms: t.tcp.as_millis() as u32,
            tls_ms: t.tls.as_millis() as u32,
            ttfb_ms: t.ttfb.as_millis() as u32,
            total_bytes: t.bytes,
            total_ms: t.since_connect.map(|d| d.as_millis() as u64).unwrap_or(0),
        });
    }

    /// Timing snapshots accumulated across redirects
    pub fn rounds(&self) -> &[RoundTime] {
        &self.rounds
    }

    /// Current timing snapshot
    pub fn phase_times(&self) -> PhaseTimes {
        let f = self.state.fields.lock().unwrap();
        let ttfb = match (f.first_read, f.last_write) {
            (Some(r), Some(w)) => r.saturating_duration_since(w),
            _ => Duration::ZERO,
        };
        PhaseTimes {
            dns: f.dns,
            tcp: f.tcp,
            tls: f.tls,
            ttfb,
            since_connect: f.connect_start.map(|s| s.elapsed()),
            since_last_write: f.last_write.map(|w| w.elapsed()),
            bytes: f.bytes,
        }
    }

    /// Interval from the last write to the first subsequent read
    pub fn ttfb(&self) -> Duration {
        self.phase_times().ttfb
    }

    /// Host part of the most recent dial target
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// The live TCP socket under the (possibly TLS-wrapped) transport
    pub fn socket(&self) -> Option<&TcpStream> {
        match &self.transport {
            Some(Transport::Plain(t)) => Some(&t.inner),
            Some(Transport::Tls(t)) => Some(&t.get_ref().get_ref().get_ref().inner),
            None => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Drop the underlying endpoint, if any
    pub fn close(&mut self) {
        self.transport = None;
    }
}

impl AsyncRead for ProbeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Some(Transport::Plain(t)) => Pin::new(t).poll_read(cx, buf),
            Some(Transport::Tls(t)) => Pin::new(t.as_mut()).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for ProbeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().transport {
            Some(Transport::Plain(t)) => Pin::new(t).poll_write(cx, buf),
            Some(Transport::Tls(t)) => Pin::new(t.as_mut()).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Some(Transport::Plain(t)) => Pin::new(t).poll_flush(cx),
            Some(Transport::Tls(t)) => Pin::new(t.as_mut()).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Some(Transport::Plain(t)) => Pin::new(t).poll_shutdown(cx),
            Some(Transport::Tls(t)) => Pin::new(t.as_mut()).poll_shutdown(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection not established")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_local_port_window() {
        for _ in 0..20_000 {
            let p = next_local_port() as u32;
            assert!((LOCAL_PORT_BASE..LOCAL_PORT_BASE + LOCAL_PORT_RANGE).contains(&p));
        }
    }

    #[tokio::test]
    async fn test_dial_and_timing_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
        });

        let mut conn = ProbeConn::new();
        conn.dial("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.domain(), "127.0.0.1");

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let t = conn.phase_times();
        assert_eq!(t.bytes, 4);
        assert!(t.since_connect.unwrap() >= t.tcp);
        // ttfb is defined once a read followed a write
        assert!(conn.ttfb() <= t.since_connect.unwrap());
    }

    #[tokio::test]
    async fn test_pin_ip_overrides_host() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        // a host name that must not be resolved when an IP is pinned
        let mut conn = ProbeConn::new().pin_ip(Some("127.0.0.1".parse().unwrap()));
        conn.dial("pinned.invalid", addr.port()).await.unwrap();
        assert_eq!(conn.domain(), "pinned.invalid");
        assert_eq!(
            conn.remote_addr().unwrap().ip(),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_redial_records_round() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                drop(sock);
            }
        });

        let mut conn = ProbeConn::new();
        conn.dial("127.0.0.1", addr.port()).await.unwrap();
        assert!(conn.rounds().is_empty());
        conn.dial("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(conn.rounds().len(), 1);
        assert_eq!(conn.rounds()[0].domain, "127.0.0.1");
        assert_eq!(conn.rounds()[0].port, addr.port());
    }

    #[tokio::test]
    async fn test_ping_hook_fires_once_with_remote_ip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                drop(sock);
            }
        });

        let (tx, mut rx) = tokio::sync::mpsc::channel::<IpAddr>(1);
        let mut conn = ProbeConn::new().ping_hook(move |ip| {
            let _ = tx.try_send(ip);
        });
        conn.dial("127.0.0.1", addr.port()).await.unwrap();
        conn.dial("127.0.0.1", addr.port()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().to_string(), "127.0.0.1");
        // second dial must not fire again
        assert!(rx.try_recv().is_err());
    }
}
