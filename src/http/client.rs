//! Minimal async HTTP/1.1 client over the instrumented connection
//!
//! Probes need exact control of every byte boundary (the connection under
//! the request is what gets measured), so requests are written and
//! responses framed by hand on top of [`ProbeConn`] instead of going
//! through a client library. Supported surface: request line + headers,
//! status line + headers, bodies framed by Content-Length, chunked
//! transfer coding, or connection close, and redirect following.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::error::Error;
use crate::net::ProbeConn;

/// Upper bound on a response head we are willing to buffer
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on one chunk-size line
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Read buffer unit for body draining
const BODY_CHUNK: usize = 64 * 1024;

/// HTTP exchange errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// URL lacks a host or a resolvable port
    InvalidUrl(String),
    /// Response head or framing could not be parsed
    MalformedResponse(String),
    /// Redirect chain exceeded the hop limit
    TooManyRedirects,
    /// Body ended before its declared framing was satisfied
    UnexpectedEof,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::InvalidUrl(u) => write!(f, "invalid url: {}", u),
            HttpError::MalformedResponse(m) => write!(f, "malformed response: {}", m),
            HttpError::TooManyRedirects => write!(f, "too many redirects"),
            HttpError::UnexpectedEof => write!(f, "unexpected end of body"),
        }
    }
}

impl std::error::Error for HttpError {}

/// One HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    /// Extra headers, sent verbatim in order
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Build a GET request; a scheme-less URL gets `http://` prepended
    pub fn get(url: &str) -> Result<Self, Error> {
        let raw = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        Ok(Self {
            method: "GET".to_string(),
            url: Url::parse(&raw)?,
            headers: Vec::new(),
        })
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Client behavior knobs
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user_agent: String,
    pub follow_redirects: bool,
    pub max_redirects: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("streampulse/", env!("CARGO_PKG_VERSION")).to_string(),
            follow_redirects: true,
            max_redirects: 10,
        }
    }
}

/// A send failure, handing the (partially dialed) connection back so the
/// caller can still report the endpoint and phase timings it captured
pub struct SendFailure {
    pub error: Error,
    pub conn: ProbeConn,
}

/// Body framing declared by the response head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Length { remaining: u64 },
    Chunked,
    Eof,
}

/// Streaming response body; owns the connection until dropped
pub struct Body {
    conn: ProbeConn,
    /// Bytes read past the head, not yet delivered
    buf: BytesMut,
    framing: Framing,
    /// Remaining bytes of the current chunk (chunked framing only)
    chunk_remaining: u64,
    chunks_done: bool,
    delivered: u64,
}

impl Body {
    fn new(conn: ProbeConn, leftover: BytesMut, framing: Framing) -> Self {
        Self {
            conn,
            buf: leftover,
            framing,
            chunk_remaining: 0,
            chunks_done: false,
            delivered: 0,
        }
    }

    pub fn conn(&self) -> &ProbeConn {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut ProbeConn {
        &mut self.conn
    }

    pub fn into_conn(self) -> ProbeConn {
        self.conn
    }

    /// Body bytes delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Read some body bytes into `out`; `Ok(0)` means the body is done
    /// (or the peer closed early — framing tolerance matches what real
    /// servers do)
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let n = match self.framing {
            Framing::Length { remaining } => {
                if remaining == 0 {
                    return Ok(0);
                }
                let want = out.len().min(remaining.min(usize::MAX as u64) as usize);
                let n = self.read_raw(&mut out[..want]).await?;
                if let Framing::Length { remaining } = &mut self.framing {
                    *remaining -= n as u64;
                }
                n
            }
            Framing::Eof => self.read_raw(out).await?,
            Framing::Chunked => self.read_chunked(out).await?,
        };
        self.delivered += n as u64;
        Ok(n)
    }

    /// Fill `out` completely or fail with `UnexpectedEof`
    pub async fn read_exact(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "body ended early",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read up to `n` body bytes, feeding each slice to `sink`; returns
    /// the byte count actually read (early EOF is not an error)
    pub async fn copy_n<F>(&mut self, n: u64, mut sink: F) -> io::Result<u64>
    where
        F: FnMut(&[u8]),
    {
        let mut buf = vec![0u8; BODY_CHUNK];
        let mut left = n;
        let mut total = 0u64;
        while left > 0 {
            let want = buf.len().min(left.min(usize::MAX as u64) as usize);
            let got = self.read(&mut buf[..want]).await?;
            if got == 0 {
                break;
            }
            sink(&buf[..got]);
            total += got as u64;
            left -= got as u64;
        }
        Ok(total)
    }

    /// Read until the body ends, feeding each slice to `sink`
    pub async fn copy_all<F>(&mut self, mut sink: F) -> io::Result<u64>
    where
        F: FnMut(&[u8]),
    {
        let mut buf = vec![0u8; BODY_CHUNK];
        let mut total = 0u64;
        loop {
            let got = self.read(&mut buf).await?;
            if got == 0 {
                return Ok(total);
            }
            sink(&buf[..got]);
            total += got as u64;
        }
    }

    /// Collect the remaining body into one buffer
    pub async fn bytes(&mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        let mut buf = vec![0u8; BODY_CHUNK];
        loop {
            let got = self.read(&mut buf).await?;
            if got == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&buf[..got]);
        }
    }

    /// Raw read: drain the leftover buffer first, then the connection
    async fn read_raw(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf.split_to(n));
            return Ok(n);
        }
        self.conn.read(out).await
    }

    async fn fill_buf(&mut self) -> io::Result<usize> {
        self.conn.read_buf(&mut self.buf).await
    }

    /// Read one CRLF-terminated line (chunk framing metadata)
    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let line = &line[..pos];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 line"));
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
            }
            if self.fill_buf().await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof in line"));
            }
        }
    }

    async fn read_chunked(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.chunks_done {
                return Ok(0);
            }
            if self.chunk_remaining > 0 {
                let want = out.len().min(self.chunk_remaining.min(usize::MAX as u64) as usize);
                let n = self.read_raw(&mut out[..want]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside chunk",
                    ));
                }
                self.chunk_remaining -= n as u64;
                if self.chunk_remaining == 0 {
                    // trailing CRLF of the chunk
                    let sep = self.read_line().await?;
                    if !sep.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing chunk terminator",
                        ));
                    }
                }
                return Ok(n);
            }

            let size_line = self.read_line().await?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "bad chunk size")
            })?;
            if size == 0 {
                // trailers until the blank line
                loop {
                    if self.read_line().await?.is_empty() {
                        break;
                    }
                }
                self.chunks_done = true;
                return Ok(0);
            }
            self.chunk_remaining = size;
        }
    }
}

/// Parsed response head plus the streaming body
pub struct Response {
    pub status: u16,
    /// Header names lowercased, order preserved
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

fn request_target(url: &Url) -> String {
    let path = if url.path().is_empty() { "/" } else { url.path() };
    match url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Run one request (following redirects per `opts`) through `conn`
///
/// On failure the connection comes back inside [`SendFailure`] so the
/// caller can still read the endpoint and timings of the failed leg.
pub async fn send(
    conn: ProbeConn,
    req: &Request,
    opts: &ClientOptions,
) -> Result<Response, Box<SendFailure>> {
    let mut conn = conn;
    let mut url = req.url.clone();
    let mut method = req.method.clone();
    let mut hops = 0usize;

    loop {
        match send_one(&mut conn, &url, &method, req, opts).await {
            Ok((status, headers, leftover)) => {
                let location = headers
                    .iter()
                    .find(|(n, _)| n.as_str() == "location")
                    .map(|(_, v)| v.clone());
                if opts.follow_redirects && is_redirect(status) {
                    if let Some(loc) = location {
                        hops += 1;
                        if hops > opts.max_redirects {
                            return Err(Box::new(SendFailure {
                                error: Error::Http(HttpError::TooManyRedirects),
                                conn,
                            }));
                        }
                        match url.join(&loc) {
                            Ok(next) => {
                                tracing::debug!(location = %next, "following redirect");
                                url = next;
                                if status == 303 {
                                    method = "GET".to_string();
                                }
                                continue;
                            }
                            Err(e) => {
                                return Err(Box::new(SendFailure {
                                    error: Error::Url(e),
                                    conn,
                                }))
                            }
                        }
                    }
                }

                let framing = response_framing(&method, status, &headers);
                return Ok(Response {
                    status,
                    headers,
                    body: Body::new(conn, leftover, framing),
                });
            }
            Err(error) => return Err(Box::new(SendFailure { error, conn })),
        }
    }
}

fn response_framing(method: &str, status: u16, headers: &[(String, String)]) -> Framing {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v.as_str())
    };
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Framing::Length { remaining: 0 };
    }
    if header("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return Framing::Chunked;
    }
    if let Some(cl) = header("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        return Framing::Length { remaining: cl };
    }
    Framing::Eof
}

async fn send_one(
    conn: &mut ProbeConn,
    url: &Url,
    method: &str,
    req: &Request,
    opts: &ClientOptions,
) -> Result<(u16, Vec<(String, String)>, BytesMut), Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Http(HttpError::InvalidUrl(url.to_string())))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Http(HttpError::InvalidUrl(url.to_string())))?;

    match url.scheme() {
        "http" => conn.dial(&host, port).await?,
        "https" => conn.dial_tls(&host, port).await?,
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    }

    let mut head = format!("{} {} HTTP/1.1\r\n", method, request_target(url));
    head.push_str(&format!("Host: {}\r\n", host_header(url)));
    if !req.has_header("user-agent") {
        head.push_str(&format!("User-Agent: {}\r\n", opts.user_agent));
    }
    if !req.has_header("accept") {
        head.push_str("Accept: */*\r\n");
    }
    for (name, value) in &req.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("Connection: close\r\n\r\n");

    conn.write_all(head.as_bytes()).await?;
    conn.flush().await?;

    read_head(conn).await
}

async fn read_head(conn: &mut ProbeConn) -> Result<(u16, Vec<(String, String)>, BytesMut), Error> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let end = loop {
        if let Some(pos) = find_blank_line(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::Http(HttpError::MalformedResponse(
                "response head too large".into(),
            )));
        }
        let n = conn.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Http(HttpError::MalformedResponse(
                "connection closed before response head".into(),
            )));
        }
    };

    let head = buf.split_to(end + 4);
    let head = std::str::from_utf8(&head[..end]).map_err(|_| {
        Error::Http(HttpError::MalformedResponse("non-utf8 response head".into()))
    })?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let proto = parts.next().unwrap_or_default();
    if !proto.starts_with("HTTP/") {
        return Err(Error::Http(HttpError::MalformedResponse(format!(
            "bad status line: {}",
            status_line
        ))));
    }
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| {
            Error::Http(HttpError::MalformedResponse(format!(
                "bad status code in: {}",
                status_line
            )))
        })?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Http(HttpError::MalformedResponse(format!(
                "bad header line: {}",
                line
            ))));
        };
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok((status, headers, buf))
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// One-shot GET collecting the whole body; used for playlist and segment
/// fetches where the connection itself is not being measured
pub async fn fetch(
    url: &Url,
    headers: &[(String, String)],
    timeout: Option<std::time::Duration>,
) -> Result<(u16, Bytes), Error> {
    let req = Request {
        method: "GET".to_string(),
        url: url.clone(),
        headers: headers.to_vec(),
    };
    let opts = ClientOptions::default();
    let fut = async {
        let mut resp = send(ProbeConn::new(), &req, &opts)
            .await
            .map_err(|f| f.error)?;
        let bytes = resp.body.bytes().await?;
        Ok((resp.status, bytes))
    };
    match timeout {
        Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| {
            Error::Io(io::Error::new(io::ErrorKind::TimedOut, "fetch timed out"))
        })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    async fn one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let addr = one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\nhello",
        )
        .await;
        let req = Request::get(&format!("http://127.0.0.1:{}/x", addr.port())).unwrap();
        let mut resp = send(ProbeConn::new(), &req, &ClientOptions::default())
            .await
            .map_err(|f| f.error.to_string())
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.content_length(), Some(5));
        assert_eq!(resp.header("content-type"), Some("text/plain"));
        let body = resp.body.bytes().await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(resp.body.delivered(), 5);
    }

    #[tokio::test]
    async fn test_chunked_body() {
        let addr = one_shot_server(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        let req = Request::get(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut resp = send(ProbeConn::new(), &req, &ClientOptions::default())
            .await
            .map_err(|f| f.error.to_string())
            .unwrap();
        let body = resp.body.bytes().await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_eof_delimited_body() {
        let addr = one_shot_server(b"HTTP/1.1 200 OK\r\n\r\nstream-until-close").await;
        let req = Request::get(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut resp = send(ProbeConn::new(), &req, &ClientOptions::default())
            .await
            .map_err(|f| f.error.to_string())
            .unwrap();
        let body = resp.body.bytes().await.unwrap();
        assert_eq!(&body[..], b"stream-until-close");
    }

    #[tokio::test]
    async fn test_redirect_not_followed_when_disabled() {
        let addr = one_shot_server(
            b"HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:1/elsewhere\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let req = Request::get(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let opts = ClientOptions {
            follow_redirects: false,
            ..Default::default()
        };
        let resp = send(ProbeConn::new(), &req, &opts)
            .await
            .map_err(|f| f.error.to_string())
            .unwrap();
        assert_eq!(resp.status, 302);
    }

    #[tokio::test]
    async fn test_redirect_followed() {
        // target first, so its address is known for the redirecting server
        let target = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{}/final\r\nContent-Length: 0\r\n\r\n",
                target.port()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
        });

        let req = Request::get(&format!("http://127.0.0.1:{}/", addr.port())).unwrap();
        let mut resp = send(ProbeConn::new(), &req, &ClientOptions::default())
            .await
            .map_err(|f| f.error.to_string())
            .unwrap();
        assert_eq!(resp.status, 200);
        let body = resp.body.bytes().await.unwrap();
        assert_eq!(&body[..], b"ok");
        // the redirect leg was snapshotted into the round history
        assert_eq!(resp.body.conn().rounds().len(), 1);
    }

    #[tokio::test]
    async fn test_scheme_less_url_gets_http() {
        let req = Request::get("example.com/path").unwrap();
        assert_eq!(req.url.scheme(), "http");
        assert_eq!(req.url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_request_target_and_host() {
        let url = Url::parse("http://example.com:8080/a/b?x=1").unwrap();
        assert_eq!(request_target(&url), "/a/b?x=1");
        assert_eq!(host_header(&url), "example.com:8080");

        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(request_target(&url), "/");
        assert_eq!(host_header(&url), "example.com");
    }
}
