//! Demo download server
//!
//! A small HTTP/1.1 server that the HTTP probe can be pointed at. Its one
//! interesting behavior is the in-band trailer protocol: when a client
//! sends `X-HTTPPING-REQUIRE: TCPINFO`, the last 16 bytes of the declared
//! Content-Length carry the server's little-endian [`TcpInfo`] for the
//! same connection.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::http::probe::{ASSUMED_MSS, REQUIRE_HEADER, TCPINFO_HEADER};
use crate::net::{sockopt, TcpInfo, TCP_INFO_WIRE_SIZE};

/// Default and maximum download size
pub const MAX_LENGTH: usize = 2 * 1024 * 1024;

/// Header selecting the download size in decimal bytes
pub const LENGTH_HEADER: &str = "X-QN-QOT-LEN";

const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Demo server bound to a listening socket
pub struct DemoServer {
    listener: TcpListener,
}

impl DemoServer {
    /// Bind to `addr` (use port 0 for an ephemeral port)
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the task is dropped
    pub async fn serve(self) -> Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "demo server listening");
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, peer).await {
                            tracing::debug!(peer = %peer, error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

struct ParsedRequest {
    path: String,
    query: String,
    headers: Vec<(String, String)>,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
    let Some(req) = read_request(&mut socket).await? else {
        return Ok(());
    };
    tracing::debug!(peer = %peer, path = %req.path, "request");

    match req.path.as_str() {
        "/qn_download" => handle_download(&mut socket, &req).await?,
        "/hello" => {
            write_head(&mut socket, 200, &[("Content-Length", "5")]).await?;
            socket.write_all(b"hello").await?;
        }
        "/redirect" => {
            let site = query_param(&req.query, "q").unwrap_or_default();
            write_head(
                &mut socket,
                301,
                &[("Location", site.as_str()), ("Content-Length", "0")],
            )
            .await?;
        }
        "/" => {
            // bare connection stats, no padding body
            let record = conn_tcp_info(&socket, 0).encode();
            let len = record.len().to_string();
            write_head(
                &mut socket,
                200,
                &[(TCPINFO_HEADER, "DONE"), ("Content-Length", len.as_str())],
            )
            .await?;
            socket.write_all(&record).await?;
        }
        _ => {
            write_head(&mut socket, 404, &[("Content-Length", "0")]).await?;
        }
    }
    socket.shutdown().await
}

async fn handle_download(socket: &mut TcpStream, req: &ParsedRequest) -> std::io::Result<()> {
    let Some(length) = requested_length(req.header(LENGTH_HEADER)) else {
        write_head(socket, 416, &[("Content-Length", "0")]).await?;
        return Ok(());
    };

    let trailer = req.header(REQUIRE_HEADER) == Some("TCPINFO");
    let length_value = length.to_string();
    let mut headers: Vec<(&str, &str)> = vec![("Content-Length", length_value.as_str())];
    let mut body_len = length;
    if trailer {
        headers.push((TCPINFO_HEADER, "DONE"));
        body_len = body_len.saturating_sub(TCP_INFO_WIRE_SIZE);
    }
    write_head(socket, 200, &headers).await?;

    // padding body in fixed chunks
    let chunk = [0u8; 64 * 1024];
    let mut left = body_len;
    while left > 0 {
        let n = left.min(chunk.len());
        socket.write_all(&chunk[..n]).await?;
        left -= n;
    }

    if trailer {
        // stats are read after the padding went out, so the record
        // reflects this transfer
        let record = conn_tcp_info(socket, length).encode();
        socket.write_all(&record).await?;
    }
    Ok(())
}

/// The connection's transport stats, with `total_packets` estimated from
/// the bytes that actually reached the wire
fn conn_tcp_info(socket: &TcpStream, response_length: usize) -> TcpInfo {
    match sockopt::tcp_info(socket) {
        Ok((mut info, raw)) => {
            if let Some(notsent) = raw.notsent_bytes() {
                // header bytes and in-flight-unacked segments are ignored,
                // close enough for a loss estimate
                let sent = response_length.saturating_sub(notsent as usize);
                info.total_packets = (sent / ASSUMED_MSS as usize) as u32;
            }
            info
        }
        Err(e) => {
            tracing::debug!(error = %e, "tcp info unavailable");
            TcpInfo::default()
        }
    }
}

/// Decode the requested download length: default when absent, clamped to
/// [`MAX_LENGTH`], `None` (⇒ 416) when unparseable or non-positive
fn requested_length(header: Option<&str>) -> Option<usize> {
    match header {
        None => Some(MAX_LENGTH),
        Some(v) => match v.trim().parse::<i64>() {
            Ok(n) if n > 0 => Some((n as usize).min(MAX_LENGTH)),
            _ => None,
        },
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<ParsedRequest>> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Ok(None);
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = match std::str::from_utf8(&buf[..head_end]) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let _method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.to_string(), String::new()),
    };

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    Ok(Some(ParsedRequest {
        path,
        query,
        headers,
    }))
}

async fn write_head(
    socket: &mut TcpStream,
    status: u16,
    headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        301 => "Moved Permanently",
        404 => "Not Found",
        416 => "Requested Range Not Satisfiable",
        _ => "",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("Connection: close\r\n\r\n");
    socket.write_all(head.as_bytes()).await
}
