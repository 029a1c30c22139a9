//! Upstream dial, request/response relay, and CONNECT splice.
//!
//! The partial-write discipline below (loop until the slice is
//! exhausted) is the same shape as `write_vec_all` in the teacher's
//! stream module, which loops `poll_write_vec` until its source
//! buffer is drained; here the buffer is plain bytes rather than a
//! `bytes::Buf`; the rest of this module borrows its read-loop style
//! from the other_examples forward-proxy reference rather than the
//! teacher's pooled-upstream path, since this proxy never reuses an
//! upstream connection across requests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::parser::ParsedRequest;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const IO_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_CHUNK: usize = 8 * 1024;

/// outcome of a forwarded (non-CONNECT) request.
pub struct ForwardOutcome {
    pub status: u16,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    /// the buffered response, present only when the caller asked for
    /// it and the body stayed under the buffering cap.
    pub buffered: Option<BufferedResponse>,
}

/// a response buffered alongside being streamed to the client, for
/// handing to the cache when the request is cacheable.
pub struct BufferedResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: Vec<u8>,
}

const CACHE_BUFFER_CAP: usize = 2 * 1024 * 1024;

async fn dial(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    let addr = format!("{host}:{port}");
    match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamUnreachable(e)),
        Err(_) => Err(ProxyError::UpstreamUnreachable(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "upstream connect timed out",
        ))),
    }
}

/// write all of `buf` to `writer`, retrying on short writes. Returns
/// bytes written even when an error cuts the write short.
async fn write_all_counted<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
) -> (u64, std::io::Result<()>) {
    let mut written = 0usize;
    while written < buf.len() {
        match writer.write(&buf[written..]).await {
            Ok(0) => {
                return (
                    written as u64,
                    Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "write returned zero",
                    )),
                )
            }
            Ok(n) => written += n,
            Err(e) => return (written as u64, Err(e)),
        }
    }
    (written as u64, Ok(()))
}

/// dial upstream, relay the request, stream the response back to the
/// client. When `want_buffer` is set and the response is cacheable
/// (2xx status, `GET`) and its body fits under the buffering cap, the
/// body is teed into the returned `BufferedResponse`.
pub async fn forward_request<C: tokio::io::AsyncWrite + Unpin>(
    req: &ParsedRequest,
    client: &mut C,
    want_buffer: bool,
) -> Result<ForwardOutcome, ProxyError> {
    let mut upstream = dial(&req.dest_host, req.dest_port).await?;

    let request_bytes = req.serialize_for_upstream();
    let (bytes_upstream, result) = timeout(IO_TIMEOUT, write_all_counted(&mut upstream, &request_bytes))
        .await
        .map_err(|_| {
            ProxyError::UpstreamIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream write timed out",
            ))
        })?;
    result.map_err(ProxyError::UpstreamIo)?;

    let mut reader = tokio::io::BufReader::new(upstream);
    let status_line = timeout(IO_TIMEOUT, read_line(&mut reader))
        .await
        .map_err(|_| {
            ProxyError::UpstreamIo(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream read timed out",
            ))
        })?
        .map_err(ProxyError::UpstreamIo)?;

    let status = parse_status(&status_line);

    let mut bytes_downstream = 0u64;
    let mut buffer_headers = http::HeaderMap::new();
    let mut buffer_body: Vec<u8> = Vec::new();
    let mut buffering = want_buffer;

    let (n, result) = write_all_counted(client, status_line.as_bytes()).await;
    bytes_downstream += n;
    result.map_err(ProxyError::UpstreamIo)?;

    loop {
        let line = timeout(IO_TIMEOUT, read_line(&mut reader))
            .await
            .map_err(|_| {
                ProxyError::UpstreamIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream read timed out",
                ))
            })?
            .map_err(ProxyError::UpstreamIo)?;

        let is_blank = line == "\r\n" || line == "\n";

        if buffering {
            if let Some((name, value)) = line.trim_end().split_once(':') {
                if let (Ok(name), Ok(value)) = (
                    http::HeaderName::from_bytes(name.trim().as_bytes()),
                    http::HeaderValue::from_str(value.trim()),
                ) {
                    buffer_headers.insert(name, value);
                }
            }
        }

        let (n, result) = write_all_counted(client, line.as_bytes()).await;
        bytes_downstream += n;
        result.map_err(ProxyError::UpstreamIo)?;

        if is_blank {
            break;
        }
    }

    let mut chunk = [0u8; RESPONSE_CHUNK];
    loop {
        let n = match timeout(IO_TIMEOUT, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ProxyError::UpstreamIo(e)),
            Err(_) => {
                return Err(ProxyError::UpstreamIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream read timed out",
                )))
            }
        };

        if buffering {
            if buffer_body.len() + n > CACHE_BUFFER_CAP {
                buffering = false;
                buffer_body.clear();
            } else {
                buffer_body.extend_from_slice(&chunk[..n]);
            }
        }

        let (written, result) = match timeout(IO_TIMEOUT, write_all_counted(client, &chunk[..n])).await {
            Ok(pair) => pair,
            Err(_) => {
                return Err(ProxyError::UpstreamIo(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "client write timed out",
                )))
            }
        };
        bytes_downstream += written;
        result.map_err(ProxyError::UpstreamIo)?;
    }

    let buffered = if buffering {
        Some(BufferedResponse {
            status,
            headers: buffer_headers,
            body: buffer_body,
        })
    } else {
        None
    };

    Ok(ForwardOutcome {
        status,
        bytes_upstream,
        bytes_downstream,
        buffered,
    })
}

fn parse_status(status_line: &str) -> u16 {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<String> {
    let mut line = String::new();
    let n = tokio::io::AsyncBufReadExt::read_line(reader, &mut line).await?;
    if n == 0 && line.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof reading upstream response",
        ));
    }
    Ok(line)
}

/// dial upstream and splice two raw byte streams together. Completes
/// as soon as either direction finishes; both sides are closed on
/// return.
pub async fn handle_connect(
    host: &str,
    port: u16,
    client: &mut TcpStream,
) -> Result<(), ProxyError> {
    let mut upstream = match dial(host, port).await {
        Ok(s) => s,
        Err(e) => {
            let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return Err(e);
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(ProxyError::UpstreamIo)?;

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    Ok(())
}
