//! HTTP/1.1 request parsing and upstream re-serialization.
//!
//! Grounded on the read-loop shape of a hand-rolled forward-proxy
//! parser rather than the teacher's own `httparse`-backed
//! `session::request` path: the line-splitting rules here (two-space
//! split on the request line, headers tolerant of colon-less lines,
//! a CONNECT short-circuit before any header is read) are bespoke
//! enough that reusing `httparse`'s stricter grammar would fight the
//! contract instead of serving it. The `Capitalized-Name` emission
//! on the way back out does borrow the teacher's idea, in
//! `session::case`, that header names carry a canonical display
//! capitalization distinct from their lowercase lookup key.

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::ProxyError;

const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;

/// an HTTP/1.1 request, parsed from a byte stream. Immutable once
/// built; headers are keyed by their lowercased name, last write
/// wins on duplicates.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub dest_host: String,
    pub dest_port: u16,
    pub is_connect: bool,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    /// read and parse one request from `reader`.
    pub fn parse<R: Read>(reader: &mut R) -> Result<ParsedRequest, ProxyError> {
        let mut buf = LineReader::new(reader);

        let line = buf.read_line()?;
        let (method, target, version) = split_request_line(&line)?;
        let method = method.to_uppercase();

        if method == "CONNECT" {
            let (host, port) = split_host_port(&target)
                .ok_or_else(|| ProxyError::ParseError("malformed CONNECT target".into()))?;
            return Ok(ParsedRequest {
                method,
                target,
                version,
                headers: BTreeMap::new(),
                body: Vec::new(),
                dest_host: host.to_lowercase(),
                dest_port: port,
                is_connect: true,
            });
        }

        let mut headers = BTreeMap::new();
        loop {
            let line = buf.read_line()?;
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }

        let (dest_host, dest_port) = resolve_destination(&target, &headers)?;

        let body = read_body(&mut buf, &headers)?;

        Ok(ParsedRequest {
            method,
            target,
            version,
            headers,
            body,
            dest_host,
            dest_port,
            is_connect: false,
        })
    }

    /// serialize this request for the upstream connection: origin-form
    /// target when the original was absolute-form, `Capitalized-Name`
    /// headers, then the body verbatim.
    pub fn serialize_for_upstream(&self) -> Vec<u8> {
        let target = rewrite_target(&self.target);
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.method, target, self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", capitalize_header(name), value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn split_request_line(line: &str) -> Result<(String, String, String), ProxyError> {
    let first = line
        .find(' ')
        .ok_or_else(|| ProxyError::ParseError("malformed request line".into()))?;
    let rest = &line[first + 1..];
    let second = rest
        .find(' ')
        .ok_or_else(|| ProxyError::ParseError("malformed request line".into()))?;
    let method = &line[..first];
    let target = &rest[..second];
    let version = &rest[second + 1..];
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ProxyError::ParseError("malformed request line".into()));
    }
    Ok((method.to_string(), target.to_string(), version.to_string()))
}

fn split_host_port(value: &str) -> Option<(String, u16)> {
    let idx = value.rfind(':')?;
    let host = &value[..idx];
    let port_str = &value[idx + 1..];
    if host.is_empty() {
        return None;
    }
    let port: u16 = port_str.parse().ok()?;
    Some((host.to_string(), port))
}

fn resolve_destination(
    target: &str,
    headers: &BTreeMap<String, String>,
) -> Result<(String, u16), ProxyError> {
    if let Some(rest) = target.strip_prefix("http://") {
        return Ok(resolve_absolute(rest, 80));
    }
    if let Some(rest) = target.strip_prefix("https://") {
        return Ok(resolve_absolute(rest, 443));
    }

    let host_header = headers
        .get("host")
        .ok_or_else(|| ProxyError::ParseError("missing Host header".into()))?;

    match split_host_port(host_header) {
        Some((host, port)) => Ok((host.to_lowercase(), port)),
        None => Ok((host_header.to_lowercase(), 80)),
    }
}

fn resolve_absolute(authority_and_path: &str, default_port: u16) -> (String, u16) {
    let authority_end = authority_and_path
        .find(['/', '?'])
        .unwrap_or(authority_and_path.len());
    let authority = &authority_and_path[..authority_end];
    match authority.rfind(':') {
        Some(idx) => {
            let host = &authority[..idx];
            let port = authority[idx + 1..].parse().unwrap_or(default_port);
            (host.to_lowercase(), port)
        }
        None => (authority.to_lowercase(), default_port),
    }
}

/// origin-form rewrite of an absolute-form target: `path?query`, path
/// defaults to `/` when empty. Origin-form targets pass through
/// unchanged.
fn rewrite_target(target: &str) -> String {
    let after_scheme = if let Some(rest) = target.strip_prefix("http://") {
        rest
    } else if let Some(rest) = target.strip_prefix("https://") {
        rest
    } else {
        return target.to_string();
    };

    let path_start = after_scheme.find(['/', '?']).unwrap_or(after_scheme.len());
    let path_and_query = &after_scheme[path_start..];
    if path_and_query.is_empty() {
        "/".to_string()
    } else if path_and_query.starts_with('?') {
        format!("/{path_and_query}")
    } else {
        path_and_query.to_string()
    }
}

fn read_body<R: Read>(
    buf: &mut LineReader<R>,
    headers: &BTreeMap<String, String>,
) -> Result<Vec<u8>, ProxyError> {
    let Some(raw_len) = headers.get("content-length") else {
        return Ok(Vec::new());
    };
    let len: u64 = raw_len
        .trim()
        .parse()
        .map_err(|_| ProxyError::ParseError("invalid content-length".into()))?;
    if len > MAX_BODY_BYTES {
        return Err(ProxyError::ParseError("content-length too large".into()));
    }
    let mut body = vec![0u8; len as usize];
    buf.read_exact(&mut body)
        .map_err(|e| ProxyError::ParseError(format!("short body: {e}")))?;
    Ok(body)
}

/// splits a header name on `-`, upper-cases the first byte of each
/// segment and lower-cases the rest, e.g. `content-type` becomes
/// `Content-Type`.
fn capitalize_header(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// a small line-oriented reader over an arbitrary `Read`, byte-at-a-
/// time but buffered in chunks, so that `read_exact` for the body can
/// resume cleanly from wherever line reading left off.
struct LineReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> LineReader<R> {
    fn new(inner: R) -> Self {
        LineReader {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self) -> std::io::Result<bool> {
        let mut chunk = [0u8; 4096];
        let n = self.inner.read(&mut chunk)?;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }

    /// reads one line, trimming a trailing `\r\n` or `\n`. Returns a
    /// parse error on EOF before a newline is seen.
    fn read_line(&mut self) -> Result<String, ProxyError> {
        loop {
            if let Some(idx) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let line_end = self.pos + idx;
                let mut line = self.buf[self.pos..line_end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.pos = line_end + 1;
                return String::from_utf8(line)
                    .map_err(|_| ProxyError::ParseError("non-utf8 line".into()));
            }
            if !self.fill()? {
                return Err(ProxyError::ParseError("unexpected eof".into()));
            }
        }
    }

    fn read_exact(&mut self, out: &mut [u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < out.len() {
            let available = self.buf.len() - self.pos;
            if available == 0 {
                if !self.fill()? {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "eof while reading body",
                    ));
                }
                continue;
            }
            let take = available.min(out.len() - written);
            out[written..written + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            written += take;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &str) -> Result<ParsedRequest, ProxyError> {
        let mut cursor = Cursor::new(input.as_bytes().to_vec());
        ParsedRequest::parse(&mut cursor)
    }

    #[test]
    fn parses_absolute_form_get_with_query() {
        let req = parse("GET http://example.test/a?b=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "http://example.test/a?b=1");
        assert_eq!(req.dest_host, "example.test");
        assert_eq!(req.dest_port, 80);
        assert!(req.body.is_empty());
    }

    #[test]
    fn resolves_destination_from_host_header_for_origin_form() {
        let req = parse("GET /a?b=1 HTTP/1.1\r\nHost: example.test:8080\r\n\r\n").unwrap();
        assert_eq!(req.dest_host, "example.test");
        assert_eq!(req.dest_port, 8080);
    }

    #[test]
    fn missing_host_header_on_origin_form_is_a_parse_failure() {
        assert!(parse("GET /a HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn connect_short_circuits_before_headers() {
        let req = parse("CONNECT api.test:443 HTTP/1.1\r\n").unwrap();
        assert!(req.is_connect);
        assert_eq!(req.dest_host, "api.test");
        assert_eq!(req.dest_port, 443);
        assert!(req.headers.is_empty());
    }

    #[test]
    fn malformed_connect_target_fails() {
        assert!(parse("CONNECT api.test HTTP/1.1\r\n").is_err());
        assert!(parse("CONNECT api.test:notaport HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn headers_without_colon_are_ignored_not_fatal() {
        let req = parse("GET /a HTTP/1.1\r\nHost: x\r\nnotaheader\r\n\r\n").unwrap();
        assert_eq!(req.header("host"), Some("x"));
    }

    #[test]
    fn duplicate_headers_last_write_wins() {
        let req = parse("GET /a HTTP/1.1\r\nHost: x\r\nHost: y\r\n\r\n").unwrap();
        assert_eq!(req.header("host"), Some("y"));
    }

    #[test]
    fn body_read_exactly_content_length_bytes() {
        let req = parse("POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc").unwrap();
        assert_eq!(req.body, b"abc");
    }

    #[test]
    fn content_length_over_cap_fails() {
        let body_len = MAX_BODY_BYTES + 1;
        let text = format!("POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: {body_len}\r\n\r\n");
        assert!(parse(&text).is_err());
    }

    #[test]
    fn invalid_content_length_fails() {
        let text = "POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: -1\r\n\r\n";
        assert!(parse(text).is_err());
    }

    #[test]
    fn fewer_than_three_request_line_parts_fails() {
        assert!(parse("GET /a\r\n\r\n").is_err());
    }

    #[test]
    fn serialize_rewrites_absolute_form_to_origin_form() {
        let req = parse("GET http://example.test/a?b=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .unwrap();
        let out = String::from_utf8(req.serialize_for_upstream()).unwrap();
        assert!(out.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
        assert!(out.contains("Host: example.test\r\n"));
    }

    #[test]
    fn serialize_preserves_origin_form_target_verbatim() {
        let req = parse("GET /a?b=1 HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
        let out = String::from_utf8(req.serialize_for_upstream()).unwrap();
        assert!(out.starts_with("GET /a?b=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn capitalize_header_splits_on_dash() {
        assert_eq!(capitalize_header("content-type"), "Content-Type");
        assert_eq!(capitalize_header("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(capitalize_header("HOST"), "Host");
    }

    #[test]
    fn absolute_form_with_no_path_defaults_to_slash() {
        let req = parse("GET http://example.test HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
        let out = String::from_utf8(req.serialize_for_upstream()).unwrap();
        assert!(out.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn absolute_form_with_query_but_no_path_keeps_the_query() {
        let req = parse("GET http://example.test?b=1 HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .unwrap();
        let out = String::from_utf8(req.serialize_for_upstream()).unwrap();
        assert!(out.starts_with("GET /?b=1 HTTP/1.1\r\n"));
        assert!(!out.starts_with("GET / HTTP/1.1\r\n"));
    }
}
