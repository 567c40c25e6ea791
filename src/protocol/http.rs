//! HTTP/1.1 wire format
//!
//! Incremental parsing of requests (server side) and responses (client side)
//! over a growing receive buffer, plus the reply heads and chunked
//! transfer-encoding the server writes. Every parser returns `Ok(None)` when
//! the buffer does not yet hold a complete unit.

use std::collections::HashMap;
use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;

/// Terminator of the header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Terminal chunk of a chunked body
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Size of a single client read burst
pub const READ_BURST: usize = 4096;

/// Body of the server's 404 reply
pub const NOT_FOUND_BODY: &str = "404 - File not found.";

/// A parsed HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Request method as sent (`GET`, `POST`, ...)
    pub method: String,
    /// Path without the query string
    pub path: String,
    /// Percent-decoded query parameters
    pub query: HashMap<String, String>,
    /// Headers with lower-cased names
    pub headers: HashMap<String, String>,
    /// Request body (`Content-Length` bytes)
    pub body: Bytes,
}

impl Request {
    /// Look up a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body as UTF-8 text (lossy)
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A client-side HTTP response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// `false` when the connection failed or the response was cut off
    pub success: bool,
    pub status: u16,
    /// Headers with lower-cased names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    /// A failed response carrying whatever status was seen
    pub fn failed(status: u16) -> Self {
        Self {
            success: false,
            status,
            ..Default::default()
        }
    }

    /// Look up a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// How a response body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    ContentLength(usize),
    Chunked,
    UntilClose,
}

impl ResponseHead {
    /// Body delimiting mode announced by the headers
    pub fn body_kind(&self) -> Result<BodyKind, ProtocolError> {
        if self
            .header("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            return Ok(BodyKind::Chunked);
        }
        match self.header("content-length") {
            Some(len) => len
                .trim()
                .parse()
                .map(BodyKind::ContentLength)
                .map_err(|_| {
                    ProtocolError::MalformedResponse(format!("bad content-length: {}", len))
                }),
            None => Ok(BodyKind::UntilClose),
        }
    }
}

/// Position just past the `\r\n\r\n` header terminator
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Parse `Name: value` lines into a map with lower-cased names
///
/// Repeated headers are joined with `", "`.
fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, String>, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("header without colon: {}", line))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    Ok(headers)
}

/// Split a request target into its path and decoded query parameters
pub fn split_target(target: &str) -> (String, HashMap<String, String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), HashMap::new()),
    }
}

/// Decode an `a=1&b=two%20words` query string
pub fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// URL-encode form fields as `application/x-www-form-urlencoded`
pub fn encode_form<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Parse one request from the front of `buf`
///
/// Returns the request and the number of bytes it occupied, so pipelined
/// requests can be parsed one after another.
pub fn parse_request(
    buf: &[u8],
    max_size: usize,
) -> Result<Option<(Request, usize)>, ProtocolError> {
    let Some(header_end) = find_header_end(buf) else {
        if buf.len() > max_size {
            return Err(ProtocolError::RequestTooLarge {
                size: buf.len(),
                max: max_size,
            });
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..header_end - HEADER_TERMINATOR.len()])
        .map_err(|_| ProtocolError::MalformedRequest("header block is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::MalformedRequest(format!(
            "bad request line: {}",
            request_line
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::MalformedRequest(format!(
            "bad version: {}",
            version
        )));
    }

    let headers = parse_headers(lines).map_err(ProtocolError::MalformedRequest)?;
    if headers.contains_key("transfer-encoding") {
        return Err(ProtocolError::MalformedRequest(
            "chunked request bodies are not supported".into(),
        ));
    }

    let content_length = match headers.get("content-length") {
        Some(len) => len
            .parse::<usize>()
            .map_err(|_| ProtocolError::MalformedRequest(format!("bad content-length: {}", len)))?,
        None => 0,
    };

    let total = match header_end.checked_add(content_length) {
        Some(total) if content_length <= max_size && total <= max_size => total,
        _ => {
            return Err(ProtocolError::RequestTooLarge {
                size: header_end.saturating_add(content_length),
                max: max_size,
            })
        }
    };
    if buf.len() < total {
        return Ok(None);
    }

    let (path, query) = split_target(target);
    trace!(method, path = %path, body = content_length, "Parsed request");

    Ok(Some((
        Request {
            method: method.to_string(),
            path,
            query,
            headers,
            body: Bytes::copy_from_slice(&buf[header_end..total]),
        },
        total,
    )))
}

/// Parse a response status line and headers from the front of `buf`
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, ProtocolError> {
    let Some(header_end) = find_header_end(buf) else {
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..header_end - HEADER_TERMINATOR.len()])
        .map_err(|_| ProtocolError::MalformedResponse("header block is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProtocolError::MalformedResponse(format!(
            "bad status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            ProtocolError::MalformedResponse(format!("bad status line: {}", status_line))
        })?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = parse_headers(lines).map_err(ProtocolError::MalformedResponse)?;
    Ok(Some((
        ResponseHead {
            status,
            reason,
            headers,
        },
        header_end,
    )))
}

/// Decode a complete chunked body from the front of `buf`
///
/// Returns the payload and the number of bytes consumed (including any
/// trailer section), or `None` if the terminal chunk has not arrived.
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, ProtocolError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_len) = find_crlf(&buf[pos..]) else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buf[pos..pos + line_len])
            .map_err(|_| ProtocolError::MalformedResponse("chunk size is not UTF-8".into()))?;
        let size_text = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| {
            ProtocolError::MalformedResponse(format!("bad chunk size: {}", size_text))
        })?;
        pos += line_len + 2;

        if size == 0 {
            // Optional trailer lines, then the closing blank line
            loop {
                let Some(trailer_len) = find_crlf(&buf[pos..]) else {
                    return Ok(None);
                };
                pos += trailer_len + 2;
                if trailer_len == 0 {
                    return Ok(Some((body, pos)));
                }
            }
        }

        let Some(end) = pos.checked_add(size).and_then(|n| n.checked_add(2)) else {
            return Err(ProtocolError::MalformedResponse(format!(
                "chunk size out of range: {}",
                size_text
            )));
        };
        if buf.len() < end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;
        if &buf[pos..pos + 2] != b"\r\n" {
            return Err(ProtocolError::MalformedResponse(
                "chunk not terminated by CRLF".into(),
            ));
        }
        pos += 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

/// Read one complete response from a blocking reader
///
/// Reads in [`READ_BURST`] sized bursts. A read error, or end of stream
/// before the response is complete, yields `success = false`.
pub fn read_response<R: Read>(reader: &mut R) -> Response {
    let mut buf: Vec<u8> = Vec::new();
    let mut burst = [0u8; READ_BURST];

    let mut fill = |buf: &mut Vec<u8>| -> io::Result<usize> {
        let n = reader.read(&mut burst)?;
        buf.extend_from_slice(&burst[..n]);
        Ok(n)
    };

    let (head, body_start) = loop {
        match parse_response_head(&buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "Malformed response head");
                return Response::failed(0);
            }
        }
        match fill(&mut buf) {
            Ok(0) | Err(_) => return Response::failed(0),
            Ok(_) => {}
        }
    };

    let kind = match head.body_kind() {
        Ok(kind) => kind,
        Err(e) => {
            debug!(error = %e, "Malformed response headers");
            return Response::failed(head.status);
        }
    };

    let body = loop {
        let available = &buf[body_start..];
        match kind {
            BodyKind::ContentLength(len) if available.len() >= len => {
                break available[..len].to_vec();
            }
            BodyKind::Chunked => match decode_chunked(available) {
                Ok(Some((body, _))) => break body,
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "Malformed chunked body");
                    return Response::failed(head.status);
                }
            },
            _ => {}
        }

        match fill(&mut buf) {
            Ok(0) if kind == BodyKind::UntilClose => break buf[body_start..].to_vec(),
            Ok(0) | Err(_) => return Response::failed(head.status),
            Ok(_) => {}
        }
    };

    Response {
        success: true,
        status: head.status,
        headers: head.headers,
        body,
    }
}

/// Build a request with the given headers and optional form body
pub fn build_request(
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        request.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Standard reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "OK",
    }
}

/// Head of a chunked server reply
pub fn response_head(status: u16, mimetype: Option<&str>) -> String {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    head.push_str("Connection: Keep-Alive\r\n");
    if let Some(mimetype) = mimetype.filter(|m| !m.is_empty()) {
        head.push_str(&format!("Content-Type: {}\r\n", mimetype));
    }
    head.push_str("Transfer-Encoding: chunked\r\n\r\n");
    head
}

/// Encode one chunk; an empty slice yields the terminal chunk
pub fn encode_chunk(data: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(data.len() + 12);
    chunk.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    chunk.put_slice(data);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// A complete chunked reply: head, body split into `chunk_size` chunks, and
/// the terminal chunk
pub fn chunked_reply(status: u16, mimetype: Option<&str>, body: &[u8], chunk_size: usize) -> Bytes {
    let mut reply = BytesMut::new();
    reply.put_slice(response_head(status, mimetype).as_bytes());
    for chunk in body.chunks(chunk_size.max(1)) {
        reply.put_slice(&encode_chunk(chunk));
    }
    reply.put_slice(LAST_CHUNK);
    reply.freeze()
}

/// The server's 404 reply
pub fn not_found_reply() -> Bytes {
    chunked_reply(404, None, NOT_FOUND_BODY.as_bytes(), NOT_FOUND_BODY.len())
}

/// Content type for a static file path, by extension
pub fn mimetype_for(path: &str) -> Option<&'static str> {
    let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let mimetype = match extension.as_str() {
        "html" | "htm" => "text/html",
        "js" => "text/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(mimetype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple_request() {
        let raw = b"GET /ping?name=a%20b&x=1 HTTP/1.1\r\nHost: localhost\r\nX-Custom:  value \r\n\r\n";
        let (request, consumed) = parse_request(raw, 1024).unwrap().unwrap();

        assert_eq!(consumed, raw.len());
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/ping");
        assert_eq!(request.query.get("name").map(String::as_str), Some("a b"));
        assert_eq!(request.query.get("x").map(String::as_str), Some("1"));
        assert_eq!(request.header("HOST"), Some("localhost"));
        assert_eq!(request.header("x-custom"), Some("value"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_incomplete_request() {
        assert_eq!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n", 1024).unwrap(), None);

        let raw = b"POST /form HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert_eq!(parse_request(raw, 1024).unwrap(), None);
    }

    #[test]
    fn test_parse_pipelined_requests() {
        let raw = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n";
        let (first, used) = parse_request(raw, 1024).unwrap().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(&first.body[..], b"abc");

        let (second, rest) = parse_request(&raw[used..], 1024).unwrap().unwrap();
        assert_eq!(second.path, "/b");
        assert_eq!(used + rest, raw.len());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request(b"NONSENSE\r\n\r\n", 1024).is_err());
        assert!(parse_request(b"GET / FTP/1.0\r\n\r\n", 1024).is_err());
        assert!(parse_request(b"GET / HTTP/1.1\r\nno colon here\r\n\r\n", 1024).is_err());
    }

    #[test]
    fn test_parse_request_too_large() {
        let raw = vec![b'a'; 2048];
        assert!(matches!(
            parse_request(&raw, 1024),
            Err(ProtocolError::RequestTooLarge { .. })
        ));

        let raw = b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n";
        assert!(matches!(
            parse_request(raw, 1024),
            Err(ProtocolError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_parse_request_huge_content_length() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(
            parse_request(raw, 1 << 20),
            Err(ProtocolError::RequestTooLarge { .. })
        ));
        assert!(matches!(
            parse_request(raw, usize::MAX),
            Err(ProtocolError::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_chunked() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (body, used) = decode_chunked(raw).unwrap().unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_decode_chunked_extensions_and_trailers() {
        let raw = b"4;name=value\r\nWiki\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let (body, used) = decode_chunked(raw).unwrap().unwrap();
        assert_eq!(body, b"Wiki");
        assert_eq!(used, raw.len());
    }

    #[test]
    fn test_decode_chunked_incomplete() {
        assert_eq!(decode_chunked(b"4\r\nWi").unwrap(), None);
        assert_eq!(decode_chunked(b"4\r\nWiki\r\n0\r\n").unwrap(), None);
        assert!(decode_chunked(b"zz\r\n").is_err());
    }

    #[test]
    fn test_decode_chunked_huge_size() {
        assert!(matches!(
            decode_chunked(b"ffffffffffffffff\r\nabc"),
            Err(ProtocolError::MalformedResponse(_))
        ));

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        let response = read_response(&mut &raw[..]);
        assert!(!response.success);
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_read_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello";
        let response = read_response(&mut &raw[..]);
        assert!(response.success);
        assert_eq!(response.status, 200);
        assert_eq!(response.header("x-a"), Some("b"));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_read_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let response = read_response(&mut &raw[..]);
        assert!(response.success);
        assert_eq!(response.text(), "Wikipedia");
    }

    #[test]
    fn test_read_response_until_close() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nstreamed";
        let response = read_response(&mut &raw[..]);
        assert!(response.success);
        assert_eq!(response.body, b"streamed");
    }

    #[test]
    fn test_read_response_cut_off() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        let response = read_response(&mut &raw[..]);
        assert!(!response.success);
        assert_eq!(response.status, 200);

        let response = read_response(&mut &b"HTTP/1.1 200"[..]);
        assert!(!response.success);
    }

    #[test]
    fn test_build_request() {
        let headers = vec![("Host".to_string(), "example.com".to_string())];
        let request = build_request("POST", "/submit", &headers, b"a=1");
        assert_eq!(
            String::from_utf8(request).unwrap(),
            "POST /submit HTTP/1.1\r\nHost: example.com\r\n\
             Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 3\r\n\r\na=1"
        );
    }

    #[test]
    fn test_chunked_reply() {
        let reply = chunked_reply(200, Some("text/plain"), b"pong", 1024);
        assert_eq!(
            &reply[..],
            &b"HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nContent-Type: text/plain\r\n\
               Transfer-Encoding: chunked\r\n\r\n4\r\npong\r\n0\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_encode_chunk_hex_size() {
        let data = vec![b'x'; 255];
        let chunk = encode_chunk(&data);
        assert!(chunk.starts_with(b"ff\r\n"));
        assert_eq!(&encode_chunk(b"")[..], b"0\r\n\r\n");
    }

    #[test]
    fn test_form_round_trip() {
        let encoded = encode_form([("name", "a b&c"), ("x", "1")]);
        assert_eq!(encoded, "name=a+b%26c&x=1");
        let decoded = parse_query(&encoded);
        assert_eq!(decoded.get("name").map(String::as_str), Some("a b&c"));
    }

    #[test]
    fn test_mimetypes() {
        assert_eq!(mimetype_for("/index.html"), Some("text/html"));
        assert_eq!(mimetype_for("/app.JS"), Some("text/javascript"));
        assert_eq!(mimetype_for("/style.css"), Some("text/css"));
        assert_eq!(mimetype_for("/noext"), None);
        assert_eq!(mimetype_for("/file.bin"), None);
    }
}
