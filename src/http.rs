//! HTTP/1.1 wire codec shared by the client-facing and upstream sides of the
//! dispatcher.
//!
//! The parser is deliberately narrow: one message per connection, a 3-token
//! request line, lowercased header names, bounded header and body sizes, and
//! length- or chunked-framed bodies only. Anything outside that shape is a
//! decode error, which the dispatcher maps to `400` (client side) or a
//! transport failure (upstream side).

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest accepted request/status/header line, in bytes.
pub const MAX_LINE_BYTES: usize = 8192;
/// Maximum number of headers read from one message.
pub const MAX_HEADERS: usize = 100;
/// Hard cap for any request or response body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed")]
    Closed,
    #[error("malformed request line")]
    RequestLine,
    #[error("malformed status line")]
    StatusLine,
    #[error("header line too long")]
    LineTooLong,
    #[error("body too large")]
    BodyTooLarge,
    #[error("malformed chunk framing")]
    Chunk,
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Names lowercased on ingest; later values overwrite earlier ones.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A bodyless synthetic response (`400`, `501`, `502`, ...).
    pub fn empty(status: u16, reason: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    /// Serializes the response with a recomputed `Content-Length`. Any framing
    /// headers carried over from the upstream parse are dropped so the body
    /// length on the wire always matches the advertised length.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name == "content-length" || name == "transfer-encoding" {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Reads one line terminated by `\n`, stripping the terminator and an
/// optional preceding `\r`.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE_BYTES {
            return Err(WireError::LineTooLong);
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Reads the header section up to the blank line. Names are lowercased and
/// trimmed; a line without a colon is skipped silently. Stops quietly once
/// `MAX_HEADERS` headers have been collected.
pub async fn read_headers<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<HashMap<String, String>, WireError> {
    let mut headers = HashMap::new();

    while headers.len() < MAX_HEADERS {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    Ok(headers)
}

/// Reads a message body framed by `content-length` or chunked
/// `transfer-encoding`, bounded by `max_bytes`. A message with neither
/// framing header has no body.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    headers: &HashMap<String, String>,
    max_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    if let Some(raw_length) = headers.get("content-length") {
        if let Ok(length) = raw_length.trim().parse::<usize>() {
            if length > max_bytes {
                return Err(WireError::BodyTooLarge);
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            return Ok(body);
        }
    }

    let chunked = headers
        .get("transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        let mut body = Vec::new();
        loop {
            let size_line = read_line(reader).await?;
            let size = parse_chunk_size(&size_line).ok_or(WireError::Chunk)?;

            if size == 0 {
                // Trailer line, discarded.
                read_line(reader).await?;
                return Ok(body);
            }

            if body.len() + size > max_bytes {
                return Err(WireError::BodyTooLarge);
            }

            let offset = body.len();
            body.resize(offset + size, 0);
            reader.read_exact(&mut body[offset..]).await?;

            // CRLF after the chunk data.
            read_line(reader).await?;
        }
    }

    Ok(Vec::new())
}

/// Hexadecimal chunk size, tolerating a `;ext` suffix.
fn parse_chunk_size(line: &str) -> Option<usize> {
    let line = line.trim();
    let hex_end = line
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(line.len());
    if hex_end == 0 {
        return None;
    }
    usize::from_str_radix(&line[..hex_end], 16).ok()
}

/// Parses one full request: request line, headers, body.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<HttpRequest, WireError> {
    let request_line = read_line(reader).await?;
    let tokens: Vec<&str> = request_line.split(' ').collect();
    if tokens.len() != 3 || tokens.iter().any(|t| t.is_empty()) {
        return Err(WireError::RequestLine);
    }

    let method = tokens[0].to_string();
    let target = tokens[1].to_string();
    let version = tokens[2].to_string();

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers, MAX_BODY_BYTES).await?;

    Ok(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Parses one full response: status line, headers, body. An empty reason
/// phrase is accepted.
pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<HttpResponse, WireError> {
    let status_line = read_line(reader).await?;
    let mut tokens = status_line.splitn(3, ' ');
    let version = tokens.next().filter(|v| v.starts_with("HTTP/")).ok_or(WireError::StatusLine)?;
    let status = tokens
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or(WireError::StatusLine)?;
    let reason = tokens.next().unwrap_or("").to_string();

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers, MAX_BODY_BYTES).await?;

    Ok(HttpResponse {
        version: version.to_string(),
        status,
        reason,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_request(bytes: &[u8]) -> Result<HttpRequest, WireError> {
        let mut reader = bytes;
        read_request(&mut reader).await
    }

    async fn parse_response(bytes: &[u8]) -> Result<HttpResponse, WireError> {
        let mut reader = bytes;
        read_response(&mut reader).await
    }

    #[tokio::test]
    async fn test_simple_request() {
        let req = parse_request(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("example.com"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_request_line_must_have_three_tokens() {
        assert!(matches!(
            parse_request(b"GARBAGE\r\n\r\n").await,
            Err(WireError::RequestLine)
        ));
        assert!(matches!(
            parse_request(b"GET /a HTTP/1.1 extra\r\n\r\n").await,
            Err(WireError::RequestLine)
        ));
        assert!(matches!(
            parse_request(b"GET  HTTP/1.1\r\n\r\n").await,
            Err(WireError::RequestLine)
        ));
    }

    #[tokio::test]
    async fn test_header_names_lowercased_and_colonless_skipped() {
        let req = parse_request(
            b"GET / HTTP/1.1\r\nX-Custom-Header: Value\r\nthis line has no colon\r\nHOST: h\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.header("x-custom-header"), Some("Value"));
        assert_eq!(req.header("host"), Some("h"));
        assert_eq!(req.headers.len(), 2);
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let req = parse_request(b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(req.body, b"hello");
    }

    #[tokio::test]
    async fn test_truncated_body_is_closed() {
        assert!(matches!(
            parse_request(b"POST /p HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi").await,
            Err(WireError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_chunked_body_with_extension_and_trailer() {
        let raw = b"POST /p HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let req = parse_request(raw).await.unwrap();
        assert_eq!(req.body, b"Wikipedia");
    }

    #[tokio::test]
    async fn test_chunked_bad_size_line() {
        let raw = b"POST /p HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n\r\n";
        assert!(matches!(parse_request(raw).await, Err(WireError::Chunk)));
    }

    #[tokio::test]
    async fn test_body_cap_content_length() {
        let mut reader: &[u8] = b"irrelevant";
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "100".to_string());
        assert!(matches!(
            read_body(&mut reader, &headers, 50).await,
            Err(WireError::BodyTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_body_cap_chunked() {
        let mut reader: &[u8] = b"40\r\n0123456789012345678901234567890123456789012345678901234567890123\r\n0\r\n\r\n";
        let mut headers = HashMap::new();
        headers.insert("transfer-encoding".to_string(), "chunked".to_string());
        assert!(matches!(
            read_body(&mut reader, &headers, 32).await,
            Err(WireError::BodyTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_no_framing_header_means_no_body() {
        let mut reader: &[u8] = b"leftover";
        let headers = HashMap::new();
        let body = read_body(&mut reader, &headers, MAX_BODY_BYTES).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES + 1));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        assert!(matches!(
            parse_request(&raw).await,
            Err(WireError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn test_bare_lf_line_endings_accepted() {
        let req = parse_request(b"GET / HTTP/1.1\nHost: h\n\n").await.unwrap();
        assert_eq!(req.header("host"), Some("h"));
    }

    #[tokio::test]
    async fn test_response_parse() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok",
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn test_response_without_reason() {
        let resp = parse_response(b"HTTP/1.1 204\r\n\r\n").await.unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.reason, "");
    }

    #[tokio::test]
    async fn test_response_bad_status_line() {
        assert!(matches!(
            parse_response(b"ICY 200 OK\r\n\r\n").await,
            Err(WireError::StatusLine)
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 abc OK\r\n\r\n").await,
            Err(WireError::StatusLine)
        ));
    }

    #[test]
    fn test_serialized_content_length_matches_body() {
        let mut resp = HttpResponse::empty(200, "OK");
        resp.headers
            .insert("content-length".to_string(), "9999".to_string());
        resp.headers
            .insert("transfer-encoding".to_string(), "chunked".to_string());
        resp.headers
            .insert("content-type".to_string(), "text/html".to_string());
        resp.body = b"hello world".to_vec();

        let bytes = resp.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(!text.contains("9999"));
        assert!(!text.contains("chunked"));
        assert!(text.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn test_empty_response_serialization() {
        let bytes = HttpResponse::empty(400, "Bad Request").to_bytes();
        assert_eq!(
            bytes,
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size("1a"), Some(26));
        assert_eq!(parse_chunk_size("FF;name=value"), Some(255));
        assert_eq!(parse_chunk_size("0"), Some(0));
        assert_eq!(parse_chunk_size(""), None);
        assert_eq!(parse_chunk_size(";ext"), None);
    }
}
