//! Request and response heads: line reading, parsing and rendering.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::headers::{self, Headers};
use crate::status;
use crate::{MAX_HEADERS, MAX_LINE_LEN, WireError};

/// Result of reading one CRLF/LF-terminated line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A full line with its terminator stripped.
    Complete(Vec<u8>),
    /// The stream ended after these bytes, before any terminator.
    Partial(Vec<u8>),
    /// The stream ended before any byte was read.
    Eof,
    /// No terminator within `limit` bytes.
    TooLong,
}

/// Reads bytes up to and including LF, stripping the CR/LF pair.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(limit as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > limit {
            return Ok(Line::TooLong);
        }
        return Ok(Line::Partial(buf));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > limit {
        return Ok(Line::TooLong);
    }
    Ok(Line::Complete(buf))
}

/// Reads a head line; anything short of a complete line is an error.
async fn read_head_line<R>(reader: &mut R) -> Result<String, WireError>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader, MAX_LINE_LEN).await? {
        Line::Complete(bytes) => String::from_utf8(bytes)
            .map_err(|_| WireError::Protocol("head line is not valid UTF-8".into())),
        Line::Partial(_) | Line::Eof => Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside message head",
        ))),
        Line::TooLong => Err(WireError::Protocol(format!(
            "head line exceeds {MAX_LINE_LEN} bytes"
        ))),
    }
}

/// Reads header lines until the empty line that ends the head.
async fn read_headers<R>(reader: &mut R) -> Result<Headers, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_head_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() == MAX_HEADERS {
            return Err(WireError::Protocol(format!(
                "more than {MAX_HEADERS} header lines"
            )));
        }
        headers.parse_line(&line)?;
    }
}

// ---------------------------------------------------------------------------
// Request head
// ---------------------------------------------------------------------------

/// Request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl RequestHead {
    /// A `POST <target> HTTP/1.1` head with no headers.
    pub fn post(target: impl Into<String>) -> Self {
        Self {
            method: "POST".into(),
            target: target.into(),
            version: "HTTP/1.1".into(),
            headers: Headers::new(),
        }
    }

    /// The transfer id, if the sender supplied one.
    pub fn unique_id(&self) -> Option<&str> {
        self.headers
            .get(headers::UNIQUE_ID)
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads a request line and its headers.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_head_line(reader).await?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(WireError::Protocol(format!("malformed request line: {line:?}")));
    };
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();
    let (method, target) = (method.to_string(), target.to_string());
    Ok(RequestHead {
        method,
        target,
        version,
        headers: read_headers(reader).await?,
    })
}

// ---------------------------------------------------------------------------
// Response head
// ---------------------------------------------------------------------------

/// Status line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// A response carrying the fixed `Connection` and `Server` headers.
    pub fn new(status: u16, server: &str) -> Self {
        let mut headers = Headers::new();
        headers.append(headers::CONNECTION, "close");
        headers.append(headers::SERVER, server);
        Self {
            status,
            reason: status::reason_phrase(status).to_string(),
            headers,
        }
    }

    /// The resume offset carried by a 205 response.
    pub fn resume_offset(&self) -> Result<Option<u64>, WireError> {
        self.headers.current_offset()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(status::status_line(self.status).as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads a status line and its headers.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_head_line(reader).await?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(WireError::Protocol(format!("malformed status line: {line:?}")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| WireError::Protocol(format!("malformed status line: {line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_string();
    Ok(ResponseHead {
        status,
        reason,
        headers: read_headers(reader).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_strips_crlf_and_lf() {
        let mut input: &[u8] = b"first\r\nsecond\nthird";
        assert_eq!(
            read_line(&mut input, 64).await.unwrap(),
            Line::Complete(b"first".to_vec())
        );
        assert_eq!(
            read_line(&mut input, 64).await.unwrap(),
            Line::Complete(b"second".to_vec())
        );
        assert_eq!(
            read_line(&mut input, 64).await.unwrap(),
            Line::Partial(b"third".to_vec())
        );
        assert_eq!(read_line(&mut input, 64).await.unwrap(), Line::Eof);
    }

    #[tokio::test]
    async fn read_line_limit() {
        let mut input: &[u8] = b"0123456789abcdef\r\n";
        assert_eq!(read_line(&mut input, 8).await.unwrap(), Line::TooLong);
    }

    #[tokio::test]
    async fn parses_request_head() {
        let raw = b"POST /upload HTTP/1.1\r\nuniqueId: t-1\r\ncurrentOffset: 42\r\n\r\nBODY";
        let mut input: &[u8] = raw;
        let head = read_request_head(&mut input).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/upload");
        assert_eq!(head.unique_id(), Some("t-1"));
        assert_eq!(head.headers.current_offset().unwrap(), Some(42));
        assert_eq!(input, b"BODY");
    }

    #[tokio::test]
    async fn request_head_roundtrip() {
        let mut head = RequestHead::post("/in");
        head.headers.append(headers::UNIQUE_ID, "abc");
        let bytes = head.to_bytes();
        let mut input: &[u8] = &bytes;
        assert_eq!(read_request_head(&mut input).await.unwrap(), head);
    }

    #[tokio::test]
    async fn blank_unique_id_is_absent() {
        let mut input: &[u8] = b"POST / HTTP/1.1\r\nuniqueId:   \r\n\r\n";
        let head = read_request_head(&mut input).await.unwrap();
        assert_eq!(head.unique_id(), None);
    }

    #[tokio::test]
    async fn truncated_head_is_connectivity() {
        let mut input: &[u8] = b"POST / HTTP/1.1\r\nuniqueId: a\r\n";
        let err = read_request_head(&mut input).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn garbage_request_line_is_protocol_error() {
        let mut input: &[u8] = b"HELLO\r\n\r\n";
        let err = read_request_head(&mut input).await.unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[tokio::test]
    async fn reset_response_carries_offset() {
        let mut head = ResponseHead::new(status::RESET, "handoff");
        head.headers.append(headers::CURRENT_OFFSET, "5000");
        let bytes = head.to_bytes();
        assert!(bytes.starts_with(b"HTTP/1.0 205 Reset\r\nConnection: close\r\n"));

        let mut input: &[u8] = &bytes;
        let parsed = read_response_head(&mut input).await.unwrap();
        assert_eq!(parsed.status, 205);
        assert_eq!(parsed.reason, "Reset");
        assert_eq!(parsed.resume_offset().unwrap(), Some(5000));
    }
}
