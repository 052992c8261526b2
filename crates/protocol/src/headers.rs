//! Header names and an ordered, case-insensitive header map.

use crate::WireError;

/// Transfer id header (required on every request).
pub const UNIQUE_ID: &str = "uniqueId";

/// Sender's belief of persisted progress; also the resume offset on 205.
pub const CURRENT_OFFSET: &str = "currentOffset";

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const ACCEPT_CHARSET: &str = "Accept-Charset";
pub const AUTHORIZATION: &str = "Authorization";
pub const CONNECTION: &str = "Connection";
pub const SERVER: &str = "Server";
pub const HOST: &str = "Host";

/// Header map preserving insertion order.
///
/// Lookups ignore ASCII case; the first matching entry wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one `Name: value` line, splitting on the first colon.
    pub fn parse_line(&mut self, line: &str) -> Result<(), WireError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::Protocol(format!("malformed header line: {line:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(WireError::Protocol(format!("empty header name: {line:?}")));
        }
        self.append(name, value.trim());
        Ok(())
    }

    /// Adds a header without replacing existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a header, replacing every existing entry with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.get(TRANSFER_ENCODING)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Whether the body is gzip-compressed.
    pub fn is_gzip(&self) -> bool {
        self.get(CONTENT_ENCODING)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
    }

    /// Parses `Content-Length`, if present.
    pub fn content_length(&self) -> Result<Option<u64>, WireError> {
        self.get(CONTENT_LENGTH)
            .map(|v| parse_u64(CONTENT_LENGTH, v))
            .transpose()
    }

    /// Parses `currentOffset`, if present.
    pub fn current_offset(&self) -> Result<Option<u64>, WireError> {
        self.get(CURRENT_OFFSET)
            .map(|v| parse_u64(CURRENT_OFFSET, v))
            .transpose()
    }

    /// Renders every header as `Name: value\r\n`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn parse_u64(name: &str, value: &str) -> Result<u64, WireError> {
    value
        .trim()
        .parse()
        .map_err(|_| WireError::Protocol(format!("invalid {name} header: {value:?}")))
}
