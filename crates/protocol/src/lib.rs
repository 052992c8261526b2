//! Wire format for resumable file transfers over plain HTTP sockets.
//!
//! The exchange is a single HTTP/1.0-style request/response per
//! connection. The sender announces which transfer it is continuing
//! (`uniqueId`) and how many bytes it believes the receiver already holds
//! (`currentOffset`); the body is either raw or chunked.
//!
//! # Wire format
//!
//! ```text
//! REQUEST (sender -> receiver):
//!   POST <path> HTTP/1.1\r\n
//!   uniqueId: <transfer id>\r\n
//!   currentOffset: <decimal byte offset>\r\n
//!   Transfer-Encoding: chunked\r\n        (or Content-Length: <n>)
//!   \r\n
//!   <hex size>\r\n<payload>\r\n ... 0\r\n\r\n
//!
//! RESPONSE (receiver -> sender):
//!   HTTP/1.0 <code> <reason>\r\n
//!   Connection: close\r\n
//!   Server: <name>\r\n
//!   currentOffset: <len>\r\n              (205 only)
//!   \r\n
//! ```

pub mod auth;
pub mod chunked;
pub mod head;
pub mod headers;
pub mod status;

pub use auth::Credentials;
pub use chunked::{ChunkDecoder, encode_chunked, write_chunk, write_last_chunk};
pub use head::{Line, RequestHead, ResponseHead, read_line, read_request_head, read_response_head};
pub use headers::Headers;

/// Maximum length of a request, status, header or chunk-size line.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Maximum number of header lines accepted in one head.
pub const MAX_HEADERS: usize = 100;

/// Largest chunk the decoder will allocate for (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Errors produced while reading or writing the wire format.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Malformed chunk metadata or a payload that does not match its
    /// declared size. Never worth retrying.
    #[error("framing error: {0}")]
    Framing(String),

    /// Malformed request/response head or header values.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Returns `true` when the error came from the transport rather than
    /// from the bytes it carried.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
