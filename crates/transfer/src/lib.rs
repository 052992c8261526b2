//! Resumable file transfer over plain HTTP sockets.
//!
//! The receiver appends each request body to a per-transfer cache file
//! whose length is the durable progress marker. When a sender's declared
//! offset disagrees with that length the receiver answers `205 Reset` with
//! the authoritative offset instead of touching the file. The sender
//! retries connectivity failures with geometric backoff and parks its
//! state in a [`BoundedCache`](handoff_cache::BoundedCache) so a later call
//! for the same transfer id resumes instead of restarting.

mod body;
mod error;
mod locks;
mod receiver;
mod retry;
mod sender;
mod server;
mod spool;
mod store;
mod validation;

pub use body::{CachedBody, ConsumingReader};
pub use error::{InvalidTransferId, ReceiveError, SendError, StorageError};
pub use locks::{TransferGuard, TransferLocks};
pub use receiver::{BodyReader, ReceiveOutcome, Receiver, ReceiverConfig};
pub use retry::{Backoff, RetryPolicy};
pub use sender::{Response, Sender, SenderCache, SenderConfig};
pub use server::ReceiverServer;
pub use spool::CompressedSpool;
pub use store::CacheStore;
pub use validation::validate_transfer_id;

use std::time::Duration;

/// Socket and file copy buffer size (64 KiB).
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Default chunk size for chunked request bodies (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Timeout for the TCP connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle timeout for a single socket read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on reset negotiations within one `send_file` call.
pub const MAX_RESETS_PER_SEND: u32 = 32;

/// Largest response body the sender will buffer (1 MiB).
pub const MAX_RESPONSE_BODY: u64 = 1024 * 1024;

/// Value of the `Server` response header.
pub const SERVER_NAME: &str = concat!("handoff/", env!("CARGO_PKG_VERSION"));

/// Extension of per-transfer cache files.
pub const CACHE_FILE_EXTENSION: &str = "part";

/// Extension of sealed, completed cache files.
pub const COMPLETED_FILE_EXTENSION: &str = "done";
