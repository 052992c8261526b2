//! Inbound receiver: one request per connection, appended to a cache file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_protocol::headers::{self, Headers};
use handoff_protocol::{
    ChunkDecoder, Credentials, MAX_CHUNK_SIZE, RequestHead, ResponseHead, WireError,
    read_request_head, status,
};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::body::CachedBody;
use crate::error::{ReceiveError, StorageError};
use crate::locks::TransferLocks;
use crate::store::{CacheStore, existing_len};
use crate::{DEFAULT_IO_TIMEOUT, IO_BUFFER_SIZE, SERVER_NAME};

/// Most request bytes discarded after an early response.
const DRAIN_LIMIT: u64 = 4 * 1024 * 1024;

/// How long to keep discarding request bytes after an early response.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver settings.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Directory holding `<uniqueId>.part` cache files.
    pub cache_dir: PathBuf,
    /// Value of the `Server` response header.
    pub server_name: String,
    /// When set, only requests for exactly this path are accepted.
    pub path: Option<String>,
    /// When set, requests must carry matching basic-auth credentials.
    pub credentials: Option<Credentials>,
    /// Idle timeout for each socket read.
    pub read_timeout: Duration,
    /// Largest chunk accepted from a chunked body.
    pub max_chunk_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("handoff-cache"),
            server_name: SERVER_NAME.to_string(),
            path: None,
            credentials: None,
            read_timeout: DEFAULT_IO_TIMEOUT,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

/// Result of one receive cycle.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// The body was fully persisted.
    Completed(CachedBody),
    /// The sender's offset disagrees with the cache file; it must resume
    /// from `offset`.
    ResetRequired { offset: u64 },
    Failed(ReceiveError),
}

impl ReceiveOutcome {
    /// Status code sent back for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Completed(_) => status::OK,
            Self::ResetRequired { .. } => status::RESET,
            Self::Failed(err) => err.status_code(),
        }
    }
}

/// Decoded request body.
pub enum BodyReader<R> {
    /// `Transfer-Encoding: chunked`.
    Chunked(ChunkDecoder<R>),
    /// `Content-Length` bytes.
    Limited { reader: R, remaining: u64 },
    /// Everything up to end of stream.
    UntilEof(R),
}

impl<R: AsyncBufRead + Unpin> BodyReader<R> {
    /// Picks the body framing declared by `headers`.
    pub fn from_headers(
        reader: R,
        headers: &Headers,
        max_chunk_size: usize,
    ) -> Result<Self, WireError> {
        if headers.is_chunked() {
            return Ok(Self::Chunked(ChunkDecoder::with_max_chunk_size(
                reader,
                max_chunk_size,
            )));
        }
        Ok(match headers.content_length()? {
            Some(remaining) => Self::Limited { reader, remaining },
            None => Self::UntilEof(reader),
        })
    }

    /// Reads decoded body bytes; 0 means the body is complete.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, WireError> {
        match self {
            Self::Chunked(decoder) => decoder.read(buf).await,
            Self::Limited { reader, remaining } => {
                if *remaining == 0 || buf.is_empty() {
                    return Ok(0);
                }
                let max = (*remaining).min(buf.len() as u64) as usize;
                let n = reader.read(&mut buf[..max]).await?;
                if n == 0 {
                    return Err(WireError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("body ended {remaining} bytes early"),
                    )));
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Self::UntilEof(reader) => Ok(reader.read(buf).await?),
        }
    }
}

/// Accepts resumable uploads into a [`CacheStore`].
#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    store: CacheStore,
    locks: TransferLocks,
}

impl Receiver {
    /// Creates the receiver, preparing its cache directory.
    pub fn new(config: ReceiverConfig) -> Result<Self, StorageError> {
        let store = CacheStore::new(&config.cache_dir)?;
        Ok(Self {
            config,
            store,
            locks: TransferLocks::new(),
        })
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Runs one full cycle on `stream`: read the request, persist the
    /// body, write the response.
    pub async fn receive<S>(&self, stream: S) -> ReceiveOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);

        let head = match tokio::time::timeout(
            self.config.read_timeout,
            read_request_head(&mut reader),
        )
        .await
        {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                let err = ReceiveError::from(e);
                let connectivity = err.is_connectivity();
                warn!(error = %err, "rejected request head");
                let outcome = ReceiveOutcome::Failed(err);
                if !connectivity {
                    self.respond(&mut writer, &outcome).await;
                    drain(&mut reader).await;
                }
                return outcome;
            }
            Err(_) => {
                debug!("timed out waiting for request head");
                return ReceiveOutcome::Failed(ReceiveError::Connectivity(timed_out(
                    "request head",
                )));
            }
        };

        let outcome = self.process(&head, &mut reader).await;
        self.respond(&mut writer, &outcome).await;
        if !matches!(outcome, ReceiveOutcome::Completed(_)) {
            drain(&mut reader).await;
        }
        outcome
    }

    /// Handles a parsed request head and its undecoded body stream.
    pub async fn process<R>(&self, head: &RequestHead, body: R) -> ReceiveOutcome
    where
        R: AsyncBufRead + Unpin,
    {
        match self.try_process(head, body).await {
            Ok(outcome) => outcome,
            Err(err) => {
                match &err {
                    ReceiveError::Connectivity(e) => {
                        info!(unique_id = head.unique_id(), error = %e, "receive interrupted")
                    }
                    other => warn!(unique_id = head.unique_id(), error = %other, "receive failed"),
                }
                ReceiveOutcome::Failed(err)
            }
        }
    }

    async fn try_process<R>(
        &self,
        head: &RequestHead,
        body: R,
    ) -> Result<ReceiveOutcome, ReceiveError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.check_request(head)?;

        let id = head
            .unique_id()
            .ok_or_else(|| ReceiveError::Protocol("missing uniqueId header".into()))?;
        let path = self.store.path_for(id)?;
        let declared = head.headers.current_offset()?.unwrap_or(0);
        let mut body = BodyReader::from_headers(body, &head.headers, self.config.max_chunk_size)?;

        let _guard = self.locks.acquire(id).await;

        match existing_len(&path).await? {
            Some(len) if len != declared => {
                info!(unique_id = id, declared, cached = len, "offset mismatch, requesting reset");
                return Ok(ReceiveOutcome::ResetRequired { offset: len });
            }
            None if declared > 0 => {
                info!(unique_id = id, declared, "no cached bytes, requesting reset");
                return Ok(ReceiveOutcome::ResetRequired { offset: 0 });
            }
            _ => {}
        }

        let received = self.append(&path, &mut body).await?;
        let total = declared + received;
        let sealed = self.store.seal(id, &path).await?;
        info!(unique_id = id, offset = declared, received, total, "transfer completed");
        Ok(ReceiveOutcome::Completed(CachedBody::new(
            id.to_string(),
            sealed,
            total,
            head.headers.is_gzip(),
        )))
    }

    fn check_request(&self, head: &RequestHead) -> Result<(), ReceiveError> {
        if !head.method.eq_ignore_ascii_case("POST") {
            return Err(ReceiveError::MethodNotImplemented(head.method.clone()));
        }

        let target = head.target.split('?').next().unwrap_or_default();
        if let Some(expected) = &self.config.path
            && target != expected
        {
            return Err(ReceiveError::NotFound(target.to_string()));
        }

        if let Some(credentials) = &self.config.credentials
            && !credentials.verify(head.headers.get(headers::AUTHORIZATION))
        {
            return Err(ReceiveError::Forbidden);
        }
        Ok(())
    }

    /// Appends the body to the cache file. Bytes that arrived before a
    /// failure stay on disk and become the resume point.
    async fn append<R>(&self, path: &Path, body: &mut BodyReader<R>) -> Result<u64, ReceiveError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut file = self.store.open_append(path).await?;
        let mut buf = vec![0u8; IO_BUFFER_SIZE];
        let mut received = 0u64;

        let result = loop {
            let n = match tokio::time::timeout(self.config.read_timeout, body.read(&mut buf)).await
            {
                Ok(Ok(0)) => break Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break Err(ReceiveError::from(e)),
                Err(_) => break Err(ReceiveError::Connectivity(timed_out("request body"))),
            };
            if let Err(e) = file.write_all(&buf[..n]).await {
                break Err(ReceiveError::Connectivity(e));
            }
            received += n as u64;
        };

        let synced = async {
            file.flush().await?;
            file.sync_data().await
        }
        .await;
        debug!(path = %path.display(), received, "cache file synced");

        result?;
        synced.map_err(ReceiveError::Connectivity)?;
        Ok(received)
    }

    /// Writes the response for `outcome`. Failures are logged only; the
    /// peer may already be gone.
    async fn respond<W>(&self, writer: &mut W, outcome: &ReceiveOutcome)
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.render_response(outcome);
        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await?;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.config.read_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "failed to write response"),
            Err(_) => debug!("timed out writing response"),
        }
    }

    fn render_response(&self, outcome: &ReceiveOutcome) -> Vec<u8> {
        let mut head = ResponseHead::new(outcome.status_code(), &self.config.server_name);
        let body = match outcome {
            ReceiveOutcome::Completed(_) => Vec::new(),
            ReceiveOutcome::ResetRequired { offset } => {
                head.headers
                    .append(headers::CURRENT_OFFSET, offset.to_string());
                Vec::new()
            }
            ReceiveOutcome::Failed(err) => {
                head.headers
                    .append(headers::CONTENT_TYPE, "text/plain; charset=utf-8");
                format!("{err}\n").into_bytes()
            }
        };
        head.headers
            .append(headers::CONTENT_LENGTH, body.len().to_string());

        let mut out = head.to_bytes();
        out.extend_from_slice(&body);
        out
    }
}

/// Discards unread request bytes so closing the socket does not reset the
/// connection before the peer has read the response.
async fn drain<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut sink = tokio::io::sink();
    let mut limited = reader.take(DRAIN_LIMIT);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut limited, &mut sink)).await;
}

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{what} read timed out"))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use handoff_protocol::encode_chunked;

    use super::*;

    fn receiver(dir: &Path) -> Receiver {
        Receiver::new(ReceiverConfig {
            cache_dir: dir.to_path_buf(),
            ..ReceiverConfig::default()
        })
        .unwrap()
    }

    fn head(id: Option<&str>, offset: Option<u64>) -> RequestHead {
        let mut head = RequestHead::post("/upload");
        if let Some(id) = id {
            head.headers.append(headers::UNIQUE_ID, id);
        }
        if let Some(offset) = offset {
            head.headers
                .append(headers::CURRENT_OFFSET, offset.to_string());
        }
        head
    }

    fn chunked(mut head: RequestHead) -> RequestHead {
        head.headers.append(headers::TRANSFER_ENCODING, "chunked");
        head
    }

    #[tokio::test]
    async fn fresh_chunked_transfer_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let wire = encode_chunked(&data, 1024);

        let outcome = receiver
            .process(&chunked(head(Some("t1"), None)), &wire[..])
            .await;
        let ReceiveOutcome::Completed(body) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(body.unique_id(), "t1");
        assert_eq!(body.len(), 10_000);
        assert!(!body.is_compressed());
        assert_eq!(std::fs::read(body.path()).unwrap(), data);
    }

    #[tokio::test]
    async fn resumes_from_cached_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let data = b"0123456789abcdef".to_vec();
        let path = receiver.store().path_for("t2").unwrap();
        std::fs::write(&path, &data[..6]).unwrap();

        let mut request = head(Some("t2"), Some(6));
        request
            .headers
            .append(headers::CONTENT_LENGTH, (data.len() - 6).to_string());
        let outcome = receiver.process(&request, &data[6..]).await;

        let ReceiveOutcome::Completed(body) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(body.len(), 16);
        assert_eq!(std::fs::read(body.path()).unwrap(), data);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn request_after_completion_starts_a_new_file() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());

        let ReceiveOutcome::Completed(first) = receiver
            .process(&head(Some("dup"), None), &b"first file"[..])
            .await
        else {
            panic!("expected first completion");
        };

        // The finished file no longer counts as progress for the id.
        let late = receiver
            .process(&head(Some("dup"), Some(10)), &b"+second"[..])
            .await;
        assert!(matches!(late, ReceiveOutcome::ResetRequired { offset: 0 }));

        let ReceiveOutcome::Completed(second) = receiver
            .process(&head(Some("dup"), None), &b"second"[..])
            .await
        else {
            panic!("expected second completion");
        };
        assert_ne!(first.path(), second.path());

        let mut out = Vec::new();
        first.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"first file");
        out.clear();
        second.open().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"second");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn offset_mismatch_requests_reset_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let path = receiver.store().path_for("t3").unwrap();
        std::fs::write(&path, vec![7u8; 5000]).unwrap();

        let outcome = receiver
            .process(&head(Some("t3"), Some(3000)), &b"late bytes"[..])
            .await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::ResetRequired { offset: 5000 }
        ));
        assert_eq!(outcome.status_code(), 205);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5000);
    }

    #[tokio::test]
    async fn nonzero_offset_without_cache_file_resets_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let outcome = receiver
            .process(&head(Some("t4"), Some(100)), &b"xyz"[..])
            .await;
        assert!(matches!(outcome, ReceiveOutcome::ResetRequired { offset: 0 }));
        assert_eq!(receiver.store().progress("t4").await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_body_yields_empty_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let outcome = receiver.process(&head(Some("empty"), None), &b""[..]).await;
        let ReceiveOutcome::Completed(body) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(body.is_empty());
        assert!(body.path().exists());
    }

    #[tokio::test]
    async fn missing_unique_id_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let outcome = receiver.process(&head(None, None), &b"data"[..]).await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::Failed(ReceiveError::Protocol(_))
        ));
        assert_eq!(outcome.status_code(), 400);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unsafe_unique_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let outcome = receiver
            .process(&head(Some("../escape"), None), &b"data"[..])
            .await;
        assert_eq!(outcome.status_code(), 400);
    }

    #[tokio::test]
    async fn non_numeric_offset_is_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let mut request = head(Some("t5"), None);
        request.headers.append(headers::CURRENT_OFFSET, "ten");
        let outcome = receiver.process(&request, &b"data"[..]).await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::Failed(ReceiveError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn truncated_chunk_keeps_complete_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let wire = b"4\r\nabcd\r\na\r\nxyz";

        let outcome = receiver
            .process(&chunked(head(Some("t6"), None)), &wire[..])
            .await;
        let ReceiveOutcome::Failed(err) = &outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(matches!(err, ReceiveError::Framing(_)));
        assert!(!err.is_connectivity());
        assert_eq!(outcome.status_code(), 400);
        let path = receiver.store().path_for("t6").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn short_content_length_body_is_connectivity_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let mut request = head(Some("t7"), None);
        request.headers.append(headers::CONTENT_LENGTH, "10");
        let outcome = receiver.process(&request, &b"abc"[..]).await;

        let ReceiveOutcome::Failed(err) = &outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(err.is_connectivity());
        assert_eq!(outcome.status_code(), 503);
        assert_eq!(receiver.store().progress("t7").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn method_path_and_auth_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = Receiver::new(ReceiverConfig {
            cache_dir: tmp.path().to_path_buf(),
            path: Some("/upload".into()),
            credentials: Some(Credentials::new("user", "secret")),
            ..ReceiverConfig::default()
        })
        .unwrap();
        let auth = Credentials::new("user", "secret").header_value();

        let mut get = head(Some("a"), None);
        get.method = "GET".into();
        assert_eq!(receiver.process(&get, &b""[..]).await.status_code(), 501);

        let mut elsewhere = head(Some("a"), None);
        elsewhere.target = "/other".into();
        elsewhere.headers.append(headers::AUTHORIZATION, &auth);
        assert_eq!(receiver.process(&elsewhere, &b""[..]).await.status_code(), 404);

        let unauthorized = head(Some("a"), None);
        assert_eq!(
            receiver.process(&unauthorized, &b""[..]).await.status_code(),
            403
        );

        let mut wrong = head(Some("a"), None);
        wrong
            .headers
            .append(headers::AUTHORIZATION, Credentials::new("user", "nope").header_value());
        assert_eq!(receiver.process(&wrong, &b""[..]).await.status_code(), 403);

        let mut ok = head(Some("a"), None);
        ok.target = "/upload?attempt=2".into();
        ok.headers.append(headers::AUTHORIZATION, &auth);
        assert_eq!(receiver.process(&ok, &b"hi"[..]).await.status_code(), 200);
    }

    #[tokio::test]
    async fn gzip_encoding_is_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let mut request = head(Some("gz"), None);
        request.headers.append(headers::CONTENT_ENCODING, "gzip");
        let outcome = receiver.process(&request, &b"\x1f\x8b"[..]).await;
        let ReceiveOutcome::Completed(body) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(body.is_compressed());
    }

    async fn exchange(receiver: &Receiver, request: &[u8]) -> (ReceiveOutcome, String) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let client_side = async {
            client.write_all(request).await.unwrap();
            client.shutdown().await.unwrap();
            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            String::from_utf8(response).unwrap()
        };
        tokio::join!(receiver.receive(server), client_side)
    }

    #[tokio::test]
    async fn receive_writes_success_response() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let request = b"POST /upload HTTP/1.1\r\nuniqueId: wire\r\nContent-Length: 5\r\n\r\nhello";

        let (outcome, response) = exchange(&receiver, request).await;
        assert!(matches!(outcome, ReceiveOutcome::Completed(_)));
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains(&format!("Server: {SERVER_NAME}\r\n")));
    }

    #[tokio::test]
    async fn receive_writes_reset_response() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        std::fs::write(receiver.store().path_for("wire").unwrap(), vec![0u8; 5000]).unwrap();
        let request = b"POST /upload HTTP/1.1\r\nuniqueId: wire\r\ncurrentOffset: 3000\r\nContent-Length: 4\r\n\r\nmore";

        let (outcome, response) = exchange(&receiver, request).await;
        assert!(matches!(
            outcome,
            ReceiveOutcome::ResetRequired { offset: 5000 }
        ));
        assert!(response.starts_with("HTTP/1.0 205 Reset\r\n"));
        assert!(response.contains("currentOffset: 5000\r\n"));
    }

    #[tokio::test]
    async fn receive_rejects_malformed_head() {
        let tmp = tempfile::tempdir().unwrap();
        let receiver = receiver(tmp.path());
        let (outcome, response) = exchange(&receiver, b"POST\r\n\r\n").await;
        assert_eq!(outcome.status_code(), 400);
        assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"));
        assert!(response.contains("Content-Type: text/plain"));
    }
}
