//! Outbound sender: pushes one file to a receiver, resuming and retrying.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_cache::BoundedCache;
use handoff_protocol::headers::{self, Headers};
use handoff_protocol::{
    Credentials, RequestHead, ResponseHead, read_response_head, status, write_chunk,
    write_last_chunk,
};
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::retry::RetryPolicy;
use crate::spool::CompressedSpool;
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT, IO_BUFFER_SIZE,
    MAX_RESETS_PER_SEND, MAX_RESPONSE_BODY,
};

/// Parked senders keyed by transfer id.
pub type SenderCache = BoundedCache<String, Sender>;

/// Headers the sender always sets itself.
const RESERVED_HEADERS: &[&str] = &[
    headers::HOST,
    headers::UNIQUE_ID,
    headers::CURRENT_OFFSET,
    headers::CONTENT_LENGTH,
    headers::TRANSFER_ENCODING,
    headers::CONTENT_ENCODING,
    headers::CONNECTION,
];

/// Where and how to send one transfer.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Receiver address as `host:port`.
    pub endpoint: String,
    /// Request target.
    pub path: String,
    /// Transfer id shared by every attempt.
    pub unique_id: String,
    pub content_type: String,
    pub accept_charset: Option<String>,
    pub credentials: Option<Credentials>,
    /// Extra request headers. Framing and transfer headers are ignored.
    pub headers: Vec<(String, String)>,
    /// Chunk frame size; `None` sends a raw body with `Content-Length`.
    pub chunk_size: Option<usize>,
    /// Gzip the body (`Content-Encoding: gzip`).
    pub compress: bool,
    pub connect_timeout: Duration,
    /// Idle timeout for each socket write and for the response.
    pub io_timeout: Duration,
}

impl SenderConfig {
    pub fn new(endpoint: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            path: "/".into(),
            unique_id: unique_id.into(),
            content_type: "application/octet-stream".into(),
            accept_charset: None,
            credentials: None,
            headers: Vec::new(),
            chunk_size: Some(DEFAULT_CHUNK_SIZE),
            compress: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

/// The receiver's final answer.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    /// Empty unless the caller asked for the response body.
    pub body: Vec<u8>,
}

/// Bytes to send for the current file: the file itself or its gzip spool.
struct Source {
    path: PathBuf,
    len: u64,
}

/// Resumable sender for one transfer id.
///
/// Cloning copies the transfer state; only the handle inside a
/// [`SenderCache`] is consulted on resume.
#[derive(Debug, Clone)]
pub struct Sender {
    config: SenderConfig,
    current_offset: u64,
    spool: Option<CompressedSpool>,
    cache: Option<SenderCache>,
    cancel: CancellationToken,
}

impl Sender {
    /// A sender starting at offset 0 with no cache.
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            current_offset: 0,
            spool: None,
            cache: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the sender parked for `config.unique_id`, or a fresh one.
    ///
    /// A parked sender keeps its offset and compression spool but takes
    /// the new `config`. Either way the sender parks itself in `cache` on
    /// connectivity failures and leaves it on success.
    pub fn resume_or_new(config: SenderConfig, cache: &SenderCache) -> Self {
        let mut sender = match cache.get(&config.unique_id) {
            Some(mut parked) => {
                debug!(
                    unique_id = %config.unique_id,
                    offset = parked.current_offset,
                    "resuming parked sender"
                );
                parked.config = config;
                parked
            }
            None => Self::new(config),
        };
        sender.cache = Some(cache.clone());
        sender
    }

    /// Replaces the token that interrupts connects, I/O and backoff.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn unique_id(&self) -> &str {
        &self.config.unique_id
    }

    /// Bytes the receiver is believed to hold.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Sends `path`, resuming from the current offset.
    ///
    /// Connectivity failures and timeouts consume the retry budget with
    /// backoff; non-success statuses consume it without waiting; `205`
    /// resets move the offset and retry at once. With `requires_response`
    /// the response body is read and returned.
    pub async fn send_file(
        &mut self,
        path: &Path,
        policy: &RetryPolicy,
        requires_response: bool,
    ) -> Result<Response, SendError> {
        let source = self.prepare_source(path).await?;
        let mut backoff = policy.backoff();
        let mut attempts = 0u32;
        let mut resets = 0u32;
        let mut last_failure = None;

        while attempts <= policy.retries {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SendError::Cancelled),
                result = self.attempt(&source, requires_response) => result,
            };

            match result {
                Ok(response) if response.status == status::RESET => {
                    let offset = response.headers.current_offset()?.ok_or_else(|| {
                        SendError::Protocol("reset response without currentOffset".into())
                    })?;
                    if offset > source.len {
                        return Err(SendError::Protocol(format!(
                            "receiver reset to {offset}, beyond body length {}",
                            source.len
                        )));
                    }
                    resets += 1;
                    if resets > MAX_RESETS_PER_SEND {
                        return Err(SendError::Protocol(format!(
                            "receiver requested more than {MAX_RESETS_PER_SEND} resets"
                        )));
                    }
                    info!(
                        unique_id = %self.config.unique_id,
                        from = self.current_offset,
                        to = offset,
                        "adopting receiver offset"
                    );
                    self.current_offset = offset;
                }
                Ok(response) if status::is_success(response.status) => {
                    self.current_offset = source.len;
                    self.release();
                    info!(
                        unique_id = %self.config.unique_id,
                        bytes = source.len,
                        status = response.status,
                        "transfer sent"
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    attempts += 1;
                    warn!(
                        unique_id = %self.config.unique_id,
                        status = response.status,
                        reason = %response.reason,
                        attempts,
                        "receiver rejected transfer"
                    );
                    last_failure = Some(SendError::Rejected {
                        status: response.status,
                        reason: response.reason,
                    });
                }
                Err(err) if err.is_retryable() => {
                    attempts += 1;
                    warn!(
                        unique_id = %self.config.unique_id,
                        offset = self.current_offset,
                        attempts,
                        error = %err,
                        "send attempt failed"
                    );
                    self.park();
                    last_failure = Some(err);
                    if attempts > policy.retries {
                        break;
                    }
                    let delay = backoff.next_delay();
                    debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(SendError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_failure.unwrap_or_else(|| SendError::Protocol("retry budget exhausted".into())))
    }

    async fn prepare_source(&mut self, path: &Path) -> Result<Source, SendError> {
        let source = if self.config.compress {
            let reusable = self.spool.as_ref().is_some_and(|s| s.source() == path);
            if !reusable {
                let spool = CompressedSpool::create(path)
                    .await
                    .map_err(SendError::LocalIo)?;
                self.spool = Some(spool);
            }
            match &self.spool {
                Some(spool) => Source {
                    path: spool.path().to_path_buf(),
                    len: spool.len(),
                },
                None => return Err(SendError::Protocol("compression spool missing".into())),
            }
        } else {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(SendError::LocalIo)?;
            Source {
                path: path.to_path_buf(),
                len: meta.len(),
            }
        };

        if self.current_offset > source.len {
            warn!(
                unique_id = %self.config.unique_id,
                offset = self.current_offset,
                len = source.len,
                "offset beyond body length, restarting from 0"
            );
            self.current_offset = 0;
        }
        Ok(source)
    }

    /// One connection: request out, response head (and maybe body) in.
    async fn attempt(&self, source: &Source, requires_response: bool) -> Result<Response, SendError> {
        let connect_timeout = self.config.connect_timeout;
        let io_timeout = self.config.io_timeout;

        let stream = match tokio::time::timeout(
            connect_timeout,
            TcpStream::connect(&self.config.endpoint),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(SendError::Connectivity(e)),
            Err(_) => return Err(SendError::Timeout(connect_timeout)),
        };
        debug!(
            unique_id = %self.config.unique_id,
            endpoint = %self.config.endpoint,
            offset = self.current_offset,
            "connected"
        );

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);
        let head_bytes = self.request_head(source.len).to_bytes();

        // The receiver may answer before the body is complete (reset or
        // rejection), so the response is read while the body is written.
        let head: ResponseHead = {
            let send = self.send_request(&mut writer, &head_bytes, source);
            let receive = read_response_head(&mut reader);
            tokio::pin!(send);
            tokio::pin!(receive);

            tokio::select! {
                sent = &mut send => match sent {
                    Ok(()) => match tokio::time::timeout(io_timeout, &mut receive).await {
                        Ok(head) => head?,
                        Err(_) => return Err(SendError::Timeout(io_timeout)),
                    },
                    Err(err) if err.is_retryable() => {
                        match tokio::time::timeout(io_timeout, &mut receive).await {
                            Ok(Ok(head)) => head,
                            _ => return Err(err),
                        }
                    }
                    Err(err) => return Err(err),
                },
                head = &mut receive => head?,
            }
        };
        drop(writer);

        let body = if requires_response {
            read_response_body(&mut reader, &head.headers, io_timeout).await?
        } else {
            Vec::new()
        };

        Ok(Response {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
        })
    }

    fn request_head(&self, total_len: u64) -> RequestHead {
        let config = &self.config;
        let mut head = RequestHead::post(&config.path);

        for (name, value) in &config.headers {
            if RESERVED_HEADERS
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(name))
            {
                debug!(header = %name, "ignoring caller header");
                continue;
            }
            head.headers.append(name, value);
        }

        let h = &mut head.headers;
        h.insert(headers::HOST, &config.endpoint);
        h.insert(headers::UNIQUE_ID, &config.unique_id);
        h.insert(headers::CURRENT_OFFSET, self.current_offset.to_string());
        h.insert(headers::CONTENT_TYPE, &config.content_type);
        if let Some(charset) = &config.accept_charset {
            h.insert(headers::ACCEPT_CHARSET, charset);
        }
        if let Some(credentials) = &config.credentials {
            h.insert(headers::AUTHORIZATION, credentials.header_value());
        }
        if config.compress {
            h.insert(headers::CONTENT_ENCODING, "gzip");
        }
        match config.chunk_size {
            Some(_) => h.insert(headers::TRANSFER_ENCODING, "chunked"),
            None => h.insert(
                headers::CONTENT_LENGTH,
                (total_len - self.current_offset).to_string(),
            ),
        }
        h.insert(headers::CONNECTION, "close");
        head
    }

    /// Writes the head, then the source from the current offset.
    async fn send_request<W>(
        &self,
        writer: &mut W,
        head: &[u8],
        source: &Source,
    ) -> Result<(), SendError>
    where
        W: AsyncWrite + Unpin,
    {
        let io_timeout = self.config.io_timeout;
        timed(io_timeout, writer.write_all(head)).await?;

        let mut file = tokio::fs::File::open(&source.path)
            .await
            .map_err(SendError::LocalIo)?;
        file.seek(SeekFrom::Start(self.current_offset))
            .await
            .map_err(SendError::LocalIo)?;

        let frame = self.config.chunk_size.unwrap_or(IO_BUFFER_SIZE).max(1);
        let mut buf = vec![0u8; frame];
        let mut remaining = source.len - self.current_offset;

        while remaining > 0 {
            let want = remaining.min(frame as u64) as usize;
            file.read_exact(&mut buf[..want])
                .await
                .map_err(SendError::LocalIo)?;
            match self.config.chunk_size {
                Some(_) => timed(io_timeout, write_chunk(writer, &buf[..want])).await?,
                None => timed(io_timeout, writer.write_all(&buf[..want])).await?,
            }
            remaining -= want as u64;
        }

        if self.config.chunk_size.is_some() {
            timed(io_timeout, write_last_chunk(writer)).await?;
        }
        timed(io_timeout, writer.flush()).await?;
        timed(io_timeout, writer.shutdown()).await
    }

    /// Stores a detached copy of this sender for a later resume.
    fn park(&self) {
        if let Some(cache) = &self.cache {
            let parked = Self {
                cache: None,
                ..self.clone()
            };
            cache.put(self.config.unique_id.clone(), parked);
            debug!(
                unique_id = %self.config.unique_id,
                offset = self.current_offset,
                "sender parked"
            );
        }
    }

    fn release(&self) {
        if let Some(cache) = &self.cache
            && cache.remove(&self.config.unique_id).is_some()
        {
            debug!(unique_id = %self.config.unique_id, "parked sender released");
        }
    }
}

/// Reads a response body by `Content-Length`, or to end of stream.
async fn read_response_body<R>(
    reader: &mut R,
    headers: &Headers,
    io_timeout: Duration,
) -> Result<Vec<u8>, SendError>
where
    R: AsyncBufRead + Unpin,
{
    match headers.content_length()? {
        Some(len) if len > MAX_RESPONSE_BODY => Err(SendError::Protocol(format!(
            "response body of {len} bytes exceeds {MAX_RESPONSE_BODY}"
        ))),
        Some(len) => {
            let mut body = vec![0u8; len as usize];
            timed(io_timeout, reader.read_exact(&mut body)).await?;
            Ok(body)
        }
        None => {
            let mut body = Vec::new();
            let mut limited = reader.take(MAX_RESPONSE_BODY + 1);
            timed(io_timeout, limited.read_to_end(&mut body)).await?;
            if body.len() as u64 > MAX_RESPONSE_BODY {
                return Err(SendError::Protocol(format!(
                    "response body exceeds {MAX_RESPONSE_BODY} bytes"
                )));
            }
            Ok(body)
        }
    }
}

async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, SendError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SendError::Connectivity(e)),
        Err(_) => Err(SendError::Timeout(limit)),
    }
}
