//! End-to-end transfers between a `ReceiverServer` and a `Sender` over
//! loopback TCP.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_cache::{BoundedCache, CacheConfig};
use handoff_protocol::Credentials;
use handoff_transfer::{
    CachedBody, CompressedSpool, Receiver, ReceiverConfig, ReceiverServer, RetryPolicy, SendError,
    Sender, SenderCache, SenderConfig,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    addr: SocketAddr,
    cache_dir: TempDir,
    completed: mpsc::Receiver<CachedBody>,
    cancel: CancellationToken,
}

impl Harness {
    async fn start(credentials: Option<Credentials>) -> Self {
        let cache_dir = tempfile::tempdir().unwrap();
        let receiver = Receiver::new(ReceiverConfig {
            cache_dir: cache_dir.path().to_path_buf(),
            path: Some("/upload".into()),
            credentials,
            ..ReceiverConfig::default()
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let server = ReceiverServer::new(receiver, cancel.clone());
        let (listener, addr) = ReceiverServer::bind("127.0.0.1:0").await.unwrap();
        let (tx, completed) = mpsc::channel(8);
        tokio::spawn(async move { server.run(listener, tx).await });

        Self {
            addr,
            cache_dir,
            completed,
            cancel,
        }
    }

    fn sender_config(&self, id: &str) -> SenderConfig {
        SenderConfig {
            path: "/upload".into(),
            chunk_size: Some(1024),
            ..SenderConfig::new(self.addr.to_string(), id)
        }
    }

    fn cache_file(&self, id: &str) -> PathBuf {
        self.cache_dir.path().join(format!("{id}.part"))
    }

    async fn next_body(&mut self) -> CachedBody {
        tokio::time::timeout(Duration::from_secs(10), self.completed.recv())
            .await
            .expect("timed out waiting for body")
            .expect("server stopped")
    }

    /// Sends a request head announcing `declared_len` bytes but only
    /// `sent` of them, then hangs up. Returns the raw response.
    async fn upload_partial(&self, id: &str, declared_len: usize, sent: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let head = format!(
            "POST /upload HTTP/1.1\r\nuniqueId: {id}\r\nContent-Length: {declared_len}\r\n\r\n"
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(sent).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("source.bin");
    std::fs::write(&path, data).unwrap();
    path
}

fn read_all(body: CachedBody) -> Vec<u8> {
    let mut out = Vec::new();
    body.into_reader().unwrap().read_to_end(&mut out).unwrap();
    out
}

fn sender_cache() -> SenderCache {
    BoundedCache::new(CacheConfig::default()).unwrap()
}

fn no_retries() -> RetryPolicy {
    RetryPolicy::none()
}

#[tokio::test]
async fn chunked_transfer_is_delivered_once() {
    let mut h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(10_000);
    let path = write_source(src.path(), &data);

    let mut sender = Sender::new(h.sender_config("chunked"));
    let response = sender.send_file(&path, &no_retries(), false).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(sender.current_offset(), 10_000);

    let body = h.next_body().await;
    assert_eq!(body.unique_id(), "chunked");
    assert_eq!(body.len(), 10_000);
    let cache_file = body.path().to_path_buf();
    assert_eq!(read_all(body), data);
    assert!(!cache_file.exists());
}

#[tokio::test]
async fn raw_transfer_uses_content_length() {
    let mut h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(70_000);
    let path = write_source(src.path(), &data);

    let config = SenderConfig {
        chunk_size: None,
        ..h.sender_config("raw")
    };
    Sender::new(config)
        .send_file(&path, &no_retries(), false)
        .await
        .unwrap();

    assert_eq!(read_all(h.next_body().await), data);
}

#[tokio::test]
async fn interrupted_upload_resumes_from_cached_bytes() {
    let mut h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(20_000);
    let path = write_source(src.path(), &data);

    let response = h.upload_partial("resume", data.len(), &data[..4096]).await;
    assert!(response.starts_with("HTTP/1.0 503 "), "{response}");
    assert_eq!(std::fs::metadata(h.cache_file("resume")).unwrap().len(), 4096);

    // A fresh sender starts at 0; the receiver resets it to 4096.
    let cache = sender_cache();
    let mut sender = Sender::resume_or_new(h.sender_config("resume"), &cache);
    assert_eq!(sender.current_offset(), 0);
    sender.send_file(&path, &no_retries(), false).await.unwrap();

    let body = h.next_body().await;
    assert_eq!(body.len(), 20_000);
    assert_eq!(read_all(body), data);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn compressed_transfer_resumes_into_same_stream() {
    let mut h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(50_000);
    let path = write_source(src.path(), &data);

    let gz = std::fs::read(CompressedSpool::create(&path).await.unwrap().path()).unwrap();
    assert!(gz.len() > 64);
    let response = h.upload_partial("gz", gz.len(), &gz[..64]).await;
    assert!(response.starts_with("HTTP/1.0 503 "), "{response}");

    let config = SenderConfig {
        compress: true,
        ..h.sender_config("gz")
    };
    Sender::new(config)
        .send_file(&path, &no_retries(), false)
        .await
        .unwrap();

    let body = h.next_body().await;
    assert!(body.is_compressed());
    assert_eq!(body.len(), gz.len() as u64);
    assert_eq!(read_all(body), data);
}

#[tokio::test]
async fn failed_sender_is_parked_then_resumed() {
    let mut h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(5_000);
    let path = write_source(src.path(), &data);
    let cache = sender_cache();

    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let unreachable = SenderConfig::new(closed.to_string(), "parked");
    let policy = RetryPolicy {
        retries: 1,
        interval: Duration::from_millis(10),
        factor: 2.0,
    };
    let err = Sender::resume_or_new(unreachable, &cache)
        .send_file(&path, &policy, false)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {err:?}");
    assert!(cache.contains_key(&"parked".to_string()));

    let mut sender = Sender::resume_or_new(h.sender_config("parked"), &cache);
    sender.send_file(&path, &policy, false).await.unwrap();
    assert!(!cache.contains_key(&"parked".to_string()));
    assert_eq!(read_all(h.next_body().await), data);
}

#[tokio::test]
async fn truncated_chunk_is_rejected_as_bad_request() {
    let h = Harness::start(None).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nuniqueId: trunc\r\nTransfer-Encoding: chunked\r\n\r\n32\r\nonly-a-few-bytes",
        )
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("chunk truncated"), "{response}");
}

#[tokio::test]
async fn credentials_are_enforced() {
    let mut h = Harness::start(Some(Credentials::new("alice", "s3cret"))).await;
    let src = tempfile::tempdir().unwrap();
    let data = payload(2_000);
    let path = write_source(src.path(), &data);

    let wrong = SenderConfig {
        credentials: Some(Credentials::new("alice", "guess")),
        ..h.sender_config("auth")
    };
    let err = Sender::new(wrong)
        .send_file(&path, &no_retries(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Rejected { status: 403, .. }), "got {err:?}");

    let right = SenderConfig {
        credentials: Some(Credentials::new("alice", "s3cret")),
        ..h.sender_config("auth")
    };
    Sender::new(right)
        .send_file(&path, &no_retries(), false)
        .await
        .unwrap();
    assert_eq!(read_all(h.next_body().await), data);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let h = Harness::start(None).await;
    let src = tempfile::tempdir().unwrap();
    let path = write_source(src.path(), b"abc");

    let config = SenderConfig {
        path: "/elsewhere".into(),
        ..h.sender_config("lost")
    };
    let err = Sender::new(config)
        .send_file(&path, &no_retries(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Rejected { status: 404, .. }), "got {err:?}");
}
