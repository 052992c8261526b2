//! TCP accept loop around a [`Receiver`].
//!
//! Each accepted connection is served on its own task; completed bodies
//! are forwarded to the caller through an mpsc channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::body::CachedBody;
use crate::receiver::{ReceiveOutcome, Receiver};

/// Serves a [`Receiver`] on a TCP listener until cancelled.
pub struct ReceiverServer {
    receiver: Arc<Receiver>,
    cancel: CancellationToken,
}

impl ReceiverServer {
    pub fn new(receiver: Receiver, cancel: CancellationToken) -> Self {
        Self {
            receiver: Arc::new(receiver),
            cancel,
        }
    }

    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    /// Binds a listener and logs the address it got.
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(%local, "receiver listening");
        Ok((listener, local))
    }

    /// Accepts connections until the cancellation token fires.
    ///
    /// In-flight connections are abandoned on shutdown; whatever they had
    /// appended stays in the cache for the sender to resume.
    pub async fn run(
        &self,
        listener: TcpListener,
        completed: mpsc::Sender<CachedBody>,
    ) -> std::io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("receiver shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            debug!(%peer, "connection accepted");

            let receiver = Arc::clone(&self.receiver);
            let completed = completed.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(%peer, "connection abandoned on shutdown");
                        return;
                    }
                    outcome = receiver.receive(stream) => outcome,
                };
                match outcome {
                    ReceiveOutcome::Completed(body) => {
                        if let Err(mpsc::error::SendError(body)) = completed.send(body).await {
                            warn!(
                                unique_id = body.unique_id(),
                                path = %body.path().display(),
                                "no consumer for completed body, leaving it cached"
                            );
                        }
                    }
                    ReceiveOutcome::ResetRequired { offset } => {
                        debug!(%peer, offset, "sender told to resume");
                    }
                    ReceiveOutcome::Failed(err) => {
                        debug!(%peer, status = err.status_code(), error = %err, "connection failed");
                    }
                }
            });
        }
    }
}
