//! Command runners.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use handoff_cache::BoundedCache;
use handoff_transfer::{
    CacheStore, CachedBody, Receiver, ReceiverServer, SendError, Sender, SenderCache,
    validate_transfer_id,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::{Command, SendArgs};
use crate::config::Config;

/// Runs one CLI command until it finishes or Ctrl-C is pressed.
pub async fn run(command: Command, mut config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("SIGINT received, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!("failed to listen for SIGINT: {e}"),
        }
    });

    match command {
        Command::Serve(args) => {
            args.apply(&mut config);
            serve(&config, cancel).await
        }
        Command::Send(args) => {
            args.apply(&mut config);
            send(&config, &args, cancel).await
        }
        Command::Status(args) => {
            args.apply(&mut config);
            let line = status(&config, &args.id).await?;
            println!("{line}");
            Ok(())
        }
        Command::Discard(args) => {
            args.apply(&mut config);
            let line = discard(&config, &args.id).await?;
            println!("{line}");
            Ok(())
        }
    }
}

fn open_store(config: &Config, id: &str) -> anyhow::Result<CacheStore> {
    validate_transfer_id(id)?;
    CacheStore::new(&config.receiver.cache_dir).with_context(|| {
        format!(
            "failed to open cache directory {}",
            config.receiver.cache_dir.display()
        )
    })
}

async fn status(config: &Config, id: &str) -> anyhow::Result<String> {
    let store = open_store(config, id)?;
    Ok(match store.progress(id).await? {
        Some(bytes) => format!("{id}: {bytes} bytes cached"),
        None => format!("{id}: nothing cached"),
    })
}

async fn discard(config: &Config, id: &str) -> anyhow::Result<String> {
    let store = open_store(config, id)?;
    if store.discard(id).await? {
        tracing::info!(unique_id = %id, "partial transfer discarded");
        Ok(format!("{id}: discarded"))
    } else {
        Ok(format!("{id}: nothing cached"))
    }
}

async fn serve(config: &Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let section = &config.receiver;
    let receiver = Receiver::new(section.to_receiver_config())
        .context("failed to prepare cache directory")?;
    std::fs::create_dir_all(&section.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            section.output_dir.display()
        )
    })?;

    let (listener, addr) = ReceiverServer::bind(section.listen.as_str())
        .await
        .with_context(|| format!("failed to bind {}", section.listen))?;
    tracing::info!(
        %addr,
        cache_dir = %section.cache_dir.display(),
        output_dir = %section.output_dir.display(),
        "receiver ready"
    );

    let server = ReceiverServer::new(receiver, cancel);
    let (tx, mut rx) = mpsc::channel::<CachedBody>(16);
    let server_task = tokio::spawn(async move { server.run(listener, tx).await });

    // Ends once the server and every connection task have dropped their
    // senders.
    while let Some(body) = rx.recv().await {
        let output_dir = section.output_dir.clone();
        let unique_id = body.unique_id().to_string();
        match tokio::task::spawn_blocking(move || deliver(body, &output_dir)).await {
            Ok(Ok(target)) => {
                tracing::info!(unique_id = %unique_id, path = %target.display(), "file delivered")
            }
            Ok(Err(e)) => tracing::error!(unique_id = %unique_id, "failed to deliver file: {e}"),
            Err(e) => tracing::error!(unique_id = %unique_id, "delivery task failed: {e}"),
        }
    }

    server_task.await??;
    Ok(())
}

/// Copies a completed body into `output_dir`, consuming its cache file.
fn deliver(body: CachedBody, output_dir: &Path) -> std::io::Result<PathBuf> {
    let target = output_dir.join(body.unique_id());
    let mut reader = body.into_reader()?;
    let mut file = std::fs::File::create(&target)?;
    std::io::copy(&mut reader, &mut file)?;
    file.sync_all()?;
    Ok(target)
}

async fn send(config: &Config, args: &SendArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    if args.id.is_some() && args.files.len() > 1 {
        anyhow::bail!("--id can only be used with a single file");
    }

    let cache: SenderCache = BoundedCache::new(config.cache.to_cache_config())?;
    cache.start_sweeper();
    let policy = config.retry.to_policy();

    let mut pending: Vec<(PathBuf, String)> = args
        .files
        .iter()
        .map(|file| -> anyhow::Result<(PathBuf, String)> {
            let id = match &args.id {
                Some(id) => id.clone(),
                None => default_transfer_id(file)?,
            };
            validate_transfer_id(&id)?;
            Ok((file.clone(), id))
        })
        .collect::<anyhow::Result<_>>()?;

    let mut failed = 0usize;
    for pass in 0..=args.passes {
        if pending.is_empty() {
            break;
        }
        if pass > 0 {
            tracing::info!(pass, files = pending.len(), "retrying interrupted transfers");
        }

        let mut interrupted = Vec::new();
        for (file, id) in pending {
            let mut sender = Sender::resume_or_new(config.sender.to_sender_config(&id), &cache)
                .with_cancellation(cancel.clone());
            match sender.send_file(&file, &policy, args.response).await {
                Ok(response) => {
                    tracing::info!(
                        unique_id = %id,
                        file = %file.display(),
                        bytes = sender.current_offset(),
                        status = response.status,
                        "upload complete"
                    );
                    if args.response && !response.body.is_empty() {
                        std::io::stdout().write_all(&response.body)?;
                    }
                }
                Err(SendError::Cancelled) => {
                    cache.stop_sweeper();
                    anyhow::bail!("cancelled");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(unique_id = %id, offset = sender.current_offset(), "upload interrupted: {e}");
                    interrupted.push((file, id));
                }
                Err(e) => {
                    tracing::error!(unique_id = %id, file = %file.display(), "upload failed: {e}");
                    failed += 1;
                }
            }
        }
        pending = interrupted;
    }

    cache.stop_sweeper();
    let failed = failed + pending.len();
    if failed > 0 {
        anyhow::bail!("{failed} of {} uploads failed", args.files.len());
    }
    Ok(())
}

/// `<hostname>-<file name>`, so uploads from different hosts don't share
/// a cache file on the receiver.
fn default_transfer_id(file: &Path) -> anyhow::Result<String> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("cannot derive a transfer id from {}", file.display()))?;
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "handoff".into());
    Ok(format!("{host}-{name}"))
}
