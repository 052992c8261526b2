//! Command-line interface.
//!
//! Flags override the matching configuration file values.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Config;

/// Resumable file transfer over plain HTTP.
#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.config/handoff/handoff.toml).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Receive uploads and move completed files into the output directory.
    Serve(ServeArgs),

    /// Upload files, resuming wherever the receiver left off.
    Send(SendArgs),

    /// Show how many bytes of a partial transfer the receiver holds.
    Status(TransferArgs),

    /// Delete a partial transfer from the receiver's cache directory.
    Discard(TransferArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Directory for partial transfers.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Directory completed transfers are written to.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Only accept uploads to this request path.
    #[arg(long, value_name = "PATH")]
    pub path: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct SendArgs {
    /// Files to upload.
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Transfer id (single file only; default: <hostname>-<file name>).
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// Receiver address as host:port.
    #[arg(long, value_name = "ADDR")]
    pub endpoint: Option<String>,

    /// Request path.
    #[arg(long, value_name = "PATH")]
    pub path: Option<String>,

    /// Gzip the body.
    #[arg(long)]
    pub compress: bool,

    /// Send a raw body with Content-Length instead of chunks.
    #[arg(long, conflicts_with = "chunk_size")]
    pub raw: bool,

    /// Chunk size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Retries per file after the first attempt.
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Extra passes over files that failed with connectivity errors.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub passes: u32,

    /// Print the receiver's response body.
    #[arg(long)]
    pub response: bool,
}

#[derive(Args, Debug, Default)]
pub struct TransferArgs {
    /// Transfer id.
    #[arg(value_name = "ID")]
    pub id: String,

    /// Directory for partial transfers.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,
}

impl ServeArgs {
    pub fn apply(&self, config: &mut Config) {
        let receiver = &mut config.receiver;
        if let Some(listen) = &self.listen {
            receiver.listen = listen.clone();
        }
        if let Some(dir) = &self.cache_dir {
            receiver.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            receiver.output_dir = dir.clone();
        }
        if let Some(path) = &self.path {
            receiver.path = Some(path.clone());
        }
    }
}

impl SendArgs {
    pub fn apply(&self, config: &mut Config) {
        let sender = &mut config.sender;
        if let Some(endpoint) = &self.endpoint {
            sender.endpoint = endpoint.clone();
        }
        if let Some(path) = &self.path {
            sender.path = path.clone();
        }
        if self.compress {
            sender.compress = true;
        }
        if self.raw {
            sender.chunk_size = 0;
        } else if let Some(size) = self.chunk_size {
            sender.chunk_size = size;
        }
        if let Some(retries) = self.retries {
            config.retry.retries = retries;
        }
    }
}

impl TransferArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.cache_dir {
            config.receiver.cache_dir = dir.clone();
        }
    }
}
