//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// peerlink - peer-to-peer messaging and resumable file transfer.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    #[serde(default)]
    pub verbose: u8,

    /// Directory for persistent data (transfer state, logs).
    /// Defaults to ~/.peerlink/
    #[clap(long, global = true)]
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Where received files are written. Defaults to <data-dir>/downloads.
    #[clap(long, global = true)]
    #[serde(default)]
    pub download_dir: Option<PathBuf>,

    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Send a file between two in-process peers over a loopback connection.
    Demo {
        /// File to transfer.
        file: PathBuf,
    },
    /// Generate an X25519 key pair (base64).
    Keygen,
    /// List persisted transfer progress.
    Transfers,
    /// Encrypt a message for a recipient.
    Seal {
        /// Recipient public key (base64).
        #[arg(long)]
        to: String,
        /// Sender secret key (base64).
        #[arg(long)]
        secret: String,
        text: String,
    },
    /// Decrypt a sealed message.
    Open {
        /// Sender public key (base64).
        #[arg(long)]
        from: String,
        /// Recipient secret key (base64).
        #[arg(long)]
        secret: String,
        /// Nonce (base64).
        #[arg(long)]
        nonce: String,
        /// Ciphertext (base64).
        ciphertext: String,
    },
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        cli_args.data_dir = cli_args.data_dir.map(Self::resolve_path);
        cli_args.download_dir = cli_args.download_dir.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        Self::from_toml(&content)
    }

    fn from_toml(content: &str) -> Option<Self> {
        toml::from_str::<Args>(content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.data_dir.is_some() {
            file.data_dir = cli.data_dir;
        }
        if cli.download_dir.is_some() {
            file.download_dir = cli.download_dir;
        }
        file.command = cli.command;
        file
    }

    pub fn download_dir(&self, data_dir: &Path) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("downloads"))
    }
}
