//! Durable per-transfer progress, keyed by transfer id.
//!
//! The whole mapping lives in a single JSON slot (`transfer_state.json` in
//! the data directory) that is read and written wholesale. A missing or
//! corrupt slot decodes to an empty mapping.
//!
//! `load`/`save` are last-writer-wins. Every read-modify-write in this crate
//! goes through [`TransferStateStore::update`], which holds the store lock
//! for the whole sequence so concurrent sender loops and ack timers cannot
//! interleave on the same slot.

use crate::core::config::TRANSFER_STATE_FILE;
use crate::error::Result;
use crate::utils::atomic_write::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// Sender view of a transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SenderProgress {
    /// Byte offset covered by acknowledged chunks.
    pub offset: u64,
    /// Highest chunk the receiver acknowledged; -1 before the first ack.
    pub last_acked_seq: i64,
    /// Highest chunk written to the data channel; -1 before the first send.
    pub last_sent_seq: i64,
    pub total_chunks: u32,
    pub completed: bool,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub total_size: u64,
}

impl SenderProgress {
    pub fn new(file_name: &str, total_size: u64, total_chunks: u32) -> Self {
        Self {
            offset: 0,
            last_acked_seq: -1,
            last_sent_seq: -1,
            total_chunks,
            completed: false,
            file_name: file_name.to_string(),
            total_size,
        }
    }

    /// First chunk to send when (re)starting.
    pub fn resume_from(&self) -> u32 {
        (self.last_acked_seq + 1).max(0) as u32
    }
}

/// Receiver view of a transfer. Chunk bytes live in the transfer's part
/// file; `buffered_chunks` lists the sequence numbers written there, so a
/// restarted receiver can pick up where it stopped.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverProgress {
    /// Highest contiguous sequence received; -1 before chunk 0.
    pub last_seq_received: i64,
    pub received_chunks: u32,
    /// Exact decoded bytes received.
    pub received_bytes: u64,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub total_size: Option<u64>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub buffered_chunks: Vec<u32>,
}

impl Default for ReceiverProgress {
    fn default() -> Self {
        Self {
            last_seq_received: -1,
            received_chunks: 0,
            received_bytes: 0,
            total_chunks: None,
            file_name: None,
            total_size: None,
            chunk_size: None,
            buffered_chunks: Vec::new(),
        }
    }
}

/// Both role views for one transfer id. A loopback session that sends to
/// itself keeps the two views apart.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TransferState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<ReceiverProgress>,
}

impl TransferState {
    fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

pub type TransferStates = HashMap<String, TransferState>;

pub struct TransferStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TransferStateStore {
    /// Store backed by an explicit slot path.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store backed by the well-known slot in the global data directory.
    pub fn open_default() -> Self {
        Self::open(crate::utils::data_dir::get().join(TRANSFER_STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole mapping. Missing or undecodable slots yield an empty map.
    pub fn load(&self) -> TransferStates {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(event = "transfer_state_read_failed", path = %self.path.display(), %e);
                return HashMap::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(
                event = "transfer_state_corrupt",
                path = %self.path.display(),
                %e,
                "Discarding undecodable transfer state"
            );
            HashMap::new()
        })
    }

    /// Replace the whole mapping.
    pub fn save(&self, states: &TransferStates) -> Result<()> {
        let content = serde_json::to_vec_pretty(states)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    /// State for one transfer id, if any.
    pub async fn get(&self, transfer_id: &str) -> Option<TransferState> {
        let _guard = self.lock.lock().await;
        self.load().remove(transfer_id)
    }

    /// Atomic read-modify-write of one transfer's state. An entry left with
    /// neither view is removed from the slot.
    pub async fn update<F, T>(&self, transfer_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut TransferState) -> T,
    {
        let _guard = self.lock.lock().await;
        let mut states = self.load();
        let entry = states.entry(transfer_id.to_string()).or_default();
        let out = f(entry);
        if entry.is_empty() {
            states.remove(transfer_id);
        }
        self.save(&states)?;
        Ok(out)
    }

    /// Drop one role view of a transfer (on completion or abandonment).
    pub async fn clear_sender(&self, transfer_id: &str) -> Result<()> {
        self.update(transfer_id, |s| s.sender = None).await
    }

    pub async fn clear_receiver(&self, transfer_id: &str) -> Result<()> {
        self.update(transfer_id, |s| s.receiver = None).await
    }
}
