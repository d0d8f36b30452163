//! Chunked transfer engine.
//!
//! One engine per session serves both roles: it splits outgoing files into
//! ordered chunks on the data channel, and reassembles incoming transfers
//! announced by `file-meta`. Progress for both roles is persisted in the
//! [`TransferStateStore`] so an interrupted send resumes at
//! `lastAckedSeq + 1`.

pub mod chunk;
pub mod receiver;
pub mod router;
pub mod sender;

pub use chunk::{ChannelFrame, TransferMeta};
pub use receiver::ReassemblyBuffer;
pub use router::{DataChannelRouter, RawFrame, RouteOutcome};
pub use sender::FileSource;

use crate::core::config::{ACK_IDLE_TICKS, ACK_INTERVAL, CHUNK_PACING, CHUNK_SIZE};
use crate::core::persistence::TransferStateStore;
use crate::core::signaling::SignalingTransport;
use crate::error::{PeerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

/// Outgoing half of an ordered, reliable text channel.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    fn is_open(&self) -> bool;
}

/// Events the engine reports to the application.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    SendProgress {
        transfer_id: String,
        sent_chunks: u32,
        total_chunks: u32,
    },
    SendComplete {
        transfer_id: String,
    },
    AckReceived {
        transfer_id: String,
        last_seq: i64,
    },
    /// Receiver acknowledged every chunk; sender state was cleared.
    Delivered {
        transfer_id: String,
    },
    ReceiveProgress {
        transfer_id: String,
        received_chunks: u32,
        total_chunks: Option<u32>,
        received_bytes: u64,
    },
    FileReceived {
        transfer_id: String,
        file_name: String,
        data: Bytes,
        saved_to: Option<PathBuf>,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
    /// Any data-channel JSON whose `type` is not a transfer frame.
    AppMessage(serde_json::Value),
    Error(String),
}

pub(crate) fn notify(events: &Option<mpsc::UnboundedSender<TransferEvent>>, event: TransferEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub pacing: Duration,
    pub ack_interval: Duration,
    /// Ticks without progress before a transfer's ack emitter stops.
    pub ack_idle_ticks: u32,
    /// When set, completed receives are also written here.
    pub download_dir: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            pacing: CHUNK_PACING,
            ack_interval: ACK_INTERVAL,
            ack_idle_ticks: ACK_IDLE_TICKS,
            download_dir: None,
        }
    }
}

pub struct TransferEngine {
    local_id: String,
    signaling: Arc<dyn SignalingTransport>,
    store: Arc<TransferStateStore>,
    settings: TransferSettings,
    sink: RwLock<Option<Arc<dyn FrameSink>>>,
    incoming: Mutex<HashMap<String, ReassemblyBuffer>>,
    ack_timers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    /// Transfers received in full during this run: id -> total chunks.
    finished: std::sync::Mutex<HashMap<String, u32>>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl TransferEngine {
    pub fn new(
        local_id: impl Into<String>,
        signaling: Arc<dyn SignalingTransport>,
        store: Arc<TransferStateStore>,
        settings: TransferSettings,
        events: Option<mpsc::UnboundedSender<TransferEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            signaling,
            store,
            settings,
            sink: RwLock::new(None),
            incoming: Mutex::new(HashMap::new()),
            ack_timers: std::sync::Mutex::new(HashMap::new()),
            finished: std::sync::Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn store(&self) -> &Arc<TransferStateStore> {
        &self.store
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Attach the data channel once it opens.
    pub async fn attach_sink(&self, sink: Arc<dyn FrameSink>) {
        debug!("Transfer engine attached to data channel");
        *self.sink.write().await = Some(sink);
    }

    pub async fn detach_sink(&self) {
        *self.sink.write().await = None;
        self.stop_all_ack_timers();
    }

    /// The attached sink if it is open.
    async fn open_sink(&self) -> Result<Arc<dyn FrameSink>> {
        match self.sink.read().await.as_ref() {
            Some(sink) if sink.is_open() => Ok(sink.clone()),
            Some(_) => Err(PeerError::ChannelNotReady("data channel is not open".into())),
            None => Err(PeerError::ChannelNotReady("no data channel".into())),
        }
    }

    pub(crate) async fn send_frame(&self, frame: &ChannelFrame) -> Result<()> {
        let sink = self.open_sink().await?;
        sink.send_text(frame.to_text()?).await
    }

    /// Dispatch a parsed transfer frame.
    pub async fn handle_frame(self: &Arc<Self>, frame: ChannelFrame) {
        match frame {
            ChannelFrame::Chunk {
                transfer_id,
                seq,
                data,
            } => self.handle_chunk(&transfer_id, seq, data).await,
            ChannelFrame::ChunkEnd { transfer_id } => self.handle_chunk_end(&transfer_id).await,
            ChannelFrame::Ack {
                transfer_id,
                last_seq,
            } => self.handle_ack(&transfer_id, last_seq).await,
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop_all_ack_timers();
    }
}
