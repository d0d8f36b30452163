//! Sender side: file-meta, paced chunk loop, resume, and ack handling.
//!
//! ```text
//! publish file-meta (relay) ──► for seq in resume_from..total:
//!                                   check SignalOfStop
//!                                   read range, base64, send "chunk"
//!                                   persist lastSentSeq
//!                                   sleep pacing
//!                               send "chunk-end"
//! ```
//!
//! Acks from the receiver advance `lastAckedSeq` monotonically; once the
//! final chunk is acknowledged the sender view is deleted from the store.

use super::chunk::{new_transfer_id, TransferMeta};
use super::{notify, ChannelFrame, TransferEngine, TransferEvent};
use crate::core::persistence::SenderProgress;
use crate::core::signaling::{publish_with_retry, SignalKind, SignalMessage};
use crate::error::{PeerError, Result};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use serde_json::json;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, info, warn};

/// Where outgoing bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Path(PathBuf),
    Memory { name: String, data: Bytes },
}

impl FileSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        FileSource::Path(path.into())
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        FileSource::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Display name announced in file-meta.
    pub fn name(&self) -> String {
        match self {
            FileSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file.bin".to_string()),
            FileSource::Memory { name, .. } => name.clone(),
        }
    }

    pub async fn len(&self) -> Result<u64> {
        match self {
            FileSource::Path(path) => Ok(tokio::fs::metadata(path).await?.len()),
            FileSource::Memory { data, .. } => Ok(data.len() as u64),
        }
    }

    async fn open(&self) -> Result<ChunkReader> {
        match self {
            FileSource::Path(path) => Ok(ChunkReader::File(tokio::fs::File::open(path).await?)),
            FileSource::Memory { data, .. } => Ok(ChunkReader::Memory(data.clone())),
        }
    }
}

enum ChunkReader {
    File(tokio::fs::File),
    Memory(Bytes),
}

impl ChunkReader {
    async fn read(&mut self, range: Range<u64>) -> Result<Vec<u8>> {
        match self {
            ChunkReader::File(file) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            ChunkReader::Memory(data) => Ok(data[range.start as usize..range.end as usize].to_vec()),
        }
    }
}

/// Tie a mid-transfer failure to the transfer it left behind.
fn interrupted(transfer_id: &str, err: PeerError) -> PeerError {
    match err {
        PeerError::Cancelled { .. } | PeerError::Interrupted { .. } => err,
        other => {
            warn!(event = "transfer_interrupted", transfer_id, error = %other);
            PeerError::Interrupted {
                transfer_id: transfer_id.to_string(),
                source: Box::new(other),
            }
        }
    }
}

impl TransferEngine {
    /// Start a new transfer to `destination`. Returns once chunk-end has been
    /// written; delivery is confirmed later by acks.
    ///
    /// Nothing is persisted when the channel is not open or file-meta cannot
    /// be published. Any later failure leaves the transfer resumable and the
    /// error carries its id ([`PeerError::Cancelled`] or
    /// [`PeerError::Interrupted`]).
    pub async fn send_file(
        self: &Arc<Self>,
        source: FileSource,
        destination: &str,
        cancel: &SignalOfStop,
    ) -> Result<TransferMeta> {
        let meta = TransferMeta::new(
            new_transfer_id(),
            source.name(),
            source.len().await?,
            self.settings.chunk_size,
        );

        // Fail before recording anything if there is nowhere to send.
        self.open_sink().await?;

        let progress = SenderProgress::new(&meta.file_name, meta.total_size, meta.total_chunks);
        self.store
            .update(&meta.transfer_id, |s| s.sender = Some(progress))
            .await?;

        info!(
            event = "transfer_started",
            transfer_id = %meta.transfer_id,
            file_name = %meta.file_name,
            total_size = meta.total_size,
            total_chunks = meta.total_chunks,
            destination,
            "Sending file"
        );
        match self.run_send(&meta, &source, destination, 0, cancel).await {
            Ok(()) => Ok(meta),
            Err(e @ PeerError::Signaling(_)) => {
                // The receiver never heard of it; nothing to resume.
                if let Err(clear) = self.store.clear_sender(&meta.transfer_id).await {
                    warn!(event = "transfer_state_clear_failed", transfer_id = %meta.transfer_id, error = %clear);
                }
                Err(e)
            }
            Err(e) => Err(interrupted(&meta.transfer_id, e)),
        }
    }

    /// Continue a persisted transfer from `lastAckedSeq + 1`. The source must
    /// have the size recorded when the transfer started.
    pub async fn resume_file(
        self: &Arc<Self>,
        transfer_id: &str,
        source: FileSource,
        destination: &str,
        cancel: &SignalOfStop,
    ) -> Result<TransferMeta> {
        let progress = self
            .store
            .get(transfer_id)
            .await
            .and_then(|s| s.sender)
            .ok_or_else(|| PeerError::UnknownTransfer(transfer_id.to_string()))?;

        let size = source.len().await?;
        if size != progress.total_size {
            return Err(PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "source is {size} bytes, transfer {transfer_id} expects {}",
                    progress.total_size
                ),
            )));
        }

        let meta = TransferMeta::new(
            transfer_id.to_string(),
            progress.file_name.clone(),
            size,
            self.settings.chunk_size,
        );
        if progress.completed {
            info!(event = "transfer_already_complete", transfer_id);
            return Ok(meta);
        }

        let start = progress.resume_from();
        info!(
            event = "transfer_resumed",
            transfer_id,
            from_seq = start,
            total_chunks = meta.total_chunks,
            "Resuming file"
        );
        self.run_send(&meta, &source, destination, start, cancel)
            .await
            .map_err(|e| interrupted(transfer_id, e))?;
        Ok(meta)
    }

    async fn run_send(
        &self,
        meta: &TransferMeta,
        source: &FileSource,
        destination: &str,
        start: u32,
        cancel: &SignalOfStop,
    ) -> Result<()> {
        let transfer_id = meta.transfer_id.as_str();

        self.open_sink().await?;

        publish_with_retry(
            self.signaling.as_ref(),
            SignalMessage::new(
                &self.local_id,
                destination,
                SignalKind::FileMeta,
                serde_json::to_value(meta)?,
            ),
        )
        .await?;

        let mut reader = source.open().await?;
        for seq in start..meta.total_chunks {
            if cancel.cancelled() {
                info!(event = "transfer_cancelled", transfer_id, seq);
                return Err(PeerError::Cancelled {
                    transfer_id: transfer_id.to_string(),
                });
            }

            let sink = self.open_sink().await?;
            let data = reader.read(meta.chunk_range(seq)).await?;
            let frame = ChannelFrame::Chunk {
                transfer_id: transfer_id.to_string(),
                seq,
                data,
            };
            sink.send_text(frame.to_text()?).await?;

            self.store
                .update(transfer_id, |s| {
                    if let Some(p) = s.sender.as_mut() {
                        p.last_sent_seq = p.last_sent_seq.max(seq as i64);
                    }
                })
                .await?;

            debug!(event = "chunk_sent", transfer_id, seq);
            notify(
                &self.events,
                TransferEvent::SendProgress {
                    transfer_id: transfer_id.to_string(),
                    sent_chunks: seq + 1,
                    total_chunks: meta.total_chunks,
                },
            );

            if cancel.select(tokio::time::sleep(self.settings.pacing)).await.is_none() {
                info!(event = "transfer_cancelled", transfer_id, seq);
                return Err(PeerError::Cancelled {
                    transfer_id: transfer_id.to_string(),
                });
            }
        }

        self.send_frame(&ChannelFrame::ChunkEnd {
            transfer_id: transfer_id.to_string(),
        })
        .await?;

        info!(event = "chunk_end_sent", transfer_id, total_chunks = meta.total_chunks);
        notify(
            &self.events,
            TransferEvent::SendComplete {
                transfer_id: transfer_id.to_string(),
            },
        );
        Ok(())
    }

    /// Receiver acknowledged every chunk up to `last_seq`.
    pub(crate) async fn handle_ack(&self, transfer_id: &str, last_seq: i64) {
        let chunk_size = self.settings.chunk_size as u64;
        let outcome = self
            .store
            .update(transfer_id, |s| {
                let p = s.sender.as_mut()?;
                let capped = last_seq.min(p.total_chunks as i64 - 1);
                if capped > p.last_acked_seq {
                    p.last_acked_seq = capped;
                    p.offset = ((capped + 1) as u64 * chunk_size).min(p.total_size);
                }
                if p.last_acked_seq >= p.total_chunks as i64 - 1 {
                    p.completed = true;
                }
                Some((p.last_acked_seq, p.completed))
            })
            .await;

        match outcome {
            Ok(Some((acked, completed))) => {
                debug!(event = "ack_received", transfer_id, last_seq, acked);
                notify(
                    &self.events,
                    TransferEvent::AckReceived {
                        transfer_id: transfer_id.to_string(),
                        last_seq: acked,
                    },
                );
                if completed {
                    if let Err(e) = self.store.clear_sender(transfer_id).await {
                        warn!(event = "transfer_state_clear_failed", transfer_id, error = %e);
                    }
                    info!(event = "transfer_delivered", transfer_id);
                    notify(
                        &self.events,
                        TransferEvent::Delivered {
                            transfer_id: transfer_id.to_string(),
                        },
                    );
                }
            }
            Ok(None) => debug!(event = "ack_unknown_transfer", transfer_id, last_seq),
            Err(e) => warn!(event = "transfer_state_save_failed", transfer_id, error = %e),
        }
    }

    /// Send a free-form JSON message on the data channel.
    pub async fn send_message(&self, message: &serde_json::Value) -> Result<()> {
        let sink = self.open_sink().await?;
        sink.send_text(serde_json::to_string(message)?).await
    }

    /// Convenience chat message: `{"type":"message","text":...}`.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(&json!({ "type": "message", "text": text }))
            .await
    }
}
