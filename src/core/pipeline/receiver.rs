//! Receiver side: reassembly keyed by sequence number, periodic acks,
//! and delivery of completed payloads.
//!
//! # Reassembly
//!
//! Chunks are stored by `seq`, not by arrival order, and concatenated in
//! sequence order at chunk-end. A gap at chunk-end is an integrity error:
//! the buffer is kept so a resumed sender can fill it and send a new
//! chunk-end.
//!
//! Once file-meta is known every accepted chunk is also written at its
//! offset in `<data_dir>/partial/<transferId>.part`, and the persisted
//! receiver view lists the chunks held there. A receiver restarted mid
//! transfer rebuilds its buffer from that file, so the sender's
//! `lastAckedSeq + 1` resume point stays valid. Acks only cover chunks that
//! reached the part file.
//!
//! # Chunks before file-meta
//!
//! file-meta travels over the relay while chunks travel over the data
//! channel, so chunks can win the race. They are buffered in memory
//! (bounded) and validated once meta arrives; a chunk-end seen before meta
//! is remembered and the transfer finalizes when meta lands.

use super::chunk::TransferMeta;
use super::{notify, ChannelFrame, TransferEngine, TransferEvent};
use crate::core::config::{MAX_PENDING_CHUNKS_PER_TRANSFER, MAX_PENDING_TRANSFER_IDS, PARTIAL_DIR_NAME};
use crate::core::persistence::ReceiverProgress;
use crate::error::{PeerError, Result};
use crate::utils::atomic_write::atomic_write;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, error, info, warn};

// ── Reassembly ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkWriteResult {
    Written,
    /// Same `seq` already held (e.g. re-sent after a resume).
    Duplicate,
}

#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    meta: Option<TransferMeta>,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
    end_requested: bool,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_meta(meta: TransferMeta) -> Self {
        Self {
            meta: Some(meta),
            ..Self::default()
        }
    }

    pub fn meta(&self) -> Option<&TransferMeta> {
        self.meta.as_ref()
    }

    /// Install the transfer contract and drop buffered chunks that violate it.
    ///
    /// Returns `true` when the held chunks were buffered without meta and
    /// still need to be written to the part file. A re-announce with a
    /// different geometry discards everything held.
    pub fn set_meta(&mut self, meta: TransferMeta) -> bool {
        let first = match &self.meta {
            None => true,
            Some(old) => {
                if old.total_size != meta.total_size || old.chunk_size != meta.chunk_size {
                    warn!(
                        event = "file_meta_changed",
                        transfer_id = %meta.transfer_id,
                        held = self.chunks.len(),
                        "Transfer re-announced with a different layout, starting over"
                    );
                    self.chunks.clear();
                    self.received_bytes = 0;
                }
                false
            }
        };

        let invalid: Vec<u32> = self
            .chunks
            .iter()
            .filter(|(seq, data)| **seq >= meta.total_chunks || data.len() != meta.expected_len(**seq))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in invalid {
            warn!(
                event = "pre_meta_chunk_dropped",
                transfer_id = %meta.transfer_id,
                seq,
                "Buffered chunk does not fit file-meta"
            );
            self.discard(seq);
        }
        self.meta = Some(meta);
        first
    }

    /// Store one decoded chunk. Exact decoded length is accounted.
    pub fn write_chunk(&mut self, seq: u32, data: Vec<u8>) -> Result<ChunkWriteResult> {
        match &self.meta {
            Some(meta) => {
                if seq >= meta.total_chunks {
                    return Err(PeerError::FrameParse(format!(
                        "chunk seq {seq} >= total_chunks {}",
                        meta.total_chunks
                    )));
                }
                let expected = meta.expected_len(seq);
                if data.len() != expected {
                    return Err(PeerError::FrameParse(format!(
                        "chunk {seq} has {} bytes, expected {expected}",
                        data.len()
                    )));
                }
            }
            None => {
                if !self.chunks.contains_key(&seq)
                    && self.chunks.len() >= MAX_PENDING_CHUNKS_PER_TRANSFER
                {
                    return Err(PeerError::FrameParse(format!(
                        "pre-meta buffer full, dropping chunk {seq}"
                    )));
                }
            }
        }

        if self.chunks.contains_key(&seq) {
            return Ok(ChunkWriteResult::Duplicate);
        }
        self.received_bytes += data.len() as u64;
        self.chunks.insert(seq, data);
        Ok(ChunkWriteResult::Written)
    }

    pub fn chunk(&self, seq: u32) -> Option<&[u8]> {
        self.chunks.get(&seq).map(Vec::as_slice)
    }

    /// Forget one chunk, e.g. when it could not be written to disk.
    pub fn discard(&mut self, seq: u32) {
        if let Some(data) = self.chunks.remove(&seq) {
            self.received_bytes -= data.len() as u64;
        }
    }

    pub fn held_seqs(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Highest `n` such that every chunk `0..=n` is held; -1 if chunk 0 is missing.
    pub fn last_contiguous_seq(&self) -> i64 {
        let mut next = 0u32;
        for seq in self.chunks.keys() {
            if *seq != next {
                break;
            }
            next += 1;
        }
        next as i64 - 1
    }

    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        let total = self.meta.as_ref().map_or(0, |m| m.total_chunks);
        (0..total).filter(|s| !self.chunks.contains_key(s)).collect()
    }

    pub fn progress(&self) -> ReceiverProgress {
        ReceiverProgress {
            last_seq_received: self.last_contiguous_seq(),
            received_chunks: self.received_chunks(),
            received_bytes: self.received_bytes,
            total_chunks: self.meta.as_ref().map(|m| m.total_chunks),
            file_name: self.meta.as_ref().map(|m| m.file_name.clone()),
            total_size: self.meta.as_ref().map(|m| m.total_size),
            chunk_size: self.meta.as_ref().map(|m| m.chunk_size),
            buffered_chunks: self.held_seqs(),
        }
    }

    /// Concatenate all chunks in sequence order. Requires meta, a full
    /// `0..total_chunks` range and exactly `total_size` bytes.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| PeerError::UnknownTransfer("file-meta not received".into()))?;

        let missing = self.missing_chunks();
        if !missing.is_empty() || self.received_bytes != meta.total_size {
            return Err(PeerError::TransferIntegrity {
                transfer_id: meta.transfer_id.clone(),
                missing,
                received: self.received_bytes,
                expected: meta.total_size,
            });
        }

        let mut out = Vec::with_capacity(self.received_bytes as usize);
        for data in self.chunks.values() {
            out.extend_from_slice(data);
        }
        Ok(out)
    }
}

// ── Ack monotonicity ───────────────────────────────────────────────────────────

/// Reports an ack only when the observed sequence moves past the last report.
#[derive(Debug)]
pub struct AckTracker {
    last_reported: i64,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self { last_reported: -1 }
    }
}

impl AckTracker {
    pub fn advance(&mut self, observed: i64) -> Option<i64> {
        if observed > self.last_reported {
            self.last_reported = observed;
            Some(observed)
        } else {
            None
        }
    }
}

/// What one ack tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckTick {
    Sent,
    Idle,
    /// No buffer left for the transfer.
    Gone,
}

// ── Output ─────────────────────────────────────────────────────────────────────

/// Reduce an adversarial file name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.replace('\\', "/");
    let last = last.rsplit('/').next().unwrap_or_default();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let trimmed = safe.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "file.bin".to_string()
    } else {
        trimmed.to_string()
    }
}

fn save_payload(dir: &Path, file_name: &str, payload: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(sanitize_file_name(file_name));
    atomic_write(&path, payload)?;
    Ok(path)
}

// ── Part files ─────────────────────────────────────────────────────────────────

async fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

async fn read_at(file: &mut tokio::fs::File, range: Range<u64>) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

// ── Engine receive path ────────────────────────────────────────────────────────

impl TransferEngine {
    /// `file-meta` arrived over the relay. Meta whose geometry does not add
    /// up is rejected with [`PeerError::FrameParse`].
    pub async fn handle_file_meta(self: &Arc<Self>, meta: TransferMeta) -> Result<()> {
        if let Err(e) = meta.validate() {
            warn!(event = "file_meta_rejected", transfer_id = %meta.transfer_id, error = %e);
            return Err(e);
        }
        let transfer_id = meta.transfer_id.clone();
        if self.finished_total(&transfer_id).is_some() {
            debug!(%transfer_id, "File-meta for a finished transfer");
            return Ok(());
        }
        info!(
            event = "file_meta_received",
            transfer_id = %transfer_id,
            file_name = %meta.file_name,
            total_size = meta.total_size,
            total_chunks = meta.total_chunks,
            "Incoming transfer announced"
        );

        let end_requested = {
            let mut incoming = self.incoming.lock().await;
            if !incoming.contains_key(&transfer_id) {
                let buf = self.restore_buffer(&transfer_id).await.unwrap_or_default();
                incoming.insert(transfer_id.clone(), buf);
            }
            let Some(buf) = incoming.get_mut(&transfer_id) else {
                return Ok(());
            };
            if buf.set_meta(meta) {
                self.spill_all(&transfer_id, buf).await;
            }
            self.persist_receiver(&transfer_id, buf.progress()).await;
            buf.end_requested
        };

        self.start_ack_timer(&transfer_id);

        if end_requested {
            debug!(%transfer_id, "Chunk-end preceded file-meta, finalizing now");
            self.handle_chunk_end(&transfer_id).await;
        }
        Ok(())
    }

    pub(crate) async fn handle_chunk(self: &Arc<Self>, transfer_id: &str, seq: u32, data: Vec<u8>) {
        if self.finished_total(transfer_id).is_some() {
            debug!(transfer_id, seq, "Chunk for a finished transfer");
            return;
        }
        let len = data.len();
        let outcome = {
            let mut incoming = self.incoming.lock().await;
            let Some(buf) = self.buffer_for(&mut incoming, transfer_id).await else {
                warn!(
                    event = "pre_meta_transfer_rejected",
                    transfer_id,
                    seq,
                    "Too many transfers awaiting file-meta"
                );
                return;
            };
            let mut outcome = buf.write_chunk(seq, data);
            if matches!(outcome, Ok(ChunkWriteResult::Written)) {
                let spilled = self.spill_chunk(transfer_id, buf, seq).await;
                if let Err(e) = spilled {
                    buf.discard(seq);
                    outcome = Err(PeerError::Io(e));
                }
            }
            let progress = buf.progress();
            if matches!(outcome, Ok(ChunkWriteResult::Written)) {
                self.persist_receiver(transfer_id, progress.clone()).await;
            }
            outcome.map(|r| (r, progress))
        };

        match outcome {
            Ok((ChunkWriteResult::Written, progress)) => {
                debug!(event = "chunk_received", transfer_id, seq, bytes = len);
                notify(
                    &self.events,
                    TransferEvent::ReceiveProgress {
                        transfer_id: transfer_id.to_string(),
                        received_chunks: progress.received_chunks,
                        total_chunks: progress.total_chunks,
                        received_bytes: progress.received_bytes,
                    },
                );
                self.start_ack_timer(transfer_id);
            }
            Ok((ChunkWriteResult::Duplicate, _)) => {
                debug!(event = "chunk_duplicate", transfer_id, seq);
            }
            Err(e) => {
                warn!(event = "chunk_rejected", transfer_id, seq, error = %e);
            }
        }
    }

    pub(crate) async fn handle_chunk_end(self: &Arc<Self>, transfer_id: &str) {
        if let Some(total) = self.finished_total(transfer_id) {
            debug!(transfer_id, "Chunk-end for a finished transfer, repeating final ack");
            self.send_final_ack(transfer_id, total).await;
            return;
        }

        let assembled = {
            let mut incoming = self.incoming.lock().await;
            let Some(buf) = self.buffer_for(&mut incoming, transfer_id).await else {
                warn!(event = "chunk_end_unknown", transfer_id, "Too many transfers awaiting file-meta");
                return;
            };
            buf.end_requested = true;
            let Some(meta) = buf.meta.clone() else {
                debug!(transfer_id, "Chunk-end before file-meta, deferring");
                return;
            };
            match buf.assemble() {
                Ok(payload) => {
                    incoming.remove(transfer_id);
                    Ok((meta, payload))
                }
                Err(e) => {
                    buf.end_requested = false;
                    Err(e)
                }
            }
        };

        match assembled {
            Ok((meta, payload)) => self.complete_receive(meta, payload).await,
            Err(e) => {
                error!(
                    event = "transfer_integrity_failure",
                    transfer_id,
                    error = %e,
                    "Chunk-end with missing chunks; keeping buffer for resume"
                );
                notify(
                    &self.events,
                    TransferEvent::TransferFailed {
                        transfer_id: transfer_id.to_string(),
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    async fn complete_receive(self: &Arc<Self>, meta: TransferMeta, payload: Vec<u8>) {
        let transfer_id = meta.transfer_id.clone();
        self.stop_ack_timer(&transfer_id);
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(transfer_id.clone(), meta.total_chunks);
        }

        self.send_final_ack(&transfer_id, meta.total_chunks).await;

        if let Err(e) = self.store.clear_receiver(&transfer_id).await {
            warn!(event = "transfer_state_clear_failed", %transfer_id, error = %e);
        }
        let partial = self.partial_path(&transfer_id);
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(event = "partial_remove_failed", path = %partial.display(), error = %e);
            }
        }

        let saved_to = match &self.settings.download_dir {
            Some(dir) => match save_payload(dir, &meta.file_name, &payload) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!(event = "file_save_failed", %transfer_id, error = %e);
                    notify(&self.events, TransferEvent::Error(format!("Failed to save {}: {e}", meta.file_name)));
                    None
                }
            },
            None => None,
        };

        info!(
            event = "file_received",
            %transfer_id,
            file_name = %meta.file_name,
            bytes = payload.len(),
            "Transfer complete"
        );
        notify(
            &self.events,
            TransferEvent::FileReceived {
                transfer_id,
                file_name: meta.file_name,
                data: bytes::Bytes::from(payload),
                saved_to,
            },
        );
    }

    async fn send_final_ack(&self, transfer_id: &str, total_chunks: u32) {
        let ack = ChannelFrame::Ack {
            transfer_id: transfer_id.to_string(),
            last_seq: total_chunks as i64 - 1,
        };
        if let Err(e) = self.send_frame(&ack).await {
            warn!(event = "final_ack_failed", transfer_id, error = %e);
        }
    }

    fn finished_total(&self, transfer_id: &str) -> Option<u32> {
        self.finished
            .lock()
            .ok()
            .and_then(|f| f.get(transfer_id).copied())
    }

    /// The live buffer for `transfer_id`, one restored from an earlier run,
    /// or a fresh pre-meta buffer if the pending bound allows another.
    async fn buffer_for<'a>(
        &self,
        incoming: &'a mut HashMap<String, ReassemblyBuffer>,
        transfer_id: &str,
    ) -> Option<&'a mut ReassemblyBuffer> {
        if !incoming.contains_key(transfer_id) {
            let buf = match self.restore_buffer(transfer_id).await {
                Some(buf) => buf,
                None => {
                    let pending = incoming.values().filter(|b| b.meta.is_none()).count();
                    if pending >= MAX_PENDING_TRANSFER_IDS {
                        return None;
                    }
                    debug!(transfer_id, "Buffering before file-meta");
                    ReassemblyBuffer::new()
                }
            };
            incoming.insert(transfer_id.to_string(), buf);
        }
        incoming.get_mut(transfer_id)
    }

    async fn persist_receiver(&self, transfer_id: &str, progress: ReceiverProgress) {
        if let Err(e) = self
            .store
            .update(transfer_id, |s| s.receiver = Some(progress))
            .await
        {
            warn!(event = "transfer_state_save_failed", transfer_id, error = %e);
        }
    }

    // ── Part file ─────────────────────────────────────────────────────────

    /// `<state dir>/partial/<transferId>.part`.
    pub(crate) fn partial_path(&self, transfer_id: &str) -> PathBuf {
        let safe: String = transfer_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .collect();
        let dir = self
            .store
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        dir.join(PARTIAL_DIR_NAME).join(format!("{safe}.part"))
    }

    /// Write chunk `seq` at its offset. Chunks held before meta have no
    /// offset yet and are skipped.
    async fn spill_chunk(&self, transfer_id: &str, buf: &ReassemblyBuffer, seq: u32) -> std::io::Result<()> {
        let (Some(meta), Some(data)) = (buf.meta(), buf.chunk(seq)) else {
            return Ok(());
        };
        write_at(&self.partial_path(transfer_id), meta.chunk_range(seq).start, data).await
    }

    async fn spill_all(&self, transfer_id: &str, buf: &mut ReassemblyBuffer) {
        for seq in buf.held_seqs() {
            if let Err(e) = self.spill_chunk(transfer_id, buf, seq).await {
                warn!(event = "chunk_spill_failed", transfer_id, seq, error = %e);
                buf.discard(seq);
            }
        }
    }

    /// Rebuild a buffer from the persisted receiver view and its part file.
    async fn restore_buffer(&self, transfer_id: &str) -> Option<ReassemblyBuffer> {
        let progress = self.store.get(transfer_id).await?.receiver?;
        let meta = TransferMeta {
            transfer_id: transfer_id.to_string(),
            file_name: progress.file_name?,
            total_size: progress.total_size?,
            total_chunks: progress.total_chunks?,
            chunk_size: progress.chunk_size?,
        };
        meta.validate().ok()?;

        let mut buf = ReassemblyBuffer::with_meta(meta.clone());
        let path = self.partial_path(transfer_id);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(event = "partial_restore_failed", transfer_id, path = %path.display(), error = %e);
                return Some(buf);
            }
        };
        for seq in progress.buffered_chunks {
            if seq >= meta.total_chunks {
                continue;
            }
            match read_at(&mut file, meta.chunk_range(seq)).await {
                Ok(data) => {
                    if let Err(e) = buf.write_chunk(seq, data) {
                        warn!(event = "partial_chunk_invalid", transfer_id, seq, error = %e);
                    }
                }
                Err(e) => warn!(event = "partial_chunk_unreadable", transfer_id, seq, error = %e),
            }
        }
        info!(
            event = "receive_restored",
            transfer_id,
            chunks = buf.received_chunks(),
            total_chunks = meta.total_chunks,
            "Restored partial transfer"
        );
        Some(buf)
    }

    // ── Ack timer ─────────────────────────────────────────────────────────

    /// Start the per-transfer ack emitter; no-op if already running. The
    /// emitter stops itself once the transfer is gone or after
    /// `ack_idle_ticks` ticks without progress.
    pub fn start_ack_timer(self: &Arc<Self>, transfer_id: &str) {
        let Ok(mut timers) = self.ack_timers.lock() else {
            return;
        };
        if timers.contains_key(transfer_id) {
            return;
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        let id = transfer_id.to_string();
        let interval = self.settings.ack_interval;
        let idle_limit = self.settings.ack_idle_ticks.max(1);
        let handle = tokio::spawn(async move {
            let mut tracker = AckTracker::default();
            let mut idle = 0u32;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.emit_ack(&id, &mut tracker).await {
                    AckTick::Sent => idle = 0,
                    AckTick::Idle => {
                        idle += 1;
                        if idle >= idle_limit {
                            debug!(event = "ack_timer_idle", transfer_id = %id, ticks = idle);
                            engine.forget_ack_timer(&id);
                            break;
                        }
                    }
                    AckTick::Gone => {
                        engine.forget_ack_timer(&id);
                        break;
                    }
                }
            }
        });
        timers.insert(transfer_id.to_string(), handle);
    }

    /// Stop the ack emitter for one transfer.
    pub fn stop_ack_timer(&self, transfer_id: &str) {
        if let Ok(mut timers) = self.ack_timers.lock() {
            if let Some(handle) = timers.remove(transfer_id) {
                handle.abort();
            }
        }
    }

    pub fn stop_all_ack_timers(&self) {
        if let Ok(mut timers) = self.ack_timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }

    /// Drop the handle of an emitter that is exiting on its own.
    fn forget_ack_timer(&self, transfer_id: &str) {
        if let Ok(mut timers) = self.ack_timers.lock() {
            timers.remove(transfer_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn running_ack_timers(&self) -> usize {
        self.ack_timers.lock().map(|t| t.len()).unwrap_or_default()
    }

    async fn emit_ack(&self, transfer_id: &str, tracker: &mut AckTracker) -> AckTick {
        let observed = {
            let incoming = self.incoming.lock().await;
            match incoming.get(transfer_id) {
                None => return AckTick::Gone,
                // Nothing is on disk before meta.
                Some(buf) if buf.meta().is_none() => return AckTick::Idle,
                Some(buf) => buf.last_contiguous_seq(),
            }
        };
        let Some(last_seq) = tracker.advance(observed) else {
            return AckTick::Idle;
        };

        let ack = ChannelFrame::Ack {
            transfer_id: transfer_id.to_string(),
            last_seq,
        };
        match self.send_frame(&ack).await {
            Ok(()) => debug!(event = "ack_sent", transfer_id, last_seq),
            Err(e) => warn!(event = "ack_send_failed", transfer_id, last_seq, error = %e),
        }

        // Persist under the buffer lock so a concurrent completion cannot be
        // followed by a stale write.
        let incoming = self.incoming.lock().await;
        if let Some(buf) = incoming.get(transfer_id) {
            self.persist_receiver(transfer_id, buf.progress()).await;
        }
        AckTick::Sent
    }
}
