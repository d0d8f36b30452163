//! Centralized configuration constants for peerlink.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (frame `type` strings, signal kinds)
//! stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Fixed chunk size in bytes (128 KB).
///
/// Every chunk except the last covers exactly this many bytes of the file.
/// Base64 inflates it to ~175 KB on the wire, which is why the SCTP send
/// limit below is raised.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Delay between consecutive chunk frames. A flow-control floor, not adaptive.
pub const CHUNK_PACING: Duration = Duration::from_millis(10);

/// Interval of the receiver's acknowledgement emitter.
pub const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive ack ticks without progress after which a transfer's ack
/// emitter stops. The next accepted chunk starts it again.
pub const ACK_IDLE_TICKS: u32 = 30;

// ── Safety / Abuse Prevention ────────────────────────────────────────────────

/// Maximum chunks buffered per transfer before its file-meta arrives.
pub const MAX_PENDING_CHUNKS_PER_TRANSFER: usize = 64;

/// Maximum number of distinct transfer ids buffered before file-meta.
pub const MAX_PENDING_TRANSFER_IDS: usize = 16;

/// Largest `chunkSize` accepted in a peer's file-meta. A bigger chunk could
/// never fit in one SCTP message.
pub const MAX_CHUNK_SIZE: usize = SCTP_MAX_MESSAGE_SIZE as usize;

// ── Signaling ────────────────────────────────────────────────────────────────

/// Delays between signaling publish attempts. The first attempt is
/// immediate; one retry follows per entry.
pub const SIGNAL_PUBLISH_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single ordered data channel opened per session.
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Default STUN server used for host/server-reflexive candidates.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Explicit SCTP max message size (1 MiB) so base64 chunk frames fit.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Timeout waiting for the data channel to open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Peer connection establishment timeout.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote candidates kept while no remote description is applied.
pub const MAX_PENDING_CANDIDATES: usize = 64;

// ── Persistence ──────────────────────────────────────────────────────────────

/// Well-known slot holding the JSON transfer-state mapping.
pub const TRANSFER_STATE_FILE: &str = "transfer_state.json";

/// Directory (beside the state slot) holding `<transferId>.part` files with
/// the chunks an unfinished receive has written so far.
pub const PARTIAL_DIR_NAME: &str = "partial";

/// Default data directory name under the user's home.
pub const DATA_DIR_NAME: &str = ".peerlink";
