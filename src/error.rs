//! Error taxonomy for the peer session and transfer protocol.
//!
//! Recoverable conditions (frame parse errors, missing media) are logged and
//! degraded by the component that hits them; the variants here are what
//! surfaces to callers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    /// Publish or subscribe on the signaling relay failed.
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// Local media could not be captured. Sessions fall back to data-only.
    #[error("media capture failure: {0}")]
    MediaCapture(String),

    /// A data-channel frame could not be decoded.
    #[error("frame parse failure: {0}")]
    FrameParse(String),

    /// A send was attempted before the data channel reached `Open`.
    #[error("data channel not ready: {0}")]
    ChannelNotReady(String),

    /// Authenticated decryption failed. Plaintext is never returned.
    #[error("decryption failure")]
    Decryption,

    /// Chunk-end processed while the received chunks do not make up the
    /// announced file.
    #[error("transfer {transfer_id} incomplete: {received} of {expected} bytes, missing chunks {missing:?}")]
    TransferIntegrity {
        transfer_id: String,
        missing: Vec<u32>,
        received: u64,
        expected: u64,
    },

    /// An answer referenced an offer this peer never made (or already settled).
    #[error("answer for unknown offer {0}")]
    UnknownOffer(String),

    /// No persisted state exists for the transfer.
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    /// The send was aborted through its cancellation signal. Progress for
    /// `transfer_id` is kept so the transfer can be resumed.
    #[error("transfer {transfer_id} cancelled")]
    Cancelled { transfer_id: String },

    /// A send stopped after its progress was persisted. Resume with
    /// `transfer_id` once the cause is gone.
    #[error("transfer {transfer_id} interrupted: {source}")]
    Interrupted {
        transfer_id: String,
        #[source]
        source: Box<PeerError>,
    },

    /// Peer connection negotiation failed in the transport layer.
    #[error("connection failure: {0}")]
    Connection(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<webrtc::Error> for PeerError {
    fn from(e: webrtc::Error) -> Self {
        PeerError::Connection(e.to_string())
    }
}
