//! Signaling over an external publish/subscribe relay.
//!
//! The relay is modelled as a table of inserted rows: peers `publish` a
//! [`SignalMessage`] addressed to a receiver and `subscribe_inserts` to the
//! rows addressed to themselves. Messages are relayed once; the relay never
//! retries on its own, so [`publish_with_retry`] adds a bounded retry.
//!
//! Session descriptions, ICE candidates and file-meta travel here. Chunk data
//! travels on the data channel.

mod memory;

pub use memory::MemoryRelay;

use crate::core::config::SIGNAL_PUBLISH_RETRY_DELAYS;
use crate::error::{PeerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// Kind of a relayed signal. Serialized as the `signal_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    FileMeta,
    Chunk,
    ChunkEnd,
    Ack,
}

/// One relayed row. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(rename = "signal_type")]
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

impl SignalMessage {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            kind,
            payload,
        }
    }
}

/// Abstract publish/insert + subscribe-by-receiver primitive.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Insert one row. Errors surface as [`PeerError::Signaling`].
    async fn publish(&self, message: SignalMessage) -> Result<()>;

    /// Stream of rows inserted after this call whose `receiver_id` matches,
    /// in the order the relay assigns.
    async fn subscribe_inserts(
        &self,
        receiver_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>>;
}

/// Publish with the configured back-off schedule. The last error is
/// returned once all attempts fail.
pub async fn publish_with_retry(
    transport: &dyn SignalingTransport,
    message: SignalMessage,
) -> Result<()> {
    let mut last_err = match transport.publish(message.clone()).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    for (attempt, delay) in SIGNAL_PUBLISH_RETRY_DELAYS.iter().enumerate() {
        warn!(
            event = "signal_publish_retry",
            kind = ?message.kind,
            receiver = %message.receiver_id,
            attempt = attempt + 1,
            error = %last_err,
            "Signal publish failed, retrying"
        );
        tokio::time::sleep(*delay).await;
        match transport.publish(message.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = e,
        }
    }

    Err(match last_err {
        e @ PeerError::Signaling(_) => e,
        other => PeerError::Signaling(other.to_string()),
    })
}
