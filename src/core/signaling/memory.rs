//! In-process relay: an append-only row table with insert subscriptions.
//!
//! Used by the loopback demo and by tests. Rows are kept so callers can
//! inspect what was published.

use super::{SignalMessage, SignalingTransport};
use crate::error::{PeerError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    receiver_id: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Default)]
pub struct MemoryRelay {
    rows: Mutex<Vec<SignalMessage>>,
    subscribers: Mutex<Vec<Subscriber>>,
    offline: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row published so far.
    pub fn rows(&self) -> Vec<SignalMessage> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// While offline, publish and subscribe fail with a signaling error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(PeerError::Signaling("relay offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SignalingTransport for MemoryRelay {
    async fn publish(&self, message: SignalMessage) -> Result<()> {
        self.check_online()?;

        debug!(
            kind = ?message.kind,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "Relay insert"
        );

        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| PeerError::Signaling("relay state poisoned".into()))?;
        subscribers.retain(|s| !s.tx.is_closed());
        for sub in subscribers.iter() {
            if sub.receiver_id == message.receiver_id {
                let _ = sub.tx.send(message.clone());
            }
        }
        drop(subscribers);

        if let Ok(mut rows) = self.rows.lock() {
            rows.push(message);
        }
        Ok(())
    }

    async fn subscribe_inserts(
        &self,
        receiver_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| PeerError::Signaling("relay state poisoned".into()))?
            .push(Subscriber {
                receiver_id: receiver_id.to_string(),
                tx,
            });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signaling::SignalKind;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_only_to_matching_receiver() {
        let relay = MemoryRelay::new();
        let mut alice = relay.subscribe_inserts("alice").await.unwrap();
        let mut bob = relay.subscribe_inserts("bob").await.unwrap();

        relay
            .publish(SignalMessage::new("bob", "alice", SignalKind::Offer, json!({"n": 1})))
            .await
            .unwrap();

        let got = alice.recv().await.unwrap();
        assert_eq!(got.payload["n"], 1);
        assert!(bob.try_recv().is_err());
        assert_eq!(relay.rows().len(), 1);
    }

    #[tokio::test]
    async fn preserves_insert_order() {
        let relay = MemoryRelay::new();
        let mut rx = relay.subscribe_inserts("b").await.unwrap();
        for n in 0..5 {
            relay
                .publish(SignalMessage::new("a", "b", SignalKind::Ice, json!(n)))
                .await
                .unwrap();
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload, json!(n));
        }
    }

    #[tokio::test]
    async fn offline_relay_rejects_publish() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        let err = relay
            .publish(SignalMessage::new("a", "b", SignalKind::Answer, json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Signaling(_)));
        assert!(relay.rows().is_empty());
    }
}
