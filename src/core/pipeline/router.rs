//! Inbound data-channel dispatch.
//!
//! Text frames are parsed as JSON and routed on their `type` field:
//! transfer frames go to the [`TransferEngine`], anything else is surfaced
//! as [`TransferEvent::AppMessage`]. Binary frames are ignored. A malformed
//! frame is logged and dropped; it never touches transfer state.

use super::{notify, ChannelFrame, TransferEngine, TransferEvent};
use crate::core::signaling::{SignalKind, SignalMessage};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;

#[derive(Debug, Clone)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl From<DataChannelMessage> for RawFrame {
    fn from(msg: DataChannelMessage) -> Self {
        if msg.is_string {
            RawFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
        } else {
            RawFrame::Binary(msg.data)
        }
    }
}

/// What the router did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Transfer,
    AppMessage,
    Dropped(&'static str),
}

#[derive(Clone)]
pub struct DataChannelRouter {
    engine: Arc<TransferEngine>,
}

impl DataChannelRouter {
    pub fn new(engine: Arc<TransferEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub async fn on_frame(&self, frame: RawFrame) -> RouteOutcome {
        match frame {
            RawFrame::Binary(data) => {
                debug!(event = "binary_frame_ignored", bytes = data.len());
                RouteOutcome::Dropped("binary")
            }
            RawFrame::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => self.on_value(value).await,
                Err(e) => {
                    warn!(event = "frame_parse_failed", error = %e, len = text.len(), "Dropping non-JSON frame");
                    RouteOutcome::Dropped("not json")
                }
            },
        }
    }

    /// Route an already-parsed frame.
    pub async fn on_value(&self, value: Value) -> RouteOutcome {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !ChannelFrame::TYPES.contains(&kind.as_str()) {
            info!(event = "unknown_frame_type", %kind, "Non-transfer frame");
            notify(&self.engine.events, TransferEvent::AppMessage(value));
            return RouteOutcome::AppMessage;
        }

        match serde_json::from_value::<ChannelFrame>(value) {
            Ok(frame) => {
                self.engine.handle_frame(frame).await;
                RouteOutcome::Transfer
            }
            Err(e) => {
                warn!(event = "frame_parse_failed", %kind, error = %e, "Malformed transfer frame");
                RouteOutcome::Dropped("malformed transfer frame")
            }
        }
    }

    /// Transfer signals that arrived over the relay instead of the channel.
    pub async fn on_signal(&self, signal: SignalMessage) -> RouteOutcome {
        match signal.kind {
            SignalKind::FileMeta => match serde_json::from_value(signal.payload) {
                Ok(meta) => match self.engine.handle_file_meta(meta).await {
                    Ok(()) => RouteOutcome::Transfer,
                    Err(_) => RouteOutcome::Dropped("inconsistent file-meta"),
                },
                Err(e) => {
                    warn!(event = "frame_parse_failed", kind = "file-meta", error = %e);
                    RouteOutcome::Dropped("malformed file-meta")
                }
            },
            SignalKind::Chunk | SignalKind::ChunkEnd | SignalKind::Ack => {
                let mut value = signal.payload;
                if let Some(obj) = value.as_object_mut() {
                    let tag = serde_json::to_value(signal.kind).unwrap_or(Value::Null);
                    obj.insert("type".into(), tag);
                }
                self.on_value(value).await
            }
            SignalKind::Offer | SignalKind::Answer | SignalKind::Ice => {
                RouteOutcome::Dropped("session signal")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fast_settings, harness, test_store};
    use super::super::{FileSource, FrameSink, TransferMeta};
    use super::*;
    use crate::core::signaling::MemoryRelay;
    use crate::core::signaling::SignalingTransport;
    use crate::error::Result;
    use crate::utils::sos::SignalOfStop;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Sink that forwards frames into a channel drained by the peer's router.
    struct PipeSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl FrameSink for PipeSink {
        async fn send_text(&self, text: String) -> Result<()> {
            self.0
                .send(text)
                .map_err(|_| crate::error::PeerError::ChannelNotReady("pipe closed".into()))
        }

        fn is_open(&self) -> bool {
            !self.0.is_closed()
        }
    }

    struct Peer {
        engine: Arc<TransferEngine>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
    }

    /// Two engines joined by an in-memory pipe and a shared relay.
    async fn connected_pair(name: &str) -> (Peer, Peer) {
        let relay = Arc::new(MemoryRelay::new());
        let (a_tx, a_events) = mpsc::unbounded_channel();
        let (b_tx, b_events) = mpsc::unbounded_channel();
        let a = TransferEngine::new("alice", relay.clone(), test_store(&format!("{name}_a")), fast_settings(), Some(a_tx));
        let b = TransferEngine::new("bob", relay.clone(), test_store(&format!("{name}_b")), fast_settings(), Some(b_tx));

        for (from, to) in [(&a, &b), (&b, &a)] {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            from.attach_sink(Arc::new(PipeSink(tx))).await;
            let router = DataChannelRouter::new(to.clone());
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    router.on_frame(RawFrame::Text(text)).await;
                }
            });

            let mut signals = relay.subscribe_inserts(to.local_id()).await.unwrap();
            let router = DataChannelRouter::new(to.clone());
            tokio::spawn(async move {
                while let Some(signal) = signals.recv().await {
                    router.on_signal(signal).await;
                }
            });
        }

        (
            Peer { engine: a, events: a_events },
            Peer { engine: b, events: b_events },
        )
    }

    async fn wait_for<F, T>(events: &mut mpsc::UnboundedReceiver<TransferEvent>, mut pick: F) -> T
    where
        F: FnMut(TransferEvent) -> Option<T>,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = events.recv().await.expect("event stream closed");
                if let Some(out) = pick(ev) {
                    return out;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn content(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn file_crosses_the_channel_intact() {
        let (mut alice, mut bob) = connected_pair("e2e").await;
        let data = content(300_000);
        let meta = alice
            .engine
            .send_file(FileSource::from_bytes("photo.jpg", data.clone()), "bob", &SignalOfStop::new())
            .await
            .unwrap();

        let (name, received) = wait_for(&mut bob.events, |ev| match ev {
            TransferEvent::FileReceived { file_name, data, .. } => Some((file_name, data)),
            _ => None,
        })
        .await;
        assert_eq!(name, "photo.jpg");
        assert_eq!(received.len(), 300_000);
        assert_eq!(received.as_ref(), data.as_slice());

        let id = meta.transfer_id.clone();
        wait_for(&mut alice.events, |ev| match ev {
            TransferEvent::Delivered { transfer_id } if transfer_id == id => Some(()),
            _ => None,
        })
        .await;
        assert!(alice.engine.store().get(&meta.transfer_id).await.is_none());
        assert!(bob.engine.store().get(&meta.transfer_id).await.is_none());
    }

    #[tokio::test]
    async fn resent_chunks_do_not_corrupt_the_result() {
        let h = harness("router_resend").await;
        let router = DataChannelRouter::new(h.engine.clone());
        let data = content(300_000);
        let meta = TransferMeta::new("t".into(), "f".into(), 300_000, crate::core::config::CHUNK_SIZE);
        h.engine.handle_file_meta(meta.clone()).await.unwrap();

        let chunk = |seq: u32| {
            let r = meta.chunk_range(seq);
            ChannelFrame::Chunk {
                transfer_id: "t".into(),
                seq,
                data: data[r.start as usize..r.end as usize].to_vec(),
            }
        };
        // First attempt got through 0 and 1, resume re-sends 1 and 2.
        for seq in [0, 1, 1, 2] {
            router.on_frame(RawFrame::Text(chunk(seq).to_text().unwrap())).await;
        }
        router
            .on_frame(RawFrame::Text(
                ChannelFrame::ChunkEnd { transfer_id: "t".into() }.to_text().unwrap(),
            ))
            .await;

        let mut events = h.events;
        let received = wait_for(&mut events, |ev| match ev {
            TransferEvent::FileReceived { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(received.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn gap_at_chunk_end_fails_and_resume_recovers() {
        let h = harness("router_gap").await;
        let router = DataChannelRouter::new(h.engine.clone());
        let data = content(300_000);
        let meta = TransferMeta::new("g".into(), "f".into(), 300_000, crate::core::config::CHUNK_SIZE);
        h.engine.handle_file_meta(meta.clone()).await.unwrap();

        let send = |seq: u32| {
            let r = meta.chunk_range(seq);
            ChannelFrame::Chunk {
                transfer_id: "g".into(),
                seq,
                data: data[r.start as usize..r.end as usize].to_vec(),
            }
            .to_text()
            .unwrap()
        };
        let end = ChannelFrame::ChunkEnd { transfer_id: "g".into() }.to_text().unwrap();

        router.on_frame(RawFrame::Text(send(0))).await;
        router.on_frame(RawFrame::Text(send(2))).await;
        router.on_frame(RawFrame::Text(end.clone())).await;

        let mut events = h.events;
        let reason = wait_for(&mut events, |ev| match ev {
            TransferEvent::TransferFailed { reason, .. } => Some(reason),
            _ => None,
        })
        .await;
        assert!(reason.contains("[1]"));

        router.on_frame(RawFrame::Text(send(1))).await;
        router.on_frame(RawFrame::Text(end)).await;
        let received = wait_for(&mut events, |ev| match ev {
            TransferEvent::FileReceived { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(received.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn chunks_before_meta_are_buffered() {
        let h = harness("router_pre_meta").await;
        let router = DataChannelRouter::new(h.engine.clone());
        let payload = b"early bird".to_vec();

        router
            .on_frame(RawFrame::Text(
                ChannelFrame::Chunk { transfer_id: "p".into(), seq: 0, data: payload.clone() }
                    .to_text()
                    .unwrap(),
            ))
            .await;
        router
            .on_frame(RawFrame::Text(
                ChannelFrame::ChunkEnd { transfer_id: "p".into() }.to_text().unwrap(),
            ))
            .await;

        h.engine
            .handle_file_meta(TransferMeta::new(
                "p".into(),
                "early.txt".into(),
                payload.len() as u64,
                crate::core::config::CHUNK_SIZE,
            ))
            .await
            .unwrap();

        let mut events = h.events;
        let received = wait_for(&mut events, |ev| match ev {
            TransferEvent::FileReceived { data, .. } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(received.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn empty_file_end_before_meta_completes() {
        let h = harness("router_empty_early_end").await;
        let router = DataChannelRouter::new(h.engine.clone());
        router
            .on_frame(RawFrame::Text(
                ChannelFrame::ChunkEnd { transfer_id: "e".into() }.to_text().unwrap(),
            ))
            .await;

        h.engine
            .handle_file_meta(TransferMeta::new(
                "e".into(),
                "empty".into(),
                0,
                crate::core::config::CHUNK_SIZE,
            ))
            .await
            .unwrap();

        let mut events = h.events;
        let (name, received) = wait_for(&mut events, |ev| match ev {
            TransferEvent::FileReceived { file_name, data, .. } => Some((file_name, data)),
            _ => None,
        })
        .await;
        assert_eq!(name, "empty");
        assert!(received.is_empty());
        assert!(h
            .sink
            .frames()
            .iter()
            .any(|f| matches!(f, ChannelFrame::Ack { last_seq: -1, .. })));
        assert!(h.engine.store().get("e").await.is_none());
    }

    #[tokio::test]
    async fn inconsistent_file_meta_is_rejected() {
        let h = harness("router_bad_meta").await;
        let router = DataChannelRouter::new(h.engine.clone());
        // One 128 KiB chunk cannot cover 300000 bytes.
        let payload = json!({
            "transferId": "m",
            "fileName": "short.bin",
            "totalSize": 300_000,
            "totalChunks": 1,
            "chunkSize": 131_072,
        });
        let outcome = router
            .on_signal(SignalMessage::new("remote", "local", SignalKind::FileMeta, payload))
            .await;
        assert_eq!(outcome, RouteOutcome::Dropped("inconsistent file-meta"));
        assert!(h.engine.store().load().is_empty());

        let zero = TransferMeta {
            transfer_id: "z".into(),
            file_name: "z".into(),
            total_size: 10,
            total_chunks: 1,
            chunk_size: 0,
        };
        assert!(matches!(
            h.engine.handle_file_meta(zero).await,
            Err(crate::error::PeerError::FrameParse(_))
        ));

        // Chunks for the rejected transfer stay pre-meta and never complete.
        router
            .on_frame(RawFrame::Text(
                ChannelFrame::Chunk { transfer_id: "m".into(), seq: 0, data: vec![1; 131_072] }
                    .to_text()
                    .unwrap(),
            ))
            .await;
        router
            .on_frame(RawFrame::Text(
                ChannelFrame::ChunkEnd { transfer_id: "m".into() }.to_text().unwrap(),
            ))
            .await;
        let mut events = h.events;
        while let Ok(ev) = events.try_recv() {
            assert!(!matches!(ev, TransferEvent::FileReceived { .. }), "short payload delivered");
        }
    }

    #[tokio::test]
    async fn acks_on_the_wire_never_decrease() {
        let h = harness("router_acks").await;
        let router = DataChannelRouter::new(h.engine.clone());
        let meta = TransferMeta::new("a".into(), "f".into(), 4 * 10, 10);
        h.engine.handle_file_meta(meta).await.unwrap();

        for seq in [1u32, 0, 3, 2] {
            router
                .on_frame(RawFrame::Text(
                    ChannelFrame::Chunk { transfer_id: "a".into(), seq, data: vec![seq as u8; 10] }
                        .to_text()
                        .unwrap(),
                ))
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let acks: Vec<i64> = h
            .sink
            .frames()
            .into_iter()
            .filter_map(|f| match f {
                ChannelFrame::Ack { last_seq, .. } => Some(last_seq),
                _ => None,
            })
            .collect();
        assert!(!acks.is_empty());
        assert!(acks.windows(2).all(|w| w[0] <= w[1]), "acks went backwards: {acks:?}");
        assert!(acks.iter().all(|a| *a <= 3));
    }

    #[tokio::test]
    async fn unknown_types_surface_as_app_messages() {
        let h = harness("router_unknown").await;
        let router = DataChannelRouter::new(h.engine.clone());
        let outcome = router
            .on_frame(RawFrame::Text(json!({"type": "message", "text": "hi"}).to_string()))
            .await;
        assert_eq!(outcome, RouteOutcome::AppMessage);

        let mut events = h.events;
        let value = wait_for(&mut events, |ev| match ev {
            TransferEvent::AppMessage(v) => Some(v),
            _ => None,
        })
        .await;
        assert_eq!(value["text"], "hi");
        assert!(h.engine.store().load().is_empty());
    }

    #[tokio::test]
    async fn garbage_and_binary_are_dropped() {
        let h = harness("router_garbage").await;
        let router = DataChannelRouter::new(h.engine.clone());
        assert_eq!(
            router.on_frame(RawFrame::Text("not json {".into())).await,
            RouteOutcome::Dropped("not json")
        );
        assert_eq!(
            router.on_frame(RawFrame::Binary(Bytes::from_static(b"\x00\x01"))).await,
            RouteOutcome::Dropped("binary")
        );
        assert_eq!(
            router
                .on_frame(RawFrame::Text(r#"{"type":"chunk","transferId":"x","seq":"zero"}"#.into()))
                .await,
            RouteOutcome::Dropped("malformed transfer frame")
        );
        assert!(h.engine.store().load().is_empty());
    }

    #[tokio::test]
    async fn relayed_ack_reaches_the_sender() {
        let h = harness("router_relayed_ack").await;
        let router = DataChannelRouter::new(h.engine.clone());
        h.engine
            .store()
            .update("r", |s| {
                s.sender = Some(crate::core::persistence::SenderProgress::new("f", 300_000, 3))
            })
            .await
            .unwrap();

        let outcome = router
            .on_signal(SignalMessage::new(
                "remote",
                "local",
                SignalKind::Ack,
                json!({"transferId": "r", "lastSeq": 1}),
            ))
            .await;
        assert_eq!(outcome, RouteOutcome::Transfer);
        let p = h.engine.store().get("r").await.unwrap().sender.unwrap();
        assert_eq!(p.last_acked_seq, 1);
    }
}
