//! [`PeerConnectionManager`]: session lifecycle and inbound signal dispatch.

use super::data::attach_data_channel;
use super::initializer::{capture_candidates, local_description, new_peer_connection, spawn_candidate_forwarder};
use super::media::MediaSource;
use super::{ConnectionSettings, SessionDescriptionPayload, SessionStatus};
use crate::core::config::{DATA_CHANNEL_LABEL, MAX_PENDING_CANDIDATES};
use crate::core::pipeline::{DataChannelRouter, TransferEngine};
use crate::core::signaling::{publish_with_retry, SignalKind, SignalMessage, SignalingTransport};
use crate::error::{PeerError, Result};
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

struct Session {
    remote_id: String,
    pc: Arc<RTCPeerConnection>,
    remote_description_set: bool,
    /// Cancelled on teardown; stops the candidate forwarder and mutes the
    /// connection's callbacks.
    stop: SignalOfStop,
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    /// Outstanding offers: offer id -> remote peer id.
    pending_offers: HashMap<String, String>,
    /// Remote candidates received before a remote description was applied.
    pending_candidates: Vec<(String, RTCIceCandidateInit)>,
}

impl SessionState {
    fn take_candidates_from(&mut self, remote_id: &str) -> Vec<RTCIceCandidateInit> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_candidates)
            .into_iter()
            .partition(|(sender, _)| sender == remote_id);
        self.pending_candidates = rest;
        mine.into_iter().map(|(_, c)| c).collect()
    }
}

pub struct PeerConnectionManager {
    local_id: String,
    signaling: Arc<dyn SignalingTransport>,
    router: DataChannelRouter,
    media: Arc<dyn MediaSource>,
    settings: ConnectionSettings,
    state: Mutex<SessionState>,
    status: watch::Sender<SessionStatus>,
}

impl PeerConnectionManager {
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        engine: Arc<TransferEngine>,
        media: Arc<dyn MediaSource>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Arc::new(Self {
            local_id: engine.local_id().to_string(),
            signaling,
            router: DataChannelRouter::new(engine),
            media,
            settings,
            state: Mutex::new(SessionState::default()),
            status,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        self.router.engine()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Wait until the data channel is open.
    pub async fn wait_for_data_open(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        let opened = tokio::time::timeout(timeout, rx.wait_for(|s| *s == SessionStatus::DataOpen))
            .await
            .map(|res| res.is_ok());
        match opened {
            Ok(true) => Ok(()),
            Ok(false) => Err(PeerError::ChannelNotReady("session dropped".into())),
            Err(_) => Err(PeerError::ChannelNotReady(format!(
                "data channel not open after {timeout:?}"
            ))),
        }
    }

    /// Subscribe to signals addressed to this peer and dispatch them in
    /// delivery order. Call before [`initiate_session`](Self::initiate_session)
    /// so the answer cannot be missed.
    pub async fn listen(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut inbox = self.signaling.subscribe_inserts(&self.local_id).await?;
        let this = Arc::clone(self);
        info!(event = "signaling_subscribed", local = %self.local_id);
        Ok(tokio::spawn(async move {
            while let Some(signal) = inbox.recv().await {
                let kind = signal.kind;
                if let Err(e) = this.handle_inbound_signal(signal).await {
                    warn!(event = "signal_handling_failed", ?kind, error = %e);
                }
            }
            debug!("Signal subscription ended");
        }))
    }

    /// Open a session to `target`: new connection, outbound `chat` channel,
    /// published offer. Returns the offer id.
    pub async fn initiate_session(self: &Arc<Self>, target: &str) -> Result<String> {
        self.close_current().await;

        let stop = SignalOfStop::new();
        let pc = new_peer_connection(&self.settings, self.status.clone(), stop.clone()).await?;
        self.add_local_media(&pc).await;

        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        attach_data_channel(&dc, self.router.clone(), self.status.clone(), stop.clone()).await;

        let candidates = capture_candidates(&pc);
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let description = local_description(&pc).await?;

        let offer_id = uuid::Uuid::new_v4().simple().to_string();
        let payload = serde_json::to_value(SessionDescriptionPayload {
            offer_id: offer_id.clone(),
            description,
        })?;

        {
            let mut state = self.state.lock().await;
            state.pending_offers.insert(offer_id.clone(), target.to_string());
            state.session = Some(Session {
                remote_id: target.to_string(),
                pc,
                remote_description_set: false,
                stop: stop.clone(),
            });
        }
        self.status.send_replace(SessionStatus::OfferSent);

        let msg = SignalMessage::new(&self.local_id, target, SignalKind::Offer, payload);
        if let Err(e) = publish_with_retry(self.signaling.as_ref(), msg).await {
            error!(event = "offer_publish_failed", target, error = %e);
            self.close_current().await;
            self.status.send_replace(SessionStatus::Idle);
            return Err(e);
        }

        spawn_candidate_forwarder(
            candidates,
            self.signaling.clone(),
            self.local_id.clone(),
            target.to_string(),
            stop,
        );
        info!(event = "offer_sent", target, %offer_id, "Session offer published");
        Ok(offer_id)
    }

    pub async fn handle_inbound_signal(self: &Arc<Self>, signal: SignalMessage) -> Result<()> {
        if signal.sender_id == self.local_id {
            debug!(kind = ?signal.kind, "Ignoring self-originated signal");
            return Ok(());
        }

        match signal.kind {
            SignalKind::Offer => self.accept_offer(signal).await,
            SignalKind::Answer => self.apply_answer(signal).await,
            SignalKind::Ice => {
                self.add_remote_candidate(signal).await;
                Ok(())
            }
            SignalKind::FileMeta | SignalKind::Chunk | SignalKind::ChunkEnd | SignalKind::Ack => {
                self.router.on_signal(signal).await;
                Ok(())
            }
        }
    }

    async fn accept_offer(self: &Arc<Self>, signal: SignalMessage) -> Result<()> {
        let payload: SessionDescriptionPayload = serde_json::from_value(signal.payload)
            .map_err(|e| PeerError::FrameParse(format!("offer payload: {e}")))?;
        let remote_id = signal.sender_id;
        info!(event = "offer_received", remote = %remote_id, offer_id = %payload.offer_id);

        self.close_current().await;
        self.status.send_replace(SessionStatus::Idle);

        let stop = SignalOfStop::new();
        let pc = new_peer_connection(&self.settings, self.status.clone(), stop.clone()).await?;
        {
            let router = self.router.clone();
            let status = self.status.clone();
            let stop = stop.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let router = router.clone();
                let status = status.clone();
                let stop = stop.clone();
                Box::pin(async move {
                    info!(event = "data_channel_received", label = %dc.label());
                    attach_data_channel(&dc, router, status, stop).await;
                })
            }));
        }
        self.add_local_media(&pc).await;
        let candidates = capture_candidates(&pc);

        pc.set_remote_description(payload.description).await?;
        let queued = self.state.lock().await.take_candidates_from(&remote_id);
        apply_candidates(&pc, queued).await;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let description = local_description(&pc).await?;

        self.state.lock().await.session = Some(Session {
            remote_id: remote_id.clone(),
            pc,
            remote_description_set: true,
            stop: stop.clone(),
        });

        let answer = serde_json::to_value(SessionDescriptionPayload {
            offer_id: payload.offer_id,
            description,
        })?;
        publish_with_retry(
            self.signaling.as_ref(),
            SignalMessage::new(&self.local_id, &remote_id, SignalKind::Answer, answer),
        )
        .await?;

        spawn_candidate_forwarder(
            candidates,
            self.signaling.clone(),
            self.local_id.clone(),
            remote_id.clone(),
            stop,
        );
        info!(event = "answer_sent", remote = %remote_id);
        Ok(())
    }

    async fn apply_answer(&self, signal: SignalMessage) -> Result<()> {
        let payload: SessionDescriptionPayload = serde_json::from_value(signal.payload)
            .map_err(|e| PeerError::FrameParse(format!("answer payload: {e}")))?;
        let offer_id = payload.offer_id;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match state.pending_offers.get(&offer_id) {
            Some(target) if *target == signal.sender_id => {}
            _ => {
                warn!(
                    event = "unknown_offer_answer",
                    %offer_id,
                    sender = %signal.sender_id,
                    "Ignoring answer for an offer that is not outstanding"
                );
                return Err(PeerError::UnknownOffer(offer_id));
            }
        }
        state.pending_offers.remove(&offer_id);

        let Some(session) = state.session.as_mut() else {
            return Err(PeerError::UnknownOffer(offer_id));
        };
        session.pc.set_remote_description(payload.description).await?;
        session.remote_description_set = true;
        let pc = session.pc.clone();

        let queued = state.take_candidates_from(&signal.sender_id);
        drop(guard);
        apply_candidates(&pc, queued).await;

        self.status.send_replace(SessionStatus::AnswerReceived);
        info!(event = "answer_applied", remote = %signal.sender_id, %offer_id);
        Ok(())
    }

    /// Candidate problems are logged and never fail the session.
    async fn add_remote_candidate(&self, signal: SignalMessage) {
        let init: RTCIceCandidateInit = match serde_json::from_value(signal.payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(event = "ice_candidate_parse_failed", sender = %signal.sender_id, error = %e);
                return;
            }
        };

        let mut state = self.state.lock().await;
        let ready = state
            .session
            .as_ref()
            .filter(|s| s.remote_id == signal.sender_id && s.remote_description_set)
            .map(|s| s.pc.clone());

        match ready {
            Some(pc) => {
                drop(state);
                apply_candidates(&pc, vec![init]).await;
            }
            None if state.pending_candidates.len() >= MAX_PENDING_CANDIDATES => {
                warn!(event = "ice_candidate_dropped", sender = %signal.sender_id, "Candidate queue full");
            }
            None => {
                debug!(sender = %signal.sender_id, "Queueing candidate until remote description is set");
                state.pending_candidates.push((signal.sender_id, init));
            }
        }
    }

    async fn add_local_media(&self, pc: &RTCPeerConnection) {
        match self.media.capture().await {
            Ok(tracks) => {
                for track in tracks {
                    if let Err(e) = pc.add_track(track).await {
                        warn!(event = "media_track_failed", error = %e);
                    }
                }
            }
            Err(e) => {
                warn!(event = "media_capture_failed", error = %e, "Continuing data-only");
            }
        }
    }

    /// Close the active connection and forget outstanding offers.
    pub async fn close_session(&self) {
        self.close_current().await;
        self.status.send_replace(SessionStatus::Closed);
    }

    async fn close_current(&self) {
        let session = {
            let mut state = self.state.lock().await;
            state.pending_offers.clear();
            state.pending_candidates.clear();
            state.session.take()
        };
        if let Some(session) = session {
            info!(event = "session_closing", remote = %session.remote_id);
            session.stop.cancel();
            if let Err(e) = session.pc.close().await {
                warn!(event = "webrtc_close_failed", error = %e);
            }
            self.router.engine().detach_sink().await;
        }
    }
}

async fn apply_candidates(pc: &RTCPeerConnection, candidates: Vec<RTCIceCandidateInit>) {
    for candidate in candidates {
        match pc.add_ice_candidate(candidate).await {
            Ok(()) => debug!(event = "ice_candidate_added"),
            Err(e) => warn!(event = "ice_candidate_failed", error = %e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::NoMedia;
    use super::*;
    use crate::core::pipeline::testing::{fast_settings, test_store};
    use crate::core::signaling::MemoryRelay;
    use serde_json::json;

    fn manager(name: &str, relay: &Arc<MemoryRelay>, local: &str) -> Arc<PeerConnectionManager> {
        let engine = TransferEngine::new(local, relay.clone(), test_store(name), fast_settings(), None);
        PeerConnectionManager::new(relay.clone(), engine, Arc::new(NoMedia), ConnectionSettings::loopback())
    }

    #[tokio::test]
    async fn self_signals_are_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_self", &relay, "alice");
        m.handle_inbound_signal(SignalMessage::new("alice", "alice", SignalKind::Offer, json!({})))
            .await
            .unwrap();
        assert_eq!(m.status(), SessionStatus::Idle);
        assert!(relay.rows().is_empty());
    }

    #[tokio::test]
    async fn answer_without_pending_offer_is_rejected() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_unknown_answer", &relay, "alice");
        let payload = json!({
            "offerId": "nope",
            "description": {"type": "answer", "sdp": "v=0\r\n"}
        });
        let err = m
            .handle_inbound_signal(SignalMessage::new("bob", "alice", SignalKind::Answer, payload))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownOffer(id) if id == "nope"));
        assert_eq!(m.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn early_candidates_are_queued() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_early_ice", &relay, "alice");
        let candidate = json!({
            "candidate": "candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        m.handle_inbound_signal(SignalMessage::new("bob", "alice", SignalKind::Ice, candidate))
            .await
            .unwrap();
        m.handle_inbound_signal(SignalMessage::new("bob", "alice", SignalKind::Ice, json!("garbage")))
            .await
            .unwrap();
        assert_eq!(m.state.lock().await.pending_candidates.len(), 1);
    }

    #[tokio::test]
    async fn initiate_publishes_offer_and_tracks_it() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_initiate", &relay, "alice");
        let offer_id = m.initiate_session("bob").await.unwrap();

        assert_eq!(m.status(), SessionStatus::OfferSent);
        let offer = relay
            .rows()
            .into_iter()
            .find(|r| r.kind == SignalKind::Offer)
            .unwrap();
        assert_eq!(offer.receiver_id, "bob");
        assert_eq!(offer.payload["offerId"], offer_id.as_str());
        assert_eq!(offer.payload["description"]["type"], "offer");

        // Right offer id, wrong sender.
        let forged = json!({"offerId": offer_id, "description": {"type": "answer", "sdp": "v=0\r\n"}});
        let err = m
            .handle_inbound_signal(SignalMessage::new("mallory", "alice", SignalKind::Answer, forged))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::UnknownOffer(_)));
        assert_eq!(m.status(), SessionStatus::OfferSent);

        m.close_session().await;
        assert_eq!(m.status(), SessionStatus::Closed);
        assert!(m.state.lock().await.pending_offers.is_empty());
    }

    #[tokio::test]
    async fn offer_publish_failure_surfaces() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_offline", &relay, "alice");
        relay.set_offline(true);
        let err = m.initiate_session("bob").await.unwrap_err();
        assert!(matches!(err, PeerError::Signaling(_)));
        assert_eq!(m.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn relayed_file_meta_reaches_the_engine() {
        let relay = Arc::new(MemoryRelay::new());
        let m = manager("conn_file_meta", &relay, "alice");
        let meta = json!({
            "transferId": "t1",
            "fileName": "a.txt",
            "totalSize": 10,
            "totalChunks": 1,
            "chunkSize": 131072
        });
        m.handle_inbound_signal(SignalMessage::new("bob", "alice", SignalKind::FileMeta, meta))
            .await
            .unwrap();
        let state = m.engine().store().get("t1").await.unwrap();
        assert_eq!(state.receiver.unwrap().total_chunks, Some(1));
        m.engine().stop_all_ack_timers();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_managers_open_a_data_channel() {
        let relay = Arc::new(MemoryRelay::new());
        let alice = manager("conn_pair_alice", &relay, "alice");
        let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
        let bob_engine = TransferEngine::new("bob", relay.clone(), test_store("conn_pair_bob"), fast_settings(), Some(tx));
        let bob = PeerConnectionManager::new(relay.clone(), bob_engine, Arc::new(NoMedia), ConnectionSettings::loopback());
        let alice_inbox = alice.listen().await.unwrap();
        let bob_inbox = bob.listen().await.unwrap();

        let offer_id = alice.initiate_session("bob").await.unwrap();
        alice.wait_for_data_open(Duration::from_secs(20)).await.unwrap();
        bob.wait_for_data_open(Duration::from_secs(20)).await.unwrap();

        let rows = relay.rows();
        let answer = rows
            .iter()
            .find(|r| r.kind == SignalKind::Answer)
            .expect("answer published");
        assert_eq!(answer.sender_id, "bob");
        assert_eq!(answer.receiver_id, "alice");
        assert_eq!(answer.payload["offerId"], offer_id.as_str());

        // Both sides trickle their candidates through the relay.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let rows = relay.rows();
                let from = |peer: &str| rows.iter().any(|r| r.kind == SignalKind::Ice && r.sender_id == peer);
                if from("alice") && from("bob") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("candidates from both peers");

        alice.engine().send_text("hi").await.unwrap();
        let text = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(crate::core::pipeline::TransferEvent::AppMessage(v)) => return v["text"].clone(),
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("message delivered");
        assert_eq!(text, "hi");

        alice.close_session().await;
        bob.close_session().await;
        alice_inbox.abort();
        bob_inbox.abort();
    }
}
