//! Peer connection construction: API, settings, state logging, trickle ICE.

use super::{ConnectionSettings, SessionStatus};
use crate::core::config::SCTP_MAX_MESSAGE_SIZE;
use crate::core::signaling::{publish_with_retry, SignalKind, SignalMessage, SignalingTransport};
use crate::error::{PeerError, Result};
use crate::utils::sos::SignalOfStop;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub(crate) fn create_webrtc_api(settings: &ConnectionSettings) -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    me.register_default_codecs()?;
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    // Base64 chunk frames are ~175 KB, well above the 64 KB default.
    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));
    se.set_include_loopback_candidate(settings.include_loopback);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

pub(crate) async fn new_peer_connection(
    settings: &ConnectionSettings,
    status: watch::Sender<SessionStatus>,
    stop: SignalOfStop,
) -> Result<Arc<RTCPeerConnection>> {
    let api = create_webrtc_api(settings)?;
    let ice_servers = settings
        .ice_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();
    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?,
    );

    pc.on_peer_connection_state_change(Box::new(move |s| {
        let status = status.clone();
        let stop = stop.clone();
        Box::pin(async move {
            // A replaced session must not overwrite the current status.
            if stop.cancelled() {
                debug!(state = %s, "State change on retired connection");
                return;
            }
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "WebRTC connection failed");
                    status.send_replace(SessionStatus::Closed);
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", "WebRTC connection closed");
                    status.send_replace(SessionStatus::Closed);
                }
                _ => {}
            }
        })
    }));

    Ok(pc)
}

/// Advertise our receive limit so the remote side may send large frames.
/// Without `a=max-message-size` the remote assumes 64 KB.
pub(crate) fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{}\r\n", SCTP_MAX_MESSAGE_SIZE));
    }
    desc
}

pub(crate) async fn local_description(pc: &RTCPeerConnection) -> Result<RTCSessionDescription> {
    pc.local_description()
        .await
        .map(inject_max_message_size)
        .ok_or_else(|| PeerError::Connection("no local description".into()))
}

/// Queue local candidates as they are gathered. The queue is drained by
/// [`spawn_candidate_forwarder`] once the description is published, so the
/// remote always sees the offer/answer before its candidates.
pub(crate) fn capture_candidates(pc: &RTCPeerConnection) -> mpsc::UnboundedReceiver<RTCIceCandidateInit> {
    let (tx, rx) = mpsc::unbounded_channel();
    pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = c else {
                debug!("ICE gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(init);
                }
                Err(e) => warn!(event = "ice_candidate_encode_failed", error = %e),
            }
        })
    }));
    rx
}

/// Publish each local candidate as an `ice` signal, one at a time.
pub(crate) fn spawn_candidate_forwarder(
    mut candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
    signaling: Arc<dyn SignalingTransport>,
    local_id: String,
    remote_id: String,
    stop: SignalOfStop,
) {
    tokio::spawn(async move {
        while let Some(Some(init)) = stop.select(candidates.recv()).await {
            let payload = match serde_json::to_value(&init) {
                Ok(v) => v,
                Err(e) => {
                    warn!(event = "ice_candidate_encode_failed", error = %e);
                    continue;
                }
            };
            let msg = SignalMessage::new(&local_id, &remote_id, SignalKind::Ice, payload);
            if let Err(e) = publish_with_retry(signaling.as_ref(), msg).await {
                warn!(event = "ice_publish_failed", remote = %remote_id, error = %e);
            }
        }
        debug!(remote = %remote_id, "Candidate forwarder stopped");
    });
}
