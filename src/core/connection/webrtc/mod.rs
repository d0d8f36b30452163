//! WebRTC peer session: one connection and one ordered data channel.
//!
//! # Negotiation
//!
//! ```text
//! Initiator                         relay                        Answerer
//! ─────────                         ─────                        ────────
//! offer {offerId, description} ───────────────────────────────►  new connection
//!                                                                 set remote, answer
//! set remote  ◄─────────────────────────────── answer {offerId, description}
//! ice ◄──────────────────────────────────────────────────────► ice   (trickled)
//!                        data channel "chat" opens
//! ```
//!
//! Answers are matched to offers by `offerId`; an answer for an offer this
//! peer does not have outstanding is ignored. Remote candidates arriving
//! before the remote description are queued and applied afterwards.

mod connection;
mod data;
mod initializer;
mod media;

pub use connection::PeerConnectionManager;
pub use data::DataChannelSink;
pub use media::{LocalTrack, MediaSource, NoMedia};

use crate::core::config::DEFAULT_STUN_SERVER;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    OfferSent,
    AnswerReceived,
    DataOpen,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// STUN/TURN URLs. Empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub include_loopback: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            include_loopback: false,
        }
    }
}

impl ConnectionSettings {
    /// Host-only settings for two peers on the same machine.
    pub fn loopback() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: true,
        }
    }
}

/// Payload of `offer` and `answer` signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptionPayload {
    pub offer_id: String,
    pub description: RTCSessionDescription,
}
