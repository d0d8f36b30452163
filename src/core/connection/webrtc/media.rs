//! Local media capture. Best-effort: a failure leaves the session data-only.

use crate::error::{PeerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self) -> Result<Vec<LocalTrack>>;
}

/// No capture device. Every session degrades to data-only.
pub struct NoMedia;

#[async_trait]
impl MediaSource for NoMedia {
    async fn capture(&self) -> Result<Vec<LocalTrack>> {
        Err(PeerError::MediaCapture("no capture device".into()))
    }
}
