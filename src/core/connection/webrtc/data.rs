//! The session's single data channel: sink for the engine, feed for the router.

use super::SessionStatus;
use crate::core::pipeline::{DataChannelRouter, FrameSink, RawFrame};
use crate::error::{PeerError, Result};
use crate::utils::sos::SignalOfStop;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct DataChannelSink(pub Arc<RTCDataChannel>);

#[async_trait]
impl FrameSink for DataChannelSink {
    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(PeerError::ChannelNotReady(format!(
                "'{}' is {:?}",
                self.0.label(),
                self.0.ready_state()
            )));
        }
        self.0.send_text(text).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.0.ready_state() == RTCDataChannelState::Open
    }
}

/// Wire a data channel into the engine and router. On open the engine gets
/// a sink and the session becomes `DataOpen`; on close both are undone.
pub(crate) async fn attach_data_channel(
    dc: &Arc<RTCDataChannel>,
    router: DataChannelRouter,
    status: watch::Sender<SessionStatus>,
    stop: SignalOfStop,
) {
    let label = dc.label().to_string();

    {
        let weak = Arc::downgrade(dc);
        let engine = router.engine().clone();
        let status = status.clone();
        let label = label.clone();
        let stop = stop.clone();
        dc.on_open(Box::new(move || {
            let weak = weak.clone();
            let engine = engine.clone();
            let status = status.clone();
            let label = label.clone();
            let stop = stop.clone();
            Box::pin(async move {
                let Some(dc) = weak.upgrade() else {
                    return;
                };
                if stop.cancelled() {
                    return;
                }
                info!(event = "data_channel_open", %label, "Data channel open");
                engine.attach_sink(Arc::new(DataChannelSink(dc))).await;
                status.send_replace(SessionStatus::DataOpen);
            })
        }));
    }

    {
        let router = router.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let router = router.clone();
            Box::pin(async move {
                router.on_frame(RawFrame::from(msg)).await;
            })
        }));
    }

    {
        let engine = router.engine().clone();
        let status = status.clone();
        let label = label.clone();
        let stop = stop.clone();
        dc.on_close(Box::new(move || {
            let engine = engine.clone();
            let status = status.clone();
            let label = label.clone();
            let stop = stop.clone();
            Box::pin(async move {
                debug!(event = "data_channel_closed", %label);
                if stop.cancelled() {
                    return;
                }
                engine.detach_sink().await;
                status.send_replace(SessionStatus::Closed);
            })
        }));
    }

    // Remote-created channels may already be open by the time we get them.
    if dc.ready_state() == RTCDataChannelState::Open && !stop.cancelled() {
        info!(event = "data_channel_open", %label, "Data channel open");
        router.engine().attach_sink(Arc::new(DataChannelSink(dc.clone()))).await;
        status.send_replace(SessionStatus::DataOpen);
    }
}
