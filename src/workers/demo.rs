//! Loopback demo: two peers in one process, a memory relay between them and
//! a real WebRTC connection on the loopback interface.

use anyhow::{anyhow, Context, Result};
use peerlink::core::config::{CONNECTION_TIMEOUT, DATA_CHANNEL_TIMEOUT};
use peerlink::core::connection::webrtc::{ConnectionSettings, NoMedia, PeerConnectionManager};
use peerlink::core::persistence::TransferStateStore;
use peerlink::core::pipeline::{FileSource, TransferEngine, TransferEvent, TransferSettings};
use peerlink::core::signaling::MemoryRelay;
use peerlink::utils::sos::SignalOfStop;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub async fn run(file: PathBuf, download_dir: PathBuf, sos: SignalOfStop) -> Result<()> {
    let relay = Arc::new(MemoryRelay::new());
    let store = Arc::new(TransferStateStore::open_default());

    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    let (bob_tx, mut bob_events) = mpsc::unbounded_channel();

    let alice_engine = TransferEngine::new(
        "alice",
        relay.clone(),
        store.clone(),
        TransferSettings::default(),
        Some(alice_tx),
    );
    let bob_engine = TransferEngine::new(
        "bob",
        relay.clone(),
        store,
        TransferSettings {
            download_dir: Some(download_dir),
            ..TransferSettings::default()
        },
        Some(bob_tx),
    );

    let alice = PeerConnectionManager::new(
        relay.clone(),
        alice_engine,
        Arc::new(NoMedia),
        ConnectionSettings::loopback(),
    );
    let bob = PeerConnectionManager::new(
        relay.clone(),
        bob_engine,
        Arc::new(NoMedia),
        ConnectionSettings::loopback(),
    );

    let alice_listener = alice.listen().await?;
    let bob_listener = bob.listen().await?;

    alice.initiate_session("bob").await?;
    alice
        .wait_for_data_open(DATA_CHANNEL_TIMEOUT)
        .await
        .context("alice: data channel did not open")?;
    bob.wait_for_data_open(DATA_CHANNEL_TIMEOUT)
        .await
        .context("bob: data channel did not open")?;
    println!("Session open: alice -> bob");

    alice.engine().send_text("hello from alice").await?;

    let meta = alice
        .engine()
        .send_file(FileSource::from_path(&file), "bob", &sos)
        .await?;
    println!(
        "Sent {} ({} bytes, {} chunks) as transfer {}",
        meta.file_name, meta.total_size, meta.total_chunks, meta.transfer_id
    );

    let mut received = false;
    let mut delivered = false;
    let outcome = tokio::time::timeout(CONNECTION_TIMEOUT, async {
        while !(received && delivered) {
            tokio::select! {
                Some(ev) = bob_events.recv() => match ev {
                    TransferEvent::AppMessage(v) => println!("bob got message: {v}"),
                    TransferEvent::FileReceived { file_name, data, saved_to, .. } => {
                        match saved_to {
                            Some(path) => println!("bob received {file_name} ({} bytes) -> {}", data.len(), path.display()),
                            None => println!("bob received {file_name} ({} bytes)", data.len()),
                        }
                        received = true;
                    }
                    TransferEvent::TransferFailed { transfer_id, reason } => {
                        return Err(anyhow!("transfer {transfer_id} failed: {reason}"));
                    }
                    _ => {}
                },
                Some(ev) = alice_events.recv() => {
                    if let TransferEvent::Delivered { transfer_id } = ev {
                        info!(event = "demo_delivered", %transfer_id);
                        delivered = true;
                    }
                },
                _ = sos.wait() => return Err(anyhow!("interrupted")),
            }
        }
        Ok(())
    })
    .await;

    alice.close_session().await;
    bob.close_session().await;
    alice_listener.abort();
    bob_listener.abort();

    match outcome {
        Ok(res) => res.map(|_| println!("Transfer acknowledged by receiver")),
        Err(_) => Err(anyhow!("timed out waiting for delivery")),
    }
}
