//! Small offline subcommands: key generation, sealing, transfer listing.

use anyhow::{Context, Result};
use base64::Engine;
use peerlink::core::connection::crypto::{self, decode_key};
use peerlink::core::persistence::TransferStateStore;

pub fn keygen() -> Result<()> {
    let pair = crypto::generate_key_pair();
    println!("{}", serde_json::to_string_pretty(&pair.to_storage())?);
    Ok(())
}

pub fn seal(to: &str, secret: &str, text: &str) -> Result<()> {
    let recipient = decode_key(to).context("invalid recipient public key")?;
    let sender = decode_key(secret).context("invalid sender secret key")?;
    let sealed = crypto::encrypt(text, &recipient, &sender)?;
    println!("{}", serde_json::to_string_pretty(&sealed)?);
    Ok(())
}

pub fn open(from: &str, secret: &str, nonce: &str, ciphertext: &str) -> Result<()> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let sender = decode_key(from).context("invalid sender public key")?;
    let recipient = decode_key(secret).context("invalid recipient secret key")?;
    let nonce = b64.decode(nonce.trim()).context("nonce is not base64")?;
    let ciphertext = b64.decode(ciphertext.trim()).context("ciphertext is not base64")?;
    println!("{}", crypto::decrypt(&ciphertext, &nonce, &sender, &recipient)?);
    Ok(())
}

pub fn transfers() -> Result<()> {
    let store = TransferStateStore::open_default();
    let states = store.load();
    if states.is_empty() {
        println!("No transfers in {}", store.path().display());
        return Ok(());
    }

    let mut ids: Vec<_> = states.keys().cloned().collect();
    ids.sort();
    for id in ids {
        let Some(state) = states.get(&id) else {
            continue;
        };
        if let Some(s) = &state.sender {
            println!(
                "{id}  send  {:<24} acked {}/{}  sent {}{}",
                s.file_name,
                s.last_acked_seq + 1,
                s.total_chunks,
                s.last_sent_seq + 1,
                if s.completed { "  completed" } else { "" }
            );
        }
        if let Some(r) = &state.receiver {
            println!(
                "{id}  recv  {:<24} {} chunks, {} bytes{}",
                r.file_name.as_deref().unwrap_or("?"),
                r.received_chunks,
                r.received_bytes,
                r.total_chunks.map(|t| format!(" of {t}")).unwrap_or_default()
            );
        }
    }
    Ok(())
}
