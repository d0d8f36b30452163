//! Authenticated public-key box for end-to-end text messages.
//!
//! Independent of the transfer protocol. Construction:
//!
//! ```text
//! shared = X25519(sender_secret, recipient_public)
//! key    = HMAC-SHA3-256(shared, "peerlink-box-v1" || sender_pk || recipient_pk)
//! box    = AES-256-GCM(key, nonce = 12 random bytes, plaintext)
//! ```
//!
//! The recipient derives the same key from `(recipient_secret, sender_public)`.
//! Any authentication failure is [`PeerError::Decryption`]; plaintext is
//! never returned in that case.

use crate::error::{PeerError, Result};
use crate::utils::crypto::hmac_sha3_256;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

const BOX_LABEL: &[u8] = b"peerlink-box-v1";
const NONCE_LEN: usize = 12;

/// X25519 key pair. Both halves are raw 32-byte values.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &b64().encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Base64 form for storing a key pair as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    pub public_key: String,
    pub secret_key: String,
}

impl KeyPair {
    pub fn to_storage(&self) -> StoredKeyPair {
        StoredKeyPair {
            public_key: b64().encode(self.public_key),
            secret_key: b64().encode(self.secret_key),
        }
    }

    /// Rebuild from storage. The public half is recomputed and must match.
    pub fn from_storage(stored: &StoredKeyPair) -> Result<Self> {
        let secret_key = decode_key(&stored.secret_key)?;
        let public_key = decode_key(&stored.public_key)?;
        let derived = *PublicKey::from(&StaticSecret::from(secret_key)).as_bytes();
        if derived != public_key {
            return Err(PeerError::Decryption);
        }
        Ok(Self {
            public_key,
            secret_key,
        })
    }
}

/// Output of [`encrypt`]. Both fields travel base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    #[serde(with = "crate::core::pipeline::chunk::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::core::pipeline::chunk::base64_bytes")]
    pub nonce: Vec<u8>,
}

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Decode a base64 32-byte key.
pub fn decode_key(text: &str) -> Result<[u8; 32]> {
    let bytes = b64().decode(text.trim()).map_err(|_| PeerError::Decryption)?;
    bytes.try_into().map_err(|_| PeerError::Decryption)
}

pub fn generate_key_pair() -> KeyPair {
    let secret_key: [u8; 32] = rand::random();
    let public_key = *PublicKey::from(&StaticSecret::from(secret_key)).as_bytes();
    KeyPair {
        public_key,
        secret_key,
    }
}

fn box_cipher(
    own_secret: &[u8; 32],
    peer_public: &[u8; 32],
    sender_pk: &[u8; 32],
    recipient_pk: &[u8; 32],
) -> Result<Aes256Gcm> {
    let shared = StaticSecret::from(*own_secret).diffie_hellman(&PublicKey::from(*peer_public));

    let mut info = Vec::with_capacity(BOX_LABEL.len() + 64);
    info.extend_from_slice(BOX_LABEL);
    info.extend_from_slice(sender_pk);
    info.extend_from_slice(recipient_pk);
    let key = hmac_sha3_256(shared.as_bytes(), &info);

    Aes256Gcm::new_from_slice(&key).map_err(|_| PeerError::Decryption)
}

/// Seal `plaintext` for `recipient_public` with a fresh random nonce.
pub fn encrypt(
    plaintext: &str,
    recipient_public: &[u8; 32],
    sender_secret: &[u8; 32],
) -> Result<SealedMessage> {
    let sender_public = *PublicKey::from(&StaticSecret::from(*sender_secret)).as_bytes();
    let cipher = box_cipher(sender_secret, recipient_public, &sender_public, recipient_public)?;

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| PeerError::Decryption)?;

    Ok(SealedMessage {
        ciphertext,
        nonce: nonce_bytes.to_vec(),
    })
}

/// Open a box sealed by `sender_public` for the holder of `recipient_secret`.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    sender_public: &[u8; 32],
    recipient_secret: &[u8; 32],
) -> Result<String> {
    if nonce.len() != NONCE_LEN {
        return Err(PeerError::Decryption);
    }
    let recipient_public = *PublicKey::from(&StaticSecret::from(*recipient_secret)).as_bytes();
    let cipher = box_cipher(recipient_secret, sender_public, sender_public, &recipient_public)?;

    #[allow(deprecated)]
    let nonce = Nonce::from_slice(nonce);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| PeerError::Decryption)?;
    String::from_utf8(plaintext).map_err(|_| PeerError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_between_two_parties() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        for text in ["", "hello", "ünïcødé ✓", &"x".repeat(10_000)] {
            let sealed = encrypt(text, &bob.public_key, &alice.secret_key).unwrap();
            let opened =
                decrypt(&sealed.ciphertext, &sealed.nonce, &alice.public_key, &bob.secret_key)
                    .unwrap();
            assert_eq!(opened, text);
        }
    }

    #[test]
    fn every_ciphertext_bit_flip_fails() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let sealed = encrypt("secret", &bob.public_key, &alice.secret_key).unwrap();
        for i in 0..sealed.ciphertext.len() * 8 {
            let mut ct = sealed.ciphertext.clone();
            ct[i / 8] ^= 1 << (i % 8);
            let res = decrypt(&ct, &sealed.nonce, &alice.public_key, &bob.secret_key);
            assert!(matches!(res, Err(PeerError::Decryption)), "bit {i} accepted");
        }
    }

    #[test]
    fn every_nonce_bit_flip_fails() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let sealed = encrypt("secret", &bob.public_key, &alice.secret_key).unwrap();
        for i in 0..NONCE_LEN * 8 {
            let mut nonce = sealed.nonce.clone();
            nonce[i / 8] ^= 1 << (i % 8);
            let res = decrypt(&sealed.ciphertext, &nonce, &alice.public_key, &bob.secret_key);
            assert!(matches!(res, Err(PeerError::Decryption)), "bit {i} accepted");
        }
    }

    #[test]
    fn wrong_keys_fail() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let eve = generate_key_pair();
        let sealed = encrypt("hi", &bob.public_key, &alice.secret_key).unwrap();
        assert!(decrypt(&sealed.ciphertext, &sealed.nonce, &alice.public_key, &eve.secret_key).is_err());
        assert!(decrypt(&sealed.ciphertext, &sealed.nonce, &eve.public_key, &bob.secret_key).is_err());
        assert!(decrypt(&sealed.ciphertext, &sealed.nonce[..8], &alice.public_key, &bob.secret_key).is_err());
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let alice = generate_key_pair();
        let bob = generate_key_pair();
        let a = encrypt("same", &bob.public_key, &alice.secret_key).unwrap();
        let b = encrypt("same", &bob.public_key, &alice.secret_key).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn storage_form_round_trips_and_checks_consistency() {
        let pair = generate_key_pair();
        let stored = pair.to_storage();
        assert_eq!(KeyPair::from_storage(&stored).unwrap(), pair);

        let other = generate_key_pair();
        let mismatched = StoredKeyPair {
            public_key: other.to_storage().public_key,
            secret_key: stored.secret_key,
        };
        assert!(KeyPair::from_storage(&mismatched).is_err());
    }

    #[test]
    fn x25519_rfc7748_vector() {
        let scalar: [u8; 32] = [
            0xa5, 0x46, 0xe3, 0x6b, 0xf0, 0x52, 0x7c, 0x9d, 0x3b, 0x16, 0x15, 0x4b, 0x82,
            0x46, 0x5e, 0xdd, 0x62, 0x14, 0x4c, 0x0a, 0xc1, 0xfc, 0x5a, 0x18, 0x50, 0x6a,
            0x22, 0x44, 0xba, 0x44, 0x9a, 0xc4,
        ];
        let input_u: [u8; 32] = [
            0xe6, 0xdb, 0x68, 0x67, 0x58, 0x30, 0x30, 0xdb, 0x35, 0x94, 0xc1, 0xa4, 0x24,
            0xb1, 0x5f, 0x7c, 0x72, 0x66, 0x24, 0xec, 0x26, 0xb3, 0x35, 0x3b, 0x10, 0xa9,
            0x03, 0xa6, 0xd0, 0xab, 0x1c, 0x4c,
        ];
        let expected: [u8; 32] = [
            0xc3, 0xda, 0x55, 0x37, 0x9d, 0xe9, 0xc6, 0x90, 0x8e, 0x94, 0xea, 0x4d, 0xf2,
            0x8d, 0x08, 0x4f, 0x32, 0xec, 0xcf, 0x03, 0x49, 0x1c, 0x71, 0xf7, 0x54, 0xb4,
            0x07, 0x55, 0x77, 0xa2, 0x85, 0x52,
        ];
        let shared = StaticSecret::from(scalar).diffie_hellman(&PublicKey::from(input_u));
        assert_eq!(shared.as_bytes(), &expected);
    }
}
