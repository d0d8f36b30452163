//! HMAC-SHA3-256 (RFC 2104 over SHA3-256, rate = 136 bytes).
//!
//! Used as the key-derivation step of the end-to-end box: the raw X25519
//! shared secret is never used directly as a cipher key.

use sha3::{Digest, Sha3_256};

const BLOCK_SIZE: usize = 136;

pub fn hmac_sha3_256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block[..32].copy_from_slice(&Sha3_256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for (i, k) in block.iter().enumerate() {
        ipad[i] ^= k;
        opad[i] ^= k;
    }

    let inner = Sha3_256::new().chain_update(ipad).chain_update(data).finalize();
    let outer = Sha3_256::new().chain_update(opad).chain_update(inner).finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(&outer);
    out
}
