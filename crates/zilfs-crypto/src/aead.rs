//! ChaCha20-Poly1305 with associated data
//!
//! Ciphertext layout: `[N bytes: ciphertext][16 bytes: Poly1305 tag]`.
//! The nonce is never stored here; callers own nonce placement and must
//! never reuse one under the same key. Tag verification inside
//! `chacha20poly1305` is constant-time.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zilfs_core::{ZilError, ZilResult};

use crate::secure::{SecretKey, SecureBuffer};
use crate::{NONCE_SIZE, TAG_SIZE};

pub type Nonce = [u8; NONCE_SIZE];

/// Nonce for the `counter`-th allocation under a key: `counter_le ‖ 0u32`.
pub fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Seal `plaintext`; output is `plaintext.len() + 16` bytes.
pub fn encrypt(key: &SecretKey, nonce: &Nonce, ad: &[u8], plaintext: &[u8]) -> ZilResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|e| ZilError::bad_argument(format!("AEAD encryption failed: {e}")))
}

/// Open `ciphertext`. Any tag mismatch, including a truncated input, is `Auth`.
pub fn decrypt(
    key: &SecretKey,
    nonce: &Nonce,
    ad: &[u8],
    ciphertext: &[u8],
) -> ZilResult<SecureBuffer> {
    if ciphertext.len() < TAG_SIZE {
        return Err(ZilError::Auth);
    }
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map(SecureBuffer::from_vec)
        .map_err(|_| ZilError::Auth)
}
