//! Layered AEAD over an ordered key list.
//!
//! For keys `[k1..kn]`, encryption seals under `kn` first and `k1` last,
//! so `k1` is the outermost layer and each layer authenticates the
//! ciphertext of the one inside it. Layer `i` uses a nonce derived from
//! the base nonce and `i` with keyed BLAKE3, so one base nonce never
//! yields the same nonce twice across layers.

use zilfs_core::{ZilError, ZilResult};

use crate::aead::{self, Nonce};
use crate::entropy::EntropySource;
use crate::secure::{SecretKey, SecureBuffer};
use crate::{NONCE_SIZE, TAG_SIZE};

const LAYER_NONCE_CONTEXT: &str = "zilfs 2024 onion layer nonce";

fn layer_nonce(base: &Nonce, layer: usize) -> Nonce {
    let mut hasher = blake3::Hasher::new_derive_key(LAYER_NONCE_CONTEXT);
    hasher.update(base);
    hasher.update(&(layer as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
    nonce
}

fn require_keys(keys: &[SecretKey]) -> ZilResult<()> {
    if keys.is_empty() {
        return Err(ZilError::bad_argument("onion wrapper needs at least one key"));
    }
    Ok(())
}

/// Seal `data` under every key with a caller-supplied base nonce.
///
/// Output length is `data.len() + 16 * keys.len()`; the base nonce is not included.
pub fn onion_encrypt_with_nonce(
    data: &[u8],
    keys: &[SecretKey],
    base: &Nonce,
    ad: &[u8],
) -> ZilResult<Vec<u8>> {
    require_keys(keys)?;
    let mut layer = data.to_vec();
    for (i, key) in keys.iter().enumerate().rev() {
        let sealed = aead::encrypt(key, &layer_nonce(base, i), ad, &layer)?;
        // Only the innermost input is plaintext
        if i == keys.len() - 1 {
            zeroize::Zeroize::zeroize(&mut layer);
        }
        layer = sealed;
    }
    Ok(layer)
}

/// Inverse of [`onion_encrypt_with_nonce`] with the same key order.
pub fn onion_decrypt_with_nonce(
    ciphertext: &[u8],
    keys: &[SecretKey],
    base: &Nonce,
    ad: &[u8],
) -> ZilResult<SecureBuffer> {
    require_keys(keys)?;
    if ciphertext.len() < TAG_SIZE * keys.len() {
        return Err(ZilError::Auth);
    }
    let mut layer = SecureBuffer::from_slice(ciphertext);
    for (i, key) in keys.iter().enumerate() {
        layer = aead::decrypt(key, &layer_nonce(base, i), ad, layer.as_slice())?;
    }
    Ok(layer)
}

/// Seal `data` under a fresh random 96-bit base nonce.
///
/// Output: `[12-byte base nonce][layered ciphertext]`.
pub fn onion_encrypt(data: &[u8], keys: &[SecretKey], ad: &[u8]) -> ZilResult<Vec<u8>> {
    let base: Nonce = EntropySource::global().array()?;
    let sealed = onion_encrypt_with_nonce(data, keys, &base, ad)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&base);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`onion_encrypt`].
pub fn onion_decrypt(blob: &[u8], keys: &[SecretKey], ad: &[u8]) -> ZilResult<SecureBuffer> {
    if blob.len() < NONCE_SIZE {
        return Err(ZilError::Auth);
    }
    let (base, sealed) = blob.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(base);
    onion_decrypt_with_nonce(sealed, keys, &nonce, ad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<SecretKey> {
        (0..n)
            .map(|i| SecretKey::from_bytes([i as u8 + 1; 32]))
            .collect()
    }

    #[test]
    fn roundtrip_three_layers() {
        let k = keys(3);
        let blob = onion_encrypt(b"layered secret", &k, b"ad").unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + 14 + 3 * TAG_SIZE);
        let out = onion_decrypt(&blob, &k, b"ad").unwrap();
        assert_eq!(out.as_slice(), b"layered secret");
    }

    #[test]
    fn key_order_matters() {
        let k = keys(2);
        let blob = onion_encrypt(b"data", &k, b"").unwrap();
        let reversed: Vec<SecretKey> = k.iter().rev().cloned().collect();
        assert!(matches!(onion_decrypt(&blob, &reversed, b""), Err(ZilError::Auth)));
    }

    #[test]
    fn missing_layer_fails() {
        let k = keys(3);
        let blob = onion_encrypt(b"data", &k, b"").unwrap();
        assert!(onion_decrypt(&blob, &k[..2], b"").is_err());
    }

    #[test]
    fn empty_key_list_is_bad_argument() {
        assert!(matches!(
            onion_encrypt(b"data", &[], b""),
            Err(ZilError::BadArgument(_))
        ));
    }

    #[test]
    fn fresh_nonce_each_call() {
        let k = keys(1);
        let a = onion_encrypt(b"same", &k, b"").unwrap();
        let b = onion_encrypt(b"same", &k, b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn layer_nonces_are_distinct() {
        let base = [7u8; NONCE_SIZE];
        assert_ne!(layer_nonce(&base, 0), layer_nonce(&base, 1));
        assert_ne!(layer_nonce(&base, 0), base);
    }

    proptest! {
        #[test]
        fn onion_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..2048), n in 1usize..5) {
            let k = keys(n);
            let blob = onion_encrypt(&data, &k, b"prop").unwrap();
            let out = onion_decrypt(&blob, &k, b"prop").unwrap();
            prop_assert_eq!(out.as_slice(), &data[..]);
        }
    }
}
