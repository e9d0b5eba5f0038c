//! Fractal subkey derivation: master key → (label, index) → 256-bit subkey
//!
//! Each label roots its own binary tree. The root is an HKDF-SHA256
//! expansion of the seed under the label; the 32 bits of the index, most
//! significant first, then select a path down the tree where every step is
//! a keyed BLAKE3 of the parent node.
//!
//! ```text
//!            root("object")
//!            /            \
//!       bit31=0          bit31=1
//!        /   \            /   \
//!      ...   ...        ...   ...      (32 levels)
//!       |
//!   subkey(object, i)
//! ```

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;
use zilfs_core::{ZilError, ZilResult};

use crate::secure::SecretKey;
use crate::KEY_SIZE;

const FRACTAL_SALT: &[u8] = b"zilfs/fractal/v1";

/// Context labels for subkeys. Closed set: adding one changes the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Table,
    Trailer,
    Object,
    Decoy,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::Table => "table",
            Label::Trailer => "trailer",
            Label::Object => "object",
            Label::Decoy => "decoy",
        }
    }
}

/// Derive the subkey at `(label, index)` below `seed`.
///
/// An empty seed is a programmer error (`BadArgument`).
pub fn fractal_kdf(seed: &[u8], label: Label, index: u32) -> ZilResult<SecretKey> {
    if seed.is_empty() {
        return Err(ZilError::bad_argument("fractal KDF requires a non-empty seed"));
    }

    let mut node = [0u8; KEY_SIZE];
    let mut info = Vec::with_capacity(16);
    info.extend_from_slice(b"label:");
    info.extend_from_slice(label.as_str().as_bytes());
    Hkdf::<Sha256>::new(Some(FRACTAL_SALT), seed)
        .expand(&info, &mut node)
        .map_err(|e| ZilError::bad_argument(format!("HKDF expand failed: {e}")))?;

    for depth in 0..32u8 {
        let bit = ((index >> (31 - depth)) & 1) as u8;
        let child = blake3::keyed_hash(&node, &[depth, bit]);
        node.copy_from_slice(child.as_bytes());
    }

    let key = SecretKey::from_bytes(node);
    node.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SEED: &[u8] = &[42u8; 32];

    #[test]
    fn deterministic() {
        let a = fractal_kdf(SEED, Label::Object, 7).unwrap();
        let b = fractal_kdf(SEED, Label::Object, 7).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn labels_are_separated() {
        let keys: std::collections::HashSet<[u8; KEY_SIZE]> =
            [Label::Table, Label::Trailer, Label::Object, Label::Decoy]
                .into_iter()
                .map(|l| *fractal_kdf(SEED, l, 0).unwrap().as_bytes())
                .collect();
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn neighbouring_indices_differ() {
        let a = fractal_kdf(SEED, Label::Object, 0).unwrap();
        let b = fractal_kdf(SEED, Label::Object, 1).unwrap();
        let c = fractal_kdf(SEED, Label::Object, u32::MAX).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn different_seeds_differ() {
        let a = fractal_kdf(&[1u8; 32], Label::Table, 0).unwrap();
        let b = fractal_kdf(&[2u8; 32], Label::Table, 0).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn empty_seed_is_bad_argument() {
        assert!(matches!(
            fractal_kdf(&[], Label::Table, 0),
            Err(ZilError::BadArgument(_))
        ));
    }

    proptest! {
        #[test]
        fn distinct_indices_never_collide(a in any::<u32>(), b in any::<u32>()) {
            prop_assume!(a != b);
            let ka = fractal_kdf(SEED, Label::Object, a).unwrap();
            let kb = fractal_kdf(SEED, Label::Object, b).unwrap();
            prop_assert_ne!(ka.as_bytes(), kb.as_bytes());
        }

        #[test]
        fn equal_inputs_equal_outputs(seed in proptest::collection::vec(any::<u8>(), 1..64), idx in any::<u32>()) {
            let a = fractal_kdf(&seed, Label::Decoy, idx).unwrap();
            let b = fractal_kdf(&seed, Label::Decoy, idx).unwrap();
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }
}
