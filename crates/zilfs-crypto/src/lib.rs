//! zilfs-crypto: key hierarchy and AEAD pipeline for ZilFS containers
//!
//! Key hierarchy:
//! ```text
//! passphrase (+ optional device fingerprint)
//!   └── Master Key (256-bit, Argon2id applied twice with domain separation)
//!       ├── "table"   subkey  → object-table AEAD
//!       ├── "trailer" subkey  → keyed BLAKE3 over the whole image
//!       ├── "object"  subkey[i] → onion layers for payload chunk i
//!       └── "decoy"   subkey  → decoy payload shaping
//! ```
//!
//! Every key lives in a [`SecretKey`] and every plaintext buffer in a
//! [`SecureBuffer`]; both wipe themselves on drop.

pub mod aead;
pub mod device;
pub mod entropy;
pub mod fractal;
pub mod kdf;
pub mod onion;
pub mod secure;

pub use aead::{decrypt, encrypt, Nonce};
pub use device::{bind_passphrase, device_fingerprint};
pub use entropy::{random_bytes, EntropySource};
pub use fractal::{fractal_kdf, Label};
pub use kdf::{derive_double, derive_double_with, derive_master, KdfParams, KdfVariant};
pub use onion::{onion_decrypt, onion_decrypt_with_nonce, onion_encrypt, onion_encrypt_with_nonce};
pub use secure::{SecretKey, SecureBuffer};

/// Size of every key in the hierarchy (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the KDF salt stored in the container header
pub const SALT_SIZE: usize = 16;
