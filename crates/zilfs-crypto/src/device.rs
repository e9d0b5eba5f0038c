//! Device-bound unlock: host fingerprint mixed into the passphrase.
//!
//! The fingerprint is a keyed BLAKE3 fold over a fixed list of host
//! factors. Factors that cannot be read contribute a fixed filler so the
//! result stays stable on hosts that hide some of them.

use std::path::Path;

use crate::secure::SecureBuffer;
use crate::KEY_SIZE;

const FINGERPRINT_CONTEXT: &str = "zilfs 2024 device fingerprint factor";
const BINDING_CONTEXT: &str = "zilfs 2024 device-bound passphrase";

const FACTOR_FILES: &[&str] = &[
    "/etc/machine-id",
    "/var/lib/dbus/machine-id",
    "/sys/devices/virtual/dmi/id/product_uuid",
    "/sys/devices/virtual/dmi/id/board_serial",
    "/sys/devices/virtual/dmi/id/product_serial",
];

fn read_factor(path: &Path) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(bytes) => bytes.trim_ascii().to_vec(),
        Err(_) => vec![0u8; 8],
    }
}

fn collect_factors() -> Vec<Vec<u8>> {
    let mut factors = Vec::with_capacity(FACTOR_FILES.len() + 3);
    factors.push(std::env::consts::ARCH.as_bytes().to_vec());
    factors.push(std::env::consts::OS.as_bytes().to_vec());
    factors.push(
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned().into_bytes())
            .unwrap_or_else(|_| b"node".to_vec()),
    );
    factors.extend(FACTOR_FILES.iter().map(|p| read_factor(Path::new(p))));
    factors
}

fn fold(factors: &[Vec<u8>]) -> [u8; KEY_SIZE] {
    let mut outer = blake3::Hasher::new();
    for factor in factors {
        let digest = blake3::derive_key(FINGERPRINT_CONTEXT, factor);
        outer.update(&digest);
    }
    *outer.finalize().as_bytes()
}

/// 32-byte fingerprint of the current host.
pub fn device_fingerprint() -> SecureBuffer {
    let fp = fold(&collect_factors());
    tracing::debug!("device fingerprint computed");
    SecureBuffer::from_slice(&fp)
}

/// Mix `fingerprint` into `passphrase`; the result replaces the passphrase
/// as KDF input. Different fingerprints give unrelated KDF inputs.
pub fn bind_passphrase(passphrase: &[u8], fingerprint: &[u8]) -> SecureBuffer {
    let mut hasher = blake3::Hasher::new_derive_key(BINDING_CONTEXT);
    hasher.update(&(fingerprint.len() as u64).to_le_bytes());
    hasher.update(fingerprint);
    hasher.update(passphrase);
    SecureBuffer::from_slice(hasher.finalize().as_bytes())
}
