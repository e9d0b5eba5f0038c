//! Decoy containers: plausible noise with an expiry.
//!
//! Every decoy carries a valid cleartext header with the decoy flag set
//! and its expiry in the salt, so [`sweep_expired`] can find and remove
//! it without a key. The body depends on the profile:
//!
//! - `Noise`: framed random bytes that fail authentication like any
//!   container opened with the wrong passphrase
//! - `Flat`: a real container holding one random file
//! - `Adaptive`: a real container holding six files with log-uniform
//!   sizes drawn from a seeded RNG

use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use secrecy::SecretString;
use zilfs_core::types::unix_now;
use zilfs_core::{ZilError, ZilResult};
use zilfs_crypto::{random_bytes, EntropySource, KdfParams, NONCE_SIZE, TAG_SIZE};

use crate::codec::{Header, HEADER_LEN, TRAILER_LEN};
use crate::lock::ContainerLock;
use crate::session::{DecoyStamp, SessionOptions};

/// Number of files in an adaptive decoy.
pub const ADAPTIVE_FILES: usize = 6;
const ADAPTIVE_MIN_SIZE: f64 = 64.0;
const ADAPTIVE_MAX_SIZE: f64 = 64.0 * 1024.0;

const DIRS: &[&str] = &["docs", "notes", "photos", "archive", "projects", "mail"];
const STEMS: &[&str] = &[
    "report", "draft", "budget", "scan", "todo", "backup", "invoice", "letter", "minutes",
];
const EXTS: &[&str] = &["txt", "pdf", "jpg", "md", "csv", "bin"];

/// Decoy shapes. Closed set; each carries its own parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoyProfile {
    Noise { size: u64 },
    Flat { size: u64 },
    Adaptive { seed: u64 },
}

impl DecoyProfile {
    /// Parse a config name (`noise`, `flat`, `adaptive`).
    pub fn from_name(name: &str, size: u64, seed: u64) -> ZilResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "noise" => Ok(DecoyProfile::Noise { size }),
            "flat" => Ok(DecoyProfile::Flat { size }),
            "adaptive" => Ok(DecoyProfile::Adaptive { seed }),
            other => Err(ZilError::bad_argument(format!(
                "unknown decoy profile {other:?} (expected noise, flat or adaptive)"
            ))),
        }
    }
}

/// Paths and sizes of an adaptive decoy; deterministic in `seed`.
pub fn adaptive_layout(seed: u64) -> Vec<(String, u64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (lo, hi) = (ADAPTIVE_MIN_SIZE.ln(), ADAPTIVE_MAX_SIZE.ln());
    let mut layout: Vec<(String, u64)> = Vec::with_capacity(ADAPTIVE_FILES);
    while layout.len() < ADAPTIVE_FILES {
        let dir = DIRS[rng.gen_range(0..DIRS.len())];
        let stem = STEMS[rng.gen_range(0..STEMS.len())];
        let ext = EXTS[rng.gen_range(0..EXTS.len())];
        let mut path = format!("{dir}/{stem}.{ext}");
        if layout.iter().any(|(p, _)| *p == path) {
            path = format!("{dir}/{stem}-{}.{ext}", layout.len());
        }
        let size = rng.gen_range(lo..hi).exp().round() as u64;
        layout.push((path, size));
    }
    layout
}

fn expiry(expire_seconds: u64) -> u64 {
    unix_now().saturating_add(expire_seconds)
}

/// Write a noise decoy of roughly `size` body bytes.
pub fn generate_decoy(path: impl AsRef<Path>, size: u64, expire_seconds: u64) -> ZilResult<()> {
    generate_decoy_with(path, &DecoyProfile::Noise { size }, expire_seconds, None)
}

/// Write a decoy with the given profile.
///
/// `Flat` and `Adaptive` decoys are real containers; they are sealed
/// under `passphrase`, or under a random throwaway one when `None`.
pub fn generate_decoy_with(
    path: impl AsRef<Path>,
    profile: &DecoyProfile,
    expire_seconds: u64,
    passphrase: Option<&SecretString>,
) -> ZilResult<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(ZilError::bad_argument(format!(
            "{} already exists",
            path.display()
        )));
    }
    let expires_at = expiry(expire_seconds);
    match profile {
        DecoyProfile::Noise { size } => write_noise(path, *size, expires_at)?,
        DecoyProfile::Flat { size } => {
            let size = usize::try_from(*size)
                .map_err(|_| ZilError::bad_argument(format!("decoy size {size} too large")))?;
            let files = [("data.bin".to_string(), size)];
            write_real(path, &files, expires_at, false, passphrase)?
        }
        DecoyProfile::Adaptive { seed } => {
            let files: Vec<(String, usize)> = adaptive_layout(*seed)
                .into_iter()
                .map(|(p, s)| (p, s as usize))
                .collect();
            write_real(path, &files, expires_at, true, passphrase)?
        }
    }
    tracing::info!(decoy = %path.display(), ?profile, expires_at, "decoy generated");
    Ok(())
}

fn write_noise(path: &Path, size: u64, expires_at: u64) -> ZilResult<()> {
    let salt = EntropySource::global().array()?;
    let header = Header::decoy(salt, KdfParams::minimum(), expires_at, false);

    // Shape the body like a real image: table blob, one chunk, trailer
    let body = usize::try_from(size)
        .map_err(|_| ZilError::bad_argument(format!("decoy size {size} too large")))?;
    let table_len = (body / 8).clamp(NONCE_SIZE + TAG_SIZE, 4096);
    let chunk_len = body.saturating_sub(table_len);
    let framed = |len: usize| {
        u32::try_from(len).map_err(|_| {
            ZilError::bad_argument(format!("decoy size {size} exceeds the chunk size limit"))
        })
    };
    let (table_frame, chunk_frame) = (framed(table_len)?, framed(chunk_len)?);

    let mut image = Vec::with_capacity(HEADER_LEN + 8 + table_len + chunk_len + TRAILER_LEN);
    image.extend_from_slice(&header.encode());
    image.extend_from_slice(&table_frame.to_le_bytes());
    image.extend_from_slice(&random_bytes(table_len)?);
    image.extend_from_slice(&chunk_frame.to_le_bytes());
    image.extend_from_slice(&random_bytes(chunk_len)?);
    image.extend_from_slice(&random_bytes(TRAILER_LEN)?);

    let mut txn = crate::txn::Transaction::begin(path)?;
    txn.stage(&image)?;
    txn.commit()
}

fn write_real(
    path: &Path,
    files: &[(String, usize)],
    expires_at: u64,
    adaptive: bool,
    passphrase: Option<&SecretString>,
) -> ZilResult<()> {
    let throwaway;
    let passphrase = match passphrase {
        Some(pw) => pw,
        None => {
            let raw: [u8; 32] = EntropySource::global().array()?;
            throwaway = SecretString::from(blake3::Hash::from(raw).to_hex().to_string());
            &throwaway
        }
    };
    let session = SessionOptions::new()
        .create(true)
        .decoy(DecoyStamp {
            expires_at,
            adaptive,
        })
        .open(path, passphrase)?;
    for (file, size) in files {
        session.plant_decoy(file, *size)?;
    }
    session.close()?;
    Ok(())
}

/// Write `count` noise decoys named `decoy_<hex>.zil` into `dir`.
pub fn generate_decoys(
    dir: impl AsRef<Path>,
    count: usize,
    size: u64,
    expire_seconds: u64,
) -> ZilResult<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let tag: [u8; 8] = EntropySource::global().array()?;
        let name = format!(
            "decoy_{}.zil",
            tag.iter().map(|b| format!("{b:02x}")).collect::<String>()
        );
        let path = dir.join(name);
        generate_decoy(&path, size, expire_seconds)?;
        out.push(path);
    }
    Ok(out)
}

fn read_header(path: &Path) -> Option<Header> {
    use std::io::Read;
    let mut buf = [0u8; HEADER_LEN];
    let mut file = std::fs::File::open(path).ok()?;
    file.read_exact(&mut buf).ok()?;
    Header::decode(&buf).ok()
}

/// Whether `path` carries a decoy header.
pub fn is_decoy(path: impl AsRef<Path>) -> bool {
    read_header(path.as_ref()).is_some_and(|h| h.is_decoy())
}

/// Delete every expired decoy directly inside `dir`; returns how many
/// were removed. Non-decoys and decoys held open by a session are
/// skipped.
pub fn sweep_expired(dir: impl AsRef<Path>) -> ZilResult<usize> {
    let dir = dir.as_ref();
    let now = unix_now();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(header) = read_header(&path) else {
            continue;
        };
        if !header.is_expired(now) {
            continue;
        }
        let lock = match ContainerLock::acquire(&path) {
            Ok(lock) => lock,
            Err(ZilError::Busy(_)) => {
                tracing::debug!(decoy = %path.display(), "expired decoy in use, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = lock.remove() {
            tracing::warn!(decoy = %path.display(), "failed to remove lock sidecar: {e}");
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "expired decoys swept");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn adaptive_layout_is_deterministic() {
        assert_eq!(adaptive_layout(42), adaptive_layout(42));
        assert_ne!(adaptive_layout(42), adaptive_layout(43));
    }

    #[test]
    fn adaptive_layout_has_distinct_paths_in_range() {
        for seed in 0..32 {
            let layout = adaptive_layout(seed);
            let paths: HashSet<_> = layout.iter().map(|(p, _)| p.clone()).collect();
            assert_eq!(paths.len(), ADAPTIVE_FILES);
            for (_, size) in &layout {
                assert!((64..=65536).contains(size), "size {size} out of range");
            }
        }
    }

    #[test]
    fn profile_names() {
        assert_eq!(
            DecoyProfile::from_name("Flat", 10, 0).unwrap(),
            DecoyProfile::Flat { size: 10 }
        );
        assert!(DecoyProfile::from_name("hidden", 0, 0).is_err());
    }

    #[test]
    fn noise_decoy_has_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.zil");
        generate_decoy(&path, 2048, 3600).unwrap();
        assert!(is_decoy(&path));
        let header = read_header(&path).unwrap();
        assert!(header.decoy_expiry().unwrap() >= unix_now() + 3590);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (HEADER_LEN + 8 + 2048 + TRAILER_LEN) as u64);
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("real.zil");
        std::fs::write(&path, b"precious").unwrap();
        assert!(generate_decoy(&path, 64, 0).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn sweep_only_removes_expired_decoys() {
        let dir = tempfile::tempdir().unwrap();
        generate_decoys(dir.path(), 3, 256, 0).unwrap();
        generate_decoy(dir.path().join("keep.zil"), 256, 3600).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ZILANT but not really").unwrap();

        assert_eq!(sweep_expired(dir.path()).unwrap(), 3);
        assert_eq!(sweep_expired(dir.path()).unwrap(), 0);
        assert!(dir.path().join("keep.zil").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn sweep_skips_locked_decoy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.zil");
        generate_decoy(&path, 128, 0).unwrap();
        let held = ContainerLock::acquire(&path).unwrap();
        assert_eq!(sweep_expired(dir.path()).unwrap(), 0);
        drop(held);
        assert_eq!(sweep_expired(dir.path()).unwrap(), 1);
        assert!(!crate::lock::lock_path(&path).exists());
    }

    #[test]
    fn noise_decoy_larger_than_a_chunk_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.zil");
        let size = u64::from(u32::MAX) + (1 << 20);
        assert!(matches!(
            generate_decoy(&path, size, 0),
            Err(ZilError::BadArgument(_))
        ));
        assert!(!path.exists());
    }
}
