//! Process-wide entropy source.
//!
//! Probes, in order: the OS CSPRNG (`getrandom` via `OsRng`), then
//! `/dev/urandom` on Unix. A ChaCha-based `StdRng` seeded once from the
//! first working probe backs both up; if no probe ever succeeded there is
//! no fallback and requests fail with `EntropyFailure`.

use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::sync::OnceLock;
use zeroize::Zeroize;
use zilfs_core::{ZilError, ZilResult};

static GLOBAL: OnceLock<EntropySource> = OnceLock::new();

pub struct EntropySource {
    fallback: Mutex<Option<StdRng>>,
}

impl EntropySource {
    /// The process-wide handle, seeded lazily on first use.
    pub fn global() -> &'static EntropySource {
        GLOBAL.get_or_init(EntropySource::seeded)
    }

    fn seeded() -> Self {
        let mut seed = [0u8; 32];
        let fallback = match probe(&mut seed) {
            Ok(source) => {
                tracing::debug!(source, "entropy fallback seeded");
                Some(StdRng::from_seed(seed))
            }
            Err(e) => {
                tracing::warn!("no entropy probe succeeded, fallback CSPRNG unavailable: {e}");
                None
            }
        };
        seed.zeroize();
        EntropySource {
            fallback: Mutex::new(fallback),
        }
    }

    /// Fill `dest` with unbiased random bytes.
    pub fn fill(&self, dest: &mut [u8]) -> ZilResult<()> {
        if dest.is_empty() {
            return Ok(());
        }
        match probe(dest) {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut guard = self.fallback.lock();
                match guard.as_mut() {
                    Some(rng) => {
                        tracing::debug!("OS entropy probes failed ({e}), using seeded fallback");
                        rng.fill_bytes(dest);
                        Ok(())
                    }
                    None => Err(ZilError::EntropyFailure(e)),
                }
            }
        }
    }

    pub fn array<const N: usize>(&self) -> ZilResult<[u8; N]> {
        let mut out = [0u8; N];
        self.fill(&mut out)?;
        Ok(out)
    }
}

/// `n` random bytes from the global source.
pub fn random_bytes(n: usize) -> ZilResult<Vec<u8>> {
    let mut out = vec![0u8; n];
    EntropySource::global().fill(&mut out)?;
    Ok(out)
}

fn probe(dest: &mut [u8]) -> Result<&'static str, String> {
    let os_err = match OsRng.try_fill_bytes(dest) {
        Ok(()) => return Ok("getrandom"),
        Err(e) => e.to_string(),
    };

    match read_urandom(dest) {
        Ok(()) => Ok("/dev/urandom"),
        Err(e) => Err(format!("getrandom: {os_err}; /dev/urandom: {e}")),
    }
}

#[cfg(unix)]
fn read_urandom(dest: &mut [u8]) -> std::io::Result<()> {
    use std::io::Read;
    std::fs::File::open("/dev/urandom")?.read_exact(dest)
}

#[cfg(not(unix))]
fn read_urandom(_dest: &mut [u8]) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_are_exact() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(1).unwrap().len(), 1);
        assert_eq!(random_bytes(4096).unwrap().len(), 4096);
    }

    #[test]
    fn successive_draws_differ() {
        let a = random_bytes(32).unwrap();
        let b = random_bytes(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn global_handle_is_shared() {
        let a = EntropySource::global() as *const EntropySource;
        let b = EntropySource::global() as *const EntropySource;
        assert_eq!(a, b);
    }

    #[test]
    fn usable_from_many_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| EntropySource::global().array::<16>().unwrap()))
            .collect();
        let draws: std::collections::HashSet<[u8; 16]> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(draws.len(), 8);
    }
}
