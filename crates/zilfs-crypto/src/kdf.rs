//! Key derivation: passphrase → master key via Argon2id, applied twice

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zilfs_core::config::{
    KdfConfig, KDF_MIN_MEM_COST_KIB, KDF_MIN_PARALLELISM, KDF_MIN_TIME_COST,
};
use zilfs_core::{CancelToken, ZilError, ZilResult};

use crate::secure::SecretKey;
use crate::{KEY_SIZE, SALT_SIZE};

/// Domain separator between the two passes of [`derive_double`].
const DOUBLE_KDF_DOMAIN: &[u8] = b"zilfs/double-kdf/v1";

/// Argon2 flavour, stored as the fourth word of the header parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfVariant {
    Argon2d,
    Argon2i,
    Argon2id,
}

impl KdfVariant {
    pub fn tag(self) -> u64 {
        match self {
            KdfVariant::Argon2d => 0,
            KdfVariant::Argon2i => 1,
            KdfVariant::Argon2id => 2,
        }
    }

    pub fn from_tag(tag: u64) -> ZilResult<Self> {
        match tag {
            0 => Ok(KdfVariant::Argon2d),
            1 => Ok(KdfVariant::Argon2i),
            2 => Ok(KdfVariant::Argon2id),
            other => Err(ZilError::format(format!("unknown KDF variant tag {other}"))),
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            KdfVariant::Argon2d => Algorithm::Argon2d,
            KdfVariant::Argon2i => Algorithm::Argon2i,
            KdfVariant::Argon2id => Algorithm::Argon2id,
        }
    }
}

/// Argon2 parameters, mirrored bit-exactly in the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (floor: 65536 = 64 MiB)
    pub mem_cost_kib: u64,
    /// Passes (floor: 3)
    pub time_cost: u64,
    /// Lanes (floor: 1)
    pub parallelism: u64,
    pub variant: KdfVariant,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::minimum()
    }
}

impl KdfParams {
    pub const MAX_MEM_COST_KIB: u64 = 4 * 1024 * 1024;
    pub const MAX_TIME_COST: u64 = 64;
    pub const MAX_PARALLELISM: u64 = 64;

    /// The documented floor: 64 MiB, 3 passes, 1 lane, Argon2id.
    pub const fn minimum() -> Self {
        Self {
            mem_cost_kib: KDF_MIN_MEM_COST_KIB,
            time_cost: KDF_MIN_TIME_COST,
            parallelism: KDF_MIN_PARALLELISM,
            variant: KdfVariant::Argon2id,
        }
    }

    /// Parameters from config (env overrides included), raised to the floor.
    pub fn from_config(config: &KdfConfig) -> Self {
        let config = config.clone().with_env_overrides();
        Self {
            mem_cost_kib: config.mem_cost_kib,
            time_cost: config.time_cost,
            parallelism: config.parallelism,
            variant: KdfVariant::Argon2id,
        }
        .clamped()
    }

    /// Raise every parameter below the floor to the floor, with a warning.
    pub fn clamped(self) -> Self {
        let floor = Self::minimum();
        if self.mem_cost_kib < floor.mem_cost_kib
            || self.time_cost < floor.time_cost
            || self.parallelism < floor.parallelism
        {
            tracing::warn!(
                mem_cost_kib = self.mem_cost_kib,
                time_cost = self.time_cost,
                parallelism = self.parallelism,
                "KDF parameters below minimum, clamping"
            );
        }
        Self {
            mem_cost_kib: self.mem_cost_kib.max(floor.mem_cost_kib),
            time_cost: self.time_cost.max(floor.time_cost),
            parallelism: self.parallelism.max(floor.parallelism),
            variant: self.variant,
        }
    }

    /// Parameters as stored in the header: `[mem, time, lanes, variant]`.
    pub fn to_block(&self) -> [u64; 4] {
        [
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            self.variant.tag(),
        ]
    }

    /// Parse a header block. Anything outside `[floor, max]` is a format error.
    pub fn from_block(block: [u64; 4]) -> ZilResult<Self> {
        let params = Self {
            mem_cost_kib: block[0],
            time_cost: block[1],
            parallelism: block[2],
            variant: KdfVariant::from_tag(block[3])?,
        };
        params.check_bounds().map_err(ZilError::Format)?;
        Ok(params)
    }

    fn check_bounds(&self) -> Result<(), String> {
        let floor = Self::minimum();
        let within = |v: u64, lo: u64, hi: u64| (lo..=hi).contains(&v);
        if !within(self.mem_cost_kib, floor.mem_cost_kib, Self::MAX_MEM_COST_KIB) {
            return Err(format!("KDF memory cost {} KiB out of range", self.mem_cost_kib));
        }
        if !within(self.time_cost, floor.time_cost, Self::MAX_TIME_COST) {
            return Err(format!("KDF time cost {} out of range", self.time_cost));
        }
        if !within(self.parallelism, floor.parallelism, Self::MAX_PARALLELISM) {
            return Err(format!("KDF parallelism {} out of range", self.parallelism));
        }
        Ok(())
    }

    fn argon2(&self) -> ZilResult<Argon2<'static>> {
        let to_u32 = |v: u64, what: &str| {
            u32::try_from(v).map_err(|_| ZilError::bad_argument(format!("{what} {v} too large")))
        };
        let params = Params::new(
            to_u32(self.mem_cost_kib, "memory cost")?,
            to_u32(self.time_cost, "time cost")?,
            to_u32(self.parallelism, "parallelism")?,
            Some(KEY_SIZE),
        )
        .map_err(|e| ZilError::bad_argument(format!("invalid Argon2 params: {e}")))?;
        Ok(Argon2::new(self.variant.algorithm(), Version::V0x13, params))
    }
}

/// Derive a 256-bit master key from a passphrase and salt.
///
/// Parameters are clamped to the floor first; parameters above the
/// maximum are rejected.
pub fn derive_master(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> ZilResult<SecretKey> {
    let params = params.clamped();
    params.check_bounds().map_err(ZilError::BadArgument)?;

    let mut key = [0u8; KEY_SIZE];
    params
        .argon2()?
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| ZilError::bad_argument(format!("Argon2 KDF failed: {e}")))?;

    Ok(SecretKey::from_bytes(key))
}

/// [`derive_double_with`] at the minimum parameters, not cancellable.
pub fn derive_double(passphrase: &[u8], salt: &[u8; SALT_SIZE]) -> ZilResult<SecretKey> {
    derive_double_with(passphrase, salt, &KdfParams::minimum(), &CancelToken::new())
}

/// Two chained memory-hard derivations.
///
/// The first pass runs over `(passphrase, salt)`; its output is fed as the
/// secret of the second pass, salted with an HKDF expansion of the header
/// salt under a fixed domain label. Cancellation is honoured before,
/// between and after the passes.
pub fn derive_double_with(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
    cancel: &CancelToken,
) -> ZilResult<SecretKey> {
    cancel.checkpoint()?;
    let first = derive_master(passphrase, salt, params)?;
    cancel.checkpoint()?;

    let mut second_salt = [0u8; SALT_SIZE];
    Hkdf::<Sha256>::new(Some(&salt[..]), DOUBLE_KDF_DOMAIN)
        .expand(b"second-pass-salt", &mut second_salt)
        .map_err(|e| ZilError::bad_argument(format!("HKDF expand failed: {e}")))?;

    let second = derive_master(first.as_bytes(), &second_salt, params)?;
    cancel.checkpoint()?;
    Ok(second)
}
