use serde::{Deserialize, Serialize};

/// Argon2id memory floor in KiB (64 MiB).
pub const KDF_MIN_MEM_COST_KIB: u64 = 64 * 1024;
/// Argon2id pass floor.
pub const KDF_MIN_TIME_COST: u64 = 3;
/// Argon2id lane floor.
pub const KDF_MIN_PARALLELISM: u64 = 1;

pub const ENV_KDF_MEM: &str = "ZILANT_KDF_MEM";
pub const ENV_KDF_TIME: &str = "ZILANT_KDF_TIME";
pub const ENV_KDF_PAR: &str = "ZILANT_KDF_PAR";

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZilConfig {
    pub kdf: KdfConfig,
    pub session: SessionConfig,
    pub decoy: DecoyConfig,
    pub log: LogConfig,
}

/// Memory-hard KDF configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u64,
    /// Argon2id passes (default: 3)
    pub time_cost: u64,
    /// Argon2id lanes (default: 1)
    pub parallelism: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// AEAD layers wrapped around every payload chunk (default: 2)
    pub onion_layers: u8,
    /// Mix the host fingerprint into the passphrase
    pub device_bound: bool,
    /// Unlock attempts allowed per container within `unlock_window_secs`
    pub unlock_max_attempts: usize,
    /// Sliding window for unlock attempts, in seconds
    pub unlock_window_secs: u64,
    /// Minimum delay between two unlock attempts, in milliseconds
    pub unlock_floor_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoyConfig {
    /// Payload size for generated decoys, in bytes
    pub default_size: u64,
    /// Lifetime of generated decoys, in seconds
    pub default_expire_secs: u64,
    /// Decoy profile: "noise", "flat", or "adaptive"
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: warn)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: KDF_MIN_MEM_COST_KIB,
            time_cost: KDF_MIN_TIME_COST,
            parallelism: KDF_MIN_PARALLELISM,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            onion_layers: 2,
            device_bound: false,
            unlock_max_attempts: 5,
            unlock_window_secs: 60,
            unlock_floor_ms: 250,
        }
    }
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self {
            default_size: 1024,
            default_expire_secs: 3600,
            profile: "noise".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "text".into(),
        }
    }
}

impl KdfConfig {
    /// Apply `ZILANT_KDF_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    ///
    /// Overrides only ever raise a parameter. Values below the floor are
    /// clamped to the floor; values below the configured value are ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.mem_cost_kib = raise(
            ENV_KDF_MEM,
            self.mem_cost_kib,
            KDF_MIN_MEM_COST_KIB,
            &lookup,
        );
        self.time_cost = raise(ENV_KDF_TIME, self.time_cost, KDF_MIN_TIME_COST, &lookup);
        self.parallelism = raise(
            ENV_KDF_PAR,
            self.parallelism,
            KDF_MIN_PARALLELISM,
            &lookup,
        );
        self
    }
}

fn raise(name: &str, current: u64, floor: u64, lookup: &impl Fn(&str) -> Option<String>) -> u64 {
    let Some(raw) = lookup(name) else {
        return current;
    };
    let requested = match raw.trim().parse::<u64>() {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable KDF override: {e}");
            return current;
        }
    };
    let requested = if requested < floor {
        tracing::warn!(
            var = name,
            requested,
            floor,
            "KDF override below minimum, clamping"
        );
        floor
    } else {
        requested
    };
    if requested < current {
        tracing::warn!(
            var = name,
            requested,
            current,
            "KDF overrides may only raise parameters, ignoring"
        );
        return current;
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[kdf]
mem_cost_kib = 131072
time_cost = 4
parallelism = 2

[session]
onion_layers = 3
device_bound = true
unlock_max_attempts = 3

[decoy]
default_size = 4096
profile = "adaptive"

[log]
level = "debug"
format = "json"
"#;
        let config: ZilConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.kdf.mem_cost_kib, 131072);
        assert_eq!(config.kdf.time_cost, 4);
        assert_eq!(config.session.onion_layers, 3);
        assert!(config.session.device_bound);
        assert_eq!(config.session.unlock_max_attempts, 3);
        assert_eq!(config.session.unlock_window_secs, 60);
        assert_eq!(config.decoy.profile, "adaptive");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: ZilConfig = toml::from_str("").unwrap();

        assert_eq!(config.kdf, KdfConfig::default());
        assert_eq!(config.kdf.mem_cost_kib, 65536);
        assert_eq!(config.session.onion_layers, 2);
        assert!(!config.session.device_bound);
        assert_eq!(config.decoy.default_expire_secs, 3600);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ZilConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ZilConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.kdf, parsed.kdf);
        assert_eq!(config.decoy.profile, parsed.decoy.profile);
    }

    #[test]
    fn env_override_raises() {
        let kdf = KdfConfig::default().with_overrides(env(&[
            (ENV_KDF_MEM, "131072"),
            (ENV_KDF_TIME, "5"),
        ]));
        assert_eq!(kdf.mem_cost_kib, 131072);
        assert_eq!(kdf.time_cost, 5);
        assert_eq!(kdf.parallelism, 1);
    }

    #[test]
    fn env_override_below_floor_is_clamped() {
        let base = KdfConfig {
            mem_cost_kib: 8,
            time_cost: 1,
            parallelism: 1,
        };
        let kdf = base.with_overrides(env(&[(ENV_KDF_MEM, "1024"), (ENV_KDF_TIME, "1")]));
        assert_eq!(kdf.mem_cost_kib, KDF_MIN_MEM_COST_KIB);
        assert_eq!(kdf.time_cost, KDF_MIN_TIME_COST);
    }

    #[test]
    fn env_override_never_lowers() {
        let base = KdfConfig {
            mem_cost_kib: 262144,
            time_cost: 6,
            parallelism: 4,
        };
        let kdf = base
            .clone()
            .with_overrides(env(&[(ENV_KDF_MEM, "131072"), (ENV_KDF_PAR, "2")]));
        assert_eq!(kdf, base);
    }

    #[test]
    fn env_override_garbage_ignored() {
        let kdf = KdfConfig::default().with_overrides(env(&[(ENV_KDF_TIME, "lots")]));
        assert_eq!(kdf.time_cost, KDF_MIN_TIME_COST);
    }
}
