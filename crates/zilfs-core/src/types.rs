use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Kind of an entry in the object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Directory,
    Symlink,
    /// Planted content of a decoy container
    Decoy,
}

impl ObjectKind {
    /// Whether entries of this kind own a payload chunk.
    pub fn has_chunk(self) -> bool {
        !matches!(self, ObjectKind::Directory)
    }

    pub fn default_mode(self) -> u16 {
        match self {
            ObjectKind::File | ObjectKind::Decoy => 0o644,
            ObjectKind::Directory => 0o755,
            ObjectKind::Symlink => 0o777,
        }
    }
}

/// Container session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Committing,
}

/// Modification time: signed seconds since the Unix epoch plus a nanosecond fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            // Pre-epoch: floor the seconds, keep the fraction positive
            Err(e) => {
                let d = e.duration();
                let mut secs = -(d.as_secs() as i64);
                let mut nanos = d.subsec_nanos();
                if nanos > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                Timestamp { secs, nanos }
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        if ts.secs >= 0 {
            UNIX_EPOCH + Duration::new(ts.secs as u64, ts.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(ts.secs.unsigned_abs()) + Duration::from_nanos(ts.nanos as u64)
        }
    }
}

/// Current Unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
