//! zilfs-container: the on-disk container engine
//!
//! Data flow on write:
//! ```text
//! caller → Session → ObjectTable mutation
//!        → (commit) onion-seal dirty chunks → codec::write_image → Transaction
//!                                                (temp, fsync, rename, fsync dir)
//! ```
//! Reading is the inverse: the whole image is authenticated by its
//! trailer at open, and each chunk is unsealed on first read.

pub mod codec;
pub mod decoy;
pub mod lock;
pub mod ratelimit;
pub mod session;
pub mod snapshot;
pub mod table;
pub mod txn;

pub use codec::{Flags, Header, Layout, TrailerMac};
pub use decoy::{
    adaptive_layout, generate_decoy, generate_decoy_with, generate_decoys, is_decoy,
    sweep_expired, DecoyProfile,
};
pub use lock::ContainerLock;
pub use ratelimit::{KeyedLimiter, SlidingWindow, TokenBucket, UnlockGate};
pub use session::{CloseError, KeyRing, Session, SessionOptions};
pub use snapshot::{diff_trees, snapshot, snapshot_path, TreeChange};
pub use table::{normalize_path, ObjectEntry, ObjectTable};
pub use txn::Transaction;
