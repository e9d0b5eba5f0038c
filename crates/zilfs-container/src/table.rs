//! Object table: path → entry map, sealed as one AEAD blob.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use zilfs_core::types::{ObjectKind, Timestamp};
use zilfs_core::{ZilError, ZilResult};
use zilfs_crypto::aead::{self, counter_nonce, Nonce};
use zilfs_crypto::{SecretKey, SecureBuffer, NONCE_SIZE, TAG_SIZE};

use crate::codec::Header;

/// Upper bound on onion layers per chunk.
pub const MAX_ONION_LAYERS: u8 = 8;

/// One object in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    /// Normalised path; directories are listed with a trailing '/'
    pub path: String,
    pub kind: ObjectKind,
    /// Plaintext size in bytes (0 for directories)
    pub size: u64,
    /// POSIX permission bits
    pub mode: u16,
    pub mtime: Timestamp,
    /// Index into the chunk stream; `None` for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u32>,
    pub nonce: Nonce,
    pub subkey: u32,
}

impl ObjectEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    /// Listing form: directories get a trailing '/'.
    pub(crate) fn listed(&self) -> ObjectEntry {
        let mut out = self.clone();
        if out.is_dir() && !out.path.ends_with('/') {
            out.path.push('/');
        }
        out
    }

    pub(crate) fn implied_dir(path: &str, mtime: Timestamp) -> ObjectEntry {
        ObjectEntry {
            path: format!("{path}/"),
            kind: ObjectKind::Directory,
            size: 0,
            mode: ObjectKind::Directory.default_mode(),
            mtime,
            chunk: None,
            nonce: [0u8; NONCE_SIZE],
            subkey: 0,
        }
    }
}

/// Normalise a caller path: NFC, '/' separated, no leading or trailing
/// '/', no empty, '.' or '..' segments.
pub fn normalize_path(raw: &str) -> ZilResult<String> {
    let nfc: String = raw.nfc().collect();
    let trimmed = nfc.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ZilError::bad_argument("empty path"));
    }
    if trimmed.contains('\0') {
        return Err(ZilError::bad_argument(format!("NUL byte in path {raw:?}")));
    }
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(ZilError::bad_argument(format!("empty segment in {raw:?}"))),
            "." | ".." => {
                return Err(ZilError::bad_argument(format!(
                    "relative segment {segment:?} in {raw:?}"
                )))
            }
            _ => {}
        }
    }
    Ok(trimmed.to_string())
}

/// Every proper ancestor of `path`, shallowest first.
pub(crate) fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

#[derive(Serialize, Deserialize)]
struct TableDoc {
    counter: u64,
    next_subkey: u32,
    onion_layers: u8,
    entries: Vec<ObjectEntry>,
}

/// Decrypted object table of an open container.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    counter: u64,
    next_subkey: u32,
    onion_layers: u8,
    entries: BTreeMap<String, ObjectEntry>,
}

impl ObjectTable {
    pub fn new(onion_layers: u8) -> ZilResult<Self> {
        if onion_layers == 0 || onion_layers > MAX_ONION_LAYERS {
            return Err(ZilError::bad_argument(format!(
                "onion layers must be 1..={MAX_ONION_LAYERS}, got {onion_layers}"
            )));
        }
        Ok(Self {
            counter: 0,
            next_subkey: 0,
            onion_layers,
            entries: BTreeMap::new(),
        })
    }

    pub fn onion_layers(&self) -> u8 {
        self.onion_layers
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Next nonce from the container's monotonic counter.
    pub fn allocate_nonce(&mut self) -> ZilResult<Nonce> {
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| ZilError::bad_argument("nonce counter exhausted"))?;
        Ok(counter_nonce(self.counter))
    }

    pub fn allocate_subkey(&mut self) -> ZilResult<u32> {
        let index = self.next_subkey;
        self.next_subkey = index
            .checked_add(1)
            .ok_or_else(|| ZilError::bad_argument("subkey index space exhausted"))?;
        Ok(index)
    }

    /// Keep nonces burned by a failed commit out of circulation.
    pub(crate) fn burn_counter_to(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }

    pub fn get(&self, path: &str) -> Option<&ObjectEntry> {
        self.entries.get(path)
    }

    pub(crate) fn get_mut(&mut self, path: &str) -> Option<&mut ObjectEntry> {
        self.entries.get_mut(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.entries.values()
    }

    /// Whether any entry lives strictly beneath `dir`.
    pub fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{dir}/");
        self.entries
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    pub fn chunk_count(&self) -> u32 {
        self.entries.values().filter(|e| e.chunk.is_some()).count() as u32
    }

    /// Chunk-bearing entries in chunk-stream order.
    pub fn chunk_order(&self) -> Vec<&ObjectEntry> {
        let mut out: Vec<&ObjectEntry> = self.entries.values().filter(|e| e.chunk.is_some()).collect();
        out.sort_by_key(|e| e.chunk);
        out
    }

    pub(crate) fn insert(&mut self, entry: ObjectEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Remove `path`, closing the gap it leaves in the chunk stream.
    pub(crate) fn remove(&mut self, path: &str) -> Option<ObjectEntry> {
        let removed = self.entries.remove(path)?;
        if let Some(gone) = removed.chunk {
            for entry in self.entries.values_mut() {
                if let Some(idx) = entry.chunk.as_mut() {
                    if *idx > gone {
                        *idx -= 1;
                    }
                }
            }
        }
        Some(removed)
    }

    /// Re-key an entry. Its chunk, subkey and nonce are untouched.
    pub(crate) fn rename(&mut self, from: &str, to: String) -> bool {
        match self.entries.remove(from) {
            Some(mut entry) => {
                entry.path = to.clone();
                self.entries.insert(to, entry);
                true
            }
            None => false,
        }
    }

    /// Stored length of a chunk holding `size` plaintext bytes.
    pub fn sealed_len(&self, size: u64) -> u64 {
        size.saturating_add((TAG_SIZE as u64) * u64::from(self.onion_layers))
    }

    /// Refuse payloads whose sealed chunk would overflow the u32 length
    /// prefix of the chunk stream.
    pub fn check_size(&self, size: u64) -> ZilResult<()> {
        if self.sealed_len(size) > u64::from(u32::MAX) {
            return Err(ZilError::bad_argument(format!(
                "object of {size} bytes exceeds the chunk size limit"
            )));
        }
        Ok(())
    }

    /// Cross-check the table against the chunk stream it was read with.
    pub fn validate(&self, chunk_lens: &[usize]) -> ZilResult<()> {
        if self.onion_layers == 0 || self.onion_layers > MAX_ONION_LAYERS {
            return Err(ZilError::format(format!(
                "table declares {} onion layers",
                self.onion_layers
            )));
        }
        let mut seen = HashSet::new();
        let mut nonces = HashSet::new();
        for (path, entry) in &self.entries {
            if *path != entry.path || normalize_path(path).ok().as_deref() != Some(path.as_str()) {
                return Err(ZilError::format(format!("malformed path {path:?} in table")));
            }
            if entry.kind != ObjectKind::Directory && !nonces.insert(entry.nonce) {
                return Err(ZilError::format(format!("nonce reused by {path:?}")));
            }
            match (entry.kind.has_chunk(), entry.chunk) {
                (true, Some(idx)) => {
                    let stored = chunk_lens.get(idx as usize).ok_or_else(|| {
                        ZilError::format(format!("{path:?} references missing chunk {idx}"))
                    })?;
                    if !seen.insert(idx) {
                        return Err(ZilError::format(format!("chunk {idx} referenced twice")));
                    }
                    if *stored as u64 != self.sealed_len(entry.size) {
                        return Err(ZilError::format(format!(
                            "{path:?} declares {} bytes but chunk {idx} holds {stored}",
                            entry.size
                        )));
                    }
                }
                (false, None) if entry.size == 0 => {}
                _ => {
                    return Err(ZilError::format(format!(
                        "{path:?} has inconsistent kind and chunk"
                    )))
                }
            }
        }
        if seen.len() != chunk_lens.len() {
            return Err(ZilError::format(format!(
                "{} chunks in stream, {} referenced",
                chunk_lens.len(),
                seen.len()
            )));
        }
        Ok(())
    }

    fn to_json(&self) -> ZilResult<SecureBuffer> {
        let mut entries = self.chunk_order().into_iter().cloned().collect::<Vec<_>>();
        entries.extend(self.entries.values().filter(|e| e.chunk.is_none()).cloned());
        let doc = TableDoc {
            counter: self.counter,
            next_subkey: self.next_subkey,
            onion_layers: self.onion_layers,
            entries,
        };
        serde_json::to_vec(&doc)
            .map(SecureBuffer::from_vec)
            .map_err(|e| ZilError::bad_argument(format!("object table serialization: {e}")))
    }

    fn from_json(bytes: &[u8]) -> ZilResult<Self> {
        let doc: TableDoc = serde_json::from_slice(bytes)
            .map_err(|e| ZilError::format(format!("object table deserialization: {e}")))?;
        let mut entries = BTreeMap::new();
        for entry in doc.entries {
            if entries.insert(entry.path.clone(), entry).is_some() {
                return Err(ZilError::format("duplicate path in object table"));
            }
        }
        Ok(Self {
            counter: doc.counter,
            next_subkey: doc.next_subkey,
            onion_layers: doc.onion_layers,
            entries,
        })
    }

    /// Encrypt the table: `nonce(12) || ciphertext`, AD = header `[0..28)`.
    ///
    /// Allocates the table nonce first so the stored counter covers it.
    pub fn seal(&mut self, key: &SecretKey, header: &Header) -> ZilResult<Vec<u8>> {
        let nonce = self.allocate_nonce()?;
        let json = self.to_json()?;
        let ct = aead::encrypt(key, &nonce, &header.table_ad(), json.as_slice())?;
        let mut blob = Vec::with_capacity(NONCE_SIZE + ct.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ct);
        Ok(blob)
    }

    pub fn unseal(blob: &[u8], key: &SecretKey, header: &Header) -> ZilResult<Self> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ZilError::Auth);
        }
        let (nonce, ct) = blob.split_at(NONCE_SIZE);
        let mut n = [0u8; NONCE_SIZE];
        n.copy_from_slice(nonce);
        let json = aead::decrypt(key, &n, &header.table_ad(), ct)?;
        Self::from_json(json.as_slice())
    }
}
