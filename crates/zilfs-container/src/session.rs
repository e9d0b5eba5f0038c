//! Container session: open, mutate, commit, close.
//!
//! ```text
//! CLOSED ──open──▶ OPENING ──unlock ok──▶ OPEN ◀──▶ COMMITTING
//!                      │                    │
//!                      └──auth/format err──▶ CLOSED ◀──close──┘
//! ```
//!
//! A session holds the container lock for its whole lifetime, the
//! sealed on-disk image, the decrypted object table, and the plaintext
//! of every object written since the last commit. Readers share the
//! state lock; writers and commits take it exclusively.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use unicode_normalization::UnicodeNormalization;
use zilfs_core::config::ZilConfig;
use zilfs_core::types::{ObjectKind, SessionState, Timestamp};
use zilfs_core::{CancelToken, ZilError, ZilResult};
use zilfs_crypto::{
    bind_passphrase, derive_double_with, device_fingerprint, fractal_kdf, onion_decrypt_with_nonce,
    onion_encrypt_with_nonce, EntropySource, KdfParams, Label, Nonce, SecretKey, SecureBuffer,
};

use crate::codec::{self, chunk_ad, Header, Layout, TrailerMac, MIN_IMAGE_LEN};
use crate::lock::ContainerLock;
use crate::ratelimit::UnlockGate;
use crate::table::{ancestors, normalize_path, ObjectEntry, ObjectTable};
use crate::txn::{self, Transaction};

/// Every key a session needs, derived once at unlock.
pub struct KeyRing {
    master: SecretKey,
    table: SecretKey,
    trailer: TrailerMac,
}

impl KeyRing {
    /// Double KDF over the passphrase, then the table and trailer subkeys.
    pub fn derive(secret: &[u8], header: &Header, cancel: &CancelToken) -> ZilResult<Self> {
        let master = derive_double_with(secret, &header.salt, &header.kdf, cancel)?;
        let table = fractal_kdf(master.as_bytes(), Label::Table, 0)?;
        let trailer = TrailerMac::new(fractal_kdf(master.as_bytes(), Label::Trailer, 0)?);
        Ok(Self {
            master,
            table,
            trailer,
        })
    }

    pub fn table(&self) -> &SecretKey {
        &self.table
    }

    pub fn trailer(&self) -> &TrailerMac {
        &self.trailer
    }

    /// Onion keys of one object: `k1 = fractal(master, object, subkey)`,
    /// `k(j+1) = fractal(kj, object, j)`.
    pub fn object_keys(&self, subkey: u32, layers: u8) -> ZilResult<Vec<SecretKey>> {
        let mut keys = Vec::with_capacity(layers as usize);
        keys.push(fractal_kdf(self.master.as_bytes(), Label::Object, subkey)?);
        for j in 1..u32::from(layers) {
            let next = fractal_kdf(keys[keys.len() - 1].as_bytes(), Label::Object, j)?;
            keys.push(next);
        }
        Ok(keys)
    }

    pub fn decoy(&self, index: u32) -> ZilResult<SecretKey> {
        fractal_kdf(self.master.as_bytes(), Label::Decoy, index)
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyRing([REDACTED])")
    }
}

/// Decoy header stamp applied when a session creates a container.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecoyStamp {
    pub expires_at: u64,
    pub adaptive: bool,
}

/// How to open a container.
///
/// ```no_run
/// # use zilfs_container::SessionOptions;
/// # use secrecy::SecretString;
/// let pw = SecretString::from("correct horse".to_string());
/// let session = SessionOptions::new().create(true).open("vault.zil", &pw)?;
/// # Ok::<(), zilfs_core::ZilError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SessionOptions {
    create: bool,
    kdf: KdfParams,
    onion_layers: u8,
    fingerprint: Option<SecureBuffer>,
    cancel: CancelToken,
    gate: Option<Arc<UnlockGate>>,
    pub(crate) decoy: Option<DecoyStamp>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            create: false,
            kdf: KdfParams::minimum(),
            onion_layers: 2,
            fingerprint: None,
            cancel: CancelToken::new(),
            gate: None,
            decoy: None,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from a loaded config: KDF parameters (env overrides
    /// included), onion depth, device binding and an unlock gate.
    pub fn from_config(config: &ZilConfig) -> Self {
        let mut opts = Self::new()
            .kdf(KdfParams::from_config(&config.kdf))
            .onion_layers(config.session.onion_layers)
            .unlock_gate(Arc::new(UnlockGate::from_config(&config.session)));
        if config.session.device_bound {
            opts = opts.device_fingerprint(device_fingerprint());
        }
        opts
    }

    /// Create the container when the path does not exist yet.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// KDF parameters for newly created containers. Existing containers
    /// always use the parameters in their header.
    pub fn kdf(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }

    /// AEAD layers per chunk for newly created containers.
    pub fn onion_layers(mut self, layers: u8) -> Self {
        self.onion_layers = layers;
        self
    }

    /// Bind unlocking to a host fingerprint.
    pub fn device_fingerprint(mut self, fingerprint: SecureBuffer) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn unlock_gate(mut self, gate: Arc<UnlockGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn decoy(mut self, stamp: DecoyStamp) -> Self {
        self.decoy = Some(stamp);
        self
    }

    pub fn open(&self, path: impl AsRef<Path>, passphrase: &SecretString) -> ZilResult<Session> {
        let path = path.as_ref();
        let span = tracing::info_span!("open", container = %path.display());
        let _enter = span.enter();
        tracing::debug!(state = ?SessionState::Opening, "session state");

        let result = self.open_inner(path, passphrase);
        match &result {
            Ok(session) => tracing::info!(
                entries = session.inner.read().table.len(),
                "container opened"
            ),
            Err(ZilError::Auth) => {
                tracing::warn!(state = ?SessionState::Closed, "container authentication failed")
            }
            Err(e) => tracing::debug!(state = ?SessionState::Closed, "open failed: {e}"),
        }
        result
    }

    fn open_inner(&self, path: &Path, passphrase: &SecretString) -> ZilResult<Session> {
        if let Some(gate) = &self.gate {
            gate.admit(&gate_key(path))?;
        }
        let lock = ContainerLock::acquire(path)?;
        txn::sweep_stale(path)?;

        let secret = self.kdf_input(passphrase);
        let (keys, loaded) = match std::fs::read(path) {
            Ok(image) => self.unlock(image, &secret)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.create => {
                self.initialise(path, &secret)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ZilError::not_found(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        drop(secret);

        Ok(Session {
            path: path.to_path_buf(),
            keys,
            cancel: self.cancel.clone(),
            state: Mutex::new(SessionState::Open),
            inner: RwLock::new(Inner::new(loaded)),
            cache: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    /// NFC passphrase bytes, bound to the device fingerprint if one is set.
    fn kdf_input(&self, passphrase: &SecretString) -> SecureBuffer {
        let nfc: String = passphrase.expose_secret().nfc().collect();
        let secret = SecureBuffer::from_vec(nfc.into_bytes());
        match &self.fingerprint {
            Some(fp) => bind_passphrase(secret.as_slice(), fp.as_slice()),
            None => secret,
        }
    }

    fn unlock(&self, image: Vec<u8>, secret: &SecureBuffer) -> ZilResult<(KeyRing, Loaded)> {
        let header = Header::decode(&image)?;
        if image.len() < MIN_IMAGE_LEN {
            return Err(ZilError::format("container shorter than header and trailer"));
        }
        let keys = KeyRing::derive(secret.as_slice(), &header, &self.cancel)?;
        let loaded = Loaded::from_image(image, &keys)?;
        Ok((keys, loaded))
    }

    fn initialise(&self, path: &Path, secret: &SecureBuffer) -> ZilResult<(KeyRing, Loaded)> {
        let salt = EntropySource::global().array()?;
        let kdf = self.kdf.clamped();
        let header = match self.decoy {
            Some(stamp) => Header::decoy(salt, kdf, stamp.expires_at, stamp.adaptive),
            None => Header::new(salt, kdf),
        };
        let mut table = ObjectTable::new(self.onion_layers)?;
        let keys = KeyRing::derive(secret.as_slice(), &header, &self.cancel)?;
        let blob = table.seal(keys.table(), &header)?;

        let mut txn = Transaction::begin(path)?;
        let chunks = std::iter::empty::<ZilResult<&[u8]>>();
        if let Err(e) = codec::write_image(&mut txn, &header, &blob, chunks, keys.trailer()) {
            discard(txn);
            return Err(e);
        }
        txn.commit()?;
        tracing::info!(decoy = header.is_decoy(), "container created");

        let loaded = Loaded::from_image(std::fs::read(path)?, &keys)?;
        Ok((keys, loaded))
    }
}

fn discard(txn: Transaction) {
    if let Err(e) = txn.rollback() {
        tracing::warn!("failed to remove staging file: {e}");
    }
}

/// Rate-limiter key: the canonical container path.
fn gate_key(path: &Path) -> String {
    let canonical = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .and_then(|p| std::fs::canonicalize(p).ok())
        .zip(path.file_name())
        .map(|(dir, name)| dir.join(name))
        .unwrap_or_else(|| path.to_path_buf());
    canonical.display().to_string()
}

/// Sealed image plus its decrypted table.
struct Loaded {
    image: Vec<u8>,
    layout: Layout,
    table: ObjectTable,
}

impl Loaded {
    fn from_image(image: Vec<u8>, keys: &KeyRing) -> ZilResult<Self> {
        let layout = codec::parse(&image, keys.trailer())?;
        let table = ObjectTable::unseal(&image[layout.table.clone()], keys.table(), &layout.header)?;
        table.validate(&layout.chunk_lens())?;
        Ok(Self {
            image,
            layout,
            table,
        })
    }
}

struct Inner {
    image: Vec<u8>,
    layout: Layout,
    table: ObjectTable,
    /// Where each clean object's chunk sits in `image`
    sealed: HashMap<String, u32>,
    /// Plaintext written since the last commit
    pending: HashMap<String, Arc<SecureBuffer>>,
    dirty: BTreeSet<String>,
}

impl Inner {
    fn new(loaded: Loaded) -> Self {
        let sealed = loaded
            .table
            .entries()
            .filter_map(|e| e.chunk.map(|c| (e.path.clone(), c)))
            .collect();
        Self {
            image: loaded.image,
            layout: loaded.layout,
            table: loaded.table,
            sealed,
            pending: HashMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    fn sealed_range(&self, path: &str) -> ZilResult<(u32, Range<usize>)> {
        let index = *self
            .sealed
            .get(path)
            .ok_or_else(|| ZilError::format(format!("{path:?} has no sealed chunk")))?;
        let range = self
            .layout
            .chunks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ZilError::format(format!("chunk {index} missing from image")))?;
        Ok((index, range))
    }

    /// Refuse paths whose ancestors are not directories.
    fn check_parents(&self, path: &str) -> ZilResult<()> {
        for dir in ancestors(path) {
            if let Some(entry) = self.table.get(dir) {
                if !entry.is_dir() {
                    return Err(ZilError::bad_argument(format!("{dir} is not a directory")));
                }
            }
        }
        Ok(())
    }

    /// Refuse to store a payload at `path` when it is, or would shadow,
    /// a directory.
    fn check_payload_target(&self, path: &str) -> ZilResult<()> {
        self.check_parents(path)?;
        let is_dir = match self.table.get(path) {
            Some(entry) => entry.is_dir(),
            None => self.table.has_children(path),
        };
        if is_dir {
            return Err(ZilError::bad_argument(format!("{path} is a directory")));
        }
        Ok(())
    }

    /// Explicit entry, or a synthesised one for an implied directory.
    fn lookup(&self, path: &str) -> ZilResult<ObjectEntry> {
        if let Some(entry) = self.table.get(path) {
            return Ok(entry.listed());
        }
        if self.table.has_children(path) {
            let prefix = format!("{path}/");
            let newest = self
                .table
                .entries()
                .filter(|e| e.path.starts_with(&prefix))
                .map(|e| e.mtime)
                .max()
                .unwrap_or_default();
            return Ok(ObjectEntry::implied_dir(path, newest));
        }
        Err(ZilError::not_found(path))
    }

    fn new_dir(path: &str, mode: u16) -> ObjectEntry {
        ObjectEntry {
            path: path.to_string(),
            kind: ObjectKind::Directory,
            size: 0,
            mode,
            mtime: Timestamp::now(),
            chunk: None,
            nonce: [0u8; zilfs_crypto::NONCE_SIZE],
            subkey: 0,
        }
    }
}

/// Where a chunk of the next image comes from.
enum Source {
    /// Unchanged bytes of the current image
    Copy(Range<usize>),
    /// Plaintext to seal under the entry's nonce
    Seal(Arc<SecureBuffer>),
}

struct Planned {
    source: Source,
    index: u32,
    subkey: u32,
    nonce: Nonce,
}

/// An open container.
pub struct Session {
    path: PathBuf,
    keys: KeyRing,
    cancel: CancelToken,
    state: Mutex<SessionState>,
    inner: RwLock<Inner>,
    /// Decrypted clean chunks, evicted at commit
    cache: Mutex<HashMap<String, Arc<SecureBuffer>>>,
    _lock: ContainerLock,
}

impl Session {
    /// Open an existing container with default options.
    pub fn open(path: impl AsRef<Path>, passphrase: &SecretString) -> ZilResult<Session> {
        SessionOptions::new().open(path, passphrase)
    }

    /// Open, creating an empty container if the path does not exist.
    pub fn create(path: impl AsRef<Path>, passphrase: &SecretString) -> ZilResult<Session> {
        SessionOptions::new().create(true).open(path, passphrase)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn header(&self) -> Header {
        self.inner.read().layout.header.clone()
    }

    pub fn onion_layers(&self) -> u8 {
        self.inner.read().table.onion_layers()
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.read().dirty.is_empty()
    }

    /// Entries whose listed path starts with `prefix`, lexicographic by
    /// path. Directories, implied ones included, end in '/'.
    pub fn list(&self, prefix: &str) -> ZilResult<Vec<ObjectEntry>> {
        let prefix = prefix.trim_start_matches('/');
        let prefix: String = prefix.nfc().collect();
        let inner = self.inner.read();
        let mut listing: BTreeMap<String, ObjectEntry> = BTreeMap::new();
        for entry in inner.table.entries() {
            for dir in ancestors(&entry.path) {
                if inner.table.get(dir).is_none() {
                    let implied = ObjectEntry::implied_dir(dir, entry.mtime);
                    listing
                        .entry(implied.path.clone())
                        .and_modify(|d| d.mtime = d.mtime.max(entry.mtime))
                        .or_insert(implied);
                }
            }
            let listed = entry.listed();
            listing.insert(listed.path.clone(), listed);
        }
        Ok(listing
            .into_iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(_, entry)| entry)
            .collect())
    }

    pub fn stat(&self, path: &str) -> ZilResult<ObjectEntry> {
        let path = normalize_path(path)?;
        self.inner.read().lookup(&path)
    }

    /// Plaintext of a file, symlink target or decoy payload.
    pub fn read(&self, path: &str) -> ZilResult<Arc<SecureBuffer>> {
        let path = normalize_path(path)?;
        let inner = self.inner.read();
        let entry = match inner.table.get(&path) {
            Some(entry) if !entry.is_dir() => entry,
            Some(_) => return Err(ZilError::bad_argument(format!("{path} is a directory"))),
            None if inner.table.has_children(&path) => {
                return Err(ZilError::bad_argument(format!("{path} is a directory")))
            }
            None => return Err(ZilError::not_found(path)),
        };
        self.plaintext(&inner, entry)
    }

    fn plaintext(&self, inner: &Inner, entry: &ObjectEntry) -> ZilResult<Arc<SecureBuffer>> {
        if let Some(buf) = inner.pending.get(&entry.path) {
            return Ok(Arc::clone(buf));
        }
        if let Some(hit) = self.cache.lock().get(&entry.path) {
            return Ok(Arc::clone(hit));
        }
        let (index, range) = inner.sealed_range(&entry.path)?;
        let keys = self.keys.object_keys(entry.subkey, inner.table.onion_layers())?;
        let ad = chunk_ad(&inner.layout.header.salt, index);
        let plain = onion_decrypt_with_nonce(&inner.image[range], &keys, &entry.nonce, &ad)?;
        if plain.len() as u64 != entry.size {
            return Err(ZilError::format(format!(
                "{} decrypted to {} bytes, table declares {}",
                entry.path,
                plain.len(),
                entry.size
            )));
        }
        tracing::debug!(path = %entry.path, chunk = index, "chunk decrypted");
        let plain = Arc::new(plain);
        Ok(Arc::clone(
            self.cache
                .lock()
                .entry(entry.path.clone())
                .or_insert(plain),
        ))
    }

    /// Replace the contents of a file, creating it if needed.
    pub fn write(&self, path: &str, data: &[u8]) -> ZilResult<()> {
        self.put_object(path, data, ObjectKind::File)
    }

    pub fn symlink(&self, path: &str, target: &str) -> ZilResult<()> {
        if target.is_empty() {
            return Err(ZilError::bad_argument("empty symlink target"));
        }
        self.put_object(path, target.as_bytes(), ObjectKind::Symlink)
    }

    pub(crate) fn plant_decoy(&self, path: &str, size: usize) -> ZilResult<()> {
        let index = self.inner.read().table.chunk_count();
        let key = self.keys.decoy(index)?;
        let mut payload = SecureBuffer::zeroed(size);
        blake3::Hasher::new_keyed(key.as_bytes())
            .update(path.as_bytes())
            .finalize_xof()
            .fill(payload.as_mut_slice());
        self.put_object(path, payload.as_slice(), ObjectKind::Decoy)
    }

    fn put_object(&self, path: &str, data: &[u8], kind: ObjectKind) -> ZilResult<()> {
        let path = normalize_path(path)?;
        let mut inner = self.inner.write();
        inner.check_payload_target(&path)?;
        inner.table.check_size(data.len() as u64)?;
        self.stage(&mut inner, path, SecureBuffer::from_slice(data), kind)
    }

    /// Record new plaintext for `path` under a fresh nonce.
    fn stage(
        &self,
        inner: &mut Inner,
        path: String,
        data: SecureBuffer,
        kind: ObjectKind,
    ) -> ZilResult<()> {
        let size = data.len() as u64;
        inner.table.check_size(size)?;
        let nonce = inner.table.allocate_nonce()?;
        let entry = match inner.table.get(&path).cloned() {
            Some(mut entry) => {
                if entry.kind != kind {
                    entry.mode = kind.default_mode();
                    entry.kind = kind;
                }
                entry.size = size;
                entry.mtime = Timestamp::now();
                entry.nonce = nonce;
                entry
            }
            None => ObjectEntry {
                path: path.clone(),
                kind,
                size,
                mode: kind.default_mode(),
                mtime: Timestamp::now(),
                chunk: Some(inner.table.chunk_count()),
                nonce,
                subkey: inner.table.allocate_subkey()?,
            },
        };
        inner.table.insert(entry);
        inner.pending.insert(path.clone(), Arc::new(data));
        self.cache.lock().remove(&path);
        tracing::debug!(path = %path, bytes = size, "object staged");
        inner.dirty.insert(path);
        Ok(())
    }

    /// Up to `len` bytes from `offset`: short at the end of the object,
    /// empty past it.
    pub fn read_at(&self, path: &str, offset: u64, len: usize) -> ZilResult<SecureBuffer> {
        let data = self.read(path)?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(SecureBuffer::from_slice(&data.as_slice()[start..end]))
    }

    /// Write `data` at `offset` in a regular file, zero-filling any gap
    /// past the current end. A missing file is created.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> ZilResult<usize> {
        let path = normalize_path(path)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| ZilError::bad_argument(format!("offset {offset} too large")))?;
        let mut inner = self.inner.write();
        inner.check_payload_target(&path)?;
        let mut buf = match inner.table.get(&path).cloned() {
            Some(entry) if entry.kind == ObjectKind::File => {
                inner.table.check_size(end.max(entry.size))?;
                let current = self.plaintext(&inner, &entry)?;
                SecureBuffer::clone(&current)
            }
            Some(_) => {
                return Err(ZilError::bad_argument(format!(
                    "{path} is not a regular file"
                )))
            }
            None => {
                inner.table.check_size(end)?;
                SecureBuffer::zeroed(0)
            }
        };
        let end = usize::try_from(end)
            .map_err(|_| ZilError::bad_argument(format!("offset {offset} too large")))?;
        if buf.len() < end {
            buf.resize(end);
        }
        buf.overwrite(end - data.len(), data)?;
        self.stage(&mut inner, path, buf, ObjectKind::File)?;
        Ok(data.len())
    }

    /// Shorten or zero-extend a file to `len` bytes.
    pub fn truncate(&self, path: &str, len: u64) -> ZilResult<()> {
        let path = normalize_path(path)?;
        let mut inner = self.inner.write();
        let entry = match inner.table.get(&path) {
            Some(entry) if !entry.is_dir() => entry.clone(),
            Some(_) => return Err(ZilError::bad_argument(format!("{path} is a directory"))),
            None => return Err(ZilError::not_found(path)),
        };
        inner.table.check_size(len)?;
        let new_len = usize::try_from(len)
            .map_err(|_| ZilError::bad_argument(format!("length {len} too large")))?;
        let current = self.plaintext(&inner, &entry)?;
        let mut resized = SecureBuffer::clone(&current);
        drop(current);
        resized.resize(new_len);
        self.stage(&mut inner, path, resized, entry.kind)
    }

    /// Move a file, symlink, decoy or directory subtree. A non-directory
    /// already at `to` is replaced. Moved objects keep their sealed chunks.
    pub fn rename(&self, from: &str, to: &str) -> ZilResult<()> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        let mut inner = self.inner.write();
        let from_is_dir = match inner.table.get(&from) {
            Some(entry) => entry.is_dir(),
            None if inner.table.has_children(&from) => true,
            None => return Err(ZilError::not_found(from)),
        };
        if from == to {
            return Ok(());
        }
        let prefix = format!("{from}/");
        if to.starts_with(&prefix) {
            return Err(ZilError::bad_argument(format!(
                "cannot move {from} beneath itself"
            )));
        }
        inner.check_parents(&to)?;
        let to_is_dir = match inner.table.get(&to) {
            Some(entry) => entry.is_dir(),
            None => inner.table.has_children(&to),
        };
        if to_is_dir || (from_is_dir && inner.table.get(&to).is_some()) {
            return Err(ZilError::bad_argument(format!("{to} already exists")));
        }
        if inner.table.remove(&to).is_some() {
            inner.pending.remove(&to);
            inner.sealed.remove(&to);
            self.cache.lock().remove(&to);
        }

        let moving: Vec<String> = inner
            .table
            .entries()
            .filter(|e| e.path == from || e.path.starts_with(&prefix))
            .map(|e| e.path.clone())
            .collect();
        let mut cache = self.cache.lock();
        for old in moving {
            let new = format!("{to}{}", &old[from.len()..]);
            inner.table.rename(&old, new.clone());
            if let Some(buf) = inner.pending.remove(&old) {
                inner.pending.insert(new.clone(), buf);
            }
            if let Some(index) = inner.sealed.remove(&old) {
                inner.sealed.insert(new.clone(), index);
            }
            if let Some(hit) = cache.remove(&old) {
                cache.insert(new.clone(), hit);
            }
            inner.dirty.insert(old);
            inner.dirty.insert(new);
        }
        tracing::debug!(from = %from, to = %to, "object renamed");
        Ok(())
    }

    /// Explicit table entries, parents before children.
    pub(crate) fn explicit_entries(&self) -> Vec<ObjectEntry> {
        self.inner.read().table.entries().cloned().collect()
    }

    /// Recreate `entry` (kind, mode, mtime) with `payload` as its content.
    pub(crate) fn restore(&self, entry: &ObjectEntry, payload: &[u8]) -> ZilResult<()> {
        let path = normalize_path(&entry.path)?;
        let mut inner = self.inner.write();
        if entry.is_dir() {
            inner.check_parents(&path)?;
            inner.table.insert(Inner::new_dir(&path, entry.mode));
            inner.dirty.insert(path.clone());
        } else {
            inner.check_payload_target(&path)?;
            self.stage(&mut inner, path.clone(), SecureBuffer::from_slice(payload), entry.kind)?;
        }
        if let Some(e) = inner.table.get_mut(&path) {
            e.mode = entry.mode;
            e.mtime = entry.mtime;
        }
        Ok(())
    }

    /// Remove a file, symlink, decoy or empty directory.
    pub fn remove(&self, path: &str) -> ZilResult<()> {
        let path = normalize_path(path)?;
        let mut inner = self.inner.write();
        if inner.table.has_children(&path) {
            return Err(ZilError::bad_argument(format!("{path} is not empty")));
        }
        if inner.table.remove(&path).is_none() {
            return Err(ZilError::not_found(path));
        }
        inner.pending.remove(&path);
        inner.sealed.remove(&path);
        self.cache.lock().remove(&path);
        tracing::debug!(path = %path, "object removed");
        inner.dirty.insert(path);
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> ZilResult<()> {
        let path = normalize_path(path)?;
        let mut inner = self.inner.write();
        inner.check_parents(&path)?;
        if inner.table.get(&path).is_some() {
            return Err(ZilError::bad_argument(format!("{path} already exists")));
        }
        inner
            .table
            .insert(Inner::new_dir(&path, ObjectKind::Directory.default_mode()));
        inner.dirty.insert(path);
        Ok(())
    }

    /// Set permission bits. An implied directory becomes explicit.
    pub fn set_mode(&self, path: &str, mode: u16) -> ZilResult<()> {
        let path = normalize_path(path)?;
        let mode = mode & 0o7777;
        let mut inner = self.inner.write();
        if let Some(entry) = inner.table.get_mut(&path) {
            entry.mode = mode;
        } else if inner.table.has_children(&path) {
            inner.table.insert(Inner::new_dir(&path, mode));
        } else {
            return Err(ZilError::not_found(path));
        }
        inner.dirty.insert(path);
        Ok(())
    }

    /// Persist pending changes; the session stays open. A failed commit
    /// leaves the container file and the session's view unchanged.
    pub fn commit(&self) -> ZilResult<()> {
        let mut inner = self.inner.write();
        if inner.dirty.is_empty() {
            return Ok(());
        }
        *self.state.lock() = SessionState::Committing;
        let mut next = inner.table.clone();
        let result = self.write_back(&inner, &mut next);
        *self.state.lock() = SessionState::Open;

        match result {
            Ok(loaded) => {
                let changed = inner.dirty.len();
                *inner = Inner::new(loaded);
                self.cache.lock().clear();
                tracing::info!(
                    changed,
                    chunks = inner.layout.chunks.len(),
                    bytes = inner.image.len(),
                    "container committed"
                );
                Ok(())
            }
            Err(e) => {
                inner.table.burn_counter_to(next.counter());
                tracing::warn!("commit failed, container unchanged: {e}");
                Err(e)
            }
        }
    }

    fn write_back(&self, inner: &Inner, next: &mut ObjectTable) -> ZilResult<Loaded> {
        let header = inner.layout.header.clone();
        let order: Vec<ObjectEntry> = next.chunk_order().into_iter().cloned().collect();
        let mut plan = Vec::with_capacity(order.len());
        for entry in &order {
            self.cancel.checkpoint()?;
            let index = entry
                .chunk
                .ok_or_else(|| ZilError::format(format!("{} lost its chunk", entry.path)))?;
            let mut nonce = entry.nonce;
            let source = match inner.pending.get(&entry.path) {
                Some(buf) => Source::Seal(Arc::clone(buf)),
                None if inner.sealed.get(&entry.path) == Some(&index) => {
                    Source::Copy(inner.sealed_range(&entry.path)?.1)
                }
                // Shifted by a removal: its AD changes, so reseal under a fresh nonce
                None => {
                    let plain = self.plaintext(inner, entry)?;
                    nonce = next.allocate_nonce()?;
                    if let Some(e) = next.get_mut(&entry.path) {
                        e.nonce = nonce;
                    }
                    Source::Seal(plain)
                }
            };
            plan.push(Planned {
                source,
                index,
                subkey: entry.subkey,
                nonce,
            });
        }

        let blob = next.seal(self.keys.table(), &header)?;
        let layers = next.onion_layers();
        let chunks = plan
            .iter()
            .map(|p| self.chunk_bytes(inner, &header.salt, layers, p));

        let mut txn = Transaction::begin(&self.path)?;
        let staged = codec::write_image(&mut txn, &header, &blob, chunks, self.keys.trailer())
            .and_then(|_| txn.prepare())
            .and_then(|_| self.cancel.checkpoint());
        if let Err(e) = staged {
            discard(txn);
            return Err(e);
        }
        txn.commit()?;

        Loaded::from_image(std::fs::read(&self.path)?, &self.keys)
    }

    fn chunk_bytes<'a>(
        &self,
        inner: &'a Inner,
        salt: &[u8; zilfs_crypto::SALT_SIZE],
        layers: u8,
        planned: &Planned,
    ) -> ZilResult<Cow<'a, [u8]>> {
        self.cancel.checkpoint()?;
        match &planned.source {
            Source::Copy(range) => Ok(Cow::Borrowed(&inner.image[range.clone()])),
            Source::Seal(plain) => {
                let keys = self.keys.object_keys(planned.subkey, layers)?;
                let ad = chunk_ad(salt, planned.index);
                let sealed = onion_encrypt_with_nonce(plain.as_slice(), &keys, &planned.nonce, &ad)?;
                Ok(Cow::Owned(sealed))
            }
        }
    }

    /// Commit if dirty, then release the container.
    ///
    /// On failure the session is handed back, still open, so the caller
    /// can retry or drop it.
    pub fn close(self) -> Result<(), CloseError> {
        if let Err(error) = self.commit() {
            return Err(CloseError {
                error,
                session: self,
            });
        }
        *self.state.lock() = SessionState::Closed;
        tracing::info!(container = %self.path.display(), "container closed");
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let dirty = self.inner.get_mut().dirty.len();
        if dirty > 0 {
            tracing::warn!(
                container = %self.path.display(),
                dirty,
                "session dropped with uncommitted changes"
            );
        }
    }
}

/// A failed [`Session::close`]; the session is still open.
pub struct CloseError {
    pub error: ZilError,
    pub session: Session,
}

impl CloseError {
    pub fn into_session(self) -> Session {
        self.session
    }
}

impl fmt::Debug for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {}: {}", self.session.path.display(), self.error)
    }
}

impl std::error::Error for CloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<CloseError> for ZilError {
    fn from(e: CloseError) -> Self {
        let CloseError { error, session } = e;
        drop(session);
        error
    }
}
