//! Labelled snapshots and content diffs between containers.
//!
//! A snapshot of `vault.zil` labelled `v1` is written next to it as
//! `vault_v1.zil`. It is a new container with its own salt, so the two
//! files never share a key and their nonce counters can diverge freely.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use zilfs_core::{ZilError, ZilResult};

use crate::session::{Session, SessionOptions};

/// Where the snapshot of `container` labelled `label` lives.
pub fn snapshot_path(container: &Path, label: &str) -> ZilResult<PathBuf> {
    if label.is_empty()
        || label == "."
        || label == ".."
        || label.contains(['/', '\\', '\0'])
    {
        return Err(ZilError::bad_argument(format!(
            "invalid snapshot label {label:?}"
        )));
    }
    let stem = container
        .file_stem()
        .ok_or_else(|| ZilError::bad_argument(format!("{} has no file name", container.display())))?;
    let mut name = stem.to_os_string();
    name.push("_");
    name.push(label);
    if let Some(ext) = container.extension() {
        name.push(".");
        name.push(ext);
    }
    Ok(container.with_file_name(name))
}

/// Commit `session`, then copy its tree into a fresh container sealed
/// under `passphrase`. `options` supplies device binding and the unlock
/// gate; KDF cost and onion depth follow the source container.
pub fn snapshot(
    session: &Session,
    label: &str,
    options: &SessionOptions,
    passphrase: &SecretString,
) -> ZilResult<PathBuf> {
    let out = snapshot_path(session.path(), label)?;
    if out.exists() {
        return Err(ZilError::bad_argument(format!(
            "snapshot {} already exists",
            out.display()
        )));
    }
    session.commit()?;

    let header = session.header();
    let copy = options
        .clone()
        .create(true)
        .kdf(header.kdf)
        .onion_layers(session.onion_layers())
        .open(&out, passphrase)?;
    for entry in session.explicit_entries() {
        if entry.is_dir() {
            copy.restore(&entry, &[])?;
        } else {
            let data = session.read(&entry.path)?;
            copy.restore(&entry, data.as_slice())?;
        }
    }
    copy.close()?;
    tracing::info!(
        container = %session.path().display(),
        snapshot = %out.display(),
        label,
        "snapshot written"
    );
    Ok(out)
}

/// One path whose content differs between two trees. `None` means the
/// path is absent on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub before: Option<blake3::Hash>,
    pub after: Option<blake3::Hash>,
}

/// Paths whose payload was added, removed or changed from `before` to
/// `after`, sorted by path. Directories are not compared.
pub fn diff_trees(before: &Session, after: &Session) -> ZilResult<Vec<TreeChange>> {
    let old = content_hashes(before)?;
    let new = content_hashes(after)?;
    let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    Ok(paths
        .into_iter()
        .filter_map(|path| {
            let (b, a) = (old.get(path).copied(), new.get(path).copied());
            (b != a).then(|| TreeChange {
                path: path.clone(),
                before: b,
                after: a,
            })
        })
        .collect())
}

fn content_hashes(session: &Session) -> ZilResult<BTreeMap<String, blake3::Hash>> {
    let mut out = BTreeMap::new();
    for entry in session.list("")? {
        if entry.is_dir() {
            continue;
        }
        let data = session.read(&entry.path)?;
        out.insert(entry.path, blake3::hash(data.as_slice()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pw() -> SecretString {
        SecretString::from("snap-pw".to_string())
    }

    #[test]
    fn snapshot_names() {
        assert_eq!(
            snapshot_path(Path::new("/d/vault.zil"), "v1").unwrap(),
            PathBuf::from("/d/vault_v1.zil")
        );
        assert_eq!(
            snapshot_path(Path::new("/d/vault"), "nightly").unwrap(),
            PathBuf::from("/d/vault_nightly")
        );
        for bad in ["", ".", "..", "a/b", "a\\b", "a\0b"] {
            assert!(matches!(
                snapshot_path(Path::new("/d/vault.zil"), bad),
                Err(ZilError::BadArgument(_))
            ));
        }
    }

    #[test]
    fn snapshot_copies_tree_under_a_fresh_salt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.zil");
        let session = Session::create(&path, &pw()).unwrap();
        session.mkdir("docs").unwrap();
        session.write("docs/a.txt", b"alpha").unwrap();
        session.set_mode("docs/a.txt", 0o600).unwrap();
        session.symlink("latest", "docs/a.txt").unwrap();

        let out = snapshot(&session, "v1", &SessionOptions::new(), &pw()).unwrap();
        assert_eq!(out, dir.path().join("vault_v1.zil"));
        assert!(!session.is_dirty());

        let copy = Session::open(&out, &pw()).unwrap();
        assert_ne!(copy.header().salt, session.header().salt);
        let shape = |s: &Session| -> Vec<_> {
            s.list("")
                .unwrap()
                .into_iter()
                .map(|e| (e.path, e.kind, e.size, e.mode, e.mtime))
                .collect()
        };
        assert_eq!(shape(&copy), shape(&session));
        assert_eq!(copy.read("docs/a.txt").unwrap().as_slice(), b"alpha");
        assert!(diff_trees(&session, &copy).unwrap().is_empty());

        assert!(matches!(
            snapshot(&session, "v1", &SessionOptions::new(), &pw()),
            Err(ZilError::BadArgument(_))
        ));
    }

    #[test]
    fn diff_reports_added_removed_and_changed() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::create(dir.path().join("vault.zil"), &pw()).unwrap();
        session.write("keep", b"same").unwrap();
        session.write("edit", b"old").unwrap();
        session.write("gone", b"bye").unwrap();
        let out = snapshot(&session, "before", &SessionOptions::new(), &pw()).unwrap();

        session.write("edit", b"new").unwrap();
        session.remove("gone").unwrap();
        session.write("fresh", b"hi").unwrap();

        let old = Session::open(&out, &pw()).unwrap();
        let changes = diff_trees(&old, &session).unwrap();
        let paths: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["edit", "fresh", "gone"]);
        assert_eq!(changes[0].before, Some(blake3::hash(b"old")));
        assert_eq!(changes[0].after, Some(blake3::hash(b"new")));
        assert_eq!(changes[1].before, None);
        assert_eq!(changes[2].after, None);
    }
}
