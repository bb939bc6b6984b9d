// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Content addressed file store shared by the jobs of a workflow
//!
//! The library's stand-in for a distributed job store: [`FileStore::put`]
//! hands back a [`FileId`] any later job can [`FileStore::get`], with
//! identical contents stored once.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::environment;
use crate::util;

/// Sha256 digest addressing a stored file
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_lowercase()))
        } else {
            Err(Error::InvalidId(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        util::ensure_dir_exists(&root)?;
        Ok(Self { root })
    }

    /// Objects fan out over `<first5>/<last5>/<hash>`
    fn path_of(&self, id: &FileId) -> PathBuf {
        let hash = id.as_str();
        self.root
            .join(&hash[..5])
            .join(&hash[hash.len() - 5..])
            .join(hash)
    }

    /// Add `path` to the store, returning its content address
    pub fn put(&self, path: &Path) -> Result<FileId, Error> {
        let id = FileId(hash_file(path)?);
        let target = self.path_of(&id);

        if !target.exists() {
            if let Some(parent) = target.parent() {
                util::ensure_dir_exists(parent)?;
            }

            // Stage under a partial name so a crash never leaves a
            // half copied object at its final address
            let partial = target.with_extension("part");
            util::hardlink_or_copy(path, &partial)?;
            fs::rename(&partial, &target)?;
        }

        Ok(id)
    }

    /// Materialise `id` at `dest`, replacing whatever is there
    pub fn get(&self, id: &FileId, dest: &Path) -> Result<(), Error> {
        let source = self.path_of(id);
        if !source.exists() {
            return Err(Error::MissingFile(id.clone()));
        }

        if dest.exists() {
            fs::remove_file(dest)?;
        }
        if let Some(parent) = dest.parent() {
            util::ensure_dir_exists(parent)?;
        }
        util::hardlink_or_copy(&source, dest)?;

        Ok(())
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.path_of(id).exists()
    }
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; environment::FILE_READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no stored file {0}")]
    MissingFile(FileId),
    #[error("invalid file id {0:?}")]
    InvalidId(String),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (dir, store) = store();

        let source = dir.path().join("reads.fq");
        fs::write(&source, b"@r1\nACGT\n+\nFFFF\n").unwrap();

        let id = store.put(&source).unwrap();
        assert_eq!(id.as_str().len(), 64);
        assert!(store.contains(&id));

        let dest = dir.path().join("staged").join("reads.fq");
        store.get(&id, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&source).unwrap());
    }

    #[test]
    fn identical_contents_share_an_address() {
        let (dir, store) = store();

        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"same").unwrap();
        fs::write(&b, b"same").unwrap();

        assert_eq!(store.put(&a).unwrap(), store.put(&b).unwrap());

        let c = dir.path().join("c");
        fs::write(&c, b"different").unwrap();
        assert_ne!(store.put(&a).unwrap(), store.put(&c).unwrap());
    }

    #[test]
    fn get_replaces_existing_dest() {
        let (dir, store) = store();

        let source = dir.path().join("fresh");
        fs::write(&source, b"fresh").unwrap();
        let id = store.put(&source).unwrap();

        let dest = dir.path().join("stale");
        fs::write(&dest, b"stale").unwrap();
        store.get(&id, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"fresh");
    }

    #[test]
    fn missing_ids_are_reported() {
        let (_dir, store) = store();

        let id = FileId::from_str(&"0".repeat(64)).unwrap();
        let err = store.get(&id, Path::new("/nonexistent/dest")).unwrap_err();

        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn ids_must_be_sha256_hex() {
        assert!(FileId::from_str(&"a".repeat(64)).is_ok());
        assert!(FileId::from_str("abc123").is_err());
        assert!(FileId::from_str(&"z".repeat(64)).is_err());

        let mixed = FileId::from_str(&"A".repeat(64)).unwrap();
        assert_eq!(mixed.as_str(), &"a".repeat(64));
    }
}
