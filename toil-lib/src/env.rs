// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::util;

/// Host-side directories the library works out of
#[derive(Debug, Clone)]
pub struct Env {
    pub cache_dir: PathBuf,
}

impl Env {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, Error> {
        let is_root = util::is_root();
        let cache_dir = resolve_cache_dir(is_root, cache_dir)?;

        util::ensure_dir_exists(&cache_dir)?;

        Ok(Self { cache_dir })
    }
}

fn resolve_cache_dir(is_root: bool, custom: Option<PathBuf>) -> Result<PathBuf, Error> {
    if let Some(dir) = custom {
        Ok(dir)
    } else if is_root {
        Ok(PathBuf::from("/var/cache/toil-lib"))
    } else {
        Ok(dirs::cache_dir().ok_or(Error::UserCache)?.join("toil-lib"))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find cache dir, $XDG_CACHE_HOME or $HOME env not set")]
    UserCache,
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn custom_cache_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("cache");

        let env = Env::new(Some(custom.clone())).unwrap();

        assert_eq!(env.cache_dir, custom);
        assert!(custom.exists());
    }
}
