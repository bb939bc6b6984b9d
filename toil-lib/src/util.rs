// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
};

use fs_err as fs;
use nix::unistd::{linkat, LinkatFlags};
use url::Url;

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn recreate_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Files under `dir`, recursively, whose path satisfies `matcher`.
/// Tool output dirs stay small, so no effort is made to stream.
pub fn enumerate_files(dir: &Path, matcher: impl Fn(&Path) -> bool + Copy) -> io::Result<Vec<PathBuf>> {
    let mut paths = vec![];

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;

        if meta.is_dir() {
            paths.extend(enumerate_files(&path, matcher)?);
        } else if meta.is_file() && matcher(&path) {
            paths.push(path);
        }
    }

    Ok(paths)
}

/// Hard link `from` at `to`, falling back to a copy across
/// filesystems. Stores and work dirs share payloads this way.
pub fn hardlink_or_copy(from: &Path, to: &Path) -> io::Result<()> {
    if linkat(None, from, None, to, LinkatFlags::NoSymlinkFollow).is_err() {
        fs::copy(from, to)?;
    }

    Ok(())
}

/// Last path segment of `uri`, empty when the url has no path
pub fn uri_file_name(uri: &Url) -> &str {
    uri.path().rsplit('/').next().unwrap_or_default()
}

pub fn num_cpus() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

pub fn is_root() -> bool {
    use nix::unistd::Uid;

    Uid::effective().is_root()
}
