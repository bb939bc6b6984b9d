// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    io,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::util;

/// Identifies one workflow or job on the shared cache directories.
/// Also usable as a docker container name fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub struct Id(String);

impl Id {
    pub fn generate(name: &str) -> Self {
        let name = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || "_.-".contains(c) {
                    c
                } else {
                    '-'
                }
            })
            .collect::<String>();

        Self(format!("{}-{}", name, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Directory layout of a workflow on the host cache
#[derive(Debug, Clone)]
pub struct Paths {
    id: Id,
    host_root: PathBuf,
    guest_root: PathBuf,
}

impl Paths {
    pub fn new(id: Id, host_root: impl Into<PathBuf>, guest_root: impl Into<PathBuf>) -> io::Result<Self> {
        let host_root = host_root.into();
        util::ensure_dir_exists(&host_root)?;

        let paths = Self {
            id,
            host_root: host_root.canonicalize()?,
            guest_root: guest_root.into(),
        };

        util::ensure_dir_exists(&paths.store().host)?;
        util::ensure_dir_exists(&paths.scratch().host)?;
        util::ensure_dir_exists(&paths.downloads().host)?;

        Ok(paths)
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Content addressed store of this workflow's files
    pub fn store(&self) -> Mapping {
        Mapping {
            host: self.host_root.join("store").join(self.id.as_str()),
            guest: self.guest_root.join("store"),
        }
    }

    /// Job scratch space, subdirs of which get bind mounted
    /// into tool containers at the guest root
    pub fn scratch(&self) -> Mapping {
        Mapping {
            host: self.host_root.join("scratch").join(self.id.as_str()),
            guest: self.guest_root.clone(),
        }
    }

    /// Download cache shared across workflows
    pub fn downloads(&self) -> Mapping {
        Mapping {
            host: self.host_root.join("downloads"),
            guest: self.guest_root.join("downloads"),
        }
    }
}

/// Pairs a host path with where it appears inside a container
#[derive(Debug, Clone)]
pub struct Mapping {
    pub host: PathBuf,
    pub guest: PathBuf,
}

impl Mapping {
    /// For a path inside the container, return where it
    /// lives on the host fs
    ///
    /// Example:
    /// - host = "/var/cache/toil-lib/scratch/rnaseq-1f2e"
    /// - guest = "/data"
    /// - guest_host_path("/data/sample.bam") = "/var/cache/toil-lib/scratch/rnaseq-1f2e/sample.bam"
    pub fn guest_host_path(&self, guest_path: &Path) -> PathBuf {
        let relative = guest_path
            .strip_prefix(&self.guest)
            .or_else(|_| guest_path.strip_prefix("/"))
            .unwrap_or(guest_path);

        self.host.join(relative)
    }
}
