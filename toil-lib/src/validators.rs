// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Output sanity checks

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::job::Job;
use crate::programs::{self, DockerCall};

pub const SAMTOOLS_IMAGE: &str = "quay.io/ucsc_cgl/samtools:1.3--256539928ea162949d8a65ca5c79a72ef557ce7c";

/// Structural sanity check of a BAM through `samtools quickcheck`.
/// The exit status is the verdict.
pub fn bam_quickcheck(job: &Job, bam_path: &Path) -> Result<bool, Error> {
    let work_dir = bam_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::NoFileName(bam_path.to_path_buf()))?;
    let bam_name = bam_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::NoFileName(bam_path.to_path_buf()))?;

    let guest_bam = format!("/data/{bam_name}");
    let result = DockerCall::new(job, SAMTOOLS_IMAGE, work_dir)
        .inputs([bam_name])
        .parameters(["quickcheck", "-vv", guest_bam.as_str()])
        .run();

    match result {
        Ok(()) => Ok(true),
        Err(programs::Error::Docker(docker::Error::Failed { .. })) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

/// Error when a BAM fails quickcheck
pub fn require_bam_quickcheck(job: &Job, bam_path: &Path) -> Result<(), Error> {
    if !bam_quickcheck(job, bam_path)? {
        return Err(Error::InvalidBam(bam_path.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bam failed quickcheck: {0}")]
    InvalidBam(PathBuf),
    #[error("cannot derive a file name from {0}")]
    NoFileName(PathBuf),
    #[error("docker call")]
    DockerCall(#[from] programs::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    use fs_err as fs;

    fn workflow() -> (tempfile::TempDir, Workflow) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new(Some(dir.path().to_path_buf())).unwrap();
        let workflow = Workflow::mocked("validators", &env).unwrap();
        (dir, workflow)
    }

    #[test]
    fn staged_bams_pass_in_mock_mode() {
        let (dir, workflow) = workflow();
        let job = workflow.job("check").unwrap();

        let bam = dir.path().join("aligned.bam");
        fs::write(&bam, b"BAM\x01").unwrap();

        assert!(bam_quickcheck(&job, &bam).unwrap());
        require_bam_quickcheck(&job, &bam).unwrap();
    }

    #[test]
    fn absent_bams_error_rather_than_fail() {
        let (dir, workflow) = workflow();
        let job = workflow.job("absent").unwrap();

        let err = bam_quickcheck(&job, &dir.path().join("missing.bam")).unwrap_err();

        assert!(matches!(err, Error::DockerCall(programs::Error::MissingInput(_))));
    }
}
