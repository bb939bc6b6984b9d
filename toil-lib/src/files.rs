// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Bundling and shipping output files between jobs and out of
//! pipelines

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use fs_err as fs;
use thiserror::Error;

use crate::util;

/// Gzipped tarball of `paths` at `work_dir/tar_name`. Members keep
/// their file names, flattened, with `prefix` prepended when given.
pub fn tarball_files(
    work_dir: &Path,
    tar_name: &str,
    paths: &[PathBuf],
    prefix: Option<&str>,
) -> Result<PathBuf, Error> {
    util::ensure_dir_exists(work_dir)?;

    // Hardlink members under their archive names so plain tar
    // produces the layout
    let staging = work_dir.join(format!(".{tar_name}.staging"));
    util::recreate_dir(&staging)?;

    let mut members = vec![];
    for path in paths {
        let name = format!("{}{}", prefix.unwrap_or_default(), file_name(path)?);
        util::hardlink_or_copy(path, &staging.join(&name))?;
        members.push(name);
    }

    let tar_path = work_dir.join(tar_name);
    log::debug!("creating {tar_name} from {} members", members.len());

    let mut command = Command::new("tar");
    command
        .arg("-czf")
        .arg(&tar_path)
        .arg("-C")
        .arg(&staging)
        .args(&members);
    run(command)?;

    fs::remove_dir_all(&staging)?;

    Ok(tar_path)
}

/// Unpack `tar_path` into `dest`, compression detected by tar
pub fn extract_tarball(tar_path: &Path, dest: &Path) -> Result<(), Error> {
    util::ensure_dir_exists(dest)?;

    let mut command = Command::new("tar");
    command.arg("-xf").arg(tar_path).arg("-C").arg(dest);
    run(command)
}

/// Share `paths` into `dest` under their file names, sources kept
pub fn copy_files(paths: &[PathBuf], dest: &Path) -> Result<(), Error> {
    util::ensure_dir_exists(dest)?;

    for path in paths {
        let target = dest.join(file_name(path)?);
        util::hardlink_or_copy(path, &target)?;
    }

    Ok(())
}

/// Move `paths` into `dest` under their file names, copying across
/// filesystems
pub fn move_files(paths: &[PathBuf], dest: &Path) -> Result<(), Error> {
    util::ensure_dir_exists(dest)?;

    for path in paths {
        let target = dest.join(file_name(path)?);

        if fs::rename(path, &target).is_err() {
            fs::copy(path, &target)?;
            fs::remove_file(path)?;
        }
    }

    Ok(())
}

fn file_name(path: &Path) -> Result<&str, Error> {
    if !path.is_absolute() {
        return Err(Error::RelativePath(path.to_path_buf()));
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::NoFileName(path.to_path_buf()))
}

fn run(mut command: Command) -> Result<(), Error> {
    let status = command.status()?;
    if !status.success() {
        return Err(Error::Tar(status));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("path {0} is relative, absolute paths required")]
    RelativePath(PathBuf),
    #[error("cannot derive a file name from {0}")]
    NoFileName(PathBuf),
    #[error("tar failed with {0}")]
    Tar(ExitStatus),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tarballs_roundtrip_with_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path();

        let report = work_dir.join("report.html");
        let summary = work_dir.join("summary.txt");
        fs::write(&report, b"<html/>").unwrap();
        fs::write(&summary, b"PASS").unwrap();

        let tar = tarball_files(
            work_dir,
            "qc.tar.gz",
            &[report, summary],
            Some("sample."),
        )
        .unwrap();
        assert_eq!(tar, work_dir.join("qc.tar.gz"));
        assert!(!work_dir.join(".qc.tar.gz.staging").exists());

        let out = work_dir.join("unpacked");
        extract_tarball(&tar, &out).unwrap();

        assert_eq!(fs::read(out.join("sample.report.html")).unwrap(), b"<html/>");
        assert_eq!(fs::read(out.join("sample.summary.txt")).unwrap(), b"PASS");
    }

    #[test]
    fn relative_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let err = tarball_files(
            dir.path(),
            "out.tar.gz",
            &[PathBuf::from("relative.txt")],
            None,
        )
        .unwrap_err();

        assert!(matches!(err, Error::RelativePath(_)));
    }

    #[test]
    fn copies_keep_sources() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("calls.vcf");
        fs::write(&source, b"##fileformat=VCFv4.2\n").unwrap();

        let out = dir.path().join("out");
        copy_files(&[source.clone()], &out).unwrap();

        assert!(source.exists());
        assert_eq!(
            fs::read(out.join("calls.vcf")).unwrap(),
            b"##fileformat=VCFv4.2\n"
        );
    }

    #[test]
    fn moves_remove_sources() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("aligned.bam");
        fs::write(&source, b"BAM").unwrap();

        let out = dir.path().join("out");
        move_files(&[source.clone()], &out).unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(out.join("aligned.bam")).unwrap(), b"BAM");
    }
}
