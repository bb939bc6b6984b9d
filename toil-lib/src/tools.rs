// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Wrappers for the bioinformatics tools the pipelines call
//!
//! Every wrapper follows the same shape: stage inputs from the file
//! store into a scratch work dir, run the tool image against `/data`,
//! then store the declared outputs. Images are pinned to the exact
//! build the pipelines were validated with wherever one exists.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::job::{Job, Resources};
use crate::programs::DockerCall;
use crate::store::FileId;
use crate::{files, programs, store, urls};

pub mod aligners;
pub mod indexing;
pub mod preprocessing;
pub mod qc;
pub mod quantifiers;
pub mod variant_callers;
pub mod variant_manipulation;

/// GATK 3.5, shared by preprocessing, germline calling and vqsr
pub const GATK_IMAGE: &str = "quay.io/ucsc_cgl/gatk:3.5--dba6dae49156168a909c43330350c6161dc7ecc2";

/// Rolling samtools build, for wrappers that predate the pinned tags
pub const SAMTOOLS_IMAGE: &str = "quay.io/ucsc_cgl/samtools";

/// Reference genome files the gatk and picard wrappers stage together
#[derive(Debug, Clone)]
pub struct Genome {
    pub fasta: FileId,
    pub fai: FileId,
    pub dict: FileId,
}

/// Mean insert size of the properly paired reads of a BAM
///
/// Template lengths of 10 kb and over are discarded as artifacts. An
/// empty or unpaired BAM falls back to 150 bp.
pub fn get_mean_insert_size(job: &Job, work_dir: &Path, bam_name: &str) -> Result<u64, Error> {
    let guest_bam = format!("/data/{bam_name}");
    let sam = DockerCall::new(job, SAMTOOLS_IMAGE, work_dir)
        .inputs([bam_name])
        .parameters(["view", "-f66", guest_bam.as_str()])
        .capture_stdout()?;

    let mean = mean_insert_size(&sam);
    log::info!("using insert size: {mean}");

    Ok(mean)
}

/// Insert sizes sit in the TLEN column of `samtools view` output
fn mean_insert_size(sam: &str) -> u64 {
    const MAX_INSERT: u64 = 10_000;
    const DEFAULT_INSERT: u64 = 150;

    let mut sum = 0;
    let mut count = 0;
    for line in sam.lines() {
        let Some(tlen) = line.split('\t').nth(8).and_then(|field| field.parse::<i64>().ok()) else {
            continue;
        };
        if tlen.unsigned_abs() < MAX_INSERT {
            sum += tlen.unsigned_abs();
            count += 1;
        }
    }

    if count == 0 {
        DEFAULT_INSERT
    } else {
        sum / count
    }
}

/// Materialise store files into the work dir under tool facing names
fn stage(job: &Job, work_dir: &Path, entries: &[(&str, &FileId)]) -> Result<(), store::Error> {
    for (name, id) in entries {
        job.read_file(id, &work_dir.join(name))?;
    }
    Ok(())
}

/// Jvm flags for tool containers, whose `/tmp` is too small for
/// spill files
fn java_options(resources: &Resources) -> String {
    format!("-Djava.io.tmpdir=/data/ {}", resources.xmx())
}

/// GATK3 call with the jvm pointed at the work dir for temp space
fn gatk<'a>(job: &'a Job, work_dir: &Path) -> DockerCall<'a> {
    DockerCall::new(job, GATK_IMAGE, work_dir).env("JAVA_OPTS", java_options(&job.resources))
}

/// Reference bundles unpack either into a single directory or straight
/// into the work dir; resolve where the tool should look under `/data`
fn unpacked_guest_dir(work_dir: &Path, guest_root: &Path) -> io::Result<PathBuf> {
    let entries = fs::read_dir(work_dir)?.collect::<Result<Vec<_>, _>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(guest_root.join(only.file_name())),
        _ => Ok(guest_root.to_path_buf()),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("sorted bam came out empty, ensure sufficient memory is free")]
    EmptySortedBam,
    #[error("duplicate marking requires sorting")]
    DuplicatesWithoutSort,
    #[error("paired end data requires a reverse 3' adapter sequence")]
    MissingReverseAdapter,
    #[error("no .grp file in the rsem reference bundle")]
    RsemReference,
    #[error("docker call")]
    Call(#[from] programs::Error),
    #[error("transfer")]
    Transfer(#[from] urls::Error),
    #[error("files")]
    Files(#[from] files::Error),
    #[error("store")]
    Store(#[from] store::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
