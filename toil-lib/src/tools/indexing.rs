// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Building reference indices for the aligners

use super::aligners::{BOWTIE2_IMAGE, SNAP_IMAGE};
use super::{stage, Error};
use crate::job::Job;
use crate::programs::DockerCall;
use crate::store::FileId;

pub const BWA_IMAGE: &str = "quay.io/ucsc_cgl/bwa:0.7.12--256539928ea162949d8a65ca5c79a72ef557ce7c";
pub const SAMTOOLS_IMAGE: &str = "quay.io/ucsc_cgl/samtools:0.1.19--dd5ac549b95eb3e5d166a5e310417ef13651994e";

/// The bowtie2 image ships the indexer next to the aligner entrypoint
const BOWTIE2_BUILD: &str = "/opt/bowtie2/bowtie2-2.3.2/bowtie2-build";

/// The five files `bwa index` derives from a fasta
#[derive(Debug, Clone)]
pub struct BwaIndex {
    pub amb: FileId,
    pub ann: FileId,
    pub bwt: FileId,
    pub pac: FileId,
    pub sa: FileId,
}

/// `NAME.N.bt2` and `NAME.rev.N.bt2` files from `bowtie2-build`
#[derive(Debug, Clone)]
pub struct Bowtie2Index {
    pub name: [FileId; 4],
    pub rev: [FileId; 2],
}

/// The four files `snap index` produces
#[derive(Debug, Clone)]
pub struct SnapIndex {
    pub genome: FileId,
    pub genome_index: FileId,
    pub genome_hash: FileId,
    pub overflow: FileId,
}

/// Build BWA index files for a reference fasta
pub fn run_bwa_index(job: &Job, reference: &FileId) -> Result<BwaIndex, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("ref.fa", reference)])?;

    DockerCall::new(job, BWA_IMAGE, &work_dir)
        .parameters(["index", "/data/ref.fa"])
        .outputs(["ref.fa.amb", "ref.fa.ann", "ref.fa.bwt", "ref.fa.pac", "ref.fa.sa"])
        .run()?;

    log::info!("created BWA index files");
    Ok(BwaIndex {
        amb: job.write_file(&work_dir.join("ref.fa.amb"))?,
        ann: job.write_file(&work_dir.join("ref.fa.ann"))?,
        bwt: job.write_file(&work_dir.join("ref.fa.bwt"))?,
        pac: job.write_file(&work_dir.join("ref.fa.pac"))?,
        sa: job.write_file(&work_dir.join("ref.fa.sa"))?,
    })
}

/// Build a `.fai` fasta index with samtools
pub fn run_samtools_faidx(job: &Job, reference: &FileId) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("ref.fasta", reference)])?;

    DockerCall::new(job, SAMTOOLS_IMAGE, &work_dir)
        .parameters(["faidx", "/data/ref.fasta"])
        .outputs(["ref.fasta.fai"])
        .run()?;

    log::info!("created reference index");
    Ok(job.write_file(&work_dir.join("ref.fasta.fai"))?)
}

/// Build bowtie2 index files for a reference fasta
pub fn run_bowtie2_index(job: &Job, reference: &FileId) -> Result<Bowtie2Index, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("ref.fa", reference)])?;

    DockerCall::new(job, BOWTIE2_IMAGE, &work_dir)
        .entrypoint(BOWTIE2_BUILD)
        .parameters(["/data/ref.fa", "/data/ref"])
        .outputs([
            "ref.1.bt2",
            "ref.2.bt2",
            "ref.3.bt2",
            "ref.4.bt2",
            "ref.rev.1.bt2",
            "ref.rev.2.bt2",
        ])
        .run()?;

    log::info!("created bowtie2 index");
    Ok(Bowtie2Index {
        name: [
            job.write_file(&work_dir.join("ref.1.bt2"))?,
            job.write_file(&work_dir.join("ref.2.bt2"))?,
            job.write_file(&work_dir.join("ref.3.bt2"))?,
            job.write_file(&work_dir.join("ref.4.bt2"))?,
        ],
        rev: [
            job.write_file(&work_dir.join("ref.rev.1.bt2"))?,
            job.write_file(&work_dir.join("ref.rev.2.bt2"))?,
        ],
    })
}

/// Build SNAP index files for a reference fasta
pub fn run_snap_index(job: &Job, reference: &FileId) -> Result<SnapIndex, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("ref.fa", reference)])?;

    DockerCall::new(job, SNAP_IMAGE, &work_dir)
        .parameters(["index", "/data/ref.fa", "/data/"])
        .outputs(["Genome", "GenomeIndex", "GenomeIndexHash", "OverflowTable"])
        .run()?;

    log::info!("created SNAP index");
    Ok(SnapIndex {
        genome: job.write_file(&work_dir.join("Genome"))?,
        genome_index: job.write_file(&work_dir.join("GenomeIndex"))?,
        genome_hash: job.write_file(&work_dir.join("GenomeIndexHash"))?,
        overflow: job.write_file(&work_dir.join("OverflowTable"))?,
    })
}

#[cfg(test)]
mod test {
    use fs_err as fs;

    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    #[test]
    fn indices_land_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::new(Some(dir.path().to_path_buf())).unwrap();
        let workflow = Workflow::mocked("indexing", &env).unwrap();
        let job = workflow.job("index").unwrap();

        let fasta = dir.path().join("ref.fa");
        fs::write(&fasta, ">chr1\nACGT\n").unwrap();
        let reference = workflow.store().put(&fasta).unwrap();

        let bwa = run_bwa_index(&job, &reference).unwrap();
        assert!(workflow.store().contains(&bwa.sa));

        let fai = run_samtools_faidx(&job, &reference).unwrap();
        assert!(workflow.store().contains(&fai));

        let bowtie2 = run_bowtie2_index(&job, &reference).unwrap();
        assert!(workflow.store().contains(&bowtie2.rev[1]));

        let snap = run_snap_index(&job, &reference).unwrap();
        assert!(workflow.store().contains(&snap.overflow));
    }
}
