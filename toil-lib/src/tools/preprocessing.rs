// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Read and alignment preprocessing ahead of variant calling
//!
//! Covers adapter trimming, sorting and indexing, duplicate marking
//! and the GATK3 indel realignment / base recalibration chain. The
//! gatk wrappers stage reference files under the names in [`Genome`]
//! and accept `unsafe_mode` to tolerate mismatched sequence
//! dictionaries.

use super::{gatk, java_options, stage, Error, Genome};
use crate::job::{Job, Resources};
use crate::programs::DockerCall;
use crate::store::FileId;

pub const CUTADAPT_IMAGE: &str = "quay.io/ucsc_cgl/cutadapt:1.9--6bd44edd2b8f8f17e25c5a268fedaab65fa851d2";
pub const PICARD_IMAGE: &str = "quay.io/ucsc_cgl/picardtools:1.95--dd5ac549b95eb3e5d166a5e310417ef13651994e";
pub const SAMTOOLS_INDEX_IMAGE: &str =
    "quay.io/ucsc_cgl/samtools:0.1.19--dd5ac549b95eb3e5d166a5e310417ef13651994e";
pub const SAMTOOLS_SORT_IMAGE: &str =
    "quay.io/ucsc_cgl/samtools:1.3--256539928ea162949d8a65ca5c79a72ef557ce7c";

/// MarkDuplicates runs best when Xmx stays at or below 10G
const MARK_DUPLICATES_MEMORY_CAP: u64 = 10 * 1024 * 1024 * 1024;

/// Trim 3' adapters from RNA-seq reads with cutadapt
///
/// Paired data needs both a forward and a reverse adapter; the second
/// trimmed fastq is only returned for paired input.
pub fn run_cutadapt(
    job: &Job,
    r1: &FileId,
    r2: Option<&FileId>,
    fwd_3pr_adapter: &str,
    rev_3pr_adapter: Option<&str>,
) -> Result<(FileId, Option<FileId>), Error> {
    let work_dir = job.temp_dir()?;

    let mut parameters = vec!["-a".to_owned(), fwd_3pr_adapter.to_owned(), "-m".to_owned(), "35".to_owned()];
    let mut outputs = vec!["R1_cutadapt.fastq"];

    job.read_file(r1, &work_dir.join("R1.fastq"))?;
    if let Some(r2) = r2 {
        let rev = rev_3pr_adapter.ok_or(Error::MissingReverseAdapter)?;
        job.read_file(r2, &work_dir.join("R2.fastq"))?;
        parameters.extend(
            [
                "-A",
                rev,
                "-o",
                "/data/R1_cutadapt.fastq",
                "-p",
                "/data/R2_cutadapt.fastq",
                "/data/R1.fastq",
                "/data/R2.fastq",
            ]
            .map(str::to_owned),
        );
        outputs.push("R2_cutadapt.fastq");
    } else {
        parameters.extend(["-o", "/data/R1_cutadapt.fastq", "/data/R1.fastq"].map(str::to_owned));
    }

    DockerCall::new(job, CUTADAPT_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(outputs)
        .run()?;

    let r1_cut = job.write_file(&work_dir.join("R1_cutadapt.fastq"))?;
    let r2_cut = r2
        .map(|_| job.write_file(&work_dir.join("R2_cutadapt.fastq")))
        .transpose()?;

    Ok((r1_cut, r2_cut))
}

/// Index a bam, producing its `.bai`
pub fn run_samtools_index(job: &Job, bam: &FileId) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("sample.bam", bam)])?;

    DockerCall::new(job, SAMTOOLS_INDEX_IMAGE, &work_dir)
        .parameters(["index", "/data/sample.bam"])
        .outputs(["sample.bam.bai"])
        .run()?;

    Ok(job.write_file(&work_dir.join("sample.bam.bai"))?)
}

/// Coordinate sort a bam
pub fn run_samtools_sort(job: &Job, bam: &FileId) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("input.bam", bam)])?;

    let cores = job.resources.cores.to_string();
    DockerCall::new(job, SAMTOOLS_SORT_IMAGE, &work_dir)
        .parameters(["sort", "-@", cores.as_str(), "-o", "/data/output.bam", "/data/input.bam"])
        .outputs(["output.bam"])
        .run()?;

    Ok(job.write_file(&work_dir.join("output.bam"))?)
}

/// Build the `.dict` sequence dictionary for a reference fasta
pub fn run_picard_create_sequence_dictionary(job: &Job, reference: &FileId) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("ref.fasta", reference)])?;

    DockerCall::new(job, PICARD_IMAGE, &work_dir)
        .parameters(["CreateSequenceDictionary", "R=ref.fasta", "O=ref.dict"])
        .outputs(["ref.dict"])
        .run()?;

    log::info!("created reference dictionary");
    Ok(job.write_file(&work_dir.join("ref.dict"))?)
}

/// Mark duplicate reads in a coordinate sorted bam with picard
pub fn picard_mark_duplicates(job: &Job, bam: &FileId, bai: &FileId) -> Result<(FileId, FileId), Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("sorted.bam", bam), ("sorted.bai", bai)])?;

    let resources = Resources {
        memory: job.resources.memory.min(MARK_DUPLICATES_MEMORY_CAP),
        ..job.resources
    };

    DockerCall::new(job, PICARD_IMAGE, &work_dir)
        .parameters([
            "MarkDuplicates",
            "INPUT=sorted.bam",
            "OUTPUT=mkdups.bam",
            "METRICS_FILE=metrics.txt",
            "ASSUME_SORTED=true",
            "CREATE_INDEX=true",
            // Ignores minor formatting issues
            "VALIDATION_STRINGENCY=LENIENT",
        ])
        // The picard-tools container has no JAVA_OPTS variable
        .env("_JAVA_OPTIONS", java_options(&resources))
        .outputs(["mkdups.bam", "mkdups.bai"])
        .run()?;

    let bam = job.write_file(&work_dir.join("mkdups.bam"))?;
    let bai = job.write_file(&work_dir.join("mkdups.bai"))?;
    Ok((bam, bai))
}

/// Run the whole GATK3 preprocessing chain on a sorted, indexed bam
///
/// Marks duplicates, creates indel realignment intervals, realigns,
/// builds the base recalibration table and applies it. `phase` and
/// `mills` are the 1000G and Mills indel VCFs, `dbsnp` the dbSNP VCF.
/// Returns the recalibrated bam and its index.
#[allow(clippy::too_many_arguments)]
pub fn run_gatk_preprocessing(
    job: &Job,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    phase: &FileId,
    mills: &FileId,
    dbsnp: &FileId,
    unsafe_mode: bool,
) -> Result<(FileId, FileId), Error> {
    let (mkdups_bam, mkdups_bai) = picard_mark_duplicates(job, bam, bai)?;
    let intervals =
        run_realigner_target_creator(job, &mkdups_bam, &mkdups_bai, genome, phase, mills, unsafe_mode)?;
    let (realigned_bam, realigned_bai) = run_indel_realignment(
        job,
        &intervals,
        &mkdups_bam,
        &mkdups_bai,
        genome,
        phase,
        mills,
        unsafe_mode,
    )?;
    let table =
        run_base_recalibration(job, &realigned_bam, &realigned_bai, genome, dbsnp, mills, unsafe_mode)?;
    apply_bqsr_recalibration(job, &table, &realigned_bam, &realigned_bai, genome, unsafe_mode)
}

/// Create the intervals file indel realignment works from
pub fn run_realigner_target_creator(
    job: &Job,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    phase: &FileId,
    mills: &FileId,
    unsafe_mode: bool,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    let entries = [
        ("ref.fasta", &genome.fasta),
        ("ref.fasta.fai", &genome.fai),
        ("ref.dict", &genome.dict),
        ("input.bam", bam),
        ("input.bai", bai),
        ("1000G.vcf", phase),
        ("mills.vcf", mills),
    ];
    stage(job, &work_dir, &entries)?;

    let mut parameters: Vec<String> = [
        "-T",
        "RealignerTargetCreator",
        "-R",
        "/data/ref.fasta",
        "-I",
        "/data/input.bam",
        "-known",
        "/data/1000G.vcf",
        "-known",
        "/data/mills.vcf",
        "--downsampling_type",
        "NONE",
        "-o",
        "/data/sample.intervals",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    extend_unsafe(&mut parameters, unsafe_mode);

    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["sample.intervals"])
        .run()?;

    Ok(job.write_file(&work_dir.join("sample.intervals"))?)
}

/// Realign the bam around the given indel intervals
#[allow(clippy::too_many_arguments)]
pub fn run_indel_realignment(
    job: &Job,
    intervals: &FileId,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    phase: &FileId,
    mills: &FileId,
    unsafe_mode: bool,
) -> Result<(FileId, FileId), Error> {
    let work_dir = job.temp_dir()?;
    let entries = [
        ("ref.fasta", &genome.fasta),
        ("ref.fasta.fai", &genome.fai),
        ("ref.dict", &genome.dict),
        ("input.bam", bam),
        ("input.bai", bai),
        ("target.intervals", intervals),
        ("phase.vcf", phase),
        ("mills.vcf", mills),
    ];
    stage(job, &work_dir, &entries)?;

    // maxReads and maxInMemory raised to the MC3 pipeline values
    let mut parameters: Vec<String> = [
        "-T",
        "IndelRealigner",
        "-R",
        "/data/ref.fasta",
        "-I",
        "/data/input.bam",
        "-known",
        "/data/phase.vcf",
        "-known",
        "/data/mills.vcf",
        "-targetIntervals",
        "/data/target.intervals",
        "--downsampling_type",
        "NONE",
        "-maxReads",
        "720000",
        "-maxInMemory",
        "5400000",
        "-o",
        "/data/output.bam",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    extend_unsafe(&mut parameters, unsafe_mode);

    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["output.bam", "output.bai"])
        .run()?;

    let bam = job.write_file(&work_dir.join("output.bam"))?;
    let bai = job.write_file(&work_dir.join("output.bai"))?;
    Ok((bam, bai))
}

/// Build the base quality score recalibration table
pub fn run_base_recalibration(
    job: &Job,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    dbsnp: &FileId,
    mills: &FileId,
    unsafe_mode: bool,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    let entries = [
        ("ref.fasta", &genome.fasta),
        ("ref.fasta.fai", &genome.fai),
        ("ref.dict", &genome.dict),
        ("input.bam", bam),
        ("input.bai", bai),
        ("dbsnp.vcf", dbsnp),
        ("mills.vcf", mills),
    ];
    stage(job, &work_dir, &entries)?;

    let cores = job.resources.cores.to_string();
    let mut parameters: Vec<String> = [
        "-T",
        "BaseRecalibrator",
        "-nct",
        cores.as_str(),
        "-R",
        "/data/ref.fasta",
        "-I",
        "/data/input.bam",
        "-knownSites",
        "/data/dbsnp.vcf",
        "-knownSites",
        "/data/mills.vcf",
        "-o",
        "/data/recal_data.table",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    extend_unsafe(&mut parameters, unsafe_mode);

    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["recal_data.table"])
        .run()?;

    Ok(job.write_file(&work_dir.join("recal_data.table"))?)
}

/// Write the bam with recalibrated base quality scores
pub fn apply_bqsr_recalibration(
    job: &Job,
    table: &FileId,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    unsafe_mode: bool,
) -> Result<(FileId, FileId), Error> {
    let work_dir = job.temp_dir()?;
    let entries = [
        ("ref.fasta", &genome.fasta),
        ("ref.fasta.fai", &genome.fai),
        ("ref.dict", &genome.dict),
        ("recal.table", table),
        ("input.bam", bam),
        ("input.bai", bai),
    ];
    stage(job, &work_dir, &entries)?;

    let cores = job.resources.cores.to_string();
    let mut parameters: Vec<String> = [
        "-T",
        "PrintReads",
        "-nct",
        cores.as_str(),
        "-R",
        "/data/ref.fasta",
        "-I",
        "/data/input.bam",
        "-BQSR",
        "/data/recal.table",
        "--emit_original_quals",
        "-o",
        "/data/bqsr.bam",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    extend_unsafe(&mut parameters, unsafe_mode);

    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["bqsr.bam", "bqsr.bai"])
        .run()?;

    let bam = job.write_file(&work_dir.join("bqsr.bam"))?;
    let bai = job.write_file(&work_dir.join("bqsr.bai"))?;
    Ok((bam, bai))
}

fn extend_unsafe(parameters: &mut Vec<String>, unsafe_mode: bool) {
    if unsafe_mode {
        parameters.extend(["-U".to_owned(), "ALLOW_SEQ_DICT_INCOMPATIBILITY".to_owned()]);
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use fs_err as fs;

    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    fn mock_workflow(dir: &Path) -> Workflow {
        let env = Env::new(Some(dir.to_path_buf())).unwrap();
        Workflow::mocked("preprocessing", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    #[test]
    fn cutadapt_requires_reverse_adapter_for_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("cutadapt").unwrap();
        let r1 = stored(&workflow, dir.path(), "r1.fastq");
        let r2 = stored(&workflow, dir.path(), "r2.fastq");

        let result = run_cutadapt(&job, &r1, Some(&r2), "AGATCGGAAGAG", None);
        assert!(matches!(result, Err(Error::MissingReverseAdapter)));

        let (_, r2_cut) = run_cutadapt(&job, &r1, Some(&r2), "AGATCGGAAGAG", Some("AGATCGGAAGAG")).unwrap();
        assert!(r2_cut.is_some());

        let (r1_cut, r2_cut) = run_cutadapt(&job, &r1, None, "AGATCGGAAGAG", None).unwrap();
        assert!(workflow.store().contains(&r1_cut));
        assert!(r2_cut.is_none());
    }

    #[test]
    fn preprocessing_chain_produces_bam_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("gatk-preprocessing").unwrap();

        let genome = Genome {
            fasta: stored(&workflow, dir.path(), "ref.fasta"),
            fai: stored(&workflow, dir.path(), "ref.fasta.fai"),
            dict: stored(&workflow, dir.path(), "ref.dict"),
        };
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let bai = stored(&workflow, dir.path(), "sample.bam.bai");
        let phase = stored(&workflow, dir.path(), "1000G.vcf");
        let mills = stored(&workflow, dir.path(), "mills.vcf");
        let dbsnp = stored(&workflow, dir.path(), "dbsnp.vcf");

        let (out_bam, out_bai) =
            run_gatk_preprocessing(&job, &bam, &bai, &genome, &phase, &mills, &dbsnp, false).unwrap();
        assert!(workflow.store().contains(&out_bam));
        assert!(workflow.store().contains(&out_bai));
    }

    #[test]
    fn sort_and_index_round_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("sort").unwrap();
        let bam = stored(&workflow, dir.path(), "unsorted.bam");

        let sorted = run_samtools_sort(&job, &bam).unwrap();
        let bai = run_samtools_index(&job, &sorted).unwrap();
        assert!(workflow.store().contains(&bai));
    }
}
