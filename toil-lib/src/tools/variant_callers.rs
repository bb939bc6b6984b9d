// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Germline variant callers
//!
//! All callers take a coordinate sorted bam with its index plus the
//! reference files they need, and store the calls they produce. The
//! callers that stream calls to stdout are redirected into the work
//! dir before storing.

use std::path::Path;

use super::{gatk, stage, Error, Genome, SAMTOOLS_IMAGE};
use crate::job::Job;
use crate::programs::DockerCall;
use crate::store::{self, FileId};

pub const FREEBAYES_IMAGE: &str = "quay.io/ucsc_cgl/freebayes";
pub const PLATYPUS_IMAGE: &str = "quay.io/ucsc_cgl/platypus";
pub const SIXTEEN_GT_IMAGE: &str = "quay.io/ucsc_cgl/16gt";
pub const STRELKA_IMAGE: &str = "quay.io/ucsc_cgl/strelka";
pub const MANTA_IMAGE: &str = "quay.io/ucsc_cgl/manta";
pub const BCFTOOLS_IMAGE: &str = "quay.io/ucsc_cgl/bcftools";

/// Region-splitting helpers the freebayes image ships for parallel runs
const FASTA_GENERATE_REGIONS: &str = "/opt/cgl-docker-lib/freebayes/scripts/fasta_generate_regions.py";
const FREEBAYES_PARALLEL: &str = "/opt/cgl-docker-lib/freebayes/scripts/freebayes-parallel";

fn stage_sample(
    job: &Job,
    work_dir: &Path,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
) -> Result<(), store::Error> {
    stage(
        job,
        work_dir,
        &[
            ("ref.fa", reference),
            ("ref.fa.fai", fai),
            ("sample.bam", bam),
            ("sample.bam.bai", bai),
        ],
    )
}

/// Call variants with freebayes
///
/// With more than one core and a `chunksize` in base pairs, the
/// reference is split into regions and called with freebayes-parallel;
/// otherwise a single threaded run.
pub fn run_freebayes(
    job: &Job,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
    chunksize: Option<u64>,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage_sample(job, &work_dir, reference, fai, bam, bai)?;

    match chunksize {
        Some(chunksize) if job.resources.cores.get() > 1 => {
            let cores = job.resources.cores.to_string();
            log::info!("running freebayes parallel with {chunksize}bp chunks and {cores} cores");

            let timer = job.begin("fasta_generate_regions");
            DockerCall::new(job, FREEBAYES_IMAGE, &work_dir)
                .entrypoint(FASTA_GENERATE_REGIONS)
                .parameters(["/data/ref.fa.fai".to_owned(), chunksize.to_string()])
                .stdout_to_file(Path::new("regions"))?;
            job.finish(timer);

            let timer = job.begin("FreeBayes Parallel");
            DockerCall::new(job, FREEBAYES_IMAGE, &work_dir)
                .entrypoint(FREEBAYES_PARALLEL)
                .parameters(["/data/regions", cores.as_str(), "-f", "/data/ref.fa", "/data/sample.bam"])
                .stdout_to_file(Path::new("sample.vcf"))?;
            job.finish(timer);
        }
        _ => {
            log::info!("running freebayes single threaded");

            let timer = job.begin("FreeBayes");
            DockerCall::new(job, FREEBAYES_IMAGE, &work_dir)
                .parameters(["-f", "/data/ref.fa", "/data/sample.bam"])
                .stdout_to_file(Path::new("sample.vcf"))?;
            job.finish(timer);
        }
    }

    Ok(job.write_file(&work_dir.join("sample.vcf"))?)
}

/// Call variants with platypus, optionally in assembler mode
pub fn run_platypus(
    job: &Job,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
    assemble: bool,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage_sample(job, &work_dir, reference, fai, bam, bai)?;

    let mut parameters: Vec<String> = [
        "callVariants",
        "--refFile",
        "/data/ref.fa",
        "--outputFile",
        "/data/sample.vcf",
        "--bamFiles",
        "/data/sample.bam",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    if job.resources.cores.get() > 1 {
        parameters.extend(["--nCPU".to_owned(), job.resources.cores.to_string()]);
    }
    if assemble {
        parameters.push("--assemble".to_owned());
    }

    let timer = job.begin(format!("Platypus, assemble={assemble}"));
    DockerCall::new(job, PLATYPUS_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(["sample.vcf"])
        .run()?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("sample.vcf"))?)
}

/// Call variants with 16GT
///
/// Generates the snapshot from the bam, calls, converts the calls to
/// vcf and filters them against dbSNP. `genome_index` is the SOAP3-dp
/// index of the reference.
pub fn run_16gt(
    job: &Job,
    reference: &FileId,
    genome_index: &FileId,
    bam: &FileId,
    dbsnp: &FileId,
    sample_name: &str,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(
        job,
        &work_dir,
        &[
            ("ref.fa", reference),
            ("ref.fa.index", genome_index),
            ("sample.bam", bam),
            ("dbsnp.vcf", dbsnp),
        ],
    )?;

    let timer = job.begin("16gt bam2snapshot");
    DockerCall::new(job, SIXTEEN_GT_IMAGE, &work_dir)
        .parameters([
            "/opt/cgl-docker-lib/16GT/bam2snapshot",
            "-i",
            "/data/ref.fa.index",
            "-b",
            "/data/sample.bam",
            "-o",
            "/data/sample",
        ])
        .run()?;
    job.finish(timer);

    let timer = job.begin("16gt snapshotSnpcaller");
    DockerCall::new(job, SIXTEEN_GT_IMAGE, &work_dir)
        .parameters([
            "/opt/cgl-docker-lib/16GT/snapshotSnpcaller",
            "-i",
            "/data/ref.fa.index",
            "-o",
            "/data/sample",
        ])
        .run()?;
    job.finish(timer);

    let timer = job.begin("16gt txt2vcf");
    DockerCall::new(job, SIXTEEN_GT_IMAGE, &work_dir)
        .parameters(["perl", "/opt/cgl-docker-lib/16GT/txt2vcf.pl", "/data/sample", sample_name, "/data/ref.fa"])
        .stdout_to_file(Path::new("sample.vcf"))?;
    job.finish(timer);

    let timer = job.begin("16gt filterVCF");
    DockerCall::new(job, SIXTEEN_GT_IMAGE, &work_dir)
        .parameters(["perl", "/opt/cgl-docker-lib/16GT/filterVCF.pl", "/data/sample.vcf", "/data/dbsnp.vcf"])
        .stdout_to_file(Path::new("sample.filtered.vcf"))?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("sample.filtered.vcf"))?)
}

/// Run Strelka's germline single sample caller
///
/// Candidate indels from manta sharpen the call set when provided.
pub fn run_strelka(
    job: &Job,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
    candidate_indels: Option<&FileId>,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage_sample(job, &work_dir, reference, fai, bam, bai)?;

    let mut configure: Vec<String> = [
        "/opt/strelka/bin/configureStrelkaGermlineWorkflow.py",
        "--bam",
        "/data/sample.bam",
        "--referenceFasta",
        "/data/ref.fa",
        "--runDir",
        "/data/",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    match candidate_indels {
        Some(indels) => {
            log::info!("candidate indels from manta were provided for strelka");
            job.read_file(indels, &work_dir.join("candidateSmallIndels.vcf.gz"))?;
            configure.extend(["--indelCandidates".to_owned(), "/data/candidateSmallIndels.vcf.gz".to_owned()]);
        }
        None => log::info!("no candidate indels provided"),
    }

    let timer = job.begin("Configuring Strelka");
    DockerCall::new(job, STRELKA_IMAGE, &work_dir)
        .parameters(configure)
        .outputs(["runWorkflow.py"])
        .run()?;
    job.finish(timer);

    let cores = job.resources.cores.to_string();
    let timer = job.begin("Strelka");
    DockerCall::new(job, STRELKA_IMAGE, &work_dir)
        .parameters(["/data/runWorkflow.py", "-m", "local", "-j", cores.as_str()])
        .outputs(["variants.vcf.gz"])
        .run()?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("variants.vcf.gz"))?)
}

/// Manta's structural variant calls plus the candidate small indels
/// strelka can take as input
#[derive(Debug, Clone)]
pub struct MantaCalls {
    pub diploid_sv: FileId,
    pub candidate_indels: FileId,
}

/// Run Manta's germline single sample caller
pub fn run_manta(
    job: &Job,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
) -> Result<MantaCalls, Error> {
    let work_dir = job.temp_dir()?;
    stage_sample(job, &work_dir, reference, fai, bam, bai)?;

    let timer = job.begin("Configuring Manta");
    DockerCall::new(job, MANTA_IMAGE, &work_dir)
        .parameters([
            "/opt/manta/bin/configManta.py",
            "--normalBam",
            "/data/sample.bam",
            "--referenceFasta",
            "/data/ref.fa",
            "--runDir",
            "/data/",
        ])
        .outputs(["runWorkflow.py"])
        .run()?;
    job.finish(timer);

    let cores = job.resources.cores.to_string();
    let timer = job.begin("Manta");
    DockerCall::new(job, MANTA_IMAGE, &work_dir)
        .parameters(["/data/runWorkflow.py", "-m", "local", "-j", cores.as_str()])
        .outputs(["diploidSV.vcf.gz", "candidateSmallIndels.vcf.gz"])
        .run()?;
    job.finish(timer);

    Ok(MantaCalls {
        diploid_sv: job.write_file(&work_dir.join("diploidSV.vcf.gz"))?,
        candidate_indels: job.write_file(&work_dir.join("candidateSmallIndels.vcf.gz"))?,
    })
}

/// Run the samtools mpileup caller
pub fn run_samtools_mpileup(
    job: &Job,
    reference: &FileId,
    fai: &FileId,
    bam: &FileId,
    bai: &FileId,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage_sample(job, &work_dir, reference, fai, bam, bai)?;

    let timer = job.begin("samtools mpileup");
    DockerCall::new(job, SAMTOOLS_IMAGE, &work_dir)
        .parameters(["mpileup", "-f", "/data/ref.fa", "-o", "/data/sample.vcf.gz", "/data/sample.bam"])
        .outputs(["sample.vcf.gz"])
        .run()?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("sample.vcf.gz"))?)
}

/// Run `bcftools call` over a gzipped pileup vcf
pub fn run_bcftools_call(job: &Job, vcf_gz: &FileId) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &[("sample.vcf.gz", vcf_gz)])?;

    let cores = job.resources.cores.to_string();
    let timer = job.begin("bcftools call");
    DockerCall::new(job, BCFTOOLS_IMAGE, &work_dir)
        .parameters([
            "call",
            "-o",
            "/data/sample.calls.vcf.gz",
            "--threads",
            cores.as_str(),
            "/data/sample.vcf.gz",
        ])
        .outputs(["sample.calls.vcf.gz"])
        .run()?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("sample.calls.vcf.gz"))?)
}

/// Emit and call confidence thresholds for the haplotype caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub emit: f64,
    pub call: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { emit: 10.0, call: 30.0 }
    }
}

/// Run the GATK3 HaplotypeCaller in GVCF mode
pub fn run_gatk3_haplotype_caller(
    job: &Job,
    bam: &FileId,
    bai: &FileId,
    genome: &Genome,
    thresholds: Thresholds,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    let entries = [
        ("ref.fa", &genome.fasta),
        ("ref.fa.fai", &genome.fai),
        ("ref.dict", &genome.dict),
        ("sample.bam", bam),
        ("sample.bam.bai", bai),
    ];
    stage(job, &work_dir, &entries)?;

    let cores = job.resources.cores.to_string();
    let call_conf = format!("{:?}", thresholds.call);
    let emit_conf = format!("{:?}", thresholds.emit);
    let parameters = [
        "-T",
        "HaplotypeCaller",
        "-nct",
        cores.as_str(),
        "-R",
        "/data/ref.fa",
        "-I",
        "/data/sample.bam",
        "-o",
        "/data/output.g.vcf",
        "-stand_call_conf",
        call_conf.as_str(),
        "-stand_emit_conf",
        emit_conf.as_str(),
        "-variant_index_type",
        "LINEAR",
        "-variant_index_parameter",
        "128000",
        "--genotyping_mode",
        "Discovery",
        "--emitRefConfidence",
        "GVCF",
    ];

    let timer = job.begin("GATK3 HaplotypeCaller");
    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["output.g.vcf"])
        .run()?;
    job.finish(timer);

    Ok(job.write_file(&work_dir.join("output.g.vcf"))?)
}

#[cfg(test)]
mod test {
    use std::num::NonZeroUsize;

    use fs_err as fs;

    use super::*;
    use crate::env::Env;
    use crate::job::{Resources, Workflow};

    fn mock_workflow(dir: &Path) -> Workflow {
        let env = Env::new(Some(dir.to_path_buf())).unwrap();
        Workflow::mocked("callers", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    #[test]
    fn freebayes_runs_chunked_and_single() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let resources = Resources {
            cores: NonZeroUsize::new(4).unwrap(),
            ..Resources::default()
        };
        let job = workflow.job_with("freebayes", resources).unwrap();

        let reference = stored(&workflow, dir.path(), "ref.fa");
        let fai = stored(&workflow, dir.path(), "ref.fa.fai");
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let bai = stored(&workflow, dir.path(), "sample.bam.bai");

        let chunked = run_freebayes(&job, &reference, &fai, &bam, &bai, Some(100_000)).unwrap();
        assert!(workflow.store().contains(&chunked));

        let single = run_freebayes(&job, &reference, &fai, &bam, &bai, None).unwrap();
        assert!(workflow.store().contains(&single));
    }

    #[test]
    fn sixteen_gt_chains_to_a_filtered_vcf() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("16gt").unwrap();

        let reference = stored(&workflow, dir.path(), "ref.fa");
        let index = stored(&workflow, dir.path(), "ref.fa.index");
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let dbsnp = stored(&workflow, dir.path(), "dbsnp.vcf");

        let filtered = run_16gt(&job, &reference, &index, &bam, &dbsnp, "sample-1").unwrap();
        assert!(workflow.store().contains(&filtered));
    }

    #[test]
    fn manta_candidates_feed_strelka() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("sv").unwrap();

        let reference = stored(&workflow, dir.path(), "ref.fa");
        let fai = stored(&workflow, dir.path(), "ref.fa.fai");
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let bai = stored(&workflow, dir.path(), "sample.bam.bai");

        let calls = run_manta(&job, &reference, &fai, &bam, &bai).unwrap();
        let variants =
            run_strelka(&job, &reference, &fai, &bam, &bai, Some(&calls.candidate_indels)).unwrap();
        assert!(workflow.store().contains(&variants));
    }

    #[test]
    fn default_thresholds_match_gatk_guidance() {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.emit, 10.0);
        assert_eq!(thresholds.call, 30.0);
        assert_eq!(format!("{:?}", thresholds.call), "30.0");
    }

    #[test]
    fn haplotype_caller_emits_a_gvcf() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("hc").unwrap();

        let genome = Genome {
            fasta: stored(&workflow, dir.path(), "ref.fa"),
            fai: stored(&workflow, dir.path(), "ref.fa.fai"),
            dict: stored(&workflow, dir.path(), "ref.dict"),
        };
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let bai = stored(&workflow, dir.path(), "sample.bam.bai");

        let gvcf = run_gatk3_haplotype_caller(&job, &bam, &bai, &genome, Thresholds::default()).unwrap();
        assert!(workflow.store().contains(&gvcf));
    }

    #[test]
    fn mpileup_calls_flow_into_bcftools() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("pileup").unwrap();

        let reference = stored(&workflow, dir.path(), "ref.fa");
        let fai = stored(&workflow, dir.path(), "ref.fa.fai");
        let bam = stored(&workflow, dir.path(), "sample.bam");
        let bai = stored(&workflow, dir.path(), "sample.bam.bai");

        let pileup = run_samtools_mpileup(&job, &reference, &fai, &bam, &bai).unwrap();
        let calls = run_bcftools_call(&job, &pileup).unwrap();
        assert!(workflow.store().contains(&calls));
    }
}
