// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Read and alignment quality control

use super::Error;
use crate::files;
use crate::job::Job;
use crate::programs::DockerCall;
use crate::store::FileId;

pub const FASTQC_IMAGE: &str =
    "quay.io/ucsc_cgl/fastqc:0.11.5--be13567d00cd4c586edf8ae47d991815c8c72a49";
/// Treehouse bam qc, as specified by California Kids Cancer Comparison
pub const BAM_QC_IMAGE: &str = "hbeale/treehouse_bam_qc:1.0";

/// Outputs of a Treehouse bam qc run
#[derive(Debug)]
pub struct BamQc {
    /// Raised when the read distribution check flagged the sample
    pub failed: bool,
    /// Duplicate marked bam
    pub bam: FileId,
    /// Tarball of the qc reports
    pub tarball: FileId,
}

/// Run FastQC over one or two fastqs, returning a tarball of the reports
pub fn run_fastqc(job: &Job, r1: &FileId, r2: Option<&FileId>) -> Result<FileId, Error> {
    log::info!("running FastQC");

    let work_dir = job.temp_dir()?;
    job.read_file(r1, &work_dir.join("R1.fastq"))?;

    let mut inputs = vec!["R1.fastq"];
    let mut parameters = vec!["/data/R1.fastq".to_owned()];
    let mut output_names = vec!["R1_fastqc.html", "R1_fastqc.zip"];
    if let Some(r2) = r2 {
        job.read_file(r2, &work_dir.join("R2.fastq"))?;
        inputs.push("R2.fastq");
        parameters.extend(["-t", "2", "/data/R2.fastq"].map(str::to_owned));
        output_names.extend(["R2_fastqc.html", "R2_fastqc.zip"]);
    }

    DockerCall::new(job, FASTQC_IMAGE, &work_dir)
        .inputs(inputs)
        .parameters(parameters)
        .outputs(output_names.iter().copied())
        .run()?;

    let reports = output_names
        .into_iter()
        .map(|name| work_dir.join(name))
        .collect::<Vec<_>>();
    let tarball = files::tarball_files(&work_dir, "fastqc.tar.gz", &reports, None)?;

    Ok(job.write_file(&tarball)?)
}

/// Run the Treehouse bam qc checks over a coordinate sorted bam
///
/// `sample` prefixes the report names inside the returned tarball when
/// given. The failure flag only reflects the read distribution check,
/// callers decide whether a flagged sample stops the pipeline.
pub fn run_bam_qc(job: &Job, aligned_bam: &FileId, sample: Option<&str>) -> Result<BamQc, Error> {
    log::info!("running Treehouse bam qc");

    let work_dir = job.temp_dir()?;
    job.read_file(aligned_bam, &work_dir.join("rnaAligned.sortedByCoord.out.bam"))?;

    let cores = job.resources.cores.to_string();
    let report_names = [
        "readDist.txt",
        "rnaAligned.out.md.sorted.geneBodyCoverage.curves.pdf",
        "rnaAligned.out.md.sorted.geneBodyCoverage.txt",
    ];
    DockerCall::new(job, BAM_QC_IMAGE, &work_dir)
        .inputs(["rnaAligned.sortedByCoord.out.bam"])
        .parameters(["runQC.sh", cores.as_str()])
        .outputs(report_names.into_iter().chain(["rnaAligned.sortedByCoord.md.bam"]))
        .run()?;

    let reports = report_names.map(|name| work_dir.join(name));
    let prefix = sample.map(|sample| format!("{sample}."));
    let tarball = files::tarball_files(&work_dir, "bam_qc.tar.gz", &reports, prefix.as_deref())?;

    Ok(BamQc {
        failed: work_dir.join("readDist.txt_FAIL_qc.txt").exists(),
        bam: job.write_file(&work_dir.join("rnaAligned.sortedByCoord.md.bam"))?,
        tarball: job.write_file(&tarball)?,
    })
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
        Workflow::mocked("qc", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    #[test]
    fn fastqc_reports_one_or_both_reads() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("fastqc").unwrap();
        let r1 = stored(&workflow, dir.path(), "r1.fastq");
        let r2 = stored(&workflow, dir.path(), "r2.fastq");

        let single = run_fastqc(&job, &r1, None).unwrap();
        assert!(workflow.store().contains(&single));

        let paired = run_fastqc(&job, &r1, Some(&r2)).unwrap();
        assert!(workflow.store().contains(&paired));
    }

    #[test]
    fn bam_qc_passes_without_a_failure_flag() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("bam-qc").unwrap();
        let bam = stored(&workflow, dir.path(), "aligned.bam");

        let qc = run_bam_qc(&job, &bam, Some("sample-1")).unwrap();
        assert!(!qc.failed);
        assert!(workflow.store().contains(&qc.bam));
        assert!(workflow.store().contains(&qc.tarball));
    }
}
