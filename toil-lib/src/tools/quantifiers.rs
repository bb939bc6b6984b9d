// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! RNA-seq quantification

use std::path::{Path, PathBuf};

use fs_err as fs;
use url::Url;

use super::{unpacked_guest_dir, Error};
use crate::job::Job;
use crate::programs::DockerCall;
use crate::store::FileId;
use crate::{files, urls, util};

pub const KALLISTO_IMAGE: &str = "quay.io/ucsc_cgl/kallisto:0.42.4--35ac87df5b21a8e8e8d159f26864ac1e1db8cf86";
pub const RSEM_IMAGE: &str = "quay.io/ucsc_cgl/rsem:1.2.25--d4275175cc8df36967db460b06337a14f40d2f21";
pub const HUGO_MAPPING_IMAGE: &str =
    "quay.io/ucsc_cgl/gencode_hugo_mapping:1.0--cb4865d02f9199462e66410f515c4dabbd061e4d";

/// Quantify transcript abundance with kallisto
///
/// The index is fetched from `kallisto_index`. Single-end reads run
/// with the estimated fragment length the pipelines assume, 200 +/- 15.
/// Returns a tarball of kallisto's output files.
pub fn run_kallisto(
    job: &Job,
    r1: &FileId,
    r2: Option<&FileId>,
    kallisto_index: &Url,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;
    urls::download_url(job, kallisto_index, &work_dir, Some("kallisto_hg38.idx"))?;

    let cores = job.resources.cores.to_string();
    let mut parameters: Vec<String> = [
        "quant",
        "-i",
        "/data/kallisto_hg38.idx",
        "-t",
        cores.as_str(),
        "-o",
        "/data/",
        "-b",
        "100",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    job.read_file(r1, &work_dir.join("R1_cutadapt.fastq"))?;
    if let Some(r2) = r2 {
        job.read_file(r2, &work_dir.join("R2_cutadapt.fastq"))?;
        parameters.extend(["/data/R1_cutadapt.fastq", "/data/R2_cutadapt.fastq"].map(str::to_owned));
    } else {
        parameters.extend(["--single", "-l", "200", "-s", "15", "/data/R1_cutadapt.fastq"].map(str::to_owned));
    }

    DockerCall::new(job, KALLISTO_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(["run_info.json", "abundance.tsv", "abundance.h5"])
        .run()?;

    let outputs: Vec<PathBuf> = ["run_info.json", "abundance.tsv", "abundance.h5"]
        .iter()
        .map(|name| work_dir.join(name))
        .collect();
    let tarball = files::tarball_files(&work_dir, "kallisto.tar.gz", &outputs, None)?;

    Ok(job.write_file(&tarball)?)
}

/// Quantify a transcriptome bam with RSEM
///
/// The reference bundle is fetched from `rsem_ref` and may unpack into
/// a directory or straight into the work dir; the reference prefix is
/// recovered from the bundle's mandatory `.grp` file. Returns the gene
/// and isoform results.
pub fn run_rsem(job: &Job, bam: &FileId, rsem_ref: &Url, paired: bool) -> Result<(FileId, FileId), Error> {
    let work_dir = job.temp_dir()?;
    let tarball = urls::download_url(job, rsem_ref, &work_dir, Some("rsem_ref.tar.gz"))?;
    files::extract_tarball(&tarball, &work_dir)?;
    fs::remove_file(&tarball)?;

    // grp is a mandatory RSEM extension, its stem names the reference
    let ref_prefix = util::enumerate_files(&work_dir, |path: &Path| {
        path.extension().is_some_and(|ext| ext == "grp")
    })?
    .first()
    .and_then(|path| path.file_stem())
    .map(|stem| stem.to_string_lossy().into_owned())
    .ok_or(Error::RsemReference)?;
    let ref_folder = unpacked_guest_dir(&work_dir, job.guest_root())?;

    job.read_file(bam, &work_dir.join("transcriptome.bam"))?;

    let cores = job.resources.cores.to_string();
    let mut parameters = vec![];
    if paired {
        parameters.push("--paired-end".to_owned());
    }
    parameters.extend(
        [
            "--quiet",
            "--no-qualities",
            "-p",
            cores.as_str(),
            "--forward-prob",
            "0.5",
            "--seed-length",
            "25",
            "--fragment-length-mean",
            "-1.0",
            "--bam",
            "/data/transcriptome.bam",
        ]
        .map(str::to_owned),
    );
    parameters.push(ref_folder.join(&ref_prefix).display().to_string());
    parameters.push("rsem".to_owned());

    DockerCall::new(job, RSEM_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(["rsem.genes.results", "rsem.isoforms.results"])
        .run()?;

    let genes = job.write_file(&work_dir.join("rsem.genes.results"))?;
    let isoforms = job.write_file(&work_dir.join("rsem.isoforms.results"))?;
    Ok((genes, isoforms))
}

/// Map RSEM's gene and isoform results to HUGO names
///
/// Returns tarballs of the raw and the HUGO mapped results.
pub fn run_rsem_postprocess(
    job: &Job,
    rsem_genes: &FileId,
    rsem_isoforms: &FileId,
) -> Result<(FileId, FileId), Error> {
    let work_dir = job.temp_dir()?;
    job.read_file(rsem_genes, &work_dir.join("rsem_genes.results"))?;
    job.read_file(rsem_isoforms, &work_dir.join("rsem_isoforms.results"))?;

    DockerCall::new(job, HUGO_MAPPING_IMAGE, &work_dir)
        .parameters(["-g", "rsem_genes.results", "-i", "rsem_isoforms.results"])
        .outputs(["rsem_genes.hugo.results", "rsem_isoforms.hugo.results"])
        .run()?;

    let results: Vec<PathBuf> = ["rsem_genes.results", "rsem_isoforms.results"]
        .iter()
        .map(|name| work_dir.join(name))
        .collect();
    let hugo_results: Vec<PathBuf> = ["rsem_genes.hugo.results", "rsem_isoforms.hugo.results"]
        .iter()
        .map(|name| work_dir.join(name))
        .collect();

    let rsem_tar = files::tarball_files(&work_dir, "rsem.tar.gz", &results, None)?;
    let hugo_tar = files::tarball_files(&work_dir, "rsem_hugo.tar.gz", &hugo_results, None)?;

    Ok((job.write_file(&rsem_tar)?, job.write_file(&hugo_tar)?))
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    fn mock_workflow(dir: &Path) -> Workflow {
        let env = Env::new(Some(dir.to_path_buf())).unwrap();
        Workflow::mocked("quantifiers", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    fn bundle(dir: &Path, tar_name: &str, members: &[&str]) -> Url {
        let paths = members
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, name).unwrap();
                path
            })
            .collect::<Vec<_>>();
        let tar = files::tarball_files(dir, tar_name, &paths, None).unwrap();
        Url::from_file_path(tar).unwrap()
    }

    #[test]
    fn kallisto_tars_its_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("kallisto").unwrap();
        let r1 = stored(&workflow, dir.path(), "r1.fastq");

        let idx = dir.path().join("kallisto.idx");
        fs::write(&idx, "idx").unwrap();
        let index = Url::from_file_path(&idx).unwrap();

        let tarball = run_kallisto(&job, &r1, None, &index).unwrap();
        assert!(workflow.store().contains(&tarball));
    }

    #[test]
    fn rsem_recovers_the_reference_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("rsem").unwrap();
        let bam = stored(&workflow, dir.path(), "transcriptome.bam");

        let reference = bundle(dir.path(), "rsem_ref.tar.gz", &["hg38.grp", "hg38.seq"]);
        let (genes, isoforms) = run_rsem(&job, &bam, &reference, true).unwrap();
        assert!(workflow.store().contains(&genes));
        assert!(workflow.store().contains(&isoforms));
    }

    #[test]
    fn rsem_rejects_bundles_without_grp() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("rsem-bad").unwrap();
        let bam = stored(&workflow, dir.path(), "transcriptome.bam");

        let reference = bundle(dir.path(), "rsem_ref.tar.gz", &["hg38.seq", "hg38.ti"]);
        let result = run_rsem(&job, &bam, &reference, false);
        assert!(matches!(result, Err(Error::RsemReference)));
    }

    #[test]
    fn postprocess_produces_both_tarballs() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("rsem-post").unwrap();
        let genes = stored(&workflow, dir.path(), "genes.results");
        let isoforms = stored(&workflow, dir.path(), "isoforms.results");

        let (rsem_tar, hugo_tar) = run_rsem_postprocess(&job, &genes, &isoforms).unwrap();
        assert!(workflow.store().contains(&rsem_tar));
        assert!(workflow.store().contains(&hugo_tar));
    }
}
