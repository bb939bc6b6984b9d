// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Read aligners
//!
//! STAR takes its index as a tarball url, the others take prebuilt
//! index files from the store, see [`crate::tools::indexing`].

use std::path::Path;
use std::time::Duration;

use fs_err as fs;
use url::Url;

use super::indexing::{Bowtie2Index, BwaIndex, SnapIndex};
use super::{stage, unpacked_guest_dir, Error};
use crate::job::Job;
use crate::programs::DockerCall;
use crate::store::FileId;
use crate::{files, urls};

pub const STAR_IMAGE: &str = "quay.io/ucsc_cgl/star:2.4.2a--bcbd5122b69ff6ac4ef61958e47bde94001cfe80";
pub const BWAKIT_IMAGE: &str = "quay.io/ucsc_cgl/bwakit:0.7.12--c85ccff267d5021b75bb1c9ccf5f4b79f91835cc";
pub const BOWTIE2_IMAGE: &str = "quay.io/ucsc_cgl/bowtie2";
pub const SNAP_IMAGE: &str = "quay.io/ucsc_cgl/snap";

/// Everything STAR leaves behind for downstream quantification and qc
#[derive(Debug, Clone)]
pub struct StarAlignment {
    pub transcriptome_bam: FileId,
    pub aligned_bam: FileId,
    /// Only produced when wiggle output was requested
    pub wiggle: Option<FileId>,
    pub log: FileId,
    pub sj: FileId,
}

/// Align fastqs with STAR, single or paired end
///
/// The index tarball is fetched from `star_index` and may unpack into
/// a directory or straight into the work dir. With `sort` the aligned
/// bam comes out coordinate sorted, with `wiggle` a bedGraph signal
/// file is produced alongside.
pub fn run_star(
    job: &Job,
    r1: &FileId,
    r2: Option<&FileId>,
    star_index: &Url,
    wiggle: bool,
    sort: bool,
) -> Result<StarAlignment, Error> {
    let work_dir = job.temp_dir()?;
    let tarball = urls::download_url(job, star_index, &work_dir, Some("starIndex.tar.gz"))?;
    files::extract_tarball(&tarball, &work_dir)?;
    fs::remove_file(&tarball)?;

    let cores = job.resources.cores.to_string();
    let index_dir = unpacked_guest_dir(&work_dir, job.guest_root())?.display().to_string();

    // The bam sort allocation is capped to fit the recommended 60G
    // STAR host without the sort stage blowing past it
    let mut parameters: Vec<String> = [
        "--runThreadN",
        cores.as_str(),
        "--genomeDir",
        index_dir.as_str(),
        "--outFileNamePrefix",
        "rna",
        "--outSAMunmapped",
        "Within",
        "--quantMode",
        "TranscriptomeSAM",
        "--outSAMattributes",
        "NH",
        "HI",
        "AS",
        "NM",
        "MD",
        "--outFilterType",
        "BySJout",
        "--outFilterMultimapNmax",
        "20",
        "--outFilterMismatchNmax",
        "999",
        "--outFilterMismatchNoverReadLmax",
        "0.04",
        "--alignIntronMin",
        "20",
        "--alignIntronMax",
        "1000000",
        "--alignMatesGapMax",
        "1000000",
        "--alignSJoverhangMin",
        "8",
        "--alignSJDBoverhangMin",
        "1",
        "--sjdbScore",
        "1",
        "--limitBAMsortRAM",
        "49268954168",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    let aligned_name = if sort {
        parameters.extend(["--outSAMtype", "BAM", "SortedByCoordinate"].map(str::to_owned));
        "rnaAligned.sortedByCoord.out.bam"
    } else {
        parameters.extend(["--outSAMtype", "BAM", "Unsorted"].map(str::to_owned));
        "rnaAligned.out.bam"
    };
    if wiggle {
        parameters.extend(
            ["--outWigType", "bedGraph", "--outWigStrand", "Unstranded", "--outWigReferencesPrefix", "chr"]
                .map(str::to_owned),
        );
    }

    job.read_file(r1, &work_dir.join("R1.fastq"))?;
    parameters.extend(["--readFilesIn".to_owned(), "/data/R1.fastq".to_owned()]);
    if let Some(r2) = r2 {
        job.read_file(r2, &work_dir.join("R2.fastq"))?;
        parameters.push("/data/R2.fastq".to_owned());
    }

    let mut outputs = vec![
        aligned_name,
        "rnaAligned.toTranscriptome.out.bam",
        "rnaLog.final.out",
        "rnaSJ.out.tab",
    ];
    if wiggle {
        outputs.push("rnaSignal.UniqueMultiple.str1.out.bg");
    }

    DockerCall::new(job, STAR_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(outputs)
        .run()?;

    let aligned_path = work_dir.join(aligned_name);
    if sort && fs::metadata(&aligned_path)?.len() == 0 {
        return Err(Error::EmptySortedBam);
    }

    Ok(StarAlignment {
        transcriptome_bam: job.write_file(&work_dir.join("rnaAligned.toTranscriptome.out.bam"))?,
        aligned_bam: job.write_file(&aligned_path)?,
        wiggle: wiggle
            .then(|| job.write_file(&work_dir.join("rnaSignal.UniqueMultiple.str1.out.bg")))
            .transpose()?,
        log: job.write_file(&work_dir.join("rnaLog.final.out"))?,
        sj: job.write_file(&work_dir.join("rnaSJ.out.tab"))?,
    })
}

/// BWA index files alongside the fasta they were built from
#[derive(Debug, Clone)]
pub struct BwaReference {
    pub fasta: FileId,
    pub fai: FileId,
    pub index: BwaIndex,
    /// ALT contigs file for alt-aware alignment
    pub alt: Option<FileId>,
}

/// What bwakit aligns
#[derive(Debug, Clone)]
pub enum BwakitInput {
    /// Fastq reads, single or paired end
    Fastq { r1: FileId, r2: Option<FileId> },
    /// Realign an existing BAM, reusing its read group data
    RealignBam(FileId),
    /// Realign an existing SAM, reusing its read group data
    RealignSam(FileId),
}

/// Read group metadata bwakit stamps into the aligned BAM
#[derive(Debug, Clone)]
pub enum ReadGroup {
    /// A complete `@RG` header line with tabs escaped as `\t`, split
    /// multiple lines with an escaped `\n`
    Line(String),
    /// Attributes a single `@RG` line is synthesised from, with the
    /// sample naming the read group
    Attributes {
        library: String,
        platform: String,
        program_unit: String,
        sample: String,
    },
}

#[derive(Debug, Clone)]
pub struct BwakitConfig {
    pub input: BwakitInput,
    pub reference: BwaReference,
    pub read_group: Option<ReadGroup>,
    /// Sort the output bam
    pub sort: bool,
    /// Trim adapters while aligning
    pub trim: bool,
    /// Mark shorter split reads as secondary
    pub mark_secondary: bool,
}

#[derive(Debug, Clone)]
pub struct BwakitAlignment {
    pub bam: FileId,
    pub elapsed: Duration,
}

/// Align reads or realign an existing alignment with bwakit
pub fn run_bwakit(job: &Job, config: &BwakitConfig) -> Result<BwakitAlignment, Error> {
    let work_dir = job.temp_dir()?;

    let reference = &config.reference;
    let mut entries = vec![
        ("ref.fa", &reference.fasta),
        ("ref.fa.fai", &reference.fai),
        ("ref.fa.amb", &reference.index.amb),
        ("ref.fa.ann", &reference.index.ann),
        ("ref.fa.bwt", &reference.index.bwt),
        ("ref.fa.pac", &reference.index.pac),
        ("ref.fa.sa", &reference.index.sa),
    ];
    if let Some(alt) = &reference.alt {
        entries.push(("ref.fa.alt", alt));
    }

    let mut samples = vec![];
    match &config.input {
        BwakitInput::Fastq { r1, r2 } => {
            entries.push(("input.1.fq.gz", r1));
            samples.push("input.1.fq.gz");
            if let Some(r2) = r2 {
                entries.push(("input.2.fq.gz", r2));
                samples.push("input.2.fq.gz");
            }
        }
        BwakitInput::RealignBam(bam) => {
            entries.push(("input.bam", bam));
            samples.push("input.bam");
        }
        BwakitInput::RealignSam(sam) => {
            entries.push(("input.sam", sam));
            samples.push("input.sam");
        }
    }
    stage(job, &work_dir, &entries)?;

    let mut parameters = vec![];
    if let Some(rg) = rg_line(config.read_group.as_ref()) {
        parameters.extend(["-R".to_owned(), rg]);
    }
    parameters.extend(["-t".to_owned(), job.resources.cores.to_string()]);
    if config.sort {
        parameters.push("-s".to_owned());
    }
    if config.trim {
        parameters.push("-a".to_owned());
    }
    if config.mark_secondary {
        parameters.push("-M".to_owned());
    }
    parameters.extend(["-o", "/data/aligned", "/data/ref.fa"].map(str::to_owned));
    for sample in &samples {
        parameters.push(format!("/data/{sample}"));
    }

    let timer = job.begin("bwakit");
    DockerCall::new(job, BWAKIT_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(["aligned.aln.bam"])
        .run()?;
    let elapsed = job.finish(timer);

    if let Some(ReadGroup::Attributes { sample, .. }) = &config.read_group {
        log::info!("aligned sample {sample}");
    }
    let bam = job.write_file(&work_dir.join("aligned.aln.bam"))?;

    Ok(BwakitAlignment { bam, elapsed })
}

/// The `@RG` line handed to bwakit, which expands the escaped `\t`
/// itself. When realigning without one, bwakit reuses the read group
/// data already in the input.
fn rg_line(read_group: Option<&ReadGroup>) -> Option<String> {
    match read_group {
        Some(ReadGroup::Line(line)) => Some(line.clone()),
        Some(ReadGroup::Attributes {
            library,
            platform,
            program_unit,
            sample,
        }) => Some(format!(
            r"@RG\tID:{sample}\tLB:{library}\tPL:{platform}\tPU:{program_unit}\tSM:{sample}"
        )),
        None => None,
    }
}

/// Align reads with bowtie2, returning the sam and the wall time spent
/// aligning
pub fn run_bowtie2(
    job: &Job,
    read1: &FileId,
    read2: Option<&FileId>,
    index: &Bowtie2Index,
    reference: &FileId,
) -> Result<(FileId, Duration), Error> {
    let work_dir = job.temp_dir()?;

    let mut entries = vec![
        ("ref.fa", reference),
        ("read1.fq", read1),
        ("ref.1.bt2", &index.name[0]),
        ("ref.2.bt2", &index.name[1]),
        ("ref.3.bt2", &index.name[2]),
        ("ref.4.bt2", &index.name[3]),
        ("ref.rev.1.bt2", &index.rev[0]),
        ("ref.rev.2.bt2", &index.rev[1]),
    ];

    let cores = job.resources.cores.to_string();
    let mut parameters = vec![
        "-x".to_owned(),
        "/data/ref".to_owned(),
        "-1".to_owned(),
        "/data/read1.fq".to_owned(),
        "-S".to_owned(),
        "/data/sample.sam".to_owned(),
        "-t".to_owned(),
        cores,
    ];
    if let Some(read2) = read2 {
        entries.push(("read2.fq", read2));
        parameters.extend(["-2".to_owned(), "/data/read2.fq".to_owned()]);
    }
    stage(job, &work_dir, &entries)?;

    let timer = job.begin("bowtie2");
    DockerCall::new(job, BOWTIE2_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(["sample.sam"])
        .run()?;
    let elapsed = job.finish(timer);

    Ok((job.write_file(&work_dir.join("sample.sam"))?, elapsed))
}

#[derive(Debug, Clone)]
pub struct SnapAlignment {
    pub bam: FileId,
    /// Only produced when SNAP sorts, which also indexes
    pub bai: Option<FileId>,
    pub elapsed: Duration,
}

/// Align reads with SNAP, paired when `read2` is given
///
/// Sorting also produces a bam index. SNAP marks duplicates as part of
/// its sort, so `mark_duplicates` is only valid together with `sort`.
pub fn run_snap(
    job: &Job,
    read1: &FileId,
    read2: Option<&FileId>,
    index: &SnapIndex,
    sort: bool,
    mark_duplicates: bool,
) -> Result<SnapAlignment, Error> {
    if mark_duplicates && !sort {
        return Err(Error::DuplicatesWithoutSort);
    }

    let work_dir = job.temp_dir()?;
    fs::create_dir(work_dir.join("snap"))?;

    let mut entries = vec![
        ("read1.fq", read1),
        ("snap/Genome", &index.genome),
        ("snap/GenomeIndex", &index.genome_index),
        ("snap/GenomeIndexHash", &index.genome_hash),
        ("snap/OverflowTable", &index.overflow),
    ];

    let cores = job.resources.cores.to_string();
    let mut parameters = match read2 {
        Some(read2) => {
            entries.push(("read2.fq", read2));
            vec![
                "paired".to_owned(),
                "/data/snap".to_owned(),
                "/data/read1.fq".to_owned(),
                "/data/read2.fq".to_owned(),
            ]
        }
        None => vec!["single".to_owned(), "/data/snap".to_owned(), "/data/read1.fq".to_owned()],
    };
    parameters.extend(["-o".to_owned(), "-bam".to_owned(), "/data/sample.bam".to_owned(), "-t".to_owned(), cores]);
    if sort {
        parameters.push("-so".to_owned());
        if !mark_duplicates {
            // Sorting marks duplicates unless told not to
            parameters.extend(["-S".to_owned(), "d".to_owned()]);
        }
    }
    stage(job, &work_dir, &entries)?;

    let mut outputs = vec!["sample.bam"];
    if sort {
        outputs.push("sample.bam.bai");
    }

    let timer = job.begin(format!("snap (sort={sort}, dm={mark_duplicates})"));
    DockerCall::new(job, SNAP_IMAGE, &work_dir)
        .parameters(parameters)
        .outputs(outputs)
        .run()?;
    let elapsed = job.finish(timer);

    Ok(SnapAlignment {
        bam: job.write_file(&work_dir.join("sample.bam"))?,
        bai: sort
            .then(|| job.write_file(&work_dir.join("sample.bam.bai")))
            .transpose()?,
        elapsed,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;
    use crate::tools::indexing;

    fn mock_workflow(dir: &Path) -> Workflow {
        let env = Env::new(Some(dir.to_path_buf())).unwrap();
        Workflow::mocked("aligners", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    fn index_tarball(dir: &Path, members: &[&str]) -> Url {
        let paths = members
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, name).unwrap();
                path
            })
            .collect::<Vec<_>>();
        let tar = files::tarball_files(dir, "index.tar.gz", &paths, None).unwrap();
        Url::from_file_path(tar).unwrap()
    }

    #[test]
    fn star_produces_wiggle_only_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("star").unwrap();
        let r1 = stored(&workflow, dir.path(), "r1.fastq");
        let index = index_tarball(dir.path(), &["SA", "SAindex"]);

        let plain = run_star(&job, &r1, None, &index, false, true).unwrap();
        assert!(plain.wiggle.is_none());

        let wiggled = run_star(&job, &r1, None, &index, true, false).unwrap();
        assert!(wiggled.wiggle.is_some());
        assert!(workflow.store().contains(&wiggled.aligned_bam));
    }

    #[test]
    fn bwakit_aligns_paired_fastqs() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("bwakit").unwrap();
        let id = stored(&workflow, dir.path(), "blob");

        let config = BwakitConfig {
            input: BwakitInput::Fastq {
                r1: id.clone(),
                r2: Some(id.clone()),
            },
            reference: BwaReference {
                fasta: id.clone(),
                fai: id.clone(),
                index: indexing::BwaIndex {
                    amb: id.clone(),
                    ann: id.clone(),
                    bwt: id.clone(),
                    pac: id.clone(),
                    sa: id.clone(),
                },
                alt: None,
            },
            read_group: None,
            sort: true,
            trim: false,
            mark_secondary: false,
        };

        let alignment = run_bwakit(&job, &config).unwrap();
        assert!(workflow.store().contains(&alignment.bam));
    }

    #[test]
    fn snap_rejects_duplicate_marking_without_sort() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("snap").unwrap();
        let id = stored(&workflow, dir.path(), "blob");
        let index = indexing::SnapIndex {
            genome: id.clone(),
            genome_index: id.clone(),
            genome_hash: id.clone(),
            overflow: id.clone(),
        };

        let result = run_snap(&job, &id, None, &index, false, true);
        assert!(matches!(result, Err(Error::DuplicatesWithoutSort)));

        let sorted = run_snap(&job, &id, None, &index, true, true).unwrap();
        assert!(sorted.bai.is_some());
    }

    #[test]
    fn rg_line_is_synthesised_from_attributes() {
        let rg = rg_line(Some(&ReadGroup::Attributes {
            library: "lib1".to_owned(),
            platform: "ILLUMINA".to_owned(),
            program_unit: "pu1".to_owned(),
            sample: "s1".to_owned(),
        }));
        assert_eq!(
            rg.as_deref(),
            Some(r"@RG\tID:s1\tLB:lib1\tPL:ILLUMINA\tPU:pu1\tSM:s1")
        );
        assert_eq!(rg_line(None), None);

        let verbatim = rg_line(Some(&ReadGroup::Line(r"@RG\tID:foo".to_owned())));
        assert_eq!(verbatim.as_deref(), Some(r"@RG\tID:foo"));
    }
}
