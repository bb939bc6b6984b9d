// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

//! Filtering, recalibrating and merging variant call sets with GATK3
//!
//! SNPs and INDELs are modelled differently throughout, so every
//! operation here is parameterised by [`VariantType`] and vqsr carries
//! its own resource sets per type.

use std::collections::BTreeMap;

use fs_err as fs;

use super::{gatk, stage, Error, Genome};
use crate::job::Job;
use crate::store::FileId;

/// The variant classes GATK models separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VariantType {
    Snp,
    Indel,
}

/// How CombineVariants merges co-located records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum MergeOption {
    /// Merge variants at a single site into one record
    #[default]
    Uniquify,
    /// Merge vcfs of the same sample without sorting
    Unsorted,
}

/// Training and truth sets vqsr models from, per variant type
#[derive(Debug, Clone)]
pub enum VqsrResources {
    Snp {
        hapmap: FileId,
        omni: FileId,
        phase: FileId,
        dbsnp: FileId,
    },
    Indel {
        mills: FileId,
        dbsnp: FileId,
    },
}

impl VqsrResources {
    pub fn variant_type(&self) -> VariantType {
        match self {
            Self::Snp { .. } => VariantType::Snp,
            Self::Indel { .. } => VariantType::Indel,
        }
    }
}

/// The recalibration model VariantRecalibrator builds and
/// ApplyRecalibration consumes
#[derive(Debug, Clone)]
pub struct VqsrModel {
    pub variant_type: VariantType,
    pub recal: FileId,
    pub tranches: FileId,
    pub plots: FileId,
}

/// Isolate one variant type from a vcf with SelectVariants
pub fn gatk_select_variants(
    job: &Job,
    variant_type: VariantType,
    vcf: &FileId,
    genome: &Genome,
) -> Result<FileId, Error> {
    log::info!("GATK SelectVariants: {variant_type}");

    let work_dir = job.temp_dir()?;
    let entries = [
        ("genome.fa", &genome.fasta),
        ("genome.fa.fai", &genome.fai),
        ("genome.dict", &genome.dict),
        ("input.vcf", vcf),
    ];
    stage(job, &work_dir, &entries)?;

    let mode = variant_type.to_string();
    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters([
            "-T",
            "SelectVariants",
            "-R",
            "genome.fa",
            "-V",
            "input.vcf",
            "-o",
            "output.vcf",
            "-selectType",
            mode.as_str(),
        ])
        .outputs(["output.vcf"])
        .run()?;

    Ok(job.write_file(&work_dir.join("output.vcf"))?)
}

/// Hard filter a vcf with VariantFiltration
///
/// Uses the GATK recommended hard filter expression for the variant
/// type and documents it in the FILTER header.
pub fn gatk_variant_filtration(
    job: &Job,
    variant_type: VariantType,
    vcf: &FileId,
    genome: &Genome,
) -> Result<FileId, Error> {
    log::info!("GATK VariantFiltration: {variant_type}");

    let work_dir = job.temp_dir()?;
    let entries = [
        ("genome.fa", &genome.fasta),
        ("genome.fa.fai", &genome.fai),
        ("genome.dict", &genome.dict),
        ("input.vcf", vcf),
    ];
    stage(job, &work_dir, &entries)?;

    let expression = filter_expression(variant_type);
    let filter_name = format!("GATK_Germline_Hard_Filter_{variant_type}");
    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters([
            "-T",
            "VariantFiltration",
            "-R",
            "genome.fa",
            "-V",
            "input.vcf",
            "--filterExpression",
            expression,
            "--filterName",
            filter_name.as_str(),
            "-o",
            "filtered_variants.vcf",
        ])
        .outputs(["filtered_variants.vcf"])
        .run()?;

    // GATK doubles the expression's quotes in the FILTER header line
    let output = work_dir.join("filtered_variants.vcf");
    let contents = fs::read_to_string(&output)?;
    fs::write(&output, strip_doubled_quotes(&contents, expression))?;

    Ok(job.write_file(&output)?)
}

/// Hard filters recommended by GATK for germline call sets, quoted the
/// way VariantFiltration expects the expression argument
fn filter_expression(variant_type: VariantType) -> &'static str {
    match variant_type {
        VariantType::Snp => {
            r#""QD < 2.0 || FS > 60.0 || MQ < 40.0 || MQRankSum < -12.5 || ReadPosRankSum < -8.0""#
        }
        VariantType::Indel => r#""QD < 2.0 || FS > 200.0 || ReadPosRankSum < -20.0""#,
    }
}

fn strip_doubled_quotes(contents: &str, expression: &str) -> String {
    contents.replace(&format!("\"{expression}\""), expression)
}

/// Model variant quality scores with VariantRecalibrator
///
/// vqsr models SNPs and INDELs separately, so the training resources
/// pick the mode. DP is left out of the annotations since it misleads
/// the model on exome data.
pub fn gatk_variant_recalibrator(
    job: &Job,
    vcf: &FileId,
    genome: &Genome,
    resources: &VqsrResources,
    unsafe_mode: bool,
) -> Result<VqsrModel, Error> {
    let variant_type = resources.variant_type();
    log::info!("GATK VariantRecalibrator: {variant_type}");

    let mut entries = vec![
        ("genome.fa", &genome.fasta),
        ("genome.fa.fai", &genome.fai),
        ("genome.dict", &genome.dict),
        ("input.vcf", vcf),
    ];

    let mut parameters: Vec<String> = [
        "-T",
        "VariantRecalibrator",
        "-R",
        "genome.fa",
        "-input",
        "input.vcf",
        "--maxGaussians",
        "4",
        "-an",
        "QD",
        "-an",
        "FS",
        "-an",
        "SOR",
        "-an",
        "ReadPosRankSum",
        "-an",
        "MQRankSum",
        "-tranche",
        "100.0",
        "-tranche",
        "99.9",
        "-tranche",
        "99.0",
        "-tranche",
        "90.0",
        "-recalFile",
        "output.recal",
        "-tranchesFile",
        "output.tranches",
        "-rscriptFile",
        "output.plots.R",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();

    let (resource_entries, resource_parameters) = resource_arguments(resources);
    entries.extend(resource_entries);
    parameters.extend(resource_parameters);
    if unsafe_mode {
        parameters.extend(["-U".to_owned(), "ALLOW_SEQ_DICT_INCOMPATIBILITY".to_owned()]);
    }

    let work_dir = job.temp_dir()?;
    stage(job, &work_dir, &entries)?;

    gatk(job, &work_dir)
        .inputs(entries.iter().map(|(name, _)| *name))
        .parameters(parameters)
        .outputs(["output.recal", "output.tranches", "output.plots.R"])
        .run()?;

    Ok(VqsrModel {
        variant_type,
        recal: job.write_file(&work_dir.join("output.recal"))?,
        tranches: job.write_file(&work_dir.join("output.tranches"))?,
        plots: job.write_file(&work_dir.join("output.plots.R"))?,
    })
}

/// Staging entries and parameters the training resources add to the
/// recalibrator's base command
fn resource_arguments(resources: &VqsrResources) -> (Vec<(&'static str, &FileId)>, Vec<String>) {
    match resources {
        VqsrResources::Snp {
            hapmap,
            omni,
            phase,
            dbsnp,
        } => (
            vec![
                ("hapmap.vcf", hapmap),
                ("omni.vcf", omni),
                ("dbsnp.vcf", dbsnp),
                ("1000G.vcf", phase),
            ],
            [
                "-resource:hapmap,known=false,training=true,truth=true,prior=15.0",
                "hapmap.vcf",
                "-resource:omni,known=false,training=true,truth=true,prior=12.0",
                "omni.vcf",
                "-resource:dbsnp,known=true,training=false,truth=false,prior=2.0",
                "dbsnp.vcf",
                "-resource:1000G,known=false,training=true,truth=false,prior=10.0",
                "1000G.vcf",
                "-an",
                "MQ",
                "-mode",
                "SNP",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        ),
        VqsrResources::Indel { mills, dbsnp } => (
            vec![("mills.vcf", mills), ("dbsnp.vcf", dbsnp)],
            [
                "-resource:mills,known=false,training=true,truth=true,prior=12.0",
                "mills.vcf",
                "-resource:dbsnp,known=true,training=false,truth=false,prior=2.0",
                "dbsnp.vcf",
                "-mode",
                "INDEL",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        ),
    }
}

/// Apply a vqsr model to a vcf with ApplyRecalibration
///
/// Filters at the second lowest tranche sensitivity, 99.0.
pub fn gatk_apply_variant_recalibration(
    job: &Job,
    vcf: &FileId,
    model: &VqsrModel,
    genome: &Genome,
    unsafe_mode: bool,
) -> Result<FileId, Error> {
    let mode = model.variant_type.to_string();
    log::info!("GATK ApplyRecalibration ({mode} mode)");

    let work_dir = job.temp_dir()?;
    let entries = [
        ("genome.fa", &genome.fasta),
        ("genome.fa.fai", &genome.fai),
        ("genome.dict", &genome.dict),
        ("input.vcf", vcf),
        ("recal", &model.recal),
        ("tranches", &model.tranches),
    ];
    stage(job, &work_dir, &entries)?;

    let mut parameters: Vec<String> = [
        "-T",
        "ApplyRecalibration",
        "-mode",
        mode.as_str(),
        "-R",
        "genome.fa",
        "-input",
        "input.vcf",
        "-o",
        "vqsr.vcf",
        "-ts_filter_level",
        "99.0",
        "-recalFile",
        "recal",
        "-tranchesFile",
        "tranches",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect();
    if unsafe_mode {
        parameters.extend(["-U".to_owned(), "ALLOW_SEQ_DICT_INCOMPATIBILITY".to_owned()]);
    }

    gatk(job, &work_dir)
        .inputs(entries.map(|(name, _)| name))
        .parameters(parameters)
        .outputs(["vqsr.vcf"])
        .run()?;

    Ok(job.write_file(&work_dir.join("vqsr.vcf"))?)
}

/// Merge vcfs with CombineVariants
///
/// `vcfs` maps a sample identifier to the vcf stored for it; the
/// identifier doubles as the staged file name.
pub fn gatk_combine_variants(
    job: &Job,
    vcfs: &BTreeMap<String, FileId>,
    genome: &Genome,
    merge_option: MergeOption,
) -> Result<FileId, Error> {
    log::info!("GATK CombineVariants");
    combine(job, vcfs, genome, "CombineVariants", "merged.vcf", Some(merge_option))
}

/// Merge gvcfs from the haplotype caller with CombineGVCFs
pub fn gatk_combine_gvcfs(
    job: &Job,
    gvcfs: &BTreeMap<String, FileId>,
    genome: &Genome,
) -> Result<FileId, Error> {
    log::info!("GATK CombineGVCFs");
    combine(job, gvcfs, genome, "CombineGVCFs", "merged.g.vcf", None)
}

fn combine(
    job: &Job,
    vcfs: &BTreeMap<String, FileId>,
    genome: &Genome,
    tool: &str,
    merged_name: &str,
    merge_option: Option<MergeOption>,
) -> Result<FileId, Error> {
    let work_dir = job.temp_dir()?;

    let mut entries = vec![
        ("genome.fa", &genome.fasta),
        ("genome.fa.fai", &genome.fai),
        ("genome.dict", &genome.dict),
    ];
    for (name, id) in vcfs {
        entries.push((name.as_str(), id));
    }
    stage(job, &work_dir, &entries)?;

    let mut parameters = vec![
        "-T".to_owned(),
        tool.to_owned(),
        "-R".to_owned(),
        "/data/genome.fa".to_owned(),
        "-o".to_owned(),
        format!("/data/{merged_name}"),
    ];
    if let Some(option) = merge_option {
        parameters.extend(["--genotypemergeoption".to_owned(), option.to_string()]);
    }
    for name in vcfs.keys() {
        parameters.extend(["--variant".to_owned(), format!("/data/{name}")]);
    }

    gatk(job, &work_dir)
        .inputs(entries.iter().map(|(name, _)| *name))
        .parameters(parameters)
        .outputs([merged_name])
        .run()?;

    Ok(job.write_file(&work_dir.join(merged_name))?)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;
    use crate::env::Env;
    use crate::job::Workflow;

    fn mock_workflow(dir: &Path) -> Workflow {
        let env = Env::new(Some(dir.to_path_buf())).unwrap();
        Workflow::mocked("manipulation", &env).unwrap()
    }

    fn stored(workflow: &Workflow, dir: &Path, name: &str) -> FileId {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        workflow.store().put(&path).unwrap()
    }

    fn mock_genome(workflow: &Workflow, dir: &Path) -> Genome {
        Genome {
            fasta: stored(workflow, dir, "genome.fa"),
            fai: stored(workflow, dir, "genome.fa.fai"),
            dict: stored(workflow, dir, "genome.dict"),
        }
    }

    #[test]
    fn filter_expressions_follow_gatk_guidance() {
        assert_eq!(
            filter_expression(VariantType::Snp),
            r#""QD < 2.0 || FS > 60.0 || MQ < 40.0 || MQRankSum < -12.5 || ReadPosRankSum < -8.0""#
        );
        assert_eq!(
            filter_expression(VariantType::Indel),
            r#""QD < 2.0 || FS > 200.0 || ReadPosRankSum < -20.0""#
        );
    }

    #[test]
    fn doubled_quotes_are_stripped() {
        let expression = filter_expression(VariantType::Indel);
        let doubled = format!("##FILTER=<Description=\"{expression}\">\n#CHROM\n");
        let fixed = strip_doubled_quotes(&doubled, expression);
        assert_eq!(fixed, format!("##FILTER=<Description={expression}>\n#CHROM\n"));
    }

    #[test]
    fn variant_types_render_uppercase() {
        assert_eq!(VariantType::Snp.to_string(), "SNP");
        assert_eq!(VariantType::Indel.to_string(), "INDEL");
        assert_eq!(MergeOption::Uniquify.to_string(), "UNIQUIFY");
        assert_eq!(MergeOption::Unsorted.to_string(), "UNSORTED");
        assert_eq!(MergeOption::default(), MergeOption::Uniquify);
    }

    #[test]
    fn snp_resources_add_mapping_quality_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let id = stored(&workflow, dir.path(), "resource.vcf");

        let snp = VqsrResources::Snp {
            hapmap: id.clone(),
            omni: id.clone(),
            phase: id.clone(),
            dbsnp: id.clone(),
        };
        let (entries, parameters) = resource_arguments(&snp);
        assert_eq!(entries.len(), 4);
        assert!(parameters.contains(&"MQ".to_owned()));
        assert!(parameters.contains(&"SNP".to_owned()));

        let indel = VqsrResources::Indel {
            mills: id.clone(),
            dbsnp: id,
        };
        let (entries, parameters) = resource_arguments(&indel);
        assert_eq!(entries.len(), 2);
        assert!(!parameters.contains(&"MQ".to_owned()));
        assert!(parameters.contains(&"INDEL".to_owned()));
    }

    #[test]
    fn vqsr_model_keeps_its_variant_type() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("vqsr").unwrap();
        let genome = mock_genome(&workflow, dir.path());
        let vcf = stored(&workflow, dir.path(), "input.vcf");
        let id = stored(&workflow, dir.path(), "resource.vcf");

        let resources = VqsrResources::Indel {
            mills: id.clone(),
            dbsnp: id,
        };
        let model = gatk_variant_recalibrator(&job, &vcf, &genome, &resources, false).unwrap();
        assert_eq!(model.variant_type, VariantType::Indel);

        let recalibrated = gatk_apply_variant_recalibration(&job, &vcf, &model, &genome, true).unwrap();
        assert!(workflow.store().contains(&recalibrated));
    }

    #[test]
    fn combine_variants_merges_samples_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("combine").unwrap();
        let genome = mock_genome(&workflow, dir.path());

        let mut vcfs = BTreeMap::new();
        vcfs.insert("sample-a.vcf".to_owned(), stored(&workflow, dir.path(), "a.vcf"));
        vcfs.insert("sample-b.vcf".to_owned(), stored(&workflow, dir.path(), "b.vcf"));

        let merged = gatk_combine_variants(&job, &vcfs, &genome, MergeOption::default()).unwrap();
        assert!(workflow.store().contains(&merged));

        let merged_gvcf = gatk_combine_gvcfs(&job, &vcfs, &genome).unwrap();
        assert!(workflow.store().contains(&merged_gvcf));
    }

    #[test]
    fn select_and_filter_round_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = mock_workflow(dir.path());
        let job = workflow.job("filter").unwrap();
        let genome = mock_genome(&workflow, dir.path());
        let vcf = stored(&workflow, dir.path(), "calls.vcf");

        let snps = gatk_select_variants(&job, VariantType::Snp, &vcf, &genome).unwrap();
        let filtered = gatk_variant_filtration(&job, VariantType::Snp, &snps, &genome).unwrap();
        assert!(workflow.store().contains(&filtered));
    }
}
