//! # Probe Annotation Resolution
//!
//! Chooses the canonical probe manifest for a batch of samples and normalizes it.
//!
//! - Precedence: when a project mixes array generations, the highest-resolution
//!   manifest present wins (EPIC, then 450K, then 27K).
//! - Strict schema: manifests from different vintages name their columns
//!   differently. Each field of [`ProbeAnnotation`] is looked up through a list of
//!   known aliases. A quality-flag column that no alias matches is treated as
//!   `false` for every probe, which makes filtering less aggressive on older
//!   manifests.
//! - Manifests are read through the `polars` CSV reader with every column kept as
//!   text, so mixed-type columns never fail schema inference.

use crate::types::ArrayType;
use ahash::AHashMap;
use itertools::Itertools;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error(
        "No recognized methylation platform among {observed:?}; expected one of the Illumina 27K, 450K, or EPIC platform strings."
    )]
    NoRecognizedPlatform { observed: Vec<String> },
    #[error("Probe annotation manifest was not found at {0}")]
    ManifestNotFound(PathBuf),
    #[error("Probe annotation manifest {0} has no probe identifier column")]
    MissingProbeColumn(PathBuf),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The six quality flags of a probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeFlags {
    pub is_sex_chromosome: bool,
    pub has_cpg_snp: bool,
    pub has_sbe_snp: bool,
    pub has_probe_snp: bool,
    pub is_cross_reactive: bool,
    pub is_multi_mapped: bool,
}

impl ProbeFlags {
    pub fn any_set(&self) -> bool {
        self.is_sex_chromosome
            || self.has_cpg_snp
            || self.has_sbe_snp
            || self.has_probe_snp
            || self.is_cross_reactive
            || self.is_multi_mapped
    }
}

/// One normalized manifest record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeAnnotation {
    pub probe_id: String,
    pub chr: Option<String>,
    pub pos: Option<u64>,
    pub strand: Option<String>,
    pub probe_type: Option<String>,
    pub island: Option<String>,
    /// Distinct gene symbols in manifest order; empty for intergenic probes.
    pub genes: Vec<String>,
    pub flags: ProbeFlags,
}

impl ProbeAnnotation {
    /// True when the chromosome column places the probe on X or Y.
    pub fn on_sex_chromosome(&self) -> bool {
        self.chr.as_deref().is_some_and(|chr| {
            let chr = chr.trim();
            let bare = chr
                .strip_prefix("chr")
                .or_else(|| chr.strip_prefix("CHR"))
                .unwrap_or(chr);
            bare.eq_ignore_ascii_case("X") || bare.eq_ignore_ascii_case("Y")
        })
    }
}

/// A normalized manifest indexed by probe identifier.
#[derive(Debug, Clone, Default)]
pub struct AnnotationTable {
    records: Vec<ProbeAnnotation>,
    index: AHashMap<String, usize>,
}

impl AnnotationTable {
    /// Builds a table; for duplicated identifiers the first record wins.
    pub fn from_records(records: Vec<ProbeAnnotation>) -> Self {
        let mut kept = Vec::with_capacity(records.len());
        let mut index = AHashMap::with_capacity(records.len());
        let mut duplicates = 0usize;
        for record in records {
            if index.contains_key(&record.probe_id) {
                duplicates += 1;
                continue;
            }
            index.insert(record.probe_id.clone(), kept.len());
            kept.push(record);
        }
        if duplicates > 0 {
            log::warn!("Ignored {duplicates} duplicated probe identifiers in manifest");
        }
        Self {
            records: kept,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, probe_id: &str) -> Option<&ProbeAnnotation> {
        self.index.get(probe_id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[ProbeAnnotation] {
        &self.records
    }
}

/// Picks the dominant array generation among the observed platform strings.
pub fn resolve_array_type<I, S>(platforms: I) -> Result<ArrayType, AnnotationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut observed: Vec<String> = Vec::new();
    let mut present: Vec<ArrayType> = Vec::new();
    for platform in platforms {
        let platform = platform.as_ref();
        if let Some(array) = ArrayType::from_platform(platform) {
            present.push(array);
        } else if !observed.iter().any(|seen| seen == platform) {
            observed.push(platform.to_string());
        }
    }

    ArrayType::PRECEDENCE
        .into_iter()
        .find(|array| present.contains(array))
        .ok_or(AnnotationError::NoRecognizedPlatform { observed })
}

/// Resolves the dominant array generation and loads its manifest.
pub fn load_annotation<I, S>(
    annotation_dir: &Path,
    platforms: I,
) -> Result<(AnnotationTable, ArrayType), AnnotationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let array_type = resolve_array_type(platforms)?;
    let path = annotation_dir.join(array_type.manifest_file_name());
    log::info!("Using {array_type} manifest at {}", path.display());
    let table = read_manifest(&path)?;
    Ok((table, array_type))
}

// --- Column aliases across manifest vintages ---

const PROBE_ID_ALIASES: &[&str] = &["probe_id", "IlmnID", "Name", "Probe_ID", "probeID", "ID"];
const CHR_ALIASES: &[&str] = &["chr", "CHR", "chromosome", "Chromosome", "seqnames", "CpG_chrm"];
const POS_ALIASES: &[&str] = &["pos", "MAPINFO", "position", "Position", "start", "CpG_beg"];
const STRAND_ALIASES: &[&str] = &["strand", "Strand"];
const PROBE_TYPE_ALIASES: &[&str] = &["probe_type", "Infinium_Design_Type", "Type", "type"];
const ISLAND_ALIASES: &[&str] = &[
    "island",
    "Relation_to_Island",
    "Relation_to_UCSC_CpG_Island",
];
const GENE_ALIASES: &[&str] = &[
    "gene",
    "genes",
    "gene_symbol",
    "UCSC_RefGene_Name",
    "GencodeBasicV12_NAME",
];
const SEX_CHR_ALIASES: &[&str] = &["is_sex_chr", "is_sex_chromosome", "sex_chr"];
const CPG_SNP_ALIASES: &[&str] = &["has_cpg_snp", "is_snp_cpg", "snp_cpg", "is_snp"];
const SBE_SNP_ALIASES: &[&str] = &["has_sbe_snp", "is_snp_sbe", "snp_sbe"];
const PROBE_SNP_ALIASES: &[&str] = &["has_probe_snp", "is_snp_probe", "snp_probe"];
const CROSS_REACTIVE_ALIASES: &[&str] = &["is_cross_reactive", "cross_reactive", "crossReactive"];
const MULTI_MAPPED_ALIASES: &[&str] = &["is_multi_mapped", "multi_mapped", "multimapped"];

/// Reads one manifest file into the normalized schema.
pub fn read_manifest(path: &Path) -> Result<AnnotationTable, AnnotationError> {
    if !path.is_file() {
        return Err(AnnotationError::ManifestNotFound(path.to_path_buf()));
    }

    // A zero-length inference window reads every column as a string.
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0)),
        )
        .finish()?;

    // Unlabelled manifests carry the identifier in their first column.
    let probe_column = find_column(&df, PROBE_ID_ALIASES)
        .or_else(|| df.get_column_names_str().first().map(|name| name.to_string()))
        .ok_or_else(|| AnnotationError::MissingProbeColumn(path.to_path_buf()))?;
    let probe_ids = text_column(&df, Some(&probe_column))?;

    let chr = text_column(&df, find_column(&df, CHR_ALIASES).as_deref())?;
    let pos = text_column(&df, find_column(&df, POS_ALIASES).as_deref())?;
    let strand = text_column(&df, find_column(&df, STRAND_ALIASES).as_deref())?;
    let probe_type = text_column(&df, find_column(&df, PROBE_TYPE_ALIASES).as_deref())?;
    let island = text_column(&df, find_column(&df, ISLAND_ALIASES).as_deref())?;
    let genes = text_column(&df, find_column(&df, GENE_ALIASES).as_deref())?;

    let sex_chr = flag_column(&df, SEX_CHR_ALIASES)?;
    let cpg_snp = flag_column(&df, CPG_SNP_ALIASES)?;
    let sbe_snp = flag_column(&df, SBE_SNP_ALIASES)?;
    let probe_snp = flag_column(&df, PROBE_SNP_ALIASES)?;
    let cross_reactive = flag_column(&df, CROSS_REACTIVE_ALIASES)?;
    let multi_mapped = flag_column(&df, MULTI_MAPPED_ALIASES)?;

    let mut records = Vec::with_capacity(df.height());
    for (row, probe_id) in probe_ids.into_iter().enumerate() {
        let Some(probe_id) = probe_id else {
            continue;
        };
        records.push(ProbeAnnotation {
            probe_id,
            chr: chr[row].clone(),
            pos: pos[row].as_deref().and_then(parse_position),
            strand: strand[row].clone(),
            probe_type: probe_type[row].clone(),
            island: island[row].clone(),
            genes: genes[row].as_deref().map(split_gene_symbols).unwrap_or_default(),
            flags: ProbeFlags {
                is_sex_chromosome: sex_chr[row],
                has_cpg_snp: cpg_snp[row],
                has_sbe_snp: sbe_snp[row],
                has_probe_snp: probe_snp[row],
                is_cross_reactive: cross_reactive[row],
                is_multi_mapped: multi_mapped[row],
            },
        });
    }

    let table = AnnotationTable::from_records(records);
    log::debug!("Read {} probe records from {}", table.len(), path.display());
    Ok(table)
}

fn find_column(df: &DataFrame, aliases: &[&str]) -> Option<String> {
    let names = df.get_column_names_str();
    aliases
        .iter()
        .find(|alias| names.contains(*alias))
        .map(|alias| alias.to_string())
}

/// Extracts a text column as trimmed, non-empty optional strings. A missing
/// column yields `None` for every row.
fn text_column(df: &DataFrame, name: Option<&str>) -> Result<Vec<Option<String>>, AnnotationError> {
    let Some(name) = name else {
        return Ok(vec![None; df.height()]);
    };
    let column = df.column(name)?.cast(&DataType::String)?;
    let values = column
        .str()?
        .into_iter()
        .map(|value| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty() && !is_missing_token(v))
                .map(str::to_string)
        })
        .collect();
    Ok(values)
}

fn flag_column(df: &DataFrame, aliases: &[&str]) -> Result<Vec<bool>, AnnotationError> {
    let values = text_column(df, find_column(df, aliases).as_deref())?;
    Ok(values
        .iter()
        .map(|value| value.as_deref().is_some_and(parse_flag))
        .collect())
}

fn is_missing_token(value: &str) -> bool {
    matches!(value, "NA" | "NaN" | "nan" | "null" | "NULL")
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "t" | "1" | "1.0" | "yes" | "y"
    )
}

fn parse_position(value: &str) -> Option<u64> {
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64))
}

/// Splits a semicolon-delimited gene field into distinct symbols, keeping order.
pub fn split_gene_symbols(field: &str) -> Vec<String> {
    field
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unique()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_manifest(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn precedence_prefers_highest_resolution() {
        let epic = ArrayType::Epic.platform_label();
        let k450 = ArrayType::Hm450.platform_label();
        let k27 = ArrayType::Hm27.platform_label();

        let cases: [(&[&str], ArrayType); 7] = [
            (&[k27], ArrayType::Hm27),
            (&[k450], ArrayType::Hm450),
            (&[epic], ArrayType::Epic),
            (&[k27, k450], ArrayType::Hm450),
            (&[k27, epic], ArrayType::Epic),
            (&[k450, epic], ArrayType::Epic),
            (&[k27, k450, epic], ArrayType::Epic),
        ];
        for (platforms, expected) in cases {
            assert_eq!(resolve_array_type(platforms.iter()).unwrap(), expected);
        }
    }

    #[test]
    fn unrecognized_platforms_fail() {
        let err = resolve_array_type(["Affymetrix SNP 6.0", ""]).unwrap_err();
        match err {
            AnnotationError::NoRecognizedPlatform { observed } => {
                assert_eq!(observed, vec!["Affymetrix SNP 6.0".to_string(), String::new()]);
            }
            other => panic!("Expected NoRecognizedPlatform, got {other:?}"),
        }
        assert!(resolve_array_type(Vec::<String>::new()).is_err());
    }

    #[test]
    fn absent_flag_columns_default_to_false() {
        let file = write_manifest(
            "IlmnID,CHR,MAPINFO,Strand,Infinium_Design_Type,Relation_to_Island,UCSC_RefGene_Name\n\
             cg001,1,100,F,II,Island,TP53;TP53;WRAP53\n\
             cg002,X,200,R,I,OpenSea,\n",
        );
        let table = read_manifest(file.path()).unwrap();
        assert_eq!(table.len(), 2);

        let first = table.get("cg001").unwrap();
        assert_eq!(first.flags, ProbeFlags::default());
        assert!(!first.flags.any_set());
        assert_eq!(first.pos, Some(100));
        assert_eq!(first.genes, vec!["TP53".to_string(), "WRAP53".to_string()]);

        let second = table.get("cg002").unwrap();
        assert!(!second.flags.is_sex_chromosome);
        assert!(second.on_sex_chromosome());
        assert!(second.genes.is_empty());
    }

    #[test]
    fn present_flag_columns_are_parsed() {
        let file = write_manifest(
            "probe_id,chr,gene,is_snp_cpg,is_snp_sbe,is_snp_probe,is_cross_reactive,is_multi_mapped,is_sex_chr\n\
             cg001,1,A,TRUE,false,0,no,,False\n\
             cg002,2,B,False,1,False,False,False,False\n\
             cg003,3,C,NA,False,yes,False,True,FALSE\n",
        );
        let table = read_manifest(file.path()).unwrap();

        let flags = |id: &str| table.get(id).unwrap().flags;
        assert!(flags("cg001").has_cpg_snp);
        assert!(!flags("cg001").has_probe_snp);
        assert!(flags("cg002").has_sbe_snp);
        assert!(!flags("cg002").has_cpg_snp);
        assert!(flags("cg003").has_probe_snp);
        assert!(flags("cg003").is_multi_mapped);
        assert!(!flags("cg003").has_cpg_snp);
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_annotation(dir.path(), [ArrayType::Hm450.platform_label()]).unwrap_err();
        assert!(matches!(err, AnnotationError::ManifestNotFound(_)));
    }

    #[test]
    fn gene_symbols_are_split_and_deduplicated() {
        assert_eq!(split_gene_symbols(" A; B;;A "), vec!["A".to_string(), "B".to_string()]);
        assert!(split_gene_symbols("").is_empty());
    }
}
