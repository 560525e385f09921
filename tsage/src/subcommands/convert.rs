use std::collections::HashSet;
use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use ndarray::ArrayView2;

use crate::error::TsageError::OddSampleCountError;
use crate::io::{get_output, get_space_writer, get_vcf_writer, load_ts, push_to_output};
use crate::sample_data::SampleData;
use crate::structs::TreeSequence;
use crate::utils::round_position;

#[derive(Default, Debug, Clone, PartialEq)]
pub struct VcfRow {
    pub pos: i64,
    pub samples: Vec<String>,
}

impl VcfRow {
    /// Consecutive haplotypes are paired into phased diploid genotypes
    pub fn new(pos: i64, genotypes: &[u8]) -> Self {
        let samples = genotypes
            .chunks_exact(2)
            .map(|pair| format!("{}|{}", pair[0], pair[1]))
            .collect();
        Self { pos, samples }
    }
}

impl From<VcfRow> for Vec<String> {
    fn from(row: VcfRow) -> Vec<String> {
        let mut record = vec![
            String::from("1"),
            row.pos.to_string(),
            String::from("."),
            String::from("A"),
            String::from("T"),
            String::from("."),
            String::from("PASS"),
            String::from("."),
            String::from("GT"),
        ];
        record.extend(row.samples);
        record
    }
}

pub fn header<S: AsRef<str>>(sample_names: &[S], sequence_length: f64) -> Vec<String> {
    let samples_string = sample_names
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<&str>>()
        .join("\t");

    vec![
        "##fileformat=VCFv4.2".into(),
        format!("##source=tsage {}", env!("CARGO_PKG_VERSION")),
        "##FILTER=<ID=PASS, Description=\"All filters passed\">".into(),
        format!("##contig=<ID=1, length={}>", sequence_length as u64),
        "##FORMAT=<ID=GT, Number=1, Type=String, Description=\"Genotype\">".into(),
        format!("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\t{samples_string}"),
    ]
}

fn write_vcf(
    path: &Path,
    names: &[String],
    sequence_length: f64,
    rows: impl Iterator<Item = VcfRow>,
) -> Result<()> {
    let mut wrtr = get_vcf_writer(get_output(Some(path.to_path_buf()))?);
    for line in header(names, sequence_length) {
        wrtr.write_record(vec![line])?;
    }
    for row in rows {
        wrtr.write_record(Into::<Vec<String>>::into(row))?;
    }
    wrtr.flush()?;
    Ok(())
}

fn individual_names(prefix: &str, n_samples: usize) -> Result<Vec<String>> {
    if n_samples % 2 != 0 {
        return Err(eyre!(OddSampleCountError(n_samples)));
    }
    Ok((0..n_samples / 2).map(|i| format!("{prefix}_{i}")).collect())
}

/// Rows keyed by rounded position, a later site rounding onto a used position is dropped
pub fn sample_data_rows(positions: &[f64], genotypes: ArrayView2<u8>) -> Vec<VcfRow> {
    let mut seen = HashSet::new();
    positions
        .iter()
        .zip(genotypes.rows())
        .filter_map(|(&x, g)| {
            let pos = round_position(x);
            seen.insert(pos).then(|| VcfRow::new(pos, &g.to_vec()))
        })
        .collect()
}

/// Write sample data as a diploid VCF with individuals `msp_i`
pub fn sample_data_to_vcf(data: &SampleData, path: &Path) -> Result<()> {
    let names = individual_names("msp", data.num_samples())?;
    let rows = sample_data_rows(data.sites_position(), data.sites_genotypes().view());
    write_vcf(path, &names, data.sequence_length(), rows.into_iter())
}

/// Round positions and bump collisions so that they are strictly increasing from 1
pub fn legacy_positions(positions: &[f64]) -> Vec<i64> {
    let mut last = 0;
    positions
        .iter()
        .map(|&x| {
            let mut pos = round_position(x);
            if pos <= last {
                pos = last + 1;
            }
            last = pos;
            pos
        })
        .collect()
}

/// Write a genealogy as a diploid VCF with individuals `tsk_i` and legacy positions
pub fn ts_to_vcf(ts: &TreeSequence, path: &Path) -> Result<()> {
    let names = individual_names("tsk", ts.num_samples())?;
    let genotypes = ts.genotype_matrix();
    let rows = legacy_positions(&ts.site_positions())
        .into_iter()
        .zip(genotypes.rows())
        .map(|(pos, g)| VcfRow::new(pos, &g.to_vec()))
        .collect::<Vec<VcfRow>>();
    write_vcf(path, &names, ts.sequence_length(), rows.into_iter())
}

/// Flat recombination map over `[0, L]` in the format Relate reads
pub fn write_genetic_map(path: &Path, length: f64, rec_rate: f64) -> Result<()> {
    let mut wrtr = get_space_writer(get_output(Some(path.to_path_buf()))?);
    wrtr.write_record(["position", "COMBINED_rate.cM.Mb.", "Genetic_Map.cM."])?;
    wrtr.write_record([
        0.0.to_string(),
        (rec_rate * 1e6 * 100.0).to_string(),
        0.0.to_string(),
    ])?;
    wrtr.write_record([
        length.to_string(),
        0.0.to_string(),
        (length * rec_rate * 100.0).to_string(),
    ])?;
    wrtr.flush()?;
    Ok(())
}

pub fn run(file: PathBuf, output: PathBuf, prefix: Option<String>, legacy: bool) -> Result<()> {
    let mut path = output;
    push_to_output(&prefix, &mut path, "converted", "vcf");

    let is_sample_data = file.extension().is_some_and(|e| e == "samples");
    match (is_sample_data, legacy) {
        (true, _) => sample_data_to_vcf(&SampleData::load(&file)?, &path)?,
        (false, true) => ts_to_vcf(&load_ts(&file)?, &path)?,
        (false, false) => {
            let ts = load_ts(&file)?;
            sample_data_to_vcf(&SampleData::from_tree_sequence(&ts, false)?, &path)?
        }
    }

    tracing::info!("Wrote {path:?}");
    Ok(())
}

pub fn run_genetic_map(output: PathBuf, length: f64, rec_rate: f64) -> Result<()> {
    let mut path = output;
    path.push("genetic_map.txt");
    write_genetic_map(&path, length, rec_rate)?;
    tracing::info!("Wrote {path:?}");
    Ok(())
}
