use std::path::PathBuf;

use color_eyre::{
    eyre::{ensure, eyre, OptionExt},
    Result,
};
use ndarray::{aview1, ArrayView2, Axis};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::args::SeqErrorModel;
use crate::error::TsageError::{NoSitesError, NonzeroErrorRateError, OddSampleCountError};
use crate::io::{load_ts, push_to_output, read_error_matrix, ErrorMatrixRow};
use crate::sample_data::SampleData;
use crate::structs::TreeSequence;
use crate::utils::{check_rate, round_count};

const BASE_GENOTYPES: [[u8; 2]; 4] = [[0, 0], [1, 0], [0, 1], [1, 1]];

pub fn make_no_errors(g: &[u8], rate: f64) -> Result<Vec<u8>> {
    if rate != 0.0 {
        return Err(eyre!(NonzeroErrorRateError(rate)));
    }
    Ok(g.to_vec())
}

/// Flip every allele independently with probability `rate`
pub fn make_seq_errors_simple<R: Rng>(g: &[u8], rate: f64, rng: &mut R) -> Result<Vec<u8>> {
    check_rate(rate)?;
    Ok(g.iter()
        .map(|&a| match rng.gen_bool(rate) {
            true => 1 - a.min(1),
            false => a,
        })
        .collect())
}

/// Row whose frequency is nearest to `frequency`, the first one on ties
pub fn closest_row(matrix: &[ErrorMatrixRow], frequency: f64) -> Option<&ErrorMatrixRow> {
    matrix.iter().fold(None, |best: Option<&ErrorMatrixRow>, row| match best {
        Some(b) if (b.freq - frequency).abs() <= (row.freq - frequency).abs() => Some(b),
        _ => Some(row),
    })
}

/// Resample diploid genotypes with the empirical error matrix row nearest to the
/// derived allele frequency of the site
pub fn make_seq_errors_genotype_model<R: Rng>(
    g: &[u8],
    matrix: &[ErrorMatrixRow],
    rng: &mut R,
) -> Result<Vec<u8>> {
    if g.len() % 2 != 0 {
        return Err(eyre!(OddSampleCountError(g.len())));
    }
    ensure!(!g.is_empty(), "Cannot resample an empty genotype vector");

    let frequency = g.iter().map(|&a| a as f64).sum::<f64>() / g.len() as f64;
    let row = closest_row(matrix, frequency).ok_or_eyre("Error matrix has no rows")?;

    let hom_ref = WeightedIndex::new([row.p00, row.p01 / 2.0, row.p01 / 2.0, row.p02])?;
    let het = WeightedIndex::new([row.p10, row.p11, row.p12])?;
    let hom_alt = WeightedIndex::new([row.p20, row.p21 / 2.0, row.p21 / 2.0, row.p22])?;

    let mut out = Vec::with_capacity(g.len());
    for pair in g.chunks_exact(2) {
        let count = pair[0] + 2 * pair[1];
        let resampled = match count {
            0 => BASE_GENOTYPES[hom_ref.sample(rng)],
            1 => [[0, 0], [1, 0], [1, 1]][het.sample(rng)],
            2 => [[0, 0], [0, 1], [1, 1]][het.sample(rng)],
            3 => BASE_GENOTYPES[hom_alt.sample(rng)],
            _ => return Err(eyre!("Empirical error model needs biallelic genotypes")),
        };
        out.extend_from_slice(&resampled);
    }
    Ok(out)
}

/// Exactly `round(rate * n_sites)` sites flagged for an ancestral state error, in random order
pub fn ancestral_state_errors<R: Rng>(n_sites: usize, rate: f64, rng: &mut R) -> Result<Vec<bool>> {
    check_rate(rate)?;
    let n_bad = round_count(rate * n_sites as f64).min(n_sites);
    let mut flags = vec![false; n_sites];
    flags[..n_bad].iter_mut().for_each(|f| *f = true);
    flags.shuffle(rng);
    Ok(flags)
}

enum Sequencer {
    None,
    Simple(f64),
    Empirical(Vec<ErrorMatrixRow>),
}

impl Sequencer {
    fn from_model(model: &SeqErrorModel) -> Result<Self> {
        Ok(match model {
            SeqErrorModel::None => Self::None,
            SeqErrorModel::Simple(rate) => {
                tracing::info!("Adding genotyping error: {rate}");
                Self::Simple(*rate)
            }
            SeqErrorModel::Empirical(path) => {
                tracing::info!("Adding empirical genotyping error: {path:?}");
                Self::Empirical(read_error_matrix(path)?)
            }
        })
    }

    fn apply<R: Rng>(&self, g: &[u8], rng: &mut R) -> Result<Vec<u8>> {
        match self {
            Self::None => make_no_errors(g, 0.0),
            Self::Simple(rate) => make_seq_errors_simple(g, *rate, rng),
            Self::Empirical(matrix) => make_seq_errors_genotype_model(g, matrix, rng),
        }
    }
}

fn build_with_errors<R: Rng>(
    template: SampleData,
    positions: &[f64],
    alleles: &[Vec<String>],
    genotypes: ArrayView2<u8>,
    aa_error: f64,
    seq_error: &SeqErrorModel,
    rng: &mut R,
) -> Result<SampleData> {
    if positions.is_empty() {
        return Err(eyre!(NoSitesError));
    }
    let sequencer = Sequencer::from_model(seq_error)?;
    let aa_flags = ancestral_state_errors(positions.len(), aa_error, rng)?;
    if aa_error > 0.0 {
        tracing::info!(
            "Adding ancestral allele polarity error: {}% ({}/{} sites)",
            aa_error * 100.0,
            aa_flags.iter().filter(|f| **f).count(),
            positions.len()
        );
    }

    let mut data = template;
    let mut bits_flipped = 0;
    for (((&position, alleles), row), &flip) in positions
        .iter()
        .zip(alleles)
        .zip(genotypes.axis_iter(Axis(0)))
        .zip(&aa_flags)
    {
        let original = row.to_vec();
        let mut g = sequencer.apply(&original, rng)?;
        bits_flipped += g.iter().zip(&original).filter(|(a, b)| a != b).count();
        if flip {
            ensure!(
                g.iter().all(|&a| a <= 1),
                "Ancestral state error needs biallelic genotypes at {position}"
            );
            g.iter_mut().for_each(|a| *a = 1 - *a);
        }
        data.add_site(position, aview1(&g), alleles.clone(), None)?;
    }

    if !matches!(sequencer, Sequencer::None) {
        tracing::info!(
            "Actual error rate = {} over {} sites before {} ancestors flipped",
            bits_flipped as f64 / (positions.len() * data.num_samples()) as f64,
            positions.len(),
            aa_flags.iter().filter(|f| **f).count()
        );
    }

    data.finalise()?;
    Ok(data)
}

/// Sealed sample data with genotyping and ancestral state errors drawn from a genealogy
pub fn generate_samples<R: Rng>(
    ts: &TreeSequence,
    path: Option<PathBuf>,
    aa_error: f64,
    seq_error: &SeqErrorModel,
    rng: &mut R,
) -> Result<SampleData> {
    let truth = SampleData::from_tree_sequence(ts, false)?;
    let mut template = SampleData::new(truth.sequence_length(), truth.individuals_time().to_vec());
    if let Some(path) = path {
        template = template.with_path(path);
    }
    build_with_errors(
        template,
        truth.sites_position(),
        truth.sites_alleles(),
        truth.sites_genotypes().view(),
        aa_error,
        seq_error,
        rng,
    )
}

/// Copy of existing sample data with errors added
pub fn add_errors<R: Rng>(
    data: &SampleData,
    path: Option<PathBuf>,
    aa_error: f64,
    seq_error: &SeqErrorModel,
    rng: &mut R,
) -> Result<SampleData> {
    let mut template = SampleData::new(data.sequence_length(), data.individuals_time().to_vec());
    if let Some(path) = path {
        template = template.with_path(path);
    }
    build_with_errors(
        template,
        data.sites_position(),
        data.sites_alleles(),
        data.sites_genotypes().view(),
        aa_error,
        seq_error,
        rng,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    file: PathBuf,
    output: PathBuf,
    prefix: Option<String>,
    aa_error: f64,
    seq_error: f64,
    error_matrix: Option<PathBuf>,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let model = SeqErrorModel::from_args(seq_error, error_matrix);

    let mut path = output;
    push_to_output(&prefix, &mut path, "error", "samples");

    let is_sample_data = file.extension().is_some_and(|e| e == "samples");
    let data = match is_sample_data {
        true => add_errors(&SampleData::load(&file)?, Some(path.clone()), aa_error, &model, &mut rng)?,
        false => generate_samples(&load_ts(&file)?, Some(path.clone()), aa_error, &model, &mut rng)?,
    };

    tracing::info!("Wrote {} sites to {path:?}", data.num_sites());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::fixtures::two_tree_ts;

    fn identity_row(freq: f64) -> ErrorMatrixRow {
        ErrorMatrixRow {
            freq, p00: 1.0, p01: 0.0, p02: 0.0, p10: 0.0, p11: 1.0, p12: 0.0, p20: 0.0, p21: 0.0, p22: 1.0,
        }
    }

    #[test]
    fn test_make_no_errors() {
        assert_eq!(make_no_errors(&[0, 1, 1], 0.0).unwrap(), vec![0, 1, 1]);
        assert!(make_no_errors(&[0, 1, 1], 0.1).is_err());
    }

    #[test]
    fn test_simple_errors() {
        let mut rng = StdRng::seed_from_u64(1);
        let g = vec![0, 1, 0, 1, 1, 0];
        assert_eq!(make_seq_errors_simple(&g, 0.0, &mut rng).unwrap(), g);
        assert_eq!(make_seq_errors_simple(&g, 1.0, &mut rng).unwrap(), vec![1, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_closest_row_ties() {
        let matrix = [identity_row(0.25), identity_row(0.75), identity_row(1.0)];
        assert_eq!(closest_row(&matrix, 0.5).unwrap().freq, 0.25);
        assert_eq!(closest_row(&matrix, 0.9).unwrap().freq, 1.0);
    }

    #[test]
    fn test_genotype_model_odd_samples() {
        let mut rng = StdRng::seed_from_u64(1);
        let matrix = [identity_row(0.5)];
        assert!(make_seq_errors_genotype_model(&[0, 1, 1], &matrix, &mut rng).is_err());
    }

    #[test]
    fn test_genotype_model_always_het() {
        let mut rng = StdRng::seed_from_u64(1);
        let row = ErrorMatrixRow {
            freq: 0.5, p00: 0.0, p01: 1.0, p02: 0.0, p10: 0.0, p11: 1.0, p12: 0.0, p20: 0.0, p21: 1.0, p22: 0.0,
        };
        let out = make_seq_errors_genotype_model(&[0, 0, 1, 1, 1, 0], &[row], &mut rng).unwrap();
        for pair in out.chunks(2) {
            assert_eq!(pair[0] + pair[1], 1);
        }
        assert_eq!(&out[4..], &[1, 0]);
    }

    #[test]
    fn test_ancestral_state_errors() {
        let mut rng = StdRng::seed_from_u64(5);
        let flags = ancestral_state_errors(50, 0.05, &mut rng).unwrap();
        assert_eq!(flags.iter().filter(|f| **f).count(), 2);
        assert!(ancestral_state_errors(50, 1.5, &mut rng).is_err());
    }

    #[test]
    fn test_generate_samples() {
        let ts = two_tree_ts();
        let mut rng = StdRng::seed_from_u64(9);
        let data = generate_samples(&ts, None, 1.0, &SeqErrorModel::None, &mut rng).unwrap();
        assert!(data.is_finalised());
        assert_eq!(data.sites_genotypes().row(0).to_vec(), vec![0, 0, 1, 1]);
        assert_eq!(data.sites_genotypes().row(2).to_vec(), vec![1, 1, 1, 0]);
    }
}
