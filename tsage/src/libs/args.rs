use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct OutputArgs {
    /// Output directory
    #[cfg_attr(feature = "clap", arg(short = 'o', long="outdir", default_value_os_t = PathBuf::from("./"), value_hint = clap::ValueHint::DirPath))]
    pub output: PathBuf,

    /// Output filename prefix
    #[cfg_attr(feature = "clap", arg(short = 'p', long))]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct SimulationArgs {
    /// Number of haploid samples
    #[cfg_attr(feature = "clap", arg(short = 'n', long, default_value_t = 10))]
    pub sample_size: usize,

    /// Effective population size
    #[cfg_attr(feature = "clap", arg(short = 'N', long = "ne", default_value_t = 10000.0))]
    pub ne: f64,

    /// Sequence length in base pairs
    #[cfg_attr(feature = "clap", arg(short = 'L', long, default_value_t = 100000.0))]
    pub length: f64,

    /// Mutation rate per base pair per generation
    #[cfg_attr(feature = "clap", arg(short = 'm', long, default_value_t = 1e-8))]
    pub mutation_rate: f64,

    /// Recombination rate per base pair per generation
    #[cfg_attr(feature = "clap", arg(short = 'r', long, default_value_t = 1e-8))]
    pub recombination_rate: f64,

    /// Random seed
    #[cfg_attr(feature = "clap", arg(short = 's', long, default_value_t = 1))]
    pub seed: u64,

    /// Sampling times in generations of additional ancient haploid samples
    #[cfg_attr(feature = "clap", arg(short = 'a', long, value_delimiter = ',', num_args = 1.., value_name = "TIME"))]
    pub ancient_samples: Vec<f64>,

    /// Population size changes backwards in time, comma-separated `time:size` pairs
    #[cfg_attr(feature = "clap", arg(long, value_delimiter = ',', num_args = 1.., value_parser = parse_size_change, value_name = "TIME:SIZE"))]
    pub size_changes: Vec<(f64, f64)>,
}

impl Default for SimulationArgs {
    fn default() -> Self {
        Self {
            sample_size: 10,
            ne: 10000.0,
            length: 100000.0,
            mutation_rate: 1e-8,
            recombination_rate: 1e-8,
            seed: 1,
            ancient_samples: vec![],
            size_changes: vec![],
        }
    }
}

pub fn parse_size_change(s: &str) -> Result<(f64, f64), String> {
    let (time, size) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TIME:SIZE, got '{s}'"))?;
    let parse = |x: &str| x.trim().parse::<f64>().map_err(|e| format!("'{x}': {e}"));
    Ok((parse(time)?, parse(size)?))
}

/// Locations of the external programs invoked during inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ToolPaths {
    /// Relate executable
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("tools/relate/bin/Relate")))]
    pub relate: PathBuf,

    /// RelateFileFormats executable
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("tools/relate/bin/RelateFileFormats")))]
    pub relate_file_formats: PathBuf,

    /// GEVA executable
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("tools/geva/geva_v1beta")))]
    pub geva: PathBuf,

    /// GEVA initial probabilities of the HMM
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("tools/geva/hmm/hmm_initial_probs.txt")))]
    pub geva_hmm_initial: PathBuf,

    /// GEVA emission probabilities of the HMM
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("tools/geva/hmm/hmm_emission_probs.txt")))]
    pub geva_hmm_emission: PathBuf,

    /// Wrapper script running tsinfer
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("src/run_tsinfer.py")))]
    pub tsinfer_script: PathBuf,

    /// Wrapper script running tsdate
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("src/run_tsdate.py")))]
    pub tsdate_script: PathBuf,

    /// Python interpreter used for the wrapper scripts
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("python3")))]
    pub python: PathBuf,

    /// GNU time binary used to measure CPU time and memory
    #[cfg_attr(feature = "clap", arg(long, default_value_os_t = PathBuf::from("/usr/bin/time")))]
    pub time_binary: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            relate: PathBuf::from("tools/relate/bin/Relate"),
            relate_file_formats: PathBuf::from("tools/relate/bin/RelateFileFormats"),
            geva: PathBuf::from("tools/geva/geva_v1beta"),
            geva_hmm_initial: PathBuf::from("tools/geva/hmm/hmm_initial_probs.txt"),
            geva_hmm_emission: PathBuf::from("tools/geva/hmm/hmm_emission_probs.txt"),
            tsinfer_script: PathBuf::from("src/run_tsinfer.py"),
            tsdate_script: PathBuf::from("src/run_tsdate.py"),
            python: PathBuf::from("python3"),
            time_binary: PathBuf::from("/usr/bin/time"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AgeAggregate {
    #[default]
    /// Arithmetic mean of the node and parent times
    Arithmetic,
    /// Geometric mean of the node and parent times
    Geometric,
}

impl std::fmt::Display for AgeAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::Arithmetic => write!(f, "arithmetic"),
            Self::Geometric => write!(f, "geometric"),
        }
    }
}

/// Sequencing error model applied to genotypes
#[derive(Debug, Clone, PartialEq)]
pub enum SeqErrorModel {
    None,
    /// Flip each allele independently with the given probability
    Simple(f64),
    /// Empirical diploid error matrix indexed by derived allele frequency
    Empirical(PathBuf),
}

impl SeqErrorModel {
    pub fn from_args(rate: f64, matrix: Option<PathBuf>) -> Self {
        match matrix {
            Some(path) => Self::Empirical(path),
            None if rate > 0.0 => Self::Simple(rate),
            None => Self::None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TsdateMethod {
    #[default]
    #[cfg_attr(feature = "clap", value(name = "inside_outside"))]
    InsideOutside,
    #[cfg_attr(feature = "clap", value(name = "maximization"))]
    Maximization,
}

impl std::fmt::Display for TsdateMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::InsideOutside => write!(f, "inside_outside"),
            Self::Maximization => write!(f, "maximization"),
        }
    }
}
