use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::OffsetTime;

use crate::args::{AgeAggregate, OutputArgs, SimulationArgs, ToolPaths};
use crate::subcommands::experiments::{self, ExperimentConfig};
use crate::subcommands::{add_errors, compare, convert, kc, simulate};

#[derive(Parser, Debug)]
#[command(author, version, about, styles=get_styles())]
pub struct Arguments {
    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Args, Debug, Clone)]
pub struct LogAndVerbosity {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, default_value_t = 3)]
    pub verbosity: u8,

    /// A file path to save logs to
    #[arg(short, long)]
    pub log_file: Option<PathBuf>,

    /// Silence all warning and info messages
    #[arg(long)]
    pub silent: bool,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    /// Simulate a genealogy with mutations under the coalescent with recombination
    Simulate {
        #[command(flatten)]
        args: SimulationArgs,

        #[command(flatten)]
        out: OutputArgs,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Build sample data with sequencing and ancestral state errors
    AddErrors {
        /// Input genealogy (.trees) or sample data (.samples)
        #[arg(short = 'f', long)]
        file: PathBuf,

        #[command(flatten)]
        out: OutputArgs,

        /// Fraction of sites with a flipped ancestral state
        #[arg(short = 'a', long, default_value_t = 0.0)]
        ancestral_state_error: f64,

        /// Per-allele sequencing error rate
        #[arg(short = 'e', long, default_value_t = 0.0)]
        sequencing_error: f64,

        /// Empirical genotyping error matrix, overrides the per-allele rate
        #[arg(short = 'x', long)]
        error_matrix: Option<PathBuf>,

        /// Random seed
        #[arg(short = 's', long, default_value_t = 1)]
        seed: u64,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Write a genealogy or sample data as a diploid VCF
    ToVcf {
        /// Input genealogy (.trees) or sample data (.samples)
        #[arg(short = 'f', long)]
        file: PathBuf,

        #[command(flatten)]
        out: OutputArgs,

        /// Round positions and bump collisions instead of dropping duplicate sites
        #[arg(long)]
        legacy: bool,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Write a flat genetic map in the format Relate reads
    GeneticMap {
        /// Sequence length in base pairs
        #[arg(short = 'L', long)]
        length: f64,

        /// Recombination rate per base pair per generation
        #[arg(short = 'r', long, default_value_t = 1e-8)]
        recombination_rate: f64,

        /// Output directory
        #[arg(short = 'o', long="outdir", default_value_os_t = PathBuf::from("./"))]
        output: PathBuf,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Estimate the age of every site from the times of its mutation's branch
    MutationAges {
        /// Input genealogy
        #[arg(short = 'f', long)]
        file: PathBuf,

        #[command(flatten)]
        out: OutputArgs,

        /// Skip mutations directly below a root
        #[arg(long)]
        exclude_root: bool,

        /// Mean of the branch end times
        #[arg(long, value_enum, default_value_t = AgeAggregate::Arithmetic)]
        aggregate: AgeAggregate,

        /// Write every mutation with its upper bound instead of one age per site
        #[arg(long)]
        with_bounds: bool,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Compare site ages of several genealogies, the first one being the truth
    CompareAges {
        /// Input genealogies
        #[arg(short = 'f', long, num_args = 1.., required = true)]
        files: Vec<PathBuf>,

        /// Column names of the genealogies
        #[arg(long, value_delimiter = ',')]
        names: Option<Vec<String>>,

        /// Relate .mut file with age estimates
        #[arg(long)]
        relate_mut: Option<PathBuf>,

        #[command(flatten)]
        out: OutputArgs,

        /// Skip mutations directly below a root
        #[arg(long)]
        exclude_root: bool,

        /// Mean of the branch end times
        #[arg(long, value_enum, default_value_t = AgeAggregate::Arithmetic)]
        aggregate: AgeAggregate,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Kendall-Colijn distances of several genealogies against the first one
    KcDistance {
        /// Input genealogies
        #[arg(short = 'f', long, num_args = 2.., required = true)]
        files: Vec<PathBuf>,

        /// Names of the genealogies
        #[arg(long, value_delimiter = ',')]
        names: Option<Vec<String>>,

        /// Weight of branch lengths against topology
        #[arg(long = "lambda", value_delimiter = ',', default_values_t = vec![0.0, 1.0])]
        lambdas: Vec<f64>,

        /// Restrict every genealogy to the span of its sites first
        #[arg(long)]
        trim_to_sites: bool,

        /// Also write mean pairwise TMRCAs at a random subset of sites
        #[arg(long)]
        tmrcas: bool,

        /// Random seed for the TMRCA subsets
        #[arg(short = 's', long, default_value_t = 1)]
        seed: u64,

        #[command(flatten)]
        out: OutputArgs,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },

    /// Run a registered experiment, or all of them
    Experiment {
        /// Experiment name or "all"
        #[arg(default_value = "all")]
        name: String,

        /// Run simulations
        #[arg(long)]
        setup: bool,

        /// Run inference
        #[arg(long)]
        inference: bool,

        /// Number of worker processes
        #[arg(short = 'p', long, default_value_t = 1)]
        processes: usize,

        /// Directory holding the simulated data and result tables
        #[arg(short = 'd', long, default_value_os_t = PathBuf::from("simulated-data"))]
        data_dir: PathBuf,

        /// Empirical genotyping error matrix
        #[arg(short = 'x', long)]
        error_matrix: Option<PathBuf>,

        #[command(flatten)]
        tools: ToolPaths,

        #[command(flatten)]
        log_and_verbosity: LogAndVerbosity,
    },
}

impl SubCommand {
    pub fn threads(&self) -> usize {
        match self {
            SubCommand::Experiment { processes, .. } => (*processes).max(1),
            _ => 1,
        }
    }

    #[rustfmt::skip]
    pub fn log_and_verbosity(&self) -> (u8, &Option<PathBuf>, bool) {
        match self {
            SubCommand::Simulate { log_and_verbosity, .. }
            | SubCommand::AddErrors { log_and_verbosity, .. }
            | SubCommand::ToVcf { log_and_verbosity, .. }
            | SubCommand::GeneticMap { log_and_verbosity, .. }
            | SubCommand::MutationAges { log_and_verbosity, .. }
            | SubCommand::CompareAges { log_and_verbosity, .. }
            | SubCommand::KcDistance { log_and_verbosity, .. }
            | SubCommand::Experiment { log_and_verbosity, .. }
            => (log_and_verbosity.verbosity, &log_and_verbosity.log_file, log_and_verbosity.silent),
        }
    }

    #[rustfmt::skip]
    pub fn output(&self) -> Option<PathBuf> {
        match self {
            SubCommand::Simulate { out: OutputArgs { output, .. }, .. }
            | SubCommand::AddErrors { out: OutputArgs { output, .. }, .. }
            | SubCommand::ToVcf { out: OutputArgs { output, .. }, .. }
            | SubCommand::MutationAges { out: OutputArgs { output, .. }, .. }
            | SubCommand::CompareAges { out: OutputArgs { output, .. }, .. }
            | SubCommand::KcDistance { out: OutputArgs { output, .. }, .. }
            | SubCommand::GeneticMap { output, .. }
            | SubCommand::Experiment { data_dir: output, .. }
            => Some(output.clone()),
        }
    }
}

pub fn run_args(args: Arguments) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(args.cmd.threads())
        .build_global()?;

    let (verbosity, log_file, is_silent) = args.cmd.log_and_verbosity();

    let (level, wrtr, _guard) = init_tracing(verbosity, log_file, is_silent)?;

    let timer = time::format_description::parse("[hour]:[minute]:[second].[subsecond digits:3]")?;
    let time_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = OffsetTime::new(time_offset, timer);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(wrtr)
        .with_timer(timer)
        .init();

    if let Some(output) = args.cmd.output() {
        if let Err(e) = std::fs::create_dir_all(&output) {
            match e.kind() {
                std::io::ErrorKind::AlreadyExists => (),
                _ => return Err(eyre!("Error creating directory {output:?}")),
            }
        }
    }

    run_cmd(args.cmd)?;

    Ok(())
}

#[rustfmt::skip]
pub fn run_cmd(cmd: SubCommand) -> Result<()> {
    match cmd {
        SubCommand::Simulate { args, out, .. } => simulate::run(args, out.output, out.prefix)?,

        SubCommand::AddErrors { file, out, ancestral_state_error, sequencing_error, error_matrix, seed, .. }
            => add_errors::run(file, out.output, out.prefix, ancestral_state_error, sequencing_error, error_matrix, seed)?,

        SubCommand::ToVcf { file, out, legacy, .. } => convert::run(file, out.output, out.prefix, legacy)?,
        SubCommand::GeneticMap { length, recombination_rate, output, .. } => convert::run_genetic_map(output, length, recombination_rate)?,

        SubCommand::MutationAges { file, out, exclude_root, aggregate, with_bounds, .. }
            => compare::run_mutation_ages(file, out.output, out.prefix, exclude_root, aggregate, with_bounds)?,

        SubCommand::CompareAges { files, names, relate_mut, out, exclude_root, aggregate, .. }
            => compare::run(files, names, relate_mut, out.output, out.prefix, exclude_root, aggregate)?,

        SubCommand::KcDistance { files, names, lambdas, trim_to_sites, tmrcas, seed, out, .. }
            => kc::run(files, names, lambdas, trim_to_sites, tmrcas, seed, out.output, out.prefix)?,

        SubCommand::Experiment { name, setup, inference, processes, data_dir, error_matrix, tools, .. } => {
            let config = ExperimentConfig { data_dir, processes, tools, error_matrix };
            experiments::run(name, setup, inference, config)?
        }
    };
    Ok(())
}

pub fn init_tracing(
    verbosity: u8,
    log_file: &Option<PathBuf>,
    is_silent: bool,
) -> Result<(Level, NonBlocking, WorkerGuard)> {
    let level = if is_silent {
        Level::ERROR
    } else {
        match verbosity {
            0 => unreachable!(),
            1 => Level::ERROR,
            2 => Level::WARN,
            3 => Level::INFO,
            4 => Level::DEBUG,
            5..=u8::MAX => Level::TRACE,
        }
    };

    // Write logs to stderr or file
    let (wrtr, _guard) = match log_file {
        Some(path) => {
            let file = std::fs::File::options()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    Ok((level, wrtr, _guard))
}

pub fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .header(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
        )
        .literal(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .invalid(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .error(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
        )
        .valid(
            anstyle::Style::new()
                .bold()
                .underline()
                .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
        )
        .placeholder(
            anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::White))),
        )
}
