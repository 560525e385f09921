use std::path::{Path, PathBuf};

use color_eyre::{
    eyre::{ensure, eyre, OptionExt},
    Result,
};
use indexmap::IndexMap;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::args::{AgeAggregate, SeqErrorModel, ToolPaths, TsdateMethod};
use crate::error::TsageError::{MissingSetupError, UnknownExperimentError};
use crate::io::{
    append_ext, dump_ts, get_csv_writer, get_output, load_ts, read_csv_rows, write_csv_rows,
};
use crate::sample_data::SampleData;
use crate::structs::TreeSequence;
use crate::subcommands::add_errors::add_errors;
use crate::subcommands::compare::{compare_mutations, ComparisonTable};
use crate::subcommands::convert::{sample_data_to_vcf, ts_to_vcf, write_genetic_map};
use crate::subcommands::kc::{get_kc_distances, KcRow};
use crate::subcommands::simulate::{simulate, Demography, SimulationConfig};
use crate::subcommands::tools::{
    run_geva, run_relate, run_tsdate, run_tsinfer, RelateRun, ResourceUsage,
};
use crate::utils::linspace;

pub const DEFAULT_SEED: u64 = 123;
pub const DEFAULT_REPLICATES: usize = 10;
const ANCESTRAL_STATE_ERROR: f64 = 0.01;
/// Years per generation
pub const GENERATION_TIME: f64 = 25.0;
/// Oldest ancient sample in years
const MAX_ANCIENT_AGE: f64 = 10000.0;

/// One replicate of an experiment, a row of the run table `<data_dir>/<name>.csv`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    pub filename: String,
    pub replicate: usize,
    pub sample_size: usize,
    #[serde(default)]
    pub sample_size_ancient: usize,
    #[serde(rename = "Ne")]
    pub ne: f64,
    pub length: f64,
    pub rec_rate: f64,
    pub mut_rate: f64,
    pub n_edges: usize,
    pub n_trees: usize,
    pub n_sites: usize,
    pub seed: u64,
    pub tsdate_cpu: Option<f64>,
    pub tsdate_memory: Option<f64>,
    pub tsinfer_cpu: Option<f64>,
    pub tsinfer_memory: Option<f64>,
    pub tsdate_infer_cpu: Option<f64>,
    pub tsdate_infer_memory: Option<f64>,
    pub relate_cpu: Option<f64>,
    pub relate_memory: Option<f64>,
    pub geva_cpu: Option<f64>,
    pub geva_memory: Option<f64>,
}

fn usage(u: ResourceUsage) -> (Option<f64>, Option<f64>) {
    (Some(u.cpu_time), Some(u.max_memory))
}

impl RunRow {
    fn neutral(sample_size: usize, length: f64) -> Self {
        Self {
            sample_size,
            ne: 10000.0,
            length,
            rec_rate: 1e-8,
            mut_rate: 1e-8,
            ..Default::default()
        }
    }

    /// Sampling times in generations of the ancient samples, oldest last
    pub fn ancient_sample_times(&self) -> Vec<f64> {
        // Offset past the range of replicate seeds
        let mut rng = StdRng::seed_from_u64(self.seed + (1 << 32));
        let mut times = (0..self.sample_size_ancient)
            .map(|_| rng.gen_range(GENERATION_TIME..MAX_ANCIENT_AGE) / GENERATION_TIME)
            .collect::<Vec<f64>>();
        times.sort_by(f64::total_cmp);
        times
    }

    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            sample_size: self.sample_size,
            sequence_length: self.length,
            recombination_rate: self.rec_rate,
            mutation_rate: self.mut_rate,
            demography: Demography::constant(self.ne),
            ancient_samples: self.ancient_sample_times(),
        }
    }
}

/// Value swept over during setup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Single,
    SampleSize(usize),
    Length(u64),
}

impl Param {
    pub fn label(&self) -> String {
        match self {
            Self::Single => "None".to_string(),
            Self::SampleSize(n) => n.to_string(),
            Self::Length(l) => l.to_string(),
        }
    }

    pub fn apply(&self, row: &mut RunRow) {
        match *self {
            Self::Single => (),
            Self::SampleSize(n) => row.sample_size = n,
            Self::Length(l) => row.length = l as f64,
        }
    }
}

/// Files written next to every simulated replicate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetupOptions {
    pub make_vcf: bool,
    pub empirical_error: bool,
    pub ancestral_state_error: bool,
    /// Also write `.keep_times.samples` with site times taken from the genealogy
    pub keep_times: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            make_vcf: true,
            empirical_error: false,
            ancestral_state_error: false,
            keep_times: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub data_dir: PathBuf,
    pub processes: usize,
    pub tools: ToolPaths,
    /// Empirical genotyping error matrix for experiments adding sequencing errors
    pub error_matrix: Option<PathBuf>,
}

impl ExperimentConfig {
    pub fn run_table(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.csv"))
    }

    pub fn replicate(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    pub fn genetic_map(&self, filename: &str) -> PathBuf {
        self.data_dir.join(format!("{filename}_genetic_map.txt"))
    }

    pub fn relate_dir(&self, filename: &str, suffix: &str) -> PathBuf {
        self.data_dir.join(format!("relate_{filename}{suffix}"))
    }
}

/// Header and records of a master table, concatenated over replicates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub header: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl ResultTable {
    pub fn from_comparison(filename: &str, table: &ComparisonTable) -> Self {
        Self {
            header: std::iter::once("filename".to_string())
                .chain(table.header())
                .collect(),
            records: table
                .records()
                .into_iter()
                .map(|r| std::iter::once(filename.to_string()).chain(r).collect())
                .collect(),
        }
    }

    pub fn from_kc(filename: &str, rows: &[KcRow]) -> Self {
        Self {
            header: ["filename", "method", "lambda", "distance"]
                .map(String::from)
                .to_vec(),
            records: rows
                .iter()
                .map(|r| {
                    vec![
                        filename.to_string(),
                        r.method.clone(),
                        r.lambda.to_string(),
                        r.distance.to_string(),
                    ]
                })
                .collect(),
        }
    }

    pub fn append(&mut self, other: ResultTable) -> Result<()> {
        if self.header.is_empty() {
            self.header = other.header;
        } else {
            ensure!(
                self.header == other.header,
                "Cannot concatenate tables with columns {:?} and {:?}",
                self.header,
                other.header
            );
        }
        self.records.extend(other.records);
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wrtr = get_csv_writer(get_output(Some(path.to_path_buf()))?);
        wrtr.write_record(&self.header)?;
        for record in &self.records {
            wrtr.write_record(record)?;
        }
        wrtr.flush()?;
        Ok(())
    }
}

/// Updated run table row and result tables keyed by file suffix
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inference {
    pub row: RunRow,
    pub tables: Vec<(String, ResultTable)>,
}

pub trait Experiment: Send + Sync {
    fn name(&self) -> &'static str;

    fn replicates(&self) -> usize {
        DEFAULT_REPLICATES
    }

    fn parameters(&self) -> Vec<Param> {
        vec![Param::Single]
    }

    /// Fixed simulation parameters shared by every replicate
    fn base_row(&self) -> RunRow;

    fn options(&self) -> SetupOptions {
        SetupOptions::default()
    }

    /// Sorted ids of the sites to drop from the simulation before writing the inputs of
    /// inference. `None` keeps every site and writes no `.filtered.trees`.
    fn removed_sites(&self, _sim: &TreeSequence) -> Result<Option<Vec<usize>>> {
        Ok(None)
    }

    fn inference(&self, row: RunRow, config: &ExperimentConfig) -> Result<Inference>;
}

pub type Constructor = fn() -> Box<dyn Experiment>;

pub fn registry() -> IndexMap<&'static str, Constructor> {
    let mut registry: IndexMap<&'static str, Constructor> = IndexMap::new();
    registry.insert("cpu_scaling_samplesize", || Box::new(CpuScalingSampleSize));
    registry.insert("cpu_scaling_length", || Box::new(CpuScalingLength));
    registry.insert("neutral_simulated_mutation_accuracy", || {
        Box::new(NeutralSimulatedMutationAccuracy::default())
    });
    registry.insert("tsdate_neutral_simulated_mutation_accuracy", || {
        Box::new(TsdateNeutralSimulatedMutationAccuracy)
    });
    registry.insert("simulate_vanilla_ancient", || Box::new(SimulateVanillaAncient));
    registry
}

// Serial with a single process so that failures are easy to trace
fn dispatch<T, R, F>(items: Vec<T>, processes: usize, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync + Send,
{
    match processes > 1 {
        true => items.into_par_iter().map(f).collect(),
        false => items.into_iter().map(f).collect(),
    }
}

fn setup_replicate(exp: &dyn Experiment, mut row: RunRow, config: &ExperimentConfig) -> Result<RunRow> {
    let sim = simulate(&row.simulation_config(), row.seed)?;
    row.n_edges = sim.num_edges();
    row.n_trees = sim.num_trees();
    row.n_sites = sim.num_sites();

    let base = config.replicate(&row.filename);
    dump_ts(&sim, &append_ext("trees", &base))?;

    let mut samples = SampleData::from_tree_sequence(&sim, false)?;
    let sim = match exp.removed_sites(&sim)? {
        Some(removed) => {
            let kept = (0..sim.num_sites())
                .filter(|s| removed.binary_search(s).is_err())
                .collect::<Vec<usize>>();
            samples = samples.subset(&kept)?;
            let filtered = sim.delete_sites(&removed)?;
            dump_ts(&filtered, &append_ext("filtered.trees", &base))?;
            tracing::debug!("Removed {} of {} sites from {}", removed.len(), row.n_sites, row.filename);
            filtered
        }
        None => sim,
    };
    let mut samples = samples.copy(Some(append_ext("samples", &base)));
    samples.finalise()?;

    let options = exp.options();
    if options.keep_times {
        SampleData::from_tree_sequence(&sim, true)?
            .copy(Some(append_ext("keep_times.samples", &base)))
            .finalise()?;
    }
    let mut rng = StdRng::seed_from_u64(row.seed);
    if options.empirical_error {
        let matrix = config
            .error_matrix
            .clone()
            .ok_or_eyre("Adding empirical errors needs an error matrix")?;
        let errors = add_errors(
            &samples,
            Some(append_ext("error.samples", &base)),
            0.0,
            &SeqErrorModel::Empirical(matrix),
            &mut rng,
        )?;
        if options.make_vcf {
            sample_data_to_vcf(&errors, &append_ext("error.vcf", &base))?;
        }
    }
    if options.ancestral_state_error {
        let errors = add_errors(
            &samples,
            Some(append_ext("ancestral_state.error.samples", &base)),
            ANCESTRAL_STATE_ERROR,
            &SeqErrorModel::None,
            &mut rng,
        )?;
        if options.make_vcf {
            sample_data_to_vcf(&errors, &append_ext("ancestral_state.error.vcf", &base))?;
        }
    }
    if options.make_vcf {
        ts_to_vcf(&sim, &append_ext("vcf", &base))?;
    }

    write_genetic_map(&config.genetic_map(&row.filename), row.length, row.rec_rate)?;
    tracing::debug!("Simulated {} with {} sites", row.filename, row.n_sites);
    Ok(row)
}

/// Simulate every replicate and write the run table
#[tracing::instrument(skip_all, fields(experiment = exp.name()))]
pub fn setup(exp: &dyn Experiment, config: &ExperimentConfig) -> Result<Vec<RunRow>> {
    std::fs::create_dir_all(&config.data_dir)?;

    // seeds are drawn upfront so that they do not depend on scheduling
    let mut rng = StdRng::seed_from_u64(DEFAULT_SEED);
    let mut tasks = Vec::new();
    for param in exp.parameters() {
        let seeds = (0..exp.replicates())
            .map(|_| rng.gen_range(1..=1u64 << 31))
            .collect::<Vec<u64>>();
        for (index, seed) in seeds.into_iter().enumerate() {
            let mut row = exp.base_row();
            param.apply(&mut row);
            row.filename = format!("{}_{}_{index}", exp.name(), param.label());
            row.replicate = index;
            row.seed = seed;
            tasks.push(row);
        }
    }

    tracing::info!("Simulating {} replicates", tasks.len());
    let rows = dispatch(tasks, config.processes, |row| setup_replicate(exp, row, config))?;

    let path = config.run_table(exp.name());
    write_csv_rows(&path, &rows)?;
    tracing::info!("Wrote {path:?}");
    Ok(rows)
}

/// Run the inference of every replicate in the run table and write the master tables
#[tracing::instrument(skip_all, fields(experiment = exp.name()))]
pub fn inference(exp: &dyn Experiment, config: &ExperimentConfig) -> Result<Vec<RunRow>> {
    let path = config.run_table(exp.name());
    if !path.exists() {
        return Err(eyre!(MissingSetupError(path)));
    }
    let rows: Vec<RunRow> = read_csv_rows(&path)?;

    match config.processes > 1 {
        true => tracing::info!("Running inference with {} processes", config.processes),
        false => tracing::info!("Running inference in a single process"),
    }
    let results = dispatch(rows, config.processes, |row| {
        tracing::info!("Running inference on {}", row.filename);
        exp.inference(row, config)
    })?;

    let mut rows = Vec::with_capacity(results.len());
    let mut masters: IndexMap<String, ResultTable> = IndexMap::new();
    for result in results {
        rows.push(result.row);
        for (suffix, table) in result.tables {
            masters.entry(suffix).or_default().append(table)?;
        }
    }

    write_csv_rows(&path, &rows)?;
    for (suffix, table) in &masters {
        let master = config.data_dir.join(format!("{}{suffix}", exp.name()));
        table.write_csv(&master)?;
        tracing::info!("Wrote {master:?}");
    }
    Ok(rows)
}

fn belongs_to(name: &str, prefix: &str) -> bool {
    name == prefix
        || name.starts_with(&format!("{prefix}."))
        || name.starts_with(&format!("{prefix}_"))
}

/// Remove the files and Relate directories of a replicate, keeping tables
pub fn clear(data_dir: &Path, filename: &str) -> Result<()> {
    let relate = format!("relate_{filename}");
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() && belongs_to(&name, &relate) {
            std::fs::remove_dir_all(&path)?;
        } else if path.is_file() && belongs_to(&name, filename) && !name.ends_with(".csv") {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Timing of every method as the number of samples grows
pub struct CpuScalingSampleSize;

/// Timing of every method as the sequence length grows
pub struct CpuScalingLength;

fn time_methods(mut row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
    let base = config.replicate(&row.filename);
    let trees = append_ext("trees", &base);
    let sim = load_ts(&trees)?;

    let (_, u) = run_tsdate(
        &config.tools,
        &trees,
        &append_ext("tsdated.trees", &base),
        row.ne,
        row.mut_rate,
        20,
        TsdateMethod::InsideOutside,
    )?;
    (row.tsdate_cpu, row.tsdate_memory) = usage(u);

    let inferred = append_ext("tsinferred.trees", &base);
    let (_, u) = run_tsinfer(
        &config.tools,
        &append_ext("samples", &base),
        &inferred,
        sim.sequence_length(),
        1,
    )?;
    (row.tsinfer_cpu, row.tsinfer_memory) = usage(u);

    let (_, u) = run_tsdate(
        &config.tools,
        &inferred,
        &append_ext("tsinferred.tsdated.trees", &base),
        row.ne,
        row.mut_rate,
        20,
        TsdateMethod::InsideOutside,
    )?;
    (row.tsdate_infer_cpu, row.tsdate_infer_memory) = usage(u);

    let (_, _, u) = run_relate(
        &config.tools,
        &RelateRun {
            vcf_prefix: &base,
            mutation_rate: row.mut_rate,
            ne: row.ne * 2.0,
            genetic_map: &config.genetic_map(&row.filename),
            working_dir: &config.relate_dir(&row.filename, ""),
            output: "relate_file",
            num_samples: sim.num_samples(),
            sequence_length: sim.sequence_length(),
        },
    )?;
    (row.relate_cpu, row.relate_memory) = usage(u);

    clear(&config.data_dir, &row.filename)?;
    Ok(Inference {
        row,
        tables: vec![],
    })
}

impl Experiment for CpuScalingSampleSize {
    fn name(&self) -> &'static str {
        "cpu_scaling_samplesize"
    }

    fn parameters(&self) -> Vec<Param> {
        [
            10, 260, 526, 790, 1052, 1316, 1578, 1842, 2106, 2368, 2632, 2894, 3158, 3422, 3684,
            3948, 4210, 4474, 4736, 5000,
        ]
        .into_iter()
        .map(Param::SampleSize)
        .collect()
    }

    fn base_row(&self) -> RunRow {
        RunRow::neutral(0, 5e6)
    }

    fn inference(&self, row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
        time_methods(row, config)
    }
}

impl Experiment for CpuScalingLength {
    fn name(&self) -> &'static str {
        "cpu_scaling_length"
    }

    fn parameters(&self) -> Vec<Param> {
        linspace(1e5, 1e7, 20)
            .into_iter()
            .map(|l| Param::Length(l as u64))
            .collect()
    }

    fn base_row(&self) -> RunRow {
        RunRow::neutral(1000, 0.0)
    }

    fn inference(&self, row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
        time_methods(row, config)
    }
}

/// Mutation age accuracy of tsdate, tsinfer + tsdate, Relate and GEVA on neutral simulations
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralSimulatedMutationAccuracy {
    pub empirical_error: bool,
    pub ancestral_state_error: bool,
}

impl NeutralSimulatedMutationAccuracy {
    // Infer from one version of the sample data, `suffix` names its error model
    fn infer_from_samples(
        &self,
        row: &mut RunRow,
        config: &ExperimentConfig,
        sim: &TreeSequence,
        dated: &TreeSequence,
        suffix: &str,
    ) -> Result<(ResultTable, ResultTable)> {
        let base = config.replicate(&row.filename);
        let input = append_ext(format!("{suffix}samples"), &base);
        let prefix = match suffix {
            "" => base.clone(),
            _ => append_ext(suffix.trim_end_matches('.'), &base),
        };

        let inferred = append_ext("tsinferred.trees", &prefix);
        let (_, u) = run_tsinfer(&config.tools, &input, &inferred, sim.sequence_length(), 1)?;
        if suffix.is_empty() {
            (row.tsinfer_cpu, row.tsinfer_memory) = usage(u);
        }

        let (dated_inferred, u) = run_tsdate(
            &config.tools,
            &inferred,
            &append_ext("tsinferred.tsdated.trees", &prefix),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;
        if suffix.is_empty() {
            (row.tsdate_infer_cpu, row.tsdate_infer_memory) = usage(u);
        }

        let relate_suffix = suffix.trim_end_matches('.');
        let relate_suffix = match relate_suffix {
            "" => String::new(),
            s => format!(".{s}"),
        };
        let (relate_ts, relate_ages, u) = run_relate(
            &config.tools,
            &RelateRun {
                vcf_prefix: &prefix,
                mutation_rate: row.mut_rate,
                ne: row.ne * 2.0,
                genetic_map: &config.genetic_map(&row.filename),
                working_dir: &config.relate_dir(&row.filename, &relate_suffix),
                output: &format!("relate_run{}", relate_suffix.replace('.', "_")),
                num_samples: sim.num_samples(),
                sequence_length: sim.sequence_length(),
            },
        )?;
        if suffix.is_empty() {
            (row.relate_cpu, row.relate_memory) = usage(u);
        }

        let (geva_ages, u) = run_geva(&config.tools, &prefix, row.ne, row.mut_rate, row.rec_rate)?;
        if suffix.is_empty() {
            (row.geva_cpu, row.geva_memory) = usage(u);
        }

        let mutations = compare_mutations(
            &["simulated_ts", "tsdate", "tsdate_inferred"],
            &[sim, dated, &dated_inferred],
            Some(relate_ages.as_slice()),
            Some(geva_ages.as_slice()),
            false,
            AgeAggregate::Arithmetic,
        )?;

        let sim_trimmed = sim.trim_to_sites()?;
        let dated_trimmed = dated.trim_to_sites()?;
        let dated_inferred_trimmed = dated_inferred
            .trim_to_sites()?
            .with_sequence_length(sim_trimmed.sequence_length())?;
        let relate_trimmed = relate_ts.trim_to_sites()?;
        let kc = get_kc_distances(
            &[&sim_trimmed, &dated_trimmed, &dated_inferred_trimmed, &relate_trimmed],
            &["simulated_ts", "tsdate", "tsdate_inferred", "relate"],
            &[0.0, 1.0],
        )?;

        Ok((
            ResultTable::from_comparison(&row.filename, &mutations),
            ResultTable::from_kc(&row.filename, &kc),
        ))
    }
}

impl Experiment for NeutralSimulatedMutationAccuracy {
    fn name(&self) -> &'static str {
        "neutral_simulated_mutation_accuracy"
    }

    fn replicates(&self) -> usize {
        30
    }

    fn base_row(&self) -> RunRow {
        RunRow::neutral(250, 5e6)
    }

    fn options(&self) -> SetupOptions {
        SetupOptions {
            make_vcf: true,
            empirical_error: self.empirical_error,
            ancestral_state_error: self.ancestral_state_error,
            keep_times: false,
        }
    }

    fn inference(&self, mut row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
        let base = config.replicate(&row.filename);
        let trees = append_ext("trees", &base);
        let sim = load_ts(&trees)?;

        let (dated, u) = run_tsdate(
            &config.tools,
            &trees,
            &append_ext("tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;
        (row.tsdate_cpu, row.tsdate_memory) = usage(u);

        let mut tables = Vec::new();
        let (mutations, kc) = self.infer_from_samples(&mut row, config, &sim, &dated, "")?;
        tables.push(("_mutations.csv".to_string(), mutations));
        tables.push(("_kc_distances.csv".to_string(), kc));

        if self.empirical_error {
            let (mutations, kc) = self.infer_from_samples(&mut row, config, &sim, &dated, "error.")?;
            tables.push(("_error_mutations.csv".to_string(), mutations));
            tables.push(("_error_kc_distances.csv".to_string(), kc));
        }
        if self.ancestral_state_error {
            let (mutations, kc) =
                self.infer_from_samples(&mut row, config, &sim, &dated, "ancestral_state.error.")?;
            tables.push(("_anc_error_mutations.csv".to_string(), mutations));
            tables.push(("_anc_error_kc_distances.csv".to_string(), kc));
        }

        Ok(Inference { row, tables })
    }
}

/// Mutation age accuracy of tsdate alone and of tsinfer + tsdate
pub struct TsdateNeutralSimulatedMutationAccuracy;

impl Experiment for TsdateNeutralSimulatedMutationAccuracy {
    fn name(&self) -> &'static str {
        "tsdate_neutral_simulated_mutation_accuracy"
    }

    fn base_row(&self) -> RunRow {
        RunRow::neutral(250, 5e6)
    }

    fn inference(&self, mut row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
        let base = config.replicate(&row.filename);
        let trees = append_ext("trees", &base);
        let sim = load_ts(&trees)?;

        let (dated, u) = run_tsdate(
            &config.tools,
            &trees,
            &append_ext("tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;
        (row.tsdate_cpu, row.tsdate_memory) = usage(u);

        let inferred = append_ext("tsinferred.trees", &base);
        let (_, u) = run_tsinfer(
            &config.tools,
            &append_ext("samples", &base),
            &inferred,
            sim.sequence_length(),
            1,
        )?;
        (row.tsinfer_cpu, row.tsinfer_memory) = usage(u);

        let (dated_inferred, u) = run_tsdate(
            &config.tools,
            &inferred,
            &append_ext("tsinferred.tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            50,
            TsdateMethod::InsideOutside,
        )?;
        (row.tsdate_infer_cpu, row.tsdate_infer_memory) = usage(u);

        let mutations = compare_mutations(
            &["simulated_ts", "tsdate", "tsdate_inferred"],
            &[&sim, &dated, &dated_inferred],
            None,
            None,
            false,
            AgeAggregate::Arithmetic,
        )?;
        let table = ResultTable::from_comparison(&row.filename, &mutations);

        Ok(Inference {
            row,
            tables: vec![("_mutations.csv".to_string(), table)],
        })
    }
}

/// Sites where no modern sample or every modern sample carries a derived allele
pub fn ancient_only_sites(ts: &TreeSequence) -> Vec<usize> {
    let samples = ts.samples();
    let modern = (0..samples.len())
        .filter(|&i| ts.nodes()[samples[i]].time == 0.0)
        .collect::<Vec<usize>>();

    ts.genotype_matrix()
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| {
            let derived = modern.iter().filter(|&&i| row[i] != 0).count();
            derived == 0 || derived == modern.len()
        })
        .map(|(site, _)| site)
        .collect()
}

/// Mutation age accuracy of tsdate and tsinfer + tsdate with ancient samples in the data
pub struct SimulateVanillaAncient;

impl Experiment for SimulateVanillaAncient {
    fn name(&self) -> &'static str {
        "simulate_vanilla_ancient"
    }

    fn replicates(&self) -> usize {
        1
    }

    fn base_row(&self) -> RunRow {
        RunRow {
            sample_size_ancient: 10,
            ..RunRow::neutral(100, 1e5)
        }
    }

    fn options(&self) -> SetupOptions {
        SetupOptions {
            make_vcf: false,
            keep_times: true,
            ..Default::default()
        }
    }

    fn removed_sites(&self, sim: &TreeSequence) -> Result<Option<Vec<usize>>> {
        Ok(Some(ancient_only_sites(sim)))
    }

    fn inference(&self, mut row: RunRow, config: &ExperimentConfig) -> Result<Inference> {
        let base = config.replicate(&row.filename);
        let trees = append_ext("filtered.trees", &base);
        let sim = load_ts(&trees)?;

        let (dated, u) = run_tsdate(
            &config.tools,
            &trees,
            &append_ext("tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;
        (row.tsdate_cpu, row.tsdate_memory) = usage(u);

        let inferred = append_ext("tsinferred.trees", &base);
        let (_, u) = run_tsinfer(
            &config.tools,
            &append_ext("samples", &base),
            &inferred,
            sim.sequence_length(),
            1,
        )?;
        (row.tsinfer_cpu, row.tsinfer_memory) = usage(u);

        let (dated_inferred, u) = run_tsdate(
            &config.tools,
            &inferred,
            &append_ext("tsinferred.tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;
        (row.tsdate_infer_cpu, row.tsdate_infer_memory) = usage(u);

        let keep_times = append_ext("keep_times.tsinferred.trees", &base);
        run_tsinfer(
            &config.tools,
            &append_ext("keep_times.samples", &base),
            &keep_times,
            sim.sequence_length(),
            1,
        )?;
        let (dated_keep_times, _) = run_tsdate(
            &config.tools,
            &keep_times,
            &append_ext("keep_times.tsinferred.tsdated.trees", &base),
            row.ne,
            row.mut_rate,
            20,
            TsdateMethod::InsideOutside,
        )?;

        let mutations = compare_mutations(
            &["simulated_ts", "tsdate", "tsdate_inferred", "tsdate_inferred_keep_times"],
            &[&sim, &dated, &dated_inferred, &dated_keep_times],
            None,
            None,
            false,
            AgeAggregate::Arithmetic,
        )?;
        let table = ResultTable::from_comparison(&row.filename, &mutations);

        Ok(Inference {
            row,
            tables: vec![("_mutations.csv".to_string(), table)],
        })
    }
}

#[tracing::instrument(skip_all)]
pub fn run(name: String, setup_flag: bool, inference_flag: bool, config: ExperimentConfig) -> Result<()> {
    ensure!(
        setup_flag || inference_flag,
        "Nothing to do. Pass --setup, --inference or both"
    );

    let registry = registry();
    let experiments = match name.as_str() {
        "all" => registry.values().map(|new| new()).collect::<Vec<_>>(),
        name => {
            let new = registry
                .get(name)
                .ok_or_else(|| eyre!(UnknownExperimentError(name.to_string())))?;
            vec![new()]
        }
    };

    for exp in experiments {
        tracing::info!("Experiment {}", exp.name());
        if setup_flag {
            setup(exp.as_ref(), &config)?;
        }
        if inference_flag {
            inference(exp.as_ref(), &config)?;
        }
    }
    Ok(())
}
