use std::collections::BTreeMap;
use std::path::PathBuf;

use color_eyre::{eyre::ensure, Result};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{Exp, Poisson};

use crate::args::SimulationArgs;
use crate::io::{dump_ts, push_to_output};
use crate::structs::{TableCollection, TreeSequence, NODE_IS_SAMPLE};

/// Piecewise-constant diploid population size history, backwards in time
#[derive(Debug, Clone, PartialEq)]
pub struct Demography {
    epochs: Vec<(f64, f64)>,
}

impl Demography {
    pub fn constant(size: f64) -> Self {
        Self {
            epochs: vec![(0.0, size)],
        }
    }

    /// Population size `initial` at time zero, changed to `size` at each `(time, size)`
    pub fn with_changes(initial: f64, changes: &[(f64, f64)]) -> Result<Self> {
        let mut epochs = vec![(0.0, initial)];
        for &(time, size) in changes {
            ensure!(
                time > epochs[epochs.len() - 1].0,
                "Population size changes must be at increasing times > 0"
            );
            epochs.push((time, size));
        }
        ensure!(
            epochs.iter().all(|(_, size)| *size > 0.0),
            "Population sizes must be positive"
        );
        Ok(Self { epochs })
    }

    pub fn size_at(&self, time: f64) -> f64 {
        self.epochs
            .iter()
            .take_while(|(start, _)| *start <= time)
            .last()
            .map_or(self.epochs[0].1, |(_, size)| *size)
    }

    fn next_change_after(&self, time: f64) -> Option<f64> {
        self.epochs
            .iter()
            .map(|(start, _)| *start)
            .find(|start| *start > time)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub sample_size: usize,
    pub sequence_length: f64,
    pub recombination_rate: f64,
    pub mutation_rate: f64,
    pub demography: Demography,
    /// Sampling times of additional ancient haploid samples
    pub ancient_samples: Vec<f64>,
}

impl TryFrom<&SimulationArgs> for SimulationConfig {
    type Error = color_eyre::Report;

    fn try_from(args: &SimulationArgs) -> Result<Self> {
        Ok(Self {
            sample_size: args.sample_size,
            sequence_length: args.length,
            recombination_rate: args.recombination_rate,
            mutation_rate: args.mutation_rate,
            demography: Demography::with_changes(args.ne, &args.size_changes)?,
            ancient_samples: args.ancient_samples.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    left: u64,
    right: u64,
    node: usize,
}

fn push_segment(segments: &mut Vec<Segment>, left: u64, right: u64, node: usize) {
    match segments.last_mut() {
        Some(last) if last.right == left && last.node == node => last.right = right,
        _ => segments.push(Segment { left, right, node }),
    }
}

fn links(lineage: &[Segment]) -> u64 {
    match (lineage.first(), lineage.last()) {
        (Some(first), Some(last)) => last.right - first.left - 1,
        _ => 0,
    }
}

// Number of lineages carrying ancestral material, keyed by the left end of each stretch
struct OverlapCounts(BTreeMap<u64, usize>);

impl OverlapCounts {
    fn new(length: u64, count: usize) -> Self {
        Self(BTreeMap::from([(0, count), (length, 0)]))
    }

    fn split_at(&mut self, x: u64) {
        if !self.0.contains_key(&x) {
            if let Some((_, &count)) = self.0.range(..x).next_back() {
                self.0.insert(x, count);
            }
        }
    }

    /// Decrement the counts over `[left, right)` and return the stretches still shared
    fn coalesce(&mut self, left: u64, right: u64) -> Vec<(u64, u64)> {
        self.split_at(left);
        self.split_at(right);
        let keys = self
            .0
            .range(left..right)
            .map(|(&k, &c)| (k, c))
            .collect::<Vec<(u64, usize)>>();

        let mut shared = vec![];
        for (i, &(start, count)) in keys.iter().enumerate() {
            let end = keys.get(i + 1).map_or(right, |next| next.0);
            let count = count.saturating_sub(1);
            self.0.insert(start, count);
            if count > 1 {
                shared.push((start, end));
            }
        }
        shared
    }
}

fn recombine<R: Rng>(lineages: &mut Vec<Vec<Segment>>, total_links: u64, rng: &mut R) {
    let mut choice = rng.gen_range(0..total_links);
    let mut index = 0;
    for (i, lineage) in lineages.iter().enumerate() {
        let l = links(lineage);
        if choice < l {
            index = i;
            break;
        }
        choice -= l;
    }

    let lineage = std::mem::take(&mut lineages[index]);
    let breakpoint = lineage[0].left + 1 + choice;

    let mut left = vec![];
    let mut right = vec![];
    for seg in lineage {
        if seg.right <= breakpoint {
            left.push(seg);
        } else if seg.left >= breakpoint {
            right.push(seg);
        } else {
            left.push(Segment {
                right: breakpoint,
                ..seg
            });
            right.push(Segment {
                left: breakpoint,
                ..seg
            });
        }
    }
    lineages[index] = left;
    lineages.push(right);
}

fn merge(
    a: &[Segment],
    b: &[Segment],
    time: f64,
    tables: &mut TableCollection,
    overlap: &mut OverlapCounts,
) -> Vec<Segment> {
    let mut points = a
        .iter()
        .chain(b)
        .flat_map(|s| [s.left, s.right])
        .collect::<Vec<u64>>();
    points.sort_unstable();
    points.dedup();

    let mut merged = vec![];
    let mut parent = None;
    let (mut ia, mut ib) = (0, 0);

    for w in points.windows(2) {
        let (x, y) = (w[0], w[1]);
        while ia < a.len() && a[ia].right <= x {
            ia += 1;
        }
        while ib < b.len() && b[ib].right <= x {
            ib += 1;
        }
        let sa = a.get(ia).filter(|s| s.left <= x);
        let sb = b.get(ib).filter(|s| s.left <= x);

        match (sa, sb) {
            (None, None) => (),
            (Some(s), None) | (None, Some(s)) => push_segment(&mut merged, x, y, s.node),
            (Some(sa), Some(sb)) => {
                let v = *parent.get_or_insert_with(|| tables.add_node(time, 0));
                tables.add_edge(x as f64, y as f64, v, sa.node);
                tables.add_edge(x as f64, y as f64, v, sb.node);
                for (start, end) in overlap.coalesce(x, y) {
                    push_segment(&mut merged, start, end, v);
                }
            }
        }
    }
    merged
}

/// Coalescent with recombination over the integer genome `[0, L)` (Hudson's algorithm).
///
/// Time is measured in generations and the pairwise coalescence rate is `1 / (2N)` for a
/// diploid population of size `N`. Only coalescence nodes are recorded.
pub fn simulate_ancestry<R: Rng>(config: &SimulationConfig, rng: &mut R) -> Result<TableCollection> {
    let length = config.sequence_length.round() as u64;
    ensure!(length >= 1, "Sequence length must be at least 1");
    ensure!(
        config.recombination_rate >= 0.0,
        "Recombination rate must be non-negative"
    );
    ensure!(
        config.ancient_samples.iter().all(|t| *t >= 0.0),
        "Sample times must be non-negative"
    );
    let total_samples = config.sample_size + config.ancient_samples.len();
    ensure!(total_samples >= 2, "At least two samples are required");

    let mut tables = TableCollection::new(length as f64);
    let mut lineages: Vec<Vec<Segment>> = vec![];
    let mut pending: Vec<(f64, usize)> = vec![];

    for _ in 0..config.sample_size {
        let node = tables.add_node(0.0, NODE_IS_SAMPLE);
        lineages.push(vec![Segment {
            left: 0,
            right: length,
            node,
        }]);
    }
    for &time in &config.ancient_samples {
        let node = tables.add_node(time, NODE_IS_SAMPLE);
        match time > 0.0 {
            true => pending.push((time, node)),
            false => lineages.push(vec![Segment {
                left: 0,
                right: length,
                node,
            }]),
        }
    }
    // Oldest last so the next sample to enter is popped first
    pending.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut overlap = OverlapCounts::new(length, total_samples);
    let mut t = 0.0;

    loop {
        let k = lineages.len();
        let total_links = lineages.iter().map(|l| links(l)).sum::<u64>();
        let size = config.demography.size_at(t);

        let coal_rate = match k >= 2 {
            true => (k * (k - 1)) as f64 / 2.0 / (2.0 * size),
            false => 0.0,
        };
        let rec_rate = config.recombination_rate * total_links as f64;
        let total_rate = coal_rate + rec_rate;

        let boundary = match (pending.last(), config.demography.next_change_after(t)) {
            (Some(p), Some(c)) => Some(p.0.min(c)),
            (Some(p), None) => Some(p.0),
            (None, c) => c.filter(|_| k >= 2),
        };

        let dt = match total_rate > 0.0 {
            true => Exp::new(total_rate)?.sample(rng),
            false => f64::INFINITY,
        };

        if let Some(boundary) = boundary {
            if t + dt >= boundary {
                t = boundary;
                while pending.last().is_some_and(|p| p.0 <= t) {
                    if let Some((_, node)) = pending.pop() {
                        lineages.push(vec![Segment {
                            left: 0,
                            right: length,
                            node,
                        }]);
                    }
                }
                continue;
            }
        }

        if !dt.is_finite() {
            break;
        }
        t += dt;

        if rng.gen::<f64>() * total_rate < rec_rate {
            recombine(&mut lineages, total_links, rng);
        } else {
            let i = rng.gen_range(0..k);
            let mut j = rng.gen_range(0..k - 1);
            if j >= i {
                j += 1;
            }
            let (hi, lo) = (i.max(j), i.min(j));
            let b = lineages.swap_remove(hi);
            let a = lineages.swap_remove(lo);
            let merged = merge(&a, &b, t, &mut tables, &mut overlap);
            if !merged.is_empty() {
                lineages.push(merged);
            }
        }

        if lineages.is_empty() && pending.is_empty() {
            break;
        }
    }

    tables.squash_edges();
    Ok(tables)
}

/// Infinite-sites mutations thrown uniformly on the branches, one site per mutation
pub fn simulate_mutations<R: Rng>(
    tables: &mut TableCollection,
    rate: f64,
    rng: &mut R,
) -> Result<()> {
    ensure!(rate >= 0.0, "Mutation rate must be non-negative");

    let mut mutations = vec![];
    for edge in &tables.edges {
        let branch = tables.nodes[edge.parent].time - tables.nodes[edge.child].time;
        let lambda = rate * (edge.right - edge.left) * branch;
        if lambda <= 0.0 {
            continue;
        }
        let count = Poisson::new(lambda)?.sample(rng) as usize;
        for _ in 0..count {
            mutations.push((rng.gen_range(edge.left..edge.right), edge.child));
        }
    }

    mutations.sort_by(|a, b| a.0.total_cmp(&b.0));
    mutations.dedup_by(|a, b| a.0 == b.0);

    for (position, node) in mutations {
        let site = tables.add_site(position, "0");
        tables.add_mutation(site, node, "1");
    }
    Ok(())
}

pub fn simulate(config: &SimulationConfig, seed: u64) -> Result<TreeSequence> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tables = simulate_ancestry(config, &mut rng)?;
    simulate_mutations(&mut tables, config.mutation_rate, &mut rng)?;
    tables.tree_sequence()
}

#[tracing::instrument(skip_all)]
pub fn run(args: SimulationArgs, output: PathBuf, prefix: Option<String>) -> Result<()> {
    let config = SimulationConfig::try_from(&args)?;
    let ts = simulate(&config, args.seed)?;

    tracing::info!(
        "Simulated {} samples ({} ancient) over {} bp: {} trees, {} edges, {} sites",
        ts.num_samples(),
        config.ancient_samples.len(),
        ts.sequence_length(),
        ts.num_trees(),
        ts.num_edges(),
        ts.num_sites()
    );

    let mut path = output;
    push_to_output(&prefix, &mut path, "simulated", "trees");
    dump_ts(&ts, &path)?;
    tracing::info!("Wrote {path:?}");

    Ok(())
}
