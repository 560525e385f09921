use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use color_eyre::{
    eyre::{ensure, eyre, OptionExt},
    Result,
};
use indexmap::IndexMap;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::TsageError::{
    MultipleRootsError, NoOverlapError, TreeIteratorDesyncError, UnequalSamplesError,
};
use crate::io::{get_csv_writer, get_output, load_ts, push_to_output, write_csv_rows};
use crate::structs::{Tree, TreeSequence};
use crate::utils::{merge_breakpoints, round_position};

fn pair_index(i: usize, j: usize, n: usize) -> usize {
    i * n - i * (i + 1) / 2 + (j - i - 1)
}

fn check_samples(a: &TreeSequence, b: &TreeSequence) -> Result<()> {
    if a.num_samples() != b.num_samples() {
        return Err(eyre!(UnequalSamplesError((a.num_samples(), b.num_samples()))));
    }
    Ok(())
}

/// Kendall-Colijn vector of a single-rooted tree.
///
/// The first `n(n-1)/2` entries hold the sample pairs in lexicographic order: the depth of
/// their MRCA blended with the time between the root and the MRCA. The last `n` entries hold
/// the samples: a depth of one blended with their branch length.
pub fn kc_vector(tree: &Tree, lambda: f64) -> Result<Vec<f64>> {
    let roots = tree.roots();
    let root = match roots.as_slice() {
        [root] => *root,
        _ => return Err(eyre!(MultipleRootsError(tree.interval().0))),
    };

    let ts = tree.tree_sequence();
    let n = ts.num_samples();
    let n_pairs = n * (n.saturating_sub(1)) / 2;
    let root_time = tree.time(root);
    let mut depth_topology = vec![0.0; n_pairs + n];
    let mut depth_time = vec![0.0; n_pairs + n];

    let mut preorder = Vec::new();
    let mut depth = vec![0usize; ts.num_nodes()];
    let mut stack = vec![root];
    while let Some(u) = stack.pop() {
        preorder.push(u);
        for &c in tree.children(u) {
            depth[c] = depth[u] + 1;
            stack.push(c);
        }
    }

    let mut below: Vec<Vec<usize>> = vec![Vec::new(); ts.num_nodes()];
    for &u in preorder.iter().rev() {
        let mut acc = match ts.sample_index(u) {
            Some(i) => {
                depth_topology[n_pairs + i] = 1.0;
                depth_time[n_pairs + i] = tree.branch_length(u);
                vec![i]
            }
            None => Vec::new(),
        };
        for &c in tree.children(u) {
            let samples = std::mem::take(&mut below[c]);
            for &a in &acc {
                for &b in &samples {
                    let k = pair_index(a.min(b), a.max(b), n);
                    depth_topology[k] = depth[u] as f64;
                    depth_time[k] = root_time - tree.time(u);
                }
            }
            acc.extend(samples);
        }
        below[u] = acc;
    }

    Ok(depth_topology
        .into_iter()
        .zip(depth_time)
        .map(|(m, t)| (1.0 - lambda) * m + lambda * t)
        .collect())
}

/// Euclidean distance between the Kendall-Colijn vectors of two trees
pub fn kc_distance(a: &Tree, b: &Tree, lambda: f64) -> Result<f64> {
    check_samples(a.tree_sequence(), b.tree_sequence())?;
    let (va, vb) = (kc_vector(a, lambda)?, kc_vector(b, lambda)?);
    Ok(va
        .iter()
        .zip(&vb)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt())
}

/// Tree distance averaged along the genome, weighted by the span of each pair of local trees.
///
/// Only the overlap of the two covered intervals is compared.
pub fn kc_distance_ts(a: &TreeSequence, b: &TreeSequence, lambda: f64) -> Result<f64> {
    check_samples(a, b)?;
    let (a_left, a_right) = a.covered_interval().ok_or_else(|| eyre!(NoOverlapError))?;
    let (b_left, b_right) = b.covered_interval().ok_or_else(|| eyre!(NoOverlapError))?;
    let (left, right) = (a_left.max(b_left), a_right.min(b_right));
    if left >= right {
        return Err(eyre!(NoOverlapError));
    }

    let breakpoints = merge_breakpoints(
        &merge_breakpoints(a.breakpoints(), b.breakpoints()),
        &[left, right],
    )
    .into_iter()
    .filter(|&x| left <= x && x <= right)
    .collect::<Vec<f64>>();

    let mut a_trees = a.trees();
    let mut b_trees = b.trees();
    let mut distance = 0.0;
    let mut compared = 0.0;
    for (&l, &r) in breakpoints.iter().tuple_windows() {
        let tree_a = a_trees
            .seek(l)
            .ok_or_else(|| eyre!(TreeIteratorDesyncError(l)))?;
        let tree_b = b_trees
            .seek(l)
            .ok_or_else(|| eyre!(TreeIteratorDesyncError(l)))?;
        distance += kc_distance(tree_a, tree_b, lambda)? * (r - l);
        compared += r - l;
    }

    ensure!(
        compared > 0.0,
        "No genome length compared over [{left}, {right})"
    );
    Ok(distance / compared)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KcRow {
    pub method: String,
    pub lambda: f64,
    pub distance: f64,
}

/// Distances of every genealogy against the first one
pub fn get_kc_distances(
    ts_list: &[&TreeSequence],
    names: &[&str],
    lambdas: &[f64],
) -> Result<Vec<KcRow>> {
    ensure!(
        names.len() == ts_list.len(),
        "Got {} method names for {} tree sequences",
        names.len(),
        ts_list.len()
    );
    let reference = ts_list.first().ok_or_eyre("No tree sequences to compare")?;

    let mut rows = Vec::new();
    for &lambda in lambdas {
        for (name, ts) in names.iter().zip(ts_list).skip(1) {
            let distance = kc_distance_ts(reference, ts, lambda)?;
            tracing::debug!("{name} lambda={lambda}: {distance}");
            rows.push(KcRow {
                method: name.to_string(),
                lambda,
                distance,
            });
        }
    }
    Ok(rows)
}

/// Mean pairwise TMRCA at sampled sites, one column per genealogy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TmrcaTable {
    pub positions: Vec<f64>,
    pub columns: IndexMap<String, Vec<f64>>,
}

impl TmrcaTable {
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wrtr = get_csv_writer(get_output(Some(path.to_path_buf()))?);
        let header = std::iter::once("position".to_string()).chain(self.columns.keys().cloned());
        wrtr.write_record(header)?;
        for (i, position) in self.positions.iter().enumerate() {
            let record = std::iter::once(position.to_string())
                .chain(self.columns.values().map(|c| c[i].to_string()));
            wrtr.write_record(record)?;
        }
        wrtr.flush()?;
        Ok(())
    }
}

fn sample_tenth<R: Rng>(rng: &mut R, len: usize) -> Vec<usize> {
    if len == 0 {
        return vec![];
    }
    let mut picked = rand::seq::index::sample(rng, len, (len / 10).max(1)).into_vec();
    picked.sort_unstable();
    picked
}

/// Mean TMRCA over a random tenth of sample pairs at a random tenth of the comparable sites.
///
/// The first genealogy provides the sites. When the genealogies carry different numbers of
/// mutations, only sites whose rounded position is a site of every other genealogy count.
pub fn find_tmrcas_snps<R: Rng>(
    ts_map: &IndexMap<&str, &TreeSequence>,
    rng: &mut R,
) -> Result<TmrcaTable> {
    let (_, truth) = ts_map.first().ok_or_eyre("No tree sequences to compare")?;
    for ts in ts_map.values() {
        check_samples(truth, ts)?;
    }

    let mut comparable = truth.site_positions();
    for ts in ts_map.values() {
        if ts.num_mutations() != truth.num_mutations() {
            let rounded = ts
                .site_positions()
                .into_iter()
                .map(round_position)
                .collect::<BTreeSet<i64>>();
            comparable.retain(|&p| rounded.contains(&round_position(p)));
        }
    }
    if comparable.len() < truth.num_sites() {
        tracing::info!(
            "Tree sequences have unequal numbers of mutations, {} of {} sites are comparable",
            comparable.len(),
            truth.num_sites()
        );
    }

    let positions = sample_tenth(rng, comparable.len())
        .into_iter()
        .map(|i| comparable[i])
        .collect::<Vec<f64>>();
    let all_pairs = (0..truth.num_samples()).tuple_combinations().collect::<Vec<(usize, usize)>>();
    let pairs = sample_tenth(rng, all_pairs.len())
        .into_iter()
        .map(|i| all_pairs[i])
        .collect::<Vec<(usize, usize)>>();

    let mut columns = IndexMap::new();
    for (name, ts) in ts_map {
        let samples = ts.samples();
        let mut trees = ts.trees();
        let mut column = Vec::with_capacity(positions.len());
        for &position in &positions {
            let tree = trees
                .seek(position)
                .ok_or_else(|| eyre!(TreeIteratorDesyncError(position)))?;
            let mut total = 0.0;
            for &(a, b) in &pairs {
                total += tree.tmrca(samples[a], samples[b]).ok_or_else(|| {
                    eyre!("Samples {a} and {b} of {name} do not coalesce at {position}")
                })?;
            }
            column.push(total / pairs.len() as f64);
        }
        columns.insert(name.to_string(), column);
    }

    Ok(TmrcaTable { positions, columns })
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all)]
pub fn run(
    files: Vec<PathBuf>,
    names: Option<Vec<String>>,
    lambdas: Vec<f64>,
    trim_to_sites: bool,
    tmrcas: bool,
    seed: u64,
    output: PathBuf,
    prefix: Option<String>,
) -> Result<()> {
    ensure!(files.len() >= 2, "At least two tree sequences are needed");
    let mut ts_list = files
        .iter()
        .map(|f| load_ts(f))
        .collect::<Result<Vec<TreeSequence>>>()?;
    if trim_to_sites {
        ts_list = ts_list
            .iter()
            .map(|ts| ts.trim_to_sites())
            .collect::<Result<Vec<TreeSequence>>>()?;
    }

    let names = match names {
        Some(names) => names,
        None => files
            .iter()
            .enumerate()
            .map(|(i, f)| {
                f.file_stem()
                    .map_or(format!("ts_{i}"), |s| s.to_string_lossy().into_owned())
            })
            .collect(),
    };
    let names = names.iter().map(|n| n.as_str()).collect::<Vec<&str>>();
    let refs = ts_list.iter().collect::<Vec<&TreeSequence>>();

    let rows = get_kc_distances(&refs, &names, &lambdas)?;
    for row in &rows {
        tracing::info!("{} vs {} lambda={}: {}", names[0], row.method, row.lambda, row.distance);
    }
    let mut path = output.clone();
    push_to_output(&prefix, &mut path, "kc_distances", "csv");
    write_csv_rows(&path, &rows)?;
    tracing::info!("Wrote {path:?}");

    if tmrcas {
        let ts_map = names.iter().copied().zip(refs).collect::<IndexMap<&str, &TreeSequence>>();
        let table = find_tmrcas_snps(&ts_map, &mut StdRng::seed_from_u64(seed))?;
        let mut path = output;
        push_to_output(&prefix, &mut path, "tmrcas", "csv");
        table.write_csv(&path)?;
        tracing::info!("Wrote {path:?}");
    }

    Ok(())
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;
    use crate::error::TsageError;
    use crate::structs::fixtures::two_tree_ts;
    use crate::structs::{TableCollection, NODE_IS_SAMPLE};

    // The first local tree of the two-tree fixture over the whole sequence
    fn single_tree_ts() -> TreeSequence {
        let mut tables = TableCollection::new(100.0);
        for _ in 0..4 {
            tables.add_node(0.0, NODE_IS_SAMPLE);
        }
        tables.add_node(1.0, 0);
        tables.add_node(2.0, 0);
        tables.add_node(3.0, 0);
        for (parent, child) in [(4, 0), (4, 1), (5, 2), (5, 3), (6, 4), (6, 5)] {
            tables.add_edge(0.0, 100.0, parent, child);
        }
        tables.tree_sequence().unwrap()
    }

    fn kind(err: &color_eyre::Report) -> Option<&TsageError> {
        err.downcast_ref::<TsageError>()
    }

    #[test]
    fn test_pair_index() {
        let n = 4;
        let pairs = (0..n).tuple_combinations().map(|(i, j)| pair_index(i, j, n)).collect::<Vec<_>>();
        assert_eq!(pairs, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_kc_vector() {
        let ts = two_tree_ts();
        let mut trees = ts.trees();
        let tree = trees.next_tree().unwrap();
        let v = kc_vector(tree, 0.0).unwrap();
        assert_eq!(v, vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0]);

        let v = kc_vector(tree, 1.0).unwrap();
        assert_eq!(v, vec![2.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_identical_sequences_have_zero_distance() {
        let (a, b) = (two_tree_ts(), two_tree_ts());
        assert_eq!(kc_distance_ts(&a, &b, 0.0).unwrap(), 0.0);
        assert_eq!(kc_distance_ts(&a, &b, 1.0).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let (a, b) = (two_tree_ts(), single_tree_ts());
        assert_eq!(kc_distance_ts(&a, &b, 0.0).unwrap(), 1.0);
        for lambda in [0.0, 0.5, 1.0] {
            assert_eq!(kc_distance_ts(&a, &b, lambda).unwrap(), kc_distance_ts(&b, &a, lambda).unwrap());
        }
    }

    #[test]
    fn test_multiple_roots() {
        let mut tables = TableCollection::new(100.0);
        for _ in 0..4 {
            tables.add_node(0.0, NODE_IS_SAMPLE);
        }
        tables.add_node(1.0, 0);
        tables.add_node(2.0, 0);
        for (parent, child) in [(4, 0), (4, 1), (5, 2), (5, 3)] {
            tables.add_edge(0.0, 100.0, parent, child);
        }
        let ts = tables.tree_sequence().unwrap();
        let err = kc_distance_ts(&ts, &single_tree_ts(), 0.0).unwrap_err();
        assert!(matches!(kind(&err), Some(TsageError::MultipleRootsError(_))));
    }

    #[test]
    fn test_no_overlap_and_unequal_samples() {
        let build = |left: f64, right: f64| {
            let mut tables = TableCollection::new(100.0);
            tables.add_node(0.0, NODE_IS_SAMPLE);
            tables.add_node(0.0, NODE_IS_SAMPLE);
            tables.add_node(1.0, 0);
            tables.add_edge(left, right, 2, 0);
            tables.add_edge(left, right, 2, 1);
            tables.tree_sequence().unwrap()
        };
        let err = kc_distance_ts(&build(0.0, 40.0), &build(60.0, 100.0), 0.0).unwrap_err();
        assert!(matches!(kind(&err), Some(TsageError::NoOverlapError)));

        assert_eq!(kc_distance_ts(&build(0.0, 60.0), &build(40.0, 100.0), 0.0).unwrap(), 0.0);

        let err = kc_distance_ts(&build(0.0, 100.0), &two_tree_ts(), 0.0).unwrap_err();
        assert!(matches!(kind(&err), Some(TsageError::UnequalSamplesError((2, 4)))));
    }

    #[test]
    fn test_get_kc_distances() {
        let (a, b) = (two_tree_ts(), single_tree_ts());
        let rows = get_kc_distances(&[&a, &a, &b], &["simulated_ts", "same", "other"], &[0.0, 1.0]).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], KcRow { method: "same".into(), lambda: 0.0, distance: 0.0 });
        assert_eq!(rows[1], KcRow { method: "other".into(), lambda: 0.0, distance: 1.0 });
        assert_eq!(rows[2].lambda, 1.0);
    }

    #[test]
    fn test_find_tmrcas_snps() {
        let (a, b) = (two_tree_ts(), single_tree_ts());
        let mut ts_map = IndexMap::new();
        ts_map.insert("simulated_ts", &a);
        ts_map.insert("other", &b);

        let mut rng = StdRng::seed_from_u64(7);
        let table = find_tmrcas_snps(&ts_map, &mut rng).unwrap();
        // the single tree sequence has no sites, so nothing is comparable
        assert!(table.positions.is_empty());

        let mut ts_map = IndexMap::new();
        ts_map.insert("simulated_ts", &a);
        ts_map.insert("copy", &a);
        let table = find_tmrcas_snps(&ts_map, &mut rng).unwrap();
        assert_eq!(table.positions.len(), 1);
        assert_eq!(table.columns["simulated_ts"], table.columns["copy"]);
        assert!(table.columns["copy"][0] > 0.0);
    }
}
