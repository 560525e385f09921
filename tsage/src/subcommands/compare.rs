use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use color_eyre::{
    eyre::{ensure, OptionExt},
    Result,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::args::AgeAggregate;
use crate::io::{
    get_csv_writer, get_output, load_ts, push_to_output, read_relate_mut, write_csv_rows,
    RelateMutRow,
};
use crate::stats::{complete_pairs, mse, msle, pearson, rmsle, spearman};
use crate::structs::TreeSequence;
use crate::subcommands::tools::GevaAge;
use crate::utils::{aggregate_age, round_position};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SiteAge {
    pub position: f64,
    pub age: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MutationAge {
    pub position: f64,
    pub node: usize,
    pub age: f64,
    pub upper_bound: f64,
}

fn node_times(ts: &TreeSequence, dates: Option<&[f64]>) -> Result<Vec<f64>> {
    match dates {
        Some(dates) => {
            ensure!(
                dates.len() == ts.num_nodes(),
                "Got {} node dates for {} nodes",
                dates.len(),
                ts.num_nodes()
            );
            Ok(dates.to_vec())
        }
        None => Ok(ts.node_times()),
    }
}

// Visit every mutation with the times of its node and of its parent in the local tree
fn visit_mutations<F>(
    ts: &TreeSequence,
    dates: Option<&[f64]>,
    exclude_root: bool,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(usize, usize, f64, f64),
{
    let times = node_times(ts, dates)?;
    let oldest = times.iter().copied().fold(0.0, f64::max);

    let mut trees = ts.trees();
    while let Some(tree) = trees.next_tree() {
        for site in tree.sites() {
            for &m in ts.site_mutations(site) {
                let node = ts.mutations()[m].node;
                let parent = tree.parent(node);
                if exclude_root && parent.map_or(true, |p| tree.is_root(p)) {
                    continue;
                }
                let parent_time = parent.map_or(oldest, |p| times[p]);
                visit(site, node, times[node], parent_time);
            }
        }
    }
    Ok(())
}

/// Age of every site carrying at least one counted mutation, the oldest mutation wins
pub fn get_mut_ages(
    ts: &TreeSequence,
    dates: Option<&[f64]>,
    exclude_root: bool,
    aggregate: AgeAggregate,
) -> Result<Vec<SiteAge>> {
    let mut ages: BTreeMap<usize, f64> = BTreeMap::new();
    visit_mutations(ts, dates, exclude_root, |site, _, lower, upper| {
        let age = aggregate_age(lower, upper, aggregate);
        ages.entry(site)
            .and_modify(|a| *a = a.max(age))
            .or_insert(age);
    })?;

    let sites = ts.sites();
    Ok(ages
        .into_iter()
        .map(|(site, age)| SiteAge {
            position: sites[site].position,
            age,
        })
        .collect())
}

/// Midpoint age of every mutation together with the time of its parent node
pub fn get_mut_ages_with_bounds(
    ts: &TreeSequence,
    dates: Option<&[f64]>,
    exclude_root: bool,
) -> Result<Vec<MutationAge>> {
    let sites = ts.sites();
    let mut ages = Vec::with_capacity(ts.num_mutations());
    visit_mutations(ts, dates, exclude_root, |site, node, lower, upper| {
        ages.push(MutationAge {
            position: sites[site].position,
            node,
            age: (lower + upper) / 2.0,
            upper_bound: upper,
        })
    })?;
    Ok(ages)
}

/// Key ages by rounded position.
///
/// Rows are ordered by age descending, then by exact position ascending, and the first row
/// landing on each rounded position is kept.
pub fn align_ages(ages: &[SiteAge]) -> BTreeMap<i64, f64> {
    let mut sorted = ages.to_vec();
    sorted.sort_by(|a, b| {
        b.age
            .total_cmp(&a.age)
            .then(a.position.total_cmp(&b.position))
    });

    let mut aligned = BTreeMap::new();
    for row in sorted {
        aligned.entry(round_position(row.position)).or_insert(row.age);
    }
    aligned
}

pub fn relate_site_ages(rows: &[RelateMutRow]) -> Vec<SiteAge> {
    rows.iter()
        .map(|r| SiteAge {
            position: r.pos_of_snp,
            age: r.age(),
        })
        .collect()
}

pub fn geva_site_ages(rows: &[GevaAge]) -> Vec<SiteAge> {
    rows.iter()
        .map(|r| SiteAge {
            position: r.position,
            age: r.age,
        })
        .collect()
}

/// Ages of several methods joined on rounded position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComparisonTable {
    columns: IndexMap<String, BTreeMap<i64, f64>>,
}

impl ComparisonTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, ages: BTreeMap<i64, f64>) {
        self.columns.insert(name.into(), ages);
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.keys().map(|k| k.as_str()).collect()
    }

    /// Union of the positions of all columns
    pub fn positions(&self) -> Vec<i64> {
        self.columns
            .values()
            .flat_map(|c| c.keys().copied())
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let column = self.columns.get(name)?;
        Some(
            self.positions()
                .iter()
                .map(|p| column.get(p).copied())
                .collect(),
        )
    }

    pub fn header(&self) -> Vec<String> {
        std::iter::once("position".to_string())
            .chain(self.columns.keys().cloned())
            .collect()
    }

    pub fn records(&self) -> Vec<Vec<String>> {
        self.positions()
            .into_iter()
            .map(|p| {
                std::iter::once(p.to_string())
                    .chain(
                        self.columns
                            .values()
                            .map(|c| c.get(&p).map_or(String::new(), |a| a.to_string())),
                    )
                    .collect()
            })
            .collect()
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wrtr = get_csv_writer(get_output(Some(path.to_path_buf()))?);
        wrtr.write_record(self.header())?;
        for record in self.records() {
            wrtr.write_record(record)?;
        }
        wrtr.flush()?;
        Ok(())
    }
}

/// Join per-site ages of every genealogy with optional Relate and GEVA estimates.
///
/// The first genealogy is the ground truth, external estimates are restricted to its
/// rounded mutation positions.
pub fn compare_mutations(
    names: &[&str],
    ts_list: &[&TreeSequence],
    relate: Option<&[RelateMutRow]>,
    geva: Option<&[GevaAge]>,
    exclude_root: bool,
    aggregate: AgeAggregate,
) -> Result<ComparisonTable> {
    ensure!(
        names.len() == ts_list.len(),
        "Got {} method names for {} tree sequences",
        names.len(),
        ts_list.len()
    );
    let truth = ts_list
        .first()
        .ok_or_eyre("At least one tree sequence is needed for comparison")?;

    let mut table = ComparisonTable::new();
    for (name, ts) in names.iter().zip(ts_list) {
        let ages = get_mut_ages(ts, None, exclude_root, aggregate)?;
        table.insert(*name, align_ages(&ages));
    }

    let true_positions = truth
        .mutations()
        .iter()
        .map(|m| round_position(truth.sites()[m.site].position))
        .collect::<BTreeSet<i64>>();
    let restrict = |ages: Vec<SiteAge>| {
        let mut aligned = align_ages(&ages);
        aligned.retain(|p, _| true_positions.contains(p));
        aligned
    };

    if let Some(relate) = relate {
        table.insert("relate", restrict(relate_site_ages(relate)));
    }
    if let Some(geva) = geva {
        table.insert("geva", restrict(geva_site_ages(geva)));
    }

    Ok(table)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRow {
    pub method: String,
    pub n: usize,
    pub mse: f64,
    pub msle: f64,
    pub rmsle: f64,
    pub pearson: f64,
    pub spearman: f64,
}

/// Error and correlation of each column against the reference over complete rows
pub fn summarize(table: &ComparisonTable, reference: &str) -> Result<Vec<AccuracyRow>> {
    let truth = table
        .column(reference)
        .ok_or_eyre(format!("No column named {reference} in the comparison"))?;

    let mut rows = Vec::new();
    for name in table.names().into_iter().filter(|n| *n != reference) {
        let estimate = table.column(name).unwrap_or_default();
        let (x, y) = complete_pairs(&truth, &estimate);
        if x.len() < 2 {
            tracing::warn!("Skipping {name}: only {} ages overlap with {reference}", x.len());
            continue;
        }
        rows.push(AccuracyRow {
            method: name.to_string(),
            n: x.len(),
            mse: mse(&x, &y)?,
            msle: msle(&x, &y)?,
            rmsle: rmsle(&x, &y)?,
            pearson: pearson(&x, &y)?,
            spearman: spearman(&x, &y)?,
        });
    }
    Ok(rows)
}

#[tracing::instrument(skip_all)]
pub fn run_mutation_ages(
    file: PathBuf,
    output: PathBuf,
    prefix: Option<String>,
    exclude_root: bool,
    aggregate: AgeAggregate,
    with_bounds: bool,
) -> Result<()> {
    let ts = load_ts(&file)?;
    let mut path = output;
    push_to_output(&prefix, &mut path, "mutation_ages", "csv");

    match with_bounds {
        true => {
            let ages = get_mut_ages_with_bounds(&ts, None, exclude_root)?;
            tracing::info!("Dated {} mutations", ages.len());
            write_csv_rows(&path, &ages)?;
        }
        false => {
            let ages = get_mut_ages(&ts, None, exclude_root, aggregate)?;
            tracing::info!("Dated {} of {} sites", ages.len(), ts.num_sites());
            write_csv_rows(&path, &ages)?;
        }
    }

    tracing::info!("Wrote {path:?}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(skip_all)]
pub fn run(
    files: Vec<PathBuf>,
    names: Option<Vec<String>>,
    relate_mut: Option<PathBuf>,
    output: PathBuf,
    prefix: Option<String>,
    exclude_root: bool,
    aggregate: AgeAggregate,
) -> Result<()> {
    let ts_list = files
        .iter()
        .map(|f| load_ts(f))
        .collect::<Result<Vec<TreeSequence>>>()?;

    let names = match names {
        Some(names) => names,
        None => files
            .iter()
            .enumerate()
            .map(|(i, f)| match i {
                0 => "simulated_ts".to_string(),
                _ => f
                    .file_stem()
                    .map_or(format!("method_{i}"), |s| s.to_string_lossy().into_owned()),
            })
            .collect(),
    };
    let relate = relate_mut.as_deref().map(read_relate_mut).transpose()?;

    let table = compare_mutations(
        &names.iter().map(|n| n.as_str()).collect::<Vec<&str>>(),
        &ts_list.iter().collect::<Vec<&TreeSequence>>(),
        relate.as_deref(),
        None,
        exclude_root,
        aggregate,
    )?;

    let mut path = output.clone();
    push_to_output(&prefix, &mut path, "compare_ages", "csv");
    table.write_csv(&path)?;
    tracing::info!("Wrote {path:?}");

    let summary = summarize(&table, &names[0])?;
    for row in &summary {
        tracing::info!(
            "{}: n={} MSLE={:.4} pearson={:.4} spearman={:.4}",
            row.method,
            row.n,
            row.msle,
            row.pearson,
            row.spearman
        );
    }
    let mut path = output;
    push_to_output(&prefix, &mut path, "compare_ages_summary", "csv");
    write_csv_rows(&path, &summary)?;
    tracing::info!("Wrote {path:?}");

    Ok(())
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;
    use crate::structs::fixtures::{two_tree_tables, two_tree_ts};

    #[test]
    fn test_get_mut_ages() {
        let ts = two_tree_ts();
        let ages = get_mut_ages(&ts, None, false, AgeAggregate::Arithmetic).unwrap();
        assert_eq!(ages, vec![
            SiteAge { position: 10.0, age: 2.0 },
            SiteAge { position: 60.0, age: 2.5 },
            SiteAge { position: 70.4, age: 1.5 },
        ]);

        // every mutation in the fixture sits directly below the root
        let ages = get_mut_ages(&ts, None, true, AgeAggregate::Arithmetic).unwrap();
        assert!(ages.is_empty());
    }

    #[test]
    fn test_exclude_root_keeps_inner_branches() {
        let mut tables = two_tree_tables();
        let s = tables.add_site(20.0, "0");
        tables.add_mutation(s, 0, "1");
        tables.sort();
        let ts = tables.tree_sequence().unwrap();

        let ages = get_mut_ages(&ts, None, true, AgeAggregate::Arithmetic).unwrap();
        assert_eq!(ages, vec![SiteAge { position: 20.0, age: 0.5 }]);

        let ages = get_mut_ages(&ts, None, true, AgeAggregate::Geometric).unwrap();
        assert_eq!(ages, vec![SiteAge { position: 20.0, age: 0.0 }]);
    }

    #[test]
    fn test_site_age_is_independent_of_mutation_order() {
        let build = |nodes: [usize; 2]| {
            let mut tables = two_tree_tables();
            let s = tables.add_site(30.0, "0");
            tables.add_mutation(s, nodes[0], "1");
            tables.add_mutation(s, nodes[1], "2");
            tables.sort();
            tables.tree_sequence().unwrap()
        };
        let a = get_mut_ages(&build([0, 5]), None, false, AgeAggregate::Arithmetic).unwrap();
        let b = get_mut_ages(&build([5, 0]), None, false, AgeAggregate::Arithmetic).unwrap();
        assert_eq!(a, b);
        assert!(a.contains(&SiteAge { position: 30.0, age: 2.5 }));
    }

    #[test]
    fn test_dates_override_node_times() {
        let ts = two_tree_ts();
        let dates = [0.0, 0.0, 0.0, 0.0, 10.0, 20.0, 30.0];
        let ages = get_mut_ages(&ts, Some(&dates), false, AgeAggregate::Arithmetic).unwrap();
        assert_eq!(ages[0].age, 20.0);
        assert!(get_mut_ages(&ts, Some(&dates[..3]), false, AgeAggregate::Arithmetic).is_err());
    }

    #[test]
    fn test_mutation_above_root_uses_oldest_node() {
        let mut tables = two_tree_tables();
        let s = tables.add_site(40.0, "0");
        tables.add_mutation(s, 6, "1");
        tables.sort();
        let ts = tables.tree_sequence().unwrap();

        let ages = get_mut_ages_with_bounds(&ts, None, false).unwrap();
        let above_root = ages.iter().find(|a| a.node == 6).unwrap();
        assert_eq!(above_root.age, 3.0);
        assert_eq!(above_root.upper_bound, 3.0);
        assert!(get_mut_ages_with_bounds(&ts, None, true).unwrap().iter().all(|a| a.node != 6));
    }

    #[test]
    fn test_align_ages_tie_break() {
        let ages = [
            SiteAge { position: 10.4, age: 1.0 },
            SiteAge { position: 9.6, age: 3.0 },
            SiteAge { position: 10.2, age: 3.0 },
            SiteAge { position: 12.5, age: 7.0 },
        ];
        let aligned = align_ages(&ages);
        // equal ages fall back to the smaller exact position
        assert_eq!(aligned.get(&10), Some(&3.0));
        assert_eq!(aligned.get(&12), Some(&7.0));
        assert_eq!(aligned.len(), 2);

        let mut reversed = ages.to_vec();
        reversed.reverse();
        assert_eq!(align_ages(&reversed), aligned);
    }

    #[test]
    fn test_compare_mutations() {
        let ts = two_tree_ts();
        let relate = vec![
            RelateMutRow { snp: 0, pos_of_snp: 10.0, tree_index: 0, branch_indices: "4".into(), is_not_mapping: 0, age_begin: 1.0, age_end: 3.0, ancestral_allele: "A".into(), alternative_allele: "T".into() },
            RelateMutRow { snp: 1, pos_of_snp: 55.0, tree_index: 0, branch_indices: "5".into(), is_not_mapping: 0, age_begin: 1.0, age_end: 2.0, ancestral_allele: "A".into(), alternative_allele: "T".into() },
        ];
        let geva = vec![GevaAge { position: 70.0, age: 1.0 }];
        let table = compare_mutations(&["simulated_ts", "tsdate"], &[&ts, &ts], Some(relate.as_slice()), Some(geva.as_slice()), false, AgeAggregate::Arithmetic).unwrap();

        assert_eq!(table.names(), vec!["simulated_ts", "tsdate", "relate", "geva"]);
        assert_eq!(table.positions(), vec![10, 60, 70]);
        assert_eq!(table.column("relate").unwrap(), vec![Some(2.0), None, None]);
        assert_eq!(table.column("geva").unwrap(), vec![None, None, Some(1.0)]);
        assert_eq!(table.records()[0], vec!["10", "2", "2", "2", ""]);

        let summary = summarize(&table, "simulated_ts").unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].method, "tsdate");
        assert_eq!(summary[0].mse, 0.0);
    }
}
