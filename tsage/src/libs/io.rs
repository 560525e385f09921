use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use color_eyre::eyre::{ensure, eyre, OptionExt, WrapErr};
use color_eyre::Result;
use csv::{QuoteStyle, Reader, ReaderBuilder, Writer, WriterBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::structs::{TableCollection, TreeSequence};
use crate::utils::strip_prefix;

pub fn read_lines<P>(filename: P) -> Result<io::Lines<io::BufReader<File>>>
where
    P: AsRef<Path>,
{
    let name = filename.as_ref().display();
    let file = match File::open(&filename) {
        Ok(x) => x,
        Err(err) => {
            let msg = format!("failed to open {name}: {err}");
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, msg))?;
        }
    };
    Ok(io::BufReader::new(file).lines())
}

pub fn push_to_output(prefix: &Option<String>, output: &mut PathBuf, name: &str, suffix: &str) {
    match &strip_prefix(prefix.clone()) {
        Some(prefix) => output.push(format!("{prefix}_{name}.{suffix}")),
        None => output.push(format!("{name}.{suffix}")),
    }
}

pub fn get_csv_reader<R: io::Read>(input: R) -> Reader<R> {
    ReaderBuilder::new()
        .delimiter(b',')
        .has_headers(true)
        .flexible(false)
        .from_reader(input)
}

// Relate and GEVA tables may carry trailing delimiters or ragged rows
pub fn get_delimited_reader<R: io::Read>(input: R, delimiter: u8) -> Reader<R> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input)
}

pub fn get_csv_writer<W: io::Write>(output: W) -> Writer<W> {
    WriterBuilder::new()
        .delimiter(b',')
        .has_headers(false)
        .flexible(true)
        .from_writer(output)
}

pub fn get_space_writer<W: io::Write>(output: W) -> Writer<W> {
    WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .quote_style(QuoteStyle::Never)
        .from_writer(output)
}

pub fn get_vcf_writer<W: io::Write>(output: W) -> Writer<W> {
    WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .double_quote(false)
        .quote_style(QuoteStyle::Never)
        .from_writer(output)
}

pub fn get_input(filename: Option<PathBuf>) -> Result<Box<dyn io::Read>> {
    let input: Box<dyn io::Read> = match filename {
        Some(name) => match name.to_str() {
            Some("-") => Box::new(io::stdin()),
            Some(name) => {
                let r = match niffler::from_path(name) {
                    Ok(x) => x.0,
                    Err(err) => {
                        let msg = format!("failed to open \"{name}\": {err}");
                        return Err(eyre!(msg))?;
                    }
                };
                Box::new(r)
            }
            None => return Err(eyre!("Unknown I/O error")),
        },
        None => Box::new(io::stdin()),
    };
    Ok(input)
}

pub fn get_output(filename: Option<PathBuf>) -> Result<Box<dyn io::Write>> {
    let output: Box<dyn io::Write> = match filename {
        Some(name) => match name.to_str() {
            Some("-") => Box::new(io::stdout()),
            Some(name) => Box::new(
                match std::fs::File::options()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(name)
                {
                    Ok(x) => x,
                    Err(err) => return Err(eyre!("failed to open \"{name}\": {err}"))?,
                },
            ),
            None => return Err(eyre!("Unknown I/O error")),
        },
        None => Box::new(io::stdout()),
    };
    Ok(output)
}

pub fn append_ext(ext: impl AsRef<OsStr>, path: &Path) -> PathBuf {
    let mut os_string: OsString = path.into();
    os_string.push(".");
    os_string.push(ext.as_ref());
    os_string.into()
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let input = get_input(Some(path.to_path_buf()))?;
    serde_json::from_reader(io::BufReader::new(input))
        .wrap_err(eyre!("Failed to parse JSON from {}", path.display()))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut output = BufWriter::new(get_output(Some(path.to_path_buf()))?);
    serde_json::to_writer(&mut output, value)?;
    output.flush()?;
    Ok(())
}

pub fn dump_ts(ts: &TreeSequence, path: &Path) -> Result<()> {
    write_json(path, ts.tables())
}

pub fn load_ts(path: &Path) -> Result<TreeSequence> {
    let tables: TableCollection = read_json(path)?;
    tables
        .tree_sequence()
        .wrap_err(eyre!("Invalid tree sequence in {}", path.display()))
}

/// Write serializable rows to a CSV file with a header row
pub fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(true)
        .from_writer(get_output(Some(path.to_path_buf()))?);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_csv_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = get_csv_reader(get_input(Some(path.to_path_buf()))?);
    rdr.deserialize()
        .map(|r| r.wrap_err(eyre!("Invalid row in {}", path.display())))
        .collect()
}

/// Row of the empirical genotyping error matrix
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct ErrorMatrixRow {
    pub freq: f64,
    pub p00: f64,
    pub p01: f64,
    pub p02: f64,
    pub p10: f64,
    pub p11: f64,
    pub p12: f64,
    pub p20: f64,
    pub p21: f64,
    pub p22: f64,
}

pub fn read_error_matrix(path: &Path) -> Result<Vec<ErrorMatrixRow>> {
    let rows: Vec<ErrorMatrixRow> = read_csv_rows(path)?;
    ensure!(!rows.is_empty(), "Error matrix {} has no rows", path.display());
    Ok(rows)
}

/// Row of a Relate `.mut` file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelateMutRow {
    pub snp: usize,
    pub pos_of_snp: f64,
    pub tree_index: usize,
    pub branch_indices: String,
    pub is_not_mapping: u8,
    pub age_begin: f64,
    pub age_end: f64,
    #[serde(default)]
    pub ancestral_allele: String,
    #[serde(default)]
    pub alternative_allele: String,
}

impl RelateMutRow {
    pub fn age(&self) -> f64 {
        (self.age_begin + self.age_end) / 2.0
    }

    // Relate lists every branch a mutation maps to, the first is its placement
    pub fn branch(&self) -> Option<usize> {
        self.branch_indices
            .split_whitespace()
            .next()
            .and_then(|b| b.parse::<usize>().ok())
    }
}

pub fn read_relate_mut(path: &Path) -> Result<Vec<RelateMutRow>> {
    let mut rdr = get_delimited_reader(get_input(Some(path.to_path_buf()))?, b';');
    rdr.deserialize()
        .map(|r| r.wrap_err(eyre!("Invalid row in Relate output {}", path.display())))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelateTree {
    pub first_snp: usize,
    pub parents: Vec<Option<usize>>,
    pub branch_lengths: Vec<f64>,
}

/// Parse a Relate `.anc` file into its haplotype count and local trees
pub fn read_relate_anc(path: &Path) -> Result<(usize, Vec<RelateTree>)> {
    let mut lines = read_lines(path)?;

    let header = lines
        .next()
        .ok_or_eyre("Relate .anc file is empty")??;
    let n = header
        .split_whitespace()
        .nth(1)
        .ok_or_eyre("Relate .anc file is missing NUM_HAPLOTYPES")?
        .parse::<usize>()?;
    let num_trees = lines
        .next()
        .ok_or_eyre("Relate .anc file is missing NUM_TREES")??
        .split_whitespace()
        .nth(1)
        .ok_or_eyre("Relate .anc file is missing NUM_TREES")?
        .parse::<usize>()?;

    let mut trees = Vec::with_capacity(num_trees);
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        trees.push(parse_relate_tree(&line, n)?);
    }
    ensure!(
        trees.len() == num_trees,
        "Relate .anc file declares {num_trees} trees but contains {}",
        trees.len()
    );

    Ok((n, trees))
}

// "snp: parent:(branch_length num_mutations snp_begin snp_end) ..."
fn parse_relate_tree(line: &str, n: usize) -> Result<RelateTree> {
    ensure!(n > 0, "Relate output has no haplotypes");
    let (snp, rest) = line
        .split_once(':')
        .ok_or_eyre("Relate tree line is missing the SNP index")?;
    let first_snp = snp.trim().parse::<usize>()?;

    let mut parents = Vec::with_capacity(2 * n - 1);
    let mut branch_lengths = Vec::with_capacity(2 * n - 1);
    for node in rest.split(')').filter(|s| !s.trim().is_empty()) {
        let (parent, values) = node
            .split_once(":(")
            .ok_or_eyre("Malformed node in Relate tree line")?;
        let parent = parent.trim().parse::<i64>()?;
        let branch_length = values
            .split_whitespace()
            .next()
            .ok_or_eyre("Missing branch length in Relate tree line")?
            .parse::<f64>()?;
        parents.push(usize::try_from(parent).ok());
        branch_lengths.push(branch_length);
    }
    ensure!(
        parents.len() == 2 * n - 1,
        "Relate tree at SNP {first_snp} has {} nodes, expected {}",
        parents.len(),
        2 * n - 1
    );

    Ok(RelateTree {
        first_snp,
        parents,
        branch_lengths,
    })
}

/// Assemble Relate's local trees and mutations into a tree sequence.
///
/// Leaves are shared between trees and flagged as the first `n` sample nodes, internal
/// nodes are created per local tree. Tree `k` spans from its first SNP up to the first
/// SNP of tree `k + 1`, the first tree starts at 0 and the last ends at `sequence_length`.
/// The sequence is extended to one past the last SNP when legacy positions were bumped
/// beyond `sequence_length`.
pub fn relate_to_tree_sequence(
    n: usize,
    trees: &[RelateTree],
    mutations: &[RelateMutRow],
    sequence_length: f64,
) -> Result<TreeSequence> {
    ensure!(!trees.is_empty(), "Relate output contains no trees");
    let extended = mutations
        .iter()
        .map(|m| m.pos_of_snp + 1.0)
        .fold(sequence_length, f64::max);
    if extended > sequence_length {
        tracing::debug!("Extending the Relate genealogy from {sequence_length} to {extended}");
    }
    let sequence_length = extended;

    let mut tables = TableCollection::new(sequence_length);
    for _ in 0..n {
        tables.add_node(0.0, 0);
    }

    let position_of = |snp: usize| -> Result<f64> {
        mutations
            .get(snp)
            .map(|m| m.pos_of_snp)
            .ok_or_eyre("Relate tree refers to a SNP missing from the .mut file")
    };

    let mut node_maps = Vec::with_capacity(trees.len());
    for (k, tree) in trees.iter().enumerate() {
        let left = match k {
            0 => 0.0,
            _ => position_of(tree.first_snp)?,
        };
        let right = match trees.get(k + 1) {
            Some(next) => position_of(next.first_snp)?,
            None => sequence_length,
        };
        ensure!(left < right, "Relate tree {k} spans an empty interval");

        let num_nodes = tree.parents.len();
        let mut times = vec![0.0; num_nodes];
        // Relate numbers nodes so that parents follow their children
        for u in 0..num_nodes {
            if let Some(p) = tree.parents[u] {
                ensure!(p > u && p < num_nodes, "Relate node {u} has invalid parent {p}");
                let t = times[u] + tree.branch_lengths[u];
                // Zero-length branches are nudged to keep parents strictly older
                times[p] = f64::max(times[p], t.max(times[u] + 1e-8));
            }
        }

        let mut ids = (0..n).collect::<Vec<usize>>();
        for &t in &times[n..] {
            ids.push(tables.add_node(t, 0));
        }
        for (u, p) in tree.parents.iter().enumerate() {
            if let Some(p) = p {
                tables.add_edge(left, right, ids[*p], ids[u]);
            }
        }
        node_maps.push(ids);
    }

    for m in mutations {
        if m.is_not_mapping != 0 {
            continue;
        }
        let (Some(branch), Some(ids)) = (m.branch(), node_maps.get(m.tree_index)) else {
            continue;
        };
        let Some(&node) = ids.get(branch) else {
            continue;
        };
        let ancestral = match m.ancestral_allele.as_str() {
            "" => "0",
            a => a,
        };
        let derived = match m.alternative_allele.as_str() {
            "" => "1",
            a => a,
        };
        let site = tables.add_site(m.pos_of_snp, ancestral);
        tables.add_mutation(site, node, derived);
    }

    tables.set_sample_flags(n);
    tables.squash_edges();
    tables.tree_sequence()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GevaMarker {
    #[serde(rename = "MarkerID")]
    pub marker_id: usize,
    #[serde(rename = "Position")]
    pub position: f64,
}

pub fn read_geva_markers(path: &Path) -> Result<Vec<GevaMarker>> {
    let mut rdr = get_delimited_reader(get_input(Some(path.to_path_buf()))?, b' ');
    rdr.deserialize()
        .map(|r| r.wrap_err(eyre!("Invalid row in GEVA markers {}", path.display())))
        .collect()
}

/// Positions to estimate with GEVA, every marker but the first and the last
pub fn write_geva_positions(markers: &[GevaMarker], path: &Path) -> Result<()> {
    let mut output = BufWriter::new(get_output(Some(path.to_path_buf()))?);
    if markers.len() > 2 {
        for marker in &markers[1..markers.len() - 1] {
            writeln!(output, "{}", marker.position)?;
        }
    }
    output.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GevaSite {
    #[serde(rename = "MarkerID")]
    pub marker_id: usize,
    #[serde(rename = "Clock")]
    pub clock: String,
    #[serde(rename = "Filtered")]
    pub filtered: u8,
    #[serde(rename = "PostMean")]
    pub post_mean: f64,
}

/// Joint clock estimates that passed GEVA's filters
pub fn read_geva_sites(path: &Path) -> Result<Vec<GevaSite>> {
    let mut rdr = get_delimited_reader(get_input(Some(path.to_path_buf()))?, b' ');
    let sites = rdr
        .deserialize()
        .map(|r| r.wrap_err(eyre!("Invalid row in GEVA estimates {}", path.display())))
        .collect::<Result<Vec<GevaSite>>>()?;
    Ok(sites
        .into_iter()
        .filter(|s| s.clock == "J" && s.filtered == 1)
        .collect())
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;

    #[test]
    fn test_push_to_output() {
        let mut output = std::path::PathBuf::new();
        push_to_output(&None, &mut output, "mutations", "csv");
        assert_eq!(output, std::path::PathBuf::from("mutations.csv"));

        let mut output = std::path::PathBuf::from("./foo");
        push_to_output(&Some("\\0".to_string()), &mut output, "mutations", "csv");
        assert_eq!(output, std::path::PathBuf::from("./foo/mutations.csv"));

        let mut output = std::path::PathBuf::from("./foo");
        push_to_output(&Some("nice".to_string()), &mut output, "mutations", "csv");
        assert_eq!(output, std::path::PathBuf::from("./foo/nice_mutations.csv"));
    }

    #[test]
    fn test_parse_relate_tree() {
        let line = "0: 3:(1.5 0 0 1) 3:(1.5 1 0 1) 4:(4.0 0 0 1) 4:(2.5 0 0 1) -1:(0.0 0 0 1) ";
        let tree = parse_relate_tree(line, 3).unwrap();
        assert_eq!(tree.first_snp, 0);
        assert_eq!(tree.parents, vec![Some(3), Some(3), Some(4), Some(4), None]);
        assert_eq!(tree.branch_lengths, vec![1.5, 1.5, 4.0, 2.5, 0.0]);

        assert!(parse_relate_tree("0: 3:(1.5 0 0 1)", 3).is_err());
    }

    fn mut_row(snp: usize, pos: f64, tree_index: usize, branch: &str) -> RelateMutRow {
        RelateMutRow {
            snp, pos_of_snp: pos, tree_index, branch_indices: branch.into(), is_not_mapping: 0,
            age_begin: 1.0, age_end: 3.0, ancestral_allele: String::new(), alternative_allele: String::new(),
        }
    }

    #[test]
    fn test_relate_to_tree_sequence() {
        let t0 = parse_relate_tree("0: 3:(1.5 0 0 1) 3:(1.5 1 0 1) 4:(4.0 0 0 1) 4:(2.5 0 0 1) -1:(0.0 0 0 1)", 3).unwrap();
        let t1 = parse_relate_tree("2: 4:(4.0 0 0 1) 3:(1.0 1 0 1) 3:(1.0 0 0 1) 4:(3.0 0 0 1) -1:(0.0 0 0 1)", 3).unwrap();
        let muts = vec![mut_row(0, 10.0, 0, "1"), mut_row(1, 20.0, 0, "3"), mut_row(2, 60.0, 1, "2")];

        let ts = relate_to_tree_sequence(3, &[t0, t1], &muts, 100.0).unwrap();
        assert_eq!(ts.num_samples(), 3);
        assert_eq!(ts.num_trees(), 2);
        assert_eq!(ts.breakpoints(), &[0.0, 60.0, 100.0]);
        assert_eq!(ts.num_sites(), 3);
        assert_eq!(ts.max_root_time(), 4.0);
        assert_eq!(muts[0].age(), 2.0);

        let g = ts.genotype_matrix();
        assert_eq!(g.row(0).to_vec(), vec![0, 1, 0]);
        assert_eq!(g.row(1).to_vec(), vec![1, 1, 0]);
        assert_eq!(g.row(2).to_vec(), vec![0, 0, 1]);
    }

    #[test]
    fn test_relate_positions_past_sequence_end() {
        let t0 = parse_relate_tree("0: 3:(1.5 0 0 1) 3:(1.5 1 0 1) 4:(4.0 0 0 1) 4:(2.5 0 0 1) -1:(0.0 0 0 1)", 3).unwrap();
        let t1 = parse_relate_tree("1: 4:(4.0 0 0 1) 3:(1.0 1 0 1) 3:(1.0 0 0 1) 4:(3.0 0 0 1) -1:(0.0 0 0 1)", 3).unwrap();
        // Legacy positions bumped 99.6 and 99.8 onto 100 and 101
        let muts = vec![mut_row(0, 50.0, 0, "1"), mut_row(1, 100.0, 1, "2"), mut_row(2, 101.0, 1, "3")];

        let ts = relate_to_tree_sequence(3, &[t0, t1], &muts, 100.0).unwrap();
        assert_eq!(ts.sequence_length(), 102.0);
        assert_eq!(ts.breakpoints(), &[0.0, 100.0, 102.0]);
        assert_eq!(ts.site_positions(), vec![50.0, 100.0, 101.0]);
        assert_eq!(ts.samples(), &[0, 1, 2]);
        assert!(ts.nodes()[3..].iter().all(|node| !node.is_sample()));
    }

    #[test]
    fn test_relate_mut_parsing() {
        let dir = std::env::temp_dir().join("tsage_relate_mut_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.mut");
        std::fs::write(&path, "snp;pos_of_snp;dist;rs-id;tree_index;branch_indices;is_not_mapping;is_flipped;age_begin;age_end;ancestral_allele;alternative_allele;\n\
            0;10;10;snp_1;0;1;0;0;100.5;300.5;A;T;\n\
            1;25;15;snp_2;0;3 4;1;0;0;50;A;T;\n").unwrap();

        let rows = read_relate_mut(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pos_of_snp, 10.0);
        assert_eq!(rows[0].age(), 200.5);
        assert_eq!(rows[1].branch(), Some(3));
        assert_eq!(rows[1].is_not_mapping, 1);
    }

    #[test]
    fn test_geva_positions_and_sites() {
        let dir = std::env::temp_dir().join("tsage_geva_test");
        std::fs::create_dir_all(&dir).unwrap();

        let markers = dir.join("run.marker.txt");
        std::fs::write(&markers, "MarkerID Chromosome Position GeneticPosition\n0 1 5 0.0\n1 1 12 0.1\n2 1 30 0.2\n3 1 41 0.3\n").unwrap();
        let markers = read_geva_markers(&markers).unwrap();
        assert_eq!(markers.len(), 4);

        let positions = dir.join("run.positions.txt");
        write_geva_positions(&markers, &positions).unwrap();
        assert_eq!(std::fs::read_to_string(&positions).unwrap(), "12\n30\n");

        let sites = dir.join("run_estimation.sites.txt");
        std::fs::write(&sites, "MarkerID Clock Filtered N_Concordant N_Discordant PostMode PostMean PostMedian\n\
            1 M 1 10 10 100 110 105\n1 R 1 10 10 100 120 105\n1 J 1 10 10 100 130 105\n2 J 0 10 10 100 140 105\n").unwrap();
        let sites = read_geva_sites(&sites).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].marker_id, 1);
        assert_eq!(sites[0].post_mean, 130.0);
    }
}
