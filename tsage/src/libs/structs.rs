use std::ops::Range;

use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub const NODE_IS_SAMPLE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub time: f64,
    pub flags: u32,
}

impl Node {
    pub fn is_sample(&self) -> bool {
        self.flags & NODE_IS_SAMPLE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub left: f64,
    pub right: f64,
    pub parent: usize,
    pub child: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub position: f64,
    pub ancestral_state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub site: usize,
    pub node: usize,
    pub derived_state: String,
}

/// Mutable tables from which an immutable [`TreeSequence`] is built
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableCollection {
    pub sequence_length: f64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub sites: Vec<Site>,
    pub mutations: Vec<Mutation>,
}

impl TableCollection {
    pub fn new(sequence_length: f64) -> Self {
        Self {
            sequence_length,
            ..Default::default()
        }
    }

    pub fn add_node(&mut self, time: f64, flags: u32) -> usize {
        self.nodes.push(Node { time, flags });
        self.nodes.len() - 1
    }

    pub fn add_edge(&mut self, left: f64, right: f64, parent: usize, child: usize) -> usize {
        self.edges.push(Edge {
            left,
            right,
            parent,
            child,
        });
        self.edges.len() - 1
    }

    pub fn add_site(&mut self, position: f64, ancestral_state: &str) -> usize {
        self.sites.push(Site {
            position,
            ancestral_state: ancestral_state.to_string(),
        });
        self.sites.len() - 1
    }

    pub fn add_mutation(&mut self, site: usize, node: usize, derived_state: &str) -> usize {
        self.mutations.push(Mutation {
            site,
            node,
            derived_state: derived_state.to_string(),
        });
        self.mutations.len() - 1
    }

    /// Sort edges by parent time and sites by position, carrying mutations along
    pub fn sort(&mut self) {
        let nodes = &self.nodes;
        let time = |u: usize| nodes.get(u).map_or(f64::NAN, |n| n.time);
        self.edges.sort_by(|a, b| {
            time(a.parent)
                .total_cmp(&time(b.parent))
                .then(a.parent.cmp(&b.parent))
                .then(a.child.cmp(&b.child))
                .then(a.left.total_cmp(&b.left))
        });

        let mut order = (0..self.sites.len()).collect::<Vec<usize>>();
        order.sort_by(|&a, &b| {
            self.sites[a]
                .position
                .total_cmp(&self.sites[b].position)
        });
        let mut remap = vec![0; self.sites.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }
        let sites = order.iter().map(|&i| self.sites[i].clone()).collect();
        self.sites = sites;

        for m in self.mutations.iter_mut() {
            if let Some(&new) = remap.get(m.site) {
                m.site = new;
            }
        }
        self.mutations.sort_by_key(|m| m.site);
    }

    /// Merge edges with the same parent and child over adjacent intervals
    pub fn squash_edges(&mut self) {
        self.edges.sort_by(|a, b| {
            a.parent
                .cmp(&b.parent)
                .then(a.child.cmp(&b.child))
                .then(a.left.total_cmp(&b.left))
        });

        let mut squashed: Vec<Edge> = Vec::with_capacity(self.edges.len());
        for edge in self.edges.drain(..) {
            match squashed.last_mut() {
                Some(last)
                    if last.parent == edge.parent
                        && last.child == edge.child
                        && last.right == edge.left =>
                {
                    last.right = edge.right
                }
                _ => squashed.push(edge),
            }
        }
        self.edges = squashed;
        self.sort();
    }

    /// Mark the first `n` nodes as samples and clear the flag from the rest
    pub fn set_sample_flags(&mut self, n: usize) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            if i < n {
                node.flags |= NODE_IS_SAMPLE;
            } else {
                node.flags &= !NODE_IS_SAMPLE;
            }
        }
    }

    pub fn delete_sites(&mut self, ids: &[usize]) {
        let mut keep = vec![true; self.sites.len()];
        for &id in ids {
            if let Some(k) = keep.get_mut(id) {
                *k = false;
            }
        }
        self.retain_sites(&keep);
    }

    fn retain_sites(&mut self, keep: &[bool]) {
        let mut remap = vec![None; self.sites.len()];
        let mut next = 0;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                remap[i] = Some(next);
                next += 1;
            }
        }

        let mut i = 0;
        self.sites.retain(|_| {
            i += 1;
            keep[i - 1]
        });

        self.mutations = self
            .mutations
            .drain(..)
            .filter_map(|mut m| {
                m.site = remap.get(m.site).copied().flatten()?;
                Some(m)
            })
            .collect();
    }

    /// Restrict edges and sites to the given sorted, non-overlapping intervals
    pub fn keep_intervals(&mut self, intervals: &[(f64, f64)]) -> Result<()> {
        ensure!(!intervals.is_empty(), "No intervals to keep");
        let mut last = 0.0;
        for &(left, right) in intervals {
            ensure!(
                left >= last && left < right && right <= self.sequence_length,
                "Intervals must be sorted, non-overlapping and within [0, {}]: ({left}, {right})",
                self.sequence_length
            );
            last = right;
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            for &(left, right) in intervals {
                let l = edge.left.max(left);
                let r = edge.right.min(right);
                if l < r {
                    edges.push(Edge {
                        left: l,
                        right: r,
                        ..*edge
                    });
                }
            }
        }
        self.edges = edges;

        let keep = self
            .sites
            .iter()
            .map(|s| {
                intervals
                    .iter()
                    .any(|&(l, r)| s.position >= l && s.position < r)
            })
            .collect::<Vec<bool>>();
        self.retain_sites(&keep);
        self.sort();

        Ok(())
    }

    /// Remove the empty flanks without edges and shift coordinates to start at zero
    pub fn trim(&mut self) -> Result<()> {
        ensure!(!self.edges.is_empty(), "Cannot trim a tree sequence without edges");

        let left = self
            .edges
            .iter()
            .map(|e| e.left)
            .fold(f64::INFINITY, f64::min);
        let right = self
            .edges
            .iter()
            .map(|e| e.right)
            .fold(f64::NEG_INFINITY, f64::max);

        let keep = self
            .sites
            .iter()
            .map(|s| s.position >= left && s.position < right)
            .collect::<Vec<bool>>();
        self.retain_sites(&keep);

        for edge in self.edges.iter_mut() {
            edge.left -= left;
            edge.right -= left;
        }
        for site in self.sites.iter_mut() {
            site.position -= left;
        }
        self.sequence_length = right - left;

        Ok(())
    }

    /// Build the indexed tree sequence, checking the table invariants
    pub fn tree_sequence(mut self) -> Result<TreeSequence> {
        let l = self.sequence_length;
        ensure!(l > 0.0, "Sequence length must be positive, got {l}");

        self.sort();

        let n_nodes = self.nodes.len();
        let mut child_intervals = vec![Vec::new(); n_nodes];
        for e in &self.edges {
            ensure!(
                e.parent < n_nodes && e.child < n_nodes,
                "Edge refers to a node out of bounds: {e:?}"
            );
            ensure!(
                0.0 <= e.left && e.left < e.right && e.right <= l,
                "Edge interval out of bounds of [0, {l}): {e:?}"
            );
            ensure!(
                self.nodes[e.parent].time > self.nodes[e.child].time,
                "Parent time must be greater than child time: {e:?}"
            );
            child_intervals[e.child].push((e.left, e.right));
        }
        for (child, intervals) in child_intervals.iter_mut().enumerate() {
            intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
            for w in intervals.windows(2) {
                ensure!(
                    w[0].1 <= w[1].0,
                    "Node {child} has more than one parent over [{}, {})",
                    w[1].0,
                    w[0].1
                );
            }
        }

        for w in self.sites.windows(2) {
            ensure!(
                w[0].position < w[1].position,
                "Site positions must be unique and sorted: {} {}",
                w[0].position,
                w[1].position
            );
        }
        if let Some(site) = self.sites.iter().find(|s| s.position < 0.0 || s.position >= l) {
            return Err(eyre!(
                "Site position {} out of bounds of [0, {l})",
                site.position
            ));
        }

        let mut site_mutations = vec![Vec::new(); self.sites.len()];
        for (i, m) in self.mutations.iter().enumerate() {
            ensure!(
                m.site < self.sites.len() && m.node < n_nodes,
                "Mutation refers to a site or node out of bounds: {m:?}"
            );
            site_mutations[m.site].push(i);
        }

        let time = |u: usize| self.nodes[u].time;
        let edges = &self.edges;

        let mut insertion = (0..edges.len()).collect::<Vec<usize>>();
        insertion.sort_by(|&a, &b| {
            let (a, b) = (&edges[a], &edges[b]);
            a.left
                .total_cmp(&b.left)
                .then(time(a.parent).total_cmp(&time(b.parent)))
                .then(a.parent.cmp(&b.parent))
                .then(a.child.cmp(&b.child))
        });

        let mut removal = (0..edges.len()).collect::<Vec<usize>>();
        removal.sort_by(|&a, &b| {
            let (a, b) = (&edges[a], &edges[b]);
            a.right
                .total_cmp(&b.right)
                .then(time(b.parent).total_cmp(&time(a.parent)))
                .then(b.parent.cmp(&a.parent))
                .then(b.child.cmp(&a.child))
        });

        let mut breakpoints = vec![0.0, l];
        for e in edges {
            breakpoints.push(e.left);
            breakpoints.push(e.right);
        }
        breakpoints.sort_by(f64::total_cmp);
        breakpoints.dedup();

        let samples = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_sample())
            .map(|(i, _)| i)
            .collect::<Vec<usize>>();

        let mut sample_index = vec![None; n_nodes];
        for (i, &s) in samples.iter().enumerate() {
            sample_index[s] = Some(i);
        }

        Ok(TreeSequence {
            tables: self,
            insertion,
            removal,
            breakpoints,
            samples,
            sample_index,
            site_mutations,
        })
    }
}

/// Immutable, indexed genealogy over `[0, sequence_length)`
#[derive(Debug, Clone)]
pub struct TreeSequence {
    tables: TableCollection,
    insertion: Vec<usize>,
    removal: Vec<usize>,
    breakpoints: Vec<f64>,
    samples: Vec<usize>,
    sample_index: Vec<Option<usize>>,
    site_mutations: Vec<Vec<usize>>,
}

impl TreeSequence {
    pub fn tables(&self) -> &TableCollection {
        &self.tables
    }

    pub fn dump_tables(&self) -> TableCollection {
        self.tables.clone()
    }

    pub fn sequence_length(&self) -> f64 {
        self.tables.sequence_length
    }

    pub fn nodes(&self) -> &[Node] {
        &self.tables.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.tables.edges
    }

    pub fn sites(&self) -> &[Site] {
        &self.tables.sites
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.tables.mutations
    }

    pub fn num_nodes(&self) -> usize {
        self.tables.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.tables.edges.len()
    }

    pub fn num_sites(&self) -> usize {
        self.tables.sites.len()
    }

    pub fn num_mutations(&self) -> usize {
        self.tables.mutations.len()
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn num_trees(&self) -> usize {
        self.breakpoints.len() - 1
    }

    pub fn samples(&self) -> &[usize] {
        &self.samples
    }

    pub fn sample_index(&self, u: usize) -> Option<usize> {
        self.sample_index.get(u).copied().flatten()
    }

    pub fn breakpoints(&self) -> &[f64] {
        &self.breakpoints
    }

    pub fn node_times(&self) -> Vec<f64> {
        self.tables.nodes.iter().map(|n| n.time).collect()
    }

    pub fn site_mutations(&self, site: usize) -> &[usize] {
        &self.site_mutations[site]
    }

    pub fn site_positions(&self) -> Vec<f64> {
        self.tables.sites.iter().map(|s| s.position).collect()
    }

    pub fn oldest_node_time(&self) -> f64 {
        self.tables
            .nodes
            .iter()
            .map(|n| n.time)
            .fold(0.0, f64::max)
    }

    pub fn max_root_time(&self) -> f64 {
        let mut max = 0.0_f64;
        let mut trees = self.trees();
        while let Some(tree) = trees.next_tree() {
            for root in tree.roots() {
                max = max.max(tree.time(root));
            }
        }
        max
    }

    /// Interval spanned by the edges, `None` when there are none
    pub fn covered_interval(&self) -> Option<(f64, f64)> {
        let edges = &self.tables.edges;
        if edges.is_empty() {
            return None;
        }
        let left = edges.iter().map(|e| e.left).fold(f64::INFINITY, f64::min);
        let right = edges
            .iter()
            .map(|e| e.right)
            .fold(f64::NEG_INFINITY, f64::max);
        Some((left, right))
    }

    pub fn trees(&self) -> TreeIterator<'_> {
        TreeIterator::new(self)
    }

    pub fn keep_intervals(&self, intervals: &[(f64, f64)]) -> Result<TreeSequence> {
        let mut tables = self.dump_tables();
        tables.keep_intervals(intervals)?;
        tables.tree_sequence()
    }

    pub fn trim(&self) -> Result<TreeSequence> {
        let mut tables = self.dump_tables();
        tables.trim()?;
        tables.tree_sequence()
    }

    /// Keep the span between the rounded first and last site positions, shifted to zero
    pub fn trim_to_sites(&self) -> Result<TreeSequence> {
        let sites = self.sites();
        let (first, last) = match (sites.first(), sites.last()) {
            (Some(first), Some(last)) => (first.position, last.position),
            _ => return Err(eyre!(crate::error::TsageError::NoSitesError)),
        };
        let (left, right) = (first.round_ties_even(), last.round_ties_even());
        ensure!(
            left < right,
            "Sites span an empty interval after rounding: [{left}, {right})"
        );
        self.keep_intervals(&[(left, right.min(self.sequence_length()))])?
            .trim()
    }

    pub fn with_sequence_length(&self, sequence_length: f64) -> Result<TreeSequence> {
        let mut tables = self.dump_tables();
        tables.sequence_length = sequence_length;
        tables.tree_sequence()
    }

    pub fn delete_sites(&self, ids: &[usize]) -> Result<TreeSequence> {
        let mut tables = self.dump_tables();
        tables.delete_sites(ids);
        tables.tree_sequence()
    }

    /// Allele index of every sample at every site, shape `(sites, samples)`
    pub fn genotype_matrix(&self) -> Array2<u8> {
        let mut matrix = Array2::zeros((self.num_sites(), self.num_samples()));
        let mut trees = self.trees();
        while let Some(tree) = trees.next_tree() {
            for site in tree.sites() {
                let mut alleles = vec![self.tables.sites[site].ancestral_state.as_str()];
                for &m in self.site_mutations(site) {
                    let mutation = &self.tables.mutations[m];
                    let allele = match alleles
                        .iter()
                        .position(|a| *a == mutation.derived_state)
                    {
                        Some(i) => i,
                        None => {
                            alleles.push(mutation.derived_state.as_str());
                            alleles.len() - 1
                        }
                    };
                    for s in tree.samples_below(mutation.node) {
                        if let Some(j) = self.sample_index(s) {
                            matrix[[site, j]] = allele as u8;
                        }
                    }
                }
            }
        }
        matrix
    }
}

/// Local tree over a half-open genomic interval
#[derive(Debug, Clone)]
pub struct Tree<'a> {
    ts: &'a TreeSequence,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    interval: (f64, f64),
    index: usize,
    sites: Range<usize>,
}

impl<'a> Tree<'a> {
    fn new(ts: &'a TreeSequence) -> Self {
        Self {
            ts,
            parent: vec![None; ts.num_nodes()],
            children: vec![Vec::new(); ts.num_nodes()],
            interval: (0.0, 0.0),
            index: 0,
            sites: 0..0,
        }
    }

    pub fn tree_sequence(&self) -> &'a TreeSequence {
        self.ts
    }

    pub fn interval(&self) -> (f64, f64) {
        self.interval
    }

    pub fn span(&self) -> f64 {
        self.interval.1 - self.interval.0
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn contains(&self, position: f64) -> bool {
        self.interval.0 <= position && position < self.interval.1
    }

    pub fn parent(&self, u: usize) -> Option<usize> {
        self.parent[u]
    }

    pub fn children(&self, u: usize) -> &[usize] {
        &self.children[u]
    }

    pub fn time(&self, u: usize) -> f64 {
        self.ts.tables.nodes[u].time
    }

    pub fn is_sample(&self, u: usize) -> bool {
        self.ts.tables.nodes[u].is_sample()
    }

    pub fn branch_length(&self, u: usize) -> f64 {
        self.parent(u)
            .map_or(0.0, |p| self.time(p) - self.time(u))
    }

    pub fn sites(&self) -> Range<usize> {
        self.sites.clone()
    }

    /// Topmost ancestors of the samples, sorted by node id
    pub fn roots(&self) -> Vec<usize> {
        let mut roots = self
            .ts
            .samples
            .iter()
            .map(|&s| {
                let mut u = s;
                while let Some(p) = self.parent[u] {
                    u = p;
                }
                u
            })
            .collect::<Vec<usize>>();
        roots.sort_unstable();
        roots.dedup();
        roots
    }

    pub fn is_root(&self, u: usize) -> bool {
        self.parent[u].is_none() && (self.is_sample(u) || !self.children[u].is_empty())
    }

    /// Sample nodes in the subtree of `u`, `u` itself included
    pub fn samples_below(&self, u: usize) -> Vec<usize> {
        let mut samples = Vec::new();
        let mut stack = vec![u];
        while let Some(v) = stack.pop() {
            if self.is_sample(v) {
                samples.push(v);
            }
            stack.extend(self.children[v].iter().rev());
        }
        samples
    }

    pub fn mrca(&self, a: usize, b: usize) -> Option<usize> {
        let mut ancestors = vec![false; self.parent.len()];
        let mut u = Some(a);
        while let Some(v) = u {
            ancestors[v] = true;
            u = self.parent[v];
        }
        let mut u = Some(b);
        while let Some(v) = u {
            if ancestors[v] {
                return Some(v);
            }
            u = self.parent[v];
        }
        None
    }

    pub fn tmrca(&self, a: usize, b: usize) -> Option<f64> {
        self.mrca(a, b).map(|u| self.time(u))
    }

    fn insert_edge(&mut self, edge: &Edge) {
        self.parent[edge.child] = Some(edge.parent);
        self.children[edge.parent].push(edge.child);
    }

    fn remove_edge(&mut self, edge: &Edge) {
        self.parent[edge.child] = None;
        let children = &mut self.children[edge.parent];
        if let Some(i) = children.iter().position(|&c| c == edge.child) {
            children.remove(i);
        }
    }
}

/// Incremental left-to-right iterator over the local trees.
///
/// Each call to [`TreeIterator::next_tree`] applies the edge removals and insertions at the
/// next breakpoint, so the borrowed tree is only valid until the following call.
#[derive(Debug)]
pub struct TreeIterator<'a> {
    tree: Tree<'a>,
    insertion_idx: usize,
    removal_idx: usize,
    site_idx: usize,
    started: bool,
    finished: bool,
}

impl<'a> TreeIterator<'a> {
    fn new(ts: &'a TreeSequence) -> Self {
        Self {
            tree: Tree::new(ts),
            insertion_idx: 0,
            removal_idx: 0,
            site_idx: 0,
            started: false,
            finished: false,
        }
    }

    /// The current tree, `None` before the first and after the last call to `next_tree`
    pub fn tree(&self) -> Option<&Tree<'a>> {
        match self.started && !self.finished {
            true => Some(&self.tree),
            false => None,
        }
    }

    pub fn next_tree(&mut self) -> Option<&Tree<'a>> {
        if self.finished {
            return None;
        }

        let ts = self.tree.ts;
        let l = ts.sequence_length();
        let left = match self.started {
            true => self.tree.interval.1,
            false => 0.0,
        };
        if left >= l {
            self.finished = true;
            return None;
        }

        let edges = &ts.tables.edges;
        let m = edges.len();
        while self.removal_idx < m && edges[ts.removal[self.removal_idx]].right == left {
            self.tree.remove_edge(&edges[ts.removal[self.removal_idx]]);
            self.removal_idx += 1;
        }
        while self.insertion_idx < m && edges[ts.insertion[self.insertion_idx]].left == left {
            self.tree
                .insert_edge(&edges[ts.insertion[self.insertion_idx]]);
            self.insertion_idx += 1;
        }

        let mut right = l;
        if self.insertion_idx < m {
            right = right.min(edges[ts.insertion[self.insertion_idx]].left);
        }
        if self.removal_idx < m {
            right = right.min(edges[ts.removal[self.removal_idx]].right);
        }

        let sites = &ts.tables.sites;
        let start = self.site_idx;
        while self.site_idx < sites.len() && sites[self.site_idx].position < right {
            self.site_idx += 1;
        }

        self.tree.index = match self.started {
            true => self.tree.index + 1,
            false => 0,
        };
        self.tree.interval = (left, right);
        self.tree.sites = start..self.site_idx;
        self.started = true;

        Some(&self.tree)
    }

    /// Advance until the current tree contains `position`
    pub fn seek(&mut self, position: f64) -> Option<&Tree<'a>> {
        loop {
            let needs_advance = match self.tree() {
                Some(tree) => tree.interval.1 <= position,
                None => !self.finished,
            };
            if !needs_advance {
                break;
            }
            self.next_tree()?;
        }
        self.tree().filter(|t| t.contains(position))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    // Four samples, two local trees split at 50:
    //   [0, 50):   6 -> (4 -> (0, 1), 5 -> (2, 3))
    //   [50, 100): 6 -> (5 -> (2, 4 -> (0, 1)), 3)
    pub(crate) fn two_tree_tables() -> TableCollection {
        let mut tables = TableCollection::new(100.0);
        for _ in 0..4 {
            tables.add_node(0.0, NODE_IS_SAMPLE);
        }
        tables.add_node(1.0, 0);
        tables.add_node(2.0, 0);
        tables.add_node(3.0, 0);

        tables.add_edge(0.0, 100.0, 4, 0);
        tables.add_edge(0.0, 100.0, 4, 1);
        tables.add_edge(0.0, 50.0, 5, 3);
        tables.add_edge(0.0, 100.0, 5, 2);
        tables.add_edge(50.0, 100.0, 5, 4);
        tables.add_edge(0.0, 50.0, 6, 4);
        tables.add_edge(0.0, 100.0, 6, 5);
        tables.add_edge(50.0, 100.0, 6, 3);

        let s = tables.add_site(10.0, "0");
        tables.add_mutation(s, 4, "1");
        let s = tables.add_site(60.0, "0");
        tables.add_mutation(s, 5, "1");
        let s = tables.add_site(70.4, "0");
        tables.add_mutation(s, 3, "1");

        tables
    }

    pub(crate) fn two_tree_ts() -> TreeSequence {
        two_tree_tables().tree_sequence().unwrap()
    }
}
