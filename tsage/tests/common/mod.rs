#![allow(dead_code)]
use std::path::PathBuf;

use color_eyre::Result;
use ndarray::aview1;

use tsage::{
    args::SimulationArgs,
    sample_data::SampleData,
    structs::{TableCollection, TreeSequence, NODE_IS_SAMPLE},
};
use tsage::subcommands::simulate::{simulate, SimulationConfig};

pub const OUTDIR: &str = "tests/results";

pub fn outdir() -> PathBuf {
    let dir = PathBuf::from(OUTDIR);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// Four samples, two local trees split at 50:
//   [0, 50):   6 -> (4 -> (0, 1), 5 -> (2, 3))
//   [50, 100): 6 -> (5 -> (2, 4 -> (0, 1)), 3)
pub fn two_tree_tables() -> TableCollection {
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

    tables
}

pub fn two_tree_ts() -> TreeSequence {
    let mut tables = two_tree_tables();
    let s = tables.add_site(10.0, "0");
    tables.add_mutation(s, 4, "1");
    let s = tables.add_site(60.0, "0");
    tables.add_mutation(s, 5, "1");
    tables.tree_sequence().unwrap()
}

// Same four samples under a single caterpillar tree 6 -> (5 -> (4 -> (0, 1), 2), 3)
pub fn caterpillar_ts() -> TreeSequence {
    let mut tables = TableCollection::new(100.0);
    for _ in 0..4 {
        tables.add_node(0.0, NODE_IS_SAMPLE);
    }
    tables.add_node(1.0, 0);
    tables.add_node(2.0, 0);
    tables.add_node(4.0, 0);

    tables.add_edge(0.0, 100.0, 4, 0);
    tables.add_edge(0.0, 100.0, 4, 1);
    tables.add_edge(0.0, 100.0, 5, 4);
    tables.add_edge(0.0, 100.0, 5, 2);
    tables.add_edge(0.0, 100.0, 6, 5);
    tables.add_edge(0.0, 100.0, 6, 3);

    let s = tables.add_site(30.0, "0");
    tables.add_mutation(s, 5, "1");
    tables.tree_sequence().unwrap()
}

pub fn simulated_ts(sample_size: usize, seed: u64) -> Result<TreeSequence> {
    let args = SimulationArgs {
        sample_size,
        ne: 10000.0,
        length: 1e5,
        mutation_rate: 1e-8,
        recombination_rate: 1e-8,
        seed,
        ..Default::default()
    };
    simulate(&SimulationConfig::try_from(&args)?, args.seed)
}

// Two individuals, the site at 10.4 rounds onto the site at 10 and is dropped from VCF output
pub fn small_sample_data() -> SampleData {
    let alleles = || vec!["0".to_string(), "1".to_string()];
    let mut data = SampleData::new(100.0, vec![0.0; 4]);
    data.add_site(10.0, aview1(&[0, 1, 1, 0]), alleles(), None).unwrap();
    data.add_site(10.4, aview1(&[1, 1, 0, 0]), alleles(), None).unwrap();
    data.add_site(55.6, aview1(&[0, 0, 0, 1]), alleles(), None).unwrap();
    data.finalise().unwrap();
    data
}
