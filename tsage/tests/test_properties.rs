mod common;
use common::{caterpillar_ts, simulated_ts, two_tree_tables, two_tree_ts};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tsage::args::AgeAggregate;
use tsage::io::ErrorMatrixRow;
use tsage::subcommands::add_errors::{ancestral_state_errors, make_seq_errors_genotype_model};
use tsage::subcommands::compare::{align_ages, get_mut_ages, SiteAge};
use tsage::subcommands::kc::kc_distance_ts;
use tsage::utils::round_count;

fn identity_row(freq: f64) -> ErrorMatrixRow {
    ErrorMatrixRow {
        freq,
        p00: 1.0,
        p01: 0.0,
        p02: 0.0,
        p10: 0.0,
        p11: 1.0,
        p12: 0.0,
        p20: 0.0,
        p21: 0.0,
        p22: 1.0,
    }
}

#[test]
fn zero_error_matrix_keeps_genotypes() {
    let matrix = [0.0, 0.5, 1.0].map(identity_row).to_vec();

    let mut rng = StdRng::seed_from_u64(7);
    for g in [
        vec![0, 0, 0, 0, 0, 0],
        vec![1, 0, 0, 1, 1, 1],
        vec![1, 1, 1, 1, 0, 1],
    ] {
        let resampled = make_seq_errors_genotype_model(&g, &matrix, &mut rng).unwrap();
        assert_eq!(resampled, g);
    }
}

#[test]
fn zero_error_matrix_keeps_random_genotypes() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..200 {
        let n_rows = rng.gen_range(1..=10);
        let matrix = (0..n_rows)
            .map(|_| identity_row(rng.gen_range(0.0..=1.0)))
            .collect::<Vec<ErrorMatrixRow>>();
        let n = 2 * rng.gen_range(1..=50);
        let g = (0..n).map(|_| rng.gen_range(0..=1)).collect::<Vec<u8>>();

        let resampled = make_seq_errors_genotype_model(&g, &matrix, &mut rng).unwrap();
        assert_eq!(resampled, g, "matrix {matrix:?}");
    }
}

#[test]
fn ancestral_state_errors_flip_exact_count() {
    let mut rng = StdRng::seed_from_u64(3);
    for (n_sites, rate, expected) in [(1000, 0.01, 10), (25, 0.2, 5), (40, 0.0, 0), (7, 1.0, 7)] {
        let flags = ancestral_state_errors(n_sites, rate, &mut rng).unwrap();
        assert_eq!(flags.len(), n_sites);
        assert_eq!(flags.iter().filter(|f| **f).count(), expected);
    }
}

#[test]
fn ancestral_state_errors_flip_exact_count_random() {
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..500 {
        let n_sites = rng.gen_range(0..5000);
        let rate = rng.gen_range(0.0..=1.0);
        let flags = ancestral_state_errors(n_sites, rate, &mut rng).unwrap();
        assert_eq!(flags.len(), n_sites);
        assert_eq!(
            flags.iter().filter(|f| **f).count(),
            round_count(rate * n_sites as f64),
            "{n_sites} sites at rate {rate}"
        );
    }
}

#[test]
fn site_ages_ignore_mutation_order() {
    let build = |nodes: [usize; 2]| {
        let mut tables = two_tree_tables();
        let s = tables.add_site(20.0, "0");
        for node in nodes {
            tables.add_mutation(s, node, "1");
        }
        tables.tree_sequence().unwrap()
    };
    let a = get_mut_ages(&build([0, 4]), None, false, AgeAggregate::Arithmetic).unwrap();
    let b = get_mut_ages(&build([4, 0]), None, false, AgeAggregate::Arithmetic).unwrap();

    assert_eq!(a, b);
    // Node 4 at t=1 below the root at t=3
    assert_eq!(a, vec![SiteAge { position: 20.0, age: 2.0 }]);
}

#[test]
fn alignment_is_deterministic() {
    let ages = vec![
        SiteAge { position: 10.4, age: 5.0 },
        SiteAge { position: 9.6, age: 5.0 },
        SiteAge { position: 10.2, age: 1.0 },
        SiteAge { position: 30.0, age: 2.0 },
    ];
    let mut reversed = ages.clone();
    reversed.reverse();

    let aligned = align_ages(&ages);
    assert_eq!(aligned, align_ages(&reversed));
    assert_eq!(aligned.len(), 2);
    assert_eq!(aligned[&10], 5.0);
    assert_eq!(aligned[&30], 2.0);
}

#[test]
fn kc_distance_is_symmetric() {
    let a = two_tree_ts();
    let b = caterpillar_ts();
    for lambda in [0.0, 0.5, 1.0] {
        let ab = kc_distance_ts(&a, &b, lambda).unwrap();
        let ba = kc_distance_ts(&b, &a, lambda).unwrap();
        assert!((ab - ba).abs() < 1e-12);
    }

    let a = simulated_ts(8, 1).unwrap();
    let b = simulated_ts(8, 2).unwrap();
    let ab = kc_distance_ts(&a, &b, 0.0).unwrap();
    let ba = kc_distance_ts(&b, &a, 0.0).unwrap();
    assert!((ab - ba).abs() < 1e-9);
}

#[test]
fn simulated_ages_are_bounded_by_the_roots() {
    let ts = simulated_ts(10, 42).unwrap();
    let ages = get_mut_ages(&ts, None, false, AgeAggregate::Arithmetic).unwrap();

    assert!(!ages.is_empty());
    let max_root_time = ts.max_root_time();
    for site in &ages {
        assert!(site.age >= 0.0 && site.age <= max_root_time, "{site:?} above {max_root_time}");
    }
}

#[test]
fn identical_genealogies_have_zero_distance() {
    let a = two_tree_ts();
    let b = two_tree_ts();
    assert_eq!(a.breakpoints(), &[0.0, 50.0, 100.0]);
    assert_eq!(kc_distance_ts(&a, &b, 0.0).unwrap(), 0.0);
}
