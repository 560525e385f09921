use color_eyre::eyre::ensure;
use color_eyre::Result;
use itertools::Itertools;

use crate::args::AgeAggregate;

// Genomic positions are keyed by rounding half to even
pub fn round_position(x: f64) -> i64 {
    x.round_ties_even() as i64
}

pub fn round_count(x: f64) -> usize {
    x.round_ties_even().max(0.0) as usize
}

//NOTE: This should be parsed by clap automatically, but Option<String> parsing is not supported out of the box as of now
pub fn strip_prefix(prefix: Option<String>) -> Option<String> {
    if let Some(prefix) = prefix {
        match prefix.as_ref() {
            "" => None,
            "\\0" => None,
            v => Some(v.to_string()),
        }
    } else {
        None
    }
}

pub fn aggregate_age(a: f64, b: f64, method: AgeAggregate) -> f64 {
    match method {
        AgeAggregate::Arithmetic => (a + b) / 2.0,
        AgeAggregate::Geometric => (a * b).sqrt(),
    }
}

// Evenly spaced values over [start, stop] like numpy.linspace
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| match i == n - 1 {
                    true => stop,
                    false => start + step * i as f64,
                })
                .collect()
        }
    }
}

// Sorted union of two breakpoint lists without duplicates
pub fn merge_breakpoints(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter()
        .merge(b.iter())
        .copied()
        .dedup_by(|x, y| x == y)
        .collect()
}

pub fn check_rate(rate: f64) -> Result<()> {
    ensure!(
        (0.0..=1.0).contains(&rate),
        "Error rate must be within [0, 1], got {rate}"
    );
    Ok(())
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;

    #[test]
    fn test_round_position_half_even() {
        assert_eq!(round_position(0.5), 0);
        assert_eq!(round_position(1.5), 2);
        assert_eq!(round_position(2.5), 2);
        assert_eq!(round_position(2.6), 3);
        assert_eq!(round_count(0.05 * 50.0), 2);
        assert_eq!(round_count(0.05 * 70.0), 4);
    }

    #[test]
    fn test_aggregate_age() {
        assert_eq!(aggregate_age(1.0, 3.0, AgeAggregate::Arithmetic), 2.0);
        assert_eq!(aggregate_age(1.0, 4.0, AgeAggregate::Geometric), 2.0);
    }

    #[test]
    fn test_linspace() {
        let v = linspace(1e5, 1e7, 20);
        assert_eq!(v.len(), 20);
        assert_eq!(v[0], 1e5);
        assert_eq!(v[19], 1e7);
        assert_eq!(linspace(1.0, 2.0, 1), vec![1.0]);
    }

    #[test]
    fn test_merge_breakpoints() {
        let merged = merge_breakpoints(&[0.0, 10.0, 50.0, 100.0], &[0.0, 30.0, 50.0, 100.0]);
        assert_eq!(merged, vec![0.0, 10.0, 30.0, 50.0, 100.0]);
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix(Some("".into())), None);
        assert_eq!(strip_prefix(Some("\\0".into())), None);
        assert_eq!(strip_prefix(Some("run".into())), Some("run".into()));
    }

    #[test]
    fn test_check_rate() {
        assert!(check_rate(0.0).is_ok());
        assert!(check_rate(1.0).is_ok());
        assert!(check_rate(1.5).is_err());
        assert!(check_rate(-0.1).is_err());
    }
}
