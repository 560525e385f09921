use color_eyre::{eyre::ensure, Result};
use statrs::statistics::Statistics;

fn check_pairs(x: &[f64], y: &[f64]) -> Result<()> {
    ensure!(
        x.len() == y.len(),
        "Cannot compare estimates of unequal length: {} != {}",
        x.len(),
        y.len()
    );
    ensure!(!x.is_empty(), "Cannot compare empty estimates");
    Ok(())
}

/// Mean squared error
pub fn mse(x: &[f64], y: &[f64]) -> Result<f64> {
    check_pairs(x, y)?;
    Ok(x.iter()
        .zip(y)
        .map(|(a, b)| (a - b).powi(2))
        .collect::<Vec<f64>>()
        .mean())
}

/// Mean squared log error, `ln(1 + age)` so that zero ages are defined
pub fn msle(x: &[f64], y: &[f64]) -> Result<f64> {
    check_pairs(x, y)?;
    ensure!(
        x.iter().chain(y).all(|&v| v > -1.0),
        "Log error is undefined for ages <= -1"
    );
    Ok(x.iter()
        .zip(y)
        .map(|(a, b)| (a.ln_1p() - b.ln_1p()).powi(2))
        .collect::<Vec<f64>>()
        .mean())
}

pub fn rmsle(x: &[f64], y: &[f64]) -> Result<f64> {
    Ok(msle(x, y)?.sqrt())
}

/// Pearson correlation coefficient, NaN when either input is constant
pub fn pearson(x: &[f64], y: &[f64]) -> Result<f64> {
    check_pairs(x, y)?;
    ensure!(x.len() > 1, "Correlation needs at least two observations");
    let cov = x.iter().covariance(y.iter());
    Ok(cov / (x.iter().std_dev() * y.iter().std_dev()))
}

/// Spearman rank correlation with average ranks for ties
pub fn spearman(x: &[f64], y: &[f64]) -> Result<f64> {
    check_pairs(x, y)?;
    pearson(&ranks(x), &ranks(y))
}

pub fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order = (0..values.len()).collect::<Vec<usize>>();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // 1-based ranks, ties share their mean
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Pairs of observations where both values are present
pub fn complete_pairs(x: &[Option<f64>], y: &[Option<f64>]) -> (Vec<f64>, Vec<f64>) {
    x.iter()
        .zip(y)
        .filter_map(|(a, b)| Some(((*a)?, (*b)?)))
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .unzip()
}

#[cfg(test)]
#[rustfmt::skip]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_errors() {
        let x = [1.0, 2.0, 3.0];
        let y = [1.0, 2.0, 5.0];
        assert!(approx(mse(&x, &y).unwrap(), 4.0 / 3.0));
        assert_eq!(msle(&x, &x).unwrap(), 0.0);
        let expected = ((4.0_f64.ln() - 6.0_f64.ln()).powi(2) / 3.0).sqrt();
        assert!(approx(rmsle(&x, &y).unwrap(), expected));
        assert!(mse(&x, &y[..2]).is_err());
        assert!(mse(&[], &[]).is_err());
    }

    #[test]
    fn test_correlations() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        assert!(approx(pearson(&x, &y).unwrap(), 1.0));
        let z = [1.0, 8.0, 27.0, 64.0];
        assert!(approx(spearman(&x, &z).unwrap(), 1.0));
        let w = [4.0, 3.0, 2.0, 1.0];
        assert!(approx(spearman(&x, &w).unwrap(), -1.0));
    }

    #[test]
    fn test_ranks_with_ties() {
        assert_eq!(ranks(&[10.0, 20.0, 20.0, 5.0]), vec![2.0, 3.5, 3.5, 1.0]);
    }

    #[test]
    fn test_complete_pairs() {
        let (x, y) = complete_pairs(&[Some(1.0), None, Some(3.0), Some(f64::NAN)], &[Some(2.0), Some(1.0), Some(4.0), Some(1.0)]);
        assert_eq!(x, vec![1.0, 3.0]);
        assert_eq!(y, vec![2.0, 4.0]);
    }
}
