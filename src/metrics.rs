/// Distribution summary (mean, median, 25th percentile, 75th percentile) of `samples`.
///
/// Returns `None` for fewer than two samples or when any sample is not finite.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.len() < 2 || samples.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_few_samples() {
        assert_eq!(compute_metrics(&[]), None);
        assert_eq!(compute_metrics(&[4.0]), None);
        assert_eq!(compute_metrics(&[1.0, f64::NAN]), None);
    }

    #[test]
    fn quartiles_use_nearest_rank() {
        let (mean, median, p25, p75) = compute_metrics(&[8.0, 2.0, 6.0, 4.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert_eq!(median, 6.0);
        assert_eq!(p25, 4.0);
        assert_eq!(p75, 8.0);
    }
}
