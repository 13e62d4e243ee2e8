//! Robust baseline statistics: median and scaled MAD.

/// Scaling factor that makes the MAD approximate σ for Gaussian data.
const MAD_SCALE: f64 = 1.4826;

/// Floor applied to the scaled MAD so z-scores never divide by ~zero.
/// An all-equal baseline thus yields z ≈ 0 rather than blowing up.
const MAD_FLOOR: f64 = 1e-6;

/// Median + scaled-MAD baseline over a sample of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustBaseline {
    pub median: f64,
    pub scaled_mad: f64,
    pub sample_count: usize,
}

impl RobustBaseline {
    /// Compute the baseline. Returns `None` when fewer than `min_points`
    /// samples are available.
    pub fn compute(values: &[f64], min_points: usize) -> Option<Self> {
        if values.len() < min_points {
            return None;
        }

        let med = median(values);
        let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&deviations);
        let scaled_mad = (MAD_SCALE * mad).max(MAD_FLOOR);

        Some(Self {
            median: med,
            scaled_mad,
            sample_count: values.len(),
        })
    }

    /// Robust z-score of a value against this baseline.
    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.median).abs() / self.scaled_mad
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn test_baseline_needs_min_points() {
        assert!(RobustBaseline::compute(&[1.0, 2.0], 5).is_none());
        assert!(RobustBaseline::compute(&[1.0, 2.0, 3.0, 4.0, 5.0], 5).is_some());
    }

    #[test]
    fn test_scaled_mad() {
        // values 48..52 around median 50, MAD = 1
        let values = [48.0, 49.0, 50.0, 51.0, 52.0];
        let b = RobustBaseline::compute(&values, 5).expect("enough points");
        assert_eq!(b.median, 50.0);
        assert!((b.scaled_mad - 1.4826).abs() < 1e-9);
    }

    #[test]
    fn test_all_equal_baseline_floors_mad() {
        let values = [50.0; 30];
        let b = RobustBaseline::compute(&values, 10).expect("enough points");
        assert_eq!(b.scaled_mad, 1e-6);
        // Equal values score ~0 against the floored MAD.
        assert_eq!(b.z_score(50.0), 0.0);
    }

    #[test]
    fn test_z_score_is_outlier_resistant() {
        // One wild outlier barely moves a median/MAD baseline.
        let mut values = vec![50.0; 29];
        values.push(10_000.0);
        let b = RobustBaseline::compute(&values, 10).expect("enough points");
        assert_eq!(b.median, 50.0);
        assert!(b.z_score(120.0) > 3.0);
    }
}
