//! Resilient aggregation rules.

/// Coordinate-wise aggregation of values contributed by several neighbors.
pub trait Aggregator: Send + Sync {
    /// Aggregates the values contributed for a single coordinate.
    ///
    /// Callers guarantee `values.len() >= self.min_inputs()`; below that the
    /// result is `NaN`.
    fn aggregate(&self, values: &[f64]) -> f64;

    /// Smallest number of contributions the rule is defined for.
    fn min_inputs(&self) -> usize;

    /// Aggregates equally long vectors coordinate by coordinate.
    fn aggregate_vectors(&self, vectors: &[&[f64]]) -> Vec<f64> {
        let len = vectors.first().map(|v| v.len()).unwrap_or(0);
        let mut column = Vec::with_capacity(vectors.len());
        (0..len)
            .map(|i| {
                column.clear();
                column.extend(vectors.iter().map(|v| v[i]));
                self.aggregate(&column)
            })
            .collect()
    }
}

/// Trimmed mean tolerating up to `f` Byzantine contributions.
///
/// Sorts the contributions, discards the `f` largest and `f` smallest, and
/// averages the rest. Any `f` arbitrary values are either discarded or
/// bracketed by honest values, so the result stays within the honest range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimmedMean {
    f: usize,
}

impl TrimmedMean {
    pub fn new(f: usize) -> Self {
        Self { f }
    }

    /// Number of contributions trimmed from each end.
    pub fn tolerance(&self) -> usize {
        self.f
    }
}

impl Aggregator for TrimmedMean {
    fn aggregate(&self, values: &[f64]) -> f64 {
        if values.len() < self.min_inputs() {
            return f64::NAN;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let kept = &sorted[self.f..sorted.len() - self.f];
        kept.iter().sum::<f64>() / kept.len() as f64
    }

    fn min_inputs(&self) -> usize {
        2 * self.f + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tolerance_is_plain_mean() {
        let agg = TrimmedMean::new(0);
        assert_eq!(agg.aggregate(&[1.0, 2.0, 6.0]), 3.0);
        assert_eq!(agg.aggregate(&[4.5]), 4.5);
    }

    #[test]
    fn trims_extremes() {
        let agg = TrimmedMean::new(1);
        assert_eq!(agg.aggregate(&[100.0, 1.0, 2.0, 3.0, -50.0]), 2.0);
    }

    #[test]
    fn tolerates_f_adversarial_values() {
        let honest = [0.9, 1.0, 1.1, 1.0, 0.95];
        let agg = TrimmedMean::new(2);
        for attack in [1e9, -1e9, f64::INFINITY] {
            let mut values = honest.to_vec();
            values.push(attack);
            values.push(attack);
            let out = agg.aggregate(&values);
            // With both attackers on one side, the survivors are the k - 2f
            // honest values nearest the other extreme of the attack.
            let mut h = honest.to_vec();
            h.sort_by(f64::total_cmp);
            let expected = if attack > 0.0 {
                h[2..].iter().sum::<f64>() / 3.0
            } else {
                h[..3].iter().sum::<f64>() / 3.0
            };
            assert!((out - expected).abs() < 1e-12, "attack {attack}: {out}");
        }
    }

    #[test]
    fn result_stays_in_honest_range() {
        let agg = TrimmedMean::new(1);
        let out = agg.aggregate(&[2.0, 3.0, 4.0, -1e12]);
        assert!((2.0..=4.0).contains(&out));
    }

    #[test]
    fn too_few_inputs_is_undefined() {
        let agg = TrimmedMean::new(1);
        assert_eq!(agg.min_inputs(), 3);
        assert!(agg.aggregate(&[1.0, 2.0]).is_nan());
        assert!(agg.aggregate(&[]).is_nan());
    }

    #[test]
    fn vectors_are_aggregated_per_coordinate() {
        let agg = TrimmedMean::new(1);
        let a = [0.0, 10.0];
        let b = [1.0, 20.0];
        let c = [99.0, 30.0];
        assert_eq!(agg.aggregate_vectors(&[&a, &b, &c]), vec![1.0, 20.0]);
    }
}
