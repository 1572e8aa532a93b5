//! Fixed-bucket histogram for TIMER metrics.

/// Upper bounds, in seconds, shared by every timer in the process.
///
/// Strictly increasing, starting at `0` and ending at `+inf`, so every
/// observation falls in exactly one bucket.
pub const BUCKETS: [f64; 22] = [
    0.0,
    0.001,
    0.0025,
    0.005,
    0.01,
    0.025,
    0.05,
    0.1,
    0.25,
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    25.0,
    50.0,
    100.0,
    250.0,
    500.0,
    1000.0,
    2000.0,
    f64::INFINITY,
];

/// Per-bucket counts (not cumulative) plus the running sum.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    counts: [u64; BUCKETS.len()],
    sum: f64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            counts: [0; BUCKETS.len()],
            sum: 0.0,
        }
    }
}

impl Histogram {
    /// Index of the first bucket whose upper bound is `>= seconds`.
    #[must_use]
    pub fn bucket_index(seconds: f64) -> usize {
        BUCKETS
            .iter()
            .position(|bound| seconds <= *bound)
            .unwrap_or(BUCKETS.len() - 1)
    }

    pub fn observe(&mut self, seconds: f64) {
        self.counts[Self::bucket_index(seconds)] += 1;
        self.sum += seconds;
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
        self.sum += other.sum;
    }

    #[must_use]
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// `(upper bound, cumulative count)` pairs, as Prometheus expects.
    pub fn cumulative(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        BUCKETS
            .iter()
            .zip(self.counts.iter())
            .scan(0u64, |acc, (bound, count)| {
                *acc += count;
                Some((*bound, *acc))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_increasing_from_zero_to_infinity() {
        assert!(BUCKETS[0].abs() < f64::EPSILON);
        assert!(BUCKETS[BUCKETS.len() - 1].is_infinite());
        assert!(BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn each_observation_hits_one_bucket() {
        let mut h = Histogram::default();
        h.observe(0.0202);
        assert_eq!(h.count(), 1);
        assert_eq!(h.counts()[Histogram::bucket_index(0.0202)], 1);
        assert_eq!(Histogram::bucket_index(0.0202), 5); // 0.025
        assert!((h.sum() - 0.0202).abs() < 1e-12);
    }

    #[test]
    fn boundaries_are_inclusive() {
        assert_eq!(Histogram::bucket_index(0.0), 0);
        assert_eq!(Histogram::bucket_index(0.001), 1);
        assert_eq!(Histogram::bucket_index(1e9), BUCKETS.len() - 1);
    }

    #[test]
    fn cumulative_ends_at_total() {
        let mut h = Histogram::default();
        for s in [0.0005, 0.2, 3.0, 3.0] {
            h.observe(s);
        }
        let cumulative: Vec<_> = h.cumulative().collect();
        assert_eq!(cumulative.last().map(|c| c.1), Some(4));
        assert!(cumulative.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn merge_adds_counts_and_sums() {
        let mut a = Histogram::default();
        a.observe(0.1);
        let mut b = Histogram::default();
        b.observe(0.1);
        b.observe(5.0);
        a.merge(&b);
        assert_eq!(a.count(), 3);
        assert!((a.sum() - 5.2).abs() < 1e-9);
    }
}
