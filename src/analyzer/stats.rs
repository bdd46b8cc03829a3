/// Running mean / standard deviation over a stream of samples (Welford).
///
/// Not synchronized; the analyzer only touches it under the comparison lock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// 0 when empty.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation; 0 with fewer than two samples.
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reports_zeroes() {
        let stats = Statistics::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.stddev(), 0.0);
        assert_eq!(stats.min(), None);
    }

    #[test]
    fn single_sample_has_no_spread() {
        let mut stats = Statistics::new();
        stats.add_sample(42.5);
        assert_eq!(stats.mean(), 42.5);
        assert_eq!(stats.stddev(), 0.0);
        assert_eq!(stats.min(), Some(42.5));
        assert_eq!(stats.max(), Some(42.5));
    }

    #[test]
    fn matches_population_formula() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = Statistics::new();
        samples.iter().for_each(|&s| stats.add_sample(s));
        assert_eq!(stats.count(), 8);
        assert!((stats.mean() - 5.0).abs() < 1e-12);
        assert!((stats.stddev() - 2.0).abs() < 1e-12);
        assert_eq!(stats.min(), Some(2.0));
        assert_eq!(stats.max(), Some(9.0));
    }

    #[test]
    fn large_offsets_stay_stable() {
        let mut stats = Statistics::new();
        for i in 0..1_000 {
            stats.add_sample(1e9 + (i % 2) as f64);
        }
        assert!((stats.mean() - (1e9 + 0.5)).abs() < 1e-6);
        assert!((stats.stddev() - 0.5).abs() < 1e-6);
    }
}
