use std::collections::VecDeque;

/// Samples required before a window's statistics are trusted. Below this the
/// model is still cold and must never produce findings.
pub const MIN_SAMPLES: usize = 30;

/// Fixed-capacity rolling history of numeric samples. Learns what "normal"
/// looks like for one signal; the oldest sample is evicted once the window
/// is full.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.capacity {
            let _ = self.window.pop_front();
        }
        self.window.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Population standard deviation (divide by count, not count - 1).
    /// Zero below two samples.
    pub fn standard_deviation(&self) -> f64 {
        if self.window.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let total: f64 = self
            .window
            .iter()
            .map(|x| {
                let diff = x - mean;
                diff * diff
            })
            .sum();
        (total / self.window.len() as f64).sqrt()
    }

    /// How far `value` sits from the window mean, in units of the window's
    /// usual noise. Zero when the history is perfectly flat, so a flat
    /// history can never trigger on itself.
    pub fn z_score(&self, value: f64) -> f64 {
        let std = self.standard_deviation();
        if std == 0.0 {
            return 0.0;
        }
        (value - self.mean()).abs() / std
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= MIN_SAMPLES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeroes() {
        let window = RollingWindow::new(10);
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.standard_deviation(), 0.0);
        assert_eq!(window.z_score(5.0), 0.0);
        assert!(!window.is_ready());
    }

    #[test]
    fn mean_and_std_match_hand_computation() {
        let mut window = RollingWindow::new(10);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            window.add(v);
        }
        assert!((window.mean() - 5.0).abs() < 1e-9);
        // Classic population-std example: sigma is exactly 2.
        assert!((window.standard_deviation() - 2.0).abs() < 1e-9);
        assert!((window.z_score(9.0) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn std_is_zero_below_two_samples() {
        let mut window = RollingWindow::new(10);
        window.add(42.0);
        assert_eq!(window.standard_deviation(), 0.0);
    }

    #[test]
    fn z_score_is_zero_for_flat_history() {
        let mut window = RollingWindow::new(50);
        for _ in 0..40 {
            window.add(10.0);
        }
        assert_eq!(window.standard_deviation(), 0.0);
        assert_eq!(window.z_score(10.0), 0.0);
        assert_eq!(window.z_score(1000.0), 0.0);
    }

    #[test]
    fn z_score_grows_with_distance_from_mean() {
        let mut window = RollingWindow::new(100);
        for i in 0..60 {
            window.add([9.0, 10.0, 11.0][i % 3]);
        }
        let near = window.z_score(11.0);
        let far = window.z_score(20.0);
        let farther = window.z_score(80.0);
        assert!(near < far);
        assert!(far < farther);
    }

    #[test]
    fn readiness_flips_at_exactly_min_samples() {
        let mut window = RollingWindow::new(60);
        for i in 0..MIN_SAMPLES - 1 {
            window.add(i as f64);
        }
        assert!(!window.is_ready());
        window.add(0.0);
        assert!(window.is_ready());
        window.add(0.0);
        assert!(window.is_ready());
    }

    #[test]
    fn capacity_keeps_only_most_recent_values() {
        let mut window = RollingWindow::new(5);
        for i in 0..12 {
            window.add(i as f64);
        }
        assert_eq!(window.len(), 5);
        // Only 7..=11 remain, so the mean is 9.
        assert!((window.mean() - 9.0).abs() < 1e-9);
    }
}
