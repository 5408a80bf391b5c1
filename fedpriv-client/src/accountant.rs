//! Privacy accounting for the noisy training steps.
//!
//! The accountant tracks how many noisy batches have been taken and
//! converts that into an `(epsilon, delta)` guarantee via Rényi
//! differential privacy: for the subsampled Gaussian mechanism each step
//! costs roughly `q^2 * alpha / sigma^2` at Rényi order `alpha`, and the
//! bound is minimized over a fixed grid of orders when converting to
//! epsilon. The spent budget only ever grows.

/// The Rényi orders the conversion to epsilon is minimized over.
const ORDERS: [f64; 18] = [
    1.5, 1.75, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 6.0, 8.0, 10.0, 12.0, 16.0, 20.0, 32.0, 48.0,
    64.0,
];

#[derive(Debug, Clone)]
/// Tracks the cumulative privacy cost of noisy gradient steps.
pub struct RdpAccountant {
    noise_multiplier: f64,
    sampling_rate: f64,
    steps: u64,
}

impl RdpAccountant {
    /// Creates an accountant for a mechanism with the given noise
    /// multiplier and batch sampling rate. No steps are recorded yet.
    pub fn new(noise_multiplier: f64, sampling_rate: f64) -> Self {
        Self {
            noise_multiplier,
            sampling_rate,
            steps: 0,
        }
    }

    /// Records `steps` further noisy batches.
    pub fn record_steps(&mut self, steps: u64) {
        self.steps += steps;
    }

    /// The number of noisy batches recorded so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The epsilon spent so far at the given delta.
    pub fn epsilon(&self, delta: f64) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        let rdp_per_step =
            self.sampling_rate.powi(2) / self.noise_multiplier.powi(2) * self.steps as f64;
        ORDERS
            .iter()
            .map(|&order| rdp_per_step * order + (1.0 / delta).ln() / (order - 1.0))
            .fold(f64::INFINITY, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_steps_cost_nothing() {
        let accountant = RdpAccountant::new(1.0, 0.1);
        assert_eq!(accountant.epsilon(1e-5), 0.0);
    }

    #[test]
    fn epsilon_never_decreases() {
        let mut accountant = RdpAccountant::new(1.0, 0.05);
        let mut last = 0.0;
        for _ in 0..50 {
            accountant.record_steps(10);
            let epsilon = accountant.epsilon(1e-5);
            assert!(epsilon >= last);
            assert!(epsilon.is_finite());
            last = epsilon;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn more_noise_spends_less_budget() {
        let mut quiet = RdpAccountant::new(2.0, 0.05);
        let mut loud = RdpAccountant::new(0.5, 0.05);
        quiet.record_steps(100);
        loud.record_steps(100);
        assert!(quiet.epsilon(1e-5) < loud.epsilon(1e-5));
    }

    #[test]
    fn smaller_batches_spend_less_budget() {
        let mut sparse = RdpAccountant::new(1.0, 0.01);
        let mut dense = RdpAccountant::new(1.0, 0.5);
        sparse.record_steps(100);
        dense.record_steps(100);
        assert!(sparse.epsilon(1e-5) < dense.epsilon(1e-5));
    }
}
