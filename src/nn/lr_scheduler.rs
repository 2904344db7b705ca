use serde::{Deserialize, Serialize};

/// Polynomial learning-rate decay with a linear warmup.
///
/// During warmup the rate ramps from `base_lr * warmup_factor` to `base_lr`;
/// afterwards it decays as `target + (base - target) * (1 - t/T)^power`.
/// The whole state is serializable so it can travel with a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupPolyLr {
    pub base_lr: f64,
    pub target_lr: f64,
    pub max_iters: usize,
    pub power: f64,
    pub warmup_factor: f64,
    pub warmup_iters: usize,
    pub iteration: usize,
}

impl WarmupPolyLr {
    pub fn new(base_lr: f64, max_iters: usize) -> Self {
        Self {
            base_lr,
            target_lr: 0.0,
            max_iters,
            power: 0.9,
            warmup_factor: 1.0 / 3.0,
            warmup_iters: 0,
            iteration: 0,
        }
    }

    pub fn with_warmup(mut self, iters: usize, factor: f64) -> Self {
        self.warmup_iters = iters;
        self.warmup_factor = factor;
        self
    }

    /// Rate for the current iteration
    pub fn current_lr(&self) -> f64 {
        let it = self.iteration;
        if it < self.warmup_iters {
            let alpha = it as f64 / self.warmup_iters as f64;
            let factor = self.warmup_factor * (1.0 - alpha) + alpha;
            return self.base_lr * factor;
        }

        let span = self.max_iters.saturating_sub(self.warmup_iters).max(1);
        let progress = (it - self.warmup_iters).min(span) as f64 / span as f64;
        let decay = (1.0 - progress).powf(self.power);
        self.target_lr + (self.base_lr - self.target_lr) * decay
    }

    /// Returns the rate to use now and advances one iteration
    pub fn step(&mut self) -> f64 {
        let lr = self.current_lr();
        self.iteration += 1;
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_starts_at_fraction_of_base() {
        let mut sched = WarmupPolyLr::new(0.01, 100).with_warmup(10, 0.1);
        let first = sched.step();
        assert!((first - 0.001).abs() < 1e-12, "got {}", first);
        for _ in 1..10 {
            sched.step();
        }
        assert!((sched.current_lr() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_poly_decay_reaches_target() {
        let mut sched = WarmupPolyLr::new(0.01, 50);
        let mut last = f64::INFINITY;
        for _ in 0..50 {
            let lr = sched.step();
            assert!(lr <= last, "learning rate increased: {} > {}", lr, last);
            last = lr;
        }
        assert_eq!(sched.current_lr(), 0.0);
        // Past the schedule the rate stays at the target
        sched.step();
        assert_eq!(sched.current_lr(), 0.0);
    }

    #[test]
    fn test_state_survives_json() {
        let mut sched = WarmupPolyLr::new(0.02, 20).with_warmup(3, 0.5);
        sched.step();
        sched.step();
        let json = serde_json::to_string(&sched).unwrap();
        let restored: WarmupPolyLr = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sched);
        assert_eq!(restored.current_lr(), sched.current_lr());
    }
}
