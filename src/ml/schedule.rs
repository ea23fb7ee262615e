use burn::LearningRate;

/// Linear warm-up from 0 to `base_lr` over `warmup_steps`, then
/// linear decay to 0 at `total_steps`.
///
///   step <  warmup: lr = base · step / warmup
///   step >= warmup: lr = base · (total − step) / (total − warmup)
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmupSchedule {
    base_lr:      LearningRate,
    warmup_steps: usize,
    total_steps:  usize,
}

impl LinearWarmupSchedule {
    pub fn new(base_lr: LearningRate, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }

    /// Learning rate for the optimizer step that follows `completed` steps.
    pub fn lr(&self, completed: usize) -> LearningRate {
        if completed < self.warmup_steps {
            return self.base_lr * completed as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(completed) as f64;
        let span      = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramps_linearly() {
        let s = LinearWarmupSchedule::new(1e-3, 10, 110);
        assert_eq!(s.lr(0), 0.0);
        assert!((s.lr(5) - 5e-4).abs() < 1e-12);
        assert!((s.lr(10) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_decays_to_zero_at_end() {
        let s = LinearWarmupSchedule::new(1e-3, 10, 110);
        assert!((s.lr(60) - 5e-4).abs() < 1e-12);
        assert_eq!(s.lr(110), 0.0);
        assert_eq!(s.lr(500), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let s = LinearWarmupSchedule::new(5e-5, 0, 4);
        assert_eq!(s.lr(0), 5e-5);
        assert!((s.lr(2) - 2.5e-5).abs() < 1e-15);
    }
}
