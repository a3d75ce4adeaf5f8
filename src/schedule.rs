use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Constant,
    /// `lr * (1 - step / total_steps)`
    Linear,
    /// `lr / (1 + (lr / epochs) * step)`
    InverseTime,
}

/// Learning rate for each optimiser step of a run.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    initial: f64,
    decay: LrDecay,
    epochs: usize,
    total_steps: usize,
    step: usize,
}

impl LrSchedule {
    pub fn new(initial: f64, decay: LrDecay, epochs: usize, steps_per_epoch: usize) -> Self {
        Self {
            initial,
            decay,
            epochs,
            total_steps: epochs * steps_per_epoch,
            step: 0,
        }
    }

    pub fn at(&self, step: usize) -> f64 {
        match self.decay {
            LrDecay::Constant => self.initial,
            LrDecay::Linear => {
                let total = self.total_steps.max(1) as f64;
                self.initial * (1.0 - step.min(self.total_steps) as f64 / total)
            }
            LrDecay::InverseTime => {
                let rate = self.initial / self.epochs.max(1) as f64;
                self.initial / (1.0 + rate * step as f64)
            }
        }
    }

    pub fn current(&self) -> f64 {
        self.at(self.step)
    }

    /// The rate for the current step; moves on to the next one.
    pub fn advance(&mut self) -> f64 {
        let lr = self.current();
        self.step += 1;
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_decay_falls_evenly() {
        let schedule = LrSchedule::new(1e-3, LrDecay::Linear, 4, 5);
        assert_eq!(schedule.at(0), 1e-3);
        assert!((schedule.at(10) - 5e-4).abs() < 1e-12);
        assert!(schedule.at(19) > 0.0);
        assert_eq!(schedule.at(20), 0.0);
    }

    #[test]
    fn inverse_time_matches_legacy_decay() {
        let schedule = LrSchedule::new(1e-3, LrDecay::InverseTime, 20, 10);
        let expected = 1e-3 / (1.0 + 5e-5 * 100.0);
        assert!((schedule.at(100) - expected).abs() < 1e-15);
    }

    #[test]
    fn advance_moves_one_step_at_a_time() {
        let mut schedule = LrSchedule::new(1.0, LrDecay::Linear, 1, 4);
        let rates: Vec<f64> = (0..4).map(|_| schedule.advance()).collect();
        assert_eq!(rates, vec![1.0, 0.75, 0.5, 0.25]);
        assert_eq!(schedule.current(), 0.0);

        let mut constant = LrSchedule::new(0.1, LrDecay::Constant, 1, 2);
        let rates: Vec<f64> = (0..3).map(|_| constant.advance()).collect();
        assert_eq!(rates, vec![0.1; 3]);
    }
}
