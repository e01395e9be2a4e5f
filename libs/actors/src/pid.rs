//! Self-Tuning PID Controller
//!
//! One proportional/integral/derivative loop per priority group. Gains start
//! at the configured values and are nudged online by `learning_rate * error`
//! every step, clipped to `[0, 1]`. The learning rate decays geometrically so
//! the gains settle as the routed shares approach their targets.

use bus_config::BalancerConfig;
use serde::Serialize;

/// Current gains of one group's loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone)]
struct GroupLoop {
    gains: Gains,
    integral: f64,
    previous_error: f64,
}

/// Per-group feedback controller producing one control signal per group
#[derive(Debug, Clone)]
pub struct PidController {
    loops: Vec<GroupLoop>,
    learning_rate: f64,
    learning_rate_decay: f64,
}

impl PidController {
    pub fn new(groups: usize, config: &BalancerConfig) -> Self {
        let gains = Gains {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
        };
        Self {
            loops: vec![
                GroupLoop {
                    gains,
                    integral: 0.0,
                    previous_error: 0.0,
                };
                groups
            ],
            learning_rate: config.learning_rate,
            learning_rate_decay: config.learning_rate_decay,
        }
    }

    pub fn groups(&self) -> usize {
        self.loops.len()
    }

    /// Advance every loop one step and return the control signals.
    ///
    /// `targets` and `ratios` must both have one entry per group.
    pub fn step(&mut self, targets: &[f64], ratios: &[f64]) -> Vec<f64> {
        debug_assert_eq!(targets.len(), self.loops.len());
        debug_assert_eq!(ratios.len(), self.loops.len());

        let lr = self.learning_rate;
        let control = self
            .loops
            .iter_mut()
            .zip(targets.iter().zip(ratios))
            .map(|(group, (target, ratio))| {
                let error = target - ratio;
                group.integral += error;
                let derivative = error - group.previous_error;
                group.previous_error = error;

                let nudge = lr * error;
                group.gains.kp = (group.gains.kp + nudge).clamp(0.0, 1.0);
                group.gains.ki = (group.gains.ki + nudge).clamp(0.0, 1.0);
                group.gains.kd = (group.gains.kd + nudge).clamp(0.0, 1.0);

                group.gains.kp * error + group.gains.ki * group.integral + group.gains.kd * derivative
            })
            .collect();

        self.learning_rate *= self.learning_rate_decay;
        control
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn gains(&self) -> Vec<Gains> {
        self.loops.iter().map(|group| group.gains).collect()
    }

    pub fn integrals(&self) -> Vec<f64> {
        self.loops.iter().map(|group| group.integral).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_error_keeps_gains_and_output_flat() {
        let config = BalancerConfig::default();
        let mut pid = PidController::new(2, &config);

        let control = pid.step(&[0.5, 0.5], &[0.5, 0.5]);
        assert_eq!(control, vec![0.0, 0.0]);
        assert_eq!(pid.gains()[0].kp, config.kp);
    }

    #[test]
    fn test_under_served_group_gets_positive_control() {
        let config = BalancerConfig::default();
        let mut pid = PidController::new(2, &config);

        let control = pid.step(&[0.7, 0.3], &[0.2, 0.8]);
        assert!(control[0] > 0.0);
        assert!(control[1] < 0.0);
        // Gains move with the sign of the error
        assert!(pid.gains()[0].kp > config.kp);
        assert!(pid.gains()[1].kp < config.kp);
        assert!((pid.integrals()[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_gains_are_clipped_to_unit_interval() {
        let config = BalancerConfig {
            kp: 0.99,
            ki: 0.0,
            learning_rate: 1.0,
            learning_rate_decay: 1.0,
            ..BalancerConfig::default()
        };
        let mut pid = PidController::new(2, &config);

        for _ in 0..10 {
            pid.step(&[1.0, 0.0], &[0.0, 1.0]);
        }
        let gains = pid.gains();
        assert_eq!(gains[0].kp, 1.0);
        assert_eq!(gains[1].ki, 0.0);
    }

    #[test]
    fn test_learning_rate_decays_every_step() {
        let config = BalancerConfig::default();
        let mut pid = PidController::new(3, &config);
        pid.step(&[0.5, 0.3, 0.2], &[0.3, 0.3, 0.4]);
        pid.step(&[0.5, 0.3, 0.2], &[0.3, 0.3, 0.4]);

        let expected = config.learning_rate * config.learning_rate_decay.powi(2);
        assert!((pid.learning_rate() - expected).abs() < 1e-15);
    }
}
