//! Priority Load Balancer
//!
//! Statistically routes deliveries across `G` priority groups so that the
//! long-run share of group `g` approaches `1/(g+1)` (normalized), while every
//! group keeps a non-zero probability of being chosen.
//!
//! ## Decision step
//!
//! 1. Observed ratios come from the per-group delivery counters.
//! 2. The [`PidController`] turns `target - ratio` into one control signal per group.
//! 3. Over-served groups are discounted by `exp(-ratio)`; raw and penalized
//!    signals are blended by the smoothing factor.
//! 4. The blend goes through a temperature softmax and the group is *sampled*
//!    from the resulting distribution.
//!
//! Before anything has been counted the declared priority is clipped into
//! `[0, G-1]` instead.
//!
//! Counters are halved whenever one of them crosses the growth threshold,
//! which then grows geometrically. Relative history survives; memory stays
//! bounded.

use crate::pid::{Gains, PidController};
use bus_config::BalancerConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace};

/// Normalized `1/(g+1)` target shares for `groups` priority groups
pub fn target_shares(groups: usize) -> Vec<f64> {
    let raw: Vec<f64> = (0..groups).map(|g| 1.0 / (g as f64 + 1.0)).collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|share| share / total).collect()
}

/// Numerically stable softmax of `values / temperature`
pub fn softmax(values: &[f64], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = values.iter().map(|v| v / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Diagnostic view of the balancer
#[derive(Debug, Clone, Serialize)]
pub struct BalancerSnapshot {
    pub counts: Vec<f64>,
    pub ratios: Vec<f64>,
    pub targets: Vec<f64>,
    pub gains: Vec<Gains>,
    pub learning_rate: f64,
    pub growth_threshold: f64,
    /// Decisions taken by the controller (excludes the priority fallback)
    pub decisions: u64,
}

#[derive(Debug)]
struct BalancerState {
    counts: Vec<f64>,
    threshold: f64,
    pid: PidController,
    rng: StdRng,
    decisions: u64,
}

impl BalancerState {
    fn ratios(&self) -> Vec<f64> {
        let total: f64 = self.counts.iter().sum();
        if total <= 0.0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts.iter().map(|c| c / total).collect()
    }
}

/// PID-driven softmax sampler over priority groups
#[derive(Debug)]
pub struct LoadBalancer {
    state: Mutex<BalancerState>,
    targets: Vec<f64>,
    smoothing: f64,
    temperature: f64,
    growth_factor: f64,
}

impl LoadBalancer {
    pub fn new(groups: usize, config: &BalancerConfig) -> Self {
        let groups = groups.max(1);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            state: Mutex::new(BalancerState {
                counts: vec![0.0; groups],
                threshold: config.growth_threshold,
                pid: PidController::new(groups, config),
                rng,
                decisions: 0,
            }),
            targets: target_shares(groups),
            smoothing: config.smoothing,
            temperature: config.temperature,
            growth_factor: config.growth_factor,
        }
    }

    pub fn groups(&self) -> usize {
        self.targets.len()
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    /// Pick the priority group for a message declaring `priority`
    pub fn determine_priority_group(&self, priority: i32) -> usize {
        let groups = self.groups();
        let mut state = self.state.lock();

        let total: f64 = state.counts.iter().sum();
        if total <= 0.0 {
            let group = priority.clamp(0, groups as i32 - 1) as usize;
            trace!(priority, group, "No history yet, routing by declared priority");
            return group;
        }

        let ratios = state.ratios();
        let control = state.pid.step(&self.targets, &ratios);
        let blended: Vec<f64> = control
            .iter()
            .zip(&ratios)
            .map(|(c, ratio)| self.smoothing * c + (1.0 - self.smoothing) * c * (-ratio).exp())
            .collect();
        let probabilities = softmax(&blended, self.temperature);

        let draw: f64 = state.rng.gen();
        let mut cumulative = 0.0;
        let mut group = groups - 1;
        for (index, p) in probabilities.iter().enumerate() {
            cumulative += p;
            if draw < cumulative {
                group = index;
                break;
            }
        }

        state.decisions += 1;
        group
    }

    /// Count one routed (attempted) delivery for `group`
    pub fn register_event(&self, group: usize) {
        let mut state = self.state.lock();
        let Some(count) = state.counts.get_mut(group) else {
            return;
        };
        *count += 1.0;

        let threshold = state.threshold;
        if state.counts.iter().any(|c| *c > threshold) {
            for count in state.counts.iter_mut() {
                *count /= 2.0;
            }
            state.threshold *= self.growth_factor;
            debug!(
                threshold = state.threshold,
                "Balancer counters halved, growth threshold raised"
            );
        }
    }

    pub fn snapshot(&self) -> BalancerSnapshot {
        let state = self.state.lock();
        BalancerSnapshot {
            counts: state.counts.clone(),
            ratios: state.ratios(),
            targets: self.targets.clone(),
            gains: state.pid.gains(),
            learning_rate: state.pid.learning_rate(),
            growth_threshold: state.threshold,
            decisions: state.decisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> BalancerConfig {
        BalancerConfig {
            seed: Some(seed),
            ..BalancerConfig::default()
        }
    }

    #[test]
    fn test_target_shares_for_three_groups() {
        let targets = target_shares(3);
        assert!((targets[0] - 6.0 / 11.0).abs() < 1e-12);
        assert!((targets[1] - 3.0 / 11.0).abs() < 1e-12);
        assert!((targets[2] - 2.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn test_softmax_sums_to_one_and_preserves_order() {
        let p = softmax(&[2.0, 1.0, 0.0], 1.0);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[0] > p[1] && p[1] > p[2]);

        // Large inputs must not overflow
        let p = softmax(&[1000.0, 999.0], 1.0);
        assert!(p.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_cold_start_clips_declared_priority() {
        let balancer = LoadBalancer::new(3, &seeded(1));
        assert_eq!(balancer.determine_priority_group(-5), 0);
        assert_eq!(balancer.determine_priority_group(1), 1);
        assert_eq!(balancer.determine_priority_group(99), 2);
        assert_eq!(balancer.snapshot().decisions, 0);
    }

    #[test]
    fn test_counters_halve_past_threshold() {
        let config = BalancerConfig {
            growth_threshold: 4.0,
            growth_factor: 2.0,
            ..seeded(1)
        };
        let balancer = LoadBalancer::new(2, &config);
        for _ in 0..5 {
            balancer.register_event(0);
        }
        balancer.register_event(1);

        let snapshot = balancer.snapshot();
        assert_eq!(snapshot.counts, vec![2.5, 1.0]);
        assert_eq!(snapshot.growth_threshold, 8.0);
    }

    #[test]
    fn test_out_of_range_group_is_ignored() {
        let balancer = LoadBalancer::new(2, &seeded(1));
        balancer.register_event(7);
        assert_eq!(balancer.snapshot().counts, vec![0.0, 0.0]);
    }

    #[test]
    fn test_routing_converges_to_targets() {
        let balancer = LoadBalancer::new(3, &seeded(42));
        let mut routed = [0u64; 3];
        for i in 0..10_000 {
            let group = balancer.determine_priority_group(i % 3);
            routed[group] += 1;
            balancer.register_event(group);
        }

        for (group, target) in target_shares(3).iter().enumerate() {
            let share = routed[group] as f64 / 10_000.0;
            assert!(
                (share - target).abs() < 0.05,
                "group {} share {} target {}",
                group,
                share,
                target
            );
        }
    }

    #[test]
    fn test_same_seed_same_routing() {
        let a = LoadBalancer::new(3, &seeded(7));
        let b = LoadBalancer::new(3, &seeded(7));
        for _ in 0..100 {
            let ga = a.determine_priority_group(0);
            let gb = b.determine_priority_group(0);
            assert_eq!(ga, gb);
            a.register_event(ga);
            b.register_event(gb);
        }
    }
}
