//! Simulated unreliability: reply drops, processing delay and probe pacing.
//!
//! All randomness goes through [`RandomSource`] so that a fixed seed, or a
//! scripted source in tests, pins every decision.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Uniform samples in `[0, 1)`.
pub trait RandomSource: Send {
    fn next_unit(&mut self) -> f64;
}

/// Default source backed by `StdRng`.
pub struct SeededRng(StdRng);

impl SeededRng {
    pub fn from_seed(seed: u64) -> Self {
        SeededRng(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        SeededRng(StdRng::from_entropy())
    }

    /// Deterministic per-connection stream when `seed` is set.
    pub fn for_stream(seed: Option<u64>, stream: u64) -> Self {
        match seed {
            // Spread stream ids so neighbouring connections do not share state.
            Some(seed) => Self::from_seed(seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => Self::from_entropy(),
        }
    }
}

impl RandomSource for SeededRng {
    fn next_unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }
}

/// Uniform duration in `[min, max]`.
fn uniform(rng: &mut dyn RandomSource, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    min + (max - min).mul_f64(rng.next_unit().clamp(0.0, 1.0))
}

/// Server-side drop and delay decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpairmentPolicy {
    /// Probability in `[0.0, 1.0]` that a request is silently ignored.
    pub drop_probability: f64,
    pub delay_min: Duration,
    pub delay_max: Duration,
}

impl Default for ImpairmentPolicy {
    fn default() -> Self {
        Self {
            drop_probability: 0.10,
            delay_min: Duration::from_millis(100),
            delay_max: Duration::from_millis(1000),
        }
    }
}

impl ImpairmentPolicy {
    /// Decide independently whether this request gets no reply at all.
    pub fn should_drop(&self, rng: &mut dyn RandomSource) -> bool {
        rng.next_unit() < self.drop_probability
    }

    /// Simulated service time before the reply is written.
    pub fn processing_delay(&self, rng: &mut dyn RandomSource) -> Duration {
        uniform(rng, self.delay_min, self.delay_max)
    }
}

/// Client-side pause between consecutive probes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSchedule {
    pub min: Duration,
    pub max: Duration,
}

impl Default for ProbeSchedule {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(300),
            max: Duration::from_millis(3000),
        }
    }
}

impl ProbeSchedule {
    pub fn next_pause(&self, rng: &mut dyn RandomSource) -> Duration {
        uniform(rng, self.min, self.max)
    }
}

/// Replays a fixed list of samples, then repeats the last one.
#[cfg(test)]
pub struct Scripted {
    samples: std::collections::VecDeque<f64>,
    last: f64,
}

#[cfg(test)]
impl Scripted {
    pub fn new(samples: &[f64]) -> Self {
        Self {
            samples: samples.iter().copied().collect(),
            last: samples.last().copied().unwrap_or(0.5),
        }
    }
}

#[cfg(test)]
impl RandomSource for Scripted {
    fn next_unit(&mut self) -> f64 {
        self.samples.pop_front().unwrap_or(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_decision_uses_threshold() {
        let policy = ImpairmentPolicy::default();
        let mut rng = Scripted::new(&[0.05, 0.10, 0.99]);
        assert!(policy.should_drop(&mut rng));
        assert!(!policy.should_drop(&mut rng));
        assert!(!policy.should_drop(&mut rng));
    }

    #[test]
    fn test_drop_rate_converges() {
        let policy = ImpairmentPolicy::default();
        let mut rng = SeededRng::from_seed(42);
        let samples = 20_000;
        let dropped = (0..samples)
            .filter(|_| policy.should_drop(&mut rng))
            .count();
        let rate = dropped as f64 / samples as f64;
        assert!((0.08..0.12).contains(&rate), "drop rate {rate}");
    }

    #[test]
    fn test_delay_stays_in_range() {
        let policy = ImpairmentPolicy::default();
        let mut rng = SeededRng::from_seed(7);
        for _ in 0..1000 {
            let delay = policy.processing_delay(&mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1000));
        }

        let mut rng = Scripted::new(&[0.0, 0.5]);
        assert_eq!(policy.processing_delay(&mut rng), Duration::from_millis(100));
        assert_eq!(policy.processing_delay(&mut rng), Duration::from_millis(550));
    }

    #[test]
    fn test_probe_pause_range() {
        let schedule = ProbeSchedule::default();
        let mut rng = Scripted::new(&[0.0]);
        assert_eq!(schedule.next_pause(&mut rng), Duration::from_millis(300));

        let fixed = ProbeSchedule {
            min: Duration::from_secs(1),
            max: Duration::from_secs(1),
        };
        assert_eq!(fixed.next_pause(&mut rng), Duration::from_secs(1));
    }

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = SeededRng::for_stream(Some(9), 3);
        let mut b = SeededRng::for_stream(Some(9), 3);
        let mut c = SeededRng::for_stream(Some(9), 4);
        let first_a: Vec<f64> = (0..4).map(|_| a.next_unit()).collect();
        let first_b: Vec<f64> = (0..4).map(|_| b.next_unit()).collect();
        let first_c: Vec<f64> = (0..4).map(|_| c.next_unit()).collect();
        assert_eq!(first_a, first_b);
        assert_ne!(first_a, first_c);
    }
}
