//! Traffic generation policies.
//!
//! Periodic traffic fires at a fixed cadence; random traffic draws the gap
//! to the next attempt from an exponential distribution with the configured
//! mean, giving Poisson-like arrivals.

use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficMode {
    Periodic,
    Random,
}

impl std::fmt::Display for TrafficMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrafficMode::Periodic => write!(f, "Periodic"),
            TrafficMode::Random => write!(f, "Random"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrafficModel {
    mode: TrafficMode,
    interval: f64,
}

impl TrafficModel {
    pub fn new(mode: TrafficMode, interval: f64) -> Result<Self> {
        if !(interval > 0.0) || !interval.is_finite() {
            return Err(Error::invalid_parameter("packet interval must be positive"));
        }
        Ok(TrafficModel { mode, interval })
    }

    pub fn mode(&self) -> TrafficMode {
        self.mode
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Time of the first transmission attempt. Periodic nodes fire at t=0;
    /// random nodes draw an exponential initial gap.
    pub fn first_attempt<R: Rng>(&self, rng: &mut R) -> f64 {
        match self.mode {
            TrafficMode::Periodic => 0.0,
            TrafficMode::Random => self.next_gap(rng),
        }
    }

    /// Gap from one attempt to the next.
    pub fn next_gap<R: Rng>(&self, rng: &mut R) -> f64 {
        match self.mode {
            TrafficMode::Periodic => self.interval,
            TrafficMode::Random => Exp::new(1.0 / self.interval).unwrap().sample(rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn periodic_gap_is_the_interval() {
        let tm = TrafficModel::new(TrafficMode::Periodic, 10.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(tm.first_attempt(&mut rng), 0.0);
        assert_eq!(tm.next_gap(&mut rng), 10.0);
    }

    #[test]
    fn random_gaps_average_near_interval() {
        let tm = TrafficModel::new(TrafficMode::Random, 20.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let mean: f64 = (0..n).map(|_| tm.next_gap(&mut rng)).sum::<f64>() / n as f64;
        assert!((mean - 20.0).abs() < 1.0, "mean gap {mean}");
    }

    #[test]
    fn non_positive_interval_rejected() {
        assert!(TrafficModel::new(TrafficMode::Periodic, 0.0).is_err());
        assert!(TrafficModel::new(TrafficMode::Random, -1.0).is_err());
    }
}
