use flotilla_cluster::clock::WallClock;
use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Ranges from which each simulated node's clock is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Shared epoch all node clocks start from.
    pub base_millis: i64,
    /// Nominal wall time that passes per round.
    pub tick_millis: i64,
    /// Largest absolute rate error, in parts per million.
    pub max_abs_drift_ppm: i32,
    /// Largest absolute constant offset from the shared epoch.
    pub max_abs_skew_millis: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            base_millis: 1_760_000_000_000,
            tick_millis: 250,
            max_abs_drift_ppm: 200,
            // Larger than a tick so skew regularly reorders cross-node writes.
            max_abs_skew_millis: 400,
        }
    }
}

impl ClockConfig {
    /// Draw one node's clock parameters.
    #[must_use]
    pub fn assign(&self, rng: &mut DeterministicRng) -> ClockSpec {
        let drift = rng.symmetric(i64::from(self.max_abs_drift_ppm));
        ClockSpec {
            base_millis: self.base_millis,
            tick_millis: self.tick_millis,
            drift_ppm: i32::try_from(drift).unwrap_or(0),
            skew_millis: rng.symmetric(self.max_abs_skew_millis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSpec {
    pub base_millis: i64,
    pub tick_millis: i64,
    pub drift_ppm: i32,
    pub skew_millis: i64,
}

/// A node's wall clock, advanced by the simulator one round at a time.
///
/// Implements [`WallClock`] so it can be handed straight to the scanner and
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedClock {
    spec: ClockSpec,
    round: u64,
    frozen_at: Option<i64>,
}

impl SimulatedClock {
    #[must_use]
    pub const fn new(spec: ClockSpec) -> Self {
        Self {
            spec,
            round: 0,
            frozen_at: None,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> ClockSpec {
        self.spec
    }

    pub const fn set_round(&mut self, round: u64) {
        self.round = round;
    }

    /// Reading the clock would give at `round`, ignoring any freeze.
    #[must_use]
    pub fn reading_at(&self, round: u64) -> i64 {
        let rounds = i64::try_from(round).unwrap_or(i64::MAX);
        let elapsed = self.spec.tick_millis.saturating_mul(rounds);
        let drift = elapsed
            .saturating_mul(i64::from(self.spec.drift_ppm))
            .saturating_div(1_000_000);
        self.spec
            .base_millis
            .saturating_add(self.spec.skew_millis)
            .saturating_add(elapsed)
            .saturating_add(drift)
    }

    /// Stop the clock at its current reading.
    pub fn freeze(&mut self) {
        self.frozen_at = Some(self.reading_at(self.round));
    }

    pub const fn unfreeze(&mut self) {
        self.frozen_at = None;
    }

    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen_at.is_some()
    }
}

impl WallClock for SimulatedClock {
    fn now_millis(&self) -> i64 {
        self.frozen_at.unwrap_or_else(|| self.reading_at(self.round))
    }
}
