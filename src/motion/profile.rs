//! Per-axis motion constants and the trapezoidal pulse-period ramp.
//!
//! Speeds are expressed as pulse periods in microseconds, so "faster" means
//! a smaller number. A move starts at `slowest_period_us`, accelerates over
//! `accel_ramp_pulses` toward the cruise period, and decelerates back toward
//! `slowest_period_us` over the last `decel_ramp_pulses`.

use serde::{Deserialize, Serialize};

use crate::hardware::Level;

/// Static motion constants of one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisProfile {
    /// Resolution of the leadscrew and driver microstepping.
    pub steps_per_mm: f64,
    /// Shortest allowed pulse period (top speed).
    #[serde(default = "default_fastest_period")]
    pub fastest_period_us: u64,
    /// Longest pulse period, used at the start and end of every move.
    #[serde(default = "default_slowest_period")]
    pub slowest_period_us: u64,
    /// Pulses spent accelerating.
    #[serde(default = "default_ramp_pulses")]
    pub accel_ramp_pulses: u64,
    /// Pulses spent decelerating.
    #[serde(default = "default_ramp_pulses")]
    pub decel_ramp_pulses: u64,
    /// Direction pin polarity: when set, a low level moves toward positive
    /// coordinates. Differs between board revisions.
    #[serde(default = "default_invert_direction")]
    pub invert_direction: bool,
}

impl AxisProfile {
    /// Production timing for an axis with the given resolution.
    pub fn new(steps_per_mm: f64) -> Self {
        Self {
            steps_per_mm,
            fastest_period_us: default_fastest_period(),
            slowest_period_us: default_slowest_period(),
            accel_ramp_pulses: default_ramp_pulses(),
            decel_ramp_pulses: default_ramp_pulses(),
            invert_direction: default_invert_direction(),
        }
    }

    /// Nearest whole step for a distance in millimeters.
    pub fn to_steps(&self, mm: f64) -> i64 {
        (mm * self.steps_per_mm).round() as i64
    }

    /// Cruise period for a speed in percent; 100 % reaches the fastest period.
    pub fn target_period_us(&self, speed_percent: f64) -> u64 {
        let speed = speed_percent.clamp(0.0, 100.0);
        let span = self.span();
        (self.slowest_period_us as f64 - span * speed / 100.0).round() as u64
    }

    /// Period profile for a move of `total_pulses`.
    pub fn ramp(&self, total_pulses: u64, speed_percent: f64) -> Ramp {
        Ramp {
            total_pulses,
            target_period_us: self.target_period_us(speed_percent),
            slowest_period_us: self.slowest_period_us,
            span: self.span(),
            accel_ramp_pulses: self.accel_ramp_pulses,
            decel_ramp_pulses: self.decel_ramp_pulses,
        }
    }

    /// Level of the direction pin for travel toward positive (`true`) or
    /// negative coordinates.
    pub fn direction_level(&self, positive: bool) -> Level {
        Level::from_bool(positive != self.invert_direction)
    }

    fn span(&self) -> f64 {
        self.slowest_period_us.saturating_sub(self.fastest_period_us) as f64
    }
}

/// Per-pulse periods of one move.
///
/// The acceleration ramp and the deceleration ramp are evaluated
/// independently and both clamped to the cruise period; when they overlap on
/// a short move the slower of the two wins. The resulting profile falls
/// monotonically to its minimum and rises monotonically after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp {
    total_pulses: u64,
    target_period_us: u64,
    slowest_period_us: u64,
    span: f64,
    accel_ramp_pulses: u64,
    decel_ramp_pulses: u64,
}

impl Ramp {
    /// Number of pulses in the move.
    pub fn total_pulses(&self) -> u64 {
        self.total_pulses
    }

    /// Cruise period.
    pub fn target_period_us(&self) -> u64 {
        self.target_period_us
    }

    /// Period of pulse `index` (0-based).
    pub fn period_us(&self, index: u64) -> u64 {
        let mut period = self.target_period_us;

        if self.accel_ramp_pulses > 0 && index <= self.accel_ramp_pulses {
            period = period.max(self.interpolate(index, self.accel_ramp_pulses));
        }

        let remaining = self.total_pulses.saturating_sub(index);
        if self.decel_ramp_pulses > 0 && remaining <= self.decel_ramp_pulses {
            period = period.max(self.interpolate(remaining, self.decel_ramp_pulses));
        }

        period
    }

    /// All periods in pulse order.
    pub fn periods(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.total_pulses).map(|index| self.period_us(index))
    }

    /// Slowest period at 0, fastest at `length`.
    fn interpolate(&self, progress: u64, length: u64) -> u64 {
        let fraction = progress as f64 / length as f64;
        (self.slowest_period_us as f64 - self.span * fraction).round() as u64
    }
}

fn default_fastest_period() -> u64 {
    200
}

fn default_slowest_period() -> u64 {
    1000
}

fn default_ramp_pulses() -> u64 {
    400
}

fn default_invert_direction() -> bool {
    true
}
