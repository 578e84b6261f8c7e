//! Gantry motion: axes, step-counter positions, ramp profiles and the
//! pulse-generating stepper driver.

pub mod profile;
pub mod stepper;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use profile::{AxisProfile, Ramp};
pub use stepper::{MoveOutcome, StepperDriver};

/// Linear axis of the gantry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Columns of the plate.
    X,
    /// Rows of the plate.
    Y,
    /// Head height; 0 is contact.
    Z,
}

impl Axis {
    /// All axes in X, Y, Z order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into per-axis arrays.
    pub const fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            other => Err(format!("unknown axis '{other}'")),
        }
    }
}

/// Step counters of the three axes.
///
/// Home is the origin. Counters may go negative during relative moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    steps: [i64; 3],
}

impl Position {
    /// All counters zero.
    pub const ORIGIN: Position = Position { steps: [0; 3] };

    /// Position from explicit counters.
    pub const fn new(x: i64, y: i64, z: i64) -> Self {
        Self { steps: [x, y, z] }
    }

    /// Counter of one axis.
    pub fn get(&self, axis: Axis) -> i64 {
        self.steps[axis.index()]
    }

    /// Overwrite the counter of one axis.
    pub fn set(&mut self, axis: Axis, steps: i64) {
        self.steps[axis.index()] = steps;
    }

    /// Add `delta` steps to one axis.
    pub fn increment(&mut self, axis: Axis, delta: i64) {
        self.steps[axis.index()] += delta;
    }

    /// Millimeters of one axis for the given resolution.
    pub fn to_millimeters(&self, axis: Axis, steps_per_mm: f64) -> f64 {
        self.get(axis) as f64 / steps_per_mm
    }

    /// Whether every counter is zero.
    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }
}

/// Gantry position in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionMm {
    /// X in mm.
    pub x: f64,
    /// Y in mm.
    pub y: f64,
    /// Z in mm.
    pub z: f64,
}

impl PositionMm {
    /// Coordinate of one axis.
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

impl fmt::Display for PositionMm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2}) mm", self.x, self.y, self.z)
    }
}
