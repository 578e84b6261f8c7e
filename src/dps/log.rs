//! Per-cell test record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Range;
use crate::runner::Cell;

/// One measured value against its acceptance window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Check {
    /// Measured value; `None` when the ADC did not answer.
    pub value: Option<f64>,
    /// Window the value was judged against.
    pub range: Range,
    /// Whether the value lies inside the window. Unavailable values fail.
    pub passed: bool,
}

impl Check {
    /// Judge `value` against `range`, inclusive at both ends.
    pub fn evaluate(value: Option<f64>, range: Range) -> Self {
        Self {
            value,
            range,
            passed: value.is_some_and(|v| range.contains(v)),
        }
    }
}

/// Electrical results of one test profile. Checks the profile does not run
/// stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    /// LED current in the strong / max mode (mA).
    pub led_current_primary: Option<Check>,
    /// LED current in the light mode (mA), FLASH only.
    pub led_current_secondary: Option<Check>,
    /// Button LED voltage (mV).
    pub button_led_voltage: Option<Check>,
    /// Feedback resistor voltage (mV).
    pub feedback_voltage: Option<Check>,
}

impl TestResults {
    /// The populated checks.
    pub fn checks(&self) -> impl Iterator<Item = &Check> {
        [
            &self.led_current_primary,
            &self.led_current_secondary,
            &self.button_led_voltage,
            &self.feedback_voltage,
        ]
        .into_iter()
        .flatten()
    }
}

/// Outcome of programming and testing one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpsLog {
    /// Grid cell.
    pub cell: Cell,
    /// When the record was created.
    pub tested_at: DateTime<Utc>,
    /// The programmer exited with 0.
    pub fw_uploaded: bool,
    /// Captured programmer output, or the reason it could not run.
    pub fw_upload_message: String,
    /// Electrical checks; empty when flashing failed.
    pub results: TestResults,
    /// Pin or ADC failure that cut the test short.
    #[serde(default)]
    pub fixture_error: Option<String>,
}

impl DpsLog {
    /// Fresh record for a cell with nothing done yet.
    pub fn new(cell: Cell) -> Self {
        Self {
            cell,
            tested_at: Utc::now(),
            fw_uploaded: false,
            fw_upload_message: String::new(),
            results: TestResults::default(),
            fixture_error: None,
        }
    }

    /// Upload succeeded, the test ran to the end and every check passed.
    pub fn operation_successful(&self) -> bool {
        self.fw_uploaded
            && self.fixture_error.is_none()
            && self.results.checks().all(|check| check.passed)
    }
}
