//! Custom error types for the application.
//!
//! This module defines the primary error type, `CncError`, together with the
//! narrower errors raised by the hardware, motion and programmer layers. Each
//! layer owns its own `thiserror` enum and `CncError` absorbs them through
//! `#[from]`, so the command surface and the binary can use `?` throughout.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating the figment configuration failed.
//! - **`Hardware`**: a GPIO or ADC backend returned an I/O failure.
//! - **`Motion`**: a move was rejected (zero speed) or a pin write failed mid-move.
//! - **`Programmer`**: the flashing tool could not be launched or timed out.
//! - **`UnknownPlate` / `UnknownFirmware` / `CellOutOfRange` / `NotConfigured`**:
//!   operator input that the runner refuses without changing state.
//! - **`InvalidState`**: a console command raced with the worker and the state
//!   no longer accepts it.
//! - **`Json` / `Csv`**: report serialization failed.
//!
//! Not everything is an error. An out-of-spec measurement is a normal boolean
//! outcome stored in the `DpsLog`, an unavailable ADC reading is `None`, and a
//! state-machine precondition violation on the programmatic surface is a panic
//! because it means the calling layer is broken.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::motion::Axis;
use crate::runner::{Command, RunnerState};

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CncError>;

/// Top-level error for the fixture.
#[derive(Error, Debug)]
pub enum CncError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pin or ADC backend failure.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// A stepper move was rejected or interrupted by a hardware fault.
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),

    /// The external flashing tool failed to run.
    #[error("Programmer error: {0}")]
    Programmer(#[from] ProgrammerError),

    /// No plate with this name exists in the configuration.
    #[error("Unknown plate '{0}'")]
    UnknownPlate(String),

    /// No firmware recipe with this name exists in the configuration.
    #[error("Unknown firmware '{0}'")]
    UnknownFirmware(String),

    /// Requested start cell lies outside the selected plate.
    #[error("Cell [{column},{row}] is outside the {columns}x{rows} plate")]
    CellOutOfRange {
        /// Requested column.
        column: u32,
        /// Requested row.
        row: u32,
        /// Plate column count.
        columns: u32,
        /// Plate row count.
        rows: u32,
    },

    /// A plate and a firmware must be selected before a cycle can start.
    #[error("No {0} selected")]
    NotConfigured(&'static str),

    /// An operator command arrived in a state that does not accept it,
    /// typically because the worker moved the state on in the meantime.
    #[error("{command:?} is not allowed in state {state}")]
    InvalidState {
        /// Rejected command.
        command: Command,
        /// State at the time of the command.
        state: RunnerState,
    },

    /// A paused cycle has no cell left to continue from.
    #[error("Nothing to resume")]
    NothingToResume,

    /// A blocking task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Report export failed.
    #[error("Report error: {0}")]
    Report(String),

    /// JSON report serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV report writing failed.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Plain I/O error (report files, stdin).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a [`DigitalIo`](crate::hardware::DigitalIo) backend.
#[derive(Error, Debug)]
pub enum HardwareError {
    /// The backend could not access a GPIO line.
    #[error("GPIO {pin}: {source}")]
    Gpio {
        /// BCM pin number.
        pin: u8,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The backend returned a value that is neither 0 nor 1.
    #[error("GPIO {pin}: unexpected value '{value}'")]
    InvalidLevel {
        /// BCM pin number.
        pin: u8,
        /// Raw value read.
        value: String,
    },
}

/// Failures of a single stepper move.
#[derive(Error, Debug)]
pub enum MotionError {
    /// Speed must lie in (0, 100].
    #[error("Invalid speed {0}% (must be greater than 0)")]
    InvalidSpeed(f64),

    /// A pin write failed while pulsing.
    #[error("Axis {axis}: {source}")]
    Hardware {
        /// Axis being moved.
        axis: Axis,
        /// Underlying pin failure.
        #[source]
        source: HardwareError,
    },
}

/// Failures invoking the external programming tool.
///
/// A nonzero exit code is not an error: it is returned as a normal outcome
/// for the caller to inspect.
#[derive(Error, Debug)]
pub enum ProgrammerError {
    /// The tool could not be started at all.
    #[error("Failed to launch {}: {source}", tool.display())]
    Launch {
        /// Tool path.
        tool: PathBuf,
        /// Spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// The tool did not finish within the configured timeout and was killed.
    #[error("Programmer did not finish within {0:?}")]
    Timeout(Duration),
}
