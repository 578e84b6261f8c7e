//! Core library of the DPS programming fixture.
//!
//! A three-axis stepper gantry carries a spring-loaded test head over a plate
//! of DPS boards. For every cell of the plate the fixture lowers the head,
//! flashes the firmware through an external ICSP tool and checks the LED
//! current, the button LED voltage and the feedback resistor voltage against
//! the firmware recipe.
//!
//! - [`hardware`]: pin, ADC and delay abstractions with mock and sysfs backends
//! - [`motion`]: ramped step generation and position keeping
//! - [`tester`]: measurement policy and test profiles
//! - [`programmer`]: the external flashing tool
//! - [`dps`]: per-cell records, operator messages and reports
//! - [`runner`]: the state machine and the automatic raster cycle
//!
//! The `dps_cnc` binary wraps a [`runner::Runner`] in a line-oriented
//! operator console.

pub mod config;
pub mod dps;
pub mod error;
pub mod hardware;
pub mod motion;
pub mod programmer;
pub mod runner;
pub mod tester;

pub use error::{AppResult, CncError};
