//! The board under test: lighting modes, per-cell test records, operator
//! messages and report export.

pub mod log;
pub mod message;
pub mod mode;
pub mod report;

pub use log::{Check, DpsLog, TestResults};
pub use message::MessageFormatter;
pub use mode::{LightingMode, ModeCycle};
