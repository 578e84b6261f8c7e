//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DPSCNC_`
//!
//! Nested keys are separated by a double underscore so that field names with
//! single underscores survive:
//!
//! ```text
//! DPSCNC_MACHINE__FLASH_TIMEOUT_SECS=90
//! DPSCNC_LOGGING__LEVEL=debug
//! DPSCNC_AXES__Z__INVERT_DIRECTION=false
//! ```
//!
//! Every section has defaults matching the production fixture, so a file only
//! needs to declare its plates and firmware recipes.
//!
//! # Example
//!
//! ```rust,ignore
//! use dps_cnc::config::Settings;
//!
//! let settings = Settings::load_from("config/dps_cnc.toml")?;
//! let plate = settings.plate("thule_4x3")?;
//! println!("{} x {}", plate.columns, plate.rows);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CncError;
use crate::motion::{Axis, AxisProfile};
use crate::runner::Cell;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parsing or merging the providers failed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are not usable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Resolved fixture configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Global machine settings.
    #[serde(default)]
    pub machine: MachineConfig,
    /// Loop intervals and fixed delays.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Per-axis motion profiles.
    #[serde(default)]
    pub axes: AxesConfig,
    /// Pin assignment of the controller board.
    #[serde(default)]
    pub pins: PinConfig,
    /// Measurement policy.
    #[serde(default)]
    pub tester: TesterConfig,
    /// Report export.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Plate geometries by name.
    #[serde(default)]
    pub plates: BTreeMap<String, PlateConfig>,
    /// Firmware recipes by name.
    #[serde(default)]
    pub firmware: BTreeMap<String, FirmwareConfig>,
}

impl Settings {
    /// Load settings from a TOML file with `DPSCNC_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::LoadError`] when the file cannot be parsed and
    /// [`ConfigError::ValidationError`] when a value is out of range.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DPSCNC_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from an in-memory TOML document, without environment
    /// overrides.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::new()
            .merge(Toml::string(document))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let machine = &self.machine;
        if !(machine.speed_percent > 0.0 && machine.speed_percent <= 100.0) {
            return Err(ConfigError::ValidationError(format!(
                "machine.speed_percent must be in (0, 100], got {}",
                machine.speed_percent
            )));
        }
        if machine.flash_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "machine.flash_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if machine.z_minimum_safe_height_mm > machine.z_moving_height_mm {
            return Err(ConfigError::ValidationError(format!(
                "machine.z_minimum_safe_height_mm ({}) is above z_moving_height_mm ({})",
                machine.z_minimum_safe_height_mm, machine.z_moving_height_mm
            )));
        }
        if machine.z_minimum_safe_height_mm < 0.0 {
            return Err(ConfigError::ValidationError(
                "machine.z_minimum_safe_height_mm must not be negative".to_string(),
            ));
        }

        for axis in Axis::ALL {
            validate_axis(axis, self.axes.get(axis))?;
        }

        if self.tester.samples == 0 {
            return Err(ConfigError::ValidationError(
                "tester.samples must be at least 1".to_string(),
            ));
        }
        if self.tester.shunt_ohms <= 0.0 {
            return Err(ConfigError::ValidationError(
                "tester.shunt_ohms must be positive".to_string(),
            ));
        }

        for (name, plate) in &self.plates {
            plate.validate(name)?;
        }
        for (name, firmware) in &self.firmware {
            firmware.validate(name)?;
        }

        Ok(())
    }

    /// Look up a plate geometry by name.
    pub fn plate(&self, name: &str) -> Result<&PlateConfig, CncError> {
        self.plates
            .get(name)
            .ok_or_else(|| CncError::UnknownPlate(name.to_string()))
    }

    /// Look up a firmware recipe by name.
    pub fn firmware(&self, name: &str) -> Result<&FirmwareConfig, CncError> {
        self.firmware
            .get(name)
            .ok_or_else(|| CncError::UnknownFirmware(name.to_string()))
    }
}

fn validate_axis(axis: Axis, profile: &AxisProfile) -> Result<(), ConfigError> {
    if profile.steps_per_mm <= 0.0 {
        return Err(ConfigError::ValidationError(format!(
            "axes.{axis}.steps_per_mm must be positive"
        )));
    }
    if profile.fastest_period_us == 0 {
        return Err(ConfigError::ValidationError(format!(
            "axes.{axis}.fastest_period_us must be greater than 0"
        )));
    }
    if profile.fastest_period_us > profile.slowest_period_us {
        return Err(ConfigError::ValidationError(format!(
            "axes.{axis}: fastest_period_us ({}) exceeds slowest_period_us ({})",
            profile.fastest_period_us, profile.slowest_period_us
        )));
    }
    Ok(())
}

// =============================================================================
// Machine & Timing
// =============================================================================

/// Global machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Path of the ICSP programming tool.
    #[serde(default = "default_programmer_tool")]
    pub programmer_tool: PathBuf,
    /// Upper bound for one programmer invocation.
    #[serde(default = "default_flash_timeout")]
    pub flash_timeout_secs: u64,
    /// Z height used while travelling between cells.
    #[serde(default = "default_z_moving_height")]
    pub z_moving_height_mm: f64,
    /// Below this Z height, X/Y travel risks hitting the boards.
    #[serde(default = "default_z_minimum_safe_height")]
    pub z_minimum_safe_height_mm: f64,
    /// Cruise speed for every move, percent of the axis maximum.
    #[serde(default = "default_speed_percent")]
    pub speed_percent: f64,
    /// Y travel away from the last cell once the grid is done.
    #[serde(default = "default_pull_back")]
    pub pull_back_mm: f64,
}

impl MachineConfig {
    /// Programmer timeout as a [`Duration`].
    pub fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            programmer_tool: default_programmer_tool(),
            flash_timeout_secs: default_flash_timeout(),
            z_moving_height_mm: default_z_moving_height(),
            z_minimum_safe_height_mm: default_z_minimum_safe_height(),
            speed_percent: default_speed_percent(),
            pull_back_mm: default_pull_back(),
        }
    }
}

/// Loop intervals and fixed delays, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Worker loop poll interval.
    #[serde(default = "default_worker_poll")]
    pub worker_poll_ms: u64,
    /// Telemetry publish interval.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_ms: u64,
    /// Pre-delay before the Y and Z moves of a cell.
    #[serde(default = "default_axis_stagger")]
    pub axis_stagger_ms: u64,
    /// Wait after lowering the head before flashing.
    #[serde(default = "default_contact_settle")]
    pub contact_settle_ms: u64,
    /// How long shutdown waits for each background loop.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl TimingConfig {
    /// Worker poll interval.
    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    /// Telemetry interval.
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    /// Inter-axis stagger.
    pub fn axis_stagger(&self) -> Duration {
        Duration::from_millis(self.axis_stagger_ms)
    }

    /// Contact settle delay.
    pub fn contact_settle(&self) -> Duration {
        Duration::from_millis(self.contact_settle_ms)
    }

    /// Shutdown join timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            worker_poll_ms: default_worker_poll(),
            telemetry_interval_ms: default_telemetry_interval(),
            axis_stagger_ms: default_axis_stagger(),
            contact_settle_ms: default_contact_settle(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

// =============================================================================
// Axes & Pins
// =============================================================================

/// Motion profiles of the three axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxesConfig {
    /// X axis.
    #[serde(default = "default_xy_axis")]
    pub x: AxisProfile,
    /// Y axis.
    #[serde(default = "default_xy_axis")]
    pub y: AxisProfile,
    /// Z axis.
    #[serde(default = "default_z_axis")]
    pub z: AxisProfile,
}

impl AxesConfig {
    /// Profile of one axis.
    pub fn get(&self, axis: Axis) -> &AxisProfile {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self {
            x: default_xy_axis(),
            y: default_xy_axis(),
            z: default_z_axis(),
        }
    }
}

/// BCM pin numbers of the controller board.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    /// X step output.
    pub x_step: u8,
    /// X direction output.
    pub x_dir: u8,
    /// Y step output.
    pub y_step: u8,
    /// Y direction output.
    pub y_dir: u8,
    /// Z step output.
    pub z_step: u8,
    /// Z direction output.
    pub z_dir: u8,
    /// DPS supply switch.
    pub dps_power: u8,
    /// DPS mode button.
    pub dps_button: u8,
    /// ICSP data line.
    pub icsp_pgd: u8,
    /// ICSP clock line.
    pub icsp_pgc: u8,
    /// Head contact probe input.
    pub head_contact: u8,
    /// DPS supply is switched on by a low level.
    pub power_active_low: bool,
    /// DPS button is pressed by a low level.
    pub button_active_low: bool,
}

impl PinConfig {
    /// Step and direction pins of one axis.
    pub fn axis(&self, axis: Axis) -> AxisPins {
        match axis {
            Axis::X => AxisPins {
                step: self.x_step,
                dir: self.x_dir,
            },
            Axis::Y => AxisPins {
                step: self.y_step,
                dir: self.y_dir,
            },
            Axis::Z => AxisPins {
                step: self.z_step,
                dir: self.z_dir,
            },
        }
    }
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            x_step: 20,
            x_dir: 21,
            y_step: 5,
            y_dir: 6,
            z_step: 13,
            z_dir: 19,
            dps_power: 23,
            dps_button: 18,
            icsp_pgd: 22,
            icsp_pgc: 27,
            head_contact: 24,
            power_active_low: true,
            button_active_low: true,
        }
    }
}

/// Step/direction pair of one stepper driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisPins {
    /// Step pulse output.
    pub step: u8,
    /// Direction output.
    pub dir: u8,
}

// =============================================================================
// Tester, Storage & Logging
// =============================================================================

/// How the LED current is sensed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurrentSense {
    /// Hall-effect amplifier on differential input 0-1.
    Acs723,
    /// Voltage drop across the shunt resistor.
    Shunt,
}

/// Measurement policy of the tester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// LED current sensing method.
    #[serde(default = "default_current_sense")]
    pub current_sense: CurrentSense,
    /// ACS723 transfer ratio.
    #[serde(default = "default_acs723_ratio")]
    pub acs723_ma_per_mv: f64,
    /// ACS723 output at zero current, used until the first calibration.
    #[serde(default = "default_offset_mv")]
    pub default_offset_mv: f64,
    /// Shunt resistance.
    #[serde(default = "default_shunt_ohms")]
    pub shunt_ohms: f64,
    /// Samples averaged per reading.
    #[serde(default = "default_samples")]
    pub samples: u32,
    /// Delay after changing the ADC gain.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    /// Electrical settle time after power-up.
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Settle time after switching the lighting mode.
    #[serde(default = "default_mode_settle")]
    pub mode_settle_ms: u64,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            current_sense: default_current_sense(),
            acs723_ma_per_mv: default_acs723_ratio(),
            default_offset_mv: default_offset_mv(),
            shunt_ohms: default_shunt_ohms(),
            samples: default_samples(),
            sample_interval_ms: default_sample_interval(),
            settle_ms: default_settle(),
            mode_settle_ms: default_mode_settle(),
        }
    }
}

/// File format of exported cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    /// One row per cell.
    #[default]
    Csv,
    /// Pretty-printed array of logs.
    Json,
}

/// Report export settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for cycle reports; nothing is written when unset.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    /// Report file format.
    #[serde(default)]
    pub format: ReportFormat,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// =============================================================================
// Plates & Firmware
// =============================================================================

/// Grid geometry of one plate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateConfig {
    /// Number of columns (X).
    pub columns: u32,
    /// Number of rows (Y).
    pub rows: u32,
    /// X position of cell (0, 0).
    pub x_offset_mm: f64,
    /// Y position of cell (0, 0).
    pub y_offset_mm: f64,
    /// Column pitch.
    pub x_spacing_mm: f64,
    /// Row pitch.
    pub y_spacing_mm: f64,
}

impl PlateConfig {
    /// Whether `cell` lies on this plate.
    pub fn contains(&self, cell: Cell) -> bool {
        cell.column < self.columns && cell.row < self.rows
    }

    /// Gantry X/Y coordinates of a cell.
    pub fn cell_position_mm(&self, cell: Cell) -> (f64, f64) {
        (
            f64::from(cell.column) * self.x_spacing_mm + self.x_offset_mm,
            f64::from(cell.row) * self.y_spacing_mm + self.y_offset_mm,
        )
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.columns == 0 || self.rows == 0 {
            return Err(ConfigError::ValidationError(format!(
                "plates.{name}: grid must have at least one column and one row"
            )));
        }
        let values = [
            self.x_offset_mm,
            self.y_offset_mm,
            self.x_spacing_mm,
            self.y_spacing_mm,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "plates.{name}: offsets and spacing must be non-negative"
            )));
        }
        Ok(())
    }
}

/// Which lighting modes a firmware image implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    /// A single full-brightness mode.
    MaxOnly,
    /// Strong, light and blinking modes.
    Flash,
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareKind::MaxOnly => write!(f, "MAX_ONLY"),
            FirmwareKind::Flash => write!(f, "FLASH"),
        }
    }
}

/// Inclusive acceptance window, written as `[low, high]` in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Range {
    /// Lowest accepted value.
    pub low: f64,
    /// Highest accepted value.
    pub high: f64,
}

impl Range {
    /// Create a window.
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// `low <= value <= high`.
    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }
}

impl From<[f64; 2]> for Range {
    fn from([low, high]: [f64; 2]) -> Self {
        Self { low, high }
    }
}

impl From<Range> for [f64; 2] {
    fn from(range: Range) -> Self {
        [range.low, range.high]
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

/// Test recipe for one firmware image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Image to flash.
    pub path: PathBuf,
    /// Lighting mode set of the image.
    pub kind: FirmwareKind,
    /// How long the mode button is held to advance the mode.
    #[serde(default = "default_button_hold")]
    pub button_hold_ms: u64,
    /// LED current window in the primary mode.
    pub led_current_primary_ma: Range,
    /// LED current window in the secondary mode (FLASH only).
    #[serde(default)]
    pub led_current_secondary_ma: Option<Range>,
    /// Button LED voltage window.
    pub button_led_voltage_mv: Range,
    /// Feedback resistor voltage window.
    pub feedback_voltage_mv: Range,
}

impl FirmwareConfig {
    /// Button hold as a [`Duration`].
    pub fn button_hold(&self) -> Duration {
        Duration::from_millis(self.button_hold_ms)
    }

    /// File name of the image, for operator messages.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.kind == FirmwareKind::Flash && self.led_current_secondary_ma.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "firmware.{name}: flash firmware needs led_current_secondary_ma"
            )));
        }
        let ranges = [
            ("led_current_primary_ma", Some(self.led_current_primary_ma)),
            ("led_current_secondary_ma", self.led_current_secondary_ma),
            ("button_led_voltage_mv", Some(self.button_led_voltage_mv)),
            ("feedback_voltage_mv", Some(self.feedback_voltage_mv)),
        ];
        for (field, range) in ranges {
            if let Some(range) = range {
                if range.low > range.high {
                    return Err(ConfigError::ValidationError(format!(
                        "firmware.{name}.{field}: low {} is above high {}",
                        range.low, range.high
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Defaults
// =============================================================================

fn default_programmer_tool() -> PathBuf {
    PathBuf::from("/usr/local/bin/p14")
}

fn default_flash_timeout() -> u64 {
    120
}

fn default_z_moving_height() -> f64 {
    7.5
}

fn default_z_minimum_safe_height() -> f64 {
    5.0
}

fn default_speed_percent() -> f64 {
    100.0
}

fn default_pull_back() -> f64 {
    50.0
}

fn default_worker_poll() -> u64 {
    100
}

fn default_telemetry_interval() -> u64 {
    1000
}

fn default_axis_stagger() -> u64 {
    100
}

fn default_contact_settle() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_xy_axis() -> AxisProfile {
    AxisProfile::new(320.0)
}

fn default_z_axis() -> AxisProfile {
    AxisProfile::new(400.0)
}

fn default_current_sense() -> CurrentSense {
    CurrentSense::Acs723
}

fn default_acs723_ratio() -> f64 {
    2.5
}

fn default_offset_mv() -> f64 {
    167.0
}

fn default_shunt_ohms() -> f64 {
    10.0
}

fn default_samples() -> u32 {
    5
}

fn default_sample_interval() -> u64 {
    10
}

fn default_settle() -> u64 {
    500
}

fn default_mode_settle() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_button_hold() -> u64 {
    300
}
