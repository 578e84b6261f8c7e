//! Linux sysfs backends for the Raspberry Pi controller.
//!
//! `SysfsGpio` drives lines through `/sys/class/gpio` and `IioAdc` reads an
//! ADS1115 bound to the kernel `ti-ads1015` IIO driver. Both take their root
//! directory as a parameter so tests can point them at a temporary tree.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::error::HardwareError;

use super::{AdcInput, AnalogInput, DigitalIo, Gain, Level, PinMode};

/// Default sysfs GPIO root.
pub const GPIO_ROOT: &str = "/sys/class/gpio";

/// Default IIO device of the ADS1115.
pub const IIO_DEVICE: &str = "/sys/bus/iio/devices/iio:device0";

// =============================================================================
// GPIO
// =============================================================================

/// GPIO lines through the sysfs class interface.
pub struct SysfsGpio {
    root: PathBuf,
    exported: Mutex<HashSet<u8>>,
}

impl SysfsGpio {
    /// Backend on [`GPIO_ROOT`].
    pub fn new() -> Self {
        Self::with_root(GPIO_ROOT)
    }

    /// Backend on a custom root directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: Mutex::new(HashSet::new()),
        }
    }

    fn line_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn ensure_exported(&self, pin: u8) -> Result<PathBuf, HardwareError> {
        let dir = self.line_dir(pin);
        let mut exported = self
            .exported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if exported.contains(&pin) {
            return Ok(dir);
        }
        if !dir.exists() {
            debug!(pin, "exporting GPIO line");
            fs::write(self.root.join("export"), pin.to_string())
                .map_err(|source| HardwareError::Gpio { pin, source })?;
        }
        exported.insert(pin);
        Ok(dir)
    }

    fn write_attr(&self, pin: u8, attr: &str, value: &str) -> Result<(), HardwareError> {
        let dir = self.ensure_exported(pin)?;
        fs::write(dir.join(attr), value).map_err(|source| HardwareError::Gpio { pin, source })
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalIo for SysfsGpio {
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), HardwareError> {
        let value = match mode {
            PinMode::Input => "in",
            PinMode::Output => "out",
        };
        self.write_attr(pin, "direction", value)
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), HardwareError> {
        self.write_attr(pin, "value", if level.is_high() { "1" } else { "0" })
    }

    fn read(&self, pin: u8) -> Result<Level, HardwareError> {
        let dir = self.ensure_exported(pin)?;
        let raw = fs::read_to_string(dir.join("value"))
            .map_err(|source| HardwareError::Gpio { pin, source })?;
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(HardwareError::InvalidLevel {
                pin,
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// ADC
// =============================================================================

/// ADS1115 through the Linux IIO subsystem.
///
/// Each read writes the channel scale for the requested gain, then converts
/// `raw * scale` to millivolts. Any I/O failure reads as unavailable.
pub struct IioAdc {
    device: PathBuf,
}

impl IioAdc {
    /// Converter at [`IIO_DEVICE`].
    pub fn new() -> Self {
        Self::with_device(IIO_DEVICE)
    }

    /// Converter at a custom device directory.
    pub fn with_device(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    fn channel_name(input: AdcInput) -> String {
        match input {
            AdcInput::Single(n) => format!("in_voltage{n}"),
            AdcInput::Differential(p, n) => format!("in_voltage{p}-voltage{n}"),
        }
    }

    fn sample(&self, input: AdcInput, gain: Gain) -> io::Result<f64> {
        let channel = Self::channel_name(input);
        let scale = format!("{:.9}", gain.mv_per_lsb());
        fs::write(self.device.join(format!("{channel}_scale")), &scale)?;

        let raw = read_trimmed(&self.device.join(format!("{channel}_raw")))?;
        let raw: i64 = raw
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(raw as f64 * gain.mv_per_lsb())
    }
}

impl Default for IioAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogInput for IioAdc {
    fn read_millivolts(&self, input: AdcInput, gain: Gain) -> Option<f64> {
        match self.sample(input, gain) {
            Ok(mv) => Some(mv),
            Err(err) => {
                warn!(%input, error = %err, "ADC read failed");
                None
            }
        }
    }
}

fn read_trimmed(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gpio_writes_attributes() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("gpio20")).unwrap();
        let gpio = SysfsGpio::with_root(root.path());

        gpio.set_mode(20, PinMode::Output).unwrap();
        gpio.write(20, Level::High).unwrap();

        let dir = root.path().join("gpio20");
        assert_eq!(fs::read_to_string(dir.join("direction")).unwrap(), "out");
        assert_eq!(gpio.read(20).unwrap(), Level::High);
    }

    #[test]
    fn test_gpio_exports_missing_line() {
        let root = tempdir().unwrap();
        let gpio = SysfsGpio::with_root(root.path());

        // the export file is written, but a plain directory never grows the line
        assert!(gpio.write(5, Level::Low).is_err());
        assert_eq!(
            fs::read_to_string(root.path().join("export")).unwrap(),
            "5"
        );
    }

    #[test]
    fn test_gpio_rejects_garbage_level() {
        let root = tempdir().unwrap();
        let dir = root.path().join("gpio24");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("value"), "x\n").unwrap();

        let gpio = SysfsGpio::with_root(root.path());
        assert!(matches!(
            gpio.read(24),
            Err(HardwareError::InvalidLevel { pin: 24, .. })
        ));
    }

    #[test]
    fn test_iio_reads_scaled_value() {
        let device = tempdir().unwrap();
        fs::write(device.path().join("in_voltage0-voltage1_raw"), "13248\n").unwrap();
        let adc = IioAdc::with_device(device.path());

        let mv = adc
            .read_millivolts(AdcInput::Differential(0, 1), Gain::Eight)
            .unwrap();
        assert!((mv - 207.0).abs() < 1e-9);
        assert_eq!(
            fs::read_to_string(device.path().join("in_voltage0-voltage1_scale")).unwrap(),
            "0.015625000"
        );
    }

    #[test]
    fn test_iio_missing_channel_is_unavailable() {
        let device = tempdir().unwrap();
        let adc = IioAdc::with_device(device.path().join("absent"));
        assert_eq!(adc.read_millivolts(AdcInput::Single(3), Gain::TwoThirds), None);
    }
}
