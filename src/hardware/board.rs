//! Pin roles of the fixture controller board.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::PinConfig;
use crate::error::HardwareError;
use crate::motion::Axis;

use super::{Delay, DigitalIo, Level, PinMode};

/// DPS power, mode button, ICSP lines and stepper outputs on top of a
/// [`DigitalIo`] backend.
#[derive(Clone)]
pub struct FixtureBoard {
    io: Arc<dyn DigitalIo>,
    pins: PinConfig,
}

impl FixtureBoard {
    /// Wrap a backend with the given pin assignment.
    pub fn new(io: Arc<dyn DigitalIo>, pins: PinConfig) -> Self {
        Self { io, pins }
    }

    /// Underlying backend, shared with the stepper driver.
    pub fn io(&self) -> Arc<dyn DigitalIo> {
        Arc::clone(&self.io)
    }

    /// Pin assignment.
    pub fn pins(&self) -> &PinConfig {
        &self.pins
    }

    /// Configure line directions and park the DPS unpowered with the button
    /// released, so that nothing is clicked or powered during start-up.
    pub fn init(&self) -> Result<(), HardwareError> {
        for axis in Axis::ALL {
            let pins = self.pins.axis(axis);
            self.io.set_mode(pins.step, PinMode::Output)?;
            self.io.set_mode(pins.dir, PinMode::Output)?;
        }
        self.io.set_mode(self.pins.head_contact, PinMode::Input)?;
        self.io.set_mode(self.pins.dps_power, PinMode::Output)?;
        self.io.set_mode(self.pins.dps_button, PinMode::Output)?;

        self.release_button()?;
        self.dps_inactivate()
    }

    /// Switch the DPS supply on.
    pub fn dps_activate(&self) -> Result<(), HardwareError> {
        debug!("DPS power on");
        self.io
            .write(self.pins.dps_power, active(self.pins.power_active_low))
    }

    /// Switch the DPS supply off.
    pub fn dps_inactivate(&self) -> Result<(), HardwareError> {
        debug!("DPS power off");
        self.io
            .write(self.pins.dps_power, !active(self.pins.power_active_low))
    }

    /// Press the mode button for `hold`, then release it.
    pub fn button_hold(&self, hold: Duration, delay: &dyn Delay) -> Result<(), HardwareError> {
        self.io
            .write(self.pins.dps_button, active(self.pins.button_active_low))?;
        delay.delay(hold);
        self.release_button()
    }

    fn release_button(&self) -> Result<(), HardwareError> {
        self.io
            .write(self.pins.dps_button, !active(self.pins.button_active_low))
    }

    /// Ground the ICSP data and clock lines so they do not back-power the
    /// board while it is measured unpowered.
    pub fn inactivate_icsp(&self) -> Result<(), HardwareError> {
        for pin in [self.pins.icsp_pgd, self.pins.icsp_pgc] {
            self.io.set_mode(pin, PinMode::Output)?;
            self.io.write(pin, Level::Low)?;
        }
        Ok(())
    }

    /// Whether the head contact probe reports contact.
    pub fn head_in_contact(&self) -> Result<bool, HardwareError> {
        Ok(self.io.read(self.pins.head_contact)?.is_high())
    }

    /// Drive every output to its inert level: stepper lines low, DPS
    /// unpowered, button released.
    pub fn release(&self) -> Result<(), HardwareError> {
        for axis in Axis::ALL {
            let pins = self.pins.axis(axis);
            self.io.write(pins.step, Level::Low)?;
            self.io.write(pins.dir, Level::Low)?;
        }
        self.release_button()?;
        self.dps_inactivate()
    }
}

fn active(active_low: bool) -> Level {
    if active_low {
        Level::Low
    } else {
        Level::High
    }
}
