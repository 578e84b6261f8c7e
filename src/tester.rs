//! Electrical test of a freshly programmed DPS.
//!
//! The tester powers the board, reads the LED current, the button LED
//! voltage and the feedback resistor voltage through the ADC, and judges
//! each against the firmware recipe. It also presses the mode button to walk
//! the firmware's lighting modes.
//!
//! ADC wiring (ADS1115):
//!
//! | Input | Signal | Gain |
//! |---|---|---|
//! | P0-P1 | ACS723 output against its reference | 8 |
//! | P0, P1 | shunt high / low side | 1 / 4 |
//! | P2 | feedback resistor | 8 |
//! | P3 | button LED | 2/3 |
//!
//! Every reading averages `samples` conversions after a short gain settle.
//! A reading with any unanswered conversion is `None`, and `None` never
//! passes a check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{CurrentSense, FirmwareConfig, FirmwareKind, Range, TesterConfig};
use crate::dps::{Check, LightingMode, ModeCycle, TestResults};
use crate::error::HardwareError;
use crate::hardware::{AdcInput, AnalogInput, Delay, FixtureBoard, Gain};

/// Current-sense amplifier, differential.
pub const ACS723_INPUT: AdcInput = AdcInput::Differential(0, 1);
/// High side of the LED shunt.
pub const SHUNT_HIGH_INPUT: AdcInput = AdcInput::Single(0);
/// Low side of the LED shunt.
pub const SHUNT_LOW_INPUT: AdcInput = AdcInput::Single(1);
/// Feedback resistor.
pub const FEEDBACK_INPUT: AdcInput = AdcInput::Single(2);
/// Button LED.
pub const BUTTON_LED_INPUT: AdcInput = AdcInput::Single(3);

/// LED current window for a lighting mode of a firmware.
///
/// # Panics
///
/// When the mode has no current range for this firmware kind (for
/// example blinking). Asking for it is a bug in the calling profile.
#[allow(clippy::panic)]
pub fn allowed_range(firmware: &FirmwareConfig, mode: LightingMode) -> Range {
    match (firmware.kind, mode) {
        (FirmwareKind::Flash, LightingMode::Strong) | (FirmwareKind::MaxOnly, LightingMode::Max) => {
            firmware.led_current_primary_ma
        }
        (FirmwareKind::Flash, LightingMode::Light) => match firmware.led_current_secondary_ma {
            Some(range) => range,
            None => panic!("FLASH firmware {} has no secondary LED current range", firmware.file_name()),
        },
        (kind, mode) => panic!("{kind} firmware has no LED current range for {mode} mode"),
    }
}

/// Measurement front end of the fixture.
pub struct Tester {
    board: FixtureBoard,
    adc: Arc<dyn AnalogInput>,
    delay: Arc<dyn Delay>,
    config: TesterConfig,
    offset_mv: f64,
    mode: Option<ModeCycle>,
}

impl Tester {
    /// Create a tester using the default ACS723 offset until [`prepare`](Self::prepare).
    pub fn new(
        board: FixtureBoard,
        adc: Arc<dyn AnalogInput>,
        delay: Arc<dyn Delay>,
        config: TesterConfig,
    ) -> Self {
        Self {
            offset_mv: config.default_offset_mv,
            board,
            adc,
            delay,
            config,
            mode: None,
        }
    }

    /// Stored zero-current amplifier output.
    pub fn offset_mv(&self) -> f64 {
        self.offset_mv
    }

    /// Lighting mode the board should be in, once a profile has started.
    pub fn mode(&self) -> Option<LightingMode> {
        self.mode.map(|cycle| cycle.current())
    }

    /// Ground the ICSP lines, calibrate the current-sense offset with the
    /// board unpowered, then power the board.
    pub fn prepare(&mut self) -> Result<(), HardwareError> {
        self.board.inactivate_icsp()?;
        self.board.dps_inactivate()?;

        if self.config.current_sense == CurrentSense::Acs723 {
            match self.sample(ACS723_INPUT, Gain::Eight) {
                Some(offset) => {
                    debug!(offset_mv = offset, "current-sense offset calibrated");
                    self.offset_mv = offset;
                }
                None => {
                    warn!(
                        offset_mv = self.config.default_offset_mv,
                        "offset calibration unavailable, using default"
                    );
                    self.offset_mv = self.config.default_offset_mv;
                }
            }
        }

        self.board.dps_activate()?;
        self.mode = None;
        Ok(())
    }

    /// Switch the board off.
    pub fn power_down(&self) -> Result<(), HardwareError> {
        self.board.dps_inactivate()
    }

    /// LED current in mA with the configured sense method.
    pub fn measure_led_current(&self) -> Option<f64> {
        match self.config.current_sense {
            CurrentSense::Acs723 => {
                let mv = self.sample(ACS723_INPUT, Gain::Eight)?;
                Some((mv - self.offset_mv) * self.config.acs723_ma_per_mv)
            }
            CurrentSense::Shunt => {
                let high = self.sample(SHUNT_HIGH_INPUT, Gain::One)?;
                let low = self.sample(SHUNT_LOW_INPUT, Gain::Four)?;
                Some((high - low) / self.config.shunt_ohms)
            }
        }
    }

    /// Button LED voltage in mV.
    pub fn measure_button_led_voltage(&self) -> Option<f64> {
        self.sample(BUTTON_LED_INPUT, Gain::TwoThirds)
    }

    /// Feedback resistor voltage in mV.
    pub fn measure_feedback_voltage(&self) -> Option<f64> {
        self.sample(FEEDBACK_INPUT, Gain::Eight)
    }

    /// Press the mode button and step the expected lighting mode.
    pub fn advance_test_mode(
        &mut self,
        firmware: &FirmwareConfig,
    ) -> Result<LightingMode, HardwareError> {
        let cycle = self.mode.get_or_insert_with(|| ModeCycle::new(firmware.kind));
        let mode = cycle.advance();
        self.board
            .button_hold(firmware.button_hold(), self.delay.as_ref())?;
        debug!(%mode, "lighting mode advanced");
        Ok(mode)
    }

    /// LED current in the current mode against that mode's window.
    pub fn test_led_current(&self, firmware: &FirmwareConfig) -> Check {
        let mode = self
            .mode
            .unwrap_or_else(|| ModeCycle::new(firmware.kind))
            .current();
        let range = allowed_range(firmware, mode);
        let check = Check::evaluate(self.measure_led_current(), range);
        info!(%mode, current_ma = ?check.value, passed = check.passed, "LED current");
        check
    }

    /// Run the profile matching the firmware kind.
    pub fn run_profile(&mut self, firmware: &FirmwareConfig) -> Result<TestResults, HardwareError> {
        match firmware.kind {
            FirmwareKind::Flash => self.run_flash_profile(firmware),
            FirmwareKind::MaxOnly => self.run_maxonly_profile(firmware),
        }
    }

    /// Strong and light mode currents plus both voltages, then power down.
    pub fn run_flash_profile(
        &mut self,
        firmware: &FirmwareConfig,
    ) -> Result<TestResults, HardwareError> {
        self.mode = Some(ModeCycle::new(firmware.kind));
        self.delay.delay(self.settle());

        let mut results = self.measure_voltages(firmware);
        results.led_current_primary = Some(self.test_led_current(firmware));

        self.advance_test_mode(firmware)?;
        self.delay.delay(self.mode_settle());
        results.led_current_secondary = Some(self.test_led_current(firmware));

        self.power_down()?;
        Ok(results)
    }

    /// Max mode current plus both voltages, then power down.
    pub fn run_maxonly_profile(
        &mut self,
        firmware: &FirmwareConfig,
    ) -> Result<TestResults, HardwareError> {
        self.mode = Some(ModeCycle::new(firmware.kind));
        self.delay.delay(self.settle());

        self.advance_test_mode(firmware)?;
        self.delay.delay(self.mode_settle());

        let mut results = self.measure_voltages(firmware);
        results.led_current_primary = Some(self.test_led_current(firmware));

        self.power_down()?;
        Ok(results)
    }

    fn measure_voltages(&self, firmware: &FirmwareConfig) -> TestResults {
        let button = Check::evaluate(self.measure_button_led_voltage(), firmware.button_led_voltage_mv);
        let feedback = Check::evaluate(self.measure_feedback_voltage(), firmware.feedback_voltage_mv);
        info!(
            button_led_mv = ?button.value,
            feedback_mv = ?feedback.value,
            "voltages"
        );
        TestResults {
            button_led_voltage: Some(button),
            feedback_voltage: Some(feedback),
            ..TestResults::default()
        }
    }

    fn sample(&self, input: AdcInput, gain: Gain) -> Option<f64> {
        self.delay
            .delay(Duration::from_millis(self.config.sample_interval_ms));

        let samples = self.config.samples.max(1);
        let mut sum = 0.0;
        for _ in 0..samples {
            sum += self.adc.read_millivolts(input, gain)?;
        }
        Some(sum / f64::from(samples))
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.config.settle_ms)
    }

    fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.config.mode_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinConfig;
    use crate::hardware::mock::{DpsBehavior, MockAdc, MockIo, NoDelay, SimulatedDps};
    use crate::hardware::Level;
    use std::path::PathBuf;

    fn flash_firmware() -> FirmwareConfig {
        FirmwareConfig {
            path: PathBuf::from("thule_flash.hex"),
            kind: FirmwareKind::Flash,
            button_hold_ms: 300,
            led_current_primary_ma: Range::new(90.0, 110.0),
            led_current_secondary_ma: Some(Range::new(40.0, 60.0)),
            button_led_voltage_mv: Range::new(1800.0, 2200.0),
            feedback_voltage_mv: Range::new(100.0, 140.0),
        }
    }

    fn max_firmware() -> FirmwareConfig {
        FirmwareConfig {
            path: PathBuf::from("thule_max.hex"),
            kind: FirmwareKind::MaxOnly,
            led_current_secondary_ma: None,
            ..flash_firmware()
        }
    }

    fn simulated(kind: FirmwareKind, behavior: DpsBehavior) -> (Arc<SimulatedDps>, Tester) {
        let dps = Arc::new(SimulatedDps::with_behavior(PinConfig::default(), kind, behavior));
        let board = FixtureBoard::new(dps.clone(), PinConfig::default());
        let tester = Tester::new(board, dps.clone(), Arc::new(NoDelay), TesterConfig::default());
        (dps, tester)
    }

    fn mocked(config: TesterConfig) -> (Arc<MockIo>, Arc<MockAdc>, Tester) {
        let io = Arc::new(MockIo::new());
        let adc = Arc::new(MockAdc::new());
        let board = FixtureBoard::new(io.clone(), PinConfig::default());
        let tester = Tester::new(board, adc.clone(), Arc::new(NoDelay), config);
        (io, adc, tester)
    }

    #[test]
    fn test_prepare_calibrates_then_powers() {
        let (io, adc, mut tester) = mocked(TesterConfig::default());
        adc.set(ACS723_INPUT, 170.0);

        tester.prepare().unwrap();

        assert_eq!(tester.offset_mv(), 170.0);
        assert_eq!(io.level(22), Some(Level::Low));
        assert_eq!(io.level(27), Some(Level::Low));
        // off for calibration, then on (active low)
        assert_eq!(io.writes_to(23), vec![Level::High, Level::Low]);
    }

    #[test]
    fn test_prepare_falls_back_to_default_offset() {
        let (_io, adc, mut tester) = mocked(TesterConfig::default());
        adc.set_available(false);
        tester.prepare().unwrap();
        assert_eq!(tester.offset_mv(), 167.0);
    }

    #[test]
    fn test_acs723_current_averages_samples() {
        let (_io, adc, tester) = mocked(TesterConfig::default());
        adc.queue(ACS723_INPUT, [205.0, 207.0, 209.0, 207.0, 207.0]);

        let current = tester.measure_led_current().unwrap();
        assert!((current - 100.0).abs() < 1e-9);
        assert_eq!(adc.reads().len(), 5);
        assert!(adc.reads().iter().all(|(_, gain)| *gain == Gain::Eight));
    }

    #[test]
    fn test_shunt_current() {
        let config = TesterConfig {
            current_sense: CurrentSense::Shunt,
            ..TesterConfig::default()
        };
        let (_io, adc, tester) = mocked(config);
        adc.set(SHUNT_HIGH_INPUT, 1050.0);
        adc.set(SHUNT_LOW_INPUT, 50.0);
        assert_eq!(tester.measure_led_current(), Some(100.0));
    }

    #[test]
    fn test_one_missing_sample_makes_reading_unavailable() {
        let (_io, adc, tester) = mocked(TesterConfig::default());
        adc.queue(FEEDBACK_INPUT, [120.0, 120.0]);
        assert_eq!(tester.measure_feedback_voltage(), None);
    }

    #[test]
    fn test_flash_profile_on_healthy_board() {
        let (dps, mut tester) = simulated(FirmwareKind::Flash, DpsBehavior::default());
        let fw = flash_firmware();

        tester.prepare().unwrap();
        let results = tester.run_flash_profile(&fw).unwrap();

        let primary = results.led_current_primary.unwrap();
        let secondary = results.led_current_secondary.unwrap();
        assert!((primary.value.unwrap() - 100.0).abs() < 1e-6);
        assert!((secondary.value.unwrap() - 50.0).abs() < 1e-6);
        assert!(results.checks().all(|check| check.passed));
        assert_eq!(tester.mode(), Some(LightingMode::Light));
        assert!(!dps.is_powered());
    }

    #[test]
    fn test_flash_profile_flags_weak_light_mode() {
        let behavior = DpsBehavior {
            secondary_ma: 30.0,
            ..DpsBehavior::default()
        };
        let (_dps, mut tester) = simulated(FirmwareKind::Flash, behavior);
        tester.prepare().unwrap();
        let results = tester.run_profile(&flash_firmware()).unwrap();

        assert!(results.led_current_primary.unwrap().passed);
        assert!(!results.led_current_secondary.unwrap().passed);
    }

    #[test]
    fn test_maxonly_profile_measures_max_mode() {
        let (dps, mut tester) = simulated(FirmwareKind::MaxOnly, DpsBehavior::default());
        tester.prepare().unwrap();
        let results = tester.run_profile(&max_firmware()).unwrap();

        assert!(results.led_current_secondary.is_none());
        assert!(results.led_current_primary.unwrap().passed);
        assert!(results.checks().all(|check| check.passed));
        assert_eq!(tester.mode(), Some(LightingMode::Max));
        assert!(!dps.is_powered());
    }

    #[test]
    fn test_unavailable_adc_fails_every_check() {
        let (io, adc, mut tester) = mocked(TesterConfig::default());
        adc.set_available(false);
        tester.prepare().unwrap();
        let results = tester.run_profile(&flash_firmware()).unwrap();

        assert_eq!(results.checks().count(), 4);
        assert!(results.checks().all(|check| !check.passed && check.value.is_none()));
        // button pressed once to reach the light mode, board powered down
        assert_eq!(io.writes_to(18), vec![Level::Low, Level::High]);
        assert_eq!(io.level(23), Some(Level::High));
    }

    #[test]
    fn test_allowed_ranges() {
        let flash = flash_firmware();
        assert_eq!(allowed_range(&flash, LightingMode::Strong), Range::new(90.0, 110.0));
        assert_eq!(allowed_range(&flash, LightingMode::Light), Range::new(40.0, 60.0));
        assert_eq!(
            allowed_range(&max_firmware(), LightingMode::Max),
            Range::new(90.0, 110.0)
        );
    }

    #[test]
    #[should_panic(expected = "no LED current range for blinking mode")]
    fn test_blinking_has_no_range() {
        allowed_range(&flash_firmware(), LightingMode::Blinking);
    }

    #[test]
    #[should_panic(expected = "no LED current range for strong mode")]
    fn test_mode_of_other_kind_has_no_range() {
        allowed_range(&max_firmware(), LightingMode::Strong);
    }
}
