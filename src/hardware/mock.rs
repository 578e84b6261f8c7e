//! Mock Hardware Implementations
//!
//! Provides simulated hardware for tests and for `--simulate` runs without
//! physical hardware.
//!
//! # Available Mocks
//!
//! - `MockIo` - GPIO backend that records every write and counts step edges
//! - `MockAdc` - ADC with fixed or queued per-input readings and an
//!   availability switch
//! - `SimulatedDps` - GPIO + ADC pair that behaves like a healthy DPS board:
//!   it follows the power and button pins and answers measurements accordingly
//! - `NoDelay` / `RecordingDelay` - delays that return immediately
//!
//! None of the mocks sleep, so a full raster cycle runs in milliseconds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::{FirmwareKind, PinConfig};
use crate::error::HardwareError;

use super::{AdcInput, AnalogInput, Delay, DigitalIo, Gain, Level, PinMode};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockIo - Recording GPIO Backend
// =============================================================================

/// One recorded output write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinWrite {
    /// BCM pin number.
    pub pin: u8,
    /// Level written.
    pub level: Level,
}

#[derive(Default)]
struct IoState {
    levels: HashMap<u8, Level>,
    modes: HashMap<u8, PinMode>,
    history: Vec<PinWrite>,
    rising_edges: HashMap<u8, usize>,
    failing: HashSet<u8>,
}

/// GPIO backend that keeps every line in memory.
///
/// Unwritten lines read as `Low`. Inputs can be forced with
/// [`MockIo::set_input`], and writes to a pin can be made to fail with
/// [`MockIo::fail_pin`].
///
/// # Example
///
/// ```rust,ignore
/// let io = MockIo::new();
/// io.write(20, Level::High)?;
/// io.write(20, Level::Low)?;
/// assert_eq!(io.rising_edges(20), 1);
/// ```
#[derive(Default)]
pub struct MockIo {
    state: Mutex<IoState>,
}

impl MockIo {
    /// Create a backend with every line low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of a line, if it was ever written or forced.
    pub fn level(&self, pin: u8) -> Option<Level> {
        lock(&self.state).levels.get(&pin).copied()
    }

    /// Configured direction of a line.
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        lock(&self.state).modes.get(&pin).copied()
    }

    /// All writes in order.
    pub fn writes(&self) -> Vec<PinWrite> {
        lock(&self.state).history.clone()
    }

    /// Levels written to one pin, in order.
    pub fn writes_to(&self, pin: u8) -> Vec<Level> {
        lock(&self.state)
            .history
            .iter()
            .filter(|write| write.pin == pin)
            .map(|write| write.level)
            .collect()
    }

    /// Low-to-high transitions seen on a pin.
    pub fn rising_edges(&self, pin: u8) -> usize {
        lock(&self.state)
            .rising_edges
            .get(&pin)
            .copied()
            .unwrap_or(0)
    }

    /// Force the level an input reads back.
    pub fn set_input(&self, pin: u8, level: Level) {
        lock(&self.state).levels.insert(pin, level);
    }

    /// Make every following write to `pin` fail.
    pub fn fail_pin(&self, pin: u8) {
        lock(&self.state).failing.insert(pin);
    }

    /// Forget recorded writes and edge counts, keeping current levels.
    pub fn clear_history(&self) {
        let mut state = lock(&self.state);
        state.history.clear();
        state.rising_edges.clear();
    }
}

impl DigitalIo for MockIo {
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), HardwareError> {
        lock(&self.state).modes.insert(pin, mode);
        Ok(())
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        if state.failing.contains(&pin) {
            return Err(HardwareError::Gpio {
                pin,
                source: io::Error::new(io::ErrorKind::BrokenPipe, "injected write failure"),
            });
        }
        let previous = state.levels.insert(pin, level).unwrap_or(Level::Low);
        if previous == Level::Low && level == Level::High {
            *state.rising_edges.entry(pin).or_insert(0) += 1;
        }
        state.history.push(PinWrite { pin, level });
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, HardwareError> {
        Ok(self.level(pin).unwrap_or(Level::Low))
    }
}

// =============================================================================
// MockAdc - Scripted Analog Input
// =============================================================================

struct AdcState {
    available: bool,
    fixed: HashMap<AdcInput, f64>,
    queued: HashMap<AdcInput, VecDeque<f64>>,
    reads: Vec<(AdcInput, Gain)>,
}

/// ADC returning scripted millivolt values.
///
/// Queued values are consumed first; after that the fixed value of the input
/// is returned. An input with neither reads as unavailable.
pub struct MockAdc {
    state: Mutex<AdcState>,
}

impl MockAdc {
    /// Create a responsive ADC with no readings configured.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AdcState {
                available: true,
                fixed: HashMap::new(),
                queued: HashMap::new(),
                reads: Vec::new(),
            }),
        }
    }

    /// Set the steady reading of an input.
    pub fn set(&self, input: AdcInput, millivolts: f64) {
        lock(&self.state).fixed.insert(input, millivolts);
    }

    /// Queue readings returned before the steady value.
    pub fn queue(&self, input: AdcInput, millivolts: impl IntoIterator<Item = f64>) {
        lock(&self.state)
            .queued
            .entry(input)
            .or_default()
            .extend(millivolts);
    }

    /// Simulate a converter that stops answering.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// Every read so far with its gain.
    pub fn reads(&self) -> Vec<(AdcInput, Gain)> {
        lock(&self.state).reads.clone()
    }
}

impl Default for MockAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogInput for MockAdc {
    fn read_millivolts(&self, input: AdcInput, gain: Gain) -> Option<f64> {
        let mut state = lock(&self.state);
        state.reads.push((input, gain));
        if !state.available {
            return None;
        }
        if let Some(value) = state.queued.get_mut(&input).and_then(VecDeque::pop_front) {
            return Some(value);
        }
        state.fixed.get(&input).copied()
    }
}

// =============================================================================
// SimulatedDps - Behavioral Board Model
// =============================================================================

/// Electrical behavior of a healthy simulated DPS.
#[derive(Debug, Clone, PartialEq)]
pub struct DpsBehavior {
    /// Current-sense amplifier output at zero current.
    pub offset_mv: f64,
    /// Amplifier transfer ratio.
    pub ma_per_mv: f64,
    /// Shunt resistance seen by the shunt method.
    pub shunt_ohms: f64,
    /// LED current in the strong / max mode.
    pub primary_ma: f64,
    /// LED current in the light mode.
    pub secondary_ma: f64,
    /// Button LED voltage while powered.
    pub button_led_mv: f64,
    /// Feedback resistor voltage while powered.
    pub feedback_mv: f64,
}

impl Default for DpsBehavior {
    fn default() -> Self {
        Self {
            offset_mv: 167.0,
            ma_per_mv: 2.5,
            shunt_ohms: 10.0,
            primary_ma: 100.0,
            secondary_ma: 50.0,
            button_led_mv: 2000.0,
            feedback_mv: 120.0,
        }
    }
}

struct DpsModel {
    kind: FirmwareKind,
    powered: bool,
    presses: usize,
}

/// A fixture wired to one well-behaved DPS.
///
/// Writes go to an inner [`MockIo`]. Writes to the power pin switch the
/// board on or off (resetting its lighting mode), and presses of the mode
/// button advance the mode. Measurements then return what that mode draws.
pub struct SimulatedDps {
    io: MockIo,
    pins: PinConfig,
    behavior: DpsBehavior,
    model: Mutex<DpsModel>,
}

impl SimulatedDps {
    /// Simulated board running firmware of `kind`.
    pub fn new(pins: PinConfig, kind: FirmwareKind) -> Self {
        Self::with_behavior(pins, kind, DpsBehavior::default())
    }

    /// Simulated board with custom electrical values.
    pub fn with_behavior(pins: PinConfig, kind: FirmwareKind, behavior: DpsBehavior) -> Self {
        Self {
            io: MockIo::new(),
            pins,
            behavior,
            model: Mutex::new(DpsModel {
                kind,
                powered: false,
                presses: 0,
            }),
        }
    }

    /// Change the firmware the simulated board runs.
    pub fn set_kind(&self, kind: FirmwareKind) {
        lock(&self.model).kind = kind;
    }

    /// Whether the board is powered.
    pub fn is_powered(&self) -> bool {
        lock(&self.model).powered
    }

    /// Recording backend behind the model.
    pub fn io(&self) -> &MockIo {
        &self.io
    }

    fn led_current_ma(&self, model: &DpsModel) -> f64 {
        if !model.powered {
            return 0.0;
        }
        let b = &self.behavior;
        match model.kind {
            // strong, light, blinking
            FirmwareKind::Flash => [b.primary_ma, b.secondary_ma, b.primary_ma / 2.0]
                [model.presses % 3],
            // off, max
            FirmwareKind::MaxOnly => [0.0, b.primary_ma][model.presses % 2],
        }
    }
}

impl DigitalIo for SimulatedDps {
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), HardwareError> {
        self.io.set_mode(pin, mode)
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), HardwareError> {
        self.io.write(pin, level)?;

        let mut model = lock(&self.model);
        if pin == self.pins.dps_power {
            let powered = (level == Level::Low) == self.pins.power_active_low;
            if powered && !model.powered {
                model.presses = 0;
            }
            model.powered = powered;
        } else if pin == self.pins.dps_button {
            let pressed = (level == Level::Low) == self.pins.button_active_low;
            if pressed && model.powered {
                model.presses += 1;
            }
        }
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, HardwareError> {
        self.io.read(pin)
    }
}

impl AnalogInput for SimulatedDps {
    fn read_millivolts(&self, input: AdcInput, _gain: Gain) -> Option<f64> {
        let model = lock(&self.model);
        let current = self.led_current_ma(&model);
        let b = &self.behavior;
        let powered = if model.powered { 1.0 } else { 0.0 };

        match input {
            AdcInput::Differential(0, 1) => Some(b.offset_mv + current / b.ma_per_mv),
            AdcInput::Single(0) => Some(current * b.shunt_ohms),
            AdcInput::Single(1) => Some(0.0),
            AdcInput::Single(2) => Some(b.feedback_mv * powered),
            AdcInput::Single(3) => Some(b.button_led_mv * powered),
            _ => None,
        }
    }
}

// =============================================================================
// Delays
// =============================================================================

/// Delay that returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_us(&self, _us: u64) {}
}

/// Delay that returns immediately and remembers what it was asked for.
#[derive(Default)]
pub struct RecordingDelay {
    requests: Mutex<Vec<u64>>,
}

impl RecordingDelay {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested waits in microseconds, in order.
    pub fn requests(&self) -> Vec<u64> {
        lock(&self.requests).clone()
    }

    /// Sum of all requested waits in microseconds.
    pub fn total_us(&self) -> u64 {
        lock(&self.requests).iter().sum()
    }
}

impl Delay for RecordingDelay {
    fn delay_us(&self, us: u64) {
        lock(&self.requests).push(us);
    }
}
