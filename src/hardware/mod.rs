//! Hardware capability traits.
//!
//! The motion, tester and runner layers never touch a GPIO register or an ADC
//! bus directly. They receive these small injected interfaces instead, which
//! lets the whole fixture run against [`mock`] backends in tests and in
//! `--simulate` mode.
//!
//! # Capabilities
//!
//! - [`DigitalIo`] - direction/read/write of numbered GPIO lines
//! - [`AnalogInput`] - one voltage sample from a single-ended or differential input
//! - [`Delay`] - blocking microsecond waits used for pulse timing and settle times
//!
//! All traits are synchronous. Pulse generation runs on a blocking thread and
//! needs sub-millisecond waits that an async timer cannot deliver.

pub mod board;
pub mod mock;
pub mod sysfs;

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::HardwareError;

pub use board::FixtureBoard;

// =============================================================================
// Digital I/O
// =============================================================================

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// 0 V.
    Low,
    /// Supply voltage.
    High,
}

impl Level {
    /// `High` for `true`.
    pub fn from_bool(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }

    /// `true` for `High`.
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl std::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

/// Direction of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    /// Sampled by [`DigitalIo::read`].
    Input,
    /// Driven by [`DigitalIo::write`].
    Output,
}

/// Numbered GPIO lines of a controller board.
///
/// Implementations use interior mutability: the stepper and the tester share
/// one board from different threads, each touching its own pins.
pub trait DigitalIo: Send + Sync {
    /// Configure a line as input or output.
    fn set_mode(&self, pin: u8, mode: PinMode) -> Result<(), HardwareError>;

    /// Drive an output line.
    fn write(&self, pin: u8, level: Level) -> Result<(), HardwareError>;

    /// Sample a line.
    fn read(&self, pin: u8) -> Result<Level, HardwareError>;
}

// =============================================================================
// Analog input
// =============================================================================

/// ADC input selection (ADS1115 multiplexer naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdcInput {
    /// Input `n` against ground.
    Single(u8),
    /// Input `p` against input `n`.
    Differential(u8, u8),
}

impl fmt::Display for AdcInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdcInput::Single(n) => write!(f, "P{n}"),
            AdcInput::Differential(p, n) => write!(f, "P{p}-P{n}"),
        }
    }
}

/// Programmable gain of the ADC front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gain {
    /// ±6.144 V full scale.
    TwoThirds,
    /// ±4.096 V full scale.
    One,
    /// ±2.048 V full scale.
    Two,
    /// ±1.024 V full scale.
    Four,
    /// ±0.512 V full scale.
    Eight,
    /// ±0.256 V full scale.
    Sixteen,
}

impl Gain {
    /// Full-scale range in millivolts.
    pub fn full_scale_mv(self) -> f64 {
        match self {
            Gain::TwoThirds => 6144.0,
            Gain::One => 4096.0,
            Gain::Two => 2048.0,
            Gain::Four => 1024.0,
            Gain::Eight => 512.0,
            Gain::Sixteen => 256.0,
        }
    }

    /// Millivolts per LSB of a 16-bit conversion.
    pub fn mv_per_lsb(self) -> f64 {
        self.full_scale_mv() / 32768.0
    }
}

/// Voltage source for electrical checks.
pub trait AnalogInput: Send + Sync {
    /// One sample in millivolts, or `None` when the converter does not answer.
    fn read_millivolts(&self, input: AdcInput, gain: Gain) -> Option<f64>;
}

// =============================================================================
// Delays
// =============================================================================

/// Blocking wait used for step pulses and settle times.
pub trait Delay: Send + Sync {
    /// Block for `us` microseconds.
    fn delay_us(&self, us: u64);

    /// Block for `duration`.
    fn delay(&self, duration: Duration) {
        self.delay_us(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }
}

/// Below this, `SpinDelay` busy-waits instead of asking the scheduler.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Wall-clock delay with microsecond accuracy.
///
/// Sleeps for the bulk of the interval and spins for the last
/// `SPIN_THRESHOLD`, since `thread::sleep` overshoots by tens of
/// microseconds on a stock kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpinDelay;

impl Delay for SpinDelay {
    fn delay_us(&self, us: u64) {
        let duration = Duration::from_micros(us);
        let deadline = Instant::now() + duration;
        if duration > SPIN_THRESHOLD {
            thread::sleep(duration - SPIN_THRESHOLD);
        }
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}
