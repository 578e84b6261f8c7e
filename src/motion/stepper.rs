//! Step/direction pulse generation for the three gantry axes.
//!
//! Every move blocks the calling thread for its physical duration, so the
//! runner calls these methods from `spawn_blocking`. One move runs at a time;
//! the position counters are only mutated by the pulse loop.
//!
//! # Cancellation
//!
//! [`StepperDriver::halt`] clears the `running` flag. The pulse loop checks it
//! before every pulse, so a move stops within one pulse period (at most
//! `slowest_period_us`, about 1 ms with production profiles) and reports
//! [`MoveOutcome::Cancelled`] with the counter left on the last emitted step.
//! The flag stays cleared until [`StepperDriver::arm`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::{AxesConfig, AxisPins, PinConfig};
use crate::error::{HardwareError, MotionError};
use crate::hardware::{Delay, DigitalIo, Level};

use super::{Axis, AxisProfile, Position, PositionMm};

/// How a move ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The target step was reached.
    Completed,
    /// The running flag was cleared before the target was reached.
    Cancelled,
}

impl MoveOutcome {
    /// Whether the move reached its target.
    pub fn is_completed(self) -> bool {
        self == MoveOutcome::Completed
    }
}

struct AxisChannel {
    profile: AxisProfile,
    pins: AxisPins,
}

/// Pulse generator and position keeper for the X, Y and Z steppers.
pub struct StepperDriver {
    io: Arc<dyn DigitalIo>,
    delay: Arc<dyn Delay>,
    axes: [AxisChannel; 3],
    position: Mutex<Position>,
    running: AtomicBool,
}

impl StepperDriver {
    /// Create a driver at the origin, armed.
    pub fn new(
        io: Arc<dyn DigitalIo>,
        delay: Arc<dyn Delay>,
        profiles: &AxesConfig,
        pins: &PinConfig,
    ) -> Self {
        let channel = |axis: Axis| AxisChannel {
            profile: profiles.get(axis).clone(),
            pins: pins.axis(axis),
        };
        Self {
            io,
            delay,
            axes: [channel(Axis::X), channel(Axis::Y), channel(Axis::Z)],
            position: Mutex::new(Position::ORIGIN),
            running: AtomicBool::new(true),
        }
    }

    /// Motion constants of one axis.
    pub fn profile(&self, axis: Axis) -> &AxisProfile {
        &self.axes[axis.index()].profile
    }

    fn position_guard(&self) -> MutexGuard<'_, Position> {
        self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consistent snapshot of all three counters.
    pub fn current_position_steps(&self) -> Position {
        *self.position_guard()
    }

    /// Snapshot converted to millimeters.
    pub fn current_position_mm(&self) -> PositionMm {
        let steps = self.current_position_steps();
        PositionMm {
            x: steps.to_millimeters(Axis::X, self.profile(Axis::X).steps_per_mm),
            y: steps.to_millimeters(Axis::Y, self.profile(Axis::Y).steps_per_mm),
            z: steps.to_millimeters(Axis::Z, self.profile(Axis::Z).steps_per_mm),
        }
    }

    /// Declare the current physical position to be the origin.
    pub fn reset_origin(&self) {
        *self.position_guard() = Position::ORIGIN;
    }

    /// Whether moves are allowed to pulse.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Allow moves to pulse again after [`halt`](Self::halt).
    pub fn arm(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Stop the move in flight at the next pulse boundary.
    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Move one axis to an absolute coordinate.
    ///
    /// # Arguments
    /// * `target_mm` - destination, rounded to the nearest step
    /// * `speed_percent` - cruise speed in (0, 100]; larger values are clamped
    /// * `pre_delay` - wait before the first pulse
    ///
    /// # Errors
    ///
    /// [`MotionError::InvalidSpeed`] for a non-positive speed and
    /// [`MotionError::Hardware`] when a pin write fails.
    pub fn move_to_absolute(
        &self,
        axis: Axis,
        target_mm: f64,
        speed_percent: f64,
        pre_delay: Duration,
    ) -> Result<MoveOutcome, MotionError> {
        let target = self.profile(axis).to_steps(target_mm);
        self.move_to_step(axis, target, speed_percent, pre_delay)
    }

    /// Move one axis by a signed distance.
    pub fn move_relative(
        &self,
        axis: Axis,
        delta_mm: f64,
        speed_percent: f64,
    ) -> Result<MoveOutcome, MotionError> {
        let target = self.current_position_steps().get(axis) + self.profile(axis).to_steps(delta_mm);
        self.move_to_step(axis, target, speed_percent, Duration::ZERO)
    }

    /// Drive Z, then X, then Y back to step 0.
    pub fn go_home(&self, speed_percent: f64) -> Result<MoveOutcome, MotionError> {
        if self.current_position_steps().is_origin() {
            return Ok(MoveOutcome::Completed);
        }
        for axis in [Axis::Z, Axis::X, Axis::Y] {
            let outcome = self.move_to_step(axis, 0, speed_percent, Duration::ZERO)?;
            if outcome == MoveOutcome::Cancelled {
                return Ok(outcome);
            }
        }
        Ok(MoveOutcome::Completed)
    }

    /// Step-domain mover behind every public move.
    #[instrument(level = "debug", skip(self, pre_delay))]
    pub fn move_to_step(
        &self,
        axis: Axis,
        target: i64,
        speed_percent: f64,
        pre_delay: Duration,
    ) -> Result<MoveOutcome, MotionError> {
        if speed_percent.is_nan() || speed_percent <= 0.0 {
            return Err(MotionError::InvalidSpeed(speed_percent));
        }
        let speed_percent = speed_percent.min(100.0);

        let current = self.current_position_steps().get(axis);
        let delta = target - current;
        if delta == 0 {
            return Ok(MoveOutcome::Completed);
        }

        if !pre_delay.is_zero() {
            self.delay.delay(pre_delay);
        }

        let channel = &self.axes[axis.index()];
        let hardware = |source: HardwareError| MotionError::Hardware { axis, source };

        self.io
            .write(channel.pins.dir, channel.profile.direction_level(delta > 0))
            .map_err(hardware)?;

        let ramp = channel.profile.ramp(delta.unsigned_abs(), speed_percent);
        let step = delta.signum();
        debug!(%axis, from = current, to = target, "moving");

        for index in 0..ramp.total_pulses() {
            if !self.is_running() {
                debug!(%axis, emitted = index, "move cancelled");
                return Ok(MoveOutcome::Cancelled);
            }

            let period = ramp.period_us(index);
            let high = period / 2;

            self.io
                .write(channel.pins.step, Level::High)
                .map_err(hardware)?;
            self.delay.delay_us(high);
            self.io
                .write(channel.pins.step, Level::Low)
                .map_err(hardware)?;
            self.delay.delay_us(period - high);

            self.position_guard().increment(axis, step);
        }

        Ok(MoveOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockIo, NoDelay, RecordingDelay};
    use crate::hardware::SpinDelay;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Instant;

    fn fast_axes() -> AxesConfig {
        let profile = |steps_per_mm| AxisProfile {
            steps_per_mm,
            fastest_period_us: 2,
            slowest_period_us: 10,
            accel_ramp_pulses: 4,
            decel_ramp_pulses: 4,
            invert_direction: true,
        };
        AxesConfig {
            x: profile(10.0),
            y: profile(10.0),
            z: profile(20.0),
        }
    }

    fn driver() -> (Arc<MockIo>, StepperDriver) {
        let io = Arc::new(MockIo::new());
        let driver = StepperDriver::new(
            io.clone(),
            Arc::new(NoDelay),
            &fast_axes(),
            &PinConfig::default(),
        );
        (io, driver)
    }

    #[test]
    fn test_absolute_move_pulses_and_tracks() {
        let (io, driver) = driver();
        let pins = PinConfig::default();

        let outcome = driver
            .move_to_absolute(Axis::X, 2.5, 100.0, Duration::ZERO)
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        assert_eq!(io.rising_edges(pins.x_step), 25);
        assert_eq!(driver.current_position_steps(), Position::new(25, 0, 0));
        assert_eq!(driver.current_position_mm().x, 2.5);
        // inverted polarity: positive travel is a low direction level
        assert_eq!(io.writes_to(pins.x_dir), vec![Level::Low]);
        assert_eq!(io.level(pins.x_step), Some(Level::Low));
    }

    #[test]
    fn test_relative_move_backwards() {
        let (io, driver) = driver();
        let pins = PinConfig::default();
        driver
            .move_to_absolute(Axis::Z, 1.0, 100.0, Duration::ZERO)
            .unwrap();
        driver.move_relative(Axis::Z, -0.5, 100.0).unwrap();

        assert_eq!(driver.current_position_steps().get(Axis::Z), 10);
        assert_eq!(io.writes_to(pins.z_dir), vec![Level::Low, Level::High]);
    }

    #[test]
    fn test_move_to_current_position_is_silent() {
        let (io, driver) = driver();
        driver
            .move_to_absolute(Axis::Y, 1.0, 100.0, Duration::ZERO)
            .unwrap();
        io.clear_history();

        let outcome = driver
            .move_to_absolute(Axis::Y, 1.0, 100.0, Duration::from_secs(5))
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Completed);
        assert!(io.writes().is_empty());
        assert_eq!(driver.current_position_steps().get(Axis::Y), 10);
    }

    #[test]
    fn test_zero_speed_rejected() {
        let (io, driver) = driver();
        assert!(matches!(
            driver.move_to_absolute(Axis::X, 1.0, 0.0, Duration::ZERO),
            Err(MotionError::InvalidSpeed(_))
        ));
        assert!(matches!(
            driver.move_relative(Axis::X, 1.0, -5.0),
            Err(MotionError::InvalidSpeed(_))
        ));
        assert!(io.writes().is_empty());
    }

    #[test]
    fn test_speed_above_100_is_clamped() {
        let io = Arc::new(MockIo::new());
        let delay = Arc::new(RecordingDelay::new());
        let driver = StepperDriver::new(io, delay.clone(), &fast_axes(), &PinConfig::default());

        driver.move_relative(Axis::X, 10.0, 250.0).unwrap();

        // 100 pulses, each split into two waits of one full period
        let requests = delay.requests();
        assert_eq!(requests.len(), 200);
        let shortest = requests.chunks(2).map(|pair| pair[0] + pair[1]).min();
        assert_eq!(shortest, Some(2));
    }

    #[test]
    fn test_pre_delay_before_first_pulse() {
        let io = Arc::new(MockIo::new());
        let delay = Arc::new(RecordingDelay::new());
        let driver = StepperDriver::new(io, delay.clone(), &fast_axes(), &PinConfig::default());

        driver
            .move_to_absolute(Axis::Y, 0.1, 100.0, Duration::from_millis(100))
            .unwrap();
        assert_eq!(delay.requests()[0], 100_000);
    }

    #[test]
    fn test_go_home_order_and_short_circuit() {
        let (io, driver) = driver();
        let pins = PinConfig::default();
        assert_eq!(driver.go_home(100.0).unwrap(), MoveOutcome::Completed);
        assert!(io.writes().is_empty());

        driver
            .move_to_absolute(Axis::X, 1.0, 100.0, Duration::ZERO)
            .unwrap();
        driver
            .move_to_absolute(Axis::Y, 1.0, 100.0, Duration::ZERO)
            .unwrap();
        driver
            .move_to_absolute(Axis::Z, 1.0, 100.0, Duration::ZERO)
            .unwrap();
        io.clear_history();

        driver.go_home(100.0).unwrap();

        let dir_order: Vec<u8> = io
            .writes()
            .iter()
            .map(|w| w.pin)
            .filter(|pin| [pins.x_dir, pins.y_dir, pins.z_dir].contains(pin))
            .collect();
        assert_eq!(dir_order, vec![pins.z_dir, pins.x_dir, pins.y_dir]);
        assert!(driver.current_position_steps().is_origin());
    }

    #[test]
    fn test_reset_origin() {
        let (_io, driver) = driver();
        driver.move_relative(Axis::X, 3.0, 100.0).unwrap();
        driver.reset_origin();
        assert!(driver.current_position_steps().is_origin());
    }

    #[test]
    fn test_halted_driver_does_not_pulse() {
        let (io, driver) = driver();
        driver.halt();
        let outcome = driver.move_relative(Axis::X, 1.0, 100.0).unwrap();
        assert_eq!(outcome, MoveOutcome::Cancelled);
        assert_eq!(io.rising_edges(PinConfig::default().x_step), 0);

        driver.arm();
        assert!(driver.move_relative(Axis::X, 1.0, 100.0).unwrap().is_completed());
    }

    #[test]
    fn test_pin_failure_is_reported() {
        let (io, driver) = driver();
        io.fail_pin(PinConfig::default().z_step);
        let err = driver.move_relative(Axis::Z, 1.0, 100.0).unwrap_err();
        assert!(matches!(err, MotionError::Hardware { axis: Axis::Z, .. }));
    }

    #[test]
    fn test_halt_stops_long_move_promptly() {
        let io = Arc::new(MockIo::new());
        let axes = AxesConfig {
            x: AxisProfile {
                steps_per_mm: 100.0,
                fastest_period_us: 100,
                slowest_period_us: 200,
                accel_ramp_pulses: 10,
                decel_ramp_pulses: 10,
                invert_direction: true,
            },
            ..fast_axes()
        };
        let driver = Arc::new(StepperDriver::new(
            io,
            Arc::new(SpinDelay),
            &axes,
            &PinConfig::default(),
        ));

        // 100_000 pulses at >= 100 us would take at least 10 s
        let mover = Arc::clone(&driver);
        let handle = thread::spawn(move || mover.move_relative(Axis::X, 1000.0, 100.0));

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        driver.halt();
        let outcome = handle.join().unwrap().unwrap();

        assert_eq!(outcome, MoveOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_millis(500));
        let reached = driver.current_position_steps().get(Axis::X);
        assert!(reached > 0 && reached < 100_000, "reached {reached}");
    }

    proptest! {
        #[test]
        fn prop_pulse_count_matches_delta(
            start in -200i64..200,
            target in -200i64..200,
            speed in 0.5f64..=100.0,
        ) {
            let (io, driver) = driver();
            let pins = PinConfig::default();
            driver.move_to_step(Axis::Y, start, 100.0, Duration::ZERO).unwrap();
            io.clear_history();

            driver.move_to_step(Axis::Y, target, speed, Duration::ZERO).unwrap();

            prop_assert_eq!(io.rising_edges(pins.y_step) as i64, (target - start).abs());
            prop_assert_eq!(driver.current_position_steps().get(Axis::Y), target);
            let dir_writes = io.writes_to(pins.y_dir);
            prop_assert!(dir_writes.len() <= 1);
        }
    }
}
