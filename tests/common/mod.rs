//! Common test utilities for dps_cnc integration tests
//!
//! This module provides:
//! - a small fast fixture configuration (coarse steps, no settle delays)
//! - a runner wired to a simulated DPS and a scripted programmer
//! - polling helpers with timeouts

#![allow(dead_code)] // Not every test binary uses every helper

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dps_cnc::config::{FirmwareKind, Settings};
use dps_cnc::hardware::mock::{DpsBehavior, NoDelay, SimulatedDps};
use dps_cnc::programmer::ScriptedProcessRunner;
use dps_cnc::runner::{Cell, Hardware, Runner, RunnerEvent, RunnerState};
use tokio::sync::broadcast;

/// Upper bound for any wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

/// 3 x 2 plate, one FLASH and one MAX_ONLY recipe matching the default
/// simulated board.
pub const FIXTURE_TOML: &str = r#"
[machine]
programmer_tool = "/usr/local/bin/p14"
flash_timeout_secs = 60
z_moving_height_mm = 7.5
z_minimum_safe_height_mm = 5.0
pull_back_mm = 50.0

[timing]
worker_poll_ms = 5
telemetry_interval_ms = 20
axis_stagger_ms = 0
contact_settle_ms = 0
shutdown_timeout_ms = 2000

[axes.x]
steps_per_mm = 4.0
[axes.y]
steps_per_mm = 4.0
[axes.z]
steps_per_mm = 4.0

[tester]
sample_interval_ms = 0
settle_ms = 0
mode_settle_ms = 0

[plates.small]
columns = 3
rows = 2
x_offset_mm = 10.0
y_offset_mm = 5.0
x_spacing_mm = 20.0
y_spacing_mm = 15.0

[firmware.flash]
path = "/srv/fw/thule_flash.hex"
kind = "flash"
led_current_primary_ma = [90.0, 110.0]
led_current_secondary_ma = [40.0, 60.0]
button_led_voltage_mv = [1800.0, 2200.0]
feedback_voltage_mv = [100.0, 140.0]

[firmware.max]
path = "/srv/fw/thule_max.hex"
kind = "max_only"
led_current_primary_ma = [90.0, 110.0]
button_led_voltage_mv = [1800.0, 2200.0]
feedback_voltage_mv = [100.0, 140.0]
"#;

/// Serpentine order of the `small` plate.
pub const SMALL_PLATE_ORDER: [(u32, u32); 6] = [(0, 0), (1, 0), (2, 0), (2, 1), (1, 1), (0, 1)];

/// Parsed fixture settings.
pub fn settings() -> Settings {
    Settings::from_toml_str(FIXTURE_TOML).unwrap()
}

/// Settings with a report directory.
pub fn settings_with_reports(dir: PathBuf) -> Settings {
    let mut settings = settings();
    settings.storage.report_dir = Some(dir);
    settings
}

/// Runner plus handles on its simulated backends.
pub struct TestFixture {
    pub runner: Runner,
    pub dps: Arc<SimulatedDps>,
    pub programmer: Arc<ScriptedProcessRunner>,
}

/// Fixture with a healthy board and a programmer that always succeeds.
pub fn fixture() -> TestFixture {
    fixture_with(
        settings(),
        DpsBehavior::default(),
        ScriptedProcessRunner::succeeding(),
    )
}

/// Fixture with explicit settings, board behavior and programmer.
pub fn fixture_with(
    settings: Settings,
    behavior: DpsBehavior,
    programmer: ScriptedProcessRunner,
) -> TestFixture {
    let dps = Arc::new(SimulatedDps::with_behavior(
        settings.pins.clone(),
        FirmwareKind::Flash,
        behavior,
    ));
    let programmer = Arc::new(programmer);
    let hardware = Hardware {
        io: dps.clone(),
        adc: dps.clone(),
        delay: Arc::new(NoDelay),
        process: programmer.clone(),
    };
    let runner = Runner::new(settings, hardware).unwrap();
    TestFixture {
        runner,
        dps,
        programmer,
    }
}

impl TestFixture {
    /// Select the `small` plate and a firmware, keeping the simulated board
    /// in step with the recipe kind.
    pub fn select(&self, firmware: &str) {
        self.runner.select_plate("small").unwrap();
        let kind = self.runner.select_firmware(firmware).unwrap();
        self.dps.set_kind(kind);
    }
}

/// Poll `condition` every few milliseconds until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Wait until the runner reaches `state`.
pub async fn wait_for_state(runner: &Runner, state: RunnerState) {
    wait_until(&format!("state {state}"), || runner.state() == state).await;
}

/// Collect events until `last` matches, returning everything received.
pub async fn collect_until(
    events: &mut broadcast::Receiver<RunnerEvent>,
    last: impl Fn(&RunnerEvent) -> bool,
) -> Vec<RunnerEvent> {
    let collected = tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = last(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return seen,
            }
        }
    })
    .await;
    collected.unwrap_or_else(|_| panic!("timed out waiting for event"))
}

/// Run `future` with the test timeout.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("operation timed out"))
}

/// Cells of a sequence given as pairs.
pub fn cells(pairs: &[(u32, u32)]) -> Vec<Cell> {
    pairs.iter().map(|&(column, row)| Cell::new(column, row)).collect()
}
