//! Tests for graceful shutdown with timeout behavior.

mod common;

use std::time::{Duration, Instant};

use common::*;
use dps_cnc::hardware::mock::DpsBehavior;
use dps_cnc::hardware::Level;
use dps_cnc::motion::Axis;
use dps_cnc::programmer::ScriptedProcessRunner;
use dps_cnc::runner::{Cell, RunnerEvent, RunnerState};

/// Every output of the fixture is at its inert level.
fn assert_released(fx: &TestFixture) {
    let pins = fx.runner.settings().pins.clone();
    assert!(!fx.dps.is_powered(), "board still powered after shutdown");
    for axis in Axis::ALL {
        let axis_pins = pins.axis(axis);
        assert_eq!(fx.dps.io().level(axis_pins.step), Some(Level::Low));
        assert_eq!(fx.dps.io().level(axis_pins.dir), Some(Level::Low));
    }
}

#[tokio::test]
async fn test_idle_runner_shutdown_is_graceful() {
    let fx = fixture();
    fx.runner.start();

    // Brief pause to let the loops start
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    fx.runner.shutdown().await;
    let elapsed = start.elapsed();

    // Both loops react to the shutdown signal well before the timeout
    assert!(
        elapsed < Duration::from_secs(1),
        "Graceful shutdown took too long: {:?}",
        elapsed
    );
    assert_released(&fx);
}

#[tokio::test]
async fn test_shutdown_without_start_releases_outputs() {
    let fx = fixture();
    within(fx.runner.shutdown()).await;
    assert_released(&fx);
}

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let fx = fixture();
    fx.runner.start();
    within(fx.runner.shutdown()).await;
    within(fx.runner.shutdown()).await;
    assert_released(&fx);
}

#[tokio::test]
async fn test_shutdown_during_cycle_stops_worker() {
    let fx = fixture_with(
        settings(),
        DpsBehavior::default(),
        ScriptedProcessRunner::succeeding().with_run_time(Duration::from_millis(50)),
    );
    fx.select("flash");
    fx.runner.start();
    let mut events = fx.runner.subscribe();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    collect_until(&mut events, |event| matches!(event, RunnerEvent::CellLogged(_))).await;

    let start = Instant::now();
    fx.runner.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_released(&fx);

    // no more cells are processed once the worker is gone
    let logged = fx.runner.dps_logs().len();
    let calls = fx.programmer.calls().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.runner.dps_logs().len(), logged);
    assert_eq!(fx.programmer.calls().len(), calls);
    assert_ne!(fx.runner.state(), RunnerState::CompletedAutomaticCycle);
}

#[tokio::test]
async fn test_hung_programmer_is_aborted_after_timeout() {
    let mut settings = settings();
    settings.timing.shutdown_timeout_ms = 200;
    let fx = fixture_with(
        settings,
        DpsBehavior::default(),
        ScriptedProcessRunner::succeeding().with_run_time(Duration::from_secs(10)),
    );
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    wait_until("programmer started", || !fx.programmer.calls().is_empty()).await;
    assert!(fx.dps.is_powered());

    let start = Instant::now();
    fx.runner.shutdown().await;
    let elapsed = start.elapsed();

    // worker and telemetry each get the timeout, nothing waits for the tool
    assert!(
        elapsed < Duration::from_secs(2),
        "Shutdown waited for the programmer: {:?}",
        elapsed
    );
    assert_released(&fx);
    assert!(fx.runner.dps_logs().is_empty());
}

#[tokio::test]
async fn test_dropping_runner_stops_loops() {
    let fx = fixture();
    fx.runner.start();
    let mut events = fx.runner.subscribe();
    collect_until(&mut events, |event| matches!(event, RunnerEvent::State(_))).await;

    drop(fx.runner);

    // telemetry ends and the channel closes once the loops are gone
    within(async {
        loop {
            match events.recv().await {
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
}
