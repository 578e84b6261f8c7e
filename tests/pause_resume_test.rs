//! Operator interruption of the automatic cycle.

mod common;

use std::time::Duration;

use common::*;
use dps_cnc::hardware::mock::DpsBehavior;
use dps_cnc::programmer::ScriptedProcessRunner;
use dps_cnc::runner::{Cell, Command, RunnerState};
use dps_cnc::CncError;

/// Fixture whose programmer takes long enough per cell to interrupt it.
fn slow_fixture(flash_time: Duration) -> TestFixture {
    fixture_with(
        settings(),
        DpsBehavior::default(),
        ScriptedProcessRunner::succeeding().with_run_time(flash_time),
    )
}

#[tokio::test]
async fn test_pause_keeps_progress_and_resume_finishes_remaining_cells() {
    let fx = slow_fixture(Duration::from_millis(100));
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    wait_until("first cell logged", || !fx.runner.dps_logs().is_empty()).await;
    fx.runner.pause_cycle();
    assert_eq!(fx.runner.state(), RunnerState::PausedInAutomaticCycle);

    // the cell being programmed when pausing still completes
    tokio::time::sleep(Duration::from_millis(400)).await;
    let done = fx.runner.dps_logs();
    assert!((1..6).contains(&done.len()), "{} cells done", done.len());
    assert_eq!(fx.runner.state(), RunnerState::PausedInAutomaticCycle);

    let order = cells(&SMALL_PLATE_ORDER);
    let resume = fx.runner.resume_point().unwrap();
    assert_eq!(resume, order[done.len()]);
    assert!(!done.contains_key(&resume));
    let calls_while_paused = fx.programmer.calls().len();
    assert_eq!(calls_while_paused, done.len());

    fx.runner.resume_cycle().unwrap();
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;

    // every cell flashed exactly once over both runs
    assert_eq!(fx.runner.dps_logs().len(), 6);
    assert_eq!(fx.programmer.calls().len(), 6);

    fx.runner.shutdown().await;
}

#[tokio::test]
async fn test_hard_stop_pauses_cycle_and_halts_motion() {
    let fx = slow_fixture(Duration::from_millis(100));
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    wait_until("first cell logged", || !fx.runner.dps_logs().is_empty()).await;
    fx.runner.stop();
    assert_eq!(fx.runner.state(), RunnerState::PausedInAutomaticCycle);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let done = fx.runner.dps_logs().len();
    assert!(fx.runner.resume_point().is_some());

    // nothing moves until the cycle is resumed
    let parked = fx.runner.position_mm();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.runner.position_mm(), parked);

    fx.runner.resume_cycle().unwrap();
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;
    assert_eq!(fx.runner.dps_logs().len(), 6);
    assert!(done < 6);
    assert_eq!(fx.programmer.calls().len(), 6);
    assert!((fx.runner.position_mm().z - 7.5).abs() < 1e-9);

    fx.runner.shutdown().await;
}

#[tokio::test]
async fn test_restart_paused_cycle_at_other_cell() {
    let fx = slow_fixture(Duration::from_millis(50));
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    wait_until("first cell logged", || !fx.runner.dps_logs().is_empty()).await;
    fx.runner.pause_cycle();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // skip ahead to the last cell; earlier logs are kept
    fx.runner.start_cycle(Cell::new(0, 1)).unwrap();
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;

    let logs = fx.runner.dps_logs();
    assert!(logs.contains_key(&Cell::new(0, 0)));
    assert!(logs.contains_key(&Cell::new(0, 1)));

    fx.runner.shutdown().await;
}

#[tokio::test]
async fn test_finish_from_pause_clears_logs_and_stops() {
    let fx = slow_fixture(Duration::from_millis(50));
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 0)).unwrap();
    wait_until("first cell logged", || !fx.runner.dps_logs().is_empty()).await;
    fx.runner.pause_cycle();
    fx.runner.finish_cycle();
    assert_eq!(fx.runner.state(), RunnerState::Stopped);

    // a cell still in flight when finishing is not recorded
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.runner.dps_logs().is_empty());
    assert_eq!(fx.runner.resume_point(), None);
    assert_eq!(fx.runner.state(), RunnerState::Stopped);

    fx.runner.shutdown().await;
}

#[tokio::test]
async fn test_pause_on_last_cell_still_completes_cycle() {
    let fx = slow_fixture(Duration::from_millis(150));
    fx.select("flash");
    fx.runner.start();

    // single remaining cell: pause while it is being programmed
    fx.runner.start_cycle(Cell::new(0, 1)).unwrap();
    wait_until("flash started", || !fx.programmer.calls().is_empty()).await;
    fx.runner.pause_cycle();
    wait_until("cell logged", || fx.runner.dps_logs().len() == 1).await;

    // the pull-back still completes the cycle
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;
    assert_eq!(fx.runner.resume_point(), None);

    fx.runner.finish_cycle();
    fx.runner.shutdown().await;
}

#[tokio::test]
async fn test_pause_after_cycle_completed_is_an_error() {
    let fx = fixture();
    fx.select("flash");
    fx.runner.start();

    // one remaining cell: the cycle can finish between a state check and the
    // pause command
    fx.runner.start_cycle(Cell::new(0, 1)).unwrap();
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;

    let err = fx.runner.try_pause_cycle().unwrap_err();
    assert!(
        matches!(
            err,
            CncError::InvalidState {
                command: Command::PauseCycle,
                state: RunnerState::CompletedAutomaticCycle,
            }
        ),
        "{err:?}"
    );
    assert_eq!(
        err.to_string(),
        "PauseCycle is not allowed in state COMPLETED_AUTOMATIC_CYCLE"
    );
    assert_eq!(fx.runner.state(), RunnerState::CompletedAutomaticCycle);
    assert_eq!(fx.runner.dps_logs().len(), 1);

    // the runner is still usable afterwards
    fx.runner.try_finish_cycle().unwrap();
    assert_eq!(fx.runner.state(), RunnerState::Stopped);
    within(fx.runner.shutdown()).await;
    assert!(!fx.dps.is_powered());
}

#[tokio::test]
async fn test_resume_after_paused_last_cell_completed_is_an_error() {
    let fx = slow_fixture(Duration::from_millis(150));
    fx.select("flash");
    fx.runner.start();

    fx.runner.start_cycle(Cell::new(0, 1)).unwrap();
    wait_until("flash started", || !fx.programmer.calls().is_empty()).await;
    fx.runner.try_pause_cycle().unwrap();
    wait_for_state(&fx.runner, RunnerState::CompletedAutomaticCycle).await;

    let err = fx.runner.try_resume_cycle().unwrap_err();
    assert!(matches!(
        err,
        CncError::InvalidState {
            command: Command::ResumeCycle,
            ..
        }
    ));
    assert!(matches!(
        fx.runner.try_start_cycle(Cell::new(0, 0)),
        Err(CncError::InvalidState { .. })
    ));
    assert_eq!(fx.runner.state(), RunnerState::CompletedAutomaticCycle);

    fx.runner.shutdown().await;
}

#[tokio::test]
#[should_panic(expected = "ResumeCycle is not allowed in state STOPPED")]
async fn test_resume_while_stopped_panics() {
    let fx = fixture();
    let _ = fx.runner.resume_cycle();
}

#[test]
fn test_nothing_to_resume_error_message() {
    assert_eq!(CncError::NothingToResume.to_string(), "Nothing to resume");
}
