//! Worker loop and the actions it runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{FirmwareConfig, PlateConfig};
use crate::dps::{report, DpsLog, MessageFormatter};
use crate::error::{AppResult, CncError};
use crate::motion::{Axis, MoveOutcome};

use super::raster::{self, Cell};
use super::{lock, Command, RunnerEvent, RunnerState, Shared, MIN_LOOP_PERIOD};

/// Positions closer than this are treated as the same X/Y spot.
const XY_TOLERANCE_MM: f64 = 0.1;

/// Work picked up by the worker for the current state.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Jog {
        operation: u64,
        axis: Axis,
        delta_mm: f64,
    },
    Home {
        operation: u64,
    },
    Cycle { generation: u64, start: Cell },
}

/// Run `task` on the blocking pool. A panic inside `task` is re-raised here.
pub(super) async fn blocking<T, F>(task: F) -> AppResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        if err.is_panic() {
            std::panic::resume_unwind(err.into_panic());
        }
        CncError::Join(err)
    })
}

pub(super) async fn worker_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared.settings.timing.worker_poll().max(MIN_LOOP_PERIOD);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(action) = shared.next_action() else {
            continue;
        };
        debug!(?action, "worker picked up action");
        let result = match action {
            Action::Jog {
                operation,
                axis,
                delta_mm,
            } => shared.run_jog(operation, axis, delta_mm).await,
            Action::Home { operation } => shared.run_home(operation).await,
            Action::Cycle { generation, start } => shared.run_cycle(generation, start).await,
        };
        if let Err(err) = result {
            error!(error = %err, ?action, "action failed, stopping");
            shared.apply(Command::Stop);
        }
    }
    debug!("worker loop stopped");
}

impl Shared {
    fn next_action(&self) -> Option<Action> {
        let mut core = self.core();
        if core.shutting_down {
            return None;
        }
        match core.state {
            RunnerState::MovingByStep => match core.pending_jog.take() {
                Some((axis, delta_mm)) => Some(Action::Jog {
                    operation: core.operation,
                    axis,
                    delta_mm,
                }),
                None => {
                    let changed = self.step(&mut core, Command::MoveFinished);
                    drop(core);
                    self.announce(changed);
                    None
                }
            },
            RunnerState::MovingHome => Some(Action::Home {
                operation: core.operation,
            }),
            RunnerState::InAutomaticCycle if core.picked_generation != Some(core.generation) => {
                let start = core.cycle_start?;
                core.picked_generation = Some(core.generation);
                Some(Action::Cycle {
                    generation: core.generation,
                    start,
                })
            }
            _ => None,
        }
    }

    fn cycle_active(&self, generation: u64) -> bool {
        self.core().cycle_active(generation)
    }

    // =========================================================================
    // Single moves
    // =========================================================================

    async fn run_jog(&self, operation: u64, axis: Axis, delta_mm: f64) -> AppResult<()> {
        let stepper = Arc::clone(&self.stepper);
        let speed = self.settings.machine.speed_percent;
        let outcome = blocking(move || stepper.move_relative(axis, delta_mm, speed)).await??;
        info!(%axis, delta_mm, ?outcome, "jog done");
        self.finish_operation(operation);
        Ok(())
    }

    async fn run_home(&self, operation: u64) -> AppResult<()> {
        let stepper = Arc::clone(&self.stepper);
        let speed = self.settings.machine.speed_percent;
        let outcome = blocking(move || stepper.go_home(speed)).await??;
        info!(?outcome, "home move done");
        self.finish_operation(operation);
        Ok(())
    }

    /// Report the end of single move `operation`. A move that was stopped
    /// and replaced by a newer jog or home leaves the state alone.
    pub(super) fn finish_operation(&self, operation: u64) {
        let changed = {
            let mut core = self.core();
            if core.operation != operation {
                debug!(operation, current = core.operation, "stale move completion ignored");
                return;
            }
            self.step(&mut core, Command::MoveFinished)
        };
        self.announce(changed);
        self.emit(RunnerEvent::Position(self.stepper.current_position_mm()));
        self.emit(RunnerEvent::OperationCompleted);
    }

    async fn move_axis(
        &self,
        axis: Axis,
        target_mm: f64,
        pre_delay: Duration,
    ) -> AppResult<MoveOutcome> {
        let stepper = Arc::clone(&self.stepper);
        let speed = self.settings.machine.speed_percent;
        let outcome = blocking(move || {
            stepper.move_to_absolute(axis, target_mm, speed, pre_delay)
        })
        .await??;
        Ok(outcome)
    }

    /// One move of the cycle. `false` when it was cancelled or the cycle is
    /// no longer active.
    async fn cycle_move(
        &self,
        generation: u64,
        axis: Axis,
        target_mm: f64,
        pre_delay: Duration,
    ) -> AppResult<bool> {
        let outcome = self.move_axis(axis, target_mm, pre_delay).await?;
        Ok(outcome.is_completed() && self.cycle_active(generation))
    }

    // =========================================================================
    // Automatic cycle
    // =========================================================================

    async fn run_cycle(&self, generation: u64, start: Cell) -> AppResult<()> {
        let (plate, firmware) = {
            let core = self.core();
            match (&core.plate, &core.firmware) {
                (Some((_, plate)), Some((_, firmware))) => (plate.clone(), firmware.clone()),
                _ => return Err(CncError::NotConfigured("plate or firmware")),
            }
        };
        info!(%start, generation, firmware = %firmware.file_name(), "cycle running");

        for cell in raster::sequence_from(plate.columns, plate.rows, start) {
            if !self.cycle_active(generation) {
                info!(%cell, "cycle interrupted before cell");
                return Ok(());
            }
            self.emit(RunnerEvent::TargetCell(cell));

            if !self.approach(&plate, cell, generation).await? {
                info!(%cell, "cycle interrupted while approaching");
                return Ok(());
            }
            {
                let mut core = self.core();
                if !core.cycle_active(generation) {
                    return Ok(());
                }
                core.resume_point = Some(cell);
            }

            let log = self.process_cell(cell, &firmware).await;
            log_outcome(&firmware, &log);
            {
                let mut core = self.core();
                if core.generation == generation {
                    core.logs.insert(cell, log.clone());
                    core.resume_point = raster::next_in_sequence(plate.columns, plate.rows, cell);
                }
            }

            let raised = self
                .move_axis(Axis::Z, self.settings.machine.z_moving_height_mm, Duration::ZERO)
                .await?;
            self.emit(RunnerEvent::CellLogged(log));
            self.emit(RunnerEvent::Position(self.stepper.current_position_mm()));
            if !raised.is_completed() {
                info!(%cell, "cycle stopped while raising the head");
                return Ok(());
            }
        }

        self.complete_cycle(generation).await
    }

    /// Bring the head down on `cell`. `false` when interrupted.
    async fn approach(&self, plate: &PlateConfig, cell: Cell, generation: u64) -> AppResult<bool> {
        let machine = &self.settings.machine;
        let stagger = self.settings.timing.axis_stagger();
        let (x, y) = plate.cell_position_mm(cell);
        let here = self.stepper.current_position_mm();

        let travels = (here.x - x).abs() > XY_TOLERANCE_MM || (here.y - y).abs() > XY_TOLERANCE_MM;
        if travels && here.z < machine.z_minimum_safe_height_mm {
            debug!(z = here.z, "lifting head before travel");
            if !self
                .cycle_move(generation, Axis::Z, machine.z_moving_height_mm, Duration::ZERO)
                .await?
            {
                return Ok(false);
            }
        }

        debug!(column = cell.column, row = cell.row, x, y, "moving to cell");
        for (axis, target, pre_delay) in [
            (Axis::X, x, Duration::ZERO),
            (Axis::Y, y, stagger),
            (Axis::Z, 0.0, stagger),
        ] {
            if !self.cycle_move(generation, axis, target, pre_delay).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Flash and test the board under the head. Never fails: every problem
    /// ends up in the returned log.
    async fn process_cell(&self, cell: Cell, firmware: &FirmwareConfig) -> DpsLog {
        let mut log = DpsLog::new(cell);
        tokio::time::sleep(self.settings.timing.contact_settle()).await;
        match self.board.head_in_contact() {
            Ok(contact) => debug!(column = cell.column, row = cell.row, contact, "head contact"),
            Err(err) => debug!(error = %err, "head contact probe unreadable"),
        }

        let tester = Arc::clone(&self.tester);
        let prepared = blocking(move || {
            let mut tester = lock(&tester);
            tester.prepare()
        })
        .await
        .and_then(|result| result.map_err(CncError::from));
        if let Err(err) = prepared {
            warn!(column = cell.column, row = cell.row, error = %err, "fixture not ready");
            log.fw_upload_message = format!("fixture not ready: {err}");
            log.fixture_error = Some(err.to_string());
            self.power_down().await;
            return log;
        }

        match self.programmer.flash(&firmware.path).await {
            Ok(output) => {
                log.fw_uploaded = output.success();
                log.fw_upload_message = output.output;
            }
            Err(err) => log.fw_upload_message = err.to_string(),
        }

        if log.fw_uploaded {
            let tester = Arc::clone(&self.tester);
            let recipe = firmware.clone();
            let tested = blocking(move || {
                let mut tester = lock(&tester);
                tester.run_profile(&recipe)
            })
            .await
            .and_then(|result| result.map_err(CncError::from));
            match tested {
                Ok(results) => log.results = results,
                Err(err) => {
                    warn!(column = cell.column, row = cell.row, error = %err, "test profile aborted");
                    log.fixture_error = Some(err.to_string());
                }
            }
        }

        self.power_down().await;
        log
    }

    pub(super) async fn power_down(&self) {
        let tester = Arc::clone(&self.tester);
        let result = blocking(move || {
            let tester = lock(&tester);
            tester.power_down()
        })
        .await
        .and_then(|result| result.map_err(CncError::from));
        if let Err(err) = result {
            error!(error = %err, "failed to power down the board");
        }
    }

    async fn complete_cycle(&self, generation: u64) -> AppResult<()> {
        {
            let core = self.core();
            let still_ours = core.generation == generation
                && !core.shutting_down
                && matches!(
                    core.state,
                    RunnerState::InAutomaticCycle | RunnerState::PausedInAutomaticCycle
                );
            if !still_ours {
                return Ok(());
            }
        }

        let stepper = Arc::clone(&self.stepper);
        let speed = self.settings.machine.speed_percent;
        let pull_back = self.settings.machine.pull_back_mm;
        let outcome = blocking(move || stepper.move_relative(Axis::Y, pull_back, speed)).await??;
        debug!(?outcome, pull_back, "pulled back from the plate");

        let (changed, logs) = {
            let mut core = self.core();
            if core.generation != generation {
                return Ok(());
            }
            let changed = self.step(&mut core, Command::CycleFinished);
            (changed, core.logs.clone())
        };
        self.announce(changed);

        let passed = logs.values().filter(|log| log.operation_successful()).count();
        info!(cells = logs.len(), passed, "automatic cycle completed");
        self.write_report(logs).await;
        self.emit(RunnerEvent::Position(self.stepper.current_position_mm()));
        self.emit(RunnerEvent::CycleCompleted);
        Ok(())
    }

    async fn write_report(&self, logs: BTreeMap<Cell, DpsLog>) {
        let Some(dir) = self.settings.storage.report_dir.clone() else {
            return;
        };
        let format = self.settings.storage.format;
        let written = blocking(move || report::write_report(&dir, format, &logs, Utc::now()))
            .await
            .and_then(|result| result);
        if let Err(err) = written {
            error!(error = %err, "failed to write cycle report");
        }
    }
}

fn log_outcome(firmware: &FirmwareConfig, log: &DpsLog) {
    let (column, row) = (log.cell.column, log.cell.row);
    if log.operation_successful() {
        info!(column, row, "cell passed");
        debug!("{}", MessageFormatter::ok_message(firmware, log).trim_end());
    } else {
        warn!(column, row, "{}", MessageFormatter::error_message(log).trim_end());
    }
}
