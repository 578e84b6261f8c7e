//! Orchestration of the fixture.
//!
//! The [`Runner`] owns the stepper driver, the tester and the programmer and
//! exposes the operator command surface. Commands validate their input and
//! move the state machine; they never touch the hardware themselves. The
//! physical work happens on a worker task that polls the state and runs one
//! action (jog, home or automatic cycle) to completion before looking again,
//! so at most one motion is ever in flight. A telemetry task publishes the
//! state and the gantry position at a fixed rate.
//!
//! All mutable runner state lives in one [`Mutex`]. Transitions go through
//! the pure [`transition`] table; a command issued in the wrong state panics.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = Runner::new(settings, hardware)?;
//! runner.start();
//! let mut events = runner.subscribe();
//!
//! runner.select_plate("thule_4x3")?;
//! runner.select_firmware("thule_flash")?;
//! runner.start_cycle(Cell::new(0, 0))?;
//!
//! while let Ok(event) = events.recv().await {
//!     if event == RunnerEvent::CycleCompleted {
//!         break;
//!     }
//! }
//! runner.finish_cycle();
//! runner.shutdown().await;
//! ```

mod cycle;
pub mod event;
pub mod raster;
pub mod state;

pub use event::RunnerEvent;
pub use raster::Cell;
pub use state::{jog_is_hazardous, transition, Command, Effect, RunnerState, Transition};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{FirmwareConfig, FirmwareKind, PlateConfig, Settings};
use crate::dps::DpsLog;
use crate::error::{AppResult, CncError};
use crate::hardware::{AnalogInput, Delay, DigitalIo, FixtureBoard};
use crate::motion::{Axis, PositionMm, StepperDriver};
use crate::programmer::{ProcessOutput, ProcessRunner, Programmer};
use crate::tester::Tester;

const EVENT_CAPACITY: usize = 256;
const MIN_LOOP_PERIOD: Duration = Duration::from_millis(1);

/// Backends the runner drives.
#[derive(Clone)]
pub struct Hardware {
    /// GPIO lines of steppers, DPS power, button and ICSP.
    pub io: Arc<dyn DigitalIo>,
    /// Measurement ADC.
    pub adc: Arc<dyn AnalogInput>,
    /// Pulse and settle timing.
    pub delay: Arc<dyn Delay>,
    /// Launcher of the programming tool.
    pub process: Arc<dyn ProcessRunner>,
}

struct Core {
    state: RunnerState,
    generation: u64,
    picked_generation: Option<u64>,
    operation: u64,
    plate: Option<(String, PlateConfig)>,
    firmware: Option<(String, FirmwareConfig)>,
    pending_jog: Option<(Axis, f64)>,
    cycle_start: Option<Cell>,
    resume_point: Option<Cell>,
    logs: BTreeMap<Cell, DpsLog>,
    home_set: bool,
    shutting_down: bool,
}

impl Core {
    fn new() -> Self {
        Self {
            state: RunnerState::Stopped,
            generation: 0,
            picked_generation: None,
            operation: 0,
            plate: None,
            firmware: None,
            pending_jog: None,
            cycle_start: None,
            resume_point: None,
            logs: BTreeMap::new(),
            home_set: false,
            shutting_down: false,
        }
    }

    /// The cycle of `generation` may keep going.
    fn cycle_active(&self, generation: u64) -> bool {
        self.state == RunnerState::InAutomaticCycle
            && self.generation == generation
            && !self.shutting_down
    }
}

/// State shared between the command surface and the background tasks.
struct Shared {
    settings: Settings,
    core: Mutex<Core>,
    stepper: Arc<StepperDriver>,
    tester: Arc<Mutex<Tester>>,
    programmer: Programmer,
    board: FixtureBoard,
    events: broadcast::Sender<RunnerEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn emit(&self, event: RunnerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn check_legal(core: &Core, command: Command) -> AppResult<Transition> {
        transition(core.state, command).ok_or(CncError::InvalidState {
            command,
            state: core.state,
        })
    }

    #[allow(clippy::panic)]
    fn expect_legal(core: &Core, command: Command) -> Transition {
        match Self::check_legal(core, command) {
            Ok(step) => step,
            Err(err) => panic!("{err}"),
        }
    }

    /// Run `command` against a locked core. Returns the new state if it
    /// changed.
    fn step(&self, core: &mut Core, command: Command) -> Option<RunnerState> {
        let step = Self::expect_legal(core, command);
        for effect in step.effects {
            match effect {
                Effect::ArmMotion => self.stepper.arm(),
                Effect::HaltMotion => self.stepper.halt(),
                Effect::ClearLogs => {
                    core.logs.clear();
                    core.resume_point = None;
                }
                Effect::ResetOrigin => {
                    self.stepper.reset_origin();
                    core.home_set = true;
                }
                Effect::NewGeneration => core.generation += 1,
                Effect::NewOperation => core.operation += 1,
            }
        }
        let previous = std::mem::replace(&mut core.state, step.next);
        (previous != step.next).then_some(step.next)
    }

    fn announce(&self, changed: Option<RunnerState>) {
        if let Some(state) = changed {
            info!(%state, "state changed");
            self.emit(RunnerEvent::State(state));
        }
    }

    fn apply(&self, command: Command) {
        let changed = {
            let mut core = self.core();
            self.step(&mut core, command)
        };
        self.announce(changed);
    }

    fn try_apply(&self, command: Command) -> AppResult<()> {
        let changed = {
            let mut core = self.core();
            Self::check_legal(&core, command)?;
            self.step(&mut core, command)
        };
        self.announce(changed);
        Ok(())
    }
}

struct Tasks {
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    telemetry: JoinHandle<()>,
}

/// Gantry, programmer and tester orchestrator.
pub struct Runner {
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
}

impl Runner {
    /// Build the runner and park the fixture outputs in their safe state.
    ///
    /// # Errors
    ///
    /// Fails if the pins cannot be configured.
    pub fn new(settings: Settings, hardware: Hardware) -> AppResult<Self> {
        let board = FixtureBoard::new(Arc::clone(&hardware.io), settings.pins.clone());
        board.init()?;

        let stepper = Arc::new(StepperDriver::new(
            Arc::clone(&hardware.io),
            Arc::clone(&hardware.delay),
            &settings.axes,
            &settings.pins,
        ));
        let tester = Tester::new(
            board.clone(),
            hardware.adc,
            hardware.delay,
            settings.tester.clone(),
        );
        let programmer = Programmer::new(
            settings.machine.programmer_tool.clone(),
            settings.machine.flash_timeout(),
            hardware.process,
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                core: Mutex::new(Core::new()),
                stepper,
                tester: Arc::new(Mutex::new(tester)),
                programmer,
                board,
                events,
            }),
            tasks: Mutex::new(None),
        })
    }

    /// Spawn the worker and telemetry tasks. Must be called inside a tokio
    /// runtime; calling it again is a no-op.
    pub fn start(&self) {
        let mut tasks = lock(&self.tasks);
        if tasks.is_some() {
            return;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(cycle::worker_loop(
            Arc::clone(&self.shared),
            shutdown_rx.clone(),
        ));
        let telemetry = tokio::spawn(telemetry_loop(Arc::clone(&self.shared), shutdown_rx));
        *tasks = Some(Tasks {
            shutdown,
            worker,
            telemetry,
        });
        info!("runner started");
    }

    /// Stop the background tasks and release the fixture outputs.
    ///
    /// Each task gets `timing.shutdown_timeout_ms` to finish its current
    /// action before it is aborted.
    pub async fn shutdown(&self) {
        info!("shutting down runner");
        self.shared.core().shutting_down = true;
        self.shared.stepper.halt();

        let tasks = lock(&self.tasks).take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            let timeout = self.shared.settings.timing.shutdown_timeout();
            join_task("worker", tasks.worker, timeout).await;
            join_task("telemetry", tasks.telemetry, timeout).await;
        }

        if let Err(err) = self.shared.board.release() {
            error!(error = %err, "failed to release fixture outputs");
        }
        info!("runner stopped");
    }

    /// Receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.shared.events.subscribe()
    }

    /// Settings the runner was built with.
    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Current state.
    pub fn state(&self) -> RunnerState {
        self.shared.core().state
    }

    /// Current gantry position.
    pub fn position_mm(&self) -> PositionMm {
        self.shared.stepper.current_position_mm()
    }

    /// Whether the origin was declared with [`set_home`](Self::set_home).
    pub fn home_set(&self) -> bool {
        self.shared.core().home_set
    }

    /// Name of the selected plate.
    pub fn selected_plate(&self) -> Option<String> {
        self.shared.core().plate.as_ref().map(|(name, _)| name.clone())
    }

    /// Name of the selected firmware.
    pub fn selected_firmware(&self) -> Option<String> {
        self.shared
            .core()
            .firmware
            .as_ref()
            .map(|(name, _)| name.clone())
    }

    // =========================================================================
    // Configuration commands
    // =========================================================================

    /// Select the plate geometry by name. Legal only when stopped.
    ///
    /// # Errors
    ///
    /// [`CncError::UnknownPlate`] if no such plate is configured.
    pub fn select_plate(&self, name: &str) -> AppResult<()> {
        let plate = self.shared.settings.plate(name)?.clone();
        let mut core = self.shared.core();
        assert_eq!(
            core.state,
            RunnerState::Stopped,
            "plate selection requires the runner to be stopped"
        );
        info!(plate = name, columns = plate.columns, rows = plate.rows, "plate selected");
        core.plate = Some((name.to_string(), plate));
        Ok(())
    }

    /// Select the firmware recipe by name. Legal only when stopped.
    ///
    /// # Errors
    ///
    /// [`CncError::UnknownFirmware`] if no such firmware is configured.
    pub fn select_firmware(&self, name: &str) -> AppResult<FirmwareKind> {
        let firmware = self.shared.settings.firmware(name)?.clone();
        let kind = firmware.kind;
        let mut core = self.shared.core();
        assert_eq!(
            core.state,
            RunnerState::Stopped,
            "firmware selection requires the runner to be stopped"
        );
        info!(firmware = name, %kind, "firmware selected");
        core.firmware = Some((name.to_string(), firmware));
        Ok(kind)
    }

    // =========================================================================
    // Motion commands
    // =========================================================================

    /// Declare the current position to be the origin.
    pub fn set_home(&self) {
        self.shared.apply(Command::SetHome);
        info!("home set");
    }

    /// Drive Z, then X, then Y back to the origin.
    pub fn go_home(&self) {
        self.shared.apply(Command::GoHome);
    }

    /// Move one axis by `delta_mm`.
    ///
    /// Callers that want a collision gate should ask
    /// [`jog_requires_confirmation`](Self::jog_requires_confirmation) first.
    pub fn jog(&self, axis: Axis, delta_mm: f64) {
        let changed = {
            let mut core = self.shared.core();
            let changed = self.shared.step(&mut core, Command::Jog);
            core.pending_jog = Some((axis, delta_mm));
            changed
        };
        debug!(%axis, delta_mm, "jog requested");
        self.shared.announce(changed);
    }

    /// Whether this jog could drive the head into the boards.
    pub fn jog_requires_confirmation(&self, axis: Axis, delta_mm: f64) -> bool {
        jog_is_hazardous(
            self.home_set(),
            axis,
            delta_mm,
            self.position_mm().z,
            self.shared.settings.machine.z_minimum_safe_height_mm,
        )
    }

    /// Global hard stop: cancel the move in flight. An automatic cycle is
    /// paused with its resume point kept.
    pub fn stop(&self) {
        warn!("hard stop");
        self.shared.apply(Command::Stop);
    }

    // =========================================================================
    // Cycle commands
    // =========================================================================

    /// Start an automatic cycle at `start`.
    ///
    /// # Errors
    ///
    /// [`CncError::NotConfigured`] without a selected plate or firmware and
    /// [`CncError::CellOutOfRange`] when `start` is not on the plate. The
    /// state is left unchanged.
    ///
    /// # Panics
    ///
    /// When the runner is neither stopped nor paused.
    pub fn start_cycle(&self, start: Cell) -> AppResult<()> {
        Shared::expect_legal(&self.shared.core(), Command::StartCycle);
        self.try_start_cycle(start)
    }

    /// [`start_cycle`](Self::start_cycle) for callers racing the worker.
    ///
    /// # Errors
    ///
    /// As `start_cycle`, plus [`CncError::InvalidState`] instead of a panic
    /// when the state does not accept the command.
    pub fn try_start_cycle(&self, start: Cell) -> AppResult<()> {
        let changed = {
            let mut core = self.shared.core();
            Shared::check_legal(&core, Command::StartCycle)?;
            {
                let Some((_, plate)) = &core.plate else {
                    return Err(CncError::NotConfigured("plate"));
                };
                if core.firmware.is_none() {
                    return Err(CncError::NotConfigured("firmware"));
                }
                if !plate.contains(start) {
                    return Err(CncError::CellOutOfRange {
                        column: start.column,
                        row: start.row,
                        columns: plate.columns,
                        rows: plate.rows,
                    });
                }
            }
            let changed = self.shared.step(&mut core, Command::StartCycle);
            core.cycle_start = Some(start);
            core.resume_point = Some(start);
            changed
        };
        info!(%start, "automatic cycle started");
        self.shared.announce(changed);
        Ok(())
    }

    /// Pause the cycle. Takes effect after the current move, or after the
    /// current cell if it is already being programmed.
    pub fn pause_cycle(&self) {
        self.shared.apply(Command::PauseCycle);
        info!("automatic cycle paused");
    }

    /// [`pause_cycle`](Self::pause_cycle) that reports a cycle which already
    /// completed instead of panicking.
    ///
    /// # Errors
    ///
    /// [`CncError::InvalidState`] when no cycle is running.
    pub fn try_pause_cycle(&self) -> AppResult<()> {
        self.shared.try_apply(Command::PauseCycle)?;
        info!("automatic cycle paused");
        Ok(())
    }

    /// Continue a paused cycle at its resume point.
    ///
    /// # Errors
    ///
    /// [`CncError::NothingToResume`] when every cell was already processed.
    ///
    /// # Panics
    ///
    /// When the runner is not paused.
    pub fn resume_cycle(&self) -> AppResult<()> {
        Shared::expect_legal(&self.shared.core(), Command::ResumeCycle);
        self.try_resume_cycle()
    }

    /// [`resume_cycle`](Self::resume_cycle) for callers racing the worker.
    ///
    /// # Errors
    ///
    /// As `resume_cycle`, plus [`CncError::InvalidState`] when the cycle is
    /// no longer paused.
    pub fn try_resume_cycle(&self) -> AppResult<()> {
        let (changed, start) = {
            let mut core = self.shared.core();
            Shared::check_legal(&core, Command::ResumeCycle)?;
            let start = core.resume_point.ok_or(CncError::NothingToResume)?;
            let changed = self.shared.step(&mut core, Command::ResumeCycle);
            core.cycle_start = Some(start);
            (changed, start)
        };
        info!(%start, "automatic cycle resumed");
        self.shared.announce(changed);
        Ok(())
    }

    /// Leave a paused or completed cycle and drop its logs.
    pub fn finish_cycle(&self) {
        Shared::expect_legal(&self.shared.core(), Command::FinishCycle);
        if let Err(err) = self.try_finish_cycle() {
            warn!(error = %err, "finish ignored");
        }
    }

    /// [`finish_cycle`](Self::finish_cycle) without the precondition panic.
    ///
    /// # Errors
    ///
    /// [`CncError::InvalidState`] when no cycle is paused or completed.
    pub fn try_finish_cycle(&self) -> AppResult<()> {
        let changed = {
            let mut core = self.shared.core();
            Shared::check_legal(&core, Command::FinishCycle)?;
            let changed = self.shared.step(&mut core, Command::FinishCycle);
            core.cycle_start = None;
            changed
        };
        info!("automatic cycle finished");
        self.shared.announce(changed);
        Ok(())
    }

    /// Next unprocessed cell of the current cycle.
    pub fn resume_point(&self) -> Option<Cell> {
        self.shared.core().resume_point
    }

    /// Log of one cell of the current cycle.
    pub fn dps_log(&self, cell: Cell) -> Option<DpsLog> {
        self.shared.core().logs.get(&cell).cloned()
    }

    /// Every log of the current cycle.
    pub fn dps_logs(&self) -> BTreeMap<Cell, DpsLog> {
        self.shared.core().logs.clone()
    }

    // =========================================================================
    // Programmer
    // =========================================================================

    /// Power the board under the head and erase it.
    ///
    /// # Errors
    ///
    /// Pin failures while powering the board and programmer launch or
    /// timeout failures. A nonzero exit is returned as `Ok`.
    ///
    /// # Panics
    ///
    /// When the runner is not stopped.
    pub async fn erase(&self) -> AppResult<ProcessOutput> {
        assert_eq!(
            self.state(),
            RunnerState::Stopped,
            "erase requires the runner to be stopped"
        );
        let tester = Arc::clone(&self.shared.tester);
        cycle::blocking(move || {
            let mut tester = lock(&tester);
            tester.prepare()
        })
        .await??;

        let result = self.shared.programmer.erase().await;
        self.shared.power_down().await;
        Ok(result?)
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            self.shared.core().shutting_down = true;
            self.shared.stepper.halt();
            let _ = tasks.shutdown.send(true);
        }
    }
}

async fn telemetry_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let period = shared
        .settings
        .timing
        .telemetry_interval()
        .max(MIN_LOOP_PERIOD);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = shared.core().state;
                shared.emit(RunnerEvent::State(state));
                shared.emit(RunnerEvent::Position(shared.stepper.current_position_mm()));
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("telemetry loop stopped");
}

async fn join_task(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!(task = name, "task stopped"),
        Ok(Err(err)) if err.is_panic() => error!(task = name, "task panicked"),
        Ok(Err(err)) => warn!(task = name, error = %err, "task failed during shutdown"),
        Err(_) => {
            warn!(task = name, ?timeout, "task did not stop in time, aborting");
            abort.abort();
        }
    }
}
