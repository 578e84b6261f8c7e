use crate::dps::DpsLog;
use crate::motion::PositionMm;

use super::raster::Cell;
use super::state::RunnerState;

/// Notification published by the runner to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// The cycle is heading for this cell.
    TargetCell(Cell),
    /// Gantry position, after each cell and on every telemetry tick.
    Position(PositionMm),
    /// Runner state, on every change and on every telemetry tick.
    State(RunnerState),
    /// A cell was programmed and tested.
    CellLogged(DpsLog),
    /// Every cell of the plate was processed.
    CycleCompleted,
    /// A jog or home move returned.
    OperationCompleted,
}
