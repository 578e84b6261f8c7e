//! Runner state machine as a pure transition table.
//!
//! [`transition`] maps (state, command) to the next state and the side
//! effects the runner must perform. It returns `None` for commands that are
//! not legal in the current state; the runner turns that into a panic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::motion::Axis;

/// Mode of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerState {
    /// Idle and safe. Initial state.
    Stopped,
    /// Executing one operator jog.
    MovingByStep,
    /// Driving to the origin.
    MovingHome,
    /// Traversing the plate.
    InAutomaticCycle,
    /// Cycle interrupted; can be resumed or finished.
    PausedInAutomaticCycle,
    /// Every cell was processed; waiting for finish.
    CompletedAutomaticCycle,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Stopped => "STOPPED",
            RunnerState::MovingByStep => "MOVING_BY_STEP",
            RunnerState::MovingHome => "MOVING_HOME",
            RunnerState::InAutomaticCycle => "IN_AUTOMATIC_CYCLE",
            RunnerState::PausedInAutomaticCycle => "PAUSED_IN_AUTOMATIC_CYCLE",
            RunnerState::CompletedAutomaticCycle => "COMPLETED_AUTOMATIC_CYCLE",
        };
        f.write_str(name)
    }
}

/// Inputs of the state machine: operator commands plus completion notices
/// from the worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Move one axis by a signed distance.
    Jog,
    /// Drive to the origin.
    GoHome,
    /// Start a cycle at an operator-chosen cell.
    StartCycle,
    /// Continue a paused cycle at its resume point.
    ResumeCycle,
    /// Interrupt the cycle after the current move or cell.
    PauseCycle,
    /// Leave a paused or completed cycle.
    FinishCycle,
    /// Declare the current position to be the origin.
    SetHome,
    /// Global hard stop.
    Stop,
    /// Worker: the jog or home move returned.
    MoveFinished,
    /// Worker: the raster sequence is exhausted.
    CycleFinished,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Allow the stepper to pulse.
    ArmMotion,
    /// Cancel the move in flight.
    HaltMotion,
    /// Drop accumulated logs and the resume point.
    ClearLogs,
    /// Zero the position counters.
    ResetOrigin,
    /// Start a new cycle generation; a running cycle of an older generation
    /// stops at its next check.
    NewGeneration,
    /// Start a new single-move operation; completion of an older jog or home
    /// move is ignored.
    NewOperation,
}

/// Result of a legal command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the command.
    pub next: RunnerState,
    /// Effects to perform, in order.
    pub effects: &'static [Effect],
}

const fn to(next: RunnerState, effects: &'static [Effect]) -> Option<Transition> {
    Some(Transition { next, effects })
}

/// Next state and effects for `command` in `state`, or `None` if the
/// command is not allowed there.
pub fn transition(state: RunnerState, command: Command) -> Option<Transition> {
    use Command as C;
    use Effect as E;
    use RunnerState as S;

    match (state, command) {
        (S::Stopped, C::Jog) => to(S::MovingByStep, &[E::ArmMotion, E::NewOperation]),
        (S::Stopped, C::GoHome) => to(S::MovingHome, &[E::ArmMotion, E::NewOperation]),
        (S::Stopped, C::SetHome) => to(S::Stopped, &[E::ResetOrigin]),
        (S::Stopped, C::StartCycle) => to(
            S::InAutomaticCycle,
            &[E::ClearLogs, E::ArmMotion, E::NewGeneration],
        ),
        (S::PausedInAutomaticCycle, C::StartCycle | C::ResumeCycle) => {
            to(S::InAutomaticCycle, &[E::ArmMotion, E::NewGeneration])
        }
        (S::InAutomaticCycle, C::PauseCycle) => to(S::PausedInAutomaticCycle, &[]),
        (S::InAutomaticCycle | S::PausedInAutomaticCycle, C::CycleFinished) => {
            to(S::CompletedAutomaticCycle, &[])
        }
        (S::PausedInAutomaticCycle | S::CompletedAutomaticCycle, C::FinishCycle) => {
            to(S::Stopped, &[E::ClearLogs, E::NewGeneration])
        }
        (S::MovingByStep | S::MovingHome, C::MoveFinished) => to(S::Stopped, &[]),

        (S::MovingByStep | S::MovingHome, C::Stop) => to(S::Stopped, &[E::HaltMotion]),
        (S::InAutomaticCycle, C::Stop) => to(S::PausedInAutomaticCycle, &[E::HaltMotion]),
        (other, C::Stop) => to(other, &[E::HaltMotion]),

        // completion notices that lost a race with an operator command
        (other, C::MoveFinished | C::CycleFinished) => to(other, &[]),

        _ => None,
    }
}

/// Whether a jog needs operator confirmation before it may run.
///
/// Once home is set, X/Y travel with the head below the safe height, and Z
/// travel that would end below contact height, risk a collision.
pub fn jog_is_hazardous(
    home_set: bool,
    axis: Axis,
    delta_mm: f64,
    z_mm: f64,
    z_minimum_safe_height_mm: f64,
) -> bool {
    if !home_set {
        return false;
    }
    match axis {
        Axis::X | Axis::Y => z_mm < z_minimum_safe_height_mm,
        Axis::Z => z_mm + delta_mm < 0.0,
    }
}
