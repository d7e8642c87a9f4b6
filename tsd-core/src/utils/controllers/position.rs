//! Cross-context state exchange for the pulse engine.
//!
//! The tick handler (interrupt context) and the `Stepper` (main context) share
//! exactly two things: the published `Command` and the `PositionStore`. Both are
//! wrapped in an `embassy_sync` blocking mutex over `CriticalSectionRawMutex`, so
//! every access is a copy in or out of a `Cell` with interrupts masked only for
//! that copy.

use core::cell::Cell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};

use crate::utils::math::rate::{Direction, RateStrategy};

/// Step count together with the strategy's sub-step phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionRecord<P> {
    pub steps: i32,
    pub phase: P,
}

/// Step counter written by the tick handler and read or overwritten from any context.
pub struct PositionStore<P> {
    record: Mutex<CriticalSectionRawMutex, Cell<PositionRecord<P>>>,
}

impl<P: Copy> PositionStore<P> {
    /// A store at step zero with the given phase.
    pub const fn new(phase: P) -> Self {
        Self {
            record: Mutex::new(Cell::new(PositionRecord { steps: 0, phase })),
        }
    }

    /// Consistent copy of steps and phase.
    pub fn snapshot(&self) -> PositionRecord<P> {
        self.record.lock(|record| record.get())
    }

    pub fn steps(&self) -> i32 {
        self.record.lock(|record| record.get().steps)
    }

    /// Overwrite steps and phase in one critical section.
    pub fn store(
        &self,
        record: PositionRecord<P>,
    ) {
        self.record.lock(|cell| cell.set(record));
    }

    /// Run `step` on the phase and move the count by `delta` if it reports a step.
    #[inline(always)]
    pub fn advance(
        &self,
        delta: i32,
        step: impl FnOnce(&mut P) -> bool,
    ) -> bool {
        self.record.lock(|cell| {
            let mut record = cell.get();
            let stepped = step(&mut record.phase);
            if stepped {
                record.steps = record.steps.wrapping_add(delta);
            }
            cell.set(record);
            stepped
        })
    }
}

/// Direction and timing as seen by the tick handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command<T> {
    pub direction: Direction,
    pub timing: T,
}

/// Shared block between a `Stepper` and its `PulseScheduler`.
///
/// Usually placed in a `static` so the interrupt handler can reach it:
///
/// ```rust
/// use tsd_core::utils::controllers::StepperChannel;
/// use tsd_core::utils::math::rate::DitherCounter;
///
/// static X_AXIS: StepperChannel<DitherCounter> = StepperChannel::new();
/// ```
pub struct StepperChannel<S: RateStrategy> {
    command: Mutex<CriticalSectionRawMutex, Cell<Command<S::Timing>>>,
    position: PositionStore<S::Phase>,
}

impl<S: RateStrategy> StepperChannel<S> {
    /// Stopped, idle timing, position zero.
    pub const fn new() -> Self {
        Self {
            command: Mutex::new(Cell::new(Command {
                direction: Direction::Stopped,
                timing: S::IDLE,
            })),
            position: PositionStore::new(S::ORIGIN),
        }
    }

    /// Make a fully-formed command visible to the next tick.
    pub fn publish(
        &self,
        command: Command<S::Timing>,
    ) {
        self.command.lock(|cell| cell.set(command));
    }

    pub fn command(&self) -> Command<S::Timing> {
        self.command.lock(|cell| cell.get())
    }

    pub fn position(&self) -> &PositionStore<S::Phase> {
        &self.position
    }

    /// Shared-state half of one tick: `true` when a step was registered.
    #[inline(always)]
    pub(crate) fn advance(&self) -> bool {
        let command = self.command();
        self.position.advance(command.direction.delta(), |phase| {
            S::advance(&command.timing, command.direction, phase)
        })
    }
}

impl<S: RateStrategy> Default for StepperChannel<S> {
    fn default() -> Self {
        Self::new()
    }
}
