//! Module Exports
//!
//! This file exports the motor-side modules of the pulse engine.
//!
//! - `position`: cross-context position store and command exchange.
//! - `stepper`: main-context `Stepper` and interrupt-context `PulseScheduler`.

pub mod position;
pub mod stepper;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};

pub use position::{Command, PositionRecord, PositionStore, StepperChannel};
pub use stepper::{PulseScheduler, Stepper, StepperConfig, StepperError};

use crate::utils::math::rate::RateStrategy;

/// Channel used to receive stepper commands (`StepperCommand` messages).
pub static STEPPER_CHANNEL: embassy_sync::channel::Channel<
    CriticalSectionRawMutex,
    StepperCommand,
    16,
> = embassy_sync::channel::Channel::new();

/// Stepper command variants issued by a motion planner or host link.
///
/// Serialized as JSON with tag `"sc"`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "sc", rename_all = "snake_case")]
pub enum StepperCommand {
    /// Set velocity (distance/s).
    V { v: f32 },
    /// Set position by distance.
    P { d: f32 },
    /// Set position in steps.
    S { n: i32 },
    /// Set minimum velocity.
    M { v: f32 },
    /// Track a target position updated at `hz`.
    T { d: f32, hz: f32 },
    Enable,
    Disable,
}

impl<'a, S, DIR, EN, E> Stepper<'a, S, DIR, EN>
where
    S: RateStrategy,
    DIR: OutputPin<Error = E>,
    EN: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    /// Execute one `StepperCommand`.
    pub fn execute_command(
        &mut self,
        command: StepperCommand,
    ) -> Result<(), StepperError<E>> {
        match command {
            StepperCommand::V { v } => self.set_velocity(v),
            StepperCommand::P { d } => {
                self.set_position_distance(d);
                Ok(())
            }
            StepperCommand::S { n } => {
                self.set_position_steps(n);
                Ok(())
            }
            StepperCommand::M { v } => self.set_min_velocity(v),
            StepperCommand::T { d, hz } => self.track_position(d, hz),
            StepperCommand::Enable => self.enable(),
            StepperCommand::Disable => self.disable(),
        }
    }

    /// Serve `STEPPER_CHANNEL` forever.
    pub async fn command_ch(&mut self) -> ! {
        loop {
            let command = STEPPER_CHANNEL.receiver().receive().await;
            tracing::info!("Received stepper command: {:?}", command);
            if let Err(e) = self.execute_command(command) {
                tracing::error!("stepper command failed: {:?}", e);
            }
        }
    }
}
