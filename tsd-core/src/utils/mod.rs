//! Utility re-exports for the pulse engine.
//!
//! - `controllers`: stepper halves, shared position store and command channel
//! - `math`: rate conversion and the phase-accumulator / dither-counter strategies

pub mod controllers;
pub mod math;

pub use controllers::{
    PulseScheduler, Stepper, StepperChannel, StepperCommand, StepperConfig, StepperError,
    STEPPER_CHANNEL,
};
pub use embassy_time::Instant;
pub use math::rate::{DitherCounter, Direction, MotorGeometry, PhaseAccumulator, RateStrategy};
