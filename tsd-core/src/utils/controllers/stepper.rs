//! Step/direction/enable motor driver.
//!
//! A motor is driven by two halves sharing one `StepperChannel`:
//!
//! - `Stepper` runs in the main context. It owns the direction and enable outputs,
//!   converts velocity commands into timing, and reads or overwrites the position.
//! - `PulseScheduler` runs in the periodic interrupt. It owns the step output and
//!   calls `tick()` once per timer period.
//!
//! # Example
//! ```rust,ignore
//! static X_AXIS: StepperChannel<DitherCounter> = StepperChannel::new();
//!
//! let (mut stepper, mut scheduler) =
//!     Stepper::new(&X_AXIS, StepperConfig::default(), step_pin, dir_pin, enable_pin)?;
//! stepper.enable()?;
//! stepper.set_velocity(40.0)?;
//! // inside the 20 kHz timer interrupt:
//! scheduler.tick()?;
//! ```

use embassy_time::Instant;
use embedded_hal::digital::OutputPin;
use serde::{Deserialize, Serialize};

use super::position::{Command, PositionRecord, StepperChannel};
use crate::utils::math::rate::{
    ConfigError, Conversion, Direction, MotorGeometry, RateConverter, RateStrategy,
};

/// Errors raised by the stepper halves.
#[derive(Debug)]
pub enum StepperError<E: core::fmt::Debug> {
    /// A step, direction or enable output failed.
    Pin(E),
    /// Steps per distance or tick rate unusable.
    InvalidGeometry(ConfigError),
}

impl<E: core::fmt::Debug> From<ConfigError> for StepperError<E> {
    fn from(error: ConfigError) -> Self {
        StepperError::InvalidGeometry(error)
    }
}

/// Construction parameters for one motor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Steps per distance unit (e.g. steps/mm).
    pub steps_per_distance: f32,
    /// Frequency at which `PulseScheduler::tick` is called.
    pub tick_rate_hz: f32,
    /// Swap the direction output level for positive motion.
    pub invert_direction: bool,
    /// Driver is enabled by a low level on the enable output.
    pub enable_active_low: bool,
    /// Commands below this magnitude stop the motor.
    pub min_velocity: f32,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            steps_per_distance: 80.0,
            tick_rate_hz: 20_000.0,
            invert_direction: false,
            enable_active_low: true,
            min_velocity: 0.0,
        }
    }
}

/// State for `track_position`.
#[derive(Debug, Clone, Copy, Default)]
struct Tracking {
    previous_target: f32,
    last_update: Option<Instant>,
}

/// Main-context half of a motor.
pub struct Stepper<'a, S: RateStrategy, DIR, EN> {
    channel: &'a StepperChannel<S>,
    converter: RateConverter<S>,
    dir_pin: DIR,
    enable_pin: EN,
    invert_direction: bool,
    enable_active_low: bool,
    enabled: bool,
    velocity: f32,
    direction: Direction,
    tracking: Tracking,
}

/// Interrupt-context half of a motor.
pub struct PulseScheduler<'a, S: RateStrategy, STEP> {
    channel: &'a StepperChannel<S>,
    step_pin: STEP,
    pulse_high: bool,
    /// Steps already counted whose pulse could not be raised yet.
    pending: u8,
}

impl<'a, S, DIR, EN, E> Stepper<'a, S, DIR, EN>
where
    S: RateStrategy,
    DIR: OutputPin<Error = E>,
    EN: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    /// Bind geometry and pins, returning both halves.
    ///
    /// All outputs are driven inactive, the channel is reset to stopped at
    /// position zero, and the motor is left disabled.
    pub fn new<STEP>(
        channel: &'a StepperChannel<S>,
        config: StepperConfig,
        mut step_pin: STEP,
        mut dir_pin: DIR,
        enable_pin: EN,
    ) -> Result<(Self, PulseScheduler<'a, S, STEP>), StepperError<E>>
    where
        STEP: OutputPin<Error = E>,
    {
        let geometry = MotorGeometry::new::<S>(config.steps_per_distance, config.tick_rate_hz)?;

        step_pin.set_low().map_err(StepperError::Pin)?;
        dir_pin.set_low().map_err(StepperError::Pin)?;

        channel.publish(Command {
            direction: Direction::Stopped,
            timing: S::IDLE,
        });
        channel.position().store(PositionRecord {
            steps: 0,
            phase: S::ORIGIN,
        });

        let mut stepper = Stepper {
            channel,
            converter: RateConverter::new(geometry, config.min_velocity),
            dir_pin,
            enable_pin,
            invert_direction: config.invert_direction,
            enable_active_low: config.enable_active_low,
            enabled: false,
            velocity: 0.0,
            direction: Direction::Stopped,
            tracking: Tracking::default(),
        };
        stepper.disable()?;

        tracing::info!(
            steps_per_distance = geometry.steps_per_distance(),
            tick_rate_hz = geometry.tick_rate_hz(),
            max_velocity = geometry.max_velocity(),
            "stepper configured"
        );

        let scheduler = PulseScheduler {
            channel,
            step_pin,
            pulse_high: false,
            pending: 0,
        };
        Ok((stepper, scheduler))
    }

    /// Command a velocity in distance units per second.
    ///
    /// Out-of-range values saturate at the strategy's maximum. Magnitudes below the
    /// minimum velocity, and any command while disabled, stop the motor.
    pub fn set_velocity(
        &mut self,
        velocity: f32,
    ) -> Result<(), StepperError<E>> {
        if !self.enabled {
            if velocity != 0.0 {
                tracing::warn!(velocity, "velocity dropped, stepper disabled");
            }
            return self.apply(RateConverter::<S>::stopped());
        }

        let conversion = self.converter.convert(velocity);
        if libm::fabsf(velocity) > self.converter.geometry().max_velocity() {
            tracing::warn!(
                requested = velocity,
                applied = conversion.velocity,
                "velocity clamped"
            );
        }
        self.apply(conversion)
    }

    /// Write the direction output on a transition edge, then publish.
    fn apply(
        &mut self,
        conversion: Conversion<S::Timing>,
    ) -> Result<(), StepperError<E>> {
        if let Some(next) = self.direction.transition(conversion.direction) {
            self.write_direction(next)?;
        }
        self.direction = conversion.direction;
        self.velocity = conversion.velocity;

        self.channel.publish(Command {
            direction: conversion.direction,
            timing: conversion.timing,
        });
        tracing::debug!(
            velocity = conversion.velocity,
            direction = ?conversion.direction,
            timing = ?conversion.timing,
            "timing published"
        );
        Ok(())
    }

    fn write_direction(
        &mut self,
        direction: Direction,
    ) -> Result<(), StepperError<E>> {
        let high = (direction == Direction::Positive) != self.invert_direction;
        if high {
            self.dir_pin.set_high().map_err(StepperError::Pin)
        } else {
            self.dir_pin.set_low().map_err(StepperError::Pin)
        }
    }

    fn write_enable(
        &mut self,
        active: bool,
    ) -> Result<(), StepperError<E>> {
        if active != self.enable_active_low {
            self.enable_pin.set_high().map_err(StepperError::Pin)
        } else {
            self.enable_pin.set_low().map_err(StepperError::Pin)
        }
    }

    /// Energise the driver. The motor stays stopped until the next velocity command.
    pub fn enable(&mut self) -> Result<(), StepperError<E>> {
        self.write_enable(true)?;
        self.enabled = true;
        tracing::info!("stepper enabled");
        self.apply(RateConverter::<S>::stopped())
    }

    /// Stop pulse emission and release the driver.
    pub fn disable(&mut self) -> Result<(), StepperError<E>> {
        self.enabled = false;
        self.apply(RateConverter::<S>::stopped())?;
        self.write_enable(false)?;
        tracing::info!("stepper disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Last commanded velocity after clamping; zero when stopped.
    pub fn velocity(&self) -> f32 {
        self.velocity
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn geometry(&self) -> &MotorGeometry {
        self.converter.geometry()
    }

    pub fn min_velocity(&self) -> f32 {
        self.converter.min_velocity()
    }

    /// Change the minimum velocity and re-apply the current command against it.
    pub fn set_min_velocity(
        &mut self,
        min_velocity: f32,
    ) -> Result<(), StepperError<E>> {
        self.converter.set_min_velocity(min_velocity);
        self.set_velocity(self.velocity)
    }

    /// Reconfigure for a new tick frequency and re-apply the current command.
    pub fn set_tick_rate_hz(
        &mut self,
        tick_rate_hz: f32,
    ) -> Result<(), StepperError<E>> {
        let steps_per_distance = self.converter.geometry().steps_per_distance();
        let geometry = MotorGeometry::new::<S>(steps_per_distance, tick_rate_hz)?;
        self.converter = RateConverter::new(geometry, self.converter.min_velocity());
        tracing::info!(
            tick_rate_hz,
            max_velocity = geometry.max_velocity(),
            "tick rate changed"
        );
        self.set_velocity(self.velocity)
    }

    /// Overwrite the step count and clear any sub-step phase. Emits no pulse.
    pub fn set_position_steps(
        &mut self,
        steps: i32,
    ) {
        self.channel.position().store(PositionRecord {
            steps,
            phase: S::ORIGIN,
        });
        self.tracking.previous_target = steps as f32 * self.geometry().distance_per_step();
    }

    /// Overwrite the position from a distance, keeping the sub-step remainder
    /// where the strategy can represent it. Emits no pulse.
    pub fn set_position_distance(
        &mut self,
        distance: f32,
    ) {
        let distance = if distance.is_finite() { distance } else { 0.0 };
        let exact = distance * self.geometry().steps_per_distance();
        let whole = libm::roundf(exact);

        self.channel.position().store(PositionRecord {
            steps: whole as i32,
            phase: S::phase_from_fraction(exact - whole),
        });
        self.tracking.previous_target = distance;
    }

    pub fn position_steps(&self) -> i32 {
        self.channel.position().steps()
    }

    /// Position in distance units, including the sub-step fraction if any.
    pub fn position_distance(&self) -> f32 {
        let record = self.channel.position().snapshot();
        (record.steps as f32 + S::phase_fraction(&record.phase))
            * self.geometry().distance_per_step()
    }

    /// Follow a target position updated at `update_hz`.
    ///
    /// The commanded velocity is the target's own velocity plus the current
    /// position error, both scaled by the update rate.
    pub fn track_position(
        &mut self,
        target: f32,
        update_hz: f32,
    ) -> Result<(), StepperError<E>> {
        if !(update_hz.is_finite() && update_hz > 0.0) {
            tracing::warn!(update_hz, "tracking update ignored");
            return Ok(());
        }
        let velocity =
            (target + target - self.tracking.previous_target - self.position_distance()) * update_hz;
        self.tracking.previous_target = target;
        self.set_velocity(velocity)
    }

    /// `track_position` with the update rate measured from successive timestamps.
    ///
    /// The first call only records the target and timestamp.
    pub fn track_position_at(
        &mut self,
        target: f32,
        now: Instant,
    ) -> Result<(), StepperError<E>> {
        let elapsed = self
            .tracking
            .last_update
            .replace(now)
            .and_then(|previous| now.checked_duration_since(previous))
            .map(|elapsed| elapsed.as_micros())
            .filter(|&micros| micros > 0);

        match elapsed {
            Some(micros) => self.track_position(target, 1_000_000.0 / micros as f32),
            None => {
                self.tracking.previous_target = target;
                Ok(())
            }
        }
    }
}

impl<'a, S, STEP, E> PulseScheduler<'a, S, STEP>
where
    S: RateStrategy,
    STEP: OutputPin<Error = E>,
    E: core::fmt::Debug,
{
    /// Tick handler; call once per timer period from the interrupt.
    ///
    /// A raised step output is lowered on the tick after it was raised, and the
    /// strategy advances on every tick. A step that falls due on a lowering tick
    /// is counted at once but its pulse is raised on the following tick, so the
    /// output always stays low for at least one tick between pulses. Returns
    /// `true` when this tick raised the step output. Never loops and never waits.
    #[inline]
    pub fn tick(&mut self) -> Result<bool, StepperError<E>> {
        let lowered = self.pulse_high;
        if lowered {
            self.step_pin.set_low().map_err(StepperError::Pin)?;
            self.pulse_high = false;
        }

        if self.channel.advance() {
            self.pending = self.pending.saturating_add(1);
        }
        if lowered || self.pending == 0 {
            return Ok(false);
        }

        self.step_pin.set_high().map_err(StepperError::Pin)?;
        self.pulse_high = true;
        self.pending -= 1;
        Ok(true)
    }

    /// Steps counted in the position but not yet pulsed.
    pub fn pending_pulses(&self) -> u8 {
        self.pending
    }

    pub fn is_pulse_high(&self) -> bool {
        self.pulse_high
    }
}
