//! Velocity to per-tick timing conversion for the pulse engine.
//!
//! A velocity command (distance per second) is turned into the quantity the tick
//! handler consumes on every interrupt. Two interchangeable strategies share the
//! `RateStrategy` contract:
//!
//! - `PhaseAccumulator`: a 32-bit phase increment; a step fires whenever the
//!   accumulator wraps.
//! - `DitherCounter`: an integer tick interval that alternates between
//!   `ticks_per_step` and `ticks_per_step + 1` so the mean interval matches a
//!   non-integer ideal.
//!
//! All floating point and division happens in `compute_timing`, on the caller's
//! side. `advance` is integer-only and O(1).
//!
//! # Example
//! ```rust
//! use tsd_core::utils::math::rate::{DitherCounter, MotorGeometry, RateConverter};
//! let geometry = MotorGeometry::new::<DitherCounter>(80.0, 20_000.0).unwrap();
//! let converter = RateConverter::<DitherCounter>::new(geometry, 0.0);
//! let conversion = converter.convert(40.0);
//! assert_eq!(conversion.timing.ticks_per_step, 6);
//! ```

use core::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Width of the phase accumulator used by `PhaseAccumulator`.
pub const PHASE_BITS: u32 = 32;
/// One full accumulator cycle (2^32), i.e. one step.
const PHASE_SCALE: f32 = 4_294_967_296.0;
/// Half a cycle. Largest allowed increment and the accumulator origin.
pub const PHASE_HALF: u32 = 1 << (PHASE_BITS - 1);

/// Longest interval `DitherCounter` will schedule, in ticks.
pub const MAX_TICKS_PER_STEP: u32 = 1 << 24;
/// Longest dither cycle, in steps.
pub const MAX_DITHER_CYCLE: u32 = 1 << 16;
/// Bias added to the dither offset so the cycle length stays within `MAX_DITHER_CYCLE`.
const DITHER_EPSILON: f32 = 1.0 / MAX_DITHER_CYCLE as f32;

/// Motion state published to the tick handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
    #[default]
    Stopped,
}

impl Direction {
    /// Signed position change for one pulse.
    pub const fn delta(self) -> i32 {
        match self {
            Direction::Positive => 1,
            Direction::Negative => -1,
            Direction::Stopped => 0,
        }
    }

    /// Transition edge of the direction state machine.
    ///
    /// Yields the new direction when `next` is a moving state entered from any
    /// other state; that is the only time the direction output must be written.
    pub fn transition(
        self,
        next: Direction,
    ) -> Option<Direction> {
        match next {
            Direction::Stopped => None,
            next if next == self => None,
            next => Some(next),
        }
    }
}

/// Rejected geometry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Steps per distance unit must be finite and positive.
    StepsPerDistance,
    /// Tick frequency must be finite and positive.
    TickRate,
}

/// Immutable per-instance motor constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorGeometry {
    steps_per_distance: f32,
    distance_per_step: f32,
    tick_rate_hz: f32,
    max_velocity: f32,
    velocity_floor: f32,
}

impl MotorGeometry {
    /// Derive the velocity limits of strategy `S` for the given motor and tick rate.
    pub fn new<S: RateStrategy>(
        steps_per_distance: f32,
        tick_rate_hz: f32,
    ) -> Result<Self, ConfigError> {
        if !(steps_per_distance.is_finite() && steps_per_distance > 0.0) {
            return Err(ConfigError::StepsPerDistance);
        }
        if !(tick_rate_hz.is_finite() && tick_rate_hz > 0.0) {
            return Err(ConfigError::TickRate);
        }

        let distance_per_step = 1.0 / steps_per_distance;
        Ok(Self {
            steps_per_distance,
            distance_per_step,
            tick_rate_hz,
            max_velocity: tick_rate_hz * distance_per_step / S::MIN_TICKS_PER_STEP,
            velocity_floor: S::velocity_floor(steps_per_distance, tick_rate_hz),
        })
    }

    pub fn steps_per_distance(&self) -> f32 {
        self.steps_per_distance
    }

    pub fn distance_per_step(&self) -> f32 {
        self.distance_per_step
    }

    pub fn tick_rate_hz(&self) -> f32 {
        self.tick_rate_hz
    }

    /// Fastest command the strategy can realise; larger magnitudes are clamped.
    pub fn max_velocity(&self) -> f32 {
        self.max_velocity
    }

    /// Slowest non-zero command the strategy can represent.
    pub fn velocity_floor(&self) -> f32 {
        self.velocity_floor
    }
}

/// Rate synthesis capability shared by both pulse-timing designs.
///
/// Implementors are zero-sized markers; all state lives in `Timing` (published by
/// the main context) and `Phase` (owned by the position store).
pub trait RateStrategy {
    /// Per-tick parameter read by the tick handler.
    type Timing: Copy + Send + PartialEq + core::fmt::Debug;
    /// Sub-step state advanced on every tick.
    type Phase: Copy + Send + PartialEq + core::fmt::Debug;

    /// Fewest ticks allowed between two pulses.
    const MIN_TICKS_PER_STEP: f32;
    /// "Infinite interval" sentinel; no pulse is ever emitted with it.
    const IDLE: Self::Timing;
    /// Phase seeded by a whole-step position write.
    const ORIGIN: Self::Phase;

    /// Smallest velocity magnitude with a representable timing.
    fn velocity_floor(
        steps_per_distance: f32,
        tick_rate_hz: f32,
    ) -> f32;

    /// Timing for a positive step rate. Runs outside the interrupt path.
    fn compute_timing(
        steps_per_second: f32,
        tick_rate_hz: f32,
    ) -> Self::Timing;

    /// Advance `phase` by one tick; `true` when a step is due.
    fn advance(
        timing: &Self::Timing,
        direction: Direction,
        phase: &mut Self::Phase,
    ) -> bool;

    /// Sub-step offset held by `phase`, in steps.
    fn phase_fraction(phase: &Self::Phase) -> f32;

    /// Phase representing a sub-step offset in `[-0.5, 0.5)`.
    fn phase_from_fraction(fraction: f32) -> Self::Phase;
}

/// Strategy A: wrapping phase accumulator.
///
/// The accumulator origin is `PHASE_HALF`, so a step fires whenever the continuous
/// position crosses a half-step boundary and the step count is the nearest whole
/// step in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseAccumulator;

impl RateStrategy for PhaseAccumulator {
    type Timing = u32;
    type Phase = u32;

    const MIN_TICKS_PER_STEP: f32 = 2.0;
    const IDLE: u32 = 0;
    const ORIGIN: u32 = PHASE_HALF;

    fn velocity_floor(
        steps_per_distance: f32,
        tick_rate_hz: f32,
    ) -> f32 {
        // One LSB of increment.
        tick_rate_hz / (PHASE_SCALE * steps_per_distance)
    }

    fn compute_timing(
        steps_per_second: f32,
        tick_rate_hz: f32,
    ) -> u32 {
        if !(steps_per_second > 0.0) {
            return Self::IDLE;
        }
        let increment = libm::roundf(steps_per_second / tick_rate_hz * PHASE_SCALE);
        if increment >= PHASE_HALF as f32 {
            PHASE_HALF
        } else {
            // At least one LSB for any rate at or above the velocity floor.
            increment.max(1.0) as u32
        }
    }

    #[inline(always)]
    fn advance(
        increment: &u32,
        direction: Direction,
        phase: &mut u32,
    ) -> bool {
        let (next, wrapped) = match direction {
            Direction::Positive => phase.overflowing_add(*increment),
            Direction::Negative => phase.overflowing_sub(*increment),
            Direction::Stopped => return false,
        };
        *phase = next;
        wrapped
    }

    fn phase_fraction(phase: &u32) -> f32 {
        *phase as f32 / PHASE_SCALE - 0.5
    }

    fn phase_from_fraction(fraction: f32) -> u32 {
        // Saturating cast; NaN maps to 0.
        ((fraction + 0.5) * PHASE_SCALE) as u32
    }
}

/// Strategy B: tick counter with interval dithering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DitherCounter;

/// Interval and dither ratio published for `DitherCounter`.
///
/// Within every cycle of `total_steps` steps, the first `long_steps` use an
/// interval of `ticks_per_step + 1` and the rest use `ticks_per_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DitherTiming {
    pub ticks_per_step: u32,
    pub total_steps: u32,
    pub long_steps: u32,
}

impl DitherTiming {
    /// Mean interval over one dither cycle, in ticks.
    pub fn mean_interval(&self) -> f32 {
        self.ticks_per_step as f32 + self.long_steps as f32 / self.total_steps as f32
    }
}

/// Hot-path counters for `DitherCounter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DitherPhase {
    /// Ticks elapsed since the last step.
    pub ticks: u32,
    /// Position inside the dither cycle, `1..=total_steps`.
    pub counter: u32,
}

/// Nearest whole cycle length for a fractional offset, kept within `1..=MAX_DITHER_CYCLE`.
fn cycle_length(offset: f32) -> u32 {
    let cycle = libm::roundf(1.0 / offset);
    if cycle >= MAX_DITHER_CYCLE as f32 {
        MAX_DITHER_CYCLE
    } else if cycle < 1.0 {
        1
    } else {
        cycle as u32
    }
}

impl RateStrategy for DitherCounter {
    type Timing = DitherTiming;
    type Phase = DitherPhase;

    const MIN_TICKS_PER_STEP: f32 = 4.0;
    const IDLE: DitherTiming = DitherTiming {
        ticks_per_step: u32::MAX,
        total_steps: 1,
        long_steps: 0,
    };
    const ORIGIN: DitherPhase = DitherPhase {
        ticks: 0,
        counter: 1,
    };

    fn velocity_floor(
        steps_per_distance: f32,
        tick_rate_hz: f32,
    ) -> f32 {
        tick_rate_hz / (MAX_TICKS_PER_STEP as f32 * steps_per_distance)
    }

    fn compute_timing(
        steps_per_second: f32,
        tick_rate_hz: f32,
    ) -> DitherTiming {
        if !(steps_per_second > 0.0) {
            return Self::IDLE;
        }
        let ideal = tick_rate_hz / steps_per_second;
        if !ideal.is_finite() {
            return Self::IDLE;
        }
        // The velocity floor maps to exactly the longest interval.
        let ideal = ideal.min(MAX_TICKS_PER_STEP as f32);

        let whole = libm::floorf(ideal);
        if whole < 2.0 {
            // Pulse needs one tick high and one tick low.
            return DitherTiming {
                ticks_per_step: 2,
                total_steps: 1,
                long_steps: 0,
            };
        }

        let offset = ideal - whole;
        let (total_steps, long_steps) = if offset < 0.5 {
            (cycle_length(offset + DITHER_EPSILON), 1)
        } else {
            let total = cycle_length(1.0 + DITHER_EPSILON - offset);
            (total, total - 1)
        };

        DitherTiming {
            ticks_per_step: whole as u32,
            total_steps,
            long_steps,
        }
    }

    #[inline(always)]
    fn advance(
        timing: &DitherTiming,
        direction: Direction,
        phase: &mut DitherPhase,
    ) -> bool {
        if direction == Direction::Stopped {
            phase.ticks = 0;
            return false;
        }

        phase.ticks = phase.ticks.wrapping_add(1);
        let interval = if phase.counter <= timing.long_steps {
            timing.ticks_per_step.saturating_add(1)
        } else {
            timing.ticks_per_step
        };
        if phase.ticks < interval {
            return false;
        }

        phase.ticks = 0;
        phase.counter = if phase.counter >= timing.total_steps {
            1
        } else {
            phase.counter + 1
        };
        true
    }

    fn phase_fraction(_phase: &DitherPhase) -> f32 {
        0.0
    }

    fn phase_from_fraction(_fraction: f32) -> DitherPhase {
        Self::ORIGIN
    }
}

/// Result of converting one velocity command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conversion<T> {
    /// Command after clamping; zero when stopped.
    pub velocity: f32,
    pub direction: Direction,
    pub timing: T,
}

/// Pure velocity to timing translation for strategy `S`.
#[derive(Debug, Clone, Copy)]
pub struct RateConverter<S> {
    geometry: MotorGeometry,
    min_velocity: f32,
    _strategy: PhantomData<S>,
}

impl<S: RateStrategy> RateConverter<S> {
    pub fn new(
        geometry: MotorGeometry,
        min_velocity: f32,
    ) -> Self {
        let mut converter = Self {
            geometry,
            min_velocity: 0.0,
            _strategy: PhantomData,
        };
        converter.set_min_velocity(min_velocity);
        converter
    }

    /// The stopped conversion: zero velocity and the idle sentinel.
    pub fn stopped() -> Conversion<S::Timing> {
        Conversion {
            velocity: 0.0,
            direction: Direction::Stopped,
            timing: S::IDLE,
        }
    }

    pub fn geometry(&self) -> &MotorGeometry {
        &self.geometry
    }

    /// Configured minimum velocity magnitude.
    pub fn min_velocity(&self) -> f32 {
        self.min_velocity
    }

    /// Set the minimum velocity magnitude; negative or non-finite values mean zero.
    pub fn set_min_velocity(
        &mut self,
        min_velocity: f32,
    ) {
        self.min_velocity = if min_velocity.is_finite() {
            min_velocity.max(0.0)
        } else {
            0.0
        };
    }

    /// Magnitude below which every command means stopped.
    pub fn stop_threshold(&self) -> f32 {
        self.min_velocity.max(self.geometry.velocity_floor())
    }

    /// Clamp `velocity` into range and compute its timing.
    pub fn convert(
        &self,
        velocity: f32,
    ) -> Conversion<S::Timing> {
        let velocity = if velocity.is_finite() { velocity } else { 0.0 };
        let max = self.geometry.max_velocity();
        let velocity = velocity.clamp(-max, max);
        let magnitude = libm::fabsf(velocity);

        if !(magnitude > 0.0) || magnitude < self.stop_threshold() {
            return Self::stopped();
        }

        let direction = if velocity > 0.0 {
            Direction::Positive
        } else {
            Direction::Negative
        };
        let timing = S::compute_timing(
            magnitude * self.geometry.steps_per_distance(),
            self.geometry.tick_rate_hz(),
        );

        Conversion {
            velocity,
            direction,
            timing,
        }
    }
}
