use clap::{Parser, ValueEnum};
use critical_section as _;
use embedded_hal::digital::{ErrorType, OutputPin};
use std::collections::BTreeMap;
use std::convert::Infallible;
use tracing::{debug, error, info, trace};
use tsd_core::utils::controllers::{StepperChannel, StepperCommand, StepperConfig};
use tsd_core::utils::math::rate::{DitherCounter, PhaseAccumulator, RateStrategy};
use tsd_core::utils::Stepper;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    /// Integer ticks-per-step with a dithered remainder
    Dither,
    /// Wrapping phase accumulator
    Phase,
}

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// Rate generator driving the step pin
    #[clap(long, value_enum, default_value = "dither")]
    strategy: Strategy,
    /// Tick interrupt rate in Hz
    #[clap(long, default_value_t = 20_000.0)]
    tick_rate: f32,
    /// Motor steps per unit of distance
    #[clap(long, default_value_t = 80.0)]
    steps_per_distance: f32,
    /// Velocity (distance/s) applied after enabling
    #[clap(long, allow_hyphen_values = true)]
    velocity: Option<f32>,
    /// Number of ticks to simulate
    #[clap(long, default_value_t = 20_000)]
    ticks: u32,
    /// JSON stepper command, e.g. '{"sc":"v","v":12.5}' (repeatable)
    #[clap(long = "cmd")]
    commands: Vec<String>,
}

/// Output pin that logs every level change.
struct LogPin {
    name: &'static str,
    high: bool,
}

impl LogPin {
    fn new(name: &'static str) -> Self {
        Self { name, high: false }
    }
}

impl ErrorType for LogPin {
    type Error = Infallible;
}

impl OutputPin for LogPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        if self.high {
            trace!("{}: low", self.name);
        }
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if !self.high {
            trace!("{}: high", self.name);
        }
        self.high = true;
        Ok(())
    }
}

fn run<S: RateStrategy>(
    opts: &Opts,
    commands: &[StepperCommand],
) {
    let channel: StepperChannel<S> = StepperChannel::new();
    let config = StepperConfig {
        steps_per_distance: opts.steps_per_distance,
        tick_rate_hz: opts.tick_rate,
        ..StepperConfig::default()
    };

    let (mut stepper, mut scheduler) = match Stepper::new(
        &channel,
        config,
        LogPin::new("step"),
        LogPin::new("dir"),
        LogPin::new("en"),
    ) {
        Ok(pair) => pair,
        Err(e) => {
            error!("stepper setup failed: {:?}", e);
            return;
        }
    };

    if let Some(v) = opts.velocity {
        if let Err(e) = stepper.enable().and_then(|()| stepper.set_velocity(v)) {
            error!("applying --velocity {} failed: {:?}", v, e);
        }
    }
    for &command in commands {
        debug!("executing {:?}", command);
        if let Err(e) = stepper.execute_command(command) {
            error!("stepper command failed: {:?}", e);
        }
    }

    let mut histogram: BTreeMap<u32, u32> = BTreeMap::new();
    let mut last_step: Option<u32> = None;
    let mut steps = 0u32;
    for tick in 0..opts.ticks {
        let stepped = match scheduler.tick() {
            Ok(stepped) => stepped,
            Err(e) => {
                error!("tick {} failed: {:?}", tick, e);
                break;
            }
        };
        if stepped {
            steps += 1;
            if let Some(last) = last_step {
                *histogram.entry(tick - last).or_default() += 1;
            }
            last_step = Some(tick);
        }
    }

    let seconds = opts.ticks as f32 / opts.tick_rate;
    info!(
        "{} ticks ({:.3} s): {} pulses, position {} steps / {:.4} distance",
        opts.ticks,
        seconds,
        steps,
        stepper.position_steps(),
        stepper.position_distance()
    );
    if seconds > 0.0 {
        info!(
            "measured {:.4} distance/s, commanded {:.4}",
            steps as f32 / seconds / opts.steps_per_distance,
            stepper.velocity()
        );
    }
    for (interval, count) in &histogram {
        info!("interval {:>6} ticks: {}", interval, count);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opts: Opts = Opts::parse();

    let mut commands = Vec::with_capacity(opts.commands.len());
    for raw in &opts.commands {
        match serde_json::from_str::<StepperCommand>(raw) {
            Ok(command) => commands.push(command),
            Err(e) => {
                error!("invalid stepper command {}: {}", raw, e);
                return;
            }
        }
    }

    info!("simulating {:?} strategy at {} Hz", opts.strategy, opts.tick_rate);
    match opts.strategy {
        Strategy::Dither => run::<DitherCounter>(&opts, &commands),
        Strategy::Phase => run::<PhaseAccumulator>(&opts, &commands),
    }
}
