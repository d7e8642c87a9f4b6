use embedded_hal_mock::eh1::digital::{
    Mock as PinMock, State as PinState, Transaction as PinTrans,
};
use tsd_core::utils::controllers::{
    StepperChannel, StepperCommand, StepperConfig, STEPPER_CHANNEL,
};
use tsd_core::utils::math::rate::{DitherCounter, Direction, PhaseAccumulator};
use tsd_core::utils::Stepper;

/// Expect the pin to be driven high.
pub fn high() -> PinTrans {
    PinTrans::set(PinState::High)
}
/// Expect the pin to be driven low.
pub fn low() -> PinTrans {
    PinTrans::set(PinState::Low)
}

fn config(
    steps_per_distance: f32,
    tick_rate_hz: f32,
) -> StepperConfig {
    StepperConfig {
        steps_per_distance,
        tick_rate_hz,
        ..StepperConfig::default()
    }
}

#[test]
fn test_construct_leaves_motor_disabled() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low()]);
    // active-low enable: disabled means high
    let mut en = PinMock::new(&[high()]);

    let channel: StepperChannel<DitherCounter> = StepperChannel::new();
    let (stepper, _scheduler) = Stepper::new(
        &channel,
        config(80.0, 20_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    assert!(!stepper.is_enabled());
    assert_eq!(stepper.direction(), Direction::Stopped);
    assert_eq!(stepper.position_steps(), 0);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_direction_written_only_on_transition() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low(), high(), low(), low()]);
    let mut en = PinMock::new(&[high(), low()]);

    let channel: StepperChannel<DitherCounter> = StepperChannel::new();
    let (mut stepper, _scheduler) = Stepper::new(
        &channel,
        config(80.0, 20_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.enable().unwrap();
    stepper.set_velocity(40.0).unwrap(); // stopped -> positive: write
    stepper.set_velocity(30.0).unwrap(); // positive -> positive: no write
    stepper.set_velocity(-10.0).unwrap(); // positive -> negative: write
    stepper.set_velocity(0.0).unwrap(); // negative -> stopped: no write
    stepper.set_velocity(-5.0).unwrap(); // stopped -> negative: write
    assert_eq!(stepper.direction(), Direction::Negative);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_inverted_direction_and_active_high_enable() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low(), low(), high()]);
    let mut en = PinMock::new(&[low(), high(), low()]);

    let channel: StepperChannel<PhaseAccumulator> = StepperChannel::new();
    let cfg = StepperConfig {
        invert_direction: true,
        enable_active_low: false,
        ..config(80.0, 20_000.0)
    };
    let (mut stepper, _scheduler) =
        Stepper::new(&channel, cfg, step.clone(), dir.clone(), en.clone()).unwrap();

    stepper.enable().unwrap();
    stepper.set_velocity(10.0).unwrap();
    stepper.set_velocity(-10.0).unwrap();
    stepper.disable().unwrap();

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_two_phase_pulse_at_max_rate() {
    let mut step = PinMock::new(&[low(), high(), low(), high(), low()]);
    let mut dir = PinMock::new(&[low(), high()]);
    let mut en = PinMock::new(&[high(), low()]);

    let channel: StepperChannel<PhaseAccumulator> = StepperChannel::new();
    let (mut stepper, mut scheduler) = Stepper::new(
        &channel,
        config(1.0, 1_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.enable().unwrap();
    stepper.set_velocity(500.0).unwrap();

    let fired: Vec<bool> = (0..4).map(|_| scheduler.tick().unwrap()).collect();
    assert_eq!(fired, vec![true, false, true, false]);
    assert!(!scheduler.is_pulse_high());
    assert_eq!(stepper.position_steps(), 2);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_reversal_keeps_step_low_for_a_tick() {
    // low at construction, then high/low per pulse with a held tick on reversal
    let mut step = PinMock::new(&[low(), high(), low(), high(), low(), high()]);
    let mut dir = PinMock::new(&[low(), high(), low()]);
    let mut en = PinMock::new(&[high(), low()]);

    let channel: StepperChannel<PhaseAccumulator> = StepperChannel::new();
    let (mut stepper, mut scheduler) = Stepper::new(
        &channel,
        config(1.0, 1_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.enable().unwrap();
    stepper.set_velocity(500.0).unwrap();
    assert!(scheduler.tick().unwrap());

    stepper.set_velocity(-500.0).unwrap();
    let fired: Vec<bool> = (0..4).map(|_| scheduler.tick().unwrap()).collect();
    assert_eq!(fired, vec![false, true, false, true]);
    assert_eq!(stepper.position_steps(), -1);
    assert_eq!(scheduler.pending_pulses(), 0);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_disabled_motor_never_toggles_pins() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low()]);
    let mut en = PinMock::new(&[high()]);

    let channel: StepperChannel<DitherCounter> = StepperChannel::new();
    let (mut stepper, mut scheduler) = Stepper::new(
        &channel,
        config(80.0, 20_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.set_velocity(40.0).unwrap();
    assert_eq!(stepper.velocity(), 0.0);

    for _ in 0..1_000 {
        assert!(!scheduler.tick().unwrap());
    }
    assert_eq!(stepper.position_steps(), 0);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_disable_stops_stale_velocity() {
    let mut step = PinMock::new(&[low(), high(), low()]);
    let mut dir = PinMock::new(&[low(), high()]);
    let mut en = PinMock::new(&[high(), low(), high()]);

    let channel: StepperChannel<PhaseAccumulator> = StepperChannel::new();
    let (mut stepper, mut scheduler) = Stepper::new(
        &channel,
        config(1.0, 1_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.enable().unwrap();
    stepper.set_velocity(500.0).unwrap();
    assert!(scheduler.tick().unwrap());

    stepper.disable().unwrap();
    assert_eq!(stepper.velocity(), 0.0);
    // The raised pulse is lowered; nothing else is emitted.
    for _ in 0..10 {
        assert!(!scheduler.tick().unwrap());
    }
    assert_eq!(stepper.position_steps(), 1);

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_set_position_emits_no_pulse() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low()]);
    let mut en = PinMock::new(&[high(), low()]);

    let channel: StepperChannel<DitherCounter> = StepperChannel::new();
    let (mut stepper, mut scheduler) = Stepper::new(
        &channel,
        config(80.0, 20_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();
    stepper.enable().unwrap();

    for n in [1_234, -7, i32::MAX, i32::MIN, 0] {
        stepper.set_position_steps(n);
        assert_eq!(stepper.position_steps(), n);
        assert!(!scheduler.tick().unwrap());
    }

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_command_wire_format() {
    let v: StepperCommand = serde_json::from_str(r#"{"sc":"v","v":40.0}"#).unwrap();
    assert_eq!(v, StepperCommand::V { v: 40.0 });

    let t: StepperCommand = serde_json::from_str(r#"{"sc":"t","d":1.5,"hz":50.0}"#).unwrap();
    assert_eq!(t, StepperCommand::T { d: 1.5, hz: 50.0 });

    let e: StepperCommand = serde_json::from_str(r#"{"sc":"enable"}"#).unwrap();
    assert_eq!(e, StepperCommand::Enable);

    assert!(serde_json::from_str::<StepperCommand>(r#"{"sc":"warp"}"#).is_err());
}

#[test]
fn test_execute_commands() {
    let mut step = PinMock::new(&[low()]);
    let mut dir = PinMock::new(&[low(), high()]);
    let mut en = PinMock::new(&[high(), low(), high()]);

    let channel: StepperChannel<DitherCounter> = StepperChannel::new();
    let (mut stepper, _scheduler) = Stepper::new(
        &channel,
        config(80.0, 20_000.0),
        step.clone(),
        dir.clone(),
        en.clone(),
    )
    .unwrap();

    stepper.execute_command(StepperCommand::Enable).unwrap();
    stepper.execute_command(StepperCommand::V { v: 40.0 }).unwrap();
    assert_eq!(stepper.velocity(), 40.0);

    stepper.execute_command(StepperCommand::S { n: 80 }).unwrap();
    assert_eq!(stepper.position_steps(), 80);

    stepper.execute_command(StepperCommand::P { d: -2.0 }).unwrap();
    assert_eq!(stepper.position_steps(), -160);

    stepper.execute_command(StepperCommand::M { v: 50.0 }).unwrap();
    assert_eq!(stepper.direction(), Direction::Stopped);

    stepper.execute_command(StepperCommand::Disable).unwrap();
    assert!(!stepper.is_enabled());

    step.done();
    dir.done();
    en.done();
}

#[test]
fn test_command_channel_round_trip() {
    let cmd = StepperCommand::V { v: -12.5 };
    STEPPER_CHANNEL.try_send(cmd).unwrap();
    assert_eq!(STEPPER_CHANNEL.try_receive().unwrap(), cmd);
    assert!(STEPPER_CHANNEL.try_receive().is_err());
}
