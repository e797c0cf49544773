mod common;

use btbattery::config::UnitOverride;
use btbattery::limits::{LimitationCalculator, LimitationMode};
use btbattery::model::{LimitReason, TopologyMode};
use common::{live_unit, settings};
use tokio::time::{Duration, Instant};

#[tokio::test(start_paused = true)]
async fn override_applies_to_one_unit_only() {
    let settings = settings(TopologyMode::Parallel, &["AA:01", "AA:02"], |c| {
        c.units[1].overrides = Some(UnitOverride {
            max_charge_current: Some(20.0),
            ..UnitOverride::default()
        });
    });
    let unit = live_unit(0, 13.2, 0.0, 100.0, 50.0);

    let mut first = LimitationCalculator::new(settings.units[0].limits.clone());
    let mut second = LimitationCalculator::new(settings.units[1].limits.clone());
    let now = Instant::now();
    assert!((first.evaluate(&unit, now).charge_current_limit - 50.0).abs() < 1e-9);
    assert!((second.evaluate(&unit, now).charge_current_limit - 20.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn step_mode_from_config() {
    let settings = settings(TopologyMode::Series, &["AA:01"], |c| {
        c.limits.mode = LimitationMode::Step;
    });
    let mut calculator = LimitationCalculator::new(settings.units[0].limits.clone());
    let mut unit = live_unit(0, 13.2, 0.0, 100.0, 50.0);
    // Between the 10 °C (0.4) and 15 °C (0.8) breakpoints
    unit.temperatures = vec![12.0];

    let decision = calculator.evaluate(&unit, Instant::now());
    assert!((decision.charge_current_fraction - 0.4).abs() < 1e-9);
    assert!(decision.reasons.contains(&LimitReason::Temperature));
}

#[tokio::test(start_paused = true)]
async fn hold_switches_target_to_float() {
    let settings = settings(TopologyMode::Series, &["AA:01"], |c| {
        c.limits.max_voltage_time_seconds = 60;
    });
    let mut calculator = LimitationCalculator::new(settings.units[0].limits.clone());
    let mut unit = live_unit(0, 13.8, 0.0, 100.0, 99.0);
    unit.cell_voltages = vec![3.45; 4];

    let decision = calculator.evaluate(&unit, Instant::now());
    assert!(!decision.hold_active);
    let bulk = calculator.charge_voltage_target(&decision, 4);

    tokio::time::advance(Duration::from_secs(61)).await;
    let decision = calculator.evaluate(&unit, Instant::now());
    assert!(decision.hold_active);
    assert_eq!(decision.charge_current_fraction, 0.0);
    let float = calculator.charge_voltage_target(&decision, 4);
    assert!((bulk - float - 4.0 * (3.45 - 3.35)).abs() < 1e-9);
}
