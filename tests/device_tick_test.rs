mod common;

use common::{MockTransport, Request};
use std::time::{Duration, Instant};
use voltaic::config::{BatteryState, BridgeConfig, DeviceConfig, DeviceKind, ShutdownConfig};
use voltaic::device::{
    COMMUNICATION_FAILED, READY_FOR_WORKING, SOC, bmw, byd_c130, create_device, refu88k,
};
use voltaic::state_machine::State;
use voltaic::thing_state::ThingState;

const UNIT: u8 = 1;

fn bridge() -> BridgeConfig {
    BridgeConfig {
        low_priority_tasks_per_cycle: 16,
        ..BridgeConfig::default()
    }
}

fn device(id: &str, kind: DeviceKind) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        kind,
        unit_id: UNIT,
        communication_failure_cycles: 2,
        ..DeviceConfig::default()
    }
}

const CONTACTOR: u16 = 0x2010;

#[tokio::test]
async fn byd_starts_and_reports_ready() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, CONTACTOR, 0);
    mock.set_register(UNIT, 0x2103, 80);
    let mut battery =
        create_device(&device("byd0", DeviceKind::BydC130), &bridge(), mock.shared(), None).unwrap();
    let now = Instant::now();

    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Off));
    assert_eq!(battery.channels().value(SOC), Some(80.into()));

    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Init));
    assert!(mock.writes().contains(&Request::WriteSingle {
        unit: UNIT,
        address: CONTACTOR,
        value: 1
    }));

    mock.set_register(UNIT, CONTACTOR, 3);
    battery.tick(now + Duration::from_secs(2)).await;
    assert_eq!(battery.state_machine_state(), Some(State::Running));
    assert!(!battery.channels().is_true(READY_FOR_WORKING));

    mock.clear_requests();
    battery.tick(now + Duration::from_secs(3)).await;
    assert!(battery.channels().is_true(READY_FOR_WORKING));
    assert!(mock.writes().is_empty(), "no contactor write while on grid");
}

#[tokio::test]
async fn byd_level_two_alarm_is_a_fault() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, CONTACTOR, 3);
    let mut battery =
        create_device(&device("byd0", DeviceKind::BydC130), &bridge(), mock.shared(), None).unwrap();
    let now = Instant::now();
    battery.tick(now).await;
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Running));

    // level-1 alarm only warns
    mock.set_register(UNIT, 0x2141, 0b1);
    battery.tick(now).await;
    assert_eq!(battery.thing_state().state(), ThingState::Warning);
    assert_eq!(battery.state_machine_state(), Some(State::Running));

    mock.set_register(UNIT, 0x2140, 0b1);
    battery.tick(now).await;
    assert_eq!(battery.thing_state().state(), ThingState::Fault);
    assert_eq!(battery.state_machine_state(), Some(State::Error));

    mock.clear_requests();
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::ErrorDelay));
    assert!(mock.writes().contains(&Request::WriteSingle {
        unit: UNIT,
        address: CONTACTOR,
        value: 0
    }));
}

#[tokio::test]
async fn byd_override_off_only_stops() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, CONTACTOR, 3);
    let mut config = device("byd0", DeviceKind::BydC130);
    config.battery_state = BatteryState::Off;
    let mut battery = create_device(&config, &bridge(), mock.shared(), None).unwrap();
    battery.tick(Instant::now()).await;
    assert_eq!(battery.state_machine_state(), Some(State::Undefined));
    assert!(!battery.channels().is_true(READY_FOR_WORKING));
    assert_eq!(mock.register(UNIT, CONTACTOR), 0);
}

#[tokio::test]
async fn communication_loss_warns_without_fault() {
    let mock = MockTransport::new();
    mock.set_offline(true);
    let mut battery =
        create_device(&device("byd0", DeviceKind::BydC130), &bridge(), mock.shared(), None).unwrap();
    let now = Instant::now();
    battery.tick(now).await;
    assert_eq!(battery.thing_state().state(), ThingState::Run);
    battery.tick(now).await;
    assert!(battery.channels().is_true(COMMUNICATION_FAILED));
    assert_eq!(battery.thing_state().state(), ThingState::Warning);
    assert_eq!(battery.state_machine_state(), Some(State::Pending));
}

#[tokio::test]
async fn bmw_heartbeat_and_start_command() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, 1000, 0);
    let mut battery = create_device(&device("bmw0", DeviceKind::Bmw), &bridge(), mock.shared(), None).unwrap();
    let now = Instant::now();

    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Off));
    assert_eq!(mock.register(UNIT, 1399), 1);

    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Init));
    assert_eq!(mock.register(UNIT, 1399), 2);
    assert_eq!(mock.register(UNIT, 1400), bmw::CLOSE_CONTACTORS as u16);

    mock.set_register(UNIT, 1000, 4);
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Running));
}

#[tokio::test]
async fn bmw_error_state_clears_error() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, 1000, 4);
    mock.set_register(UNIT, 1001, 0x10);
    let mut battery = create_device(&device("bmw0", DeviceKind::Bmw), &bridge(), mock.shared(), None).unwrap();
    let now = Instant::now();

    // error bits alone only affect health
    battery.tick(now).await;
    assert_eq!(battery.thing_state().state(), ThingState::Fault);
    assert_eq!(battery.state_machine_state(), Some(State::Running));

    mock.set_register(UNIT, 1000, 5);
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Error));
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::ErrorDelay));
    assert_eq!(mock.register(UNIT, 1400), bmw::CLEAR_ERROR as u16);
}

#[tokio::test]
async fn refu_reports_scaled_power() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, 40083, 1500);
    mock.set_register(UNIT, 40084, 0xFFFF);
    mock.set_register(UNIT, 40089, 0);
    mock.set_register(UNIT, 40090, 0);
    mock.set_register(UNIT, 40107, 4);
    let mut inverter =
        create_device(&device("inv0", DeviceKind::Refu88k), &bridge(), mock.shared(), None).unwrap();
    inverter.tick(Instant::now()).await;
    assert_eq!(inverter.channels().value(refu88k::ACTIVE_POWER), Some(150.into()));
    assert_eq!(inverter.channels().value(refu88k::REACTIVE_POWER), Some(0.into()));
    assert_eq!(inverter.state_machine_state(), None);
    assert_eq!(inverter.thing_state().state(), ThingState::Run);

    mock.set_register(UNIT, 40107, 7);
    inverter.tick(Instant::now()).await;
    assert_eq!(inverter.thing_state().state(), ThingState::Fault);
}

#[tokio::test]
async fn bmw_bypass_waits_for_inverter_standby() {
    let mock = MockTransport::new();
    // inverter producing, battery running
    mock.set_register(UNIT, 1000, 4);
    mock.set_registers(2, 40083, &[200, 0]);
    mock.set_register(2, 40107, 4);

    let mut inverter_config = device("inv0", DeviceKind::Refu88k);
    inverter_config.unit_id = 2;
    let mut inverter = create_device(&inverter_config, &bridge(), mock.shared(), None).unwrap();

    let mut config = device("bmw0", DeviceKind::Bmw);
    config.shutdown = ShutdownConfig {
        enabled: true,
        inverter_id: Some("inv0".to_string()),
    };
    let mut battery = create_device(
        &config,
        &bridge(),
        mock.shared(),
        Some(inverter.channels().clone()),
    )
    .unwrap();
    let now = Instant::now();

    inverter.tick(now).await;
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Undefined));
    assert_eq!(mock.register(UNIT, 1400), 0);
    assert!(!mock.writes().iter().any(|w| matches!(
        w,
        Request::WriteMultiple { address: 1399, values, .. } if values.len() > 1
    )));

    // standby with zero power opens the contactors
    mock.set_registers(2, 40083, &[0, 0]);
    mock.set_register(2, 40107, 8);
    mock.clear_requests();
    inverter.tick(now).await;
    battery.tick(now).await;
    assert!(mock.writes().contains(&Request::WriteMultiple {
        unit: UNIT,
        address: 1399,
        values: vec![2, bmw::OPEN_CONTACTORS as u16],
    }));

    // switching the bypass off resumes supervision from scratch
    battery
        .channels()
        .set_next_write_value(bmw::BATTERY_OFF, false)
        .unwrap();
    battery.tick(now).await;
    assert_eq!(battery.state_machine_state(), Some(State::Running));
}

#[tokio::test]
async fn bmw_bypass_keeps_contactors_with_unknown_power() {
    let mock = MockTransport::new();
    mock.set_register(UNIT, 1000, 4);
    // standby, but the active power scale factor is not implemented
    mock.set_registers(2, 40083, &[0, 0x8000]);
    mock.set_register(2, 40107, 8);

    let mut inverter_config = device("inv0", DeviceKind::Refu88k);
    inverter_config.unit_id = 2;
    let mut inverter = create_device(&inverter_config, &bridge(), mock.shared(), None).unwrap();
    let mut config = device("bmw0", DeviceKind::Bmw);
    config.shutdown = ShutdownConfig {
        enabled: true,
        inverter_id: Some("inv0".to_string()),
    };
    let mut battery = create_device(
        &config,
        &bridge(),
        mock.shared(),
        Some(inverter.channels().clone()),
    )
    .unwrap();
    let now = Instant::now();

    inverter.tick(now).await;
    battery.tick(now).await;
    assert_eq!(inverter.channels().value(refu88k::ACTIVE_POWER), None);
    let command_sent = |mock: &MockTransport| {
        mock.writes().iter().any(|w| matches!(
            w,
            Request::WriteMultiple { address: 1399, values, .. }
                if values.len() > 1 && values[1] == bmw::OPEN_CONTACTORS as u16
        ))
    };
    assert!(!command_sent(&mock));

    // once power reads as zero the contactors open
    mock.set_register(2, 40084, 0);
    inverter.tick(now).await;
    battery.tick(now).await;
    assert!(command_sent(&mock));
}

#[test]
fn bmw_requires_configured_inverter() {
    let mock = MockTransport::new();
    let mut config = device("bmw0", DeviceKind::Bmw);
    config.shutdown.inverter_id = Some("inv0".to_string());
    assert!(create_device(&config, &bridge(), mock.shared(), None).is_err());
    let _ = byd_c130::CONTACTOR_CONTROL;
}
