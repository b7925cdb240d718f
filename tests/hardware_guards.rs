//! Identity verification and homing guard.
//!
//! Both guards must stop a reconcile before the first motion command reaches
//! the hardware.

use lab_devices::device::Device;
use lab_devices::devices::elliptec::{ElliptecBoard, ElliptecChild};
use lab_devices::devices::kdc101::{AptLink, Kdc101, POSITION};
use lab_devices::homing::HomingPolicy;
use lab_devices::protocol::apt;
use lab_devices::protocol::elliptec::Address;
use lab_devices::sim::{ElliptecSimHandle, Kdc101SimHandle};
use lab_devices::units::Ell14Calibration;
use lab_devices::{DesiredState, DeviceError, Value};
use std::time::Duration;

fn hwp_board(sim: &ElliptecSimHandle) -> ElliptecBoard {
    let child = ElliptecChild {
        name: "hwp".to_string(),
        address: Address::new(2).unwrap(),
        serial_number: "11400101".to_string(),
        model: "ELL14".to_string(),
        home_on_startup: true,
        calibration: Ell14Calibration::default(),
    };
    ElliptecBoard::new("waveplates", vec![child], Box::new(sim.connect()))
}

fn stage(sim: &Kdc101SimHandle, serial: &str, homing: HomingPolicy) -> Kdc101 {
    let link = AptLink::new(Box::new(sim.connect()), Duration::from_secs(1));
    Kdc101::new("stage", serial, homing, 0.0005, link)
}

#[tokio::test]
async fn test_swapped_mount_is_never_moved() {
    let sim = ElliptecSimHandle::new();
    sim.add_mount(2, "99999999");
    sim.set_position(2, 1234);
    let mut board = hwp_board(&sim);

    let err = board.configure().await.unwrap_err();
    assert!(matches!(
        err,
        DeviceError::IdentityMismatch { ref expected, ref actual, .. }
            if expected == "11400101" && actual == "99999999"
    ));

    let desired: DesiredState = [("hwp", 35_840.0)].into_iter().collect();
    let err = board.transition_to_buffered(&desired).await.unwrap_err();
    assert!(matches!(err, DeviceError::IdentityMismatch { .. }));

    // Neither the startup homing nor the move was sent.
    assert!(sim.move_commands().is_empty());
    assert_eq!(sim.position(2), Some(1234));
}

#[tokio::test]
async fn test_identity_checked_once_per_session() {
    let sim = ElliptecSimHandle::new();
    sim.add_mount(2, "11400101");
    let mut board = hwp_board(&sim);
    board.configure().await.unwrap();

    let desired: DesiredState = [("hwp", 100.0)].into_iter().collect();
    board.transition_to_buffered(&desired).await.unwrap();
    board.transition_to_buffered(&desired).await.unwrap();

    let info_queries = sim.commands().iter().filter(|c| c.as_str() == "2in").count();
    assert_eq!(info_queries, 1);
}

#[tokio::test]
async fn test_wrong_controller_serial_rejected() {
    let sim = Kdc101SimHandle::new(27_000_002);
    sim.set_homed(true);
    let mut stage = stage(&sim, "27000001", HomingPolicy::Auto);

    let err = stage.configure().await.unwrap_err();
    assert!(matches!(err, DeviceError::IdentityMismatch { .. }));
    assert_eq!(sim.motion_count(), 0);
    assert!(!sim.is_enabled());
}

#[tokio::test]
async fn test_manual_policy_refuses_to_move_unhomed_stage() {
    let sim = Kdc101SimHandle::new(27_000_001);
    let mut stage = stage(&sim, "27000001", HomingPolicy::Manual);
    stage.configure().await.unwrap();

    let desired: DesiredState = [(POSITION, 6.0)].into_iter().collect();
    let err = stage.transition_to_buffered(&desired).await.unwrap_err();

    assert!(matches!(err, DeviceError::NotHomed { ref device } if device == "stage"));
    assert_eq!(sim.motion_count(), 0);
    assert!(!sim.messages().contains(&apt::MOT_MOVE_ABSOLUTE));
    assert!(!sim.messages().contains(&apt::MOT_MOVE_HOME));
    assert!(!sim.is_homed());
    assert!(!stage.is_homed().await.unwrap());
    assert_eq!(stage.front_panel().get(POSITION), Some(Value::Number(0.0)));
}

#[tokio::test]
async fn test_auto_policy_homes_before_first_move() {
    let sim = Kdc101SimHandle::new(27_000_001);
    let mut stage = stage(&sim, "27000001", HomingPolicy::Auto);
    // Lost the reference after configure, e.g. a power cycle of the cube.
    stage.configure().await.unwrap();
    sim.set_homed(false);

    let desired: DesiredState = [(POSITION, 6.0)].into_iter().collect();
    let report = stage.transition_to_buffered(&desired).await.unwrap();

    assert!(sim.is_homed());
    let messages = sim.messages();
    let homed_at = messages.iter().rposition(|id| *id == apt::MOT_MOVE_HOME).unwrap();
    let moved_at = messages.iter().position(|id| *id == apt::MOT_MOVE_ABSOLUTE).unwrap();
    assert!(homed_at < moved_at);
    assert!((report.observed[POSITION].as_f64().unwrap() - 6.0).abs() < 0.0005);
}
