//! Configuration file to running (simulated) devices.

use lab_devices::config::{DeviceConfig, Settings};
use lab_devices::device::{share, Device};
use lab_devices::devices;
use lab_devices::homing::HomingPolicy;
use lab_devices::poller::Poller;
use lab_devices::{DesiredState, Value};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn settings_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_shipped_config_is_valid() {
    let file = settings_file(include_str!("../config/labdev.toml"));
    let settings = Settings::load_from(file.path()).unwrap();

    let names: Vec<&str> = settings.devices.iter().map(|d| d.name()).collect();
    assert_eq!(names, vec!["waveplates", "stage", "synth"]);

    let Some(DeviceConfig::Kdc101(stage)) = settings.device("stage") else {
        panic!("stage should be a kdc101");
    };
    assert_eq!(stage.homing, HomingPolicy::Manual);

    let Some(DeviceConfig::Agilent83650b(synth)) = settings.device("synth") else {
        panic!("synth should be an agilent83650b");
    };
    assert_eq!(synth.connection.settle_time, Some(Duration::from_millis(50)));
    assert_eq!(synth.ramp.map(|r| r.step_size), Some(10e6));
}

#[test]
fn test_duplicate_mount_address_rejected() {
    let file = settings_file(
        r#"
[[devices]]
type = "elliptec"
name = "waveplates"
mock = true

[[devices.children]]
name = "hwp"
address = "3"
serial_number = "11400101"

[[devices.children]]
name = "qwp"
address = "3"
serial_number = "11400102"
"#,
    );
    assert!(Settings::load_from(file.path()).is_err());
}

#[tokio::test]
async fn test_every_configured_device_comes_up() {
    let file = settings_file(include_str!("../config/labdev.toml"));
    let settings = Settings::load_from(file.path()).unwrap();

    for config in &settings.devices {
        let mut device = devices::build(config).await.unwrap();
        device.configure().await.unwrap();
        let panel = device.front_panel().snapshot();
        assert!(panel.read_at.is_some());
        assert_eq!(panel.values.len(), device.attributes().len());
        device.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_polling_and_programming_share_one_device() {
    let file = settings_file(include_str!("../config/labdev.toml"));
    let settings = Settings::load_from(file.path()).unwrap();
    let config = settings.device("synth").unwrap();

    let mut synth = devices::build(config).await.unwrap();
    synth.configure().await.unwrap();
    let panel = synth.front_panel();
    let device = share(synth);
    let poller = Poller::spawn(device.clone(), Duration::from_millis(5));

    let desired: DesiredState = [("freq", Value::Number(1.03e9)), ("gate", Value::Flag(true))]
        .into_iter()
        .collect();
    let report = device.lock().await.transition_to_buffered(&desired).await.unwrap();
    assert_eq!(report.written, vec!["freq".to_string(), "gate".to_string()]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(poller.stop().await > 0);
    assert_eq!(panel.get("freq"), Some(Value::Number(1.03e9)));
    assert_eq!(panel.get("gate"), Some(Value::Flag(true)));
}
