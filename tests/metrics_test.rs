//! Metric catalog, ignore masks, failure accounting and series removal.

use serde_json::json;
use shelly_exporter::config::{ChannelConfig, ChannelKind, TargetConfig};
use shelly_exporter::drivers::pro4pm_gen2::Pro4pmGen2Driver;
use shelly_exporter::drivers::{DeviceDriver, DeviceReading, InputReading};
use shelly_exporter::metrics::Metrics;

fn target_with_channel(channel: ChannelConfig) -> TargetConfig {
    TargetConfig {
        name: "dev".to_string(),
        url: "10.0.80.22".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![channel],
        discovered: false,
    }
}

#[test]
fn test_catalog_names() {
    let metrics = Metrics::new().expect("metrics must build");
    let rendered = metrics.render().expect("render");

    // Unlabelled counters/gauges are always present in the exposition.
    for name in [
        "shelly_discovery_scans_total",
        "shelly_discovery_devices_found_total",
        "shelly_discovery_scan_duration_seconds",
        "shelly_discovery_last_scan_timestamp_seconds",
        "shelly_discovery_scan_errors_total",
        "shelly_config_reloads_total",
        "shelly_config_reload_errors_total",
        "shelly_config_last_reload_timestamp_seconds",
        "shelly_config_last_reload_status",
    ] {
        assert!(rendered.contains(name), "missing {name}");
    }
}

#[test]
fn test_poll_failure_accounting() {
    let metrics = Metrics::new().expect("metrics must build");
    let target = target_with_channel(ChannelConfig::new(ChannelKind::Switch, 0));

    let failure = DeviceReading::failure("dev", 0.2, "authentication denied (HTTP 401)".into());
    metrics.apply_reading(&failure, &target);

    assert_eq!(metrics.up.with_label_values(&["dev"]).get(), 0.0);
    assert_eq!(metrics.poll_errors.with_label_values(&["dev"]).get(), 1.0);
    // No successful poll yet: timestamp never written.
    let rendered = metrics.render().expect("render");
    assert!(!rendered.contains(r#"shelly_last_poll_timestamp_seconds{device="dev"}"#));

    metrics.apply_reading(&failure, &target);
    assert_eq!(metrics.poll_errors.with_label_values(&["dev"]).get(), 2.0);
}

#[test]
fn test_failure_leaves_last_good_gauges() {
    let metrics = Metrics::new().expect("metrics must build");
    let target = target_with_channel(ChannelConfig::new(ChannelKind::Switch, 0));
    let status = json!({"switch:0": {"output": true, "apower": 40.0}});

    let good = DeviceReading {
        device_name: "dev".to_string(),
        up: true,
        poll_duration_seconds: 0.1,
        channels: Pro4pmGen2Driver.parse_status(&status, &target),
        ..Default::default()
    };
    metrics.apply_reading(&good, &target);
    metrics.apply_reading(&DeviceReading::failure("dev", 0.2, "timeout".into()), &target);

    assert_eq!(metrics.up.with_label_values(&["dev"]).get(), 0.0);
    // Channel gauges keep their last good value.
    assert_eq!(
        metrics.switch_apower.with_label_values(&["dev", "0"]).get(),
        40.0
    );
}

#[test]
fn test_ignore_mask_suppresses_metric() {
    let metrics = Metrics::new().expect("metrics must build");
    let mut channel = ChannelConfig::new(ChannelKind::Switch, 0);
    channel.ignore_power_factor = true;
    channel.ignore_voltage = true;
    let target = target_with_channel(channel);

    let status = json!({
        "switch:0": {"output": true, "apower": 12.0, "voltage": 230.0, "pf": 0.9}
    });
    let reading = DeviceReading {
        device_name: "dev".to_string(),
        up: true,
        poll_duration_seconds: 0.1,
        channels: Pro4pmGen2Driver.parse_status(&status, &target),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target);

    let rendered = metrics.render().expect("render");
    assert!(rendered.contains(r#"shelly_switch_apower_watts{device="dev",meter="0"} 12"#));
    assert!(
        !rendered.contains(r#"shelly_switch_power_factor{device="dev""#),
        "ignored power factor must not be emitted"
    );
    assert!(
        !rendered.contains(r#"shelly_switch_voltage_volts{device="dev""#),
        "ignored voltage must not be emitted"
    );
}

#[test]
fn test_system_wifi_connection_and_inputs() {
    let metrics = Metrics::new().expect("metrics must build");
    let target = target_with_channel(ChannelConfig::new(ChannelKind::Switch, 0));

    let status = json!({
        "switch:0": {"output": true},
        "sys": {"uptime": 7200, "ram_size": 262144, "ram_free": 150000, "cfg_rev": 17},
        "wifi": {"sta_ip": "10.0.80.22", "rssi": -61},
        "cloud": {"connected": true},
        "mqtt": {"connected": false},
        "input:0": {"state": true}
    });

    let reading = DeviceReading {
        device_name: "dev".to_string(),
        up: true,
        poll_duration_seconds: 0.1,
        channels: Pro4pmGen2Driver.parse_status(&status, &target),
        inputs: shelly_exporter::drivers::parse_inputs(&status),
        system: shelly_exporter::drivers::parse_system(&status),
        wifi: shelly_exporter::drivers::parse_wifi(&status),
        connection: shelly_exporter::drivers::parse_connection(&status),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target);

    assert_eq!(metrics.sys_uptime.with_label_values(&["dev"]).get(), 7200.0);
    assert_eq!(metrics.wifi_rssi.with_label_values(&["dev"]).get(), -61.0);
    assert_eq!(metrics.wifi_connected.with_label_values(&["dev"]).get(), 1.0);
    assert_eq!(metrics.cloud_connected.with_label_values(&["dev"]).get(), 1.0);
    assert_eq!(metrics.mqtt_connected.with_label_values(&["dev"]).get(), 0.0);
    assert_eq!(
        metrics.input_state.with_label_values(&["dev", "0"]).get(),
        1.0
    );
}

#[test]
fn test_remove_device_deletes_all_series() {
    let metrics = Metrics::new().expect("metrics must build");
    let target = target_with_channel(ChannelConfig::new(ChannelKind::Switch, 0));

    let status = json!({
        "switch:0": {"output": true, "apower": 5.0},
        "sys": {"uptime": 10},
        "input:0": {"state": false}
    });
    let reading = DeviceReading {
        device_name: "dev".to_string(),
        up: true,
        poll_duration_seconds: 0.1,
        channels: Pro4pmGen2Driver.parse_status(&status, &target),
        inputs: vec![InputReading { index: 0, state: Some(0.0) }],
        system: shelly_exporter::drivers::parse_system(&status),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target);

    let before = metrics.render().expect("render");
    assert!(before.contains(r#"device="dev""#));

    metrics.remove_device("dev", &target);

    let after = metrics.render().expect("render");
    assert!(
        !after.contains(r#"device="dev""#),
        "all series for a removed device must disappear"
    );
}

#[test]
fn test_discovery_and_reload_recorders() {
    let metrics = Metrics::new().expect("metrics must build");

    metrics.record_scan_started();
    metrics.record_device_found(
        "10.0.80.22",
        "SPSW-104PE16EU",
        2,
        "Pro4PM",
        "AA:BB:CC:DD:EE:FF",
        "2025-01-01T00:00:00Z",
    );
    metrics.record_scan_error();
    metrics.record_scan_completed(1.5);

    metrics.record_reload_success();
    metrics.record_reload_error();

    assert_eq!(metrics.discovery_scans.get(), 1.0);
    assert_eq!(metrics.discovery_devices_found.get(), 1.0);
    assert_eq!(metrics.discovery_scan_errors.get(), 1.0);
    assert_eq!(metrics.discovery_scan_duration.get(), 1.5);
    assert_eq!(metrics.config_reloads.get(), 1.0);
    assert_eq!(metrics.config_reload_errors.get(), 1.0);
    // Last write wins: the error left status at 0.
    assert_eq!(metrics.config_last_reload_status.get(), 0.0);

    let rendered = metrics.render().expect("render");
    assert!(rendered.contains(r#"ip="10.0.80.22""#));
    assert!(rendered.contains(r#"mac="AA:BB:CC:DD:EE:FF""#));
}
