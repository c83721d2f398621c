//! 1PM Gen4 parsing: single switch channel, fields that may be null.

use serde_json::json;
use shelly_exporter::config::{ChannelConfig, ChannelKind, TargetConfig};
use shelly_exporter::drivers::s1pm_gen4::S1pmGen4Driver;
use shelly_exporter::drivers::{DeviceDriver, DeviceReading};
use shelly_exporter::metrics::Metrics;

fn target() -> TargetConfig {
    TargetConfig {
        name: "heater".to_string(),
        url: "10.0.80.30".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![ChannelConfig::new(ChannelKind::Switch, 0)],
        discovered: false,
    }
}

#[test]
fn test_null_temperature_and_missing_pf() {
    // Gen4 firmware: pf omitted entirely, temperature reported but null.
    let status = json!({
        "switch:0": {
            "output": false,
            "apower": 0.0,
            "voltage": 232.8,
            "freq": 50.1,
            "current": 0.0,
            "temperature": {"tC": null, "tF": null},
            "aenergy": {"total": 55.2}
        }
    });

    let readings = S1pmGen4Driver.parse_status(&status, &target());
    assert_eq!(readings.len(), 1);

    let reading = &readings[0];
    assert_eq!(reading.output, Some(0.0));
    assert_eq!(reading.voltage_v, Some(232.8));
    assert_eq!(reading.aenergy_wh, Some(55.2));
    // Null and missing both come out absent.
    assert_eq!(reading.pf, None);
    assert_eq!(reading.temp_c, None);
    assert_eq!(reading.ret_aenergy_wh, None);
}

#[test]
fn test_absent_fields_surface_as_nan() {
    let target = target();
    let status = json!({
        "switch:0": {
            "output": true,
            "apower": 7.5,
            "voltage": 230.0,
            "temperature": {"tC": null}
        }
    });

    let metrics = Metrics::new().expect("metrics must build");
    let reading = DeviceReading {
        device_name: "heater".to_string(),
        up: true,
        poll_duration_seconds: 0.05,
        channels: S1pmGen4Driver.parse_status(&status, &target),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target);

    assert_eq!(metrics.up.with_label_values(&["heater"]).get(), 1.0);
    assert_eq!(
        metrics.switch_apower.with_label_values(&["heater", "0"]).get(),
        7.5
    );
    // Chosen policy: absent fields publish NaN rather than skipping.
    assert!(metrics
        .switch_power_factor
        .with_label_values(&["heater", "0"])
        .get()
        .is_nan());
    assert!(metrics
        .switch_temperature
        .with_label_values(&["heater", "0"])
        .get()
        .is_nan());
}

#[test]
fn test_only_index_zero_supported() {
    let mut target = target();
    target.channels.push(ChannelConfig::new(ChannelKind::Switch, 1));

    let status = json!({
        "switch:0": {"output": true},
        "switch:1": {"output": true}
    });

    let readings = S1pmGen4Driver.parse_status(&status, &target);
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].index, 0);
}
