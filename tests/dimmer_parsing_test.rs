//! Dimmer 0/1-10V PM parsing: light channel, never switch series.

use serde_json::json;
use shelly_exporter::config::{ChannelConfig, ChannelKind, TargetConfig};
use shelly_exporter::drivers::dimmer_0110vpm_g3::Dimmer0110vpmG3Driver;
use shelly_exporter::drivers::{DeviceDriver, DeviceReading};
use shelly_exporter::metrics::Metrics;

fn target() -> TargetConfig {
    TargetConfig {
        name: "D".to_string(),
        url: "10.0.80.50".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![ChannelConfig::new(ChannelKind::Light, 0)],
        discovered: false,
    }
}

#[test]
fn test_light_channel_reading() {
    let status = json!({
        "light:0": {
            "output": true,
            "brightness": 75,
            "apower": 8.2,
            "aenergy": {"total": 15.4}
        }
    });

    let readings = Dimmer0110vpmG3Driver.parse_status(&status, &target());
    assert_eq!(readings.len(), 1);

    let reading = &readings[0];
    assert_eq!(reading.kind, ChannelKind::Light);
    assert_eq!(reading.output, Some(1.0));
    assert_eq!(reading.brightness, Some(75.0));
    assert_eq!(reading.apower_w, Some(8.2));
    assert_eq!(reading.aenergy_wh, Some(15.4));
    assert_eq!(reading.voltage_v, None);
}

#[test]
fn test_light_metrics_no_switch_series() {
    let target = target();
    let status = json!({
        "light:0": {
            "output": true,
            "brightness": 75,
            "apower": 8.2,
            "aenergy": {"total": 15.4}
        }
    });

    let metrics = Metrics::new().expect("metrics must build");
    let reading = DeviceReading {
        device_name: "D".to_string(),
        up: true,
        poll_duration_seconds: 0.04,
        channels: Dimmer0110vpmG3Driver.parse_status(&status, &target),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target);

    assert_eq!(
        metrics
            .light_brightness
            .with_label_values(&["D", "0"])
            .get(),
        75.0
    );

    let rendered = metrics.render().expect("render");
    assert!(rendered.contains(r#"shelly_light_brightness_percent{channel="0",device="D"} 75"#)
        || rendered.contains(r#"shelly_light_brightness_percent{device="D",channel="0"} 75"#));
    assert!(
        !rendered.contains(r#"shelly_switch_output{device="D""#),
        "dimmer must not produce switch series"
    );
}

#[test]
fn test_switch_channel_config_is_rejected() {
    let mut target = target();
    target.channels = vec![ChannelConfig::new(ChannelKind::Switch, 0)];

    let status = json!({"light:0": {"output": true}});
    let readings = Dimmer0110vpmG3Driver.parse_status(&status, &target);
    assert!(readings.is_empty());
}
