//! Backoff schedule, reload diffing and discovery insertion.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shelly_exporter::config::{ChannelConfig, ChannelKind, Config, TargetConfig};
use shelly_exporter::drivers::pro4pm_gen2::Pro4pmGen2Driver;
use shelly_exporter::drivers::{DeviceDriver, DeviceReading, DriverRegistry};
use shelly_exporter::metrics::Metrics;
use shelly_exporter::poller::{backoff_delay, DevicePoller};
use shelly_exporter::shelly::ShellyClientPool;

#[test]
fn test_backoff_formula() {
    // min(max, base * 2^(n-1))
    assert_eq!(backoff_delay(1, 30.0, 300.0, 2.0), Duration::from_secs(30));
    assert_eq!(backoff_delay(2, 30.0, 300.0, 2.0), Duration::from_secs(60));
    assert_eq!(backoff_delay(3, 30.0, 300.0, 2.0), Duration::from_secs(120));
    assert_eq!(backoff_delay(4, 30.0, 300.0, 2.0), Duration::from_secs(240));
    assert_eq!(backoff_delay(5, 30.0, 300.0, 2.0), Duration::from_secs(300));
    assert_eq!(backoff_delay(20, 30.0, 300.0, 2.0), Duration::from_secs(300));
}

#[test]
fn test_backoff_is_monotonic_until_capped() {
    let mut previous = Duration::ZERO;
    for failures in 1..12 {
        let delay = backoff_delay(failures, 5.0, 600.0, 2.0);
        assert!(delay >= previous, "backoff must never shrink");
        previous = delay;
    }
}

#[test]
fn test_backoff_zero_failures_behaves_like_first() {
    assert_eq!(backoff_delay(0, 30.0, 300.0, 2.0), Duration::from_secs(30));
}

fn config_from_yaml(yaml: &str) -> Arc<Config> {
    Arc::new(serde_yaml::from_str(yaml).expect("valid config yaml"))
}

fn build_poller(config: &Arc<Config>) -> (DevicePoller, Metrics) {
    let metrics = Metrics::new().expect("metrics must build");
    let pool = ShellyClientPool::new(Duration::from_secs(1)).expect("client pool");
    let poller = DevicePoller::new(
        Arc::clone(config),
        pool,
        metrics.clone(),
        Arc::new(DriverRegistry::new()),
    );
    (poller, metrics)
}

#[test]
fn test_reload_diff_adds_and_removes_targets() {
    let initial = config_from_yaml(
        r#"
targets:
  - {name: a, url: 10.0.80.1}
  - {name: b, url: 10.0.80.2}
"#,
    );
    let (poller, metrics) = build_poller(&initial);
    assert_eq!(poller.target_names(), ["a", "b"]);

    // Give target a some live series so removal has something to delete.
    let target_a = initial.targets[0].clone();
    let status = json!({"switch:0": {"output": true, "apower": 3.0}});
    let reading = DeviceReading {
        device_name: "a".to_string(),
        up: true,
        poll_duration_seconds: 0.1,
        channels: Pro4pmGen2Driver.parse_status(
            &status,
            &TargetConfig {
                channels: vec![ChannelConfig::new(ChannelKind::Switch, 0)],
                ..target_a.clone()
            },
        ),
        ..Default::default()
    };
    metrics.apply_reading(&reading, &target_a);
    assert!(metrics.render().expect("render").contains(r#"device="a""#));

    let updated = config_from_yaml(
        r#"
targets:
  - {name: b, url: 10.0.80.2}
  - {name: c, url: 10.0.80.3}
"#,
    );
    poller.apply_config(Arc::clone(&updated));

    assert_eq!(poller.target_names(), ["b", "c"]);
    assert!(
        !metrics.render().expect("render").contains(r#"device="a""#),
        "removed target must lose its series"
    );
}

#[test]
fn test_reload_keeps_unchanged_target() {
    let initial = config_from_yaml("targets:\n  - {name: a, url: 10.0.80.1}");
    let (poller, _metrics) = build_poller(&initial);

    let same = config_from_yaml("targets:\n  - {name: a, url: 10.0.80.1}");
    poller.apply_config(same);
    assert_eq!(poller.target_names(), ["a"]);
}

#[test]
fn test_reload_preserves_discovered_targets() {
    let initial = config_from_yaml("targets:\n  - {name: a, url: 10.0.80.1}");
    let (poller, _metrics) = build_poller(&initial);

    let discovered = TargetConfig {
        name: "shelly_10_0_80_99_spsw".to_string(),
        url: "10.0.80.99".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![ChannelConfig::new(ChannelKind::Switch, 0)],
        discovered: true,
    };
    assert!(poller.add_discovered_target(discovered));

    // A reload that does not mention the discovered target keeps it.
    let updated = config_from_yaml("targets:\n  - {name: a, url: 10.0.80.1}");
    poller.apply_config(updated);
    assert_eq!(poller.target_names(), ["a", "shelly_10_0_80_99_spsw"]);
}

#[test]
fn test_discovery_insertion_is_idempotent_by_address() {
    let initial = config_from_yaml("targets: []");
    let (poller, _metrics) = build_poller(&initial);

    let device = TargetConfig {
        name: "shelly_10_0_80_50_plug".to_string(),
        url: "10.0.80.50".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![ChannelConfig::new(ChannelKind::Switch, 0)],
        discovered: true,
    };

    assert!(poller.add_discovered_target(device.clone()));
    assert!(!poller.add_discovered_target(device.clone()), "same address is a no-op");

    // A different name pointing at the same host is still a duplicate.
    let renamed = TargetConfig {
        name: "other_name".to_string(),
        ..device
    };
    assert!(!poller.add_discovered_target(renamed));

    assert_eq!(poller.target_names().len(), 1);
    assert!(poller.has_target_host("10.0.80.50"));
}

#[test]
fn test_discovery_does_not_shadow_configured_target() {
    let initial = config_from_yaml("targets:\n  - {name: fixed, url: 10.0.80.60}");
    let (poller, _metrics) = build_poller(&initial);

    let duplicate = TargetConfig {
        name: "shelly_10_0_80_60_x".to_string(),
        url: "10.0.80.60".to_string(),
        poll_interval_seconds: None,
        credentials: None,
        channels: vec![],
        discovered: true,
    };
    assert!(!poller.add_discovered_target(duplicate));
    assert_eq!(poller.target_names(), ["fixed"]);
}
