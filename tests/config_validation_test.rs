//! Configuration loading and validation.

use std::io::Write;

use shelly_exporter::config::{ChannelKind, Config, LogLevel};

fn load(yaml: &str) -> Result<Config, shelly_exporter::error::ConfigError> {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write config");
    Config::load(file.path())
}

#[test]
fn test_defaults() {
    let config = load("targets: []").expect("minimal config must load");

    assert_eq!(config.log_level, LogLevel::INFO);
    assert_eq!(config.listen_host, "0.0.0.0");
    assert_eq!(config.listen_port, 10037);
    assert_eq!(config.poll_interval_seconds, 10);
    assert_eq!(config.request_timeout_seconds, 3);
    assert_eq!(config.max_concurrency, 50);
    assert_eq!(config.device_info_refresh_seconds, 21600);
    assert_eq!(config.backoff_base_seconds, 30.0);
    assert_eq!(config.backoff_max_seconds, 300.0);
    assert!(!config.discovery.enabled);
    assert_eq!(config.discovery.scan_interval_seconds, 3600);
    assert_eq!(config.discovery.scan_concurrency, 20);
    assert_eq!(config.discovery.name_template, "shelly_{ip}_{model}");
}

#[test]
fn test_full_target() {
    let config = load(
        r#"
log_level: DEBUG
targets:
  - name: workshop
    url: 10.0.80.22
    poll_interval_seconds: 5
    channels:
      - type: switch
        index: 0
        ignore_power_factor: true
      - type: switch
        index: 1
"#,
    )
    .expect("config must load");

    assert_eq!(config.log_level, LogLevel::DEBUG);
    let target = &config.targets[0];
    assert_eq!(target.name, "workshop");
    assert_eq!(target.host(), "10.0.80.22");
    assert_eq!(config.target_poll_interval(target), 5);
    assert_eq!(target.channels.len(), 2);
    assert!(target.channels[0].ignore_power_factor);
    assert!(!target.channels[1].ignore_power_factor);
}

#[test]
fn test_legacy_target_meters() {
    // target_meters is sugar for switch channels, bare ints or maps.
    let config = load(
        r#"
targets:
  - name: legacy
    url: 10.0.80.23
    target_meters: [0, 1, 2]
"#,
    )
    .expect("legacy config must load");

    let target = &config.targets[0];
    assert_eq!(target.channels.len(), 3);
    for (i, channel) in target.channels.iter().enumerate() {
        assert_eq!(channel.kind, ChannelKind::Switch);
        assert_eq!(channel.index as usize, i);
    }
}

#[test]
fn test_one_based_indices_are_remapped() {
    let config = load(
        r#"
targets:
  - name: onebased
    url: 10.0.80.24
    channels:
      - {type: switch, index: 1}
      - {type: switch, index: 2}
      - {type: switch, index: 3}
      - {type: switch, index: 4}
"#,
    )
    .expect("config must load");

    let indices: Vec<u16> = config.targets[0].channels.iter().map(|c| c.index).collect();
    assert_eq!(indices, [0, 1, 2, 3]);
}

#[test]
fn test_zero_based_indices_untouched() {
    let config = load(
        r#"
targets:
  - name: zerobased
    url: 10.0.80.25
    channels:
      - {type: switch, index: 0}
      - {type: switch, index: 3}
"#,
    )
    .expect("config must load");

    let indices: Vec<u16> = config.targets[0].channels.iter().map(|c| c.index).collect();
    assert_eq!(indices, [0, 3]);
}

#[test]
fn test_duplicate_target_names_rejected() {
    let result = load(
        r#"
targets:
  - {name: same, url: 10.0.80.1}
  - {name: same, url: 10.0.80.2}
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_invalid_values_rejected() {
    assert!(load("listen_port: 0").is_err());
    assert!(load("poll_interval_seconds: 0").is_err());
    assert!(load("max_concurrency: 0").is_err());
    assert!(load("log_level: LOUD").is_err());
    assert!(load("targets:\n  - {name: t, url: u, poll_interval_seconds: 0}").is_err());
}

#[test]
fn test_missing_file_is_an_error() {
    let result = Config::load(std::path::Path::new("/nonexistent/config.yml"));
    assert!(result.is_err());
}

#[test]
fn test_credential_resolution_precedence() {
    let config = load(
        r#"
default_credentials:
  username: admin
  password: defaultpw
targets:
  - name: own-creds
    url: 10.0.80.1
    credentials:
      username: special
      password: specialpw
  - name: default-creds
    url: 10.0.80.2
"#,
    )
    .expect("config must load");

    let own = config.target_credentials(&config.targets[0]).expect("creds");
    assert_eq!(own.username, "special");
    assert_eq!(own.password_str(), "specialpw");

    let fallback = config.target_credentials(&config.targets[1]).expect("creds");
    assert_eq!(fallback.username, "admin");
}

#[test]
fn test_no_credentials_when_nothing_set() {
    let config = load("targets:\n  - {name: open, url: 10.0.80.3}").expect("config");
    assert!(config.target_credentials(&config.targets[0]).is_none());
}

#[test]
fn test_discovery_credential_precedence() {
    let config = load(
        r#"
default_credentials:
  username: admin
  password: pw
discovery:
  enabled: true
  network_ranges: ["10.0.80.0/24"]
  auto_add_credentials:
    username: scanner
    password: scannerpw
"#,
    )
    .expect("config");

    let creds = config.discovery_credentials().expect("creds");
    assert_eq!(creds.username, "scanner");
}

#[test]
fn test_url_scheme_is_normalized_for_identity() {
    let config = load("targets:\n  - {name: t, url: \"http://10.0.80.9/\"}").expect("config");
    assert_eq!(config.targets[0].host(), "10.0.80.9");
}
