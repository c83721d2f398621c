//! Configuration model and YAML loader.
//!
//! The configuration is a single YAML file validated into an immutable
//! snapshot. Hot-reload builds a fresh snapshot from disk; an invalid file
//! is rejected and the caller keeps the previous snapshot.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// How many consecutive poll failures invalidate a cached driver binding.
pub const DRIVER_CACHE_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    DEBUG,
    INFO,
    WARNING,
    ERROR,
}

impl LogLevel {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::DEBUG => "debug",
            LogLevel::INFO => "info",
            LogLevel::WARNING => "warn",
            LogLevel::ERROR => "error",
        }
    }
}

/// HTTP Basic credentials for a device. The password never appears in
/// `Debug` output.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<SecretString>,
}

impl Credentials {
    pub fn password_str(&self) -> &str {
        self.password.as_ref().map(|p| p.expose_secret()).unwrap_or("")
    }

    /// Basic auth is applied only when either half is non-empty.
    pub fn is_set(&self) -> bool {
        !self.username.is_empty() || !self.password_str().is_empty()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.password_str() == other.password_str()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Switch,
    Light,
}

impl Default for ChannelKind {
    fn default() -> Self {
        ChannelKind::Switch
    }
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Switch => "switch",
            ChannelKind::Light => "light",
        }
    }

    /// Key prefix in `Shelly.GetStatus` payloads (`switch:0`, `light:0`).
    pub fn status_key(&self, index: u16) -> String {
        format!("{}:{}", self.as_str(), index)
    }
}

/// One configured channel slot on a target, with its metric suppression
/// mask.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChannelConfig {
    #[serde(rename = "type", default = "default_channel_kind")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub index: u16,
    #[serde(default)]
    pub ignore_voltage: bool,
    #[serde(default)]
    pub ignore_current: bool,
    #[serde(default)]
    pub ignore_active_power: bool,
    #[serde(default)]
    pub ignore_power_factor: bool,
    #[serde(default)]
    pub ignore_frequency: bool,
    #[serde(default)]
    pub ignore_total_active_energy: bool,
    #[serde(default)]
    pub ignore_total_returned_active_energy: bool,
    #[serde(default)]
    pub ignore_temperature: bool,
    #[serde(default)]
    pub ignore_output: bool,
    #[serde(default)]
    pub ignore_brightness: bool,
}

impl ChannelConfig {
    pub fn new(kind: ChannelKind, index: u16) -> Self {
        Self {
            kind,
            index,
            ignore_voltage: false,
            ignore_current: false,
            ignore_active_power: false,
            ignore_power_factor: false,
            ignore_frequency: false,
            ignore_total_active_energy: false,
            ignore_total_returned_active_energy: false,
            ignore_temperature: false,
            ignore_output: false,
            ignore_brightness: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(ChannelKind::Switch, 0)
    }
}

fn default_channel_kind() -> ChannelKind {
    ChannelKind::Switch
}

/// Legacy `target_meters` entry: either a bare switch index or a full
/// channel map.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum MeterSpec {
    Index(u16),
    Channel(ChannelConfig),
}

#[derive(Debug, Deserialize, Clone)]
struct RawTarget {
    name: String,
    url: String,
    #[serde(default)]
    poll_interval_seconds: Option<u64>,
    #[serde(default)]
    credentials: Option<Credentials>,
    #[serde(default)]
    channels: Vec<ChannelConfig>,
    #[serde(default)]
    target_meters: Option<Vec<MeterSpec>>,
    #[serde(default)]
    discovered: bool,
}

/// A single polling target. Immutable once loaded; reload replaces whole
/// targets rather than mutating them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(from = "RawTarget")]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    pub poll_interval_seconds: Option<u64>,
    pub credentials: Option<Credentials>,
    pub channels: Vec<ChannelConfig>,
    pub discovered: bool,
}

impl From<RawTarget> for TargetConfig {
    fn from(raw: RawTarget) -> Self {
        let mut channels = raw.channels;
        if let Some(meters) = raw.target_meters {
            warn!(
                target_name = %raw.name,
                "'target_meters' is deprecated, use 'channels' with type 'switch'"
            );
            for meter in meters {
                channels.push(match meter {
                    MeterSpec::Index(index) => ChannelConfig::new(ChannelKind::Switch, index),
                    MeterSpec::Channel(ch) => ch,
                });
            }
        }
        Self {
            name: raw.name,
            url: raw.url,
            poll_interval_seconds: raw.poll_interval_seconds,
            credentials: raw.credentials,
            channels,
            discovered: raw.discovered,
        }
    }
}

impl TargetConfig {
    /// Bare host address: scheme and trailing slash stripped. This is the
    /// identity used for discovery dedup and reload diffing.
    pub fn host(&self) -> &str {
        self.url
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
    }

    /// Channel config matching kind and index, if configured.
    pub fn channel(&self, kind: ChannelKind, index: u16) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.kind == kind && c.index == index)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
    #[serde(default)]
    pub network_ranges: Vec<String>,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_seconds: f64,
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    #[serde(default = "default_true")]
    pub auto_add_discovered: bool,
    #[serde(default)]
    pub auto_add_credentials: Option<Credentials>,
    #[serde(default)]
    pub exclude_ips: Vec<String>,
    #[serde(default = "default_name_template")]
    pub name_template: String,
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval_seconds: default_scan_interval(),
            network_ranges: Vec::new(),
            scan_timeout_seconds: default_scan_timeout(),
            scan_concurrency: default_scan_concurrency(),
            auto_add_discovered: true,
            auto_add_credentials: None,
            exclude_ips: Vec::new(),
            name_template: default_name_template(),
            persist_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_device_info_refresh")]
    pub device_info_refresh_seconds: u64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub default_credentials: Credentials,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_log_level() -> LogLevel {
    LogLevel::INFO
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    10037
}

fn default_poll_interval() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    3
}

fn default_max_concurrency() -> usize {
    50
}

fn default_device_info_refresh() -> u64 {
    21600
}

fn default_backoff_base() -> f64 {
    30.0
}

fn default_backoff_max() -> f64 {
    300.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_scan_interval() -> u64 {
    3600
}

fn default_scan_timeout() -> f64 {
    2.0
}

fn default_scan_concurrency() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_name_template() -> String {
    "shelly_{ip}_{model}".to_string()
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl Config {
    /// Load and validate a snapshot from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&text)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file path: `--config` flag, then `CONFIG_PATH`
    /// env var, then `/config/config.yml`.
    pub fn resolve_path(cli_path: Option<PathBuf>) -> PathBuf {
        cli_path
            .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/config/config.yml"))
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("listen_port must be 1-65535".into()));
        }
        if self.poll_interval_seconds < 1 {
            return Err(ConfigError::Invalid(
                "poll_interval_seconds must be >= 1".into(),
            ));
        }
        if self.max_concurrency < 1 {
            return Err(ConfigError::Invalid("max_concurrency must be >= 1".into()));
        }
        if self.backoff_base_seconds <= 0.0 || self.backoff_max_seconds <= 0.0 {
            return Err(ConfigError::Invalid(
                "backoff_base_seconds and backoff_max_seconds must be positive".into(),
            ));
        }
        if self.discovery.enabled && self.discovery.scan_concurrency < 1 {
            return Err(ConfigError::Invalid(
                "discovery.scan_concurrency must be >= 1".into(),
            ));
        }

        let mut names = HashSet::new();
        for target in &mut self.targets {
            if target.name.is_empty() {
                return Err(ConfigError::Invalid("target name must not be empty".into()));
            }
            if !names.insert(target.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if let Some(interval) = target.poll_interval_seconds {
                if interval < 1 {
                    return Err(ConfigError::Invalid(format!(
                        "target '{}': poll_interval_seconds must be >= 1",
                        target.name
                    )));
                }
            }
            normalize_channel_indices(target);
        }
        Ok(())
    }

    /// Effective credentials for a target: target, then defaults, then none.
    pub fn target_credentials(&self, target: &TargetConfig) -> Option<Credentials> {
        if let Some(creds) = &target.credentials {
            if creds.is_set() {
                return Some(creds.clone());
            }
        }
        if self.default_credentials.is_set() {
            return Some(self.default_credentials.clone());
        }
        None
    }

    /// Effective poll interval for a target.
    pub fn target_poll_interval(&self, target: &TargetConfig) -> u64 {
        target.poll_interval_seconds.unwrap_or(self.poll_interval_seconds)
    }

    /// Credentials applied to auto-added discovered devices:
    /// auto_add_credentials, then defaults, then none.
    pub fn discovery_credentials(&self) -> Option<Credentials> {
        if let Some(creds) = &self.discovery.auto_add_credentials {
            if creds.is_set() {
                return Some(creds.clone());
            }
        }
        if self.default_credentials.is_set() {
            return Some(self.default_credentials.clone());
        }
        None
    }
}

/// Detect 1-based channel lists and remap them to 0-based.
///
/// Triggered when an index equals the channel count while no channel uses
/// index 0 (e.g. four switches numbered 1-4).
fn normalize_channel_indices(target: &mut TargetConfig) {
    let count = target.channels.len() as u16;
    if count == 0 {
        return;
    }
    let has_zero = target.channels.iter().any(|c| c.index == 0);
    let hits_count = target.channels.iter().any(|c| c.index == count);
    if !has_zero && hits_count {
        warn!(
            target_name = %target.name,
            "channel indices look 1-based, remapping to 0-based"
        );
        for channel in &mut target.channels {
            channel.index -= 1;
        }
    }
}
