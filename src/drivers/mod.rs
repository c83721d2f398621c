//! Device drivers: model identification and payload translation.
//!
//! A driver declares which devices it supports (by scoring a
//! [`DeviceInfo`]) and translates that family's `Shelly.GetStatus` payload
//! into normalized channel readings. System, WiFi, cloud/MQTT and input
//! subtrees share a layout across generations and are parsed by the helpers
//! here rather than per driver.
//!
//! Parsing is total: any JSON object is accepted, and a missing or null
//! field simply yields `None` in the reading.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ChannelKind, TargetConfig};
use crate::shelly::DeviceInfo;

pub mod dimmer_0110vpm_g3;
pub mod plugus_gen2;
pub mod pro4pm_gen2;
pub mod registry;
pub mod s1pm_gen4;

pub use registry::DriverRegistry;

/// Normalized telemetry for one channel. `None` means the device did not
/// report the field, which is distinct from a zero reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelReading {
    pub kind: ChannelKind,
    pub index: u16,
    /// 1.0 on, 0.0 off.
    pub output: Option<f64>,
    pub apower_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub freq_hz: Option<f64>,
    pub current_a: Option<f64>,
    pub pf: Option<f64>,
    pub temp_c: Option<f64>,
    pub aenergy_wh: Option<f64>,
    pub ret_aenergy_wh: Option<f64>,
    /// 0-100, lights only.
    pub brightness: Option<f64>,
}

/// State of a physical input (button or detached switch).
#[derive(Debug, Clone, PartialEq)]
pub struct InputReading {
    pub index: u16,
    /// 1.0 pressed/on, 0.0 off.
    pub state: Option<f64>,
}

/// Device-level telemetry from the `sys` subtree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemReading {
    pub uptime_seconds: Option<f64>,
    pub ram_size_bytes: Option<f64>,
    pub ram_free_bytes: Option<f64>,
    pub ram_min_free_bytes: Option<f64>,
    pub fs_size_bytes: Option<f64>,
    pub fs_free_bytes: Option<f64>,
    pub restart_required: Option<f64>,
    pub cfg_rev: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WifiReading {
    pub rssi_dbm: Option<f64>,
    pub connected: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionReading {
    pub cloud_connected: Option<f64>,
    pub mqtt_connected: Option<f64>,
}

/// Everything one poll produced for a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceReading {
    pub device_name: String,
    pub up: bool,
    pub poll_duration_seconds: f64,
    pub error_message: Option<String>,
    pub channels: Vec<ChannelReading>,
    pub inputs: Vec<InputReading>,
    pub system: Option<SystemReading>,
    pub wifi: Option<WifiReading>,
    pub connection: Option<ConnectionReading>,
}

impl DeviceReading {
    /// A failed poll: `up=0`, no telemetry, last good gauges untouched.
    pub fn failure(device_name: &str, duration_seconds: f64, error: String) -> Self {
        Self {
            device_name: device_name.to_string(),
            up: false,
            poll_duration_seconds: duration_seconds,
            error_message: Some(error),
            ..Default::default()
        }
    }
}

/// Interface every device family implements.
pub trait DeviceDriver: Send + Sync {
    /// Stable identifier, e.g. `pro4pm_gen2`.
    fn id(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Match strength against a device, 0 = unsupported. The registry picks
    /// the maximum positive score.
    fn score(&self, info: &DeviceInfo) -> u32;

    /// Channel kinds and indices this device exposes.
    fn supported_channels(&self, info: &DeviceInfo) -> BTreeMap<ChannelKind, BTreeSet<u16>>;

    /// Translate a status payload into readings for the target's configured
    /// channels.
    fn parse_status(&self, status: &Value, target: &TargetConfig) -> Vec<ChannelReading>;
}

/// Walk the target's configured channels of one kind against the driver's
/// supported index set. Wrong-kind and out-of-range channels are dropped
/// with a warning; channels missing from the payload are skipped.
pub(crate) fn collect_channel_readings(
    status: &Value,
    target: &TargetConfig,
    kind: ChannelKind,
    supported: &BTreeSet<u16>,
    driver_name: &str,
) -> Vec<ChannelReading> {
    let mut readings = Vec::new();

    for channel in &target.channels {
        if channel.kind != kind {
            warn!(
                target_name = %target.name,
                "{driver_name} only supports {} channels, ignoring {}:{}",
                kind.as_str(),
                channel.kind.as_str(),
                channel.index
            );
            continue;
        }
        if !supported.contains(&channel.index) {
            warn!(
                target_name = %target.name,
                "channel index {} out of range for {driver_name}, skipping",
                channel.index
            );
            continue;
        }

        let key = kind.status_key(channel.index);
        let data = &status[key.as_str()];
        if !data.is_object() {
            debug!(target_name = %target.name, "no data for {key}");
            continue;
        }

        readings.push(match kind {
            ChannelKind::Switch => parse_switch_channel(data, channel.index),
            ChannelKind::Light => parse_light_channel(data, channel.index),
        });
    }

    readings
}

/// A numeric field, tolerating absence, null and non-numeric junk.
fn opt_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn field_f64(data: &Value, key: &str) -> Option<f64> {
    opt_f64(&data[key])
}

/// Optional nested path like `aenergy.total` or `temperature.tC`:
/// absent on any missing or null link.
fn nested_f64(data: &Value, key: &str, subkey: &str) -> Option<f64> {
    opt_f64(&data[key][subkey])
}

/// Booleans become 1.0 / 0.0 gauge values.
fn field_bool(data: &Value, key: &str) -> Option<f64> {
    data[key].as_bool().map(|b| if b { 1.0 } else { 0.0 })
}

pub(crate) fn parse_switch_channel(data: &Value, index: u16) -> ChannelReading {
    ChannelReading {
        kind: ChannelKind::Switch,
        index,
        output: field_bool(data, "output"),
        apower_w: field_f64(data, "apower"),
        voltage_v: field_f64(data, "voltage"),
        freq_hz: field_f64(data, "freq"),
        current_a: field_f64(data, "current"),
        pf: field_f64(data, "pf"),
        temp_c: nested_f64(data, "temperature", "tC"),
        aenergy_wh: nested_f64(data, "aenergy", "total"),
        ret_aenergy_wh: nested_f64(data, "ret_aenergy", "total"),
        brightness: None,
    }
}

pub(crate) fn parse_light_channel(data: &Value, index: u16) -> ChannelReading {
    ChannelReading {
        kind: ChannelKind::Light,
        index,
        output: field_bool(data, "output"),
        brightness: field_f64(data, "brightness"),
        apower_w: field_f64(data, "apower"),
        voltage_v: field_f64(data, "voltage"),
        freq_hz: field_f64(data, "freq"),
        current_a: field_f64(data, "current"),
        pf: field_f64(data, "pf"),
        temp_c: nested_f64(data, "temperature", "tC"),
        aenergy_wh: nested_f64(data, "aenergy", "total"),
        ret_aenergy_wh: None,
    }
}

/// The `sys` subtree, shared across all Gen2+ devices.
pub fn parse_system(status: &Value) -> Option<SystemReading> {
    let sys = &status["sys"];
    if !sys.is_object() {
        return None;
    }
    Some(SystemReading {
        uptime_seconds: field_f64(sys, "uptime"),
        ram_size_bytes: field_f64(sys, "ram_size"),
        ram_free_bytes: field_f64(sys, "ram_free"),
        ram_min_free_bytes: field_f64(sys, "ram_min_free"),
        fs_size_bytes: field_f64(sys, "fs_size"),
        fs_free_bytes: field_f64(sys, "fs_free"),
        restart_required: field_bool(sys, "restart_required"),
        cfg_rev: field_f64(sys, "cfg_rev"),
    })
}

/// The `wifi` subtree. A station IP or `"got ip"` status counts as
/// connected.
pub fn parse_wifi(status: &Value) -> Option<WifiReading> {
    let wifi = &status["wifi"];
    if !wifi.is_object() {
        return None;
    }
    let has_ip = wifi["sta_ip"].as_str().map(|s| !s.is_empty()).unwrap_or(false);
    let got_ip = wifi["status"].as_str() == Some("got ip");
    Some(WifiReading {
        rssi_dbm: field_f64(wifi, "rssi"),
        connected: Some(if has_ip || got_ip { 1.0 } else { 0.0 }),
    })
}

/// Cloud and MQTT link status.
pub fn parse_connection(status: &Value) -> Option<ConnectionReading> {
    let cloud = field_bool(&status["cloud"], "connected");
    let mqtt = field_bool(&status["mqtt"], "connected");
    if cloud.is_none() && mqtt.is_none() {
        return None;
    }
    Some(ConnectionReading {
        cloud_connected: cloud,
        mqtt_connected: mqtt,
    })
}

/// All `input:N` subtrees present in the payload, sorted by index.
pub fn parse_inputs(status: &Value) -> Vec<InputReading> {
    let mut inputs = Vec::new();
    if let Some(map) = status.as_object() {
        for (key, value) in map {
            let Some(index_str) = key.strip_prefix("input:") else {
                continue;
            };
            let Ok(index) = index_str.parse::<u16>() else {
                continue;
            };
            if !value.is_object() {
                continue;
            }
            inputs.push(InputReading {
                index,
                state: field_bool(value, "state"),
            });
        }
    }
    inputs.sort_by_key(|input| input.index);
    inputs
}
