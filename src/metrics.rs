//! Prometheus metric definitions and update logic.
//!
//! A facade over a `prometheus::Registry` that creates every exported
//! metric up front and offers batch update entry points to the poller,
//! the scanner and the config watcher.
//!
//! # Missing fields
//!
//! A configured channel that is present in the payload but lacks a field
//! gets that gauge set to NaN. This is uniform across switch and light
//! channels; ignore flags suppress the write entirely.
//!
//! # Series lifecycle
//!
//! Label tuples include the device name, and per-target polls are strictly
//! sequential, so no label tuple is ever written concurrently. When a
//! target is removed its series are deleted from every affected metric;
//! input indices are only known at runtime, so the facade tracks the ones
//! it has seen per device.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use crate::config::{ChannelConfig, ChannelKind, TargetConfig};
use crate::drivers::{
    ChannelReading, ConnectionReading, DeviceReading, InputReading, SystemReading, WifiReading,
};

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Per-device
    pub up: GaugeVec,
    pub last_poll_timestamp: GaugeVec,
    pub poll_duration: GaugeVec,
    pub poll_errors: CounterVec,

    // System
    pub sys_uptime: GaugeVec,
    pub sys_ram_size: GaugeVec,
    pub sys_ram_free: GaugeVec,
    pub sys_ram_min_free: GaugeVec,
    pub sys_fs_size: GaugeVec,
    pub sys_fs_free: GaugeVec,
    pub sys_restart_required: GaugeVec,
    pub sys_cfg_rev: GaugeVec,

    // WiFi + connections
    pub wifi_rssi: GaugeVec,
    pub wifi_connected: GaugeVec,
    pub cloud_connected: GaugeVec,
    pub mqtt_connected: GaugeVec,

    // Inputs
    pub input_state: GaugeVec,

    // Switch channels (device, meter)
    pub switch_output: GaugeVec,
    pub switch_apower: GaugeVec,
    pub switch_voltage: GaugeVec,
    pub switch_frequency: GaugeVec,
    pub switch_current: GaugeVec,
    pub switch_power_factor: GaugeVec,
    pub switch_temperature: GaugeVec,
    pub switch_aenergy: GaugeVec,
    pub switch_ret_aenergy: GaugeVec,

    // Light channels (device, channel)
    pub light_output: GaugeVec,
    pub light_brightness: GaugeVec,
    pub light_apower: GaugeVec,
    pub light_aenergy: GaugeVec,
    pub light_voltage: GaugeVec,
    pub light_current: GaugeVec,
    pub light_temperature: GaugeVec,

    // Discovery
    pub discovery_scans: Counter,
    pub discovery_devices_found: Counter,
    pub discovery_scan_duration: Gauge,
    pub discovery_last_scan_timestamp: Gauge,
    pub discovery_scan_errors: Counter,
    pub discovered_device_info: GaugeVec,

    // Config reload
    pub config_reloads: Counter,
    pub config_reload_errors: Counter,
    pub config_last_reload_timestamp: Gauge,
    pub config_last_reload_status: Gauge,

    input_indices: std::sync::Arc<Mutex<HashMap<String, BTreeSet<u16>>>>,
}

fn device_gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help).namespace("shelly"), &["device"])
}

fn meter_gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help).namespace("shelly"), &["device", "meter"])
}

fn channel_gauge(name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    GaugeVec::new(Opts::new(name, help).namespace("shelly"), &["device", "channel"])
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let up = device_gauge("up", "Whether the Shelly device is up (1) or down (0)")?;
        let last_poll_timestamp = device_gauge(
            "last_poll_timestamp_seconds",
            "Unix timestamp of last successful poll",
        )?;
        let poll_duration =
            device_gauge("poll_duration_seconds", "Duration of last poll in seconds")?;
        let poll_errors = CounterVec::new(
            Opts::new("poll_errors_total", "Total number of poll errors").namespace("shelly"),
            &["device"],
        )?;

        let sys_uptime = device_gauge("sys_uptime_seconds", "Device uptime in seconds")?;
        let sys_ram_size = device_gauge("sys_ram_size_bytes", "Total RAM size in bytes")?;
        let sys_ram_free = device_gauge("sys_ram_free_bytes", "Free RAM in bytes")?;
        let sys_ram_min_free = device_gauge(
            "sys_ram_min_free_bytes",
            "Minimum free RAM since boot in bytes",
        )?;
        let sys_fs_size = device_gauge("sys_fs_size_bytes", "Total filesystem size in bytes")?;
        let sys_fs_free = device_gauge("sys_fs_free_bytes", "Free filesystem space in bytes")?;
        let sys_restart_required = device_gauge(
            "sys_restart_required",
            "Whether a restart is required (1=yes, 0=no)",
        )?;
        let sys_cfg_rev = device_gauge("sys_cfg_rev", "Configuration revision number")?;

        let wifi_rssi = device_gauge("wifi_rssi_dbm", "WiFi signal strength in dBm")?;
        let wifi_connected = device_gauge(
            "wifi_connected",
            "WiFi connection status (1=connected, 0=disconnected)",
        )?;
        let cloud_connected = device_gauge(
            "cloud_connected",
            "Cloud connection status (1=connected, 0=disconnected)",
        )?;
        let mqtt_connected = device_gauge(
            "mqtt_connected",
            "MQTT connection status (1=connected, 0=disconnected)",
        )?;

        let input_state = GaugeVec::new(
            Opts::new("input_state", "Input channel state (1=on/pressed, 0=off)")
                .namespace("shelly"),
            &["device", "input"],
        )?;

        let switch_output = meter_gauge("switch_output", "Switch output state (1=on, 0=off)")?;
        let switch_apower = meter_gauge("switch_apower_watts", "Active power in watts")?;
        let switch_voltage = meter_gauge("switch_voltage_volts", "Voltage in volts")?;
        let switch_frequency = meter_gauge("switch_frequency_hz", "Frequency in Hz")?;
        let switch_current = meter_gauge("switch_current_amps", "Current in amps")?;
        let switch_power_factor = meter_gauge("switch_power_factor", "Power factor (0-1)")?;
        let switch_temperature = meter_gauge("switch_temperature_c", "Temperature in Celsius")?;
        let switch_aenergy = meter_gauge("switch_aenergy_wh_total", "Total active energy in Wh")?;
        let switch_ret_aenergy = meter_gauge(
            "switch_ret_aenergy_wh_total",
            "Total returned active energy in Wh",
        )?;

        let light_output = channel_gauge("light_output", "Light output state (1=on, 0=off)")?;
        let light_brightness = channel_gauge(
            "light_brightness_percent",
            "Light brightness percentage (0-100)",
        )?;
        let light_apower = channel_gauge("light_apower_watts", "Light active power in watts")?;
        let light_aenergy = channel_gauge(
            "light_aenergy_wh_total",
            "Light total active energy in Wh",
        )?;
        let light_voltage = channel_gauge("light_voltage_volts", "Light voltage in volts")?;
        let light_current = channel_gauge("light_current_amps", "Light current in amps")?;
        let light_temperature = channel_gauge("light_temperature_c", "Light temperature in Celsius")?;

        let discovery_scans = Counter::with_opts(
            Opts::new("discovery_scans_total", "Total number of network scans performed")
                .namespace("shelly"),
        )?;
        let discovery_devices_found = Counter::with_opts(
            Opts::new(
                "discovery_devices_found_total",
                "Total devices discovered across all scans",
            )
            .namespace("shelly"),
        )?;
        let discovery_scan_duration = Gauge::with_opts(
            Opts::new(
                "discovery_scan_duration_seconds",
                "Duration of last scan in seconds",
            )
            .namespace("shelly"),
        )?;
        let discovery_last_scan_timestamp = Gauge::with_opts(
            Opts::new(
                "discovery_last_scan_timestamp_seconds",
                "Unix timestamp of last scan",
            )
            .namespace("shelly"),
        )?;
        let discovery_scan_errors = Counter::with_opts(
            Opts::new("discovery_scan_errors_total", "Total scan errors").namespace("shelly"),
        )?;
        let discovered_device_info = GaugeVec::new(
            Opts::new(
                "discovered_device_info",
                "Info about discovered devices (value=1)",
            )
            .namespace("shelly"),
            &["ip", "model", "gen", "app", "mac", "discovered_at"],
        )?;

        let config_reloads = Counter::with_opts(
            Opts::new(
                "config_reloads_total",
                "Total number of successful config reloads",
            )
            .namespace("shelly"),
        )?;
        let config_reload_errors = Counter::with_opts(
            Opts::new(
                "config_reload_errors_total",
                "Total number of failed config reload attempts",
            )
            .namespace("shelly"),
        )?;
        let config_last_reload_timestamp = Gauge::with_opts(
            Opts::new(
                "config_last_reload_timestamp_seconds",
                "Unix timestamp of last successful config reload",
            )
            .namespace("shelly"),
        )?;
        let config_last_reload_status = Gauge::with_opts(
            Opts::new(
                "config_last_reload_status",
                "Status of last reload attempt (1=success, 0=failure)",
            )
            .namespace("shelly"),
        )?;

        let metrics = Self {
            registry,
            up,
            last_poll_timestamp,
            poll_duration,
            poll_errors,
            sys_uptime,
            sys_ram_size,
            sys_ram_free,
            sys_ram_min_free,
            sys_fs_size,
            sys_fs_free,
            sys_restart_required,
            sys_cfg_rev,
            wifi_rssi,
            wifi_connected,
            cloud_connected,
            mqtt_connected,
            input_state,
            switch_output,
            switch_apower,
            switch_voltage,
            switch_frequency,
            switch_current,
            switch_power_factor,
            switch_temperature,
            switch_aenergy,
            switch_ret_aenergy,
            light_output,
            light_brightness,
            light_apower,
            light_aenergy,
            light_voltage,
            light_current,
            light_temperature,
            discovery_scans,
            discovery_devices_found,
            discovery_scan_duration,
            discovery_last_scan_timestamp,
            discovery_scan_errors,
            discovered_device_info,
            config_reloads,
            config_reload_errors,
            config_last_reload_timestamp,
            config_last_reload_status,
            input_indices: std::sync::Arc::new(Mutex::new(HashMap::new())),
        };
        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> prometheus::Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.up.clone()))?;
        r.register(Box::new(self.last_poll_timestamp.clone()))?;
        r.register(Box::new(self.poll_duration.clone()))?;
        r.register(Box::new(self.poll_errors.clone()))?;
        r.register(Box::new(self.sys_uptime.clone()))?;
        r.register(Box::new(self.sys_ram_size.clone()))?;
        r.register(Box::new(self.sys_ram_free.clone()))?;
        r.register(Box::new(self.sys_ram_min_free.clone()))?;
        r.register(Box::new(self.sys_fs_size.clone()))?;
        r.register(Box::new(self.sys_fs_free.clone()))?;
        r.register(Box::new(self.sys_restart_required.clone()))?;
        r.register(Box::new(self.sys_cfg_rev.clone()))?;
        r.register(Box::new(self.wifi_rssi.clone()))?;
        r.register(Box::new(self.wifi_connected.clone()))?;
        r.register(Box::new(self.cloud_connected.clone()))?;
        r.register(Box::new(self.mqtt_connected.clone()))?;
        r.register(Box::new(self.input_state.clone()))?;
        r.register(Box::new(self.switch_output.clone()))?;
        r.register(Box::new(self.switch_apower.clone()))?;
        r.register(Box::new(self.switch_voltage.clone()))?;
        r.register(Box::new(self.switch_frequency.clone()))?;
        r.register(Box::new(self.switch_current.clone()))?;
        r.register(Box::new(self.switch_power_factor.clone()))?;
        r.register(Box::new(self.switch_temperature.clone()))?;
        r.register(Box::new(self.switch_aenergy.clone()))?;
        r.register(Box::new(self.switch_ret_aenergy.clone()))?;
        r.register(Box::new(self.light_output.clone()))?;
        r.register(Box::new(self.light_brightness.clone()))?;
        r.register(Box::new(self.light_apower.clone()))?;
        r.register(Box::new(self.light_aenergy.clone()))?;
        r.register(Box::new(self.light_voltage.clone()))?;
        r.register(Box::new(self.light_current.clone()))?;
        r.register(Box::new(self.light_temperature.clone()))?;
        r.register(Box::new(self.discovery_scans.clone()))?;
        r.register(Box::new(self.discovery_devices_found.clone()))?;
        r.register(Box::new(self.discovery_scan_duration.clone()))?;
        r.register(Box::new(self.discovery_last_scan_timestamp.clone()))?;
        r.register(Box::new(self.discovery_scan_errors.clone()))?;
        r.register(Box::new(self.discovered_device_info.clone()))?;
        r.register(Box::new(self.config_reloads.clone()))?;
        r.register(Box::new(self.config_reload_errors.clone()))?;
        r.register(Box::new(self.config_last_reload_timestamp.clone()))?;
        r.register(Box::new(self.config_last_reload_status.clone()))?;
        Ok(())
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Apply one poll's worth of updates as a batch.
    pub fn apply_reading(&self, reading: &DeviceReading, target: &TargetConfig) {
        let device = reading.device_name.as_str();

        self.up
            .with_label_values(&[device])
            .set(if reading.up { 1.0 } else { 0.0 });
        self.poll_duration
            .with_label_values(&[device])
            .set(reading.poll_duration_seconds);

        if reading.up {
            self.last_poll_timestamp
                .with_label_values(&[device])
                .set(unix_now());
        } else if reading.error_message.is_some() {
            self.poll_errors.with_label_values(&[device]).inc();
        }

        if let Some(system) = &reading.system {
            self.update_system(device, system);
        }
        if let Some(wifi) = &reading.wifi {
            self.update_wifi(device, wifi);
        }
        if let Some(connection) = &reading.connection {
            self.update_connection(device, connection);
        }
        if !reading.inputs.is_empty() {
            self.update_inputs(device, &reading.inputs);
        }
        for channel in &reading.channels {
            let config = target.channel(channel.kind, channel.index);
            self.update_channel(device, channel, config);
        }
    }

    fn update_system(&self, device: &str, system: &SystemReading) {
        set_opt(&self.sys_uptime, device, system.uptime_seconds);
        set_opt(&self.sys_ram_size, device, system.ram_size_bytes);
        set_opt(&self.sys_ram_free, device, system.ram_free_bytes);
        set_opt(&self.sys_ram_min_free, device, system.ram_min_free_bytes);
        set_opt(&self.sys_fs_size, device, system.fs_size_bytes);
        set_opt(&self.sys_fs_free, device, system.fs_free_bytes);
        set_opt(&self.sys_restart_required, device, system.restart_required);
        set_opt(&self.sys_cfg_rev, device, system.cfg_rev);
    }

    fn update_wifi(&self, device: &str, wifi: &WifiReading) {
        set_opt(&self.wifi_rssi, device, wifi.rssi_dbm);
        set_opt(&self.wifi_connected, device, wifi.connected);
    }

    fn update_connection(&self, device: &str, connection: &ConnectionReading) {
        set_opt(&self.cloud_connected, device, connection.cloud_connected);
        set_opt(&self.mqtt_connected, device, connection.mqtt_connected);
    }

    fn update_inputs(&self, device: &str, inputs: &[InputReading]) {
        let mut seen = self.input_indices.lock().expect("input index lock");
        let indices = seen.entry(device.to_string()).or_default();
        for input in inputs {
            indices.insert(input.index);
            let index = input.index.to_string();
            set_opt2(&self.input_state, device, &index, input.state);
        }
    }

    fn update_channel(&self, device: &str, reading: &ChannelReading, config: Option<&ChannelConfig>) {
        let default_config = ChannelConfig::default();
        let ignore = config.unwrap_or(&default_config);
        let index = reading.index.to_string();

        match reading.kind {
            ChannelKind::Switch => {
                if !ignore.ignore_output {
                    set_opt2(&self.switch_output, device, &index, reading.output);
                }
                if !ignore.ignore_active_power {
                    set_opt2(&self.switch_apower, device, &index, reading.apower_w);
                }
                if !ignore.ignore_voltage {
                    set_opt2(&self.switch_voltage, device, &index, reading.voltage_v);
                }
                if !ignore.ignore_frequency {
                    set_opt2(&self.switch_frequency, device, &index, reading.freq_hz);
                }
                if !ignore.ignore_current {
                    set_opt2(&self.switch_current, device, &index, reading.current_a);
                }
                if !ignore.ignore_power_factor {
                    set_opt2(&self.switch_power_factor, device, &index, reading.pf);
                }
                if !ignore.ignore_temperature {
                    set_opt2(&self.switch_temperature, device, &index, reading.temp_c);
                }
                if !ignore.ignore_total_active_energy {
                    set_opt2(&self.switch_aenergy, device, &index, reading.aenergy_wh);
                }
                if !ignore.ignore_total_returned_active_energy {
                    set_opt2(&self.switch_ret_aenergy, device, &index, reading.ret_aenergy_wh);
                }
            }
            ChannelKind::Light => {
                if !ignore.ignore_output {
                    set_opt2(&self.light_output, device, &index, reading.output);
                }
                if !ignore.ignore_brightness {
                    set_opt2(&self.light_brightness, device, &index, reading.brightness);
                }
                if !ignore.ignore_active_power {
                    set_opt2(&self.light_apower, device, &index, reading.apower_w);
                }
                if !ignore.ignore_total_active_energy {
                    set_opt2(&self.light_aenergy, device, &index, reading.aenergy_wh);
                }
                if !ignore.ignore_voltage {
                    set_opt2(&self.light_voltage, device, &index, reading.voltage_v);
                }
                if !ignore.ignore_current {
                    set_opt2(&self.light_current, device, &index, reading.current_a);
                }
                if !ignore.ignore_temperature {
                    set_opt2(&self.light_temperature, device, &index, reading.temp_c);
                }
            }
        }
    }

    /// Delete every series labelled with this device so a removed target
    /// does not linger in scrapes.
    pub fn remove_device(&self, device: &str, target: &TargetConfig) {
        for gauge in [
            &self.up,
            &self.last_poll_timestamp,
            &self.poll_duration,
            &self.sys_uptime,
            &self.sys_ram_size,
            &self.sys_ram_free,
            &self.sys_ram_min_free,
            &self.sys_fs_size,
            &self.sys_fs_free,
            &self.sys_restart_required,
            &self.sys_cfg_rev,
            &self.wifi_rssi,
            &self.wifi_connected,
            &self.cloud_connected,
            &self.mqtt_connected,
        ] {
            let _ = gauge.remove_label_values(&[device]);
        }
        let _ = self.poll_errors.remove_label_values(&[device]);

        self.remove_channel_series(device, target);

        let indices = self
            .input_indices
            .lock()
            .expect("input index lock")
            .remove(device)
            .unwrap_or_default();
        for index in indices {
            let _ = self
                .input_state
                .remove_label_values(&[device, &index.to_string()]);
        }
    }

    /// Delete channel series for a target's configured channels. Used on
    /// removal and when a reload changes a target's channel layout.
    pub fn remove_channel_series(&self, device: &str, target: &TargetConfig) {
        for channel in &target.channels {
            let index = channel.index.to_string();
            let labels = [device, index.as_str()];
            match channel.kind {
                ChannelKind::Switch => {
                    for gauge in [
                        &self.switch_output,
                        &self.switch_apower,
                        &self.switch_voltage,
                        &self.switch_frequency,
                        &self.switch_current,
                        &self.switch_power_factor,
                        &self.switch_temperature,
                        &self.switch_aenergy,
                        &self.switch_ret_aenergy,
                    ] {
                        let _ = gauge.remove_label_values(&labels);
                    }
                }
                ChannelKind::Light => {
                    for gauge in [
                        &self.light_output,
                        &self.light_brightness,
                        &self.light_apower,
                        &self.light_aenergy,
                        &self.light_voltage,
                        &self.light_current,
                        &self.light_temperature,
                    ] {
                        let _ = gauge.remove_label_values(&labels);
                    }
                }
            }
        }
    }

    // Discovery, owned by the scanner.

    pub fn record_scan_started(&self) {
        self.discovery_scans.inc();
    }

    pub fn record_scan_completed(&self, duration_seconds: f64) {
        self.discovery_scan_duration.set(duration_seconds);
        self.discovery_last_scan_timestamp.set(unix_now());
    }

    pub fn record_scan_error(&self) {
        self.discovery_scan_errors.inc();
    }

    pub fn record_device_found(
        &self,
        ip: &str,
        model: &str,
        gen: i64,
        app: &str,
        mac: &str,
        discovered_at: &str,
    ) {
        self.discovery_devices_found.inc();
        self.discovered_device_info
            .with_label_values(&[ip, model, &gen.to_string(), app, mac, discovered_at])
            .set(1.0);
    }

    // Config reload, owned by the watcher.

    pub fn record_reload_success(&self) {
        self.config_reloads.inc();
        self.config_last_reload_timestamp.set(unix_now());
        self.config_last_reload_status.set(1.0);
    }

    pub fn record_reload_error(&self) {
        self.config_reload_errors.inc();
        self.config_last_reload_status.set(0.0);
    }
}

/// NaN for missing values: the series stays present but carries no number.
fn set_opt(gauge: &GaugeVec, device: &str, value: Option<f64>) {
    gauge
        .with_label_values(&[device])
        .set(value.unwrap_or(f64::NAN));
}

fn set_opt2(gauge: &GaugeVec, device: &str, index: &str, value: Option<f64>) {
    gauge
        .with_label_values(&[device, index])
        .set(value.unwrap_or(f64::NAN));
}
