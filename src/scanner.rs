//! Network discovery: scan address ranges for Shelly devices and splice
//! them into the live target set.
//!
//! Disabled unless `discovery.enabled` is set. Probing is a single
//! `Shelly.GetDeviceInfo` per address under a private concurrency bound
//! with a short timeout; keep `scan_concurrency` conservative, a tight
//! sweep looks like a port scan to network monitors.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, Config, TargetConfig};
use crate::drivers::DriverRegistry;
use crate::metrics::Metrics;
use crate::poller::DevicePoller;
use crate::shelly::{DeviceInfo, ShellyClientPool};

/// A device identified during a scan. Also the on-disk persistence record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredDevice {
    pub ip: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub gen: i64,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub id: String,
    pub discovered_at: String,
}

impl DiscoveredDevice {
    fn from_info(ip: &Ipv4Addr, info: &DeviceInfo) -> Self {
        Self {
            ip: ip.to_string(),
            model: info.model().to_string(),
            gen: info.gen(),
            app: info.app().to_string(),
            mac: info.mac().to_string(),
            id: info.device_id().to_string(),
            discovered_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: Some(self.id.clone()),
            model: Some(self.model.clone()),
            gen: Some(self.gen),
            app: Some(self.app.clone()),
            mac: Some(self.mac.clone()),
            ..Default::default()
        }
    }
}

/// Expand one range entry into addresses. Accepts CIDR (`10.0.80.0/24`),
/// inclusive ranges (`192.168.1.100-192.168.1.200`) and single addresses.
/// Invalid entries expand to nothing, with a warning.
pub fn parse_network_range(range: &str) -> Vec<Ipv4Addr> {
    let range = range.trim();

    if let Some((start, end)) = range.split_once('-') {
        let (start, end) = (start.trim(), end.trim());
        let (Ok(start), Ok(end)) = (start.parse::<Ipv4Addr>(), end.parse::<Ipv4Addr>()) else {
            warn!(range, "invalid IP range");
            return Vec::new();
        };
        let (mut lo, mut hi) = (u32::from(start), u32::from(end));
        if lo > hi {
            std::mem::swap(&mut lo, &mut hi);
        }
        return (lo..=hi).map(Ipv4Addr::from).collect();
    }

    if let Some((base, prefix)) = range.split_once('/') {
        let (Ok(base), Ok(prefix)) = (base.parse::<Ipv4Addr>(), prefix.parse::<u32>()) else {
            warn!(range, "invalid CIDR notation");
            return Vec::new();
        };
        if prefix > 32 {
            warn!(range, "invalid CIDR prefix");
            return Vec::new();
        }
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(base) & mask;
        let broadcast = network | !mask;
        // Skip network and broadcast addresses for real subnets.
        if prefix <= 30 {
            return ((network + 1)..broadcast).map(Ipv4Addr::from).collect();
        }
        return (network..=broadcast).map(Ipv4Addr::from).collect();
    }

    match range.parse::<Ipv4Addr>() {
        Ok(ip) => vec![ip],
        Err(_) => {
            warn!(range, "invalid IP address");
            Vec::new()
        }
    }
}

/// All addresses from the configured ranges, minus exclusions, sorted and
/// deduplicated.
pub fn expand_ranges(ranges: &[String], exclude: &[String]) -> Vec<Ipv4Addr> {
    let excluded: Vec<Ipv4Addr> = exclude.iter().filter_map(|s| s.parse().ok()).collect();
    let mut ips: Vec<Ipv4Addr> = ranges
        .iter()
        .flat_map(|r| parse_network_range(r))
        .filter(|ip| !excluded.contains(ip))
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

fn sanitize(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Build a target name from the template. Placeholders: `{ip}` (dots as
/// underscores), `{model}`, `{gen}`, `{app}`, `{mac}`, `{id}`; all safe for
/// empty fields.
pub fn format_device_name(template: &str, device: &DiscoveredDevice) -> String {
    template
        .replace("{ip}", &device.ip.replace('.', "_"))
        .replace("{model}", &sanitize(&device.model))
        .replace("{gen}", &device.gen.to_string())
        .replace("{app}", &sanitize(&device.app))
        .replace("{mac}", &sanitize(&device.mac))
        .replace("{id}", &sanitize(&device.id))
}

/// Build the target a discovered device will be polled as: channels come
/// from the driver's supported set with no ignore flags, credentials from
/// auto_add_credentials falling back to defaults.
pub fn target_for_device(
    device: &DiscoveredDevice,
    config: &Config,
    drivers: &DriverRegistry,
) -> Option<TargetConfig> {
    let info = device.device_info();
    let driver = drivers.best_driver(&info)?;

    let mut channels = Vec::new();
    for (kind, indices) in driver.supported_channels(&info) {
        for index in indices {
            channels.push(ChannelConfig::new(kind, index));
        }
    }

    Some(TargetConfig {
        name: format_device_name(&config.discovery.name_template, device),
        url: device.ip.clone(),
        poll_interval_seconds: None,
        credentials: config.discovery_credentials(),
        channels,
        discovered: true,
    })
}

pub struct NetworkScanner {
    poller: DevicePoller,
    pool: ShellyClientPool,
    metrics: Metrics,
    drivers: Arc<DriverRegistry>,
    /// Devices seen so far, keyed by address. Re-discovery is a no-op.
    seen: HashMap<String, DiscoveredDevice>,
}

impl NetworkScanner {
    pub fn new(
        poller: DevicePoller,
        pool: ShellyClientPool,
        metrics: Metrics,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        Self {
            poller,
            pool,
            metrics,
            drivers,
            seen: HashMap::new(),
        }
    }

    /// Run until shutdown: rehydrate persisted devices, scan immediately,
    /// then on every interval.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.poller.current_config();
        info!(
            interval = config.discovery.scan_interval_seconds,
            ranges = config.discovery.network_ranges.len(),
            "network scanner starting"
        );

        if let Some(path) = &config.discovery.persist_path {
            self.rehydrate(path.clone()).await;
        }

        loop {
            self.scan_once().await;

            let interval =
                Duration::from_secs(self.poller.current_config().discovery.scan_interval_seconds);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("network scanner stopped");
                    return;
                }
            }
        }
    }

    /// Restore previously discovered devices so polling resumes before the
    /// first scan completes.
    async fn rehydrate(&mut self, path: std::path::PathBuf) {
        let devices = match load_discovered(&path).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load persisted devices");
                return;
            }
        };
        if devices.is_empty() {
            return;
        }

        let config = self.poller.current_config();
        let mut restored = 0usize;
        for device in devices {
            if self.seen.contains_key(&device.ip) {
                continue;
            }
            if config.discovery.auto_add_discovered && !self.poller.has_target_host(&device.ip) {
                if let Some(target) = target_for_device(&device, &config, &self.drivers) {
                    if self.poller.add_discovered_target(target) {
                        restored += 1;
                    }
                }
            }
            self.seen.insert(device.ip.clone(), device);
        }
        info!(restored, "rehydrated persisted devices");
    }

    /// One full sweep of the configured ranges.
    pub async fn scan_once(&mut self) {
        let config = self.poller.current_config();
        let discovery = &config.discovery;
        if discovery.network_ranges.is_empty() {
            warn!("discovery enabled but no network ranges configured");
            return;
        }

        self.metrics.record_scan_started();
        let started = Instant::now();

        let ips = expand_ranges(&discovery.network_ranges, &discovery.exclude_ips);
        info!(addresses = ips.len(), "starting network scan");

        let semaphore = Arc::new(Semaphore::new(discovery.scan_concurrency.max(1)));
        let timeout = Duration::from_secs_f64(discovery.scan_timeout_seconds);
        let credentials = config.discovery_credentials();

        let mut probes = Vec::with_capacity(ips.len());
        for ip in ips {
            let semaphore = Arc::clone(&semaphore);
            let client = self.pool.client(&ip.to_string(), credentials.clone(), timeout);
            let metrics = self.metrics.clone();
            probes.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                match client.get_device_info().await {
                    Ok(info) if info.looks_like_shelly() => Some((ip, info)),
                    Ok(_) => {
                        debug!(%ip, "responded but does not look like a Shelly");
                        None
                    }
                    Err(e) => {
                        debug!(%ip, error = %e, "probe failed");
                        metrics.record_scan_error();
                        None
                    }
                }
            }));
        }

        let mut new_devices = Vec::new();
        for probe in probes {
            let Ok(Some((ip, info))) = probe.await else {
                continue;
            };
            let key = ip.to_string();
            if self.seen.contains_key(&key) {
                continue;
            }
            let device = DiscoveredDevice::from_info(&ip, &info);
            info!(
                %ip,
                model = device.model,
                gen = device.gen,
                app = device.app,
                "discovered Shelly device"
            );
            self.metrics.record_device_found(
                &device.ip,
                &device.model,
                device.gen,
                &device.app,
                &device.mac,
                &device.discovered_at,
            );
            self.seen.insert(key, device.clone());
            new_devices.push(device);
        }

        if config.discovery.auto_add_discovered {
            for device in &new_devices {
                if self.poller.has_target_host(&device.ip) {
                    debug!(ip = device.ip, "already a live target");
                    continue;
                }
                match target_for_device(device, &config, &self.drivers) {
                    Some(target) => {
                        self.poller.add_discovered_target(target);
                    }
                    None => {
                        warn!(
                            ip = device.ip,
                            model = device.model,
                            "no driver for discovered device, not adding"
                        );
                    }
                }
            }
        }

        if !new_devices.is_empty() {
            if let Some(path) = &config.discovery.persist_path {
                if let Err(e) = persist_discovered(path, &self.seen).await {
                    warn!(path = %path.display(), error = %e, "failed to persist discovered devices");
                }
            }
        }

        let duration = started.elapsed().as_secs_f64();
        self.metrics.record_scan_completed(duration);
        info!(
            duration_seconds = duration,
            new_devices = new_devices.len(),
            "network scan complete"
        );
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDevices {
    #[serde(default)]
    discovered: Vec<DiscoveredDevice>,
}

async fn load_discovered(path: &Path) -> anyhow::Result<Vec<DiscoveredDevice>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = tokio::fs::read_to_string(path).await?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: PersistedDevices = serde_yaml::from_str(&text)?;
    Ok(parsed.discovered)
}

/// Write the discovered set atomically: temp file in the same directory,
/// then rename over the destination.
async fn persist_discovered(
    path: &Path,
    seen: &HashMap<String, DiscoveredDevice>,
) -> anyhow::Result<()> {
    // BTreeMap for a stable on-disk order.
    let ordered: BTreeMap<&String, &DiscoveredDevice> = seen.iter().collect();
    let devices = PersistedDevices {
        discovered: ordered.values().map(|d| (*d).clone()).collect(),
    };

    let mut text = String::from("# Auto-generated: devices found by network discovery.\n");
    text.push_str(&serde_yaml::to_string(&devices)?);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("yml.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    info!(path = %path.display(), devices = devices.discovered.len(), "persisted discovered devices");
    Ok(())
}
