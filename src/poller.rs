//! Scheduler and poller: the supervisor that owns the live target registry.
//!
//! Every target carries its own `next_run`; a single tick loop wakes at the
//! earliest one (capped at 1 s so new registrations are noticed promptly)
//! and spawns one task per due target. A global semaphore bounds how many
//! polls are in flight; a target waiting for a permit stays due and keeps
//! its cadence. Polls for one target are strictly sequential: while one is
//! in flight the target is not re-enqueued.
//!
//! The config watcher and the network scanner mutate the registry under a
//! short critical section; the tick loop observes their changes on its next
//! pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{Config, TargetConfig, DRIVER_CACHE_FAILURE_LIMIT};
use crate::drivers::{self, DeviceDriver, DeviceReading, DriverRegistry};
use crate::metrics::Metrics;
use crate::shelly::{DeviceInfo, ShellyClientPool};

/// Upper bound on one tick's sleep, so newly registered targets are picked
/// up within a second.
const MAX_TICK_SLEEP: Duration = Duration::from_secs(1);

/// Exponential backoff delay for the n-th consecutive failure:
/// `min(max, base * multiplier^(n-1))`. Jitter is added by the caller.
pub fn backoff_delay(failures: u32, base: f64, max: f64, multiplier: f64) -> Duration {
    let n = failures.max(1);
    let delay = base * multiplier.powi(n as i32 - 1);
    Duration::from_secs_f64(delay.min(max))
}

fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.0..0.1);
    delay + Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Start-of-life jitter spreads initial polls across the interval.
fn initial_next_run(interval_seconds: u64) -> Instant {
    let jitter: f64 = rand::rng().random_range(0.0..interval_seconds.max(1) as f64);
    Instant::now() + Duration::from_secs_f64(jitter)
}

/// Mutable runtime state of one target. The poll loop is the sole writer.
struct PollState {
    next_run: Instant,
    consecutive_failures: u32,
    device_info: Option<DeviceInfo>,
    device_info_fetched_at: Option<Instant>,
    driver: Option<Arc<dyn DeviceDriver>>,
    in_flight: bool,
}

impl PollState {
    fn new(interval_seconds: u64) -> Self {
        Self {
            next_run: initial_next_run(interval_seconds),
            consecutive_failures: 0,
            device_info: None,
            device_info_fetched_at: None,
            driver: None,
            in_flight: false,
        }
    }
}

struct TargetEntry {
    target: Arc<TargetConfig>,
    state: PollState,
}

struct PollerInner {
    targets: Mutex<HashMap<String, TargetEntry>>,
    config: Mutex<Arc<Config>>,
    semaphore: Arc<Semaphore>,
    /// Current permit count, tracked for live resizing.
    permits: Mutex<usize>,
    pool: ShellyClientPool,
    metrics: Metrics,
    drivers: Arc<DriverRegistry>,
}

/// Async poller for the whole device fleet.
#[derive(Clone)]
pub struct DevicePoller {
    inner: Arc<PollerInner>,
}

impl DevicePoller {
    pub fn new(
        config: Arc<Config>,
        pool: ShellyClientPool,
        metrics: Metrics,
        drivers: Arc<DriverRegistry>,
    ) -> Self {
        let max_concurrency = config.max_concurrency;
        let poller = Self {
            inner: Arc::new(PollerInner {
                targets: Mutex::new(HashMap::new()),
                config: Mutex::new(Arc::clone(&config)),
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                permits: Mutex::new(max_concurrency),
                pool,
                metrics,
                drivers,
            }),
        };
        poller.seed(&config);
        poller
    }

    /// Register the configured targets with jittered start times.
    fn seed(&self, config: &Config) {
        let mut targets = self.inner.targets.lock().expect("target registry lock");
        for target in &config.targets {
            let interval = config.target_poll_interval(target);
            targets.insert(
                target.name.clone(),
                TargetEntry {
                    target: Arc::new(target.clone()),
                    state: PollState::new(interval),
                },
            );
        }
        info!(targets = targets.len(), "poller seeded");
    }

    /// Main loop: dispatch due targets, sleep until the next one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("starting poll loop");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Instant::now();
            let due = self.claim_due(now);
            for (name, target, snapshot) in due {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    poll_target(inner, name, target, snapshot).await;
                });
            }

            let sleep = self.time_to_next(now);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("poll loop stopped");
    }

    /// Collect targets due at `now`, marking them in flight.
    fn claim_due(&self, now: Instant) -> Vec<(String, Arc<TargetConfig>, PollSnapshot)> {
        let mut targets = self.inner.targets.lock().expect("target registry lock");
        let mut due = Vec::new();
        for (name, entry) in targets.iter_mut() {
            if entry.state.in_flight || entry.state.next_run > now {
                continue;
            }
            entry.state.in_flight = true;
            due.push((
                name.clone(),
                Arc::clone(&entry.target),
                PollSnapshot {
                    device_info: entry.state.device_info.clone(),
                    device_info_fetched_at: entry.state.device_info_fetched_at,
                    driver: entry.state.driver.clone(),
                    consecutive_failures: entry.state.consecutive_failures,
                },
            ));
        }
        due
    }

    /// Time until the earliest idle target is due, bounded to [10ms, 1s].
    fn time_to_next(&self, now: Instant) -> Duration {
        let targets = self.inner.targets.lock().expect("target registry lock");
        let earliest = targets
            .values()
            .filter(|entry| !entry.state.in_flight)
            .map(|entry| entry.state.next_run)
            .min();
        match earliest {
            Some(at) => at
                .saturating_duration_since(now)
                .clamp(Duration::from_millis(10), MAX_TICK_SLEEP),
            None => MAX_TICK_SLEEP,
        }
    }

    /// Insert a scanner-built target. Idempotent by address: if any live
    /// target already points at the same host this is a no-op.
    pub fn add_discovered_target(&self, target: TargetConfig) -> bool {
        let config = Arc::clone(&self.inner.config.lock().expect("config lock"));
        let mut targets = self.inner.targets.lock().expect("target registry lock");

        if targets.values().any(|e| e.target.host() == target.host()) {
            debug!(host = target.host(), "already polling this address");
            return false;
        }
        if targets.contains_key(&target.name) {
            warn!(target_name = %target.name, "discovered name collides with existing target");
            return false;
        }

        let interval = config.target_poll_interval(&target);
        info!(target_name = %target.name, host = target.host(), "adding discovered target");
        targets.insert(
            target.name.clone(),
            TargetEntry {
                target: Arc::new(target),
                state: PollState::new(interval),
            },
        );
        true
    }

    /// Latest applied configuration snapshot.
    pub fn current_config(&self) -> Arc<Config> {
        Arc::clone(&self.inner.config.lock().expect("config lock"))
    }

    /// True if some live target already polls this host.
    pub fn has_target_host(&self, host: &str) -> bool {
        let targets = self.inner.targets.lock().expect("target registry lock");
        targets.values().any(|e| e.target.host() == host)
    }

    /// Currently registered target names (tests and logging).
    pub fn target_names(&self) -> Vec<String> {
        let targets = self.inner.targets.lock().expect("target registry lock");
        let mut names: Vec<String> = targets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply a validated config snapshot: diff by name, insert added
    /// targets, evict removed ones (deleting their series), replace changed
    /// ones while preserving poll state where it remains valid.
    ///
    /// Targets added by discovery are not part of the file and survive the
    /// reload untouched, unless the new file claims their name or host.
    pub fn apply_config(&self, new_config: Arc<Config>) {
        let old_config = {
            let mut config = self.inner.config.lock().expect("config lock");
            std::mem::replace(&mut *config, Arc::clone(&new_config))
        };

        let mut targets = self.inner.targets.lock().expect("target registry lock");

        let new_by_name: HashMap<&str, &TargetConfig> = new_config
            .targets
            .iter()
            .map(|t| (t.name.as_str(), t))
            .collect();

        let mut added = 0usize;
        let mut removed = 0usize;
        let mut changed = 0usize;

        let mut evicted: Vec<(String, Arc<TargetConfig>)> = Vec::new();
        targets.retain(|name, entry| {
            if entry.target.discovered {
                // Sticky unless the file now claims the same name.
                if !new_by_name.contains_key(name.as_str()) {
                    return true;
                }
            }
            if new_by_name.contains_key(name.as_str()) {
                true
            } else {
                evicted.push((name.clone(), Arc::clone(&entry.target)));
                false
            }
        });
        for (name, target) in &evicted {
            info!(target_name = %name, "target removed by config reload");
            self.inner.metrics.remove_device(name, target);
            removed += 1;
        }

        let now = Instant::now();
        for new_target in &new_config.targets {
            match targets.get_mut(&new_target.name) {
                None => {
                    let interval = new_config.target_poll_interval(new_target);
                    targets.insert(
                        new_target.name.clone(),
                        TargetEntry {
                            target: Arc::new(new_target.clone()),
                            state: PollState::new(interval),
                        },
                    );
                    added += 1;
                }
                Some(entry) => {
                    if *entry.target == *new_target
                        && old_config.target_poll_interval(&entry.target)
                            == new_config.target_poll_interval(new_target)
                        && old_config.target_credentials(&entry.target)
                            == new_config.target_credentials(new_target)
                    {
                        continue;
                    }
                    changed += 1;

                    let host_same = entry.target.host() == new_target.host();
                    let creds_same = old_config.target_credentials(&entry.target)
                        == new_config.target_credentials(new_target);
                    if !(host_same && creds_same) {
                        entry.state.device_info = None;
                        entry.state.device_info_fetched_at = None;
                        entry.state.driver = None;
                    }

                    let old_interval = old_config.target_poll_interval(&entry.target);
                    let new_interval = new_config.target_poll_interval(new_target);
                    if old_interval != new_interval {
                        entry.state.next_run =
                            now + Duration::from_secs(new_interval.min(old_interval));
                    }

                    if entry.target.channels != new_target.channels {
                        self.inner
                            .metrics
                            .remove_channel_series(&new_target.name, &entry.target);
                    }

                    entry.target = Arc::new(new_target.clone());
                }
            }
        }

        self.resize_semaphore(new_config.max_concurrency);

        info!(added, removed, changed, total = targets.len(), "config applied");
    }

    fn resize_semaphore(&self, new_size: usize) {
        let mut permits = self.inner.permits.lock().expect("permit counter lock");
        if new_size > *permits {
            self.inner.semaphore.add_permits(new_size - *permits);
            *permits = new_size;
        } else if new_size < *permits {
            // Only idle permits can be forgotten now; the rest disappear as
            // in-flight polls release them.
            let forgotten = self.inner.semaphore.forget_permits(*permits - new_size);
            *permits -= forgotten;
            if *permits != new_size {
                debug!(target_size = new_size, "semaphore shrink pending on in-flight polls");
            }
        }
    }
}

/// Immutable view of poll state captured at dispatch time.
struct PollSnapshot {
    device_info: Option<DeviceInfo>,
    device_info_fetched_at: Option<Instant>,
    driver: Option<Arc<dyn DeviceDriver>>,
    consecutive_failures: u32,
}

/// One poll of one target, gated by the global semaphore.
async fn poll_target(
    inner: Arc<PollerInner>,
    name: String,
    target: Arc<TargetConfig>,
    snapshot: PollSnapshot,
) {
    let Ok(_permit) = Arc::clone(&inner.semaphore).acquire_owned().await else {
        return;
    };

    let config = Arc::clone(&inner.config.lock().expect("config lock"));
    let started = Instant::now();

    let credentials = config.target_credentials(&target);
    let timeout = Duration::from_secs(config.request_timeout_seconds);
    let client = inner.pool.client(&target.url, credentials, timeout);

    // Refresh identification when the cache is cold or stale.
    let mut device_info = snapshot.device_info;
    let mut fetched_at = snapshot.device_info_fetched_at;
    let mut driver = snapshot.driver;
    let refresh_after = Duration::from_secs(config.device_info_refresh_seconds);
    let stale = fetched_at.map(|at| at.elapsed() >= refresh_after).unwrap_or(true);

    if stale {
        match client.get_device_info().await {
            Ok(info) => {
                driver = inner.drivers.best_driver(&info);
                if let Some(d) = &driver {
                    info!(target_name = %name, driver_id = d.id(), gen = info.gen(), app = info.app(), "driver selected");
                }
                device_info = Some(info);
                fetched_at = Some(Instant::now());
            }
            Err(error) => {
                if driver.is_none() {
                    let reading = DeviceReading::failure(
                        &name,
                        started.elapsed().as_secs_f64(),
                        format!("device info: {error}"),
                    );
                    finish_poll(&inner, &name, &target, reading, device_info, fetched_at, driver, snapshot.consecutive_failures);
                    return;
                }
                // Keep polling with the cached driver; don't hammer the
                // info endpoint again before the refresh interval.
                debug!(target_name = %name, error = %error, "device info refresh failed, using cached driver");
                fetched_at = Some(Instant::now());
            }
        }
    }

    let Some(active_driver) = driver.clone() else {
        let reading = DeviceReading::failure(
            &name,
            started.elapsed().as_secs_f64(),
            "no driver matched this device".to_string(),
        );
        finish_poll(&inner, &name, &target, reading, device_info, fetched_at, driver, snapshot.consecutive_failures);
        return;
    };

    let reading = match client.get_status().await {
        Ok(status) => {
            let duration = started.elapsed().as_secs_f64();
            let channels = active_driver.parse_status(&status, &target);
            debug!(target_name = %name, channels = channels.len(), duration, "poll ok");
            DeviceReading {
                device_name: name.clone(),
                up: true,
                poll_duration_seconds: duration,
                error_message: None,
                channels,
                inputs: drivers::parse_inputs(&status),
                system: drivers::parse_system(&status),
                wifi: drivers::parse_wifi(&status),
                connection: drivers::parse_connection(&status),
            }
        }
        Err(error) => DeviceReading::failure(
            &name,
            started.elapsed().as_secs_f64(),
            format!("{} ({})", error, error.kind()),
        ),
    };

    finish_poll(&inner, &name, &target, reading, device_info, fetched_at, driver, snapshot.consecutive_failures);
}

/// Publish metrics for the poll and write state back into the registry.
#[allow(clippy::too_many_arguments)]
fn finish_poll(
    inner: &Arc<PollerInner>,
    name: &str,
    target: &Arc<TargetConfig>,
    reading: DeviceReading,
    device_info: Option<DeviceInfo>,
    fetched_at: Option<Instant>,
    driver: Option<Arc<dyn DeviceDriver>>,
    prior_failures: u32,
) {
    let config = Arc::clone(&inner.config.lock().expect("config lock"));
    inner.metrics.apply_reading(&reading, target);

    let mut targets = inner.targets.lock().expect("target registry lock");
    let Some(entry) = targets.get_mut(name) else {
        // Removed while we were polling; nothing to schedule.
        return;
    };
    entry.state.in_flight = false;

    // A reload may have swapped the target mid-poll; if so, leave its fresh
    // cache state alone and only reschedule.
    let same_target = Arc::ptr_eq(&entry.target, target);

    if reading.up {
        entry.state.consecutive_failures = 0;
        if same_target {
            entry.state.device_info = device_info;
            entry.state.device_info_fetched_at = fetched_at;
            entry.state.driver = driver;
        }
        let interval = config.target_poll_interval(&entry.target);
        entry.state.next_run = Instant::now() + Duration::from_secs(interval);
        return;
    }

    entry.state.consecutive_failures = prior_failures + 1;
    let failures = entry.state.consecutive_failures;

    let error = reading.error_message.as_deref().unwrap_or("unknown");
    if failures == 1 {
        warn!(target_name = %name, error, "poll failed");
    } else {
        debug!(target_name = %name, error, failures, "poll failed");
    }

    // A few failures in a row may mean the device was swapped: drop the
    // identification cache so the next attempt re-identifies.
    if failures >= DRIVER_CACHE_FAILURE_LIMIT {
        entry.state.device_info = None;
        entry.state.device_info_fetched_at = None;
    } else if same_target {
        entry.state.device_info = device_info;
        entry.state.device_info_fetched_at = fetched_at;
        entry.state.driver = driver;
    }

    let delay = backoff_delay(
        failures,
        config.backoff_base_seconds,
        config.backoff_max_seconds,
        config.backoff_multiplier,
    );
    entry.state.next_run = Instant::now() + jittered(delay);
    debug!(target_name = %name, failures, backoff_seconds = delay.as_secs_f64(), "backing off");
}
