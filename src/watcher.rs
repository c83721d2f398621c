//! Hot-reload of the configuration file.
//!
//! The file's mtime is polled on a short interval; once a change is seen,
//! a trailing-edge debounce waits for at least one second of quiescence
//! before reloading, so editors that write in several bursts trigger a
//! single reload. A snapshot that fails validation is dropped and the
//! previous one stays live.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::poller::DevicePoller;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Handle for changing the tracing filter when `log_level` changes.
pub type LogReloadHandle = tracing_subscriber::reload::Handle<
    tracing_subscriber::EnvFilter,
    tracing_subscriber::Registry,
>;

pub struct ConfigWatcher {
    path: PathBuf,
    poller: DevicePoller,
    metrics: Metrics,
    log_handle: Option<LogReloadHandle>,
    current: Arc<Config>,
}

impl ConfigWatcher {
    pub fn new(
        path: PathBuf,
        initial: Arc<Config>,
        poller: DevicePoller,
        metrics: Metrics,
        log_handle: Option<LogReloadHandle>,
    ) -> Self {
        Self {
            path,
            poller,
            metrics,
            log_handle,
            current: initial,
        }
    }

    /// Watch until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "watching config file");
        let mut last_mtime = file_mtime(&self.path);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let mtime = file_mtime(&self.path);
            if mtime == last_mtime {
                continue;
            }

            // Trailing-edge debounce: wait for the file to go quiet.
            let mut settled = mtime;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(DEBOUNCE) => {}
                    _ = shutdown.changed() => return,
                }
                let next = file_mtime(&self.path);
                if next == settled {
                    break;
                }
                settled = next;
            }
            last_mtime = settled;

            self.reload();
        }
    }

    /// Load, validate and apply a new snapshot. Failures keep the current
    /// one.
    fn reload(&mut self) {
        info!(path = %self.path.display(), "config change detected, reloading");

        let new_config = match Config::load(&self.path) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                error!(error = %e, "config reload failed, keeping previous snapshot");
                self.metrics.record_reload_error();
                return;
            }
        };

        self.apply(&new_config);
        self.metrics.record_reload_success();
        self.current = new_config;
        info!("config reloaded");
    }

    fn apply(&self, new_config: &Arc<Config>) {
        let old = &self.current;

        if new_config.log_level != old.log_level {
            if let Some(handle) = &self.log_handle {
                let filter = tracing_subscriber::EnvFilter::new(new_config.log_level.as_filter());
                if handle.reload(filter).is_ok() {
                    info!(level = new_config.log_level.as_filter(), "log level updated");
                }
            }
        }

        if new_config.listen_host != old.listen_host || new_config.listen_port != old.listen_port {
            warn!(
                "listen address changed to {}:{}; restart required for this to take effect",
                new_config.listen_host, new_config.listen_port
            );
        }

        // Target diff, semaphore resize and timeout/backoff updates all
        // happen inside the poller's critical section.
        self.poller.apply_config(Arc::clone(new_config));
    }
}

fn file_mtime(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
