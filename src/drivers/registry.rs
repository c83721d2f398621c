//! Ordered driver registry with score-based selection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::drivers::dimmer_0110vpm_g3::Dimmer0110vpmG3Driver;
use crate::drivers::plugus_gen2::PlugUsGen2Driver;
use crate::drivers::pro4pm_gen2::Pro4pmGen2Driver;
use crate::drivers::s1pm_gen4::S1pmGen4Driver;
use crate::drivers::DeviceDriver;
use crate::shelly::DeviceInfo;

/// Process-wide list of driver instances, built once at startup.
/// Selection is deterministic: maximum positive score wins, earlier
/// registration wins ties.
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn DeviceDriver>>,
}

impl DriverRegistry {
    /// Registry with all built-in drivers.
    pub fn new() -> Self {
        let mut registry = Self { drivers: Vec::new() };
        registry.register(Arc::new(Pro4pmGen2Driver));
        registry.register(Arc::new(S1pmGen4Driver));
        registry.register(Arc::new(PlugUsGen2Driver));
        registry.register(Arc::new(Dimmer0110vpmG3Driver));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn DeviceDriver>) {
        debug!(driver_id = driver.id(), "registered driver");
        self.drivers.push(driver);
    }

    /// Best matching driver for a device, or `None` if nothing scores
    /// positive.
    pub fn best_driver(&self, info: &DeviceInfo) -> Option<Arc<dyn DeviceDriver>> {
        let mut best: Option<(u32, &Arc<dyn DeviceDriver>)> = None;
        for driver in &self.drivers {
            let score = driver.score(info);
            if score > 0 && best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, driver));
            }
        }

        match best {
            Some((score, driver)) => {
                debug!(
                    driver_id = driver.id(),
                    score,
                    gen = info.gen(),
                    app = info.app(),
                    "selected driver"
                );
                Some(Arc::clone(driver))
            }
            None => {
                warn!(
                    gen = info.gen(),
                    app = info.app(),
                    model = info.model(),
                    "no driver for device"
                );
                None
            }
        }
    }

    pub fn drivers(&self) -> &[Arc<dyn DeviceDriver>] {
        &self.drivers
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
