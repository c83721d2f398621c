//! Shelly 1PM Gen4: a single metered switch channel.
//!
//! Identifies as model `S4SW-001P16EU`, gen 4, app `S1PMG4`. This family
//! may omit `pf` entirely and report `temperature.tC` as null.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::{ChannelKind, TargetConfig};
use crate::drivers::{collect_channel_readings, ChannelReading, DeviceDriver};
use crate::shelly::DeviceInfo;

pub struct S1pmGen4Driver;

impl DeviceDriver for S1pmGen4Driver {
    fn id(&self) -> &'static str {
        "s1pm_gen4"
    }

    fn name(&self) -> &'static str {
        "Shelly 1PM Gen4"
    }

    fn score(&self, info: &DeviceInfo) -> u32 {
        if info.gen() == 4 && info.app() == "S1PMG4" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> BTreeMap<ChannelKind, BTreeSet<u16>> {
        BTreeMap::from([(ChannelKind::Switch, BTreeSet::from([0]))])
    }

    fn parse_status(&self, status: &Value, target: &TargetConfig) -> Vec<ChannelReading> {
        let supported = self.supported_channels(&DeviceInfo::default());
        let indices = supported.get(&ChannelKind::Switch).cloned().unwrap_or_default();
        collect_channel_readings(status, target, ChannelKind::Switch, &indices, self.name())
    }
}
