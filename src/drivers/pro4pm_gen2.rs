//! Shelly Pro 4PM Gen2: four metered switch channels.
//!
//! Identifies as model `SPSW-104PE16EU`, gen 2, app `Pro4PM`. Status keys
//! `switch:0` through `switch:3`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::{ChannelKind, TargetConfig};
use crate::drivers::{collect_channel_readings, ChannelReading, DeviceDriver};
use crate::shelly::DeviceInfo;

pub struct Pro4pmGen2Driver;

impl DeviceDriver for Pro4pmGen2Driver {
    fn id(&self) -> &'static str {
        "pro4pm_gen2"
    }

    fn name(&self) -> &'static str {
        "Shelly Pro 4PM Gen2"
    }

    fn score(&self, info: &DeviceInfo) -> u32 {
        if info.gen() == 2 && info.app() == "Pro4PM" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> BTreeMap<ChannelKind, BTreeSet<u16>> {
        BTreeMap::from([(ChannelKind::Switch, BTreeSet::from([0, 1, 2, 3]))])
    }

    fn parse_status(&self, status: &Value, target: &TargetConfig) -> Vec<ChannelReading> {
        let supported = self.supported_channels(&DeviceInfo::default());
        let indices = supported.get(&ChannelKind::Switch).cloned().unwrap_or_default();
        collect_channel_readings(status, target, ChannelKind::Switch, &indices, self.name())
    }
}
