//! Shelly Plug US Gen2: a single metered switch channel.
//!
//! Identifies as gen 2, app `PlugUS`. Firmware on this family often omits
//! `freq`, `pf` and `ret_aenergy`.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::{ChannelKind, TargetConfig};
use crate::drivers::{collect_channel_readings, ChannelReading, DeviceDriver};
use crate::shelly::DeviceInfo;

pub struct PlugUsGen2Driver;

impl DeviceDriver for PlugUsGen2Driver {
    fn id(&self) -> &'static str {
        "plugus_gen2"
    }

    fn name(&self) -> &'static str {
        "Shelly Plug US Gen2"
    }

    fn score(&self, info: &DeviceInfo) -> u32 {
        if info.gen() == 2 && info.app() == "PlugUS" {
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
