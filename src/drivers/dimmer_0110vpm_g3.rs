//! Shelly Dimmer 0/1-10V PM Gen3: one light channel, not a switch.
//!
//! Identifies as model `S3DM-0010WW`, gen 3, app `Dimmer0110VPMG3`. Status
//! key `light:0` carries brightness alongside the power readings.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::config::{ChannelKind, TargetConfig};
use crate::drivers::{collect_channel_readings, ChannelReading, DeviceDriver};
use crate::shelly::DeviceInfo;

pub struct Dimmer0110vpmG3Driver;

impl DeviceDriver for Dimmer0110vpmG3Driver {
    fn id(&self) -> &'static str {
        "dimmer_0110vpm_g3"
    }

    fn name(&self) -> &'static str {
        "Shelly Dimmer 0/1-10V PM Gen3"
    }

    fn score(&self, info: &DeviceInfo) -> u32 {
        if info.gen() == 3 && info.app() == "Dimmer0110VPMG3" {
            100
        } else {
            0
        }
    }

    fn supported_channels(&self, _info: &DeviceInfo) -> BTreeMap<ChannelKind, BTreeSet<u16>> {
        BTreeMap::from([(ChannelKind::Light, BTreeSet::from([0]))])
    }

    fn parse_status(&self, status: &Value, target: &TargetConfig) -> Vec<ChannelReading> {
        let supported = self.supported_channels(&DeviceInfo::default());
        let indices = supported.get(&ChannelKind::Light).cloned().unwrap_or_default();
        collect_channel_readings(status, target, ChannelKind::Light, &indices, self.name())
    }
}
