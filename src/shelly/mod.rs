//! HTTP JSON-RPC client for Shelly devices.
//!
//! Gen2+ Shelly firmware exposes an RPC endpoint at `http://{host}/rpc`
//! accepting `{"id":N,"method":M}` POST bodies. Two methods are used here:
//! `Shelly.GetDeviceInfo` for identification and `Shelly.GetStatus` for
//! telemetry.

pub mod client;
pub mod types;

pub use client::{ShellyClient, ShellyClientPool};
pub use types::DeviceInfo;
