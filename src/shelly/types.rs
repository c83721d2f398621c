//! Wire types for the Shelly RPC protocol.

use serde::{Deserialize, Serialize};

/// Outgoing RPC envelope.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub id: u64,
    pub method: &'a str,
}

/// Incoming RPC envelope. Exactly one of `result` / `error` is present on
/// a well-formed response; both are optional so classification can happen
/// after parsing.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of `Shelly.GetDeviceInfo`. Devices across generations disagree on
/// which fields exist, so everything defaults.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub gen: Option<i64>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub fw_id: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
}

impl DeviceInfo {
    pub fn gen(&self) -> i64 {
        self.gen.unwrap_or(0)
    }

    pub fn app(&self) -> &str {
        self.app.as_deref().unwrap_or("")
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("unknown")
    }

    pub fn mac(&self) -> &str {
        self.mac.as_deref().unwrap_or("unknown")
    }

    pub fn device_id(&self) -> &str {
        self.id.as_deref().unwrap_or("unknown")
    }

    /// A payload that carries neither `model` nor `gen` is not a Shelly.
    pub fn looks_like_shelly(&self) -> bool {
        self.model.is_some() || self.gen.is_some()
    }
}
