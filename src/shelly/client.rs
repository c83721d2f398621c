//! Device client with a shared keep-alive connection pool.
//!
//! One `reqwest::Client` serves the whole fleet; `ShellyClientPool` hands
//! out cheap per-target handles bound to a host and credentials. The client
//! performs no retries, the poller owns backoff policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::Credentials;
use crate::error::{Result, ShellyError};
use crate::shelly::types::{DeviceInfo, RpcRequest, RpcResponse};

const METHOD_GET_DEVICE_INFO: &str = "Shelly.GetDeviceInfo";
const METHOD_GET_STATUS: &str = "Shelly.GetStatus";

/// Shared HTTP pool for all targets. `reqwest::Client` is internally
/// reference-counted, so clones share connections.
#[derive(Clone)]
pub struct ShellyClientPool {
    http: reqwest::Client,
    request_id: Arc<AtomicU64>,
}

impl ShellyClientPool {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// A client handle for one device. The timeout is per request so the
    /// poller and the scanner can each apply their own deadline, and a
    /// hot-reloaded timeout takes effect on the next poll.
    pub fn client(
        &self,
        base_url: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> ShellyClient {
        ShellyClient {
            base_url: normalize_url(base_url),
            credentials,
            timeout,
            pool: self.clone(),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn normalize_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{base}")
    }
}

/// Client for a single device.
pub struct ShellyClient {
    base_url: String,
    credentials: Option<Credentials>,
    timeout: Duration,
    pool: ShellyClientPool,
}

impl ShellyClient {
    /// Issue one RPC call and return the `result` payload.
    pub async fn call(&self, method: &str) -> Result<serde_json::Value> {
        let url = format!("{}/rpc", self.base_url);
        let body = RpcRequest {
            id: self.pool.next_id(),
            method,
        };

        let mut request = self.pool.http.post(&url).json(&body).timeout(self.timeout);
        if let Some(creds) = &self.credentials {
            if creds.is_set() {
                request = request.basic_auth(&creds.username, Some(creds.password_str()));
            }
        }

        let response = request.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ShellyError::AuthDenied(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ShellyError::HttpStatus(status.as_u16()));
        }

        let parsed: RpcResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ShellyError::Timeout
            } else {
                ShellyError::MalformedResponse(e.to_string())
            }
        })?;

        if let Some(error) = parsed.error {
            return Err(ShellyError::RpcError {
                code: error.code.unwrap_or(0),
                message: error.message.unwrap_or_else(|| "unknown error".into()),
            });
        }

        debug!(url = %url, method, "rpc call ok");
        parsed
            .result
            .ok_or_else(|| ShellyError::MalformedResponse("response has no 'result'".into()))
    }

    /// `Shelly.GetDeviceInfo`, deserialized into the identification model.
    pub async fn get_device_info(&self) -> Result<DeviceInfo> {
        let result = self.call(METHOD_GET_DEVICE_INFO).await?;
        serde_json::from_value(result)
            .map_err(|e| ShellyError::MalformedResponse(format!("device info: {e}")))
    }

    /// `Shelly.GetStatus`, kept as raw JSON: the shape is driver-specific.
    pub async fn get_status(&self) -> Result<serde_json::Value> {
        self.call(METHOD_GET_STATUS).await
    }
}

fn classify_transport_error(error: reqwest::Error) -> ShellyError {
    if error.is_timeout() {
        ShellyError::Timeout
    } else if error.is_connect() {
        ShellyError::Connect(error.to_string())
    } else {
        ShellyError::MalformedResponse(error.to_string())
    }
}
