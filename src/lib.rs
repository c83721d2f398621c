//! Prometheus exporter for Shelly smart relays, plugs and dimmers.
//!
//! Polls a fleet of Shelly devices over their HTTP JSON-RPC API and exposes
//! normalized telemetry as Prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   HTTP /rpc    ┌─────────────────────────────┐
//! │ Shelly   │ ◄────────────► │  Exporter                   │
//! │ devices  │   JSON-RPC     │  ┌────────┐   ┌──────────┐  │    HTTP     ┌────────────┐
//! └──────────┘                │  │ Poller │──►│ Metrics  │  │ ◄─────────► │ Prometheus │
//!      ▲                      │  └────────┘   └──────────┘  │  /metrics   └────────────┘
//!      │ probe                │  ┌─────────┐  ┌──────────┐  │
//!      └───────────────────── │  │ Scanner │  │ Watcher  │  │
//!                             │  └─────────┘  └──────────┘  │
//!                             └─────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`shelly`] - HTTP JSON-RPC device client
//! - [`drivers`] - per-family payload translation and driver selection
//! - [`poller`] - scheduling, concurrency bounds and backoff
//! - [`metrics`] - Prometheus metric definitions
//! - [`scanner`] - network discovery
//! - [`watcher`] - configuration hot-reload
//! - [`server`] - HTTP scrape endpoint
//! - [`config`] - configuration model and validation
//! - [`error`] - error types

pub mod config;
pub mod drivers;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod scanner;
pub mod server;
pub mod shelly;
pub mod watcher;
