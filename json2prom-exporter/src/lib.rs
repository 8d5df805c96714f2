//! Prometheus exporter for JSON HTTP endpoints.
//!
//! Each configured target is polled on its own schedule. Values and labels
//! are pulled out of the JSON response with small path queries and kept in
//! a shared series registry, which the HTTP server renders on every scrape.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  TargetPoller   │────>│ SeriesRegistry  │────>│   HTTP Server   │
//! │ (one per target)│     │ (upsert/retire) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! json2prom --config config.yaml --listen 0.0.0.0:9100
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod error;
pub mod extract;
pub mod fetcher;
pub mod http;
pub mod mapping;
pub mod poller;
pub mod registry;
pub mod supervisor;

pub use config::{ExporterConfig, TargetErrorPolicy};
pub use error::{CycleError, ExpositionError, FetchError, ItemError, StartupError, TargetInitError};
pub use http::HttpServer;
pub use poller::TargetPoller;
pub use registry::{SeriesKey, SeriesRegistry, SharedRegistry};
pub use supervisor::Supervisor;
