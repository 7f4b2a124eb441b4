//! OpenAI Usage Exporter Library
//!
//! Polls the organization usage and costs APIs and republishes them as
//! Prometheus metrics. Usage arrives in minute buckets that are re-fetched
//! many times while they fill up; the exporter turns those repeated snapshots
//! into monotonic counters without double counting.
//!
//! ## Architecture Overview
//!
//! - [`client`] - HTTP client for the usage, costs and projects endpoints
//! - [`models`] - Wire types and the flattened [`models::UsageRecord`]
//! - [`dedup`] - Ledger that converts bucket snapshots into increments
//! - [`resolver`] - Cached, single-flight project name lookup
//! - [`metrics`] - Prometheus families owned by a private registry
//! - [`collector`] - Usage and cost loops, window and cursor handling
//! - [`server`] - `/metrics` and `/health` endpoints
//! - [`config`] - File, environment and default configuration
//! - [`logging`] - Structured logging with JSON and pretty formats
//!
//! ## Wiring
//!
//! ```no_run
//! use openai_usage_exporter::{
//!     client::UsageClient, collector::{Exporter, Schedule, Scheduler},
//!     config::Config, dedup::Ledger, metrics::MetricsSink, resolver::NameResolver,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load(None)?;
//! config.validate()?;
//!
//! let client = UsageClient::new(&config.api)?;
//! let sink = Arc::new(MetricsSink::new()?);
//! let exporter = Arc::new(Exporter::new(
//!     client.clone(),
//!     Arc::new(Ledger::new(config.ledger.track_open_buckets)),
//!     Arc::new(NameResolver::new(Arc::new(client))),
//!     sink,
//!     config.api.organization_id.clone(),
//!     config.scrape.resources.clone(),
//! ));
//!
//! let scheduler = Scheduler::start(exporter, Schedule::from_config(&config), CancellationToken::new());
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod collector;
pub mod config;
pub mod dedup;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod resolver;
pub mod server;

pub use collector::{Exporter, Schedule, Scheduler};
pub use config::Config;
pub use dedup::Ledger;
pub use metrics::MetricsSink;
