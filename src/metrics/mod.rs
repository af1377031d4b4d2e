//! Metrics and observability
//!
//! Prometheus-compatible counters for the routing core:
//! - messages routed, received, dropped, delivered and relayed
//! - transport send outcomes
//! - delivery outcomes and latency
//! - registry and dedup sizes

pub mod exporter;
pub mod recorder;

pub use exporter::{render_metrics, start_metrics_server, MetricsConfig, MetricsError};
pub use recorder::init_metrics;
