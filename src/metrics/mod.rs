//! Metrics Module
//!
//! The metrics sink capability, its Prometheus backend and byte counting.

pub mod collector;
pub mod measured;
pub mod types;

pub use collector::{add_if_non_zero, CounterFamily, PrometheusMetrics};
pub use measured::measure_conn;
pub use types::{NoOpMetrics, ProxyMetrics, TrafficCounts};
