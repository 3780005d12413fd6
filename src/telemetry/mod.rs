//! Logging and metrics.

pub mod metrics;
mod observability;

pub use metrics::init_metrics;
pub use observability::{config_from_env, init_tracing, spans, TracingConfig};
