//! Logging and Prometheus metrics shared by the sonifier binary and its tests.
//!
//! The render callback uses neither; its counters reach Prometheus through the
//! status reporter.

mod metrics;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use tracing::init_tracing;
