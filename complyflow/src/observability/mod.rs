//! Logging setup and in-process error metrics.

mod logging;
mod metrics;

pub use logging::{init_tracing, LogFormat};
pub use metrics::ErrorMetrics;
