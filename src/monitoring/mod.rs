/*!
 * Monitoring
 * Logging setup and pipeline counters
 */

mod metrics;
mod tracer;

pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use tracer::init_tracing;
