// Delta log stream, metric extraction, windowed aggregation and the alarm
// state machine that turns closed windows into remediation triggers.
pub mod aggregator;
pub mod alarm;
pub mod filter;
pub mod log_stream;

pub use aggregator::{Metric, RecordOutcome, WindowedAggregator};
pub use alarm::{Alarm, AlarmConfig, AlarmState, Comparison, Evaluation};
pub use filter::MetricFilter;
pub use log_stream::{LogBatch, LogLine, LogStream};

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MetricsError {
    #[error("metric period must be positive")]
    InvalidPeriod,
    #[error("lookback must keep at least one window")]
    InvalidLookback,
    #[error("log stream capacity must be positive")]
    InvalidCapacity,
    #[error("alarm threshold must be finite, got {0}")]
    InvalidThreshold(f64),
}
