//! Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use quotaflow::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_acquisition(true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACQUISITIONS_TOTAL, ACTIVE_PROCESSORS, AVAILABLE_CAPACITY, CREDENTIALS_DEACTIVATED,
    ITEMS_TOTAL, JOBS_TOTAL, JOB_DURATION, PENDING_JOBS, REGISTRY,
};
