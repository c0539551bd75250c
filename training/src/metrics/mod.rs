//! Scalar statistics tracked during training and reduced across processes on demand.

mod error;
mod format;
mod logger;
mod progress;
mod smoothed;

pub use error::{MetricsErr, Result};
pub use logger::MetricLogger;
pub use progress::LogEvery;
pub use smoothed::SmoothedValue;

pub(crate) use format::hms;
