use std::{
    error::Error,
    fmt::{self, Display},
};

use collective::CollectiveErr;

/// The result type for metric tracking.
pub type Result<T> = std::result::Result<T, MetricsErr>;

#[derive(Debug)]
pub enum MetricsErr {
    /// No meter is registered under this name.
    NotFound(String),
    /// A meter's format template couldn't be parsed.
    Format { fmt: String, detail: String },
    /// Another rank synchronized a different set of meters than `names`.
    MeterMismatch { rank: usize, names: Vec<String> },
    Collective(CollectiveErr),
}

impl Display for MetricsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsErr::NotFound(name) => write!(f, "no meter named `{name}`"),
            MetricsErr::Format { fmt, detail } => {
                write!(f, "invalid meter format {fmt:?}: {detail}")
            }
            MetricsErr::MeterMismatch { rank, names } => write!(
                f,
                "rank {rank} synchronized meters {names:?}, which differ from another rank's"
            ),
            MetricsErr::Collective(e) => write!(f, "failed to synchronize meters: {e}"),
        }
    }
}

impl Error for MetricsErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MetricsErr::Collective(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CollectiveErr> for MetricsErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}
