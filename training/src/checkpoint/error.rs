use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use crate::state::StateErr;

/// The result type for checkpoint persistence.
pub type Result<T> = std::result::Result<T, CheckpointErr>;

#[derive(Debug)]
pub enum CheckpointErr {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The record is malformed or lacks a required field.
    Corrupted {
        path: PathBuf,
        detail: String,
    },
    /// A component rejected the state stored for it.
    State {
        path: PathBuf,
        component: String,
        source: StateErr,
    },
    /// The state can't be represented in a record.
    Encode(String),
    /// The state doesn't have the layout the export expects.
    Export(String),
}

impl Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io { path, source } => write!(f, "{}: {source}", path.display()),
            CheckpointErr::Corrupted { path, detail } => {
                write!(f, "corrupted checkpoint {}: {detail}", path.display())
            }
            CheckpointErr::State {
                path,
                component,
                source,
            } => write!(
                f,
                "failed to restore `{component}` from {}: {source}",
                path.display()
            ),
            CheckpointErr::Encode(detail) => write!(f, "failed to encode checkpoint: {detail}"),
            CheckpointErr::Export(detail) => write!(f, "failed to export checkpoint: {detail}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io { source, .. } => Some(source),
            CheckpointErr::State { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(super) fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> CheckpointErr {
    let path = path.into();
    move |source| CheckpointErr::Io { path, source }
}
