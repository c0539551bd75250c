use std::{error::Error, fmt, io};

/// The collective module's result type.
pub type Result<T> = std::result::Result<T, CollectiveErr>;

/// Failures of the communication substrate.
///
/// These are always fatal for the whole group, nothing is retried.
#[derive(Debug)]
pub enum CollectiveErr {
    Io {
        op: &'static str,
        peer: usize,
        source: io::Error,
    },
    UnexpectedMessage {
        op: &'static str,
        peer: usize,
        got: &'static str,
    },
    LengthMismatch {
        op: &'static str,
        rank: usize,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        op: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    Remote {
        rank: usize,
        detail: String,
    },
    Handshake(String),
    Env {
        var: &'static str,
        value: String,
    },
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { op, peer, source } => {
                write!(f, "{op}: io error on the link with rank {peer}: {source}")
            }
            Self::UnexpectedMessage { op, peer, got } => {
                write!(f, "{op}: unexpected message from rank {peer}: got {got}")
            }
            Self::LengthMismatch {
                op,
                rank,
                got,
                expected,
            } => write!(
                f,
                "{op}: rank {rank} contributed {got} elements, expected {expected}"
            ),
            Self::ShapeMismatch { op, got, expected } => {
                write!(f, "{op}: got shape {got:?}, expected {expected:?}")
            }
            Self::Remote { rank, detail } => write!(f, "collective failed on rank {rank}: {detail}"),
            Self::Handshake(detail) => write!(f, "handshake failed: {detail}"),
            Self::Env { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl Error for CollectiveErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<CollectiveErr> for io::Error {
    fn from(value: CollectiveErr) -> Self {
        match value {
            CollectiveErr::Io { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}
