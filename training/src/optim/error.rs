use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used by the optimizers.
pub type Result<T> = std::result::Result<T, OptimErr>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimErr {
    /// A gradient, or a piece of optimizer state, doesn't fit its parameter.
    ShapeMismatch {
        param: String,
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl Display for OptimErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimErr::ShapeMismatch {
                param,
                what,
                got,
                expected,
            } => write!(
                f,
                "the {what} of parameter `{param}` has shape {got:?}, expected {expected:?}"
            ),
        }
    }
}

impl Error for OptimErr {}
