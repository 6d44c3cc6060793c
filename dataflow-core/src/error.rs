use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Order Violation Error on {stream} - {reason}")]
    OrderViolation { stream: String, reason: String },

    #[error("Closed Stream Error - {0} already emitted its terminal watermark")]
    ClosedStream(String),

    #[error("Graph Cycle Error - {0}")]
    GraphCycle(String),

    #[error(
        "Arity Error - {operator} declares {expected} upstream streams but {actual} were supplied"
    )]
    Arity {
        operator: String,
        expected: usize,
        actual: usize,
    },

    #[error("Stream Type Error - {0}")]
    StreamType(String),

    #[error("Registration Error - {0}")]
    Registration(String),

    #[error("Fatal Operator Error in {operator} - {reason}")]
    FatalOperator { operator: String, reason: String },

    #[error("State Access Error - {0}")]
    StateAccess(String),

    #[error("Operator Error - {0}")]
    Operator(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Wraps any failure raised inside an operator's execution unit.
    pub(crate) fn fatal(operator: &str, cause: impl std::fmt::Display) -> Self {
        Error::FatalOperator {
            operator: operator.to_string(),
            reason: cause.to_string(),
        }
    }
}
