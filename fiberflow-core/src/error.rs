//! Crate-wide error type.
//!
//! `CoreError` covers the error kinds named by the invocation-engine specification:
//! `InvalidArgument`, `LogicError`, `RuntimeFailure` and `Fatal`. `NotFound` is deliberately
//! absent: lookup misses are modeled as `Option::None`, not an error, at the call sites that
//! name it (`Program::lookup_function`).

/// Opaque error type used at the boundary with VM/HAL collaborators, whose own error types
/// this crate does not need to name.
pub type AnyError = anyhow::Error;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("logic error: {0}")]
    LogicError(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(#[source] AnyError),

    /// A non-recoverable low-level loop failure (e.g. out-of-memory during fence allocation).
    /// Named here for completeness, but never returned through a `Result`: the Worker loop logs
    /// it with `tracing::error!` and aborts the process directly, the same way a foreign-thread
    /// VM callback is forbidden from throwing through.
    #[error("fatal worker failure: {0}")]
    Fatal(AnyError),
}

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn logic_error(msg: impl Into<String>) -> Self {
        Self::LogicError(msg.into())
    }

    pub fn runtime_failure(err: impl Into<AnyError>) -> Self {
        Self::RuntimeFailure(err.into())
    }

    pub fn fatal(err: impl Into<AnyError>) -> Self {
        Self::Fatal(err.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
