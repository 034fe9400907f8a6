//! Bus error taxonomy.

use thiserror::Error;

/// Errors surfaced by bus and stream operations.
///
/// Protocol violations by handler code (reusing a sender token, sending an
/// element with no open section, writing to a closed stream) are not
/// represented here: they panic with a fixed message and abort only the
/// offending task. The bus captures handler-task panics and reports them
/// as [`BusError::HandlerFault`].
#[derive(Debug, Error)]
pub enum BusError {
    /// The caller's overall wait exceeded its bound.
    #[error("timeout expired")]
    Timeout,

    /// The caller's cancellation signal fired before completion.
    #[error("request cancelled")]
    Cancelled,

    /// A stream hand-off found no consumer within the bound. Distinct
    /// from [`BusError::Timeout`]: this happens mid-stream, on the
    /// producer side.
    #[error("no consumer")]
    NoConsumer,

    /// A structured element value could not be encoded. Returned from the
    /// offending send only; the stream itself stays usable.
    #[error("element encoding failed: {0}")]
    Encoding(#[from] anyhow::Error),

    /// The handler task failed abnormally before producing a result.
    #[error("request handler failed: {0}")]
    HandlerFault(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Failure of a single stream hand-off. Once recorded on a stream it is
/// sticky: every later send reports it without waiting again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendFailure {
    NoConsumer,
    Cancelled,
}

impl From<SendFailure> for BusError {
    fn from(failure: SendFailure) -> Self {
        match failure {
            SendFailure::NoConsumer => BusError::NoConsumer,
            SendFailure::Cancelled => BusError::Cancelled,
        }
    }
}
