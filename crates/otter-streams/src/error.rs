//! Error types for otter-streams.
//!
//! Every failure inside the engine is a [`StreamError`]. Errors are cheap to
//! clone because the same error is delivered to several places at once: the
//! pending write callbacks, the `error` event and `finished` watchers.

use std::fmt;
use thiserror::Error;

/// Errors that can occur during stream operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    /// `push()` after the end-of-data sentinel.
    #[error("stream.push() after EOF")]
    PushAfterEof,

    /// `write()` or `end()` after `end()` was already called.
    #[error("write after end")]
    WriteAfterEnd,

    /// A null chunk handed to `write()`.
    #[error("May not write null values to stream")]
    NullValues,

    /// `unshift()` after the `end` event was emitted.
    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    /// Operation attempted on a destroyed stream.
    #[error("Cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    /// Operation attempted on a finished stream.
    #[error("Cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    /// `close` observed before the expected `end`/`finish`.
    #[error("Premature close")]
    PrematureClose,

    /// External cancellation through an abort signal.
    #[error("The operation was aborted")]
    Aborted {
        /// Reason carried by the abort signal.
        cause: Option<Box<StreamError>>,
    },

    /// Argument of the wrong type, e.g. a chunk not accepted by the stream mode.
    #[error("{0}")]
    InvalidArgType(String),

    /// Required hook was not supplied.
    #[error("The {0}() method is not implemented")]
    MethodNotImplemented(&'static str),

    /// Not enough arguments for an operation.
    #[error("The \"{0}\" argument must be specified")]
    MissingArgs(&'static str),

    /// Stage that cannot take its position in a pipeline or composition.
    #[error("Invalid stream stage: {0}")]
    InvalidStage(String),

    /// Unknown encoding name.
    #[error("Unknown encoding: {0}")]
    InvalidEncoding(String),

    /// Reader or writer already acquired.
    #[error("Stream is locked")]
    Locked,

    /// Stream already closed.
    #[error("Stream is closed")]
    Closed,

    /// Error raised by a user hook or host layer.
    #[error("{0}")]
    Custom(String),

    /// Several errors raised together, e.g. by both halves of a duplex.
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<StreamError>),
}

struct AggregateDisplay<'a>(&'a [StreamError]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl StreamError {
    /// Create a custom error from any message.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Create an abort error carrying the given cause.
    pub fn aborted(cause: Option<StreamError>) -> Self {
        Self::Aborted {
            cause: cause.map(Box::new),
        }
    }

    /// Whether this is an abort error.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Whether this is a premature close error.
    pub fn is_premature_close(&self) -> bool {
        matches!(self, Self::PrematureClose)
    }

    /// Node-style error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PushAfterEof => "ERR_STREAM_PUSH_AFTER_EOF",
            Self::WriteAfterEnd => "ERR_STREAM_WRITE_AFTER_END",
            Self::NullValues => "ERR_STREAM_NULL_VALUES",
            Self::UnshiftAfterEnd => "ERR_STREAM_UNSHIFT_AFTER_END_EVENT",
            Self::Destroyed(_) => "ERR_STREAM_DESTROYED",
            Self::AlreadyFinished(_) => "ERR_STREAM_ALREADY_FINISHED",
            Self::PrematureClose => "ERR_STREAM_PREMATURE_CLOSE",
            Self::Aborted { .. } => "ABORT_ERR",
            Self::InvalidArgType(_) => "ERR_INVALID_ARG_TYPE",
            Self::MethodNotImplemented(_) => "ERR_METHOD_NOT_IMPLEMENTED",
            Self::MissingArgs(_) => "ERR_MISSING_ARGS",
            Self::InvalidStage(_) => "ERR_INVALID_ARG_VALUE",
            Self::InvalidEncoding(_) => "ERR_UNKNOWN_ENCODING",
            Self::Locked => "ERR_INVALID_STATE",
            Self::Closed => "ERR_INVALID_STATE",
            Self::Custom(_) => "ERR_STREAM",
            Self::Aggregate(_) => "ERR_AGGREGATE",
        }
    }

    /// Combine two optional errors, keeping both causes when they differ.
    pub fn aggregate(first: Option<StreamError>, second: Option<StreamError>) -> Option<Self> {
        match (first, second) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) if a == b => Some(a),
            (Some(Self::Aggregate(mut errors)), Some(b)) => {
                errors.push(b);
                Some(Self::Aggregate(errors))
            }
            (Some(a), Some(b)) => Some(Self::Aggregate(vec![a, b])),
        }
    }
}

/// Result type alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(StreamError::PushAfterEof.code(), "ERR_STREAM_PUSH_AFTER_EOF");
        assert_eq!(StreamError::PrematureClose.code(), "ERR_STREAM_PREMATURE_CLOSE");
        assert!(StreamError::aborted(None).is_abort());
    }

    #[test]
    fn test_aggregate_keeps_both_causes() {
        let a = StreamError::custom("read failed");
        let b = StreamError::custom("write failed");

        let combined = StreamError::aggregate(Some(a.clone()), Some(b.clone())).unwrap();
        assert_eq!(combined, StreamError::Aggregate(vec![a.clone(), b]));
        assert_eq!(combined.to_string(), "read failed; write failed");

        assert_eq!(StreamError::aggregate(Some(a.clone()), Some(a.clone())), Some(a.clone()));
        assert_eq!(StreamError::aggregate(None, Some(a.clone())), Some(a));
        assert_eq!(StreamError::aggregate(None, None), None);
    }
}
