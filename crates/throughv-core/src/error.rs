//! Error types for the throughv batch pipeline.

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by user transform and flush functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared, cloneable form of a user error.
///
/// The same failure is reported to every write callback of a batch and to
/// every event subscriber, so the source is reference counted.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Internal invariants of the batch protocol.
///
/// These indicate that the surrounding code misused the host contract.
/// They are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("reassembly invoked with no pending batch")]
    NoPendingBatch,

    #[error("batch ingested while the previous batch is still pending")]
    BatchAlreadyPending,

    #[error("calling transform done when still transforming")]
    FlushWhileDispatching,

    #[error("calling transform done with {0} write(s) still buffered")]
    FlushWithBufferedWrites(usize),
}

/// Errors surfaced by a throughv stream.
#[derive(Debug, Clone, Error)]
pub enum ThroughvError {
    /// A per-entry transform reported failure.
    #[error("transform failed for entry {index}: {source}")]
    Transform {
        index: usize,
        #[source]
        source: SharedError,
    },

    /// The flush function reported failure; end-of-output is not signalled.
    #[error("flush failed: {source}")]
    Flush {
        #[source]
        source: SharedError,
    },

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Error supplied explicitly to `destroy`.
    #[error("stream destroyed: {source}")]
    Destroyed {
        #[source]
        source: SharedError,
    },

    /// The destination of a pipe rejected a result.
    #[error("pipe destination failed: {source}")]
    Pipe {
        #[source]
        source: SharedError,
    },

    #[error("write after end")]
    WriteAfterEnd,

    #[error("stream closed")]
    Closed,
}

impl ThroughvError {
    pub fn transform(index: usize, source: impl Into<BoxError>) -> Self {
        Self::Transform {
            index,
            source: Arc::from(source.into()),
        }
    }

    pub fn flush(source: impl Into<BoxError>) -> Self {
        Self::Flush {
            source: Arc::from(source.into()),
        }
    }

    pub fn destroyed(source: impl Into<BoxError>) -> Self {
        Self::Destroyed {
            source: Arc::from(source.into()),
        }
    }

    pub fn pipe(source: impl Into<BoxError>) -> Self {
        Self::Pipe {
            source: Arc::from(source.into()),
        }
    }

    /// Returns `true` for internal invariant failures.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
