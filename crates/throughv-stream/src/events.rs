//! Lifecycle notifications broadcast by a stream.

use throughv_core::ThroughvError;

/// Capacity of each stream's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A lifecycle notification.
///
/// Results themselves are not broadcast: they are delivered in order by the
/// stream's `Reader`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The writable length dropped back to zero after a write returned `false`.
    Drain,
    /// The write side ended, the last batch was reassembled and flush succeeded.
    Finish,
    /// The reader has consumed every result.
    End,
    /// A transform, flush, protocol or destroy error. Fired at most once per cause.
    Error(ThroughvError),
    /// Fired exactly once, after destroy, an error, or `Finish` + `End`.
    Close,
}

impl StreamEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for StreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drain => write!(f, "drain"),
            Self::Finish => write!(f, "finish"),
            Self::End => write!(f, "end"),
            Self::Error(e) => write!(f, "error: {e}"),
            Self::Close => write!(f, "close"),
        }
    }
}
