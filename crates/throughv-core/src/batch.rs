//! Entry and batch records flowing through the pipeline.

use serde::{Deserialize, Serialize};

/// Opaque tag attached to a write and handed to the transform unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    /// Encoding label supplied by the writer, e.g. `"utf8"` or `"buffer"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl Metadata {
    /// Metadata carrying an encoding label.
    pub fn encoding(encoding: impl Into<String>) -> Self {
        Self {
            encoding: Some(encoding.into()),
        }
    }

    /// Metadata used for byte-mode writes that name no encoding.
    pub fn buffer() -> Self {
        Self::encoding("buffer")
    }
}

/// One unit of input plus its passthrough metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub payload: T,
    pub metadata: Metadata,
}

impl<T> Entry<T> {
    pub fn new(payload: T, metadata: Metadata) -> Self {
        Self { payload, metadata }
    }

    pub fn into_parts(self) -> (T, Metadata) {
        (self.payload, self.metadata)
    }
}

/// Ordered entries in write order. Dispatched and reassembled as one unit.
pub type Batch<T> = Vec<Entry<T>>;

/// Result of one parallel dispatch.
///
/// `results[i]` belongs to the i-th entry of the batch; `None` means the
/// entry produced no output (or failed).
#[derive(Debug)]
pub struct BatchOutcome<U> {
    /// First error in completion order, if any entry failed.
    pub error: Option<crate::error::ThroughvError>,
    pub results: Vec<Option<U>>,
}

impl<U> BatchOutcome<U> {
    /// Number of entries that produced a value.
    pub fn produced(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// Number of entries that produced nothing.
    pub fn absent(&self) -> usize {
        self.results.len() - self.produced()
    }
}
