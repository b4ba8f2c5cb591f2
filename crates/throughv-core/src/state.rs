//! Per-stream transform state.

use crate::batch::Batch;

/// State owned by exactly one stream instance.
///
/// `batch_done` is set from ingestion until reassembly and marks the batch as
/// pending. The entries themselves move out of `pending_batch` into the
/// dispatch future when the batch starts.
#[derive(Debug)]
pub struct TransformState<T, D> {
    pub pending_batch: Option<Batch<T>>,
    pub batch_done: Option<D>,
    /// At most one batch is dispatching at a time.
    pub dispatching: bool,
    /// Read demand arrived while no batch was pending.
    pub demand_pending: bool,
}

impl<T, D> TransformState<T, D> {
    pub fn new() -> Self {
        Self {
            pending_batch: None,
            batch_done: None,
            dispatching: false,
            demand_pending: false,
        }
    }

    /// A batch was ingested and has not been reassembled yet.
    pub fn has_pending(&self) -> bool {
        self.batch_done.is_some()
    }

    /// The pending batch is waiting for read demand.
    pub fn ready_to_dispatch(&self) -> bool {
        self.pending_batch.is_some() && self.batch_done.is_some() && !self.dispatching
    }
}

impl<T, D> Default for TransformState<T, D> {
    fn default() -> Self {
        Self::new()
    }
}
