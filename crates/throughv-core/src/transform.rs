//! `BulkTransform` — batch ingestion, read-demand pump, reassembly and the
//! end-of-input handshake.
//!
//! ## Cycle
//! ```text
//! host write side ──ingest(batch, done)──► pending
//!                                             │  read demand (or room downstream)
//!                                             ▼
//!                                   dispatch_batch ──► host.dispatch(future)
//!                                             │  every entry settled
//!                                             ▼
//! host read side ◄──push (in order)── after_transform ──resolve_batch──► next batch
//! ```

use crate::batch::{Batch, BatchOutcome};
use crate::dispatch::{dispatch_batch, identity, FlushFn, TransformFn};
use crate::error::{ProtocolViolation, ThroughvError};
use crate::host::DuplexHost;
use crate::state::TransformState;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, trace};

/// Batching transform bound to one stream instance.
pub struct BulkTransform<T, U, D> {
    state: TransformState<T, D>,
    transform: TransformFn<T, U>,
    flush: Option<FlushFn>,
    destroyed: bool,
}

impl<T, U, D> BulkTransform<T, U, D>
where
    U: Send + 'static,
{
    pub fn new(transform: TransformFn<T, U>, flush: Option<FlushFn>) -> Self {
        Self {
            state: TransformState::new(),
            transform,
            flush,
            destroyed: false,
        }
    }

    pub fn state(&self) -> &TransformState<T, D> {
        &self.state
    }

    pub fn is_dispatching(&self) -> bool {
        self.state.dispatching
    }

    /// Stop starting new batches. A batch already in flight still completes.
    pub fn destroy(&mut self) {
        self.destroyed = true;
    }

    /// Accept a batch from the write side.
    ///
    /// Dispatches at once when nothing is in flight and the read side has
    /// shown demand or has room; otherwise the batch waits for `read`.
    pub fn ingest<H>(&mut self, batch: Batch<T>, done: D, host: &mut H) -> Result<(), ThroughvError>
    where
        H: DuplexHost<T, U, BatchDone = D>,
    {
        if self.state.has_pending() {
            return Err(ProtocolViolation::BatchAlreadyPending.into());
        }
        trace!(entries = batch.len(), "batch ingested");
        self.state.pending_batch = Some(batch);
        self.state.batch_done = Some(done);

        if !self.state.dispatching
            && (self.state.demand_pending
                || host.needs_readable()
                || host.readable_len() < host.high_water_mark())
        {
            self.read(host.high_water_mark(), host);
        }
        Ok(())
    }

    /// Read demand from the output side. `_size` is informational: a batch is
    /// always processed whole.
    pub fn read<H>(&mut self, _size: usize, host: &mut H)
    where
        H: DuplexHost<T, U, BatchDone = D>,
    {
        if self.destroyed {
            return;
        }
        if self.state.ready_to_dispatch() {
            if let Some(batch) = self.state.pending_batch.take() {
                debug!(entries = batch.len(), "dispatching batch");
                self.state.dispatching = true;
                self.state.demand_pending = false;
                host.dispatch(dispatch_batch(batch, &self.transform));
                return;
            }
        }
        // Remember the demand so the next batch goes out without waiting. A
        // pending batch already answers it.
        if !self.state.has_pending() {
            self.state.demand_pending = true;
        }
    }

    /// Completion handler of a dispatched batch.
    pub fn after_transform<H>(&mut self, outcome: BatchOutcome<U>, host: &mut H) -> Result<(), ThroughvError>
    where
        H: DuplexHost<T, U, BatchDone = D>,
    {
        self.state.dispatching = false;
        let done = self
            .state
            .batch_done
            .take()
            .ok_or(ProtocolViolation::NoPendingBatch)?;
        self.state.pending_batch = None;

        let BatchOutcome { error, results } = outcome;
        debug!(
            entries = results.len(),
            failed = error.is_some(),
            "reassembling batch"
        );
        for value in results.into_iter().flatten() {
            host.push(value);
        }

        let result = match error {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if let Some((next, next_done)) = host.resolve_batch(done, result) {
            self.ingest(next, next_done, host)?;
        }

        host.set_reading(false);
        if host.needs_readable() || host.readable_len() < host.high_water_mark() {
            self.read(host.high_water_mark(), host);
        }
        Ok(())
    }

    /// The user flush step, or an immediately successful one.
    pub fn flush(&self) -> BoxFuture<'static, Result<(), ThroughvError>> {
        match &self.flush {
            Some(flush) => flush().map(|r| r.map_err(ThroughvError::flush)).boxed(),
            None => futures::future::ready(Ok(())).boxed(),
        }
    }

    /// Close the read side once the write side is finished and `flush` settled.
    pub fn finish<H>(&mut self, flushed: Result<(), ThroughvError>, host: &mut H) -> Result<(), ThroughvError>
    where
        H: DuplexHost<T, U, BatchDone = D>,
    {
        flushed?;
        let buffered = host.writable_len();
        if buffered != 0 {
            return Err(ProtocolViolation::FlushWithBufferedWrites(buffered).into());
        }
        if self.state.dispatching {
            return Err(ProtocolViolation::FlushWhileDispatching.into());
        }
        host.push_eof();
        Ok(())
    }
}

impl<T, D> BulkTransform<T, T, D>
where
    T: Send + 'static,
{
    /// Pass-through transform used when no transform function is supplied.
    pub fn passthrough(flush: Option<FlushFn>) -> Self {
        Self::new(identity(), flush)
    }
}
