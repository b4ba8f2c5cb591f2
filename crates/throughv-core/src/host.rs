//! `DuplexHost` — the capability interface a duplex stream offers the batch
//! pipeline.
//!
//! The host owns the write-side and read-side buffers. The pipeline never
//! touches them directly; it only calls the operations below.

use crate::batch::Batch;
use crate::dispatch::Dispatch;
use crate::error::ThroughvError;

/// Buffering primitive the batch pipeline runs on top of.
///
/// A host must:
/// 1. coalesce consecutive writes into one batch while a batch is pending,
/// 2. never hand over a second batch before the current token is resolved,
/// 3. call `BulkTransform::read` whenever its read side wants more data,
/// 4. report "write side finished and drained" exactly once.
pub trait DuplexHost<T, U> {
    /// Completion token for one ingested batch, resolved once it is reassembled.
    type BatchDone;

    /// Append a result to the read side. Returns `false` once the read buffer
    /// has reached its high-water mark.
    fn push(&mut self, item: U) -> bool;

    /// Signal that no more results will ever be pushed.
    fn push_eof(&mut self);

    /// Current read-buffer length (entries in object mode, bytes otherwise).
    fn readable_len(&self) -> usize;

    /// Read-buffer capacity threshold.
    fn high_water_mark(&self) -> usize;

    /// `true` when a consumer is waiting on an empty read buffer.
    fn needs_readable(&self) -> bool;

    fn set_reading(&mut self, reading: bool);

    /// Write-side length not yet acknowledged: buffered writes plus the
    /// batch currently handed over.
    fn writable_len(&self) -> usize;

    /// Take ownership of an in-flight batch. The host polls it and hands the
    /// outcome back to `BulkTransform::after_transform`.
    fn dispatch(&mut self, dispatch: Dispatch<U>);

    /// Resolve a batch's token. Returns the next coalesced batch, if the
    /// write side has one ready, so it can be ingested right away.
    fn resolve_batch(
        &mut self,
        done: Self::BatchDone,
        result: Result<(), ThroughvError>,
    ) -> Option<(Batch<T>, Self::BatchDone)>;
}
