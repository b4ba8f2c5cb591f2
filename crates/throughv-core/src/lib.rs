//! # throughv-core
//!
//! Batching core shared by throughv streams.
//!
//! Every chunk buffered on a duplex stream's write side is handed over as one
//! batch. All transforms of the batch run concurrently; their results are
//! pushed to the read side only once the whole batch has settled, and always
//! in write order. At most one batch is in flight per stream.
//!
//! The core is independent of any runtime. It talks to its stream through
//! the [`DuplexHost`] trait; `throughv-stream` provides the Tokio host.

pub mod batch;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod options;
pub mod parallel;
pub mod state;
pub mod transform;

pub use batch::{Batch, BatchOutcome, Entry, Metadata};
pub use dispatch::{
    dispatch_batch, flush_fn, identity, transform_fn, Dispatch, FlushFn, FlushFuture,
    TransformFn, TransformFuture,
};
pub use error::{BoxError, ProtocolViolation, SharedError, ThroughvError};
pub use host::DuplexHost;
pub use options::ThroughvOptions;
pub use parallel::{settle_all, Settled};
pub use state::TransformState;
pub use transform::BulkTransform;
