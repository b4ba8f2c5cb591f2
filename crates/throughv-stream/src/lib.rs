//! # throughv-stream
//!
//! Tokio duplex streams built on the `throughv-core` batch pipeline.
//!
//! Every write buffered while a batch is in flight joins the next batch. A
//! batch's transforms all run concurrently, and its results reach the
//! `Reader` in write order once the whole batch has settled.
//!
//! ## Architecture
//! ```text
//! Writer (clone per producer)            Reader (futures::Stream)
//!       │ Command::{Write, Cork, End, Destroy}    ▲ ReadReply per poll
//!       ▼                                         │
//! Driver task ── owns ──► Duplex (DuplexHost) ────┘
//!       │                     ▲
//!       ▼                     │ push / resolve_batch
//! BulkTransform ── dispatch_batch ──► in-flight batch (polled by the driver)
//!       │
//!       ▼
//! broadcast::Sender<StreamEvent>   ← Drain / Finish / End / Error / Close
//! ```

mod driver;
mod duplex;
pub mod events;
pub mod metrics;
pub mod pipe;
pub mod stream;

pub use events::StreamEvent;
pub use metrics::ThroughvMetrics;
pub use pipe::{feed, pipeline};
pub use stream::{Reader, Throughv, ThroughvBuilder, Writer};
pub use throughv_core::{BoxError, Metadata, ThroughvError, ThroughvOptions};
