//! Public handles: [`Throughv`], its [`Writer`] and [`Reader`] halves, and
//! the [`ThroughvBuilder`] that spawns them.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use throughv_core::{
    flush_fn, identity, transform_fn, BoxError, BulkTransform, Entry, FlushFn, Metadata,
    ThroughvError, ThroughvOptions, TransformFn,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::driver::{Command, Driver};
use crate::duplex::{Duplex, ReadReply, ReadWaiter, Shared};
use crate::events::StreamEvent;
use crate::metrics::ThroughvMetrics;

fn count_one<X>(_: &X) -> usize {
    1
}

fn byte_len<X: AsRef<[u8]>>(chunk: &X) -> usize {
    chunk.as_ref().len()
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Configures and spawns a [`Throughv`] stream.
///
/// ```ignore
/// let doubler = ThroughvBuilder::object(|n: u64, _meta| async move {
///     Ok::<_, BoxError>(Some(n * 2))
/// })
/// .high_water_mark(4)
/// .build();
/// ```
pub struct ThroughvBuilder<T, U> {
    options: ThroughvOptions,
    measure_in: fn(&T) -> usize,
    measure_out: fn(&U) -> usize,
    transform: TransformFn<T, U>,
    flush: Option<FlushFn>,
}

impl<T, U> ThroughvBuilder<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Object-mode stream: every entry counts as one toward the high-water marks.
    pub fn object<F, Fut, E>(transform: F) -> Self
    where
        F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            options: ThroughvOptions::object(),
            measure_in: count_one::<T>,
            measure_out: count_one::<U>,
            transform: transform_fn(transform),
            flush: None,
        }
    }

    pub fn high_water_mark(mut self, n: usize) -> Self {
        self.options.high_water_mark = Some(n);
        self
    }

    /// Replace the per-entry transform.
    pub fn transform_fn(mut self, transform: TransformFn<T, U>) -> Self {
        self.transform = transform;
        self
    }

    /// Run `f` once after the last batch, before end-of-output.
    pub fn flush<F, Fut, E>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.flush_fn(flush_fn(f))
    }

    pub fn flush_fn(mut self, flush: FlushFn) -> Self {
        self.flush = Some(flush);
        self
    }

    /// Spawn the stream's driver task.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn build(self) -> Throughv<T, U> {
        let shared = Arc::new(Shared::new(&self.options));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let duplex = Duplex::new(shared.clone(), self.measure_out);
        let bulk = BulkTransform::new(self.transform, self.flush);

        info!(
            object_mode = shared.object_mode,
            high_water_mark = shared.high_water_mark,
            "starting throughv stream"
        );
        tokio::spawn(Driver::new(duplex, bulk, cmd_rx, read_rx).run());

        Throughv {
            writer: Writer {
                commands: cmd_tx,
                shared: shared.clone(),
                measure: self.measure_in,
            },
            reader: Reader {
                reads: read_tx,
                pending: None,
                done: false,
                shared,
            },
        }
    }
}

impl<T, U> ThroughvBuilder<T, U>
where
    T: AsRef<[u8]> + Send + 'static,
    U: AsRef<[u8]> + Send + 'static,
{
    /// Byte payloads. Lengths are counted in bytes unless `options.object_mode`.
    pub fn with_options<F, Fut, E>(options: ThroughvOptions, transform: F) -> Self
    where
        F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let object_mode = options.object_mode;
        Self {
            options,
            measure_in: if object_mode { count_one::<T> } else { byte_len::<T> },
            measure_out: if object_mode { count_one::<U> } else { byte_len::<U> },
            transform: transform_fn(transform),
            flush: None,
        }
    }
}

impl<T> ThroughvBuilder<T, T>
where
    T: Send + 'static,
{
    /// Object-mode stream without a transform: output equals input.
    pub fn object_passthrough() -> Self {
        Self {
            options: ThroughvOptions::object(),
            measure_in: count_one::<T>,
            measure_out: count_one::<T>,
            transform: identity(),
            flush: None,
        }
    }
}

impl<T> ThroughvBuilder<T, T>
where
    T: AsRef<[u8]> + Send + 'static,
{
    /// Byte stream without a transform: output equals input.
    pub fn passthrough(options: ThroughvOptions) -> Self {
        let measure = if options.object_mode { count_one::<T> } else { byte_len::<T> };
        Self {
            options,
            measure_in: measure,
            measure_out: measure,
            transform: identity(),
            flush: None,
        }
    }
}

// ─── Writer ──────────────────────────────────────────────────────────────────

/// Write half of a stream. Cheap to clone.
pub struct Writer<T> {
    commands: mpsc::UnboundedSender<Command<T>>,
    shared: Arc<Shared>,
    measure: fn(&T) -> usize,
}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shared: self.shared.clone(),
            measure: self.measure,
        }
    }
}

impl<T> Writer<T> {
    fn default_metadata(&self) -> Metadata {
        if self.shared.object_mode {
            Metadata::default()
        } else {
            Metadata::buffer()
        }
    }

    /// Buffer `payload` for the next batch.
    ///
    /// Returns `false` once the writable length reaches the high-water mark;
    /// the write is still accepted, but the caller should wait for
    /// [`drained`](Self::drained) before writing more.
    pub fn write(&self, payload: T) -> bool {
        let metadata = self.default_metadata();
        self.write_with(payload, metadata, None)
    }

    /// Like [`write`](Self::write) with explicit metadata and an optional
    /// acknowledgement, resolved when the containing batch is reassembled.
    pub fn write_with(
        &self,
        payload: T,
        metadata: Metadata,
        ack: Option<oneshot::Sender<Result<(), ThroughvError>>>,
    ) -> bool {
        let len = (self.measure)(&payload);
        let below = self.shared.reserve(len);
        let cmd = Command::Write {
            entry: Entry::new(payload, metadata),
            len,
            ack,
        };
        if let Err(mpsc::error::SendError(cmd)) = self.commands.send(cmd) {
            self.shared.release(len);
            if let Command::Write { ack: Some(ack), .. } = cmd {
                let _ = ack.send(Err(ThroughvError::Closed));
            }
            return false;
        }
        below
    }

    /// Write and wait until the containing batch is reassembled.
    pub async fn send(&self, payload: T) -> Result<(), ThroughvError> {
        let (tx, rx) = oneshot::channel();
        let metadata = self.default_metadata();
        self.write_with(payload, metadata, Some(tx));
        rx.await.map_err(|_| ThroughvError::Closed)?
    }

    /// Hold writes in the buffer until a matching [`uncork`](Self::uncork).
    pub fn cork(&self) {
        let _ = self.commands.send(Command::Cork);
    }

    pub fn uncork(&self) {
        let _ = self.commands.send(Command::Uncork);
    }

    /// End the write side. Resolves once the last batch is reassembled and
    /// flush succeeded.
    pub async fn end(&self) -> Result<(), ThroughvError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::End { ack: tx })
            .map_err(|_| ThroughvError::Closed)?;
        rx.await.map_err(|_| ThroughvError::Closed)?
    }

    /// Write a final payload, then [`end`](Self::end).
    pub async fn end_with(&self, payload: T) -> Result<(), ThroughvError> {
        self.write(payload);
        self.end().await
    }

    /// Tear the stream down. Only the first call has any effect; `Error`
    /// (when `error` is given) and `Close` are emitted asynchronously.
    pub fn destroy(&self, error: Option<ThroughvError>) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            debug!("stream already destroyed");
            return;
        }
        let _ = self.commands.send(Command::Destroy { error });
    }

    pub fn destroy_with(&self, error: impl Into<BoxError>) {
        self.destroy(Some(ThroughvError::destroyed(error)));
    }

    /// Resolves when every write so far is acknowledged, or the stream closed.
    pub async fn drained(&self) {
        self.shared.drained().await
    }

    /// Length written but not yet acknowledged.
    pub fn writable_len(&self) -> usize {
        self.shared.writable_len.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water_mark
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.subscribe()
    }

    pub fn metrics(&self) -> ThroughvMetrics {
        self.shared.metrics.snapshot()
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read half of a stream.
///
/// Each poll is a read-demand signal. Yields every pushed result in write
/// order; after an error it yields the error once and then ends.
pub struct Reader<U> {
    reads: mpsc::UnboundedSender<ReadWaiter<U>>,
    pending: Option<oneshot::Receiver<ReadReply<U>>>,
    done: bool,
    shared: Arc<Shared>,
}

impl<U> Reader<U> {
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.subscribe()
    }

    pub fn metrics(&self) -> ThroughvMetrics {
        self.shared.metrics.snapshot()
    }
}

impl<U> Stream for Reader<U> {
    type Item = Result<U, ThroughvError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let rx = match &mut this.pending {
            Some(rx) => rx,
            None => {
                let (tx, rx) = oneshot::channel();
                if this.reads.send(tx).is_err() {
                    this.done = true;
                    return Poll::Ready(None);
                }
                this.pending.insert(rx)
            }
        };

        let reply = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(reply) => reply,
        };
        this.pending = None;
        match reply {
            Ok(ReadReply::Item(value)) => Poll::Ready(Some(Ok(value))),
            Ok(ReadReply::Error(e)) => Poll::Ready(Some(Err(e))),
            Ok(ReadReply::End) | Err(_) => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

// ─── Throughv ────────────────────────────────────────────────────────────────

/// A batching parallel transform stream.
///
/// Writes go in through the [`Writer`] half; results come out of the
/// [`Reader`] half, which `Throughv` also implements as a [`Stream`].
pub struct Throughv<T, U> {
    writer: Writer<T>,
    reader: Reader<U>,
}

impl<T, U> Throughv<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Object-mode stream with default options.
    pub fn obj<F, Fut, E>(transform: F) -> Self
    where
        F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        ThroughvBuilder::object(transform).build()
    }

    pub fn obj_with_flush<F, Fut, E, G, GFut, GE>(transform: F, flush: G) -> Self
    where
        F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
        G: Fn() -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<(), GE>> + Send + 'static,
        GE: Into<BoxError> + 'static,
    {
        ThroughvBuilder::object(transform).flush(flush).build()
    }
}

impl<T, U> Throughv<T, U>
where
    T: AsRef<[u8]> + Send + 'static,
    U: AsRef<[u8]> + Send + 'static,
{
    /// Byte stream with default options.
    pub fn bytes<F, Fut, E>(transform: F) -> Self
    where
        F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        ThroughvBuilder::with_options(ThroughvOptions::default(), transform).build()
    }
}

impl<T: Send + 'static> Throughv<T, T> {
    pub fn obj_passthrough() -> Self {
        ThroughvBuilder::object_passthrough().build()
    }
}

impl<T: AsRef<[u8]> + Send + 'static> Throughv<T, T> {
    pub fn passthrough(options: ThroughvOptions) -> Self {
        ThroughvBuilder::passthrough(options).build()
    }
}

impl<T, U> Throughv<T, U> {
    /// Separate the halves, e.g. to write and read from different tasks.
    pub fn split(self) -> (Writer<T>, Reader<U>) {
        (self.writer, self.reader)
    }

    pub fn writer(&self) -> &Writer<T> {
        &self.writer
    }

    pub fn write(&self, payload: T) -> bool {
        self.writer.write(payload)
    }

    pub fn write_with(
        &self,
        payload: T,
        metadata: Metadata,
        ack: Option<oneshot::Sender<Result<(), ThroughvError>>>,
    ) -> bool {
        self.writer.write_with(payload, metadata, ack)
    }

    pub async fn send(&self, payload: T) -> Result<(), ThroughvError> {
        self.writer.send(payload).await
    }

    pub fn cork(&self) {
        self.writer.cork()
    }

    pub fn uncork(&self) {
        self.writer.uncork()
    }

    pub async fn end(&self) -> Result<(), ThroughvError> {
        self.writer.end().await
    }

    pub async fn end_with(&self, payload: T) -> Result<(), ThroughvError> {
        self.writer.end_with(payload).await
    }

    pub fn destroy(&self, error: Option<ThroughvError>) {
        self.writer.destroy(error)
    }

    pub fn destroy_with(&self, error: impl Into<BoxError>) {
        self.writer.destroy_with(error)
    }

    pub async fn drained(&self) {
        self.writer.drained().await
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.writer.events()
    }

    pub fn metrics(&self) -> ThroughvMetrics {
        self.writer.metrics()
    }
}

impl<T, U> Stream for Throughv<T, U> {
    type Item = Result<U, ThroughvError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().reader).poll_next(cx)
    }
}
