//! Tokio-side duplex buffers: the [`DuplexHost`] the batch pipeline runs on.
//!
//! The write side coalesces every write that arrives while a batch is in
//! flight (or while corked) into the next batch. The read side buffers
//! results until the `Reader` asks for them and parks the reader when the
//! buffer is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use throughv_core::{Batch, Dispatch, DuplexHost, Entry, ThroughvError, ThroughvOptions};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, trace, warn};

use crate::events::{StreamEvent, EVENT_CHANNEL_CAPACITY};
use crate::metrics::MetricsRecorder;

/// Acknowledgement for a single write or for `end`.
pub(crate) type WriteAck = oneshot::Sender<Result<(), ThroughvError>>;

/// What the driver hands back to one `Reader` poll.
#[derive(Debug)]
pub(crate) enum ReadReply<U> {
    Item(U),
    Error(ThroughvError),
    End,
}

pub(crate) type ReadWaiter<U> = oneshot::Sender<ReadReply<U>>;

/// State visible to both the handles and the driver task.
pub(crate) struct Shared {
    pub(crate) high_water_mark: usize,
    pub(crate) object_mode: bool,
    /// Length written but not yet acknowledged (buffered + in flight).
    pub(crate) writable_len: AtomicUsize,
    need_drain: AtomicBool,
    drained: Notify,
    pub(crate) destroyed: AtomicBool,
    pub(crate) closed: AtomicBool,
    events: broadcast::Sender<StreamEvent>,
    pub(crate) metrics: MetricsRecorder,
}

impl Shared {
    pub(crate) fn new(options: &ThroughvOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            high_water_mark: options.effective_high_water_mark(),
            object_mode: options.object_mode,
            writable_len: AtomicUsize::new(0),
            need_drain: AtomicBool::new(false),
            drained: Notify::new(),
            destroyed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            metrics: MetricsRecorder::default(),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        trace!(event = %event, "emitting stream event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Account a new write. Returns `true` while the write side is below its
    /// high-water mark.
    pub(crate) fn reserve(&self, len: usize) -> bool {
        let total = self.writable_len.fetch_add(len, Ordering::SeqCst) + len;
        if total < self.high_water_mark {
            return true;
        }
        self.need_drain.store(true, Ordering::SeqCst);
        // The driver may have released everything before the flag was set.
        self.maybe_drain();
        false
    }

    /// Give back write-side length once writes are acknowledged or rejected.
    pub(crate) fn release(&self, len: usize) {
        if len == 0 {
            return;
        }
        self.writable_len.fetch_sub(len, Ordering::SeqCst);
        self.maybe_drain();
    }

    fn maybe_drain(&self) {
        if self.writable_len.load(Ordering::SeqCst) == 0 && self.need_drain.swap(false, Ordering::SeqCst) {
            self.emit(StreamEvent::Drain);
            self.drained.notify_waiters();
        }
    }

    /// Resolves once the write side is empty or the stream is closed.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.writable_len.load(Ordering::SeqCst) == 0 || self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(StreamEvent::Close);
        self.drained.notify_waiters();
    }
}

/// Completion token for one batch: the write acks of its entries.
pub(crate) struct BatchDone {
    acks: Vec<Option<WriteAck>>,
    len: usize,
}

/// Write and read buffers of one stream. Owned by the driver task.
pub(crate) struct Duplex<T, U> {
    shared: Arc<Shared>,
    measure: fn(&U) -> usize,

    buffered: Batch<T>,
    buffered_acks: Vec<Option<WriteAck>>,
    buffered_len: usize,
    writing: bool,
    writing_len: usize,
    corked: usize,
    ending: bool,
    prefinished: bool,
    finished: bool,
    end_acks: Vec<WriteAck>,

    readable: VecDeque<ReadReply<U>>,
    readable_len: usize,
    reading: bool,
    need_readable: bool,
    eof: bool,
    end_emitted: bool,
    waiters: VecDeque<ReadWaiter<U>>,

    /// The batch currently dispatched, polled by the driver.
    pub(crate) in_flight: Option<Dispatch<U>>,
    errored: Option<ThroughvError>,
    destroyed: bool,
    closed: bool,
}

impl<T, U> Duplex<T, U> {
    pub(crate) fn new(shared: Arc<Shared>, measure: fn(&U) -> usize) -> Self {
        Self {
            shared,
            measure,
            buffered: Vec::new(),
            buffered_acks: Vec::new(),
            buffered_len: 0,
            writing: false,
            writing_len: 0,
            corked: 0,
            ending: false,
            prefinished: false,
            finished: false,
            end_acks: Vec::new(),
            readable: VecDeque::new(),
            readable_len: 0,
            reading: false,
            need_readable: true,
            eof: false,
            end_emitted: false,
            waiters: VecDeque::new(),
            in_flight: None,
            errored: None,
            destroyed: false,
            closed: false,
        }
    }

    pub(crate) fn metrics(&self) -> &MetricsRecorder {
        &self.shared.metrics
    }

    // ── write side ────────────────────────────────────────────────────────

    /// Buffer one write. Returns a batch when the write side is idle.
    pub(crate) fn write(
        &mut self,
        entry: Entry<T>,
        len: usize,
        ack: Option<WriteAck>,
    ) -> Option<(Batch<T>, BatchDone)> {
        let rejection = if self.destroyed {
            Some(ThroughvError::Closed)
        } else if let Some(e) = &self.errored {
            Some(e.clone())
        } else if self.ending {
            warn!("write after end");
            self.shared.emit(StreamEvent::Error(ThroughvError::WriteAfterEnd));
            Some(ThroughvError::WriteAfterEnd)
        } else {
            None
        };
        if let Some(err) = rejection {
            if let Some(ack) = ack {
                let _ = ack.send(Err(err));
            }
            self.shared.release(len);
            return None;
        }

        self.buffered.push(entry);
        self.buffered_acks.push(ack);
        self.buffered_len += len;
        self.take_batch()
    }

    pub(crate) fn cork(&mut self) {
        self.corked += 1;
    }

    pub(crate) fn uncork(&mut self) -> Option<(Batch<T>, BatchDone)> {
        self.corked = self.corked.saturating_sub(1);
        self.take_batch()
    }

    /// Mark the write side as ending. Buffered writes are released at once.
    pub(crate) fn end(&mut self, ack: WriteAck) -> Option<(Batch<T>, BatchDone)> {
        if let Some(e) = &self.errored {
            let _ = ack.send(Err(e.clone()));
            return None;
        }
        if self.destroyed {
            let _ = ack.send(Err(ThroughvError::Closed));
            return None;
        }
        if self.finished {
            let _ = ack.send(Ok(()));
            return None;
        }
        if !self.ending {
            debug!(buffered = self.buffered.len(), "ending write side");
        }
        self.ending = true;
        self.end_acks.push(ack);
        self.corked = 0;
        self.take_batch()
    }

    fn take_batch(&mut self) -> Option<(Batch<T>, BatchDone)> {
        if self.writing
            || self.corked > 0
            || self.buffered.is_empty()
            || self.destroyed
            || self.errored.is_some()
        {
            return None;
        }
        self.writing = true;
        self.writing_len = std::mem::take(&mut self.buffered_len);
        let batch = std::mem::take(&mut self.buffered);
        let acks = std::mem::take(&mut self.buffered_acks);
        Some((
            batch,
            BatchDone {
                acks,
                len: self.writing_len,
            },
        ))
    }

    fn reject_buffered(&mut self, error: &ThroughvError) {
        self.buffered.clear();
        for ack in self.buffered_acks.drain(..).flatten() {
            let _ = ack.send(Err(error.clone()));
        }
        let len = std::mem::take(&mut self.buffered_len);
        self.shared.release(len);
    }

    /// End requested, nothing buffered or in flight, and not yet prefinished.
    pub(crate) fn ready_to_finish(&self) -> bool {
        self.ending
            && !self.prefinished
            && !self.writing
            && self.buffered.is_empty()
            && self.errored.is_none()
            && !self.destroyed
    }

    pub(crate) fn prefinish(&mut self) {
        debug!("write side drained, flushing");
        self.prefinished = true;
    }

    /// Destroyed or errored.
    pub(crate) fn is_torn_down(&self) -> bool {
        self.destroyed || self.errored.is_some()
    }

    /// Flush succeeded and end-of-output was pushed.
    pub(crate) fn finish(&mut self) {
        if self.is_torn_down() {
            return;
        }
        self.finished = true;
        self.shared.emit(StreamEvent::Finish);
        for ack in self.end_acks.drain(..) {
            let _ = ack.send(Ok(()));
        }
    }

    // ── read side ─────────────────────────────────────────────────────────

    fn reply_len(&self, reply: &ReadReply<U>) -> usize {
        match reply {
            ReadReply::Item(value) => (self.measure)(value),
            _ => 0,
        }
    }

    /// Hand the next result to a waiting reader, or buffer it.
    fn enqueue(&mut self, reply: ReadReply<U>) {
        let mut reply = reply;
        if self.readable.is_empty() {
            while let Some(waiter) = self.waiters.pop_front() {
                match waiter.send(reply) {
                    Ok(()) => {
                        self.need_readable = !self.waiters.is_empty();
                        return;
                    }
                    // Reader went away mid-poll.
                    Err(returned) => reply = returned,
                }
            }
        }
        self.need_readable = false;
        self.readable_len += self.reply_len(&reply);
        self.readable.push_back(reply);
    }

    /// Serve one `Reader` poll. Returns `true` when the pipeline should be
    /// asked for more data.
    pub(crate) fn read(&mut self, waiter: ReadWaiter<U>) -> bool {
        match self.readable.pop_front() {
            Some(reply) => {
                let len = self.reply_len(&reply);
                self.readable_len -= len;
                if let Err(reply) = waiter.send(reply) {
                    self.readable_len += len;
                    self.readable.push_front(reply);
                }
            }
            None if self.eof => {
                let _ = waiter.send(ReadReply::End);
            }
            None => {
                self.need_readable = true;
                self.waiters.push_back(waiter);
            }
        }
        self.settle_waiters();

        !self.eof
            && !self.reading
            && !self.destroyed
            && (self.readable.is_empty() || self.readable_len < self.shared.high_water_mark)
    }

    /// Release parked readers and emit `End` once every result is consumed.
    pub(crate) fn settle_waiters(&mut self) {
        if !self.eof || !self.readable.is_empty() {
            return;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(ReadReply::End);
        }
        if !self.end_emitted && self.errored.is_none() && !self.destroyed {
            self.end_emitted = true;
            debug!("read side ended");
            self.shared.emit(StreamEvent::End);
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    /// Enter the errored state: fail buffered writes and pending `end`s, and
    /// queue the error behind the results already pushed.
    pub(crate) fn fail(&mut self, error: ThroughvError) {
        if self.errored.is_some() || self.destroyed {
            return;
        }
        self.errored = Some(error.clone());
        self.shared.emit(StreamEvent::Error(error.clone()));
        self.reject_buffered(&error);
        for ack in self.end_acks.drain(..) {
            let _ = ack.send(Err(error.clone()));
        }
        self.enqueue(ReadReply::Error(error));
        self.eof = true;
    }

    pub(crate) fn destroy(&mut self, error: Option<ThroughvError>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if self.closed {
            if let Some(e) = error {
                warn!(error = %e, "destroy error dropped, stream already closed");
            }
            return;
        }
        info!(with_error = error.is_some(), "destroying stream");
        if let Some(e) = &error {
            self.shared.emit(StreamEvent::Error(e.clone()));
        }
        let cause = error.clone().unwrap_or(ThroughvError::Closed);
        self.reject_buffered(&cause);
        for ack in self.end_acks.drain(..) {
            let _ = ack.send(Err(cause.clone()));
        }
        self.readable.clear();
        self.readable_len = 0;
        if let Some(e) = error {
            self.enqueue(ReadReply::Error(e));
        }
        self.eof = true;
    }

    pub(crate) fn should_close(&self) -> bool {
        !self.closed
            && (self.destroyed
                || (self.errored.is_some() && self.in_flight.is_none())
                || (self.finished && self.end_emitted))
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        info!("stream closed");
        self.shared.mark_closed();
    }
}

impl<T, U> DuplexHost<T, U> for Duplex<T, U> {
    type BatchDone = BatchDone;

    fn push(&mut self, item: U) -> bool {
        if self.destroyed || self.errored.is_some() || self.eof {
            trace!("discarding result pushed after teardown");
            return false;
        }
        self.shared.metrics.record_push();
        self.enqueue(ReadReply::Item(item));
        self.readable_len < self.shared.high_water_mark
    }

    fn push_eof(&mut self) {
        self.eof = true;
    }

    fn readable_len(&self) -> usize {
        self.readable_len
    }

    fn high_water_mark(&self) -> usize {
        self.shared.high_water_mark
    }

    fn needs_readable(&self) -> bool {
        self.need_readable
    }

    fn set_reading(&mut self, reading: bool) {
        self.reading = reading;
    }

    fn writable_len(&self) -> usize {
        self.buffered_len + self.writing_len
    }

    fn dispatch(&mut self, dispatch: Dispatch<U>) {
        self.in_flight = Some(dispatch);
    }

    fn resolve_batch(
        &mut self,
        done: BatchDone,
        result: Result<(), ThroughvError>,
    ) -> Option<(Batch<T>, BatchDone)> {
        self.writing = false;
        self.writing_len = 0;
        let result = if self.destroyed {
            Err(ThroughvError::Closed)
        } else {
            result
        };
        for ack in done.acks.into_iter().flatten() {
            let _ = ack.send(result.clone());
        }
        self.shared.release(done.len);

        if let Err(e) = result {
            self.fail(e);
            return None;
        }
        self.take_batch()
    }
}
