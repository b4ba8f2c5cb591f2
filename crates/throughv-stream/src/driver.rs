//! Background task that owns one stream's buffers and batch pipeline.
//!
//! Handles never touch the buffers. They send commands; the driver applies
//! them one at a time and polls the in-flight batch and the flush step.

use std::future::Future;

use futures::future::BoxFuture;
use throughv_core::{BatchOutcome, BulkTransform, DuplexHost, Entry, ThroughvError};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::duplex::{BatchDone, Duplex, ReadWaiter, WriteAck};

/// Command sent from the write handle to the driver.
pub(crate) enum Command<T> {
    Write {
        entry: Entry<T>,
        len: usize,
        ack: Option<WriteAck>,
    },
    Cork,
    Uncork,
    End {
        ack: WriteAck,
    },
    Destroy {
        error: Option<ThroughvError>,
    },
}

pub(crate) struct Driver<T, U> {
    duplex: Duplex<T, U>,
    bulk: BulkTransform<T, U, BatchDone>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
    reads: mpsc::UnboundedReceiver<ReadWaiter<U>>,
    flushing: Option<BoxFuture<'static, Result<(), ThroughvError>>>,
    commands_open: bool,
    reads_open: bool,
}

impl<T, U> Driver<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub(crate) fn new(
        duplex: Duplex<T, U>,
        bulk: BulkTransform<T, U, BatchDone>,
        commands: mpsc::UnboundedReceiver<Command<T>>,
        reads: mpsc::UnboundedReceiver<ReadWaiter<U>>,
    ) -> Self {
        Self {
            duplex,
            bulk,
            commands,
            reads,
            flushing: None,
            commands_open: true,
            reads_open: true,
        }
    }

    /// Runs until every handle is dropped and nothing is left in flight.
    pub(crate) async fn run(mut self) {
        debug!("stream driver started");
        loop {
            if !self.commands_open
                && !self.reads_open
                && self.duplex.in_flight.is_none()
                && self.flushing.is_none()
            {
                break;
            }

            // Queued commands go first so writes sent before a batch settles
            // coalesce into the next batch.
            tokio::select! {
                biased;
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => self.commands_open = false,
                },
                waiter = self.reads.recv(), if self.reads_open => match waiter {
                    Some(waiter) => self.on_read(waiter),
                    None => self.reads_open = false,
                },
                outcome = settle(&mut self.duplex.in_flight) => self.on_settled(outcome),
                flushed = settle(&mut self.flushing) => self.on_flushed(flushed),
            }

            self.advance();
        }
        debug!("stream driver stopped");
    }

    fn on_command(&mut self, cmd: Command<T>) {
        match cmd {
            Command::Write { entry, len, ack } => {
                if let Some((batch, done)) = self.duplex.write(entry, len, ack) {
                    self.ingest(batch, done);
                }
            }
            Command::Cork => self.duplex.cork(),
            Command::Uncork => {
                if let Some((batch, done)) = self.duplex.uncork() {
                    self.ingest(batch, done);
                }
            }
            Command::End { ack } => {
                if let Some((batch, done)) = self.duplex.end(ack) {
                    self.ingest(batch, done);
                }
            }
            Command::Destroy { error } => {
                self.bulk.destroy();
                self.duplex.destroy(error);
            }
        }
    }

    fn on_read(&mut self, waiter: ReadWaiter<U>) {
        if self.duplex.read(waiter) {
            self.duplex.set_reading(true);
            let size = self.duplex.high_water_mark();
            self.bulk.read(size, &mut self.duplex);
        }
    }

    fn ingest(&mut self, batch: throughv_core::Batch<T>, done: BatchDone) {
        if let Err(e) = self.bulk.ingest(batch, done, &mut self.duplex) {
            self.fatal(e);
        }
    }

    fn on_settled(&mut self, outcome: BatchOutcome<U>) {
        self.duplex.metrics().record_batch(
            outcome.results.len(),
            outcome.produced(),
            outcome.error.is_some(),
        );
        if let Err(e) = self.bulk.after_transform(outcome, &mut self.duplex) {
            self.fatal(e);
        }
    }

    fn on_flushed(&mut self, flushed: Result<(), ThroughvError>) {
        if self.duplex.is_torn_down() {
            debug!("flush settled after teardown, ignoring");
            return;
        }
        match self.bulk.finish(flushed, &mut self.duplex) {
            Ok(()) => self.duplex.finish(),
            Err(e) => self.fatal(e),
        }
    }

    fn fatal(&mut self, e: ThroughvError) {
        if e.is_protocol_violation() {
            error!(error = %e, "batch protocol violated, tearing down stream");
            self.bulk.destroy();
        } else {
            warn!(error = %e, "stream errored");
        }
        self.duplex.fail(e);
    }

    /// Lifecycle steps that follow any state change.
    fn advance(&mut self) {
        if self.duplex.ready_to_finish() {
            self.duplex.prefinish();
            self.flushing = Some(self.bulk.flush());
        }
        self.duplex.settle_waiters();
        if self.duplex.should_close() {
            self.duplex.close();
        }
    }
}

/// Await the future in `slot` and clear it; pend forever while it is empty.
async fn settle<F>(slot: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match slot.as_mut() {
        Some(fut) => {
            let out = fut.await;
            *slot = None;
            out
        }
        None => std::future::pending().await,
    }
}
