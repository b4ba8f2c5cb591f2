//! Connecting streams: feed a source in, drain results out.

use futures::{pin_mut, Sink, SinkExt, Stream, StreamExt};
use throughv_core::{BoxError, ThroughvError};
use tracing::debug;

use crate::stream::{Reader, Throughv, Writer};

/// Write every item of `source`, waiting for drain whenever a write reports
/// backpressure, then end the write side.
pub async fn feed<T, S>(writer: &Writer<T>, source: S) -> Result<(), ThroughvError>
where
    S: Stream<Item = T>,
{
    pin_mut!(source);
    let mut written = 0usize;
    while let Some(item) = source.next().await {
        written += 1;
        if !writer.write(item) {
            writer.drained().await;
        }
        if writer.is_closed() {
            debug!(written, "stream closed while feeding");
            return Err(ThroughvError::Closed);
        }
    }
    debug!(written, "source exhausted, ending write side");
    writer.end().await
}

impl<U> Reader<U> {
    /// Forward every result into `sink`, then close it.
    ///
    /// Stops at the first stream error, or at the first sink error
    /// (reported as [`ThroughvError::Pipe`]).
    pub async fn pipe_to<K>(mut self, sink: K) -> Result<(), ThroughvError>
    where
        K: Sink<U>,
        K::Error: Into<BoxError>,
    {
        pin_mut!(sink);
        while let Some(item) = self.next().await {
            let item = item?;
            sink.send(item).await.map_err(ThroughvError::pipe)?;
        }
        sink.close().await.map_err(ThroughvError::pipe)
    }
}

/// Feed `source` through `through` into `sink`, both directions at once.
pub async fn pipeline<T, U, S, K>(
    source: S,
    through: Throughv<T, U>,
    sink: K,
) -> Result<(), ThroughvError>
where
    S: Stream<Item = T>,
    K: Sink<U>,
    K::Error: Into<BoxError>,
{
    let (writer, reader) = through.split();
    let (fed, piped) = tokio::join!(feed(&writer, source), reader.pipe_to(sink));
    fed?;
    piped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_to_collects_into_a_channel() {
        let through = Throughv::obj(|n: u32, _meta| async move { Ok::<_, BoxError>(Some(n * 10)) });
        let (tx, rx) = futures::channel::mpsc::unbounded();

        let (writer, reader) = through.split();
        for n in 1..=3 {
            writer.write(n);
        }
        writer.end().await.unwrap();
        reader.pipe_to(tx).await.unwrap();

        let out: Vec<u32> = rx.collect().await;
        assert_eq!(out, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn feed_stops_when_the_stream_is_gone() {
        let through = Throughv::<u32, u32>::obj_passthrough();
        let (writer, _reader) = through.split();
        writer.destroy(None);
        let err = feed(&writer, futures::stream::iter(0..100)).await.unwrap_err();
        assert!(matches!(err, ThroughvError::Closed));
    }
}
