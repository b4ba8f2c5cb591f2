//! End-of-stream, error and destroy behaviour of `Throughv`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use throughv_stream::{BoxError, StreamEvent, Throughv, ThroughvBuilder, ThroughvError};
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn labels(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<&'static str> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(match event {
            StreamEvent::Drain => "drain",
            StreamEvent::Finish => "finish",
            StreamEvent::End => "end",
            StreamEvent::Error(_) => "error",
            StreamEvent::Close => "close",
        });
    }
    out
}

async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event")
        .expect("event channel closed")
}

fn echo() -> Throughv<u32, u32> {
    Throughv::obj(|n: u32, _meta| async move { Ok::<_, BoxError>(Some(n)) })
}

// ─── Flush and end ────────────────────────────────────────────────────────────

#[tokio::test]
async fn flush_runs_once_after_the_last_batch() {
    let processed = Arc::new(AtomicUsize::new(0));
    let flushes = Arc::new(AtomicUsize::new(0));
    let flushed_after_all = Arc::new(AtomicBool::new(false));

    let through = {
        let processed = processed.clone();
        let seen = processed.clone();
        let flushes = flushes.clone();
        let flushed_after_all = flushed_after_all.clone();
        Throughv::obj_with_flush(
            move |n: u32, _meta| {
                let processed = processed.clone();
                async move {
                    sleep(Duration::from_millis(5)).await;
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(Some(n))
                }
            },
            move || {
                flushes.fetch_add(1, Ordering::SeqCst);
                flushed_after_all.store(seen.load(Ordering::SeqCst) == 3, Ordering::SeqCst);
                async { Ok::<_, BoxError>(()) }
            },
        )
    };
    let mut events = through.events();

    through.write(1);
    through.write(2);
    through.write(3);
    through.end().await.unwrap();
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert!(flushed_after_all.load(Ordering::SeqCst));

    let out: Vec<u32> = through.map(|r| r.unwrap()).collect().await;
    assert_eq!(out, vec![1, 2, 3]);
    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(labels(&mut events), vec!["finish", "end", "close"]);
}

#[tokio::test]
async fn flush_error_replaces_end() {
    let through = Throughv::obj_with_flush(
        |n: u32, _meta| async move { Ok::<_, BoxError>(Some(n)) },
        || async { Err::<(), BoxError>("cannot flush".into()) },
    );
    let mut events = through.events();

    through.write(1);
    let err = through.end().await.unwrap_err();
    assert!(matches!(err, ThroughvError::Flush { .. }));

    let (_writer, mut reader) = through.split();
    assert_eq!(reader.next().await.unwrap().unwrap(), 1);
    assert!(matches!(reader.next().await, Some(Err(ThroughvError::Flush { .. }))));
    assert!(reader.next().await.is_none());

    assert_eq!(labels(&mut events), vec!["error", "close"]);
}

#[tokio::test]
async fn end_twice_resolves_both() {
    let through = echo();
    through.write(1);
    let (a, b) = tokio::join!(through.end(), through.end());
    a.unwrap();
    b.unwrap();
    // Ending a finished stream is a no-op.
    through.end().await.unwrap();
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transform_error_surfaces_once_with_results_kept() {
    let through = Throughv::obj(|n: u32, _meta| async move {
        if n == 2 {
            Err::<Option<u32>, BoxError>("no twos".into())
        } else {
            Ok(Some(n))
        }
    });
    let mut events = through.events();

    let (ack_tx, ack_rx) = oneshot::channel();
    through.cork();
    through.write(1);
    through.write_with(2, Default::default(), Some(ack_tx));
    through.write(3);
    through.uncork();

    let err = through.end().await.unwrap_err();
    match err {
        ThroughvError::Transform { index, .. } => assert_eq!(index, 1),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(ack_rx.await, Ok(Err(ThroughvError::Transform { .. }))));
    assert_eq!(through.metrics().transform_errors, 1);

    let (_writer, mut reader) = through.split();
    assert_eq!(reader.next().await.unwrap().unwrap(), 1);
    assert_eq!(reader.next().await.unwrap().unwrap(), 3);
    assert!(reader.next().await.unwrap().is_err());
    assert!(reader.next().await.is_none());

    assert_eq!(labels(&mut events), vec!["error", "close"]);
}

#[tokio::test]
async fn writes_after_an_error_fail_with_it() {
    let through = Throughv::obj(|_n: u32, _meta| async move {
        Err::<Option<u32>, BoxError>("always".into())
    });
    assert!(through.send(1).await.is_err());
    let err = through.send(2).await.unwrap_err();
    assert!(matches!(err, ThroughvError::Transform { index: 0, .. }));
    assert_eq!(through.metrics().batches_completed, 1);
}

#[tokio::test]
async fn write_after_end_fails() {
    let through = echo();
    let mut events = through.events();
    through.end().await.unwrap();

    let err = through.send(5).await.unwrap_err();
    assert!(matches!(err, ThroughvError::WriteAfterEnd));
    assert!(matches!(next_event(&mut events).await, StreamEvent::Finish));
    assert!(matches!(next_event(&mut events).await, StreamEvent::End));
    // Nothing was left to read, so the stream closed before the late write.
    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));
    assert!(matches!(
        next_event(&mut events).await,
        StreamEvent::Error(ThroughvError::WriteAfterEnd)
    ));
}

// ─── Destroy ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn destroy_emits_close_asynchronously() {
    let through = echo();
    let mut events = through.events();

    through.destroy(None);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));
    through.destroy(None);
    sleep(Duration::from_millis(20)).await;
    assert!(labels(&mut events).is_empty());
    assert!(through.is_closed());
}

#[tokio::test]
async fn destroy_with_error_emits_error_then_close() {
    let through = echo();
    let mut events = through.events();

    through.destroy_with("kaboom");
    through.destroy_with("again");

    match next_event(&mut events).await {
        StreamEvent::Error(ThroughvError::Destroyed { source }) => {
            assert_eq!(source.to_string(), "kaboom")
        }
        other => panic!("unexpected event: {other}"),
    }
    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));

    let (_writer, mut reader) = through.split();
    assert!(matches!(
        reader.next().await,
        Some(Err(ThroughvError::Destroyed { .. }))
    ));
    assert!(reader.next().await.is_none());
    sleep(Duration::from_millis(20)).await;
    assert!(labels(&mut events).is_empty());
}

#[tokio::test]
async fn destroy_lets_the_running_batch_finish() {
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    let through = Throughv::obj(move |n: u32, _meta| {
        let counter = counter.clone();
        async move {
            sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(Some(n))
        }
    });
    let mut events = through.events();

    let (ack_tx, ack_rx) = oneshot::channel();
    through.write_with(1, Default::default(), Some(ack_tx));
    sleep(Duration::from_millis(5)).await;
    through.destroy(None);

    assert!(matches!(next_event(&mut events).await, StreamEvent::Close));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    assert!(matches!(ack_rx.await, Ok(Err(ThroughvError::Closed))));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn destroy_during_flush_ends_with_close() {
    let through = Throughv::obj_with_flush(
        |n: u32, _meta| async move { Ok::<_, BoxError>(Some(n)) },
        || async {
            sleep(Duration::from_millis(30)).await;
            Ok::<_, BoxError>(())
        },
    );
    let mut events = through.events();

    through.write(1);
    let (ended, ()) = tokio::join!(through.end(), async {
        sleep(Duration::from_millis(10)).await;
        through.destroy(None);
    });
    assert!(matches!(ended, Err(ThroughvError::Closed)));

    // Let the flush settle after the teardown.
    sleep(Duration::from_millis(50)).await;
    assert_eq!(labels(&mut events), vec!["close"]);
}

#[tokio::test]
async fn destroy_after_close_emits_nothing() {
    let through = echo();
    let mut events = through.events();
    through.write(1);
    through.end().await.unwrap();

    let (writer, reader) = through.split();
    let out: Vec<u32> = reader.map(|r| r.unwrap()).collect().await;
    assert_eq!(out, vec![1]);
    while !matches!(next_event(&mut events).await, StreamEvent::Close) {}

    writer.destroy_with("too late");
    sleep(Duration::from_millis(20)).await;
    assert!(labels(&mut events).is_empty());
    assert!(writer.is_closed());
}

// ─── Drain ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn drain_fires_once_writes_are_acknowledged() {
    let through = ThroughvBuilder::object(|n: u32, _meta| async move {
        sleep(Duration::from_millis(5)).await;
        Ok::<_, BoxError>(Some(n))
    })
    .high_water_mark(2)
    .build();
    let mut events = through.events();

    assert!(through.write(1));
    assert!(!through.write(2));
    timeout(Duration::from_secs(5), through.drained())
        .await
        .expect("never drained");

    assert_eq!(through.writer().writable_len(), 0);
    assert!(matches!(next_event(&mut events).await, StreamEvent::Drain));
}
