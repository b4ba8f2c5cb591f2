//! Adapter between the batch pipeline and [`settle_all`].
//!
//! Transforms receive only the payload and its metadata. No handle to the
//! stream is passed in, so a transform cannot push or read on its own.

use crate::batch::{Batch, BatchOutcome, Metadata};
use crate::error::{BoxError, ThroughvError};
use crate::parallel::settle_all;
use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Future returned by one transform invocation. `Ok(None)` drops the entry.
pub type TransformFuture<U> = BoxFuture<'static, Result<Option<U>, BoxError>>;

/// Per-entry transform.
pub type TransformFn<T, U> = Arc<dyn Fn(T, Metadata) -> TransformFuture<U> + Send + Sync>;

/// Future returned by the optional flush function.
pub type FlushFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Finalisation step run once after the last batch, before end-of-output.
pub type FlushFn = Arc<dyn Fn() -> FlushFuture + Send + Sync>;

/// An in-flight batch. Resolves once with every entry settled.
pub type Dispatch<U> = BoxFuture<'static, BatchOutcome<U>>;

/// Wrap an async closure as a [`TransformFn`].
pub fn transform_fn<T, U, F, Fut, E>(f: F) -> TransformFn<T, U>
where
    F: Fn(T, Metadata) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<U>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    Arc::new(move |payload: T, metadata: Metadata| -> TransformFuture<U> {
        f(payload, metadata).map_err(Into::into).boxed()
    })
}

/// Wrap an async closure as a [`FlushFn`].
pub fn flush_fn<F, Fut, E>(f: F) -> FlushFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    Arc::new(move || -> FlushFuture { f().map_err(Into::into).boxed() })
}

/// The transform used when none is supplied: every payload passes through.
pub fn identity<T: Send + 'static>() -> TransformFn<T, T> {
    Arc::new(|payload: T, _metadata: Metadata| -> TransformFuture<T> {
        futures::future::ready(Ok(Some(payload))).boxed()
    })
}

/// Start the transform for every entry of `batch` and return the future that
/// reassembles their results in batch order.
///
/// The transform is invoked for all entries before this function returns,
/// so no invocation waits on an earlier one in the same batch.
pub fn dispatch_batch<T, U>(batch: Batch<T>, transform: &TransformFn<T, U>) -> Dispatch<U>
where
    U: Send + 'static,
{
    let size = batch.len();
    let workers: Vec<TransformFuture<U>> = batch
        .into_iter()
        .map(|entry| {
            let (payload, metadata) = entry.into_parts();
            transform(payload, metadata)
        })
        .collect();

    async move {
        let settled = settle_all(workers).await;
        let error = settled
            .first_error
            .map(|(index, source)| ThroughvError::transform(index, source));
        debug!(entries = size, failed = error.is_some(), "batch settled");
        BatchOutcome {
            error,
            results: settled.results,
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Entry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn entries<T>(items: Vec<T>) -> Batch<T> {
        items
            .into_iter()
            .map(|payload| Entry::new(payload, Metadata::default()))
            .collect()
    }

    #[tokio::test]
    async fn every_worker_starts_before_any_settles() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());

        let transform = transform_fn(move |chunk: &'static str, _meta| {
            assert_eq!(f.load(Ordering::SeqCst), 0, "chunk processed in parallel");
            s.fetch_add(1, Ordering::SeqCst);
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(Some(chunk))
            }
        });

        let dispatch = dispatch_batch(entries(vec!["a", "b", "c"]), &transform);
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        let outcome = dispatch.await;
        assert_eq!(outcome.results, vec![Some("a"), Some("b"), Some("c")]);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reversed_completion_keeps_order() {
        let transform = transform_fn(|n: u64, _meta| async move {
            tokio::time::sleep(Duration::from_millis(20 - n * 5)).await;
            Ok::<_, BoxError>(Some(n * 10))
        });
        let outcome = dispatch_batch(entries(vec![0, 1, 2, 3]), &transform).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.results, vec![Some(0), Some(10), Some(20), Some(30)]);
    }

    #[tokio::test]
    async fn metadata_reaches_the_worker() {
        let transform = transform_fn(|_chunk: u8, meta: Metadata| async move {
            Ok::<_, BoxError>(meta.encoding)
        });
        let batch = vec![
            Entry::new(1u8, Metadata::encoding("utf8")),
            Entry::new(2u8, Metadata::default()),
        ];
        let outcome = dispatch_batch(batch, &transform).await;
        assert_eq!(outcome.results, vec![Some("utf8".to_string()), None]);
    }

    #[tokio::test]
    async fn failure_is_reported_after_all_entries() {
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let transform = transform_fn(move |n: u32, _meta| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(u64::from(n))).await;
                f.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    Err("bad entry".into())
                } else {
                    Ok::<_, BoxError>(Some(n))
                }
            }
        });

        let outcome = dispatch_batch(entries(vec![10, 1, 20]), &transform).await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.results, vec![Some(10), None, Some(20)]);
        match outcome.error {
            Some(ThroughvError::Transform { index, source }) => {
                assert_eq!(index, 1);
                assert_eq!(source.to_string(), "bad entry");
            }
            other => panic!("unexpected outcome error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concrete_error_types_are_boxed() {
        let transform = transform_fn(|n: u32, _meta| async move {
            if n == 0 {
                Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "zero"))
            } else {
                Ok(Some(n))
            }
        });
        let outcome = dispatch_batch(entries(vec![0, 1]), &transform).await;
        assert_eq!(outcome.results, vec![None, Some(1)]);
        assert!(matches!(outcome.error, Some(ThroughvError::Transform { index: 0, .. })));

        let flush = flush_fn(|| async { Err::<(), _>(std::fmt::Error) });
        assert!(flush().await.is_err());
    }

    #[tokio::test]
    async fn identity_passes_payload_through() {
        let transform = identity::<&'static str>();
        let outcome = dispatch_batch(entries(vec!["x", "y"]), &transform).await;
        assert_eq!(outcome.results, vec![Some("x"), Some("y")]);
    }
}
