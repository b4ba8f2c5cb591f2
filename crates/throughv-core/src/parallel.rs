//! Run independent futures concurrently and report once every one has settled.
//!
//! There is no shared runner: each call owns its own set of in-flight futures.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

/// Everything a batch of futures produced, aligned with their input positions.
#[derive(Debug)]
pub struct Settled<R, E> {
    /// First failure in completion order, with the position that produced it.
    pub first_error: Option<(usize, E)>,
    /// `results[i]` is the value of the i-th future; failed or empty slots are `None`.
    pub results: Vec<Option<R>>,
}

/// Drive every future to completion on the calling task.
///
/// All futures are polled in the same turn, so every one of them starts before
/// any completion is reported. A failure never cancels the others: the call
/// returns only after the last future settles.
pub async fn settle_all<I, F, R, E>(futures: I) -> Settled<R, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<Option<R>, E>>,
{
    let mut in_flight: FuturesUnordered<_> = futures
        .into_iter()
        .enumerate()
        .map(|(index, fut)| async move { (index, fut.await) })
        .collect();

    let mut results = Vec::with_capacity(in_flight.len());
    results.resize_with(in_flight.len(), || None);
    let mut first_error = None;

    while let Some((index, settled)) = in_flight.next().await {
        match settled {
            Ok(value) => results[index] = value,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some((index, e));
                }
            }
        }
    }

    Settled {
        first_error,
        results,
    }
}
