//! Bounded parallelism for a stage's internal sub-work.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Runs `f` over `items` with at most `limit` futures in flight.
///
/// Results come back in input order. A `limit` of zero is treated as one.
pub async fn run_bounded<I, T, F, Fut, R>(items: I, limit: usize, f: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items)
        .map(f)
        .buffered(limit.max(1))
        .collect()
        .await
}
