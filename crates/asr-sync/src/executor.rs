//! Bounded, settle-all execution of independent async checks.

use std::future::Future;

use futures::stream::{self, StreamExt};

/// In-flight cap for external verification calls.
pub const DEFAULT_CHECK_CONCURRENCY: usize = 5;

/// Runs every thunk with at most `limit` in flight and returns their results
/// in input order. A failing task only fills its own slot with `Err`.
///
/// Tasks are interleaved on the calling task; nothing is spawned.
pub async fn settle_bounded<T, F, Fut>(tasks: Vec<F>, limit: usize) -> Vec<anyhow::Result<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if tasks.is_empty() {
        return Vec::new();
    }
    let limit = limit.clamp(1, tasks.len());
    stream::iter(tasks)
        .map(|task| task())
        .buffered(limit)
        .collect()
        .await
}
