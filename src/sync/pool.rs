//! Batching, bounded worker pools and pagination draining.
//!
//! These helpers carry no sync-specific state; the engine composes them.
//! Every loop checks the [`CancelToken`] before starting new work, never
//! mid-item.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::cancel::CancelToken;
use super::error::{DiscoveryError, SyncError};

/// Results of [`process_batched`].
#[derive(Debug)]
pub struct Batched<R> {
    pub results: Vec<R>,
    /// Batches that were never started because of cancellation.
    pub skipped: usize,
    pub cancelled: bool,
}

/// Feed `items` to `f` in chunks of `batch_size`, one chunk at a time.
///
/// Stops on the first error. Cancellation is checked between chunks.
pub async fn process_batched<T, R, E, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    cancel: &CancelToken,
    mut f: F,
) -> Result<Batched<R>, E>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let batch_size = batch_size.max(1);
    let total = items.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(total);
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        if cancel.is_cancelled() {
            return Ok(Batched {
                skipped: total - results.len(),
                results,
                cancelled: true,
            });
        }
        let chunk: Vec<T> = iter.by_ref().take(batch_size).collect();
        results.push(f(chunk).await?);
    }

    Ok(Batched {
        results,
        skipped: 0,
        cancelled: false,
    })
}

/// Run `f` over `items` with at most `concurrency` tasks in flight.
///
/// Results come back in input order. Items not started before cancellation
/// are dropped from the output.
pub async fn process_pooled<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    cancel: &CancelToken,
    f: F,
) -> Result<Vec<R>, SyncError>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let f = Arc::new(f);
    let mut join_set: JoinSet<(usize, R)> = JoinSet::new();

    for (i, item) in items.into_iter().enumerate() {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| SyncError::Worker {
                message: e.to_string(),
            })?;
        if cancel.is_cancelled() {
            break;
        }
        let f = Arc::clone(&f);
        join_set.spawn(async move {
            let result = f(item).await;
            drop(permit);
            (i, result)
        });
    }

    let mut results: Vec<(usize, R)> = Vec::with_capacity(join_set.len());
    while let Some(joined) = join_set.join_next().await {
        let (i, result) = joined.map_err(|e| SyncError::Worker {
            message: e.to_string(),
        })?;
        results.push((i, result));
    }
    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}

/// A failed page encountered while draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    /// Cursor the failed request was made with.
    pub cursor: Option<String>,
    pub error: DiscoveryError,
}

/// Results of [`process_paginated`].
#[derive(Debug)]
pub struct Paginated<P> {
    pub pages: Vec<P>,
    pub failures: Vec<PageFailure>,
    /// Pagination ran to the end without failures or cancellation.
    pub complete: bool,
    pub cancelled: bool,
}

/// Drain a cursor-paginated source.
///
/// `fetch(cursor)` returns a page and the next cursor (`None` ends the
/// pass). A failed page is recorded; if its error carries a resume cursor
/// draining continues from there, otherwise it stops. A repeated cursor is
/// treated as a failure so a misbehaving source cannot loop forever.
pub async fn process_paginated<P, F, Fut>(cancel: &CancelToken, mut fetch: F) -> Paginated<P>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(P, Option<String>), DiscoveryError>>,
{
    let mut pages = Vec::new();
    let mut failures = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Paginated {
                pages,
                failures,
                complete: false,
                cancelled: true,
            };
        }

        let next = match fetch(cursor.clone()).await {
            Ok((page, next)) => {
                pages.push(page);
                next
            }
            Err(error) => {
                let resume = error.resume_cursor.clone();
                failures.push(PageFailure {
                    cursor: cursor.clone(),
                    error,
                });
                match resume {
                    Some(resume) => Some(resume),
                    None => break,
                }
            }
        };

        match next {
            None => break,
            Some(next) => {
                if !seen.insert(next.clone()) {
                    failures.push(PageFailure {
                        cursor: Some(next.clone()),
                        error: DiscoveryError::fatal(format!("pagination cursor \"{next}\" repeated")),
                    });
                    break;
                }
                cursor = Some(next);
            }
        }
    }

    let complete = failures.is_empty();
    Paginated {
        pages,
        failures,
        complete,
        cancelled: false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn batched_chunks_items() {
        let cancel = CancelToken::new();
        let out = process_batched((0..7).collect(), 3, &cancel, |chunk: Vec<i32>| async move {
            Ok::<_, ()>(chunk.len())
        })
        .await
        .unwrap();
        assert_eq!(out.results, vec![3, 3, 1]);
        assert!(!out.cancelled);
    }

    #[tokio::test]
    async fn batched_stops_when_cancelled_between_chunks() {
        let cancel = CancelToken::new();
        let calls = AtomicUsize::new(0);
        let out = process_batched((0..10).collect(), 2, &cancel, |chunk: Vec<i32>| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                cancel.cancel();
            }
            async move { Ok::<_, ()>(chunk) }
        })
        .await
        .unwrap();
        assert!(out.cancelled);
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.skipped, 3);
    }

    #[tokio::test]
    async fn pooled_respects_concurrency_and_order() {
        let cancel = CancelToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight2, peak2) = (in_flight.clone(), peak.clone());
        let out = process_pooled((0..20).collect::<Vec<u32>>(), 3, &cancel, move |i| {
            let in_flight = in_flight2.clone();
            let peak = peak2.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await
        .unwrap();
        assert_eq!(out, (0..20).map(|i| i * 2).collect::<Vec<u32>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn paginated_resumes_after_failed_page() {
        let cancel = CancelToken::new();
        let out = process_paginated(&cancel, |cursor: Option<String>| async move {
            match cursor.as_deref() {
                None => Ok((1, Some("p2".to_string()))),
                Some("p2") => Err(DiscoveryError::recoverable("throttled").resume_at("p3")),
                Some("p3") => Ok((3, None)),
                Some(other) => Err(DiscoveryError::fatal(format!("unexpected {other}"))),
            }
        })
        .await;
        assert_eq!(out.pages, vec![1, 3]);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].cursor.as_deref(), Some("p2"));
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn paginated_stops_without_resume_cursor() {
        let cancel = CancelToken::new();
        let out = process_paginated(&cancel, |cursor: Option<String>| async move {
            match cursor {
                None => Ok((1, Some("p2".to_string()))),
                Some(_) => Err::<(i32, Option<String>), _>(DiscoveryError::recoverable("boom")),
            }
        })
        .await;
        assert_eq!(out.pages, vec![1]);
        assert!(!out.complete);
    }

    #[tokio::test]
    async fn paginated_detects_repeated_cursor() {
        let cancel = CancelToken::new();
        let out = process_paginated(&cancel, |_cursor: Option<String>| async move {
            Ok::<_, DiscoveryError>((0, Some("same".to_string())))
        })
        .await;
        assert_eq!(out.pages.len(), 2);
        assert!(!out.complete);
    }
}
