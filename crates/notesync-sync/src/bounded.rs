//! Bounded-concurrency full-data downloads
//!
//! At most `max_in_flight` fetches run at once; further requests wait in a
//! FIFO backlog and start as slots free up. Once the cancellation token
//! fires, nothing new is started and every queued request completes with
//! [`Error::Cancelled`] without reaching the remote store. A fetch that
//! panics fails its own request and gives its slot back.

use futures::future::{BoxFuture, FutureExt};
use notesync_types::{
    ConcurrencyLimit, Error, Guid, Note, NoteDataSpec, NoteStore, RequestContext, Resource,
    Result,
};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Fetches the full data of one item by guid
pub type FetchFn<T> = Arc<dyn Fn(Guid) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct Request<T> {
    guid: Guid,
    result_tx: oneshot::Sender<Result<T>>,
}

struct State<T> {
    in_flight: usize,
    queue: VecDeque<Request<T>>,
}

struct Inner<T> {
    max_in_flight: usize,
    fetch: FetchFn<T>,
    canceler: CancellationToken,
    state: Mutex<State<T>>,
}

/// Downloader with a fixed limit of in-flight requests
pub struct BoundedDownloader<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedDownloader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> BoundedDownloader<T> {
    /// Create a downloader running `fetch` for every request
    pub fn new(limit: ConcurrencyLimit, canceler: CancellationToken, fetch: FetchFn<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_in_flight: limit.get(),
                fetch,
                canceler,
                state: Mutex::new(State {
                    in_flight: 0,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Number of requests currently being fetched
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Number of requests waiting for a free slot
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Download the full data of one item
    pub async fn download_full(&self, guid: Guid) -> Result<T> {
        if self.inner.canceler.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let request = Request { guid, result_tx };

        let start_now = {
            let mut state = self.inner.lock();
            if state.in_flight < self.inner.max_in_flight {
                state.in_flight += 1;
                Some(request)
            } else {
                trace!(guid = %request.guid, queued = state.queue.len() + 1, "Download queued");
                state.queue.push_back(request);
                None
            }
        };

        if let Some(request) = start_now {
            Inner::spawn_worker(Arc::clone(&self.inner), request);
        }

        result_rx
            .await
            .map_err(|_| Error::sync("download worker dropped the request"))?
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run requests on one slot until the backlog is empty
    fn spawn_worker(inner: Arc<Self>, first: Request<T>) {
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(Request { guid, result_tx }) = next {
                let result = AssertUnwindSafe(async { (inner.fetch)(guid.clone()).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(%guid, "Download panicked");
                        Err(Error::sync(format!("download of {} panicked", guid)))
                    });
                let _ = result_tx.send(result);
                next = inner.finish_one();
            }
        });
    }

    /// Hand the slot to the next queued request or release it
    fn finish_one(&self) -> Option<Request<T>> {
        let mut state = self.lock();

        if self.canceler.is_cancelled() {
            let drained: Vec<_> = state.queue.drain(..).collect();
            state.in_flight -= 1;
            drop(state);
            for request in drained {
                let _ = request.result_tx.send(Err(Error::Cancelled));
            }
            return None;
        }

        match state.queue.pop_front() {
            Some(request) => Some(request),
            None => {
                state.in_flight -= 1;
                None
            }
        }
    }
}

/// Downloader of full notes
pub type NoteFullDataDownloader = BoundedDownloader<Note>;

/// Downloader of full resources
pub type ResourceFullDataDownloader = BoundedDownloader<Resource>;

/// Full note downloader backed by a note store
pub fn note_downloader(
    note_store: Arc<dyn NoteStore>,
    ctx: RequestContext,
    limit: ConcurrencyLimit,
    canceler: CancellationToken,
) -> NoteFullDataDownloader {
    let ctx = Arc::new(ctx);
    BoundedDownloader::new(
        limit,
        canceler,
        Arc::new(move |guid: Guid| {
            let note_store = Arc::clone(&note_store);
            let ctx = Arc::clone(&ctx);
            async move { note_store.get_note(&guid, &NoteDataSpec::full(), &ctx).await }.boxed()
        }),
    )
}

/// Full resource downloader backed by a note store
pub fn resource_downloader(
    note_store: Arc<dyn NoteStore>,
    ctx: RequestContext,
    limit: ConcurrencyLimit,
    canceler: CancellationToken,
) -> ResourceFullDataDownloader {
    let ctx = Arc::new(ctx);
    BoundedDownloader::new(
        limit,
        canceler,
        Arc::new(move |guid: Guid| {
            let note_store = Arc::clone(&note_store);
            let ctx = Arc::clone(&ctx);
            async move {
                note_store
                    .get_resource(&guid, &NoteDataSpec::full(), &ctx)
                    .await
            }
            .boxed()
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn tracking_fetch(
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<Guid>>>,
    ) -> FetchFn<String> {
        Arc::new(move |guid: Guid| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(guid.clone());
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(format!("full:{}", guid))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_limit_is_never_exceeded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let downloader = BoundedDownloader::new(
            ConcurrencyLimit::new(3).unwrap(),
            CancellationToken::new(),
            tracking_fetch(Arc::clone(&current), Arc::clone(&peak), Arc::clone(&order)),
        );

        let results = join_all((0..20).map(|i| downloader.download_full(format!("n{}", i)))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(results[7].as_ref().unwrap(), "full:n7");
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(downloader.in_flight(), 0);
        assert_eq!(downloader.queued(), 0);
    }

    #[tokio::test]
    async fn test_backlog_is_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let downloader = BoundedDownloader::new(
            ConcurrencyLimit::new(1).unwrap(),
            CancellationToken::new(),
            tracking_fetch(
                Arc::new(AtomicUsize::new(0)),
                Arc::new(AtomicUsize::new(0)),
                Arc::clone(&order),
            ),
        );

        join_all((0..5).map(|i| downloader.download_full(format!("n{}", i)))).await;

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["n0", "n1", "n2", "n3", "n4"]);
    }

    #[tokio::test]
    async fn test_cancellation_drains_backlog() {
        let canceler = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let started_in_fetch = Arc::clone(&started);
        let canceler_in_fetch = canceler.clone();
        let downloader: BoundedDownloader<String> = BoundedDownloader::new(
            ConcurrencyLimit::new(1).unwrap(),
            canceler.clone(),
            Arc::new(move |guid: Guid| {
                let started = Arc::clone(&started_in_fetch);
                let canceler = canceler_in_fetch.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    canceler.cancel();
                    Ok(guid)
                }
                .boxed()
            }),
        );

        let results = join_all((0..4).map(|i| downloader.download_full(format!("n{}", i)))).await;

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(results[0].is_ok());
        assert!(results[1..]
            .iter()
            .all(|result| matches!(result, Err(Error::Cancelled))));
        assert!(matches!(
            downloader.download_full("late".to_string()).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_panicking_fetch_releases_its_slot() {
        let downloader: BoundedDownloader<String> = BoundedDownloader::new(
            ConcurrencyLimit::new(1).unwrap(),
            CancellationToken::new(),
            Arc::new(|guid: Guid| {
                async move {
                    if guid == "n1" {
                        panic!("corrupt payload");
                    }
                    Ok(guid)
                }
                .boxed()
            }),
        );

        let results = join_all((0..4).map(|i| downloader.download_full(format!("n{}", i)))).await;

        assert_eq!(results[0].as_ref().unwrap(), "n0");
        assert!(matches!(results[1], Err(Error::Sync { .. })));
        assert_eq!(results[2].as_ref().unwrap(), "n2");
        assert_eq!(results[3].as_ref().unwrap(), "n3");
        assert_eq!(downloader.in_flight(), 0);
        assert_eq!(downloader.queued(), 0);

        // The slot is reusable afterwards.
        assert!(downloader.download_full("n1".to_string()).await.is_err());
        assert_eq!(downloader.download_full("n4".to_string()).await.unwrap(), "n4");
    }
}
