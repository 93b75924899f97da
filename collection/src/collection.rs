//! Incrementally fetched entity collection.
//!
//! An [`EntityCollection`] reads a remote listing one slice at a time,
//! appending each page to its items. It stops issuing requests once a page
//! comes back short (or the listing's reported count is reached), and emits a
//! [`FetchEvent`] on its event channel every time a fetch settles.
//!
//! At most one request is in flight per collection. A call made while another
//! is pending waits for that fetch instead of issuing its own request.
//!
//! ```rust,no_run
//! use collection::{CollectionConfig, EntityCollection, HttpListingSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CollectionConfig::default().with_base_url("http://localhost:8080");
//! let source = HttpListingSource::new(config.clone())?;
//! let greetings = EntityCollection::from_config(source, "/api/greetings", &config)?;
//!
//! let _subscription = greetings.subscribe(|event| {
//!     println!("{} greetings, complete: {}", event.total, event.complete);
//! });
//!
//! greetings.fetch_next_page(3).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::CollectionConfig;
use crate::events::{EventChannel, Subscription};
use crate::source::{ListingSource, SourceError};
use crate::types::{Entity, FetchEvent, FetchOutcome, FetchStatus, Slice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

pub type CollectionResult<T> = Result<T, CollectionError>;

#[derive(Debug, Default)]
struct State {
    items: Vec<Entity>,
    complete: bool,
    count: Option<usize>,
}

pub struct EntityCollection<S> {
    source: S,
    resource_path: String,
    fetch_timeout: Option<Duration>,
    state: Mutex<State>,
    pending: AtomicBool,
    settled: Notify,
    events: EventChannel<FetchEvent>,
}

impl<S: ListingSource> EntityCollection<S> {
    pub fn new(source: S, resource_path: impl Into<String>) -> Self {
        Self {
            source,
            resource_path: resource_path.into(),
            fetch_timeout: None,
            state: Mutex::new(State::default()),
            pending: AtomicBool::new(false),
            settled: Notify::new(),
            events: EventChannel::new(),
        }
    }

    pub fn from_config(
        source: S,
        resource_path: impl Into<String>,
        config: &CollectionConfig,
    ) -> CollectionResult<Self> {
        config
            .validate()
            .map_err(|message| CollectionError::InvalidConfig { message })?;

        Ok(Self::new(source, resource_path).with_fetch_timeout(config.timeout))
    }

    /// Bound every fetch by `timeout`; expiry settles the fetch as a failure.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Request up to `limit` more entities and append them.
    ///
    /// Transport failures are not returned as `Err`: they settle the fetch
    /// with [`FetchOutcome::Failed`] and a failure event, leaving the items
    /// and completion flag untouched. The only `Err` is an invalid `limit`,
    /// which is rejected before any state change or event.
    pub async fn fetch_next_page(&self, limit: usize) -> CollectionResult<FetchOutcome> {
        if limit == 0 {
            return Err(CollectionError::InvalidArgument {
                message: "limit must be greater than 0".to_string(),
            });
        }

        if self.is_complete() {
            return Ok(self.settle_exhausted());
        }

        // Register for the settle notification before looking at the flag so
        // a fetch finishing in between still wakes us.
        let mut settled = Box::pin(self.settled.notified());
        settled.as_mut().enable();

        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "Fetch already in flight for {}, waiting for it to settle",
                self.resource_path
            );
            settled.await;
            return Ok(FetchOutcome::Joined);
        }
        drop(settled);

        let guard = PendingGuard { collection: self };

        let slice = {
            let state = self.lock_state();
            if state.complete {
                drop(state);
                guard.release();
                return Ok(self.settle_exhausted());
            }
            Slice::new(state.items.len(), limit)
        };

        debug!(
            "Fetching {} slice {} from {}",
            self.resource_path,
            slice,
            self.source.source_name()
        );

        let result = match self.fetch_timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.source.fetch_slice(&self.resource_path, slice))
                    .await
                    .unwrap_or_else(|_| {
                        Err(SourceError::Timeout {
                            millis: timeout.as_millis(),
                        })
                    })
            }
            None => self.source.fetch_slice(&self.resource_path, slice).await,
        };

        let (event, outcome) = match result {
            Ok(page) => {
                let returned = page.items.len();
                if returned > limit {
                    warn!(
                        "Listing {} returned {} entities for a limit of {}",
                        self.resource_path, returned, limit
                    );
                }

                let mut state = self.lock_state();
                state.items.extend(page.items.iter().cloned());
                if page.count.is_some() {
                    state.count = page.count;
                }
                let held = state.items.len();
                let count_reached = state.count.is_some_and(|count| held >= count);
                if returned < limit || count_reached {
                    state.complete = true;
                }

                info!(
                    "Fetched {} entities from {} ({} held, complete: {})",
                    returned,
                    self.resource_path,
                    state.items.len(),
                    state.complete
                );

                let event = FetchEvent {
                    status: FetchStatus::Success,
                    new_items: page.items,
                    total: state.items.len(),
                    complete: state.complete,
                };
                let outcome = FetchOutcome::Fetched {
                    added: returned,
                    complete: state.complete,
                };
                (event, outcome)
            }
            Err(err) => {
                warn!("Fetch of {} failed: {}", self.resource_path, err);
                let err = Arc::new(err);
                let event = self.snapshot_event(FetchStatus::Failed(err.clone()));
                (event, FetchOutcome::Failed(err))
            }
        };

        guard.settle(&event);
        Ok(outcome)
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&FetchEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<FetchEvent>) {
        self.events.subscribe_channel()
    }

    pub fn events(&self) -> &EventChannel<FetchEvent> {
        &self.events
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn items(&self) -> Vec<Entity> {
        self.lock_state().items.clone()
    }

    /// Run `f` over the held items without cloning them.
    pub fn with_items<R>(&self, f: impl FnOnce(&[Entity]) -> R) -> R {
        f(&self.lock_state().items)
    }

    pub fn len(&self) -> usize {
        self.lock_state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.lock_state().complete
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Total size of the listing as last reported by the endpoint.
    pub fn count(&self) -> Option<usize> {
        self.lock_state().count
    }

    fn settle_exhausted(&self) -> FetchOutcome {
        debug!("{} is complete, skipping request", self.resource_path);
        let event = self.snapshot_event(FetchStatus::Exhausted);
        self.events.emit(&event);
        FetchOutcome::Exhausted
    }

    fn snapshot_event(&self, status: FetchStatus) -> FetchEvent {
        let state = self.lock_state();
        FetchEvent {
            status,
            new_items: Vec::new(),
            total: state.items.len(),
            complete: state.complete,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the pending flag for one fetch.
///
/// If the fetch future is dropped before it settles, the guard clears the
/// flag and reports the fetch as cancelled, so observers still see exactly
/// one event and a retry is possible.
struct PendingGuard<'a, S: ListingSource> {
    collection: &'a EntityCollection<S>,
}

impl<S: ListingSource> PendingGuard<'_, S> {
    fn settle(self, event: &FetchEvent) {
        let collection = self.collection;
        std::mem::forget(self);
        collection.pending.store(false, Ordering::Release);
        let _wake = WakeWaiters(&collection.settled);
        collection.events.emit(event);
    }

    /// Clear the flag without emitting anything.
    fn release(self) {
        let collection = self.collection;
        std::mem::forget(self);
        collection.pending.store(false, Ordering::Release);
        collection.settled.notify_waiters();
    }
}

impl<S: ListingSource> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        let collection = self.collection;
        warn!("Fetch of {} cancelled in flight", collection.resource_path);
        let event = collection.snapshot_event(FetchStatus::Failed(Arc::new(SourceError::Cancelled)));
        collection.pending.store(false, Ordering::Release);
        let _wake = WakeWaiters(&collection.settled);
        collection.events.emit(&event);
    }
}

/// Wakes joined callers when dropped, including while an observer unwinds.
struct WakeWaiters<'a>(&'a Notify);

impl Drop for WakeWaiters<'_> {
    fn drop(&mut self) {
        self.0.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceResult;
    use crate::types::Page;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    const GREETINGS: &str = "/api/greetings";

    struct ScriptedSource {
        responses: Mutex<VecDeque<SourceResult<Page>>>,
        requests: Mutex<Vec<Slice>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<SourceResult<Page>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn requests(&self) -> Vec<Slice> {
            self.requests.lock().unwrap().clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        async fn fetch_slice(&self, _path: &str, slice: Slice) -> SourceResult<Page> {
            self.requests.lock().unwrap().push(slice);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::default()))
        }

        fn source_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn greeting(n: usize) -> Entity {
        let mut fields = Map::new();
        fields.insert("id".to_string(), json!(format!("Greeting:{}", n)));
        fields.insert("text".to_string(), json!(format!("Hello #{}", n)));
        Entity::new(fields)
    }

    fn page(from: usize, len: usize) -> SourceResult<Page> {
        Ok(Page::new((from..from + len).map(greeting).collect()))
    }

    fn record_events(
        collection: &EntityCollection<ScriptedSource>,
    ) -> (Subscription, Arc<Mutex<Vec<FetchEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = collection.subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        (subscription, events)
    }

    #[tokio::test]
    async fn test_first_full_page_is_not_complete() {
        let collection = EntityCollection::new(ScriptedSource::new(vec![page(0, 3)]), GREETINGS);
        let (_subscription, events) = record_events(&collection);

        let outcome = collection.fetch_next_page(3).await.unwrap();

        assert_eq!(outcome.added(), 3);
        assert_eq!(collection.len(), 3);
        assert!(!collection.is_complete());
        assert!(!collection.is_pending());
        assert_eq!(collection.source().requests(), vec![Slice::new(0, 3)]);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].status.is_success());
        assert_eq!(events[0].new_items.len(), 3);
        assert_eq!(events[0].total, 3);
    }

    #[tokio::test]
    async fn test_short_page_completes_collection() {
        let source = ScriptedSource::new(vec![page(0, 3), page(3, 2)]);
        let collection = EntityCollection::new(source, GREETINGS);

        collection.fetch_next_page(3).await.unwrap();
        let outcome = collection.fetch_next_page(3).await.unwrap();

        assert!(matches!(
            outcome,
            FetchOutcome::Fetched {
                added: 2,
                complete: true
            }
        ));
        assert_eq!(collection.len(), 5);
        assert!(collection.is_complete());
        assert_eq!(
            collection.source().requests(),
            vec![Slice::new(0, 3), Slice::new(3, 3)]
        );

        let texts: Vec<String> = collection.with_items(|items| {
            items
                .iter()
                .filter_map(|item| item.text("text").map(str::to_string))
                .collect()
        });
        assert_eq!(texts.first().map(String::as_str), Some("Hello #0"));
        assert_eq!(texts.last().map(String::as_str), Some("Hello #4"));
    }

    #[tokio::test]
    async fn test_complete_collection_issues_no_requests() {
        let collection = EntityCollection::new(ScriptedSource::new(vec![page(0, 1)]), GREETINGS);
        collection.fetch_next_page(3).await.unwrap();
        assert!(collection.is_complete());

        let (_subscription, events) = record_events(&collection);
        let before = collection.items();

        let outcome = collection.fetch_next_page(3).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Exhausted));
        assert_eq!(collection.source().request_count(), 1);
        assert_eq!(collection.items(), before);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].status, FetchStatus::Exhausted));
        assert!(events[0].new_items.is_empty());
        assert!(events[0].complete);
    }

    #[tokio::test]
    async fn test_zero_limit_is_rejected_without_event() {
        let collection = EntityCollection::new(ScriptedSource::new(vec![]), GREETINGS);
        let (_subscription, events) = record_events(&collection);

        let err = tokio_test::assert_err!(collection.fetch_next_page(0).await);

        assert!(matches!(err, CollectionError::InvalidArgument { .. }));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(collection.source().request_count(), 0);
        assert!(!collection.is_pending());
    }

    #[tokio::test]
    async fn test_failure_leaves_state_and_allows_retry() {
        let source = ScriptedSource::new(vec![
            page(0, 3),
            Err(SourceError::ServiceUnavailable {
                message: "down".to_string(),
            }),
            page(3, 3),
        ]);
        let collection = EntityCollection::new(source, GREETINGS);
        collection.fetch_next_page(3).await.unwrap();
        let (_subscription, events) = record_events(&collection);

        let outcome = collection.fetch_next_page(3).await.unwrap();
        assert!(outcome.is_failure());
        assert_eq!(collection.len(), 3);
        assert!(!collection.is_complete());
        assert!(!collection.is_pending());

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                events[0].status.error(),
                Some(SourceError::ServiceUnavailable { .. })
            ));
            assert_eq!(events[0].total, 3);
        }

        let retry = tokio_test::assert_ok!(collection.fetch_next_page(3).await);
        assert_eq!(retry.added(), 3);
        assert_eq!(collection.len(), 6);
        assert_eq!(collection.source().requests()[2], Slice::new(3, 3));
    }

    #[tokio::test]
    async fn test_overlapping_calls_issue_one_request() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource::new(vec![page(0, 3), page(3, 3)]).gated(gate.clone());
        let collection = EntityCollection::new(source, GREETINGS);
        let (_subscription, events) = record_events(&collection);

        let (first, second, ()) = futures::join!(
            collection.fetch_next_page(3),
            collection.fetch_next_page(3),
            async {
                while collection.source().request_count() == 0 {
                    tokio::task::yield_now().await;
                }
                assert!(collection.is_pending());
                assert_eq!(collection.source().request_count(), 1);
                gate.notify_one();
            }
        );

        assert_eq!(first.unwrap().added(), 3);
        assert!(matches!(second.unwrap(), FetchOutcome::Joined));
        assert_eq!(collection.source().request_count(), 1);
        assert_eq!(collection.len(), 3);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_observer_still_wakes_joined_caller() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource::new(vec![page(0, 3)]).gated(gate.clone());
        let collection = Arc::new(EntityCollection::new(source, GREETINGS));
        let _subscription = collection.subscribe(|_| panic!("observer failed"));

        let leader = tokio::spawn({
            let collection = collection.clone();
            async move { collection.fetch_next_page(3).await }
        });
        while collection.source().request_count() == 0 {
            tokio::task::yield_now().await;
        }

        let joiner = tokio::spawn({
            let collection = collection.clone();
            async move { collection.fetch_next_page(3).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        gate.notify_one();
        let leader = leader.await;
        assert!(leader.unwrap_err().is_panic());

        let joined = tokio::time::timeout(Duration::from_secs(2), joiner)
            .await
            .expect("joined caller never woke")
            .unwrap();
        assert!(matches!(joined, Ok(FetchOutcome::Joined)));
        assert!(!collection.is_pending());
        assert_eq!(collection.source().request_count(), 1);
    }

    #[tokio::test]
    async fn test_items_accumulate_across_fetches() {
        let returned = [4, 4, 4, 1];
        let mut from = 0;
        let mut responses = Vec::new();
        for len in returned {
            responses.push(page(from, len));
            from += len;
        }
        let collection = EntityCollection::new(ScriptedSource::new(responses), GREETINGS);

        let mut expected = 0;
        for len in returned {
            collection.fetch_next_page(4).await.unwrap();
            expected += len;
            assert_eq!(collection.len(), expected);
            assert_eq!(collection.is_complete(), len < 4);
        }

        let starts: Vec<usize> = collection
            .source()
            .requests()
            .iter()
            .map(|slice| slice.start)
            .collect();
        assert_eq!(starts, vec![0, 4, 8, 12]);
    }

    #[tokio::test]
    async fn test_reported_count_completes_full_page() {
        let source = ScriptedSource::new(vec![Ok(Page::new(vec![greeting(0), greeting(1)])
            .with_count(2))]);
        let collection = EntityCollection::new(source, GREETINGS);

        collection.fetch_next_page(2).await.unwrap();

        assert!(collection.is_complete());
        assert_eq!(collection.count(), Some(2));
        assert!(matches!(
            collection.fetch_next_page(2).await.unwrap(),
            FetchOutcome::Exhausted
        ));
        assert_eq!(collection.source().request_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_emits_failure_and_clears_pending() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource::new(vec![page(0, 3)]).gated(gate.clone());
        let collection = EntityCollection::new(source, GREETINGS);
        let (_subscription, events) = record_events(&collection);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), collection.fetch_next_page(3)).await;
        assert!(abandoned.is_err());
        assert!(!collection.is_pending());
        assert!(collection.is_empty());

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(matches!(
                events[0].status.error(),
                Some(SourceError::Cancelled)
            ));
        }

        gate.notify_one();
        let retry = collection.fetch_next_page(3).await.unwrap();
        assert_eq!(retry.added(), 3);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_a_failure() {
        let gate = Arc::new(Notify::new());
        let source = ScriptedSource::new(vec![page(0, 3)]).gated(gate);
        let collection =
            EntityCollection::new(source, GREETINGS).with_fetch_timeout(Duration::from_millis(10));

        let outcome = collection.fetch_next_page(3).await.unwrap();

        match outcome {
            FetchOutcome::Failed(err) => {
                assert!(matches!(*err, SourceError::Timeout { millis: 10 }))
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert!(!collection.is_pending());
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn test_observer_reads_collection_during_event() {
        let collection = Arc::new(EntityCollection::new(
            ScriptedSource::new(vec![page(0, 2)]),
            GREETINGS,
        ));
        let complete_flag = Arc::new(AtomicBool::new(false));
        let seen_len = Arc::new(AtomicUsize::new(0));

        let weak: Weak<EntityCollection<ScriptedSource>> = Arc::downgrade(&collection);
        let _subscription = {
            let complete_flag = complete_flag.clone();
            let seen_len = seen_len.clone();
            collection.subscribe(move |_event| {
                if let Some(collection) = weak.upgrade() {
                    complete_flag.store(collection.is_complete(), Ordering::SeqCst);
                    seen_len.store(collection.len(), Ordering::SeqCst);
                    assert!(!collection.is_pending());
                }
            })
        };

        collection.fetch_next_page(3).await.unwrap();

        assert!(complete_flag.load(Ordering::SeqCst));
        assert_eq!(seen_len.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_validates() {
        let config = CollectionConfig::default().with_page_size(0);
        let result = EntityCollection::from_config(ScriptedSource::new(vec![]), GREETINGS, &config);
        assert!(matches!(result, Err(CollectionError::InvalidConfig { .. })));

        let config = CollectionConfig::default();
        let collection =
            EntityCollection::from_config(ScriptedSource::new(vec![]), GREETINGS, &config).unwrap();
        assert_eq!(collection.resource_path(), GREETINGS);
        assert!(collection.is_empty());
        assert_eq!(collection.count(), None);
    }
}
