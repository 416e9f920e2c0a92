use crate::bridge::LocationBridge;
use crate::cache::LocationCache;
use crate::error::{FlagError, Result};
use crate::metrics::{CACHE_HITS, CACHE_MISSES, LOOKUP_LATENCY, LOOKUPS_TOTAL, RATE_LIMITED};
use crate::models::{PendingRequest, Responder};
use crate::rate_limit::RateLimitWindow;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_CONCURRENT_REQUESTS: usize = 2;
// longest single sleep while waiting out a rate limit window
pub const MAX_WINDOW_CHECK: Duration = Duration::from_secs(60);

const QUEUE_CAPACITY: usize = 1024;

// Single-flight, rate limited lookup queue in front of the bridge
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    queue_tx: mpsc::Sender<PendingRequest>,
}

struct Inner {
    bridge: Arc<dyn LocationBridge>,
    cache: Arc<LocationCache>,
    window: Arc<RateLimitWindow>,
    spacing: Duration,
    permits: Arc<Semaphore>,
    last_dispatch: Mutex<Option<Instant>>,
    // usernames queued or in flight -> extra callers waiting on the same lookup
    joiners: DashMap<String, Vec<Responder>>,
}

impl Scheduler {
    /// Start the dispatch loop. `spacing` below the 2s floor is raised to it.
    pub fn spawn(
        bridge: Arc<dyn LocationBridge>,
        cache: Arc<LocationCache>,
        window: Arc<RateLimitWindow>,
        spacing: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            bridge,
            cache,
            window,
            spacing: spacing.max(MIN_REQUEST_INTERVAL),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
            last_dispatch: Mutex::new(None),
            joiners: DashMap::new(),
        });

        let worker = Arc::clone(&inner);
        let handle = tokio::spawn(async move { worker.run(queue_rx, cancel).await });
        (Self { inner, queue_tx }, handle)
    }

    pub fn window(&self) -> &Arc<RateLimitWindow> {
        &self.inner.window
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.inner.cache
    }

    /// Lookups queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.inner.joiners.len()
    }

    pub fn is_outstanding(&self, username: &str) -> bool {
        self.inner.joiners.contains_key(username)
    }

    /// Location for `username`: from cache, or from the bridge through the
    /// queue. Concurrent calls for one username share a single lookup.
    pub async fn resolve(&self, username: &str) -> Result<Option<String>> {
        if let Some(location) = self.inner.cache.get(username) {
            CACHE_HITS.inc();
            return Ok(Some(location));
        }
        CACHE_MISSES.inc();

        let (tx, rx) = oneshot::channel();
        let request = match self.inner.joiners.entry(username.to_string()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push(tx);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
                Some(PendingRequest {
                    username: username.to_string(),
                    respond: tx,
                })
            }
        };

        match request {
            Some(request) => {
                debug!("Queued lookup for {}", username);
                if self.queue_tx.send(request).await.is_err() {
                    self.inner.joiners.remove(username);
                    return Err(FlagError::ChannelClosed("scheduler queue"));
                }
            }
            None => debug!("Joined in-flight lookup for {}", username),
        }

        rx.await
            .map_err(|_| FlagError::ChannelClosed("scheduler response"))?
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PendingRequest>, cancel: CancellationToken) {
        info!(
            "Lookup scheduler started ({:?} spacing, {} concurrent)",
            self.spacing, MAX_CONCURRENT_REQUESTS
        );

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wait_for_slot() => {}
            }

            *self.last_dispatch_slot() = Some(Instant::now());
            let worker = Arc::clone(&self);
            tokio::spawn(async move { worker.dispatch(request, permit).await });
        }

        info!("Lookup scheduler stopped");
    }

    // Hold until no rate limit window is active and the spacing since the
    // previous dispatch has elapsed.
    async fn wait_for_slot(&self) {
        loop {
            if let Some(left) = self.window.remaining() {
                debug!("Rate limit active, rechecking in {:?}", left.min(MAX_WINDOW_CHECK));
                sleep(left.min(MAX_WINDOW_CHECK)).await;
                continue;
            }

            let last = *self.last_dispatch_slot();
            if let Some(last) = last {
                let next = last + self.spacing;
                if Instant::now() < next {
                    tokio::time::sleep_until(next).await;
                    continue;
                }
            }
            return;
        }
    }

    async fn dispatch(&self, request: PendingRequest, permit: OwnedSemaphorePermit) {
        let PendingRequest { username, respond } = request;
        LOOKUPS_TOTAL.inc();
        let started = Instant::now();
        debug!("Dispatching lookup for {}", username);

        let outcome = self.bridge.fetch_location(&username).await;
        LOOKUP_LATENCY.observe(started.elapsed().as_secs_f64());

        match &outcome {
            Ok(reply) if reply.rate_limited => {
                RATE_LIMITED.inc();
                debug!("Lookup for {} rate limited, not caching", username);
            }
            Ok(reply) => self.cache.set(&username, reply.location.clone()).await,
            Err(e) => warn!("Lookup for {} failed: {}", username, e),
        }

        let joiners = self
            .joiners
            .remove(&username)
            .map(|(_, waiting)| waiting)
            .unwrap_or_default();
        for joiner in joiners {
            let shared = match &outcome {
                Ok(reply) => Ok(reply.location.clone()),
                Err(e) => Err(e.to_shared()),
            };
            let _ = joiner.send(shared);
        }
        let _ = respond.send(outcome.map(|reply| reply.location));

        drop(permit);
    }

    fn last_dispatch_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_dispatch.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocationReply;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Bridge stand-in: fixed answers, configurable latency, records timing
    #[derive(Default)]
    struct StubBridge {
        answers: HashMap<String, Option<String>>,
        latency: Duration,
        rate_limit_reset: Mutex<Option<(Arc<RateLimitWindow>, Duration)>>,
        failing: Vec<String>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl LocationBridge for StubBridge {
        async fn fetch_location(&self, username: &str) -> Result<LocationReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().push(Instant::now());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.iter().any(|u| u == username) {
                return Err(FlagError::Bridge("boom".into()));
            }
            if let Some((window, wait)) = self.rate_limit_reset.lock().unwrap().take() {
                window.set_until(Instant::now() + wait);
                return Ok(LocationReply::rate_limited());
            }
            Ok(LocationReply::found(self.answers.get(username).cloned().flatten()))
        }
    }

    fn answers(pairs: &[(&str, &str)]) -> HashMap<String, Option<String>> {
        pairs
            .iter()
            .map(|(u, l)| (u.to_string(), Some(l.to_string())))
            .collect()
    }

    fn start(bridge: Arc<StubBridge>, window: Arc<RateLimitWindow>) -> Scheduler {
        let cache = Arc::new(LocationCache::new(Arc::new(MemoryStorage::new())));
        let (scheduler, _) = Scheduler::spawn(
            bridge,
            cache,
            window,
            Duration::from_millis(500),
            CancellationToken::new(),
        );
        scheduler
    }

    #[tokio::test(start_paused = true)]
    async fn second_resolve_is_served_from_cache() {
        let bridge = Arc::new(StubBridge {
            answers: answers(&[("alice", "Japan")]),
            ..Default::default()
        });
        let scheduler = start(bridge.clone(), Arc::new(RateLimitWindow::new()));

        assert_eq!(scheduler.resolve("alice").await.unwrap().as_deref(), Some("Japan"));
        assert_eq!(scheduler.resolve("alice").await.unwrap().as_deref(), Some("Japan"));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_resolves_share_one_lookup() {
        let bridge = Arc::new(StubBridge {
            answers: answers(&[("alice", "Japan")]),
            latency: Duration::from_secs(1),
            ..Default::default()
        });
        let scheduler = start(bridge.clone(), Arc::new(RateLimitWindow::new()));

        let (a, b, c) = tokio::join!(
            scheduler.resolve("alice"),
            scheduler.resolve("alice"),
            scheduler.resolve("alice")
        );
        for result in [a, b, c] {
            assert_eq!(result.unwrap().as_deref(), Some("Japan"));
        }
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_respects_spacing_and_concurrency() {
        let bridge = Arc::new(StubBridge {
            latency: Duration::from_secs(5),
            ..Default::default()
        });
        let scheduler = start(bridge.clone(), Arc::new(RateLimitWindow::new()));

        let users = ["u1", "u2", "u3", "u4", "u5"];
        let lookups: Vec<_> = users
            .iter()
            .map(|u| {
                let s = scheduler.clone();
                let u = u.to_string();
                tokio::spawn(async move { s.resolve(&u).await })
            })
            .collect();
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().unwrap(), None);
        }

        assert_eq!(bridge.calls.load(Ordering::SeqCst), 5);
        assert!(bridge.max_in_flight.load(Ordering::SeqCst) <= MAX_CONCURRENT_REQUESTS);
        let started = bridge.started.lock().unwrap();
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_REQUEST_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_round_is_not_cached_and_pauses_dispatch() {
        let window = Arc::new(RateLimitWindow::new());
        let bridge = Arc::new(StubBridge {
            answers: answers(&[("alice", "Japan"), ("bob", "France")]),
            rate_limit_reset: Mutex::new(Some((window.clone(), Duration::from_secs(120)))),
            ..Default::default()
        });
        let scheduler = start(bridge.clone(), window.clone());

        let first = scheduler.resolve("alice").await.unwrap();
        assert_eq!(first, None);
        assert!(scheduler.cache().get("alice").is_none());
        assert!(window.is_active());

        let limited_at = Instant::now();
        assert_eq!(scheduler.resolve("bob").await.unwrap().as_deref(), Some("France"));
        let started = bridge.started.lock().unwrap();
        assert!(started[1] - limited_at >= Duration::from_secs(119));
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_error_rejects_only_that_request() {
        let bridge = Arc::new(StubBridge {
            answers: answers(&[("bob", "France")]),
            failing: vec!["alice".into()],
            ..Default::default()
        });
        let scheduler = start(bridge.clone(), Arc::new(RateLimitWindow::new()));

        let (alice, bob) = tokio::join!(scheduler.resolve("alice"), scheduler.resolve("bob"));
        assert!(alice.is_err());
        assert_eq!(bob.unwrap().as_deref(), Some("France"));
    }
}
