//! One content session: everything between page load and teardown.

use crate::bridge::{BridgeClient, BridgeMessage, MessageSource, WindowChannel};
use crate::cache::LocationCache;
use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::dom::Document;
use crate::error::Result;
use crate::observe::{setup_hover_listeners, spawn_mutation_watcher, spawn_pointer_listener};
use crate::rate_limit::RateLimitWindow;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SCAN_DELAY: Duration = Duration::from_secs(2);
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Wait before the first listener scan, while the page renders.
    pub scan_delay: Duration,
    pub flush_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            scan_delay: SCAN_DELAY,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}

pub struct Session {
    coord: Arc<Coordinator>,
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Load settings and cache, then start the scheduler, the rate limit
    /// listener, the periodic flush and (after the scan delay) page
    /// observation.
    pub async fn start(
        doc: Arc<Document>,
        storage: Arc<dyn Storage>,
        window: WindowChannel,
        options: SessionOptions,
    ) -> Session {
        let settings = Settings::load(storage.as_ref()).await;
        let cache = Arc::new(LocationCache::new(Arc::clone(&storage)));
        let loaded = cache.load().await;
        info!(
            "Session starting: {} cached locations, annotation {}",
            loaded,
            if settings.enabled { "enabled" } else { "disabled" }
        );

        let cancel = CancellationToken::new();
        let rate_window = Arc::new(RateLimitWindow::new());
        let bridge = Arc::new(BridgeClient::new(window.clone()));
        let (scheduler, scheduler_task) = Scheduler::spawn(
            bridge,
            Arc::clone(&cache),
            Arc::clone(&rate_window),
            settings.request_spacing(),
            cancel.clone(),
        );
        let coord = Coordinator::new(doc, scheduler, settings);

        let mut tasks = vec![
            scheduler_task,
            spawn_rate_limit_listener(window, rate_window, cancel.clone()),
            spawn_flush(Arc::clone(&cache), options.flush_interval, cancel.clone()),
        ];

        let observer = Arc::clone(&coord);
        let observer_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = observer_cancel.cancelled() => return,
                _ = sleep(options.scan_delay) => {}
            }
            let bound = setup_hover_listeners(&observer);
            debug!("Initial scan bound {} elements", bound);
            let watchers = [
                spawn_mutation_watcher(Arc::clone(&observer), observer_cancel.clone()),
                spawn_pointer_listener(Arc::clone(&observer), observer_cancel.clone()),
            ];
            for watcher in watchers {
                let _ = watcher.await;
            }
        }));

        Session {
            coord,
            storage,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coord
    }

    pub fn is_enabled(&self) -> bool {
        self.coord.is_enabled()
    }

    /// Apply a toggle and persist it with the rest of the settings.
    pub async fn set_enabled(&self, enabled: bool) -> Result<usize> {
        let removed = self.coord.set_enabled(enabled);
        self.coord.settings().save(self.storage.as_ref()).await?;
        Ok(removed)
    }

    /// Flush the cache, stop every task and drop session state.
    pub async fn shutdown(&self) {
        self.coord.cache().flush_all().await;
        self.cancel.cancel();
        self.coord.clear();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
        info!("Session stopped");
    }
}

// Unsolicited `__rateLimitInfo` from the privileged side sets the window.
fn spawn_rate_limit_listener(
    window: WindowChannel,
    rate_window: Arc<RateLimitWindow>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = window.subscribe();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };
            if envelope.source != MessageSource::SameWindow {
                continue;
            }
            if let BridgeMessage::RateLimitInfo { reset_time, .. } = envelope.message {
                rate_window.set_reset_epoch(reset_time);
            }
        }
    })
}

fn spawn_flush(cache: Arc<LocationCache>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => cache.flush_all().await,
            }
        }
    })
}
