//! Session-owned state shared by observation and annotation.

use crate::annotate::{PendingInsertion, PopupState, remove_all_flags};
use crate::cache::LocationCache;
use crate::config::Settings;
use crate::dom::{Document, NodeId};
use crate::observe::listeners::{ListenerRegistry, setup_hover_listeners};
use crate::scheduler::Scheduler;
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Slot {
    generation: u64,
    handle: AbortHandle,
}

/// Named background tasks, at most one per key. Starting a task under a
/// key aborts the one already there.
#[derive(Default)]
pub struct TaskSlots {
    slots: DashMap<String, Slot>,
    generation: AtomicU64,
}

impl TaskSlots {
    /// Spawn the future built by `make` under `key`. `make` receives the
    /// slot generation to hand back to [`TaskSlots::finish`].
    pub fn replace<F>(&self, key: &str, make: impl FnOnce(u64) -> F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(make(generation)).abort_handle();
        if let Some(old) = self.slots.insert(key.to_string(), Slot { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Release `key` if it still belongs to `generation`.
    pub fn finish(&self, key: &str, generation: u64) {
        self.slots.remove_if(key, |_, slot| slot.generation == generation);
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.slots.get(key).is_some_and(|slot| !slot.handle.is_finished())
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        self.slots.retain(|_, slot| {
            slot.handle.abort();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.handle.is_finished()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything one content session owns: the document handle, the lookup
/// scheduler and the bookkeeping that keeps annotation single-flight.
pub struct Coordinator {
    doc: Arc<Document>,
    scheduler: Scheduler,
    settings: RwLock<Settings>,
    enabled: AtomicBool,
    listeners: ListenerRegistry,
    // usernames with a popup annotation in progress
    pub(crate) processing: DashSet<String>,
    pub(crate) pending: DashMap<String, PendingInsertion>,
    pub(crate) popups: DashMap<NodeId, PopupState>,
    pub(crate) hover_timers: TaskSlots,
    pub(crate) popup_watchers: TaskSlots,
    annotation: Mutex<CancellationToken>,
    pub(crate) rescan_scheduled: AtomicBool,
}

impl Coordinator {
    pub fn new(doc: Arc<Document>, scheduler: Scheduler, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            doc,
            scheduler,
            enabled: AtomicBool::new(settings.enabled),
            settings: RwLock::new(settings),
            listeners: ListenerRegistry::new(),
            processing: DashSet::new(),
            pending: DashMap::new(),
            popups: DashMap::new(),
            hover_timers: TaskSlots::default(),
            popup_watchers: TaskSlots::default(),
            annotation: Mutex::new(CancellationToken::new()),
            rescan_scheduled: AtomicBool::new(false),
        })
    }

    pub fn doc(&self) -> &Arc<Document> {
        &self.doc
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        self.scheduler.cache()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn popup_state(&self, popup: NodeId) -> PopupState {
        self.popups.get(&popup).map(|s| *s).unwrap_or_default()
    }

    pub(crate) fn set_popup_state(&self, popup: NodeId, state: PopupState) {
        self.popups.insert(popup, state);
    }

    pub fn has_pending(&self, username: &str) -> bool {
        self.pending.contains_key(username)
    }

    pub fn is_processing(&self, username: &str) -> bool {
        self.processing.contains(username)
    }

    /// Token for the current enabled period. Disabling cancels it.
    pub fn annotation_token(&self) -> CancellationToken {
        self.annotation.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply an enable/disable toggle. Disabling strips every flag and drops
    /// in-progress annotation work; lookups already dispatched still finish
    /// and land in the cache.
    pub fn set_enabled(&self, enabled: bool) -> usize {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.enabled = enabled;
        }

        if enabled {
            if !was {
                info!("Annotation enabled");
                return setup_hover_listeners(self);
            }
            return 0;
        }

        let fresh = CancellationToken::new();
        let old = std::mem::replace(&mut *self.annotation.lock().unwrap_or_else(|e| e.into_inner()), fresh);
        old.cancel();

        self.hover_timers.abort_all();
        self.popup_watchers.abort_all();
        let removed = remove_all_flags(&self.doc);
        self.popups.clear();
        self.pending.clear();
        self.processing.clear();
        if was {
            info!("Annotation disabled, removed {} flags", removed);
        }
        removed
    }

    /// Drop state tied to elements that have left the document.
    pub fn prune_detached(&self) {
        self.popups.retain(|popup, _| self.doc.is_connected(*popup));
        self.listeners.prune(&self.doc);
    }

    /// Tear down everything owned by the session.
    pub fn clear(&self) {
        self.annotation_token().cancel();
        self.hover_timers.abort_all();
        self.popup_watchers.abort_all();
        self.popups.clear();
        self.pending.clear();
        self.processing.clear();
        self.listeners.clear();
    }
}
