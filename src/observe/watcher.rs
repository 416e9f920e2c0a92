use super::classify::{contains_hover_card, extract_username_from_link, find_profile_popup};
use super::hover::{handle_hover, handle_leave};
use super::listeners::setup_hover_listeners;
use crate::annotate::{PopupState, add_flag_to_popup, apply_pending};
use crate::coordinator::Coordinator;
use crate::dom::{Mutation, PointerEvent, PointerKind, Selector, animation_frame, next_batch};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rescans triggered by a mutation burst coalesce over this window.
pub const RESCAN_DEBOUNCE: Duration = Duration::from_millis(100);
pub const NAVIGATION_RESCAN_DELAY: Duration = Duration::from_secs(1);

/// Watch the whole document: rebind listeners when nodes are added,
/// annotate hover cards as they appear and follow in-app navigation.
pub fn spawn_mutation_watcher(coord: Arc<Coordinator>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut mutations = coord.doc().subscribe();
    tokio::spawn(async move {
        info!("Mutation watcher started");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = next_batch(&mut mutations) => batch,
            };
            match batch {
                Some(batch) => handle_batch(&coord, &batch),
                None => break,
            }
        }
        info!("Mutation watcher stopped");
    })
}

pub(crate) fn handle_batch(coord: &Arc<Coordinator>, batch: &[Mutation]) {
    if !coord.is_enabled() {
        return;
    }
    let doc = coord.doc();
    let mut added = false;
    let mut removed = false;
    let mut popup_appeared = false;

    for mutation in batch {
        match mutation {
            Mutation::ChildAdded { node, .. } => {
                added = true;
                popup_appeared = popup_appeared || contains_hover_card(doc, *node);
            }
            Mutation::ChildRemoved { .. } => removed = true,
            Mutation::Navigated { url } => {
                debug!("Navigated to {}, rescanning shortly", url);
                schedule_rescan(coord, NAVIGATION_RESCAN_DELAY);
            }
            Mutation::TextChanged { .. } => {}
        }
    }

    if removed {
        coord.prune_detached();
    }
    if added && !coord.rescan_scheduled.swap(true, Ordering::SeqCst) {
        let coord = Arc::clone(coord);
        tokio::spawn(async move {
            sleep(RESCAN_DEBOUNCE).await;
            coord.rescan_scheduled.store(false, Ordering::SeqCst);
            setup_hover_listeners(&coord);
        });
    }
    if popup_appeared {
        let coord = Arc::clone(coord);
        tokio::spawn(async move { annotate_appeared_popup(coord).await });
    }
}

fn schedule_rescan(coord: &Arc<Coordinator>, delay: Duration) {
    let coord = Arc::clone(coord);
    tokio::spawn(async move {
        sleep(delay).await;
        setup_hover_listeners(&coord);
    });
}

// A card showed up without a hover we saw: annotate it from its own links.
async fn annotate_appeared_popup(coord: Arc<Coordinator>) {
    animation_frame().await;
    if !coord.is_enabled() || !coord.settings().show_in_profiles {
        return;
    }
    let doc = Arc::clone(coord.doc());
    let Some(popup) = find_profile_popup(&doc) else {
        return;
    };
    let Some(username) = doc
        .query(popup, &Selector::ProfileLink)
        .and_then(|link| extract_username_from_link(&doc, link))
    else {
        return;
    };
    if coord.popup_state(popup) != PopupState::Unset {
        return;
    }
    if apply_pending(&coord, popup, &username).is_some() {
        return;
    }
    add_flag_to_popup(coord, popup, username).await;
}

/// Route pointer events on bound elements to the hover handlers.
pub fn spawn_pointer_listener(coord: Arc<Coordinator>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = coord.doc().subscribe_pointer();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => dispatch_pointer(&coord, event),
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} pointer events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn dispatch_pointer(coord: &Arc<Coordinator>, event: PointerEvent) {
    let Some(binding) = coord.listeners().get(event.target) else {
        return;
    };
    match event.kind {
        PointerKind::Enter => handle_hover(coord, event.target, &binding),
        PointerKind::Leave => handle_leave(coord, &binding.username),
    }
}
