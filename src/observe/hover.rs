//! Pointer-driven annotation: what happens between hovering a username and
//! its card being flagged.

use super::classify::{find_profile_popup, flag_marker, user_name_container};
use super::listeners::{HoverBinding, HoverKind};
use crate::annotate::{PopupState, add_flag_to_popup, apply_pending};
use crate::coordinator::Coordinator;
use crate::dom::{Document, Mutation, NodeId, PointerKind, Selector, animation_frame, next_batch};
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tracing::debug;

pub const HOVER_DEBOUNCE: Duration = Duration::ZERO;
/// Popup watchers disconnect on their own after this long.
pub const POPUP_WATCH_LIMIT: Duration = Duration::from_secs(5);
pub const CONTENT_WATCH_LIMIT: Duration = Duration::from_secs(10);
pub const CONTENT_WATCH_BATCHES: usize = 100;

pub fn handle_hover(coord: &Arc<Coordinator>, target: NodeId, binding: &HoverBinding) {
    if !coord.is_enabled() || !coord.settings().show_in_profiles {
        return;
    }
    let username = binding.username.as_str();
    redirect_to_handle(coord.doc(), target, username, binding.kind);
    watch_for_popup(coord, username);

    let owner = Arc::clone(coord);
    let name = username.to_string();
    coord.hover_timers.replace(username, move |generation| async move {
        sleep(HOVER_DEBOUNCE).await;
        owner.hover_timers.finish(&name, generation);
        on_hover_settled(&owner, &name);
    });
}

/// Pointer left a username: drop its pending timer and popup watcher.
/// Lookups already dispatched keep running.
pub fn handle_leave(coord: &Coordinator, username: &str) {
    coord.hover_timers.cancel(username);
    coord.popup_watchers.cancel(username);
}

// The host page opens the card from the `@handle` link, so hovering the
// display name or the avatar is forwarded there.
fn redirect_to_handle(doc: &Arc<Document>, target: NodeId, username: &str, kind: HoverKind) {
    if kind == HoverKind::Link && doc.text_content(target).trim().starts_with('@') {
        return;
    }
    let Some(container) = doc.closest(target, &user_name_container()) else {
        return;
    };
    let handle_link = doc
        .query_all(container, &Selector::link_to(username))
        .into_iter()
        .find(|link| *link != target && doc.text_content(*link).trim().starts_with('@'));
    let Some(handle_link) = handle_link else {
        return;
    };

    let doc = Arc::clone(doc);
    tokio::spawn(async move {
        animation_frame().await;
        doc.dispatch_from(handle_link, PointerKind::Enter, Some(target));
    });
}

/// Watch the document for the card of `username` to appear, for at most
/// five seconds. One watcher per username.
pub fn watch_for_popup(coord: &Arc<Coordinator>, username: &str) {
    if coord.popup_watchers.is_active(username) {
        return;
    }
    let token = coord.annotation_token();
    let mut mutations = coord.doc().subscribe();
    let owner = Arc::clone(coord);
    let name = username.to_string();

    coord.popup_watchers.replace(username, move |generation| async move {
        let deadline = Instant::now() + POPUP_WATCH_LIMIT;
        let doc = Arc::clone(owner.doc());
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(deadline) => break,
                batch = next_batch(&mut mutations) => batch,
            };
            if batch.is_none() || !owner.is_enabled() {
                break;
            }

            let Some(popup) = find_profile_popup(&doc) else { continue };
            if doc.query(popup, &flag_marker()).is_some() {
                break;
            }
            if doc.query(popup, &Selector::link_to(&name)).is_none() {
                continue;
            }
            if apply_pending(&owner, popup, &name).is_some() {
                break;
            }
            if owner.cache().get(&name).is_some() {
                schedule_annotation(&owner, popup, &name);
                break;
            }
        }
        owner.popup_watchers.finish(&name, generation);
    });
}

/// Debounced hover handler: annotate the card on screen if it belongs to
/// `username`, then keep an eye on its content while it streams in.
pub fn on_hover_settled(coord: &Arc<Coordinator>, username: &str) {
    if !coord.is_enabled() {
        return;
    }
    let doc = coord.doc();
    let Some(popup) = find_profile_popup(doc) else {
        return;
    };
    if doc.query(popup, &flag_marker()).is_some() {
        return;
    }
    if coord.popup_state(popup) == PopupState::Done {
        coord.set_popup_state(popup, PopupState::Unset);
    }
    if apply_pending(coord, popup, username).is_some() {
        return;
    }

    if doc.query(popup, &Selector::link_to(username)).is_some() {
        schedule_annotation(coord, popup, username);
    }
    spawn_content_watcher(coord, popup, username);
}

fn schedule_annotation(coord: &Arc<Coordinator>, popup: NodeId, username: &str) {
    let coord = Arc::clone(coord);
    let username = username.to_string();
    tokio::spawn(async move {
        animation_frame().await;
        add_flag_to_popup(coord, popup, username).await;
    });
}

// Re-annotates the card when its flag disappears. Bounded by batch count
// and wall time.
fn spawn_content_watcher(coord: &Arc<Coordinator>, popup: NodeId, username: &str) {
    let token = coord.annotation_token();
    let mut mutations = coord.doc().subscribe();
    let coord = Arc::clone(coord);
    let username = username.to_string();

    tokio::spawn(async move {
        let deadline = Instant::now() + CONTENT_WATCH_LIMIT;
        let doc = Arc::clone(coord.doc());
        let mut batches = 0;
        while batches < CONTENT_WATCH_BATCHES {
            let batch = tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep_until(deadline) => return,
                batch = next_batch(&mut mutations) => batch,
            };
            let Some(batch) = batch else { return };
            if !doc.is_connected(popup) {
                return;
            }
            if !batch.iter().any(|m| touches(&doc, popup, m)) {
                continue;
            }
            batches += 1;

            let state = coord.popup_state(popup);
            let healable = matches!(state, PopupState::Unset | PopupState::Done);
            if healable
                && doc.query(popup, &flag_marker()).is_none()
                && doc.query(popup, &Selector::link_to(&username)).is_some()
            {
                debug!("Card for {} changed without a flag, re-annotating", username);
                coord.set_popup_state(popup, PopupState::Unset);
                schedule_annotation(&coord, popup, &username);
            }
        }
    });
}

fn touches(doc: &Document, popup: NodeId, mutation: &Mutation) -> bool {
    match mutation {
        Mutation::ChildAdded { parent, .. } | Mutation::ChildRemoved { parent, .. } => doc.contains(popup, *parent),
        Mutation::TextChanged { node } => doc.contains(popup, *node),
        Mutation::Navigated { .. } => false,
    }
}
