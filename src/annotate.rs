//! Flag insertion into hover cards.
//!
//! Each popup moves through [`PopupState`]. The state lives in coordinator
//! memory keyed by the popup's node id, never on the element: the page
//! recreates cards instead of reusing them, so a detached id simply stops
//! mattering. The only markup written is the flag span itself.

use crate::coordinator::Coordinator;
use crate::dom::{Document, Markup, NodeId, Placement, Selector, WaitOptions, WaitOutcome, el, wait_for};
use crate::error::Result;
use crate::flags;
use crate::metrics::FLAGS_INSERTED;
use crate::observe::classify::{FLAG_ATTR, flag_marker, hover_card_parent, user_name_container};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

const FLAG_STYLE: &str = "margin-left:4px;margin-right:4px;display:inline;color:inherit;vertical-align:middle";

/// How long after insertion the flag is checked for survival.
pub const VERIFY_DELAY: Duration = Duration::from_millis(100);
/// Delay before a stashed flag is applied to a new card.
pub const PENDING_APPLY_DELAY: Duration = Duration::from_millis(150);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PopupState {
    #[default]
    Unset,
    /// Another card is already resolving this username.
    Waiting,
    Processing,
    Done,
    Failed,
}

/// A resolved flag whose card went away before it could be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingInsertion {
    pub flag: &'static str,
    pub location: String,
}

/// Annotate `popup` with the flag for `username`, resolving the location
/// if it is not cached. Resolves to the state the popup ends in.
pub fn add_flag_to_popup(coord: Arc<Coordinator>, popup: NodeId, username: String) -> BoxFuture<'static, PopupState> {
    async move { annotate(coord, popup, username).await }.boxed()
}

async fn annotate(coord: Arc<Coordinator>, popup: NodeId, username: String) -> PopupState {
    let doc = Arc::clone(coord.doc());
    if !coord.is_enabled() || !doc.is_connected(popup) || doc.closest(popup, &hover_card_parent()).is_none() {
        return coord.popup_state(popup);
    }

    if doc.query(popup, &flag_marker()).is_some() {
        coord.set_popup_state(popup, PopupState::Done);
        return PopupState::Done;
    }
    if coord.popup_state(popup) == PopupState::Done {
        debug!("Flag for {} vanished, resetting popup", username);
        coord.set_popup_state(popup, PopupState::Unset);
    }

    let cached = coord.cache().get(&username);
    if cached.is_none() && coord.is_processing(&username) {
        debug!("Lookup for {} already running, popup waits", username);
        coord.set_popup_state(popup, PopupState::Waiting);
        tokio::spawn(await_shared_lookup(Arc::clone(&coord), popup, username));
        return PopupState::Waiting;
    }

    coord.processing.insert(username.clone());
    coord.set_popup_state(popup, PopupState::Processing);

    let state = process(&coord, &doc, popup, &username, cached).await;

    coord.processing.remove(&username);
    if coord.is_enabled() && doc.is_connected(popup) {
        coord.set_popup_state(popup, state);
    } else {
        coord.popups.remove(&popup);
    }
    state
}

async fn process(
    coord: &Arc<Coordinator>,
    doc: &Document,
    popup: NodeId,
    username: &str,
    cached: Option<String>,
) -> PopupState {
    let token = coord.annotation_token();

    let location = match cached {
        Some(location) => Some(location),
        None => coord.scheduler().resolve(username).await.unwrap_or_else(|e| {
            warn!("Location lookup for {} failed: {}", username, e);
            None
        }),
    };
    if token.is_cancelled() {
        return PopupState::Unset;
    }

    let Some(location) = location else {
        debug!("No location for {}", username);
        return PopupState::Failed;
    };
    let Some(flag) = flags::resolve(Some(&location)) else {
        debug!("No flag for {} ({})", username, location);
        return PopupState::Failed;
    };
    let insertion = PendingInsertion { flag, location };

    if !doc.is_connected(popup) {
        stash(coord, username, insertion);
        return PopupState::Failed;
    }

    let outcome = wait_for(doc, popup, &token, WaitOptions::default(), || {
        find_username_span(doc, popup, username)
    })
    .await;

    let span = match outcome {
        WaitOutcome::Found(span) => Some(span),
        WaitOutcome::Detached => {
            stash(coord, username, insertion);
            return PopupState::Failed;
        }
        WaitOutcome::Cancelled => return PopupState::Unset,
        WaitOutcome::TimedOut => None,
    };

    if let Some(span) = span {
        if doc
            .next_sibling(span)
            .is_some_and(|next| doc.attr(next, FLAG_ATTR).as_deref() == Some("true"))
        {
            return PopupState::Done;
        }
        if doc.is_connected(span) && write_flag(coord, popup, &insertion, Placement::After(span)).is_ok() {
            spawn_verify(Arc::clone(coord), popup);
            return PopupState::Done;
        }
    }

    if let Some(state) = insert_near_link(coord, popup, username, &insertion) {
        return state;
    }

    match write_flag(coord, popup, &insertion, Placement::Append(popup)) {
        Ok(_) => PopupState::Done,
        Err(e) => {
            debug!("Could not place flag for {}: {}", username, e);
            PopupState::Failed
        }
    }
}

// Second choice: next to a link to the profile, once some ancestor below
// the card shows the handle.
fn insert_near_link(coord: &Coordinator, popup: NodeId, username: &str, insertion: &PendingInsertion) -> Option<PopupState> {
    let doc = coord.doc();
    let link = doc.query(popup, &Selector::link_to(username))?;
    if doc
        .closest(link, &user_name_container())
        .is_some_and(|container| doc.query(container, &flag_marker()).is_some())
    {
        return Some(PopupState::Done);
    }

    let handle = format!("@{}", username);
    let mut current = doc.parent(link);
    while let Some(container) = current {
        if container == popup {
            break;
        }
        if doc.text_content(container).contains(&handle) {
            if doc.query(container, &flag_marker()).is_some() {
                return Some(PopupState::Done);
            }
            if write_flag(coord, popup, insertion, Placement::After(link)).is_ok()
                || write_flag(coord, popup, insertion, Placement::Append(container)).is_ok()
            {
                return Some(PopupState::Done);
            }
        }
        current = doc.parent(container);
    }
    None
}

/// The span rendering `@username` inside `popup`: exact text first, then
/// any `@`-prefixed text containing the handle.
pub fn find_username_span(doc: &Document, popup: NodeId, username: &str) -> Option<NodeId> {
    if !doc.is_connected(popup) {
        return None;
    }
    let handle = format!("@{}", username);
    let spans: Vec<(NodeId, String)> = doc
        .query_all(popup, &Selector::Tag("span"))
        .into_iter()
        .filter(|span| doc.attr(*span, FLAG_ATTR).is_none())
        .map(|span| (span, doc.text_content(span).trim().to_string()))
        .collect();

    spans
        .iter()
        .find(|(_, text)| *text == handle)
        .or_else(|| spans.iter().find(|(_, text)| text.starts_with('@') && text.contains(&handle)))
        .map(|(span, _)| *span)
}

fn flag_markup(insertion: &PendingInsertion) -> Markup {
    el("span")
        .attr(FLAG_ATTR, "true")
        .attr("style", FLAG_STYLE)
        .with_text(&flags::flag_label(insertion.flag, &insertion.location))
}

// Ok(false) when a flag is already somewhere in the card, or annotation
// was switched off. Both are checked under the document lock, so a flag
// can't land after `remove_all_flags` ran.
fn write_flag(coord: &Coordinator, popup: NodeId, insertion: &PendingInsertion, placement: Placement) -> Result<bool> {
    let placed = coord.doc().place_unique(
        &flag_markup(insertion),
        placement,
        popup,
        &flag_marker(),
        || coord.is_enabled(),
    )?;
    if placed.is_some() {
        FLAGS_INSERTED.inc();
    }
    Ok(placed.is_some())
}

fn stash(coord: &Coordinator, username: &str, insertion: PendingInsertion) {
    debug!("Popup for {} detached, keeping flag for the next one", username);
    coord.pending.insert(username.to_string(), insertion);
}

// The page sometimes re-renders the card right after we write into it.
fn spawn_verify(coord: Arc<Coordinator>, popup: NodeId) {
    tokio::spawn(async move {
        sleep(VERIFY_DELAY).await;
        let doc = coord.doc();
        if doc.is_connected(popup)
            && doc.query(popup, &flag_marker()).is_none()
            && coord.popup_state(popup) == PopupState::Done
        {
            debug!("Flag removed by the page, popup reset");
            coord.set_popup_state(popup, PopupState::Unset);
        }
    });
}

async fn await_shared_lookup(coord: Arc<Coordinator>, popup: NodeId, username: String) {
    let token = coord.annotation_token();
    let result = tokio::select! {
        _ = token.cancelled() => return,
        result = coord.scheduler().resolve(&username) => result,
    };
    if coord.popup_state(popup) != PopupState::Waiting {
        return;
    }

    match result {
        Ok(Some(_)) if coord.doc().is_connected(popup) => {
            coord.set_popup_state(popup, PopupState::Unset);
            add_flag_to_popup(coord, popup, username).await;
        }
        _ => coord.set_popup_state(popup, PopupState::Failed),
    }
}

/// Apply a stashed flag to a freshly shown card after a short settle delay.
/// Returns `None` when nothing is stashed for `username`.
pub fn apply_pending(coord: &Arc<Coordinator>, popup: NodeId, username: &str) -> Option<JoinHandle<bool>> {
    let (_, insertion) = coord.pending.remove(username)?;
    let coord = Arc::clone(coord);
    let username = username.to_string();

    Some(tokio::spawn(async move {
        sleep(PENDING_APPLY_DELAY).await;
        if !coord.is_enabled() {
            return false;
        }
        let doc = Arc::clone(coord.doc());
        if !doc.is_connected(popup) {
            coord.pending.insert(username, insertion);
            return false;
        }

        let handle = format!("@{}", username);
        for link in doc.query_all(popup, &Selector::link_to(&username)) {
            let avatar = doc.attr(link, "aria-hidden").as_deref() == Some("true")
                || doc.query(link, &Selector::Tag("img")).is_some();
            if avatar {
                continue;
            }
            let text = doc.text_content(link).trim().to_string();
            if text != handle && !(text.starts_with('@') && text.contains(&username)) {
                continue;
            }
            let span = doc
                .query_all(link, &Selector::Tag("span"))
                .into_iter()
                .find(|span| doc.text_content(*span).trim() == handle);
            if let Some(span) = span {
                if write_flag(&coord, popup, &insertion, Placement::After(span)).is_ok() && coord.is_enabled() {
                    coord.set_popup_state(popup, PopupState::Done);
                    return true;
                }
            }
        }
        debug!("Stashed flag for {} found no anchor", username);
        false
    }))
}

/// Strip every flag span from the document.
pub fn remove_all_flags(doc: &Document) -> usize {
    let flags = doc.query_all(doc.root(), &flag_marker());
    for flag in &flags {
        doc.remove(*flag);
    }
    flags.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocationBridge;
    use crate::cache::LocationCache;
    use crate::config::Settings;
    use crate::models::LocationReply;
    use crate::rate_limit::RateLimitWindow;
    use crate::scheduler::Scheduler;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct SlowBridge {
        location: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LocationBridge for SlowBridge {
        async fn fetch_location(&self, _username: &str) -> Result<LocationReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(500)).await;
            Ok(LocationReply::found(self.location.map(String::from)))
        }
    }

    fn coordinator(location: Option<&'static str>) -> (Arc<Coordinator>, Arc<SlowBridge>) {
        let bridge = Arc::new(SlowBridge {
            location,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(LocationCache::new(Arc::new(MemoryStorage::new())));
        let (scheduler, _) = Scheduler::spawn(
            bridge.clone(),
            cache,
            Arc::new(RateLimitWindow::new()),
            Duration::from_secs(2),
            CancellationToken::new(),
        );
        (Coordinator::new(Document::new(), scheduler, Settings::default()), bridge)
    }

    fn card(handle: &str) -> Markup {
        el("div").test_id("UserHoverCard").size(300, 200).child(
            el("div").test_id("UserName").child(
                el("a")
                    .href(&format!("/{}", &handle[1..]))
                    .child(el("span").with_text(handle)),
            ),
        )
    }

    fn mount_card(doc: &Document, handle: &str) -> (NodeId, NodeId) {
        let wrapper = doc
            .mount(doc.root(), &el("div").test_id("hoverCardParent").child(card(handle)))
            .unwrap();
        (wrapper, doc.children(wrapper)[0])
    }

    fn flags_in(doc: &Document, scope: NodeId) -> Vec<String> {
        doc.query_all(scope, &flag_marker())
            .into_iter()
            .map(|f| doc.text_content(f))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn cached_location_is_inserted_after_the_handle() {
        let (coord, bridge) = coordinator(None);
        coord.cache().set("alice", Some("Japan".into())).await;
        let doc = Arc::clone(coord.doc());
        let (_, popup) = mount_card(&doc, "@alice");

        let state = add_flag_to_popup(coord.clone(), popup, "alice".into()).await;

        assert_eq!(state, PopupState::Done);
        assert_eq!(flags_in(&doc, popup), vec![" 🇯🇵 Japan".to_string()]);
        let span = find_username_span(&doc, popup, "alice").unwrap();
        let flag = doc.next_sibling(span).unwrap();
        assert_eq!(doc.attr(flag, FLAG_ATTR).as_deref(), Some("true"));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 0);
        assert!(!coord.is_processing("alice"));

        // second pass is a no-op
        let again = add_flag_to_popup(coord.clone(), popup, "alice".into()).await;
        assert_eq!(again, PopupState::Done);
        assert_eq!(flags_in(&doc, popup).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_location_or_flag_fails() {
        let (coord, _) = coordinator(Some("Middle Earth"));
        let doc = Arc::clone(coord.doc());
        let (_, popup) = mount_card(&doc, "@frodo");

        let state = add_flag_to_popup(coord.clone(), popup, "frodo".into()).await;
        assert_eq!(state, PopupState::Failed);
        assert_eq!(coord.popup_state(popup), PopupState::Failed);
        assert!(flags_in(&doc, doc.root()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_card_waits_on_the_running_lookup() {
        let (coord, bridge) = coordinator(Some("Brazil"));
        let doc = Arc::clone(coord.doc());
        let (_, first) = mount_card(&doc, "@bia");
        let (_, second) = mount_card(&doc, "@bia");

        let running = tokio::spawn(add_flag_to_popup(coord.clone(), first, "bia".into()));
        tokio::task::yield_now().await;
        assert!(coord.is_processing("bia"));

        let state = add_flag_to_popup(coord.clone(), second, "bia".into()).await;
        assert_eq!(state, PopupState::Waiting);

        assert_eq!(running.await.unwrap(), PopupState::Done);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.popup_state(second), PopupState::Done);
        assert_eq!(flags_in(&doc, second).len(), 1);
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_card_stashes_flag_for_the_next_one() {
        let (coord, _) = coordinator(Some("France"));
        let doc = Arc::clone(coord.doc());
        let (wrapper, popup) = mount_card(&doc, "@zoe");

        let task = tokio::spawn(add_flag_to_popup(coord.clone(), popup, "zoe".into()));
        sleep(Duration::from_millis(100)).await;
        doc.remove(wrapper);

        assert_eq!(task.await.unwrap(), PopupState::Failed);
        assert!(flags_in(&doc, doc.root()).is_empty());
        assert!(coord.has_pending("zoe"));

        let (_, fresh) = mount_card(&doc, "@zoe");
        let applied = apply_pending(&coord, fresh, "zoe").unwrap();
        assert!(applied.await.unwrap());
        assert_eq!(flags_in(&doc, fresh), vec![" 🇫🇷 France".to_string()]);
        assert_eq!(coord.popup_state(fresh), PopupState::Done);
        assert!(!coord.has_pending("zoe"));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_link_then_append() {
        let (coord, _) = coordinator(None);
        coord.cache().set("kai", Some("Canada".into())).await;
        coord.cache().set("lea", Some("Germany".into())).await;
        let doc = Arc::clone(coord.doc());

        // handle rendered as bare text inside the link's container
        let wrapper = doc
            .mount(
                doc.root(),
                &el("div").test_id("hoverCardParent").child(
                    el("div")
                        .test_id("HoverCard")
                        .size(10, 10)
                        .child(el("div").child(el("a").href("/kai").with_text("Kai")).with_text("@kai")),
                ),
            )
            .unwrap();
        let popup = doc.children(wrapper)[0];
        assert_eq!(add_flag_to_popup(coord.clone(), popup, "kai".into()).await, PopupState::Done);
        let link = doc.query(popup, &Selector::link_to("kai")).unwrap();
        assert!(doc.next_sibling(link).is_some_and(|n| doc.attr(n, FLAG_ATTR).is_some()));

        // nothing to anchor on at all
        let wrapper = doc
            .mount(
                doc.root(),
                &el("div")
                    .test_id("hoverCardParent")
                    .child(el("div").test_id("HoverCard").size(10, 10).with_text("Lea")),
            )
            .unwrap();
        let popup = doc.children(wrapper)[0];
        assert_eq!(add_flag_to_popup(coord.clone(), popup, "lea".into()).await, PopupState::Done);
        let children = doc.children(popup);
        assert_eq!(doc.attr(*children.last().unwrap(), FLAG_ATTR).as_deref(), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_done_state_self_heals() {
        let (coord, _) = coordinator(None);
        coord.cache().set("max", Some("Spain".into())).await;
        let doc = Arc::clone(coord.doc());
        let (_, popup) = mount_card(&doc, "@max");

        add_flag_to_popup(coord.clone(), popup, "max".into()).await;
        remove_all_flags(&doc);
        sleep(VERIFY_DELAY * 2).await;
        assert_eq!(coord.popup_state(popup), PopupState::Unset);

        coord.set_popup_state(popup, PopupState::Done);
        assert_eq!(add_flag_to_popup(coord.clone(), popup, "max".into()).await, PopupState::Done);
        assert_eq!(flags_in(&doc, popup).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_flag_is_written_once_annotation_is_off() {
        let (coord, _) = coordinator(None);
        let doc = Arc::clone(coord.doc());
        let (_, popup) = mount_card(&doc, "@ana");
        let span = find_username_span(&doc, popup, "ana").unwrap();
        let insertion = PendingInsertion {
            flag: "🇯🇵",
            location: "Japan".into(),
        };

        coord.set_enabled(false);
        assert!(!write_flag(&coord, popup, &insertion, Placement::After(span)).unwrap());
        assert!(flags_in(&doc, doc.root()).is_empty());

        coord.set_enabled(true);
        assert!(write_flag(&coord, popup, &insertion, Placement::After(span)).unwrap());
        assert_eq!(flags_in(&doc, popup).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disabling_races_with_writers_on_other_threads() {
        let (coord, _) = coordinator(None);
        let doc = Arc::clone(coord.doc());
        let cards: Vec<NodeId> = (0..64).map(|i| mount_card(&doc, &format!("@u{}", i)).1).collect();

        let writers: Vec<_> = cards
            .into_iter()
            .enumerate()
            .map(|(i, popup)| {
                let coord = Arc::clone(&coord);
                tokio::spawn(async move {
                    let doc = Arc::clone(coord.doc());
                    let span = find_username_span(&doc, popup, &format!("u{}", i)).unwrap();
                    let insertion = PendingInsertion {
                        flag: "🇪🇸",
                        location: "Spain".into(),
                    };
                    let _ = write_flag(&coord, popup, &insertion, Placement::After(span));
                })
            })
            .collect();

        coord.set_enabled(false);
        for writer in writers {
            writer.await.unwrap();
        }
        assert!(flags_in(&doc, doc.root()).is_empty());
    }

    #[test]
    fn remove_all_flags_strips_every_span() {
        let doc = Document::new();
        let root = doc.root();
        for _ in 0..3 {
            doc.mount(root, &el("span").attr(FLAG_ATTR, "true")).unwrap();
        }
        assert_eq!(remove_all_flags(&doc), 3);
        assert!(doc.query(root, &flag_marker()).is_none());
    }
}
