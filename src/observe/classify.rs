//! Markup classification: which elements name a user, which element is the
//! live hover card, and which page surface an element sits on.

use crate::dom::{Document, NodeId, Selector};

/// Attribute carried by every flag span this crate inserts.
pub const FLAG_ATTR: &str = "data-twitter-flag";

// Routes that look like `/name` but are not profiles
const RESERVED_ROUTES: &[&str] = &[
    "home",
    "explore",
    "notifications",
    "messages",
    "i",
    "compose",
    "search",
    "settings",
    "bookmarks",
    "lists",
    "communities",
    "hashtag",
];

const MAX_USERNAME_LEN: usize = 20;
const MAX_ANCESTOR_WALK: usize = 10;

pub fn user_name_container() -> Selector {
    Selector::AnyOf(vec![Selector::TestId("UserName"), Selector::TestId("User-Name")])
}

pub fn avatar_container() -> Selector {
    Selector::TestIdContains("Avatar")
}

pub fn avatar_image() -> Selector {
    Selector::AnyOf(vec![
        Selector::ImgSrcContains("profile_images"),
        Selector::ImgSrcContains("twimg.com"),
    ])
}

pub fn hover_card_parent() -> Selector {
    Selector::TestId("hoverCardParent")
}

pub fn hover_card() -> Selector {
    Selector::AnyOf(vec![Selector::TestId("UserHoverCard"), Selector::TestId("HoverCard")])
}

pub fn flag_marker() -> Selector {
    Selector::HasAttr(FLAG_ATTR)
}

pub fn tweet_article() -> Selector {
    Selector::TestId("tweet")
}

/// Candidate username from an href: first path segment, minus reserved
/// routes, numeric ids and anything too long to be a handle.
pub fn username_from_href(href: &str) -> Option<String> {
    let segment = href
        .strip_prefix('/')?
        .split(['/', '?'])
        .next()
        .filter(|s| !s.is_empty())?;

    let reserved = RESERVED_ROUTES.contains(&segment)
        || segment.starts_with("hashtag")
        || segment.starts_with("search")
        || segment.contains("status")
        || segment.chars().all(|c| c.is_ascii_digit())
        || segment.chars().count() >= MAX_USERNAME_LEN;
    if reserved {
        return None;
    }
    Some(segment.to_string())
}

/// Username for an anchor, but only when the anchor actually names a user:
/// inside a name container, showing `@handle` text, or acting as an avatar.
pub fn extract_username_from_link(doc: &Document, link: NodeId) -> Option<String> {
    let username = username_from_href(&doc.attr(link, "href")?)?;

    if doc.closest(link, &user_name_container()).is_some() {
        return Some(username);
    }

    let text = doc.text_content(link);
    if text.trim().starts_with('@') {
        return Some(username);
    }

    let avatar_link = doc.attr(link, "aria-hidden").as_deref() == Some("true")
        || doc.closest(link, &avatar_container()).is_some()
        || doc.query(link, &avatar_image()).is_some();
    avatar_link.then_some(username)
}

/// Username behind an avatar element, trying progressively looser sources.
pub fn extract_username_from_avatar(doc: &Document, avatar: NodeId) -> Option<String> {
    let from_link = |link: Option<NodeId>| link.and_then(|l| extract_username_from_link(doc, l));

    let enclosing = doc.closest(avatar, &Selector::ProfileLink).or_else(|| {
        doc.parent(avatar)
            .filter(|_| doc.tag(avatar).as_deref() == Some("img"))
            .and_then(|p| doc.closest(p, &Selector::ProfileLink))
    });
    if let Some(username) = from_link(enclosing) {
        return Some(username);
    }

    if let Some(container) = doc.closest(avatar, &avatar_container()) {
        if let Some(username) = from_link(doc.query(container, &Selector::ProfileLink)) {
            return Some(username);
        }
    }

    if let Some(container) = doc.closest(avatar, &user_name_container()) {
        let found = doc
            .query_all(container, &Selector::ProfileLink)
            .into_iter()
            .find_map(|link| extract_username_from_link(doc, link));
        if found.is_some() {
            return found;
        }
    }

    let mut current = doc.parent(avatar);
    for _ in 0..MAX_ANCESTOR_WALK {
        let Some(node) = current else { break };
        if let Some(username) = from_link(doc.query(node, &Selector::ProfileLink)) {
            return Some(username);
        }
        current = doc.parent(node);
    }
    None
}

/// The hover card currently on screen. Off-screen template copies have no
/// rendered size or sit outside the hover-card wrapper and are skipped.
pub fn find_profile_popup(doc: &Document) -> Option<NodeId> {
    let root = doc.root();
    [Selector::TestId("UserHoverCard"), Selector::TestId("HoverCard")]
        .iter()
        .filter_map(|selector| doc.query(root, selector))
        .find(|popup| {
            let (width, height) = doc.rendered_size(*popup);
            width > 0 && height > 0 && doc.closest(*popup, &hover_card_parent()).is_some()
        })
}

/// True if `node` is, or contains, a hover-card wrapper holding a card.
pub fn contains_hover_card(doc: &Document, node: NodeId) -> bool {
    let parent = if doc.matches(node, &hover_card_parent()) {
        Some(node)
    } else {
        doc.query(node, &hover_card_parent())
    };
    parent.is_some_and(|p| doc.query(p, &hover_card()).is_some())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    Tweet,
    Reply,
    Other,
}

/// Which display toggle governs `node`.
pub fn surface_of(doc: &Document, node: NodeId) -> Surface {
    match doc.closest(node, &tweet_article()) {
        Some(article) if doc.text_content(article).contains("Replying to") => Surface::Reply,
        Some(_) => Surface::Tweet,
        None => Surface::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::el;

    #[test]
    fn href_filtering() {
        assert_eq!(username_from_href("/alice").as_deref(), Some("alice"));
        assert_eq!(username_from_href("/alice?s=20").as_deref(), Some("alice"));
        assert_eq!(username_from_href("/alice/status/123").as_deref(), Some("alice"));
        for rejected in [
            "/home",
            "/i",
            "/explore",
            "/hashtag_x",
            "/searchy",
            "/123456",
            "/status_page",
            "/abcdefghijklmnopqrst",
            "/",
            "https://x.com/alice",
        ] {
            assert_eq!(username_from_href(rejected), None, "{}", rejected);
        }
    }

    #[test]
    fn length_limit_counts_characters() {
        // 10 characters, 20 bytes
        let name = "éééééééééé";
        assert_eq!(name.len(), 20);
        assert_eq!(username_from_href(&format!("/{}", name)).as_deref(), Some(name));
        assert_eq!(username_from_href(&format!("/{}", "é".repeat(20))), None);
    }

    #[test]
    fn links_must_look_like_user_references() {
        let doc = Document::new();
        let root = doc.root();
        let named = doc
            .mount(root, &el("div").test_id("User-Name").child(el("a").href("/alice").with_text("Alice")))
            .unwrap();
        let handle = doc.mount(root, &el("a").href("/bob").with_text(" @bob ")).unwrap();
        let hidden = doc.mount(root, &el("a").href("/carol").attr("aria-hidden", "true")).unwrap();
        let plain = doc.mount(root, &el("a").href("/dave").with_text("Dave's post")).unwrap();

        let named_link = doc.children(named)[0];
        assert_eq!(extract_username_from_link(&doc, named_link).as_deref(), Some("alice"));
        assert_eq!(extract_username_from_link(&doc, handle).as_deref(), Some("bob"));
        assert_eq!(extract_username_from_link(&doc, hidden).as_deref(), Some("carol"));
        assert_eq!(extract_username_from_link(&doc, plain), None);
    }

    #[test]
    fn avatar_falls_back_to_nearby_links() {
        let doc = Document::new();
        let block = doc
            .mount(
                doc.root(),
                &el("article").child(
                    el("div")
                        .child(el("div").child(el("img").attr("src", "https://pbs.twimg.com/profile_images/1.jpg")))
                        .child(el("a").href("/erin").with_text("@erin")),
                ),
            )
            .unwrap();
        let img = doc.query(block, &avatar_image()).unwrap();

        assert_eq!(extract_username_from_avatar(&doc, img).as_deref(), Some("erin"));
    }

    #[test]
    fn avatar_inside_link_uses_that_link() {
        let doc = Document::new();
        let container = doc
            .mount(
                doc.root(),
                &el("div")
                    .test_id("Tweet-User-Avatar")
                    .child(el("a").href("/frank").child(el("img").attr("src", "https://pbs.twimg.com/x.jpg"))),
            )
            .unwrap();
        let img = doc.query(container, &Selector::Tag("img")).unwrap();
        assert_eq!(extract_username_from_avatar(&doc, img).as_deref(), Some("frank"));
        assert_eq!(extract_username_from_avatar(&doc, container).as_deref(), Some("frank"));
    }

    #[test]
    fn popup_needs_size_and_wrapper() {
        let doc = Document::new();
        let root = doc.root();
        // template copy with no wrapper
        doc.mount(root, &el("div").test_id("HoverCard").size(300, 200)).unwrap();
        assert_eq!(find_profile_popup(&doc), None);

        let wrapper = doc
            .mount(root, &el("div").test_id("hoverCardParent").child(el("div").test_id("UserHoverCard")))
            .unwrap();
        let card = doc.children(wrapper)[0];
        assert_eq!(find_profile_popup(&doc), None);

        doc.set_rendered_size(card, 300, 200);
        assert_eq!(find_profile_popup(&doc), Some(card));
        assert!(contains_hover_card(&doc, wrapper));
    }

    #[test]
    fn surfaces() {
        let doc = Document::new();
        let root = doc.root();
        let tweet = doc
            .mount(root, &el("article").test_id("tweet").child(el("a").href("/a")))
            .unwrap();
        let reply = doc
            .mount(
                root,
                &el("article")
                    .test_id("tweet")
                    .child(el("div").with_text("Replying to @a"))
                    .child(el("a").href("/b")),
            )
            .unwrap();
        let elsewhere = doc.mount(root, &el("a").href("/c")).unwrap();

        assert_eq!(surface_of(&doc, doc.children(tweet)[0]), Surface::Tweet);
        assert_eq!(surface_of(&doc, doc.children(reply)[1]), Surface::Reply);
        assert_eq!(surface_of(&doc, elsewhere), Surface::Other);
    }
}
