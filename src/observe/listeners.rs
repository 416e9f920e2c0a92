use super::classify::{
    avatar_container, avatar_image, extract_username_from_avatar, extract_username_from_link, surface_of,
};
use crate::coordinator::Coordinator;
use crate::dom::{Document, NodeId, Selector};
use dashmap::DashMap;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HoverKind {
    /// Profile link: display name or `@handle`.
    Link,
    /// Avatar container or image.
    Avatar,
}

/// What an instrumented element hovers for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoverBinding {
    pub username: String,
    pub kind: HoverKind,
}

/// Elements already instrumented with hover handling. Rescans run on every
/// mutation burst; this is what keeps them from binding twice.
#[derive(Default)]
pub struct ListenerRegistry {
    bindings: DashMap<NodeId, HoverBinding>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `node`. Returns false if it was already bound.
    pub fn attach(&self, node: NodeId, username: &str, kind: HoverKind) -> bool {
        if self.bindings.contains_key(&node) {
            return false;
        }
        self.bindings.insert(
            node,
            HoverBinding {
                username: username.to_string(),
                kind,
            },
        );
        true
    }

    pub fn get(&self, node: NodeId) -> Option<HoverBinding> {
        self.bindings.get(&node).map(|b| b.value().clone())
    }

    pub fn is_bound(&self, node: NodeId) -> bool {
        self.bindings.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Forget elements the page has thrown away.
    pub fn prune(&self, doc: &Document) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|node, _| doc.is_connected(*node));
        before - self.bindings.len()
    }

    pub fn clear(&self) {
        self.bindings.clear();
    }
}

/// Scan the document and bind every username link, avatar container and
/// avatar image not bound yet. Returns how many new bindings were made.
pub fn setup_hover_listeners(coord: &Coordinator) -> usize {
    if !coord.is_enabled() {
        return 0;
    }
    let doc = coord.doc();
    let settings = coord.settings();
    let registry = coord.listeners();
    let root = doc.root();
    let allowed = |node: NodeId| settings.allows(surface_of(doc, node));
    let mut added = 0;

    let mut bind = |node: NodeId, username: &str, kind: HoverKind| {
        if allowed(node) && registry.attach(node, username, kind) {
            added += 1;
        }
    };

    for link in doc.query_all(root, &Selector::ProfileLink) {
        if registry.is_bound(link) {
            continue;
        }
        if let Some(username) = extract_username_from_link(doc, link) {
            bind(link, &username, HoverKind::Link);
        }
    }

    for container in doc.query_all(root, &avatar_container()) {
        if registry.is_bound(container) {
            continue;
        }
        let username = match doc.query(container, &Selector::ProfileLink) {
            Some(link) => extract_username_from_link(doc, link),
            None => extract_username_from_avatar(doc, container),
        };
        if let Some(username) = username {
            bind(container, &username, HoverKind::Avatar);
        }
    }

    for img in doc.query_all(root, &avatar_image()) {
        if registry.is_bound(img) {
            continue;
        }
        let username = match doc.closest(img, &Selector::ProfileLink) {
            Some(link) => extract_username_from_link(doc, link),
            None => extract_username_from_avatar(doc, img),
        };
        if let Some(username) = username {
            bind(img, &username, HoverKind::Avatar);
        }
    }

    if added > 0 {
        debug!("Attached {} hover listeners ({} total)", added, registry.len());
    }
    added
}
