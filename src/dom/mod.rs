//! In-process model of the host page's document.
//!
//! The pipeline never owns the page: it reads structure, listens for
//! mutations and pointer events, and writes only its own annotation spans.
//! Nodes are addressed by [`NodeId`], which is never reused, so an id held
//! across an await point stays meaningful after the node is detached.

pub mod selector;
pub mod wait;

pub use selector::Selector;
pub use wait::{WaitOptions, WaitOutcome, wait_for};

use crate::error::{FlagError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::Duration;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// One display frame; callbacks deferred "to the next frame" sleep this long.
pub const FRAME: Duration = Duration::from_millis(16);

/// Wait for the next animation frame.
pub async fn animation_frame() {
    tokio::time::sleep(FRAME).await;
}

/// Wait for the next mutation and drain everything queued behind it, the
/// way an observer callback receives one batch. `None` once the document
/// is gone.
pub async fn next_batch(rx: &mut broadcast::Receiver<Mutation>) -> Option<Vec<Mutation>> {
    let first = loop {
        match rx.recv().await {
            Ok(mutation) => break mutation,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Mutation subscriber lagged by {} records", skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    };

    let mut batch = vec![first];
    loop {
        match rx.try_recv() {
            Ok(mutation) => batch.push(mutation),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    Some(batch)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

/// Structural change seen under the document root.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    ChildAdded { parent: NodeId, node: NodeId },
    ChildRemoved { parent: NodeId, node: NodeId },
    TextChanged { node: NodeId },
    Navigated { url: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PointerKind {
    Enter,
    Leave,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PointerEvent {
    pub target: NodeId,
    pub kind: PointerKind,
    /// Element the pointer came from, set on synthetic events.
    pub related: Option<NodeId>,
}

/// Declarative subtree, mounted in one step with [`Document::mount`].
///
/// In JSON a text node is a bare string and an element is an object:
/// `{"tag": "a", "attrs": [["href", "/alice"]], "children": ["@alice"]}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Markup {
    Text(String),
    Element {
        tag: String,
        #[serde(default)]
        attrs: Vec<(String, String)>,
        #[serde(default)]
        size: (u32, u32),
        #[serde(default)]
        children: Vec<Markup>,
    },
}

/// Where a new node goes relative to an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Next sibling of the given node.
    After(NodeId),
    /// Last child of the given node.
    Append(NodeId),
}

/// Shorthand for [`Markup::element`].
pub fn el(tag: &str) -> Markup {
    Markup::element(tag)
}

impl Markup {
    pub fn element(tag: &str) -> Self {
        Markup::Element {
            tag: tag.to_string(),
            attrs: Vec::new(),
            size: (0, 0),
            children: Vec::new(),
        }
    }

    pub fn text(text: &str) -> Self {
        Markup::Text(text.to_string())
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        if let Markup::Element { attrs, .. } = &mut self {
            attrs.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn test_id(self, id: &str) -> Self {
        self.attr("data-testid", id)
    }

    pub fn href(self, href: &str) -> Self {
        self.attr("href", href)
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        if let Markup::Element { size, .. } = &mut self {
            *size = (width, height);
        }
        self
    }

    pub fn child(mut self, child: Markup) -> Self {
        if let Markup::Element { children, .. } = &mut self {
            children.push(child);
        }
        self
    }

    pub fn with_text(self, text: &str) -> Self {
        self.child(Markup::text(text))
    }
}

#[derive(Debug)]
enum NodeKind {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
        size: (u32, u32),
    },
    Text(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
    url: String,
}

impl Tree {
    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                kind,
                parent: None,
                children: Vec::new(),
            },
        );
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FlagError::Dom(format!("unknown node {:?}", id)))
    }

    fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    fn is_connected(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.root {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    fn contains(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    // preorder, scope itself excluded
    fn descendants(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.nodes.get(&scope) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, attrs, .. }) => {
                selector.matches(tag, &|name: &str| attrs.get(name).cloned())
            }
            _ => false,
        }
    }

    fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let Some(Node { kind: NodeKind::Text(text), .. }) = self.nodes.get(&id) {
            out.push_str(text);
            return out;
        }
        for node in self.descendants(id) {
            if let Some(Node { kind: NodeKind::Text(text), .. }) = self.nodes.get(&node) {
                out.push_str(text);
            }
        }
        out
    }

    fn detach(&mut self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != id);
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.parent = None;
        }
        Some(parent)
    }

    // Link `node` in at `at`. Returns the mutation records to broadcast.
    fn place(&mut self, at: Placement, node: NodeId) -> Result<Vec<Mutation>> {
        let parent = match at {
            Placement::Append(parent) => parent,
            Placement::After(reference) => self
                .parent(reference)
                .ok_or_else(|| FlagError::Dom("reference node has no parent".into()))?,
        };
        self.check_insertable(parent, node)?;

        let mut events = Vec::new();
        if let Some(old) = self.detach(node) {
            if self.is_connected(old) {
                events.push(Mutation::ChildRemoved { parent: old, node });
            }
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            let index = match at {
                Placement::Append(_) => p.children.len(),
                Placement::After(reference) => p
                    .children
                    .iter()
                    .position(|c| *c == reference)
                    .map(|i| i + 1)
                    .unwrap_or(p.children.len()),
            };
            p.children.insert(index, node);
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            n.parent = Some(parent);
        }
        if self.is_connected(parent) {
            events.push(Mutation::ChildAdded { parent, node });
        }
        Ok(events)
    }

    // Drop `id` and its subtree from the arena. The root is never freed.
    fn free(&mut self, id: NodeId) -> usize {
        if id == self.root {
            return 0;
        }
        let mut doomed = self.descendants(id);
        doomed.push(id);
        doomed.iter().filter(|n| self.nodes.remove(n).is_some()).count()
    }

    fn check_insertable(&self, parent: NodeId, child: NodeId) -> Result<()> {
        match &self.node(parent)?.kind {
            NodeKind::Element { .. } => {}
            NodeKind::Text(_) => return Err(FlagError::Dom("text nodes have no children".into())),
        }
        self.node(child)?;
        if self.contains(child, parent) {
            return Err(FlagError::Dom("insertion would create a cycle".into()));
        }
        Ok(())
    }

    fn build(&mut self, markup: &Markup) -> NodeId {
        match markup {
            Markup::Text(text) => self.alloc(NodeKind::Text(text.clone())),
            Markup::Element { tag, attrs, size, children } => {
                let id = self.alloc(NodeKind::Element {
                    tag: tag.clone(),
                    attrs: attrs.iter().cloned().collect(),
                    size: *size,
                });
                for child in children {
                    let child_id = self.build(child);
                    if let Some(n) = self.nodes.get_mut(&child_id) {
                        n.parent = Some(id);
                    }
                    if let Some(n) = self.nodes.get_mut(&id) {
                        n.children.push(child_id);
                    }
                }
                id
            }
        }
    }
}

/// Shared handle to the page document.
pub struct Document {
    tree: Mutex<Tree>,
    mutations: broadcast::Sender<Mutation>,
    pointer: broadcast::Sender<PointerEvent>,
}

impl Document {
    pub fn new() -> Arc<Self> {
        let mut tree = Tree {
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
            url: "https://x.com/home".to_string(),
        };
        tree.root = tree.alloc(NodeKind::Element {
            tag: "body".to_string(),
            attrs: BTreeMap::new(),
            size: (0, 0),
        });

        let (mutations, _) = broadcast::channel(EVENT_CAPACITY);
        let (pointer, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            tree: Mutex::new(tree),
            mutations,
            pointer,
        })
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, mutation: Mutation) {
        let _ = self.mutations.send(mutation);
    }

    pub fn root(&self) -> NodeId {
        self.tree().root
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Mutation> {
        self.mutations.subscribe()
    }

    pub fn subscribe_pointer(&self) -> broadcast::Receiver<PointerEvent> {
        self.pointer.subscribe()
    }

    pub fn url(&self) -> String {
        self.tree().url.clone()
    }

    pub fn set_url(&self, url: &str) {
        {
            let mut tree = self.tree();
            if tree.url == url {
                return;
            }
            tree.url = url.to_string();
        }
        self.emit(Mutation::Navigated { url: url.to_string() });
    }

    pub fn create_element(&self, tag: &str) -> NodeId {
        self.tree().alloc(NodeKind::Element {
            tag: tag.to_string(),
            attrs: BTreeMap::new(),
            size: (0, 0),
        })
    }

    pub fn create_text(&self, text: &str) -> NodeId {
        self.tree().alloc(NodeKind::Text(text.to_string()))
    }

    /// Build `markup` as a detached subtree.
    pub fn create(&self, markup: &Markup) -> NodeId {
        self.tree().build(markup)
    }

    /// Build `markup` and append it under `parent` as a single insertion.
    pub fn mount(&self, parent: NodeId, markup: &Markup) -> Result<NodeId> {
        let id = self.create(markup);
        self.append_child(parent, id)?;
        Ok(id)
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let events = self.tree().place(Placement::Append(parent), child)?;
        events.into_iter().for_each(|m| self.emit(m));
        Ok(())
    }

    /// Insert `node` as the next sibling of `reference`.
    pub fn insert_after(&self, reference: NodeId, node: NodeId) -> Result<()> {
        let events = self.tree().place(Placement::After(reference), node)?;
        events.into_iter().for_each(|m| self.emit(m));
        Ok(())
    }

    /// Build `markup` and place it in one step under the document lock.
    /// Nothing is written, and `Ok(None)` returned, when `scope` already
    /// holds an element matching `unless`, or when `proceed` answers false.
    pub fn place_unique(
        &self,
        markup: &Markup,
        at: Placement,
        scope: NodeId,
        unless: &Selector,
        proceed: impl FnOnce() -> bool,
    ) -> Result<Option<NodeId>> {
        let (node, events) = {
            let mut tree = self.tree();
            let taken = tree
                .descendants(scope)
                .into_iter()
                .any(|id| tree.matches(id, unless));
            if taken || !proceed() {
                return Ok(None);
            }
            let node = tree.build(markup);
            match tree.place(at, node) {
                Ok(events) => (node, events),
                Err(e) => {
                    tree.free(node);
                    return Err(e);
                }
            }
        };
        events.into_iter().for_each(|m| self.emit(m));
        Ok(Some(node))
    }

    /// Remove `node` and its subtree from the document for good. Ids of
    /// removed nodes stay unknown afterwards: they are never reused and every
    /// lookup on them answers as for a detached node.
    pub fn remove(&self, node: NodeId) {
        let event = {
            let mut tree = self.tree();
            let was_connected = tree.is_connected(node);
            let parent = tree.detach(node);
            tree.free(node);
            match parent {
                Some(parent) if was_connected => Some(Mutation::ChildRemoved { parent, node }),
                _ => None,
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// `node` followed by its descendants, in document order.
    pub fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        let tree = self.tree();
        if !tree.nodes.contains_key(&node) {
            return Vec::new();
        }
        let mut out = vec![node];
        out.extend(tree.descendants(node));
        out
    }

    /// Number of live nodes in the arena, root included.
    pub fn node_count(&self) -> usize {
        self.tree().nodes.len()
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.tree().is_connected(node)
    }

    /// True if `node` is `ancestor` or lies beneath it.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.tree().contains(ancestor, node)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree().parent(node)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let tree = self.tree();
        let parent = tree.parent(node)?;
        let siblings = &tree.nodes.get(&parent)?.children;
        let index = siblings.iter().position(|c| *c == node)?;
        siblings.get(index + 1).copied()
    }

    pub fn tag(&self, node: NodeId) -> Option<String> {
        match &self.tree().nodes.get(&node)?.kind {
            NodeKind::Element { tag, .. } => Some(tag.clone()),
            NodeKind::Text(_) => None,
        }
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<String> {
        match &self.tree().nodes.get(&node)?.kind {
            NodeKind::Element { attrs, .. } => attrs.get(name).cloned(),
            NodeKind::Text(_) => None,
        }
    }

    pub fn set_attr(&self, node: NodeId, name: &str, value: &str) {
        if let Some(Node { kind: NodeKind::Element { attrs, .. }, .. }) = self.tree().nodes.get_mut(&node) {
            attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attr(&self, node: NodeId, name: &str) {
        if let Some(Node { kind: NodeKind::Element { attrs, .. }, .. }) = self.tree().nodes.get_mut(&node) {
            attrs.remove(name);
        }
    }

    /// Replace the contents of a text node.
    pub fn set_text(&self, node: NodeId, text: &str) {
        let connected = {
            let mut tree = self.tree();
            match tree.nodes.get_mut(&node) {
                Some(Node { kind: NodeKind::Text(current), .. }) => {
                    *current = text.to_string();
                }
                _ => return,
            }
            tree.is_connected(node)
        };
        if connected {
            self.emit(Mutation::TextChanged { node });
        }
    }

    /// Concatenated text of `node` and everything under it.
    pub fn text_content(&self, node: NodeId) -> String {
        self.tree().text_content(node)
    }

    pub fn set_rendered_size(&self, node: NodeId, width: u32, height: u32) {
        if let Some(Node { kind: NodeKind::Element { size, .. }, .. }) = self.tree().nodes.get_mut(&node) {
            *size = (width, height);
        }
    }

    pub fn rendered_size(&self, node: NodeId) -> (u32, u32) {
        match self.tree().nodes.get(&node).map(|n| &n.kind) {
            Some(NodeKind::Element { size, .. }) => *size,
            _ => (0, 0),
        }
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        self.tree().matches(node, selector)
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let tree = self.tree();
        let mut current = Some(node);
        while let Some(id) = current {
            if tree.matches(id, selector) {
                return Some(id);
            }
            current = tree.parent(id);
        }
        None
    }

    /// First descendant of `scope` matching `selector`, in document order.
    pub fn query(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        let tree = self.tree();
        tree.descendants(scope)
            .into_iter()
            .find(|id| tree.matches(*id, selector))
    }

    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        let tree = self.tree();
        tree.descendants(scope)
            .into_iter()
            .filter(|id| tree.matches(*id, selector))
            .collect()
    }

    /// Deliver a pointer event to whoever listens on this document.
    pub fn dispatch(&self, target: NodeId, kind: PointerKind) {
        self.dispatch_from(target, kind, None);
    }

    pub fn dispatch_from(&self, target: NodeId, kind: PointerKind, related: Option<NodeId>) {
        let _ = self.pointer.send(PointerEvent { target, kind, related });
    }
}
