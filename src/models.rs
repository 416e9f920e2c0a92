use crate::dom::{Markup, NodeId, PointerKind};
use crate::error::FlagError;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// What the bridge hands back for one lookup
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocationReply {
    pub location: Option<String>,
    pub rate_limited: bool,
}

impl LocationReply {
    pub fn found(location: Option<String>) -> Self {
        Self {
            location,
            rate_limited: false,
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            location: None,
            rate_limited: true,
        }
    }
}

// One-time channel the scheduler answers on
pub type Responder = oneshot::Sender<Result<Option<String>, FlagError>>;

// Queued lookup - holds username + response channel
pub struct PendingRequest {
    pub username: String,
    pub respond: Responder,
}

// Control API response for a location lookup
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LocationView {
    pub username: String,
    pub location: Option<String>,
    pub flag: Option<String>,
}

// Runtime message from the options page
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "extensionToggle")]
    ExtensionToggle { enabled: bool },
}

// One outgoing page request, as seen by the header observer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObservedRequest {
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
}

// Page changes fed in from outside the process
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MountRequest {
    /// Defaults to the document root.
    #[serde(default)]
    pub parent: Option<NodeId>,
    pub markup: Markup,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RemoveRequest {
    pub node: NodeId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NavigateRequest {
    pub url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PointerRequest {
    pub target: NodeId,
    pub kind: PointerKind,
    #[serde(default)]
    pub related: Option<NodeId>,
}

// One flag currently on the page
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FlagView {
    pub node: NodeId,
    pub text: String,
}
