//! Cross-realm messaging between the observer and the privileged actor.
//!
//! The two sides share a window-level message bus. The observer posts
//! `__fetchLocation`, the actor answers with `__locationResponse` and, on a
//! 429, an unsolicited `__rateLimitInfo`. Messages carry a source tag; only
//! same-window messages are acted upon.

pub mod actor;
pub mod client;

pub use actor::{GraphqlLookup, HeaderCapture, HeaderSet, LookupOutcome, PrivilegedActor, ProfileLookup};
pub use client::BridgeClient;

use crate::error::Result;
use crate::models::LocationReply;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Correlation token for one lookup: wall-clock millis, a process-wide
/// sequence number and a random suffix, so two lookups for the same user
/// never share an id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        RequestId(format!(
            "{}.{}.{:08x}",
            Utc::now().timestamp_millis(),
            seq,
            rand::random::<u32>()
        ))
    }
}

/// Wire messages. Tags and field names match what the page-side script posts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "__fetchLocation", rename_all = "camelCase")]
    FetchLocation {
        screen_name: String,
        request_id: RequestId,
    },
    #[serde(rename = "__locationResponse", rename_all = "camelCase")]
    LocationResponse {
        screen_name: String,
        location: Option<String>,
        request_id: RequestId,
        #[serde(default)]
        is_rate_limited: bool,
    },
    #[serde(rename = "__rateLimitInfo", rename_all = "camelCase")]
    RateLimitInfo { reset_time: i64, wait_time: i64 },
}

/// Who posted a message. Only `SameWindow` traffic is trusted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageSource {
    SameWindow,
    Foreign(String),
}

#[derive(Clone, Debug)]
pub struct Envelope {
    pub source: MessageSource,
    pub message: BridgeMessage,
}

/// Window-level message bus shared by both realms.
#[derive(Clone)]
pub struct WindowChannel {
    tx: broadcast::Sender<Envelope>,
}

impl Default for WindowChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Post from this window. Delivery to zero listeners is not an error,
    /// same as `postMessage`.
    pub fn post(&self, message: BridgeMessage) {
        self.post_from(MessageSource::SameWindow, message);
    }

    pub fn post_from(&self, source: MessageSource, message: BridgeMessage) {
        let _ = self.tx.send(Envelope { source, message });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

/// Anything that can resolve a username to a location on the observer side.
#[async_trait]
pub trait LocationBridge: Send + Sync {
    async fn fetch_location(&self, username: &str) -> Result<LocationReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_use_page_script_field_names() {
        let msg = BridgeMessage::LocationResponse {
            screen_name: "alice".into(),
            location: Some("Japan".into()),
            request_id: RequestId("1.0.abc".into()),
            is_rate_limited: false,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "__locationResponse",
                "screenName": "alice",
                "location": "Japan",
                "requestId": "1.0.abc",
                "isRateLimited": false
            })
        );

        // the page script omits isRateLimited on transport errors
        let parsed: BridgeMessage = serde_json::from_value(json!({
            "type": "__locationResponse",
            "screenName": "bob",
            "location": null,
            "requestId": "2.1.def"
        }))
        .unwrap();
        assert!(matches!(
            parsed,
            BridgeMessage::LocationResponse { is_rate_limited: false, location: None, .. }
        ));

        let info: BridgeMessage = serde_json::from_value(json!({
            "type": "__rateLimitInfo", "resetTime": 1700000000, "waitTime": 5000
        }))
        .unwrap();
        assert_eq!(
            info,
            BridgeMessage::RateLimitInfo { reset_time: 1_700_000_000, wait_time: 5000 }
        );
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }
}
