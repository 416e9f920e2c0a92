use super::{BridgeMessage, Envelope, LocationBridge, MessageSource, RequestId, WindowChannel};
use crate::error::{FlagError, Result};
use crate::models::LocationReply;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

type ListenerKey = (String, RequestId);
type Listeners = DashMap<ListenerKey, oneshot::Sender<LocationReply>>;

/// Observer side of the bridge.
///
/// Each lookup registers one listener keyed by `(username, request id)`,
/// posts the request and waits for the matching response. A single router
/// task reads the window and hands each response to its listener. No answer
/// within the timeout reads as "no location".
#[derive(Clone)]
pub struct BridgeClient {
    window: WindowChannel,
    response_timeout: Duration,
    listeners: Arc<Listeners>,
    _router: Arc<RouterHandle>,
}

// Stops the router once the last client clone is gone
struct RouterHandle(AbortHandle);

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Removes the listener entry however the lookup ends
struct ListenerGuard<'a> {
    listeners: &'a Listeners,
    key: ListenerKey,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.listeners.remove(&self.key);
    }
}

impl BridgeClient {
    /// Must be called inside a tokio runtime: the reply router is spawned here.
    pub fn new(window: WindowChannel) -> Self {
        Self::with_timeout(window, RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(window: WindowChannel, response_timeout: Duration) -> Self {
        let listeners = Arc::new(Listeners::new());
        // subscribed before any request is posted, so no reply can slip past
        let rx = window.subscribe();
        let router = tokio::spawn(route_replies(rx, Arc::clone(&listeners)));
        Self {
            window,
            response_timeout,
            listeners,
            _router: Arc::new(RouterHandle(router.abort_handle())),
        }
    }

    /// Listeners currently waiting for a response.
    pub fn pending_listeners(&self) -> usize {
        self.listeners.len()
    }
}

async fn route_replies(mut rx: broadcast::Receiver<Envelope>, listeners: Arc<Listeners>) {
    loop {
        let envelope = match rx.recv().await {
            Ok(envelope) => envelope,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Bridge reply router lagged, {} window messages dropped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if envelope.source != MessageSource::SameWindow {
            continue;
        }
        if let BridgeMessage::LocationResponse {
            screen_name,
            location,
            request_id,
            is_rate_limited,
        } = envelope.message
        {
            let Some((_, listener)) = listeners.remove(&(screen_name, request_id)) else {
                continue;
            };
            let _ = listener.send(LocationReply {
                location,
                rate_limited: is_rate_limited,
            });
        }
    }
}

#[async_trait]
impl LocationBridge for BridgeClient {
    async fn fetch_location(&self, username: &str) -> Result<LocationReply> {
        let request_id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        let key = (username.to_string(), request_id.clone());
        self.listeners.insert(key.clone(), tx);
        let _guard = ListenerGuard {
            listeners: &self.listeners,
            key,
        };

        self.window.post(BridgeMessage::FetchLocation {
            screen_name: username.to_string(),
            request_id,
        });

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(FlagError::ChannelClosed("bridge reply router")),
            Err(_) => {
                debug!("No bridge response for {} within {:?}", username, self.response_timeout);
                Ok(LocationReply::default())
            }
        }
    }
}
