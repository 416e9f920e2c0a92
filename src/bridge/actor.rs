//! Privileged side of the bridge.
//!
//! Runs with the page's network identity: it passively captures the headers
//! the page attaches to its own GraphQL traffic and replays them on profile
//! lookups.

use super::{BridgeMessage, MessageSource, RequestId, WindowChannel};
use crate::error::{FlagError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const GRAPHQL_PATH: &str = "/i/api/graphql";
pub const DEFAULT_API_BASE: &str = "https://x.com";
pub const DEFAULT_QUERY_ID: &str = "XRqGa7EeokUU5kppkh13EA";

const CAPTURE_TICK: Duration = Duration::from_millis(100);
// generic headers are installed after this many ticks without a capture
const CAPTURE_FALLBACK_TICKS: u32 = 50;
// a lookup waits at most this many ticks for headers
const LOOKUP_WAIT_TICKS: u32 = 30;

/// Header set replayed on lookups.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderSet(pub BTreeMap<String, String>);

impl HeaderSet {
    pub fn generic() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        HeaderSet(headers)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Holds the most recent headers seen on the page's own API calls.
pub struct HeaderCapture {
    tx: watch::Sender<Option<HeaderSet>>,
}

impl Default for HeaderCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCapture {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Feed one outgoing page request. Only GraphQL API calls are captured.
    pub fn observe_request(&self, url: &str, headers: BTreeMap<String, String>) -> bool {
        if !url.contains(GRAPHQL_PATH) {
            return false;
        }
        let first = self.tx.borrow().is_none();
        self.tx.send_replace(Some(HeaderSet(headers)));
        if first {
            debug!("Captured page API headers");
        }
        true
    }

    pub fn is_ready(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn current(&self) -> Option<HeaderSet> {
        self.tx.borrow().clone()
    }

    fn install_fallback(&self) {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            info!("No page headers captured after waiting, using defaults");
            *slot = Some(HeaderSet::generic());
            true
        });
    }

    /// Headers to use for a lookup, waiting up to `max_wait` for a capture.
    pub async fn wait_ready(&self, max_wait: Duration) -> Option<HeaderSet> {
        let mut rx = self.tx.subscribe();
        let ready = tokio::time::timeout(max_wait, rx.wait_for(|slot| slot.is_some())).await;
        match ready {
            Ok(Ok(headers)) => headers.clone(),
            _ => None,
        }
    }
}

/// Result of one authenticated profile lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum LookupOutcome {
    Found(Option<String>),
    RateLimited {
        reset_time: Option<i64>,
        remaining: Option<String>,
        limit: Option<String>,
    },
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn about_account(&self, screen_name: &str, headers: &HeaderSet) -> Result<LookupOutcome>;
}

/// Lookup through the host's GraphQL `AboutAccountQuery`.
pub struct GraphqlLookup {
    client: reqwest::Client,
    api_base: String,
    query_id: String,
}

impl GraphqlLookup {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, query_id: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            query_id: query_id.into(),
        }
    }

    fn url_for(&self, screen_name: &str) -> Result<reqwest::Url> {
        let variables = serde_json::json!({ "screenName": screen_name }).to_string();
        let base = format!(
            "{}{}/{}/AboutAccountQuery",
            self.api_base, GRAPHQL_PATH, self.query_id
        );
        reqwest::Url::parse_with_params(&base, &[("variables", variables)])
            .map_err(|e| FlagError::Config(format!("bad lookup URL {}: {}", base, e)))
    }
}

#[async_trait]
impl ProfileLookup for GraphqlLookup {
    async fn about_account(&self, screen_name: &str, headers: &HeaderSet) -> Result<LookupOutcome> {
        let mut request = self.client.get(self.url_for(screen_name)?);
        for (name, value) in headers.iter() {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            return Ok(LookupOutcome::RateLimited {
                reset_time: header("x-rate-limit-reset").and_then(|v| v.parse().ok()),
                remaining: header("x-rate-limit-remaining"),
                limit: header("x-rate-limit-limit"),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            warn!("Profile API error for {}: {} {}", screen_name, status, excerpt);
            return Ok(LookupOutcome::Found(None));
        }

        let body: Value = response.json().await?;
        let location = extract_location(&body);
        if location.is_none() && body.pointer("/data/user_result_by_screen_name/result").is_some() {
            debug!("Profile for {} has no about_profile location", screen_name);
        }
        Ok(LookupOutcome::Found(location))
    }
}

/// Pull `account_based_in` out of an `AboutAccountQuery` response.
pub fn extract_location(body: &Value) -> Option<String> {
    body.pointer("/data/user_result_by_screen_name/result/about_profile/account_based_in")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Serves `__fetchLocation` requests posted on the window.
pub struct PrivilegedActor {
    window: WindowChannel,
    capture: Arc<HeaderCapture>,
    lookup: Arc<dyn ProfileLookup>,
}

impl PrivilegedActor {
    pub fn new(window: WindowChannel, capture: Arc<HeaderCapture>, lookup: Arc<dyn ProfileLookup>) -> Self {
        Self {
            window,
            capture,
            lookup,
        }
    }

    /// Start the header fallback timer and the request loop.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let fallback = Arc::clone(&self.capture);
        let fallback_cancel = cancel.clone();
        tokio::spawn(async move {
            for _ in 0..CAPTURE_FALLBACK_TICKS {
                if fallback.is_ready() || fallback_cancel.is_cancelled() {
                    return;
                }
                sleep(CAPTURE_TICK).await;
            }
            fallback.install_fallback();
        });

        // subscribe now so requests posted right after spawn are not lost
        let rx = self.window.subscribe();
        let actor = Arc::new(self);
        tokio::spawn(async move { actor.run(rx, cancel).await })
    }

    async fn run(self: Arc<Self>, mut rx: tokio::sync::broadcast::Receiver<super::Envelope>, cancel: CancellationToken) {
        info!("Privileged actor listening");
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Privileged actor dropped {} messages", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if envelope.source != MessageSource::SameWindow {
                continue;
            }
            if let BridgeMessage::FetchLocation { screen_name, request_id } = envelope.message {
                let actor = Arc::clone(&self);
                tokio::spawn(async move { actor.serve(screen_name, request_id).await });
            }
        }
    }

    async fn serve(&self, screen_name: String, request_id: RequestId) {
        let headers = self
            .capture
            .wait_ready(CAPTURE_TICK * LOOKUP_WAIT_TICKS)
            .await
            .unwrap_or_else(HeaderSet::generic);

        let (location, is_rate_limited) = match self.lookup.about_account(&screen_name, &headers).await {
            Ok(LookupOutcome::Found(location)) => {
                debug!("Extracted location for {}: {:?}", screen_name, location);
                (location, false)
            }
            Ok(LookupOutcome::RateLimited { reset_time, remaining, limit }) => {
                if let Some(reset_time) = reset_time {
                    let wait_time = (reset_time * 1000 - Utc::now().timestamp_millis()).max(0);
                    warn!(
                        "Rate limited (limit {:?}, remaining {:?}), resets in {} minutes",
                        limit,
                        remaining,
                        (wait_time + 59_999) / 60_000
                    );
                    self.window.post(BridgeMessage::RateLimitInfo { reset_time, wait_time });
                }
                (None, true)
            }
            Err(e) => {
                warn!("Error fetching location for {}: {}", screen_name, e);
                (None, false)
            }
        };

        self.window.post(BridgeMessage::LocationResponse {
            screen_name,
            location,
            request_id,
            is_rate_limited,
        });
    }
}
