use crate::error::Result;
use crate::metrics::CACHE_SIZE;
use crate::storage::Storage;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const CACHE_KEY: &str = "twitter_location_cache";
pub const CACHE_EXPIRY_DAYS: i64 = 30;

// Cache entry with timestamps
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub username: String,
    pub location: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// On-disk shape, epoch millis
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub location: Option<String>,
    pub expiry: i64,
    #[serde(default)]
    pub cached_at: Option<i64>,
}

/// Username -> last known location, mirrored in memory for synchronous reads
/// and written through to durable storage.
pub struct LocationCache {
    entries: DashMap<String, CacheEntry>,
    storage: Arc<dyn Storage>,
    ttl: Duration,
}

impl LocationCache {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            entries: DashMap::new(),
            storage,
            ttl: Duration::days(CACHE_EXPIRY_DAYS),
        }
    }

    /// Fill the mirror from durable storage. Expired and empty entries are
    /// skipped; a storage failure leaves the cache cold.
    pub async fn load(&self) -> usize {
        let stored = match self.read_stored().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Location cache load failed, starting cold: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut loaded = 0;
        for (username, raw) in stored {
            // one malformed entry should not cost us the rest
            let Ok(entry) = serde_json::from_value::<StoredEntry>(raw) else {
                debug!("Skipping malformed cache entry for {}", username);
                continue;
            };
            let Some(location) = entry.location else { continue };
            let Some(expires_at) = from_millis(entry.expiry) else { continue };
            if expires_at <= now {
                continue;
            }

            let cached_at = entry.cached_at.and_then(from_millis).unwrap_or(now);
            self.entries.insert(
                username.clone(),
                CacheEntry {
                    username,
                    location: Some(location),
                    cached_at,
                    expires_at,
                },
            );
            loaded += 1;
        }

        CACHE_SIZE.set(self.entries.len() as f64);
        debug!("Loaded {} cached locations", loaded);
        loaded
    }

    /// Known location for `username`. Empty and expired entries are dropped
    /// here and read as absent.
    pub fn get(&self, username: &str) -> Option<String> {
        let (location, expired) = {
            let entry = self.entries.get(username)?;
            (entry.location.clone(), Utc::now() > entry.expires_at)
        };

        if location.is_none() || expired {
            self.entries.remove(username);
            CACHE_SIZE.set(self.entries.len() as f64);
            return None;
        }
        location
    }

    pub fn entry(&self, username: &str) -> Option<CacheEntry> {
        self.entries.get(username).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a resolution and write it through to storage, merging into the
    /// stored map. Empty results stay memory-only. If the direct write fails
    /// the whole mirror is flushed instead.
    pub async fn set(&self, username: &str, location: Option<String>) {
        let now = Utc::now();
        self.entries.insert(
            username.to_string(),
            CacheEntry {
                username: username.to_string(),
                location: location.clone(),
                cached_at: now,
                expires_at: now + self.ttl,
            },
        );
        CACHE_SIZE.set(self.entries.len() as f64);

        let Some(location) = location else { return };

        if let Err(e) = self.write_entry(username, location, now).await {
            warn!("Cache write for {} failed, falling back to flush: {}", username, e);
            self.flush_all().await;
        }
    }

    /// Bulk write of the whole mirror. Entries already in storage keep their
    /// original `cachedAt`; every expiry slides to now + 30 days.
    pub async fn flush_all(&self) {
        let existing = self.read_stored().await.unwrap_or_default();
        let now = Utc::now();
        let expiry = (now + self.ttl).timestamp_millis();

        let mut out = Map::new();
        for entry in self.entries.iter() {
            let Some(location) = entry.location.clone() else { continue };
            let cached_at = existing
                .get(entry.key())
                .and_then(|raw| raw.get("cachedAt"))
                .and_then(Value::as_i64)
                .unwrap_or_else(|| now.timestamp_millis());

            let stored = StoredEntry {
                location: Some(location),
                expiry,
                cached_at: Some(cached_at),
            };
            match serde_json::to_value(&stored) {
                Ok(v) => {
                    out.insert(entry.key().clone(), v);
                }
                Err(e) => warn!("Could not serialize cache entry {}: {}", entry.key(), e),
            }
        }

        let count = out.len();
        match self.storage.set(CACHE_KEY, Value::Object(out)).await {
            Ok(()) => debug!("Flushed {} cached locations", count),
            Err(e) => warn!("Location cache flush failed: {}", e),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        CACHE_SIZE.set(0.0);
    }

    async fn read_stored(&self) -> Result<Map<String, Value>> {
        match self.storage.get(CACHE_KEY).await? {
            Some(Value::Object(map)) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    async fn write_entry(&self, username: &str, location: String, now: DateTime<Utc>) -> Result<()> {
        let mut stored = self.read_stored().await?;
        let entry = StoredEntry {
            location: Some(location),
            expiry: (now + self.ttl).timestamp_millis(),
            cached_at: Some(now.timestamp_millis()),
        };
        stored.insert(username.to_string(), serde_json::to_value(&entry)?);
        self.storage.set(CACHE_KEY, Value::Object(stored)).await
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn cache_with(storage: &Arc<MemoryStorage>) -> LocationCache {
        LocationCache::new(storage.clone())
    }

    #[tokio::test]
    async fn load_skips_expired_and_empty_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let now = Utc::now().timestamp_millis();
        storage
            .set(
                CACHE_KEY,
                json!({
                    "alice": {"location": "Japan", "expiry": now + 60_000, "cachedAt": now - 1000},
                    "bob": {"location": "France", "expiry": now - 1},
                    "carol": {"location": null, "expiry": now + 60_000},
                    "dave": "garbage"
                }),
            )
            .await
            .unwrap();

        let cache = cache_with(&storage);
        assert_eq!(cache.load().await, 1);
        assert_eq!(cache.get("alice").as_deref(), Some("Japan"));
        assert_eq!(cache.get("bob"), None);
        assert_eq!(cache.get("carol"), None);
        assert_eq!(
            cache.entry("alice").unwrap().cached_at.timestamp_millis(),
            now - 1000
        );
    }

    #[tokio::test]
    async fn load_failure_leaves_cache_cold() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_failing_reads(true);
        let cache = cache_with(&storage);
        assert_eq!(cache.load().await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn set_merges_into_stored_map() {
        let storage = Arc::new(MemoryStorage::new());
        let now = Utc::now().timestamp_millis();
        storage
            .set(
                CACHE_KEY,
                json!({"zed": {"location": "Spain", "expiry": now + 60_000, "cachedAt": now}}),
            )
            .await
            .unwrap();

        let cache = cache_with(&storage);
        cache.set("alice", Some("Japan".into())).await;

        let stored = storage.snapshot(CACHE_KEY).unwrap();
        assert_eq!(stored["zed"]["location"], "Spain");
        assert_eq!(stored["alice"]["location"], "Japan");
        let expiry = stored["alice"]["expiry"].as_i64().unwrap();
        let thirty_days = Duration::days(CACHE_EXPIRY_DAYS).num_milliseconds();
        assert!(expiry >= now + thirty_days - 5_000);
    }

    #[tokio::test]
    async fn empty_results_are_not_persisted_and_read_as_absent() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = cache_with(&storage);

        cache.set("nobody", None).await;
        assert_eq!(storage.writes(), 0);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.get("nobody"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_write_still_serves_from_memory() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_failing(true);
        let cache = cache_with(&storage);

        cache.set("alice", Some("Japan".into())).await;
        assert_eq!(cache.get("alice").as_deref(), Some("Japan"));
        assert_eq!(storage.writes(), 0);
    }

    #[tokio::test]
    async fn failed_read_during_set_falls_back_to_flush() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = cache_with(&storage);
        cache.set("alice", Some("Japan".into())).await;

        // merge path cannot read, the bulk flush can still write
        storage.set_failing_reads(true);
        cache.set("bob", Some("France".into())).await;

        let stored = storage.snapshot(CACHE_KEY).unwrap();
        assert_eq!(stored["alice"]["location"], "Japan");
        assert_eq!(stored["bob"]["location"], "France");
    }

    #[tokio::test]
    async fn flush_preserves_original_cached_at() {
        let storage = Arc::new(MemoryStorage::new());
        let now = Utc::now().timestamp_millis();
        let original = now - 86_400_000;
        storage
            .set(
                CACHE_KEY,
                json!({"alice": {"location": "Japan", "expiry": now + 60_000, "cachedAt": original}}),
            )
            .await
            .unwrap();

        let cache = cache_with(&storage);
        cache.load().await;
        cache.set("bob", None).await;
        cache.flush_all().await;

        let stored = storage.snapshot(CACHE_KEY).unwrap();
        assert_eq!(stored["alice"]["cachedAt"].as_i64(), Some(original));
        assert!(stored["alice"]["expiry"].as_i64().unwrap() > now + 60_000);
        assert!(stored.get("bob").is_none());
    }
}
