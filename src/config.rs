use crate::error::Result;
use crate::observe::classify::Surface;
use crate::scheduler::MIN_REQUEST_INTERVAL;
use crate::storage::Storage;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const SETTINGS_KEY: &str = "settings";

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "hoverflag")]
#[command(about = "Country flags for profile hover cards")]
pub struct Args {
    // Port for the local control server
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // JSON file backing the location cache and settings
    #[arg(short, long, default_value = "hoverflag-storage.json")]
    pub storage_path: PathBuf,

    // Origin the profile lookups go to
    #[arg(long, default_value = crate::bridge::actor::DEFAULT_API_BASE)]
    pub api_base: String,

    // GraphQL query id of the about-account lookup
    #[arg(long, default_value = crate::bridge::actor::DEFAULT_QUERY_ID)]
    pub query_id: String,

    // Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub log_json: bool,

    // Delay before the first listener scan, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub scan_delay_ms: u64,
}

/// User settings as the options form stores them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub show_in_tweets: bool,
    pub show_in_profiles: bool,
    pub show_in_replies: bool,
    /// Hours. Stored for the options form; the location cache keeps its own expiry.
    pub cache_expiry: u64,
    /// Milliseconds between lookups. Never below the scheduler's floor.
    pub api_delay: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            show_in_tweets: true,
            show_in_profiles: true,
            show_in_replies: true,
            cache_expiry: 24,
            api_delay: 500,
        }
    }
}

impl Settings {
    /// Stored settings, or defaults when missing or unreadable.
    pub async fn load(storage: &dyn Storage) -> Self {
        match storage.get(SETTINGS_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Ignoring malformed settings: {}", e);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("Failed to read settings, using defaults: {}", e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, storage: &dyn Storage) -> Result<()> {
        storage.set(SETTINGS_KEY, serde_json::to_value(self)?).await
    }

    pub fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.api_delay).max(MIN_REQUEST_INTERVAL)
    }

    /// Whether hover listeners may be attached on this surface.
    pub fn allows(&self, surface: Surface) -> bool {
        match surface {
            Surface::Tweet => self.show_in_tweets,
            Surface::Reply => self.show_in_replies,
            Surface::Other => true,
        }
    }
}
