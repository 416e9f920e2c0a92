//! Country flags for profile hover cards.
//!
//! Username links and avatars on the page are bound to hover handling; when
//! a profile card opens, the user's location is resolved through a
//! single-flight, rate limited lookup queue backed by a persistent cache,
//! and the matching flag is written next to the `@handle` in the card.

pub mod annotate;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dom;
pub mod error;
pub mod flags;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod observe;
pub mod rate_limit;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod storage;

pub use error::{FlagError, Result};
