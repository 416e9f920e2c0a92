//! Page observation: finding username elements, binding hover handling to
//! them and reacting to hover cards.

pub mod classify;
pub mod hover;
pub mod listeners;
pub mod watcher;

pub use classify::{extract_username_from_avatar, extract_username_from_link, find_profile_popup};
pub use hover::{handle_hover, handle_leave};
pub use listeners::{HoverBinding, HoverKind, ListenerRegistry, setup_hover_listeners};
pub use watcher::{spawn_mutation_watcher, spawn_pointer_listener};
