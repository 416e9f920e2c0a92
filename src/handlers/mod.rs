mod headers;
mod health;
mod location;
mod metrics;
mod page;
mod toggle;

pub use headers::headers_handler;
pub use health::health_handler;
pub use location::location_handler;
pub use metrics::metrics_handler;
pub use page::{flags_handler, mount_handler, navigate_handler, pointer_handler, remove_handler};
pub use toggle::toggle_handler;

use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

// control server routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/toggle", post(toggle_handler))
        .route("/location/{username}", get(location_handler))
        .route("/headers", post(headers_handler))
        .route("/page/mount", post(mount_handler))
        .route("/page/remove", post(remove_handler))
        .route("/page/navigate", post(navigate_handler))
        .route("/page/pointer", post(pointer_handler))
        .route("/page/flags", get(flags_handler))
        .with_state(state)
}
