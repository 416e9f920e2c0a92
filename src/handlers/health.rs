use crate::state::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let coord = state.session.coordinator();
    Json(json!({
        "status": "healthy",
        "enabled": coord.is_enabled(),
        "cached": coord.cache().len(),
        "headersCaptured": state.capture.is_ready(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::app_state;

    #[tokio::test]
    async fn reports_session_state() {
        let (state, _) = app_state().await;
        let Json(body) = health_handler(State(state.clone())).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["enabled"], true);
        assert_eq!(body["headersCaptured"], false);
        state.session.shutdown().await;
    }
}
