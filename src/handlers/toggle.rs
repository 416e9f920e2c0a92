use crate::models::ControlMessage;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub async fn toggle_handler(
    State(state): State<Arc<AppState>>,
    Json(message): Json<ControlMessage>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let ControlMessage::ExtensionToggle { enabled } = message;
    info!("Toggle received: enabled={}", enabled);

    let removed = state
        .session
        .set_enabled(enabled)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to save toggle: {}", e)))?;

    Ok(Json(json!({ "enabled": enabled, "flagsRemoved": removed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SETTINGS_KEY;
    use crate::handlers::test_support::app_state;
    use crate::observe::classify::FLAG_ATTR;
    use crate::dom::el;

    #[test]
    fn parses_the_runtime_message() {
        let message: ControlMessage =
            serde_json::from_value(json!({"type": "extensionToggle", "enabled": false})).unwrap();
        assert_eq!(message, ControlMessage::ExtensionToggle { enabled: false });
    }

    #[tokio::test]
    async fn disabling_strips_flags_and_persists() {
        let (state, storage) = app_state().await;
        let doc = state.session.coordinator().doc().clone();
        doc.mount(doc.root(), &el("span").attr(FLAG_ATTR, "true")).unwrap();

        let Json(body) = toggle_handler(
            State(state.clone()),
            Json(ControlMessage::ExtensionToggle { enabled: false }),
        )
        .await
        .unwrap();

        assert_eq!(body["flagsRemoved"], 1);
        assert!(!state.session.is_enabled());
        assert_eq!(storage.snapshot(SETTINGS_KEY).unwrap()["enabled"], false);

        storage.set_failing(true);
        let failed = toggle_handler(State(state.clone()), Json(ControlMessage::ExtensionToggle { enabled: true })).await;
        assert_eq!(failed.unwrap_err().0, StatusCode::INTERNAL_SERVER_ERROR);
        state.session.shutdown().await;
    }
}
