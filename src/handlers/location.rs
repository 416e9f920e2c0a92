use crate::flags;
use crate::models::LocationView;
use crate::observe::classify::username_from_href;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

// Resolve one username through the scheduler, cache first
pub async fn location_handler(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<LocationView>, (StatusCode, String)> {
    let username = username_from_href(&format!("/{}", username))
        .filter(|name| *name == username)
        .ok_or((StatusCode::BAD_REQUEST, format!("Not a username: {}", username)))?;

    let location = state
        .session
        .coordinator()
        .scheduler()
        .resolve(&username)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    let flag = flags::resolve(location.as_deref()).map(String::from);
    Ok(Json(LocationView {
        username,
        location,
        flag,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::app_state;

    #[tokio::test]
    async fn cached_location_comes_with_its_flag() {
        let (state, _) = app_state().await;
        state
            .session
            .coordinator()
            .cache()
            .set("alice", Some("Japan".into()))
            .await;

        let Json(view) = location_handler(State(state.clone()), Path("alice".into()))
            .await
            .unwrap();
        assert_eq!(view.location.as_deref(), Some("Japan"));
        assert_eq!(view.flag.as_deref(), Some("🇯🇵"));
        state.session.shutdown().await;
    }

    #[tokio::test]
    async fn reserved_routes_are_rejected() {
        let (state, _) = app_state().await;
        for bad in ["home", "12345", "a?b"] {
            let err = location_handler(State(state.clone()), Path(bad.into()))
                .await
                .unwrap_err();
            assert_eq!(err.0, StatusCode::BAD_REQUEST);
        }
        state.session.shutdown().await;
    }
}
