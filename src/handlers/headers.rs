use crate::models::ObservedRequest;
use crate::state::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

// Page traffic tap: authenticated GraphQL requests lend their headers to lookups
pub async fn headers_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ObservedRequest>,
) -> Json<Value> {
    let captured = state.capture.observe_request(&request.url, request.headers);
    Json(json!({ "captured": captured, "ready": state.capture.is_ready() }))
}
