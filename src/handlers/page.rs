use crate::models::{FlagView, MountRequest, NavigateRequest, PointerRequest, RemoveRequest};
use crate::observe::classify::flag_marker;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

// The page feed: whatever renders the host page mirrors its changes here.

pub async fn mount_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MountRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let doc = state.session.coordinator().doc();
    let parent = request.parent.unwrap_or_else(|| doc.root());
    if !doc.is_connected(parent) {
        return Err((StatusCode::NOT_FOUND, format!("Parent {:?} is not in the page", parent)));
    }

    let node = doc
        .mount(parent, &request.markup)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    debug!("Mounted {:?} under {:?}", node, parent);

    // ids in markup order, so the caller can address what it sent
    Ok(Json(json!({ "node": node, "nodes": doc.subtree(node) })))
}

pub async fn remove_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RemoveRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let doc = state.session.coordinator().doc();
    if request.node == doc.root() {
        return Err((StatusCode::BAD_REQUEST, "The root cannot be removed".to_string()));
    }
    if !doc.is_connected(request.node) {
        return Err((StatusCode::NOT_FOUND, format!("Node {:?} is not in the page", request.node)));
    }

    doc.remove(request.node);
    Ok(Json(json!({ "removed": request.node })))
}

pub async fn navigate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NavigateRequest>,
) -> Json<Value> {
    state.session.coordinator().doc().set_url(&request.url);
    Json(json!({ "url": request.url }))
}

pub async fn pointer_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PointerRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let doc = state.session.coordinator().doc();
    if !doc.is_connected(request.target) {
        return Err((StatusCode::NOT_FOUND, format!("Node {:?} is not in the page", request.target)));
    }
    doc.dispatch_from(request.target, request.kind, request.related);
    Ok(StatusCode::ACCEPTED)
}

pub async fn flags_handler(State(state): State<Arc<AppState>>) -> Json<Vec<FlagView>> {
    let doc = state.session.coordinator().doc();
    let flags = doc
        .query_all(doc.root(), &flag_marker())
        .into_iter()
        .map(|node| FlagView {
            node,
            text: doc.text_content(node),
        })
        .collect();
    Json(flags)
}
