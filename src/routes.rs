use std::collections::HashMap;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};

use crate::models::{AppState, ConnectionRequest};
use crate::session::ClientSession;

/// GET /?token=... - upgrade to a Guacamole relay session
pub async fn tunnel(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session = ClientSession::new(state, ConnectionRequest { query, headers });
    ws.on_upgrade(move |socket| session.run(socket))
}

pub fn create_router(state: AppState) -> Router {
    Router::new().route("/", get(tunnel)).with_state(state)
}
