use crate::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;

/// GET /.well-known/amityvox — the public discovery document, cacheable
/// for an hour.
pub async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let doc = state.federation.discovery_document();
    (
        [(header::CACHE_CONTROL, "public, max-age=3600")],
        Json(doc),
    )
}
