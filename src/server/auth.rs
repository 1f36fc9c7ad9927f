use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;

use super::error::ApiError;
use super::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Require `Authorization: Bearer <service key>`
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        tracing::warn!("SERVICE_API_KEY not configured, rejecting request");
        return Err(ApiError::Misconfigured);
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .ok_or(ApiError::Unauthorized)?;

    if token != expected {
        return Err(ApiError::Forbidden);
    }

    Ok(next.run(request).await)
}
