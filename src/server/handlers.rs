use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::extractors::is_valid_youtube_url;
use crate::timestamp::{ClipRequest, ValidationError};
use crate::utils::serialize_seconds;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Liveness plus a check that the working directory is there
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match tokio::fs::try_exists(state.pipeline.temp_dir()).await {
        Ok(exists) => (
            StatusCode::OK,
            Json(HealthResponse {
                ok: true,
                temp_dir_exists: Some(exists),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HealthResponse {
                ok: false,
                temp_dir_exists: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractBody {
    pub youtube_url: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractResponse {
    pub success: bool,
    pub audio_url: String,
    pub storage_path: String,
    #[serde(serialize_with = "serialize_seconds")]
    pub duration_seconds: f64,
}

/// Present and not blank
fn required(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.trim().is_empty())
}

pub async fn extract(
    State(state): State<AppState>,
    body: Result<Json<ExtractBody>, JsonRejection>,
) -> Result<Json<ExtractResponse>, ApiError> {
    let Json(body) = body.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "rejected request body");
        ApiError::bad_request("invalid json body")
    })?;

    let (Some(url), Some(start), Some(end)) = (
        required(body.youtube_url),
        required(body.start),
        required(body.end),
    ) else {
        return Err(ValidationError::MissingFields.into());
    };

    if !is_valid_youtube_url(&url) {
        return Err(ValidationError::InvalidUrl.into());
    }

    let request = ClipRequest::parse(&url, &start, &end)?;

    // Detached so a client hanging up cannot interrupt the pipeline before its cleanup
    let pipeline = Arc::clone(&state.pipeline);
    let shutdown = state.shutdown.clone();
    let job = tokio::spawn(async move { pipeline.run(&request, &shutdown).await });

    let outcome = match job.await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(join_error) => Err(join_error.to_string()),
    }
    .map_err(|detail| {
        tracing::error!(error = %detail, "extract failed");
        ApiError::Processing {
            detail,
            debug: state.debug_errors,
        }
    })?;

    Ok(Json(ExtractResponse {
        success: true,
        audio_url: outcome.public_url,
        storage_path: outcome.storage_path,
        duration_seconds: outcome.duration_seconds,
    }))
}
