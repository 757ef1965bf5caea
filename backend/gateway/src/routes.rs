//! Control endpoint handlers.

use axum::{Json, extract::State};
use pagecast_pipeline::{StatusSnapshot, StopOutcome};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{RequireKeyword, check_keyword};
use crate::error::ApiError;
use crate::server::GatewayState;

#[derive(Debug, Default, Deserialize)]
pub struct KeywordBody {
    pub keyword: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct Banner {
    pub service: String,
    pub status: &'static str,
    pub state: pagecast_core::SessionState,
}

/// A missing or malformed body counts as a missing keyword.
fn body_keyword(body: &Option<Json<KeywordBody>>) -> Option<&str> {
    body.as_ref().and_then(|Json(b)| b.keyword.as_deref())
}

pub async fn banner(State(state): State<GatewayState>) -> Json<Banner> {
    Json(Banner {
        service: state.service_name().to_string(),
        status: "running",
        state: state.coordinator().state(),
    })
}

pub async fn start(
    State(state): State<GatewayState>,
    body: Option<Json<KeywordBody>>,
) -> Result<Json<ControlResponse>, ApiError> {
    check_keyword(state.access_keyword(), body_keyword(&body))?;
    info!("Start requested over HTTP");
    let session_id = state.coordinator().start().await?;
    Ok(Json(ControlResponse {
        success: true,
        message: "Streaming started".into(),
        session_id: Some(session_id),
    }))
}

pub async fn stop(
    State(state): State<GatewayState>,
    body: Option<Json<KeywordBody>>,
) -> Result<Json<ControlResponse>, ApiError> {
    check_keyword(state.access_keyword(), body_keyword(&body))?;
    info!("Stop requested over HTTP");
    let message = match state.coordinator().stop().await? {
        StopOutcome::Stopped => "Stream stopped",
        StopOutcome::AlreadyIdle => "Not streaming",
        StopOutcome::AlreadyStopping => "Stream was already stopping",
    };
    Ok(Json(ControlResponse {
        success: true,
        message: message.into(),
        session_id: None,
    }))
}

pub async fn status(
    _auth: RequireKeyword,
    State(state): State<GatewayState>,
) -> Json<StatusSnapshot> {
    Json(state.coordinator().status())
}

pub async fn not_found() -> ApiError {
    ApiError::not_found()
}
