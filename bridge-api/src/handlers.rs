use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::Json,
};
use bridge_core::{BridgeError, NewOutboundMessage};
use serde_json::{json, Value};
use tracing;

use crate::server::ApiState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn error_response(e: BridgeError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        BridgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
        BridgeError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => {
            tracing::error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "bridge-api"
    }))
}

pub async fn request_session(
    Extension(state): Extension<ApiState>,
    Path(tenant_id): Path<String>,
) -> ApiResult {
    let session = state
        .ctx
        .store
        .request_session(&tenant_id)
        .await
        .map_err(error_response)?;

    tracing::info!(tenant_id = %tenant_id, "Session requested ({})", session.state);
    Ok(Json(json!(session)))
}

pub async fn get_session(
    Extension(state): Extension<ApiState>,
    Path(tenant_id): Path<String>,
) -> ApiResult {
    match state.ctx.store.get_session(&tenant_id).await {
        Ok(Some(session)) => Ok(Json(json!(session))),
        Ok(None) => Err(error_response(BridgeError::session_not_found(tenant_id))),
        Err(e) => Err(error_response(e)),
    }
}

pub async fn list_inbound(
    Extension(state): Extension<ApiState>,
    Path(tenant_id): Path<String>,
) -> ApiResult {
    let messages = state
        .ctx
        .store
        .list_inbound(&tenant_id)
        .await
        .map_err(error_response)?;
    Ok(Json(json!(messages)))
}

pub async fn list_sessions(Extension(state): Extension<ApiState>) -> Json<Value> {
    Json(json!(state.registry.snapshot().await))
}

pub async fn send_message(
    Extension(state): Extension<ApiState>,
    Json(request): Json<NewOutboundMessage>,
) -> ApiResult {
    let message = state
        .ctx
        .store
        .enqueue_outbound(request)
        .await
        .map_err(error_response)?;

    Ok(Json(json!({
        "id": message.id,
        "status": message.status,
        "recipient": message.recipient,
    })))
}

pub async fn subscription_stats(Extension(state): Extension<ApiState>) -> Json<Value> {
    Json(json!(state.subscriptions.stats()))
}
