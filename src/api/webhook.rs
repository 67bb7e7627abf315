//! Webhook handler for GitHub push events

use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, Request, State as AxumState},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::net::SocketAddr;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::auth::{SIGNATURE_HEADER, verify_signature_with_trace};
use crate::{SharedState, critical};
use crate::webhook::{ParseError, parse_payload};

/// Upper bound on accepted delivery bodies (GitHub caps payloads at 25MB).
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

/// Reasons a delivery is rejected or cannot be answered with a report.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Authentication failed")]
    InvalidSignature,

    #[error("Could not read request body: {0}")]
    Body(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] ParseError),

    #[error("Deployment aborted: {0}")]
    Pipeline(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(json!({
                "result": "error",
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

/// Handles the GitHub webhook POST request.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    request: Request,
) -> Result<Response, WebhookError> {
    let (parts, body) = request.into_parts();

    // Only present when served with connect info
    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let delivery_id = parts
        .headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            warn!("Could not read body from {}: {}", remote, e);
            WebhookError::Body(e.to_string())
        })?;

    let span = info_span!("webhook", delivery = %delivery_id);
    process_delivery(state, parts.headers, body, remote)
        .instrument(span)
        .await
}

async fn process_delivery(
    state: SharedState,
    headers: HeaderMap,
    body: Bytes,
    remote: String,
) -> Result<Response, WebhookError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let authenticated = verify_signature_with_trace(
        state.config.webhook_secret.as_bytes(),
        &body,
        signature,
        state.config.debug_signatures,
    );
    if !authenticated {
        warn!("Authentication failed from {}", remote);
        return Err(WebhookError::InvalidSignature);
    }

    // Deliveries without an event header are treated as pushes
    let event_type = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    if let Some(event_type) = event_type {
        if event_type != "push" {
            info!("Not push event; Received {:?} event", event_type);
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
    }

    let event = parse_payload(&body).map_err(|e| {
        error!("Rejected payload from {}: {}", remote, e);
        WebhookError::from(e)
    })?;

    // The pipeline runs on its own task so a client hanging up mid-pull
    // cannot cancel the pull or the restarts that follow it
    let repository_name = event.repository_name.clone();
    let pipeline = tokio::spawn(
        async move {
            let deployment = state.deployer.deploy(&event).await;
            // The restarts keep running after the response is sent
            drop(deployment.restarts);
            deployment.report
        }
        .in_current_span(),
    );

    let report = pipeline.await.map_err(|e| {
        critical!("Deployment of '{}' aborted: {}", repository_name, e);
        WebhookError::Pipeline(e.to_string())
    })?;

    info!("Successful run for '{}'", repository_name);
    Ok(Json(report).into_response())
}
