//! HTTP surface of the agent
//!
//! - `POST /{path}` - GitHub push webhook
//! - `GET /` - liveness
//! - `GET /status` - uptime and trigger policy
//! - `GET /api/stream/notifications` - live notifications over SSE

pub mod status;
pub mod stream;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

pub use status::{root, status};
pub use stream::stream_notifications;
pub use webhook::handle_webhook;

/// Builds the router, mounting the webhook on the configured path.
pub fn build_router(state: SharedState) -> Router {
    let webhook_path = state.config.route_path();

    Router::new()
        .route("/", routing::get(root))
        .route("/status", routing::get(status))
        .route(
            "/api/stream/notifications",
            routing::get(stream_notifications),
        )
        .route(&webhook_path, routing::post(handle_webhook))
        .with_state(state)
}
