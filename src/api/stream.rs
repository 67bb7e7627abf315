//! SSE streaming endpoint for live deployment notifications

use axum::{
    extract::State as AxumState,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::SharedState;

/// GET /api/stream/notifications - SSE stream of every dispatched notification
pub async fn stream_notifications(
    AxumState(state): AxumState<SharedState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.notifications.subscribe();
    let stream = BroadcastStream::new(rx);

    let event_stream = stream.filter_map(|result| {
        match result {
            Ok(notification) => {
                let data = serde_json::to_string(&notification).unwrap_or_default();
                Some(Ok(Event::default()
                    .event(notification.level.as_str())
                    .data(data)))
            }
            Err(_) => None, // Skip lagged messages
        }
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}
