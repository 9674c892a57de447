//! SSE endpoint streaming a user's focus events to the browser.

use axum::{
    extract::State,
    http::header,
    response::{sse::Event, IntoResponse, Sse},
};
use futures::stream;
use std::{convert::Infallible, sync::Arc, time::Duration};

use super::SseRegistry;
use crate::auth::AuthUser;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /events/stream`: wire format `event: <type>\ndata: <json>\n\n`,
/// with a comment keepalive every 30 s idle. The registration guard rides
/// in the stream state, so client disconnects unregister automatically.
pub async fn stream_events(
    State(registry): State<Arc<SseRegistry>>,
    auth_user: AuthUser,
) -> impl IntoResponse {
    let (guard, rx) = registry.register(&auth_user.user_id);

    let stream = stream::unfold((rx, guard), move |(mut rx, guard)| async move {
        tokio::select! {
            item = rx.recv() => match item {
                Some(event) => {
                    let sse_event = Event::default()
                        .event(event.event_type.as_str())
                        .data(event.sse_json().to_string());
                    Some((Ok::<Event, Infallible>(sse_event), (rx, guard)))
                }
                // Channel closed; end the stream (guard drops, unregisters).
                None => None,
            },
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                let sse_event = Event::default().comment("keepalive");
                Some((Ok(sse_event), (rx, guard)))
            }
        }
    });

    // Explicit headers to force proper content-type and disable nginx
    // buffering in front of the stream.
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
}
