use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderName, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use sarhni_types::api::ErrorBody;

use crate::dispatcher::Dispatcher;

/// A `: keep-alive` comment goes out this often so idle proxies keep the
/// connection open.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<Uuid>,
}

/// `GET /stream?userId=<id>`
pub fn routes(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/stream", get(stream_confessions))
        .with_state(dispatcher)
}

/// Server-Sent Events feed of new confessions for one recipient.
///
/// The subscription lives inside the response stream: when the client goes
/// away axum drops the stream, which unsubscribes and stops the keep-alive
/// timer. Nothing is written after that point.
pub async fn stream_confessions(
    State(dispatcher): State<Dispatcher>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Response {
    let user_id = match query {
        Ok(Query(StreamQuery {
            user_id: Some(user_id),
        })) => user_id,
        Ok(_) => return bad_request("userId is required".to_string()),
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let mut subscription = dispatcher.subscribe(user_id);
    debug!("SSE stream opened for {}", user_id);

    let events = async_stream::stream! {
        while let Some(confession) = subscription.recv().await {
            match Event::default().json_data(&confession) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => warn!("Failed to encode confession {}: {}", confession.id, e),
            }
        }
    };

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

fn bad_request(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
}
