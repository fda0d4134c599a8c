// src/handlers/mod.rs
pub mod admin_handler;
pub mod ride_handler;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{Actor, RideEvent, RideResponse},
};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// The caller, as asserted by the gateway in front of this service.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentActor(pub Actor);

pub fn actor_from_headers(headers: &HeaderMap) -> DispatchResult<Actor> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let role = header(USER_ROLE_HEADER)
        .ok_or_else(|| DispatchError::MissingRequiredField(USER_ROLE_HEADER.to_string()))?;

    match role.to_ascii_lowercase().as_str() {
        "admin" | "system" => Ok(Actor::System),
        "passenger" | "driver" => {
            let id = header(USER_ID_HEADER)
                .ok_or_else(|| DispatchError::MissingRequiredField(USER_ID_HEADER.to_string()))?;
            if role.eq_ignore_ascii_case("driver") {
                Ok(Actor::driver(id))
            } else {
                Ok(Actor::passenger(id))
            }
        }
        other => Err(DispatchError::InvalidFieldValue {
            field: USER_ROLE_HEADER.to_string(),
            value: other.to_string(),
            reason: "expected passenger, driver or admin".to_string(),
        }),
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map(CurrentActor)
    }
}

fn to_sse_event(event: RideEvent) -> Result<Event, axum::Error> {
    match event {
        RideEvent::Snapshot(rides) => {
            let rides: Vec<RideResponse> = rides.into_iter().map(RideResponse::from).collect();
            Event::default().event("snapshot").json_data(rides)
        }
        RideEvent::Changed(ride) => Event::default()
            .event("changed")
            .json_data(RideResponse::from(ride)),
        RideEvent::Removed(ride_id) => Event::default()
            .event("removed")
            .json_data(json!({ "id": ride_id })),
    }
}

/// Server-sent events over a ride subscription. The subscription ends when
/// the client disconnects and the stream is dropped.
pub fn ride_event_stream(
    events: BoxStream<'static, RideEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.filter_map(|event| async move {
        match to_sse_event(event) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Dropping ride event that failed to serialize: {}", e);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
