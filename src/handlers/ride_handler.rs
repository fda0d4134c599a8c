// src/handlers/ride_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    handlers::{ride_event_stream, CurrentActor},
    models::{
        AcceptRequest, AcceptResponse, Actor, LocationUpdate, RatingRequest, ReasonRequest,
        RideFilter, RideRequestInit, RideResponse, User, UserRole,
    },
    services::{admin_service::AdminOperations, dispatch_service::DispatchOperations},
    state::AppState,
};

type SharedState = State<Arc<AppState>>;

fn ensure_self_or_system(actor: &Actor, user_id: &str) -> DispatchResult<()> {
    match actor.user_id() {
        None => Ok(()),
        Some(id) if id == user_id => Ok(()),
        Some(_) => Err(DispatchError::forbidden(
            actor.role(),
            format!("cannot read data belonging to {}", user_id),
        )),
    }
}

/// Role and completion gate dispatch eligibility, so only the operator side
/// may change them. Self-registered profiles start incomplete under the
/// role the gateway asserted.
fn check_profile_change(actor: &Actor, existing: Option<&User>, incoming: &User) -> DispatchResult<()> {
    let asserted = match actor {
        Actor::System => return Ok(()),
        Actor::Passenger { .. } => UserRole::Passenger,
        Actor::Driver { .. } => UserRole::Driver,
    };
    let (role, completed) = existing
        .map(|user| (user.role, user.profile_completed))
        .unwrap_or((asserted, false));

    if incoming.role != role || incoming.role != asserted {
        return Err(DispatchError::forbidden(actor.role(), "cannot change the profile role"));
    }
    if incoming.profile_completed != completed {
        return Err(DispatchError::forbidden(
            actor.role(),
            "profile completion is set by an operator",
        ));
    }
    Ok(())
}

pub async fn health(State(state): SharedState) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "simulatePositions": state.config.simulate_positions,
    }))
}

pub async fn create_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Json(init): Json<RideRequestInit>,
) -> DispatchResult<(StatusCode, Json<RideResponse>)> {
    let ride = state.dispatch_service.create_ride(&actor, init).await?;
    Ok((StatusCode::CREATED, Json(ride.into())))
}

pub async fn get_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state.dispatch_service.get_ride(&actor, &ride_id).await?;
    Ok(Json(ride.into()))
}

pub async fn ride_events(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
) -> DispatchResult<impl IntoResponse> {
    let events = state.dispatch_service.watch_ride(&actor, &ride_id).await?;
    Ok(ride_event_stream(events))
}

pub async fn accept_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    body: Option<Json<AcceptRequest>>,
) -> DispatchResult<Json<AcceptResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let ride = state
        .dispatch_service
        .accept_ride(&actor, &ride_id, request)
        .await?;

    let position_lease = ride
        .position_lease
        .clone()
        .ok_or_else(|| DispatchError::internal_error("accepted ride has no position lease"))?;
    Ok(Json(AcceptResponse {
        ride: ride.into(),
        position_lease,
    }))
}

pub async fn reject_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> DispatchResult<Json<RideResponse>> {
    let reason = body.and_then(|Json(r)| r.reason);
    let ride = state
        .dispatch_service
        .reject_ride(&actor, &ride_id, reason)
        .await?;
    Ok(Json(ride.into()))
}

pub async fn confirm_boarding(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state.dispatch_service.confirm_boarding(&actor, &ride_id).await?;
    Ok(Json(ride.into()))
}

pub async fn start_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state.dispatch_service.start_ride(&actor, &ride_id).await?;
    Ok(Json(ride.into()))
}

pub async fn arrive(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state.dispatch_service.arrive(&actor, &ride_id).await?;
    Ok(Json(ride.into()))
}

pub async fn cancel_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> DispatchResult<Json<RideResponse>> {
    let reason = body.and_then(|Json(r)| r.reason);
    let ride = state
        .dispatch_service
        .cancel_ride(&actor, &ride_id, reason)
        .await?;
    Ok(Json(ride.into()))
}

pub async fn rate_ride(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    Json(rating): Json<RatingRequest>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state
        .dispatch_service
        .rate_ride(&actor, &ride_id, rating)
        .await?;
    Ok(Json(ride.into()))
}

pub async fn push_location(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    Json(update): Json<LocationUpdate>,
) -> DispatchResult<Json<RideResponse>> {
    let ride = state
        .dispatch_service
        .push_driver_location(&actor, &ride_id, update)
        .await?;
    Ok(Json(ride.into()))
}

pub async fn passenger_rides(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(passenger_id): Path<String>,
) -> DispatchResult<Json<Vec<RideResponse>>> {
    ensure_self_or_system(&actor, &passenger_id)?;
    let rides = state
        .admin_service
        .history(&RideFilter::for_passenger(passenger_id))
        .await?;
    Ok(Json(rides.into_iter().map(RideResponse::from).collect()))
}

pub async fn driver_rides(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(driver_id): Path<String>,
) -> DispatchResult<Json<Vec<RideResponse>>> {
    ensure_self_or_system(&actor, &driver_id)?;
    let rides = state
        .admin_service
        .history(&RideFilter::for_driver(driver_id))
        .await?;
    Ok(Json(rides.into_iter().map(RideResponse::from).collect()))
}

pub async fn driver_requests(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(driver_id): Path<String>,
) -> DispatchResult<impl IntoResponse> {
    let events = state
        .dispatch_service
        .watch_requests(&actor, &driver_id)
        .await?;
    Ok(ride_event_stream(events))
}

pub async fn driver_earnings(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(driver_id): Path<String>,
) -> DispatchResult<impl IntoResponse> {
    ensure_self_or_system(&actor, &driver_id)?;
    let earnings = state.admin_service.driver_earnings(&driver_id).await?;
    Ok(Json(earnings))
}

pub async fn available_drivers(State(state): SharedState) -> DispatchResult<Json<Vec<User>>> {
    let drivers = state.user_directory.available_drivers().await?;
    Ok(Json(drivers))
}

/// Profile sync from the identity side.
pub async fn upsert_user(
    State(state): SharedState,
    CurrentActor(actor): CurrentActor,
    Path(user_id): Path<String>,
    Json(mut user): Json<User>,
) -> DispatchResult<Json<User>> {
    ensure_self_or_system(&actor, &user_id)?;
    if let Some(location) = user.location {
        if !location.is_valid() {
            return Err(DispatchError::validation_error("location", "location is out of range"));
        }
    }
    let existing = state.user_directory.get_user(&user_id).await?;
    check_profile_change(&actor, existing.as_ref(), &user)?;
    user.id = user_id;
    let user = state.user_directory.upsert_user(user).await?;
    Ok(Json(user))
}
