// src/handlers/admin_handler.rs
use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    handlers::CurrentActor,
    models::{Actor, ReasonRequest, RideAnalytics, RideResponse},
    services::admin_service::AdminOperations,
    state::AppState,
};

fn ensure_operator(actor: &Actor) -> DispatchResult<()> {
    match actor {
        Actor::System => Ok(()),
        other => Err(DispatchError::forbidden(
            other.role(),
            "operator access required",
        )),
    }
}

pub async fn active_rides(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
) -> DispatchResult<Json<Vec<RideResponse>>> {
    ensure_operator(&actor)?;
    let rides = state.admin_service.active_rides().await?;
    Ok(Json(rides.into_iter().map(RideResponse::from).collect()))
}

pub async fn statistics(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
) -> DispatchResult<Json<RideAnalytics>> {
    ensure_operator(&actor)?;
    Ok(Json(state.admin_service.statistics().await?))
}

pub async fn force_cancel(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(ride_id): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> DispatchResult<Json<RideResponse>> {
    ensure_operator(&actor)?;
    let reason = body.and_then(|Json(r)| r.reason);
    let ride = state.admin_service.force_cancel(&ride_id, reason).await?;
    Ok(Json(ride.into()))
}
