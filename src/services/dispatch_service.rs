// src/services/dispatch_service.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing;
use uuid::Uuid;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{
        AcceptRequest, Actor, ActorRole, Coordinate, LocationUpdate, RatingRequest, RideEvent,
        RideFilter, RideId, RideRequest, RideRequestInit, RideStatus, RouteLeg,
    },
    services::{
        geocoding_service::ReverseGeocoder,
        ride_store::RideStore,
        routing_service::{simulate_position_feed, RouteEstimate, TripEstimator},
        user_service::{require_user, UserDirectory},
    },
};

const COMMIT_ATTEMPTS: usize = 3;
const LOCATION_ATTEMPTS: usize = 5;
const COMPLETION_ATTEMPTS: usize = 5;
/// How close the driver must be to count as at the pickup.
const PICKUP_RADIUS_KM: f64 = 0.05;

#[async_trait]
pub trait DispatchOperations: Send + Sync {
    async fn create_ride(&self, actor: &Actor, init: RideRequestInit) -> DispatchResult<RideRequest>;
    async fn get_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest>;
    async fn accept_ride(&self, actor: &Actor, ride_id: &str, request: AcceptRequest) -> DispatchResult<RideRequest>;
    async fn reject_ride(&self, actor: &Actor, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest>;
    async fn confirm_boarding(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest>;
    async fn start_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest>;
    async fn arrive(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest>;
    async fn complete_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest>;
    async fn cancel_ride(&self, actor: &Actor, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest>;
    async fn rate_ride(&self, actor: &Actor, ride_id: &str, rating: RatingRequest) -> DispatchResult<RideRequest>;
    async fn push_driver_location(&self, actor: &Actor, ride_id: &str, update: LocationUpdate) -> DispatchResult<RideRequest>;
    async fn watch_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<BoxStream<'static, RideEvent>>;
    async fn watch_requests(&self, actor: &Actor, driver_id: &str) -> DispatchResult<BoxStream<'static, RideEvent>>;
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Dwell between `arrived` and `completed`.
    pub completion_grace: Duration,
    pub simulation_tick: Duration,
    pub simulate_positions: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            completion_grace: Duration::from_millis(2000),
            simulation_tick: Duration::from_millis(1000),
            simulate_positions: true,
        }
    }
}

/// Lifecycle commands, used for authorization and guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Accept,
    Reject,
    ConfirmBoarding,
    Start,
    Arrive,
    Complete,
    Cancel,
    Rate,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Accept => "accept",
            Command::Reject => "reject",
            Command::ConfirmBoarding => "confirm boarding for",
            Command::Start => "start",
            Command::Arrive => "arrive",
            Command::Complete => "complete",
            Command::Cancel => "cancel",
            Command::Rate => "rate",
        }
    }

    fn authorize(&self, actor: &Actor, ride: &RideRequest) -> DispatchResult<()> {
        let role_allowed = match (self, actor) {
            (Command::Accept | Command::Reject | Command::Start, Actor::Driver { .. }) => true,
            (Command::ConfirmBoarding | Command::Rate, Actor::Passenger { .. }) => true,
            (Command::Arrive, Actor::Driver { .. } | Actor::System) => true,
            (Command::Cancel, _) => true,
            (Command::Complete, Actor::System) => true,
            _ => false,
        };

        if !role_allowed {
            return Err(DispatchError::forbidden(
                actor.role(),
                format!("a {} cannot {} a ride", actor.role(), self.name()),
            ));
        }
        if !ride.is_party(actor) {
            return Err(DispatchError::forbidden(
                actor.role(),
                format!("not assigned to ride {}", ride.id),
            ));
        }
        Ok(())
    }

    /// The command's target state already holds, so repeating it is a no-op.
    fn target_holds(&self, ride: &RideRequest) -> bool {
        match self {
            Command::Accept => ride.status == RideStatus::Accepted,
            Command::Reject => ride.status == RideStatus::Rejected,
            Command::ConfirmBoarding => ride.passenger_boarded,
            Command::Start => ride.status == RideStatus::InProgress,
            Command::Arrive => ride.status == RideStatus::Arrived,
            Command::Complete => ride.status == RideStatus::Completed,
            Command::Cancel => ride.status == RideStatus::Cancelled,
            Command::Rate => false,
        }
    }

    fn guard(&self, ride: &RideRequest, grace: Duration) -> DispatchResult<()> {
        let required = match self {
            Command::Accept | Command::Reject => RideStatus::Pending,
            Command::ConfirmBoarding | Command::Start => RideStatus::Accepted,
            Command::Arrive => RideStatus::InProgress,
            Command::Complete => RideStatus::Arrived,
            Command::Rate => RideStatus::Completed,
            Command::Cancel => {
                if ride.status.is_terminal() {
                    return Err(DispatchError::invalid_transition(ride.status, self.name()));
                }
                return Ok(());
            }
        };
        if ride.status != required {
            return Err(DispatchError::invalid_transition(ride.status, self.name()));
        }

        match self {
            Command::Start if !ride.passenger_boarded => Err(DispatchError::precondition_failed(
                "the passenger has not confirmed boarding",
            )),
            Command::Complete => {
                let due = completion_due(ride, grace);
                if due.is_some_and(|due| Utc::now() < due) {
                    Err(DispatchError::precondition_failed(
                        "the completion grace period has not elapsed",
                    ))
                } else {
                    Ok(())
                }
            }
            Command::Rate if ride.rating.is_some() => {
                Err(DispatchError::precondition_failed("the ride has already been rated"))
            }
            _ => Ok(()),
        }
    }
}

fn completion_due(ride: &RideRequest, grace: Duration) -> Option<DateTime<Utc>> {
    let grace = chrono::Duration::from_std(grace).ok()?;
    ride.arrived_at.map(|arrived| arrived + grace)
}

/// Field changes of a command, computed before anything is written so a
/// lost race can re-apply them without repeating side effects.
#[derive(Debug, Clone)]
enum Change {
    Accepted {
        estimate: RouteEstimate,
        driver_location: Coordinate,
        lease: String,
    },
    Rejected {
        reason: Option<String>,
    },
    Boarded,
    Started {
        estimate: RouteEstimate,
        fare: f64,
    },
    Arrived,
    Completed,
    Cancelled {
        by: ActorRole,
        reason: String,
    },
    Rated {
        rating: u8,
        comment: Option<String>,
    },
}

impl Change {
    fn command(&self) -> Command {
        match self {
            Change::Accepted { .. } => Command::Accept,
            Change::Rejected { .. } => Command::Reject,
            Change::Boarded => Command::ConfirmBoarding,
            Change::Started { .. } => Command::Start,
            Change::Arrived => Command::Arrive,
            Change::Completed => Command::Complete,
            Change::Cancelled { .. } => Command::Cancel,
            Change::Rated { .. } => Command::Rate,
        }
    }

    fn is_applied(&self, ride: &RideRequest) -> bool {
        match self {
            Change::Rated { rating, comment } => {
                ride.rating == Some(*rating) && ride.comment == *comment
            }
            other => other.command().target_holds(ride),
        }
    }

    fn apply(&self, ride: &RideRequest, now: DateTime<Utc>) -> RideRequest {
        let mut next = ride.clone();
        let at = ride.next_timestamp(now);

        match self {
            Change::Accepted {
                estimate,
                driver_location,
                lease,
            } => {
                next.status = RideStatus::Accepted;
                next.accepted_at = Some(at);
                set_leg(&mut next, estimate, RouteLeg::ToPickup);
                next.driver_location = Some(*driver_location);
                next.driver_at_pickup = driver_location.distance_km(&ride.pickup.coordinate()) <= PICKUP_RADIUS_KM;
                next.position_lease = Some(lease.clone());
            }
            Change::Rejected { reason } => {
                next.status = RideStatus::Rejected;
                next.rejected_at = Some(at);
                next.rejection_reason = reason.clone();
            }
            Change::Boarded => {
                next.passenger_boarded = true;
                next.passenger_boarded_at = Some(at);
            }
            Change::Started { estimate, fare } => {
                next.status = RideStatus::InProgress;
                next.started_at = Some(at);
                set_leg(&mut next, estimate, RouteLeg::ToDestination);
                next.driver_location = Some(ride.pickup.coordinate());
                next.driver_at_pickup = true;
                next.fare = Some(*fare);
            }
            Change::Arrived => {
                next.status = RideStatus::Arrived;
                next.arrived_at = Some(at);
                next.driver_location = Some(ride.destination.coordinate());
            }
            Change::Completed => {
                next.status = RideStatus::Completed;
                next.completed_at = Some(at);
                next.position_lease = None;
            }
            Change::Cancelled { by, reason } => {
                next.status = RideStatus::Cancelled;
                next.cancelled_at = Some(at);
                next.cancelled_by = Some(*by);
                next.cancel_reason = Some(reason.clone());
                next.position_lease = None;
            }
            Change::Rated { rating, comment } => {
                next.rating = Some(*rating);
                next.comment = comment.clone();
            }
        }

        next
    }
}

fn set_leg(ride: &mut RideRequest, estimate: &RouteEstimate, leg: RouteLeg) {
    ride.route_coordinates = estimate.coordinates.clone();
    ride.current_leg = Some(leg);
    ride.distance = Some(estimate.distance_text.clone());
    ride.duration = Some(estimate.duration_text.clone());
    ride.distance_km = Some(estimate.distance_km);
    ride.duration_minutes = Some(estimate.duration_minutes);
}

fn default_cancel_reason(role: ActorRole) -> &'static str {
    match role {
        ActorRole::Passenger => "Cancelled by the passenger",
        ActorRole::Driver => "Cancelled by the driver",
        ActorRole::System => "Cancelled by an administrator",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Simulation,
    Completion,
}

/// A spawned task and the token it clears itself with when done.
struct TrackedTask {
    token: u64,
    handle: JoinHandle<()>,
}

/// Background work owned by one ride.
#[derive(Default)]
struct RideTasks {
    simulation: Option<TrackedTask>,
    completion: Option<TrackedTask>,
}

impl RideTasks {
    fn slot(&mut self, kind: TaskKind) -> &mut Option<TrackedTask> {
        match kind {
            TaskKind::Simulation => &mut self.simulation,
            TaskKind::Completion => &mut self.completion,
        }
    }

    fn is_empty(&self) -> bool {
        self.simulation.is_none() && self.completion.is_none()
    }
}

type TaskRegistry = Arc<Mutex<HashMap<RideId, RideTasks>>>;

/// The lifecycle engine. Clones share the store, the estimator and the
/// background task registry.
#[derive(Clone)]
pub struct DispatchService {
    store: RideStore,
    estimator: TripEstimator,
    users: Arc<dyn UserDirectory>,
    geocoder: Arc<dyn ReverseGeocoder>,
    settings: DispatchSettings,
    tasks: TaskRegistry,
    next_task: Arc<AtomicU64>,
}

impl DispatchService {
    pub fn new(
        store: RideStore,
        estimator: TripEstimator,
        users: Arc<dyn UserDirectory>,
        geocoder: Arc<dyn ReverseGeocoder>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            estimator,
            users,
            geocoder,
            settings,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Authorize and check the guard. `Some` means the command already
    /// holds and the current record is the answer.
    fn precheck(&self, command: Command, actor: &Actor, ride: &RideRequest) -> DispatchResult<Option<RideRequest>> {
        command.authorize(actor, ride)?;
        if command.target_holds(ride) {
            tracing::debug!("Ride {} already satisfies {}, nothing to do", ride.id, command.name());
            return Ok(Some(ride.clone()));
        }
        command.guard(ride, self.settings.completion_grace)?;
        Ok(None)
    }

    /// Commit `change` on top of `current`. A lost race re-reads the ride,
    /// re-checks the guards and re-applies the same change. Returns the
    /// record and whether this call wrote it.
    async fn execute(&self, actor: &Actor, mut current: RideRequest, change: Change) -> DispatchResult<(RideRequest, bool)> {
        let command = change.command();

        for attempt in 1..=COMMIT_ATTEMPTS {
            let next = change.apply(&current, Utc::now());
            match self.store.commit(&current, next).await {
                Ok(committed) => return Ok((committed, true)),
                Err(DispatchError::Conflict(msg)) => {
                    tracing::debug!(
                        "Ride {} changed under {} (attempt {}): {}",
                        current.id,
                        command.name(),
                        attempt,
                        msg
                    );
                    current = self.store.get(&current.id).await?;
                    if change.is_applied(&current) {
                        return Ok((current, false));
                    }
                    command.authorize(actor, &current)?;
                    command.guard(&current, self.settings.completion_grace)?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::conflict(format!(
            "ride {} kept changing while trying to {} it",
            current.id,
            command.name()
        )))
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<RideId, RideTasks>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `work` as the ride's task of this kind, replacing any earlier
    /// one. The task drops its own registry entry when it finishes, so a
    /// ride that went terminal before registration does not leave one behind.
    fn spawn_task<F>(&self, ride_id: &str, kind: TaskKind, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_task.fetch_add(1, Ordering::Relaxed);
        let engine = self.clone();
        let owner = ride_id.to_string();

        // Held across the spawn so the task cannot finish before it is registered
        let mut tasks = self.lock_tasks();
        let handle = tokio::spawn(async move {
            work.await;
            engine.forget_task(&owner, kind, token);
        });
        let slot = tasks.entry(ride_id.to_string()).or_default().slot(kind);
        if let Some(previous) = slot.replace(TrackedTask { token, handle }) {
            previous.handle.abort();
        }
    }

    fn forget_task(&self, ride_id: &str, kind: TaskKind, token: u64) {
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(ride_id) else {
            return;
        };
        let slot = entry.slot(kind);
        if slot.as_ref().is_some_and(|task| task.token == token) {
            *slot = None;
        }
        if entry.is_empty() {
            tasks.remove(ride_id);
        }
    }

    fn stop_simulation(&self, ride_id: &str) {
        let mut tasks = self.lock_tasks();
        let Some(entry) = tasks.get_mut(ride_id) else {
            return;
        };
        if let Some(simulation) = entry.simulation.take() {
            simulation.handle.abort();
        }
        if entry.is_empty() {
            tasks.remove(ride_id);
        }
    }

    /// Stop everything running for a ride. The completion timer calls this
    /// on itself, so it keeps running unless `abort_completion` is set.
    fn release_tasks(&self, ride_id: &str, abort_completion: bool) {
        let Some(tasks) = self.lock_tasks().remove(ride_id) else {
            return;
        };
        if let Some(simulation) = tasks.simulation {
            simulation.handle.abort();
        }
        if let Some(completion) = tasks.completion {
            if abort_completion {
                completion.handle.abort();
            }
        }
        tracing::debug!("Released background tasks for ride {}", ride_id);
    }

    /// Drive the simulated feed along the ride's current leg, starting from
    /// the route point nearest the driver. Positions the engine refuses are
    /// skipped; the feed only stops once the ride or the lease is gone.
    fn start_simulation(&self, ride: &RideRequest) {
        if !self.settings.simulate_positions {
            return;
        }
        let (Some(lease), Some(leg)) = (ride.position_lease.clone(), ride.current_leg) else {
            return;
        };

        let start = ride
            .driver_location
            .map(|at| nearest_index(&ride.route_coordinates, &at))
            .unwrap_or(0);
        let route = ride.route_coordinates.get(start..).unwrap_or_default().to_vec();

        let engine = self.clone();
        let ride_id = ride.id.clone();
        let driver = Actor::driver(ride.driver_id.clone());
        let pickup = ride.pickup.coordinate();
        let tick = self.settings.simulation_tick;

        tracing::debug!("Simulating {} points of {:?} for ride {}", route.len(), leg, ride.id);

        self.spawn_task(&ride.id, TaskKind::Simulation, async move {
            let mut feed = simulate_position_feed(route, tick);
            while let Some(location) = feed.next().await {
                let update = LocationUpdate {
                    lease: lease.clone(),
                    location,
                };
                match engine.push_driver_location(&driver, &ride_id, update).await {
                    Ok(_) => {}
                    Err(
                        e @ (DispatchError::Forbidden { .. }
                        | DispatchError::InvalidTransition { .. }
                        | DispatchError::RideNotFound(_)),
                    ) => {
                        tracing::debug!("Simulation for ride {} stopped: {}", ride_id, e);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("Skipping simulated position for ride {}: {}", ride_id, e);
                    }
                }
            }

            match leg {
                RouteLeg::ToPickup => {
                    let update = LocationUpdate { lease, location: pickup };
                    if let Err(e) = engine.push_driver_location(&driver, &ride_id, update).await {
                        tracing::debug!("Could not mark ride {} at pickup: {}", ride_id, e);
                    }
                }
                RouteLeg::ToDestination => {
                    // Arrival stops this task, so it runs on its own
                    tokio::spawn(async move {
                        if let Err(e) = engine.arrive(&Actor::System, &ride_id).await {
                            tracing::warn!("Simulated arrival for ride {} failed: {}", ride_id, e);
                        }
                    });
                }
            }
        });
    }

    fn schedule_completion(&self, ride: &RideRequest) {
        let engine = self.clone();
        let ride_id = ride.id.clone();
        let grace = self.settings.completion_grace;

        self.spawn_task(&ride.id, TaskKind::Completion, async move {
            let mut wait = grace;
            for _ in 0..COMPLETION_ATTEMPTS {
                tokio::time::sleep(wait).await;
                match engine.complete_ride(&Actor::System, &ride_id).await {
                    Ok(_) => return,
                    Err(DispatchError::PreconditionFailed(_)) => {
                        // Wall clock lagging the timer, wait for the rest
                        wait = match engine.store.get(&ride_id).await {
                            Ok(ride) => completion_due(&ride, grace)
                                .and_then(|due| (due - Utc::now()).to_std().ok())
                                .unwrap_or_default()
                                .max(Duration::from_millis(1)),
                            Err(_) => return,
                        };
                    }
                    Err(e) => {
                        tracing::debug!("Completion of ride {} skipped: {}", ride_id, e);
                        return;
                    }
                }
            }
            tracing::warn!("Gave up completing ride {}", ride_id);
        });
    }

    /// Pick up background work for rides that were mid-flight when the
    /// process stopped.
    pub async fn recover(&self) -> DispatchResult<usize> {
        let rides = self.store.list(&RideFilter::active()).await?;
        let mut resumed = 0;

        for ride in rides {
            match ride.status {
                RideStatus::Arrived => {
                    self.schedule_completion(&ride);
                    resumed += 1;
                }
                RideStatus::Accepted | RideStatus::InProgress if self.settings.simulate_positions => {
                    self.start_simulation(&ride);
                    resumed += 1;
                }
                _ => {}
            }
        }

        if resumed > 0 {
            tracing::info!("Resumed background work for {} ride(s)", resumed);
        }
        Ok(resumed)
    }

    async fn driver_origin(&self, ride: &RideRequest, request: &AcceptRequest) -> DispatchResult<Coordinate> {
        if let Some(location) = request.driver_location {
            if !location.is_valid() {
                return Err(DispatchError::validation_error(
                    "driverLocation",
                    "driver location is out of range",
                ));
            }
            return Ok(location);
        }

        let driver = require_user(self.users.as_ref(), &ride.driver_id).await?;
        driver.location.ok_or_else(|| {
            DispatchError::precondition_failed("the driver's current location is unknown")
        })
    }
}

fn nearest_index(route: &[Coordinate], at: &Coordinate) -> usize {
    route
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.distance_km(at).total_cmp(&b.distance_km(at)))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

#[async_trait]
impl DispatchOperations for DispatchService {
    async fn create_ride(&self, actor: &Actor, init: RideRequestInit) -> DispatchResult<RideRequest> {
        let mut new_ride = init.validate()?;

        match actor {
            Actor::Passenger { id } if *id == new_ride.passenger_id => {}
            Actor::System => {}
            _ => {
                return Err(DispatchError::forbidden(
                    actor.role(),
                    "rides are requested by the passenger themselves",
                ))
            }
        }

        let driver = require_user(self.users.as_ref(), &new_ride.driver_id).await?;
        if let Some(reason) = driver.dispatchable_reason() {
            return Err(DispatchError::precondition_failed(reason));
        }

        if new_ride.pickup.address.is_none() {
            match self.geocoder.address_for(new_ride.pickup.coordinate()).await {
                Ok(address) => new_ride.pickup.address = address,
                Err(e) => tracing::warn!("Reverse geocoding failed, continuing without address: {}", e),
            }
        }

        let ride = self.store.create_ride(new_ride).await?;
        tracing::info!("Ride {} requested from driver {}", ride.id, ride.driver_id);
        Ok(ride)
    }

    async fn get_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest> {
        let ride = self.store.get(ride_id).await?;
        if !ride.is_party(actor) {
            return Err(DispatchError::forbidden(
                actor.role(),
                format!("not a party to ride {}", ride_id),
            ));
        }
        Ok(ride)
    }

    async fn accept_ride(&self, actor: &Actor, ride_id: &str, request: AcceptRequest) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Accept, actor, &current)? {
            return Ok(ride);
        }

        let driver_location = self.driver_origin(&current, &request).await?;
        let estimate = self
            .estimator
            .compute_route(driver_location, current.pickup.coordinate())
            .await?;

        let change = Change::Accepted {
            estimate,
            driver_location,
            lease: Uuid::new_v4().to_string(),
        };
        let (ride, applied) = self.execute(actor, current, change).await?;
        if applied {
            tracing::info!(
                "Ride {} accepted by driver {} ({} to pickup)",
                ride.id,
                ride.driver_id,
                ride.distance.as_deref().unwrap_or("?")
            );
            self.start_simulation(&ride);
        }
        Ok(ride)
    }

    async fn reject_ride(&self, actor: &Actor, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Reject, actor, &current)? {
            return Ok(ride);
        }

        let (ride, applied) = self.execute(actor, current, Change::Rejected { reason }).await?;
        if applied {
            tracing::info!("Ride {} rejected by driver {}", ride.id, ride.driver_id);
            self.release_tasks(&ride.id, true);
        }
        Ok(ride)
    }

    async fn confirm_boarding(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::ConfirmBoarding, actor, &current)? {
            return Ok(ride);
        }

        let (ride, applied) = self.execute(actor, current, Change::Boarded).await?;
        if applied {
            tracing::info!("Passenger {} boarded ride {}", ride.passenger_id, ride.id);
        }
        Ok(ride)
    }

    async fn start_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Start, actor, &current)? {
            return Ok(ride);
        }

        let estimate = self
            .estimator
            .compute_route(current.pickup.coordinate(), current.destination.coordinate())
            .await?;
        let fare = self.estimator.compute_fare(estimate.distance_km);

        let (ride, applied) = self
            .execute(actor, current, Change::Started { estimate, fare })
            .await?;
        if applied {
            tracing::info!(
                "Ride {} started: {} to {}, fare {}",
                ride.id,
                ride.distance.as_deref().unwrap_or("?"),
                ride.destination.display_name,
                fare
            );
            self.start_simulation(&ride);
        }
        Ok(ride)
    }

    async fn arrive(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Arrive, actor, &current)? {
            return Ok(ride);
        }

        let (ride, applied) = self.execute(actor, current, Change::Arrived).await?;
        if applied {
            tracing::info!("Ride {} arrived at {}", ride.id, ride.destination.display_name);
            self.stop_simulation(&ride.id);
            self.schedule_completion(&ride);
        }
        Ok(ride)
    }

    async fn complete_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Complete, actor, &current)? {
            return Ok(ride);
        }

        let (ride, applied) = self.execute(actor, current, Change::Completed).await?;
        if applied {
            tracing::info!("Ride {} completed, fare {:?}", ride.id, ride.fare);
            self.release_tasks(&ride.id, false);
        }
        Ok(ride)
    }

    async fn cancel_ride(&self, actor: &Actor, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest> {
        let current = self.store.get(ride_id).await?;
        if let Some(ride) = self.precheck(Command::Cancel, actor, &current)? {
            return Ok(ride);
        }

        let by = actor.role();
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| default_cancel_reason(by).to_string());

        let (ride, applied) = self
            .execute(actor, current, Change::Cancelled { by, reason })
            .await?;
        if applied {
            tracing::info!("Ride {} cancelled by {}", ride.id, by);
            self.release_tasks(&ride.id, true);
        }
        Ok(ride)
    }

    async fn rate_ride(&self, actor: &Actor, ride_id: &str, rating: RatingRequest) -> DispatchResult<RideRequest> {
        if !(1..=5).contains(&rating.rating) {
            return Err(DispatchError::InvalidFieldValue {
                field: "rating".to_string(),
                value: rating.rating.to_string(),
                reason: "must be between 1 and 5".to_string(),
            });
        }

        let current = self.store.get(ride_id).await?;
        let change = Change::Rated {
            rating: rating.rating,
            comment: rating.comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
        };
        Command::Rate.authorize(actor, &current)?;
        if change.is_applied(&current) {
            return Ok(current);
        }
        Command::Rate.guard(&current, self.settings.completion_grace)?;

        let (ride, applied) = self.execute(actor, current, change).await?;
        if applied {
            tracing::info!("Ride {} rated {}", ride.id, rating.rating);
        }
        Ok(ride)
    }

    async fn push_driver_location(&self, actor: &Actor, ride_id: &str, update: LocationUpdate) -> DispatchResult<RideRequest> {
        if !update.location.is_valid() {
            return Err(DispatchError::validation_error("location", "location is out of range"));
        }

        for _ in 0..LOCATION_ATTEMPTS {
            let current = self.store.get(ride_id).await?;

            if !matches!(actor, Actor::Driver { .. }) || !current.is_party(actor) {
                return Err(DispatchError::forbidden(
                    actor.role(),
                    format!("only the assigned driver reports positions for ride {}", ride_id),
                ));
            }
            if current.position_lease.as_deref() != Some(update.lease.as_str()) {
                return Err(DispatchError::forbidden(
                    actor.role(),
                    "position lease is missing or has been revoked",
                ));
            }
            if !matches!(current.status, RideStatus::Accepted | RideStatus::InProgress) {
                return Err(DispatchError::invalid_transition(current.status, "report a position for"));
            }

            let mut next = current.clone();
            next.driver_location = Some(update.location);
            if current.current_leg == Some(RouteLeg::ToPickup)
                && update.location.distance_km(&current.pickup.coordinate()) <= PICKUP_RADIUS_KM
            {
                if !current.driver_at_pickup {
                    tracing::info!("Driver {} reached the pickup for ride {}", current.driver_id, ride_id);
                }
                next.driver_at_pickup = true;
            }

            match self.store.commit(&current, next).await {
                Ok(ride) => {
                    tracing::trace!("Ride {} driver at {:?}", ride_id, update.location);
                    return Ok(ride);
                }
                Err(DispatchError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DispatchError::conflict(format!(
            "ride {} kept changing while recording a position",
            ride_id
        )))
    }

    async fn watch_ride(&self, actor: &Actor, ride_id: &str) -> DispatchResult<BoxStream<'static, RideEvent>> {
        self.get_ride(actor, ride_id).await?;
        self.store.subscribe(RideFilter::ride(ride_id)).await
    }

    async fn watch_requests(&self, actor: &Actor, driver_id: &str) -> DispatchResult<BoxStream<'static, RideEvent>> {
        match actor {
            Actor::Driver { id } if id == driver_id => {}
            Actor::System => {}
            _ => {
                return Err(DispatchError::forbidden(
                    actor.role(),
                    "drivers can only watch their own requests",
                ))
            }
        }
        self.store.subscribe(RideFilter::pending_for_driver(driver_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        fast_settings, harness, harness_with, ride_init, wait_for_status, Harness,
        StubRoutingProvider, DESTINATION, PICKUP,
    };
    use crate::services::routing_service::{EstimatorSettings, RoutingProvider, TripEstimator};
    use crate::services::user_service::{MemoryUserDirectory, UserDirectory};
    use crate::test_support::{driver, passenger, FailingRoutingProvider, FixedGeocoder};

    fn p1() -> Actor {
        Actor::passenger("p1")
    }

    fn d1() -> Actor {
        Actor::driver("d1")
    }

    async fn requested(h: &Harness) -> RideRequest {
        h.engine.create_ride(&p1(), ride_init("p1", "d1")).await.unwrap()
    }

    async fn accepted(h: &Harness) -> RideRequest {
        let ride = requested(h).await;
        h.engine
            .accept_ride(&d1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_ride_reaches_completed() {
        let mut settings = fast_settings(true);
        settings.completion_grace = Duration::from_millis(100);
        let h = harness(settings);
        let ride = requested(&h).await;
        assert_eq!(ride.pickup.address.as_deref(), Some("Meram, Konya"));

        let ride = h.engine.accept_ride(&d1(), &ride.id, AcceptRequest::default()).await.unwrap();
        assert_eq!(ride.status, RideStatus::Accepted);
        assert!(!ride.route_coordinates.is_empty());
        assert!(ride.driver_location.is_some());
        assert_eq!(ride.current_leg, Some(RouteLeg::ToPickup));

        let ride = h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        assert!(ride.passenger_boarded);

        let started = h.engine.start_ride(&d1(), &ride.id).await.unwrap();
        assert_eq!(started.status, RideStatus::InProgress);
        assert_eq!(started.current_leg, Some(RouteLeg::ToDestination));
        assert_eq!(started.route_coordinates.first(), Some(&PICKUP));
        let distance_km = started.distance_km.unwrap();
        assert_eq!(started.fare, Some((distance_km * 5.0).round()));
        assert!(started.distance.is_some() && started.duration.is_some());

        let arrived = wait_for_status(&h.store, &ride.id, RideStatus::Arrived).await;
        assert_eq!(arrived.driver_location, Some(DESTINATION));

        let completed = wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;
        assert!(completed.timestamps_ordered());
        assert!(completed.position_lease.is_none());
        assert_eq!(completed.fare, started.fare);
    }

    #[tokio::test]
    async fn test_driver_reaches_pickup_through_simulation() {
        let h = harness(fast_settings(true));
        let ride = accepted(&h).await;
        assert!(!ride.driver_at_pickup);

        let mut events = h.store.subscribe(RideFilter::ride(&ride.id)).await.unwrap();
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.next().await {
                if let RideEvent::Changed(ride) = event {
                    if ride.driver_at_pickup {
                        return ride;
                    }
                }
            }
            panic!("feed ended");
        })
        .await
        .unwrap();
        assert_eq!(reached.status, RideStatus::Accepted);
        let at = reached.driver_location.unwrap();
        assert!(at.distance_km(&PICKUP) <= PICKUP_RADIUS_KM);
    }

    #[tokio::test]
    async fn test_duplicate_accept_is_a_no_op() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;

        let again = h
            .engine
            .accept_ride(&d1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap();
        assert_eq!(again.version, ride.version);
        assert_eq!(again.position_lease, ride.position_lease);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let h = harness(fast_settings(false));
        let ride = requested(&h).await;

        let rejected = h
            .engine
            .reject_ride(&d1(), &ride.id, Some("Too far".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, RideStatus::Rejected);
        assert!(rejected.rejected_at.is_some());
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Too far"));

        let err = h
            .engine
            .accept_ride(&d1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition { from: RideStatus::Rejected, .. }
        ));
        assert_eq!(h.store.get(&ride.id).await.unwrap().status, RideStatus::Rejected);

        // Both parties are free again
        h.engine.create_ride(&p1(), ride_init("p1", "d1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_boarding() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;

        let err = h.engine.start_ride(&d1(), &ride.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));

        let stored = h.store.get(&ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Accepted);
        assert_eq!(stored.version, ride.version);
        // Only the leg 1 route was computed
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_passenger_cancel_stops_simulation() {
        let mut settings = fast_settings(true);
        settings.simulation_tick = Duration::from_millis(20);
        let h = harness(settings);

        let ride = accepted(&h).await;
        let lease = ride.position_lease.clone().unwrap();
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();

        let cancelled = h
            .engine
            .cancel_ride(&p1(), &ride.id, None)
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancelled_by, Some(ActorRole::Passenger));
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("Cancelled by the passenger"));
        assert!(cancelled.position_lease.is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let later = h.store.get(&ride.id).await.unwrap();
        assert_eq!(later.version, cancelled.version);
        assert_eq!(later.driver_location, cancelled.driver_location);

        let err = h
            .engine
            .push_driver_location(
                &d1(),
                &ride.id,
                LocationUpdate {
                    lease,
                    location: PICKUP,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_cancel_during_grace_prevents_completion() {
        let mut settings = fast_settings(false);
        settings.completion_grace = Duration::from_millis(80);
        let h = harness(settings);

        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();
        let arrived = h.engine.arrive(&d1(), &ride.id).await.unwrap();
        assert_eq!(arrived.status, RideStatus::Arrived);

        let cancelled = h
            .engine
            .cancel_ride(&d1(), &ride.id, Some("Passenger disputed the fare".into()))
            .await
            .unwrap();
        assert_eq!(cancelled.cancelled_by, Some(ActorRole::Driver));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.get(&ride.id).await.unwrap().status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_completion_guards() {
        let mut settings = fast_settings(false);
        settings.completion_grace = Duration::from_secs(60);
        let h = harness(settings);

        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();

        let err = h.engine.complete_ride(&Actor::System, &ride.id).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidTransition { from: RideStatus::InProgress, .. }
        ));

        h.engine.arrive(&Actor::System, &ride.id).await.unwrap();
        let err = h.engine.complete_ride(&Actor::System, &ride.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));

        let err = h.engine.complete_ride(&d1(), &ride.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_only_assigned_parties_may_act() {
        let h = harness(fast_settings(false));
        let ride = requested(&h).await;

        let err = h
            .engine
            .accept_ride(&Actor::driver("d2"), &ride.id, AcceptRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { actor: ActorRole::Driver, .. }));

        let err = h
            .engine
            .accept_ride(&p1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { actor: ActorRole::Passenger, .. }));

        let err = h.engine.get_ride(&Actor::passenger("p2"), &ride.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));

        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_ride_pending() {
        let store = RideStore::in_memory();
        let provider = Arc::new(FailingRoutingProvider::unavailable());
        let estimator = TripEstimator::new(
            provider.clone(),
            EstimatorSettings {
                max_attempts: 2,
                backoff: Duration::from_millis(1),
                ..EstimatorSettings::default()
            },
        );
        let engine = DispatchService::new(
            store.clone(),
            estimator,
            Arc::new(MemoryUserDirectory::with_users([passenger("p1"), driver("d1")])),
            Arc::new(FixedGeocoder(None)),
            fast_settings(false),
        );

        // Geocoding failure is not fatal
        let ride = engine.create_ride(&p1(), ride_init("p1", "d1")).await.unwrap();
        assert!(ride.pickup.address.is_none());

        let err = engine
            .accept_ride(&d1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProviderUnavailable(_)));
        assert_eq!(provider.calls(), 2);

        let stored = store.get(&ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Pending);
        assert!(stored.route_coordinates.is_empty());
        assert!(stored.position_lease.is_none());
    }

    #[tokio::test]
    async fn test_create_checks_driver_and_admission() {
        let h = harness(fast_settings(false));

        let err = h
            .engine
            .create_ride(&p1(), ride_init("p1", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UserNotFound(_)));

        let mut offline = driver("d2");
        offline.is_online = false;
        h.users.upsert_user(offline).await.unwrap();
        let err = h.engine.create_ride(&p1(), ride_init("p1", "d2")).await.unwrap_err();
        assert!(matches!(err, DispatchError::PreconditionFailed(_)));

        let err = h
            .engine
            .create_ride(&Actor::passenger("p2"), ride_init("p1", "d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));

        requested(&h).await;
        let err = h.engine.create_ride(&p1(), ride_init("p1", "d1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::ActiveRideExists { .. }));
    }

    #[tokio::test]
    async fn test_position_writes_need_the_lease() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;
        let lease = ride.position_lease.clone().unwrap();

        let err = h
            .engine
            .push_driver_location(
                &d1(),
                &ride.id,
                LocationUpdate {
                    lease: "forged".into(),
                    location: PICKUP,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));

        let err = h
            .engine
            .push_driver_location(
                &p1(),
                &ride.id,
                LocationUpdate {
                    lease: lease.clone(),
                    location: PICKUP,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));

        let moved = h
            .engine
            .push_driver_location(&d1(), &ride.id, LocationUpdate { lease, location: PICKUP })
            .await
            .unwrap();
        assert_eq!(moved.driver_location, Some(PICKUP));
        assert!(moved.driver_at_pickup);
    }

    #[tokio::test]
    async fn test_rating_after_completion() {
        let mut settings = fast_settings(false);
        settings.completion_grace = Duration::from_millis(5);
        let h = harness(settings);

        let ride = accepted(&h).await;
        let early = h
            .engine
            .rate_ride(&p1(), &ride.id, RatingRequest { rating: 5, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(early, DispatchError::InvalidTransition { .. }));

        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();
        h.engine.arrive(&d1(), &ride.id).await.unwrap();
        wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;

        let out_of_range = h
            .engine
            .rate_ride(&p1(), &ride.id, RatingRequest { rating: 6, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(out_of_range, DispatchError::InvalidFieldValue { .. }));

        let by_driver = h
            .engine
            .rate_ride(&d1(), &ride.id, RatingRequest { rating: 4, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(by_driver, DispatchError::Forbidden { .. }));

        let request = RatingRequest {
            rating: 4,
            comment: Some("Smooth ride".into()),
        };
        let rated = h.engine.rate_ride(&p1(), &ride.id, request.clone()).await.unwrap();
        assert_eq!(rated.rating, Some(4));
        assert_eq!(rated.comment.as_deref(), Some("Smooth ride"));

        let again = h.engine.rate_ride(&p1(), &ride.id, request).await.unwrap();
        assert_eq!(again.version, rated.version);

        let changed = h
            .engine
            .rate_ride(&p1(), &ride.id, RatingRequest { rating: 1, comment: None })
            .await
            .unwrap_err();
        assert!(matches!(changed, DispatchError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_duplicate_commands_are_idempotent() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;

        let boarded = h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        let again = h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        assert_eq!(boarded.version, again.version);

        let cancelled = h.engine.cancel_ride(&p1(), &ride.id, None).await.unwrap();
        let again = h.engine.cancel_ride(&d1(), &ride.id, None).await.unwrap();
        assert_eq!(again.version, cancelled.version);
        assert_eq!(again.cancelled_by, Some(ActorRole::Passenger));
    }

    #[tokio::test]
    async fn test_watch_requests_streams_pending_rides() {
        let h = harness(fast_settings(false));

        let err = h.engine.watch_requests(&Actor::driver("d2"), "d1").await.err();
        assert!(matches!(err, Some(DispatchError::Forbidden { .. })));

        let mut requests = h.engine.watch_requests(&d1(), "d1").await.unwrap();
        assert_eq!(requests.next().await, Some(RideEvent::Snapshot(Vec::new())));

        let ride = requested(&h).await;
        assert_eq!(requests.next().await, Some(RideEvent::Changed(ride.clone())));

        h.engine
            .accept_ride(&d1(), &ride.id, AcceptRequest::default())
            .await
            .unwrap();
        assert_eq!(requests.next().await, Some(RideEvent::Removed(ride.id)));
    }

    #[tokio::test]
    async fn test_recover_resumes_completion() {
        let mut settings = fast_settings(false);
        settings.completion_grace = Duration::from_millis(5);
        let provider = Arc::new(StubRoutingProvider::new());
        let h = harness_with(settings.clone(), provider.clone());

        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();

        // Arrival written by a process that went away before completing
        let current = h.store.get(&ride.id).await.unwrap();
        let arrived = Change::Arrived.apply(&current, Utc::now());
        h.store.commit(&current, arrived).await.unwrap();

        let restarted = DispatchService::new(
            h.store.clone(),
            TripEstimator::new(provider, EstimatorSettings::default()),
            h.users.clone(),
            Arc::new(FixedGeocoder(None)),
            settings,
        );
        assert_eq!(restarted.recover().await.unwrap(), 1);
        wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;
    }

    struct BadPointProvider;

    #[async_trait]
    impl RoutingProvider for BadPointProvider {
        async fn route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate> {
            let mut estimate = StubRoutingProvider::new().route(origin, destination).await?;
            estimate.coordinates[2] = Coordinate::new(95.0, 32.49);
            Ok(estimate)
        }

        fn name(&self) -> &'static str {
            "bad-point"
        }
    }

    #[tokio::test]
    async fn test_bad_route_geometry_leaves_ride_accepted() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();

        let engine = DispatchService::new(
            h.store.clone(),
            TripEstimator::new(Arc::new(BadPointProvider), EstimatorSettings::default()),
            h.users.clone(),
            Arc::new(FixedGeocoder(None)),
            fast_settings(false),
        );
        let err = engine.start_ride(&d1(), &ride.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPolyline(_)));
        assert_eq!(h.store.get(&ride.id).await.unwrap().status, RideStatus::Accepted);
    }

    #[tokio::test]
    async fn test_simulation_skips_a_bad_point_and_still_arrives() {
        let h = harness(fast_settings(false));
        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();

        // A stored leg with one point the engine refuses to record
        let current = h.store.get(&ride.id).await.unwrap();
        assert_eq!(current.route_coordinates.len(), 5);
        let mut damaged = current.clone();
        damaged.route_coordinates[2] = Coordinate::new(95.0, 32.49);
        h.store.commit(&current, damaged).await.unwrap();

        let restarted = DispatchService::new(
            h.store.clone(),
            TripEstimator::new(h.provider.clone(), EstimatorSettings::default()),
            h.users.clone(),
            Arc::new(FixedGeocoder(None)),
            fast_settings(true),
        );
        assert_eq!(restarted.recover().await.unwrap(), 1);

        let arrived = wait_for_status(&h.store, &ride.id, RideStatus::Arrived).await;
        assert_eq!(arrived.driver_location, Some(DESTINATION));
        wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_late_task_registration_does_not_leak() {
        let mut settings = fast_settings(true);
        settings.simulation_tick = Duration::from_millis(5);
        let h = harness(settings);

        let ride = accepted(&h).await;
        h.engine.cancel_ride(&p1(), &ride.id, None).await.unwrap();
        assert!(h.engine.lock_tasks().is_empty());

        // Registrations that lost the race with the cancel
        h.engine.start_simulation(&ride);
        h.engine.schedule_completion(&ride);
        assert_eq!(h.engine.lock_tasks().len(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.engine.lock_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.store.get(&ride.id).await.unwrap().status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_finished_rides_leave_no_tasks() {
        let mut settings = fast_settings(true);
        settings.completion_grace = Duration::from_millis(10);
        let h = harness(settings);

        let ride = accepted(&h).await;
        h.engine.confirm_boarding(&p1(), &ride.id).await.unwrap();
        h.engine.start_ride(&d1(), &ride.id).await.unwrap();
        wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.engine.lock_tasks().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
