// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{DispatchError, ValidationError};

pub type RideId = String;

/// Current canonical document layout. Anything older goes through
/// `models::document::decode_ride`.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,    // Created by the passenger, waiting for the driver
    Accepted,   // Driver accepted and is heading to the pickup
    Rejected,   // Driver turned the request down
    InProgress, // Passenger on board, heading to the destination
    Arrived,    // At the destination, settlement grace window
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Accepted => "accepted",
            RideStatus::Rejected => "rejected",
            RideStatus::InProgress => "in_progress",
            RideStatus::Arrived => "arrived",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RideStatus::Pending),
            "accepted" => Some(RideStatus::Accepted),
            "rejected" => Some(RideStatus::Rejected),
            "in_progress" => Some(RideStatus::InProgress),
            "arrived" => Some(RideStatus::Arrived),
            "completed" => Some(RideStatus::Completed),
            "cancelled" => Some(RideStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Passenger,
    Driver,
    System,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Passenger => f.write_str("passenger"),
            ActorRole::Driver => f.write_str("driver"),
            ActorRole::System => f.write_str("system"),
        }
    }
}

/// Whoever issues a lifecycle command. User ids come from the identity
/// provider and are trusted as given.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Actor {
    Passenger { id: String },
    Driver { id: String },
    System,
}

impl Actor {
    pub fn passenger(id: impl Into<String>) -> Self {
        Actor::Passenger { id: id.into() }
    }

    pub fn driver(id: impl Into<String>) -> Self {
        Actor::Driver { id: id.into() }
    }

    pub fn role(&self) -> ActorRole {
        match self {
            Actor::Passenger { .. } => ActorRole::Passenger,
            Actor::Driver { .. } => ActorRole::Driver,
            Actor::System => ActorRole::System,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Actor::Passenger { id } | Actor::Driver { id } => Some(id),
            Actor::System => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let earth_radius_km = 6371.0;
        let lat1_rad = self.latitude.to_radians();
        let lat2_rad = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        earth_radius_km * c
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PickupLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PickupLocation {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Destination {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

impl Destination {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Which leg `routeCoordinates` currently describes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteLeg {
    ToPickup,
    ToDestination,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideRequest {
    pub id: RideId,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub schema_version: u32,
    pub passenger_id: String,
    pub driver_id: String,
    pub status: RideStatus,

    // Locations
    pub pickup: PickupLocation,
    pub destination: Destination,
    #[serde(default)]
    pub route_coordinates: Vec<Coordinate>,
    #[serde(default)]
    pub current_leg: Option<RouteLeg>,
    #[serde(default)]
    pub driver_location: Option<Coordinate>,
    #[serde(default)]
    pub driver_at_pickup: bool,

    // Metrics of the current leg
    #[serde(default)]
    pub distance: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub duration_minutes: Option<f64>,
    #[serde(default)]
    pub fare: Option<f64>,

    #[serde(default)]
    pub passenger_boarded: bool,
    #[serde(default)]
    pub passenger_boarded_at: Option<DateTime<Utc>>,

    // Lifecycle timestamps
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub arrived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cancelled_by: Option<ActorRole>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,

    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub comment: Option<String>,

    /// Token the assigned driver session must present to write positions.
    #[serde(default)]
    pub position_lease: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl RideRequest {
    pub fn new(id: RideId, ride: NewRide, now: DateTime<Utc>) -> Self {
        Self {
            id,
            version: 0,
            schema_version: SCHEMA_VERSION,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            status: RideStatus::Pending,
            pickup: ride.pickup,
            destination: ride.destination,
            route_coordinates: Vec::new(),
            current_leg: None,
            driver_location: None,
            driver_at_pickup: false,
            distance: None,
            duration: None,
            distance_km: None,
            duration_minutes: None,
            fare: None,
            passenger_boarded: false,
            passenger_boarded_at: None,
            created_at: now,
            accepted_at: None,
            started_at: None,
            arrived_at: None,
            completed_at: None,
            cancelled_at: None,
            rejected_at: None,
            cancelled_by: None,
            cancel_reason: None,
            rejection_reason: None,
            rating: None,
            comment: None,
            position_lease: None,
            updated_at: now,
        }
    }

    /// Latest lifecycle timestamp recorded so far.
    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        [
            Some(self.created_at),
            self.accepted_at,
            self.passenger_boarded_at,
            self.started_at,
            self.arrived_at,
            self.completed_at,
            self.cancelled_at,
            self.rejected_at,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.created_at)
    }

    /// A timestamp for the next lifecycle event that never goes backwards,
    /// even if the wall clock does.
    pub fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.max(self.latest_timestamp())
    }

    /// `createdAt <= acceptedAt <= startedAt <= arrivedAt <= completedAt` for
    /// every stamp that is present.
    pub fn timestamps_ordered(&self) -> bool {
        let chain = [
            Some(self.created_at),
            self.accepted_at,
            self.started_at,
            self.arrived_at,
            self.completed_at,
        ];
        let stamps: Vec<DateTime<Utc>> = chain.into_iter().flatten().collect();
        let ordered = stamps.windows(2).all(|pair| pair[0] <= pair[1]);

        if self.completed_at.is_some() {
            ordered && self.accepted_at.is_some() && self.started_at.is_some()
        } else {
            ordered
        }
    }

    pub fn is_party(&self, actor: &Actor) -> bool {
        match actor {
            Actor::Passenger { id } => *id == self.passenger_id,
            Actor::Driver { id } => *id == self.driver_id,
            Actor::System => true,
        }
    }
}

/// Creation payload. Everything is optional here so that validation can
/// report every missing field at once.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RideRequestInit {
    pub passenger_id: Option<String>,
    pub driver_id: Option<String>,
    pub pickup: Option<PickupLocation>,
    pub destination: Option<Destination>,
}

/// A creation payload that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRide {
    pub passenger_id: String,
    pub driver_id: String,
    pub pickup: PickupLocation,
    pub destination: Destination,
}

impl RideRequestInit {
    pub fn validate(self) -> Result<NewRide, DispatchError> {
        let mut errors = Vec::new();

        let passenger_id = non_blank(self.passenger_id);
        if passenger_id.is_none() {
            errors.push(field_error("passengerId", "passenger id is required"));
        }
        let driver_id = non_blank(self.driver_id);
        if driver_id.is_none() {
            errors.push(field_error("driverId", "driver id is required"));
        }

        match &self.pickup {
            None => errors.push(field_error("pickup", "pickup location is required")),
            Some(pickup) if !pickup.coordinate().is_valid() => {
                errors.push(field_error("pickup", "pickup coordinates are out of range"))
            }
            Some(_) => {}
        }

        match &self.destination {
            None => errors.push(field_error("destination", "destination is required")),
            Some(destination) => {
                if !destination.coordinate().is_valid() {
                    errors.push(field_error("destination", "destination coordinates are out of range"));
                }
                if destination.display_name.trim().is_empty() {
                    errors.push(field_error("destination.display_name", "destination label is required"));
                }
            }
        }

        match (passenger_id, driver_id, self.pickup, self.destination) {
            (Some(passenger_id), Some(driver_id), Some(pickup), Some(destination)) if errors.is_empty() => {
                if passenger_id == driver_id {
                    return Err(DispatchError::validation_error(
                        "driverId",
                        "passenger and driver must be different users",
                    ));
                }
                Ok(NewRide {
                    passenger_id,
                    driver_id,
                    pickup,
                    destination,
                })
            }
            _ => Err(DispatchError::ValidationFailed(errors)),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn field_error(field: &str, message: &str) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Field-level update applied through `RideStore::update`. Status and
/// the fields owned by cancel and rate only change through the engine.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RidePatch {
    pub pickup_address: Option<String>,
    pub passenger_boarded: Option<bool>,
    pub driver_location: Option<Coordinate>,
    pub route_coordinates: Option<Vec<Coordinate>>,
    pub current_leg: Option<RouteLeg>,
    pub distance: Option<String>,
    pub duration: Option<String>,
    pub fare: Option<f64>,
}

impl RidePatch {
    pub fn is_empty(&self) -> bool {
        self.pickup_address.is_none()
            && self.passenger_boarded.is_none()
            && self.driver_location.is_none()
            && self.route_coordinates.is_none()
            && self.current_leg.is_none()
            && self.distance.is_none()
            && self.duration.is_none()
            && self.fare.is_none()
    }

    pub fn apply_to(self, ride: &mut RideRequest) {
        if let Some(address) = self.pickup_address {
            ride.pickup.address = Some(address);
        }
        if let Some(boarded) = self.passenger_boarded {
            ride.passenger_boarded = boarded;
        }
        if let Some(location) = self.driver_location {
            ride.driver_location = Some(location);
        }
        if let Some(route) = self.route_coordinates {
            ride.route_coordinates = route;
        }
        if let Some(leg) = self.current_leg {
            ride.current_leg = Some(leg);
        }
        if let Some(distance) = self.distance {
            ride.distance = Some(distance);
        }
        if let Some(duration) = self.duration {
            ride.duration = Some(duration);
        }
        if let Some(fare) = self.fare {
            ride.fare = Some(fare);
        }
    }
}

// Search and Filter Models
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideFilter {
    pub ride_id: Option<RideId>,
    pub passenger_id: Option<String>,
    pub driver_id: Option<String>,
    pub statuses: Option<Vec<RideStatus>>,
}

impl RideFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ride(ride_id: impl Into<String>) -> Self {
        Self {
            ride_id: Some(ride_id.into()),
            ..Self::default()
        }
    }

    pub fn for_passenger(passenger_id: impl Into<String>) -> Self {
        Self {
            passenger_id: Some(passenger_id.into()),
            ..Self::default()
        }
    }

    pub fn for_driver(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: Some(driver_id.into()),
            ..Self::default()
        }
    }

    pub fn pending_for_driver(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: Some(driver_id.into()),
            statuses: Some(vec![RideStatus::Pending]),
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            statuses: Some(vec![
                RideStatus::Pending,
                RideStatus::Accepted,
                RideStatus::InProgress,
                RideStatus::Arrived,
            ]),
            ..Self::default()
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<RideStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn matches(&self, ride: &RideRequest) -> bool {
        self.ride_id.as_ref().is_none_or(|id| *id == ride.id)
            && self
                .passenger_id
                .as_ref()
                .is_none_or(|id| *id == ride.passenger_id)
            && self.driver_id.as_ref().is_none_or(|id| *id == ride.driver_id)
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&ride.status))
    }
}

/// One committed write, as published on the store's change feed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RideChange {
    pub previous: Option<RideRequest>,
    pub current: RideRequest,
}

/// What a subscriber sees: one snapshot, then deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum RideEvent {
    Snapshot(Vec<RideRequest>),
    Changed(RideRequest),
    Removed(RideId),
}

impl RideEvent {
    /// Map a raw change onto what a subscriber with `filter` should see.
    pub fn from_change(filter: &RideFilter, change: RideChange) -> Option<Self> {
        if filter.matches(&change.current) {
            Some(RideEvent::Changed(change.current))
        } else if change.previous.as_ref().is_some_and(|prev| filter.matches(prev)) {
            Some(RideEvent::Removed(change.current.id))
        } else {
            None
        }
    }
}

/// Outward view of a ride. The position lease only goes to the driver, in
/// the accept response.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RideResponse {
    pub id: RideId,
    pub version: u64,
    pub passenger_id: String,
    pub driver_id: String,
    pub status: RideStatus,
    pub pickup: PickupLocation,
    pub destination: Destination,
    pub route_coordinates: Vec<Coordinate>,
    pub current_leg: Option<RouteLeg>,
    pub driver_location: Option<Coordinate>,
    pub driver_at_pickup: bool,
    pub distance: Option<String>,
    pub duration: Option<String>,
    pub fare: Option<f64>,
    pub passenger_boarded: bool,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<ActorRole>,
    pub cancel_reason: Option<String>,
    pub rejection_reason: Option<String>,
    pub rating: Option<u8>,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<RideRequest> for RideResponse {
    fn from(ride: RideRequest) -> Self {
        Self {
            id: ride.id,
            version: ride.version,
            passenger_id: ride.passenger_id,
            driver_id: ride.driver_id,
            status: ride.status,
            pickup: ride.pickup,
            destination: ride.destination,
            route_coordinates: ride.route_coordinates,
            current_leg: ride.current_leg,
            driver_location: ride.driver_location,
            driver_at_pickup: ride.driver_at_pickup,
            distance: ride.distance,
            duration: ride.duration,
            fare: ride.fare,
            passenger_boarded: ride.passenger_boarded,
            created_at: ride.created_at,
            accepted_at: ride.accepted_at,
            started_at: ride.started_at,
            arrived_at: ride.arrived_at,
            completed_at: ride.completed_at,
            cancelled_at: ride.cancelled_at,
            rejected_at: ride.rejected_at,
            cancelled_by: ride.cancelled_by,
            cancel_reason: ride.cancel_reason,
            rejection_reason: ride.rejection_reason,
            rating: ride.rating,
            comment: ride.comment,
            updated_at: ride.updated_at,
        }
    }
}

// Analytics Models
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideAnalytics {
    pub total_rides: u32,
    pub active_rides: u32,
    pub completed_rides: u32,
    pub cancelled_rides: u32,
    pub rejected_rides: u32,
    pub total_earnings: f64,
    pub average_fare: f64,
    pub average_rating: Option<f64>,
    pub cancellation_rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverEarnings {
    pub driver_id: String,
    pub completed_rides: u32,
    pub total_earnings: f64,
    pub average_rating: Option<f64>,
}
