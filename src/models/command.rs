// src/models/command.rs
use serde::{Deserialize, Serialize};

use super::ride::{Coordinate, RideResponse};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    /// Where the driver is right now. Falls back to the driver's profile.
    #[serde(default)]
    pub driver_location: Option<Coordinate>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RatingRequest {
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub lease: String,
    pub location: Coordinate,
}

/// Returned only to the accepting driver.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    pub ride: RideResponse,
    pub position_lease: String,
}
