// src/models/document.rs
//
// Store-boundary normalization. Rides written by the first mobile clients
// used `pickupLocation`/`dropoffLocation`, kept the driver position under
// `driver.location.coordinates` as `[lng, lat]`, and mixed ISO strings,
// epoch millis and `{seconds, nanoseconds}` objects for timestamps. Every
// read goes through `decode_ride`, so nothing past this file has to care.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::ride::{
    ActorRole, Coordinate, Destination, PickupLocation, RideRequest, RideStatus, RouteLeg,
    SCHEMA_VERSION,
};
use crate::errors::{DispatchError, DispatchResult};

/// Decode a stored document into the canonical ride. `key_id` is the id the
/// document was stored under, used when the body does not carry one.
pub fn decode_ride(key_id: &str, value: Value) -> DispatchResult<RideRequest> {
    let schema_version = value
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    if schema_version >= SCHEMA_VERSION as u64 {
        return Ok(serde_json::from_value(value)?);
    }

    tracing::debug!("Normalizing legacy ride document: {}", key_id);
    decode_legacy(key_id, &value)
}

fn decode_legacy(key_id: &str, doc: &Value) -> DispatchResult<RideRequest> {
    let id = str_field(doc, &["id"]).unwrap_or_else(|| key_id.to_string());

    let status_text = str_field(doc, &["status"]).unwrap_or_else(|| "pending".to_string());
    let status = RideStatus::parse(&status_text)
        .ok_or_else(|| DispatchError::InvalidFormat(format!("unknown ride status '{}'", status_text)))?;

    let pickup_doc = first_present(doc, &["pickup", "pickupLocation"])
        .ok_or_else(|| DispatchError::MissingRequiredField("pickup".to_string()))?;
    let pickup_at = coordinate_of(pickup_doc)
        .ok_or_else(|| DispatchError::InvalidFormat("pickup has no coordinates".to_string()))?;
    let pickup = PickupLocation {
        latitude: pickup_at.latitude,
        longitude: pickup_at.longitude,
        address: str_field(pickup_doc, &["address"]),
    };

    let destination_doc = first_present(doc, &["destination", "dropoffLocation"])
        .ok_or_else(|| DispatchError::MissingRequiredField("destination".to_string()))?;
    let destination_at = coordinate_of(destination_doc)
        .ok_or_else(|| DispatchError::InvalidFormat("destination has no coordinates".to_string()))?;
    let destination = Destination {
        latitude: destination_at.latitude,
        longitude: destination_at.longitude,
        display_name: str_field(destination_doc, &["display_name", "displayName", "address"])
            .unwrap_or_default(),
    };

    let updated_at = timestamp_field(doc, "updatedAt");
    let created_at = timestamp_field(doc, "createdAt")
        .or(updated_at)
        .ok_or_else(|| DispatchError::MissingRequiredField("createdAt".to_string()))?;

    let started_at = timestamp_field(doc, "startedAt");
    let fare = doc
        .get("fare")
        .or_else(|| doc.get("calculatedFare"))
        .and_then(number_of)
        // The old clients wrote a 0 placeholder before the trip started.
        .filter(|fare| *fare > 0.0 || started_at.is_some());

    let route_coordinates = doc
        .get("routeCoordinates")
        .and_then(Value::as_array)
        .map(|points| points.iter().filter_map(coordinate_of).collect())
        .unwrap_or_default();

    let driver_location = doc
        .get("driverLocation")
        .and_then(coordinate_of)
        .or_else(|| doc.pointer("/driver/location").and_then(coordinate_of));

    let current_leg = str_field(doc, &["currentLeg", "currentRouteType"]).and_then(|leg| {
        match leg.as_str() {
            "to_pickup" | "to_passenger" => Some(RouteLeg::ToPickup),
            "to_destination" => Some(RouteLeg::ToDestination),
            _ => None,
        }
    });

    let cancelled_by = str_field(doc, &["cancelledBy"]).and_then(|by| match by.as_str() {
        "passenger" => Some(ActorRole::Passenger),
        "driver" => Some(ActorRole::Driver),
        "system" | "admin" => Some(ActorRole::System),
        _ => None,
    });

    let rejected_at = timestamp_field(doc, "rejectedAt").or_else(|| {
        if status == RideStatus::Rejected {
            updated_at
        } else {
            None
        }
    });

    Ok(RideRequest {
        id,
        version: doc.get("version").and_then(Value::as_u64).unwrap_or(0),
        schema_version: SCHEMA_VERSION,
        passenger_id: str_field(doc, &["passengerId"]).unwrap_or_default(),
        driver_id: str_field(doc, &["driverId"]).unwrap_or_default(),
        status,
        pickup,
        destination,
        route_coordinates,
        current_leg,
        driver_location,
        driver_at_pickup: doc
            .get("driverAtPickup")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        distance: str_field(doc, &["distance", "actualDistance"]).filter(|d| d != "0 km"),
        duration: str_field(doc, &["duration", "actualDuration"]).filter(|d| d != "0 dk"),
        distance_km: doc.get("distanceKm").and_then(number_of),
        duration_minutes: doc.get("durationMinutes").and_then(number_of),
        fare,
        passenger_boarded: doc
            .get("passengerBoarded")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        passenger_boarded_at: timestamp_field(doc, "passengerBoardedAt"),
        created_at,
        accepted_at: timestamp_field(doc, "acceptedAt"),
        started_at,
        arrived_at: timestamp_field(doc, "arrivedAt"),
        completed_at: timestamp_field(doc, "completedAt"),
        cancelled_at: timestamp_field(doc, "cancelledAt"),
        rejected_at,
        cancelled_by,
        cancel_reason: str_field(doc, &["cancelReason"]),
        rejection_reason: str_field(doc, &["rejectionReason"]),
        rating: doc
            .get("rating")
            .and_then(number_of)
            .map(|r| r.round().clamp(1.0, 5.0) as u8),
        comment: str_field(doc, &["comment"]),
        position_lease: str_field(doc, &["positionLease"]),
        updated_at: updated_at.unwrap_or(created_at),
    })
}

fn first_present<'a>(doc: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| doc.get(*key))
        .find(|value| !value.is_null())
}

fn str_field(doc: &Value, keys: &[&str]) -> Option<String> {
    first_present(doc, keys)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts `{latitude, longitude}`, `{lat, lng}`, `{coordinates: [lng, lat]}`
/// and a bare `[lng, lat]` pair (GeoJSON order).
fn coordinate_of(value: &Value) -> Option<Coordinate> {
    if let Some(pair) = value.as_array() {
        let lng = pair.first().and_then(number_of)?;
        let lat = pair.get(1).and_then(number_of)?;
        return Some(Coordinate::new(lat, lng));
    }
    if let Some(pair) = value.get("coordinates") {
        return coordinate_of(pair);
    }

    let latitude = value
        .get("latitude")
        .or_else(|| value.get("lat"))
        .and_then(number_of)?;
    let longitude = value
        .get("longitude")
        .or_else(|| value.get("lng"))
        .or_else(|| value.get("lon"))
        .and_then(number_of)?;
    Some(Coordinate::new(latitude, longitude))
}

fn timestamp_field(doc: &Value, key: &str) -> Option<DateTime<Utc>> {
    doc.get(key).and_then(timestamp_of)
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(_) => {
            let seconds = value
                .get("seconds")
                .or_else(|| value.get("_seconds"))
                .and_then(Value::as_i64)?;
            let nanos = value
                .get("nanoseconds")
                .or_else(|| value.get("_nanoseconds"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, nanos as u32).single()
        }
        _ => None,
    }
}
