// src/services/routing_service.rs
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::ride::Coordinate,
    utils::polyline::decode_polyline,
};

pub const DEFAULT_DIRECTIONS_URL: &str = "https://maps.googleapis.com/maps/api/directions/json";

/// One computed leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEstimate {
    pub coordinates: Vec<Coordinate>,
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub distance_text: String,
    pub duration_text: String,
}

#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate>;
    fn name(&self) -> &'static str;
}

// ------------------------------
// Google Directions
// ------------------------------

#[derive(Debug, Deserialize)]
pub struct DirectionsResponse {
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsRoute {
    pub overview_polyline: EncodedPolyline,
    #[serde(default)]
    pub legs: Vec<DirectionsLeg>,
}

#[derive(Debug, Deserialize)]
pub struct EncodedPolyline {
    pub points: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectionsLeg {
    pub distance: TextValue,
    pub duration: TextValue,
}

#[derive(Debug, Deserialize)]
pub struct TextValue {
    pub text: String,
    /// Metres for distances, seconds for durations.
    pub value: f64,
}

/// Map a Directions API body onto a route or a provider error.
pub fn parse_directions(response: DirectionsResponse) -> DispatchResult<RouteEstimate> {
    let detail = response
        .error_message
        .clone()
        .unwrap_or_else(|| response.status.clone());

    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" | "NOT_FOUND" => return Err(DispatchError::RouteNotFound(detail)),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(DispatchError::ProviderRateLimited),
        "UNKNOWN_ERROR" => return Err(DispatchError::ProviderUnavailable(detail)),
        _ => return Err(DispatchError::ProviderRejected(detail)),
    }

    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| DispatchError::RouteNotFound("response contained no routes".to_string()))?;

    let coordinates = decode_polyline(&route.overview_polyline.points)?;
    if coordinates.is_empty() {
        return Err(DispatchError::RouteNotFound("route has no geometry".to_string()));
    }

    let metres: f64 = route.legs.iter().map(|leg| leg.distance.value).sum();
    let seconds: f64 = route.legs.iter().map(|leg| leg.duration.value).sum();
    let distance_km = metres / 1000.0;
    let duration_minutes = seconds / 60.0;

    // Single-leg requests, so the first leg's text describes the whole route
    let (distance_text, duration_text) = match route.legs.first() {
        Some(leg) if route.legs.len() == 1 => (leg.distance.text.clone(), leg.duration.text.clone()),
        _ => (format_distance(distance_km), format_duration(duration_minutes)),
    };

    Ok(RouteEstimate {
        coordinates,
        distance_km,
        duration_minutes,
        distance_text,
        duration_text,
    })
}

pub struct GoogleDirectionsProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleDirectionsProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> DispatchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::InvalidConfiguration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RoutingProvider for GoogleDirectionsProvider {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate> {
        tracing::debug!(
            "Requesting directions {},{} -> {},{}",
            origin.latitude,
            origin.longitude,
            destination.latitude,
            destination.longitude
        );

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("origin", format!("{},{}", origin.latitude, origin.longitude)),
                ("destination", format!("{},{}", destination.latitude, destination.longitude)),
                ("mode", "driving".to_string()),
                ("key", self.api_key.clone()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::ProviderRateLimited);
        }
        if status.is_server_error() {
            return Err(DispatchError::ProviderUnavailable(format!("directions returned {}", status)));
        }
        if !status.is_success() {
            return Err(DispatchError::ProviderRejected(format!("directions returned {}", status)));
        }

        let body: DirectionsResponse = response.json().await?;
        parse_directions(body)
    }

    fn name(&self) -> &'static str {
        "google-directions"
    }
}

// ------------------------------
// Straight-line fallback
// ------------------------------

/// Haversine estimate used when no routing API key is configured.
pub struct StraightLineProvider {
    average_speed_kmh: f64,
    segments: usize,
}

impl StraightLineProvider {
    pub fn new(average_speed_kmh: f64, segments: usize) -> Self {
        Self {
            average_speed_kmh,
            segments: segments.max(1),
        }
    }

    pub fn estimate(&self, origin: Coordinate, destination: Coordinate) -> RouteEstimate {
        let distance_km = origin.distance_km(&destination);
        let duration_minutes = distance_km / self.average_speed_kmh * 60.0;

        let coordinates = (0..=self.segments)
            .map(|step| {
                let t = step as f64 / self.segments as f64;
                Coordinate::new(
                    origin.latitude + (destination.latitude - origin.latitude) * t,
                    origin.longitude + (destination.longitude - origin.longitude) * t,
                )
            })
            .collect();

        RouteEstimate {
            coordinates,
            distance_km,
            duration_minutes,
            distance_text: format_distance(distance_km),
            duration_text: format_duration(duration_minutes),
        }
    }
}

impl Default for StraightLineProvider {
    fn default() -> Self {
        // Urban average, same figure the dispatch UI quoted
        Self::new(30.0, 20)
    }
}

#[async_trait]
impl RoutingProvider for StraightLineProvider {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate> {
        Ok(self.estimate(origin, destination))
    }

    fn name(&self) -> &'static str {
        "straight-line"
    }
}

// ------------------------------
// Estimator
// ------------------------------

#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    pub rate_per_km: f64,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            rate_per_km: 5.0,
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Routes, fares and the simulated position feed.
#[derive(Clone)]
pub struct TripEstimator {
    provider: Arc<dyn RoutingProvider>,
    settings: EstimatorSettings,
}

impl TripEstimator {
    pub fn new(provider: Arc<dyn RoutingProvider>, settings: EstimatorSettings) -> Self {
        Self { provider, settings }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Route from `origin` to `destination`, starting exactly at `origin`.
    /// Rate limits and transport failures are retried with exponential
    /// backoff; anything else fails immediately.
    pub async fn compute_route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate> {
        if !origin.is_valid() || !destination.is_valid() {
            return Err(DispatchError::validation_error(
                "coordinates",
                "route endpoints must be valid coordinates",
            ));
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = self.settings.backoff;
        let mut attempt = 1;

        loop {
            match self.provider.route(origin, destination).await {
                Ok(mut estimate) => {
                    if estimate.coordinates.iter().any(|point| !point.is_valid()) {
                        tracing::error!("{} returned a route with out-of-range points", self.provider.name());
                        return Err(DispatchError::InvalidPolyline(
                            "route contains an out-of-range coordinate".to_string(),
                        ));
                    }
                    if estimate.coordinates.first() != Some(&origin) {
                        estimate.coordinates.insert(0, origin);
                    }
                    tracing::debug!(
                        "Route via {}: {:.2} km, {} points",
                        self.provider.name(),
                        estimate.distance_km,
                        estimate.coordinates.len()
                    );
                    return Ok(estimate);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "Routing attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Routing failed after {} attempt(s): {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    pub fn compute_fare(&self, distance_km: f64) -> f64 {
        compute_fare(distance_km, self.settings.rate_per_km)
    }
}

/// Flat `round(distance * rate)`. Anything that is not a finite positive
/// distance costs nothing.
pub fn compute_fare(distance_km: f64, rate_per_km: f64) -> f64 {
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return 0.0;
    }
    (distance_km * rate_per_km).round()
}

/// Emit the route one point per tick. The stream ends when the route is
/// exhausted; dropping it early stops the timer.
pub fn simulate_position_feed(route: Vec<Coordinate>, tick: Duration) -> BoxStream<'static, Coordinate> {
    let tick = tick.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold((interval, route.into_iter()), |(mut interval, mut points)| async move {
        let next = points.next()?;
        interval.tick().await;
        Some((next, (interval, points)))
    })
    .boxed()
}

pub fn format_distance(distance_km: f64) -> String {
    if distance_km < 1.0 {
        format!("{} m", (distance_km * 1000.0).round())
    } else {
        format!("{:.1} km", distance_km)
    }
}

pub fn format_duration(minutes: f64) -> String {
    let total = minutes.round().max(1.0) as u64;
    match (total / 60, total % 60) {
        (0, m) => format!("{} min", m),
        (h, 0) => format!("{} h", h),
        (h, m) => format!("{} h {} min", h, m),
    }
}
