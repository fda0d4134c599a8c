// src/test_support.rs
//
// Shared fixtures for the unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{
        Coordinate, Destination, PickupLocation, RideEvent, RideFilter, RideRequest,
        RideRequestInit, RideStatus, User, UserRole,
    },
    services::{
        dispatch_service::{DispatchService, DispatchSettings},
        geocoding_service::ReverseGeocoder,
        ride_store::RideStore,
        routing_service::{
            EstimatorSettings, RouteEstimate, RoutingProvider, StraightLineProvider, TripEstimator,
        },
        user_service::MemoryUserDirectory,
    },
};

pub const PICKUP: Coordinate = Coordinate {
    latitude: 37.87,
    longitude: 32.48,
};
pub const DESTINATION: Coordinate = Coordinate {
    latitude: 37.90,
    longitude: 32.50,
};
pub const DRIVER_START: Coordinate = Coordinate {
    latitude: 37.86,
    longitude: 32.47,
};

pub fn passenger(id: &str) -> User {
    User {
        id: id.to_string(),
        role: UserRole::Passenger,
        display_name: Some(format!("Passenger {}", id)),
        is_online: true,
        profile_completed: true,
        location: None,
    }
}

pub fn driver(id: &str) -> User {
    User {
        id: id.to_string(),
        role: UserRole::Driver,
        display_name: Some(format!("Driver {}", id)),
        is_online: true,
        profile_completed: true,
        location: Some(DRIVER_START),
    }
}

pub fn ride_init(passenger_id: &str, driver_id: &str) -> RideRequestInit {
    RideRequestInit {
        passenger_id: Some(passenger_id.to_string()),
        driver_id: Some(driver_id.to_string()),
        pickup: Some(PickupLocation {
            latitude: PICKUP.latitude,
            longitude: PICKUP.longitude,
            address: None,
        }),
        destination: Some(Destination {
            latitude: DESTINATION.latitude,
            longitude: DESTINATION.longitude,
            display_name: "Alaaddin Tepesi".to_string(),
        }),
    }
}

/// Straight-line routes with a handful of points, counting calls.
pub struct StubRoutingProvider {
    inner: StraightLineProvider,
    calls: AtomicUsize,
}

impl StubRoutingProvider {
    pub fn new() -> Self {
        Self {
            inner: StraightLineProvider::new(30.0, 4),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingProvider for StubRoutingProvider {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> DispatchResult<RouteEstimate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.estimate(origin, destination))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

pub struct FailingRoutingProvider {
    error: fn() -> DispatchError,
    calls: AtomicUsize,
}

impl FailingRoutingProvider {
    pub fn unavailable() -> Self {
        Self {
            error: || DispatchError::ProviderUnavailable("connection refused".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn no_route() -> Self {
        Self {
            error: || DispatchError::RouteNotFound("ZERO_RESULTS".to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingProvider for FailingRoutingProvider {
    async fn route(&self, _origin: Coordinate, _destination: Coordinate) -> DispatchResult<RouteEstimate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

pub struct FixedGeocoder(pub Option<&'static str>);

#[async_trait]
impl ReverseGeocoder for FixedGeocoder {
    async fn address_for(&self, _location: Coordinate) -> DispatchResult<Option<String>> {
        match self.0 {
            Some(address) => Ok(Some(address.to_string())),
            None => Err(DispatchError::ProviderUnavailable("geocoder down".to_string())),
        }
    }
}

pub fn fast_settings(simulate_positions: bool) -> DispatchSettings {
    DispatchSettings {
        completion_grace: Duration::from_millis(20),
        simulation_tick: Duration::from_millis(2),
        simulate_positions,
    }
}

pub struct Harness {
    pub engine: DispatchService,
    pub store: RideStore,
    pub provider: Arc<StubRoutingProvider>,
    pub users: Arc<MemoryUserDirectory>,
}

pub fn harness(settings: DispatchSettings) -> Harness {
    harness_with(settings, Arc::new(StubRoutingProvider::new()))
}

pub fn harness_with(settings: DispatchSettings, provider: Arc<StubRoutingProvider>) -> Harness {
    let store = RideStore::in_memory();
    let users = Arc::new(MemoryUserDirectory::with_users([
        passenger("p1"),
        passenger("p2"),
        driver("d1"),
        driver("d2"),
    ]));
    let estimator = TripEstimator::new(
        provider.clone(),
        EstimatorSettings {
            backoff: Duration::from_millis(1),
            ..EstimatorSettings::default()
        },
    );
    let engine = DispatchService::new(
        store.clone(),
        estimator,
        users.clone(),
        Arc::new(FixedGeocoder(Some("Meram, Konya"))),
        settings,
    );

    Harness {
        engine,
        store,
        provider,
        users,
    }
}

/// Wait until the ride reaches `status`, observed through the change feed.
pub async fn wait_for_status(store: &RideStore, ride_id: &str, status: RideStatus) -> RideRequest {
    let mut events = store
        .subscribe(RideFilter::ride(ride_id))
        .await
        .expect("subscribe failed");

    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            let rides = match event {
                RideEvent::Snapshot(rides) => rides,
                RideEvent::Changed(ride) => vec![ride],
                RideEvent::Removed(_) => Vec::new(),
            };
            if let Some(ride) = rides.into_iter().find(|r| r.status == status) {
                return Some(ride);
            }
        }
        None
    })
    .await;

    match waited {
        Ok(Some(ride)) => ride,
        Ok(None) => panic!("ride feed ended before {} reached {}", ride_id, status),
        Err(_) => panic!("timed out waiting for {} to reach {}", ride_id, status),
    }
}
