// src/services/admin_service.rs
use async_trait::async_trait;
use tracing;

use crate::{
    errors::DispatchResult,
    models::{Actor, DriverEarnings, RideAnalytics, RideFilter, RideRequest, RideStatus},
    services::{
        dispatch_service::{DispatchOperations, DispatchService},
        ride_store::RideStore,
    },
};

#[async_trait]
pub trait AdminOperations: Send + Sync {
    async fn active_rides(&self) -> DispatchResult<Vec<RideRequest>>;
    async fn statistics(&self) -> DispatchResult<RideAnalytics>;
    async fn driver_earnings(&self, driver_id: &str) -> DispatchResult<DriverEarnings>;
    async fn history(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>>;
    async fn force_cancel(&self, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest>;
}

/// Read-only projections over the store, plus the operator's cancel.
#[derive(Clone)]
pub struct AdminService {
    store: RideStore,
    engine: DispatchService,
}

impl AdminService {
    pub fn new(store: RideStore, engine: DispatchService) -> Self {
        Self { store, engine }
    }
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn ratings(rides: &[RideRequest]) -> impl Iterator<Item = f64> + '_ {
    rides.iter().filter_map(|r| r.rating).map(f64::from)
}

/// Aggregate figures over a set of rides. Earnings only count completed
/// rides.
pub fn summarize(rides: &[RideRequest]) -> RideAnalytics {
    let count = |status: RideStatus| rides.iter().filter(|r| r.status == status).count() as u32;

    let completed: Vec<&RideRequest> = rides
        .iter()
        .filter(|r| r.status == RideStatus::Completed)
        .collect();
    let total_earnings: f64 = completed.iter().filter_map(|r| r.fare).sum();

    let total_rides = rides.len() as u32;
    let completed_rides = completed.len() as u32;
    let cancelled_rides = count(RideStatus::Cancelled);

    RideAnalytics {
        total_rides,
        active_rides: rides.iter().filter(|r| !r.status.is_terminal()).count() as u32,
        completed_rides,
        cancelled_rides,
        rejected_rides: count(RideStatus::Rejected),
        total_earnings,
        average_fare: if completed_rides > 0 {
            total_earnings / completed_rides as f64
        } else {
            0.0
        },
        average_rating: average(ratings(rides)),
        cancellation_rate: if total_rides > 0 {
            cancelled_rides as f64 / total_rides as f64
        } else {
            0.0
        },
    }
}

#[async_trait]
impl AdminOperations for AdminService {
    async fn active_rides(&self) -> DispatchResult<Vec<RideRequest>> {
        self.store.list(&RideFilter::active()).await
    }

    async fn statistics(&self) -> DispatchResult<RideAnalytics> {
        let rides = self.store.list(&RideFilter::all()).await?;
        let stats = summarize(&rides);
        tracing::debug!(
            "Statistics over {} rides: {} completed, earnings {}",
            stats.total_rides,
            stats.completed_rides,
            stats.total_earnings
        );
        Ok(stats)
    }

    async fn driver_earnings(&self, driver_id: &str) -> DispatchResult<DriverEarnings> {
        let completed = self
            .store
            .list(&RideFilter::for_driver(driver_id).with_statuses(vec![RideStatus::Completed]))
            .await?;

        Ok(DriverEarnings {
            driver_id: driver_id.to_string(),
            completed_rides: completed.len() as u32,
            total_earnings: completed.iter().filter_map(|r| r.fare).sum(),
            average_rating: average(ratings(&completed)),
        })
    }

    async fn history(&self, filter: &RideFilter) -> DispatchResult<Vec<RideRequest>> {
        self.store.list(filter).await
    }

    async fn force_cancel(&self, ride_id: &str, reason: Option<String>) -> DispatchResult<RideRequest> {
        tracing::warn!("Operator cancelling ride {}", ride_id);
        self.engine.cancel_ride(&Actor::System, ride_id, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorRole, AcceptRequest, RatingRequest};
    use crate::test_support::{fast_settings, harness, ride_init, wait_for_status};
    use std::time::Duration;

    #[tokio::test]
    async fn test_statistics_and_earnings() {
        let mut settings = fast_settings(false);
        settings.completion_grace = Duration::from_millis(5);
        let h = harness(settings);
        let admin = AdminService::new(h.store.clone(), h.engine.clone());

        let empty = admin.statistics().await.unwrap();
        assert_eq!(empty.total_rides, 0);
        assert_eq!(empty.average_rating, None);
        assert_eq!(empty.cancellation_rate, 0.0);

        // One completed and rated ride for d1
        let passenger = Actor::passenger("p1");
        let driver = Actor::driver("d1");
        let ride = h.engine.create_ride(&passenger, ride_init("p1", "d1")).await.unwrap();
        h.engine.accept_ride(&driver, &ride.id, AcceptRequest::default()).await.unwrap();
        h.engine.confirm_boarding(&passenger, &ride.id).await.unwrap();
        let started = h.engine.start_ride(&driver, &ride.id).await.unwrap();
        h.engine.arrive(&driver, &ride.id).await.unwrap();
        wait_for_status(&h.store, &ride.id, RideStatus::Completed).await;
        h.engine
            .rate_ride(&passenger, &ride.id, RatingRequest { rating: 4, comment: None })
            .await
            .unwrap();

        // One active ride for p2 and d2
        let active = h
            .engine
            .create_ride(&Actor::passenger("p2"), ride_init("p2", "d2"))
            .await
            .unwrap();

        let stats = admin.statistics().await.unwrap();
        let fare = started.fare.unwrap();
        assert_eq!(stats.total_rides, 2);
        assert_eq!(stats.active_rides, 1);
        assert_eq!(stats.completed_rides, 1);
        assert_eq!(stats.total_earnings, fare);
        assert_eq!(stats.average_fare, fare);
        assert_eq!(stats.average_rating, Some(4.0));

        let earnings = admin.driver_earnings("d1").await.unwrap();
        assert_eq!(earnings.completed_rides, 1);
        assert_eq!(earnings.total_earnings, fare);
        assert_eq!(earnings.average_rating, Some(4.0));
        assert_eq!(admin.driver_earnings("d2").await.unwrap().completed_rides, 0);

        let listed: Vec<String> = admin.active_rides().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![active.id.clone()]);

        let cancelled = admin.force_cancel(&active.id, None).await.unwrap();
        assert_eq!(cancelled.cancelled_by, Some(ActorRole::System));
        assert!(admin.active_rides().await.unwrap().is_empty());

        let stats = admin.statistics().await.unwrap();
        assert_eq!(stats.cancelled_rides, 1);
        assert_eq!(stats.cancellation_rate, 0.5);

        let history = admin.history(&RideFilter::for_passenger("p1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RideStatus::Completed);
    }
}
