// src/state.rs
use std::sync::Arc;

use crate::{
    config::AppConfig,
    errors::DispatchResult,
    services::{
        admin_service::AdminService,
        dispatch_service::DispatchService,
        geocoding_service::{GoogleReverseGeocoder, NoopGeocoder, ReverseGeocoder},
        ride_store::{open_redis, RedisKeys, RedisRideStore, RideStore},
        routing_service::{GoogleDirectionsProvider, RoutingProvider, StraightLineProvider, TripEstimator},
        user_service::{MemoryUserDirectory, RedisUserDirectory, UserDirectory},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub dispatch_service: DispatchService,
    pub admin_service: AdminService,
    pub user_directory: Arc<dyn UserDirectory>,
    pub config: AppConfig,
}

impl AppState {
    pub async fn new(config: AppConfig) -> DispatchResult<Self> {
        let (store, user_directory): (RideStore, Arc<dyn UserDirectory>) = match &config.redis_url {
            Some(redis_url) => {
                let (client, connection) = open_redis(redis_url).await?;
                let keys = RedisKeys::new(config.redis_prefix.clone());
                let users = RedisUserDirectory::new(connection.clone(), config.redis_prefix.clone());
                tracing::info!("Using Redis ride store at {}", redis_url);
                (
                    RideStore::new(Arc::new(RedisRideStore::new(client, connection, keys))),
                    Arc::new(users),
                )
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory ride store");
                (RideStore::in_memory(), Arc::new(MemoryUserDirectory::new()))
            }
        };

        let (routing, geocoder): (Arc<dyn RoutingProvider>, Arc<dyn ReverseGeocoder>) =
            match &config.google_maps_api_key {
                Some(api_key) => (
                    Arc::new(GoogleDirectionsProvider::new(
                        api_key.clone(),
                        config.directions_url.clone(),
                        config.provider_timeout,
                    )?),
                    Arc::new(GoogleReverseGeocoder::new(
                        api_key.clone(),
                        config.geocoding_url.clone(),
                        config.provider_timeout,
                    )?),
                ),
                None => {
                    tracing::warn!("GOOGLE_MAPS_API_KEY not set, using straight-line routing");
                    (Arc::new(StraightLineProvider::default()), Arc::new(NoopGeocoder))
                }
            };

        let estimator = TripEstimator::new(routing, config.estimator_settings());
        tracing::info!("Routing through the {} provider", estimator.provider_name());
        let dispatch_service = DispatchService::new(
            store.clone(),
            estimator,
            user_directory.clone(),
            geocoder,
            config.dispatch_settings(),
        );
        let admin_service = AdminService::new(store, dispatch_service.clone());

        dispatch_service.recover().await?;

        Ok(Self {
            dispatch_service,
            admin_service,
            user_directory,
            config,
        })
    }
}
