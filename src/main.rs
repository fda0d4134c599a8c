use std::sync::Arc;
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;
use taxi_dispatch::{
    config::AppConfig,
    handlers::{admin_handler, ride_handler},
    state::AppState,
    DispatchError,
};

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    let config = AppConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("Starting taxi dispatch v{}", env!("CARGO_PKG_VERSION"));

    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(config).await?;

    let app = Router::new()
        .route("/health", get(ride_handler::health))
        .route("/rides", post(ride_handler::create_ride))
        .route("/rides/:id", get(ride_handler::get_ride))
        .route("/rides/:id/events", get(ride_handler::ride_events))
        .route("/rides/:id/accept", post(ride_handler::accept_ride))
        .route("/rides/:id/reject", post(ride_handler::reject_ride))
        .route("/rides/:id/boarding", post(ride_handler::confirm_boarding))
        .route("/rides/:id/start", post(ride_handler::start_ride))
        .route("/rides/:id/arrive", post(ride_handler::arrive))
        .route("/rides/:id/cancel", post(ride_handler::cancel_ride))
        .route("/rides/:id/rate", post(ride_handler::rate_ride))
        .route("/rides/:id/location", post(ride_handler::push_location))
        .route("/passengers/:id/rides", get(ride_handler::passenger_rides))
        .route("/drivers/available", get(ride_handler::available_drivers))
        .route("/drivers/:id/rides", get(ride_handler::driver_rides))
        .route("/drivers/:id/requests/events", get(ride_handler::driver_requests))
        .route("/drivers/:id/earnings", get(ride_handler::driver_earnings))
        .route("/users/:id", put(ride_handler::upsert_user))
        .route("/admin/rides/active", get(admin_handler::active_rides))
        .route("/admin/statistics", get(admin_handler::statistics))
        .route("/admin/rides/:id/cancel", post(admin_handler::force_cancel))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(app_state));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| DispatchError::InvalidConfiguration(format!("cannot bind {}: {}", bind_addr, e)))?;
    tracing::info!("Listening on {}", bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| DispatchError::internal_error(e.to_string()))
}
