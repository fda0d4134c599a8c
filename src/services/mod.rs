pub mod admin_service;
pub mod dispatch_service;
pub mod geocoding_service;
pub mod ride_store;
pub mod routing_service;
pub mod user_service;
