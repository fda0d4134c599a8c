// src/utils/mod.rs
pub mod id_generator;
pub mod polyline;

pub use id_generator::{generate_ride_id, IdGenerator, IdType};
