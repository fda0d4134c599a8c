pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use errors::{DispatchError, DispatchResult, ValidationError};
