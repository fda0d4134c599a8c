// src/models/mod.rs
pub mod command;
pub mod document;
pub mod ride;
pub mod user;

pub use command::*;
pub use document::decode_ride;
pub use ride::*;
pub use user::*;
