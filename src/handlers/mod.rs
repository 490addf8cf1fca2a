//! REST API handlers.

pub mod config;
pub mod sessions;
pub mod streams;
