//! Data models for database connectivity.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod details;

// Re-export commonly used types
pub use connection::{Database, DatabaseId, DatabaseType};
pub use details::{ConnectionDetails, TunnelConfig, keys};
