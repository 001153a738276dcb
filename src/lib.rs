//! Database connectivity library.
//!
//! Caches one connection pool per database, opens SSH tunnels for databases that are not
//! directly reachable, and checks reachability under a deadline (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod models;
pub mod tunnel;

pub use config::Config;
pub use db::{ConnectionManager, ProbeOptions};
pub use error::{DbError, DbResult};
