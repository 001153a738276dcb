//! Database drivers.
//!
//! A [`Driver`] knows how to turn [`ConnectionDetails`] into a wire-level connection spec,
//! open a pooled [`ConnectionSource`] for it, and run the trivial query used by
//! connectivity probes. Drivers are looked up by [`DatabaseType`] in a [`DriverRegistry`].

pub mod builtin;

pub use builtin::SqlxDriver;

use crate::config::PoolSettings;
use crate::db::pool::ConnectionSource;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDetails, DatabaseType};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A result row keyed by column name.
pub type JsonRow = Map<String, Value>;

/// The single row a healthy trivial query returns: `{"1": 1}`.
pub fn sentinel_row() -> JsonRow {
    let mut row = Map::new();
    row.insert("1".to_string(), Value::from(1));
    row
}

/// Whether `row` is exactly the sentinel row.
pub fn is_sentinel_row(row: &JsonRow) -> bool {
    row.len() == 1 && row.get("1").and_then(Value::as_i64) == Some(1)
}

/// Everything a driver needs to open a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct WireSpec {
    db_type: DatabaseType,
    connection_string: String,
    host: Option<String>,
    port: Option<u16>,
}

impl WireSpec {
    pub fn new(
        db_type: DatabaseType,
        connection_string: impl Into<String>,
        host: Option<String>,
        port: Option<u16>,
    ) -> Self {
        Self {
            db_type,
            connection_string: connection_string.into(),
            host,
            port,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// The full connection string, credentials included.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Port the connection string points at.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Get the connection string with the password masked for logging.
    pub fn masked_connection_string(&self) -> String {
        match url::Url::parse(&self.connection_string) {
            Ok(mut url) if url.password().is_some() => {
                // set_password only fails for cannot-be-a-base URLs, which carry no password
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.connection_string.clone(),
        }
    }
}

impl std::fmt::Debug for WireSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireSpec")
            .field("db_type", &self.db_type)
            .field("connection_string", &self.masked_connection_string())
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Driver for one database type.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// The database type this driver serves.
    fn kind(&self) -> DatabaseType;

    /// Port assumed when details omit one. `None` for file-based databases.
    fn default_port(&self) -> Option<u16> {
        self.kind().default_port()
    }

    /// Build the wire-level spec for `details`. Pure; never touches the network.
    fn build_wire_spec(&self, details: &ConnectionDetails) -> DbResult<WireSpec>;

    /// Turn a raw driver error message into user-facing text.
    fn humanize_error(&self, raw_message: &str) -> String {
        raw_message.to_string()
    }

    /// Open a pooled connection source for `spec`.
    async fn open_pool(
        &self,
        spec: &WireSpec,
        settings: &PoolSettings,
    ) -> DbResult<Arc<dyn ConnectionSource>>;

    /// Open a single connection, run the trivial query and return its one row.
    async fn run_trivial_query(&self, spec: &WireSpec) -> DbResult<JsonRow>;
}

/// Drivers keyed by database type.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DatabaseType, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the sqlx-backed PostgreSQL, MySQL and SQLite drivers.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        for db_type in [
            DatabaseType::PostgreSQL,
            DatabaseType::MySQL,
            DatabaseType::SQLite,
        ] {
            registry.register(Arc::new(SqlxDriver::new(db_type)));
        }
        registry
    }

    /// Register `driver` for its kind, returning the driver it replaced.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Option<Arc<dyn Driver>> {
        self.drivers.insert(driver.kind(), driver)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, db_type: DatabaseType) -> DbResult<Arc<dyn Driver>> {
        self.drivers
            .get(&db_type)
            .cloned()
            .ok_or_else(|| DbError::config(format!("No driver registered for {}", db_type)))
    }

    pub fn kinds(&self) -> Vec<DatabaseType> {
        self.drivers.keys().copied().collect()
    }
}
