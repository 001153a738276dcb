//! Pools and the connection sources behind them.
//!
//! A [`Pool`] is what the registry hands out for a database: the connection source opened
//! by the database's driver, the details and wire spec it was built from, and the SSH
//! tunnel it owns when the database is tunneled.

use crate::driver::WireSpec;
use crate::error::DbResult;
use crate::models::{ConnectionDetails, Database, DatabaseId, DatabaseType};
use crate::tunnel::TunnelHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, MySqlPool, PgPool, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// A pooled source of connections opened by a driver.
#[async_trait]
pub trait ConnectionSource: Send + Sync + std::fmt::Debug {
    /// Test one idle connection, if any are idle.
    async fn check_idle(&self) -> DbResult<()>;

    /// Release every pooled connection.
    async fn close(&self) -> DbResult<()>;

    /// Open connections, idle or in use.
    fn size(&self) -> u32 {
        0
    }

    /// Idle connections.
    fn num_idle(&self) -> usize {
        0
    }

    /// The sqlx pool behind this source, for sources that have one.
    fn as_db_pool(&self) -> Option<&DbPool> {
        None
    }
}

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        for_each_db_pool!(self, pool => pool.close().await)
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        impl_db_dispatch!(self, {
            MySql(_pool) => DatabaseType::MySQL,
            Postgres(_pool) => DatabaseType::PostgreSQL,
            SQLite(_pool) => DatabaseType::SQLite,
        })
    }

    pub fn size(&self) -> u32 {
        for_each_db_pool!(self, pool => pool.size())
    }

    pub fn num_idle(&self) -> usize {
        for_each_db_pool!(self, pool => pool.num_idle())
    }

    pub fn is_closed(&self) -> bool {
        for_each_db_pool!(self, pool => pool.is_closed())
    }

    /// Hold `count` connections at once so the pool starts with that many open.
    pub async fn warm_up(&self, count: u32) -> DbResult<()> {
        for_each_db_pool!(self, pool => warm_up(pool, count).await)
    }

    /// Acquire one connection and ping it.
    pub async fn ping(&self) -> DbResult<()> {
        for_each_db_pool!(self, pool => ping(pool).await)
    }
}

async fn warm_up<DB: sqlx::Database>(pool: &sqlx::Pool<DB>, count: u32) -> DbResult<()> {
    let mut held = Vec::with_capacity(count as usize);
    for _ in 0..count {
        held.push(pool.acquire().await?);
    }
    Ok(())
}

async fn ping<DB: sqlx::Database>(pool: &sqlx::Pool<DB>) -> DbResult<()> {
    let mut conn = pool.acquire().await?;
    conn.ping().await?;
    Ok(())
}

#[async_trait]
impl ConnectionSource for DbPool {
    async fn check_idle(&self) -> DbResult<()> {
        if self.num_idle() == 0 {
            return Ok(());
        }
        self.ping().await
    }

    async fn close(&self) -> DbResult<()> {
        DbPool::close(self).await;
        Ok(())
    }

    fn size(&self) -> u32 {
        DbPool::size(self)
    }

    fn num_idle(&self) -> usize {
        DbPool::num_idle(self)
    }

    fn as_db_pool(&self) -> Option<&DbPool> {
        Some(self)
    }
}

/// Pool information for display (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub database_id: DatabaseId,
    pub db_type: DatabaseType,
    /// Connection string with the password masked.
    pub connection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_local_port: Option<u16>,
    pub size: u32,
    pub idle: usize,
    pub created_at: DateTime<Utc>,
}

/// The connection pool for one database.
#[derive(Debug)]
pub struct Pool {
    database_id: DatabaseId,
    db_type: DatabaseType,
    details: ConnectionDetails,
    spec: WireSpec,
    source: Arc<dyn ConnectionSource>,
    tunnel: Mutex<Option<TunnelHandle>>,
    tunnel_port: Option<u16>,
    idle_check: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Pool {
    /// A pool for `database` over `source`. `details` stay as configured, before any
    /// tunnel rewrite; `spec` is what the source was opened with.
    pub fn new(
        database: &Database,
        spec: WireSpec,
        source: Arc<dyn ConnectionSource>,
        tunnel: Option<TunnelHandle>,
    ) -> Self {
        let tunnel_port = tunnel.as_ref().map(TunnelHandle::local_port);
        Self {
            database_id: database.id.clone(),
            db_type: database.db_type,
            details: database.details.clone(),
            spec,
            source,
            tunnel: Mutex::new(tunnel),
            tunnel_port,
            idle_check: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Details the pool was created from, as stored for the database.
    pub fn details(&self) -> &ConnectionDetails {
        &self.details
    }

    pub fn spec(&self) -> &WireSpec {
        &self.spec
    }

    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    /// The sqlx pool, when the source is one.
    pub fn db_pool(&self) -> Option<&DbPool> {
        self.source.as_db_pool()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Local port of the owned tunnel.
    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel_port
    }

    pub fn has_tunnel(&self) -> bool {
        self.tunnel_port.is_some()
    }

    /// False once an owned tunnel has closed or been taken. Untunneled pools are always open.
    pub fn is_tunnel_open(&self) -> bool {
        if !self.has_tunnel() {
            return true;
        }
        self.tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(TunnelHandle::is_open)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Claim the right to destroy this pool. Only the first caller gets `true`.
    pub(crate) fn begin_destroy(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take_tunnel(&self) -> Option<TunnelHandle> {
        self.tunnel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn set_idle_check(&self, handle: JoinHandle<()>) {
        let previous = self
            .idle_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn stop_idle_check(&self) {
        if let Some(handle) = self
            .idle_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            database_id: self.database_id.clone(),
            db_type: self.db_type,
            connection: self.spec.masked_connection_string(),
            tunnel_local_port: self.tunnel_port,
            size: self.source.size(),
            idle: self.source.num_idle(),
            created_at: self.created_at,
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop_idle_check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::keys;

    fn sqlite_pool() -> Pool {
        let database = Database::new(
            DatabaseId::new("local").unwrap(),
            DatabaseType::SQLite,
            ConnectionDetails::new().with(keys::DBNAME, ":memory:"),
        );
        let spec = WireSpec::new(DatabaseType::SQLite, "sqlite::memory:", None, None);
        let source = DbPool::SQLite(SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        Pool::new(&database, spec, Arc::new(source), None)
    }

    #[tokio::test]
    async fn test_untunneled_pool_reports_open() {
        let pool = sqlite_pool();
        assert!(!pool.has_tunnel());
        assert!(pool.is_tunnel_open());
        assert!(pool.take_tunnel().is_none());
        assert_eq!(pool.db_pool().map(DbPool::db_type), Some(DatabaseType::SQLite));
    }

    #[tokio::test]
    async fn test_begin_destroy_only_once() {
        let pool = sqlite_pool();
        assert!(!pool.is_destroyed());
        assert!(pool.begin_destroy());
        assert!(!pool.begin_destroy());
        assert!(pool.is_destroyed());
    }

    #[tokio::test]
    async fn test_db_pool_check_idle_and_close() {
        let pool = sqlite_pool();
        let source = pool.source();
        source.check_idle().await.unwrap();
        source.close().await.unwrap();
        assert!(pool.db_pool().is_some_and(DbPool::is_closed));
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let pool = sqlite_pool();
        let summary = serde_json::to_value(pool.summary()).unwrap();
        assert_eq!(summary["database_id"], "local");
        assert_eq!(summary["db_type"], "sqlite");
        assert!(summary.get("tunnel_local_port").is_none());
    }
}
