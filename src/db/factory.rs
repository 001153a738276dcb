//! Pool creation and destruction.
//!
//! [`PoolFactory`] composes the tunnel rewrite with the driver's wire spec and pooled
//! source. Every tunnel it opens ends up either owned by the returned [`Pool`] or stopped
//! before the error propagates.

use crate::config::PoolSettings;
use crate::db::pool::{ConnectionSource, Pool};
use crate::driver::{Driver, DriverRegistry, WireSpec};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDetails, Database};
use crate::tunnel::{TunnelManager, TunneledDetails};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds and tears down pools.
#[derive(Debug, Clone)]
pub struct PoolFactory {
    drivers: Arc<DriverRegistry>,
    tunnels: Arc<TunnelManager>,
    settings: PoolSettings,
}

impl PoolFactory {
    pub fn new(
        drivers: Arc<DriverRegistry>,
        tunnels: Arc<TunnelManager>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            drivers,
            tunnels,
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Create the pool for `database`, opening its tunnel first when tunneling is enabled.
    ///
    /// The returned pool is not yet checking idle connections; call
    /// [`start_idle_check`](Self::start_idle_check) once it is shared.
    pub async fn create_pool(&self, database: &Database) -> DbResult<Pool> {
        let driver = self.drivers.get(database.db_type)?;
        let details = database.details.with_default_port(driver.default_port());

        info!(
            database_id = %database.id,
            db_type = %database.db_type,
            tunneled = details.tunnel_enabled(),
            "Creating connection pool"
        );

        let TunneledDetails {
            details: wire_details,
            tunnel,
        } = self.tunnels.rewrite_details_for_tunnel(&details).await?;
        let tunnel_port = tunnel.as_ref().map(|handle| handle.local_port());

        match self
            .open_source(driver.as_ref(), &wire_details, tunnel_port)
            .await
        {
            Ok((spec, source)) => {
                info!(
                    database_id = %database.id,
                    connection = %spec.masked_connection_string(),
                    tunnel_local_port = ?tunnel_port,
                    "Connection pool created"
                );
                Ok(Pool::new(database, spec, source, tunnel))
            }
            Err(e) => {
                warn!(database_id = %database.id, error = %e, "Failed to create connection pool");
                if let Some(handle) = tunnel {
                    self.tunnels.stop_tunnel(handle).await;
                }
                Err(e)
            }
        }
    }

    async fn open_source(
        &self,
        driver: &dyn Driver,
        details: &ConnectionDetails,
        tunnel_port: Option<u16>,
    ) -> DbResult<(WireSpec, Arc<dyn ConnectionSource>)> {
        let spec = driver.build_wire_spec(details)?;
        if let Some(local_port) = tunnel_port {
            if spec.port() != Some(local_port) {
                return Err(DbError::internal(format!(
                    "Connection spec port {:?} does not match tunnel port {}",
                    spec.port(),
                    local_port
                )));
            }
        }

        let source = driver.open_pool(&spec, &self.settings).await?;
        Ok((spec, source))
    }

    /// Test one idle connection of `pool` every idle test period until it is destroyed.
    pub fn start_idle_check(&self, pool: &Arc<Pool>) {
        let period = self.settings.idle_test_period;
        let weak_pool = Arc::downgrade(pool);
        pool.set_idle_check(tokio::spawn(idle_check_task(weak_pool, period)));
    }

    /// Release `pool`'s connections, then stop the tunnel it owns.
    ///
    /// Only the first call for a pool does anything. The tunnel is stopped even when
    /// closing the source fails; that failure is returned afterwards.
    pub async fn destroy_pool(&self, pool: &Pool) -> DbResult<()> {
        if !pool.begin_destroy() {
            debug!(database_id = %pool.database_id(), "Pool already destroyed");
            return Ok(());
        }

        info!(database_id = %pool.database_id(), "Destroying connection pool");
        pool.stop_idle_check();

        let closed = pool.source().close().await;
        if let Err(e) = &closed {
            warn!(
                database_id = %pool.database_id(),
                error = %e,
                "Error closing connection pool"
            );
        }

        if let Some(handle) = pool.take_tunnel() {
            self.tunnels.stop_tunnel(handle).await;
        }
        closed
    }
}

/// Background idle-connection test.
///
/// Holds only a weak reference so a dropped pool ends the task.
async fn idle_check_task(weak_pool: Weak<Pool>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(pool) = weak_pool.upgrade() else {
            debug!("Pool dropped, idle check exiting");
            return;
        };
        if pool.is_destroyed() {
            return;
        }
        if let Err(e) = pool.source().check_idle().await {
            warn!(
                database_id = %pool.database_id(),
                error = %e,
                "Idle connection test failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseId, DatabaseType, keys};

    fn factory() -> PoolFactory {
        PoolFactory::new(
            Arc::new(DriverRegistry::with_builtin_drivers()),
            Arc::new(TunnelManager::default()),
            PoolSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_unregistered_driver_is_config_error() {
        let factory = PoolFactory::new(
            Arc::new(DriverRegistry::new()),
            Arc::new(TunnelManager::default()),
            PoolSettings::default(),
        );
        let database = Database::new(
            DatabaseId::from(1),
            DatabaseType::PostgreSQL,
            ConnectionDetails::new().with(keys::HOST, "localhost"),
        );

        let err = factory.create_pool(&database).await.unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_pool_lifecycle() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let database = Database::new(
            DatabaseId::new("local").unwrap(),
            DatabaseType::SQLite,
            ConnectionDetails::new().with(keys::DBNAME, file.path().to_string_lossy().to_string()),
        );
        let factory = factory();

        let pool = Arc::new(factory.create_pool(&database).await.unwrap());
        factory.start_idle_check(&pool);
        assert!(pool.source().size() >= 1);
        assert!(!pool.has_tunnel());

        factory.destroy_pool(&pool).await.unwrap();
        assert!(pool.is_destroyed());
        assert!(pool.db_pool().is_some_and(|p| p.is_closed()));

        // Second destroy is a no-op
        factory.destroy_pool(&pool).await.unwrap();
    }
}
