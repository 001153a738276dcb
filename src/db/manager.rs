//! Entry point for callers: pools on demand, invalidation, probes and shutdown.

use crate::config::Config;
use crate::db::factory::PoolFactory;
use crate::db::pool::{Pool, PoolSummary};
use crate::db::probe::{ConnectivityProbe, ProbeOptions};
use crate::db::registry::PoolRegistry;
use crate::driver::{DriverRegistry, is_sentinel_row};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionDetails, Database, DatabaseId, DatabaseType};
use crate::tunnel::TunnelManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the pool registry and everything needed to fill it.
#[derive(Debug)]
pub struct ConnectionManager {
    registry: Arc<PoolRegistry>,
    factory: PoolFactory,
    probe: ConnectivityProbe,
}

impl ConnectionManager {
    pub fn new(factory: PoolFactory, probe: ConnectivityProbe) -> Self {
        Self {
            registry: Arc::new(PoolRegistry::new()),
            factory,
            probe,
        }
    }

    /// A manager with the built-in drivers, SSH tunnels and the configured timeouts.
    pub fn from_config(config: &Config) -> DbResult<Self> {
        let factory = PoolFactory::new(
            Arc::new(DriverRegistry::with_builtin_drivers()),
            Arc::new(TunnelManager::ssh(config.ssh_connect_timeout())),
            config.pool_settings()?,
        );
        Ok(Self::new(
            factory,
            ConnectivityProbe::new(config.probe_timeout()),
        ))
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn factory(&self) -> &PoolFactory {
        &self.factory
    }

    /// The pool for `database`, created on first use.
    ///
    /// A cached pool built from different details, or whose tunnel has closed, is
    /// replaced. Creation runs as its own task: a caller that stops waiting leaves it to
    /// finish and install the pool.
    pub async fn get_pool(&self, database: &Database) -> DbResult<Arc<Pool>> {
        if let Some(pool) = self.registry.get(&database.id) {
            if Self::is_current(&pool, database) {
                return Ok(pool);
            }
            if let Some(stale) = self.registry.invalidate_if_current(&database.id, &pool) {
                info!(
                    database_id = %database.id,
                    details_changed = stale.details() != &database.details,
                    tunnel_open = stale.is_tunnel_open(),
                    "Recreating stale connection pool"
                );
                self.destroy(stale).await;
            }
        }

        let registry = Arc::clone(&self.registry);
        let factory = self.factory.clone();
        let database = database.clone();
        let task = tokio::spawn(async move {
            registry
                .get_or_create(&database.id, || async {
                    let pool = Arc::new(factory.create_pool(&database).await?);
                    factory.start_idle_check(&pool);
                    Ok::<_, DbError>(pool)
                })
                .await
        });

        task.await
            .map_err(|e| DbError::internal(format!("Pool creation task failed: {}", e)))?
    }

    fn is_current(pool: &Pool, database: &Database) -> bool {
        pool.db_type() == database.db_type
            && pool.details() == &database.details
            && pool.is_tunnel_open()
    }

    /// Drop the cached pool for `id`, if any. Call when the database's details change.
    pub async fn invalidate_database(&self, id: &DatabaseId) {
        match self.registry.invalidate(id) {
            Some(pool) => self.destroy(pool).await,
            None => debug!(database_id = %id, "No pool to invalidate"),
        }
    }

    /// Check that a database is reachable by running its driver's trivial query.
    ///
    /// The check opens (and always closes) a tunnel when the details ask for one. It is
    /// reachable only when the query returns exactly `{"1": 1}`.
    pub async fn probe(
        &self,
        db_type: DatabaseType,
        details: &ConnectionDetails,
        options: &ProbeOptions,
    ) -> DbResult<bool> {
        let driver = match self.factory.drivers().get(db_type) {
            Ok(driver) => driver,
            Err(e) if options.rethrow_errors => return Err(e),
            Err(e) => {
                warn!(db_type = %db_type, error = %e, "Connectivity probe failed");
                return Ok(false);
            }
        };
        let details = details.with_default_port(driver.default_port());
        let tunnels = Arc::clone(self.factory.tunnels());
        let attempt_driver = Arc::clone(&driver);

        let attempt = move |token: CancellationToken| async move {
            tunnels
                .with_tunnel(&details, |details| async move {
                    let spec = attempt_driver.build_wire_spec(&details)?;
                    tokio::select! {
                        row = attempt_driver.run_trivial_query(&spec) => Ok(is_sentinel_row(&row?)),
                        _ = token.cancelled() => {
                            debug!(db_type = %attempt_driver.kind(), "Connectivity attempt cancelled");
                            Ok(false)
                        }
                    }
                })
                .await
        };

        self.probe
            .run(attempt, options, |raw| driver.humanize_error(raw))
            .await
    }

    /// Summaries of every cached pool, sorted by identity.
    pub fn summaries(&self) -> Vec<PoolSummary> {
        self.registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|pool| pool.summary())
            .collect()
    }

    /// Destroy every cached pool.
    pub async fn close_all(&self) {
        for pool in self.registry.drain() {
            info!(database_id = %pool.database_id(), "Closing connection pool");
            self.destroy(pool).await;
        }
        info!("All connection pools closed");
    }

    /// Destroy `pool` in its own task so an abandoned caller cannot interrupt teardown.
    async fn destroy(&self, pool: Arc<Pool>) {
        let factory = self.factory.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = factory.destroy_pool(&pool).await {
                warn!(
                    database_id = %pool.database_id(),
                    error = %e,
                    "Connection pool destroyed with errors"
                );
            }
        });
        if let Err(e) = task.await {
            warn!(error = %e, "Pool destroy task failed");
        }
    }
}
