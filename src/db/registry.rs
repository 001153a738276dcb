//! Per-database pool cache.
//!
//! # Concurrency Safety
//!
//! - Reads take a short `std::sync::RwLock` read and never wait for pool creation
//! - Creation is serialized across all databases by one async mutex, with the map
//!   re-checked under it (double-checked), so each miss invokes the factory at most once
//! - The map lock is never held across an await
//! - Removal hands the previous pool back to the caller; destruction happens outside
//!   every lock so one slow teardown never blocks other databases
//! - Identity, not value, decides whether a pool is still the installed one (`Arc::ptr_eq`)

use crate::db::pool::Pool;
use crate::error::DbResult;
use crate::models::DatabaseId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

/// Maps database identity to its live pool.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<DatabaseId, Arc<Pool>>>,
    creation_lock: TokioMutex<()>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The installed pool for `id`, if any.
    pub fn get(&self, id: &DatabaseId) -> Option<Arc<Pool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Return the installed pool for `id`, creating it with `factory` on a miss.
    ///
    /// Concurrent callers for the same identity all observe the same pool and the factory
    /// runs once. A factory error propagates and leaves the slot empty.
    pub async fn get_or_create<F, Fut, P>(&self, id: &DatabaseId, factory: F) -> DbResult<Arc<Pool>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<P>>,
        P: Into<Arc<Pool>>,
    {
        if let Some(pool) = self.get(id) {
            return Ok(pool);
        }

        let _creation = self.creation_lock.lock().await;

        // Re-check after acquiring the creation lock
        if let Some(pool) = self.get(id) {
            debug!(database_id = %id, "Pool created by a concurrent caller");
            return Ok(pool);
        }

        let pool: Arc<Pool> = factory().await?.into();
        self.write().insert(id.clone(), Arc::clone(&pool));
        debug!(database_id = %id, "Pool installed");
        Ok(pool)
    }

    /// Remove and return the installed pool. The caller destroys it.
    pub fn invalidate(&self, id: &DatabaseId) -> Option<Arc<Pool>> {
        let previous = self.write().remove(id);
        if previous.is_some() {
            debug!(database_id = %id, "Pool invalidated");
        }
        previous
    }

    /// Remove the installed pool only if it is `expected` itself.
    ///
    /// Returns the removed pool, or `None` when the slot is empty or already holds a
    /// different pool.
    pub fn invalidate_if_current(&self, id: &DatabaseId, expected: &Arc<Pool>) -> Option<Arc<Pool>> {
        let mut pools = self.write();
        match pools.get(id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                debug!(database_id = %id, "Stale pool invalidated");
                pools.remove(id)
            }
            _ => None,
        }
    }

    /// Install `pool` for `id` and return the pool it replaced. The caller destroys it.
    pub async fn replace(&self, id: &DatabaseId, pool: Arc<Pool>) -> Option<Arc<Pool>> {
        let _creation = self.creation_lock.lock().await;
        self.write().insert(id.clone(), pool)
    }

    /// Remove and return every installed pool.
    pub fn drain(&self) -> Vec<Arc<Pool>> {
        self.write().drain().map(|(_, pool)| pool).collect()
    }

    pub fn len(&self) -> usize {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installed identities, sorted.
    pub fn ids(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<DatabaseId> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<DatabaseId, Arc<Pool>>> {
        self.pools.write().unwrap_or_else(PoisonError::into_inner)
    }
}
