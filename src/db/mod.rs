//! Connection pooling layer.
//!
//! This module provides:
//! - Pools and the driver-opened connection sources behind them
//! - The per-database pool registry
//! - Pool creation and destruction, including tunnel ownership
//! - Bounded-time connectivity probes
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod factory;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod registry;

pub use factory::PoolFactory;
pub use manager::ConnectionManager;
pub use pool::{ConnectionSource, DbPool, Pool, PoolSummary};
pub use probe::{ConnectivityProbe, ProbeOptions};
pub use registry::PoolRegistry;
