//! Database dispatch macros for reducing code duplication.
//!
//! `DbPool` wraps one sqlx pool type per backend; these macros expand into the
//! per-variant match so each operation is written once.

/// Macro for generating database dispatch match arms.
///
/// This macro generates match arms for `DbPool` variants, reducing the need
/// to manually write repetitive match statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.size(),
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Dispatch the same expression to every `DbPool` variant.
///
/// ```ignore
/// for_each_db_pool!(pool, p => p.close().await)
/// ```
#[macro_export]
macro_rules! for_each_db_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        $crate::impl_db_dispatch!($pool, {
            MySql($p) => $body,
            Postgres($p) => $body,
            SQLite($p) => $body,
        })
    };
}

pub use for_each_db_pool;
pub use impl_db_dispatch;
