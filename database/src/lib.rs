use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Default lower and upper bounds of the connection pool.
pub const DEFAULT_MIN_CON: u32 = 1;
pub const DEFAULT_MAX_CON: u32 = 16;

/// Connect to the geospatial store and pre-warm the pool.
///
/// The first connection is established eagerly so that a server with an
/// unreachable database fails at startup rather than on the first request.
/// Waiting for a free connection is bounded by `acquire_timeout`; callers
/// translate an exhausted wait into their own timeout error.
pub async fn connect_to_database(
    url: &str,
    min_con: u32,
    max_con: u32,
    acquire_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(min_con)
        .max_connections(max_con)
        .connect_timeout(acquire_timeout)
        .connect(url)
        .await
}

/// A pool that defers connecting until first use.
///
/// Serving code never calls this; it exists for tests that exercise request
/// handling paths which reject input before touching the store.
pub fn connect_lazy(url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect_lazy(url)
}
