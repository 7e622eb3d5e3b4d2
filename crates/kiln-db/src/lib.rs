//! Database layer for the Kiln queue runner.
//!
//! Thin sqlx/PostgreSQL wrapper around the `builds`, `build_steps`,
//! `jobsets`, `failed_paths` and `system_status` tables. The schema itself
//! is owned and migrated by the surrounding system; this crate assumes it.

pub mod error;
pub mod listener;
pub mod models;
pub mod queries;

pub use error::{DbError, DbResult};
pub use listener::{QueueChange, QueueListener};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}
