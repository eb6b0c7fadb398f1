//! SQLite connection pool management.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Type alias for the database pool.
pub type Pool = SqlitePool;

/// Create a new connection pool for `database_url`.
///
/// In-memory databases live and die with their connection, so they get a
/// single connection that is never recycled.
pub async fn create_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };

    pool_options.connect_with(options).await
}
