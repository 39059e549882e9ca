//! SQLite pool construction shared by the upload and task stores.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Open a pool for `url`.
///
/// In-memory databases live only as long as their connection, so they get a
/// single connection that is never recycled.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    };

    pool_options.connect_with(options).await
}

/// Pool backed by a private in-memory database (for testing).
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    connect("sqlite::memory:").await
}
