//! SQLite-backed [`Store`] and [`JobStore`] for `datahub-core` (spec
//! §4.1, §4.2, §6). Built on `sqlx::SqlitePool`, the same pooling
//! primitive the teacher's Postgres-backed crate uses, swapped to the
//! `sqlite` feature so the whole subsystem embeds in a single file with
//! no external service.

mod schema;
mod store;

pub use store::SqliteStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;

use datahub_core::{DataHubError, Result};

/// Opens (creating if absent) a SQLite database at `path`, applying the
/// pragmas spec §4.1 calls for (WAL, NORMAL synchronous, foreign keys,
/// a busy timeout) and running schema migrations.
pub async fn open(path: &str, pool_size: usize, lease_timeout: Duration) -> Result<SqliteStore> {
    let mut options = SqliteConnectOptions::from_str(path)
        .map_err(|e| DataHubError::persistence(format!("invalid sqlite path {path}: {e}")))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(lease_timeout);
    options = options.disable_statement_logging();

    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size.max(1) as u32)
        .acquire_timeout(lease_timeout)
        .connect_with(options)
        .await
        .map_err(|e| DataHubError::persistence(format!("opening sqlite pool: {e}")))?;

    schema::migrate(&pool).await?;

    Ok(SqliteStore::new(pool, pool_size))
}
