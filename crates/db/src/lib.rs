pub mod models;

use std::{path::Path, time::Duration};

use futures_util::future::BoxFuture;
use sqlx::{
    SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbInitError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct DbService {
    pub pool: SqlitePool,
}

impl DbService {
    /// Open (or create) the SQLite database at `path` and run migrations.
    pub async fn new(path: &Path) -> Result<Self, DbInitError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Run `work` inside one transaction: commit on Ok, roll back on Err.
    /// Nested `begin` calls on the connection become savepoints, so model
    /// helpers that open their own scopes compose.
    pub async fn with_transaction<R, E>(
        &self,
        work: impl for<'t> FnOnce(&'t mut SqliteConnection) -> BoxFuture<'t, Result<R, E>>,
    ) -> Result<R, E>
    where
        E: From<sqlx::Error>,
    {
        let mut tx = self.pool.begin().await?;
        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                // explicit for clarity; dropping the transaction would also
                // roll back
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED show up when two writers collide; callers may
/// retry these, unlike constraint or corruption errors.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// True when the error is a UNIQUE-constraint violation, used to map
/// concurrent duplicate inserts to a conflict instead of a 500.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}
