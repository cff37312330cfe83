use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Manages database connections across the application.
///
/// The hub embeds its transactional store in a single SQLite file opened in
/// WAL mode so callback handlers and background sweeps can read while a
/// writer transaction is open.
pub struct ConnectionManager {
    /// Main application database pool
    main_pool: Pool<Sqlite>,
}

impl ConnectionManager {
    /// Creates a new connection manager for the given database URL or path.
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        info!("Opening database at {}", database_url);

        let options = Self::connect_options(database_url)?;

        let main_pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        info!("✓ Database connection established");

        Ok(Self { main_pool })
    }

    /// Builds the connection options used for every pool connection.
    ///
    /// Foreign keys are enforced at the connection level because the schema
    /// relies on `ON DELETE CASCADE` from backup disks to restore mounts.
    fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        Ok(options)
    }

    /// Gets the main database pool
    pub fn main_pool(&self) -> &Pool<Sqlite> {
        &self.main_pool
    }
}
