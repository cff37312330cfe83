use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;
use sqlx::{Pool, Sqlite};

/// Central manager for all database operations
pub struct DatabaseManager {
    /// Connection manager for database pools
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    /// Creates a new database manager
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        // Create connection manager
        let connection_manager = ConnectionManager::new(database_url).await?;

        // Create the manager
        let manager = Self { connection_manager };

        // Initialize the main database schema
        manager.initialize_main_schema().await?;

        Ok(manager)
    }

    /// Initializes the main database schema
    pub async fn initialize_main_schema(&self) -> Result<(), DatabaseError> {
        MigrationManager::initialize_main_schema(self.get_main_pool()).await
    }

    /// Gets the main database pool
    pub fn get_main_pool(&self) -> &Pool<Sqlite> {
        self.connection_manager.main_pool()
    }
}

#[cfg(test)]
pub async fn test_pool() -> Pool<Sqlite> {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("enable foreign keys");
    MigrationManager::initialize_main_schema(&pool)
        .await
        .expect("schema init");
    pool
}
