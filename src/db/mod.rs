//! Database layer for local SQLite storage.
//!
//! This module handles:
//! - Connection pool management with WAL mode
//! - The embedded schema migration

pub mod pool;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the single embedded migration.
const INITIAL_MIGRATION: &str = "0001_initial_schema";

/// Database-related errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Get the path to the SQLite database file inside a data directory.
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sprint-reports.db")
}

/// Initialize the database: create the file if needed and run migrations.
///
/// # Arguments
/// * `db_path` - Path to the SQLite database file
///
/// # Returns
/// A connection pool configured with WAL mode
pub async fn initialize(db_path: &Path) -> Result<pool::DbPool, DbError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DbError::Migration(format!("Failed to create database directory: {}", e))
        })?;
    }

    let pool = pool::create_pool(db_path).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run all pending database migrations.
async fn run_migrations(pool: &pool::DbPool) -> Result<(), DbError> {
    let mut conn = pool.acquire().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    let applied: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
        .bind(INITIAL_MIGRATION)
        .fetch_optional(&mut *conn)
        .await?;

    if applied.is_none() {
        log::info!("Applying migration {}", INITIAL_MIGRATION);

        // raw_sql runs every statement of the script in order
        sqlx::raw_sql(include_str!("migrations/0001_initial_schema.sql"))
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::Migration(format!("{}: {}", INITIAL_MIGRATION, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(INITIAL_MIGRATION)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
