//! Database module for Article Dashboard
//!
//! Provides SQLite storage for settings and the offline mutation queue.
//! The queue lives in the same store as the rest of the local state so that
//! pending writes survive a restart.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a file-backed database pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::initialize(&conn)?;
        drop(conn);

        log::info!("Database opened at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
            path: Some(db_path),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` would see its own empty database,
    /// so the pool is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::initialize(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
            path: None,
        })
    }

    /// Location of the database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn initialize(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    /// Remove a setting, returns whether it existed
    pub fn delete_setting(&self, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // HELPER METHODS (for queue module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Run `f` inside a transaction, committing only if it succeeds
    pub fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let value = f(&tx)?;
        tx.commit()?;

        Ok(value)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }
}
