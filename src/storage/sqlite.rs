//! SQLite-backed store over an r2d2 connection pool.

use std::fmt;
use std::path::Path;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::{not_found, schema, validate_key, ArtifactStore};
use crate::error::{PipelineError, Result};

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.pool.state();
        f.debug_struct("SqliteStore")
            .field("connections", &state.connections)
            .field("idle", &state.idle_connections)
            .finish()
    }
}

/// Open (or create) the database and return a migrated connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    let key = path.display().to_string();
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).map_err(|e| PipelineError::artifact_io(&key, e))?;

    // Run migrations on a single connection
    let conn = pool.get().map_err(|e| PipelineError::artifact_io(&key, e))?;
    schema::migrate(&conn).map_err(|e| PipelineError::artifact_io(&key, e))?;

    Ok(pool)
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            pool: open_pool(path.as_ref())?,
        })
    }

    pub fn from_pool(pool: Pool) -> Result<Self> {
        let conn = pool
            .get()
            .map_err(|e| PipelineError::artifact_io("<pool>", e))?;
        schema::migrate(&conn).map_err(|e| PipelineError::artifact_io("<pool>", e))?;
        drop(conn);
        Ok(Self { pool })
    }

    fn conn(&self, key: &str) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| PipelineError::artifact_io(key, e))
    }
}

impl ArtifactStore for SqliteStore {
    fn put(&self, key: &str, blob: &[u8]) -> Result<()> {
        validate_key(key)?;
        let conn = self.conn(key)?;
        conn.execute(
            "INSERT INTO artifacts (key, blob) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET blob = excluded.blob, updated_at = datetime('now')",
            params![key, blob],
        )
        .map_err(|e| PipelineError::artifact_io(key, e))?;
        debug!(key, bytes = blob.len(), "artifact written");
        Ok(())
    }

    fn put_if_absent(&self, key: &str, blob: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let conn = self.conn(key)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO artifacts (key, blob) VALUES (?1, ?2)",
                params![key, blob],
            )
            .map_err(|e| PipelineError::artifact_io(key, e))?;
        Ok(inserted == 1)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let conn = self.conn(key)?;
        conn.query_row(
            "SELECT blob FROM artifacts WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| PipelineError::artifact_io(key, e))?
        .ok_or_else(|| not_found(key))
    }

    fn contains(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let conn = self.conn(key)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM artifacts WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PipelineError::artifact_io(key, e))?;
        Ok(found.is_some())
    }

    fn list_versions(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn(prefix)?;
        let mut stmt = conn
            .prepare("SELECT key FROM artifacts WHERE key >= ?1 ORDER BY key")
            .map_err(|e| PipelineError::artifact_io(prefix, e))?;
        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(|e| PipelineError::artifact_io(prefix, e))?;

        let mut keys = Vec::new();
        for r in rows {
            let key = r.map_err(|e| PipelineError::artifact_io(prefix, e))?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}
