use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use atpi_config::ATPI_DIR_NAME;
use atpi_core::current_unix_timestamp_millis;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

mod cache;
mod history;

pub use cache::ResolutionCache;
pub use history::{HistoryItem, HistoryStore, MAX_HISTORY_ITEMS, history_label};

pub const CACHE_STATE_KEY: &str = "atpi.cache";
pub const HISTORY_STATE_KEY: &str = "atpi.history";
pub const STATE_FILE_NAME: &str = "state.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key/value blobs. Callers rewrite a whole value per key; there is no
/// partial update.
pub trait StateStore: Send + Sync {
    fn read_state(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write_state(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
    atpi_dir: PathBuf,
}

impl SqliteStateStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let atpi_dir = workspace_root.as_ref().join(ATPI_DIR_NAME);
        fs::create_dir_all(&atpi_dir)?;

        let conn = Connection::open(atpi_dir.join(STATE_FILE_NAME))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            atpi_dir,
        })
    }

    pub fn atpi_dir(&self) -> &Path {
        &self.atpi_dir
    }
}

impl StateStore for SqliteStateStore {
    fn read_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value = conn
            .query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            r#"
            INSERT INTO state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, current_unix_timestamp_millis()],
        )?;
        Ok(())
    }
}

/// In-process state, lost on drop. Reads and writes can be made to fail to
/// exercise the degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::default();
        store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        store
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl StateStore for MemoryStateStore {
    fn read_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("read of {key} refused")));
        }
        Ok(self.raw(key))
    }

    fn write_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write of {key} refused")));
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}
