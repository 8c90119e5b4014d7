use crate::record::{FlatRecord, InvoiceRecord};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {partition_key}/{row_key} not found")]
    NotFound {
        partition_key: String,
        row_key: String,
    },
    #[error("invalid table name: {0}")]
    InvalidTable(String),
    #[error("table store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored properties are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("table store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("table store connection poisoned")]
    Poisoned,
    #[error("table store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Keyed-table gateway for invoice records.
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite the entity at `(partition_key, row_key)`. Always
    /// resets `Verified` to false.
    fn upsert(
        &self,
        partition_key: &str,
        row_key: &str,
        record: &FlatRecord,
    ) -> Result<InvoiceRecord, StoreError>;

    fn get(&self, partition_key: &str, row_key: &str) -> Result<InvoiceRecord, StoreError>;
}

/// Run a store call on the blocking pool. The SQLite connection is serialized
/// behind one mutex and must not hold up runtime workers.
pub async fn run_blocking<T, F>(store: &Arc<dyn RecordStore>, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn RecordStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(store.as_ref())).await?
}

/// SQLite-backed table store. Properties are kept as a JSON object of strings.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    table: String,
}

impl SqliteRecordStore {
    /// Open (or create) the store at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P, table: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(db_path)?, table)
    }

    pub fn in_memory(table: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        // Table names cannot be bound as parameters.
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidTable(table.to_string()));
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    partition_key TEXT NOT NULL,
                    row_key TEXT NOT NULL,
                    properties TEXT NOT NULL,
                    verified INTEGER NOT NULL DEFAULT 0,
                    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (partition_key, row_key)
                )"
            ),
            [],
        )?;

        info!(table = %table, "Table store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of stored entities.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

impl RecordStore for SqliteRecordStore {
    fn upsert(
        &self,
        partition_key: &str,
        row_key: &str,
        record: &FlatRecord,
    ) -> Result<InvoiceRecord, StoreError> {
        let properties = serde_json::Value::Object(record.to_properties()).to_string();
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {}
                    (partition_key, row_key, properties, verified)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(partition_key, row_key) DO UPDATE SET
                    properties = excluded.properties,
                    verified = 0,
                    updated_at = CURRENT_TIMESTAMP",
                self.table
            ),
            params![partition_key, row_key, properties],
        )?;
        info!(partition_key = %partition_key, row_key = %row_key, "Invoice entity upserted");

        Ok(InvoiceRecord {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            record: record.clone(),
            verified: false,
        })
    }

    fn get(&self, partition_key: &str, row_key: &str) -> Result<InvoiceRecord, StoreError> {
        let conn = self.conn()?;
        let row: Option<(String, bool)> = conn
            .query_row(
                &format!(
                    "SELECT properties, verified FROM {}
                     WHERE partition_key = ?1 AND row_key = ?2",
                    self.table
                ),
                params![partition_key, row_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((properties, verified)) = row else {
            return Err(StoreError::NotFound {
                partition_key: partition_key.to_string(),
                row_key: row_key.to_string(),
            });
        };

        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&properties)?;
        Ok(InvoiceRecord {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            record: FlatRecord::from_json_map(&map),
            verified,
        })
    }
}
