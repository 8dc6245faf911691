//! RedbBackend — embedded key-value backend for a single table.
//!
//! Each row is stored under its key with a JSON-serialized `&[u8]` value.
//! Several backends can share one `Database` (one table each).

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backend::TableBackend;
use crate::clock::epoch_secs;
use crate::error::{StateError, StateResult};
use crate::tables::definition;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A table persisted in a redb database.
pub struct RedbBackend<V> {
    db: Arc<Database>,
    table: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for RedbBackend<V> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            table: self.table,
            _marker: PhantomData,
        }
    }
}

impl<V> RedbBackend<V> {
    /// Open (or create) a database file and bind to one of its tables.
    pub fn open(path: &Path, table: &'static str) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        debug!(?path, table, "redb database opened");
        Self::with_database(Arc::new(db), table)
    }

    /// Like [`RedbBackend::open`], but a file that cannot be opened is moved
    /// aside to `<name>.corrupt-<epoch>` and replaced by an empty database.
    pub fn open_or_recover(path: &Path, table: &'static str) -> StateResult<Self> {
        match Self::open(path, table) {
            Ok(backend) => Ok(backend),
            Err(e) if path.exists() => {
                let aside = quarantine_path(path);
                warn!(
                    ?path,
                    moved_to = ?aside,
                    error = %e,
                    "redb database unreadable, starting with empty state"
                );
                std::fs::rename(path, &aside).map_err(map_err!(Open))?;
                Self::open(path, table)
            }
            Err(e) => Err(e),
        }
    }

    /// Create an ephemeral in-memory database (for testing).
    pub fn open_in_memory(table: &'static str) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Self::with_database(Arc::new(db), table)
    }

    /// Bind to a table of an already-open database, creating it if absent.
    pub fn with_database(db: Arc<Database>, table: &'static str) -> StateResult<Self> {
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(definition(table)).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Self {
            db,
            table,
            _marker: PhantomData,
        })
    }

    /// The shared database handle.
    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{}", epoch_secs()));
    path.with_file_name(name)
}

impl<V> TableBackend<V> for RedbBackend<V>
where
    V: Serialize + DeserializeOwned,
{
    fn load(&self) -> StateResult<BTreeMap<String, V>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(definition(self.table))
            .map_err(map_err!(Table))?;
        let mut rows = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let row: V = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            rows.insert(key.value().to_string(), row);
        }
        Ok(rows)
    }

    fn save(&self, rows: &BTreeMap<String, V>) -> StateResult<()> {
        let encoded: Vec<(&str, Vec<u8>)> = rows
            .iter()
            .map(|(key, row)| {
                serde_json::to_vec(row)
                    .map(|bytes| (key.as_str(), bytes))
                    .map_err(map_err!(Serialize))
            })
            .collect::<StateResult<_>>()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(definition(self.table))
                .map_err(map_err!(Table))?;

            // Collect stale keys first, then delete them.
            let stale: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    (!rows.contains_key(&k)).then_some(k)
                })
                .collect();
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            for (key, bytes) in &encoded {
                table
                    .insert(*key, bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = self.table, rows = rows.len(), "table saved");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redb:{}", self.table)
    }
}
