//! Table backends — where a whole table is loaded from and saved to.
//!
//! A table is a `BTreeMap<String, V>`. Backends rewrite the full table on
//! every save; the tables are small (one row per agent or device class).

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};

/// A whole-table persistence backend.
pub trait TableBackend<V>: Send + Sync {
    /// Load every row. A missing table loads as empty.
    fn load(&self) -> StateResult<BTreeMap<String, V>>;

    /// Replace the stored table with `table`.
    fn save(&self, table: &BTreeMap<String, V>) -> StateResult<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Load a table, falling back to empty state when the backend cannot be read.
pub fn load_or_empty<V>(backend: &dyn TableBackend<V>) -> BTreeMap<String, V> {
    match backend.load() {
        Ok(table) => {
            debug!(backend = %backend.describe(), rows = table.len(), "table loaded");
            table
        }
        Err(e) => {
            warn!(
                backend = %backend.describe(),
                error = %e,
                "failed to load table, starting empty"
            );
            BTreeMap::new()
        }
    }
}

// ── JSON file ──────────────────────────────────────────────────────

/// One JSON object per file: `{ key: value, ... }`.
pub struct JsonFileBackend<V> {
    path: PathBuf,
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonFileBackend<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl<V> TableBackend<V> for JsonFileBackend<V>
where
    V: Serialize + DeserializeOwned,
{
    fn load(&self) -> StateResult<BTreeMap<String, V>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| StateError::Deserialize(e.to_string()))
    }

    fn save(&self, table: &BTreeMap<String, V>) -> StateResult<()> {
        let body =
            serde_json::to_vec_pretty(table).map_err(|e| StateError::Serialize(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        // Write-then-rename so a crash never leaves a half-written table.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &body).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// Keeps the last saved table in memory (for testing).
pub struct MemoryBackend<V> {
    table: Mutex<BTreeMap<String, V>>,
    fail_saves: bool,
}

impl<V> MemoryBackend<V> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            fail_saves: false,
        }
    }

    /// A backend whose saves always fail.
    pub fn failing() -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            fail_saves: true,
        }
    }

    pub fn with_rows(rows: BTreeMap<String, V>) -> Self {
        Self {
            table: Mutex::new(rows),
            fail_saves: false,
        }
    }
}

impl<V> Default for MemoryBackend<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TableBackend<V> for MemoryBackend<V>
where
    V: Clone + Send,
{
    fn load(&self) -> StateResult<BTreeMap<String, V>> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        Ok(table.clone())
    }

    fn save(&self, table: &BTreeMap<String, V>) -> StateResult<()> {
        if self.fail_saves {
            return Err(StateError::Write("memory backend configured to fail".to_string()));
        }
        let mut stored = self.table.lock().unwrap_or_else(|e| e.into_inner());
        *stored = table.clone();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
