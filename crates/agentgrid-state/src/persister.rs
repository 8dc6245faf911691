//! Persister — best-effort, ordered table writes outside the table lock.
//!
//! Callers take a generation number and a snapshot while holding their own
//! table lock, release it, then hand both to [`Persister::write`]. Writes are
//! serialized by an I/O lock, and a snapshot older than the last one
//! attempted is dropped, so a slow writer can never roll the file back, even
//! when the newer write failed.
//!
//! Failures are logged and swallowed: the in-memory table stays
//! authoritative and the next successful write catches the disk up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::backend::{TableBackend, load_or_empty};

pub struct Persister<V> {
    backend: Arc<dyn TableBackend<V>>,
    /// Last generation handed out.
    issued: AtomicU64,
    /// Newest generation handed to the backend, written or not; also the
    /// I/O lock.
    attempted: Mutex<u64>,
}

impl<V> Persister<V> {
    pub fn new(backend: Arc<dyn TableBackend<V>>) -> Self {
        Self {
            backend,
            issued: AtomicU64::new(0),
            attempted: Mutex::new(0),
        }
    }

    /// Load the table, or empty state if the backend cannot be read.
    pub fn load(&self) -> BTreeMap<String, V> {
        load_or_empty(self.backend.as_ref())
    }

    /// Reserve the generation for a snapshot. Call under the table lock.
    pub fn next_generation(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a snapshot unless a newer one was already handed to the backend.
    ///
    /// Returns whether the snapshot was written.
    pub fn write(&self, generation: u64, snapshot: &BTreeMap<String, V>) -> bool {
        let mut attempted = self.attempted.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *attempted {
            debug!(
                backend = %self.backend.describe(),
                generation,
                attempted = *attempted,
                "skipping stale snapshot"
            );
            return false;
        }
        *attempted = generation;
        match self.backend.save(snapshot) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    backend = %self.backend.describe(),
                    generation,
                    error = %e,
                    "failed to persist table"
                );
                false
            }
        }
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn table(rows: &[(&str, u32)]) -> BTreeMap<String, u32> {
        rows.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn writes_in_generation_order() {
        let backend = Arc::new(MemoryBackend::<u32>::new());
        let persister = Persister::new(backend.clone() as Arc<dyn TableBackend<u32>>);

        let g1 = persister.next_generation();
        let g2 = persister.next_generation();
        assert!(g2 > g1);

        assert!(persister.write(g2, &table(&[("a", 2)])));
        // An older snapshot arriving late is dropped.
        assert!(!persister.write(g1, &table(&[("a", 1)])));

        assert_eq!(backend.load().unwrap().get("a"), Some(&2));
    }

    #[test]
    fn failed_write_does_not_block_later_writes() {
        let failing = Arc::new(MemoryBackend::<u32>::failing());
        let persister = Persister::new(failing as Arc<dyn TableBackend<u32>>);
        let g = persister.next_generation();
        assert!(!persister.write(g, &table(&[("a", 1)])));

        let backend = Arc::new(MemoryBackend::<u32>::new());
        let persister = Persister::new(backend.clone() as Arc<dyn TableBackend<u32>>);
        let g1 = persister.next_generation();
        let g2 = persister.next_generation();
        assert!(persister.write(g1, &table(&[("a", 1)])));
        assert!(persister.write(g2, &table(&[("a", 2)])));
        assert_eq!(backend.load().unwrap().get("a"), Some(&2));
    }

    #[test]
    fn load_returns_backend_rows() {
        let backend = Arc::new(MemoryBackend::with_rows(table(&[("x", 7)])));
        let persister = Persister::new(backend as Arc<dyn TableBackend<u32>>);
        assert_eq!(persister.load().get("x"), Some(&7));
    }

    /// Fails the first save, then delegates.
    struct FailOnce {
        inner: MemoryBackend<u32>,
        failed: std::sync::atomic::AtomicBool,
    }

    impl TableBackend<u32> for FailOnce {
        fn load(&self) -> crate::StateResult<BTreeMap<String, u32>> {
            self.inner.load()
        }

        fn save(&self, table: &BTreeMap<String, u32>) -> crate::StateResult<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(crate::StateError::Write("disk full".to_string()));
            }
            self.inner.save(table)
        }

        fn describe(&self) -> String {
            "fail-once".to_string()
        }
    }

    #[test]
    fn failed_newer_write_still_blocks_older_snapshot() {
        let backend = Arc::new(FailOnce {
            inner: MemoryBackend::new(),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let persister = Persister::new(backend.clone() as Arc<dyn TableBackend<u32>>);

        let g1 = persister.next_generation();
        let g2 = persister.next_generation();
        assert!(!persister.write(g2, &table(&[("a", 2)])));
        assert!(!persister.write(g1, &table(&[("a", 1)])));
        assert!(backend.load().unwrap().is_empty());

        // The next mutation catches the disk up.
        let g3 = persister.next_generation();
        assert!(persister.write(g3, &table(&[("a", 3)])));
        assert_eq!(backend.load().unwrap().get("a"), Some(&3));
    }
}
