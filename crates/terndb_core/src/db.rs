//! The database: file ownership, transactions, and the open-file
//! registry.

use crate::alloc::SlabAlloc;
use crate::error::{CoreError, CoreResult};
use crate::history::{FileIdent, HistoryLog, SyncProgress};
use crate::keys::Version;
use crate::metrics::Metrics;
use crate::transaction::{ReadTransaction, Transaction, WriteTransaction};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use terndb_storage::{FileBackend, InMemoryBackend};

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// When false, commits skip fsync. Useful for tests and bulk loads.
    pub sync_to_disk: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { sync_to_disk: true }
    }
}

/// Callback invoked after every commit with the new version.
pub(crate) type CommitListener = Box<dyn Fn(Version) + Send + Sync>;

pub(crate) struct DbInner {
    pub(crate) path: Option<PathBuf>,
    /// Lock file guarding the single-writer invariant across processes.
    pub(crate) lock_file: Option<File>,
    pub(crate) alloc: Mutex<SlabAlloc>,
    /// In-process single-writer mutex.
    pub(crate) write_lock: Mutex<()>,
    /// Live reader versions and their refcounts.
    pub(crate) readers: Mutex<BTreeMap<u64, usize>>,
    pub(crate) history: Mutex<HistoryLog>,
    pub(crate) listeners: Mutex<Vec<CommitListener>>,
    pub(crate) commit_signal: Condvar,
    pub(crate) commit_signal_lock: Mutex<u64>,
    pub(crate) metrics: Metrics,
}

impl DbInner {
    /// Re-derives the oldest live version and feeds it to the allocator.
    pub(crate) fn update_oldest_live(&self) {
        let readers = self.readers.lock();
        let mut alloc = self.alloc.lock();
        let current = alloc.current_top().1;
        let oldest = readers
            .keys()
            .next()
            .map_or(current, |&v| Version::new(v).min(current));
        alloc.set_oldest_live(oldest);
        alloc.trim_free_lists();
    }

    pub(crate) fn register_reader(&self, version: Version) {
        *self.readers.lock().entry(version.number()).or_insert(0) += 1;
    }

    pub(crate) fn release_reader(&self, version: Version) {
        {
            let mut readers = self.readers.lock();
            if let Some(count) = readers.get_mut(&version.number()) {
                *count -= 1;
                if *count == 0 {
                    readers.remove(&version.number());
                }
            }
        }
        self.update_oldest_live();
    }

    pub(crate) fn notify_commit(&self, version: Version) {
        {
            let mut latest = self.commit_signal_lock.lock();
            *latest = version.number();
            self.commit_signal.notify_all();
        }
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener(version);
        }
    }
}

/// An embedded object database.
///
/// Opening the same canonical path twice in one process yields the same
/// shared instance, so the allocator's live-version tracking is global.
/// Many read transactions may run concurrently; at most one write
/// transaction exists at a time, guarded in-process by a mutex and
/// cross-process by a lock file.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<DbInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<DbInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Db {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a corrupt file, or if another process holds
    /// the exclusive lock.
    pub fn open(path: &Path, config: DbConfig) -> CoreResult<Self> {
        let canonical = match path.canonicalize() {
            Ok(canonical) => canonical,
            // The file may not exist yet; canonicalize the parent.
            Err(_) => match path.parent().and_then(|p| p.canonicalize().ok()) {
                Some(parent) => parent.join(path.file_name().unwrap_or_default()),
                None => path.to_path_buf(),
            },
        };

        let mut registry = registry().lock();
        if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
            return Ok(Self { inner: existing });
        }

        let lock_path = canonical.with_extension("lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let backend = FileBackend::open(&canonical)?;
        let alloc = SlabAlloc::open(Box::new(backend), config.sync_to_disk)?;

        let history_path = canonical.with_extension("history");
        let history_backend = FileBackend::open(&history_path)?;
        let mut history = HistoryLog::open(Box::new(history_backend))?;
        // The history may run one entry ahead of an interrupted commit.
        let (_, version) = alloc.current_top();
        history.truncate_beyond(version);

        let inner = Arc::new(DbInner {
            path: Some(canonical.clone()),
            lock_file: Some(lock_file),
            alloc: Mutex::new(alloc),
            write_lock: Mutex::new(()),
            readers: Mutex::new(BTreeMap::new()),
            history: Mutex::new(history),
            listeners: Mutex::new(Vec::new()),
            commit_signal: Condvar::new(),
            commit_signal_lock: Mutex::new(version.number()),
            metrics: Metrics::default(),
        });
        registry.insert(canonical, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Opens an ephemeral in-memory database. Not registered; every
    /// call returns a fresh instance.
    ///
    /// # Errors
    ///
    /// Fails only on allocator initialization errors.
    pub fn open_in_memory() -> CoreResult<Self> {
        let alloc = SlabAlloc::open(Box::new(InMemoryBackend::new()), false)?;
        let history = HistoryLog::open(Box::new(InMemoryBackend::new()))?;
        Ok(Self {
            inner: Arc::new(DbInner {
                path: None,
                lock_file: None,
                alloc: Mutex::new(alloc),
                write_lock: Mutex::new(()),
                readers: Mutex::new(BTreeMap::new()),
                history: Mutex::new(history),
                listeners: Mutex::new(Vec::new()),
                commit_signal: Condvar::new(),
                commit_signal_lock: Mutex::new(0),
                metrics: Metrics::default(),
            }),
        })
    }

    /// Begins a read transaction on the current version.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors while loading the group.
    pub fn begin_read(&self) -> CoreResult<ReadTransaction> {
        let (top, version) = self.inner.alloc.lock().current_top();
        self.inner.register_reader(version);
        self.inner.metrics.reads_started.bump();
        match Transaction::new(Arc::clone(&self.inner), version, top, false) {
            Ok(txn) => Ok(ReadTransaction::new(txn)),
            Err(err) => {
                self.inner.release_reader(version);
                Err(err)
            }
        }
    }

    /// Begins the write transaction, blocking until the writer slot is
    /// free.
    ///
    /// # Errors
    ///
    /// Fails if another process holds the file lock or on I/O errors.
    pub fn begin_write(&self) -> CoreResult<WriteTransaction<'_>> {
        let guard = self.inner.write_lock.lock();
        if let Some(lock_file) = &self.inner.lock_file {
            lock_file
                .lock_exclusive()
                .map_err(|_| CoreError::DatabaseLocked)?;
        }
        self.inner.update_oldest_live();
        let (top, version) = self.inner.alloc.lock().current_top();
        self.inner.register_reader(version);
        self.inner.metrics.writes_started.bump();
        match Transaction::new(Arc::clone(&self.inner), version, top, true) {
            Ok(txn) => Ok(WriteTransaction::new(txn, guard)),
            Err(err) => {
                self.inner.release_reader(version);
                if let Some(lock_file) = &self.inner.lock_file {
                    let _ = fs2::FileExt::unlock(lock_file);
                }
                Err(err)
            }
        }
    }

    /// The latest committed version.
    #[must_use]
    pub fn latest_version(&self) -> Version {
        self.inner.alloc.lock().current_top().1
    }

    /// Blocks until a version newer than `version` is committed, or the
    /// timeout elapses. Returns the latest version.
    pub fn wait_for_version_beyond(
        &self,
        version: Version,
        timeout: std::time::Duration,
    ) -> Version {
        let mut latest = self.inner.commit_signal_lock.lock();
        if *latest > version.number() {
            return Version::new(*latest);
        }
        let deadline = std::time::Instant::now() + timeout;
        while *latest <= version.number() {
            if self
                .inner
                .commit_signal
                .wait_until(&mut latest, deadline)
                .timed_out()
            {
                break;
            }
        }
        Version::new(*latest)
    }

    /// Registers a callback invoked after every commit.
    pub fn add_commit_listener(&self, listener: impl Fn(Version) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// The sync progress persisted in the history.
    #[must_use]
    pub fn sync_progress(&self) -> SyncProgress {
        self.inner.history.lock().progress()
    }

    /// The client file identity persisted in the history.
    #[must_use]
    pub fn sync_file_ident(&self) -> FileIdent {
        self.inner.history.lock().file_ident()
    }

    /// Persists the server-assigned client file identity.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_sync_file_ident(&self, ident: FileIdent) -> CoreResult<()> {
        self.inner.history.lock().set_file_ident(ident)
    }

    /// Persists new sync progress outside a commit (upload
    /// acknowledgements).
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_sync_progress(&self, progress: SyncProgress) -> CoreResult<()> {
        self.inner.history.lock().set_progress(progress)
    }

    /// Local history entries with versions in `(from, to]`.
    #[must_use]
    pub fn history_entries(&self, from: Version, to: Version) -> Vec<crate::HistoryEntry> {
        self.inner.history.lock().entries_in_range(from, to)
    }

    /// Engine counters.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("version", &self.latest_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_registry_shares_instance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.terndb");
        let db1 = Db::open(&path, DbConfig::default()).unwrap();
        let db2 = Db::open(&path, DbConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&db1.inner, &db2.inner));
    }

    #[test]
    fn in_memory_instances_are_distinct() {
        let db1 = Db::open_in_memory().unwrap();
        let db2 = Db::open_in_memory().unwrap();
        assert!(!Arc::ptr_eq(&db1.inner, &db2.inner));
    }

    #[test]
    fn fresh_db_is_version_zero() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.latest_version(), Version::new(0));
    }
}
