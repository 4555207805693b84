//! Bridge between a session and its local database.
//!
//! The session reads local history entries for upload and integrates
//! downloaded changesets by replaying them through the storage engine's
//! transaction API, persisting the updated progress atomically with
//! the integration commit.

use crate::error::{SyncError, SyncResult};
use terndb_core::{
    apply_changeset, Db, FileIdent, HistoryEntry, SyncProgress, Version,
};
use terndb_sync_protocol::{RemoteChangeset, UploadChangeset};
use tracing::debug;

/// A session's view of its local database file.
#[derive(Clone)]
pub struct ClientHistory {
    db: Db,
}

impl ClientHistory {
    /// Wraps a database.
    #[must_use]
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// The underlying database.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The persisted sync progress.
    #[must_use]
    pub fn progress(&self) -> SyncProgress {
        self.db.sync_progress()
    }

    /// The persisted client file identity.
    #[must_use]
    pub fn file_ident(&self) -> FileIdent {
        self.db.sync_file_ident()
    }

    /// Persists a server-assigned file identity.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_file_ident(&self, ident: FileIdent) -> SyncResult<()> {
        self.db.set_sync_file_ident(ident)?;
        Ok(())
    }

    /// The newest committed local version.
    #[must_use]
    pub fn last_local_version(&self) -> u64 {
        self.db.latest_version().number()
    }

    /// The newest local-origin version that needs uploading; zero when
    /// the whole history is remote-origin or empty.
    #[must_use]
    pub fn last_uploadable_version(&self) -> u64 {
        self.db
            .history_entries(Version::new(0), self.db.latest_version())
            .iter()
            .filter(|entry| entry.is_local())
            .last()
            .map_or(0, |entry| entry.version.number())
    }

    /// Local-origin history entries with versions in
    /// `(after, after + limit]`, ready for upload.
    ///
    /// Remote-origin entries (integrated downloads) are covered by the
    /// cursor range but never uploaded. With `skip_empty`, empty
    /// changesets are compacted away too.
    #[must_use]
    pub fn uploadable_entries(
        &self,
        after: u64,
        up_to: u64,
        skip_empty: bool,
    ) -> Vec<HistoryEntry> {
        self.db
            .history_entries(Version::new(after), Version::new(up_to))
            .into_iter()
            .filter(|entry| entry.is_local())
            .filter(|entry| !skip_empty || !entry.changeset.is_empty())
            .collect()
    }

    /// Builds UPLOAD payload entries from history entries.
    #[must_use]
    pub fn to_upload_changesets(entries: &[HistoryEntry]) -> Vec<UploadChangeset> {
        entries
            .iter()
            .map(|entry| UploadChangeset {
                client_version: entry.version.number(),
                last_integrated_server_version: entry.last_integrated_remote_version,
                origin_timestamp: entry.origin_timestamp,
                origin_file_ident: entry.origin_file_ident,
                changeset: entry.changeset.clone(),
            })
            .collect()
    }

    /// Persists progress without a commit (upload acknowledgements).
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_progress(&self, progress: SyncProgress) -> SyncResult<()> {
        self.db.set_sync_progress(progress)?;
        Ok(())
    }

    /// Integrates a batch of downloaded changesets in one write
    /// transaction, recording each under its remote origin and
    /// persisting `progress` with the commit.
    ///
    /// Returns the produced local version, or `None` for an empty
    /// batch (progress is still persisted).
    ///
    /// # Errors
    ///
    /// A failing changeset aborts the transaction and surfaces
    /// [`SyncError::BadChangeset`]; nothing is applied.
    pub fn integrate_changesets(
        &self,
        changesets: &[RemoteChangeset],
        progress: SyncProgress,
    ) -> SyncResult<Option<u64>> {
        if changesets.is_empty() {
            self.set_progress(progress)?;
            return Ok(None);
        }
        let mut txn = self.db.begin_write()?;
        for changeset in changesets {
            apply_changeset(&mut txn, &changeset.changeset)
                .map_err(|err| SyncError::BadChangeset(err.to_string()))?;
        }
        let last = changesets.last().expect("non-empty batch");
        let version = txn.commit_integration(
            last.origin_file_ident.max(1),
            last.server_version,
            progress,
        )?;
        debug!(
            version = version.number(),
            server_version = last.server_version,
            count = changesets.len(),
            "integrated remote changesets"
        );
        Ok(Some(version.number()))
    }
}

impl std::fmt::Debug for ClientHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHistory")
            .field("last_local_version", &self.last_local_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terndb_core::{ColumnSpec, TableType, Value};

    fn make_commit(db: &Db) {
        let mut txn = db.begin_write().unwrap();
        let table = txn.get_or_add_table("t", TableType::TopLevel).unwrap();
        if txn.spec(table.key()).unwrap().column_by_name("v").is_none() {
            txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
        }
        let col = txn.spec(table.key()).unwrap().column_by_name("v").unwrap();
        let obj = txn.create_object(table.key()).unwrap();
        txn.set_value(table.key(), obj.key(), col, Value::Int(1))
            .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn uploadable_entries_are_local_only() {
        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        make_commit(&db);
        make_commit(&db);

        let entries = history.uploadable_entries(0, history.last_local_version(), false);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(HistoryEntry::is_local));
    }

    #[test]
    fn integration_commits_are_not_uploadable() {
        let source = Db::open_in_memory().unwrap();
        make_commit(&source);
        let entry = source
            .history_entries(Version::new(0), Version::new(1))
            .remove(0);

        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        let remote = RemoteChangeset {
            server_version: 5,
            last_integrated_client_version: 0,
            origin_timestamp: entry.origin_timestamp,
            origin_file_ident: 9,
            original_size: entry.changeset.len() as u64,
            changeset: entry.changeset,
        };
        let progress = SyncProgress {
            download_server_version: 5,
            ..SyncProgress::default()
        };
        let version = history
            .integrate_changesets(&[remote], progress)
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(history.progress().download_server_version, 5);

        // The integration commit must not flow back upstream.
        let entries = history.uploadable_entries(0, history.last_local_version(), false);
        assert!(entries.is_empty());
        assert_eq!(history.last_uploadable_version(), 0);
    }

    #[test]
    fn bad_changeset_aborts_batch() {
        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        let remote = RemoteChangeset {
            server_version: 1,
            last_integrated_client_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 9,
            original_size: 2,
            changeset: vec![0xff, 0xff],
        };
        let result = history.integrate_changesets(&[remote], SyncProgress::default());
        assert!(matches!(result, Err(SyncError::BadChangeset(_))));
        assert_eq!(db.latest_version().number(), 0);
    }

    #[test]
    fn empty_changesets_skippable() {
        let db = Db::open_in_memory().unwrap();
        let history = ClientHistory::new(db.clone());
        // An empty commit produces an empty changeset.
        let txn = db.begin_write().unwrap();
        txn.commit().unwrap();
        make_commit(&db);

        let all = history.uploadable_entries(0, history.last_local_version(), false);
        assert_eq!(all.len(), 2);
        let compacted = history.uploadable_entries(0, history.last_local_version(), true);
        assert_eq!(compacted.len(), 1);
    }
}
