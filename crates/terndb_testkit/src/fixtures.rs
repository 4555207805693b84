//! Test fixtures.

use std::path::PathBuf;
use std::sync::Once;
use tempfile::TempDir;
use terndb_core::{Db, DbConfig};

/// Installs a test subscriber once per process. Safe to call from
/// every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A database in a temporary directory. The directory lives as long as
/// the fixture.
pub struct DbFixture {
    dir: TempDir,
    name: String,
}

impl DbFixture {
    /// Creates a fixture for a file called `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            name: name.to_owned(),
        }
    }

    /// The database file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.path().join(&self.name)
    }

    /// Opens the database, skipping fsync for speed.
    ///
    /// # Panics
    ///
    /// Panics if the database cannot be opened.
    #[must_use]
    pub fn open(&self) -> Db {
        Db::open(
            &self.path(),
            DbConfig {
                sync_to_disk: false,
            },
        )
        .expect("open fixture database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_opens_and_reopens() {
        let fixture = DbFixture::new("f.terndb");
        let db = fixture.open();
        let txn = db.begin_write().unwrap();
        txn.commit().unwrap();
        drop(db);
        let db = fixture.open();
        assert_eq!(db.latest_version().number(), 1);
    }
}
