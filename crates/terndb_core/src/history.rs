//! Append-only history of committed changesets.
//!
//! The history is a sidecar log next to the database file. Each commit
//! appends one framed entry; the sync client consumes entries in order
//! for upload and persists its progress through the same log. Records
//! are length-prefixed and CRC32-checked; a torn tail is truncated on
//! open.

use crate::error::{CoreError, CoreResult};
use crate::keys::Version;
use terndb_storage::StorageBackend;

/// Magic bytes identifying a history record.
const RECORD_MAGIC: [u8; 4] = *b"THIS";

/// Record holding one committed changeset.
const RECORD_ENTRY: u8 = 1;
/// Record holding the latest sync progress.
const RECORD_PROGRESS: u8 = 2;
/// Record holding the client file identity.
const RECORD_IDENT: u8 = 3;

/// One committed changeset with its origin metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The local version produced by this commit.
    pub version: Version,
    /// Server version integrated into this commit, or zero for a local
    /// change.
    pub last_integrated_remote_version: u64,
    /// Origin timestamp (milliseconds since the epoch).
    pub origin_timestamp: i64,
    /// Origin file identity; zero for changes made by this file.
    pub origin_file_ident: u64,
    /// The encoded changeset instructions.
    pub changeset: Vec<u8>,
}

impl HistoryEntry {
    /// True if this entry originated on this file (and must be
    /// uploaded) rather than being an integrated remote changeset.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.origin_file_ident == 0
    }
}

/// Synchronization progress, persisted atomically with each integrated
/// batch.
///
/// Both axes are monotone: the download fields never regress across
/// integrations and the upload fields never regress across commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncProgress {
    /// Last server version whose changesets have been integrated.
    pub download_server_version: u64,
    /// Last local version the server had integrated when it produced
    /// the download.
    pub download_client_version: u64,
    /// Last local version the server has acknowledged as integrated.
    pub upload_client_version: u64,
    /// Last server version that was integrated locally when the
    /// acknowledged upload was produced.
    pub upload_server_version: u64,
    /// Latest version known to exist on the server.
    pub latest_server_version: u64,
    /// Salt attached to `latest_server_version`.
    pub latest_server_salt: u64,
}

/// The client file identity assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileIdent {
    /// The identity, zero while unassigned.
    pub ident: u64,
    /// Salt proving the identity was assigned by this server.
    pub salt: u64,
}

/// The append-only history log.
pub struct HistoryLog {
    backend: Box<dyn StorageBackend>,
    entries: Vec<HistoryEntry>,
    progress: SyncProgress,
    file_ident: FileIdent,
}

impl HistoryLog {
    /// Opens a history log, replaying existing records.
    ///
    /// A record with a bad checksum and everything after it is
    /// discarded (torn write at the tail); a bad record before the tail
    /// is corruption.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or interior corruption.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let size = backend.size()?;
        let mut log = Self {
            backend,
            entries: Vec::new(),
            progress: SyncProgress::default(),
            file_ident: FileIdent::default(),
        };

        let mut offset = 0u64;
        while offset < size {
            match log.read_record(offset, size) {
                Ok((kind, payload, next)) => {
                    log.apply_record(kind, &payload)?;
                    offset = next;
                }
                Err(_) => {
                    // Torn tail from an interrupted append.
                    log.backend.truncate(offset)?;
                    break;
                }
            }
        }
        Ok(log)
    }

    fn read_record(&self, offset: u64, size: u64) -> CoreResult<(u8, Vec<u8>, u64)> {
        if offset + 13 > size {
            return Err(CoreError::history_corruption("short record header"));
        }
        let header = self.backend.read_at(offset, 13)?;
        if header[0..4] != RECORD_MAGIC {
            return Err(CoreError::history_corruption("bad record magic"));
        }
        let kind = header[4];
        let len = u32::from_le_bytes(header[5..9].try_into().expect("sized")) as u64;
        let crc = u32::from_le_bytes(header[9..13].try_into().expect("sized"));
        if offset + 13 + len > size {
            return Err(CoreError::history_corruption("record exceeds file"));
        }
        let payload = self.backend.read_at(offset + 13, len as usize)?;
        if compute_crc32(&payload) != crc {
            return Err(CoreError::history_corruption("record checksum mismatch"));
        }
        Ok((kind, payload, offset + 13 + len))
    }

    fn apply_record(&mut self, kind: u8, payload: &[u8]) -> CoreResult<()> {
        match kind {
            RECORD_ENTRY => {
                let entry = decode_entry(payload)?;
                self.entries.push(entry);
                Ok(())
            }
            RECORD_PROGRESS => {
                self.progress = decode_progress(payload)?;
                Ok(())
            }
            RECORD_IDENT => {
                if payload.len() != 16 {
                    return Err(CoreError::history_corruption("bad ident record"));
                }
                self.file_ident = FileIdent {
                    ident: u64::from_le_bytes(payload[0..8].try_into().expect("sized")),
                    salt: u64::from_le_bytes(payload[8..16].try_into().expect("sized")),
                };
                Ok(())
            }
            _ => Err(CoreError::history_corruption(format!(
                "unknown record kind {kind}"
            ))),
        }
    }

    fn append_record(&mut self, kind: u8, payload: &[u8]) -> CoreResult<()> {
        let mut record = Vec::with_capacity(13 + payload.len());
        record.extend_from_slice(&RECORD_MAGIC);
        record.push(kind);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&compute_crc32(payload).to_le_bytes());
        record.extend_from_slice(payload);
        self.backend.append(&record)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Appends one committed changeset.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn append_entry(&mut self, entry: HistoryEntry) -> CoreResult<()> {
        self.append_record(RECORD_ENTRY, &encode_entry(&entry))?;
        self.entries.push(entry);
        Ok(())
    }

    /// Persists new sync progress.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_progress(&mut self, progress: SyncProgress) -> CoreResult<()> {
        self.append_record(RECORD_PROGRESS, &encode_progress(&progress))?;
        self.progress = progress;
        Ok(())
    }

    /// Persists the server-assigned file identity.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn set_file_ident(&mut self, ident: FileIdent) -> CoreResult<()> {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&ident.ident.to_le_bytes());
        payload.extend_from_slice(&ident.salt.to_le_bytes());
        self.append_record(RECORD_IDENT, &payload)?;
        self.file_ident = ident;
        Ok(())
    }

    /// The latest persisted sync progress.
    #[must_use]
    pub fn progress(&self) -> SyncProgress {
        self.progress
    }

    /// The persisted client file identity.
    #[must_use]
    pub fn file_ident(&self) -> FileIdent {
        self.file_ident
    }

    /// The version of the newest entry, or zero.
    #[must_use]
    pub fn last_version(&self) -> Version {
        self.entries
            .last()
            .map_or(Version::new(0), |entry| entry.version)
    }

    /// Entries with versions in `(from, to]`, in order.
    #[must_use]
    pub fn entries_in_range(&self, from: Version, to: Version) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.version > from && entry.version <= to)
            .cloned()
            .collect()
    }

    /// The entry for an exact version.
    #[must_use]
    pub fn entry_at(&self, version: Version) -> Option<&HistoryEntry> {
        self.entries.iter().find(|entry| entry.version == version)
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the log has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops in-memory entries newer than `version`.
    ///
    /// Used on open when the history ran ahead of a commit that never
    /// completed its top-ref swap.
    pub fn truncate_beyond(&mut self, version: Version) {
        self.entries.retain(|entry| entry.version <= version);
    }
}

impl std::fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLog")
            .field("entries", &self.entries.len())
            .field("last_version", &self.last_version())
            .finish_non_exhaustive()
    }
}

fn encode_entry(entry: &HistoryEntry) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + entry.changeset.len());
    payload.extend_from_slice(&entry.version.number().to_le_bytes());
    payload.extend_from_slice(&entry.last_integrated_remote_version.to_le_bytes());
    payload.extend_from_slice(&entry.origin_timestamp.to_le_bytes());
    payload.extend_from_slice(&entry.origin_file_ident.to_le_bytes());
    payload.extend_from_slice(&entry.changeset);
    payload
}

fn decode_entry(payload: &[u8]) -> CoreResult<HistoryEntry> {
    if payload.len() < 32 {
        return Err(CoreError::history_corruption("short entry record"));
    }
    Ok(HistoryEntry {
        version: Version::new(u64::from_le_bytes(payload[0..8].try_into().expect("sized"))),
        last_integrated_remote_version: u64::from_le_bytes(
            payload[8..16].try_into().expect("sized"),
        ),
        origin_timestamp: i64::from_le_bytes(payload[16..24].try_into().expect("sized")),
        origin_file_ident: u64::from_le_bytes(payload[24..32].try_into().expect("sized")),
        changeset: payload[32..].to_vec(),
    })
}

fn encode_progress(progress: &SyncProgress) -> Vec<u8> {
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(&progress.download_server_version.to_le_bytes());
    payload.extend_from_slice(&progress.download_client_version.to_le_bytes());
    payload.extend_from_slice(&progress.upload_client_version.to_le_bytes());
    payload.extend_from_slice(&progress.upload_server_version.to_le_bytes());
    payload.extend_from_slice(&progress.latest_server_version.to_le_bytes());
    payload.extend_from_slice(&progress.latest_server_salt.to_le_bytes());
    payload
}

fn decode_progress(payload: &[u8]) -> CoreResult<SyncProgress> {
    if payload.len() != 48 {
        return Err(CoreError::history_corruption("bad progress record"));
    }
    let field = |i: usize| u64::from_le_bytes(payload[i * 8..i * 8 + 8].try_into().expect("sized"));
    Ok(SyncProgress {
        download_server_version: field(0),
        download_client_version: field(1),
        upload_client_version: field(2),
        upload_server_version: field(3),
        latest_server_version: field(4),
        latest_server_salt: field(5),
    })
}

/// Computes the CRC32 checksum (IEEE polynomial) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use terndb_storage::InMemoryBackend;

    fn sample_entry(version: u64) -> HistoryEntry {
        HistoryEntry {
            version: Version::new(version),
            last_integrated_remote_version: 3,
            origin_timestamp: 1_700_000_000_000,
            origin_file_ident: 0,
            changeset: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn append_and_query() {
        let mut log = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        for v in 1..=5 {
            log.append_entry(sample_entry(v)).unwrap();
        }
        assert_eq!(log.last_version(), Version::new(5));
        let range = log.entries_in_range(Version::new(2), Version::new(4));
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].version, Version::new(3));
        assert_eq!(range[1].version, Version::new(4));
    }

    #[test]
    fn progress_roundtrip() {
        let mut log = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        let progress = SyncProgress {
            download_server_version: 10,
            download_client_version: 4,
            upload_client_version: 6,
            upload_server_version: 9,
            latest_server_version: 12,
            latest_server_salt: 0x5a17,
        };
        log.set_progress(progress).unwrap();
        assert_eq!(log.progress(), progress);
    }

    #[test]
    fn file_ident_roundtrip() {
        let mut log = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        let ident = FileIdent {
            ident: 42,
            salt: 0xdead,
        };
        log.set_file_ident(ident).unwrap();
        assert_eq!(log.file_ident(), ident);
    }

    #[test]
    fn reopen_replays_records() {
        let mut first = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        first.append_entry(sample_entry(1)).unwrap();
        first.append_entry(sample_entry(2)).unwrap();
        first
            .set_progress(SyncProgress {
                download_server_version: 7,
                ..SyncProgress::default()
            })
            .unwrap();

        let size = first.backend.size().unwrap();
        let bytes = first.backend.read_at(0, size as usize).unwrap();

        let log = HistoryLog::open(Box::new(InMemoryBackend::with_data(bytes))).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_version(), Version::new(2));
        assert_eq!(log.progress().download_server_version, 7);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let mut first = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        first.append_entry(sample_entry(1)).unwrap();
        first.append_entry(sample_entry(2)).unwrap();

        let size = first.backend.size().unwrap();
        let bytes = first.backend.read_at(0, size as usize).unwrap();
        // Cut the last record in half.
        let torn = bytes[..bytes.len() - 10].to_vec();

        let log = HistoryLog::open(Box::new(InMemoryBackend::with_data(torn))).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_version(), Version::new(1));
    }

    #[test]
    fn truncate_beyond_drops_entries() {
        let mut log = HistoryLog::open(Box::new(InMemoryBackend::new())).unwrap();
        for v in 1..=4 {
            log.append_entry(sample_entry(v)).unwrap();
        }
        log.truncate_beyond(Version::new(2));
        assert_eq!(log.last_version(), Version::new(2));
    }

    #[test]
    fn local_vs_remote_entries() {
        let mut remote = sample_entry(3);
        remote.origin_file_ident = 99;
        assert!(!remote.is_local());
        assert!(sample_entry(1).is_local());
    }
}
