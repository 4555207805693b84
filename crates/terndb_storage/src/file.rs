//! File-based storage backend.
//!
//! Reads are positional (`pread`-style) against a shared file handle,
//! so any number of snapshot readers proceed concurrently without a
//! lock or a shared cursor. The only guarded state is the append tail:
//! the single writer extends the file there at commit, then installs
//! the new top ref with one positional write into the header region.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// A file-backed byte store.
///
/// Backs both the page file and the history log. Refs below the
/// committed size address bytes that are never rewritten while a
/// reader can still observe them, so the read path needs no
/// synchronization beyond a snapshot of the tail.
///
/// # Durability
///
/// Positional writes are unbuffered syscalls, so `flush` has nothing
/// held back to push; `sync` calls `File::sync_all` and is the
/// engine's durability barrier around the slab append and the header
/// swap.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    /// Offset of the next append; doubles as the current size.
    tail: Mutex<u64>,
}

impl FileBackend {
    /// Opens or creates the file at `path`, picking up the existing
    /// size as the append tail.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let tail = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            tail: Mutex::new(tail),
        })
    }

    /// The path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.tail.lock();
        let end = offset.saturating_add(len as u64);
        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        let mut buffer = vec![0u8; len];
        read_exact_at(&self.file, offset, &mut buffer)?;
        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = *self.tail.lock();
        let end = offset.saturating_add(data.len() as u64);
        if end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }
        write_all_at(&self.file, offset, data)?;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut tail = self.tail.lock();
        write_all_at(&self.file, *tail, data)?;
        let offset = *tail;
        *tail += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        // Positional writes go straight to the kernel; there is no
        // user-space buffer to drain.
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.tail.lock())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut tail = self.tail.lock();
        if new_size > *tail {
            return Err(StorageError::Corrupted(format!(
                "cannot truncate to {new_size} beyond size {tail}",
                tail = *tail
            )));
        }
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        *tail = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_advances_tail() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t.bin")).unwrap();

        assert_eq!(backend.append(b"header..").unwrap(), 0);
        assert_eq!(backend.append(b"block-one").unwrap(), 8);
        assert_eq!(backend.size().unwrap(), 17);
        assert_eq!(&backend.read_at(8, 9).unwrap(), b"block-one");
    }

    #[test]
    fn header_region_overwrite() {
        // The commit path's header-slot swap: one positional write
        // inside the committed region.
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t.bin")).unwrap();
        backend.append(b"AAAAAAAAtail").unwrap();

        backend.write_at(0, b"BBBBBBBB").unwrap();
        assert_eq!(&backend.read_at(0, 12).unwrap(), b"BBBBBBBBtail");
    }

    #[test]
    fn write_past_tail_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t.bin")).unwrap();
        backend.append(b"12345").unwrap();

        let result = backend.write_at(3, b"too-long");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn read_past_tail_rejected() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("t.bin")).unwrap();
        backend.append(b"12345").unwrap();

        assert!(matches!(
            backend.read_at(4, 2),
            Err(StorageError::ReadPastEnd { .. })
        ));
        // A zero-length read at the tail is still in bounds.
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn reopen_recovers_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable bytes").unwrap();
            backend.sync().unwrap();
        }
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 13);
        assert_eq!(&backend.read_at(0, 13).unwrap(), b"durable bytes");
    }

    #[test]
    fn truncate_discards_torn_tail() {
        // The history log drops a half-written record on open.
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"good-record").unwrap();
        backend.append(b"torn").unwrap();

        backend.truncate(11).unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert!(backend.read_at(11, 1).is_err());
        assert!(backend.truncate(20).is_err());
    }

    #[test]
    fn readers_do_not_block_each_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(&vec![0xabu8; 4096]).unwrap();

        let backend = std::sync::Arc::new(backend);
        let mut handles = Vec::new();
        for i in 0..4 {
            let backend = std::sync::Arc::clone(&backend);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let bytes = backend.read_at(i * 512, 512).unwrap();
                    assert!(bytes.iter().all(|&b| b == 0xab));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn path_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.path(), path);
    }
}
