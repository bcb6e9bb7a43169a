//! Filesystem facade
//!
//! Thin veneer over the filesystem syscalls the engine uses. Every error is
//! wrapped with the path and OS errno so failures surface with
//! `[errno=...]` context. Components never touch `std::fs` directly; going
//! through the facade keeps mmap lifetimes and directory syncs in one place.

use crate::error::{EngineError, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct FilesFacade;

impl FilesFacade {
    pub fn new() -> Self {
        FilesFacade
    }

    /// Open for reading only.
    pub fn open_ro(&self, path: &Path) -> Result<File> {
        File::open(path).map_err(|e| EngineError::io(format!("open {}", path.display()), e))
    }

    /// Open read-write, creating the file when absent.
    pub fn open_rw(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| EngineError::io(format!("open {}", path.display()), e))
    }

    /// Open read-write, truncating any existing content.
    pub fn open_truncated(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| EngineError::io(format!("truncate {}", path.display()), e))
    }

    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub fn length(&self, path: &Path) -> Result<u64> {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| EngineError::io(format!("stat {}", path.display()), e))
    }

    pub fn mkdirs(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| EngineError::io(format!("mkdirs {}", path.display()), e))
    }

    pub fn read(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| EngineError::io(format!("read {}", path.display()), e))
    }

    /// Atomically replace `path` with `contents` via tmp-write + rename,
    /// then fsync the parent directory.
    pub fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = self.open_truncated(&tmp)?;
            file.write_all(contents)
                .map_err(|e| EngineError::io(format!("write {}", tmp.display()), e))?;
            file.sync_all()
                .map_err(|e| EngineError::io(format!("fsync {}", tmp.display()), e))?;
        }
        self.rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            self.fsync_dir(parent)?;
        }
        Ok(())
    }

    pub fn write_at(&self, file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(bytes))
            .map_err(|e| EngineError::io(format!("write at {offset}"), e))
    }

    pub fn read_at(&self, file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| EngineError::io(format!("read at {offset}"), e))
    }

    /// Rename; failure is surfaced to the caller, which decides whether it
    /// is fatal (non-WAL DDL treats it as CRITICAL).
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|e| {
            EngineError::io(format!("rename {} -> {}", from.display(), to.display()), e)
        })
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)
            .map_err(|e| EngineError::io(format!("unlink {}", path.display()), e))
    }

    pub fn remove_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path)
            .map_err(|e| EngineError::io(format!("rmdir {}", path.display()), e))
    }

    pub fn fsync(&self, file: &File) -> Result<()> {
        file.sync_all().map_err(|e| EngineError::io("fsync", e))
    }

    pub fn fdatasync(&self, file: &File) -> Result<()> {
        file.sync_data().map_err(|e| EngineError::io("fdatasync", e))
    }

    /// Persist a directory entry (rename/create) by syncing the directory
    /// itself. A rename that is not followed by this may live only in the
    /// directory cache.
    #[cfg(unix)]
    pub fn fsync_dir(&self, path: &Path) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let dir = self.open_ro(path)?;
        let rc = unsafe { libc::fsync(dir.as_raw_fd()) };
        if rc != 0 {
            return Err(EngineError::io(
                format!("fsync dir {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn fsync_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    /// Map `len` bytes of `file` read-only. The mapping must not outlive the
    /// component that owns it.
    pub fn mmap_ro(&self, file: &File, len: usize) -> Result<Mmap> {
        unsafe { MmapOptions::new().len(len).map(file) }
            .map_err(|e| EngineError::io("mmap", e))
    }

    /// Map `len` bytes of `file` read-write, growing the file first when it
    /// is shorter than `len`.
    pub fn mmap_rw(&self, file: &File, len: usize) -> Result<MmapMut> {
        let current = file.metadata().map_err(|e| EngineError::io("stat", e))?.len();
        if current < len as u64 {
            file.set_len(len as u64)
                .map_err(|e| EngineError::io("ftruncate", e))?;
        }
        unsafe { MmapOptions::new().len(len).map_mut(file) }
            .map_err(|e| EngineError::io("mmap", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let ff = FilesFacade::new();
        let path = dir.path().join("state.bin");

        ff.write_atomic(&path, b"first").unwrap();
        assert_eq!(ff.read(&path).unwrap(), b"first");

        ff.write_atomic(&path, b"second").unwrap();
        assert_eq!(ff.read(&path).unwrap(), b"second");
        assert!(!dir.path().join("state.tmp").exists());
    }

    #[test]
    fn test_mmap_rw_grows_file() {
        let dir = TempDir::new().unwrap();
        let ff = FilesFacade::new();
        let path = dir.path().join("data");

        let file = ff.open_rw(&path).unwrap();
        let mut map = ff.mmap_rw(&file, 4096).unwrap();
        map[0..4].copy_from_slice(&42i32.to_le_bytes());
        map.flush().unwrap();

        assert_eq!(ff.length(&path).unwrap(), 4096);
        let ro = ff.mmap_ro(&file, 4096).unwrap();
        assert_eq!(i32::from_le_bytes(ro[0..4].try_into().unwrap()), 42);
    }

    #[test]
    fn test_errno_is_captured() {
        let ff = FilesFacade::new();
        let err = ff.open_ro(Path::new("/nonexistent/file")).unwrap_err();
        match err {
            EngineError::Io { errno, .. } => assert_ne!(errno, 0),
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
