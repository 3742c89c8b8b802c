//! The process-wide file-descriptor table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::FileHandle;
use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::flags::OpenFlag;

/// A file descriptor.
pub type Fd = i32;

/// An entry in the descriptor table.
///
/// The VFS owns the read/write position; backend handles are positionless.
pub struct OpenFile {
    /// User-facing path the file was opened at.
    pub path: String,
    /// The parsed open flag.
    pub flag: OpenFlag,
    position: Mutex<u64>,
    handle: Arc<dyn FileHandle>,
    closed: AtomicBool,
}

impl OpenFile {
    /// Wrap a backend handle.
    pub fn new(path: String, flag: OpenFlag, handle: Arc<dyn FileHandle>) -> Self {
        Self {
            path,
            flag,
            position: Mutex::new(0),
            handle,
            closed: AtomicBool::new(false),
        }
    }

    /// The backend handle, or `EBADF` once closed.
    pub fn handle(&self) -> Result<Arc<dyn FileHandle>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FsError::new(Errno::EBADF));
        }
        Ok(self.handle.clone())
    }

    /// Current per-descriptor position.
    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    /// Replace the per-descriptor position.
    pub fn set_position(&self, pos: u64) {
        *self.position.lock() = pos;
    }

    /// Advance the position by `n` from `start`.
    pub fn advance(&self, start: u64, n: usize) {
        *self.position.lock() = start + n as u64;
    }

    /// Mark closed; returns false if it already was (close is idempotent).
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Close the backend handle, bypassing the closed-descriptor guard.
    /// Used by the descriptor table while tearing an entry down.
    pub(crate) fn close_backend(&self) -> Result<()> {
        self.handle.close()
    }

    /// Async twin of [`close_backend`](Self::close_backend).
    pub(crate) async fn close_backend_async(&self) -> Result<()> {
        self.handle.close_async().await
    }

    /// True once the descriptor has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("path", &self.path)
            .field("position", &self.position())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Mapping between descriptors and open files; descriptors are assigned
/// densely from the lowest free slot.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: Mutex<BTreeMap<Fd, Arc<OpenFile>>>,
}

impl FdTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open file and return its descriptor.
    pub fn insert(&self, file: Arc<OpenFile>) -> Fd {
        let mut entries = self.entries.lock();
        let mut fd: Fd = 0;
        for key in entries.keys() {
            if *key != fd {
                break;
            }
            fd += 1;
        }
        entries.insert(fd, file);
        fd
    }

    /// Look up a descriptor.
    pub fn get(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        self.entries
            .lock()
            .get(&fd)
            .cloned()
            .ok_or_else(|| FsError::new(Errno::EBADF))
    }

    /// Remove a descriptor, returning its open file.
    pub fn remove(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        self.entries
            .lock()
            .remove(&fd)
            .ok_or_else(|| FsError::new(Errno::EBADF))
    }

    /// Drain every entry; used for process-exit cleanup.
    pub fn drain(&self) -> Vec<(Fd, Arc<OpenFile>)> {
        let mut entries = self.entries.lock();
        let drained: Vec<_> = entries.iter().map(|(k, v)| (*k, v.clone())).collect();
        entries.clear();
        drained
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no descriptors are open.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::CreateContext;
    use crate::memfs::MemFs;

    fn open_file(fs: &MemFs, path: &str) -> Arc<OpenFile> {
        let flag = OpenFlag::parse("w").unwrap();
        let handle = fs
            .create_file(path, flag, 0o644, CreateContext::default())
            .unwrap();
        Arc::new(OpenFile::new(path.to_string(), flag, handle))
    }

    #[test]
    fn fds_fill_lowest_free_slot() {
        let fs = MemFs::new();
        let table = FdTable::new();
        let a = table.insert(open_file(&fs, "/a"));
        let b = table.insert(open_file(&fs, "/b"));
        let c = table.insert(open_file(&fs, "/c"));
        assert_eq!((a, b, c), (0, 1, 2));

        table.remove(b).unwrap();
        assert_eq!(table.insert(open_file(&fs, "/d")), 1);
        assert_eq!(table.insert(open_file(&fs, "/e")), 3);
    }

    #[test]
    fn bad_fd_is_ebadf() {
        let table = FdTable::new();
        assert_eq!(table.get(7).unwrap_err().errno, Errno::EBADF);
        assert_eq!(table.remove(7).unwrap_err().errno, Errno::EBADF);
    }

    #[test]
    fn closed_open_file_rejects_handle_access() {
        let fs = MemFs::new();
        let of = open_file(&fs, "/f");
        assert!(of.handle().is_ok());
        assert!(of.mark_closed());
        assert!(!of.mark_closed());
        assert_eq!(of.handle().unwrap_err().errno, Errno::EBADF);
    }
}
