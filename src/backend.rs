//! The contract the VFS requires of each storage backend.
//!
//! Backends implement the sync methods; every method has an `_async` twin
//! whose default body calls the sync side, so a synchronous backend is
//! complete after implementing one set. An async-native backend (or an
//! adapter such as [`Mutexed`](crate::Mutexed)) overrides the twins.
//!
//! Paths handed to a backend are always absolute, normalized and local to
//! the backend's own root; mount-point translation happens in the VFS.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::flags::OpenFlag;
use crate::stats::StatFs;
use crate::stats::Stats;

/// Optional capabilities a backend can advertise.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Feature {
    /// The backend applies setuid/setgid inheritance itself on create;
    /// without this the VFS applies it.
    SetId,
}

/// Static description of a backend.
#[derive(Clone, Debug)]
pub struct BackendMeta {
    /// Backend name, e.g. `"memfs"` or `"overlay"`.
    pub name: &'static str,
    /// True if the backend rejects all mutation.
    pub readonly: bool,
    /// Advertised capabilities.
    pub features: Vec<Feature>,
}

impl BackendMeta {
    /// Metadata for a writable backend with no extra features.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            readonly: false,
            features: Vec::new(),
        }
    }

    /// True if `feature` is advertised.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Ownership applied to nodes a backend creates on behalf of the VFS.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CreateContext {
    /// Owner uid for the new node.
    pub uid: u32,
    /// Owner gid for the new node.
    pub gid: u32,
}

/// Validation hook shared by backend option structs.
pub trait BackendOptions {
    /// Check the options for internal consistency before the backend is
    /// constructed.
    fn validate(&self) -> Result<()>;
}

/// An open file as seen by a backend.
///
/// Handles are positionless; the VFS keeps the per-descriptor position and
/// passes explicit offsets.
#[async_trait]
pub trait FileHandle: Send + Sync + fmt::Debug {
    /// Attributes of the open file.
    fn stat(&self) -> Result<Stats>;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `data` at `offset`, returning the count written.
    fn write(&self, data: &[u8], offset: u64) -> Result<usize>;

    /// Truncate or extend to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Change permission bits.
    fn chmod(&self, mode: u32) -> Result<()>;

    /// Change ownership.
    fn chown(&self, uid: u32, gid: u32) -> Result<()>;

    /// Set access and modification times, in ms since the epoch.
    fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> Result<()>;

    /// Flush data and metadata.
    fn sync(&self) -> Result<()>;

    /// Flush file data only.
    fn datasync(&self) -> Result<()> {
        self.sync()
    }

    /// Release the handle. Backends must tolerate repeated closes.
    fn close(&self) -> Result<()>;

    /// Async twin of [`stat`](Self::stat).
    async fn stat_async(&self) -> Result<Stats> {
        self.stat()
    }

    /// Async twin of [`read`](Self::read).
    async fn read_async(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read(buf, offset)
    }

    /// Async twin of [`write`](Self::write).
    async fn write_async(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.write(data, offset)
    }

    /// Async twin of [`truncate`](Self::truncate).
    async fn truncate_async(&self, len: u64) -> Result<()> {
        self.truncate(len)
    }

    /// Async twin of [`chmod`](Self::chmod).
    async fn chmod_async(&self, mode: u32) -> Result<()> {
        self.chmod(mode)
    }

    /// Async twin of [`chown`](Self::chown).
    async fn chown_async(&self, uid: u32, gid: u32) -> Result<()> {
        self.chown(uid, gid)
    }

    /// Async twin of [`utimes`](Self::utimes).
    async fn utimes_async(&self, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        self.utimes(atime_ms, mtime_ms)
    }

    /// Async twin of [`sync`](Self::sync).
    async fn sync_async(&self) -> Result<()> {
        self.sync()
    }

    /// Async twin of [`datasync`](Self::datasync).
    async fn datasync_async(&self) -> Result<()> {
        self.datasync()
    }

    /// Async twin of [`close`](Self::close).
    async fn close_async(&self) -> Result<()> {
        self.close()
    }
}

/// A storage backend mountable into the VFS namespace.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Static description of this backend.
    fn meta(&self) -> BackendMeta;

    /// Completes once the backend is usable. Defaults to immediately ready.
    fn ready(&self) -> Result<()> {
        Ok(())
    }

    /// Attributes of the node at `path`.
    fn stat(&self, path: &str) -> Result<Stats>;

    /// Open an existing file.
    fn open_file(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>>;

    /// Create a file (the parent must exist) and return an open handle.
    /// `mode` carries both type and permission bits.
    fn create_file(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>>;

    /// True if a node exists at `path`. Defaults to a stat probe.
    fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move a node. Both paths are local to this backend.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a file or symlink.
    fn unlink(&self, path: &str) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &str) -> Result<()>;

    /// Create a directory. The parent must exist.
    fn mkdir(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()>;

    /// Basenames of the entries in the directory at `path`, in backend
    /// order.
    fn readdir(&self, path: &str) -> Result<Vec<String>>;

    /// Create a hard link. Backends without hard links report `ENOTSUP`.
    fn link(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(FsError::new(Errno::ENOTSUP).with_syscall("link"))
    }

    /// Replace the contents and attributes of `path` wholesale. Used by
    /// layered backends to materialize preloaded data.
    fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()>;

    /// Usage statistics. Defaults to the synthetic all-zero answer.
    fn statfs(&self, _path: &str) -> Result<StatFs> {
        Ok(StatFs::synthetic())
    }

    /// Async twin of [`ready`](Self::ready).
    async fn ready_async(&self) -> Result<()> {
        self.ready()
    }

    /// Async twin of [`stat`](Self::stat).
    async fn stat_async(&self, path: &str) -> Result<Stats> {
        self.stat(path)
    }

    /// Async twin of [`open_file`](Self::open_file).
    async fn open_file_async(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        self.open_file(path, flag)
    }

    /// Async twin of [`create_file`](Self::create_file).
    async fn create_file_async(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        self.create_file(path, flag, mode, ctx)
    }

    /// Async twin of [`exists`](Self::exists).
    async fn exists_async(&self, path: &str) -> Result<bool> {
        match self.stat_async(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Async twin of [`rename`](Self::rename).
    async fn rename_async(&self, from: &str, to: &str) -> Result<()> {
        self.rename(from, to)
    }

    /// Async twin of [`unlink`](Self::unlink).
    async fn unlink_async(&self, path: &str) -> Result<()> {
        self.unlink(path)
    }

    /// Async twin of [`rmdir`](Self::rmdir).
    async fn rmdir_async(&self, path: &str) -> Result<()> {
        self.rmdir(path)
    }

    /// Async twin of [`mkdir`](Self::mkdir).
    async fn mkdir_async(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        self.mkdir(path, mode, ctx)
    }

    /// Async twin of [`readdir`](Self::readdir).
    async fn readdir_async(&self, path: &str) -> Result<Vec<String>> {
        self.readdir(path)
    }

    /// Async twin of [`link`](Self::link).
    async fn link_async(&self, src: &str, dst: &str) -> Result<()> {
        self.link(src, dst)
    }

    /// Async twin of [`sync`](Self::sync).
    async fn sync_async(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        self.sync(path, data, stats)
    }

    /// Async twin of [`statfs`](Self::statfs).
    async fn statfs_async(&self, path: &str) -> Result<StatFs> {
        self.statfs(path)
    }
}
