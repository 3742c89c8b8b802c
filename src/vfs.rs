//! The VFS dispatch layer: a path-based POSIX-like surface over mounted
//! backends.
//!
//! Every operation normalizes its path, resolves symlinks where the
//! operation follows them, picks the owning backend by longest mount-point
//! prefix, rewrites the path to backend-local form, performs permission
//! checks against the caller's credentials, and finally calls the backend.
//! Backend errors are remapped so their `path` never leaks the local form.
//!
//! The async twins of this surface live in `vfs_async.rs`; both surfaces
//! share the tables owned by [`Vfs`].

use std::sync::Arc;

use log::debug;
use log::warn;
use parking_lot::RwLock;

use crate::backend::Backend;
use crate::backend::CreateContext;
use crate::backend::Feature;
use crate::backend::FileHandle;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::fd::Fd;
use crate::fd::FdTable;
use crate::fd::OpenFile;
use crate::flags::AccessFlags;
use crate::flags::OpenFlag;
use crate::glob;
use crate::handle::File;
use crate::mount::MountTable;
use crate::mount::Resolved;
use crate::path;
use crate::stats::creation_gid;
use crate::stats::Credentials;
use crate::stats::FileType;
use crate::stats::StatFs;
use crate::stats::Stats;
use crate::stats::DEFAULT_DIR_MODE;
use crate::stats::DEFAULT_FILE_MODE;
use crate::stats::SYMLINK_MODE;
use crate::watch::Watcher;
use crate::watch::WatcherBus;
use crate::watch::WatchEventType;
use crate::memfs::MemFs;

/// Maximum symlink traversals before `realpath` fails `ELOOP`.
const MAX_LINK_DEPTH: u32 = 40;

/// Kind hint accepted by [`Vfs::symlink`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymlinkType {
    /// Link to a file.
    File,
    /// Link to a directory.
    Dir,
    /// Windows junction; accepted for API compatibility.
    Junction,
}

impl SymlinkType {
    /// Parse the Node-style type string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(SymlinkType::File),
            "dir" => Ok(SymlinkType::Dir),
            "junction" => Ok(SymlinkType::Junction),
            _ => Err(FsError::new(Errno::EINVAL).with_syscall("symlink")),
        }
    }
}

/// Options for [`Vfs::write_file`] and [`Vfs::append_file`].
#[derive(Clone, Copy, Debug)]
pub struct WriteFileOptions {
    /// Open flag string, `"w"` by default.
    pub flag: &'static str,
    /// Creation mode for a new file.
    pub mode: u32,
}

impl Default for WriteFileOptions {
    fn default() -> Self {
        Self {
            flag: "w",
            mode: DEFAULT_FILE_MODE,
        }
    }
}

/// Options for [`Vfs::mkdir`].
#[derive(Clone, Copy, Debug)]
pub struct MkdirOptions {
    /// Create missing ancestors as well.
    pub recursive: bool,
    /// Mode for every directory created.
    pub mode: u32,
}

impl Default for MkdirOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            mode: DEFAULT_DIR_MODE,
        }
    }
}

/// Options for [`Vfs::readdir_with_options`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReaddirOptions {
    /// Descend into subdirectories, yielding paths relative to the root of
    /// the listing.
    pub recursive: bool,
}

/// Options for [`Vfs::rm`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RmOptions {
    /// Remove directories and their contents.
    pub recursive: bool,
    /// Ignore a missing target.
    pub force: bool,
}

/// Options for [`Vfs::copy_file`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyFileOptions {
    /// Fail `EEXIST` when the destination already exists.
    pub exclusive: bool,
}

/// Options for [`Vfs::cp`].
#[derive(Clone, Default)]
pub struct CpOptions {
    /// Copy directories recursively.
    pub recursive: bool,
    /// Fail `EEXIST` when the destination exists.
    pub error_on_exist: bool,
    /// Copy atime/mtime along with contents.
    pub preserve_timestamps: bool,
    /// Follow symlinks in the source tree instead of copying the links.
    pub dereference: bool,
    /// Per-path predicate; paths for which it returns false are skipped.
    #[allow(clippy::type_complexity)]
    pub filter: Option<Arc<dyn Fn(&str, &str) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for CpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpOptions")
            .field("recursive", &self.recursive)
            .field("error_on_exist", &self.error_on_exist)
            .field("preserve_timestamps", &self.preserve_timestamps)
            .field("dereference", &self.dereference)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// A directory entry with its file type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dirent {
    /// Entry name; a relative path for recursive listings.
    pub name: String,
    /// The entry's type.
    pub file_type: FileType,
}

impl Dirent {
    /// True if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// True if the entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::RegularFile
    }

    /// True if the entry is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// A snapshot directory reader, the result of [`Vfs::opendir`].
#[derive(Debug)]
pub struct Dir {
    entries: Vec<Dirent>,
    next: usize,
}

impl Dir {
    /// The next entry, or `None` at the end of the directory.
    pub fn read(&mut self) -> Option<Dirent> {
        let entry = self.entries.get(self.next).cloned();
        if entry.is_some() {
            self.next += 1;
        }
        entry
    }
}

impl Iterator for Dir {
    type Item = Dirent;

    fn next(&mut self) -> Option<Dirent> {
        self.read()
    }
}

pub(crate) struct VfsInner {
    pub(crate) mounts: MountTable,
    pub(crate) fds: FdTable,
    pub(crate) watchers: Arc<WatcherBus>,
    pub(crate) cred: RwLock<Credentials>,
    mkdtemp_seq: std::sync::atomic::AtomicU64,
}

impl VfsInner {
    pub(crate) fn credentials(&self) -> Credentials {
        *self.cred.read()
    }

    pub(crate) fn emit(&self, kind: WatchEventType, path: &str) {
        self.watchers.emit(kind, path);
    }
}

/// The virtual file system: one namespace, one descriptor table, one
/// watcher bus.
///
/// `Vfs` is cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Vfs {
    pub(crate) inner: Arc<VfsInner>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("mounts", &self.inner.mounts)
            .field("open_fds", &self.inner.fds.len())
            .finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// A namespace rooted in a fresh in-memory backend.
    pub fn new() -> Self {
        Self::with_root(Arc::new(MemFs::new()))
    }

    /// A namespace rooted in `root`.
    pub fn with_root(root: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(VfsInner {
                mounts: MountTable::new(root),
                fds: FdTable::new(),
                watchers: Arc::new(WatcherBus::new()),
                cred: RwLock::new(Credentials::default()),
                mkdtemp_seq: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// The credentials operations run under.
    pub fn credentials(&self) -> Credentials {
        self.inner.credentials()
    }

    /// Change the credentials for subsequent operations.
    pub fn set_credentials(&self, cred: Credentials) {
        *self.inner.cred.write() = cred;
    }

    // ------------------------------------------------------------------
    // Mounting
    // ------------------------------------------------------------------

    /// Splice `backend` into the namespace at `point`.
    ///
    /// The parent of the mount point must already exist as a directory;
    /// mounting never creates it.
    pub fn mount(&self, point: &str, backend: Arc<dyn Backend>) -> Result<()> {
        let point = path::normalize(point)?;
        backend.ready()?;
        if point != "/" {
            let parent = self.stat(path::dirname(&point))?;
            if !parent.is_dir() {
                return Err(err(Errno::ENOTDIR, "mount", &point));
            }
        }
        debug!("mount {} at {point}", backend.meta().name);
        self.inner.mounts.mount(&point, backend)
    }

    /// Remove the mount at `point`.
    pub fn umount(&self, point: &str) -> Result<()> {
        let point = path::normalize(point)?;
        debug!("umount {point}");
        self.inner.mounts.umount(&point).map(|_| ())
    }

    /// Snapshot of `(mount_point, backend)` pairs in resolution order.
    pub fn mounts(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.inner.mounts.snapshot()
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    pub(crate) fn resolve(&self, p: &str) -> Result<Resolved> {
        self.inner.mounts.resolve(p)
    }

    /// Stat without symlink resolution on any component; `p` must already
    /// be normalized.
    fn stat_raw(&self, p: &str) -> Result<Stats> {
        let resolved = self.resolve(p)?;
        resolved
            .backend
            .stat(&resolved.local_path)
            .map_err(|e| e.remap_paths(&resolved.error_paths(p)).or_path(p))
    }

    /// Read the target of the symlink node at `p` (already normalized, not
    /// followed).
    fn read_link_raw(&self, p: &str) -> Result<String> {
        let resolved = self.resolve(p)?;
        let stats = resolved.backend.stat(&resolved.local_path)?;
        let handle = resolved
            .backend
            .open_file(&resolved.local_path, OpenFlag::parse("r")?)?;
        let mut buf = vec![0u8; stats.size as usize];
        let n = handle.read(&mut buf, 0)?;
        buf.truncate(n);
        handle.close()?;
        String::from_utf8(buf).map_err(|_| err(Errno::EINVAL, "readlink", p))
    }

    fn realpath_at(&self, p: &str, depth: u32) -> Result<String> {
        if depth > MAX_LINK_DEPTH {
            return Err(err(Errno::ELOOP, "realpath", p));
        }
        let p = path::normalize(p)?;
        if p == "/" {
            return Ok(p);
        }
        let dir = self.realpath_at(path::dirname(&p), depth + 1)?;
        let joined = path::join(&dir, path::basename(&p))?;
        let stats = match self.stat_raw(&joined) {
            // A missing node resolves to itself so `open("w")` can create
            // through the resolved parent.
            Err(e) if e.is_not_found() => return Ok(joined),
            Err(e) => return Err(e),
            Ok(stats) => stats,
        };
        if !stats.is_symlink() {
            return Ok(joined);
        }
        let target = self.read_link_raw(&joined)?;
        let target = path::join(path::dirname(&joined), &target)?;
        self.realpath_at(&target, depth + 1)
    }

    /// Canonical absolute path with every symlink resolved.
    pub fn realpath(&self, p: &str) -> Result<String> {
        self.realpath_at(p, 0)
    }

    /// Resolve every component but the last; the path `lstat` and other
    /// no-follow operations address.
    fn resolve_no_follow(&self, p: &str) -> Result<String> {
        let p = path::normalize(p)?;
        if p == "/" {
            return Ok(p);
        }
        let dir = self.realpath_at(path::dirname(&p), 0)?;
        path::join(&dir, path::basename(&p))
    }

    pub(crate) fn check_access_at(
        &self,
        stats: &Stats,
        mask: AccessFlags,
        syscall: &'static str,
        p: &str,
    ) -> Result<()> {
        if !stats.has_access(self.credentials(), mask) {
            return Err(err(Errno::EACCES, syscall, p));
        }
        Ok(())
    }

    /// Stat the parent of `p` and require a writable directory.
    fn writable_parent(&self, p: &str, syscall: &'static str) -> Result<Stats> {
        let parent = path::dirname(p);
        let stats = self
            .stat_raw(parent)
            .map_err(|e| if e.is_not_found() { err(Errno::ENOENT, syscall, p) } else { e })?;
        if !stats.is_dir() {
            return Err(err(Errno::ENOTDIR, syscall, p));
        }
        self.check_access_at(&stats, AccessFlags::W_OK, syscall, p)?;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // The open protocol
    // ------------------------------------------------------------------

    fn open_inner(
        &self,
        p: &str,
        flag: OpenFlag,
        mode: u32,
        resolve_symlinks: bool,
    ) -> Result<(String, Arc<dyn FileHandle>)> {
        let p = if resolve_symlinks {
            self.realpath(p)?
        } else {
            self.resolve_no_follow(p)?
        };
        let resolved = self.resolve(&p)?;
        let remap = |e: FsError| e.remap_paths(&resolved.error_paths(&p));

        match resolved.backend.stat(&resolved.local_path) {
            Err(e) if e.is_not_found() => {
                if !flag.may_create() {
                    return Err(err(Errno::ENOENT, "open", &p));
                }
                let parent = self.writable_parent(&p, "open")?;
                let cred = self.credentials();
                let ctx = CreateContext {
                    uid: cred.uid,
                    gid: creation_gid(&parent, cred.gid),
                };
                let file_mode = if mode & libc::S_IFMT as u32 != 0 {
                    mode
                } else {
                    libc::S_IFREG as u32 | (mode & 0o7777)
                };
                let handle = resolved
                    .backend
                    .create_file(&resolved.local_path, flag, file_mode, ctx)
                    .map_err(remap)?;
                // Without the setid feature the backend only records what
                // it is told, so enforce the inherited ownership here.
                if !resolved.backend.meta().has_feature(Feature::SetId)
                    && parent.mode & libc::S_ISGID as u32 != 0
                {
                    handle.chown(cred.uid, parent.gid).map_err(remap)?;
                }
                self.inner.emit(WatchEventType::Rename, &p);
                Ok((p, handle))
            }
            Err(e) => Err(remap(e)),
            Ok(stats) => {
                self.check_access_at(&stats, flag.access_mask(), "open", &p)?;
                if flag.exclusive {
                    return Err(err(Errno::EEXIST, "open", &p));
                }
                let handle = resolved
                    .backend
                    .open_file(&resolved.local_path, flag)
                    .map_err(remap)?;
                if flag.truncate {
                    handle.truncate(0).map_err(remap)?;
                    self.inner.emit(WatchEventType::Change, &p);
                }
                Ok((p, handle))
            }
        }
    }

    /// Open a file, returning its descriptor.
    pub fn open_fd(&self, p: &str, flag: &str, mode: u32) -> Result<Fd> {
        let flag = OpenFlag::parse(flag)?;
        let (p, handle) = self.open_inner(p, flag, mode, true)?;
        let file = Arc::new(OpenFile::new(p, flag, handle));
        Ok(self.inner.fds.insert(file))
    }

    /// Open a file, returning the high-level [`File`] object.
    pub fn open(&self, p: &str, flag: &str) -> Result<File> {
        self.open_with_mode(p, flag, DEFAULT_FILE_MODE)
    }

    /// Open with an explicit creation mode.
    pub fn open_with_mode(&self, p: &str, flag: &str, mode: u32) -> Result<File> {
        let fd = self.open_fd(p, flag, mode)?;
        let file = self.inner.fds.get(fd)?;
        Ok(File::new(self.inner.clone(), fd, file))
    }

    // ------------------------------------------------------------------
    // Whole-file reads and writes
    // ------------------------------------------------------------------

    /// Read the entire file at `p`.
    pub fn read_file(&self, p: &str) -> Result<Vec<u8>> {
        let file = self.open(p, "r")?;
        let stats = file.stat()?;
        let mut buf = vec![0u8; stats.size as usize];
        let n = file.read(&mut buf, Some(0))?;
        buf.truncate(n);
        file.close()?;
        Ok(buf)
    }

    /// Read the file at `p` as UTF-8.
    pub fn read_file_to_string(&self, p: &str) -> Result<String> {
        String::from_utf8(self.read_file(p)?).map_err(|_| err(Errno::EINVAL, "read", p))
    }

    /// Replace the contents of `p` with `data`.
    pub fn write_file(&self, p: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_options(p, data, WriteFileOptions::default())
    }

    /// Write with an explicit flag and creation mode.
    pub fn write_file_with_options(
        &self,
        p: &str,
        data: &[u8],
        options: WriteFileOptions,
    ) -> Result<()> {
        let flag = OpenFlag::parse(options.flag)?;
        if !flag.writable && !flag.appendable {
            return Err(err(Errno::EINVAL, "write", p));
        }
        let file = self.open_with_mode(p, options.flag, options.mode)?;
        file.write(data, Some(0))?;
        file.close()
    }

    /// Append `data` to the file at `p`, creating it if missing.
    pub fn append_file(&self, p: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_options(
            p,
            data,
            WriteFileOptions {
                flag: "a",
                mode: DEFAULT_FILE_MODE,
            },
        )
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Attributes of the node at `p`, following symlinks.
    pub fn stat(&self, p: &str) -> Result<Stats> {
        let p = self.realpath(p)?;
        self.stat_raw(&p)
    }

    /// Attributes of the node at `p` itself, not following a final
    /// symlink.
    pub fn lstat(&self, p: &str) -> Result<Stats> {
        let p = self.resolve_no_follow(p)?;
        self.stat_raw(&p)
    }

    /// True if a node exists at `p`. Never raises for a missing or
    /// dangling path.
    pub fn exists(&self, p: &str) -> Result<bool> {
        match self.stat(p) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Verify the caller may access `p` with `mask`.
    pub fn access(&self, p: &str, mask: AccessFlags) -> Result<()> {
        let stats = self.stat(p)?;
        self.check_access_at(&stats, mask, "access", &path::normalize(p)?)
    }

    /// Truncate the file at `p` to `len` bytes.
    pub fn truncate(&self, p: &str, len: u64) -> Result<()> {
        let file = self.open(p, "r+")?;
        file.truncate(len)?;
        file.close()
    }

    /// File system statistics for the mount owning `p`.
    pub fn statfs(&self, p: &str) -> Result<StatFs> {
        let p = self.realpath(p)?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .statfs(&resolved.local_path)
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))
    }

    fn apply_to_handle<F>(&self, p: &str, follow: bool, f: F) -> Result<()>
    where
        F: FnOnce(&Arc<dyn FileHandle>) -> Result<()>,
    {
        let p = if follow {
            self.realpath(p)?
        } else {
            self.resolve_no_follow(p)?
        };
        let resolved = self.resolve(&p)?;
        let remap = |e: FsError| e.remap_paths(&resolved.error_paths(&p));
        // Probe first so a missing node surfaces as ENOENT rather than a
        // backend open failure.
        resolved.backend.stat(&resolved.local_path).map_err(remap)?;
        let handle = resolved
            .backend
            .open_file(&resolved.local_path, OpenFlag::parse("r")?)
            .map_err(remap)?;
        let result = f(&handle).map_err(remap);
        handle.close()?;
        result?;
        self.inner.emit(WatchEventType::Change, &p);
        Ok(())
    }

    fn require_owner(&self, stats: &Stats, syscall: &'static str, p: &str) -> Result<()> {
        let cred = self.credentials();
        if cred.uid != 0 && cred.uid != stats.uid {
            return Err(err(Errno::EPERM, syscall, p));
        }
        Ok(())
    }

    /// Change permission bits, following symlinks.
    pub fn chmod(&self, p: &str, mode: u32) -> Result<()> {
        let stats = self.stat(p)?;
        self.require_owner(&stats, "chmod", p)?;
        self.apply_to_handle(p, true, |h| h.chmod(mode))
    }

    /// Change permission bits of the link itself.
    pub fn lchmod(&self, p: &str, mode: u32) -> Result<()> {
        let stats = self.lstat(p)?;
        self.require_owner(&stats, "chmod", p)?;
        self.apply_to_handle(p, false, |h| h.chmod(mode))
    }

    /// Change ownership, following symlinks. Only root may change the
    /// owner.
    pub fn chown(&self, p: &str, uid: u32, gid: u32) -> Result<()> {
        let stats = self.stat(p)?;
        let cred = self.credentials();
        if cred.uid != 0 && !(stats.uid == uid && cred.uid == stats.uid) {
            return Err(err(Errno::EPERM, "chown", p));
        }
        self.apply_to_handle(p, true, |h| h.chown(uid, gid))
    }

    /// Change ownership of the link itself.
    pub fn lchown(&self, p: &str, uid: u32, gid: u32) -> Result<()> {
        let stats = self.lstat(p)?;
        let cred = self.credentials();
        if cred.uid != 0 && !(stats.uid == uid && cred.uid == stats.uid) {
            return Err(err(Errno::EPERM, "chown", p));
        }
        self.apply_to_handle(p, false, |h| h.chown(uid, gid))
    }

    /// Set access and modification times, following symlinks.
    pub fn utimes(&self, p: &str, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let stats = self.stat(p)?;
        self.require_owner(&stats, "utimes", p)?;
        self.apply_to_handle(p, true, |h| h.utimes(atime_ms, mtime_ms))
    }

    /// Set times of the link itself.
    pub fn lutimes(&self, p: &str, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let stats = self.lstat(p)?;
        self.require_owner(&stats, "utimes", p)?;
        self.apply_to_handle(p, false, |h| h.utimes(atime_ms, mtime_ms))
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    /// Create a directory.
    ///
    /// With `recursive` every missing ancestor is created too and the path
    /// of the first directory created is returned; an existing target is
    /// then a no-op answered with `None`.
    pub fn mkdir(&self, p: &str, options: MkdirOptions) -> Result<Option<String>> {
        let p = self.resolve_no_follow(p)?;
        if options.recursive {
            let mut missing = Vec::new();
            let mut probe = p.clone();
            loop {
                match self.stat_raw(&probe) {
                    Ok(stats) => {
                        if !stats.is_dir() {
                            return Err(err(Errno::ENOTDIR, "mkdir", &probe));
                        }
                        break;
                    }
                    Err(e) if e.is_not_found() => {
                        missing.push(probe.clone());
                        if probe == "/" {
                            break;
                        }
                        probe = path::dirname(&probe).to_string();
                    }
                    Err(e) => return Err(e),
                }
            }
            let first_created = missing.last().cloned();
            for dir in missing.into_iter().rev() {
                self.mkdir_one(&dir, options.mode)?;
            }
            Ok(first_created)
        } else {
            self.mkdir_one(&p, options.mode)?;
            Ok(Some(p))
        }
    }

    fn mkdir_one(&self, p: &str, mode: u32) -> Result<()> {
        let parent = self.writable_parent(p, "mkdir")?;
        let resolved = self.resolve(p)?;
        let cred = self.credentials();
        let ctx = CreateContext {
            uid: cred.uid,
            gid: creation_gid(&parent, cred.gid),
        };
        let mut mode = mode & 0o7777;
        // Directories inherit setgid from their parent.
        if parent.mode & libc::S_ISGID as u32 != 0 {
            mode |= libc::S_ISGID as u32;
        }
        resolved
            .backend
            .mkdir(&resolved.local_path, mode, ctx)
            .map_err(|e| e.remap_paths(&resolved.error_paths(p)))?;
        self.inner.emit(WatchEventType::Rename, p);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, p: &str) -> Result<()> {
        let p = self.resolve_no_follow(p)?;
        self.writable_parent(&p, "rmdir")?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .rmdir(&resolved.local_path)
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        self.inner.emit(WatchEventType::Rename, &p);
        Ok(())
    }

    /// Basenames of the entries at `p`, in backend order, unioned with the
    /// basenames of child mounts.
    pub fn readdir(&self, p: &str) -> Result<Vec<String>> {
        let p = self.realpath(p)?;
        let stats = self.stat_raw(&p)?;
        if !stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "readdir", &p));
        }
        self.check_access_at(&stats, AccessFlags::R_OK, "readdir", &p)?;
        let resolved = self.resolve(&p)?;
        let mut entries = resolved
            .backend
            .readdir(&resolved.local_path)
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        for mount_name in self.inner.mounts.child_mounts(&p) {
            if !entries.contains(&mount_name) {
                entries.push(mount_name);
            }
        }
        Ok(entries)
    }

    /// Directory entries with file types; optionally recursive.
    pub fn readdir_with_options(
        &self,
        p: &str,
        options: ReaddirOptions,
    ) -> Result<Vec<Dirent>> {
        let root = self.realpath(p)?;
        let mut out = Vec::new();
        self.readdir_ents_into(&root, "", options.recursive, &mut out)?;
        Ok(out)
    }

    fn readdir_ents_into(
        &self,
        root: &str,
        prefix: &str,
        recursive: bool,
        out: &mut Vec<Dirent>,
    ) -> Result<()> {
        let dir = path::join(root, prefix)?;
        for name in self.readdir(&dir)? {
            let rel = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let child = path::join(root, &rel)?;
            let stats = self.lstat(&child)?;
            let file_type = stats.file_type();
            out.push(Dirent {
                name: rel.clone(),
                file_type,
            });
            if recursive && file_type == FileType::Directory {
                self.readdir_ents_into(root, &rel, recursive, out)?;
            }
        }
        Ok(())
    }

    /// Open a snapshot directory reader.
    pub fn opendir(&self, p: &str) -> Result<Dir> {
        let entries = self.readdir_with_options(p, ReaddirOptions::default())?;
        Ok(Dir { entries, next: 0 })
    }

    /// Create a uniquely named directory starting with `prefix` and return
    /// its path.
    pub fn mkdtemp(&self, prefix: &str) -> Result<String> {
        let base = path::normalize(prefix)?;
        loop {
            let nonce = self
                .inner
                .mkdtemp_seq
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                .wrapping_add(crate::stats::now_ms() as u64);
            let mut suffix = String::new();
            let mut value = nonce;
            for _ in 0..6 {
                let digit = (value % 36) as u32;
                suffix.push(char::from_digit(digit, 36).unwrap_or('0'));
                value /= 36;
            }
            let candidate = format!("{base}{suffix}");
            match self.mkdir(
                &candidate,
                MkdirOptions {
                    recursive: false,
                    mode: 0o700,
                },
            ) {
                Ok(_) => return Ok(candidate),
                Err(e) if e.errno == Errno::EEXIST => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Create a hard link. Fails `EXDEV` when `src` and `dst` resolve to
    /// different mounts.
    pub fn link(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.resolve_no_follow(src)?;
        let dst = self.resolve_no_follow(dst)?;
        let src_resolved = self.resolve(&src)?;
        let dst_resolved = self.resolve(&dst)?;
        if src_resolved.mount_point != dst_resolved.mount_point {
            return Err(err(Errno::EXDEV, "link", &dst));
        }
        self.writable_parent(&dst, "link")?;
        src_resolved
            .backend
            .link(&src_resolved.local_path, &dst_resolved.local_path)
            .map_err(|e| {
                e.remap_paths(&[
                    (src_resolved.local_path.as_str(), src.as_str()),
                    (dst_resolved.local_path.as_str(), dst.as_str()),
                ])
            })?;
        self.inner.emit(WatchEventType::Rename, &dst);
        Ok(())
    }

    /// Create a symbolic link at `p` pointing at `target`.
    pub fn symlink(&self, target: &str, p: &str, kind: SymlinkType) -> Result<()> {
        let _ = kind;
        if target.is_empty() || target.contains('\0') {
            return Err(err(Errno::EINVAL, "symlink", p));
        }
        let p = self.resolve_no_follow(p)?;
        if self.stat_raw(&p).is_ok() {
            return Err(err(Errno::EEXIST, "symlink", &p));
        }
        let flag = OpenFlag::parse("wx")?;
        // open_inner emits the creation event itself.
        let (_, handle) = self.open_inner(&p, flag, SYMLINK_MODE, false)?;
        let result = handle.write(target.as_bytes(), 0);
        handle.close()?;
        result?;
        Ok(())
    }

    /// Read the target of the symlink at `p`. A non-symlink target fails
    /// `EINVAL`.
    pub fn readlink(&self, p: &str) -> Result<String> {
        let p = self.resolve_no_follow(p)?;
        let stats = self.stat_raw(&p)?;
        if !stats.is_symlink() {
            return Err(err(Errno::EINVAL, "readlink", &p));
        }
        self.read_link_raw(&p)
    }

    // ------------------------------------------------------------------
    // Removal, rename, copy
    // ------------------------------------------------------------------

    /// Remove the file or symlink at `p`.
    pub fn unlink(&self, p: &str) -> Result<()> {
        let p = self.resolve_no_follow(p)?;
        self.writable_parent(&p, "unlink")?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .unlink(&resolved.local_path)
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        self.inner.emit(WatchEventType::Rename, &p);
        Ok(())
    }

    /// Move `old` to `new`. Within one mount the backend renames in place;
    /// across mounts the bytes are copied and the source unlinked.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = self.resolve_no_follow(old)?;
        let new = self.resolve_no_follow(new)?;
        let old_resolved = self.resolve(&old)?;
        let new_resolved = self.resolve(&new)?;
        self.writable_parent(&old, "rename")?;
        self.writable_parent(&new, "rename")?;

        if old_resolved.mount_point == new_resolved.mount_point {
            old_resolved
                .backend
                .rename(&old_resolved.local_path, &new_resolved.local_path)
                .map_err(|e| {
                    e.remap_paths(&[
                        (old_resolved.local_path.as_str(), old.as_str()),
                        (new_resolved.local_path.as_str(), new.as_str()),
                    ])
                })?;
        } else {
            let stats = self.lstat(&old)?;
            if stats.is_dir() {
                // Directory moves across mounts degrade to a recursive
                // copy followed by a recursive remove.
                self.cp(
                    &old,
                    &new,
                    CpOptions {
                        recursive: true,
                        ..CpOptions::default()
                    },
                )?;
                self.rm(
                    &old,
                    RmOptions {
                        recursive: true,
                        force: false,
                    },
                )?;
            } else {
                let data = self.read_file(&old)?;
                self.write_file(&new, &data)?;
                self.unlink(&old)?;
            }
        }
        self.inner.emit(WatchEventType::Rename, &old);
        self.inner.emit(WatchEventType::Change, &new);
        Ok(())
    }

    /// Copy a single file.
    pub fn copy_file(&self, src: &str, dst: &str, options: CopyFileOptions) -> Result<()> {
        let data = self.read_file(src)?;
        let stats = self.stat(src)?;
        let flag = if options.exclusive { "wx" } else { "w" };
        self.write_file_with_options(
            dst,
            &data,
            WriteFileOptions {
                flag,
                mode: stats.perm(),
            },
        )
    }

    /// Copy files and directory trees.
    pub fn cp(&self, src: &str, dst: &str, options: CpOptions) -> Result<()> {
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        self.cp_node(&src, &dst, &options)
    }

    fn cp_node(&self, src: &str, dst: &str, options: &CpOptions) -> Result<()> {
        if let Some(filter) = &options.filter {
            if !filter(src, dst) {
                return Ok(());
            }
        }
        let stats = if options.dereference {
            self.stat(src)?
        } else {
            self.lstat(src)?
        };

        if stats.is_dir() {
            if !options.recursive {
                return Err(err(Errno::EISDIR, "cp", src));
            }
            match self.mkdir(
                dst,
                MkdirOptions {
                    recursive: false,
                    mode: stats.perm(),
                },
            ) {
                Ok(_) => {}
                Err(e) if e.errno == Errno::EEXIST => {
                    if options.error_on_exist {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
            for name in self.readdir(src)? {
                let child_src = path::join(src, &name)?;
                let child_dst = path::join(dst, &name)?;
                self.cp_node(&child_src, &child_dst, options)?;
            }
        } else if stats.is_symlink() && !options.dereference {
            if self.exists(dst)? {
                if options.error_on_exist {
                    return Err(err(Errno::EEXIST, "cp", dst));
                }
                self.unlink(dst)?;
            }
            let target = self.readlink(src)?;
            self.symlink(&target, dst, SymlinkType::File)?;
        } else {
            if options.error_on_exist && self.exists(dst)? {
                return Err(err(Errno::EEXIST, "cp", dst));
            }
            self.copy_file(src, dst, CopyFileOptions::default())?;
        }

        if options.preserve_timestamps {
            self.utimes(dst, stats.atime_ms, stats.mtime_ms)?;
        }
        Ok(())
    }

    /// Remove the node at `p`; directories require `recursive`.
    pub fn rm(&self, p: &str, options: RmOptions) -> Result<()> {
        let p = match self.resolve_no_follow(p) {
            Ok(p) => p,
            Err(e) if e.is_not_found() && options.force => return Ok(()),
            Err(e) => return Err(e),
        };
        let stats = match self.stat_raw(&p) {
            Ok(stats) => stats,
            Err(e) if e.is_not_found() && options.force => return Ok(()),
            Err(e) => return Err(e),
        };
        if stats.is_dir() {
            if !options.recursive {
                return Err(err(Errno::EISDIR, "rm", &p));
            }
            for name in self.readdir(&p)? {
                let child = path::join(&p, &name)?;
                self.rm(&child, options)?;
            }
            self.rmdir(&p)?;
        } else {
            self.unlink(&p)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Watching and matching
    // ------------------------------------------------------------------

    /// Subscribe to change events at or below `p`.
    pub fn watch(&self, p: &str) -> Result<Watcher> {
        let p = path::normalize(p)?;
        Ok(self.inner.watchers.subscribe(&p))
    }

    /// Paths matching a glob pattern, from a full namespace walk.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        self.glob_walk("/", pattern, &mut out)?;
        Ok(out)
    }

    fn glob_walk(&self, dir: &str, pattern: &str, out: &mut Vec<String>) -> Result<()> {
        for name in self.readdir(dir)? {
            let child = path::join(dir, &name)?;
            if glob::matches(pattern, &child) {
                out.push(child.clone());
            }
            if let Ok(stats) = self.lstat(&child) {
                if stats.is_dir() {
                    self.glob_walk(&child, pattern, out)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descriptor operations
    // ------------------------------------------------------------------

    fn fd_file(&self, fd: Fd) -> Result<Arc<OpenFile>> {
        self.inner.fds.get(fd)
    }

    /// Close a descriptor. Closing an unknown descriptor fails `EBADF`.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let file = self.inner.fds.remove(fd)?;
        file.mark_closed();
        file.close_backend()
    }

    /// Attributes of an open descriptor.
    pub fn fstat(&self, fd: Fd) -> Result<Stats> {
        self.fd_file(fd)?.handle()?.stat()
    }

    /// Truncate an open descriptor.
    pub fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let file = self.fd_file(fd)?;
        file.handle()?.truncate(len)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(())
    }

    /// Flush data and metadata of an open descriptor.
    pub fn fsync(&self, fd: Fd) -> Result<()> {
        self.fd_file(fd)?.handle()?.sync()
    }

    /// Flush file data of an open descriptor.
    pub fn fdatasync(&self, fd: Fd) -> Result<()> {
        self.fd_file(fd)?.handle()?.datasync()
    }

    /// Read at `position`, or at (and advancing) the descriptor position
    /// when `position` is `None`.
    pub fn read(&self, fd: Fd, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
        let file = self.fd_file(fd)?;
        crate::handle::read_at(&file, buf, position)
    }

    /// Write at `position`, or at (and advancing) the descriptor position
    /// when `position` is `None`.
    pub fn write(&self, fd: Fd, data: &[u8], position: Option<u64>) -> Result<usize> {
        let file = self.fd_file(fd)?;
        let n = crate::handle::write_at(&file, data, position)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(n)
    }

    /// Scatter read into `bufs`.
    pub fn readv(&self, fd: Fd, bufs: &mut [&mut [u8]], position: Option<u64>) -> Result<usize> {
        let file = self.fd_file(fd)?;
        crate::handle::readv_at(&file, bufs, position)
    }

    /// Gather write from `bufs`.
    pub fn writev(&self, fd: Fd, bufs: &[&[u8]], position: Option<u64>) -> Result<usize> {
        let file = self.fd_file(fd)?;
        let n = crate::handle::writev_at(&file, bufs, position)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(n)
    }

    /// Change ownership through a descriptor.
    pub fn fchown(&self, fd: Fd, uid: u32, gid: u32) -> Result<()> {
        let file = self.fd_file(fd)?;
        file.handle()?.chown(uid, gid)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(())
    }

    /// Change permission bits through a descriptor.
    pub fn fchmod(&self, fd: Fd, mode: u32) -> Result<()> {
        let file = self.fd_file(fd)?;
        file.handle()?.chmod(mode)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(())
    }

    /// Set times through a descriptor.
    pub fn futimes(&self, fd: Fd, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let file = self.fd_file(fd)?;
        file.handle()?.utimes(atime_ms, mtime_ms)?;
        self.inner.emit(WatchEventType::Change, &file.path);
        Ok(())
    }
}

impl Drop for VfsInner {
    fn drop(&mut self) {
        for (fd, file) in self.fds.drain() {
            file.mark_closed();
            if let Err(e) = file.close_backend() {
                warn!("closing fd {fd} at exit failed: {e}");
            }
        }
    }
}
