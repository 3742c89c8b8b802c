//! In-process virtual file system with mountable storage backends.
//!
//! A [`Vfs`] presents one POSIX-like namespace over any number of
//! [`Backend`] implementations mounted at different points. The dispatch
//! layer normalizes paths, resolves symlinks across mount boundaries,
//! enforces permission bits against the caller's [`Credentials`], keeps the
//! descriptor table, and delivers change notifications through a
//! [`Watcher`].
//!
//! Both a blocking surface and an `async` surface are exposed over the same
//! operations; backends implement a sync method set and may override the
//! `_async` twins when they are natively asynchronous. [`Mutexed`]
//! serializes all calls to a backend so composed operations stay atomic,
//! and [`Overlay`] layers a writable backend over a read-only one with a
//! persisted deletion log.
//!
//! ```
//! use mountfs::{MkdirOptions, Vfs};
//!
//! let fs = Vfs::new();
//! fs.mkdir("/etc", MkdirOptions::default()).unwrap();
//! fs.write_file("/etc/motd", b"hello\n").unwrap();
//! assert_eq!(fs.read_file_to_string("/etc/motd").unwrap(), "hello\n");
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::backend::Backend;
pub use crate::backend::BackendMeta;
pub use crate::backend::BackendOptions;
pub use crate::backend::CreateContext;
pub use crate::backend::Feature;
pub use crate::backend::FileHandle;
pub use crate::errno::Errno;
pub use crate::errno::FsError;
pub use crate::errno::Result;
pub use crate::fd::Fd;
pub use crate::fd::FdTable;
pub use crate::fd::OpenFile;
pub use crate::flags::AccessFlags;
pub use crate::flags::OpenFlag;
pub use crate::handle::File;
pub use crate::memfs::MemFs;
pub use crate::memfs::MemFsOptions;
pub use crate::mount::MountTable;
pub use crate::mount::Resolved;
pub use crate::mutex::Lock;
pub use crate::mutex::Mutexed;
pub use crate::mutex::DEFAULT_LOCK_DEADLINE;
pub use crate::overlay::Overlay;
pub use crate::overlay::OverlayOptions;
pub use crate::overlay::DELETION_LOG_PATH;
pub use crate::stats::check_access;
pub use crate::stats::creation_gid;
pub use crate::stats::now_ms;
pub use crate::stats::Credentials;
pub use crate::stats::FileType;
pub use crate::stats::StatFs;
pub use crate::stats::Stats;
pub use crate::stats::BLOCK_SIZE;
pub use crate::stats::DEFAULT_DIR_MODE;
pub use crate::stats::DEFAULT_FILE_MODE;
pub use crate::stats::SYMLINK_MODE;
pub use crate::vfs::CopyFileOptions;
pub use crate::vfs::CpOptions;
pub use crate::vfs::Dir;
pub use crate::vfs::Dirent;
pub use crate::vfs::MkdirOptions;
pub use crate::vfs::ReaddirOptions;
pub use crate::vfs::RmOptions;
pub use crate::vfs::SymlinkType;
pub use crate::vfs::Vfs;
pub use crate::vfs::WriteFileOptions;
pub use crate::watch::WatchEvent;
pub use crate::watch::WatchEventType;
pub use crate::watch::Watcher;
pub use crate::watch::WatcherBus;

mod backend;
mod errno;
mod fd;
mod flags;
mod glob;
mod handle;
mod memfs;
mod mount;
mod mutex;
mod overlay;
mod path;
mod stats;
mod vfs;
mod vfs_async;
mod watch;

/// Path-string helpers used by the dispatch layer; exposed for backends
/// that need the same lexical rules.
pub mod paths {
    pub use crate::path::basename;
    pub use crate::path::components;
    pub use crate::path::dirname;
    pub use crate::path::is_within;
    pub use crate::path::join;
    pub use crate::path::normalize;
}
