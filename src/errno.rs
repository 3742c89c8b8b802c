//! POSIX error codes and the error object surfaced by every VFS operation.

use std::error;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io;

/// A POSIX errno value.
///
/// Wraps the raw integer so the crate never passes bare `i32` error codes
/// around. The associated constants cover every code the VFS itself raises;
/// backends may surface additional values through [`Errno::from_i32`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

impl Errno {
    /// Operation not permitted.
    pub const EPERM: Errno = Errno(libc::EPERM);
    /// No such file or directory.
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    /// Input/output error.
    pub const EIO: Errno = Errno(libc::EIO);
    /// Bad file descriptor.
    pub const EBADF: Errno = Errno(libc::EBADF);
    /// Permission denied.
    pub const EACCES: Errno = Errno(libc::EACCES);
    /// Device or resource busy.
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    /// File exists.
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    /// Invalid cross-device link.
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    /// Not a directory.
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    /// Is a directory.
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    /// Invalid argument.
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    /// File too large.
    pub const EFBIG: Errno = Errno(libc::EFBIG);
    /// No space left on device.
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    /// Resource deadlock avoided.
    pub const EDEADLK: Errno = Errno(libc::EDEADLK);
    /// Function not implemented.
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    /// Directory not empty.
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    /// Too many levels of symbolic links.
    pub const ELOOP: Errno = Errno(libc::ELOOP);
    /// Operation not supported.
    pub const ENOTSUP: Errno = Errno(libc::ENOTSUP);

    /// Raw errno value.
    pub fn code(self) -> libc::c_int {
        self.0
    }

    /// Wrap a raw errno value.
    pub fn from_i32(code: i32) -> Self {
        Errno(code)
    }

    /// The POSIX mnemonic for this code, e.g. `"ENOENT"`.
    pub fn name(self) -> &'static str {
        match self.0 {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EIO => "EIO",
            libc::EBADF => "EBADF",
            libc::EACCES => "EACCES",
            libc::EBUSY => "EBUSY",
            libc::EEXIST => "EEXIST",
            libc::EXDEV => "EXDEV",
            libc::ENOTDIR => "ENOTDIR",
            libc::EISDIR => "EISDIR",
            libc::EINVAL => "EINVAL",
            libc::EFBIG => "EFBIG",
            libc::ENOSPC => "ENOSPC",
            libc::EDEADLK => "EDEADLK",
            libc::ENOSYS => "ENOSYS",
            libc::ENOTEMPTY => "ENOTEMPTY",
            libc::ELOOP => "ELOOP",
            libc::ENOTSUP => "ENOTSUP",
            _ => "EIO",
        }
    }

    /// Human-readable message matching `strerror(3)` for the codes the VFS
    /// raises itself.
    pub fn message(self) -> &'static str {
        match self.0 {
            libc::EPERM => "Operation not permitted",
            libc::ENOENT => "No such file or directory",
            libc::EIO => "Input/output error",
            libc::EBADF => "Bad file descriptor",
            libc::EACCES => "Permission denied",
            libc::EBUSY => "Device or resource busy",
            libc::EEXIST => "File exists",
            libc::EXDEV => "Invalid cross-device link",
            libc::ENOTDIR => "Not a directory",
            libc::EISDIR => "Is a directory",
            libc::EINVAL => "Invalid argument",
            libc::EFBIG => "File too large",
            libc::ENOSPC => "No space left on device",
            libc::EDEADLK => "Resource deadlock avoided",
            libc::ENOSYS => "Function not implemented",
            libc::ENOTEMPTY => "Directory not empty",
            libc::ELOOP => "Too many levels of symbolic links",
            libc::ENOTSUP => "Operation not supported",
            _ => "Unknown error",
        }
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<Errno> for i32 {
    fn from(errno: Errno) -> Self {
        errno.0
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Errno(code),
            None => match err.kind() {
                io::ErrorKind::NotFound => Errno::ENOENT,
                io::ErrorKind::PermissionDenied => Errno::EACCES,
                io::ErrorKind::AlreadyExists => Errno::EEXIST,
                io::ErrorKind::InvalidInput => Errno::EINVAL,
                _ => Errno::EIO,
            },
        }
    }
}

/// The error object returned by every VFS operation.
///
/// Carries the errno, the user-facing path the operation was invoked with
/// (backend-local paths are rewritten before an error escapes the dispatch
/// boundary) and the name of the failing syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    /// POSIX error code.
    pub errno: Errno,
    /// The path the failing operation was addressed to, if any.
    pub path: Option<String>,
    /// Name of the operation that failed, e.g. `"open"`.
    pub syscall: Option<&'static str>,
}

impl FsError {
    /// A bare error with no path or syscall attribution.
    pub fn new(errno: Errno) -> Self {
        Self {
            errno,
            path: None,
            syscall: None,
        }
    }

    /// Attach the user-facing path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the syscall name.
    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    /// True if this error is `ENOENT`.
    pub fn is_not_found(&self) -> bool {
        self.errno == Errno::ENOENT
    }

    /// Attach `path` only if the error does not already carry one.
    pub fn or_path(mut self, path: &str) -> Self {
        if self.path.is_none() {
            self.path = Some(path.to_string());
        }
        self
    }

    /// Rewrite a backend-local path back to its user-facing form.
    ///
    /// `substitutions` maps local paths (as handed to the backend) to the
    /// paths the caller used. Errors whose path is not in the map keep it
    /// unchanged.
    pub fn remap_paths(mut self, substitutions: &[(&str, &str)]) -> Self {
        if let Some(ref p) = self.path {
            for (local, user) in substitutions {
                if p == local {
                    self.path = Some((*user).to_string());
                    break;
                }
            }
        }
        self
    }
}

impl From<Errno> for FsError {
    fn from(errno: Errno) -> Self {
        FsError::new(errno)
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::new(Errno::from(err))
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        io::Error::from_raw_os_error(err.errno.code())
    }
}

impl Display for FsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.errno.name(), self.errno.message())?;
        if let Some(syscall) = self.syscall {
            write!(f, ", {syscall}")?;
        }
        if let Some(ref path) = self.path {
            write!(f, " '{path}'")?;
        }
        Ok(())
    }
}

impl error::Error for FsError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;

/// Shorthand for building an attributed error at a dispatch site.
pub(crate) fn err(errno: Errno, syscall: &'static str, path: &str) -> FsError {
    FsError::new(errno).with_syscall(syscall).with_path(path)
}
