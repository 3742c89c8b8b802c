//! File attributes, file types and POSIX permission checks.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

#[cfg(feature = "serializable")]
use serde::Deserialize;
#[cfg(feature = "serializable")]
use serde::Serialize;

use crate::flags::AccessFlags;

/// Block size reported by default for every stat.
pub const BLOCK_SIZE: u32 = 4096;

/// Default mode for newly created regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default mode for newly created directories.
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// Mode of a symbolic link as materialized by the VFS.
pub const SYMLINK_MODE: u32 = libc::S_IFLNK as u32 | 0o644;

/// The node kind encoded in the type bits of [`Stats::mode`].
///
/// The VFS itself only ever creates the first three kinds: regular files
/// and directories through the open/mkdir paths, and symlinks as regular
/// nodes whose mode carries `S_IFLNK`. The remaining kinds are never
/// produced here but are decoded faithfully when a backend reports them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// A regular file; what [`Stats::is_file`] tests for.
    RegularFile,
    /// A directory; what [`Stats::is_dir`] tests for.
    Directory,
    /// A symbolic link, stored by this VFS as a node with `S_IFLNK` set
    /// whose content is the target path.
    Symlink,
    /// A FIFO special node, passed through from a backend.
    NamedPipe,
    /// A character device node, passed through from a backend.
    CharDevice,
    /// A block device node, passed through from a backend.
    BlockDevice,
    /// A socket node, passed through from a backend.
    Socket,
}

impl FileType {
    /// Decode the `S_IFMT` bits of a mode. `None` when the type bits are
    /// unset or unrecognized; [`Stats::file_type`] treats that as a
    /// regular file.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => Some(FileType::RegularFile),
            m if m == libc::S_IFDIR as u32 => Some(FileType::Directory),
            m if m == libc::S_IFLNK as u32 => Some(FileType::Symlink),
            m if m == libc::S_IFIFO as u32 => Some(FileType::NamedPipe),
            m if m == libc::S_IFCHR as u32 => Some(FileType::CharDevice),
            m if m == libc::S_IFBLK as u32 => Some(FileType::BlockDevice),
            m if m == libc::S_IFSOCK as u32 => Some(FileType::Socket),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this kind, ready to be OR-ed with permission
    /// bits when building a [`Stats`].
    pub fn to_mode(self) -> u32 {
        (match self {
            FileType::RegularFile => libc::S_IFREG,
            FileType::Directory => libc::S_IFDIR,
            FileType::Symlink => libc::S_IFLNK,
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Socket => libc::S_IFSOCK,
        }) as u32
    }
}

/// The identity a VFS instance performs operations as.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Credentials {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

impl Credentials {
    /// Credentials for the given uid/gid.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// File attributes
///
/// Timestamps are milliseconds since the Unix epoch, signed so that
/// pre-epoch times survive a round trip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Stats {
    /// Inode number
    pub ino: u64,
    /// File type and permission bits
    pub mode: u32,
    /// Number of hard links
    pub nlink: u32,
    /// User id of the owner
    pub uid: u32,
    /// Group id of the owner
    pub gid: u32,
    /// Size in bytes
    pub size: u64,
    /// Time of last access, ms since the epoch
    pub atime_ms: i64,
    /// Time of last modification, ms since the epoch
    pub mtime_ms: i64,
    /// Time of last status change, ms since the epoch
    pub ctime_ms: i64,
    /// Time of creation, ms since the epoch
    pub birthtime_ms: i64,
    /// Allocated size in 512-byte blocks
    pub blocks: u64,
    /// Preferred I/O block size
    pub blksize: u32,
}

impl Stats {
    /// Attributes for a fresh node of the given type, owned by `cred`.
    pub fn new(file_type: FileType, perm: u32, cred: Credentials) -> Self {
        let now = now_ms();
        Stats {
            ino: 0,
            mode: file_type.to_mode() | (perm & 0o7777),
            nlink: 1,
            uid: cred.uid,
            gid: cred.gid,
            size: 0,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            birthtime_ms: now,
            blocks: 0,
            blksize: BLOCK_SIZE,
        }
    }

    /// The file type encoded in `mode`, defaulting to a regular file when
    /// the type bits are unset (backends are allowed to omit them).
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode).unwrap_or(FileType::RegularFile)
    }

    /// True if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// True if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }

    /// True if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    /// Permission bits including setuid/setgid/sticky.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether `cred` may access a node with these attributes for the
    /// requested rwx mask.
    pub fn has_access(&self, cred: Credentials, mask: AccessFlags) -> bool {
        check_access(self.uid, self.gid, self.mode, cred.uid, cred.gid, mask)
    }

    /// Touch mtime and ctime.
    pub fn touch_modified(&mut self) {
        let now = now_ms();
        self.mtime_ms = now;
        self.ctime_ms = now;
    }

    /// Touch ctime only (metadata change).
    pub fn touch_changed(&mut self) {
        self.ctime_ms = now_ms();
    }
}

/// Classic POSIX access check: pick the permission class by uid/gid and
/// verify every requested bit. Root bypasses rwx checks entirely.
pub fn check_access(
    file_uid: u32,
    file_gid: u32,
    file_mode: u32,
    uid: u32,
    gid: u32,
    mut access_mask: AccessFlags,
) -> bool {
    // F_OK tests for existence of the file
    if access_mask == AccessFlags::F_OK {
        return true;
    }

    if uid == 0 {
        return true;
    }

    let file_mode = file_mode as i32 & 0o777;
    if uid == file_uid {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 6));
    } else if gid == file_gid {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 3));
    } else {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & file_mode);
    }

    access_mask.is_empty()
}

/// Group a newly created node belongs to: the parent's group when the
/// parent directory carries setgid, the caller's otherwise.
pub fn creation_gid(parent: &Stats, gid: u32) -> u32 {
    if parent.mode & libc::S_ISGID as u32 != 0 {
        return parent.gid;
    }

    gid
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_millis() as i64),
    }
}

/// File system statistics, the `statfs` result shape.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StatFs {
    /// Total data blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Fundamental block size.
    pub bsize: u32,
    /// Maximum file name length.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl StatFs {
    /// The answer given when a backend does not track usage.
    pub fn synthetic() -> Self {
        StatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: BLOCK_SIZE,
            namelen: 255,
            frsize: BLOCK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_round_trip() {
        for t in [
            FileType::RegularFile,
            FileType::Directory,
            FileType::Symlink,
            FileType::NamedPipe,
            FileType::CharDevice,
            FileType::BlockDevice,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_mode(t.to_mode() | 0o644), Some(t));
        }
    }

    #[test]
    fn owner_class_is_used_for_owner() {
        // 0o400: owner may read, group/other may not
        assert!(check_access(1000, 1000, 0o400, 1000, 2000, AccessFlags::R_OK));
        assert!(!check_access(1000, 1000, 0o400, 1000, 2000, AccessFlags::W_OK));
        // Owner class applies even when it grants less than the other class
        assert!(!check_access(1000, 1000, 0o044, 1000, 1000, AccessFlags::R_OK));
    }

    #[test]
    fn group_and_other_classes() {
        assert!(check_access(0, 1000, 0o040, 500, 1000, AccessFlags::R_OK));
        assert!(!check_access(0, 1000, 0o040, 500, 2000, AccessFlags::R_OK));
        assert!(check_access(0, 1000, 0o004, 500, 2000, AccessFlags::R_OK));
    }

    #[test]
    fn root_bypasses() {
        assert!(check_access(1000, 1000, 0o000, 0, 0, AccessFlags::R_OK | AccessFlags::W_OK));
    }

    #[test]
    fn f_ok_always_passes() {
        assert!(check_access(1000, 1000, 0o000, 500, 500, AccessFlags::F_OK));
    }

    #[test]
    fn setgid_directory_propagates_group() {
        let mut parent = Stats::new(FileType::Directory, 0o777, Credentials::new(1, 42));
        assert_eq!(creation_gid(&parent, 7), 7);
        parent.mode |= libc::S_ISGID as u32;
        assert_eq!(creation_gid(&parent, 7), 42);
    }
}
