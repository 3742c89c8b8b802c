//! The async surface of [`Vfs`].
//!
//! Each method here is the cooperative twin of the like-named sync method
//! in `vfs.rs`: identical semantics, but every backend call goes through
//! the backend's `_async` methods, so the only suspension points are
//! backend I/O. Table state (mounts, descriptors, watchers) is still
//! guarded by the same short-held locks and is never held across an await.
//!
//! Traversal conveniences built purely on this surface (`opendir`, `glob`,
//! recursive typed listings, `mkdtemp`) live on the sync side; compose them
//! from `readdir_async`/`mkdir_async` when needed under a runtime.

use std::sync::Arc;

use crate::backend::CreateContext;
use crate::backend::Feature;
use crate::backend::FileHandle;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::fd::Fd;
use crate::fd::OpenFile;
use crate::flags::AccessFlags;
use crate::flags::OpenFlag;
use crate::handle::File;
use crate::path;
use crate::stats::creation_gid;
use crate::stats::StatFs;
use crate::stats::Stats;
use crate::stats::DEFAULT_FILE_MODE;
use crate::stats::SYMLINK_MODE;
use crate::vfs::CopyFileOptions;
use crate::vfs::CpOptions;
use crate::vfs::MkdirOptions;
use crate::vfs::RmOptions;
use crate::vfs::SymlinkType;
use crate::vfs::Vfs;
use crate::vfs::WriteFileOptions;
use crate::watch::WatchEventType;

/// Maximum symlink traversals before `realpath` fails `ELOOP`.
const MAX_LINK_DEPTH: u32 = 40;

impl Vfs {
    async fn stat_raw_async(&self, p: &str) -> Result<Stats> {
        let resolved = self.resolve(p)?;
        resolved
            .backend
            .stat_async(&resolved.local_path)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(p)).or_path(p))
    }

    async fn read_link_raw_async(&self, p: &str) -> Result<String> {
        let resolved = self.resolve(p)?;
        let stats = resolved.backend.stat_async(&resolved.local_path).await?;
        let handle = resolved
            .backend
            .open_file_async(&resolved.local_path, OpenFlag::parse("r")?)
            .await?;
        let mut buf = vec![0u8; stats.size as usize];
        let n = handle.read_async(&mut buf, 0).await?;
        buf.truncate(n);
        handle.close_async().await?;
        String::from_utf8(buf).map_err(|_| err(Errno::EINVAL, "readlink", p))
    }

    async fn realpath_at_async(&self, p: &str, depth: u32) -> Result<String> {
        if depth > MAX_LINK_DEPTH {
            return Err(err(Errno::ELOOP, "realpath", p));
        }
        let p = path::normalize(p)?;
        if p == "/" {
            return Ok(p);
        }
        let dir = Box::pin(self.realpath_at_async(path::dirname(&p), depth + 1)).await?;
        let joined = path::join(&dir, path::basename(&p))?;
        let stats = match self.stat_raw_async(&joined).await {
            Err(e) if e.is_not_found() => return Ok(joined),
            Err(e) => return Err(e),
            Ok(stats) => stats,
        };
        if !stats.is_symlink() {
            return Ok(joined);
        }
        let target = self.read_link_raw_async(&joined).await?;
        let target = path::join(path::dirname(&joined), &target)?;
        Box::pin(self.realpath_at_async(&target, depth + 1)).await
    }

    /// Async twin of [`realpath`](Vfs::realpath).
    pub async fn realpath_async(&self, p: &str) -> Result<String> {
        self.realpath_at_async(p, 0).await
    }

    async fn resolve_no_follow_async(&self, p: &str) -> Result<String> {
        let p = path::normalize(p)?;
        if p == "/" {
            return Ok(p);
        }
        let dir = self.realpath_at_async(path::dirname(&p), 0).await?;
        path::join(&dir, path::basename(&p))
    }

    async fn writable_parent_async(&self, p: &str, syscall: &'static str) -> Result<Stats> {
        let parent = path::dirname(p);
        let stats = self.stat_raw_async(parent).await.map_err(|e| {
            if e.is_not_found() {
                err(Errno::ENOENT, syscall, p)
            } else {
                e
            }
        })?;
        if !stats.is_dir() {
            return Err(err(Errno::ENOTDIR, syscall, p));
        }
        self.check_access_at(&stats, AccessFlags::W_OK, syscall, p)?;
        Ok(stats)
    }

    async fn open_inner_async(
        &self,
        p: &str,
        flag: OpenFlag,
        mode: u32,
        resolve_symlinks: bool,
    ) -> Result<(String, Arc<dyn FileHandle>)> {
        let p = if resolve_symlinks {
            self.realpath_async(p).await?
        } else {
            self.resolve_no_follow_async(p).await?
        };
        let resolved = self.resolve(&p)?;
        let remap = |e: FsError| e.remap_paths(&resolved.error_paths(&p));

        match resolved.backend.stat_async(&resolved.local_path).await {
            Err(e) if e.is_not_found() => {
                if !flag.may_create() {
                    return Err(err(Errno::ENOENT, "open", &p));
                }
                let parent = self.writable_parent_async(&p, "open").await?;
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
                    .create_file_async(&resolved.local_path, flag, file_mode, ctx)
                    .await
                    .map_err(remap)?;
                if !resolved.backend.meta().has_feature(Feature::SetId)
                    && parent.mode & libc::S_ISGID as u32 != 0
                {
                    handle.chown_async(cred.uid, parent.gid).await.map_err(remap)?;
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
                    .open_file_async(&resolved.local_path, flag)
                    .await
                    .map_err(remap)?;
                if flag.truncate {
                    handle.truncate_async(0).await.map_err(remap)?;
                    self.inner.emit(WatchEventType::Change, &p);
                }
                Ok((p, handle))
            }
        }
    }

    /// Async twin of [`open_fd`](Vfs::open_fd).
    pub async fn open_fd_async(&self, p: &str, flag: &str, mode: u32) -> Result<Fd> {
        let flag = OpenFlag::parse(flag)?;
        let (p, handle) = self.open_inner_async(p, flag, mode, true).await?;
        let file = Arc::new(OpenFile::new(p, flag, handle));
        Ok(self.inner.fds.insert(file))
    }

    /// Async twin of [`open`](Vfs::open).
    pub async fn open_async(&self, p: &str, flag: &str) -> Result<File> {
        let fd = self.open_fd_async(p, flag, DEFAULT_FILE_MODE).await?;
        let file = self.inner.fds.get(fd)?;
        Ok(File::new(self.inner.clone(), fd, file))
    }

    /// Async twin of [`read_file`](Vfs::read_file).
    pub async fn read_file_async(&self, p: &str) -> Result<Vec<u8>> {
        let file = self.open_async(p, "r").await?;
        let stats = file.stat_async().await?;
        let mut buf = vec![0u8; stats.size as usize];
        let n = file.read_async(&mut buf, Some(0)).await?;
        buf.truncate(n);
        file.close_async().await?;
        Ok(buf)
    }

    /// Async twin of [`read_file_to_string`](Vfs::read_file_to_string).
    pub async fn read_file_to_string_async(&self, p: &str) -> Result<String> {
        String::from_utf8(self.read_file_async(p).await?)
            .map_err(|_| err(Errno::EINVAL, "read", p))
    }

    /// Async twin of [`write_file`](Vfs::write_file).
    pub async fn write_file_async(&self, p: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_options_async(p, data, WriteFileOptions::default())
            .await
    }

    /// Async twin of
    /// [`write_file_with_options`](Vfs::write_file_with_options).
    pub async fn write_file_with_options_async(
        &self,
        p: &str,
        data: &[u8],
        options: WriteFileOptions,
    ) -> Result<()> {
        let flag = OpenFlag::parse(options.flag)?;
        if !flag.writable && !flag.appendable {
            return Err(err(Errno::EINVAL, "write", p));
        }
        let fd = self.open_fd_async(p, options.flag, options.mode).await?;
        let file = File::new(self.inner.clone(), fd, self.inner.fds.get(fd)?);
        file.write_async(data, Some(0)).await?;
        file.close_async().await
    }

    /// Async twin of [`append_file`](Vfs::append_file).
    pub async fn append_file_async(&self, p: &str, data: &[u8]) -> Result<()> {
        self.write_file_with_options_async(
            p,
            data,
            WriteFileOptions {
                flag: "a",
                mode: DEFAULT_FILE_MODE,
            },
        )
        .await
    }

    /// Async twin of [`stat`](Vfs::stat).
    pub async fn stat_async(&self, p: &str) -> Result<Stats> {
        let p = self.realpath_async(p).await?;
        self.stat_raw_async(&p).await
    }

    /// Async twin of [`lstat`](Vfs::lstat).
    pub async fn lstat_async(&self, p: &str) -> Result<Stats> {
        let p = self.resolve_no_follow_async(p).await?;
        self.stat_raw_async(&p).await
    }

    /// Async twin of [`exists`](Vfs::exists).
    pub async fn exists_async(&self, p: &str) -> Result<bool> {
        match self.stat_async(p).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Async twin of [`access`](Vfs::access).
    pub async fn access_async(&self, p: &str, mask: AccessFlags) -> Result<()> {
        let stats = self.stat_async(p).await?;
        self.check_access_at(&stats, mask, "access", &path::normalize(p)?)
    }

    /// Async twin of [`truncate`](Vfs::truncate).
    pub async fn truncate_async(&self, p: &str, len: u64) -> Result<()> {
        let file = self.open_async(p, "r+").await?;
        file.truncate_async(len).await?;
        file.close_async().await
    }

    /// Async twin of [`statfs`](Vfs::statfs).
    pub async fn statfs_async(&self, p: &str) -> Result<StatFs> {
        let p = self.realpath_async(p).await?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .statfs_async(&resolved.local_path)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))
    }

    /// Async twin of [`mkdir`](Vfs::mkdir).
    pub async fn mkdir_async(&self, p: &str, options: MkdirOptions) -> Result<Option<String>> {
        let p = self.resolve_no_follow_async(p).await?;
        if options.recursive {
            let mut missing = Vec::new();
            let mut probe = p.clone();
            loop {
                match self.stat_raw_async(&probe).await {
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
                self.mkdir_one_async(&dir, options.mode).await?;
            }
            Ok(first_created)
        } else {
            self.mkdir_one_async(&p, options.mode).await?;
            Ok(Some(p))
        }
    }

    async fn mkdir_one_async(&self, p: &str, mode: u32) -> Result<()> {
        let parent = self.writable_parent_async(p, "mkdir").await?;
        let resolved = self.resolve(p)?;
        let cred = self.credentials();
        let ctx = CreateContext {
            uid: cred.uid,
            gid: creation_gid(&parent, cred.gid),
        };
        let mut mode = mode & 0o7777;
        if parent.mode & libc::S_ISGID as u32 != 0 {
            mode |= libc::S_ISGID as u32;
        }
        resolved
            .backend
            .mkdir_async(&resolved.local_path, mode, ctx)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(p)))?;
        self.inner.emit(WatchEventType::Rename, p);
        Ok(())
    }

    /// Async twin of [`rmdir`](Vfs::rmdir).
    pub async fn rmdir_async(&self, p: &str) -> Result<()> {
        let p = self.resolve_no_follow_async(p).await?;
        self.writable_parent_async(&p, "rmdir").await?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .rmdir_async(&resolved.local_path)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        self.inner.emit(WatchEventType::Rename, &p);
        Ok(())
    }

    /// Async twin of [`readdir`](Vfs::readdir).
    pub async fn readdir_async(&self, p: &str) -> Result<Vec<String>> {
        let p = self.realpath_async(p).await?;
        let stats = self.stat_raw_async(&p).await?;
        if !stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "readdir", &p));
        }
        self.check_access_at(&stats, AccessFlags::R_OK, "readdir", &p)?;
        let resolved = self.resolve(&p)?;
        let mut entries = resolved
            .backend
            .readdir_async(&resolved.local_path)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        for mount_name in self.inner.mounts.child_mounts(&p) {
            if !entries.contains(&mount_name) {
                entries.push(mount_name);
            }
        }
        Ok(entries)
    }

    /// Async twin of [`unlink`](Vfs::unlink).
    pub async fn unlink_async(&self, p: &str) -> Result<()> {
        let p = self.resolve_no_follow_async(p).await?;
        self.writable_parent_async(&p, "unlink").await?;
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .unlink_async(&resolved.local_path)
            .await
            .map_err(|e| e.remap_paths(&resolved.error_paths(&p)))?;
        self.inner.emit(WatchEventType::Rename, &p);
        Ok(())
    }

    /// Async twin of [`link`](Vfs::link).
    pub async fn link_async(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.resolve_no_follow_async(src).await?;
        let dst = self.resolve_no_follow_async(dst).await?;
        let src_resolved = self.resolve(&src)?;
        let dst_resolved = self.resolve(&dst)?;
        if src_resolved.mount_point != dst_resolved.mount_point {
            return Err(err(Errno::EXDEV, "link", &dst));
        }
        self.writable_parent_async(&dst, "link").await?;
        src_resolved
            .backend
            .link_async(&src_resolved.local_path, &dst_resolved.local_path)
            .await
            .map_err(|e| {
                e.remap_paths(&[
                    (src_resolved.local_path.as_str(), src.as_str()),
                    (dst_resolved.local_path.as_str(), dst.as_str()),
                ])
            })?;
        self.inner.emit(WatchEventType::Rename, &dst);
        Ok(())
    }

    /// Async twin of [`symlink`](Vfs::symlink).
    pub async fn symlink_async(&self, target: &str, p: &str, kind: SymlinkType) -> Result<()> {
        let _ = kind;
        if target.is_empty() || target.contains('\0') {
            return Err(err(Errno::EINVAL, "symlink", p));
        }
        let p = self.resolve_no_follow_async(p).await?;
        if self.stat_raw_async(&p).await.is_ok() {
            return Err(err(Errno::EEXIST, "symlink", &p));
        }
        let flag = OpenFlag::parse("wx")?;
        let (_, handle) = self.open_inner_async(&p, flag, SYMLINK_MODE, false).await?;
        let result = handle.write_async(target.as_bytes(), 0).await;
        handle.close_async().await?;
        result?;
        Ok(())
    }

    /// Async twin of [`readlink`](Vfs::readlink).
    pub async fn readlink_async(&self, p: &str) -> Result<String> {
        let p = self.resolve_no_follow_async(p).await?;
        let stats = self.stat_raw_async(&p).await?;
        if !stats.is_symlink() {
            return Err(err(Errno::EINVAL, "readlink", &p));
        }
        self.read_link_raw_async(&p).await
    }

    /// Async twin of [`rename`](Vfs::rename).
    pub async fn rename_async(&self, old: &str, new: &str) -> Result<()> {
        let old = self.resolve_no_follow_async(old).await?;
        let new = self.resolve_no_follow_async(new).await?;
        let old_resolved = self.resolve(&old)?;
        let new_resolved = self.resolve(&new)?;
        self.writable_parent_async(&old, "rename").await?;
        self.writable_parent_async(&new, "rename").await?;

        if old_resolved.mount_point == new_resolved.mount_point {
            old_resolved
                .backend
                .rename_async(&old_resolved.local_path, &new_resolved.local_path)
                .await
                .map_err(|e| {
                    e.remap_paths(&[
                        (old_resolved.local_path.as_str(), old.as_str()),
                        (new_resolved.local_path.as_str(), new.as_str()),
                    ])
                })?;
        } else {
            let stats = self.lstat_async(&old).await?;
            if stats.is_dir() {
                self.cp_async(
                    &old,
                    &new,
                    CpOptions {
                        recursive: true,
                        ..CpOptions::default()
                    },
                )
                .await?;
                self.rm_async(
                    &old,
                    RmOptions {
                        recursive: true,
                        force: false,
                    },
                )
                .await?;
            } else {
                let data = self.read_file_async(&old).await?;
                self.write_file_async(&new, &data).await?;
                self.unlink_async(&old).await?;
            }
        }
        self.inner.emit(WatchEventType::Rename, &old);
        self.inner.emit(WatchEventType::Change, &new);
        Ok(())
    }

    /// Async twin of [`copy_file`](Vfs::copy_file).
    pub async fn copy_file_async(
        &self,
        src: &str,
        dst: &str,
        options: CopyFileOptions,
    ) -> Result<()> {
        let data = self.read_file_async(src).await?;
        let stats = self.stat_async(src).await?;
        let flag = if options.exclusive { "wx" } else { "w" };
        self.write_file_with_options_async(
            dst,
            &data,
            WriteFileOptions {
                flag,
                mode: stats.perm(),
            },
        )
        .await
    }

    /// Async twin of [`cp`](Vfs::cp).
    pub async fn cp_async(&self, src: &str, dst: &str, options: CpOptions) -> Result<()> {
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        self.cp_node_async(&src, &dst, &options).await
    }

    async fn cp_node_async(&self, src: &str, dst: &str, options: &CpOptions) -> Result<()> {
        if let Some(filter) = &options.filter {
            if !filter(src, dst) {
                return Ok(());
            }
        }
        let stats = if options.dereference {
            self.stat_async(src).await?
        } else {
            self.lstat_async(src).await?
        };

        if stats.is_dir() {
            if !options.recursive {
                return Err(err(Errno::EISDIR, "cp", src));
            }
            match self
                .mkdir_async(
                    dst,
                    MkdirOptions {
                        recursive: false,
                        mode: stats.perm(),
                    },
                )
                .await
            {
                Ok(_) => {}
                Err(e) if e.errno == Errno::EEXIST => {
                    if options.error_on_exist {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
            for name in self.readdir_async(src).await? {
                let child_src = path::join(src, &name)?;
                let child_dst = path::join(dst, &name)?;
                Box::pin(self.cp_node_async(&child_src, &child_dst, options)).await?;
            }
        } else if stats.is_symlink() && !options.dereference {
            if self.exists_async(dst).await? {
                if options.error_on_exist {
                    return Err(err(Errno::EEXIST, "cp", dst));
                }
                self.unlink_async(dst).await?;
            }
            let target = self.readlink_async(src).await?;
            self.symlink_async(&target, dst, SymlinkType::File).await?;
        } else {
            if options.error_on_exist && self.exists_async(dst).await? {
                return Err(err(Errno::EEXIST, "cp", dst));
            }
            self.copy_file_async(src, dst, CopyFileOptions::default())
                .await?;
        }

        if options.preserve_timestamps {
            self.utimes_async(dst, stats.atime_ms, stats.mtime_ms).await?;
        }
        Ok(())
    }

    /// Async twin of [`rm`](Vfs::rm).
    pub async fn rm_async(&self, p: &str, options: RmOptions) -> Result<()> {
        let p = match self.resolve_no_follow_async(p).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() && options.force => return Ok(()),
            Err(e) => return Err(e),
        };
        let stats = match self.stat_raw_async(&p).await {
            Ok(stats) => stats,
            Err(e) if e.is_not_found() && options.force => return Ok(()),
            Err(e) => return Err(e),
        };
        if stats.is_dir() {
            if !options.recursive {
                return Err(err(Errno::EISDIR, "rm", &p));
            }
            for name in self.readdir_async(&p).await? {
                let child = path::join(&p, &name)?;
                Box::pin(self.rm_async(&child, options)).await?;
            }
            self.rmdir_async(&p).await?;
        } else {
            self.unlink_async(&p).await?;
        }
        Ok(())
    }

    async fn apply_to_handle_async<F, Fut>(&self, p: &str, f: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn FileHandle>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let p = self.realpath_async(p).await?;
        let resolved = self.resolve(&p)?;
        let remap = |e: FsError| e.remap_paths(&resolved.error_paths(&p));
        resolved
            .backend
            .stat_async(&resolved.local_path)
            .await
            .map_err(remap)?;
        let handle = resolved
            .backend
            .open_file_async(&resolved.local_path, OpenFlag::parse("r")?)
            .await
            .map_err(remap)?;
        let result = f(handle.clone()).await.map_err(remap);
        handle.close_async().await?;
        result?;
        self.inner.emit(WatchEventType::Change, &p);
        Ok(())
    }

    /// Async twin of [`chmod`](Vfs::chmod).
    pub async fn chmod_async(&self, p: &str, mode: u32) -> Result<()> {
        let stats = self.stat_async(p).await?;
        let cred = self.credentials();
        if cred.uid != 0 && cred.uid != stats.uid {
            return Err(err(Errno::EPERM, "chmod", p));
        }
        self.apply_to_handle_async(p, |h| async move { h.chmod_async(mode).await })
            .await
    }

    /// Async twin of [`chown`](Vfs::chown).
    pub async fn chown_async(&self, p: &str, uid: u32, gid: u32) -> Result<()> {
        let stats = self.stat_async(p).await?;
        let cred = self.credentials();
        if cred.uid != 0 && !(stats.uid == uid && cred.uid == stats.uid) {
            return Err(err(Errno::EPERM, "chown", p));
        }
        self.apply_to_handle_async(p, |h| async move { h.chown_async(uid, gid).await })
            .await
    }

    /// Async twin of [`utimes`](Vfs::utimes).
    pub async fn utimes_async(&self, p: &str, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let stats = self.stat_async(p).await?;
        let cred = self.credentials();
        if cred.uid != 0 && cred.uid != stats.uid {
            return Err(err(Errno::EPERM, "utimes", p));
        }
        self.apply_to_handle_async(p, |h| async move { h.utimes_async(atime_ms, mtime_ms).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;
    use crate::mutex::Mutexed;

    #[tokio::test]
    async fn async_round_trip() {
        let fs = Vfs::new();
        fs.write_file_async("/f", b"async payload").await.unwrap();
        assert_eq!(fs.read_file_async("/f").await.unwrap(), b"async payload");
        assert_eq!(fs.stat_async("/f").await.unwrap().size, 13);
    }

    #[tokio::test]
    async fn async_surface_over_mutexed_backend() {
        let fs = Vfs::with_root(Arc::new(Mutexed::new(MemFs::new())));
        fs.mkdir_async(
            "/a/b",
            MkdirOptions {
                recursive: true,
                mode: 0o755,
            },
        )
        .await
        .unwrap();
        fs.write_file_async("/a/b/f", b"x").await.unwrap();
        assert!(fs.exists_async("/a/b/f").await.unwrap());
        fs.rm_async(
            "/a",
            RmOptions {
                recursive: true,
                force: false,
            },
        )
        .await
        .unwrap();
        assert!(!fs.exists_async("/a").await.unwrap());
    }

    #[tokio::test]
    async fn async_symlink_resolution() {
        let fs = Vfs::new();
        fs.write_file_async("/t", b"target").await.unwrap();
        fs.symlink_async("/t", "/l", SymlinkType::File).await.unwrap();
        assert_eq!(fs.realpath_async("/l").await.unwrap(), "/t");
        assert_eq!(fs.read_file_async("/l").await.unwrap(), b"target");
        assert_eq!(fs.readlink_async("/l").await.unwrap(), "/t");
    }

    #[tokio::test]
    async fn async_rename_across_mounts() {
        let fs = Vfs::new();
        fs.mkdir_async("/a", MkdirOptions::default()).await.unwrap();
        fs.mkdir_async("/b", MkdirOptions::default()).await.unwrap();
        fs.mount("/b/mnt", Arc::new(MemFs::new())).unwrap();
        fs.write_file_async("/a/x", b"v").await.unwrap();

        fs.rename_async("/a/x", "/b/mnt/x").await.unwrap();
        assert!(!fs.exists_async("/a/x").await.unwrap());
        assert_eq!(fs.read_file_async("/b/mnt/x").await.unwrap(), b"v");
    }
}
