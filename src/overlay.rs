//! A copy-on-write layering of one writable backend over one readable
//! backend.
//!
//! Reads fall through to the lower layer until a path is materialized on
//! the upper layer; every mutation lands on the upper layer, preceded by a
//! copy-up when the target only exists below. Deletions of lower-layer
//! paths are recorded in a log file at `/.deleted` on the upper layer so
//! they survive reconstruction.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::backend::Backend;
use crate::backend::BackendMeta;
use crate::backend::BackendOptions;
use crate::backend::CreateContext;
use crate::backend::FileHandle;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::flags::OpenFlag;
use crate::stats::FileType;
use crate::stats::StatFs;
use crate::stats::Stats;

/// Path of the deletion log on the upper layer.
pub const DELETION_LOG_PATH: &str = "/.deleted";

/// Constituent layers of an [`Overlay`].
#[derive(Clone)]
pub struct OverlayOptions {
    /// The writable upper layer. All mutation lands here.
    pub writable: Arc<dyn Backend>,
    /// The readable lower layer. Never written.
    pub readable: Arc<dyn Backend>,
}

impl BackendOptions for OverlayOptions {
    fn validate(&self) -> Result<()> {
        if self.writable.meta().readonly {
            return Err(err(Errno::EINVAL, "validate", "/"));
        }
        Ok(())
    }
}

impl fmt::Debug for OverlayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayOptions")
            .field("writable", &self.writable.meta().name)
            .field("readable", &self.readable.meta().name)
            .finish()
    }
}

#[derive(Default)]
struct LogWriterState {
    write_in_flight: bool,
    pending_needs_update: bool,
}

struct Shared {
    upper: Arc<dyn Backend>,
    lower: Arc<dyn Backend>,
    deleted: RwLock<HashSet<String>>,
    log_writer: Mutex<LogWriterState>,
    log_error: Mutex<Option<FsError>>,
}

/// The overlay backend.
pub struct Overlay {
    shared: Arc<Shared>,
}

impl Overlay {
    /// Construct from constituent layers, replaying the persisted deletion
    /// log. A missing log is an empty one.
    pub fn new(options: OverlayOptions) -> Result<Self> {
        options.validate()?;
        let shared = Shared {
            upper: options.writable,
            lower: options.readable,
            deleted: RwLock::new(HashSet::new()),
            log_writer: Mutex::new(LogWriterState::default()),
            log_error: Mutex::new(None),
        };
        let deleted = shared.parse_log()?;
        *shared.deleted.write() = deleted;
        Ok(Self {
            shared: Arc::new(shared),
        })
    }
}

impl fmt::Debug for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlay")
            .field("upper", &self.shared.upper.meta().name)
            .field("lower", &self.shared.lower.meta().name)
            .field("deleted", &self.shared.deleted.read().len())
            .finish()
    }
}

impl Shared {
    fn parse_log(&self) -> Result<HashSet<String>> {
        let mut deleted = HashSet::new();
        let stats = match self.upper.stat(DELETION_LOG_PATH) {
            Ok(stats) => stats,
            Err(e) if e.is_not_found() => return Ok(deleted),
            Err(e) => return Err(e),
        };
        let handle = self
            .upper
            .open_file(DELETION_LOG_PATH, OpenFlag::parse("r")?)?;
        let mut data = vec![0u8; stats.size as usize];
        let n = handle.read(&mut data, 0)?;
        data.truncate(n);
        handle.close()?;

        for line in String::from_utf8_lossy(&data).lines() {
            if let Some(path) = line.strip_prefix('d') {
                if !path.is_empty() {
                    deleted.insert(path.to_string());
                }
            }
        }
        Ok(deleted)
    }

    /// Surface and clear a latched deletion-log write failure.
    fn take_log_error(&self) -> Result<()> {
        match self.log_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Rewrite the deletion log. Concurrent requests coalesce: while a
    /// write is in flight only a flag is set, and the in-flight writer
    /// loops once more when it sees the flag.
    fn persist_deleted(&self) {
        {
            let mut state = self.log_writer.lock();
            if state.write_in_flight {
                state.pending_needs_update = true;
                return;
            }
            state.write_in_flight = true;
        }
        loop {
            let contents: String = {
                let deleted = self.deleted.read();
                let mut lines: Vec<&String> = deleted.iter().collect();
                lines.sort();
                lines
                    .into_iter()
                    .map(|p| format!("d{p}\n"))
                    .collect()
            };
            let mut stats = Stats::new(
                FileType::RegularFile,
                0o644,
                crate::stats::Credentials::default(),
            );
            stats.size = contents.len() as u64;
            if let Err(e) = self.upper.sync(DELETION_LOG_PATH, contents.as_bytes(), &stats) {
                warn!("deletion log write failed: {e}");
                *self.log_error.lock() = Some(e);
            }

            let mut state = self.log_writer.lock();
            if state.pending_needs_update {
                state.pending_needs_update = false;
                continue;
            }
            state.write_in_flight = false;
            return;
        }
    }

    fn is_deleted(&self, path: &str) -> bool {
        self.deleted.read().contains(path)
    }

    fn mark_deleted(&self, path: &str) {
        self.deleted.write().insert(path.to_string());
        self.persist_deleted();
    }

    fn unmark_deleted(&self, path: &str) {
        let removed = self.deleted.write().remove(path);
        if removed {
            self.persist_deleted();
        }
    }

    /// Merged-view stat: the upper layer wins; lower-only nodes are
    /// reported writable so the view can be modified through copy-up.
    fn stat_merged(&self, path: &str) -> Result<Stats> {
        if self.is_deleted(path) {
            return Err(err(Errno::ENOENT, "stat", path));
        }
        match self.upper.stat(path) {
            Ok(stats) => Ok(stats),
            Err(e) if e.is_not_found() => {
                let mut stats = self.lower.stat(path)?;
                stats.mode |= 0o222;
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    fn visible(&self, path: &str) -> Result<bool> {
        if self.is_deleted(path) {
            return Ok(false);
        }
        if self.upper.exists(path)? {
            return Ok(true);
        }
        self.lower.exists(path)
    }

    /// Make sure every ancestor of `path` exists on the upper layer,
    /// copying the mode of the merged view for each directory created.
    fn ensure_parents(&self, path: &str) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut dir = crate::path::dirname(path);
        while dir != "/" {
            ancestors.push(dir.to_string());
            dir = crate::path::dirname(dir);
        }
        for ancestor in ancestors.into_iter().rev() {
            if self.upper.exists(&ancestor)? {
                continue;
            }
            let stats = self.stat_merged(&ancestor)?;
            self.upper.mkdir(
                &ancestor,
                stats.perm(),
                CreateContext {
                    uid: stats.uid,
                    gid: stats.gid,
                },
            )?;
        }
        Ok(())
    }

    fn read_lower(&self, path: &str) -> Result<(Vec<u8>, Stats)> {
        let stats = self.lower.stat(path)?;
        let handle = self.lower.open_file(path, OpenFlag::parse("r")?)?;
        let mut data = vec![0u8; stats.size as usize];
        let n = handle.read(&mut data, 0)?;
        data.truncate(n);
        handle.close()?;
        Ok((data, stats))
    }

    /// Materialize a lower-only path on the upper layer.
    fn copy_up(&self, path: &str) -> Result<()> {
        if self.upper.exists(path)? {
            return Ok(());
        }
        let stats = self.lower.stat(path)?;
        self.ensure_parents(path)?;
        if stats.is_dir() {
            self.upper.mkdir(
                path,
                stats.perm() | 0o222,
                CreateContext {
                    uid: stats.uid,
                    gid: stats.gid,
                },
            )?;
            return Ok(());
        }
        let (data, mut stats) = self.read_lower(path)?;
        stats.mode |= 0o222;
        self.upper.sync(path, &data, &stats)
    }

    /// Copy-up plus wholesale content replacement; the write path of
    /// preloaded handles.
    fn sync_through(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        if !self.upper.exists(path)? {
            self.ensure_parents(path)?;
        }
        self.upper.sync(path, data, stats)?;
        self.unmark_deleted(path);
        Ok(())
    }
}

#[async_trait]
impl Backend for Overlay {
    fn meta(&self) -> BackendMeta {
        BackendMeta::new("overlay")
    }

    fn ready(&self) -> Result<()> {
        self.shared.upper.ready()?;
        self.shared.lower.ready()
    }

    fn stat(&self, path: &str) -> Result<Stats> {
        self.shared.take_log_error()?;
        self.shared.stat_merged(path)
    }

    fn open_file(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        self.shared.take_log_error()?;
        if self.shared.is_deleted(path) {
            return Err(err(Errno::ENOENT, "open", path));
        }
        if self.shared.upper.exists(path)? {
            return self.shared.upper.open_file(path, flag);
        }
        // Lower-only: preload the contents so writes can copy up.
        let (data, mut stats) = self.shared.read_lower(path)?;
        stats.mode |= 0o222;
        Ok(Arc::new(PreloadHandle {
            shared: self.shared.clone(),
            path: path.to_string(),
            state: RwLock::new(PreloadState { data, stats }),
        }))
    }

    fn create_file(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        self.shared.take_log_error()?;
        self.shared.ensure_parents(path)?;
        let handle = self.shared.upper.create_file(path, flag, mode, ctx)?;
        self.shared.unmark_deleted(path);
        Ok(handle)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.shared.take_log_error()?;
        self.shared.visible(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.shared.take_log_error()?;
        if !self.shared.visible(from)? {
            return Err(err(Errno::ENOENT, "rename", from));
        }
        self.shared.copy_up(from)?;
        self.shared.ensure_parents(to)?;
        self.shared.upper.rename(from, to)?;
        if self.shared.lower.exists(from)? {
            self.shared.mark_deleted(from);
        }
        self.shared.unmark_deleted(to);
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.shared.take_log_error()?;
        if !self.shared.visible(path)? {
            return Err(err(Errno::ENOENT, "unlink", path));
        }
        if self.shared.upper.exists(path)? {
            self.shared.upper.unlink(path)?;
        }
        if self.shared.lower.exists(path)? {
            self.shared.mark_deleted(path);
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.shared.take_log_error()?;
        if !self.shared.visible(path)? {
            return Err(err(Errno::ENOENT, "rmdir", path));
        }
        if !self.stat(path)?.is_dir() {
            return Err(err(Errno::ENOTDIR, "rmdir", path));
        }
        if !self.readdir(path)?.is_empty() {
            return Err(err(Errno::ENOTEMPTY, "rmdir", path));
        }
        if self.shared.upper.exists(path)? {
            self.shared.upper.rmdir(path)?;
        }
        if self.shared.lower.exists(path)? {
            self.shared.mark_deleted(path);
        }
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        self.shared.take_log_error()?;
        if self.shared.visible(path)? {
            return Err(err(Errno::EEXIST, "mkdir", path));
        }
        self.shared.ensure_parents(path)?;
        self.shared.upper.mkdir(path, mode, ctx)?;
        self.shared.unmark_deleted(path);
        Ok(())
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.shared.take_log_error()?;
        if self.shared.is_deleted(path) {
            return Err(err(Errno::ENOENT, "readdir", path));
        }
        let upper_entries = match self.shared.upper.readdir(path) {
            Ok(entries) => Some(entries),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let lower_entries = match self.shared.lower.readdir(path) {
            Ok(entries) => Some(entries),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if upper_entries.is_none() && lower_entries.is_none() {
            return Err(err(Errno::ENOENT, "readdir", path));
        }

        let mut merged = Vec::new();
        if let Some(entries) = upper_entries {
            for name in entries {
                if name == ".deleted" && path == "/" {
                    continue;
                }
                if !merged.contains(&name) {
                    merged.push(name);
                }
            }
        }
        if let Some(entries) = lower_entries {
            for name in entries {
                let child = crate::path::join(path, &name)?;
                if self.shared.is_deleted(&child) {
                    continue;
                }
                if !merged.contains(&name) {
                    merged.push(name);
                }
            }
        }
        Ok(merged)
    }

    fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.shared.take_log_error()?;
        if !self.shared.visible(src)? {
            return Err(err(Errno::ENOENT, "link", src));
        }
        self.shared.copy_up(src)?;
        self.shared.ensure_parents(dst)?;
        self.shared.upper.link(src, dst)?;
        self.shared.unmark_deleted(dst);
        Ok(())
    }

    fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        self.shared.take_log_error()?;
        self.shared.sync_through(path, data, stats)
    }

    fn statfs(&self, path: &str) -> Result<StatFs> {
        self.shared.upper.statfs(path)
    }
}

struct PreloadState {
    data: Vec<u8>,
    stats: Stats,
}

/// Handle over a lower-only file: the full contents live in memory and
/// every mutation copies up by syncing the buffer to the upper layer.
struct PreloadHandle {
    shared: Arc<Shared>,
    path: String,
    state: RwLock<PreloadState>,
}

impl PreloadHandle {
    fn flush(&self) -> Result<()> {
        let state = self.state.read();
        self.shared
            .sync_through(&self.path, &state.data, &state.stats)
    }
}

impl fmt::Debug for PreloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreloadHandle").field("path", &self.path).finish()
    }
}

#[async_trait]
impl FileHandle for PreloadHandle {
    fn stat(&self) -> Result<Stats> {
        Ok(self.state.read().stats)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.state.read();
        let offset = offset as usize;
        if offset >= state.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(state.data.len() - offset);
        buf[..n].copy_from_slice(&state.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        {
            let mut state = self.state.write();
            let end = offset as usize + data.len();
            if state.data.len() < end {
                state.data.resize(end, 0);
            }
            state.data[offset as usize..end].copy_from_slice(data);
            state.stats.size = state.data.len() as u64;
            state.stats.blocks = state.stats.size.div_ceil(512);
            state.stats.touch_modified();
        }
        self.flush()?;
        Ok(data.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        {
            let mut state = self.state.write();
            state.data.resize(len as usize, 0);
            state.stats.size = len;
            state.stats.blocks = len.div_ceil(512);
            state.stats.touch_modified();
        }
        self.flush()
    }

    fn chmod(&self, mode: u32) -> Result<()> {
        {
            let mut state = self.state.write();
            state.stats.mode =
                (state.stats.mode & libc::S_IFMT as u32) | (mode & 0o7777);
            state.stats.touch_changed();
        }
        self.flush()
    }

    fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        {
            let mut state = self.state.write();
            state.stats.uid = uid;
            state.stats.gid = gid;
            state.stats.touch_changed();
        }
        self.flush()
    }

    fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        {
            let mut state = self.state.write();
            state.stats.atime_ms = atime_ms;
            state.stats.mtime_ms = mtime_ms;
            state.stats.touch_changed();
        }
        self.flush()
    }

    fn sync(&self) -> Result<()> {
        self.flush()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;

    fn lower_with(paths: &[(&str, &[u8])]) -> Arc<MemFs> {
        let fs = Arc::new(MemFs::new());
        for (p, content) in paths {
            let mut dir = crate::path::dirname(p).to_string();
            let mut missing = Vec::new();
            while dir != "/" && !fs.exists(&dir).unwrap() {
                missing.push(dir.clone());
                dir = crate::path::dirname(&dir).to_string();
            }
            for d in missing.into_iter().rev() {
                fs.mkdir(&d, 0o755, CreateContext::default()).unwrap();
            }
            let h = fs
                .create_file(p, OpenFlag::parse("w").unwrap(), 0o444, CreateContext::default())
                .unwrap();
            h.write(content, 0).unwrap();
        }
        fs
    }

    fn overlay(lower: Arc<MemFs>) -> (Overlay, Arc<MemFs>) {
        let upper = Arc::new(MemFs::new());
        let fs = Overlay::new(OverlayOptions {
            writable: upper.clone(),
            readable: lower,
        })
        .unwrap();
        (fs, upper)
    }

    fn read_all(fs: &dyn Backend, p: &str) -> Vec<u8> {
        let stats = fs.stat(p).unwrap();
        let h = fs.open_file(p, OpenFlag::parse("r").unwrap()).unwrap();
        let mut buf = vec![0u8; stats.size as usize];
        let n = h.read(&mut buf, 0).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn lower_only_stat_is_marked_writable() {
        let lower = lower_with(&[("/f", b"hello")]);
        let (fs, _) = overlay(lower);
        let stats = fs.stat("/f").unwrap();
        assert_eq!(stats.mode & 0o222, 0o222);
        assert_eq!(stats.size, 5);
    }

    #[test]
    fn write_copies_up_without_touching_lower() {
        let lower = lower_with(&[("/f", b"hello")]);
        let (fs, upper) = overlay(lower.clone());

        assert_eq!(read_all(&fs, "/f"), b"hello");
        let h = fs.open_file("/f", OpenFlag::parse("r+").unwrap()).unwrap();
        h.write(b"HELLO", 0).unwrap();

        assert_eq!(read_all(&fs, "/f"), b"HELLO");
        assert_eq!(read_all(lower.as_ref(), "/f"), b"hello");
        assert!(upper.exists("/f").unwrap());
    }

    #[test]
    fn unlink_of_lower_path_persists_in_log() {
        let lower = lower_with(&[("/f", b"hello")]);
        let (fs, upper) = overlay(lower.clone());

        fs.unlink("/f").unwrap();
        assert!(!fs.exists("/f").unwrap());
        assert_eq!(fs.stat("/f").unwrap_err().errno, Errno::ENOENT);

        let log = read_all(upper.as_ref(), DELETION_LOG_PATH);
        assert_eq!(log, b"d/f\n");

        // Reconstructing over the same layers keeps the deletion.
        let again = Overlay::new(OverlayOptions {
            writable: upper,
            readable: lower,
        })
        .unwrap();
        assert!(!again.exists("/f").unwrap());
    }

    #[test]
    fn create_after_delete_clears_log_entry() {
        let lower = lower_with(&[("/f", b"old")]);
        let (fs, upper) = overlay(lower);
        fs.unlink("/f").unwrap();
        fs.create_file(
            "/f",
            OpenFlag::parse("w").unwrap(),
            libc::S_IFREG as u32 | 0o644,
            CreateContext::default(),
        )
        .unwrap()
        .write(b"new", 0)
        .unwrap();

        assert_eq!(read_all(&fs, "/f"), b"new");
        let log = read_all(upper.as_ref(), DELETION_LOG_PATH);
        assert_eq!(log, b"");
    }

    #[test]
    fn readdir_merges_and_filters() {
        let lower = lower_with(&[("/d/a", b"1"), ("/d/b", b"2")]);
        let (fs, _) = overlay(lower);
        fs.shared
            .upper
            .mkdir("/d", 0o755, CreateContext::default())
            .unwrap();
        fs.shared
            .upper
            .create_file(
                "/d/c",
                OpenFlag::parse("w").unwrap(),
                0o644,
                CreateContext::default(),
            )
            .unwrap();
        fs.unlink("/d/b").unwrap();

        let mut entries = fs.readdir("/d").unwrap();
        entries.sort();
        assert_eq!(entries, ["a", "c"]);
    }

    #[test]
    fn deletion_log_is_hidden_from_root_listing() {
        let lower = lower_with(&[("/f", b"x")]);
        let (fs, _) = overlay(lower);
        fs.unlink("/f").unwrap();
        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn mkdir_over_visible_path_is_eexist() {
        let lower = lower_with(&[("/d/a", b"1")]);
        let (fs, _) = overlay(lower);
        assert_eq!(
            fs.mkdir("/d", 0o755, CreateContext::default())
                .unwrap_err()
                .errno,
            Errno::EEXIST
        );
    }

    #[test]
    fn mkdir_creates_parent_chain_with_merged_modes() {
        let lower = lower_with(&[("/a/b/f", b"1")]);
        let (fs, upper) = overlay(lower);
        fs.mkdir("/a/b/c", 0o700, CreateContext::default()).unwrap();
        assert!(upper.stat("/a").unwrap().is_dir());
        assert!(upper.stat("/a/b").unwrap().is_dir());
        assert_eq!(upper.stat("/a/b/c").unwrap().perm(), 0o700);
    }

    #[test]
    fn rename_marks_lower_source_deleted() {
        let lower = lower_with(&[("/f", b"v")]);
        let (fs, _) = overlay(lower);
        fs.rename("/f", "/g").unwrap();
        assert!(!fs.exists("/f").unwrap());
        assert_eq!(read_all(&fs, "/g"), b"v");
    }

    #[test]
    fn rmdir_requires_empty_merged_view() {
        let lower = lower_with(&[("/d/a", b"1")]);
        let (fs, _) = overlay(lower);
        assert_eq!(fs.rmdir("/d").unwrap_err().errno, Errno::ENOTEMPTY);
        fs.unlink("/d/a").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(!fs.exists("/d").unwrap());
    }

    #[test]
    fn truncating_preload_handle_copies_up() {
        let lower = lower_with(&[("/f", b"hello")]);
        let (fs, upper) = overlay(lower);
        let h = fs.open_file("/f", OpenFlag::parse("r+").unwrap()).unwrap();
        h.truncate(2).unwrap();
        assert_eq!(read_all(&fs, "/f"), b"he");
        assert_eq!(upper.stat("/f").unwrap().size, 2);
    }
}
