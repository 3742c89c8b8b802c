//! A simple in-memory storage backend.
//!
//! `MemFs` keeps a flat map from normalized local paths to nodes. It is the
//! default root mount and the substrate most tests run on; symlinks are
//! stored as regular nodes whose mode carries `S_IFLNK` and whose content
//! is the link target, which is exactly how the VFS materializes them.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Backend;
use crate::backend::BackendMeta;
use crate::backend::BackendOptions;
use crate::backend::CreateContext;
use crate::backend::FileHandle;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::Result;
use crate::flags::OpenFlag;
use crate::path;
use crate::stats::Credentials;
use crate::stats::FileType;
use crate::stats::Stats;

/// Options for [`MemFs::with_options`].
#[derive(Clone, Copy, Debug)]
pub struct MemFsOptions {
    /// Refuse every mutation. Useful for the lower layer of an overlay.
    pub readonly: bool,
    /// Permission bits of the root directory.
    pub root_mode: u32,
}

impl Default for MemFsOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            root_mode: 0o777,
        }
    }
}

impl BackendOptions for MemFsOptions {
    fn validate(&self) -> Result<()> {
        if self.root_mode & !0o7777 != 0 {
            return Err(err(Errno::EINVAL, "validate", "/"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemNode {
    stats: Stats,
    data: Vec<u8>,
}

type NodeRef = Arc<RwLock<MemNode>>;

/// In-memory backend.
#[derive(Debug)]
pub struct MemFs {
    nodes: RwLock<BTreeMap<String, NodeRef>>,
    next_ino: AtomicU64,
    readonly: bool,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// An empty writable file system.
    pub fn new() -> Self {
        Self::build(MemFsOptions::default())
    }

    /// Build with explicit options.
    pub fn with_options(options: MemFsOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(options))
    }

    fn build(options: MemFsOptions) -> Self {
        let mut root = Stats::new(
            FileType::Directory,
            options.root_mode,
            Credentials::default(),
        );
        root.ino = 1;
        root.nlink = 2;
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Arc::new(RwLock::new(MemNode {
                stats: root,
                data: Vec::new(),
            })),
        );
        Self {
            nodes: RwLock::new(nodes),
            next_ino: AtomicU64::new(2),
            readonly: options.readonly,
        }
    }

    fn node(&self, p: &str) -> Result<NodeRef> {
        self.nodes
            .read()
            .get(p)
            .cloned()
            .ok_or_else(|| err(Errno::ENOENT, "stat", p))
    }

    fn check_writable(&self, syscall: &'static str, p: &str) -> Result<()> {
        if self.readonly {
            return Err(err(Errno::EPERM, syscall, p));
        }
        Ok(())
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    fn children_of<'a>(
        nodes: &'a BTreeMap<String, NodeRef>,
        p: &str,
    ) -> impl Iterator<Item = (&'a String, &'a NodeRef)> {
        let marker = if p == "/" {
            "/".to_string()
        } else {
            format!("{p}/")
        };
        nodes
            .range(marker.clone()..)
            .take_while(move |(k, _)| k.starts_with(&marker))
            .filter(|(k, _)| k.as_str() != "/")
    }
}

#[async_trait::async_trait]
impl Backend for MemFs {
    fn meta(&self) -> BackendMeta {
        BackendMeta {
            name: "memfs",
            readonly: self.readonly,
            features: Vec::new(),
        }
    }

    fn stat(&self, p: &str) -> Result<Stats> {
        Ok(self.node(p)?.read().stats)
    }

    fn open_file(&self, p: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        let node = self.node(p)?;
        {
            let guard = node.read();
            if guard.stats.is_dir() && (flag.writable || flag.appendable) {
                return Err(err(Errno::EISDIR, "open", p));
            }
        }
        if (flag.writable || flag.appendable) && self.readonly {
            return Err(err(Errno::EPERM, "open", p));
        }
        Ok(Arc::new(MemHandle { node }))
    }

    fn create_file(
        &self,
        p: &str,
        _flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        self.check_writable("create", p)?;
        let parent = path::dirname(p);
        let parent_node = self
            .node(parent)
            .map_err(|e| e.with_syscall("create"))?;
        if !parent_node.read().stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "create", p));
        }

        let file_type = FileType::from_mode(mode).unwrap_or(FileType::RegularFile);
        let mut stats = Stats::new(file_type, mode & 0o7777, Credentials::new(ctx.uid, ctx.gid));
        stats.ino = self.alloc_ino();
        let node = Arc::new(RwLock::new(MemNode {
            stats,
            data: Vec::new(),
        }));
        self.nodes.write().insert(p.to_string(), node.clone());
        Ok(Arc::new(MemHandle { node }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable("rename", from)?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get(from)
            .cloned()
            .ok_or_else(|| err(Errno::ENOENT, "rename", from))?;

        if let Some(existing) = nodes.get(to) {
            let existing_is_dir = existing.read().stats.is_dir();
            if existing_is_dir {
                if Self::children_of(&nodes, to).next().is_some() {
                    return Err(err(Errno::ENOTEMPTY, "rename", to));
                }
            } else if node.read().stats.is_dir() {
                return Err(err(Errno::ENOTDIR, "rename", to));
            }
        }

        let moved: Vec<(String, NodeRef)> = Self::children_of(&nodes, from)
            .map(|(k, v)| (format!("{to}{}", &k[from.len()..]), v.clone()))
            .collect();
        let old_children: Vec<String> = Self::children_of(&nodes, from)
            .map(|(k, _)| k.clone())
            .collect();
        for k in old_children {
            nodes.remove(&k);
        }
        nodes.remove(from);
        nodes.insert(to.to_string(), node);
        for (k, v) in moved {
            nodes.insert(k, v);
        }
        Ok(())
    }

    fn unlink(&self, p: &str) -> Result<()> {
        self.check_writable("unlink", p)?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get(p)
            .cloned()
            .ok_or_else(|| err(Errno::ENOENT, "unlink", p))?;
        if node.read().stats.is_dir() {
            return Err(err(Errno::EISDIR, "unlink", p));
        }
        nodes.remove(p);
        let mut guard = node.write();
        guard.stats.nlink = guard.stats.nlink.saturating_sub(1);
        guard.stats.touch_changed();
        Ok(())
    }

    fn rmdir(&self, p: &str) -> Result<()> {
        self.check_writable("rmdir", p)?;
        if p == "/" {
            return Err(err(Errno::EBUSY, "rmdir", p));
        }
        let mut nodes = self.nodes.write();
        let node = nodes
            .get(p)
            .cloned()
            .ok_or_else(|| err(Errno::ENOENT, "rmdir", p))?;
        if !node.read().stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "rmdir", p));
        }
        if Self::children_of(&nodes, p).next().is_some() {
            return Err(err(Errno::ENOTEMPTY, "rmdir", p));
        }
        nodes.remove(p);
        Ok(())
    }

    fn mkdir(&self, p: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        self.check_writable("mkdir", p)?;
        let mut nodes = self.nodes.write();
        if nodes.contains_key(p) {
            return Err(err(Errno::EEXIST, "mkdir", p));
        }
        let parent = path::dirname(p);
        let parent_node = nodes
            .get(parent)
            .ok_or_else(|| err(Errno::ENOENT, "mkdir", p))?;
        if !parent_node.read().stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "mkdir", p));
        }

        let mut stats = Stats::new(
            FileType::Directory,
            mode & 0o7777,
            Credentials::new(ctx.uid, ctx.gid),
        );
        stats.ino = self.alloc_ino();
        stats.nlink = 2;
        nodes.insert(
            p.to_string(),
            Arc::new(RwLock::new(MemNode {
                stats,
                data: Vec::new(),
            })),
        );
        Ok(())
    }

    fn readdir(&self, p: &str) -> Result<Vec<String>> {
        let node = self.node(p).map_err(|e| e.with_syscall("readdir"))?;
        if !node.read().stats.is_dir() {
            return Err(err(Errno::ENOTDIR, "readdir", p));
        }
        let nodes = self.nodes.read();
        Ok(Self::children_of(&nodes, p)
            .filter(|(k, _)| !k[p.len()..].trim_start_matches('/').contains('/'))
            .map(|(k, _)| path::basename(k).to_string())
            .collect())
    }

    fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.check_writable("link", src)?;
        let mut nodes = self.nodes.write();
        let node = nodes
            .get(src)
            .cloned()
            .ok_or_else(|| err(Errno::ENOENT, "link", src))?;
        if node.read().stats.is_dir() {
            return Err(err(Errno::EPERM, "link", src));
        }
        if nodes.contains_key(dst) {
            return Err(err(Errno::EEXIST, "link", dst));
        }
        {
            let mut guard = node.write();
            guard.stats.nlink += 1;
            guard.stats.touch_changed();
        }
        nodes.insert(dst.to_string(), node);
        Ok(())
    }

    fn sync(&self, p: &str, data: &[u8], stats: &Stats) -> Result<()> {
        self.check_writable("sync", p)?;
        let mut nodes = self.nodes.write();
        match nodes.get(p) {
            Some(node) => {
                let mut guard = node.write();
                guard.data = data.to_vec();
                let ino = guard.stats.ino;
                guard.stats = *stats;
                guard.stats.ino = ino;
                guard.stats.size = data.len() as u64;
                guard.stats.blocks = (data.len() as u64).div_ceil(512);
            }
            None => {
                let mut stats = *stats;
                stats.ino = self.alloc_ino();
                stats.size = data.len() as u64;
                stats.blocks = (data.len() as u64).div_ceil(512);
                nodes.insert(
                    p.to_string(),
                    Arc::new(RwLock::new(MemNode {
                        stats,
                        data: data.to_vec(),
                    })),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MemHandle {
    node: NodeRef,
}

#[async_trait::async_trait]
impl FileHandle for MemHandle {
    fn stat(&self) -> Result<Stats> {
        Ok(self.node.read().stats)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.node.read();
        let offset = offset as usize;
        if offset >= guard.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(guard.data.len() - offset);
        buf[..n].copy_from_slice(&guard.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut guard = self.node.write();
        let end = offset as usize + data.len();
        if guard.data.len() < end {
            guard.data.resize(end, 0);
        }
        guard.data[offset as usize..end].copy_from_slice(data);
        guard.stats.size = guard.data.len() as u64;
        guard.stats.blocks = guard.stats.size.div_ceil(512);
        guard.stats.touch_modified();
        Ok(data.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut guard = self.node.write();
        guard.data.resize(len as usize, 0);
        guard.stats.size = len;
        guard.stats.blocks = len.div_ceil(512);
        guard.stats.touch_modified();
        Ok(())
    }

    fn chmod(&self, mode: u32) -> Result<()> {
        let mut guard = self.node.write();
        guard.stats.mode = (guard.stats.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        guard.stats.touch_changed();
        Ok(())
    }

    fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        let mut guard = self.node.write();
        guard.stats.uid = uid;
        guard.stats.gid = gid;
        guard.stats.touch_changed();
        Ok(())
    }

    fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let mut guard = self.node.write();
        guard.stats.atime_ms = atime_ms;
        guard.stats.mtime_ms = mtime_ms;
        guard.stats.touch_changed();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CreateContext {
        CreateContext::default()
    }

    fn flag(s: &str) -> OpenFlag {
        OpenFlag::parse(s).unwrap()
    }

    #[test]
    fn create_write_read() {
        let fs = MemFs::new();
        let h = fs
            .create_file("/f", flag("w"), libc::S_IFREG as u32 | 0o644, ctx())
            .unwrap();
        assert_eq!(h.write(b"hello", 0).unwrap(), 5);

        let h = fs.open_file("/f", flag("r")).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(h.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fs.stat("/f").unwrap().size, 5);
    }

    #[test]
    fn write_past_end_zero_fills() {
        let fs = MemFs::new();
        let h = fs
            .create_file("/f", flag("w"), libc::S_IFREG as u32 | 0o644, ctx())
            .unwrap();
        h.write(b"x", 4).unwrap();
        let mut buf = [1u8; 5];
        h.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"\0\0\0\0x");
    }

    #[test]
    fn mkdir_requires_parent() {
        let fs = MemFs::new();
        assert_eq!(
            fs.mkdir("/a/b", 0o755, ctx()).unwrap_err().errno,
            Errno::ENOENT
        );
        fs.mkdir("/a", 0o755, ctx()).unwrap();
        fs.mkdir("/a/b", 0o755, ctx()).unwrap();
        assert_eq!(
            fs.mkdir("/a", 0o755, ctx()).unwrap_err().errno,
            Errno::EEXIST
        );
    }

    #[test]
    fn readdir_lists_one_level() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755, ctx()).unwrap();
        fs.create_file("/d/a", flag("w"), 0o644, ctx()).unwrap();
        fs.mkdir("/d/sub", 0o755, ctx()).unwrap();
        fs.create_file("/d/sub/deep", flag("w"), 0o644, ctx()).unwrap();

        let mut names = fs.readdir("/d").unwrap();
        names.sort();
        assert_eq!(names, ["a", "sub"]);
    }

    #[test]
    fn rename_moves_directory_subtree() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755, ctx()).unwrap();
        fs.create_file("/d/f", flag("w"), 0o644, ctx())
            .unwrap()
            .write(b"v", 0)
            .unwrap();
        fs.rename("/d", "/e").unwrap();
        assert!(!fs.exists("/d").unwrap());
        assert_eq!(fs.stat("/e/f").unwrap().size, 1);
    }

    #[test]
    fn unlink_and_rmdir_kind_checks() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755, ctx()).unwrap();
        fs.create_file("/f", flag("w"), 0o644, ctx()).unwrap();
        assert_eq!(fs.unlink("/d").unwrap_err().errno, Errno::EISDIR);
        assert_eq!(fs.rmdir("/f").unwrap_err().errno, Errno::ENOTDIR);
        fs.create_file("/d/x", flag("w"), 0o644, ctx()).unwrap();
        assert_eq!(fs.rmdir("/d").unwrap_err().errno, Errno::ENOTEMPTY);
        fs.unlink("/d/x").unwrap();
        fs.rmdir("/d").unwrap();
    }

    #[test]
    fn hard_link_shares_content() {
        let fs = MemFs::new();
        let h = fs.create_file("/a", flag("w"), 0o644, ctx()).unwrap();
        h.write(b"shared", 0).unwrap();
        fs.link("/a", "/b").unwrap();
        assert_eq!(fs.stat("/b").unwrap().size, 6);
        assert_eq!(fs.stat("/a").unwrap().nlink, 2);

        let h = fs.open_file("/b", flag("r+")).unwrap();
        h.write(b"SHARED", 0).unwrap();
        let mut buf = [0u8; 6];
        fs.open_file("/a", flag("r")).unwrap().read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"SHARED");
    }

    #[test]
    fn readonly_rejects_mutation() {
        let fs = MemFs::with_options(MemFsOptions {
            readonly: true,
            root_mode: 0o755,
        })
        .unwrap();
        assert_eq!(
            fs.mkdir("/d", 0o755, ctx()).unwrap_err().errno,
            Errno::EPERM
        );
        assert!(fs.meta().readonly);
    }

    #[test]
    fn options_validation() {
        let bad = MemFsOptions {
            readonly: false,
            root_mode: 0o20777,
        };
        assert!(bad.validate().is_err());
    }
}
