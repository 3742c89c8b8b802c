//! The mount table: backends spliced into a single namespace.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::Backend;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::Result;
use crate::path;

/// The outcome of resolving a user path against the mount table.
#[derive(Clone)]
pub struct Resolved {
    /// Backend owning the path.
    pub backend: Arc<dyn Backend>,
    /// The path rewritten into the backend's own namespace.
    pub local_path: String,
    /// The mount point the path resolved under.
    pub mount_point: String,
}

impl Resolved {
    /// Substitution pairs for rewriting backend-local error paths back to
    /// the user-facing form.
    pub fn error_paths<'a>(&'a self, user_path: &'a str) -> [(&'a str, &'a str); 1] {
        [(self.local_path.as_str(), user_path)]
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("mount_point", &self.mount_point)
            .field("local_path", &self.local_path)
            .field("backend", &self.backend.meta().name)
            .finish()
    }
}

struct MountEntry {
    point: String,
    backend: Arc<dyn Backend>,
}

/// Mount points ordered by descending length so that resolution picks the
/// longest matching prefix. Root is always present.
pub struct MountTable {
    entries: RwLock<Vec<MountEntry>>,
}

impl MountTable {
    /// A table with `root` mounted at `/`.
    pub fn new(root: Arc<dyn Backend>) -> Self {
        Self {
            entries: RwLock::new(vec![MountEntry {
                point: "/".to_string(),
                backend: root,
            }]),
        }
    }

    /// Splice `backend` into the namespace at `point`.
    ///
    /// The point must be absolute and normalized and must not already be
    /// mounted. Mounting does not create the mount point; the VFS checks
    /// that the parent exists before calling this.
    pub fn mount(&self, point: &str, backend: Arc<dyn Backend>) -> Result<()> {
        let normalized = path::normalize(point)?;
        if normalized != point {
            return Err(err(Errno::EINVAL, "mount", point));
        }
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.point == point) {
            return Err(err(Errno::EBUSY, "mount", point));
        }
        let at = entries
            .iter()
            .position(|e| e.point.len() < point.len())
            .unwrap_or(entries.len());
        entries.insert(
            at,
            MountEntry {
                point: point.to_string(),
                backend,
            },
        );
        Ok(())
    }

    /// Remove the mount at `point`. Unknown points are an error; the same
    /// point may be mounted again afterwards.
    pub fn umount(&self, point: &str) -> Result<Arc<dyn Backend>> {
        if point == "/" {
            return Err(err(Errno::EINVAL, "umount", point));
        }
        let mut entries = self.entries.write();
        match entries.iter().position(|e| e.point == point) {
            Some(idx) => Ok(entries.remove(idx).backend),
            None => Err(err(Errno::EINVAL, "umount", point)),
        }
    }

    /// Resolve a normalized absolute path to the backend owning it,
    /// rewriting the path to backend-local form.
    pub fn resolve(&self, p: &str) -> Result<Resolved> {
        let entries = self.entries.read();
        for entry in entries.iter() {
            if path::is_within(&entry.point, p) {
                let suffix = &p[entry.point.len()..];
                let local_path = if suffix.is_empty() {
                    "/".to_string()
                } else if entry.point == "/" {
                    p.to_string()
                } else {
                    suffix.to_string()
                };
                return Ok(Resolved {
                    backend: entry.backend.clone(),
                    local_path,
                    mount_point: entry.point.clone(),
                });
            }
        }
        // Root is always mounted, so this is unreachable for normalized
        // absolute paths.
        Err(err(Errno::ENOENT, "resolve", p))
    }

    /// Basenames of mount points whose parent directory is `p`, for the
    /// readdir union.
    pub fn child_mounts(&self, p: &str) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| e.point != "/" && path::dirname(&e.point) == p)
            .map(|e| path::basename(&e.point).to_string())
            .collect()
    }

    /// Snapshot of `(mount_point, backend)` pairs in resolution order.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.point.clone(), e.backend.clone()))
            .collect()
    }
}

impl fmt::Debug for MountTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let points: Vec<String> = self.entries.read().iter().map(|e| e.point.clone()).collect();
        f.debug_struct("MountTable").field("points", &points).finish()
    }
}
