//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use mountfs::Backend;
use mountfs::CreateContext;
use mountfs::MemFs;
use mountfs::OpenFlag;
use mountfs::Vfs;

/// A fresh in-memory backend pre-populated with `files`, parents included.
pub fn seed_backend(files: &[(&str, &[u8])]) -> Arc<MemFs> {
    let fs = Arc::new(MemFs::new());
    for (path, content) in files {
        let mut missing = Vec::new();
        let mut dir = mountfs::paths::dirname(path).to_string();
        while dir != "/" && !fs.exists(&dir).unwrap() {
            missing.push(dir.clone());
            dir = mountfs::paths::dirname(&dir).to_string();
        }
        for d in missing.into_iter().rev() {
            fs.mkdir(&d, 0o755, CreateContext::default()).unwrap();
        }
        let handle = fs
            .create_file(
                path,
                OpenFlag::parse("w").unwrap(),
                0o644,
                CreateContext::default(),
            )
            .unwrap();
        handle.write(content, 0).unwrap();
        handle.close().unwrap();
    }
    fs
}

/// Read a whole file straight from a backend, bypassing the VFS.
pub fn backend_read(fs: &dyn Backend, path: &str) -> Vec<u8> {
    let stats = fs.stat(path).unwrap();
    let handle = fs.open_file(path, OpenFlag::parse("r").unwrap()).unwrap();
    let mut buf = vec![0u8; stats.size as usize];
    let n = handle.read(&mut buf, 0).unwrap();
    buf.truncate(n);
    handle.close().unwrap();
    buf
}

/// A namespace with `backend` mounted at `point`.
pub fn vfs_with_mount(point: &str, backend: Arc<dyn Backend>) -> Vfs {
    let fs = Vfs::new();
    let parent = mountfs::paths::dirname(point);
    if parent != "/" {
        fs.mkdir(
            parent,
            mountfs::MkdirOptions {
                recursive: true,
                mode: 0o755,
            },
        )
        .unwrap();
    }
    fs.mkdir(point, mountfs::MkdirOptions::default()).unwrap();
    fs.mount(point, backend).unwrap();
    fs
}
