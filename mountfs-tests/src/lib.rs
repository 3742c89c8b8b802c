//! Shared fixtures for mountfs integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mountfs::Backend;
use mountfs::BackendMeta;
use mountfs::CreateContext;
use mountfs::FileHandle;
use mountfs::MemFs;
use mountfs::OpenFlag;
use mountfs::Result;
use mountfs::StatFs;
use mountfs::Stats;
use mountfs::Vfs;

/// Install the test logger once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Seed a namespace with files, creating parent directories as needed.
pub fn seed_tree(fs: &Vfs, files: &[(&str, &[u8])]) {
    for (path, content) in files {
        let dir = mountfs::paths::dirname(path);
        if dir != "/" {
            fs.mkdir(
                dir,
                mountfs::MkdirOptions {
                    recursive: true,
                    mode: 0o755,
                },
            )
            .expect("seed mkdir");
        }
        fs.write_file(path, content).expect("seed write");
    }
}

/// A backend whose async operations take a fixed amount of wall-clock
/// time. Useful for forcing overlap when exercising the mutex adapter.
#[derive(Debug)]
pub struct SlowBackend {
    inner: MemFs,
    delay: Duration,
}

impl SlowBackend {
    /// Wrap a fresh in-memory backend with the given per-call delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemFs::new(),
            delay,
        }
    }

    async fn pause(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

#[async_trait]
impl Backend for SlowBackend {
    fn meta(&self) -> BackendMeta {
        BackendMeta::new("slow-memfs")
    }

    fn stat(&self, path: &str) -> Result<Stats> {
        self.inner.stat(path)
    }

    fn open_file(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        self.inner.open_file(path, flag)
    }

    fn create_file(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        self.inner.create_file(path, flag, mode, ctx)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner.unlink(path)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.rmdir(path)
    }

    fn mkdir(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        self.inner.mkdir(path, mode, ctx)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        self.inner.readdir(path)
    }

    fn link(&self, src: &str, dst: &str) -> Result<()> {
        self.inner.link(src, dst)
    }

    fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        self.inner.sync(path, data, stats)
    }

    fn statfs(&self, path: &str) -> Result<StatFs> {
        self.inner.statfs(path)
    }

    async fn stat_async(&self, path: &str) -> Result<Stats> {
        self.pause().await;
        self.inner.stat(path)
    }

    async fn open_file_async(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        self.pause().await;
        self.inner.open_file(path, flag)
    }

    async fn create_file_async(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        self.pause().await;
        self.inner.create_file(path, flag, mode, ctx)
    }

    async fn readdir_async(&self, path: &str) -> Result<Vec<String>> {
        self.pause().await;
        self.inner.readdir(path)
    }

    async fn unlink_async(&self, path: &str) -> Result<()> {
        self.pause().await;
        self.inner.unlink(path)
    }

    async fn mkdir_async(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        self.pause().await;
        self.inner.mkdir(path, mode, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_tree_builds_parents() {
        init_logging();
        let fs = Vfs::new();
        seed_tree(&fs, &[("/deep/ly/nested/file", b"x")]);
        assert!(fs.stat("/deep/ly/nested").unwrap().is_dir());
        assert_eq!(fs.read_file("/deep/ly/nested/file").unwrap(), b"x");
    }

    #[tokio::test]
    async fn slow_backend_is_usable_through_the_vfs() {
        init_logging();
        let fs = Vfs::with_root(Arc::new(SlowBackend::new(Duration::from_millis(5))));
        fs.write_file_async("/f", b"slow").await.unwrap();
        assert_eq!(fs.read_file_async("/f").await.unwrap(), b"slow");
    }
}
