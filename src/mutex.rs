//! Whole-backend serialization.
//!
//! [`Mutexed`] wraps any backend and funnels every call through a FIFO lock
//! chain, so composed operations built from several backend calls become
//! atomic with respect to each other. The lock covers the whole backend;
//! the `path`/`syscall` arguments are diagnostics only.

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::backend::Backend;
use crate::backend::BackendMeta;
use crate::backend::CreateContext;
use crate::backend::FileHandle;
use crate::errno::err;
use crate::errno::Errno;
use crate::errno::Result;
use crate::flags::OpenFlag;
use crate::stats::StatFs;
use crate::stats::Stats;

/// Default deadline after which a queued lock raises `EDEADLK`.
pub const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(5);

/// An acquired (or queued) position in a lock chain.
///
/// Dropping a lock releases it, so scope exit on any path unlocks.
pub struct Lock {
    release: Option<oneshot::Sender<()>>,
    prev: Option<oneshot::Receiver<()>>,
    holders: Arc<AtomicUsize>,
    path: String,
    syscall: &'static str,
}

impl Lock {
    /// Wait until every earlier lock in the chain has been released.
    ///
    /// After `deadline` the wait gives up with `EDEADLK`; the abandoned
    /// queue slot is forwarded in the background so later locks still
    /// acquire in order.
    async fn wait(&mut self, deadline: Duration) -> Result<()> {
        let Some(mut prev) = self.prev.take() else {
            return Ok(());
        };
        match tokio::time::timeout(deadline, &mut prev).await {
            // A dropped predecessor counts as released.
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "lock on {} ({}) still queued after {:?}, reporting EDEADLK",
                    self.path, self.syscall, deadline
                );
                let release = self.release.take();
                let holders = self.holders.clone();
                tokio::spawn(async move {
                    let _ = prev.await;
                    if let Some(tx) = release {
                        let _ = tx.send(());
                    }
                    holders.fetch_sub(1, Ordering::SeqCst);
                });
                Err(err(Errno::EDEADLK, self.syscall, &self.path))
            }
        }
    }

    /// Release the lock.
    pub fn unlock(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
            self.holders.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("path", &self.path)
            .field("syscall", &self.syscall)
            .finish()
    }
}

/// The FIFO chain backing one mutexed backend.
struct LockChain {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    holders: Arc<AtomicUsize>,
    deadline: Duration,
}

impl LockChain {
    fn new(deadline: Duration) -> Self {
        Self {
            tail: Mutex::new(None),
            holders: Arc::new(AtomicUsize::new(0)),
            deadline,
        }
    }

    /// Append a lock to the chain; the caller must `wait` it.
    fn enqueue(&self, path: &str, syscall: &'static str) -> Lock {
        let (tx, rx_for_next) = oneshot::channel();
        let prev = {
            let mut tail = self.tail.lock();
            self.holders.fetch_add(1, Ordering::SeqCst);
            tail.replace(rx_for_next)
        };
        Lock {
            release: Some(tx),
            prev,
            holders: self.holders.clone(),
            path: path.to_string(),
            syscall,
        }
    }

    async fn lock(&self, path: &str, syscall: &'static str) -> Result<Lock> {
        let mut lock = self.enqueue(path, syscall);
        lock.wait(self.deadline).await?;
        Ok(lock)
    }

    /// Acquire only if no lock is outstanding, else `EBUSY`.
    fn lock_sync(&self, path: &str, syscall: &'static str) -> Result<Lock> {
        let mut tail = self.tail.lock();
        if self.holders.load(Ordering::SeqCst) != 0 {
            return Err(err(Errno::EBUSY, syscall, path));
        }
        let (tx, rx_for_next) = oneshot::channel();
        self.holders.fetch_add(1, Ordering::SeqCst);
        tail.replace(rx_for_next);
        Ok(Lock {
            release: Some(tx),
            prev: None,
            holders: self.holders.clone(),
            path: path.to_string(),
            syscall,
        })
    }

    fn is_locked(&self) -> bool {
        self.holders.load(Ordering::SeqCst) != 0
    }
}

/// A backend wrapper that serializes every call to the wrapped backend.
pub struct Mutexed<B> {
    inner: B,
    chain: LockChain,
}

impl<B: Backend> Mutexed<B> {
    /// Wrap `inner` with the default `EDEADLK` deadline.
    pub fn new(inner: B) -> Self {
        Self::with_deadline(inner, DEFAULT_LOCK_DEADLINE)
    }

    /// Wrap `inner` with an explicit diagnostic deadline.
    pub fn with_deadline(inner: B, deadline: Duration) -> Self {
        Self {
            inner,
            chain: LockChain::new(deadline),
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Queue for the whole-backend lock. Calls on the same wrapper acquire
    /// strictly in the order `lock` was invoked.
    pub async fn lock(&self, path: &str, syscall: &'static str) -> Result<Lock> {
        self.chain.lock(path, syscall).await
    }

    /// Acquire immediately or fail `EBUSY`.
    pub fn lock_sync(&self, path: &str, syscall: &'static str) -> Result<Lock> {
        self.chain.lock_sync(path, syscall)
    }

    /// True while any lock is outstanding.
    pub fn is_locked(&self) -> bool {
        self.chain.is_locked()
    }
}

impl<B: fmt::Debug> fmt::Debug for Mutexed<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutexed").field("inner", &self.inner).finish()
    }
}

#[async_trait]
impl<B: Backend> Backend for Mutexed<B> {
    fn meta(&self) -> BackendMeta {
        self.inner.meta()
    }

    fn ready(&self) -> Result<()> {
        let _lock = self.chain.lock_sync("/", "ready")?;
        self.inner.ready()
    }

    fn stat(&self, path: &str) -> Result<Stats> {
        let _lock = self.chain.lock_sync(path, "stat")?;
        self.inner.stat(path)
    }

    fn open_file(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        let _lock = self.chain.lock_sync(path, "open")?;
        self.inner.open_file(path, flag)
    }

    fn create_file(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        let _lock = self.chain.lock_sync(path, "create")?;
        self.inner.create_file(path, flag, mode, ctx)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let _lock = self.chain.lock_sync(path, "exists")?;
        self.inner.exists(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _lock = self.chain.lock_sync(from, "rename")?;
        self.inner.rename(from, to)
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let _lock = self.chain.lock_sync(path, "unlink")?;
        self.inner.unlink(path)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let _lock = self.chain.lock_sync(path, "rmdir")?;
        self.inner.rmdir(path)
    }

    fn mkdir(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        let _lock = self.chain.lock_sync(path, "mkdir")?;
        self.inner.mkdir(path, mode, ctx)
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let _lock = self.chain.lock_sync(path, "readdir")?;
        self.inner.readdir(path)
    }

    fn link(&self, src: &str, dst: &str) -> Result<()> {
        let _lock = self.chain.lock_sync(src, "link")?;
        self.inner.link(src, dst)
    }

    fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        let _lock = self.chain.lock_sync(path, "sync")?;
        self.inner.sync(path, data, stats)
    }

    fn statfs(&self, path: &str) -> Result<StatFs> {
        let _lock = self.chain.lock_sync(path, "statfs")?;
        self.inner.statfs(path)
    }

    async fn ready_async(&self) -> Result<()> {
        let _lock = self.chain.lock("/", "ready").await?;
        self.inner.ready_async().await
    }

    async fn stat_async(&self, path: &str) -> Result<Stats> {
        let _lock = self.chain.lock(path, "stat").await?;
        self.inner.stat_async(path).await
    }

    async fn open_file_async(&self, path: &str, flag: OpenFlag) -> Result<Arc<dyn FileHandle>> {
        let _lock = self.chain.lock(path, "open").await?;
        self.inner.open_file_async(path, flag).await
    }

    async fn create_file_async(
        &self,
        path: &str,
        flag: OpenFlag,
        mode: u32,
        ctx: CreateContext,
    ) -> Result<Arc<dyn FileHandle>> {
        let _lock = self.chain.lock(path, "create").await?;
        self.inner.create_file_async(path, flag, mode, ctx).await
    }

    async fn exists_async(&self, path: &str) -> Result<bool> {
        let _lock = self.chain.lock(path, "exists").await?;
        self.inner.exists_async(path).await
    }

    async fn rename_async(&self, from: &str, to: &str) -> Result<()> {
        let _lock = self.chain.lock(from, "rename").await?;
        self.inner.rename_async(from, to).await
    }

    async fn unlink_async(&self, path: &str) -> Result<()> {
        let _lock = self.chain.lock(path, "unlink").await?;
        self.inner.unlink_async(path).await
    }

    async fn rmdir_async(&self, path: &str) -> Result<()> {
        let _lock = self.chain.lock(path, "rmdir").await?;
        self.inner.rmdir_async(path).await
    }

    async fn mkdir_async(&self, path: &str, mode: u32, ctx: CreateContext) -> Result<()> {
        let _lock = self.chain.lock(path, "mkdir").await?;
        self.inner.mkdir_async(path, mode, ctx).await
    }

    async fn readdir_async(&self, path: &str) -> Result<Vec<String>> {
        let _lock = self.chain.lock(path, "readdir").await?;
        self.inner.readdir_async(path).await
    }

    async fn link_async(&self, src: &str, dst: &str) -> Result<()> {
        let _lock = self.chain.lock(src, "link").await?;
        self.inner.link_async(src, dst).await
    }

    async fn sync_async(&self, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
        let _lock = self.chain.lock(path, "sync").await?;
        self.inner.sync_async(path, data, stats).await
    }

    async fn statfs_async(&self, path: &str) -> Result<StatFs> {
        let _lock = self.chain.lock(path, "statfs").await?;
        self.inner.statfs_async(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;

    #[tokio::test]
    async fn fifo_order() {
        let fs = Arc::new(Mutexed::new(MemFs::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Queue three locks strictly in sequence, then release them from
        // separate tasks with inverted delays; completion must stay FIFO.
        let a = fs.lock("/r", "t").await.unwrap();
        let b_fut = {
            let fs = fs.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let lock = fs.lock("/r", "t").await.unwrap();
                order.lock().push("b");
                lock.unlock();
            })
        };
        let c_fut = {
            let fs = fs.clone();
            let order = order.clone();
            tokio::spawn(async move {
                // Give task b time to enqueue first.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let lock = fs.lock("/r", "t").await.unwrap();
                order.lock().push("c");
                lock.unlock();
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        order.lock().push("a");
        a.unlock();

        b_fut.await.unwrap();
        c_fut.await.unwrap();
        assert_eq!(*order.lock(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn serialized_increments() {
        let fs = Arc::new(Mutexed::new(MemFs::new()));
        let x = Arc::new(Mutex::new(1u32));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let fs = fs.clone();
            let x = x.clone();
            tasks.push(tokio::spawn(async move {
                let lock = fs.lock("/r", "t").await.unwrap();
                let read = *x.lock();
                tokio::time::sleep(Duration::from_millis(100)).await;
                *x.lock() = read + 1;
                lock.unlock();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*x.lock(), 4);
    }

    #[tokio::test]
    async fn lock_sync_is_ebusy_while_held() {
        let fs = Mutexed::new(MemFs::new());
        let held = fs.lock("/p", "t").await.unwrap();
        assert!(fs.is_locked());
        assert_eq!(fs.lock_sync("/p", "t").unwrap_err().errno, Errno::EBUSY);
        assert_eq!(fs.stat("/").unwrap_err().errno, Errno::EBUSY);
        held.unlock();
        assert!(!fs.is_locked());
        assert!(fs.stat("/").is_ok());
    }

    #[tokio::test]
    async fn deadline_reports_edeadlk() {
        let fs = Mutexed::with_deadline(MemFs::new(), Duration::from_millis(20));
        let held = fs.lock("/p", "t").await.unwrap();
        let e = fs.lock("/p", "t").await.unwrap_err();
        assert_eq!(e.errno, Errno::EDEADLK);
        held.unlock();
        // The chain recovers after the diagnostic.
        let again = fs.lock("/p", "t").await.unwrap();
        again.unlock();
    }

    #[tokio::test]
    async fn drop_releases_like_unlock() {
        let fs = Mutexed::new(MemFs::new());
        {
            let _scoped = fs.lock("/p", "t").await.unwrap();
            assert!(fs.is_locked());
        }
        assert!(!fs.is_locked());
    }
}
