//! The high-level file object handed out by [`Vfs::open`](crate::Vfs::open).
//!
//! A [`File`] wraps a descriptor and its table entry. Reads and writes that
//! pass no position use, and advance, the per-descriptor position; explicit
//! positions leave it untouched. Once closed, every operation except
//! another `close` fails `EBADF`.

use std::fmt;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::sync::Arc;

use log::warn;
use smallvec::SmallVec;

use crate::errno::Errno;
use crate::errno::FsError;
use crate::errno::Result;
use crate::fd::Fd;
use crate::fd::OpenFile;
use crate::stats::Stats;
use crate::vfs::VfsInner;
use crate::watch::WatchEventType;

/// Positional read honoring the descriptor position when `position` is
/// `None`.
pub(crate) fn read_at(file: &OpenFile, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
    if !file.flag.readable {
        return Err(FsError::new(Errno::EBADF).with_syscall("read"));
    }
    let handle = file.handle()?;
    match position {
        Some(pos) => handle.read(buf, pos),
        None => {
            let start = file.position();
            let n = handle.read(buf, start)?;
            file.advance(start, n);
            Ok(n)
        }
    }
}

/// Positional write; append-mode descriptors always write at the end.
pub(crate) fn write_at(file: &OpenFile, data: &[u8], position: Option<u64>) -> Result<usize> {
    if !file.flag.writable && !file.flag.appendable {
        return Err(FsError::new(Errno::EBADF).with_syscall("write"));
    }
    let handle = file.handle()?;
    let (start, track) = if file.flag.appendable {
        (handle.stat()?.size, position.is_none())
    } else {
        match position {
            Some(pos) => (pos, false),
            None => (file.position(), true),
        }
    };
    let n = handle.write(data, start)?;
    if track {
        file.advance(start, n);
    }
    Ok(n)
}

/// Scatter read into consecutive buffers.
pub(crate) fn readv_at(
    file: &OpenFile,
    bufs: &mut [&mut [u8]],
    position: Option<u64>,
) -> Result<usize> {
    if !file.flag.readable {
        return Err(FsError::new(Errno::EBADF).with_syscall("read"));
    }
    let handle = file.handle()?;
    let start = position.unwrap_or_else(|| file.position());
    let mut total = 0usize;
    for buf in bufs.iter_mut() {
        let n = handle.read(buf, start + total as u64)?;
        total += n;
        if n < buf.len() {
            break;
        }
    }
    if position.is_none() {
        file.advance(start, total);
    }
    Ok(total)
}

/// Gather write from consecutive buffers, issued as one backend write.
pub(crate) fn writev_at(file: &OpenFile, bufs: &[&[u8]], position: Option<u64>) -> Result<usize> {
    let mut gathered: SmallVec<[u8; 512]> = SmallVec::new();
    for buf in bufs {
        gathered.extend_from_slice(buf);
    }
    write_at(file, &gathered, position)
}

/// An open file with an object API over its descriptor.
pub struct File {
    inner: Arc<VfsInner>,
    fd: Fd,
    file: Arc<OpenFile>,
}

impl File {
    pub(crate) fn new(inner: Arc<VfsInner>, fd: Fd, file: Arc<OpenFile>) -> Self {
        Self { inner, fd, file }
    }

    /// The underlying descriptor.
    pub fn fd(&self) -> Fd {
        self.fd
    }

    /// The path this file was opened at.
    pub fn path(&self) -> &str {
        &self.file.path
    }

    /// Read into `buf` at `position`, or at the descriptor position.
    pub fn read(&self, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
        read_at(&self.file, buf, position)
    }

    /// Write `data` at `position`, or at the descriptor position.
    pub fn write(&self, data: &[u8], position: Option<u64>) -> Result<usize> {
        let n = write_at(&self.file, data, position)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(n)
    }

    /// Scatter read.
    pub fn readv(&self, bufs: &mut [&mut [u8]], position: Option<u64>) -> Result<usize> {
        readv_at(&self.file, bufs, position)
    }

    /// Gather write.
    pub fn writev(&self, bufs: &[&[u8]], position: Option<u64>) -> Result<usize> {
        let n = writev_at(&self.file, bufs, position)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(n)
    }

    /// Attributes of the open file.
    pub fn stat(&self) -> Result<Stats> {
        self.file.handle()?.stat()
    }

    /// Change permission bits.
    pub fn chmod(&self, mode: u32) -> Result<()> {
        self.file.handle()?.chmod(mode)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(())
    }

    /// Change ownership.
    pub fn chown(&self, uid: u32, gid: u32) -> Result<()> {
        self.file.handle()?.chown(uid, gid)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(())
    }

    /// Set access and modification times.
    pub fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> Result<()> {
        self.file.handle()?.utimes(atime_ms, mtime_ms)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(())
    }

    /// Truncate or extend to `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.handle()?.truncate(len)?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(())
    }

    /// Flush data and metadata.
    pub fn sync(&self) -> Result<()> {
        self.file.handle()?.sync()
    }

    /// Flush file data only.
    pub fn datasync(&self) -> Result<()> {
        self.file.handle()?.datasync()
    }

    /// Close the file. Closing an already-closed file is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.file.mark_closed() {
            return Ok(());
        }
        let _ = self.inner.fds.remove(self.fd);
        self.file.close_backend()
    }

    /// Async twin of [`read`](Self::read).
    pub async fn read_async(&self, buf: &mut [u8], position: Option<u64>) -> Result<usize> {
        if !self.file.flag.readable {
            return Err(FsError::new(Errno::EBADF).with_syscall("read"));
        }
        let handle = self.file.handle()?;
        match position {
            Some(pos) => handle.read_async(buf, pos).await,
            None => {
                let start = self.file.position();
                let n = handle.read_async(buf, start).await?;
                self.file.advance(start, n);
                Ok(n)
            }
        }
    }

    /// Async twin of [`write`](Self::write).
    pub async fn write_async(&self, data: &[u8], position: Option<u64>) -> Result<usize> {
        if !self.file.flag.writable && !self.file.flag.appendable {
            return Err(FsError::new(Errno::EBADF).with_syscall("write"));
        }
        let handle = self.file.handle()?;
        let (start, track) = if self.file.flag.appendable {
            (handle.stat_async().await?.size, position.is_none())
        } else {
            match position {
                Some(pos) => (pos, false),
                None => (self.file.position(), true),
            }
        };
        let n = handle.write_async(data, start).await?;
        if track {
            self.file.advance(start, n);
        }
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(n)
    }

    /// Async twin of [`stat`](Self::stat).
    pub async fn stat_async(&self) -> Result<Stats> {
        self.file.handle()?.stat_async().await
    }

    /// Async twin of [`truncate`](Self::truncate).
    pub async fn truncate_async(&self, len: u64) -> Result<()> {
        self.file.handle()?.truncate_async(len).await?;
        self.inner.emit(WatchEventType::Change, &self.file.path);
        Ok(())
    }

    /// Async twin of [`sync`](Self::sync).
    pub async fn sync_async(&self) -> Result<()> {
        self.file.handle()?.sync_async().await
    }

    /// Async twin of [`datasync`](Self::datasync).
    pub async fn datasync_async(&self) -> Result<()> {
        self.file.handle()?.datasync_async().await
    }

    /// Async twin of [`close`](Self::close).
    pub async fn close_async(&self) -> Result<()> {
        if !self.file.mark_closed() {
            return Ok(());
        }
        let _ = self.inner.fds.remove(self.fd);
        self.file.close_backend_async().await
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("fd", &self.fd)
            .field("path", &self.file.path)
            .finish()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.file.is_closed() {
            if let Err(e) = self.close() {
                warn!("closing {} on drop failed: {e}", self.file.path);
            }
        }
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        File::read(self, buf, None).map_err(io::Error::from)
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        File::write(self, buf, None).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::from)
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.file.position() as i64 + delta,
            SeekFrom::End(delta) => {
                let size = self.stat().map_err(io::Error::from)?.size;
                size as i64 + delta
            }
        };
        if next < 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.file.set_position(next as u64);
        Ok(next as u64)
    }
}
