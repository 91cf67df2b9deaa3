use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use crate::error::{BurrowError, Result};

/// Positioned file I/O seam used by the meta manager and the pager.
pub trait FileIo: Send + Sync + 'static {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn truncate(&self, len: u64) -> Result<()>;
}

#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` read/write, creating it exclusively first and falling
    /// back to a plain open when the file already exists.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => Ok(Self::new(file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok(Self::new(file))
            }
            Err(err) => Err(BurrowError::Io(err)),
        }
    }

    /// Opens `path` read-only; the file must already exist.
    pub fn open_ro(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file))
    }

    pub fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !dst.is_empty() {
            let read = self.inner.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn read_exact(&self, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !dst.is_empty() {
            let read = self.inner.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        while !src.is_empty() {
            let written = self.inner.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn write_all(&self, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !src.is_empty() {
            let written = self.inner.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.read_exact(off, dst).map_err(BurrowError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all(off, src).map_err(BurrowError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(BurrowError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata().map_err(BurrowError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(BurrowError::from)
    }
}

/// Takes a shared advisory lock over the whole file, without blocking.
pub fn lock_shared(file: &File) -> Result<()> {
    lock_region(file, false)
}

/// Takes an exclusive advisory lock over the whole file, without blocking.
pub fn lock_exclusive(file: &File) -> Result<()> {
    lock_region(file, true)
}

#[cfg(unix)]
fn lock_region(file: &File, exclusive: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut flock = libc::flock {
        l_type: if exclusive {
            libc::F_WRLCK as _
        } else {
            libc::F_RDLCK as _
        },
        l_whence: libc::SEEK_SET as _,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
    if res == 0 {
        Ok(())
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => {
                Err(BurrowError::Invalid("database file is locked"))
            }
            _ => Err(BurrowError::Io(err)),
        }
    }
}

#[cfg(windows)]
fn lock_region(file: &File, exclusive: bool) -> Result<()> {
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    unsafe {
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = zeroed();
        let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
        if exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        let res = LockFileEx(handle as isize, flags, 0, u32::MAX, u32::MAX, &mut overlapped);
        if res != 0 {
            Ok(())
        } else {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(code) if code == ERROR_LOCK_VIOLATION as i32) {
                Err(BurrowError::Invalid("database file is locked"))
            } else {
                Err(BurrowError::Io(err))
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
fn lock_region(_file: &File, _exclusive: bool) -> Result<()> {
    Err(BurrowError::Invalid(
        "file locking unsupported on this platform",
    ))
}
