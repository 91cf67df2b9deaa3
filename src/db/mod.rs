use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{BurrowError, Result};
use crate::io::{self, FileIo, StdFileIo};
use crate::pager::{self, meta, Pager, DEFAULT_MAX_PAGES};
use crate::tree::node::NodeLayout;
use crate::types::PageIdx;

mod tx;

pub use tx::{Rows, Tx};

pub const DEFAULT_VALUE_SIZE: usize = 256;
pub const DEFAULT_MMAP_INIT_SIZE: u64 = 1 << 30;

/// Options supplied when opening a [`Db`].
#[derive(Clone, Debug)]
pub struct Options {
    /// Page size for freshly created files; existing files keep the size
    /// recorded in their meta pages. Defaults to the host page size.
    pub page_size: Option<u32>,
    /// Fixed length of every stored value; the engine never inspects the
    /// bytes, it only sizes leaf cells with it. Recorded in the meta pages
    /// at creation; opening an existing file with a different explicit
    /// value is an error.
    pub value_size: Option<usize>,
    /// Initial size of the read-only mmap; choose large to amortize remaps
    /// for long-running readers.
    pub mmap_init_size: u64,
    /// Bound on the pager's in-memory slot table.
    pub max_pages: usize,
    /// Open with a shared OS lock; write transactions are refused.
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: None,
            value_size: None,
            mmap_init_size: DEFAULT_MMAP_INIT_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            read_only: false,
        }
    }
}

impl Options {
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = Some(bytes);
        self
    }

    pub fn value_size(mut self, bytes: usize) -> Self {
        self.value_size = Some(bytes);
        self
    }

    pub fn mmap_init_size(mut self, bytes: u64) -> Self {
        self.mmap_init_size = bytes;
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

pub(crate) struct MetaState {
    pub meta: meta::Meta,
    /// Which meta page holds the authoritative copy; commits write the other.
    pub slot: u8,
    pub open_txs: usize,
    pub writer_active: bool,
}

/// Long-lived read-only mapping of the file serving reader transactions.
pub(crate) struct ReaderMap {
    mmap: Mmap,
    page_size: usize,
    pub len: u64,
}

impl ReaderMap {
    fn map(io: &StdFileIo, page_size: usize, len: u64) -> Result<Self> {
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(io.file())? };
        Ok(Self {
            mmap,
            page_size,
            len,
        })
    }

    pub(crate) fn page(&self, idx: PageIdx) -> Result<&[u8]> {
        let start = idx.0 as usize * self.page_size;
        let end = start + self.page_size;
        if end > self.mmap.len() {
            return Err(BurrowError::PageNotFound);
        }
        Ok(&self.mmap[start..end])
    }
}

/// Single-file embedded store: opens or initializes the file, hands out
/// transactions, and owns the locks that keep one writer and many readers
/// coherent.
///
/// Do not nest transactions on one thread. A second reader can deadlock
/// behind a remap queued against the first one's shared hold, and a second
/// writer blocks on the writer lock forever.
pub struct Db {
    pub(crate) io: StdFileIo,
    pub(crate) pager: Mutex<Pager>,
    pub(crate) meta: Mutex<MetaState>,
    pub(crate) map: RwLock<ReaderMap>,
    pub(crate) layout: NodeLayout,
    pub(crate) page_size: u32,
    pub(crate) mmap_init_size: u64,
    pub(crate) read_only: bool,
    closed: AtomicBool,
    path: PathBuf,
}

impl Db {
    /// Opens (or creates and initializes) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let path = path.as_ref();
        let io = if options.read_only {
            StdFileIo::open_ro(path)?
        } else {
            StdFileIo::open_rw(path)?
        };
        if options.read_only {
            io::lock_shared(io.file())?;
        } else {
            io::lock_exclusive(io.file())?;
        }

        let default_page_size = options
            .page_size
            .unwrap_or(pager::host_page_size() as u32);
        let (current, slot) = if io.is_empty()? {
            if options.read_only {
                return Err(BurrowError::DatabaseReadOnly);
            }
            let value_size = options.value_size.unwrap_or(DEFAULT_VALUE_SIZE);
            let value_size = u32::try_from(value_size)
                .map_err(|_| BurrowError::Invalid("value size too large"))?;
            info!(path = %path.display(), page_size = default_page_size, value_size, "initializing blank database file");
            meta::init(&io, default_page_size, value_size)?
        } else {
            let (current, slot) = meta::load(&io, default_page_size)?;
            // The leaf layout is dictated by the file, not the caller; an
            // explicit mismatch would misread every cell on disk.
            if let Some(requested) = options.value_size {
                if requested != current.value_size as usize {
                    return Err(BurrowError::Invalid(
                        "value size does not match the database file",
                    ));
                }
            }
            (current, slot)
        };

        let layout = NodeLayout::new(current.page_size, current.value_size as usize)?;
        let pager = Pager::with_io(io.clone(), current.page_size, options.max_pages)?;
        let file_len = io.len()?;
        let map = ReaderMap::map(
            &io,
            current.page_size as usize,
            file_len.max(options.mmap_init_size),
        )?;
        debug!(path = %path.display(), meta = %current, "database opened");

        Ok(Db {
            io,
            pager: Mutex::new(pager),
            meta: Mutex::new(MetaState {
                meta: current,
                slot,
                open_txs: 0,
                writer_active: false,
            }),
            map: RwLock::new(map),
            layout,
            page_size: current.page_size,
            mmap_init_size: options.mmap_init_size,
            read_only: options.read_only,
            closed: AtomicBool::new(false),
            path: path.to_path_buf(),
        })
    }

    /// Begins a transaction; a writable one blocks until any prior writer
    /// finishes.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        tx::begin(self, writable)
    }

    /// Runs `f` inside a managed read transaction that is always rolled back
    /// afterwards, whatever `f` returns.
    pub fn view<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        let out = f(&mut tx);
        drop(tx);
        out
    }

    /// Flushes live pages and marks the handle closed. Fails fast while any
    /// transaction remains open.
    pub fn close(&self) -> Result<()> {
        self.ensure_open()?;
        {
            let st = self.meta.lock();
            if st.open_txs > 0 {
                return Err(BurrowError::Invalid("transactions still open"));
            }
            self.closed.store(true, Ordering::SeqCst);
        }
        if !self.read_only {
            self.pager.lock().close()?;
        }
        info!(path = %self.path.display(), "database closed");
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BurrowError::DatabaseNotOpen);
        }
        Ok(())
    }
}
