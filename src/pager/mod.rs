use memmap2::MmapOptions;
use tracing::debug;

use crate::error::{BurrowError, Result};
use crate::io::{FileIo, StdFileIo};
use crate::types::PageIdx;

pub mod meta;

/// Default bound on the in-memory page slot table.
pub const DEFAULT_MAX_PAGES: usize = 65_536;

/// Page access seam between the tree and its backing store. The write path
/// implements it over [`Pager`] buffers; the read path implements it over the
/// long-lived reader mmap.
pub trait PageIo {
    fn page(&mut self, idx: PageIdx) -> Result<&[u8]>;
    fn page_mut(&mut self, idx: PageIdx) -> Result<&mut [u8]>;
    fn allocate(&mut self) -> Result<PageIdx>;
    fn reclaim(&mut self, idx: PageIdx) -> Result<()>;
}

impl<T: PageIo + ?Sized> PageIo for &mut T {
    fn page(&mut self, idx: PageIdx) -> Result<&[u8]> {
        (**self).page(idx)
    }

    fn page_mut(&mut self, idx: PageIdx) -> Result<&mut [u8]> {
        (**self).page_mut(idx)
    }

    fn allocate(&mut self) -> Result<PageIdx> {
        (**self).allocate()
    }

    fn reclaim(&mut self, idx: PageIdx) -> Result<()> {
        (**self).reclaim(idx)
    }
}

/// Size of the host's memory pages; used as the mmap offset granularity and
/// as the default database page size.
pub fn host_page_size() -> usize {
    #[cfg(unix)]
    {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

#[cfg(windows)]
fn map_granularity() -> usize {
    // Windows maps at allocation granularity, not page granularity.
    64 * 1024
}

#[cfg(not(windows))]
fn map_granularity() -> usize {
    host_page_size()
}

struct Slot {
    buf: Option<Vec<u8>>,
    occupied: bool,
}

/// Owns the database file and hands out page buffers by index.
///
/// Buffers are owned heap allocations populated (and written back) through
/// transient memory mappings of the file, so the hot path never issues
/// explicit read/write syscalls and flushes are a synchronous msync.
pub struct Pager {
    io: StdFileIo,
    page_size: usize,
    granularity: u64,
    slots: Vec<Slot>,
    dirty: Vec<PageIdx>,
    tx_allocated: Vec<PageIdx>,
    high_water: u32,
}

impl Pager {
    pub fn open(path: impl AsRef<std::path::Path>, page_size: u32, max_pages: usize) -> Result<Self> {
        let io = StdFileIo::open_rw(path)?;
        Self::with_io(io, page_size, max_pages)
    }

    /// Builds a pager over an already-opened file.
    pub fn with_io(io: StdFileIo, page_size: u32, max_pages: usize) -> Result<Self> {
        if page_size < meta::MIN_PAGE_SIZE || page_size % 8 != 0 {
            return Err(BurrowError::Invalid("unsupported page size"));
        }
        let ps = page_size as usize;
        let file_len = io.len()?;
        if file_len % ps as u64 != 0 {
            return Err(BurrowError::Corruption("file length is not page aligned"));
        }
        let on_disk = (file_len / ps as u64) as usize;
        if on_disk > max_pages {
            return Err(BurrowError::Invalid("file exceeds the page table bound"));
        }
        let mut slots = Vec::with_capacity(max_pages);
        for i in 0..max_pages {
            slots.push(Slot {
                buf: None,
                occupied: i < on_disk,
            });
        }
        Ok(Self {
            io,
            page_size: ps,
            granularity: map_granularity() as u64,
            slots,
            dirty: Vec::new(),
            tx_allocated: Vec::new(),
            high_water: on_disk as u32,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn io(&self) -> &StdFileIo {
        &self.io
    }

    /// Number of whole pages currently backed by the file.
    pub fn num_pages(&self) -> Result<u64> {
        Ok(self.io.len()? / self.page_size as u64)
    }

    /// One past the highest slot ever allocated; feeds `meta.max_page`.
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    pub fn page(&mut self, idx: PageIdx) -> Result<&[u8]> {
        self.ensure_loaded(idx)?;
        Ok(self.slots[idx.as_usize()]
            .buf
            .as_deref()
            .expect("slot loaded above"))
    }

    pub fn page_mut(&mut self, idx: PageIdx) -> Result<&mut [u8]> {
        self.ensure_loaded(idx)?;
        if !self.dirty.contains(&idx) {
            self.dirty.push(idx);
        }
        Ok(self.slots[idx.as_usize()]
            .buf
            .as_deref_mut()
            .expect("slot loaded above"))
    }

    /// Hands out the first unoccupied slot as a fresh zeroed page.
    pub fn next_empty_page(&mut self) -> Result<(PageIdx, &mut [u8])> {
        let i = self
            .slots
            .iter()
            .position(|s| !s.occupied)
            .ok_or(BurrowError::PageNotFound)?;
        let idx = PageIdx(i as u32);
        self.slots[i].occupied = true;
        self.slots[i].buf = Some(vec![0u8; self.page_size]);
        self.high_water = self.high_water.max(idx.0 + 1);
        self.dirty.push(idx);
        self.tx_allocated.push(idx);
        Ok((idx, self.slots[i].buf.as_deref_mut().expect("just allocated")))
    }

    /// Writes the resident buffer for `idx` back to the file through a write
    /// mapping and issues a synchronous flush.
    pub fn flush_page(&mut self, idx: PageIdx) -> Result<()> {
        let i = idx.as_usize();
        if i >= self.slots.len() {
            return Err(BurrowError::PageNotFound);
        }
        let buf = self.slots[i]
            .buf
            .take()
            .ok_or(BurrowError::Invalid("page is not resident"))?;
        let result = self.write_page_bytes(idx, &buf);
        self.slots[i].buf = Some(buf);
        result?;
        self.dirty.retain(|d| *d != idx);
        Ok(())
    }

    /// Zeroes the page, flushes it, and frees its slot for reuse.
    pub fn reclaim_page(&mut self, idx: PageIdx) -> Result<()> {
        let i = idx.as_usize();
        if i >= self.slots.len() {
            return Err(BurrowError::PageNotFound);
        }
        if i < 3 {
            return Err(BurrowError::Invalid("cannot reclaim a reserved page"));
        }
        let zeroes = vec![0u8; self.page_size];
        self.write_page_bytes(idx, &zeroes)?;
        self.slots[i].buf = None;
        self.slots[i].occupied = false;
        self.dirty.retain(|d| *d != idx);
        self.tx_allocated.retain(|d| *d != idx);
        debug!(page = %idx, "page reclaimed");
        Ok(())
    }

    /// Drains the dirty set, sorted and deduplicated.
    pub fn take_dirty(&mut self) -> Vec<PageIdx> {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        dirty
    }

    pub fn begin_tx(&mut self) {
        debug_assert!(self.dirty.is_empty(), "dirty pages leaked between transactions");
        self.tx_allocated.clear();
    }

    pub fn end_tx(&mut self) {
        self.tx_allocated.clear();
    }

    /// Drops the resident buffers for `pages` so the next access re-reads
    /// them from disk.
    pub fn discard_pages(&mut self, pages: &[PageIdx]) {
        for idx in pages {
            if let Some(slot) = self.slots.get_mut(idx.as_usize()) {
                slot.buf = None;
            }
        }
        self.dirty.retain(|d| !pages.contains(d));
    }

    /// Discards every buffer touched by the in-flight transaction: dirty
    /// pages reload from disk on next access, freshly allocated slots are
    /// released.
    pub fn discard_tx(&mut self) {
        for idx in std::mem::take(&mut self.dirty) {
            self.slots[idx.as_usize()].buf = None;
        }
        for idx in std::mem::take(&mut self.tx_allocated) {
            let slot = &mut self.slots[idx.as_usize()];
            slot.buf = None;
            slot.occupied = false;
        }
        self.high_water = self
            .slots
            .iter()
            .rposition(|s| s.occupied)
            .map(|i| i as u32 + 1)
            .unwrap_or(0);
    }

    /// Flushes every live page and syncs the file.
    pub fn close(&mut self) -> Result<()> {
        let live: Vec<PageIdx> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.buf.is_some())
            .map(|(i, _)| PageIdx(i as u32))
            .collect();
        for idx in live {
            self.flush_page(idx)?;
        }
        self.io.sync_all()
    }

    fn ensure_loaded(&mut self, idx: PageIdx) -> Result<()> {
        let i = idx.as_usize();
        if i >= self.slots.len() {
            return Err(BurrowError::PageNotFound);
        }
        if self.slots[i].buf.is_none() {
            let buf = self.load_page_bytes(idx)?;
            self.slots[i].buf = Some(buf);
            self.slots[i].occupied = true;
        }
        Ok(())
    }

    /// Populates a fresh buffer from the file. The mapping covers the page
    /// rounded down to the host's mapping granularity and is unmapped before
    /// returning. A page past EOF extends the file and stays zeroed.
    fn load_page_bytes(&self, idx: PageIdx) -> Result<Vec<u8>> {
        let ps = self.page_size;
        let mut buf = vec![0u8; ps];
        let offset = idx.0 as u64 * ps as u64;
        let file_len = self.io.len()?;
        if offset + ps as u64 > file_len {
            self.io.truncate(offset + ps as u64)?;
            return Ok(buf);
        }
        let aligned = offset - offset % self.granularity;
        let lead = (offset - aligned) as usize;
        let map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(lead + ps)
                .map(self.io.file())?
        };
        buf.copy_from_slice(&map[lead..lead + ps]);
        drop(map);
        Ok(buf)
    }

    fn write_page_bytes(&self, idx: PageIdx, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let ps = self.page_size as u64;
        let offset = idx.0 as u64 * ps;
        let file_len = self.io.len()?;
        if offset + ps > file_len {
            self.io.truncate(offset + ps)?;
        }
        let aligned = offset - offset % self.granularity;
        let lead = (offset - aligned) as usize;
        let mut map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(lead + self.page_size)
                .map_mut(self.io.file())?
        };
        map[lead..lead + self.page_size].copy_from_slice(data);
        map.flush()?;
        Ok(())
    }
}

impl PageIo for Pager {
    fn page(&mut self, idx: PageIdx) -> Result<&[u8]> {
        Pager::page(self, idx)
    }

    fn page_mut(&mut self, idx: PageIdx) -> Result<&mut [u8]> {
        Pager::page_mut(self, idx)
    }

    fn allocate(&mut self) -> Result<PageIdx> {
        let (idx, _) = self.next_empty_page()?;
        Ok(idx)
    }

    fn reclaim(&mut self, idx: PageIdx) -> Result<()> {
        self.reclaim_page(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: u32 = 128;

    #[test]
    fn allocate_write_flush_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.db");
        {
            let mut pager = Pager::open(&path, PS, 16).unwrap();
            let (idx, page) = pager.next_empty_page().unwrap();
            assert_eq!(idx, PageIdx(0));
            page[0..4].copy_from_slice(&[1, 2, 3, 4]);
            pager.flush_page(idx).unwrap();
        }
        {
            let mut pager = Pager::open(&path, PS, 16).unwrap();
            assert_eq!(&pager.page(PageIdx(0)).unwrap()[0..4], &[1, 2, 3, 4]);
        }
    }

    #[test]
    fn next_empty_skips_pages_already_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seeded.db");
        {
            let mut pager = Pager::open(&path, PS, 16).unwrap();
            for expect in 0..3u32 {
                let (idx, _) = pager.next_empty_page().unwrap();
                assert_eq!(idx, PageIdx(expect));
                pager.flush_page(idx).unwrap();
            }
        }
        let mut pager = Pager::open(&path, PS, 16).unwrap();
        assert_eq!(pager.num_pages().unwrap(), 3);
        let (idx, _) = pager.next_empty_page().unwrap();
        assert_eq!(idx, PageIdx(3));
    }

    #[test]
    fn out_of_range_index_is_page_not_found() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("small.db"), PS, 4).unwrap();
        assert!(matches!(
            pager.page(PageIdx(4)),
            Err(BurrowError::PageNotFound)
        ));
    }

    #[test]
    fn slot_table_exhaustion_is_page_not_found() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("full.db"), PS, 2).unwrap();
        pager.next_empty_page().unwrap();
        pager.next_empty_page().unwrap();
        assert!(matches!(
            pager.next_empty_page(),
            Err(BurrowError::PageNotFound)
        ));
    }

    #[test]
    fn read_past_eof_extends_file_and_stays_zero() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("extend.db"), PS, 8).unwrap();
        assert_eq!(pager.num_pages().unwrap(), 0);
        let page = pager.page(PageIdx(2)).unwrap();
        assert!(page.iter().all(|&b| b == 0));
        assert_eq!(pager.num_pages().unwrap(), 3);
    }

    #[test]
    fn reclaim_zeroes_disk_and_frees_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reclaim.db");
        let mut pager = Pager::open(&path, PS, 16).unwrap();
        // Slots 0..3 stand in for the meta and freelist pages.
        for _ in 0..3 {
            let (idx, _) = pager.next_empty_page().unwrap();
            pager.flush_page(idx).unwrap();
        }
        let (idx, page) = pager.next_empty_page().unwrap();
        assert_eq!(idx, PageIdx(3));
        page.fill(0xAB);
        pager.flush_page(idx).unwrap();

        pager.reclaim_page(idx).unwrap();
        let (again, page) = pager.next_empty_page().unwrap();
        assert_eq!(again, idx);
        assert!(page.iter().all(|&b| b == 0));

        let on_disk = std::fs::read(&path).unwrap();
        let start = idx.as_usize() * PS as usize;
        assert!(on_disk[start..start + PS as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn reserved_pages_cannot_be_reclaimed() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("reserved.db"), PS, 8).unwrap();
        assert!(matches!(
            pager.reclaim_page(PageIdx(1)),
            Err(BurrowError::Invalid(_))
        ));
    }

    #[test]
    fn dirty_set_is_sorted_and_deduplicated() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("dirty.db"), PS, 8).unwrap();
        pager.page_mut(PageIdx(2)).unwrap();
        pager.page_mut(PageIdx(0)).unwrap();
        pager.page_mut(PageIdx(2)).unwrap();
        assert_eq!(pager.take_dirty(), vec![PageIdx(0), PageIdx(2)]);
        assert!(pager.take_dirty().is_empty());
    }

    #[test]
    fn discard_reloads_from_disk_and_releases_allocations() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("discard.db"), PS, 8).unwrap();
        let (idx, page) = pager.next_empty_page().unwrap();
        page.fill(0x11);
        pager.flush_page(idx).unwrap();
        pager.end_tx();

        pager.begin_tx();
        pager.page_mut(idx).unwrap().fill(0x22);
        let (fresh, _) = pager.next_empty_page().unwrap();
        pager.discard_tx();

        assert!(pager.page(idx).unwrap().iter().all(|&b| b == 0x11));
        let (reused, _) = pager.next_empty_page().unwrap();
        assert_eq!(reused, fresh);
    }
}
