use parking_lot::{MutexGuard, RwLockReadGuard};
use tracing::{debug, info, warn};

use super::{Db, ReaderMap};
use crate::error::{BurrowError, Result};
use crate::io::FileIo;
use crate::pager::{meta, PageIo, Pager};
use crate::tree::{self, BTree};
use crate::types::{Key, PageIdx, TxId};

/// Read-only page source over the reader mmap. The mutating half of the
/// seam is unreachable from read operations.
pub(crate) struct ReaderPages<'g> {
    map: &'g ReaderMap,
}

impl PageIo for ReaderPages<'_> {
    fn page(&mut self, idx: PageIdx) -> Result<&[u8]> {
        self.map.page(idx)
    }

    fn page_mut(&mut self, _idx: PageIdx) -> Result<&mut [u8]> {
        Err(BurrowError::TransactionReadOnly)
    }

    fn allocate(&mut self) -> Result<PageIdx> {
        Err(BurrowError::TransactionReadOnly)
    }

    fn reclaim(&mut self, _idx: PageIdx) -> Result<()> {
        Err(BurrowError::TransactionReadOnly)
    }
}

/// A transaction scoping reads and writes against one meta snapshot.
///
/// Writers hold the pager mutex for their whole lifetime, which is what
/// serializes them; readers hold the mmap lock shared so a remap drains them
/// first. Dropping an unfinished transaction rolls it back.
pub struct Tx<'db> {
    db: &'db Db,
    meta: meta::Meta,
    writable: bool,
    done: bool,
    pager: Option<MutexGuard<'db, Pager>>,
    map: Option<RwLockReadGuard<'db, ReaderMap>>,
}

pub(crate) fn begin(db: &Db, writable: bool) -> Result<Tx<'_>> {
    db.ensure_open()?;
    if writable {
        if db.read_only {
            return Err(BurrowError::DatabaseReadOnly);
        }
        let mut pager = db.pager.lock();
        let snapshot = {
            let mut st = db.meta.lock();
            debug_assert!(!st.writer_active, "second writer slipped past the writer lock");
            st.open_txs += 1;
            st.writer_active = true;
            st.meta
        };
        pager.begin_tx();
        debug!(txid = snapshot.txid, "write transaction started");
        Ok(Tx {
            db,
            meta: snapshot,
            writable: true,
            done: false,
            pager: Some(pager),
            map: None,
        })
    } else {
        // Remap before taking the shared hold when the file outgrew the
        // reader map; the exclusive acquisition drains current readers.
        let file_len = db.io.len()?;
        if file_len > db.map.read().len {
            let mut map = db.map.write();
            if file_len > map.len {
                *map = ReaderMap::map(
                    &db.io,
                    db.page_size as usize,
                    file_len.max(db.mmap_init_size),
                )?;
            }
        }
        let guard = db.map.read();
        let snapshot = {
            let mut st = db.meta.lock();
            st.open_txs += 1;
            st.meta
        };
        debug!(txid = snapshot.txid, "read transaction started");
        Ok(Tx {
            db,
            meta: snapshot,
            writable: false,
            done: false,
            pager: None,
            map: Some(guard),
        })
    }
}

impl<'db> Tx<'db> {
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Transaction id of the snapshot this transaction reads from.
    pub fn txid(&self) -> TxId {
        self.meta.txid
    }

    /// Inserts a `(key, value)` pair; the value length must match the
    /// database's configured record size.
    pub fn insert(&mut self, key: Key, value: &[u8]) -> Result<()> {
        let layout = self.db.layout;
        let root = self.meta.root;
        let pager = self
            .pager
            .as_mut()
            .ok_or(BurrowError::TransactionReadOnly)?;
        let mut tree = BTree::new(&mut **pager, layout, root);
        let res = tree.insert(key, value);
        let root = tree.root();
        self.meta.root = root;
        self.refresh_max_page();
        res
    }

    /// Deletes `key`, failing with `KeyNotFound` when absent.
    pub fn delete(&mut self, key: Key) -> Result<()> {
        let layout = self.db.layout;
        let root = self.meta.root;
        let pager = self
            .pager
            .as_mut()
            .ok_or(BurrowError::TransactionReadOnly)?;
        let mut tree = BTree::new(&mut **pager, layout, root);
        let res = tree.delete(key);
        let root = tree.root();
        self.meta.root = root;
        self.refresh_max_page();
        res
    }

    pub fn get(&mut self, key: Key) -> Result<Option<Vec<u8>>> {
        let layout = self.db.layout;
        let root = self.meta.root;
        match self.pager.as_mut() {
            Some(pager) => BTree::new(&mut **pager, layout, root).get(key),
            None => {
                let map = self.map.as_deref().expect("reader holds the map guard");
                BTree::new(ReaderPages { map }, layout, root).get(key)
            }
        }
    }

    pub fn exists(&mut self, key: Key) -> Result<bool> {
        let layout = self.db.layout;
        let root = self.meta.root;
        match self.pager.as_mut() {
            Some(pager) => BTree::new(&mut **pager, layout, root).exists(key),
            None => {
                let map = self.map.as_deref().expect("reader holds the map guard");
                BTree::new(ReaderPages { map }, layout, root).exists(key)
            }
        }
    }

    /// Ordered iterator over every `(key, value)` pair in the snapshot.
    pub fn iter(&mut self) -> Rows<'_> {
        let layout = self.db.layout;
        let root = self.meta.root;
        let inner = match self.pager.as_mut() {
            Some(pager) => RowsInner::Write(BTree::new(&mut **pager, layout, root).into_iter()),
            None => {
                let map = self.map.as_deref().expect("reader holds the map guard");
                RowsInner::Read(BTree::new(ReaderPages { map }, layout, root).into_iter())
            }
        };
        Rows { inner }
    }

    /// Walks the snapshot's tree checking structural invariants. Diagnostics
    /// only.
    pub fn check_invariants(&mut self) -> Result<()> {
        let layout = self.db.layout;
        let root = self.meta.root;
        match self.pager.as_mut() {
            Some(pager) => BTree::new(&mut **pager, layout, root).check_invariants(),
            None => {
                let map = self.map.as_deref().expect("reader holds the map guard");
                BTree::new(ReaderPages { map }, layout, root).check_invariants()
            }
        }
    }

    /// Commits a write transaction: flushes every dirty page, then writes the
    /// alternate meta slot with the next txid.
    pub fn commit(mut self) -> Result<()> {
        if !self.writable {
            return Err(BurrowError::TransactionReadOnly);
        }
        match self.commit_inner() {
            Ok((txid, dirty_pages)) => {
                self.done = true;
                info!(txid, dirty_pages, "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.rollback_inner();
                Err(err)
            }
        }
    }

    /// Discards the transaction's work and releases its locks.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_inner();
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<(TxId, usize)> {
        let pager = self.pager.as_mut().expect("writer holds the pager");
        let dirty = pager.take_dirty();
        for idx in &dirty {
            if let Err(err) = pager.flush_page(*idx) {
                pager.discard_pages(&dirty);
                return Err(err);
            }
        }

        let mut st = self.db.meta.lock();
        let target = 1 - st.slot;
        let mut next = self.meta;
        next.txid = st.meta.txid + 1;
        let stored = match meta::write_slot(&self.db.io, self.db.page_size, target, &next) {
            Ok(stored) => stored,
            Err(err) => {
                drop(st);
                pager.discard_pages(&dirty);
                return Err(err);
            }
        };
        st.meta = stored;
        st.slot = target;
        st.open_txs -= 1;
        st.writer_active = false;
        drop(st);
        pager.end_tx();
        Ok((stored.txid, dirty.len()))
    }

    fn rollback_inner(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(pager) = self.pager.as_mut() {
            pager.discard_tx();
            let mut st = self.db.meta.lock();
            st.open_txs -= 1;
            st.writer_active = false;
            warn!(txid = self.meta.txid, "write transaction rolled back");
        } else {
            let mut st = self.db.meta.lock();
            st.open_txs -= 1;
            debug!(txid = self.meta.txid, "read transaction closed");
        }
    }

    fn refresh_max_page(&mut self) {
        let high_water = self
            .pager
            .as_ref()
            .expect("writer holds the pager")
            .high_water();
        if high_water > self.meta.max_page.0 {
            self.meta.max_page = PageIdx(high_water);
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

/// Ordered `(key, value)` iterator handed out by [`Tx::iter`].
pub struct Rows<'t> {
    inner: RowsInner<'t>,
}

enum RowsInner<'t> {
    Write(tree::Iter<&'t mut Pager>),
    Read(tree::Iter<ReaderPages<'t>>),
}

impl Iterator for Rows<'_> {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            RowsInner::Write(iter) => iter.next(),
            RowsInner::Read(iter) => iter.next(),
        }
    }
}
