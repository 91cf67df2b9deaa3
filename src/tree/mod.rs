use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::error::{BurrowError, Result};
use crate::pager::PageIo;
use crate::types::{Key, PageIdx};

pub mod node;

use node::{NodeLayout, NodeType};

/// B+-tree of unique `(Key, Value)` pairs over a page store.
///
/// The tree is rooted at `root`; the root is the only node allowed to hold
/// fewer than the minimum cell count (including zero). Both insert and delete
/// are top-down and proactive: a full child is split, and a minimal child is
/// rebalanced, before descending into it, so every operation touches a single
/// root-to-leaf path.
pub struct BTree<P: PageIo> {
    pages: P,
    layout: NodeLayout,
    root: PageIdx,
}

impl<P: PageIo> BTree<P> {
    pub fn new(pages: P, layout: NodeLayout, root: PageIdx) -> Self {
        Self {
            pages,
            layout,
            root,
        }
    }

    /// Root page after any splits or collapses performed so far.
    pub fn root(&self) -> PageIdx {
        self.root
    }

    pub fn get(&mut self, key: Key) -> Result<Option<Vec<u8>>> {
        let layout = self.layout;
        let mut node_idx = self.root;
        loop {
            let page = self.pages.page(node_idx)?;
            match node::node_type(page)? {
                NodeType::Leaf => {
                    return Ok(match node::leaf_search(&layout, page, key) {
                        Ok(pos) => Some(node::leaf_value(&layout, page, pos).to_vec()),
                        Err(_) => None,
                    });
                }
                NodeType::Internal => {
                    let p = node::internal_key_pos(&layout, page, key);
                    node_idx = node::internal_child(&layout, page, p);
                }
            }
        }
    }

    pub fn exists(&mut self, key: Key) -> Result<bool> {
        let layout = self.layout;
        let mut node_idx = self.root;
        loop {
            let page = self.pages.page(node_idx)?;
            match node::node_type(page)? {
                NodeType::Leaf => return Ok(node::leaf_search(&layout, page, key).is_ok()),
                NodeType::Internal => {
                    let p = node::internal_key_pos(&layout, page, key);
                    node_idx = node::internal_child(&layout, page, p);
                }
            }
        }
    }

    pub fn insert(&mut self, key: Key, value: &[u8]) -> Result<()> {
        if value.len() != self.layout.value_size {
            return Err(BurrowError::Invalid(
                "value length does not match the configured record size",
            ));
        }
        if self.is_full(self.root)? {
            self.grow_root()?;
        }
        self.insert_nonfull(self.root, key, value)
    }

    pub fn delete(&mut self, key: Key) -> Result<()> {
        let layout = self.layout;
        let root = self.root;
        if self.kind(root)? == NodeType::Leaf {
            // A root leaf deletes locally and never rebalances.
            let page = self.pages.page_mut(root)?;
            return match node::leaf_search(&layout, page, key) {
                Ok(pos) => {
                    node::leaf_remove_at(&layout, page, pos);
                    Ok(())
                }
                Err(_) => Err(BurrowError::KeyNotFound),
            };
        }
        self.delete_from(root, key)
    }

    /// Consumes the tree into an ordered `(key, value)` iterator.
    pub fn into_iter(self) -> Iter<P> {
        let root = self.root;
        let mut stack = SmallVec::new();
        stack.push((root, 0));
        Iter { tree: self, stack }
    }

    fn kind(&mut self, idx: PageIdx) -> Result<NodeType> {
        node::node_type(self.pages.page(idx)?)
    }

    fn len(&mut self, idx: PageIdx) -> Result<usize> {
        Ok(node::cells_num(self.pages.page(idx)?))
    }

    fn child(&mut self, idx: PageIdx, i: usize) -> Result<PageIdx> {
        let layout = self.layout;
        Ok(node::internal_child(&layout, self.pages.page(idx)?, i))
    }

    fn separator(&mut self, idx: PageIdx, i: usize) -> Result<Key> {
        let layout = self.layout;
        Ok(node::internal_key(&layout, self.pages.page(idx)?, i))
    }

    fn last_key_of(&mut self, idx: PageIdx) -> Result<Key> {
        let layout = self.layout;
        let page = self.pages.page(idx)?;
        let n = node::cells_num(page);
        Ok(match node::node_type(page)? {
            NodeType::Leaf => node::leaf_key(&layout, page, n - 1),
            NodeType::Internal => node::internal_key(&layout, page, n - 1),
        })
    }

    fn is_full(&mut self, idx: PageIdx) -> Result<bool> {
        let page = self.pages.page(idx)?;
        let ty = node::node_type(page)?;
        Ok(node::cells_num(page) == self.layout.max_cells(ty))
    }

    /// Splits a full root: the old root becomes the sole (sentinel) child of
    /// a fresh internal node, which is then split like any other child.
    fn grow_root(&mut self) -> Result<()> {
        let layout = self.layout;
        let old_root = self.root;
        let new_root = self.pages.allocate()?;
        {
            let page = self.pages.page_mut(new_root)?;
            node::init_node(page, NodeType::Internal);
            node::internal_insert_at(&layout, page, 0, old_root, 0);
        }
        self.root = new_root;
        self.split_child(new_root, 0)
    }

    /// Splits the full child under the parent's cell `p` in half. The parent
    /// has room: the caller split it on the way down.
    fn split_child(&mut self, parent: PageIdx, p: usize) -> Result<()> {
        let layout = self.layout;
        let child = self.child(parent, p)?;
        let (ty, n, moved, left_last_key) = {
            let page = self.pages.page(child)?;
            let ty = node::node_type(page)?;
            let n = node::cells_num(page);
            debug_assert_eq!(n, layout.max_cells(ty), "split of a non-full child");
            let mid = n / 2;
            let moved = page[layout.cells_range(ty, mid, n)].to_vec();
            let left_last_key = match ty {
                NodeType::Leaf => node::leaf_key(&layout, page, mid - 1),
                NodeType::Internal => node::internal_key(&layout, page, mid - 1),
            };
            (ty, n, moved, left_last_key)
        };
        let mid = n / 2;

        let right = self.pages.allocate()?;
        let right_last_key = {
            let page = self.pages.page_mut(right)?;
            node::init_node(page, ty);
            page[layout.cells_range(ty, 0, n - mid)].copy_from_slice(&moved);
            node::set_cells_num(page, n - mid);
            match ty {
                NodeType::Leaf => node::leaf_key(&layout, page, n - mid - 1),
                NodeType::Internal => node::internal_key(&layout, page, n - mid - 1),
            }
        };
        node::set_cells_num(self.pages.page_mut(child)?, mid);

        let page = self.pages.page_mut(parent)?;
        node::internal_set_key(&layout, page, p, left_last_key);
        node::internal_insert_at(&layout, page, p + 1, right, right_last_key);
        Ok(())
    }

    fn insert_nonfull(&mut self, start: PageIdx, key: Key, value: &[u8]) -> Result<()> {
        let layout = self.layout;
        let mut node_idx = start;
        loop {
            let kind = self.kind(node_idx)?;
            match kind {
                NodeType::Leaf => {
                    let page = self.pages.page_mut(node_idx)?;
                    return match node::leaf_search(&layout, page, key) {
                        Ok(_) => Err(BurrowError::DuplicateKey),
                        Err(pos) => {
                            node::leaf_insert_at(&layout, page, pos, key, value);
                            Ok(())
                        }
                    };
                }
                NodeType::Internal => {
                    let mut p = {
                        let page = self.pages.page(node_idx)?;
                        node::internal_key_pos(&layout, page, key)
                    };
                    let child = self.child(node_idx, p)?;
                    if self.is_full(child)? {
                        self.split_child(node_idx, p)?;
                        // The split put a new separator at p; the target key
                        // may now live in the right half.
                        let sep = self.separator(node_idx, p)?;
                        if node::cmp_keys(key, sep) == Ordering::Greater {
                            p += 1;
                        }
                    }
                    node_idx = self.child(node_idx, p)?;
                }
            }
        }
    }

    /// Recursive top-down delete below an internal node that is either the
    /// root or holds more than the minimum cell count.
    fn delete_from(&mut self, node_idx: PageIdx, key: Key) -> Result<()> {
        let layout = self.layout;
        let mut p = {
            let page = self.pages.page(node_idx)?;
            node::internal_key_pos(&layout, page, key)
        };
        let mut child = self.child(node_idx, p)?;

        // An internal child sitting at the minimum is topped up before the
        // descent so a merge below it cannot underflow.
        if self.kind(child)? == NodeType::Internal && self.len(child)? == layout.internal_min {
            self.rebalance(node_idx, p)?;
            if node_idx == self.root && self.len(node_idx)? == 1 {
                let new_root = self.child(node_idx, 0)?;
                self.pages.reclaim(node_idx)?;
                self.root = new_root;
                return self.delete_from(new_root, key);
            }
            p = {
                let page = self.pages.page(node_idx)?;
                node::internal_key_pos(&layout, page, key)
            };
            child = self.child(node_idx, p)?;
        }

        if self.kind(child)? == NodeType::Leaf {
            {
                let page = self.pages.page_mut(child)?;
                match node::leaf_search(&layout, page, key) {
                    Ok(pos) => node::leaf_remove_at(&layout, page, pos),
                    Err(_) => return Err(BurrowError::KeyNotFound),
                }
            }
            if self.len(child)? < layout.leaf_min {
                self.rebalance(node_idx, p)?;
                if node_idx == self.root && self.len(node_idx)? == 1 {
                    let new_root = self.child(node_idx, 0)?;
                    self.pages.reclaim(node_idx)?;
                    self.root = new_root;
                }
            }
            Ok(())
        } else {
            self.delete_from(child, key)
        }
    }

    /// Brings the child under the parent's cell `p` above the minimum,
    /// preferring a transfer over a merge and the right sibling over the
    /// left.
    fn rebalance(&mut self, parent: PageIdx, p: usize) -> Result<()> {
        let parent_len = self.len(parent)?;
        let child = self.child(parent, p)?;
        let ty = self.kind(child)?;
        let min = self.layout.min_cells(ty);

        if p + 1 < parent_len {
            let right = self.child(parent, p + 1)?;
            if self.len(right)? > min {
                return self.transfer_from_right(parent, p, child, right, ty);
            }
        }
        if p > 0 {
            let left = self.child(parent, p - 1)?;
            if self.len(left)? > min {
                return self.transfer_from_left(parent, p, child, left, ty);
            }
        }
        if p + 1 < parent_len {
            let right = self.child(parent, p + 1)?;
            return self.merge_right(parent, p, child, right, ty);
        }
        if p > 0 {
            let left = self.child(parent, p - 1)?;
            return self.merge_left(parent, p, child, left, ty);
        }
        panic!("rebalance fell through: node {parent} cell {p} has no sibling to borrow from or merge with");
    }

    fn transfer_from_right(
        &mut self,
        parent: PageIdx,
        p: usize,
        child: PageIdx,
        right: PageIdx,
        ty: NodeType,
    ) -> Result<()> {
        let layout = self.layout;
        let cell = {
            let page = self.pages.page(right)?;
            page[layout.cells_range(ty, 0, 1)].to_vec()
        };
        {
            let page = self.pages.page_mut(right)?;
            let n = node::cells_num(page);
            page.copy_within(layout.cells_range(ty, 1, n), node::NODE_HDR_LEN);
            node::set_cells_num(page, n - 1);
        }
        let sep = self.separator(parent, p)?;
        {
            let page = self.pages.page_mut(child)?;
            let n = node::cells_num(page);
            if ty == NodeType::Internal {
                // The old sentinel becomes an interior cell and takes the
                // parent separator as its key.
                node::internal_set_key(&layout, page, n - 1, sep);
            }
            page[layout.cells_range(ty, n, n + 1)].copy_from_slice(&cell);
            node::set_cells_num(page, n + 1);
        }
        let new_sep = self.last_key_of(child)?;
        let page = self.pages.page_mut(parent)?;
        node::internal_set_key(&layout, page, p, new_sep);
        Ok(())
    }

    fn transfer_from_left(
        &mut self,
        parent: PageIdx,
        p: usize,
        child: PageIdx,
        left: PageIdx,
        ty: NodeType,
    ) -> Result<()> {
        let layout = self.layout;
        let cell = {
            let page = self.pages.page_mut(left)?;
            let n = node::cells_num(page);
            let cell = page[layout.cells_range(ty, n - 1, n)].to_vec();
            node::set_cells_num(page, n - 1);
            cell
        };
        let sep = self.separator(parent, p - 1)?;
        {
            let page = self.pages.page_mut(child)?;
            let n = node::cells_num(page);
            page.copy_within(
                layout.cells_range(ty, 0, n),
                layout.cells_range(ty, 1, n + 1).start,
            );
            page[layout.cells_range(ty, 0, 1)].copy_from_slice(&cell);
            if ty == NodeType::Internal {
                // The moved cell was the left sibling's sentinel; its key is
                // the old separator between the two nodes.
                node::internal_set_key(&layout, page, 0, sep);
            }
            node::set_cells_num(page, n + 1);
        }
        let left_last = self.last_key_of(left)?;
        let page = self.pages.page_mut(parent)?;
        node::internal_set_key(&layout, page, p - 1, left_last);
        Ok(())
    }

    fn merge_right(
        &mut self,
        parent: PageIdx,
        p: usize,
        child: PageIdx,
        right: PageIdx,
        ty: NodeType,
    ) -> Result<()> {
        let layout = self.layout;
        let sep = self.separator(parent, p)?;
        let (right_cells, right_n) = {
            let page = self.pages.page(right)?;
            let n = node::cells_num(page);
            (page[layout.cells_range(ty, 0, n)].to_vec(), n)
        };
        {
            let page = self.pages.page_mut(child)?;
            let n = node::cells_num(page);
            debug_assert!(n + right_n <= layout.max_cells(ty), "merge overflows node");
            if ty == NodeType::Internal {
                node::internal_set_key(&layout, page, n - 1, sep);
            }
            page[layout.cells_range(ty, n, n + right_n)].copy_from_slice(&right_cells);
            node::set_cells_num(page, n + right_n);
        }
        self.pages.reclaim(right)?;
        // Widen the separator at p over the merged range before dropping the
        // right sibling's cell.
        let new_sep = match ty {
            NodeType::Leaf => self.last_key_of(child)?,
            NodeType::Internal => self.separator(parent, p + 1)?,
        };
        let page = self.pages.page_mut(parent)?;
        node::internal_set_key(&layout, page, p, new_sep);
        node::internal_remove_at(&layout, page, p + 1);
        Ok(())
    }

    fn merge_left(
        &mut self,
        parent: PageIdx,
        p: usize,
        child: PageIdx,
        left: PageIdx,
        ty: NodeType,
    ) -> Result<()> {
        let layout = self.layout;
        let sep = self.separator(parent, p - 1)?;
        let (left_cells, left_n) = {
            let page = self.pages.page(left)?;
            let n = node::cells_num(page);
            (page[layout.cells_range(ty, 0, n)].to_vec(), n)
        };
        {
            let page = self.pages.page_mut(child)?;
            let n = node::cells_num(page);
            debug_assert!(n + left_n <= layout.max_cells(ty), "merge overflows node");
            page.copy_within(
                layout.cells_range(ty, 0, n),
                layout.cells_range(ty, left_n, left_n + n).start,
            );
            page[layout.cells_range(ty, 0, left_n)].copy_from_slice(&left_cells);
            if ty == NodeType::Internal {
                node::internal_set_key(&layout, page, left_n - 1, sep);
            }
            node::set_cells_num(page, n + left_n);
        }
        self.pages.reclaim(left)?;
        let page = self.pages.page_mut(parent)?;
        node::internal_remove_at(&layout, page, p - 1);
        Ok(())
    }

    /// Walks the whole tree checking the structural invariants: cell counts
    /// within bounds, strictly increasing keys, separator bounds respected,
    /// and all leaves at the same depth. Diagnostics only; the write path
    /// never calls this.
    pub fn check_invariants(&mut self) -> Result<()> {
        let root = self.root;
        self.check_node(root, true, None, None).map(|_| ())
    }

    fn check_node(
        &mut self,
        idx: PageIdx,
        is_root: bool,
        lower: Option<Key>,
        upper: Option<Key>,
    ) -> Result<usize> {
        let layout = self.layout;
        let (ty, n) = {
            let page = self.pages.page(idx)?;
            (node::node_type(page)?, node::cells_num(page))
        };
        if n > layout.max_cells(ty) {
            return Err(BurrowError::Corruption("node above maximum cell count"));
        }
        if !is_root && n < layout.min_cells(ty) {
            return Err(BurrowError::Corruption("node below minimum cell count"));
        }
        match ty {
            NodeType::Leaf => {
                let keys: Vec<Key> = {
                    let page = self.pages.page(idx)?;
                    (0..n).map(|i| node::leaf_key(&layout, page, i)).collect()
                };
                for pair in keys.windows(2) {
                    if node::cmp_keys(pair[0], pair[1]) != Ordering::Less {
                        return Err(BurrowError::Corruption("leaf keys not strictly increasing"));
                    }
                }
                if let (Some(lo), Some(&first)) = (lower, keys.first()) {
                    if node::cmp_keys(first, lo) != Ordering::Greater {
                        return Err(BurrowError::Corruption("leaf key at or below lower bound"));
                    }
                }
                if let (Some(up), Some(&last)) = (upper, keys.last()) {
                    if node::cmp_keys(last, up) == Ordering::Greater {
                        return Err(BurrowError::Corruption("leaf key above upper bound"));
                    }
                }
                Ok(1)
            }
            NodeType::Internal => {
                if n == 0 {
                    return Err(BurrowError::Corruption("internal node without cells"));
                }
                let seps: Vec<Key> = {
                    let page = self.pages.page(idx)?;
                    (0..n).map(|i| node::internal_key(&layout, page, i)).collect()
                };
                for pair in seps[..n - 1].windows(2) {
                    if node::cmp_keys(pair[0], pair[1]) != Ordering::Less {
                        return Err(BurrowError::Corruption("separators not strictly increasing"));
                    }
                }
                let mut depth = None;
                for i in 0..n {
                    let child = self.child(idx, i)?;
                    let child_lower = if i == 0 { lower } else { Some(seps[i - 1]) };
                    let child_upper = if i == n - 1 { upper } else { Some(seps[i]) };
                    let d = self.check_node(child, false, child_lower, child_upper)?;
                    match depth {
                        None => depth = Some(d),
                        Some(expect) if expect != d => {
                            return Err(BurrowError::Corruption("leaves at different depths"));
                        }
                        Some(_) => {}
                    }
                }
                Ok(depth.expect("internal node has children") + 1)
            }
        }
    }
}

/// Ordered iterator over the tree's `(key, value)` pairs, driven by an
/// explicit descent stack so it works over any page source.
pub struct Iter<P: PageIo> {
    tree: BTree<P>,
    stack: SmallVec<[(PageIdx, usize); 8]>,
}

enum Step {
    Ascend,
    Yield(Key, Vec<u8>),
    Descend(PageIdx),
}

impl<P: PageIo> Iterator for Iter<P> {
    type Item = Result<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, pos) = *self.stack.last()?;
            let layout = self.tree.layout;
            let step = {
                let page = match self.tree.pages.page(idx) {
                    Ok(page) => page,
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                };
                let ty = match node::node_type(page) {
                    Ok(ty) => ty,
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                };
                if pos >= node::cells_num(page) {
                    Step::Ascend
                } else {
                    match ty {
                        NodeType::Leaf => Step::Yield(
                            node::leaf_key(&layout, page, pos),
                            node::leaf_value(&layout, page, pos).to_vec(),
                        ),
                        NodeType::Internal => {
                            Step::Descend(node::internal_child(&layout, page, pos))
                        }
                    }
                }
            };
            match step {
                Step::Ascend => {
                    self.stack.pop();
                }
                Step::Yield(key, value) => {
                    self.stack.last_mut().expect("stack non-empty").1 += 1;
                    return Some(Ok((key, value)));
                }
                Step::Descend(child) => {
                    self.stack.last_mut().expect("stack non-empty").1 += 1;
                    self.stack.push((child, 0));
                }
            }
        }
    }
}
