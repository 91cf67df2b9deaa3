use std::fmt;

/// Index of a fixed-size page within the database file.
///
/// Pages 0 and 1 hold the redundant meta records, page 2 is reserved for the
/// freelist, and pages from 3 onward hold tree nodes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIdx(pub u32);

impl PageIdx {
    pub const META_0: PageIdx = PageIdx(0);
    pub const META_1: PageIdx = PageIdx(1);
    pub const FREELIST: PageIdx = PageIdx(2);

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PageIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key domain of the tree: a 64-bit unsigned integer with natural order.
///
/// Every comparison funnels through [`crate::tree::node::cmp_keys`], so the
/// domain could widen to a fixed-length byte sequence without touching the
/// tree algorithms.
pub type Key = u64;

/// Monotonically increasing identifier of a committed write transaction.
pub type TxId = u64;
