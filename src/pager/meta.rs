use std::fmt;
use std::ops::Range;

use crate::checksum::meta_crc32;
use crate::error::{BurrowError, Result};
use crate::io::FileIo;
use crate::types::{PageIdx, TxId};

/// Encoded size of one meta record. The record sits at offset 0 of both
/// meta pages; the rest of the page is zero.
pub const META_RECORD_LEN: usize = 32;

/// Smallest page size the engine accepts.
pub const MIN_PAGE_SIZE: u32 = 64;

const META_PAGE_SIZE: Range<usize> = 0..4;
const META_ROOT: Range<usize> = 4..8;
const META_FREELIST: Range<usize> = 8..12;
const META_MAX_PAGE: Range<usize> = 12..16;
const META_TXID: Range<usize> = 16..24;
const META_VALUE_SIZE: Range<usize> = 24..28;
const META_CHECKSUM: Range<usize> = 28..32;

/// Database metadata kept redundantly on page 0 and page 1.
///
/// The copy with the higher txid that validates is authoritative; commits
/// always overwrite the older copy, so a torn write leaves the other one
/// intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Page holding the root node of the tree.
    pub root: PageIdx,
    /// Page reserved for the persisted freelist.
    pub freelist: PageIdx,
    /// One past the highest allocated page.
    pub max_page: PageIdx,
    /// Transaction id of the commit that wrote this record.
    pub txid: TxId,
    /// Fixed length of the values stored in leaf cells. Recorded at
    /// creation so a reopen cannot silently misread the leaf layout.
    pub value_size: u32,
    /// CRC-32 over every preceding byte of the record.
    pub checksum: u32,
}

impl Meta {
    /// Encodes the record into `buf`, recomputing the checksum. Returns the
    /// checksum that was stored.
    pub fn encode(&self, buf: &mut [u8]) -> Result<u32> {
        if buf.len() < META_RECORD_LEN {
            return Err(BurrowError::Invalid("meta buffer too small"));
        }
        buf[META_PAGE_SIZE].copy_from_slice(&self.page_size.to_le_bytes());
        buf[META_ROOT].copy_from_slice(&self.root.0.to_le_bytes());
        buf[META_FREELIST].copy_from_slice(&self.freelist.0.to_le_bytes());
        buf[META_MAX_PAGE].copy_from_slice(&self.max_page.0.to_le_bytes());
        buf[META_TXID].copy_from_slice(&self.txid.to_le_bytes());
        buf[META_VALUE_SIZE].copy_from_slice(&self.value_size.to_le_bytes());
        let crc = meta_crc32(&buf[..META_CHECKSUM.start]);
        buf[META_CHECKSUM].copy_from_slice(&crc.to_le_bytes());
        Ok(crc)
    }

    /// Decodes the record layout without judging its validity.
    pub fn decode(buf: &[u8]) -> Result<Meta> {
        if buf.len() < META_RECORD_LEN {
            return Err(BurrowError::Corruption("meta record truncated"));
        }
        Ok(Meta {
            page_size: u32::from_le_bytes(buf[META_PAGE_SIZE].try_into().unwrap()),
            root: PageIdx(u32::from_le_bytes(buf[META_ROOT].try_into().unwrap())),
            freelist: PageIdx(u32::from_le_bytes(buf[META_FREELIST].try_into().unwrap())),
            max_page: PageIdx(u32::from_le_bytes(buf[META_MAX_PAGE].try_into().unwrap())),
            txid: TxId::from_le_bytes(buf[META_TXID].try_into().unwrap()),
            value_size: u32::from_le_bytes(buf[META_VALUE_SIZE].try_into().unwrap()),
            checksum: u32::from_le_bytes(buf[META_CHECKSUM].try_into().unwrap()),
        })
    }

    /// A record is valid iff its checksum is 0 (uninitialized) or matches the
    /// CRC-32 of the preceding bytes.
    pub fn record_is_valid(buf: &[u8]) -> bool {
        if buf.len() < META_RECORD_LEN {
            return false;
        }
        let stored = u32::from_le_bytes(buf[META_CHECKSUM].try_into().unwrap());
        stored == 0 || stored == meta_crc32(&buf[..META_CHECKSUM.start])
    }

    /// Structural sanity on top of the checksum: a persisted meta must name a
    /// root and freelist below its allocation watermark.
    fn is_plausible(&self) -> bool {
        self.page_size >= MIN_PAGE_SIZE
            && self.root < self.max_page
            && self.freelist < self.max_page
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Meta(page_size={}, root={}, freelist={}, max_page={}, txid={}, value_size={}, checksum={:#010x})",
            self.page_size,
            self.root,
            self.freelist,
            self.max_page,
            self.txid,
            self.value_size,
            self.checksum,
        )
    }
}

fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE {
        return Err(BurrowError::Invalid("page size too small"));
    }
    if page_size % 8 != 0 {
        return Err(BurrowError::Invalid("page size must be a multiple of 8"));
    }
    Ok(())
}

/// Initializes a blank database file: two meta records (txid 0 and 1 so the
/// newer copy is deterministic), a zeroed freelist page and a zeroed root
/// leaf, written in one gathered write followed by fsync.
pub fn init(io: &dyn FileIo, page_size: u32, value_size: u32) -> Result<(Meta, u8)> {
    validate_page_size(page_size)?;
    let ps = page_size as usize;
    let mut buf = vec![0u8; ps * 4];
    let mut meta = Meta {
        page_size,
        root: PageIdx(3),
        freelist: PageIdx::FREELIST,
        max_page: PageIdx(4),
        txid: 0,
        value_size,
        checksum: 0,
    };
    meta.checksum = meta.encode(&mut buf[..META_RECORD_LEN])?;
    let mut newer = Meta { txid: 1, ..meta };
    newer.checksum = newer.encode(&mut buf[ps..ps + META_RECORD_LEN])?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok((newer, 1))
}

/// Reads both meta pages and selects the authoritative copy: the valid record
/// with the larger txid wins; if it fails validation the other is tried; if
/// neither validates the open fails.
pub fn load(io: &dyn FileIo, fallback_page_size: u32) -> Result<(Meta, u8)> {
    let mut rec0 = [0u8; META_RECORD_LEN];
    match io.read_at(0, &mut rec0) {
        Ok(()) => {}
        Err(BurrowError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(BurrowError::Corruption("meta page 0 truncated"));
        }
        Err(err) => return Err(err),
    }
    let meta0 = Meta::decode(&rec0)?;

    // Page 1 starts one page in; trust page 0's size field when it is sane,
    // even if its checksum is not, since a torn commit only mangles the tail
    // of the record.
    let ps = if meta0.page_size >= MIN_PAGE_SIZE && meta0.page_size % 8 == 0 {
        meta0.page_size
    } else {
        fallback_page_size
    };
    let mut rec1 = [0u8; META_RECORD_LEN];
    let meta1 = match io.read_at(ps as u64, &mut rec1) {
        Ok(()) => Some(Meta::decode(&rec1)?),
        Err(_) => None,
    };

    let valid0 = Meta::record_is_valid(&rec0) && meta0.is_plausible();
    let valid1 = meta1
        .map(|m| Meta::record_is_valid(&rec1) && m.is_plausible())
        .unwrap_or(false);

    match (valid0, valid1) {
        (true, true) => {
            let meta1 = meta1.unwrap();
            if meta1.txid > meta0.txid {
                Ok((meta1, 1))
            } else {
                Ok((meta0, 0))
            }
        }
        (true, false) => Ok((meta0, 0)),
        (false, true) => Ok((meta1.unwrap(), 1)),
        (false, false) => Err(BurrowError::Corruption("both meta pages invalid")),
    }
}

/// Writes `meta` into the given slot (page 0 or 1) and fsyncs. Returns the
/// record as stored, checksum included.
pub fn write_slot(io: &dyn FileIo, page_size: u32, slot: u8, meta: &Meta) -> Result<Meta> {
    debug_assert!(slot < 2, "meta slot out of range");
    let mut rec = [0u8; META_RECORD_LEN];
    let mut stored = *meta;
    stored.checksum = stored.encode(&mut rec)?;
    io.write_at(u64::from(slot) * u64::from(page_size), &rec)?;
    io.sync_all()?;
    Ok(stored)
}
