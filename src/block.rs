//! Block layout for the store file.
//!
//! The store file is a header block followed by N fixed-size blocks:
//!
//! ```text
//! store.bin: [Header][Block 1][Block 2]...[Block N-1]
//! ```
//!
//! - Every block is exactly `align_size` bytes (default `ALIGN_SIZE`)
//! - Block 0 is always the header, so index 0 doubles as the "null" link
//! - Free blocks form a singly-linked list threaded through their first
//!   4 bytes; the rest of a free block is random filler

use rand::RngCore;

// ============================================================
// CONSTANTS
// ============================================================

/// Default size of every block (and of the header block)
pub const ALIGN_SIZE: usize = 256;

/// Smallest block size a store can be created with
pub const MIN_ALIGN_SIZE: usize = 128;

/// File magic, first 4 bytes of the header
pub const HEADER_MAGIC: [u8; 4] = *b"SMSV";

/// On-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Bytes of the header actually used by `StoreHeader`
pub const HEADER_USED_SIZE: usize = 26;

// ============================================================
// BLOCK ID
// ============================================================

/// Index of a block inside the store file.
///
/// `BlockId(0)` is the header and is never handed out by `allocate()`,
/// so it is used as the end-of-list marker in every on-disk link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Null link (points at the header)
    pub const NONE: BlockId = BlockId(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null link
    #[must_use]
    pub fn to_option(self) -> Option<BlockId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }

    #[must_use]
    pub fn from_option(id: Option<BlockId>) -> BlockId {
        id.unwrap_or(BlockId::NONE)
    }

    /// Byte offset of this block in the store file
    #[must_use]
    pub fn offset(self, align_size: usize) -> u64 {
        self.0 as u64 * align_size as u64
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw content of one block, always exactly `align_size` bytes
pub type RawBlock = Vec<u8>;

/// Fill a buffer with random bytes
pub fn fill_random(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
}

// ============================================================
// HEADER
// ============================================================

/// Header stored in block 0 (big-endian):
///
/// | offset | size | field |
/// |---|---|---|
/// | 0 | 4 | magic `SMSV` |
/// | 4 | 2 | format version |
/// | 6 | 4 | block size |
/// | 10 | 4 | free-list head |
/// | 14 | 4 | total block count (header included) |
/// | 18 | 4 | first conversation |
/// | 22 | 4 | first pending fragment |
///
/// The rest of the header block is random filler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreHeader {
    pub version: u16,
    pub align_size: u32,
    pub free_head: BlockId,
    pub block_count: u32,
    pub conversations_head: BlockId,
    pub pending_head: BlockId,
}

impl StoreHeader {
    /// Header of a freshly created store (header block only)
    #[must_use]
    pub fn new(align_size: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            align_size: align_size as u32,
            free_head: BlockId::NONE,
            block_count: 1,
            conversations_head: BlockId::NONE,
            pending_head: BlockId::NONE,
        }
    }

    /// Serialize into a full header block
    #[must_use]
    pub fn to_block(&self) -> RawBlock {
        let mut block = vec![0u8; self.align_size as usize];
        fill_random(&mut block[HEADER_USED_SIZE..]);
        block[0..4].copy_from_slice(&HEADER_MAGIC);
        block[4..6].copy_from_slice(&self.version.to_be_bytes());
        block[6..10].copy_from_slice(&self.align_size.to_be_bytes());
        block[10..14].copy_from_slice(&self.free_head.0.to_be_bytes());
        block[14..18].copy_from_slice(&self.block_count.to_be_bytes());
        block[18..22].copy_from_slice(&self.conversations_head.0.to_be_bytes());
        block[22..26].copy_from_slice(&self.pending_head.0.to_be_bytes());
        block
    }

    /// Parse a header block. `None` if magic or version don't match.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_USED_SIZE || bytes[0..4] != HEADER_MAGIC {
            return None;
        }
        let be_u32 = |at: usize| -> Option<u32> {
            Some(u32::from_be_bytes(bytes[at..at + 4].try_into().ok()?))
        };
        let version = u16::from_be_bytes(bytes[4..6].try_into().ok()?);
        if version != FORMAT_VERSION {
            return None;
        }
        Some(Self {
            version,
            align_size: be_u32(6)?,
            free_head: BlockId(be_u32(10)?),
            block_count: be_u32(14)?,
            conversations_head: BlockId(be_u32(18)?),
            pending_head: BlockId(be_u32(22)?),
        })
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = StoreHeader::new(ALIGN_SIZE);
        header.free_head = BlockId(7);
        header.block_count = 12;
        header.conversations_head = BlockId(3);
        header.pending_head = BlockId(9);

        let block = header.to_block();
        assert_eq!(block.len(), ALIGN_SIZE);
        assert_eq!(&block[0..4], b"SMSV");

        assert_eq!(StoreHeader::from_bytes(&block), Some(header));
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut block = StoreHeader::new(ALIGN_SIZE).to_block();
        block[0] = b'X';
        assert!(StoreHeader::from_bytes(&block).is_none());
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut block = StoreHeader::new(ALIGN_SIZE).to_block();
        block[4..6].copy_from_slice(&99u16.to_be_bytes());
        assert!(StoreHeader::from_bytes(&block).is_none());
    }

    #[test]
    fn test_block_id_null_link() {
        assert!(BlockId::NONE.is_none());
        assert_eq!(BlockId::NONE.to_option(), None);
        assert_eq!(BlockId(4).to_option(), Some(BlockId(4)));
        assert_eq!(BlockId::from_option(None), BlockId::NONE);
        assert_eq!(BlockId(3).offset(256), 768);
    }
}
