//! Block store: a single file of fixed-size aligned blocks with a free list.
//!
//! All higher entities (conversations, session keys, messages, pending
//! fragments) are built from one or more linked blocks handed out by
//! `allocate()`.
//!
//! # Invariants
//!
//! - The file length is always `block_count * align_size`
//! - Reads and writes always cover exactly one whole block
//! - Every block after the header is either on the free list or owned by
//!   exactly one live entity (verified by `check_structure`)
//!
//! The store itself is not synchronized; `Storage` wraps it in the single
//! process-wide lock.

use std::collections::HashSet;
use std::io;

use tracing::{debug, info};

use crate::block::{fill_random, BlockId, RawBlock, StoreHeader, MIN_ALIGN_SIZE};
use crate::fs::FileSystem;

/// Errors from block store operations
#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid store header")]
    InvalidHeader,
    #[error("Block size mismatch: store uses {found}, expected {expected}")]
    AlignMismatch { expected: usize, found: usize },
    #[error("Unsupported block size {0}")]
    UnsupportedAlign(usize),
    #[error("File length {0} does not match the header")]
    BadLength(u64),
    #[error("Block {0} out of range")]
    OutOfRange(BlockId),
    #[error("Block {0} is already free")]
    DoubleFree(BlockId),
    #[error("Block must be {expected} bytes, got {found}")]
    WrongBlockSize { expected: usize, found: usize },
    #[error("Inconsistent structure: {0}")]
    Inconsistent(String),
}

/// Summary returned by a successful structural check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureReport {
    pub block_count: u32,
    pub free_blocks: usize,
    pub live_blocks: usize,
}

/// Fixed-block arena backed by one file
pub struct BlockStore<F: FileSystem> {
    fs: F,
    header: StoreHeader,
    align_size: usize,
}

impl<F: FileSystem> BlockStore<F> {
    /// Open the store, creating a fresh header if the file is empty.
    ///
    /// A new store is exactly one block long (the header).
    pub fn open(mut fs: F, align_size: usize) -> Result<Self, BlockStoreError> {
        if align_size < MIN_ALIGN_SIZE || align_size > u32::MAX as usize {
            return Err(BlockStoreError::UnsupportedAlign(align_size));
        }

        let size = fs.get_size()?;
        if size == 0 {
            let header = StoreHeader::new(align_size);
            fs.write_bytes(0, &header.to_block())?;
            fs.flush()?;
            info!(align_size, "created new block store");
            return Ok(Self { fs, header, align_size });
        }

        if size < align_size as u64 {
            return Err(BlockStoreError::BadLength(size));
        }
        let first = fs.read_bytes(0, align_size)?;
        let header = StoreHeader::from_bytes(&first).ok_or(BlockStoreError::InvalidHeader)?;
        if header.align_size as usize != align_size {
            return Err(BlockStoreError::AlignMismatch {
                expected: align_size,
                found: header.align_size as usize,
            });
        }
        if size % align_size as u64 != 0 || size != header.block_count as u64 * align_size as u64 {
            return Err(BlockStoreError::BadLength(size));
        }

        debug!(blocks = header.block_count, "opened block store");
        Ok(Self { fs, header, align_size })
    }

    /// Size of every block in bytes
    #[must_use]
    pub fn align_size(&self) -> usize {
        self.align_size
    }

    /// Total blocks in the file, header included
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.header.block_count
    }

    #[must_use]
    pub fn conversations_head(&self) -> BlockId {
        self.header.conversations_head
    }

    pub fn set_conversations_head(&mut self, head: BlockId) -> Result<(), BlockStoreError> {
        self.header.conversations_head = head;
        self.write_header()
    }

    #[must_use]
    pub fn pending_head(&self) -> BlockId {
        self.header.pending_head
    }

    pub fn set_pending_head(&mut self, head: BlockId) -> Result<(), BlockStoreError> {
        self.header.pending_head = head;
        self.write_header()
    }

    // ============================================================
    // ALLOCATION
    // ============================================================

    /// Take a block from the free list, or grow the file by one block
    pub fn allocate(&mut self) -> Result<BlockId, BlockStoreError> {
        if let Some(id) = self.header.free_head.to_option() {
            let block = self.read(id)?;
            let next = BlockId(read_link(&block));
            if next == id || next.0 >= self.header.block_count {
                return Err(BlockStoreError::Inconsistent(format!(
                    "free block {id} links to {next}"
                )));
            }
            self.header.free_head = next;
            self.write_header()?;
            debug!(block = id.0, "allocated block from free list");
            return Ok(id);
        }

        let id = BlockId(self.header.block_count);
        let mut filler = vec![0u8; self.align_size];
        fill_random(&mut filler);
        self.fs.write_bytes(id.offset(self.align_size), &filler)?;
        self.header.block_count += 1;
        self.write_header()?;
        debug!(block = id.0, "allocated block by extending file");
        Ok(id)
    }

    /// Return a block to the free list.
    ///
    /// The block is overwritten with random filler (apart from the link).
    pub fn free(&mut self, id: BlockId) -> Result<(), BlockStoreError> {
        self.check_range(id)?;
        if self.free_list()?.contains(&id) {
            return Err(BlockStoreError::DoubleFree(id));
        }

        let mut block = vec![0u8; self.align_size];
        fill_random(&mut block[4..]);
        block[0..4].copy_from_slice(&self.header.free_head.0.to_be_bytes());
        self.fs.write_bytes(id.offset(self.align_size), &block)?;

        self.header.free_head = id;
        self.write_header()?;
        debug!(block = id.0, "freed block");
        Ok(())
    }

    // ============================================================
    // READ/WRITE
    // ============================================================

    /// Read one whole block
    pub fn read(&mut self, id: BlockId) -> Result<RawBlock, BlockStoreError> {
        self.check_range(id)?;
        Ok(self.fs.read_bytes(id.offset(self.align_size), self.align_size)?)
    }

    /// Overwrite one whole block
    pub fn write(&mut self, id: BlockId, block: &[u8]) -> Result<(), BlockStoreError> {
        self.check_range(id)?;
        if block.len() != self.align_size {
            return Err(BlockStoreError::WrongBlockSize {
                expected: self.align_size,
                found: block.len(),
            });
        }
        self.fs.write_bytes(id.offset(self.align_size), block)?;
        Ok(())
    }

    /// Flush the backing file
    pub fn flush(&mut self) -> Result<(), BlockStoreError> {
        Ok(self.fs.flush()?)
    }

    // ============================================================
    // STRUCTURE
    // ============================================================

    /// Walk the free list, failing on cycles or out-of-range links
    pub fn free_list(&mut self) -> Result<Vec<BlockId>, BlockStoreError> {
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        let mut current = self.header.free_head;

        while let Some(id) = current.to_option() {
            if id.0 >= self.header.block_count {
                return Err(BlockStoreError::Inconsistent(format!(
                    "free list points outside the file at {id}"
                )));
            }
            if !seen.insert(id) {
                return Err(BlockStoreError::Inconsistent(format!(
                    "free list revisits {id}"
                )));
            }
            list.push(id);
            let block = self.fs.read_bytes(id.offset(self.align_size), self.align_size)?;
            current = BlockId(read_link(&block));
        }

        Ok(list)
    }

    /// Verify file length, the free list, and that `live` together with
    /// the free list covers every block exactly once.
    pub fn check_structure(
        &mut self,
        live: impl IntoIterator<Item = BlockId>,
    ) -> Result<StructureReport, BlockStoreError> {
        let size = self.fs.get_size()?;
        if size % self.align_size as u64 != 0
            || size != self.header.block_count as u64 * self.align_size as u64
        {
            return Err(BlockStoreError::BadLength(size));
        }

        let free: HashSet<BlockId> = self.free_list()?.into_iter().collect();

        let mut owned = HashSet::new();
        for id in live {
            if id.is_none() || id.0 >= self.header.block_count {
                return Err(BlockStoreError::Inconsistent(format!(
                    "live entity references invalid block {id}"
                )));
            }
            if free.contains(&id) {
                return Err(BlockStoreError::Inconsistent(format!(
                    "block {id} is both free and owned"
                )));
            }
            if !owned.insert(id) {
                return Err(BlockStoreError::Inconsistent(format!(
                    "block {id} is owned twice"
                )));
            }
        }

        let accounted = free.len() + owned.len();
        let expected = self.header.block_count as usize - 1;
        if accounted != expected {
            return Err(BlockStoreError::Inconsistent(format!(
                "{} of {} blocks unaccounted for",
                expected - accounted,
                expected
            )));
        }

        Ok(StructureReport {
            block_count: self.header.block_count,
            free_blocks: free.len(),
            live_blocks: owned.len(),
        })
    }

    fn check_range(&self, id: BlockId) -> Result<(), BlockStoreError> {
        if id.is_none() || id.0 >= self.header.block_count {
            return Err(BlockStoreError::OutOfRange(id));
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), BlockStoreError> {
        self.fs.write_bytes(0, &self.header.to_block())?;
        Ok(())
    }

    /// Consume the store and return the filesystem (for testing)
    #[cfg(test)]
    pub fn into_fs(self) -> F {
        self.fs
    }
}

fn read_link(block: &[u8]) -> u32 {
    u32::from_be_bytes([block[0], block[1], block[2], block[3]])
}

// ============================================================
// TESTS
// ============================================================
