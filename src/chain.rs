//! Encrypted block chains.
//!
//! Every entity is stored as a chain of one or more blocks. Each block is
//! sealed on its own with the master key so that its ciphertext fills the
//! block exactly:
//!
//! ```text
//! plaintext = [next: u32][used: u16][data: used bytes][random filler]
//! block     = encrypt_with_key(plaintext)   // exactly align_size bytes
//! ```
//!
//! The head block id is the entity's identity. Rewriting an entity reuses
//! its blocks (head first), allocates more when it grew and frees the
//! surplus when it shrank, so the head id never changes.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::block::{fill_random, BlockId};
use crate::block_store::{BlockStore, BlockStoreError};
use crate::crypto::{self, CryptoError, MasterKey, ENCRYPTION_OVERHEAD};
use crate::fs::FileSystem;

/// `next` link + `used` length in front of every block's data
pub const BLOCK_HEADER_SIZE: usize = 6;

/// Errors from chain operations
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Store(#[from] BlockStoreError),
    #[error("Block could not be opened: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Corrupted block {0}")]
    Corrupted(BlockId),
    #[error("Chain loops back to block {0}")]
    Cycle(BlockId),
}

/// Data bytes one block can carry
#[must_use]
pub const fn block_capacity(align_size: usize) -> usize {
    align_size - ENCRYPTION_OVERHEAD - BLOCK_HEADER_SIZE
}

/// Blocks needed to store `len` bytes (an empty chain still takes one)
#[must_use]
pub fn blocks_needed(align_size: usize, len: usize) -> usize {
    len.div_ceil(block_capacity(align_size)).max(1)
}

fn seal_block(
    align_size: usize,
    key: &MasterKey,
    next: BlockId,
    data: &[u8],
) -> Result<Vec<u8>, ChainError> {
    let mut plain = vec![0u8; align_size - ENCRYPTION_OVERHEAD];
    plain[..4].copy_from_slice(&next.0.to_be_bytes());
    // data.len() <= block_capacity, which fits in u16 for any supported align
    plain[4..6].copy_from_slice(&(data.len() as u16).to_be_bytes());
    plain[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + data.len()].copy_from_slice(data);
    fill_random(&mut plain[BLOCK_HEADER_SIZE + data.len()..]);
    Ok(crypto::encrypt_with_key(&plain, key.as_bytes())?)
}

fn open_block<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    id: BlockId,
) -> Result<(BlockId, Vec<u8>), ChainError> {
    let sealed = store.read(id)?;
    let plain = crypto::decrypt_with_key(&sealed, key.as_bytes())?;
    if plain.len() < BLOCK_HEADER_SIZE {
        return Err(ChainError::Corrupted(id));
    }
    let next = BlockId(u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]));
    let used = u16::from_be_bytes([plain[4], plain[5]]) as usize;
    if used > plain.len() - BLOCK_HEADER_SIZE {
        return Err(ChainError::Corrupted(id));
    }
    Ok((next, plain[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + used].to_vec()))
}

fn walk<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<(Vec<u8>, Vec<BlockId>), ChainError> {
    let mut data = Vec::new();
    let mut blocks = Vec::new();
    let mut seen = HashSet::new();
    let mut current = head;
    while !current.is_none() {
        if !seen.insert(current) {
            return Err(ChainError::Cycle(current));
        }
        let (next, chunk) = open_block(store, key, current)?;
        data.extend_from_slice(&chunk);
        blocks.push(current);
        current = next;
    }
    Ok((data, blocks))
}

/// Concatenated data of the chain starting at `head`
pub fn read_chain<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<Vec<u8>, ChainError> {
    walk(store, key, head).map(|(data, _)| data)
}

/// Block ids of the chain starting at `head`, in order
pub fn chain_blocks<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<Vec<BlockId>, ChainError> {
    walk(store, key, head).map(|(_, blocks)| blocks)
}

/// Write `data` as a chain and return its head.
///
/// With `existing`, the chain is rewritten in place and keeps its head.
/// Every extra block is allocated before anything is written; if an
/// allocation or write fails, the blocks allocated here are released.
pub fn write_chain<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    existing: Option<BlockId>,
    data: &[u8],
) -> Result<BlockId, ChainError> {
    let align_size = store.align_size();
    let capacity = block_capacity(align_size);
    let needed = blocks_needed(align_size, data.len());

    let mut blocks = match existing {
        Some(head) => chain_blocks(store, key, head)?,
        None => Vec::new(),
    };
    let surplus = if blocks.len() > needed {
        blocks.split_off(needed)
    } else {
        Vec::new()
    };

    let mut fresh = Vec::new();
    while blocks.len() + fresh.len() < needed {
        match store.allocate() {
            Ok(id) => fresh.push(id),
            Err(e) => {
                release(store, &fresh);
                return Err(e.into());
            }
        }
    }
    blocks.extend_from_slice(&fresh);

    for (i, id) in blocks.iter().enumerate() {
        let start = i * capacity;
        let end = (start + capacity).min(data.len());
        let chunk = data.get(start..end).unwrap_or(&[]);
        let next = blocks.get(i + 1).copied().unwrap_or(BlockId::NONE);

        let written = seal_block(align_size, key, next, chunk)
            .and_then(|sealed| store.write(*id, &sealed).map_err(ChainError::from));
        if let Err(e) = written {
            release(store, &fresh);
            return Err(e);
        }
    }

    for id in surplus {
        store.free(id)?;
    }

    debug!(head = %blocks[0], blocks = blocks.len(), bytes = data.len(), "wrote chain");
    Ok(blocks[0])
}

/// Return every block of the chain to the free list
pub fn free_chain<F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<(), ChainError> {
    for id in chain_blocks(store, key, head)? {
        store.free(id)?;
    }
    Ok(())
}

fn release<F: FileSystem>(store: &mut BlockStore<F>, blocks: &[BlockId]) {
    for &id in blocks {
        if let Err(e) = store.free(id) {
            warn!(block = %id, error = %e, "could not release block after failed write");
        }
    }
}
