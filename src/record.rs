//! Typed records stored as chains, linked into singly-linked lists.
//!
//! Conversations, session keys, messages and pending fragments are all
//! kept newest-first in lists whose `next` link lives inside the encrypted
//! record itself. A record's id is the head block of its chain.

use std::collections::HashSet;

use crate::block::BlockId;
use crate::block_store::BlockStore;
use crate::chain::{self, ChainError};
use crate::crypto::MasterKey;
use crate::encoding::EncodingError;
use crate::fs::FileSystem;
use crate::text::TextError;

/// Errors from decoding a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Text(#[from] TextError),
    #[error("Invalid value for field {0}")]
    InvalidField(&'static str),
}

/// Errors from record list operations
#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("Record {id} is corrupted: {source}")]
    Record { id: BlockId, source: RecordError },
    #[error("List loops back to record {0}")]
    Cycle(BlockId),
    #[error("Record {0} is not in the list")]
    NotInList(BlockId),
}

/// A record that can live in a list
pub trait Record: Sized {
    fn id(&self) -> BlockId;
    fn set_id(&mut self, id: BlockId);
    fn next(&self) -> BlockId;
    fn set_next(&mut self, next: BlockId);
    fn encode(&self) -> Vec<u8>;
    fn decode(id: BlockId, bytes: &[u8]) -> Result<Self, RecordError>;
}

/// Read one record
pub fn load<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    id: BlockId,
) -> Result<R, ListError> {
    let bytes = chain::read_chain(store, key, id)?;
    R::decode(id, &bytes).map_err(|source| ListError::Record { id, source })
}

/// Every record of the list starting at `head`, in list order
pub fn load_list<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<Vec<R>, ListError> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut current = head;
    while !current.is_none() {
        if !seen.insert(current) {
            return Err(ListError::Cycle(current));
        }
        let record: R = load(store, key, current)?;
        current = record.next();
        records.push(record);
    }
    Ok(records)
}

/// Rewrite an existing record in place
pub fn save<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    record: &R,
) -> Result<(), ListError> {
    chain::write_chain(store, key, Some(record.id()), &record.encode())?;
    Ok(())
}

/// Store `record` in front of the list starting at `head`.
///
/// Assigns the record its id and returns it; the caller points the list
/// head at it.
pub fn push_front<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
    record: &mut R,
) -> Result<BlockId, ListError> {
    record.set_next(head);
    let id = chain::write_chain(store, key, None, &record.encode())?;
    record.set_id(id);
    Ok(id)
}

/// Remove `target` from the list starting at `head` and free its blocks.
///
/// Returns the new list head.
pub fn unlink<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
    target: BlockId,
) -> Result<BlockId, ListError> {
    let records: Vec<R> = load_list(store, key, head)?;
    let index = records
        .iter()
        .position(|r| r.id() == target)
        .ok_or(ListError::NotInList(target))?;
    let after = records[index].next();

    let new_head = if index == 0 {
        after
    } else {
        let mut previous = load::<R, F>(store, key, records[index - 1].id())?;
        previous.set_next(after);
        save(store, key, &previous)?;
        head
    };

    chain::free_chain(store, key, target)?;
    Ok(new_head)
}

/// Every block owned by the records of a list
pub fn list_blocks<R: Record, F: FileSystem>(
    store: &mut BlockStore<F>,
    key: &MasterKey,
    head: BlockId,
) -> Result<Vec<BlockId>, ListError> {
    let mut blocks = Vec::new();
    for record in load_list::<R, F>(store, key, head)? {
        blocks.extend(chain::chain_blocks(store, key, record.id())?);
    }
    Ok(blocks)
}
