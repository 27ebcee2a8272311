//! Staged incoming fragment, waiting for the rest of its group.
//!
//! Layout (big-endian): next (4), sender fixed-width ASCII (32),
//! received at in unix millis (8), raw fragment (`LENGTH_MESSAGE`).

use crate::block::BlockId;
use crate::conversation::IDENTITY_WIDTH;
use crate::encoding::Reader;
use crate::fragment::{Fragment, FragmentError, RawFragment, LENGTH_MESSAGE};
use crate::record::{Record, RecordError};
use crate::text::{from_fixed_ascii, to_fixed_ascii, Charset};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFragment {
    pub id: BlockId,
    pub sender: String,
    pub received_at: u64,
    pub raw: RawFragment,
    pub(crate) next: BlockId,
}

impl PendingFragment {
    #[must_use]
    pub fn new(sender: &str, received_at: u64, raw: RawFragment) -> Self {
        Self {
            id: BlockId::NONE,
            sender: sender.to_string(),
            received_at,
            raw,
            next: BlockId::NONE,
        }
    }

    pub fn fragment(&self) -> Result<Fragment, FragmentError> {
        Fragment::parse(&self.raw)
    }
}

impl Record for PendingFragment {
    fn id(&self) -> BlockId {
        self.id
    }

    fn set_id(&mut self, id: BlockId) {
        self.id = id;
    }

    fn next(&self) -> BlockId {
        self.next
    }

    fn set_next(&mut self, next: BlockId) {
        self.next = next;
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + IDENTITY_WIDTH + 8 + LENGTH_MESSAGE);
        out.extend_from_slice(&self.next.0.to_be_bytes());
        match to_fixed_ascii(&self.sender, IDENTITY_WIDTH, Charset::Ascii8) {
            Ok(field) => out.extend_from_slice(&field),
            Err(_) => out.extend_from_slice(&[0u8; IDENTITY_WIDTH]),
        }
        out.extend_from_slice(&self.received_at.to_be_bytes());
        out.extend_from_slice(&self.raw);
        out
    }

    fn decode(id: BlockId, bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let next = BlockId(r.u32()?);
        let sender =
            from_fixed_ascii(r.bytes(IDENTITY_WIDTH)?, 0, IDENTITY_WIDTH, Charset::Ascii8)?;
        Ok(Self {
            id,
            sender,
            received_at: r.u64()?,
            raw: r.array::<LENGTH_MESSAGE>()?,
            next,
        })
    }
}
