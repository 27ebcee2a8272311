//! Conversation record: one thread with a peer phone number.
//!
//! Layout (big-endian):
//!
//! | size | field |
//! |---|---|
//! | 4 | next conversation |
//! | 32 | peer phone, fixed-width ASCII |
//! | 4 | first session-keys record |
//! | 4 | first message |
//! | 4 | unread message count |

use crate::block::BlockId;
use crate::encoding::Reader;
use crate::record::{Record, RecordError};
use crate::text::{from_fixed_ascii, to_fixed_ascii, Charset};

/// Width of phone-number and SIM-serial fields
pub const IDENTITY_WIDTH: usize = 32;

/// Whether `identity` can be stored losslessly in an identity field
#[must_use]
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity.len() <= IDENTITY_WIDTH
        && identity.bytes().all(|b| b.is_ascii_graphic())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: BlockId,
    pub phone: String,
    pub unread: u32,
    pub(crate) next: BlockId,
    pub(crate) sessions_head: BlockId,
    pub(crate) messages_head: BlockId,
}

impl Conversation {
    #[must_use]
    pub fn new(phone: &str) -> Self {
        Self {
            id: BlockId::NONE,
            phone: phone.to_string(),
            unread: 0,
            next: BlockId::NONE,
            sessions_head: BlockId::NONE,
            messages_head: BlockId::NONE,
        }
    }

    #[must_use]
    pub fn has_messages(&self) -> bool {
        !self.messages_head.is_none()
    }
}

impl Record for Conversation {
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
        let mut out = Vec::with_capacity(48);
        out.extend_from_slice(&self.next.0.to_be_bytes());
        // phone numbers are validated before a conversation is created
        match to_fixed_ascii(&self.phone, IDENTITY_WIDTH, Charset::Ascii8) {
            Ok(field) => out.extend_from_slice(&field),
            Err(_) => out.extend_from_slice(&[0u8; IDENTITY_WIDTH]),
        }
        out.extend_from_slice(&self.sessions_head.0.to_be_bytes());
        out.extend_from_slice(&self.messages_head.0.to_be_bytes());
        out.extend_from_slice(&self.unread.to_be_bytes());
        out
    }

    fn decode(id: BlockId, bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let next = BlockId(r.u32()?);
        let phone =
            from_fixed_ascii(r.bytes(IDENTITY_WIDTH)?, 0, IDENTITY_WIDTH, Charset::Ascii8)?;
        if phone.is_empty() {
            return Err(RecordError::InvalidField("phone"));
        }
        Ok(Self {
            id,
            phone,
            next,
            sessions_head: BlockId(r.u32()?),
            messages_head: BlockId(r.u32()?),
            unread: r.u32()?,
        })
    }
}
