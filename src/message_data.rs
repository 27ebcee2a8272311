//! Message record: one logical message of a conversation.
//!
//! Text messages carry their body as a `CompressedText`; handshake and
//! confirm entries are kept for the conversation history with an empty
//! body. A message may span several blocks.
//!
//! Layout (big-endian):
//!
//! | size | field |
//! |---|---|
//! | 4 | next message |
//! | 1 | kind |
//! | 1 | direction |
//! | 1 | unread |
//! | 8 | timestamp (unix millis) |
//! | 6 + n | body: charset, compressed flag, length, bytes |

use crate::block::BlockId;
use crate::encoding::Reader;
use crate::record::{Record, RecordError};
use crate::text::{CompressedText, TextError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Handshake,
    Confirm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub id: BlockId,
    pub kind: MessageKind,
    pub direction: Direction,
    pub unread: bool,
    pub timestamp: u64,
    pub text: CompressedText,
    pub(crate) next: BlockId,
}

impl MessageData {
    /// Text message; fails with `TooLarge` before anything is stored
    pub fn text(body: &str, direction: Direction, timestamp: u64) -> Result<Self, TextError> {
        Ok(Self::from_text(CompressedText::from_text(body)?, direction, timestamp))
    }

    #[must_use]
    pub fn from_text(text: CompressedText, direction: Direction, timestamp: u64) -> Self {
        Self {
            id: BlockId::NONE,
            kind: MessageKind::Text,
            direction,
            unread: direction == Direction::Incoming,
            timestamp,
            text,
            next: BlockId::NONE,
        }
    }

    /// History entry for a handshake or confirm
    #[must_use]
    pub fn control(kind: MessageKind, direction: Direction, timestamp: u64) -> Self {
        Self {
            id: BlockId::NONE,
            kind,
            direction,
            unread: false,
            timestamp,
            text: CompressedText::empty(),
            next: BlockId::NONE,
        }
    }

    /// Decoded body text
    pub fn body(&self) -> Result<String, TextError> {
        self.text.decode()
    }
}

impl Record for MessageData {
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
        let mut out = Vec::with_capacity(15 + self.text.serialized_len());
        out.extend_from_slice(&self.next.0.to_be_bytes());
        out.push(match self.kind {
            MessageKind::Text => 0,
            MessageKind::Handshake => 1,
            MessageKind::Confirm => 2,
        });
        out.push(match self.direction {
            Direction::Incoming => 0,
            Direction::Outgoing => 1,
        });
        out.push(u8::from(self.unread));
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        self.text.write_to(&mut out);
        out
    }

    fn decode(id: BlockId, bytes: &[u8]) -> Result<Self, RecordError> {
        let mut r = Reader::new(bytes);
        let next = BlockId(r.u32()?);
        let kind = match r.u8()? {
            0 => MessageKind::Text,
            1 => MessageKind::Handshake,
            2 => MessageKind::Confirm,
            _ => return Err(RecordError::InvalidField("kind")),
        };
        let direction = match r.u8()? {
            0 => Direction::Incoming,
            1 => Direction::Outgoing,
            _ => return Err(RecordError::InvalidField("direction")),
        };
        let unread = r.u8()? != 0;
        let timestamp = r.u64()?;
        let text = CompressedText::read_from(&mut r)?;
        Ok(Self {
            id,
            kind,
            direction,
            unread,
            timestamp,
            text,
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::MAX_LENGTH;

    #[test]
    fn test_text_message_roundtrip() {
        let mut msg =
            MessageData::text("Call me at 5", Direction::Incoming, 1_700_000_000_000).unwrap();
        msg.next = BlockId(3);
        assert!(msg.unread);

        let decoded = MessageData::decode(BlockId(8), &msg.encode()).unwrap();
        assert_eq!(decoded.id, BlockId(8));
        assert_eq!(decoded.next, BlockId(3));
        assert_eq!(decoded.kind, MessageKind::Text);
        assert_eq!(decoded.direction, Direction::Incoming);
        assert_eq!(decoded.timestamp, 1_700_000_000_000);
        assert_eq!(decoded.body().unwrap(), "Call me at 5");
    }

    #[test]
    fn test_control_entry() {
        let msg = MessageData::control(MessageKind::Handshake, Direction::Outgoing, 5);
        let decoded = MessageData::decode(BlockId(1), &msg.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Handshake);
        assert!(!decoded.unread);
        assert_eq!(decoded.body().unwrap(), "");
    }

    #[test]
    fn test_too_large_text() {
        // random-looking text that zstd cannot shrink below the bound
        let body: String = crate::crypto::random_bytes(3 * MAX_LENGTH)
            .into_iter()
            .map(|b| char::from(b'a' + b % 26))
            .collect();
        assert!(matches!(
            MessageData::text(&body, Direction::Outgoing, 0),
            Err(TextError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut bytes = MessageData::control(MessageKind::Confirm, Direction::Incoming, 0).encode();
        bytes[4] = 9;
        assert!(MessageData::decode(BlockId(1), &bytes).is_err());
    }
}
