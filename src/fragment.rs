//! Fragment wire format.
//!
//! Every message travels as one or more fragments of exactly
//! `LENGTH_MESSAGE` bytes (big-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | protocol version (high nibble), type (low nibble) |
//! | 1 | 2 | group id, shared by all parts of one message |
//! | 3 | 2 | part index, from 0 |
//! | 5 | 2 | part count |
//! | 7 | 1 | chunk length |
//! | 8 | ≤132 | chunk |
//!
//! Bytes after the chunk are random filler.

use crate::block::fill_random;
use crate::crypto;

/// Size of one fragment on the wire
pub const LENGTH_MESSAGE: usize = 140;

pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Payload bytes carried by one fragment
pub const MAX_CHUNK: usize = LENGTH_MESSAGE - FRAGMENT_HEADER_SIZE;

pub const PROTOCOL_VERSION: u8 = 1;

/// One raw fragment as handed to or received from the transport
pub type RawFragment = [u8; LENGTH_MESSAGE];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("Fragment must be {LENGTH_MESSAGE} bytes, got {0}")]
    WrongLength(usize),
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown fragment type {0}")]
    UnknownType(u8),
    #[error("Part {index} of {count} is invalid")]
    BadPartIndex { index: u16, count: u16 },
    #[error("Chunk length {0} exceeds fragment")]
    BadChunkLength(usize),
    #[error("Payload needs {0} parts")]
    TooManyParts(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentType {
    Handshake,
    Confirm,
    Text,
}

impl FragmentType {
    fn to_u8(self) -> u8 {
        match self {
            Self::Handshake => 1,
            Self::Confirm => 2,
            Self::Text => 3,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Handshake),
            2 => Some(Self::Confirm),
            3 => Some(Self::Text),
            _ => None,
        }
    }
}

/// Decoded fragment header plus its chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentType,
    pub group_id: u16,
    pub index: u16,
    pub count: u16,
    pub chunk: Vec<u8>,
}

impl Fragment {
    pub fn parse(raw: &[u8]) -> Result<Self, FragmentError> {
        if raw.len() != LENGTH_MESSAGE {
            return Err(FragmentError::WrongLength(raw.len()));
        }
        let version = raw[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(FragmentError::UnsupportedVersion(version));
        }
        let kind = FragmentType::from_u8(raw[0] & 0x0F)
            .ok_or(FragmentError::UnknownType(raw[0] & 0x0F))?;
        let group_id = u16::from_be_bytes([raw[1], raw[2]]);
        let index = u16::from_be_bytes([raw[3], raw[4]]);
        let count = u16::from_be_bytes([raw[5], raw[6]]);
        if count == 0 || index >= count {
            return Err(FragmentError::BadPartIndex { index, count });
        }
        let len = raw[7] as usize;
        if len > MAX_CHUNK {
            return Err(FragmentError::BadChunkLength(len));
        }
        Ok(Self {
            kind,
            group_id,
            index,
            count,
            chunk: raw[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + len].to_vec(),
        })
    }

    /// Encode into one transport fragment; the chunk must fit
    pub fn to_bytes(&self) -> Result<RawFragment, FragmentError> {
        let len = self.chunk.len();
        if len > MAX_CHUNK {
            return Err(FragmentError::BadChunkLength(len));
        }
        let mut raw = [0u8; LENGTH_MESSAGE];
        raw[0] = (PROTOCOL_VERSION << 4) | self.kind.to_u8();
        raw[1..3].copy_from_slice(&self.group_id.to_be_bytes());
        raw[3..5].copy_from_slice(&self.index.to_be_bytes());
        raw[5..7].copy_from_slice(&self.count.to_be_bytes());
        raw[7] = len as u8;
        raw[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + len].copy_from_slice(&self.chunk[..len]);
        fill_random(&mut raw[FRAGMENT_HEADER_SIZE + len..]);
        Ok(raw)
    }
}

/// Random id for a new fragment group
#[must_use]
pub fn new_group_id() -> u16 {
    let bytes = crypto::random_bytes(2);
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Split `payload` into fragments sharing a fresh group id
pub fn split(kind: FragmentType, payload: &[u8]) -> Result<Vec<RawFragment>, FragmentError> {
    let parts = payload.len().div_ceil(MAX_CHUNK).max(1);
    let count = u16::try_from(parts).map_err(|_| FragmentError::TooManyParts(parts))?;
    let group_id = new_group_id();

    let mut chunks: Vec<&[u8]> = payload.chunks(MAX_CHUNK).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    chunks
        .into_iter()
        .zip(0u16..)
        .map(|(chunk, index)| {
            Fragment {
                kind,
                group_id,
                index,
                count,
                chunk: chunk.to_vec(),
            }
            .to_bytes()
        })
        .collect()
}

/// Concatenate the chunks of a complete group. `parts` must hold each
/// index exactly once.
pub fn reassemble(parts: &[Fragment]) -> Result<Vec<u8>, FragmentError> {
    let mut ordered: Vec<&Fragment> = parts.iter().collect();
    ordered.sort_by_key(|f| f.index);
    let mut payload = Vec::with_capacity(parts.len() * MAX_CHUNK);
    for (expected, part) in (0u16..).zip(&ordered) {
        if part.index != expected || part.count as usize != parts.len() {
            return Err(FragmentError::BadPartIndex {
                index: part.index,
                count: part.count,
            });
        }
        payload.extend_from_slice(&part.chunk);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment_layout() {
        let raw = Fragment {
            kind: FragmentType::Confirm,
            group_id: 0xBEEF,
            index: 0,
            count: 1,
            chunk: vec![1, 2, 3],
        }
        .to_bytes()
        .unwrap();

        assert_eq!(raw.len(), LENGTH_MESSAGE);
        assert_eq!(&raw[..11], &[0x12, 0xBE, 0xEF, 0, 0, 0, 1, 3, 1, 2, 3]);
        assert_eq!(Fragment::parse(&raw).unwrap().chunk, vec![1, 2, 3]);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let fragment = Fragment {
            kind: FragmentType::Text,
            group_id: 1,
            index: 0,
            count: 1,
            chunk: vec![0u8; MAX_CHUNK + 1],
        };
        assert_eq!(
            fragment.to_bytes(),
            Err(FragmentError::BadChunkLength(MAX_CHUNK + 1))
        );
    }

    #[test]
    fn test_split_and_reassemble() {
        let payload = crypto::random_bytes(500);
        let raws = split(FragmentType::Text, &payload).unwrap();
        assert_eq!(raws.len(), 4);

        let mut parts: Vec<Fragment> = raws.iter().map(|r| Fragment::parse(r).unwrap()).collect();
        assert!(parts.iter().all(|p| p.group_id == parts[0].group_id && p.count == 4));

        parts.reverse();
        assert_eq!(reassemble(&parts).unwrap(), payload);
    }

    #[test]
    fn test_split_empty_payload() {
        let raws = split(FragmentType::Handshake, &[]).unwrap();
        assert_eq!(raws.len(), 1);
        assert!(Fragment::parse(&raws[0]).unwrap().chunk.is_empty());
    }

    #[test]
    fn test_reassemble_rejects_gap() {
        let raws = split(FragmentType::Text, &[7u8; 300]).unwrap();
        let parts = vec![
            Fragment::parse(&raws[0]).unwrap(),
            Fragment::parse(&raws[2]).unwrap(),
        ];
        assert!(reassemble(&parts).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let good = split(FragmentType::Text, b"hi").unwrap()[0];

        assert_eq!(Fragment::parse(&good[..100]), Err(FragmentError::WrongLength(100)));

        let mut bad = good;
        bad[0] = 0x23;
        assert_eq!(Fragment::parse(&bad), Err(FragmentError::UnsupportedVersion(2)));

        let mut bad = good;
        bad[0] = 0x19;
        assert_eq!(Fragment::parse(&bad), Err(FragmentError::UnknownType(9)));

        let mut bad = good;
        bad[3..5].copy_from_slice(&1u16.to_be_bytes());
        assert_eq!(
            Fragment::parse(&bad),
            Err(FragmentError::BadPartIndex { index: 1, count: 1 })
        );

        let mut bad = good;
        bad[7] = 200;
        assert_eq!(Fragment::parse(&bad), Err(FragmentError::BadChunkLength(200)));
    }
}
