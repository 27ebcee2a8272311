//! Text codec for message bodies and fixed-width identity fields.
//!
//! A `CompressedText` is a text value tagged with the charset it was
//! encoded in and whether the encoded bytes went through zstd. Message
//! bodies are bounded by `MAX_LENGTH` stored bytes and over-long input is
//! rejected. Fixed-width identity fields (phone numbers, SIM serials) are
//! truncated instead and padded with random filler.

use crate::block::fill_random;
use crate::encoding::{EncodingError, Reader};

/// Maximum stored (possibly compressed) length of a message body
pub const MAX_LENGTH: usize = 34_870;

/// Maximum length of the encoded text before compression
pub const MAX_DECODED_LENGTH: usize = 4 * MAX_LENGTH;

const ZSTD_LEVEL: i32 = 3;

/// Errors from the text codec
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("Character {0:?} not representable in charset")]
    UnsupportedCharacter(char),
    #[error("Text too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
    #[error("Corrupted data")]
    CorruptedData,
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Charset tag stored with every text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// 7-bit ASCII, bit-packed
    Ascii7,
    /// 8-bit ASCII (Latin-1)
    Ascii8,
    /// UTF-8
    Unicode,
}

impl Charset {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ascii7 => 0,
            Self::Ascii8 => 1,
            Self::Unicode => 2,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ascii7),
            1 => Some(Self::Ascii8),
            2 => Some(Self::Unicode),
            _ => None,
        }
    }

    /// Narrowest charset able to hold `text`
    #[must_use]
    pub fn narrowest_for(text: &str) -> Self {
        if text.chars().all(|c| c != '\0' && c.is_ascii()) {
            Self::Ascii7
        } else if text.chars().all(|c| u32::from(c) <= 0xFF) {
            Self::Ascii8
        } else {
            Self::Unicode
        }
    }
}

// ============================================================
// 7-BIT PACKING
// ============================================================

/// Pack bytes into 7 bits each, least significant bit first, with a zero
/// septet appended as terminator
#[must_use]
pub fn pack_7bit(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(((bytes.len() + 1) * 7).div_ceil(8));
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in bytes.iter().chain(std::iter::once(&0)) {
        acc |= u32::from(b & 0x7F) << bits;
        bits += 7;
        while bits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push((acc & 0xFF) as u8);
    }
    out
}

/// Reverse of `pack_7bit`: stops at the first zero septet
#[must_use]
pub fn unpack_7bit(packed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed.len() * 8 / 7);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &b in packed {
        acc |= u32::from(b) << bits;
        bits += 8;
        while bits >= 7 {
            let septet = (acc & 0x7F) as u8;
            acc >>= 7;
            bits -= 7;
            if septet == 0 {
                return out;
            }
            out.push(septet);
        }
    }
    out
}

// ============================================================
// CHARSETS
// ============================================================

fn latin1_bytes(text: &str) -> Result<Vec<u8>, TextError> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| TextError::UnsupportedCharacter(c)))
        .collect()
}

fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode `text` in `charset` (no compression)
pub fn encode_charset(text: &str, charset: Charset) -> Result<Vec<u8>, TextError> {
    match charset {
        Charset::Ascii7 => {
            if let Some(c) = text.chars().find(|&c| c == '\0' || !c.is_ascii()) {
                return Err(TextError::UnsupportedCharacter(c));
            }
            Ok(pack_7bit(text.as_bytes()))
        }
        Charset::Ascii8 => latin1_bytes(text),
        Charset::Unicode => Ok(text.as_bytes().to_vec()),
    }
}

pub fn decode_charset(bytes: &[u8], charset: Charset) -> Result<String, TextError> {
    match charset {
        Charset::Ascii7 => Ok(latin1_string(&unpack_7bit(bytes))),
        Charset::Ascii8 => Ok(latin1_string(bytes)),
        Charset::Unicode => String::from_utf8(bytes.to_vec()).map_err(|_| TextError::CorruptedData),
    }
}

// ============================================================
// FIXED-WIDTH FIELDS
// ============================================================

/// Encode `text` in `charset` into exactly `width` bytes.
///
/// Longer text is truncated to `width` (UTF-8 on a character boundary).
/// Shorter text is followed by one zero terminator and random filler. The
/// 7-bit form carries its terminator as a packed zero septet.
pub fn to_fixed_ascii(text: &str, width: usize, charset: Charset) -> Result<Vec<u8>, TextError> {
    let encoded = encode_charset(text, charset)?;
    if encoded.len() >= width {
        let end = match charset {
            Charset::Unicode => (0..=width)
                .rev()
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(0),
            Charset::Ascii7 | Charset::Ascii8 => width,
        };
        let mut out = vec![0u8; width];
        out[..end].copy_from_slice(&encoded[..end]);
        if end < width {
            fill_random(&mut out[end + 1..]);
        }
        return Ok(out);
    }

    let mut out = vec![0u8; width];
    out[..encoded.len()].copy_from_slice(&encoded);
    let filler_start = match charset {
        Charset::Ascii7 => encoded.len(),
        Charset::Ascii8 | Charset::Unicode => encoded.len() + 1,
    };
    fill_random(&mut out[filler_start..]);
    Ok(out)
}

/// Decode a `charset` field of `len` bytes starting at `offset`, up to the
/// terminator
pub fn from_fixed_ascii(
    bytes: &[u8],
    offset: usize,
    len: usize,
    charset: Charset,
) -> Result<String, TextError> {
    let field = offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(EncodingError::OutOfRange {
            offset,
            len,
            available: bytes.len(),
        })?;
    match charset {
        Charset::Ascii7 => decode_charset(field, charset),
        Charset::Ascii8 | Charset::Unicode => {
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            decode_charset(&field[..end], charset)
        }
    }
}

// ============================================================
// COMPRESSED TEXT
// ============================================================

/// Encoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedText {
    charset: Charset,
    compressed: bool,
    bytes: Vec<u8>,
}

impl CompressedText {
    /// Encode `text` with an explicit charset and compression choice
    pub fn encode(text: &str, charset: Charset, compressed: bool) -> Result<Self, TextError> {
        let raw = encode_charset(text, charset)?;
        if raw.len() > MAX_DECODED_LENGTH {
            return Err(TextError::TooLarge {
                len: raw.len(),
                max: MAX_DECODED_LENGTH,
            });
        }
        let bytes = if compressed {
            zstd::encode_all(&raw[..], ZSTD_LEVEL).map_err(|_| TextError::CorruptedData)?
        } else {
            raw
        };
        Self::from_parts(charset, compressed, bytes)
    }

    /// Narrowest charset, compressed only when that saves space
    pub fn from_text(text: &str) -> Result<Self, TextError> {
        let charset = Charset::narrowest_for(text);
        let raw = encode_charset(text, charset)?;
        if raw.len() > MAX_DECODED_LENGTH {
            return Err(TextError::TooLarge {
                len: raw.len(),
                max: MAX_DECODED_LENGTH,
            });
        }
        let packed = zstd::encode_all(&raw[..], ZSTD_LEVEL).map_err(|_| TextError::CorruptedData)?;
        if packed.len() < raw.len() {
            Self::from_parts(charset, true, packed)
        } else {
            Self::from_parts(charset, false, raw)
        }
    }

    /// Empty body
    #[must_use]
    pub fn empty() -> Self {
        Self {
            charset: Charset::Ascii8,
            compressed: false,
            bytes: Vec::new(),
        }
    }

    /// Wrap already-encoded bytes
    pub fn from_parts(charset: Charset, compressed: bool, bytes: Vec<u8>) -> Result<Self, TextError> {
        if bytes.len() > MAX_LENGTH {
            return Err(TextError::TooLarge {
                len: bytes.len(),
                max: MAX_LENGTH,
            });
        }
        Ok(Self {
            charset,
            compressed,
            bytes,
        })
    }

    pub fn decode(&self) -> Result<String, TextError> {
        if self.compressed {
            let raw = zstd::bulk::decompress(&self.bytes, MAX_DECODED_LENGTH)
                .map_err(|_| TextError::CorruptedData)?;
            decode_charset(&raw, self.charset)
        } else {
            decode_charset(&self.bytes, self.charset)
        }
    }

    #[must_use]
    pub fn charset(&self) -> Charset {
        self.charset
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Serialized size: charset(1) + compressed(1) + length(4) + bytes
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        6 + self.bytes.len()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.charset.to_u8());
        out.push(u8::from(self.compressed));
        // bounded by MAX_LENGTH
        out.extend_from_slice(&(self.bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.bytes);
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, TextError> {
        let charset = Charset::from_u8(r.u8()?).ok_or(TextError::CorruptedData)?;
        let compressed = match r.u8()? {
            0 => false,
            1 => true,
            _ => return Err(TextError::CorruptedData),
        };
        let len = r.u32()? as usize;
        if len > MAX_LENGTH {
            return Err(TextError::CorruptedData);
        }
        let bytes = r.bytes(len)?.to_vec();
        Self::from_parts(charset, compressed, bytes)
    }
}
