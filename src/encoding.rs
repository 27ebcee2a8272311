//! Big-endian integer helpers with range checks.
//!
//! Every on-disk and on-wire integer is big-endian. Reads past the end of
//! the buffer fail with `EncodingError::OutOfRange` instead of panicking.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("Offset {offset} + {len} out of range for {available} bytes")]
    OutOfRange {
        offset: usize,
        len: usize,
        available: usize,
    },
}

fn slice(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], EncodingError> {
    offset
        .checked_add(len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(EncodingError::OutOfRange {
            offset,
            len,
            available: bytes.len(),
        })
}

fn slice_mut(bytes: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], EncodingError> {
    let available = bytes.len();
    match offset.checked_add(len) {
        Some(end) if end <= available => Ok(&mut bytes[offset..end]),
        _ => Err(EncodingError::OutOfRange {
            offset,
            len,
            available,
        }),
    }
}

pub fn get_u16(bytes: &[u8], offset: usize) -> Result<u16, EncodingError> {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(slice(bytes, offset, 2)?);
    Ok(u16::from_be_bytes(raw))
}

pub fn get_u32(bytes: &[u8], offset: usize) -> Result<u32, EncodingError> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(slice(bytes, offset, 4)?);
    Ok(u32::from_be_bytes(raw))
}

pub fn get_u64(bytes: &[u8], offset: usize) -> Result<u64, EncodingError> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(slice(bytes, offset, 8)?);
    Ok(u64::from_be_bytes(raw))
}

pub fn put_u16(bytes: &mut [u8], offset: usize, value: u16) -> Result<(), EncodingError> {
    slice_mut(bytes, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn put_u32(bytes: &mut [u8], offset: usize, value: u32) -> Result<(), EncodingError> {
    slice_mut(bytes, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn put_u64(bytes: &mut [u8], offset: usize, value: u64) -> Result<(), EncodingError> {
    slice_mut(bytes, offset, 8)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Sequential reader over a decoded record
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn u8(&mut self) -> Result<u8, EncodingError> {
        let value = slice(self.bytes, self.pos, 1)?[0];
        self.pos += 1;
        Ok(value)
    }

    pub fn u16(&mut self) -> Result<u16, EncodingError> {
        let value = get_u16(self.bytes, self.pos)?;
        self.pos += 2;
        Ok(value)
    }

    pub fn u32(&mut self) -> Result<u32, EncodingError> {
        let value = get_u32(self.bytes, self.pos)?;
        self.pos += 4;
        Ok(value)
    }

    pub fn u64(&mut self) -> Result<u64, EncodingError> {
        let value = get_u64(self.bytes, self.pos)?;
        self.pos += 8;
        Ok(value)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], EncodingError> {
        let value = slice(self.bytes, self.pos, len)?;
        self.pos += len;
        Ok(value)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
