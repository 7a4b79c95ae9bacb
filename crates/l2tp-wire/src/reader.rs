//! Cursor-style reader over network-byte-order fields.

use crate::error::{Result, WireError};

/// Reader for deserializing big-endian protocol fields from a buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a new reader over a byte slice.
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_exact::<1>()?;
        Ok(bytes[0])
    }

    /// Reads an unsigned 16-bit integer.
    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_exact::<2>()?;
        Ok(u16::from_be_bytes(bytes))
    }

    /// Reads an unsigned 32-bit integer.
    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_exact::<4>()?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Reads an unsigned 64-bit integer.
    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_exact::<8>()?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Takes the next `len` bytes as a slice.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: self.offset + len,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Returns the remaining unread bytes without consuming them.
    #[inline]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Number of bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Current read position.
    #[inline]
    pub fn position(&self) -> usize {
        self.offset
    }

    fn read_exact<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(WireError::Truncated {
                needed: self.offset + N,
                have: self.data.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(out)
    }
}
