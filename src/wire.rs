//! Fixed-width field layout shared by all descriptor kinds.
//!
//! Integer fields are written as their minimal big-endian byte representation, left-padded with
//! zeros up to the width of the field. Readers accept any value that fits in the width.

use std::{convert::TryInto, net::Ipv4Addr};
use thiserror::Error;

pub(crate) const PORT_LEN: usize = 2;
pub(crate) const IP_LEN: usize = 4;
pub(crate) const U32_LEN: usize = 4;

/// Terminates the query search criteria and every file name in a query hit.
pub(crate) const TERMINATOR: u8 = 0x00;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {field}: needed {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("unterminated {field}")]
    Unterminated { field: &'static str },
    #[error("payload of {0} bytes exceeds the maximum")]
    Oversized(u32),
    #[error("hop count {0} is reserved")]
    ReservedHop(u8),
}

/// Append `value` to `buffer` occupying exactly `width` bytes.
pub(crate) fn put_uint(buffer: &mut Vec<u8>, value: u32, width: usize) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let minimal = &bytes[skip..];

    debug_assert!(minimal.len() <= width, "{value} does not fit in {width} bytes");

    buffer.extend(std::iter::repeat(0).take(width.saturating_sub(minimal.len())));
    buffer.extend(&minimal[minimal.len().saturating_sub(width)..]);
}

/// Cursor over one frame.
pub(crate) struct Reader<'a> {
    buffer: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buffer.len() < len {
            return Err(DecodeError::Truncated {
                field,
                needed: len,
                available: self.buffer.len(),
            });
        }

        let (head, tail) = self.buffer.split_at(len);
        self.buffer = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let bytes = self.bytes(N, field)?;
        // `unwrap` is OK because `bytes` returned exactly `N` bytes.
        Ok(bytes.try_into().unwrap())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.bytes(1, field)?[0])
    }

    pub fn uint(&mut self, width: usize, field: &'static str) -> Result<u32, DecodeError> {
        let bytes = self.bytes(width, field)?;
        Ok(bytes
            .iter()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
    }

    pub fn ip(&mut self, field: &'static str) -> Result<Ipv4Addr, DecodeError> {
        Ok(Ipv4Addr::from(self.array::<IP_LEN>(field)?))
    }

    /// Read up to the next terminator, looking at no more than `max` bytes. The terminator is
    /// consumed but not returned.
    pub fn terminated(&mut self, max: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let window = &self.buffer[..max.min(self.buffer.len())];
        let len = window
            .iter()
            .position(|b| *b == TERMINATOR)
            .ok_or(DecodeError::Unterminated { field })?;

        let value = &self.buffer[..len];
        self.buffer = &self.buffer[len + 1..];
        Ok(value)
    }

    /// Everything left, with the trailing terminator (and anything after it) removed.
    pub fn rest_until_terminator(&mut self) -> &'a [u8] {
        let rest = std::mem::take(&mut self.buffer);
        match rest.iter().position(|b| *b == TERMINATOR) {
            Some(len) => &rest[..len],
            None => rest,
        }
    }
}
