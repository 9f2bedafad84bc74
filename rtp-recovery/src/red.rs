//! RFC 2198 redundant payloads
//!
//! A redundant (RED) payload bundles one primary block with zero or more
//! secondary blocks. Each secondary block is announced by a 4-byte header,
//! the primary by a final 1-byte header:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|   block PT  |  timestamp offset         |   block length    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0|   block PT  |
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Block data follows the headers in the same order, primary last.

use crate::config::PayloadTypes;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of a secondary block header
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Size of the primary block header
pub const PRIMARY_HEADER_SIZE: usize = 1;

/// Largest timestamp offset (14 bits)
pub const MAX_TIMESTAMP_OFFSET: u16 = 0x3FFF;

/// Largest secondary block length (10 bits)
pub const MAX_BLOCK_LENGTH: usize = 0x03FF;

/// RED parsing and encoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RedError {
    #[error("Truncated RED header: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("RED block of {length} bytes overruns payload ({remaining} bytes left)")]
    BlockOverrun { length: usize, remaining: usize },

    #[error("RED block too large to encode: {0} bytes")]
    BlockTooLarge(usize),

    #[error("RED timestamp offset too large to encode: {0}")]
    OffsetTooLarge(u16),
}

/// What a block carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Media codec payload
    Media,
    /// ULP FEC parity payload
    FecParity,
    /// Another RED payload
    Redundant,
}

/// A single block of a redundant payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedBlock {
    /// Classification derived from the block payload type
    pub kind: BlockKind,
    /// Block payload type (7 bits)
    pub payload_type: u8,
    /// Timestamp offset relative to the RTP header timestamp (14 bits)
    pub timestamp_offset: u16,
    /// Block data
    pub data: Bytes,
}

impl RedBlock {
    /// Create a new block
    pub fn new(kind: BlockKind, payload_type: u8, timestamp_offset: u16, data: Bytes) -> Self {
        RedBlock {
            kind,
            payload_type: payload_type & 0x7F,
            timestamp_offset,
            data,
        }
    }
}

/// Decoded RED payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundantPayload {
    /// Secondary blocks, in wire order
    pub redundant: Vec<RedBlock>,
    /// Primary block
    pub primary: RedBlock,
}

impl RedundantPayload {
    /// Parse a RED payload, classifying each block with `types`
    ///
    /// Block data is sliced out of `payload` without copying.
    pub fn parse(payload: &Bytes, types: &PayloadTypes) -> Result<Self, RedError> {
        let mut buf = &payload[..];
        let mut headers = Vec::new();

        let primary_type = loop {
            if buf.remaining() < PRIMARY_HEADER_SIZE {
                return Err(RedError::Truncated {
                    expected: payload.len() + PRIMARY_HEADER_SIZE,
                    actual: payload.len(),
                });
            }
            if buf[0] & 0x80 == 0 {
                break buf.get_u8() & 0x7F;
            }
            if buf.remaining() < BLOCK_HEADER_SIZE {
                return Err(RedError::Truncated {
                    expected: payload.len() - buf.remaining() + BLOCK_HEADER_SIZE,
                    actual: payload.len(),
                });
            }

            let word = buf.get_u32();
            let payload_type = ((word >> 24) & 0x7F) as u8;
            let timestamp_offset = ((word >> 10) & u32::from(MAX_TIMESTAMP_OFFSET)) as u16;
            let length = (word & MAX_BLOCK_LENGTH as u32) as usize;
            headers.push((payload_type, timestamp_offset, length));
        };

        let mut offset = payload.len() - buf.remaining();
        let mut redundant = Vec::with_capacity(headers.len());

        for (payload_type, timestamp_offset, length) in headers {
            let remaining = payload.len() - offset;
            if length > remaining {
                return Err(RedError::BlockOverrun { length, remaining });
            }
            redundant.push(RedBlock::new(
                types.classify(payload_type),
                payload_type,
                timestamp_offset,
                payload.slice(offset..offset + length),
            ));
            offset += length;
        }

        let primary = RedBlock::new(
            types.classify(primary_type),
            primary_type,
            0,
            payload.slice(offset..),
        );

        Ok(RedundantPayload { redundant, primary })
    }

    /// Serialize to the RFC 2198 wire layout
    pub fn to_bytes(&self) -> Result<Bytes, RedError> {
        let data_len: usize = self.redundant.iter().map(|b| b.data.len()).sum::<usize>()
            + self.primary.data.len();
        let mut buf = BytesMut::with_capacity(
            self.redundant.len() * BLOCK_HEADER_SIZE + PRIMARY_HEADER_SIZE + data_len,
        );

        for block in &self.redundant {
            if block.data.len() > MAX_BLOCK_LENGTH {
                return Err(RedError::BlockTooLarge(block.data.len()));
            }
            if block.timestamp_offset > MAX_TIMESTAMP_OFFSET {
                return Err(RedError::OffsetTooLarge(block.timestamp_offset));
            }

            let word = 0x8000_0000
                | (u32::from(block.payload_type & 0x7F) << 24)
                | (u32::from(block.timestamp_offset) << 10)
                | block.data.len() as u32;
            buf.put_u32(word);
        }
        buf.put_u8(self.primary.payload_type & 0x7F);

        for block in &self.redundant {
            buf.put_slice(&block.data);
        }
        buf.put_slice(&self.primary.data);

        Ok(buf.freeze())
    }

    /// Total number of blocks, primary included
    pub fn block_count(&self) -> usize {
        self.redundant.len() + 1
    }
}
