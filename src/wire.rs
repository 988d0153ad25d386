//! On-the-wire shape of user-channel messages.
//!
//! A flushed send buffer is a concatenation of segments. Each segment is a
//! [`SegmentHeader`] followed by one or more invocations, and every
//! invocation is a 16-bit lambda id followed by the bincode encoding of the
//! handler's arguments. Invocations for the same final destination coalesce
//! under one header; peers are assumed binary-homogeneous, so integers
//! travel in host order.

use std::io::Read;

use serde::de::DeserializeOwned;
use zerocopy::byteorder::native_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub(crate) const HEADER_LEN: usize = std::mem::size_of::<SegmentHeader>();
pub(crate) const LAMBDA_ID_LEN: usize = std::mem::size_of::<U16>();

/// Indicates a received message inconsistent with the wire format.
#[derive(thiserror::Error, Debug)]
pub enum WireError {
    /// Fewer bytes than the header, or than the header's body length, are
    /// present.
    #[error("truncated segment: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A segment header announcing no invocations at all.
    #[error("segment for rank {dest} has an empty body")]
    EmptyBody { dest: u32 },

    /// A lambda id that no registered handler answers to.
    #[error("unknown lambda id {id}")]
    UnknownLambda { id: u16 },

    /// A final destination outside the peer set.
    #[error("segment addressed to nonexistent rank {dest}")]
    BadDestination { dest: u32 },

    /// The argument decoder consumed bytes inconsistent with the body.
    #[error("argument decoding failed: {0}")]
    Decode(#[from] bincode::Error),
}

#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub(crate) struct SegmentHeader {
    pub final_dest: U32,
    pub body_len: U32,
}

impl SegmentHeader {
    pub(crate) fn new(final_dest: u32, body_len: u32) -> Self {
        Self {
            final_dest: U32::new(final_dest),
            body_len: U32::new(body_len),
        }
    }
}

/// Rewrites the body length of the segment whose header starts at
/// `segment_at`, after more invocations were coalesced onto it.
pub(crate) fn patch_body_len(bytes: &mut [u8], segment_at: usize, body_len: u32) {
    let at = segment_at + std::mem::size_of::<U32>();
    bytes[at..at + std::mem::size_of::<U32>()].copy_from_slice(U32::new(body_len).as_bytes());
}

/// One parsed segment, borrowing the received message.
pub(crate) struct Segment<'a> {
    pub final_dest: u32,
    /// Header and body together, for transit re-enqueueing.
    pub raw: &'a [u8],
    /// The invocations alone.
    pub body: &'a [u8],
}

impl<'a> Segment<'a> {
    /// Parses the segment starting at `bytes[0]`.
    pub(crate) fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        let header = SegmentHeader::ref_from_prefix(bytes).ok_or(WireError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        })?;
        let body_len = header.body_len.get() as usize;
        let total = HEADER_LEN + body_len;
        if bytes.len() < total {
            return Err(WireError::Truncated {
                expected: total,
                actual: bytes.len(),
            });
        }
        if body_len == 0 {
            return Err(WireError::EmptyBody {
                dest: header.final_dest.get(),
            });
        }
        Ok(Self {
            final_dest: header.final_dest.get(),
            raw: &bytes[..total],
            body: &bytes[HEADER_LEN..total],
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.raw.len()
    }
}

/// Cursor over a segment body from which dispatched handlers pull their
/// deserialized arguments.
pub struct ArgReader<'a> {
    cursor: std::io::Cursor<&'a [u8]>,
}

impl<'a> ArgReader<'a> {
    pub(crate) fn new(body: &'a [u8]) -> Self {
        Self {
            cursor: std::io::Cursor::new(body),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    pub(crate) fn read_lambda_id(&mut self) -> Result<u16, WireError> {
        let mut id = [0u8; LAMBDA_ID_LEN];
        self.cursor
            .read_exact(&mut id)
            .map_err(|_| WireError::Truncated {
                expected: LAMBDA_ID_LEN,
                actual: self.remaining(),
            })?;
        Ok(u16::from_ne_bytes(id))
    }

    /// Deserializes one handler's arguments, advancing past exactly the
    /// bytes they occupy.
    pub fn read_args<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        Ok(bincode::deserialize_from(&mut self.cursor)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn segment_bytes(dest: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = SegmentHeader::new(dest, body.len() as u32).as_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn parses_a_segment() {
        let bytes = segment_bytes(7, &[1, 2, 3, 4]);
        let segment = Segment::parse(&bytes).unwrap();
        assert_eq!(segment.final_dest, 7);
        assert_eq!(segment.body, &[1, 2, 3, 4]);
        assert_eq!(segment.raw, &bytes[..]);
        assert_eq!(segment.len(), bytes.len());
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            Segment::parse(&[0, 0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_body_shorter_than_announced() {
        let mut bytes = segment_bytes(1, &[9, 9]);
        bytes.truncate(HEADER_LEN + 1);
        assert!(matches!(
            Segment::parse(&bytes),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_empty_body() {
        let bytes = segment_bytes(1, &[]);
        assert!(matches!(
            Segment::parse(&bytes),
            Err(WireError::EmptyBody { dest: 1 })
        ));
    }

    #[test]
    fn arg_reader_walks_invocations() {
        let mut body = 4u16.to_ne_bytes().to_vec();
        body.extend_from_slice(&bincode::serialize(&(3u64, true)).unwrap());
        body.extend_from_slice(&9u16.to_ne_bytes());
        body.extend_from_slice(&bincode::serialize(&"hi".to_string()).unwrap());

        let mut reader = ArgReader::new(&body);
        assert_eq!(reader.read_lambda_id().unwrap(), 4);
        assert_eq!(reader.read_args::<(u64, bool)>().unwrap(), (3, true));
        assert_eq!(reader.read_lambda_id().unwrap(), 9);
        assert_eq!(reader.read_args::<String>().unwrap(), "hi");
        assert_eq!(reader.remaining(), 0);
    }
}
