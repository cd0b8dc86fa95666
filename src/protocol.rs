//! Chat frame codec.
//!
//! A frame on the wire is `HEADER || BODY`:
//! - `HEADER`: `HEADER_LEN` ASCII decimal digits, zero-padded, giving
//!   the body length in bytes
//! - `BODY`: exactly that many opaque bytes (typically UTF-8 text)
//!
//! The fixed-width header lets a reader issue exact-size reads without
//! scanning for a delimiter. The codec is a pure transformation; all
//! socket handling lives in the runtimes.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum body length a frame may carry.
pub const MAX_BODY_LEN: usize = 512;

/// Frame decoding and message construction errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Header bytes are not ASCII decimal digits.
    BadHeader,
    /// Declared or actual body length exceeds `MAX_BODY_LEN`.
    BodyTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadHeader => write!(f, "frame header is not a decimal length"),
            FrameError::BodyTooLarge(len) => {
                write!(f, "body length {len} exceeds maximum {MAX_BODY_LEN}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// An immutable chat message.
///
/// The body is shared storage, so cloning for fan-out is a reference
/// bump rather than a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Bytes,
}

impl Message {
    /// Create a message, rejecting bodies over `MAX_BODY_LEN`.
    pub fn new(body: impl Into<Bytes>) -> Result<Self, FrameError> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLarge(body.len()));
        }
        Ok(Message { body })
    }

    /// Build a message from body bytes whose length was already
    /// validated by [`decode_header`].
    pub fn from_body(body: Bytes) -> Self {
        debug_assert!(body.len() <= MAX_BODY_LEN);
        Message { body }
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Encode as a wire frame: zero-padded length header + body.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        let header = format!("{:0width$}", self.body.len(), width = HEADER_LEN);
        frame.put_slice(header.as_bytes());
        frame.put_slice(&self.body);
        frame.freeze()
    }
}

/// Parse a length header.
///
/// Every header byte must be an ASCII digit; a parsed length above
/// `MAX_BODY_LEN` is a protocol violation, not a request to truncate.
pub fn decode_header(header: &[u8]) -> Result<usize, FrameError> {
    debug_assert_eq!(header.len(), HEADER_LEN);
    let mut len = 0usize;
    for &byte in header {
        if !byte.is_ascii_digit() {
            return Err(FrameError::BadHeader);
        }
        len = len * 10 + usize::from(byte - b'0');
    }
    if len > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(len));
    }
    Ok(len)
}
