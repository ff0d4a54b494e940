//! Multipart frame encoding for stream transports.
//!
//! Every frame on a connection is a flags byte, a size, and the body:
//!
//! ```text
//! short: [flags][size: u8][body]
//! long:  [flags | LONG][size: u64 BE][body]
//! ```
//!
//! `MORE` in the flags marks a frame that is followed by another frame of the
//! same logical message. No other flag bits are defined.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Another frame of the same message follows.
pub const FLAG_MORE: u8 = 0x01;
/// Size field is eight bytes instead of one.
pub const FLAG_LONG: u8 = 0x02;

const KNOWN_FLAGS: u8 = FLAG_MORE | FLAG_LONG;

/// Header length of a frame with a one-byte size.
pub const SHORT_HEADER_LEN: usize = 2;
/// Header length of a frame with an eight-byte size.
pub const LONG_HEADER_LEN: usize = 9;
/// Largest body that still fits the short encoding.
pub const MAX_SHORT_BODY: usize = u8::MAX as usize;

/// Default upper bound on a single frame body (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20;

/// One frame of a multipart message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame body, passed through the relay unmodified.
    pub payload: Vec<u8>,
    /// Whether another frame of the same message follows.
    pub more: bool,
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Flags byte carries bits this protocol does not define.
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),
    /// Frame body exceeds the configured maximum.
    #[error("frame too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum allowed body size.
        max: usize,
        /// Size declared by the header or carried by the frame.
        actual: u64,
    },
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Frame {
    /// Creates a frame with an explicit more-flag.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>, more: bool) -> Self {
        Self {
            payload: payload.into(),
            more,
        }
    }

    /// Creates a frame that is followed by another frame.
    #[must_use]
    pub fn with_more(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload, true)
    }

    /// Creates the final frame of a message.
    #[must_use]
    pub fn last(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(payload, false)
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Size of this frame on the wire, header included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let header = if self.payload.len() > MAX_SHORT_BODY {
            LONG_HEADER_LEN
        } else {
            SHORT_HEADER_LEN
        };
        header + self.payload.len()
    }

    /// Serializes the frame into a fresh buffer.
    ///
    /// # Examples
    ///
    /// ```
    /// use curvemux_common::wire::{Frame, FLAG_MORE};
    /// let bytes = Frame::with_more(b"hi".to_vec()).serialize();
    /// assert_eq!(bytes, vec![FLAG_MORE, 2, b'h', b'i']);
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.to_vec()
    }

    fn write_to(&self, dst: &mut BytesMut) {
        let mut flags = if self.more { FLAG_MORE } else { 0 };
        dst.reserve(self.encoded_len());
        if self.payload.len() > MAX_SHORT_BODY {
            flags |= FLAG_LONG;
            dst.put_u8(flags);
            dst.put_u64(self.payload.len() as u64);
        } else {
            dst.put_u8(flags);
            // Checked against MAX_SHORT_BODY above.
            dst.put_u8(self.payload.len() as u8);
        }
        dst.put_slice(&self.payload);
    }
}

/// `tokio_util` codec for [`Frame`]s with a bounded body size.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    max_frame_size: usize,
}

impl WireCodec {
    /// Codec accepting bodies up to `max_frame_size` bytes.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Configured body size limit.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(&flags) = src.first() else {
            return Ok(None);
        };
        if flags & !KNOWN_FLAGS != 0 {
            return Err(FrameError::ReservedFlags(flags));
        }

        let (header_len, declared) = if flags & FLAG_LONG != 0 {
            if src.len() < LONG_HEADER_LEN {
                src.reserve(LONG_HEADER_LEN - src.len());
                return Ok(None);
            }
            let mut size = [0u8; 8];
            size.copy_from_slice(&src[1..LONG_HEADER_LEN]);
            (LONG_HEADER_LEN, u64::from_be_bytes(size))
        } else {
            if src.len() < SHORT_HEADER_LEN {
                return Ok(None);
            }
            (SHORT_HEADER_LEN, u64::from(src[1]))
        };

        let size = usize::try_from(declared)
            .ok()
            .filter(|size| *size <= self.max_frame_size)
            .ok_or(FrameError::TooLarge {
                max: self.max_frame_size,
                actual: declared,
            })?;

        let total = header_len + size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(size).to_vec();
        Ok(Some(Frame {
            payload,
            more: flags & FLAG_MORE != 0,
        }))
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                max: self.max_frame_size,
                actual: frame.payload.len() as u64,
            });
        }
        frame.write_to(dst);
        Ok(())
    }
}
