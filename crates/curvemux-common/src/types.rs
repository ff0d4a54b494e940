//! Core type definitions and protocol constants for curvemux.

use std::fmt;
use thiserror::Error;

use crate::wire::Frame;

/// Longest identity a peer connection may carry.
pub const MAX_IDENTITY_LEN: usize = 32;

/// Length of identities assigned by stream endpoints: a zero byte followed
/// by a big-endian 32-bit counter.
pub const ASSIGNED_IDENTITY_LEN: usize = 5;

/// One logical message: an ordered run of frames, the last without the
/// more-flag.
pub type Multipart = Vec<Frame>;

/// Control command tokens accepted on the control channel.
pub mod command {
    /// Stop relaying in both directions until `RESUME`.
    pub const SUSPEND: &str = "SUSPEND";
    /// Resume relaying.
    pub const RESUME: &str = "RESUME";
    /// Stop the relay loop and release every endpoint.
    pub const TERMINATE: &str = "TERMINATE";
}

/// Errors building an [`Identity`] from raw bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Identity frames cannot be empty.
    #[error("identity is empty")]
    Empty,
    /// Identity longer than [`MAX_IDENTITY_LEN`].
    #[error("identity too long: max {max}, got {actual}")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Length received.
        actual: usize,
    },
}

/// Opaque name of one end of a multiplexed connection.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity(Vec<u8>);

impl Identity {
    /// Builds an identity, rejecting empty or oversized byte strings.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] when `bytes` is empty or longer than
    /// [`MAX_IDENTITY_LEN`].
    pub fn new(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.is_empty() {
            return Err(IdentityError::Empty);
        }
        if bytes.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong {
                max: MAX_IDENTITY_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Identity in the shape stream endpoints assign to new connections.
    #[must_use]
    pub fn assigned(counter: u32) -> Self {
        let mut bytes = Vec::with_capacity(ASSIGNED_IDENTITY_LEN);
        bytes.push(0x00);
        bytes.extend_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// Raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Routing frame carrying this identity, flagged as followed by content.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::with_more(self.0.clone())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identity_is_rejected() {
        assert_eq!(Identity::new(&[]), Err(IdentityError::Empty));
    }

    #[test]
    fn oversized_identity_is_rejected() {
        let bytes = [0xAAu8; MAX_IDENTITY_LEN + 1];
        assert!(matches!(
            Identity::new(&bytes),
            Err(IdentityError::TooLong { max: 32, actual: 33 })
        ));
    }

    #[test]
    fn max_length_identity_is_accepted() {
        let bytes = [0xAAu8; MAX_IDENTITY_LEN];
        assert_eq!(Identity::new(&bytes).unwrap().as_bytes(), &bytes);
    }

    #[test]
    fn assigned_identity_layout() {
        let id = Identity::assigned(0x0102_0304);
        assert_eq!(id.as_bytes(), &[0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(id.as_bytes().len(), ASSIGNED_IDENTITY_LEN);
        assert_eq!(id.to_string(), "0001020304");
    }

    #[test]
    fn identity_frame_has_more_flag() {
        let frame = Identity::assigned(7).to_frame();
        assert!(frame.more);
        assert_eq!(frame.payload, vec![0, 0, 0, 0, 7]);
    }
}
