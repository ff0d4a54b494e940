use crate::error::RelayError;
use curvemux_common::Identity;
use std::fmt;

/// Which side of the relay an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Peer on the frontend endpoint.
    Client,
    /// Peer on the backend endpoint.
    Worker,
}

impl Side {
    /// Lower-case label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful [`IdentityRegistry::learn_or_verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// The slot was empty and now holds the identity.
    Learned,
    /// The identity equals the one already pinned.
    Match,
}

/// Pins exactly one client identity and one worker identity.
///
/// A slot is written once and never cleared.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    client: Option<Identity>,
    worker: Option<Identity>,
}

impl IdentityRegistry {
    /// Registry with both slots empty.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` in the slot for `side` if it is empty, otherwise checks
    /// that they equal the pinned identity.
    ///
    /// # Errors
    ///
    /// [`RelayError::IdentityMismatch`] if the slot holds a different
    /// identity, [`RelayError::InvalidIdentity`] if `bytes` cannot be an
    /// identity at all.
    pub fn learn_or_verify(&mut self, side: Side, bytes: &[u8]) -> Result<Learned, RelayError> {
        let slot = match side {
            Side::Client => &mut self.client,
            Side::Worker => &mut self.worker,
        };
        if let Some(pinned) = slot.as_ref() {
            return if pinned.as_bytes() == bytes {
                Ok(Learned::Match)
            } else {
                Err(RelayError::IdentityMismatch { side })
            };
        }
        let identity =
            Identity::new(bytes).map_err(|_| RelayError::InvalidIdentity { len: bytes.len() })?;
        *slot = Some(identity);
        Ok(Learned::Learned)
    }

    /// Pinned identity for `side`, if any.
    #[must_use]
    pub fn get(&self, side: Side) -> Option<&Identity> {
        match side {
            Side::Client => self.client.as_ref(),
            Side::Worker => self.worker.as_ref(),
        }
    }

    /// Pinned identity for `side`, or [`RelayError::NoRoute`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoRoute`] if nothing was learned for `side`.
    pub fn route_to(&self, side: Side) -> Result<&Identity, RelayError> {
        self.get(side).ok_or(RelayError::NoRoute { side })
    }
}
