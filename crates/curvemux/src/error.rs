use crate::registry::Side;
use crate::session::BackendPhase;
use curvemux_common::wire::FrameError;
use thiserror::Error;

/// Errors that can occur while relaying.
///
/// Everything except [`RelayError::MalformedControlCommand`] stops the relay
/// loop; the loop releases its endpoints and hands the error back.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A second peer showed up on a side whose identity is already pinned.
    #[error("{side} identity does not match the pinned identity")]
    IdentityMismatch {
        /// Side the mismatching identity arrived on.
        side: Side,
    },
    /// An identity frame was empty or longer than an identity can be.
    #[error("invalid identity frame of {len} bytes")]
    InvalidIdentity {
        /// Length of the rejected frame.
        len: usize,
    },
    /// An endpoint's inbound side went away.
    #[error("{endpoint} endpoint closed while reading")]
    TransportClosed {
        /// Endpoint name.
        endpoint: &'static str,
    },
    /// An endpoint's outbound side went away.
    #[error("{endpoint} endpoint closed while writing")]
    TransportWrite {
        /// Endpoint name.
        endpoint: &'static str,
    },
    /// The control channel carried something other than a known command.
    #[error("malformed control command: {0:?}")]
    MalformedControlCommand(String),
    /// A message had to be routed to a side whose identity is unknown.
    #[error("no {side} identity to route to")]
    NoRoute {
        /// Side lacking an identity.
        side: Side,
    },
    /// The backend state machine was asked to make a move it does not allow.
    #[error("illegal backend transition from {from:?} on {event}")]
    IllegalTransition {
        /// Phase the machine was in.
        from: BackendPhase,
        /// Event that was rejected.
        event: &'static str,
    },
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wire codec error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}
