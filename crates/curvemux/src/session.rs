//! Per-side protocol state.
//!
//! The relay keeps three independent pieces of state: what the control
//! channel last asked for, whether a client has shown up, and how far the
//! worker has got through its secured-session handshake.

use crate::error::RelayError;
use curvemux_common::greeting::{GreetingDecoder, Mechanism, Probe, ReadyProbe};
use curvemux_common::types::command;
use curvemux_common::wire::Frame;
use std::fmt;

/// Whether request/reply processing happens at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlState {
    /// Relay in both directions.
    #[default]
    Resume,
    /// Relay nothing until resumed.
    Suspend,
    /// Leave the loop. Terminal.
    Terminate,
}

impl ControlState {
    /// Applies a command. `Terminate` is never left.
    pub fn apply(&mut self, cmd: ControlCommand) {
        if *self == Self::Terminate {
            return;
        }
        *self = match cmd {
            ControlCommand::Suspend => Self::Suspend,
            ControlCommand::Resume => Self::Resume,
            ControlCommand::Terminate => Self::Terminate,
        };
    }

    /// Returns `true` while messages should be relayed.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Resume)
    }
}

/// A command received on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// `SUSPEND`
    Suspend,
    /// `RESUME`
    Resume,
    /// `TERMINATE`
    Terminate,
}

impl ControlCommand {
    /// Parses a control payload. One trailing NUL is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::MalformedControlCommand`] for anything that is
    /// not exactly one of the three tokens.
    pub fn parse(payload: &[u8]) -> Result<Self, RelayError> {
        let token = payload.strip_suffix(&[0]).unwrap_or(payload);
        match token {
            t if t == command::SUSPEND.as_bytes() => Ok(Self::Suspend),
            t if t == command::RESUME.as_bytes() => Ok(Self::Resume),
            t if t == command::TERMINATE.as_bytes() => Ok(Self::Terminate),
            other => Err(RelayError::MalformedControlCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    /// Wire token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Suspend => command::SUSPEND,
            Self::Resume => command::RESUME,
            Self::Terminate => command::TERMINATE,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a client identity has been seen on the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontendState {
    /// Nothing received from a client yet.
    #[default]
    NoClient,
    /// The client identity is known. There is no way back.
    ClientPresent,
}

impl FrontendState {
    /// Records that a client spoke. Returns `true` on the first call.
    pub fn client_arrived(&mut self) -> bool {
        let first = *self == Self::NoClient;
        *self = Self::ClientPresent;
        first
    }

    /// Returns `true` once a client has been seen.
    #[must_use]
    pub const fn has_client(self) -> bool {
        matches!(self, Self::ClientPresent)
    }
}

/// Data-free view of [`BackendState`], for logs, metrics and comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    /// No worker identity learned yet.
    WaitingWorker,
    /// Worker known; its traffic is parked until a client arrives.
    WaitingClient,
    /// Looking for the worker's greeting.
    CheckingMechanism,
    /// CURVE greeting seen; waiting for READY.
    Handshaking,
    /// Secured session established.
    Ready,
}

impl BackendPhase {
    /// Snake-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WaitingWorker => "waiting_worker",
            Self::WaitingClient => "waiting_client",
            Self::CheckingMechanism => "checking_mechanism",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
        }
    }
}

/// What observing a worker frame did to the backend state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No transition.
    Unchanged,
    /// A greeting was decoded but it does not ask for CURVE.
    NotCurve(Mechanism),
    /// A CURVE greeting was decoded.
    HandshakeStarted,
    /// READY was seen; the secured session is up.
    Ready,
}

/// Progress of the greeting check in `checking_mechanism`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismCheck {
    /// No greeting decoded yet; content frames go to the decoder.
    Decoding(GreetingDecoder),
    /// A greeting named this mechanism. Later frames are not inspected.
    Settled(Mechanism),
}

/// Worker lifecycle through its handshake.
///
/// Forwarding never waits on this machine: from `CheckingMechanism` onward
/// every worker message goes to the client, and transitions are recorded on
/// the side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BackendState {
    /// No worker identity learned yet.
    #[default]
    WaitingWorker,
    /// Worker known, no client to talk to.
    WaitingClient,
    /// Looking for the worker's greeting, or settled on a mechanism that is
    /// not CURVE.
    CheckingMechanism(MechanismCheck),
    /// CURVE handshake under way.
    Handshaking,
    /// Secured session established.
    Ready,
}

impl BackendState {
    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> BackendPhase {
        match self {
            Self::WaitingWorker => BackendPhase::WaitingWorker,
            Self::WaitingClient => BackendPhase::WaitingClient,
            Self::CheckingMechanism(_) => BackendPhase::CheckingMechanism,
            Self::Handshaking => BackendPhase::Handshaking,
            Self::Ready => BackendPhase::Ready,
        }
    }

    /// `waiting_worker -> waiting_client`.
    ///
    /// # Errors
    ///
    /// [`RelayError::IllegalTransition`] from any other phase.
    pub fn worker_registered(&mut self) -> Result<(), RelayError> {
        match self {
            Self::WaitingWorker => {
                *self = Self::WaitingClient;
                Ok(())
            }
            other => Err(RelayError::IllegalTransition {
                from: other.phase(),
                event: "worker_registered",
            }),
        }
    }

    /// `waiting_client -> checking_mechanism`.
    ///
    /// # Errors
    ///
    /// [`RelayError::IllegalTransition`] from any other phase.
    pub fn client_present(&mut self) -> Result<(), RelayError> {
        match self {
            Self::WaitingClient => {
                *self = Self::CheckingMechanism(MechanismCheck::Decoding(GreetingDecoder::new()));
                Ok(())
            }
            other => Err(RelayError::IllegalTransition {
                from: other.phase(),
                event: "client_present",
            }),
        }
    }

    /// Inspects the first content frame of a worker message.
    ///
    /// # Errors
    ///
    /// [`RelayError::IllegalTransition`] before a client is present; worker
    /// traffic is not relayed, and therefore not observed, in those phases.
    pub fn observe(&mut self, frame: &Frame, ready: &ReadyProbe) -> Result<Observation, RelayError> {
        match self {
            Self::CheckingMechanism(MechanismCheck::Decoding(decoder)) => {
                match decoder.feed(&frame.payload) {
                    Probe::Decided(greeting) if greeting.mechanism.is_curve() => {
                        *self = Self::Handshaking;
                        Ok(Observation::HandshakeStarted)
                    }
                    Probe::Decided(greeting) => {
                        *self = Self::CheckingMechanism(MechanismCheck::Settled(
                            greeting.mechanism.clone(),
                        ));
                        Ok(Observation::NotCurve(greeting.mechanism))
                    }
                    Probe::Undetermined => Ok(Observation::Unchanged),
                }
            }
            Self::CheckingMechanism(MechanismCheck::Settled(_)) => Ok(Observation::Unchanged),
            Self::Handshaking => {
                if ready.matches(&frame.payload, frame.more) {
                    *self = Self::Ready;
                    Ok(Observation::Ready)
                } else {
                    Ok(Observation::Unchanged)
                }
            }
            Self::Ready => Ok(Observation::Unchanged),
            Self::WaitingWorker | Self::WaitingClient => Err(RelayError::IllegalTransition {
                from: self.phase(),
                event: "observe",
            }),
        }
    }
}
