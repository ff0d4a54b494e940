//! curvemux relay: forwards multipart messages between one client and one
//! worker while watching the worker's handshake for a secured session.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and relay configuration.
pub mod config;
pub mod control;
pub mod endpoint;
/// Error types for relay operations.
pub mod error;
pub mod metrics;
pub mod proxy;
/// Pinned client and worker identities.
pub mod registry;
pub mod relay;
pub mod session;
pub mod stream;

pub use control::{ControlBus, ControlSocket};
pub use endpoint::{Endpoint, PeerHandle};
pub use error::RelayError;
pub use proxy::{Proxy, ProxyOptions, WaitSet};
