//! Common types and utilities shared by the curvemux relay and its peers.
//!
//! This crate provides:
//! - Multipart frame encoding and decoding for stream transports ([`wire`])
//! - Handshake greeting and READY detection ([`greeting`])
//! - Peer identities and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod greeting;
pub mod types;
pub mod wire;

pub use greeting::{Greeting, GreetingDecoder, Mechanism, Probe, ReadyProbe};
pub use types::{Identity, IdentityError, Multipart};
pub use wire::{Frame, FrameError, WireCodec};
