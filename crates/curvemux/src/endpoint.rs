//! Frame-level endpoint the relay reads from and writes to.
//!
//! An [`Endpoint`] is fed whole multipart messages by whatever transport sits
//! behind it and hands them out one frame at a time. Writing works the other
//! way round: frames are staged until one without the more-flag completes the
//! message, which is then passed to the transport in one piece. Messages from
//! different peers therefore never interleave.

use crate::error::RelayError;
use curvemux_common::wire::Frame;
use curvemux_common::Multipart;
use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// One side of the relay: frontend or backend.
#[derive(Debug)]
pub struct Endpoint {
    name: &'static str,
    inbound: mpsc::Receiver<Multipart>,
    pending: VecDeque<Frame>,
    outbound: mpsc::Sender<Multipart>,
    staged: Multipart,
    local_addr: Option<SocketAddr>,
    tasks: Vec<AbortHandle>,
}

/// The far side of an in-process endpoint.
///
/// Messages sent here appear on the endpoint; messages the endpoint writes
/// come out of [`PeerHandle::recv`].
#[derive(Debug)]
pub struct PeerHandle {
    tx: mpsc::Sender<Multipart>,
    rx: mpsc::Receiver<Multipart>,
}

impl Endpoint {
    /// Builds an endpoint over a transport's channels.
    ///
    /// `tasks` are aborted when the endpoint is closed.
    #[must_use]
    pub fn from_channels(
        name: &'static str,
        inbound: mpsc::Receiver<Multipart>,
        outbound: mpsc::Sender<Multipart>,
        local_addr: Option<SocketAddr>,
        tasks: Vec<AbortHandle>,
    ) -> Self {
        Self {
            name,
            inbound,
            pending: VecDeque::new(),
            outbound,
            staged: Vec::new(),
            local_addr,
            tasks,
        }
    }

    /// In-process endpoint paired with the handle that plays its peer.
    #[must_use]
    pub fn inproc(name: &'static str, capacity: usize) -> (Self, PeerHandle) {
        let (peer_tx, inbound) = mpsc::channel(capacity);
        let (outbound, peer_rx) = mpsc::channel(capacity);
        let endpoint = Self::from_channels(name, inbound, outbound, None, Vec::new());
        (
            endpoint,
            PeerHandle {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }

    /// Endpoint name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Address the transport is bound to, if it is a network endpoint.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Waits until at least one frame can be read.
    ///
    /// Cancel-safe: a message received here is kept for the next read.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportClosed`] once the transport is gone.
    pub async fn readable(&mut self) -> Result<(), RelayError> {
        while self.pending.is_empty() {
            let message = self
                .inbound
                .recv()
                .await
                .ok_or(RelayError::TransportClosed {
                    endpoint: self.name,
                })?;
            self.pending.extend(message);
        }
        Ok(())
    }

    /// Returns `true` if a frame can be read without waiting.
    pub fn poll_readable(&mut self) -> bool {
        while self.pending.is_empty() {
            match self.inbound.try_recv() {
                Ok(message) => self.pending.extend(message),
                Err(_) => return false,
            }
        }
        true
    }

    /// Reads the next frame.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportClosed`] once the transport is gone.
    pub async fn recv_frame(&mut self) -> Result<Frame, RelayError> {
        self.readable().await?;
        self.pending.pop_front().ok_or(RelayError::TransportClosed {
            endpoint: self.name,
        })
    }

    /// Writes one frame. The message goes out when a frame without the
    /// more-flag completes it.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportWrite`] if the transport is gone.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<(), RelayError> {
        let last = !frame.more;
        self.staged.push(frame);
        if last {
            let message = mem::take(&mut self.staged);
            self.outbound
                .send(message)
                .await
                .map_err(|_| RelayError::TransportWrite {
                    endpoint: self.name,
                })?;
        }
        Ok(())
    }

    /// Stops the transport tasks behind this endpoint.
    pub fn close(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!(
            endpoint = self.name,
            unread_frames = self.pending.len(),
            "endpoint closed"
        );
    }
}

impl PeerHandle {
    /// Sends a message of raw frames as given.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportWrite`] if the endpoint was dropped.
    pub async fn send_frames(&self, frames: Multipart) -> Result<(), RelayError> {
        self.tx
            .send(frames)
            .await
            .map_err(|_| RelayError::TransportWrite { endpoint: "peer" })
    }

    /// Sends a message, setting the more-flag on every part but the last.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportWrite`] if the endpoint was dropped.
    pub async fn send<I, P>(&self, parts: I) -> Result<(), RelayError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let mut frames: Multipart = parts.into_iter().map(Frame::with_more).collect();
        if let Some(last) = frames.last_mut() {
            last.more = false;
        }
        self.send_frames(frames).await
    }

    /// Receives the next message the endpoint wrote, or `None` once it is
    /// gone.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.rx.recv().await
    }

    /// Receives a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Multipart> {
        self.rx.try_recv().ok()
    }
}
