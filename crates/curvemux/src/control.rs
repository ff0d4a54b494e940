//! Control channel: a broadcast bus every party subscribes to, and an optional
//! TCP bridge that publishes commands from outside the process.

use crate::error::RelayError;
use crate::session::ControlCommand;
use curvemux_common::wire::WireCodec;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Default number of commands a slow subscriber may fall behind by.
pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Publishing side of the control channel. Every subscriber sees every
/// command.
#[derive(Clone, Debug)]
pub struct ControlBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl ControlBus {
    /// Bus that buffers up to `capacity` commands per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes a raw payload; returns how many subscribers will see it.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> usize {
        self.tx.send(payload.into()).unwrap_or(0)
    }

    /// Publishes a well-formed command.
    pub fn publish_command(&self, cmd: ControlCommand) -> usize {
        self.publish(cmd.as_str())
    }

    /// New subscriber that sees commands published from now on.
    #[must_use]
    pub fn subscribe(&self) -> ControlSocket {
        ControlSocket {
            rx: self.tx.subscribe(),
            pending: None,
        }
    }
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// Receiving side of the control channel.
#[derive(Debug)]
pub struct ControlSocket {
    rx: broadcast::Receiver<Vec<u8>>,
    pending: Option<Vec<u8>>,
}

impl ControlSocket {
    /// Waits until a command can be read. Cancel-safe.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportClosed`] once every publisher is gone.
    pub async fn readable(&mut self) -> Result<(), RelayError> {
        while self.pending.is_none() {
            match self.rx.recv().await {
                Ok(payload) => self.pending = Some(payload),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "control subscriber lagged, commands lost");
                }
                Err(RecvError::Closed) => {
                    return Err(RelayError::TransportClosed {
                        endpoint: "control",
                    })
                }
            }
        }
        Ok(())
    }

    /// Returns `true` if a command can be read without waiting.
    pub fn poll_readable(&mut self) -> bool {
        while self.pending.is_none() {
            match self.rx.try_recv() {
                Ok(payload) => self.pending = Some(payload),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "control subscriber lagged, commands lost");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return false,
            }
        }
        true
    }

    /// Reads the next command payload.
    ///
    /// # Errors
    ///
    /// [`RelayError::TransportClosed`] once every publisher is gone.
    pub async fn recv(&mut self) -> Result<Vec<u8>, RelayError> {
        self.readable().await?;
        self.pending.take().ok_or(RelayError::TransportClosed {
            endpoint: "control",
        })
    }

    /// Unsubscribes from the bus.
    pub fn close(self) {
        debug!(unread = self.pending.is_some(), "control socket closed");
    }
}

/// Accepts control connections on `listener` and publishes every single-frame
/// message they send. Runs until aborted.
pub async fn serve_bridge(listener: TcpListener, bus: ControlBus, max_frame_size: usize) {
    match listener.local_addr() {
        Ok(addr) => info!("control bridge listening on {}", addr),
        Err(e) => debug!("control bridge address unavailable: {}", e),
    }
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "control peer connected");
                        connections.spawn(handle_bridge_connection(stream, bus.clone(), max_frame_size));
                    }
                    Err(e) => {
                        error!("failed to accept control connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_bridge_connection(stream: TcpStream, bus: ControlBus, max_frame_size: usize) {
    let mut framed = Framed::new(stream, WireCodec::new(max_frame_size));
    let mut multipart = false;

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("control connection closed: {}", e);
                return;
            }
        };
        if multipart || frame.more {
            if !frame.more {
                warn!("multipart control message rejected");
            }
            multipart = frame.more;
            continue;
        }
        let receivers = bus.publish(frame.payload);
        debug!(receivers, "control message published");
    }
}
