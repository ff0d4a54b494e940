use curvemux::control::ControlBus;
use curvemux::metrics::HealthState;
use curvemux::proxy::{Proxy, ProxyOptions};
use curvemux::stream::{self, StreamOptions};
use curvemux::RelayError;
use curvemux_common::wire::{Frame, WireCodec};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

pub const REQUEST: &[u8] = b"request #001\0";

pub fn test_options() -> StreamOptions {
    StreamOptions {
        max_frame_size: 65_536,
        capacity: 64,
    }
}

pub struct TestRelay {
    pub frontend: SocketAddr,
    pub backend: SocketAddr,
    pub bus: ControlBus,
    pub health: HealthState,
    pub handle: JoinHandle<Result<(), RelayError>>,
}

pub async fn start_relay() -> TestRelay {
    start_relay_with(test_options()).await
}

pub async fn start_relay_with(stream_options: StreamOptions) -> TestRelay {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let frontend = stream::bind("frontend", any, stream_options).await.unwrap();
    let backend = stream::bind("backend", any, stream_options).await.unwrap();
    let frontend_addr = frontend.local_addr().unwrap();
    let backend_addr = backend.local_addr().unwrap();

    let bus = ControlBus::default();
    let health = HealthState::new();
    let options = ProxyOptions {
        drain_grace: Duration::from_millis(10),
        join_timeout: Duration::from_secs(1),
        health: health.clone(),
        ..ProxyOptions::default()
    };
    let proxy = Proxy::new(frontend, backend, bus.subscribe(), options);
    let handle = tokio::spawn(proxy.run(JoinSet::new()));

    TestRelay {
        frontend: frontend_addr,
        backend: backend_addr,
        bus,
        health,
        handle,
    }
}

impl TestRelay {
    /// Waits for the relay task to finish and returns its result.
    pub async fn finished(self) -> Result<(), RelayError> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("timeout waiting for relay to stop")
            .unwrap()
    }

    pub async fn terminate(self) -> Result<(), RelayError> {
        self.bus.publish("TERMINATE");
        self.finished().await
    }
}

/// A client or worker speaking the wire codec over TCP.
pub struct TestPeer {
    framed: Framed<TcpStream, WireCodec>,
}

impl TestPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, WireCodec::new(65_536)),
        }
    }

    /// Sends one message, setting the more-flag on all parts but the last.
    pub async fn send(&mut self, parts: &[&[u8]]) {
        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.iter().enumerate() {
            self.framed
                .feed(Frame::new(part.to_vec(), i < last))
                .await
                .unwrap();
        }
        self.framed.flush().await.unwrap();
    }

    /// Receives one whole message.
    pub async fn recv(&mut self) -> Vec<Frame> {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut frames = Vec::new();
            loop {
                let frame = self.framed.next().await.unwrap().unwrap();
                let more = frame.more;
                frames.push(frame);
                if !more {
                    return frames;
                }
            }
        })
        .await
        .expect("timeout waiting for message")
    }

    /// Asserts that nothing arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.framed.next()).await;
        assert!(result.is_err(), "expected no message, got {result:?}");
    }
}
