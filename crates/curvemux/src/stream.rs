//! TCP transport behind the frontend and backend endpoints.
//!
//! Every accepted connection is given a routing identity. Inbound messages
//! reach the relay as `[identity (more), frames...]`; outbound messages must
//! start with an identity frame, which is stripped before the remainder is
//! written to the matching connection.

use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use curvemux_common::wire::WireCodec;
use curvemux_common::{Identity, Multipart};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

/// Handle held in the routing table, used to send messages to a connection.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Channel sender for delivering messages to this connection's task.
    pub tx: mpsc::Sender<Multipart>,
    /// Remote address of the connection.
    pub peer_addr: SocketAddr,
    /// Instant when this connection was accepted (guards stale removals).
    pub connected_at: Instant,
}

/// Concurrent identity → connection routing table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<Identity, ConnHandle>,
}

impl RouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection handle, returning any previous handle for the same
    /// identity.
    pub fn insert(&self, identity: Identity, handle: ConnHandle) -> Option<ConnHandle> {
        self.routes.insert(identity, handle)
    }

    /// Remove the entry only if it was accepted at the given instant.
    pub fn remove_if(&self, identity: &Identity, connected_at: Instant) {
        self.routes
            .remove_if(identity, |_k, v| v.connected_at == connected_at);
    }

    /// Look up a connection handle by identity.
    #[must_use]
    pub fn get(&self, identity: &Identity) -> Option<ConnHandle> {
        self.routes.get(identity).map(|entry| entry.value().clone())
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Limits applied to a stream endpoint.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Largest accepted frame body.
    pub max_frame_size: usize,
    /// Capacity of the message queues between connections and the relay.
    pub capacity: usize,
}

/// Binds a TCP listener and returns the endpoint fed by its connections.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn bind(
    name: &'static str,
    addr: SocketAddr,
    options: StreamOptions,
) -> Result<Endpoint, RelayError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(endpoint = name, "listening on {}", local_addr);

    let routes = Arc::new(RouteTable::new());
    let (inbound_tx, inbound_rx) = mpsc::channel(options.capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(options.capacity);

    let acceptor = tokio::spawn(accept_loop(
        name,
        listener,
        Arc::clone(&routes),
        inbound_tx,
        options,
    ));
    let dispatcher = tokio::spawn(dispatch_loop(name, routes, outbound_rx));

    Ok(Endpoint::from_channels(
        name,
        inbound_rx,
        outbound_tx,
        Some(local_addr),
        vec![acceptor.abort_handle(), dispatcher.abort_handle()],
    ))
}

/// Accepts connections until the endpoint goes away. Connection tasks live in
/// a `JoinSet` so aborting this task tears all of them down.
async fn accept_loop(
    name: &'static str,
    listener: TcpListener,
    routes: Arc<RouteTable>,
    inbound: mpsc::Sender<Multipart>,
    options: StreamOptions,
) {
    let mut next_id: u32 = rand::thread_rng().gen();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        next_id = next_id.wrapping_add(1);
                        let identity = Identity::assigned(next_id);
                        connections.spawn(handle_connection(
                            name,
                            stream,
                            peer_addr,
                            identity,
                            Arc::clone(&routes),
                            inbound.clone(),
                            options,
                        ));
                    }
                    Err(e) => {
                        error!(endpoint = name, "failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            () = inbound.closed() => {
                if !routes.is_empty() {
                    debug!(endpoint = name, "relay gone, closing {} connections", routes.len());
                }
                break;
            }
        }
    }
}

async fn handle_connection(
    name: &'static str,
    stream: TcpStream,
    peer_addr: SocketAddr,
    identity: Identity,
    routes: Arc<RouteTable>,
    inbound: mpsc::Sender<Multipart>,
    options: StreamOptions,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(endpoint = name, "failed to set TCP_NODELAY: {}", e);
    }

    let (tx, mut deliver_rx) = mpsc::channel(options.capacity);
    let connected_at = Instant::now();
    routes.insert(
        identity.clone(),
        ConnHandle {
            tx,
            peer_addr,
            connected_at,
        },
    );
    gauges::inc_connections_active(name);
    debug!(
        endpoint = name,
        %identity,
        %peer_addr,
        open_connections = routes.len(),
        "peer connected"
    );

    let framed = Framed::new(stream, WireCodec::new(options.max_frame_size));
    let result = run_connection(framed, &identity, &inbound, &mut deliver_rx).await;

    routes.remove_if(&identity, connected_at);
    gauges::dec_connections_active(name);
    match result {
        Ok(()) => debug!(endpoint = name, %identity, "peer disconnected"),
        Err(e) => debug!(endpoint = name, %identity, "connection from {} closed: {}", peer_addr, e),
    }
}

/// Shuttles frames between one socket and the relay until either side closes.
///
/// A finished inbound message waits for queue space inside the select, so
/// deliveries to this peer keep flowing while the relay is busy. The socket is
/// not read again until that message is queued.
async fn run_connection(
    mut framed: Framed<TcpStream, WireCodec>,
    identity: &Identity,
    inbound: &mpsc::Sender<Multipart>,
    deliver_rx: &mut mpsc::Receiver<Multipart>,
) -> Result<(), RelayError> {
    let mut message: Multipart = vec![identity.to_frame()];
    let mut complete: Option<Multipart> = None;

    loop {
        tokio::select! {
            frame = framed.next(), if complete.is_none() => {
                match frame {
                    Some(Ok(frame)) => {
                        let more = frame.more;
                        message.push(frame);
                        if !more {
                            complete = Some(mem::replace(&mut message, vec![identity.to_frame()]));
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
            permit = inbound.reserve(), if complete.is_some() => {
                let Ok(permit) = permit else {
                    return Ok(());
                };
                if let Some(message) = complete.take() {
                    permit.send(message);
                }
            }
            Some(frames) = deliver_rx.recv() => {
                for frame in frames {
                    framed.feed(frame).await?;
                }
                framed.flush().await?;
            }
        }
    }
}

/// Routes messages written by the relay to the connection named by their
/// first frame.
async fn dispatch_loop(
    name: &'static str,
    routes: Arc<RouteTable>,
    mut outbound: mpsc::Receiver<Multipart>,
) {
    while let Some(mut message) = outbound.recv().await {
        if message.is_empty() {
            continue;
        }
        let route = message.remove(0);
        let Ok(identity) = Identity::new(&route.payload) else {
            debug!(endpoint = name, len = route.len(), "invalid routing frame, dropping message");
            counters::messages_dropped_total("invalid_route");
            continue;
        };
        if message.is_empty() {
            debug!(endpoint = name, %identity, "message has no body, dropping");
            counters::messages_dropped_total("empty");
            continue;
        }

        match routes.get(&identity) {
            Some(handle) => {
                if handle.tx.send(message).await.is_err() {
                    debug!(
                        endpoint = name,
                        %identity,
                        peer_addr = %handle.peer_addr,
                        "connection gone, dropping message"
                    );
                    counters::messages_dropped_total("peer_gone");
                }
            }
            None => {
                debug!(
                    endpoint = name,
                    %identity,
                    open_connections = routes.len(),
                    "no connection for identity, dropping message"
                );
                counters::messages_dropped_total("unknown_identity");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curvemux_common::types::ASSIGNED_IDENTITY_LEN;
    use curvemux_common::wire::Frame;
    use tokio::time::{timeout, Duration};

    fn make_handle() -> (ConnHandle, mpsc::Receiver<Multipart>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnHandle {
            tx,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            connected_at: Instant::now(),
        };
        (handle, rx)
    }

    fn options() -> StreamOptions {
        StreamOptions {
            max_frame_size: 1024,
            capacity: 16,
        }
    }

    async fn connect(endpoint: &Endpoint) -> Framed<TcpStream, WireCodec> {
        let addr = endpoint.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, WireCodec::new(1024))
    }

    async fn recv_message(endpoint: &mut Endpoint) -> Multipart {
        timeout(Duration::from_secs(5), async {
            let mut frames = Vec::new();
            loop {
                let frame = endpoint.recv_frame().await.unwrap();
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

    #[test]
    fn test_insert_and_get_returns_handle() {
        let routes = RouteTable::new();
        let identity = Identity::assigned(7);
        let (handle, _rx) = make_handle();

        assert!(routes.insert(identity.clone(), handle).is_none());
        assert!(routes.get(&identity).is_some());
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_remove_if_ignores_newer_connection() {
        let routes = RouteTable::new();
        let identity = Identity::assigned(7);
        let (old, _rx1) = make_handle();
        let stale = old.connected_at;
        routes.insert(identity.clone(), old);

        let (mut newer, _rx2) = make_handle();
        newer.connected_at = stale + Duration::from_millis(1);
        let newer_at = newer.connected_at;
        routes.insert(identity.clone(), newer);

        routes.remove_if(&identity, stale);
        assert!(routes.get(&identity).is_some());
        routes.remove_if(&identity, newer_at);
        assert!(routes.is_empty());
    }

    #[tokio::test]
    async fn inbound_messages_carry_the_connection_identity() {
        let mut endpoint = bind("frontend", SocketAddr::from(([127, 0, 0, 1], 0)), options())
            .await
            .unwrap();
        let mut client = connect(&endpoint).await;

        client
            .send(Frame::with_more(b"request #002".to_vec()))
            .await
            .unwrap();
        client
            .send(Frame::last(b"--- multipart ---".to_vec()))
            .await
            .unwrap();

        let message = recv_message(&mut endpoint).await;
        assert_eq!(message.len(), 3);
        assert_eq!(message[0].len(), ASSIGNED_IDENTITY_LEN);
        assert_eq!(message[0].payload[0], 0);
        assert!(message[0].more);
        assert_eq!(message[1], Frame::with_more(b"request #002".to_vec()));
        assert_eq!(message[2], Frame::last(b"--- multipart ---".to_vec()));
        endpoint.close();
    }

    #[tokio::test]
    async fn replies_are_routed_back_without_the_identity() {
        let mut endpoint = bind("backend", SocketAddr::from(([127, 0, 0, 1], 0)), options())
            .await
            .unwrap();
        let mut worker = connect(&endpoint).await;

        worker.send(Frame::last(b"hello".to_vec())).await.unwrap();
        let message = recv_message(&mut endpoint).await;
        let identity = message[0].clone();

        endpoint.send_frame(identity).await.unwrap();
        endpoint
            .send_frame(Frame::last(b"reply".to_vec()))
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(5), worker.next())
            .await
            .expect("timeout waiting for frame")
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::last(b"reply".to_vec()));
        endpoint.close();
    }

    #[tokio::test]
    async fn connections_get_distinct_identities() {
        let mut endpoint = bind("frontend", SocketAddr::from(([127, 0, 0, 1], 0)), options())
            .await
            .unwrap();
        let mut first = connect(&endpoint).await;
        let mut second = connect(&endpoint).await;

        first.send(Frame::last(b"a".to_vec())).await.unwrap();
        let a = recv_message(&mut endpoint).await;
        second.send(Frame::last(b"b".to_vec())).await.unwrap();
        let b = recv_message(&mut endpoint).await;

        assert_ne!(a[0].payload, b[0].payload);
        endpoint.close();
    }

    #[tokio::test]
    async fn replies_flow_while_inbound_queue_is_full() {
        let options = StreamOptions {
            max_frame_size: 1024,
            capacity: 1,
        };
        let mut endpoint = bind("backend", SocketAddr::from(([127, 0, 0, 1], 0)), options)
            .await
            .unwrap();
        let mut worker = connect(&endpoint).await;
        worker.send(Frame::last(b"hello".to_vec())).await.unwrap();
        let identity = recv_message(&mut endpoint).await[0].clone();

        for i in 0..8u8 {
            worker.send(Frame::last(vec![b'q', i])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(5), async {
            for i in 0..8u8 {
                endpoint.send_frame(identity.clone()).await.unwrap();
                endpoint.send_frame(Frame::last(vec![b'r', i])).await.unwrap();
            }
        })
        .await
        .expect("replies blocked behind a full inbound queue");

        for i in 0..8u8 {
            let frame = timeout(Duration::from_secs(5), worker.next())
                .await
                .expect("timeout waiting for frame")
                .unwrap()
                .unwrap();
            assert_eq!(frame.payload, vec![b'r', i]);
        }
        for i in 0..8u8 {
            let message = recv_message(&mut endpoint).await;
            assert_eq!(message[1].payload, vec![b'q', i]);
        }
        endpoint.close();
    }

    #[tokio::test]
    async fn unknown_identity_is_dropped() {
        let mut endpoint = bind("frontend", SocketAddr::from(([127, 0, 0, 1], 0)), options())
            .await
            .unwrap();
        let mut client = connect(&endpoint).await;
        client.send(Frame::last(b"ping".to_vec())).await.unwrap();
        let message = recv_message(&mut endpoint).await;

        endpoint
            .send_frame(Frame::with_more(b"nobody".to_vec()))
            .await
            .unwrap();
        endpoint
            .send_frame(Frame::last(b"lost".to_vec()))
            .await
            .unwrap();
        endpoint.send_frame(message[0].clone()).await.unwrap();
        endpoint
            .send_frame(Frame::last(b"found".to_vec()))
            .await
            .unwrap();

        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timeout waiting for frame")
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, b"found");
        endpoint.close();
    }
}
