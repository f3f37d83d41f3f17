//! TCP pub/sub sockets.
//!
//! A publisher socket binds a listener and accepts one connection per
//! subscription. A subscriber socket opens one connection per local listener
//! (redialing until closed), announces the listener's topic, then forwards
//! every envelope it receives to that listener.
//!
//! Every hop is bounded and awaited: a full listener stops its connection
//! reading, TCP then holds back the publisher's per-peer queue, and a full
//! peer queue makes [`PubSocket::reserve`] wait. Nothing is dropped for being
//! slow.
//!
//! Wire format: the subscriber sends one frame carrying its topic. Each
//! envelope after that is two length-delimited frames, topic then payload.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoint;
use crate::error::BusError;

/// Envelopes buffered per connected peer on the publisher side.
const PEER_QUEUE_DEPTH: usize = 64;

/// Envelopes buffered per local listener on the subscriber side.
const LISTENER_QUEUE_DEPTH: usize = 64;

/// Delay between dial attempts.
const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: Bytes,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(topic: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topic.as_ref() == topic.as_bytes()
    }
}

async fn write_envelope<W>(
    framed: &mut FramedWrite<W, LengthDelimitedCodec>,
    envelope: Envelope,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    framed.feed(envelope.topic).await?;
    framed.send(envelope.payload).await
}

async fn read_envelope<S>(framed: &mut S) -> io::Result<Option<Envelope>>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let Some(topic) = framed.next().await.transpose()? else {
        return Ok(None);
    };
    let Some(payload) = framed.next().await.transpose()? else {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "envelope truncated after topic frame",
        ));
    };
    Ok(Some(Envelope {
        topic: topic.freeze(),
        payload: payload.freeze(),
    }))
}

// ── Publisher side ──────────────────────────────────────────────────

#[derive(Debug)]
struct Peer {
    id: u64,
    topic: Bytes,
    tx: mpsc::Sender<Envelope>,
}

#[derive(Debug, Default)]
struct PeerTable {
    next_id: u64,
    peers: Vec<Peer>,
}

type SharedPeers = Arc<Mutex<PeerTable>>;

fn peer_table(peers: &Mutex<PeerTable>) -> MutexGuard<'_, PeerTable> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forget_peer(peers: &Mutex<PeerTable>, id: u64) {
    peer_table(peers).peers.retain(|p| p.id != id);
}

/// Room reserved in the queue of every peer subscribed to one topic.
#[derive(Debug)]
pub struct Reservation {
    permits: Vec<mpsc::OwnedPermit<Envelope>>,
}

impl Reservation {
    /// Number of peers the envelope will be queued for.
    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }

    /// Queue the envelope for every reserved peer. Never waits.
    pub fn send(self, envelope: Envelope) -> usize {
        let delivered = self.permits.len();
        for permit in self.permits {
            permit.send(envelope.clone());
        }
        delivered
    }
}

/// Bound publisher socket.
#[derive(Debug)]
pub struct PubSocket {
    local_addr: SocketAddr,
    peers: SharedPeers,
    shutdown: CancellationToken,
}

impl PubSocket {
    /// Bind the endpoint and start accepting subscribers. Must be called from
    /// within a tokio runtime.
    pub fn bind(endpoint: &str) -> Result<Self, BusError> {
        let bind_err = |source: io::Error| BusError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let addr = endpoint::bind_address(endpoint)?;
        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = std_listener.local_addr().map_err(bind_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;

        let peers = SharedPeers::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(listener, Arc::clone(&peers), shutdown.clone()));

        info!(endpoint = %endpoint, local = %local_addr, "Publisher socket bound");
        Ok(Self {
            local_addr,
            peers,
            shutdown,
        })
    }

    /// Wait until every peer subscribed to `topic` can take one more
    /// envelope. Peers that disconnect meanwhile are skipped.
    pub async fn reserve(&self, topic: &[u8]) -> Reservation {
        let targets: Vec<(u64, mpsc::Sender<Envelope>)> = peer_table(&self.peers)
            .peers
            .iter()
            .filter(|p| p.topic.as_ref() == topic)
            .map(|p| (p.id, p.tx.clone()))
            .collect();

        let mut permits = Vec::with_capacity(targets.len());
        for (id, tx) in targets {
            match tx.reserve_owned().await {
                Ok(permit) => permits.push(permit),
                Err(_) => forget_peer(&self.peers, id),
            }
        }
        Reservation { permits }
    }

    /// Queue an envelope for every peer subscribed to its topic, waiting for
    /// room. Returns how many peers will receive it; with none it is dropped.
    pub async fn send(&self, envelope: Envelope) -> usize {
        let topic = envelope.topic.clone();
        self.reserve(&topic).await.send(envelope)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint string of the actual bound address (resolves port 0).
    pub fn local_endpoint(&self) -> String {
        endpoint::from_socket_addr(self.local_addr)
    }

    /// Subscriptions currently connected, across all topics.
    pub fn peer_count(&self) -> usize {
        peer_table(&self.peers).peers.len()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, peers: SharedPeers, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tokio::spawn(serve_peer(stream, peer, Arc::clone(&peers), shutdown.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(RECONNECT_INTERVAL).await;
            }
        }
    }
    debug!("Publisher accept loop stopped");
}

async fn serve_peer(stream: TcpStream, peer: SocketAddr, peers: SharedPeers, shutdown: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());

    let topic = tokio::select! {
        _ = shutdown.cancelled() => return,
        first = reader.next() => match first {
            Some(Ok(topic)) => topic.freeze(),
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "Subscription handshake failed");
                return;
            }
            None => return,
        },
    };

    // Registered only after the handshake, so anything published once
    // `peer_count()` includes this peer reaches it.
    let (tx, mut rx) = mpsc::channel(PEER_QUEUE_DEPTH);
    let id = {
        let mut table = peer_table(&peers);
        table.next_id += 1;
        let id = table.next_id;
        table.peers.push(Peer {
            id,
            topic: topic.clone(),
            tx,
        });
        id
    };
    debug!(peer = %peer, topic = %String::from_utf8_lossy(&topic), "Subscriber connected");

    let mut writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            // Nothing follows the handshake; EOF or error means the peer went away.
            read = reader.next() => match read {
                None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            },
            queued = rx.recv() => {
                let Some(envelope) = queued else { break };
                let written = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    written = write_envelope(&mut writer, envelope) => written,
                };
                if let Err(e) = written {
                    debug!(peer = %peer, error = %e, "Write to subscriber failed");
                    break;
                }
            }
        }
    }

    forget_peer(&peers, id);
    debug!(peer = %peer, "Subscriber disconnected");
}

// ── Subscriber side ─────────────────────────────────────────────────

/// Dialing subscriber socket.
#[derive(Debug)]
pub struct SubSocket {
    addr: String,
    connected: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl SubSocket {
    /// Prepare to dial the endpoint. Only the endpoint syntax is checked here;
    /// connections are opened by [`SubSocket::listen`].
    pub fn connect(endpoint: &str) -> Result<Self, BusError> {
        let addr = endpoint::dial_address(endpoint)?;
        debug!(endpoint = %endpoint, "Subscriber socket ready");
        Ok(Self {
            addr,
            connected: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Open a connection subscribed to `topic` and return its envelopes in
    /// arrival order. The connection is redialed until the socket is closed or
    /// the receiver dropped. Must be called from within a tokio runtime.
    pub fn listen(&self, topic: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        tokio::spawn(read_loop(
            self.addr.clone(),
            Bytes::copy_from_slice(topic.as_bytes()),
            tx,
            Arc::clone(&self.connected),
            self.shutdown.clone(),
        ));
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) > 0
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Why a forwarding connection ended.
enum LinkEnd {
    /// Socket closed or listener gone; stop for good.
    Closed,
    /// Connection lost; redial.
    Lost,
}

async fn read_loop(
    addr: String,
    topic: Bytes,
    tx: mpsc::Sender<Envelope>,
    connected: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let dialed = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tx.closed() => return,
            dialed = TcpStream::connect(&addr) => dialed,
        };

        match dialed {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                match framed.send(topic.clone()).await {
                    Ok(()) => {
                        connected.fetch_add(1, Ordering::AcqRel);
                        debug!(addr = %addr, "Connected to publisher");
                        let end = forward(&mut framed, &tx, &shutdown, &addr).await;
                        connected.fetch_sub(1, Ordering::AcqRel);
                        if let LinkEnd::Closed = end {
                            return;
                        }
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "Subscription handshake failed"),
                }
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Dial failed, retrying");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tx.closed() => return,
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
        }
    }
}

async fn forward(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    tx: &mpsc::Sender<Envelope>,
    shutdown: &CancellationToken,
    addr: &str,
) -> LinkEnd {
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return LinkEnd::Closed,
            _ = tx.closed() => return LinkEnd::Closed,
            read = read_envelope(framed) => read,
        };
        match read {
            Ok(Some(envelope)) => {
                // The socket is not read while the listener is full.
                let sent = tokio::select! {
                    _ = shutdown.cancelled() => return LinkEnd::Closed,
                    sent = tx.send(envelope) => sent,
                };
                if sent.is_err() {
                    return LinkEnd::Closed;
                }
            }
            Ok(None) => {
                debug!(addr = %addr, "Publisher closed the connection");
                return LinkEnd::Lost;
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "Read from publisher failed");
                return LinkEnd::Lost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn envelope_reaches_subscriber() {
        let publisher = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        let subscriber = SubSocket::connect(&publisher.local_endpoint()).unwrap();
        let mut rx = subscriber.listen("t");

        wait_for(|| publisher.peer_count() == 1).await;
        assert!(subscriber.is_connected());
        assert_eq!(publisher.send(Envelope::new("t", "hello")).await, 1);

        let got = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(got.has_topic("t"));
        assert_eq!(got.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn other_topics_are_not_queued_for_a_peer() {
        let publisher = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        let subscriber = SubSocket::connect(&publisher.local_endpoint()).unwrap();
        let mut rx = subscriber.listen("wanted");
        wait_for(|| publisher.peer_count() == 1).await;

        assert_eq!(publisher.send(Envelope::new("other", "skip")).await, 0);
        assert_eq!(publisher.send(Envelope::new("wanted", "keep")).await, 1);

        let got = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload.as_ref(), b"keep");
    }

    #[tokio::test]
    async fn send_without_peers_drops() {
        let publisher = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        assert_eq!(publisher.send(Envelope::new("t", "lost")).await, 0);
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let first = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        let err = PubSocket::bind(&first.local_endpoint()).unwrap_err();
        assert!(matches!(err, BusError::Bind { .. }));
    }

    #[tokio::test]
    async fn peer_count_drops_when_subscriber_closes() {
        let publisher = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        let subscriber = SubSocket::connect(&publisher.local_endpoint()).unwrap();
        let _rx = subscriber.listen("t");
        wait_for(|| publisher.peer_count() == 1).await;

        subscriber.close();
        wait_for(|| publisher.peer_count() == 0).await;
    }

    #[tokio::test]
    async fn dropping_the_listener_disconnects_its_peer() {
        let publisher = PubSocket::bind("tcp://127.0.0.1:0").unwrap();
        let subscriber = SubSocket::connect(&publisher.local_endpoint()).unwrap();
        let rx = subscriber.listen("t");
        wait_for(|| publisher.peer_count() == 1).await;

        drop(rx);
        wait_for(|| publisher.peer_count() == 0).await;
        assert!(!subscriber.is_connected());
    }

    #[tokio::test]
    async fn full_listener_holds_back_the_publisher() {
        let publisher = Arc::new(PubSocket::bind("tcp://127.0.0.1:0").unwrap());
        let subscriber = SubSocket::connect(&publisher.local_endpoint()).unwrap();
        let mut rx = subscriber.listen("t");
        wait_for(|| publisher.peer_count() == 1).await;

        // Nobody reads `rx` yet, so the sender must eventually stall.
        const N: usize = 20_000;
        let sender = {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move {
                let payload = Bytes::from(vec![b'x'; 1024]);
                for i in 0..N {
                    let envelope = Envelope::new("t", payload.clone());
                    assert_eq!(publisher.send(envelope).await, 1, "envelope {i} lost");
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sender.is_finished());

        for _ in 0..N {
            tokio::time::timeout(TEST_TIMEOUT, rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        tokio::time::timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap();
    }
}
