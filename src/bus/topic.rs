//! Topic channels: typed, one-directional pub/sub over a shared endpoint.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::endpoint;
use super::registry::{ConnectionRegistry, Lease, Role, Socket};
use super::socket::{Envelope, PubSocket, SubSocket};
use crate::error::BusError;

/// Bounded wait of one receive poll, so a stopped subscription exits promptly.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// A payload type carried on one topic.
pub trait BusMessage: Send + Sync + Sized + 'static {
    fn encode(&self) -> Result<Bytes, CodecError>;
    fn decode(payload: &[u8]) -> Result<Self, CodecError>;
}

impl BusMessage for String {
    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(std::str::from_utf8(payload)?.to_string())
    }
}

/// Callback invoked for every message received on a subscription.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M);
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: M) {
        (self)(message).await
    }
}

/// Publishing side of a topic.
#[derive(Debug)]
pub struct Publisher<M> {
    topic: String,
    socket: Arc<PubSocket>,
    lease: Lease,
    _message: PhantomData<fn(M)>,
}

impl<M: BusMessage> Publisher<M> {
    /// Acquire (bind) the publisher connection for `endpoint`.
    pub fn connect(
        registry: &Arc<ConnectionRegistry>,
        endpoint: &str,
        topic: impl Into<String>,
    ) -> Result<Self, BusError> {
        let lease = registry.acquire(endpoint, Role::Publisher)?;
        let Socket::Publisher(socket) = lease.socket().clone() else {
            return Err(BusError::RoleMismatch {
                endpoint: endpoint.to_string(),
            });
        };
        Ok(Self {
            topic: topic.into(),
            socket,
            lease,
            _message: PhantomData,
        })
    }

    /// Send one message, waiting while any subscriber of this topic is behind.
    /// Returns the number of peers it was queued for.
    pub async fn publish(&self, message: &M) -> Result<usize, BusError> {
        let payload = message.encode().map_err(|e| BusError::Encode {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })?;
        let envelope = Envelope::new(Bytes::copy_from_slice(self.topic.as_bytes()), payload);

        // Room is reserved before the port lock is taken; the send itself
        // never waits.
        let reservation = self.socket.reserve(self.topic.as_bytes()).await;
        let delivered = match self.lease.registry().lock_for(&self.local_endpoint()) {
            Some(lock) => {
                let _exclusive = lock.write().await;
                reservation.send(envelope)
            }
            None => reservation.send(envelope),
        };

        if delivered == 0 {
            debug!(topic = %self.topic, "No subscribers connected, message dropped");
        }
        Ok(delivered)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Endpoint the socket is actually bound to.
    pub fn local_endpoint(&self) -> String {
        self.socket.local_endpoint()
    }

    pub fn peer_count(&self) -> usize {
        self.socket.peer_count()
    }
}

/// Receiving side of a topic.
#[derive(Debug)]
pub struct Subscriber<M> {
    topic: String,
    endpoint: String,
    socket: Arc<SubSocket>,
    lease: Lease,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: BusMessage> Subscriber<M> {
    /// Acquire the subscriber socket for `endpoint`; the connection itself is
    /// opened by [`Subscriber::subscribe`]. Wildcard publisher addresses are
    /// rewritten to loopback first.
    pub fn connect(
        registry: &Arc<ConnectionRegistry>,
        endpoint: &str,
        topic: impl Into<String>,
    ) -> Result<Self, BusError> {
        let endpoint = endpoint::subscriber_endpoint(endpoint);
        let lease = registry.acquire(&endpoint, Role::Subscriber)?;
        let Socket::Subscriber(socket) = lease.socket().clone() else {
            return Err(BusError::RoleMismatch { endpoint });
        };
        Ok(Self {
            topic: topic.into(),
            endpoint,
            socket,
            lease,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
            _message: PhantomData,
        })
    }

    /// Start the receive loop. The handler is awaited inside the loop, so
    /// messages on this topic are handled one at a time in arrival order.
    pub fn subscribe<H>(&mut self, handler: H) -> Result<(), BusError>
    where
        H: MessageHandler<M>,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BusError::AlreadySubscribed {
                topic: self.topic.clone(),
            });
        }

        let ctx = ReceiveLoop {
            topic: self.topic.clone(),
            endpoint: self.endpoint.clone(),
            registry: Arc::clone(self.lease.registry()),
            running: Arc::clone(&self.running),
        };
        let rx = self.socket.listen(&self.topic);
        self.task = Some(tokio::spawn(ctx.run(rx, handler)));

        info!(topic = %self.topic, endpoint = %self.endpoint, "Subscription started");
        Ok(())
    }

    /// Clear the running flag and wait for the receive loop to exit.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(topic = %self.topic, error = %e, "Receive loop ended abnormally");
            }
            info!(topic = %self.topic, "Subscription stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the underlying socket currently has a live connection.
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl<M> Drop for Subscriber<M> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

struct ReceiveLoop {
    topic: String,
    endpoint: String,
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
}

impl ReceiveLoop {
    async fn run<M, H>(self, mut rx: mpsc::Receiver<Envelope>, handler: H)
    where
        M: BusMessage,
        H: MessageHandler<M>,
    {
        while self.running.load(Ordering::Acquire) {
            let envelope = match tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await {
                Err(_elapsed) => continue,
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
            };

            let Some(message) = self.accept(&envelope).await else {
                continue;
            };
            handler.handle(message).await;
        }
        debug!(topic = %self.topic, "Receive loop exited");
    }

    /// Topic match and decode, under the shared port lock when one exists.
    async fn accept<M: BusMessage>(&self, envelope: &Envelope) -> Option<M> {
        let lock = self.registry.lock_for(&self.endpoint);
        let _shared = match &lock {
            Some(lock) => Some(lock.read().await),
            None => None,
        };

        if !envelope.has_topic(&self.topic) {
            return None;
        }
        match M::decode(&envelope.payload) {
            Ok(message) => Some(message),
            Err(e) => {
                let err = BusError::Decode {
                    topic: self.topic.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Dropping malformed message");
                None
            }
        }
    }
}
