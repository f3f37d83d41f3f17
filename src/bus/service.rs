//! Service workers: a bounded queue drained by one task into a publisher.
//!
//! Exactly one task drains a worker's queue, so publishes on a topic follow
//! enqueue order. Producers block while the queue is full (`enqueue`) or get
//! `BusError::QueueFull` back (`try_enqueue`).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use super::topic::{BusMessage, Publisher};
use crate::error::BusError;

/// Cloneable producer side of a [`ServiceWorker`].
#[derive(Debug)]
pub struct ServiceHandle<M> {
    topic: Arc<str>,
    tx: mpsc::Sender<M>,
}

impl<M> Clone for ServiceHandle<M> {
    fn clone(&self) -> Self {
        Self {
            topic: Arc::clone(&self.topic),
            tx: self.tx.clone(),
        }
    }
}

impl<M: BusMessage> ServiceHandle<M> {
    /// A handle plus the receiving end of its queue, with no publisher
    /// attached.
    pub fn channel(topic: &str, capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                topic: Arc::from(topic),
                tx,
            },
            rx,
        )
    }

    /// Queue a message, waiting for room when the queue is full.
    pub async fn enqueue(&self, message: M) -> Result<(), BusError> {
        self.tx.send(message).await.map_err(|_| BusError::ServiceStopped {
            topic: self.topic.to_string(),
        })
    }

    /// Queue a message without waiting.
    pub fn try_enqueue(&self, message: M) -> Result<(), BusError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BusError::QueueFull {
                topic: self.topic.to_string(),
            },
            TrySendError::Closed(_) => BusError::ServiceStopped {
                topic: self.topic.to_string(),
            },
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Queue plus draining task for one topic.
#[derive(Debug)]
pub struct ServiceWorker<M> {
    handle: ServiceHandle<M>,
    publisher: Arc<Publisher<M>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<M: BusMessage> ServiceWorker<M> {
    /// Bind the publisher for `topic` and start draining. A bind failure is
    /// returned to the caller.
    pub fn start(
        registry: &Arc<ConnectionRegistry>,
        endpoint: &str,
        topic: &str,
        capacity: usize,
    ) -> Result<Self, BusError> {
        let publisher = Arc::new(Publisher::connect(registry, endpoint, topic)?);
        let (handle, rx) = ServiceHandle::channel(topic, capacity);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(drain(Arc::clone(&publisher), rx, shutdown.clone()));
        info!(topic = %topic, endpoint = %publisher.local_endpoint(), capacity, "Service worker started");

        Ok(Self {
            handle,
            publisher,
            shutdown,
            task: Some(task),
        })
    }

    pub fn handle(&self) -> ServiceHandle<M> {
        self.handle.clone()
    }

    pub async fn enqueue(&self, message: M) -> Result<(), BusError> {
        self.handle.enqueue(message).await
    }

    pub fn try_enqueue(&self, message: M) -> Result<(), BusError> {
        self.handle.try_enqueue(message)
    }

    pub fn topic(&self) -> &str {
        self.handle.topic()
    }

    /// Endpoint the publisher is bound to.
    pub fn local_endpoint(&self) -> String {
        self.publisher.local_endpoint()
    }

    pub fn peer_count(&self) -> usize {
        self.publisher.peer_count()
    }

    pub fn publisher(&self) -> &Arc<Publisher<M>> {
        &self.publisher
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Close the queue, publish everything already accepted, then join.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(topic = %self.topic(), error = %e, "Service worker ended abnormally");
            }
            info!(topic = %self.topic(), "Service worker stopped");
        }
    }
}

impl<M> Drop for ServiceWorker<M> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drain<M: BusMessage>(
    publisher: Arc<Publisher<M>>,
    mut rx: mpsc::Receiver<M>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Some(message) => publish(&publisher, &message).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                rx.close();
                while let Some(message) = rx.recv().await {
                    publish(&publisher, &message).await;
                }
                break;
            }
        }
    }
    debug!(topic = %publisher.topic(), "Service worker drained");
}

async fn publish<M: BusMessage>(publisher: &Publisher<M>, message: &M) {
    if let Err(e) = publisher.publish(message).await {
        warn!(topic = %publisher.topic(), error = %e, "Publish failed");
    }
}
