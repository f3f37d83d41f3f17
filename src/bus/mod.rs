//! In-process message bus.
//!
//! - `registry` owns the shared, reference-counted sockets
//! - `topic` wraps a socket as a typed publisher or subscriber for one topic
//! - `service` puts a bounded queue and a draining task in front of a publisher
//! - `socket` and `endpoint` are the TCP transport underneath

pub mod endpoint;
pub mod registry;
pub mod service;
pub mod socket;
pub mod topic;

pub use endpoint::subscriber_endpoint;
pub use registry::{ConnectionRegistry, Lease, PortLock, Role, Socket};
pub use service::{ServiceHandle, ServiceWorker};
pub use topic::{BusMessage, CodecError, MessageHandler, POLL_TIMEOUT, Publisher, Subscriber};
