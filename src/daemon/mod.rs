//! Daemon orchestrator.
//!
//! Owns the bus for one run: three service workers publishing on the
//! configured endpoint, three subscriptions dialing it back, and the mailbox
//! poll timer. Routing decisions live in [`router`].
//!
//! Lifecycle is `Created -> Running -> Stopped`; `Stopped` is terminal.

pub mod router;
pub mod timer;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::archive::Extractor;
use crate::bus::{ConnectionRegistry, Publisher, ServiceHandle, ServiceWorker, Subscriber};
use crate::config::AgentConfig;
use crate::error::{BusError, Error};
use crate::mail::{MailDispatchRequest, Mailer};
use crate::task::Runner;

pub use router::{Outlets, PollOutcome, Router};
pub use timer::PeriodicTimer;

pub const TOPIC_MAIL_RECV: &str = "mail_recv";
pub const TOPIC_TASK_RECV: &str = "task_recv";
pub const TOPIC_MAIL_SEND: &str = "mail_send";

const SUPERVISOR_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// What the running daemon exposes to handles.
#[derive(Debug)]
struct Live {
    endpoint: String,
    mail_recv: ServiceHandle<String>,
    publisher: Arc<Publisher<String>>,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<DaemonState>,
    shutdown: CancellationToken,
    started: AtomicBool,
    live: Mutex<Option<Live>>,
}

impl Shared {
    fn set_state(&self, state: DaemonState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Daemon state changed");
        }
    }

    fn live<T>(&self, f: impl FnOnce(&Live) -> T) -> Option<T> {
        self.live.lock().ok()?.as_ref().map(f)
    }

    fn set_live(&self, live: Option<Live>) {
        if let Ok(mut slot) = self.live.lock() {
            *slot = live;
        }
    }
}

/// Cloneable control surface for a [`Daemon`] running elsewhere.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
}

impl DaemonHandle {
    /// Ask the daemon to stop. Before `start()` this moves straight to
    /// `Stopped`.
    pub fn stop(&self) {
        self.shared.shutdown.cancel();
        if self.state() == DaemonState::Created && !self.shared.started.load(Ordering::Acquire) {
            self.shared.set_state(DaemonState::Stopped);
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.shared.state.borrow()
    }

    /// Wait until the daemon leaves `Created`; returns the state it reached.
    pub async fn wait_until_running(&self) -> DaemonState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|s| *s != DaemonState::Created).await {
            Ok(state) => *state,
            Err(_) => DaemonState::Stopped,
        }
    }

    /// Endpoint the publishers actually bound, once running.
    pub fn bound_endpoint(&self) -> Option<String> {
        self.shared.live(|live| live.endpoint.clone())
    }

    /// Route a directory of downloaded mail as if a poll had produced it.
    pub async fn submit(&self, dir: impl AsRef<Path>) -> Result<(), BusError> {
        let handle = self
            .shared
            .live(|live| live.mail_recv.clone())
            .ok_or_else(|| BusError::ServiceStopped {
                topic: TOPIC_MAIL_RECV.to_string(),
            })?;
        handle
            .enqueue(dir.as_ref().to_string_lossy().into_owned())
            .await
    }

    /// Subscriptions connected to the daemon's endpoint, its own three included.
    pub fn peer_count(&self) -> usize {
        self.shared.live(|live| live.publisher.peer_count()).unwrap_or(0)
    }
}

/// The three service workers, in topic order.
struct Workers {
    mail_recv: ServiceWorker<String>,
    task_recv: ServiceWorker<String>,
    mail_send: ServiceWorker<MailDispatchRequest>,
}

impl Workers {
    fn start(registry: &Arc<ConnectionRegistry>, endpoint: &str, capacity: usize) -> Result<Self, BusError> {
        Ok(Self {
            mail_recv: ServiceWorker::start(registry, endpoint, TOPIC_MAIL_RECV, capacity)?,
            task_recv: ServiceWorker::start(registry, endpoint, TOPIC_TASK_RECV, capacity)?,
            mail_send: ServiceWorker::start(registry, endpoint, TOPIC_MAIL_SEND, capacity)?,
        })
    }

    fn outlets(&self) -> Outlets {
        Outlets {
            mail_recv: self.mail_recv.handle(),
            task_recv: self.task_recv.handle(),
            mail_send: self.mail_send.handle(),
        }
    }

    async fn stop(&mut self) {
        self.mail_recv.stop().await;
        self.task_recv.stop().await;
        self.mail_send.stop().await;
    }
}

/// The three subscriptions feeding the router.
struct Subscriptions {
    mail_recv: Subscriber<String>,
    task_recv: Subscriber<String>,
    mail_send: Subscriber<MailDispatchRequest>,
}

impl Subscriptions {
    fn start(registry: &Arc<ConnectionRegistry>, endpoint: &str, router: &Arc<Router>) -> Result<Self, BusError> {
        let mut mail_recv = Subscriber::connect(registry, endpoint, TOPIC_MAIL_RECV)?;
        let mut task_recv = Subscriber::connect(registry, endpoint, TOPIC_TASK_RECV)?;
        let mut mail_send = Subscriber::connect(registry, endpoint, TOPIC_MAIL_SEND)?;

        let r = Arc::clone(router);
        mail_recv.subscribe(move |dir: String| {
            let r = Arc::clone(&r);
            async move {
                r.on_mail_received(Path::new(&dir)).await;
            }
        })?;
        let r = Arc::clone(router);
        task_recv.subscribe(move |job: String| {
            let r = Arc::clone(&r);
            async move {
                r.on_task_received(Path::new(&job)).await;
            }
        })?;
        let r = Arc::clone(router);
        mail_send.subscribe(move |request: MailDispatchRequest| {
            let r = Arc::clone(&r);
            async move {
                r.on_mail_send(request).await;
            }
        })?;

        Ok(Self {
            mail_recv,
            task_recv,
            mail_send,
        })
    }

    async fn stop(&mut self) {
        self.mail_recv.stop().await;
        self.task_recv.stop().await;
        self.mail_send.stop().await;
    }
}

/// The mail-driven job daemon.
pub struct Daemon {
    config: Arc<AgentConfig>,
    mailer: Arc<dyn Mailer>,
    extractor: Arc<dyn Extractor>,
    runner: Runner,
    shared: Arc<Shared>,
}

impl Daemon {
    pub fn new(config: Arc<AgentConfig>, mailer: Arc<dyn Mailer>, extractor: Arc<dyn Extractor>) -> Self {
        let runner = Runner::from_config(&config.global);
        let (state, _) = watch::channel(DaemonState::Created);
        Self {
            config,
            mailer,
            extractor,
            runner,
            shared: Arc::new(Shared {
                state,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                live: Mutex::new(None),
            }),
        }
    }

    /// Replace the runner built from `global` (shell, transcript directory,
    /// command timeout).
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.shared.state.borrow()
    }

    /// Bring up the bus and run until [`DaemonHandle::stop`].
    ///
    /// A bind failure on any topic aborts startup and leaves the daemon
    /// `Stopped`. Calling this a second time is a no-op.
    pub async fn start(&self) -> Result<(), Error> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            info!(state = %self.state(), "Daemon already started, ignoring start()");
            return Ok(());
        }
        if self.shared.shutdown.is_cancelled() {
            info!("Daemon was stopped before it started");
            self.shared.set_state(DaemonState::Stopped);
            return Ok(());
        }

        let global = &self.config.global;
        let registry = ConnectionRegistry::new();

        let mut workers = match Workers::start(&registry, &global.endpoint, global.queue_capacity) {
            Ok(workers) => workers,
            Err(e) => {
                error!(endpoint = %global.endpoint, error = %e, "Failed to start service workers");
                self.shared.set_state(DaemonState::Stopped);
                return Err(e.into());
            }
        };
        let endpoint = workers.mail_recv.local_endpoint();

        let router = Arc::new(Router::new(
            Arc::clone(&self.config),
            Arc::clone(&self.mailer),
            Arc::clone(&self.extractor),
            self.runner.clone(),
            workers.outlets(),
        ));

        let mut subscriptions = match Subscriptions::start(&registry, &endpoint, &router) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to start subscriptions");
                workers.stop().await;
                self.shared.set_state(DaemonState::Stopped);
                return Err(e.into());
            }
        };

        let mut timer = PeriodicTimer::new();
        if let Some(interval) = global.poll_interval() {
            let r = Arc::clone(&router);
            timer
                .start_periodic(interval, move || {
                    let r = Arc::clone(&r);
                    async move {
                        r.poll_mailboxes().await;
                    }
                })
                .await;
            info!(interval_ms = interval.as_millis() as u64, "Mailbox polling armed");
        } else {
            info!("Mailbox polling disabled");
        }

        self.shared.set_live(Some(Live {
            endpoint: endpoint.clone(),
            mail_recv: workers.mail_recv.handle(),
            publisher: Arc::clone(workers.mail_recv.publisher()),
        }));
        self.shared.set_state(DaemonState::Running);
        info!(endpoint = %endpoint, accounts = self.config.accounts.len(), "Daemon running");

        let mut tick = tokio::time::interval(SUPERVISOR_TICK);
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    trace!(peers = workers.mail_recv.peer_count(), "Daemon alive");
                }
            }
        }

        info!("Daemon stopping");
        self.shared.set_live(None);
        timer.stop().await;
        subscriptions.stop().await;
        workers.stop().await;
        drop(subscriptions);
        drop(workers);
        debug!(connections = registry.len(), "Bus released");

        self.shared.set_state(DaemonState::Stopped);
        info!("Daemon stopped");
        Ok(())
    }
}
