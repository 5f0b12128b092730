//! Reconnecting relay link.
//!
//! One background task owns the transport and walks this cycle forever:
//!
//! ```text
//! Disconnected ──► Connecting ─────────────────────────────────► Connected
//!      ▲           session → connect → guest:authenticate ⇄ ack      │
//!      │           → room:join ⇄ ack → fetch checkpoint + presence   │
//!      │           → RoomEvent::Bootstrapped → early messages        │
//!      │                                                             │
//!      └──── backoff (min(2d + 100ms, 60s), 50–100% jitter) ◄── error/close
//! ```
//!
//! The room talks to it in two directions only:
//! - outbound, synchronously, through [`ConnectionManager::enqueue_command`]
//!   and [`ConnectionManager::enqueue_presence`];
//! - inbound, through the [`RoomEvent`] channel handed out by
//!   [`ConnectionManager::new`].

pub mod backoff;
pub mod queue;

use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::checkpoint::{DocumentCheckpoint, PresenceCheckpoint};
use crate::envelope::{
    ClientMessage, DocCmdBody, EnvelopeError, PresenceCmdBody, ServerMessage, Timestamper,
};
use crate::session::{BootstrapSource, Session, SessionError, SessionProvider};
use crate::transport::{Connector, Transport, TransportError};

pub use backoff::Backoff;
pub use queue::{CapacityError, OutboundQueue, PendingPresence, PresenceOutbox};

/// Link tuning knobs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long each handshake step may wait for its ack.
    pub auth_timeout: Duration,
    /// Hard cap on buffered document commands.
    pub max_queued_commands: usize,
    /// Minimum spacing between presence batches.
    pub presence_flush_interval: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
    /// Buffer of the inbound event channel.
    pub event_capacity: usize,
    /// How long an abandoned task gets to close its transport before it is
    /// aborted.
    pub shutdown_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(2),
            max_queued_commands: 10_000,
            presence_flush_interval: Duration::from_millis(40),
            backoff_step: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            event_capacity: 256,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the link reports to the room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Handshake done and snapshot fetched. Always precedes the messages of
    /// the same connection.
    Bootstrapped {
        session: Session,
        document: DocumentCheckpoint,
        presence: PresenceCheckpoint,
    },
    Message(ServerMessage),
    /// A bootstrapped connection was lost.
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Authentication failed: no '{0}' within the handshake timeout")]
    Auth(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("Room event receiver dropped")]
    Closed,
}

/// Everything pending on the way out.
struct Outbound {
    commands: OutboundQueue,
    presence: PresenceOutbox,
    stamper: Timestamper,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    sessions: Arc<dyn SessionProvider>,
    bootstrap: Arc<dyn BootstrapSource>,
    events: mpsc::Sender<RoomEvent>,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Outbound>,
    wake: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `cancel` flips to `true` or its sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

struct Worker {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the connection task and the outbound buffers.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        sessions: Arc<dyn SessionProvider>,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let outbound = Outbound {
            commands: OutboundQueue::new(config.max_queued_commands),
            presence: PresenceOutbox::new(config.presence_flush_interval),
            stamper: Timestamper::new(),
        };
        let inner = Arc::new(Inner {
            config,
            connector,
            sessions,
            bootstrap,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            outbound: Mutex::new(outbound),
            wake: Notify::new(),
        });
        let manager = Self {
            inner,
            worker: Mutex::new(None),
        };
        (manager, events_rx)
    }

    /// Start (or restart) the connection loop.
    ///
    /// A previous attempt is told to close its transport and is aborted if it
    /// does not finish within the shutdown grace period.
    pub fn start(&self) {
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(Inner::run(self.inner.clone(), cancel_rx));
        let previous = lock(&self.worker).replace(Worker { cancel, handle });
        if let Some(old) = previous {
            tokio::spawn(retire(old, self.inner.config.shutdown_grace));
        }
    }

    /// Stop the connection loop and close the transport.
    pub async fn close(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            retire(worker, self.inner.config.shutdown_grace).await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Fail unless `n` more document commands fit in the queue.
    pub fn ensure_capacity(&self, n: usize) -> Result<(), CapacityError> {
        lock(&self.inner.outbound).commands.ensure_capacity(n)
    }

    /// Buffer a document command for sending.
    pub fn enqueue_command(&self, args: Vec<String>) -> Result<(), CapacityError> {
        lock(&self.inner.outbound).commands.enqueue(args)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Buffer a presence write. Replaces any unsent write for the same key.
    pub fn enqueue_presence(&self, key: &str, value: String, exp_at: u64) {
        lock(&self.inner.outbound)
            .presence
            .push(key, PendingPresence { value, exp_at });
        self.inner.wake.notify_one();
    }

    pub fn queued_commands(&self) -> usize {
        lock(&self.inner.outbound).commands.len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            let _ = worker.cancel.send(true);
            worker.handle.abort();
        }
    }
}

async fn read_until(
    transport: &mut dyn Transport,
    early: &mut Vec<ServerMessage>,
    is_ack: fn(&ServerMessage) -> bool,
) -> Result<(), ConnectionError> {
    loop {
        let text = match transport.recv().await {
            Some(frame) => frame?,
            None => return Err(TransportError::Closed.into()),
        };
        match ServerMessage::decode(&text) {
            Ok(msg) if is_ack(&msg) => return Ok(()),
            Ok(msg) => early.push(msg),
            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
        }
    }
}

/// Cancel a worker, giving it `grace` to close its transport.
async fn retire(worker: Worker, grace: Duration) {
    let Worker { cancel, mut handle } = worker;
    let _ = cancel.send(true);
    if timeout(grace, &mut handle).await.is_err() {
        log::warn!("Connection task did not stop in {grace:?}, aborting");
        handle.abort();
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn emit(&self, event: RoomEvent) -> Result<(), ConnectionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    fn encode(&self, msg: &ClientMessage) -> Result<String, ConnectionError> {
        let ts = lock(&self.outbound).stamper.stamp();
        Ok(msg.encode(&ts)?)
    }

    async fn send(&self, transport: &mut dyn Transport, msg: &ClientMessage) -> Result<(), ConnectionError> {
        let frame = self.encode(msg)?;
        transport.send(frame).await?;
        Ok(())
    }

    /// The reconnect loop. Returns only when cancelled.
    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_step, self.config.max_backoff);
        loop {
            self.set_state(ConnectionState::Connecting);
            let mut live: Option<Box<dyn Transport>> = None;
            let outcome = tokio::select! {
                _ = cancelled(&mut cancel) => None,
                result = self.session(&mut live, &mut backoff) => Some(result),
            };

            if let Some(mut transport) = live.take() {
                transport.close().await;
            }
            let was_connected = self.state() == ConnectionState::Connected;
            self.set_state(ConnectionState::Disconnected);

            match outcome {
                None => return,
                Some(Err(ConnectionError::Closed)) => {
                    log::info!("Room dropped, stopping connection loop");
                    return;
                }
                Some(Err(e)) if was_connected => log::warn!("Connection lost: {e}"),
                Some(Err(e)) => log::warn!("Connection attempt failed: {e}"),
                Some(Ok(())) => log::info!("Relay closed the connection"),
            }
            if was_connected {
                tokio::select! {
                    _ = cancelled(&mut cancel) => return,
                    sent = self.emit(RoomEvent::Disconnected) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            log::debug!("Reconnecting in {delay:?}");
            tokio::select! {
                _ = cancelled(&mut cancel) => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// One connection from session fetch to close.
    async fn session(
        &self,
        live: &mut Option<Box<dyn Transport>>,
        backoff: &mut Backoff,
    ) -> Result<(), ConnectionError> {
        let session = self.sessions.fetch_session().await?;
        let transport = live.insert(self.connector.connect().await?).as_mut();

        let mut early = Vec::new();
        self.send(transport, &ClientMessage::Authenticate(session.token.clone()))
            .await?;
        self.await_reply(transport, "guest:authenticated", &mut early, |m| {
            matches!(m, ServerMessage::Authenticated(_))
        })
        .await?;

        self.send(transport, &ClientMessage::Join(session.room_id.clone()))
            .await?;
        self.await_reply(transport, "room:joined", &mut early, |m| {
            matches!(m, ServerMessage::Joined(_))
        })
        .await?;

        let document = self.bootstrap.fetch_document(&session).await?;
        let presence = self.bootstrap.fetch_presence(&session).await?;
        let room_id = session.room_id.clone();
        log::info!(
            "Joined room '{}' as '{}' (doc '{}')",
            session.room_id,
            session.actor,
            session.doc_id
        );
        self.emit(RoomEvent::Bootstrapped {
            session,
            document,
            presence,
        })
        .await?;
        for msg in early {
            self.emit(RoomEvent::Message(msg)).await?;
        }

        self.set_state(ConnectionState::Connected);
        backoff.reset();

        let queued = lock(&self.outbound).commands.len();
        if queued > 0 {
            log::info!("Replaying {queued} queued commands");
        }
        self.pump(transport, &room_id).await
    }

    /// Wait for a handshake ack, stashing anything else that arrives first.
    async fn await_reply(
        &self,
        transport: &mut dyn Transport,
        stage: &'static str,
        early: &mut Vec<ServerMessage>,
        is_ack: fn(&ServerMessage) -> bool,
    ) -> Result<(), ConnectionError> {
        timeout(self.config.auth_timeout, read_until(transport, early, is_ack))
            .await
            .map_err(|_| ConnectionError::Auth(stage))?
    }

    /// Connected phase: drain outbound buffers, forward inbound frames.
    async fn pump(&self, transport: &mut dyn Transport, room_id: &str) -> Result<(), ConnectionError> {
        loop {
            self.flush(transport, room_id).await?;
            let presence_at = lock(&self.outbound).presence.next_flush_at();

            tokio::select! {
                frame = transport.recv() => {
                    let text = match frame {
                        Some(frame) => frame?,
                        None => return Ok(()),
                    };
                    match ServerMessage::decode(&text) {
                        Ok(msg) => self.emit(RoomEvent::Message(msg)).await?,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    }
                }
                _ = self.wake.notified() => {}
                _ = sleep_until_opt(presence_at) => {}
            }
        }
    }

    /// Send every queued command in order, then any presence batch that is
    /// due. Commands leave the queue only after a successful send.
    async fn flush(&self, transport: &mut dyn Transport, room_id: &str) -> Result<(), ConnectionError> {
        loop {
            let next = lock(&self.outbound).commands.front().cloned();
            let Some(args) = next else {
                break;
            };
            let msg = ClientMessage::DocCmd(DocCmdBody {
                room: room_id.to_string(),
                args,
            });
            self.send(transport, &msg).await?;
            lock(&self.outbound).commands.pop_front();
        }

        let batch = lock(&self.outbound).presence.take_due(Instant::now());
        for (key, update) in batch {
            let msg = ClientMessage::PresenceCmd(PresenceCmdBody {
                room: room_id.to_string(),
                key,
                value: update.value,
                exp_at: update.exp_at,
            });
            self.send(transport, &msg).await?;
        }
        Ok(())
    }
}
