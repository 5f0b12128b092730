//! Room orchestrator.
//!
//! A [`RoomClient`] owns every replica of one document plus the room's
//! presence, and routes traffic between them:
//!
//! ```text
//!   ListClient / MapClient / PresenceClient           ConnectionManager task
//!        │ local write                                        │ RoomEvent
//!        ▼                                                    ▼
//!   bus.enter ─► capacity ─► apply ─► enqueue      run() / process_pending()
//!        │                                                    │ room, vs, self-echo,
//!        │                                                    │ doc filters
//!        ▼                                                    ▼
//!   PublishGuard::publish ◄──────────── apply ◄──── bus.enter
//!        │
//!        ▼
//!   subscribers (view, origin actor)
//! ```
//!
//! The room is single-threaded: handles are `!Send` and subscribers run on
//! the task that drives [`RoomClient::run`]. Only the connection task lives
//! on the runtime's worker threads.

mod handles;

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::bus::{Channel, LocalBus, ReentrancyError, Subscriber};
use crate::checkpoint::{escape, CheckpointError, DocumentCheckpoint, ListCheckpoint, PresenceCheckpoint};
use crate::command::{apply, Command, CommandError, ListStore, MapStore, Replica};
use crate::connection::{
    CapacityError, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState, RoomEvent,
};
use crate::envelope::{unix_millis, DocFwdBody, PresenceFwdBody, ServerMessage};
use crate::presence::{PresenceConfig, PresenceStore, RemotePresence};
use crate::session::{BootstrapSource, Session, SessionProvider};
use crate::transport::Connector;
use crate::versionstamp::{admits, Versionstamp};

pub use handles::{ListClient, MapClient, PresenceClient};

/// Origin reported for changes that came in through a re-bootstrap.
pub const BOOTSTRAP_ORIGIN: &str = "bootstrap";

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// Fresh snapshot: an array for lists, an object for maps and presence.
    pub view: Value,
    /// Actor whose change triggered the update.
    pub from: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Reentrancy(#[from] ReentrancyError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Room event stream ended")]
    Closed,
    #[error("Room is already being driven elsewhere")]
    AlreadyRunning,
}

impl From<CheckpointError> for RoomError {
    fn from(err: CheckpointError) -> Self {
        RoomError::Command(err.into())
    }
}

/// Collaborators and tuning for a room.
#[derive(Clone)]
pub struct RoomOptions {
    pub connector: Arc<dyn Connector>,
    pub sessions: Arc<dyn SessionProvider>,
    pub bootstrap: Arc<dyn BootstrapSource>,
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
}

impl RoomOptions {
    pub fn new(
        connector: Arc<dyn Connector>,
        sessions: Arc<dyn SessionProvider>,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Self {
        Self {
            connector,
            sessions,
            bootstrap,
            connection: ConnectionConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// A registered callback, for [`RoomClient::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    channel: Channel,
    callback: Subscriber<Update>,
}

impl Subscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

struct RoomState {
    session: Session,
    /// Latest bootstrap snapshot; seeds objects on first reference.
    checkpoint: DocumentCheckpoint,
    /// Admission floor: the newest checkpoint stamp seen.
    versionstamp: Option<Versionstamp>,
    lists: HashMap<String, ListStore>,
    maps: HashMap<String, MapStore>,
    presence: PresenceStore,
}

impl RoomState {
    fn list_mut(&mut self, id: &str) -> Result<&mut ListStore, CommandError> {
        match self.lists.entry(id.to_string()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let (store, _) =
                    ListStore::from_checkpoint(&self.checkpoint, id, &self.session.actor)?;
                Ok(slot.insert(store))
            }
        }
    }

    fn map_mut(&mut self, id: &str) -> &mut MapStore {
        let checkpoint = &self.checkpoint;
        self.maps
            .entry(id.to_string())
            .or_insert_with(|| MapStore::from_checkpoint(checkpoint, id).0)
    }

    /// Apply a forwarded command, materializing its object if needed.
    fn apply_remote(&mut self, cmd: &Command) -> Result<Value, CommandError> {
        if cmd.is_list() {
            let store = self.list_mut(cmd.object_id())?;
            apply(store, cmd)?;
            Ok(store.view())
        } else {
            let store = self.map_mut(cmd.object_id());
            apply(store, cmd)?;
            Ok(store.view())
        }
    }
}

fn parse_stamp(raw: Option<&str>) -> Option<Versionstamp> {
    let raw = raw.filter(|s| !s.is_empty())?;
    match Versionstamp::parse(raw) {
        Ok(vs) => Some(vs),
        Err(e) => {
            log::warn!("Ignoring unreadable versionstamp '{raw}': {e}");
            None
        }
    }
}

struct RoomInner {
    state: RefCell<RoomState>,
    bus: LocalBus<Update>,
    connection: ConnectionManager,
    events: Mutex<mpsc::Receiver<RoomEvent>>,
    /// Presence deadlines moved; `run` recomputes its sleep.
    timers_changed: Notify,
}

/// Handle to one joined room. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RoomClient {
    inner: Rc<RoomInner>,
}

impl RoomClient {
    /// Start the connection and wait for the first bootstrap.
    ///
    /// Connection failures are retried with backoff, so this only returns
    /// once the room is joined (or the link shuts down for good).
    pub async fn connect(options: RoomOptions) -> Result<Self, RoomError> {
        let (connection, mut events) = ConnectionManager::new(
            options.connection,
            options.connector,
            options.sessions,
            options.bootstrap,
        );
        connection.start();

        let (session, document, presence) = loop {
            match events.recv().await {
                Some(RoomEvent::Bootstrapped {
                    session,
                    document,
                    presence,
                }) => break (session, document, presence),
                Some(other) => log::debug!("Ignoring {other:?} before first bootstrap"),
                None => return Err(RoomError::Closed),
            }
        };

        let now = unix_millis();
        let mut presence_store =
            PresenceStore::new(session.room_id.clone(), session.actor.clone(), options.presence);
        presence_store.merge_snapshot(&presence, now);

        let state = RoomState {
            versionstamp: parse_stamp(document.vs.as_deref()),
            checkpoint: document,
            session,
            lists: HashMap::new(),
            maps: HashMap::new(),
            presence: presence_store,
        };
        Ok(Self {
            inner: Rc::new(RoomInner {
                state: RefCell::new(state),
                bus: LocalBus::new(),
                connection,
                events: Mutex::new(events),
                timers_changed: Notify::new(),
            }),
        })
    }

    // ─────────────────────────── accessors ───────────────────────────

    /// Current actor id. May change after a reconnect.
    pub fn actor(&self) -> String {
        self.inner.state.borrow().session.actor.clone()
    }

    pub fn room_id(&self) -> String {
        self.inner.state.borrow().session.room_id.clone()
    }

    pub fn doc_id(&self) -> String {
        self.inner.state.borrow().session.doc_id.clone()
    }

    /// Versionstamp of the newest bootstrap checkpoint applied so far.
    pub fn versionstamp(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .versionstamp
            .as_ref()
            .map(|vs| vs.as_str().to_string())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Document commands waiting for the link.
    pub fn queued_commands(&self) -> usize {
        self.inner.connection.queued_commands()
    }

    // ─────────────────────────── objects ───────────────────────────

    /// Handle to list `name`, creating it if the document lacks it.
    pub fn list(&self, name: &str) -> Result<ListClient, RoomError> {
        let mut state = self.inner.state.borrow_mut();
        if !state.lists.contains_key(name) {
            let (store, known) =
                ListStore::from_checkpoint(&state.checkpoint, name, &state.session.actor)?;
            if !known {
                let create = Command::ListCreate {
                    doc: state.session.doc_id.clone(),
                    list: name.to_string(),
                };
                self.inner.connection.enqueue_command(create.to_args())?;
                state
                    .checkpoint
                    .lists
                    .insert(name.to_string(), ListCheckpoint::default());
            }
            state.lists.insert(name.to_string(), store);
        }
        Ok(ListClient::new(self.clone(), name))
    }

    /// Handle to map `name`, creating it if the document lacks it.
    pub fn map(&self, name: &str) -> Result<MapClient, RoomError> {
        let mut state = self.inner.state.borrow_mut();
        if !state.maps.contains_key(name) {
            let (store, known) = MapStore::from_checkpoint(&state.checkpoint, name);
            if !known {
                let create = Command::MapCreate {
                    doc: state.session.doc_id.clone(),
                    map: name.to_string(),
                };
                self.inner.connection.enqueue_command(create.to_args())?;
                state.checkpoint.maps.insert(name.to_string(), HashMap::new());
            }
            state.maps.insert(name.to_string(), store);
        }
        Ok(MapClient::new(self.clone(), name))
    }

    /// Handle to presence key `key`.
    pub fn presence(&self, key: &str) -> PresenceClient {
        PresenceClient::new(self.clone(), key)
    }

    // ─────────────────────────── subscriptions ───────────────────────────

    pub fn subscribe<F>(&self, channel: Channel, callback: F) -> Subscription
    where
        F: Fn(&Update) + 'static,
    {
        let callback = self
            .inner
            .bus
            .subscribe(channel.clone(), Rc::new(callback));
        Subscription { channel, callback }
    }

    /// Remove exactly this subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner
            .bus
            .unsubscribe(&subscription.channel, &subscription.callback)
    }

    // ─────────────────────────── local writes ───────────────────────────

    /// Run a local list mutation producing `n` commands.
    pub(crate) fn mutate_list<F>(&self, id: &str, n: usize, mutate: F) -> Result<(), RoomError>
    where
        F: FnOnce(&mut ListStore) -> Result<Vec<Command>, CommandError>,
    {
        let guard = self.inner.bus.enter(&Channel::Object(id.to_string()))?;
        self.inner.connection.ensure_capacity(n)?;
        let (cmds, update) = {
            let mut state = self.inner.state.borrow_mut();
            let from = state.session.actor.clone();
            let store = state.list_mut(id)?;
            let cmds = mutate(store)?;
            (cmds, Update { view: store.view(), from })
        };
        self.enqueue_all(&cmds)?;
        guard.publish(&update);
        Ok(())
    }

    pub(crate) fn mutate_map<F>(&self, id: &str, mutate: F) -> Result<(), RoomError>
    where
        F: FnOnce(&mut MapStore) -> Result<Command, CommandError>,
    {
        let guard = self.inner.bus.enter(&Channel::Object(id.to_string()))?;
        self.inner.connection.ensure_capacity(1)?;
        let (cmd, update) = {
            let mut state = self.inner.state.borrow_mut();
            let from = state.session.actor.clone();
            let store = state.map_mut(id);
            let cmd = mutate(store)?;
            (cmd, Update { view: store.view(), from })
        };
        self.enqueue_all(std::slice::from_ref(&cmd))?;
        guard.publish(&update);
        Ok(())
    }

    fn enqueue_all(&self, cmds: &[Command]) -> Result<(), RoomError> {
        for cmd in cmds {
            self.inner.connection.enqueue_command(cmd.to_args())?;
        }
        Ok(())
    }

    pub(crate) fn set_presence(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<std::collections::BTreeMap<String, Value>, RoomError> {
        let guard = self.inner.bus.enter(&Channel::Presence(key.to_string()))?;
        let now = unix_millis();
        let (update, snapshot, sent) = {
            let mut state = self.inner.state.borrow_mut();
            let ttl = ttl.unwrap_or(state.presence.config().default_ttl);
            let sent = state.presence.set_local(key, value, ttl, now);
            let update = Update {
                view: state.presence.view(key, now),
                from: state.session.actor.clone(),
            };
            (update, state.presence.get_others(key, now), sent)
        };
        self.inner
            .connection
            .enqueue_presence(key, escape(&sent.value), sent.exp_at);
        self.inner.timers_changed.notify_one();
        guard.publish(&update);
        Ok(snapshot)
    }

    pub(crate) fn with_state<R>(&self, read: impl FnOnce(&RoomStateView<'_>) -> R) -> R {
        let state = self.inner.state.borrow();
        read(&RoomStateView { state: &*state })
    }

    // ─────────────────────────── inbound ───────────────────────────

    /// Drive the room: apply inbound traffic and fire presence expiries.
    ///
    /// Returns once the connection is gone for good. Errors from individual
    /// events are logged and do not stop the loop.
    pub async fn run(&self) -> Result<(), RoomError> {
        let mut events = self
            .inner
            .events
            .try_lock()
            .map_err(|_| RoomError::AlreadyRunning)?;
        loop {
            let deadline = self.next_expiry();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event) {
                            log::error!("Failed to apply room event: {e}");
                        }
                    }
                    None => return Ok(()),
                },
                _ = sleep_until_opt(deadline) => self.expire_presence(),
                _ = self.inner.timers_changed.notified() => {}
            }
        }
    }

    /// Apply every event already delivered, without waiting.
    ///
    /// Returns how many events were handled. Useful when the application
    /// drives the room from its own loop instead of [`RoomClient::run`].
    pub fn process_pending(&self) -> Result<usize, RoomError> {
        let mut events = self
            .inner
            .events
            .try_lock()
            .map_err(|_| RoomError::AlreadyRunning)?;
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            handled += 1;
            if let Err(e) = self.handle_event(event) {
                log::error!("Failed to apply room event: {e}");
            }
        }
        self.expire_presence();
        Ok(handled)
    }

    /// Apply one event from the connection.
    pub fn handle_event(&self, event: RoomEvent) -> Result<(), RoomError> {
        match event {
            RoomEvent::Bootstrapped {
                session,
                document,
                presence,
            } => self.reconcile(session, document, presence),
            RoomEvent::Message(msg) => self.dispatch(msg),
            RoomEvent::Disconnected => {
                log::info!("Disconnected; local writes stay queued");
                Ok(())
            }
        }
    }

    fn dispatch(&self, msg: ServerMessage) -> Result<(), RoomError> {
        match msg {
            ServerMessage::DocFwd(body) => self.dispatch_doc(body),
            ServerMessage::PresenceFwd(body) => self.dispatch_presence(body),
            ServerMessage::RemoveGuest(body) => {
                if body.room != self.room_id() {
                    return Ok(());
                }
                let now = unix_millis();
                let changed = self.inner.state.borrow_mut().presence.remove_actor(&body.guest);
                for key in changed {
                    self.publish_presence(&key, &body.guest, now)?;
                }
                Ok(())
            }
            ServerMessage::Error(body) => {
                log::error!("Relay reported an error for '{}': {}", body.request, body.message);
                Ok(())
            }
            other => {
                log::debug!("Ignoring stray '{}'", other.kind());
                Ok(())
            }
        }
    }

    fn dispatch_doc(&self, body: DocFwdBody) -> Result<(), RoomError> {
        let (room_id, doc_id, actor) = {
            let state = self.inner.state.borrow();
            (
                state.session.room_id.clone(),
                state.session.doc_id.clone(),
                state.session.actor.clone(),
            )
        };
        if body.room != room_id {
            log::debug!("Dropping command for room '{}'", body.room);
            return Ok(());
        }
        let cmd = match Command::parse(&body.args) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("Dropping command {:?}: {e}", body.args);
                return Ok(());
            }
        };

        // Compared against the checkpoint only. Reordered commands newer than
        // the checkpoint are all admitted; the replicas absorb duplicates.
        let incoming = parse_stamp(body.vs.as_deref());
        if !admits(
            self.inner.state.borrow().versionstamp.as_ref(),
            incoming.as_ref(),
        ) {
            log::debug!("Dropping stale command {:?} (vs {:?})", body.args, body.vs);
            return Ok(());
        }

        if body.from == actor {
            log::debug!("Dropping own echo {:?}", body.args);
            return Ok(());
        }
        if cmd.doc_id() != doc_id {
            log::warn!("Dropping command for document '{}'", cmd.doc_id());
            return Ok(());
        }

        let guard = self
            .inner
            .bus
            .enter(&Channel::Object(cmd.object_id().to_string()))?;
        let view = self.inner.state.borrow_mut().apply_remote(&cmd)?;
        guard.publish(&Update {
            view,
            from: body.from,
        });
        Ok(())
    }

    fn dispatch_presence(&self, body: PresenceFwdBody) -> Result<(), RoomError> {
        let now = unix_millis();
        let update = RemotePresence {
            from: body.from,
            room: body.room,
            key: body.key,
            value: body.value,
            exp_at: body.exp_at,
        };
        let applied = self
            .inner
            .state
            .borrow_mut()
            .presence
            .apply_remote(&update, now);
        if applied {
            self.inner.timers_changed.notify_one();
            self.publish_presence(&update.key, &update.from, now)?;
        }
        Ok(())
    }

    fn publish_presence(&self, key: &str, from: &str, now: u64) -> Result<(), RoomError> {
        let view = self.inner.state.borrow().presence.view(key, now);
        self.inner.bus.publish(
            &Channel::Presence(key.to_string()),
            &Update {
                view,
                from: from.to_string(),
            },
        )?;
        Ok(())
    }

    /// Absorb a fresh bootstrap after a reconnect.
    ///
    /// Only fills in what the local replica lacks: optimistic local writes
    /// survive, and a new actor id is pushed into every live object.
    fn reconcile(
        &self,
        session: Session,
        document: DocumentCheckpoint,
        presence: PresenceCheckpoint,
    ) -> Result<(), RoomError> {
        let now = unix_millis();
        let mut changed = Vec::new();
        let changed_keys;
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;

            if session.actor != state.session.actor {
                log::info!(
                    "Actor rotated from '{}' to '{}'",
                    state.session.actor,
                    session.actor
                );
                for list in state.lists.values_mut() {
                    list.set_actor(&session.actor);
                }
                state.presence.set_actor(&session.actor);
            }

            let incoming = parse_stamp(document.vs.as_deref());
            if incoming > state.versionstamp {
                state.versionstamp = incoming;
            }

            for (id, list) in state.lists.iter_mut() {
                let before = list.view();
                if let Err(e) = list.merge_checkpoint(&document) {
                    log::error!("Could not reconcile list '{id}': {e}");
                    continue;
                }
                let after = list.view();
                if after != before {
                    changed.push((id.clone(), after));
                }
            }
            for (id, map) in state.maps.iter_mut() {
                let before = map.view();
                map.merge_checkpoint(&document);
                let after = map.view();
                if after != before {
                    changed.push((id.clone(), after));
                }
            }
            changed_keys = state.presence.merge_snapshot(&presence, now);

            // Keep objects created locally but not yet acknowledged.
            let mut checkpoint = document;
            for id in state.lists.keys() {
                checkpoint.lists.entry(id.clone()).or_default();
            }
            for id in state.maps.keys() {
                checkpoint.maps.entry(id.clone()).or_default();
            }
            state.checkpoint = checkpoint;
            state.session = session;
        }
        log::info!(
            "Reconciled bootstrap: {} objects and {} presence keys changed",
            changed.len(),
            changed_keys.len()
        );
        self.inner.timers_changed.notify_one();

        changed.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, view) in changed {
            self.inner.bus.publish(
                &Channel::Object(id),
                &Update {
                    view,
                    from: BOOTSTRAP_ORIGIN.to_string(),
                },
            )?;
        }
        for key in changed_keys {
            self.publish_presence(&key, BOOTSTRAP_ORIGIN, now)?;
        }
        Ok(())
    }

    // ─────────────────────────── timers ───────────────────────────

    fn next_expiry(&self) -> Option<Instant> {
        let deadline = self.inner.state.borrow().presence.next_deadline()?;
        let wait = deadline.saturating_sub(unix_millis());
        Some(Instant::now() + Duration::from_millis(wait))
    }

    fn expire_presence(&self) {
        let now = unix_millis();
        let expired = self.inner.state.borrow_mut().presence.expire_due(now);
        for (key, actor) in expired {
            if let Err(e) = self.publish_presence(&key, &actor, now) {
                log::error!("Could not publish presence expiry: {e}");
            }
        }
    }

    /// Stop the connection and close its transport.
    pub async fn close(&self) {
        self.inner.connection.close().await;
    }
}

/// Read-only access to room state for handles.
pub(crate) struct RoomStateView<'a> {
    state: &'a RoomState,
}

impl RoomStateView<'_> {
    pub(crate) fn list(&self, id: &str) -> Option<&ListStore> {
        self.state.lists.get(id)
    }

    pub(crate) fn map(&self, id: &str) -> Option<&MapStore> {
        self.state.maps.get(id)
    }

    pub(crate) fn presence(&self) -> &PresenceStore {
        &self.state.presence
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
