//! In-memory relay used by the integration tests.
//!
//! The relay auto-acks `guest:authenticate` and `room:join`, records every
//! client envelope, and lets a test push server frames into (or sever) the
//! live connection.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::mpsc;

use concord_sync::checkpoint::{DocumentCheckpoint, ListCheckpoint, PresenceCheckpoint};
use concord_sync::envelope::{ClientMessage, DocFwdBody, PresenceFwdBody, ServerMessage};
use concord_sync::session::{BootstrapSource, Session, SessionError, SessionProvider};
use concord_sync::transport::{Connector, Transport, TransportError};
use concord_sync::{ConnectionConfig, RoomClient, RoomOptions};

pub const ROOM: &str = "room-1";
pub const DOC: &str = "doc-1";
pub const ME: &str = "me";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Versionstamp whose commit version is `n`.
pub fn stamp(n: u8) -> String {
    let mut bytes = [0u8; 10];
    bytes[8] = n;
    STANDARD.encode(bytes)
}

pub fn session(actor: &str) -> Session {
    Session {
        token: format!("token-{actor}"),
        actor: actor.to_string(),
        room_id: ROOM.to_string(),
        doc_id: DOC.to_string(),
    }
}

/// Checkpoint holding an empty `todo` list and an empty `settings` map.
pub fn document() -> DocumentCheckpoint {
    let mut doc = DocumentCheckpoint::empty(DOC);
    doc.lists.insert("todo".to_string(), ListCheckpoint::default());
    doc.maps.insert("settings".to_string(), HashMap::new());
    doc
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn doc_fwd(from: &str, vs: Option<String>, parts: &[&str]) -> ServerMessage {
    ServerMessage::DocFwd(DocFwdBody {
        from: from.to_string(),
        room: ROOM.to_string(),
        args: args(parts),
        vs,
        ack: false,
    })
}

pub fn presence_fwd(from: &str, key: &str, value: &str, exp_at: u64) -> ServerMessage {
    ServerMessage::PresenceFwd(PresenceFwdBody {
        from: from.to_string(),
        room: ROOM.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        exp_at,
    })
}

enum Frame {
    Text(String),
    Close,
}

struct RelayState {
    connects: usize,
    failures_left: usize,
    sessions: VecDeque<Session>,
    default_session: Session,
    document: DocumentCheckpoint,
    presence: PresenceCheckpoint,
    /// Frames delivered just before the join ack of every connection.
    after_join: Vec<ServerMessage>,
    received: Vec<ClientMessage>,
    live: Option<mpsc::UnboundedSender<Frame>>,
    /// Bumped on every connect and sever; stale transports fail to send.
    generation: usize,
}

#[derive(Clone)]
pub struct MockRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                connects: 0,
                failures_left: 0,
                sessions: VecDeque::new(),
                default_session: session(ME),
                document: document(),
                presence: PresenceCheckpoint::new(),
                after_join: Vec::new(),
                received: Vec::new(),
                live: None,
                generation: 0,
            })),
        }
    }

    pub fn options(&self) -> RoomOptions {
        let mut options = RoomOptions::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        );
        options.connection = ConnectionConfig {
            auth_timeout: Duration::from_millis(500),
            presence_flush_interval: Duration::from_millis(5),
            backoff_step: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(100),
            ..ConnectionConfig::default()
        };
        options
    }

    pub async fn join(&self) -> RoomClient {
        tokio::time::timeout(Duration::from_secs(5), RoomClient::connect(self.options()))
            .await
            .expect("bootstrap timed out")
            .expect("connect failed")
    }

    pub fn set_document(&self, document: DocumentCheckpoint) {
        self.state.lock().unwrap().document = document;
    }

    pub fn set_presence(&self, presence: PresenceCheckpoint) {
        self.state.lock().unwrap().presence = presence;
    }

    pub fn push_session(&self, session: Session) {
        self.state.lock().unwrap().sessions.push_back(session);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().unwrap().failures_left = n;
    }

    pub fn after_join(&self, msg: ServerMessage) {
        self.state.lock().unwrap().after_join.push(msg);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Push a frame to the live connection.
    pub fn forward(&self, msg: ServerMessage) {
        let frame = msg.encode().expect("encode");
        let state = self.state.lock().unwrap();
        if let Some(live) = &state.live {
            let _ = live.send(Frame::Text(frame));
        }
    }

    /// Close the live connection from the relay side.
    pub fn sever(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        if let Some(live) = state.live.take() {
            let _ = live.send(Frame::Close);
        }
    }

    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.lock().unwrap().received.clone()
    }

    /// Argument tuples of every `doc:cmd` received, in arrival order.
    pub fn doc_commands(&self) -> Vec<Vec<String>> {
        self.received()
            .into_iter()
            .filter_map(|msg| match msg {
                ClientMessage::DocCmd(body) => Some(body.args),
                _ => None,
            })
            .collect()
    }
}

struct MockTransport {
    relay: Arc<Mutex<RelayState>>,
    generation: usize,
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let (msg, _) =
            ClientMessage::decode(&frame).map_err(|e| TransportError::Other(e.to_string()))?;
        let mut state = self.relay.lock().unwrap();
        if state.generation != self.generation {
            return Err(TransportError::Closed);
        }
        state.received.push(msg.clone());
        let replies: Vec<ServerMessage> = match msg {
            ClientMessage::Authenticate(token) => vec![ServerMessage::Authenticated(token)],
            // Traffic racing ahead of the ack, as a busy relay may deliver it.
            ClientMessage::Join(room) => {
                let mut replies = state.after_join.clone();
                replies.push(ServerMessage::Joined(room));
                replies
            }
            _ => Vec::new(),
        };
        for reply in replies {
            let frame = reply
                .encode()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            let _ = self.tx.send(Frame::Text(frame));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.rx.recv().await? {
            Frame::Text(text) => Some(Ok(text)),
            Frame::Close => None,
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl Connector for MockRelay {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TransportError::Other("connection refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.live = Some(tx.clone());
        state.generation += 1;
        Ok(Box::new(MockTransport {
            relay: self.state.clone(),
            generation: state.generation,
            tx,
            rx,
        }))
    }
}

#[async_trait]
impl SessionProvider for MockRelay {
    async fn fetch_session(&self) -> Result<Session, SessionError> {
        let mut state = self.state.lock().unwrap();
        let next = state.sessions.pop_front();
        if let Some(session) = &next {
            state.default_session = session.clone();
        }
        Ok(next.unwrap_or_else(|| state.default_session.clone()))
    }
}

#[async_trait]
impl BootstrapSource for MockRelay {
    async fn fetch_document(&self, _session: &Session) -> Result<DocumentCheckpoint, SessionError> {
        Ok(self.state.lock().unwrap().document.clone())
    }

    async fn fetch_presence(&self, _session: &Session) -> Result<PresenceCheckpoint, SessionError> {
        Ok(self.state.lock().unwrap().presence.clone())
    }
}

/// Poll `cond` while letting the room apply inbound events.
pub async fn settle<F>(room: &RoomClient, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        room.process_pending().expect("room is not being driven elsewhere");
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
