//! # concord-sync: Client-side CRDT document sync over a relay
//!
//! Keeps a local replica of a shared document (ordered lists and key/value
//! maps) plus ephemeral per-user presence in sync with other clients through
//! a relay server that forwards string-encoded commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   handles    ┌──────────────┐   RoomEvent   ┌───────────────────┐
//! │ application  │ ───────────► │  RoomClient  │ ◄──────────── │ ConnectionManager │
//! │ (subscribers)│ ◄─────────── │ (lists, maps,│ ────────────► │  (tokio task)     │
//! └──────────────┘   LocalBus   │  presence)   │   enqueue     └─────────┬─────────┘
//!                               └──────────────┘                         │ JSON envelopes
//!                                                                        ▼
//!                                                                  relay (WebSocket)
//! ```
//!
//! Local writes apply optimistically, publish to subscribers and queue for the
//! relay. Forwarded commands pass room, versionstamp, self-echo and document
//! filters before they are applied and published.
//!
//! ## Modules
//!
//! - [`versionstamp`]: causal ordering of forwarded commands
//! - [`crdt`]: RGA list and last-writer-wins map
//! - [`checkpoint`]: bootstrap snapshot format and value escaping
//! - [`command`]: string command tuples and the replicas they apply to
//! - [`bus`]: per-object fan-out with loop protection
//! - [`presence`]: TTL'd per-actor presence
//! - [`envelope`]: JSON wire envelopes
//! - [`transport`] / [`session`]: pluggable link and credentials
//! - [`connection`]: reconnecting link with outbound queues
//! - [`room`]: the orchestrator and its handles

pub mod bus;
pub mod checkpoint;
pub mod command;
pub mod connection;
pub mod crdt;
pub mod envelope;
pub mod presence;
pub mod room;
pub mod session;
pub mod transport;
pub mod versionstamp;

// Re-exports for convenience
pub use bus::{Channel, LocalBus, PublishGuard, ReentrancyError};
pub use checkpoint::{
    CheckpointError, DocumentCheckpoint, ListCheckpoint, PresenceCheckpoint, PresenceRecord,
};
pub use command::{apply, Command, CommandError, ListStore, MapStore, Opcode, Replica};
pub use connection::{
    CapacityError, ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState,
    RoomEvent,
};
pub use crdt::{Anchor, CrdtError, ListValue, LwwMap, NodeId, Rga};
pub use envelope::{ClientMessage, EnvelopeError, ServerMessage};
pub use presence::{PresenceConfig, PresenceStore};
pub use room::{
    ListClient, MapClient, PresenceClient, RoomClient, RoomError, RoomOptions, Subscription,
    Update,
};
pub use session::{BootstrapSource, Session, SessionError, SessionProvider, StaticSession};
pub use transport::{Connector, Transport, TransportError, WebSocketConnector};
pub use versionstamp::{Versionstamp, VersionstampError};
