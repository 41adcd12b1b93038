//! # loom-collab: Document synchronization for Loom
//!
//! Keeps one graph document consistent across the local store and every
//! peer editing it over a WebSocket channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   edits    ┌───────────────┐  Update/Join  ┌─────────────┐
//! │ Application │ ─────────► │ SyncSession   │ ◄───────────► │ SyncServer  │
//! │ (renderer)  │ ◄───────── │ (per document)│  WebSocket    │ (channel)   │
//! └─────────────┘  events    └──────┬────────┘  bincode      └──────┬──────┘
//!                                   │ ChannelClient                 │
//!                                   ▼                               ▼
//!                            ┌─────────────┐                ┌───────────────┐
//!                            │ LocalStore  │                │ BroadcastGroup│
//!                            │ (RocksDB)   │                │ (per room)    │
//!                            └─────────────┘                └───────────────┘
//! ```
//!
//! Conflict resolution is last writer wins at whole-document granularity.
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `ChannelMessage`)
//! - [`broadcast`]: Room-based fan-out
//! - [`channel`]: Reconnecting channel client with one document subscription
//! - [`session`]: Debounced save, broadcast and echo suppression
//! - [`server`]: WebSocket channel server
//! - [`storage`]: Local store and catalog

pub mod broadcast;
pub mod channel;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use channel::{
    Backoff, ChannelCallbacks, ChannelClient, ChannelConfig, ChannelError, ConnectionState,
    RemoteChange,
};
pub use protocol::{AckBody, ChannelMessage, MessageKind, MetadataUpdate, ProtocolError, PushOp};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    ExitDecision, LifecycleSignal, SessionEvent, SessionPhase, SessionStats, SyncConfig,
    SyncSession,
};
pub use storage::{ExportEnvelope, LocalStore, StorageUsage, StoreConfig, StoreError};
