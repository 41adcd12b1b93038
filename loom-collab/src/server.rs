//! WebSocket reference server with one channel per document.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (doc_id) ── SharedDocument ── BroadcastGroup
//! Client B ──┘                         │
//!                                      └── LocalStore (optional, RocksDB)
//! ```
//!
//! Every acknowledged request is answered with an `Ack` carrying the
//! resulting document as JSON. Changes fan out to the other members of the
//! document's channel; the originator never receives its own frames.

use futures_util::{SinkExt, StreamExt};
use loom_core::{DocumentPayload, Edge, Node, SharedDocument, Viewport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::protocol::{AckBody, ChannelMessage, MessageKind};
use crate::storage::{LocalStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per document channel
    pub max_peers_per_room: usize,
    /// Broadcast buffer per member
    pub broadcast_capacity: usize,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_saves: u64,
    pub rejected_requests: u64,
}

struct Shared {
    config: ServerConfig,
    rooms: RoomManager,
    documents: RwLock<HashMap<String, SharedDocument>>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<LocalStore>>,
    shutdown: watch::Sender<bool>,
}

/// Per-connection state.
#[derive(Default)]
struct Session {
    peer_id: Option<Uuid>,
    joined: Option<String>,
    updates: Option<broadcast::Receiver<Arc<Vec<u8>>>>,
}

/// The reference sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening persistent storage when configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(LocalStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// In-memory server on the default address.
    pub fn in_memory() -> Self {
        Self::build(ServerConfig::default(), None)
    }

    fn build(config: ServerConfig, store: Option<Arc<LocalStore>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                rooms: RoomManager::new(config.broadcast_capacity),
                documents: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store,
                shutdown,
                config,
            }),
        }
    }

    /// Persistent server at `path`.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Load every stored document into memory.
    pub async fn recover(&self) -> usize {
        let Some(store) = &self.shared.store else {
            return 0;
        };

        let metas = store.list();
        let mut documents = self.shared.documents.write().await;
        let mut recovered = 0;
        for meta in &metas {
            let Some(payload) = store.payload(&meta.id) else {
                log::warn!("Document {} has no readable payload, skipping", meta.id);
                continue;
            };
            let mut doc = SharedDocument::new(&meta.id, &meta.title);
            doc.payload = payload;
            doc.updated_at = meta.updated_at;
            documents.insert(meta.id.clone(), doc);
            recovered += 1;
        }

        log::info!("Recovery complete: {recovered}/{} documents restored", metas.len());
        recovered
    }

    /// Recover, bind the configured address and serve until shut down.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Shared::handle_connection(shared, stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Sync server stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Ask every member of `doc_id` to persist now. Returns receivers reached.
    pub async fn request_save(&self, doc_id: &str) -> usize {
        match self.shared.rooms.get(doc_id).await {
            Some(room) => room
                .broadcast(&ChannelMessage::save_requested(doc_id))
                .unwrap_or(0),
            None => 0,
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    /// Server copy of a document.
    pub async fn document(&self, doc_id: &str) -> Option<SharedDocument> {
        self.shared.documents.read().await.get(doc_id).cloned()
    }

    pub async fn peer_count(&self, doc_id: &str) -> usize {
        match self.shared.rooms.get(doc_id).await {
            Some(room) => room.peer_count().await,
            None => 0,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<LocalStore>> {
        self.shared.store.as_ref()
    }
}

impl Shared {
    async fn handle_connection(
        shared: Arc<Shared>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut shutdown = shared.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session = Session::default();
        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let msg = match ChannelMessage::decode(&data) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                session.peer_id.get_or_insert(msg.peer_id);

                                for reply in shared.handle_message(&mut session, msg).await {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = async {
                        match session.updates.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                if let Ok(decoded) = ChannelMessage::decode(&data) {
                                    if Some(decoded.peer_id) == session.peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {:?} lagged by {n} messages", session.peer_id);
                            }
                            Err(broadcast::error::RecvError::Closed) => session.updates = None,
                        }
                    }

                    _ = shutdown.changed() => {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let (Some(peer_id), Some(doc_id)) = (session.peer_id, session.joined.take()) {
            shared.leave_room(peer_id, &doc_id).await;
        }
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Handle one request; returns the frames to send back to its sender.
    async fn handle_message(&self, session: &mut Session, msg: ChannelMessage) -> Vec<ChannelMessage> {
        let peer_id = msg.peer_id;
        let doc_id = msg.doc_id.clone();
        log::trace!("{:?} #{} for {doc_id} from {peer_id}", msg.kind, msg.request_id);

        let body = match msg.kind {
            MessageKind::Join => self.join(session, peer_id, &doc_id).await,
            MessageKind::Leave => {
                if session.joined.as_deref() == Some(doc_id.as_str()) {
                    session.joined = None;
                    session.updates = None;
                    self.leave_room(peer_id, &doc_id).await;
                }
                return Vec::new();
            }
            MessageKind::Update => match parse_json::<DocumentPayload>(&msg.payload) {
                Ok(mut payload) => {
                    payload.prune_dangling_edges();
                    let body = self
                        .modify(&doc_id, true, |doc| {
                            doc.payload = payload;
                            Ok(())
                        })
                        .await;
                    if let Some(room) = self.rooms.get(&doc_id).await {
                        let _ = room.broadcast(&msg);
                    }
                    match body {
                        AckBody::Ok(_) => AckBody::Ok(None),
                        rejected => rejected,
                    }
                }
                Err(reason) => AckBody::Rejected(reason),
            },
            MessageKind::Create => match self.load(&doc_id).await {
                Some(existing) => state_of(&existing),
                None => {
                    let meta = msg.metadata().unwrap_or_default();
                    let mut doc = SharedDocument::new(
                        &doc_id,
                        meta.title.as_deref().unwrap_or(crate::storage::DEFAULT_TITLE),
                    );
                    doc.description = meta.description.unwrap_or_default();
                    log::info!("Created shared document {doc_id}");
                    let mut documents = self.documents.write().await;
                    state_of(documents.entry(doc_id.clone()).or_insert(doc))
                }
            },
            MessageKind::Get => match self.load(&doc_id).await {
                Some(doc) => state_of(&doc),
                None => AckBody::Rejected(format!("document {doc_id} not found")),
            },
            MessageKind::UpdateMetadata => match msg.metadata() {
                Ok(meta) => {
                    self.modify(&doc_id, false, |doc| {
                        if let Some(title) = meta.title {
                            doc.title = title;
                        }
                        if let Some(description) = meta.description {
                            doc.description = description;
                        }
                        Ok(())
                    })
                    .await
                }
                Err(e) => AckBody::Rejected(e.to_string()),
            },
            MessageKind::UpdateNodes => {
                self.replace_part(peer_id, &doc_id, &msg.payload, |doc, nodes: Vec<Node>| {
                    doc.payload.nodes = nodes;
                    doc.payload.prune_dangling_edges();
                })
                .await
            }
            MessageKind::UpdateEdges => {
                self.replace_part(peer_id, &doc_id, &msg.payload, |doc, edges: Vec<Edge>| {
                    doc.payload.edges = edges;
                    doc.payload.prune_dangling_edges();
                })
                .await
            }
            MessageKind::UpdateViewport => {
                self.replace_part(peer_id, &doc_id, &msg.payload, |doc, viewport: Viewport| {
                    doc.payload.viewport = viewport;
                })
                .await
            }
            MessageKind::Load => {
                self.replace_part(peer_id, &doc_id, &msg.payload, |doc, mut payload: DocumentPayload| {
                    payload.prune_dangling_edges();
                    doc.payload = payload;
                })
                .await
            }
            MessageKind::Save => match self.load(&doc_id).await {
                Some(doc) => {
                    self.persist(&doc).await;
                    state_of(&doc)
                }
                None => AckBody::Rejected(format!("document {doc_id} not found")),
            },
            MessageKind::NotifyDeleted => {
                self.documents.write().await.remove(&doc_id);
                if let Some(store) = &self.store {
                    if let Err(e) = store.delete(&doc_id) {
                        log::error!("Failed to delete stored document {doc_id}: {e}");
                    }
                }
                if let Some(room) = self.rooms.get(&doc_id).await {
                    let _ = room.broadcast(&ChannelMessage::document_deleted(peer_id, &doc_id));
                }
                log::info!("Document {doc_id} deleted by {peer_id}");
                AckBody::Ok(None)
            }
            MessageKind::Ping => return vec![ChannelMessage::pong(peer_id)],
            other => {
                log::debug!("Unhandled message kind: {other:?}");
                return Vec::new();
            }
        };

        if matches!(body, AckBody::Rejected(_)) {
            self.stats.write().await.rejected_requests += 1;
        }
        vec![ChannelMessage::ack(&doc_id, msg.request_id, &body)]
    }

    async fn join(&self, session: &mut Session, peer_id: Uuid, doc_id: &str) -> AckBody {
        if let Some(previous) = session.joined.take() {
            if previous != doc_id {
                session.updates = None;
                self.leave_room(peer_id, &previous).await;
            }
        }

        let room = self.rooms.get_or_create(doc_id).await;
        if !room.has_peer(&peer_id).await
            && room.peer_count().await >= self.config.max_peers_per_room
        {
            log::warn!("Room {doc_id} full, refusing {peer_id}");
            self.rooms.remove_if_empty(doc_id).await;
            return AckBody::Rejected("room full".into());
        }

        session.updates = Some(room.add_peer(peer_id).await);
        session.joined = Some(doc_id.to_string());

        let count = room.peer_count().await as u32;
        let _ = room.broadcast(&ChannelMessage::peer_joined(peer_id, doc_id, count));
        log::info!("Peer {peer_id} joined doc {doc_id} ({count} connected)");

        match self.load(doc_id).await {
            Some(doc) => state_of(&doc),
            None => AckBody::Ok(None),
        }
    }

    async fn leave_room(&self, peer_id: Uuid, doc_id: &str) {
        let Some(room) = self.rooms.get(doc_id).await else {
            return;
        };
        if room.remove_peer(&peer_id).await.is_none() {
            return;
        }

        let count = room.peer_count().await as u32;
        let _ = room.broadcast(&ChannelMessage::peer_left(peer_id, doc_id, count));
        log::info!("Peer {peer_id} left doc {doc_id} ({count} remaining)");

        if count == 0 {
            let doc = self.documents.read().await.get(doc_id).cloned();
            if let Some(doc) = doc {
                self.persist(&doc).await;
            }
            if self.rooms.remove_if_empty(doc_id).await {
                log::info!("Room {doc_id} removed (empty)");
            }
        }
    }

    /// Memory copy, falling back to the store.
    async fn load(&self, doc_id: &str) -> Option<SharedDocument> {
        if let Some(doc) = self.documents.read().await.get(doc_id) {
            return Some(doc.clone());
        }
        let store = self.store.as_ref()?;
        let payload = store.payload(doc_id)?;
        let meta = store.meta(doc_id);

        let mut doc = SharedDocument::new(
            doc_id,
            meta.as_ref().map_or(crate::storage::DEFAULT_TITLE, |m| m.title.as_str()),
        );
        doc.payload = payload;
        if let Some(meta) = meta {
            doc.updated_at = meta.updated_at;
        }
        log::info!("Loaded persisted document {doc_id}");

        let mut documents = self.documents.write().await;
        Some(documents.entry(doc_id.to_string()).or_insert(doc).clone())
    }

    /// Apply `f` to the document, creating it when `create` is set.
    async fn modify(
        &self,
        doc_id: &str,
        create: bool,
        f: impl FnOnce(&mut SharedDocument) -> Result<(), String>,
    ) -> AckBody {
        if self.load(doc_id).await.is_none() && !create {
            return AckBody::Rejected(format!("document {doc_id} not found"));
        }
        let mut documents = self.documents.write().await;
        let doc = documents
            .entry(doc_id.to_string())
            .or_insert_with(|| SharedDocument::new(doc_id, crate::storage::DEFAULT_TITLE));
        match f(doc) {
            Ok(()) => {
                doc.updated_at = loom_core::now_millis();
                state_of(doc)
            }
            Err(reason) => AckBody::Rejected(reason),
        }
    }

    /// Replace one part of a document from JSON and fan the result out.
    async fn replace_part<T: serde::de::DeserializeOwned>(
        &self,
        peer_id: Uuid,
        doc_id: &str,
        json: &[u8],
        apply: impl FnOnce(&mut SharedDocument, T),
    ) -> AckBody {
        let part = match parse_json::<T>(json) {
            Ok(part) => part,
            Err(reason) => return AckBody::Rejected(reason),
        };
        let body = self
            .modify(doc_id, true, |doc| {
                apply(doc, part);
                Ok(())
            })
            .await;

        if let AckBody::Ok(_) = body {
            let payload = self.documents.read().await.get(doc_id).map(|d| d.payload.clone());
            if let (Some(payload), Some(room)) = (payload, self.rooms.get(doc_id).await) {
                match serde_json::to_vec(&payload) {
                    Ok(change) => {
                        let update =
                            ChannelMessage::update(peer_id, doc_id, change, loom_core::now_millis());
                        let _ = room.broadcast(&update);
                    }
                    Err(e) => log::error!("Failed to encode {doc_id} for fan-out: {e}"),
                }
            }
        }
        body
    }

    async fn persist(&self, doc: &SharedDocument) {
        let Some(store) = &self.store else {
            return;
        };
        store.save_payload(&doc.id, &doc.payload);
        if let Err(e) = store.rename(&doc.id, &doc.title) {
            log::error!("Failed to persist title for {}: {e}", doc.id);
        }
        self.stats.write().await.persisted_saves += 1;
        log::info!("Persisted document {}", doc.id);
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    serde_json::from_slice(bytes).map_err(|e| format!("invalid document JSON: {e}"))
}

fn state_of(doc: &SharedDocument) -> AckBody {
    match serde_json::to_vec(doc) {
        Ok(json) => AckBody::Ok(Some(json)),
        Err(e) => AckBody::Rejected(format!("failed to encode document: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_in_memory_server() {
        let server = SyncServer::in_memory();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::in_memory();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.persisted_saves, 0);
    }

    #[tokio::test]
    async fn test_recovery_without_storage() {
        let server = SyncServer::in_memory();
        assert_eq!(server.recover().await, 0);
    }

    #[tokio::test]
    async fn test_request_save_without_room() {
        let server = SyncServer::in_memory();
        assert_eq!(server.request_save("nobody-here").await, 0);
    }

    #[tokio::test]
    async fn test_handle_create_get_and_update_nodes() {
        let server = SyncServer::in_memory();
        let mut session = Session::default();
        let peer = Uuid::new_v4();

        let create = ChannelMessage::push(
            peer,
            "doc",
            crate::protocol::PushOp::Create {
                title: "Flow".into(),
                description: Some("demo".into()),
            },
        );
        let replies = server.shared.handle_message(&mut session, create).await;
        let AckBody::Ok(Some(json)) = replies[0].ack_body().unwrap() else {
            panic!("create should return state");
        };
        let doc: SharedDocument = serde_json::from_slice(&json).unwrap();
        assert_eq!(doc.title, "Flow");
        assert_eq!(doc.description, "demo");

        let mut payload = DocumentPayload::new();
        payload.add_node(loom_core::NodeKind::Agent, None, None);
        let nodes = serde_json::to_vec(&payload.nodes).unwrap();
        let update = ChannelMessage::push(peer, "doc", crate::protocol::PushOp::UpdateNodes(nodes));
        server.shared.handle_message(&mut session, update).await;

        let stored = server.document("doc").await.unwrap();
        assert_eq!(stored.payload.nodes.len(), 1);
        assert_eq!(stored.title, "Flow");
    }

    #[tokio::test]
    async fn test_handle_get_missing_is_rejected() {
        let server = SyncServer::in_memory();
        let mut session = Session::default();
        let get = ChannelMessage::push(Uuid::new_v4(), "ghost", crate::protocol::PushOp::Get);

        let replies = server.shared.handle_message(&mut session, get).await;
        assert!(matches!(replies[0].ack_body().unwrap(), AckBody::Rejected(_)));
        assert_eq!(server.stats().await.rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_handle_invalid_update_is_rejected() {
        let server = SyncServer::in_memory();
        let mut session = Session::default();
        let update = ChannelMessage::update(Uuid::new_v4(), "doc", b"not json".to_vec(), 1);

        let replies = server.shared.handle_message(&mut session, update).await;
        assert!(matches!(replies[0].ack_body().unwrap(), AckBody::Rejected(_)));
        assert!(server.document("doc").await.is_none());
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let server = SyncServer::in_memory();
        let mut session = Session::default();
        let replies = server
            .shared
            .handle_message(&mut session, ChannelMessage::ping(Uuid::new_v4()))
            .await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, MessageKind::Pong);
    }
}
