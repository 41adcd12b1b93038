//! Per-document fan-out to subscribed peers.
//!
//! Each document channel owns one tokio broadcast sender. Frames are encoded
//! once and shared as `Arc<Vec<u8>>`; every member gets its own receiver and
//! filters out frames it originated itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ChannelMessage, ProtocolError};

/// Statistics for monitoring a document channel.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// A subscribed peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub peer_id: Uuid,
    /// Milliseconds since epoch
    pub joined_at: u64,
}

/// Fan-out group for one document channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RwLock<HashMap<Uuid, Member>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per member before a slow
    /// member starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe a peer. Re-adding an existing member keeps its join time.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut members = self.members.write().await;
        members.entry(peer_id).or_insert_with(|| Member {
            peer_id,
            joined_at: loom_core::now_millis(),
        });
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<Member> {
        self.members.write().await.remove(peer_id)
    }

    /// Send to every receiver. Sender filtering is the receiving side's job.
    ///
    /// Returns the number of receivers the frame reached.
    pub fn broadcast(&self, msg: &ChannelMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(count) => count,
            Err(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.members.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.members.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document ids to their fan-out groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `doc_id`.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Existing group only.
    pub async fn get(&self, doc_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Drop the group once nobody is subscribed.
    pub async fn remove_if_empty(&self, doc_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
