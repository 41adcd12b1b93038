//! Per-document synchronization session.
//!
//! A `SyncSession` owns the working copy of one open document. It
//!
//! - loads the payload from the local store and joins the document channel,
//! - turns edits into a debounced save (local store first, then broadcast),
//! - applies remote changes as a whole-document replace, and
//! - suppresses the echo those remote changes would otherwise cause.
//!
//! ```text
//!            user edit / renderer change
//!                      │
//!   Ready ──► Idle ◄───┴───► Syncing ──(debounce fires)──► save + broadcast ──► Idle
//!                                 ▲
//!          remote update ─────────┘ (replaces payload, becomes the baseline)
//! ```
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! await. Timers are owned `JoinHandle`s tagged with a generation number so a
//! timer that fires after being replaced does nothing.

use loom_core::{
    DocumentPayload, GraphError, NodeChange, NodeKind, NodePatch, Snapshot, Template,
    TemplateApplied, Viewport,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelCallbacks, ChannelClient};
use crate::protocol::{MetadataUpdate, PushOp};
use crate::storage::LocalStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session timing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last edit before saving (default: 500ms)
    pub debounce: Duration,
    /// How long after a remote apply renderer changes count as echoes
    /// (default: 1000ms). Must exceed `debounce`.
    pub remote_flag_hold: Duration,
    /// Ask for confirmation when exiting with unsaved edits (default: true)
    pub confirm_on_exit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            remote_flag_hold: Duration::from_millis(1000),
            confirm_on_exit: true,
        }
    }
}

impl SyncConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            remote_flag_hold: Duration::from_millis(120),
            confirm_on_exit: true,
        }
    }

    /// Stretch `remote_flag_hold` past `debounce` when misconfigured.
    pub fn validated(mut self) -> Self {
        if self.remote_flag_hold <= self.debounce {
            let hold = self.debounce * 2;
            log::warn!(
                "remote_flag_hold {:?} does not exceed debounce {:?}, using {hold:?}",
                self.remote_flag_hold,
                self.debounce
            );
            self.remote_flag_hold = hold;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Loading,
    Ready,
    /// Edits pending or being pushed
    Syncing,
    Idle,
    Closed,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    PeersChanged(u32),
    RemoteApplied { timestamp: u64 },
    Saved { broadcast: bool },
    /// A peer deleted the document; the session is closed.
    DocumentDeleted,
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Writes of the working copy to the local store
    pub saves: u64,
    /// Changes delivered to the channel
    pub broadcasts: u64,
    pub remote_applied: u64,
    /// Renderer changes absorbed as echoes of a remote apply
    pub absorbed_echoes: u64,
}

/// Host lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    PageHide,
    Backgrounded,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Proceed,
    /// Unsaved edits existed; they were written but the user should confirm.
    ConfirmRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Explicit edit operations
    User,
    /// Renderer feedback: measurements, drags, selection, viewport
    Renderer,
}

struct SessionState {
    phase: SessionPhase,
    payload: DocumentPayload,
    selected: Option<String>,
    /// Last state saved, broadcast or received
    baseline: Snapshot,
    applying_remote: bool,
    unsaved: bool,
    debounce: Option<JoinHandle<()>>,
    debounce_generation: u64,
    remote_clear: Option<JoinHandle<()>>,
    remote_generation: u64,
    stats: SessionStats,
}

struct Shared {
    doc_id: String,
    config: SyncConfig,
    store: Arc<LocalStore>,
    channel: ChannelClient,
    events: mpsc::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

/// An open document.
pub struct SyncSession {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl SyncSession {
    /// Load `doc_id` from the store and join its channel.
    ///
    /// A document without a stored payload starts empty. A failed join
    /// leaves the session working locally.
    pub async fn open(
        doc_id: impl Into<String>,
        store: Arc<LocalStore>,
        channel: ChannelClient,
        config: SyncConfig,
    ) -> Self {
        let doc_id = doc_id.into();
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut state = SessionState {
            phase: SessionPhase::Loading,
            payload: DocumentPayload::default(),
            selected: None,
            baseline: Snapshot::default(),
            applying_remote: false,
            unsaved: false,
            debounce: None,
            debounce_generation: 0,
            remote_clear: None,
            remote_generation: 0,
            stats: SessionStats::default(),
        };
        state.payload = store.payload(&doc_id).unwrap_or_else(|| {
            log::info!("No stored payload for {doc_id}, starting empty");
            DocumentPayload::default()
        });
        state.baseline = Snapshot::of(&state.payload);
        state.phase = SessionPhase::Ready;

        let shared = Arc::new(Shared {
            doc_id,
            config: config.validated(),
            store,
            channel,
            events,
            state: Mutex::new(state),
        });
        Shared::register_callbacks(&shared);

        if !shared.channel.join_document(&shared.doc_id).await {
            log::warn!("Document {} open in local-only mode", shared.doc_id);
        }
        {
            let mut st = shared.state();
            if st.phase == SessionPhase::Ready {
                st.phase = SessionPhase::Idle;
            }
        }

        Self {
            shared,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Add a node at the next free spot; returns its id.
    pub fn add_node(&self, kind: NodeKind, label: Option<&str>, description: Option<&str>) -> String {
        self.mutate(Origin::User, |st| st.payload.add_node(kind, label, description))
    }

    pub fn update_node(&self, id: &str, patch: NodePatch) -> Result<(), GraphError> {
        self.mutate(Origin::User, |st| {
            if st.payload.update_node(id, patch) {
                Ok(())
            } else {
                Err(GraphError::NodeNotFound(id.to_string()))
            }
        })
    }

    /// Remove a node and every edge touching it.
    pub fn delete_node(&self, id: &str) -> bool {
        self.mutate(Origin::User, |st| {
            if st.selected.as_deref() == Some(id) {
                st.selected = None;
            }
            st.payload.delete_node(id).is_some()
        })
    }

    pub fn duplicate_node(&self, id: &str) -> Result<String, GraphError> {
        self.mutate(Origin::User, |st| {
            st.payload
                .duplicate_node(id)
                .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
        })
    }

    pub fn connect(
        &self,
        source: &str,
        target: &str,
        source_handle: Option<&str>,
        target_handle: Option<&str>,
    ) -> Result<String, GraphError> {
        self.mutate(Origin::User, |st| {
            st.payload.connect(source, target, source_handle, target_handle)
        })
    }

    /// Remove all edges from `source` to `target`.
    pub fn unlink(&self, source: &str, target: &str) -> usize {
        self.mutate(Origin::User, |st| st.payload.unlink(source, target))
    }

    pub fn apply_template(&self, template: &Template) -> TemplateApplied {
        self.mutate(Origin::User, |st| st.payload.apply_template(template))
    }

    // ─── Renderer feedback ────────────────────────────────────────────

    /// Apply a batch of renderer node changes (drag, measure, select, remove).
    ///
    /// A removal is an explicit user action even when the renderer reports it.
    pub fn apply_node_changes(&self, changes: Vec<NodeChange>) -> bool {
        let origin = if changes.iter().any(|c| matches!(c, NodeChange::Remove { .. })) {
            Origin::User
        } else {
            Origin::Renderer
        };
        self.mutate(origin, |st| {
            let touched = st.payload.apply_node_changes(changes);
            st.selected = st
                .payload
                .nodes
                .iter()
                .find(|n| n.selected)
                .map(|n| n.id.clone());
            touched
        })
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.mutate(Origin::Renderer, |st| st.payload.viewport = viewport);
    }

    /// Select one node (or none). Never a document change.
    pub fn select_node(&self, id: Option<&str>) {
        self.mutate(Origin::Renderer, |st| {
            for node in st.payload.nodes.iter_mut() {
                node.selected = Some(node.id.as_str()) == id;
            }
            st.selected = id.filter(|id| st.payload.contains_node(id)).map(str::to_string);
        });
    }

    // ─── Remote ───────────────────────────────────────────────────────

    /// Replace the working copy with a remote document.
    ///
    /// Returns `false` when the change cannot be parsed or the session is closed.
    pub fn receive_remote(&self, change: &[u8], timestamp: u64) -> bool {
        Shared::apply_remote(&self.shared, change, timestamp)
    }

    /// Fetch the server copy and apply it.
    pub async fn pull_remote(&self) -> bool {
        match self.shared.channel.request(&self.shared.doc_id, PushOp::Get).await {
            Ok(Some(state)) => self.receive_remote(&state, loom_core::now_millis()),
            Ok(None) => false,
            Err(e) => {
                log::warn!("Pull of {} failed: {e}", self.shared.doc_id);
                self.shared.emit(SessionEvent::Error(e.to_string()));
                false
            }
        }
    }

    /// Replace the server copy with the working copy.
    pub async fn push_snapshot(&self) -> bool {
        let json = {
            let st = self.shared.state();
            serde_json::to_vec(&st.payload.without_ui_state())
        };
        let json = match json {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode {}: {e}", self.shared.doc_id);
                return false;
            }
        };
        match self.shared.channel.request(&self.shared.doc_id, PushOp::Load(json)).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Push of {} failed: {e}", self.shared.doc_id);
                self.shared.emit(SessionEvent::Error(e.to_string()));
                false
            }
        }
    }

    /// Retitle the document locally and, when connected, on the server.
    pub async fn rename(&self, title: &str) -> bool {
        let doc_id = &self.shared.doc_id;
        let renamed = match self.shared.store.rename(doc_id, title) {
            Ok(renamed) => renamed,
            Err(e) => {
                log::error!("Failed to rename {doc_id}: {e}");
                false
            }
        };
        if self.shared.channel.is_connected() {
            let update = MetadataUpdate {
                title: Some(title.to_string()),
                description: None,
            };
            if let Err(e) = self.shared.channel.request(doc_id, PushOp::UpdateMetadata(update)).await {
                log::debug!("Server rename of {doc_id} skipped: {e}");
            }
        }
        renamed
    }

    // ─── Saving ───────────────────────────────────────────────────────

    /// Save and broadcast now instead of waiting for the debounce.
    pub async fn flush_now(&self) {
        Shared::flush(&self.shared, None).await;
    }

    /// Persist pending edits synchronously on host lifecycle signals.
    pub fn handle_lifecycle(&self, signal: LifecycleSignal) -> ExitDecision {
        let had_unsaved = self.shared.persist_now();
        if had_unsaved {
            log::info!("Saved {} on {signal:?}", self.shared.doc_id);
        }
        match signal {
            LifecycleSignal::Exit if had_unsaved && self.shared.config.confirm_on_exit => {
                ExitDecision::ConfirmRequired
            }
            _ => ExitDecision::Proceed,
        }
    }

    /// Save pending work, release the channel subscription and hand the
    /// channel back.
    ///
    /// Pending edits are written to the store but not broadcast; call
    /// [`flush_now`](Self::flush_now) first to send them to peers.
    pub async fn close(self) -> ChannelClient {
        self.shared.persist_now();
        Shared::shutdown(&self.shared).await;
        self.shared.channel.clone()
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Working copy including UI flags.
    pub fn snapshot(&self) -> DocumentPayload {
        self.shared.state().payload.clone()
    }

    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.state().phase
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.state().stats
    }

    pub fn selected(&self) -> Option<String> {
        self.shared.state().selected.clone()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.shared.state().applying_remote
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.shared.state().unsaved
    }

    /// Connected and subscribed to this document.
    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    fn mutate<R>(&self, origin: Origin, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut st = self.shared.state();
        let before = Snapshot::of(&st.payload);
        let result = f(&mut st);
        let changed = before.differs_from(&st.payload);
        Shared::note_change(&self.shared, &mut st, origin, changed);
        result
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        self.channel.is_connected()
            && self.channel.active_document().as_deref() == Some(self.doc_id.as_str())
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Session event dropped, receiver lagging: {event:?}");
        }
    }

    fn register_callbacks(shared: &Arc<Shared>) {
        let weak = Arc::downgrade(shared);
        let on = move || weak.clone();

        let callbacks = ChannelCallbacks::default()
            .with_connect({
                let weak = on();
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.emit(SessionEvent::Connected);
                    }
                }
            })
            .with_disconnect({
                let weak = on();
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.emit(SessionEvent::Disconnected);
                    }
                }
            })
            .with_update({
                let weak = on();
                move |change| {
                    if let Some(s) = weak.upgrade() {
                        if change.doc_id == s.doc_id {
                            Shared::apply_remote(&s, &change.change, change.timestamp);
                        }
                    }
                }
            })
            .with_peer_joined({
                let weak = on();
                move |count| {
                    if let Some(s) = weak.upgrade() {
                        s.emit(SessionEvent::PeersChanged(count));
                    }
                }
            })
            .with_peer_left({
                let weak = on();
                move |count| {
                    if let Some(s) = weak.upgrade() {
                        s.emit(SessionEvent::PeersChanged(count));
                    }
                }
            })
            .with_document_deleted({
                let weak = on();
                move || {
                    if let Some(s) = weak.upgrade() {
                        tokio::spawn(async move {
                            log::info!("Closing {}: deleted by a peer", s.doc_id);
                            Shared::shutdown(&s).await;
                            s.emit(SessionEvent::DocumentDeleted);
                        });
                    }
                }
            })
            .with_save_requested({
                let weak = on();
                move || {
                    if let Some(s) = weak.upgrade() {
                        tokio::spawn(async move { Shared::flush(&s, None).await });
                    }
                }
            })
            .with_error({
                let weak = on();
                move |error| {
                    if let Some(s) = weak.upgrade() {
                        s.emit(SessionEvent::Error(error.to_string()));
                    }
                }
            });

        shared.channel.set_callbacks(callbacks);
    }

    /// Classify a mutation and arm the save timer when it changed the document.
    fn note_change(shared: &Arc<Shared>, st: &mut SessionState, origin: Origin, changed: bool) {
        if st.phase == SessionPhase::Closed || !changed {
            return;
        }

        if origin == Origin::Renderer && st.applying_remote && !st.unsaved {
            st.baseline = Snapshot::of(&st.payload);
            st.stats.absorbed_echoes += 1;
            log::trace!("Absorbed renderer echo on {}", shared.doc_id);
            return;
        }

        if !st.baseline.differs_from(&st.payload) {
            return;
        }
        st.unsaved = true;
        st.phase = SessionPhase::Syncing;
        Shared::arm_debounce(shared, st);
    }

    fn arm_debounce(shared: &Arc<Shared>, st: &mut SessionState) {
        if let Some(timer) = st.debounce.take() {
            timer.abort();
        }
        st.debounce_generation += 1;
        let generation = st.debounce_generation;
        let delay = shared.config.debounce;
        let weak = Arc::downgrade(shared);

        st.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(s) = weak.upgrade() {
                Shared::flush(&s, Some(generation)).await;
            }
        }));
    }

    /// Save to the local store, then broadcast if connected.
    ///
    /// `generation` identifies a debounce firing; a stale one does nothing.
    async fn flush(shared: &Arc<Shared>, generation: Option<u64>) {
        let change = {
            let mut st = shared.state();
            if let Some(generation) = generation {
                if generation != st.debounce_generation {
                    return;
                }
                st.debounce = None;
            }
            if st.phase == SessionPhase::Closed {
                return;
            }
            if !st.baseline.differs_from(&st.payload) {
                st.unsaved = false;
                if st.phase == SessionPhase::Syncing && st.debounce.is_none() {
                    st.phase = SessionPhase::Idle;
                }
                log::trace!("Nothing to save for {}", shared.doc_id);
                return;
            }

            let clean = st.payload.without_ui_state();
            shared.store.save_payload(&shared.doc_id, &clean);
            st.baseline = Snapshot::of(&clean);
            st.unsaved = false;
            st.stats.saves += 1;
            match serde_json::to_vec(&clean) {
                Ok(json) => Some(json),
                Err(e) => {
                    log::error!("Failed to encode {} for broadcast: {e}", shared.doc_id);
                    None
                }
            }
        };

        let mut broadcast = false;
        if let Some(change) = change {
            if shared.is_live() {
                broadcast = shared.channel.send_change(change).await;
            }
        }

        {
            let mut st = shared.state();
            if broadcast {
                st.stats.broadcasts += 1;
            }
            if st.phase == SessionPhase::Syncing && st.debounce.is_none() {
                st.phase = SessionPhase::Idle;
            }
        }
        log::debug!("Saved {} (broadcast: {broadcast})", shared.doc_id);
        shared.emit(SessionEvent::Saved { broadcast });
    }

    /// Write pending edits to the store without touching the baseline, so
    /// the debounced broadcast still goes out. Returns whether anything was
    /// pending.
    fn persist_now(&self) -> bool {
        let mut st = self.state();
        if !st.unsaved || st.phase == SessionPhase::Closed {
            return false;
        }
        self.store.save_payload(&self.doc_id, &st.payload.without_ui_state());
        st.unsaved = false;
        st.stats.saves += 1;
        true
    }

    fn apply_remote(shared: &Arc<Shared>, change: &[u8], timestamp: u64) -> bool {
        let mut payload: DocumentPayload = match serde_json::from_slice(change) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Ignoring malformed remote change for {}: {e}", shared.doc_id);
                shared.emit(SessionEvent::Error(format!("malformed remote change: {e}")));
                return false;
            }
        };
        payload.prune_dangling_edges();

        {
            let mut st = shared.state();
            if st.phase == SessionPhase::Closed {
                return false;
            }

            let selected = st.selected.take();
            for node in payload.nodes.iter_mut() {
                node.clear_ui_state();
                node.selected = selected.as_deref() == Some(node.id.as_str());
            }
            for edge in payload.edges.iter_mut() {
                edge.clear_ui_state();
            }
            st.selected = selected.filter(|id| payload.contains_node(id));

            shared.store.save_payload(&shared.doc_id, &payload);
            st.baseline = Snapshot::of(&payload);
            st.payload = payload;
            st.unsaved = false;
            st.applying_remote = true;
            st.stats.remote_applied += 1;
            Shared::arm_remote_clear(shared, &mut st);
        }

        log::debug!("Applied remote change to {} (ts {timestamp})", shared.doc_id);
        shared.emit(SessionEvent::RemoteApplied { timestamp });
        true
    }

    fn arm_remote_clear(shared: &Arc<Shared>, st: &mut SessionState) {
        if let Some(timer) = st.remote_clear.take() {
            timer.abort();
        }
        st.remote_generation += 1;
        let generation = st.remote_generation;
        let hold = shared.config.remote_flag_hold;
        let weak = Arc::downgrade(shared);

        st.remote_clear = Some(tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            if let Some(s) = weak.upgrade() {
                let mut st = s.state();
                if st.remote_generation == generation {
                    st.applying_remote = false;
                    st.remote_clear = None;
                }
            }
        }));
    }

    /// Mark the session closed, cancel timers and drop the channel handlers.
    ///
    /// Returns `false` when it was already closed.
    fn detach(&self) -> bool {
        {
            let mut st = self.state();
            if st.phase == SessionPhase::Closed {
                return false;
            }
            st.phase = SessionPhase::Closed;
            for timer in [st.debounce.take(), st.remote_clear.take()].into_iter().flatten() {
                timer.abort();
            }
            st.applying_remote = false;
            st.unsaved = false;
            st.selected = None;
            st.payload = DocumentPayload::default();
            st.baseline = Snapshot::default();
        }
        self.channel.reset_callbacks();
        true
    }

    fn owns_subscription(&self) -> bool {
        self.channel.active_document().as_deref() == Some(self.doc_id.as_str())
    }

    /// Detach and leave the channel.
    async fn shutdown(shared: &Arc<Shared>) {
        if !shared.detach() {
            return;
        }
        if shared.owns_subscription() {
            shared.channel.leave_document().await;
        }
        log::info!("Closed session for {}", shared.doc_id);
    }
}

impl Drop for SyncSession {
    /// Dropping an open session saves pending edits and detaches it. The
    /// channel subscription is released on a spawned task when a tokio
    /// runtime is available.
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.persist_now();
        if !shared.detach() || !shared.owns_subscription() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let channel = shared.channel.clone();
                let doc_id = shared.doc_id.clone();
                handle.spawn(async move {
                    if channel.active_document().as_deref() == Some(doc_id.as_str()) {
                        channel.leave_document().await;
                    }
                });
                log::info!("Closed session for {} on drop", shared.doc_id);
            }
            Err(_) => log::warn!(
                "Session for {} dropped outside a runtime, subscription kept",
                shared.doc_id
            ),
        }
    }
}
