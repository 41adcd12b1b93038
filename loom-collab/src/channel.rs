//! WebSocket channel client.
//!
//! One long-lived connection per client, one active document subscription
//! at a time. Provides:
//! - Connection lifecycle with bounded exponential reconnect
//! - Re-subscription to the active document after a reconnect
//! - Change broadcast and acknowledged document requests
//! - Inbound event dispatch through replaceable callbacks
//!
//! The client is a cheap `Clone` handle; background tasks hold only weak
//! references, so dropping every handle shuts the connection down.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{AckBody, ChannelMessage, MessageKind, ProtocolError, PushOp};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// First reconnect delay (default: 1s)
    pub base_delay: Duration,
    /// Reconnect delay cap (default: 30s)
    pub max_delay: Duration,
    /// Reconnect attempts before giving up (default: 10)
    pub max_attempts: u32,
    /// Pause after reconnecting before re-joining (default: 250ms)
    pub settle_delay: Duration,
    /// Connect and acknowledgement timeout (default: 5s)
    pub request_timeout: Duration,
    /// Outgoing frame buffer (default: 256)
    pub outgoing_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            settle_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(5),
            outgoing_capacity: 256,
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Short delays for tests.
    pub fn for_testing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            max_attempts: 10,
            settle_delay: Duration::from_millis(20),
            request_timeout: Duration::from_secs(2),
            outgoing_capacity: 64,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Not connected")]
    NotConnected,
    #[error("No active document subscription")]
    NotSubscribed,
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ─── Backoff ──────────────────────────────────────────────────────────

/// Reconnect schedule: attempt `k` (0-based) waits `min(base · 2^k, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.base_delay, config.max_delay, config.max_attempts)
    }

    /// Delay for the `k`-th consecutive failure.
    pub fn delay_for(&self, k: u32) -> Duration {
        1u32.checked_shl(k)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Next delay, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// ─── Callbacks ────────────────────────────────────────────────────────

/// A change broadcast by another peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub doc_id: String,
    pub peer_id: Uuid,
    pub change: Vec<u8>,
    pub timestamp: u64,
}

pub type Callback = Arc<dyn Fn() + Send + Sync>;
pub type UpdateCallback = Arc<dyn Fn(RemoteChange) + Send + Sync>;
pub type PeerCallback = Arc<dyn Fn(u32) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ChannelError) + Send + Sync>;

/// Inbound event handlers. Unset handlers drop their events.
#[derive(Clone, Default)]
pub struct ChannelCallbacks {
    pub on_connect: Option<Callback>,
    pub on_disconnect: Option<Callback>,
    pub on_update: Option<UpdateCallback>,
    pub on_peer_joined: Option<PeerCallback>,
    pub on_peer_left: Option<PeerCallback>,
    pub on_document_deleted: Option<Callback>,
    pub on_save_requested: Option<Callback>,
    pub on_error: Option<ErrorCallback>,
}

impl ChannelCallbacks {
    pub fn with_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn with_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(RemoteChange) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn with_peer_joined(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_peer_joined = Some(Arc::new(f));
        self
    }

    pub fn with_peer_left(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_peer_left = Some(Arc::new(f));
        self
    }

    pub fn with_document_deleted(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_document_deleted = Some(Arc::new(f));
        self
    }

    pub fn with_save_requested(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_save_requested = Some(Arc::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(ChannelError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Shallow merge: handlers set in `other` replace ours, the rest stay.
    pub fn merge(&mut self, other: ChannelCallbacks) {
        fn take<T>(slot: &mut Option<T>, new: Option<T>) {
            if new.is_some() {
                *slot = new;
            }
        }
        take(&mut self.on_connect, other.on_connect);
        take(&mut self.on_disconnect, other.on_disconnect);
        take(&mut self.on_update, other.on_update);
        take(&mut self.on_peer_joined, other.on_peer_joined);
        take(&mut self.on_peer_left, other.on_peer_left);
        take(&mut self.on_document_deleted, other.on_document_deleted);
        take(&mut self.on_save_requested, other.on_save_requested);
        take(&mut self.on_error, other.on_error);
    }
}

impl std::fmt::Debug for ChannelCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_peer_joined", &self.on_peer_joined.is_some())
            .field("on_peer_left", &self.on_peer_left.is_some())
            .field("on_document_deleted", &self.on_document_deleted.is_some())
            .field("on_save_requested", &self.on_save_requested.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

// ─── Client ───────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    outgoing: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    generation: u64,
}

struct ClientState {
    status: ConnectionState,
    connection: Option<Connection>,
    /// Document the client is (or wants to be) subscribed to
    subscription: Option<String>,
    backoff: Backoff,
    pending_retry: Option<Duration>,
    retry_timer: Option<JoinHandle<()>>,
    resubscribe_timer: Option<JoinHandle<()>>,
    pending: HashMap<u64, oneshot::Sender<AckBody>>,
    manual_close: bool,
    generation: u64,
}

struct Inner {
    config: ChannelConfig,
    peer_id: Uuid,
    state: Mutex<ClientState>,
    callbacks: Mutex<ChannelCallbacks>,
    next_request: AtomicU64,
}

/// Handle to the channel connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

impl ChannelClient {
    pub fn new(config: ChannelConfig) -> Self {
        let backoff = Backoff::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                peer_id: Uuid::new_v4(),
                state: Mutex::new(ClientState {
                    status: ConnectionState::Disconnected,
                    connection: None,
                    subscription: None,
                    backoff,
                    pending_retry: None,
                    retry_timer: None,
                    resubscribe_timer: None,
                    pending: HashMap::new(),
                    manual_close: false,
                    generation: 0,
                }),
                callbacks: Mutex::new(ChannelCallbacks::default()),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Open the connection. Resolves `true` once connected.
    ///
    /// A failed attempt schedules automatic retries.
    pub async fn connect(&self) -> bool {
        {
            let mut st = self.inner.state();
            st.manual_close = false;
            if let Some(timer) = st.retry_timer.take() {
                timer.abort();
            }
        }
        Inner::open(&self.inner).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// The subscription is remembered and restored by the next `connect`.
    pub fn disconnect(&self) {
        let closed = {
            let mut st = self.inner.state();
            st.manual_close = true;
            st.status = ConnectionState::Disconnected;
            st.pending_retry = None;
            st.pending.clear();
            for timer in [st.retry_timer.take(), st.resubscribe_timer.take()].into_iter().flatten() {
                timer.abort();
            }
            st.connection.take()
        };

        if let Some(conn) = closed {
            conn.reader.abort();
            log::info!("Channel to {} closed", self.inner.config.url);
            if let Some(cb) = self.inner.callbacks().on_disconnect {
                cb();
            }
        }
    }

    /// Subscribe to `doc_id`, leaving any other subscription first.
    ///
    /// Returns `false` when not connected or the server refuses; the id is
    /// kept as the desired subscription unless refused.
    pub async fn join_document(&self, doc_id: &str) -> bool {
        Inner::subscribe(&self.inner, doc_id.to_string()).await
    }

    /// Release the active subscription, if any.
    pub async fn leave_document(&self) {
        let (doc_id, outgoing) = {
            let mut st = self.inner.state();
            if let Some(timer) = st.resubscribe_timer.take() {
                timer.abort();
            }
            let outgoing = st.connection.as_ref().map(|c| c.outgoing.clone());
            (st.subscription.take(), outgoing)
        };

        if let (Some(doc_id), Some(outgoing)) = (doc_id, outgoing) {
            if let Ok(frame) = ChannelMessage::leave(self.inner.peer_id, &doc_id).encode() {
                let _ = outgoing.send(frame).await;
            }
            log::info!("Left document {doc_id}");
        }
    }

    /// Broadcast a change to the active document. Best effort.
    pub async fn send_change(&self, change: Vec<u8>) -> bool {
        let Some(doc_id) = self.active_document() else {
            log::debug!("Change dropped: no active subscription");
            return false;
        };
        let msg = ChannelMessage::update(self.inner.peer_id, &doc_id, change, loom_core::now_millis());
        match self.inner.request(msg).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Change for {doc_id} not delivered: {e}");
                false
            }
        }
    }

    /// Acknowledged document operation. Returns the resulting state if the
    /// server sent one.
    pub async fn request(&self, doc_id: &str, op: PushOp) -> Result<Option<Vec<u8>>, ChannelError> {
        let msg = ChannelMessage::push(self.inner.peer_id, doc_id, op);
        self.inner.request(msg).await
    }

    /// Tell everyone subscribed to `doc_id` that it has been deleted.
    pub async fn notify_deleted(&self, doc_id: &str) -> bool {
        let msg = ChannelMessage::notify_deleted(self.inner.peer_id, doc_id);
        match self.inner.request(msg).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Deletion notice for {doc_id} not delivered: {e}");
                false
            }
        }
    }

    /// Merge handlers into the current set.
    pub fn set_callbacks(&self, callbacks: ChannelCallbacks) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(callbacks);
    }

    /// Drop every handler.
    pub fn reset_callbacks(&self) {
        *self.inner.callbacks.lock().unwrap_or_else(PoisonError::into_inner) =
            ChannelCallbacks::default();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state().status
    }

    pub fn active_document(&self) -> Option<String> {
        self.inner.state().subscription.clone()
    }

    pub fn peer_id(&self) -> Uuid {
        self.inner.peer_id
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Consecutive failed connection attempts since the last success.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state().backoff.attempts()
    }

    /// Delay of the currently scheduled retry, if one is pending.
    pub fn pending_retry_delay(&self) -> Option<Duration> {
        self.inner.state().pending_retry
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> ChannelCallbacks {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_connected(&self) -> bool {
        self.state().status == ConnectionState::Connected
    }

    fn report(&self, error: ChannelError) {
        if let Some(cb) = self.callbacks().on_error {
            cb(error);
        }
    }

    async fn open(inner: &Arc<Inner>) -> bool {
        {
            let mut st = inner.state();
            match st.status {
                ConnectionState::Connected => return true,
                ConnectionState::Connecting => {
                    log::debug!("Connect to {} already in flight", inner.config.url);
                    return false;
                }
                _ => st.status = ConnectionState::Connecting,
            }
            st.pending_retry = None;
        }

        let url = inner.config.url.as_str();
        let result = tokio::time::timeout(
            inner.config.request_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await;

        let error = match result {
            Ok(Ok((ws, _))) => {
                Inner::attach(inner, ws);
                return true;
            }
            Ok(Err(e)) => ChannelError::Transport(e.to_string()),
            Err(_) => ChannelError::Protocol(ProtocolError::Timeout),
        };

        log::warn!("Channel connect to {url} failed: {error}");
        inner.state().status = ConnectionState::Disconnected;
        inner.report(error);
        Inner::schedule_reconnect(inner);
        false
    }

    /// Wire up reader and writer tasks for a fresh connection.
    fn attach(inner: &Arc<Inner>, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(inner.config.outgoing_capacity);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let generation = {
            let mut st = inner.state();
            st.generation += 1;
            st.generation
        };

        let weak = Arc::downgrade(inner);
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match weak.upgrade() {
                        Some(inner) => inner.dispatch(&data),
                        None => return,
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            if let Some(inner) = weak.upgrade() {
                Inner::connection_lost(&inner, generation);
            }
        });

        let resubscribe = {
            let mut st = inner.state();
            st.connection = Some(Connection {
                outgoing: out_tx,
                reader,
                generation,
            });
            st.status = ConnectionState::Connected;
            st.backoff.reset();
            st.pending_retry = None;
            st.subscription.clone()
        };

        log::info!("Channel connected to {} as {}", inner.config.url, inner.peer_id);
        if let Some(cb) = inner.callbacks().on_connect {
            cb();
        }

        if let Some(doc_id) = resubscribe {
            let weak = Arc::downgrade(inner);
            let settle = inner.config.settle_delay;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                if let Some(inner) = weak.upgrade() {
                    inner.state().resubscribe_timer = None;
                    log::info!("Re-joining {doc_id} after reconnect");
                    Inner::subscribe(&inner, doc_id).await;
                }
            });
            if let Some(old) = inner.state().resubscribe_timer.replace(timer) {
                old.abort();
            }
        }
    }

    fn connection_lost(inner: &Arc<Inner>, generation: u64) {
        let manual = {
            let mut st = inner.state();
            if st.connection.as_ref().map(|c| c.generation) != Some(generation) {
                return;
            }
            st.connection = None;
            st.status = ConnectionState::Disconnected;
            st.pending.clear();
            if let Some(timer) = st.resubscribe_timer.take() {
                timer.abort();
            }
            st.manual_close
        };

        log::info!("Channel to {} lost", inner.config.url);
        if let Some(cb) = inner.callbacks().on_disconnect {
            cb();
        }
        if !manual {
            Inner::schedule_reconnect(inner);
        }
    }

    fn schedule_reconnect(inner: &Arc<Inner>) {
        let mut st = inner.state();
        if st.manual_close {
            return;
        }
        if let Some(timer) = st.retry_timer.take() {
            timer.abort();
        }
        let Some(delay) = st.backoff.next_delay() else {
            log::warn!(
                "Giving up on {} after {} attempts",
                inner.config.url,
                st.backoff.attempts()
            );
            st.status = ConnectionState::Disconnected;
            st.pending_retry = None;
            return;
        };

        st.status = ConnectionState::Reconnecting;
        st.pending_retry = Some(delay);
        log::info!(
            "Reconnecting to {} in {delay:?} (attempt {})",
            inner.config.url,
            st.backoff.attempts()
        );

        let weak: Weak<Inner> = Arc::downgrade(inner);
        st.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                {
                    let mut st = inner.state();
                    st.retry_timer = None;
                    st.status = ConnectionState::Disconnected;
                }
                Inner::open(&inner).await;
            }
        }));
    }

    async fn subscribe(inner: &Arc<Inner>, doc_id: String) -> bool {
        let (previous, outgoing) = {
            let mut st = inner.state();
            let previous = st.subscription.replace(doc_id.clone());
            (previous, st.connection.as_ref().map(|c| c.outgoing.clone()))
        };

        let Some(outgoing) = outgoing else {
            log::warn!("Join of {doc_id} deferred: channel not connected");
            return false;
        };

        if let Some(previous) = previous.filter(|p| *p != doc_id) {
            if let Ok(frame) = ChannelMessage::leave(inner.peer_id, &previous).encode() {
                let _ = outgoing.send(frame).await;
            }
            log::debug!("Left {previous} before joining {doc_id}");
        }

        match inner.request(ChannelMessage::join(inner.peer_id, &doc_id)).await {
            Ok(_) => {
                log::info!("Joined document {doc_id}");
                true
            }
            Err(e) => {
                log::warn!("Join of {doc_id} failed: {e}");
                if matches!(e, ChannelError::Rejected(_)) {
                    let mut st = inner.state();
                    if st.subscription.as_deref() == Some(doc_id.as_str()) {
                        st.subscription = None;
                    }
                }
                inner.report(e);
                false
            }
        }
    }

    /// Send `msg` with a fresh request id and wait for its acknowledgement.
    async fn request(&self, mut msg: ChannelMessage) -> Result<Option<Vec<u8>>, ChannelError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        msg.request_id = request_id;
        let frame = msg.encode()?;

        let (tx, rx) = oneshot::channel();
        let outgoing = {
            let mut st = self.state();
            let outgoing = st
                .connection
                .as_ref()
                .map(|c| c.outgoing.clone())
                .ok_or(ChannelError::NotConnected)?;
            st.pending.insert(request_id, tx);
            outgoing
        };

        if outgoing.send(frame).await.is_err() {
            self.state().pending.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }
        log::trace!("Sent {:?} #{request_id} for {}", msg.kind, msg.doc_id);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(AckBody::Ok(state))) => Ok(state),
            Ok(Ok(AckBody::Rejected(reason))) => Err(ChannelError::Rejected(reason)),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.state().pending.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    /// Route one inbound frame.
    fn dispatch(&self, data: &[u8]) {
        let msg = match ChannelMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return;
            }
        };

        match msg.kind {
            MessageKind::Ack => {
                let waiter = self.state().pending.remove(&msg.request_id);
                match (waiter, msg.ack_body()) {
                    (Some(tx), Ok(body)) => {
                        let _ = tx.send(body);
                    }
                    (None, _) => log::debug!("Ack #{} has no waiter", msg.request_id),
                    (Some(_), Err(e)) => log::warn!("Malformed ack #{}: {e}", msg.request_id),
                }
            }
            MessageKind::Pong => log::trace!("Pong from server"),
            MessageKind::Update
            | MessageKind::PeerJoined
            | MessageKind::PeerLeft
            | MessageKind::DocumentDeleted
            | MessageKind::SaveRequested => self.dispatch_document_event(msg),
            other => log::debug!("Ignoring unexpected {other:?} from server"),
        }
    }

    fn dispatch_document_event(&self, msg: ChannelMessage) {
        let active = self.state().subscription.clone();
        if active.as_deref() != Some(msg.doc_id.as_str()) {
            log::debug!("Dropping {:?} for inactive document {}", msg.kind, msg.doc_id);
            return;
        }
        if msg.kind == MessageKind::Update && msg.peer_id == self.peer_id {
            return;
        }

        let callbacks = self.callbacks();
        match msg.kind {
            MessageKind::Update => {
                if let Some(cb) = callbacks.on_update {
                    cb(RemoteChange {
                        doc_id: msg.doc_id,
                        peer_id: msg.peer_id,
                        change: msg.payload,
                        timestamp: msg.timestamp,
                    });
                }
            }
            MessageKind::PeerJoined | MessageKind::PeerLeft => {
                let count = match msg.peer_count() {
                    Ok(count) => count,
                    Err(e) => {
                        log::warn!("Malformed peer notification: {e}");
                        return;
                    }
                };
                let cb = if msg.kind == MessageKind::PeerJoined {
                    callbacks.on_peer_joined
                } else {
                    callbacks.on_peer_left
                };
                if let Some(cb) = cb {
                    cb(count);
                }
            }
            MessageKind::DocumentDeleted => {
                log::info!("Document {} deleted by a peer", msg.doc_id);
                if let Some(cb) = callbacks.on_document_deleted {
                    cb();
                }
            }
            MessageKind::SaveRequested => {
                if let Some(cb) = callbacks.on_save_requested {
                    cb();
                }
            }
            _ => {}
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for timer in [st.retry_timer.take(), st.resubscribe_timer.take()].into_iter().flatten() {
            timer.abort();
        }
        if let Some(conn) = st.connection.take() {
            conn.reader.abort();
        }
    }
}
