//! Bridge endpoints and the per-side router task.
//!
//! [`pair`] creates two connected endpoints. Each side owns a router task
//! that drains the peer's frames in order: responses are routed to pending
//! requests by correlation id, everything else is dispatched to the handler
//! registered for its kind. Handler failures are logged and, when the frame
//! carried a correlation id, returned to the peer as error responses; they
//! never terminate the bridge.

use crate::bridge::{BridgeConfig, BridgeError};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tether_types::{Message, MessageKind};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tracing::{debug, error, trace, warn};

/// Result of a message handler: an optional response payload, or an error
/// string that is sent back to the requester.
pub type HandlerResult = Result<Option<Value>, String>;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct Shared {
    handlers: RwLock<HashMap<MessageKind, Handler>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HandlerResult>>>,
    peer_gone: AtomicBool,
    closed: Notify,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            peer_gone: AtomicBool::new(false),
            closed: Notify::new(),
        })
    }
}

/// One side of the bridge. Cheap to clone; all clones share the same
/// connection state.
#[derive(Clone)]
pub struct BridgeEndpoint {
    label: &'static str,
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    /// The other side's state, so a close tears down both sides.
    peer_shared: Arc<Shared>,
    next_correlation: Arc<AtomicU64>,
    config: BridgeConfig,
}

/// Create a connected host/view endpoint pair and spawn both router tasks.
pub fn pair(config: BridgeConfig) -> (BridgeEndpoint, BridgeEndpoint) {
    let (to_view_tx, to_view_rx) = mpsc::unbounded_channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();

    let host_shared = Shared::new();
    let view_shared = Shared::new();

    let host = BridgeEndpoint {
        label: "host",
        tx: to_view_tx,
        shared: host_shared.clone(),
        peer_shared: view_shared.clone(),
        next_correlation: Arc::new(AtomicU64::new(1)),
        config: config.clone(),
    };
    let view = BridgeEndpoint {
        label: "view",
        tx: to_host_tx,
        shared: view_shared,
        peer_shared: host_shared,
        next_correlation: Arc::new(AtomicU64::new(1)),
        config,
    };

    tokio::spawn(router_task(
        "host",
        to_host_rx,
        host.shared.clone(),
        host.tx.clone(),
    ));
    tokio::spawn(router_task(
        "view",
        to_view_rx,
        view.shared.clone(),
        view.tx.clone(),
    ));

    (host, view)
}

impl BridgeEndpoint {

    /// Fire-and-forget send.
    pub fn send(&self, kind: MessageKind, payload: Option<Value>) -> Result<(), BridgeError> {
        if self.shared.peer_gone.load(Ordering::Acquire) {
            return Err(BridgeError::NoPeer);
        }
        self.tx
            .send(Message::event(kind, payload))
            .map_err(|_| BridgeError::NoPeer)
    }

    /// Send a request and await the correlated response.
    pub async fn request(
        &self,
        kind: MessageKind,
        payload: Option<Value>,
    ) -> Result<Option<Value>, BridgeError> {
        if self.shared.peer_gone.load(Ordering::Acquire) {
            return Err(BridgeError::NoPeer);
        }
        let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, done_tx);

        if self.tx.send(Message::request(kind, payload, id)).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(BridgeError::NoPeer);
        }

        match tokio::time::timeout(self.config.request_timeout, done_rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(message))) => Err(BridgeError::Handler(message)),
            // Sender dropped without a response: peer torn down.
            Ok(Err(_)) => Err(BridgeError::PeerGone),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(BridgeError::PeerTimeout)
            }
        }
    }

    /// Register the handler for a message kind. Exactly one handler exists
    /// per kind; a second registration replaces the first.
    pub async fn on<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(Option<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let previous = self.shared.handlers.write().await.insert(kind, handler);
        if previous.is_some() {
            debug!(side = self.label, kind = %kind, "replacing message handler");
        }
    }

    /// Remove all registered handlers.
    pub async fn clear_handlers(&self) {
        self.shared.handlers.write().await.clear();
    }

    /// Tear down the connection. Pending requests on both sides fail with
    /// `PeerGone`; handlers on both sides are cleared.
    pub fn close(&self) {
        // Each router tears down its own side's state, so both must be
        // woken: a request the peer made before this close lives in the
        // peer's pending map. notify_one stores a permit, so a router sees
        // the close even if it is mid-dispatch rather than parked on the
        // Notify.
        self.shared.closed.notify_one();
        self.peer_shared.closed.notify_one();
    }

    /// True once the peer has detached.
    pub fn peer_gone(&self) -> bool {
        self.shared.peer_gone.load(Ordering::Acquire)
    }
}

async fn router_task(
    label: &'static str,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
) {
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = shared.closed.notified() => break,
        };

        if msg.reply {
            route_response(label, &shared, msg).await;
            continue;
        }

        let handler = shared.handlers.read().await.get(&msg.kind).cloned();
        match handler {
            Some(handler) => {
                let result = handler(msg.payload.clone()).await;
                if msg.correlation_id.is_some() {
                    let response = match result {
                        Ok(payload) => Message::response_to(&msg, payload),
                        Err(message) => {
                            error!(side = label, kind = %msg.kind, %message, "request handler failed");
                            Message::error_response_to(&msg, message)
                        }
                    };
                    let _ = tx.send(response);
                } else if let Err(message) = result {
                    error!(side = label, kind = %msg.kind, %message, "message handler failed");
                }
            }
            None => {
                warn!(side = label, kind = %msg.kind, "no handler registered");
                if msg.correlation_id.is_some() {
                    let _ = tx.send(Message::error_response_to(
                        &msg,
                        format!("no handler for '{}'", msg.kind),
                    ));
                }
            }
        }
    }

    // Peer detached (or we were closed): fail every pending request by
    // dropping its sender, and clear the handler registry.
    shared.peer_gone.store(true, Ordering::Release);
    shared.pending.lock().await.clear();
    shared.handlers.write().await.clear();
    debug!(side = label, "bridge router stopped");
}

async fn route_response(label: &'static str, shared: &Shared, msg: Message) {
    let Some(id) = msg.correlation_id else {
        warn!(side = label, kind = %msg.kind, "response without correlation id");
        return;
    };
    let sender = shared.pending.lock().await.remove(&id);
    match sender {
        Some(sender) => {
            let result = match msg.error {
                Some(message) => Err(message),
                None => Ok(msg.payload),
            };
            let _ = sender.send(result);
        }
        None => trace!(side = label, id, "no pending request for response"),
    }
}
