//! In-process relay transport
//!
//! [`MemoryRelay`] plays the part of the signaling server: it addresses
//! messages by user identity, assigns call ids, fans call-control broadcasts
//! out to both participants and stamps relayed negotiation payloads with the
//! sender's identity. Each user talks to it through a [`MemoryTransport`].
//!
//! Disconnect and reconnect are simulated. A reconnected transport starts
//! with no listeners and holds inbound dispatch until its
//! [`ConnectionObserver`] has finished `on_reconnected`.

use crate::identity::PeerId;
use crate::signaling::{
    events, CallIdPayload, ConnectionObserver, EventHandler, InitiatePayload, ListenerId,
    SignalingError, SignalingTransport,
};
use crate::types::CallId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Maximum serialized payload size (64KB)
const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum call id length
const MAX_CALL_ID_LENGTH: usize = 256;

/// Error sent back on `call:error` when the callee has no live connection
pub const USER_OFFLINE: &str = "User is offline";

#[derive(Debug, Clone)]
struct RelayCall {
    caller: PeerId,
    callee: PeerId,
}

impl RelayCall {
    fn involves(&self, user: &PeerId) -> bool {
        &self.caller == user || &self.callee == user
    }

    fn other(&self, user: &PeerId) -> &PeerId {
        if &self.caller == user {
            &self.callee
        } else {
            &self.caller
        }
    }
}

#[derive(Default)]
struct RelayState {
    users: HashMap<PeerId, Weak<TransportInner>>,
    calls: HashMap<CallId, RelayCall>,
    history: Vec<(PeerId, String, Value)>,
}

/// In-process signaling relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport for `user`, replacing any previous one
    pub fn transport(&self, user: impl Into<PeerId>) -> MemoryTransport {
        let user = user.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TransportInner {
            user: user.clone(),
            relay: self.clone(),
            connected: AtomicBool::new(false),
            listeners: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            next_listener: AtomicU64::new(1),
            inbox: tx,
            inbox_rx: Mutex::new(Some(rx)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        });
        self.state.lock().users.insert(user, Arc::downgrade(&inner));
        MemoryTransport { inner }
    }

    /// Whether `user` has a live connection
    #[must_use]
    pub fn is_online(&self, user: &PeerId) -> bool {
        self.state
            .lock()
            .users
            .get(user)
            .and_then(Weak::upgrade)
            .is_some_and(|t| t.connected.load(Ordering::SeqCst))
    }

    /// Number of calls the relay considers open
    #[must_use]
    pub fn open_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Payloads of every `event` emitted by `from`, in order
    #[must_use]
    pub fn emitted(&self, from: &PeerId, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(user, e, _)| user == from && e == event)
            .map(|(_, _, v)| v.clone())
            .collect()
    }

    /// Deliver a raw event to `to` as if the relay had produced it
    pub fn inject(&self, to: &PeerId, event: &str, payload: Value) -> bool {
        self.deliver(&self.state.lock(), to, event, payload)
    }

    fn deliver(&self, state: &RelayState, to: &PeerId, event: &str, payload: Value) -> bool {
        let Some(target) = state.users.get(to).and_then(Weak::upgrade) else {
            tracing::debug!(to = %to, event, "Dropping event for unknown user");
            return false;
        };
        if !target.connected.load(Ordering::SeqCst) {
            tracing::debug!(to = %to, event, "Dropping event for disconnected user");
            return false;
        }
        target.inbox.send((event.to_string(), payload)).is_ok()
    }

    #[tracing::instrument(skip(self, payload), fields(from = %from))]
    fn route(&self, from: &PeerId, event: &str, mut payload: Value) -> Result<(), SignalingError> {
        validate_payload(event, &payload)?;

        let mut state = self.state.lock();
        state.history.push((from.clone(), event.to_string(), payload.clone()));

        match event {
            events::USER_ONLINE => {
                tracing::debug!("User online");
            }
            events::INITIATE => {
                let request: InitiatePayload =
                    serde_json::from_value(payload).map_err(|e| SignalingError::Decode {
                        event: event.to_string(),
                        reason: e.to_string(),
                    })?;
                let callee_online = state
                    .users
                    .get(&request.to_peer_id)
                    .and_then(Weak::upgrade)
                    .is_some_and(|t| t.connected.load(Ordering::SeqCst));
                if !callee_online || request.to_peer_id == *from {
                    tracing::info!(callee = %request.to_peer_id, "Initiate refused, callee offline");
                    self.deliver(&state, from, events::ERROR, json!({ "error": USER_OFFLINE }));
                    return Ok(());
                }

                let call_id = CallId::generate();
                state.calls.insert(
                    call_id.clone(),
                    RelayCall {
                        caller: from.clone(),
                        callee: request.to_peer_id.clone(),
                    },
                );
                tracing::info!(call_id = %call_id, callee = %request.to_peer_id, "Call opened");
                self.deliver(&state, from, events::INITIATED, json!({ "callId": call_id }));
                self.deliver(
                    &state,
                    &request.to_peer_id,
                    events::INCOMING,
                    json!({
                        "callId": call_id,
                        "callerId": from,
                        "callType": request.call_type,
                        "callerInfo": request.caller_info,
                    }),
                );
            }
            events::ACCEPT | events::REJECT | events::END => {
                let control: CallIdPayload =
                    serde_json::from_value(payload).map_err(|e| SignalingError::Decode {
                        event: event.to_string(),
                        reason: e.to_string(),
                    })?;
                let Some(call) = state.calls.get(&control.call_id).cloned() else {
                    tracing::debug!(call_id = %control.call_id, event, "Control for unknown call");
                    return Ok(());
                };
                if !call.involves(from) {
                    tracing::warn!(call_id = %control.call_id, event, "Control from non-participant");
                    return Ok(());
                }
                let broadcast = match event {
                    events::ACCEPT => events::ACCEPTED,
                    events::REJECT => events::REJECTED,
                    _ => events::ENDED,
                };
                if broadcast != events::ACCEPTED {
                    state.calls.remove(&control.call_id);
                }
                let body = json!({ "callId": control.call_id, "fromUserId": from });
                self.deliver(&state, &call.caller, broadcast, body.clone());
                self.deliver(&state, &call.callee, broadcast, body);
            }
            events::OFFER | events::ANSWER | events::ICE_CANDIDATE => {
                let explicit = payload
                    .get("toUserId")
                    .and_then(Value::as_str)
                    .map(PeerId::from);
                let to = match explicit {
                    Some(to) => to,
                    None => {
                        let call = payload
                            .get("callId")
                            .and_then(Value::as_str)
                            .and_then(|id| state.calls.get(&CallId::from(id)));
                        match call {
                            Some(call) => call.other(from).clone(),
                            None => {
                                tracing::debug!(event, "No recipient for negotiation message");
                                return Ok(());
                            }
                        }
                    }
                };
                if let Some(object) = payload.as_object_mut() {
                    object.remove("toUserId");
                    object.insert("fromUserId".to_string(), json!(from));
                }
                self.deliver(&state, &to, event, payload);
            }
            other => {
                tracing::debug!(event = other, "Ignoring unknown event");
            }
        }
        Ok(())
    }
}

fn validate_payload(event: &str, payload: &Value) -> Result<(), SignalingError> {
    let size = payload.to_string().len();
    if size > MAX_SIGNALING_MESSAGE_SIZE {
        return Err(SignalingError::Transport(format!(
            "{event} payload size {size} exceeds maximum of {MAX_SIGNALING_MESSAGE_SIZE} bytes"
        )));
    }
    if let Some(call_id) = payload.get("callId").and_then(Value::as_str) {
        if call_id.is_empty() || call_id.len() > MAX_CALL_ID_LENGTH {
            return Err(SignalingError::Transport(format!(
                "{event} call id length {} out of range",
                call_id.len()
            )));
        }
    }
    Ok(())
}

struct TransportInner {
    user: PeerId,
    relay: MemoryRelay,
    connected: AtomicBool,
    listeners: Mutex<HashMap<ListenerId, (String, EventHandler)>>,
    observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
    next_listener: AtomicU64,
    inbox: mpsc::UnboundedSender<(String, Value)>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, Value)>>>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl TransportInner {
    fn dispatch(&self, event: &str, payload: Value) {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!(user = %self.user, event, "Dropping inbound event while disconnected");
            return;
        }
        let handlers: Vec<EventHandler> = self
            .listeners
            .lock()
            .values()
            .filter(|(e, _)| e == event)
            .map(|(_, h)| h.clone())
            .collect();
        if handlers.is_empty() {
            tracing::debug!(user = %self.user, event, "No listener for inbound event");
        }
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

/// One user's connection to a [`MemoryRelay`]
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<TransportInner>,
}

impl MemoryTransport {
    /// User this transport belongs to
    #[must_use]
    pub fn user(&self) -> &PeerId {
        &self.inner.user
    }

    /// Drop the connection; messages addressed to this user are lost until
    /// [`reconnect`](Self::reconnect)
    pub fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            tracing::info!(user = %self.inner.user, "Transport disconnected");
            let observer = self.inner.observer.lock().clone();
            if let Some(observer) = observer {
                observer.on_disconnected();
            }
        }
    }

    /// Re-establish the connection as a fresh one
    ///
    /// All listeners are dropped. Inbound dispatch resumes only after the
    /// observer's `on_reconnected` has completed.
    pub async fn reconnect(&self) {
        let _gate = self.inner.gate.lock().await;
        self.inner.listeners.lock().clear();
        self.inner.connected.store(true, Ordering::SeqCst);
        tracing::info!(user = %self.inner.user, "Transport reconnected");
        let observer = self.inner.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_reconnected().await;
        }
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        let rx = self.inner.inbox_rx.lock().take();
        if let Some(mut rx) = rx {
            let weak = Arc::downgrade(&self.inner);
            let gate = self.inner.gate.clone();
            tokio::spawn(async move {
                while let Some((event, payload)) = rx.recv().await {
                    let _gate = gate.lock().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.dispatch(&event, payload);
                }
            });
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        tracing::debug!(user = %self.inner.user, "Transport connected");
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.inner.relay.route(&self.inner.user, event, payload)
    }

    fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .insert(id, (event.to_string(), handler));
        id
    }

    fn off(&self, id: ListenerId) {
        self.inner.listeners.lock().remove(&id);
    }

    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
