//! Call signaling
//!
//! Raw relay events (`call:*` event name plus a JSON payload) are decoded at
//! the transport boundary into the closed [`CallSignal`] type. The
//! [`SignalingAdapter`] owns listener registration on the transport,
//! correlates `call:initiate` requests with their `call:initiated` /
//! `call:error` responses and fans inbound signals out to subscribers.
//!
//! # Reconnect contract
//!
//! A transport that reconnects starts with an empty listener table. It must
//! call [`ConnectionObserver::on_reconnected`] and wait for it before
//! dispatching any inbound event. The adapter's observer re-registers every
//! listener first and only then announces the user online, so an offer sent
//! right after the handshake always reaches a handler.

use crate::identity::PeerId;
use crate::types::{CallId, CallerInfo, IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport is not connected
    #[error("Signaling transport not connected")]
    NotConnected,

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay refused the request (`call:error`)
    #[error("Relay rejected request: {0}")]
    Rejected(String),

    /// Connection lost before the relay answered
    #[error("Signaling connection lost")]
    Disconnected,

    /// Peer identity cannot be addressed
    #[error("Invalid peer identity: {0:?}")]
    InvalidPeer(String),

    /// Payload does not match the event
    #[error("Malformed {event} payload: {reason}")]
    Decode {
        /// Event name
        event: String,
        /// Decoder message
        reason: String,
    },
}

/// Relay event names
pub mod events {
    /// Caller asks the relay to ring a peer
    pub const INITIATE: &str = "call:initiate";
    /// Relay assigned a call id
    pub const INITIATED: &str = "call:initiated";
    /// Relay refused `call:initiate`
    pub const ERROR: &str = "call:error";
    /// Relay notifies the callee
    pub const INCOMING: &str = "call:incoming";
    /// Callee accepts
    pub const ACCEPT: &str = "call:accept";
    /// Callee declines
    pub const REJECT: &str = "call:reject";
    /// Either side hangs up
    pub const END: &str = "call:end";
    /// Relay broadcast: accepted
    pub const ACCEPTED: &str = "call:accepted";
    /// Relay broadcast: declined
    pub const REJECTED: &str = "call:rejected";
    /// Relay broadcast: hung up
    pub const ENDED: &str = "call:ended";
    /// SDP offer
    pub const OFFER: &str = "call:offer";
    /// SDP answer
    pub const ANSWER: &str = "call:answer";
    /// Trickled ICE candidate
    pub const ICE_CANDIDATE: &str = "call:ice-candidate";
    /// Presence handshake after every (re)connect
    pub const USER_ONLINE: &str = "user:online";

    /// Events the adapter listens for
    pub const INBOUND: [&str; 9] = [
        INITIATED,
        ERROR,
        INCOMING,
        ACCEPTED,
        REJECTED,
        ENDED,
        OFFER,
        ANSWER,
        ICE_CANDIDATE,
    ];
}

/// `call:initiate` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePayload {
    /// Callee
    pub to_peer_id: PeerId,
    /// Audio or video
    pub call_type: MediaKind,
    /// Caller metadata shown to the callee
    #[serde(default)]
    pub caller_info: CallerInfo,
}

/// `call:initiated` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayload {
    /// Assigned call id
    pub call_id: CallId,
}

/// `call:error` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Relay error message
    pub error: String,
}

/// `call:incoming` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayload {
    /// Call id
    pub call_id: CallId,
    /// Caller
    pub caller_id: PeerId,
    /// Audio or video
    pub call_type: MediaKind,
    /// Caller metadata
    #[serde(default)]
    pub caller_info: CallerInfo,
}

/// Payload of the call-control events (`accept`, `reject`, `end` and their
/// relay broadcasts)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIdPayload {
    /// Call id
    pub call_id: CallId,
    /// Sender, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<PeerId>,
}

/// `call:offer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// Call id
    pub call_id: CallId,
    /// Offer description
    pub offer: SessionDescription,
    /// Recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<PeerId>,
    /// Sender, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<PeerId>,
}

/// `call:answer` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// Call id
    pub call_id: CallId,
    /// Answer description
    pub answer: SessionDescription,
    /// Recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<PeerId>,
    /// Sender, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<PeerId>,
}

/// `call:ice-candidate` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// Call id
    pub call_id: CallId,
    /// Candidate
    pub candidate: IceCandidate,
    /// Recipient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<PeerId>,
    /// Sender, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<PeerId>,
}

/// `user:online` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlinePayload {
    /// Local user
    pub user_id: PeerId,
}

/// Inbound call signal, decoded from a relay event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    /// Somebody is calling us
    Incoming {
        /// Call id
        call_id: CallId,
        /// Caller
        from: PeerId,
        /// Audio or video
        media_kind: MediaKind,
        /// Caller metadata
        caller_info: CallerInfo,
    },
    /// A `call:initiated` nobody was waiting for any more
    Initiated {
        /// Orphaned call id
        call_id: CallId,
    },
    /// Callee accepted
    Accepted {
        /// Call id
        call_id: CallId,
    },
    /// Callee declined
    Rejected {
        /// Call id
        call_id: CallId,
    },
    /// Remote hung up
    Ended {
        /// Call id
        call_id: CallId,
    },
    /// Remote offer
    Offer {
        /// Call id
        call_id: CallId,
        /// Offer description
        offer: SessionDescription,
        /// Sender
        from: Option<PeerId>,
    },
    /// Remote answer
    Answer {
        /// Call id
        call_id: CallId,
        /// Answer description
        answer: SessionDescription,
        /// Sender
        from: Option<PeerId>,
    },
    /// Remote ICE candidate
    IceCandidate {
        /// Call id
        call_id: CallId,
        /// Candidate
        candidate: IceCandidate,
        /// Sender
        from: Option<PeerId>,
    },
}

impl CallSignal {
    /// Decode a relay event
    ///
    /// # Errors
    ///
    /// Returns error if the event is not a call signal or the payload does
    /// not match it
    pub fn decode(event: &str, payload: Value) -> Result<Self, SignalingError> {
        let signal = match event {
            events::INCOMING => {
                let p: IncomingPayload = parse(event, payload)?;
                Self::Incoming {
                    call_id: p.call_id,
                    from: p.caller_id,
                    media_kind: p.call_type,
                    caller_info: p.caller_info,
                }
            }
            events::INITIATED => Self::Initiated {
                call_id: parse::<InitiatedPayload>(event, payload)?.call_id,
            },
            events::ACCEPTED => Self::Accepted {
                call_id: parse::<CallIdPayload>(event, payload)?.call_id,
            },
            events::REJECTED => Self::Rejected {
                call_id: parse::<CallIdPayload>(event, payload)?.call_id,
            },
            events::ENDED => Self::Ended {
                call_id: parse::<CallIdPayload>(event, payload)?.call_id,
            },
            events::OFFER => {
                let p: OfferPayload = parse(event, payload)?;
                Self::Offer {
                    call_id: p.call_id,
                    offer: p.offer,
                    from: p.from_user_id,
                }
            }
            events::ANSWER => {
                let p: AnswerPayload = parse(event, payload)?;
                Self::Answer {
                    call_id: p.call_id,
                    answer: p.answer,
                    from: p.from_user_id,
                }
            }
            events::ICE_CANDIDATE => {
                let p: CandidatePayload = parse(event, payload)?;
                Self::IceCandidate {
                    call_id: p.call_id,
                    candidate: p.candidate,
                    from: p.from_user_id,
                }
            }
            other => {
                return Err(SignalingError::Decode {
                    event: other.to_string(),
                    reason: "not a call signal".to_string(),
                })
            }
        };
        Ok(signal)
    }

    /// Call id the signal refers to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Incoming { call_id, .. }
            | Self::Initiated { call_id }
            | Self::Accepted { call_id }
            | Self::Rejected { call_id }
            | Self::Ended { call_id }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. } => call_id,
        }
    }

    /// Whether the signal is part of SDP/ICE negotiation
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. } | Self::Answer { .. } | Self::IceCandidate { .. }
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Incoming { .. } => "incoming",
            Self::Initiated { .. } => "initiated",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Ended { .. } => "ended",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, payload: Value) -> Result<T, SignalingError> {
    serde_json::from_value(payload).map_err(|e| SignalingError::Decode {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

/// Transport-level listener handle
pub type ListenerId = u64;

/// Raw event handler registered on a transport
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Connection lifecycle callbacks from a transport
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// The transport reconnected with an empty listener table
    ///
    /// Transports hold inbound dispatch until this returns.
    async fn on_reconnected(&self);

    /// The transport lost its connection
    fn on_disconnected(&self) {}
}

/// Bidirectional per-user relay connection
///
/// At-least-once delivery, ordered per connection, no guarantee across a
/// reconnect.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the connection
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Send an event to the relay
    async fn emit(&self, event: &str, payload: Value) -> Result<(), SignalingError>;

    /// Register a handler for an inbound event
    fn on(&self, event: &str, handler: EventHandler) -> ListenerId;

    /// Remove a handler; unknown ids are ignored
    fn off(&self, id: ListenerId);

    /// Install the connection observer
    fn set_observer(&self, observer: Arc<dyn ConnectionObserver>);

    /// Whether the connection is currently up
    fn is_connected(&self) -> bool;
}

/// Typed handler for inbound call signals
pub type StatusHandler = Arc<dyn Fn(CallSignal) + Send + Sync>;

/// Runs on the transport's dispatch path when `call:initiated` arrives,
/// before any later signal reaches subscribers
pub type InitiateClaim = Box<dyn FnOnce(&CallId) + Send>;

struct PendingInitiate {
    id: u64,
    tx: oneshot::Sender<Result<CallId, SignalingError>>,
    claim: Option<InitiateClaim>,
}

struct AdapterInner {
    transport: Arc<dyn SignalingTransport>,
    local: PeerId,
    handlers: Mutex<Vec<(u64, StatusHandler)>>,
    listeners: Mutex<Vec<ListenerId>>,
    pending_initiates: Mutex<VecDeque<PendingInitiate>>,
    next_id: AtomicU64,
}

impl AdapterInner {
    fn register_listeners(self: &Arc<Self>) {
        let stale: Vec<ListenerId> = std::mem::take(&mut *self.listeners.lock());
        for id in stale {
            self.transport.off(id);
        }

        let mut ids = Vec::with_capacity(events::INBOUND.len());
        for event in events::INBOUND {
            let weak = Arc::downgrade(self);
            let handler: EventHandler = Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(event, payload);
                }
            });
            ids.push(self.transport.on(event, handler));
        }
        *self.listeners.lock() = ids;
        tracing::debug!(user = %self.local, count = events::INBOUND.len(), "Signaling listeners registered");
    }

    fn dispatch(&self, event: &str, payload: Value) {
        match event {
            events::INITIATED => match parse::<InitiatedPayload>(event, payload) {
                Ok(p) => self.resolve_initiate(Ok(p.call_id)),
                Err(e) => tracing::warn!(error = %e, "Dropping malformed call:initiated"),
            },
            events::ERROR => {
                let message = parse::<ErrorPayload>(event, payload)
                    .map(|p| p.error)
                    .unwrap_or_else(|e| e.to_string());
                self.resolve_initiate(Err(SignalingError::Rejected(message)));
            }
            _ => match CallSignal::decode(event, payload) {
                Ok(signal) => self.notify(signal),
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable signaling event"),
            },
        }
    }

    fn resolve_initiate(&self, result: Result<CallId, SignalingError>) {
        let pending = self.pending_initiates.lock().pop_front();
        let unclaimed = match pending {
            Some(pending) => {
                if let (Ok(call_id), Some(claim)) = (&result, pending.claim) {
                    claim(call_id);
                }
                pending.tx.send(result).err()
            }
            None => Some(result),
        };
        match unclaimed {
            Some(Ok(call_id)) => {
                tracing::debug!(call_id = %call_id, "call:initiated with no waiting request");
                self.notify(CallSignal::Initiated { call_id });
            }
            Some(Err(e)) => tracing::warn!(error = %e, "call:error with no waiting request"),
            None => {}
        }
    }

    fn notify(&self, signal: CallSignal) {
        let handlers: Vec<StatusHandler> = self.handlers.lock().iter().map(|(_, h)| h.clone()).collect();
        tracing::trace!(
            call_id = %signal.call_id(),
            signal = signal.kind(),
            handlers = handlers.len(),
            "Dispatching call signal"
        );
        for handler in handlers {
            handler(signal.clone());
        }
    }

    fn fail_pending(&self, error: &SignalingError) {
        let pending: Vec<PendingInitiate> = self.pending_initiates.lock().drain(..).collect();
        for p in pending {
            let _ = p.tx.send(Err(error.clone()));
        }
    }

    async fn emit<T: Serialize + Sync>(&self, event: &str, payload: &T) -> Result<(), SignalingError> {
        let value = serde_json::to_value(payload).map_err(|e| SignalingError::Decode {
            event: event.to_string(),
            reason: e.to_string(),
        })?;
        self.transport.emit(event, value).await
    }

    async fn announce_online(&self) -> Result<(), SignalingError> {
        self.emit(
            events::USER_ONLINE,
            &OnlinePayload {
                user_id: self.local.clone(),
            },
        )
        .await
    }
}

struct ReconnectObserver {
    inner: Weak<AdapterInner>,
}

#[async_trait]
impl ConnectionObserver for ReconnectObserver {
    async fn on_reconnected(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.register_listeners();
        match inner.announce_online().await {
            Ok(()) => tracing::info!(user = %inner.local, "Signaling reconnected"),
            Err(e) => tracing::warn!(user = %inner.local, error = %e, "Online handshake failed after reconnect"),
        }
    }

    fn on_disconnected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            tracing::warn!(user = %inner.local, "Signaling connection lost");
            inner.fail_pending(&SignalingError::Disconnected);
        }
    }
}

/// Handle returned by [`SignalingAdapter::on_status_change`]
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    id: u64,
    adapter: Weak<AdapterInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the handler. Returns `true` only for the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(inner) = self.adapter.upgrade() {
            inner.handlers.lock().retain(|(id, _)| *id != self.id);
        }
        true
    }

    /// Whether the handler is still registered
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Typed call-control API over a [`SignalingTransport`]
#[derive(Clone)]
pub struct SignalingAdapter {
    inner: Arc<AdapterInner>,
}

impl SignalingAdapter {
    /// Wrap a transport for the given local user
    pub fn new(transport: Arc<dyn SignalingTransport>, local: PeerId) -> Self {
        let inner = Arc::new(AdapterInner {
            transport,
            local,
            handlers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            pending_initiates: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        });
        inner.transport.set_observer(Arc::new(ReconnectObserver {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    /// Local user identity
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    /// Whether the transport is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Register listeners, connect and announce the user online
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect
    #[tracing::instrument(skip(self), fields(user = %self.inner.local))]
    pub async fn connect(&self) -> Result<(), SignalingError> {
        if !self.inner.local.is_valid() {
            return Err(SignalingError::InvalidPeer(self.inner.local.to_string()));
        }
        self.inner.register_listeners();
        self.inner.transport.connect().await?;
        self.inner.announce_online().await?;
        tracing::info!("Signaling connected");
        Ok(())
    }

    /// Ask the relay to ring `peer`; resolves with the assigned call id
    ///
    /// There is no implicit timeout. Dropping the future abandons the
    /// request; a late `call:initiated` is then reported to subscribers as
    /// [`CallSignal::Initiated`].
    ///
    /// # Errors
    ///
    /// Returns error if the relay answers `call:error`, the emit fails or
    /// the connection drops first
    #[tracing::instrument(skip(self, caller_info), fields(peer = %peer, kind = %media_kind))]
    pub async fn initiate(
        &self,
        peer: &PeerId,
        media_kind: MediaKind,
        caller_info: &CallerInfo,
    ) -> Result<CallId, SignalingError> {
        self.request_call(peer, media_kind, caller_info, None).await
    }

    /// Like [`initiate`](Self::initiate), but hands the call id to `claim`
    /// as soon as the relay assigns it, ahead of any signal for that call
    ///
    /// # Errors
    ///
    /// Same as [`initiate`](Self::initiate)
    #[tracing::instrument(skip(self, caller_info, claim), fields(peer = %peer, kind = %media_kind))]
    pub async fn initiate_with_claim<F>(
        &self,
        peer: &PeerId,
        media_kind: MediaKind,
        caller_info: &CallerInfo,
        claim: F,
    ) -> Result<CallId, SignalingError>
    where
        F: FnOnce(&CallId) + Send + 'static,
    {
        self.request_call(peer, media_kind, caller_info, Some(Box::new(claim)))
            .await
    }

    async fn request_call(
        &self,
        peer: &PeerId,
        media_kind: MediaKind,
        caller_info: &CallerInfo,
        claim: Option<InitiateClaim>,
    ) -> Result<CallId, SignalingError> {
        if !peer.is_valid() {
            return Err(SignalingError::InvalidPeer(peer.to_string()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_initiates
            .lock()
            .push_back(PendingInitiate { id, tx, claim });

        let payload = InitiatePayload {
            to_peer_id: peer.clone(),
            call_type: media_kind,
            caller_info: caller_info.clone(),
        };
        if let Err(e) = self.inner.emit(events::INITIATE, &payload).await {
            self.inner.pending_initiates.lock().retain(|p| p.id != id);
            return Err(e);
        }

        let call_id = rx.await.map_err(|_| SignalingError::Disconnected)??;
        tracing::debug!(call_id = %call_id, "Call initiated");
        Ok(call_id)
    }

    /// Accept an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn accept(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.control(events::ACCEPT, call_id).await
    }

    /// Decline an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn reject(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.control(events::REJECT, call_id).await
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn end(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.control(events::END, call_id).await
    }

    async fn control(&self, event: &str, call_id: &CallId) -> Result<(), SignalingError> {
        tracing::debug!(call_id = %call_id, event, "Sending call control");
        self.inner
            .emit(
                event,
                &CallIdPayload {
                    call_id: call_id.clone(),
                    from_user_id: None,
                },
            )
            .await
    }

    /// Send an SDP offer
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn send_offer(
        &self,
        call_id: &CallId,
        offer: SessionDescription,
        to: &PeerId,
    ) -> Result<(), SignalingError> {
        tracing::debug!(call_id = %call_id, to = %to, "Sending offer");
        self.inner
            .emit(
                events::OFFER,
                &OfferPayload {
                    call_id: call_id.clone(),
                    offer,
                    to_user_id: Some(to.clone()),
                    from_user_id: None,
                },
            )
            .await
    }

    /// Send an SDP answer
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn send_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
        to: &PeerId,
    ) -> Result<(), SignalingError> {
        tracing::debug!(call_id = %call_id, to = %to, "Sending answer");
        self.inner
            .emit(
                events::ANSWER,
                &AnswerPayload {
                    call_id: call_id.clone(),
                    answer,
                    to_user_id: Some(to.clone()),
                    from_user_id: None,
                },
            )
            .await
    }

    /// Send a local ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the emit fails
    pub async fn send_candidate(
        &self,
        call_id: &CallId,
        candidate: IceCandidate,
        to: &PeerId,
    ) -> Result<(), SignalingError> {
        tracing::trace!(call_id = %call_id, to = %to, "Sending ICE candidate");
        self.inner
            .emit(
                events::ICE_CANDIDATE,
                &CandidatePayload {
                    call_id: call_id.clone(),
                    candidate,
                    to_user_id: Some(to.clone()),
                    from_user_id: None,
                },
            )
            .await
    }

    /// Subscribe to inbound call signals
    ///
    /// The handler runs on the transport's dispatch path and must not block.
    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(CallSignal) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        Subscription {
            id,
            adapter: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe with an mpsc channel as the handler
    pub fn subscribe(&self) -> (Subscription, mpsc::UnboundedReceiver<CallSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on_status_change(move |signal| {
            let _ = tx.send(signal);
        });
        (subscription, rx)
    }
}
