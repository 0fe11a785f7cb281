//! Negotiation session
//!
//! One [`NegotiationSession`] drives one call attempt from media acquisition
//! to teardown. It owns the local tracks, the peer connection, the
//! single-slot buffer for a remote offer that arrives before the peer
//! connection exists, and the ordered queue of remote ICE candidates that
//! arrive before a remote description has been applied.
//!
//! The session lives behind an async mutex inside a [`SessionHandle`]. Long
//! suspensions (media acquisition, the initiate round trip, offer creation)
//! run without the lock and re-check `released` afterwards, so `end` and
//! remote hangups can always cut in and the late result is discarded.

use crate::identity::PeerId;
use crate::media::{
    CameraFacing, LocalStream, MediaConstraints, MediaError, MediaSource, MediaStream, RemoteTrack,
};
use crate::peer::{PeerConnectionFactory, PeerConnectionHandle, PeerError, PeerEvent};
use crate::service::CallConfig;
use crate::signaling::{CallSignal, SignalingAdapter, SignalingError};
use crate::sink::{MediaSinkBinder, SurfaceProvider};
use crate::types::{
    CallEvent, CallId, ConnectionState, EndReason, IceCandidate, IceConnectionState,
    MediaKind, Role, SessionDescription, SessionState,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Local media could not be acquired; fatal, not retried
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// Signaling failed; the attempt is aborted
    #[error("Signaling failed: {0}")]
    SignalingTransport(#[from] SignalingError),

    /// Offer/answer or ICE processing failed
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] PeerError),

    /// Message for a call other than the current one
    #[error("Call id mismatch: current {current}, received {received}")]
    CallIdMismatch {
        /// Current call
        current: CallId,
        /// Call id on the message
        received: CallId,
    },

    /// Operation not valid in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(SessionState),

    /// Video operation on an audio call
    #[error("Call has no video")]
    AudioOnly,

    /// No current call
    #[error("No active call")]
    NoActiveCall,

    /// Another call is in progress
    #[error("Another call is in progress")]
    Busy,

    /// The call ended while the operation was in flight
    #[error("Call was cancelled")]
    Cancelled,

    /// The remote peer declined
    #[error("Call was rejected by the remote peer")]
    Rejected,
}

/// Collaborators shared by every session of a service
#[derive(Clone)]
pub struct SessionContext {
    /// Signaling adapter
    pub signaling: SignalingAdapter,
    /// Peer connection capability
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// Media acquisition capability
    pub media: Arc<dyn MediaSource>,
    /// Playback surfaces
    pub surfaces: Arc<dyn SurfaceProvider>,
    /// UI event channel
    pub events: broadcast::Sender<CallEvent>,
    /// Service configuration
    pub config: Arc<CallConfig>,
}

#[derive(Debug, Clone)]
struct SessionStatus {
    call_id: Option<CallId>,
    state: SessionState,
    connection_state: ConnectionState,
    released: bool,
    closing: bool,
}

impl SessionStatus {
    /// Take the relay-assigned id unless the call is already on its way out
    fn claim_call_id(&mut self, call_id: &CallId) -> bool {
        if self.released || self.closing || self.call_id.is_some() {
            return false;
        }
        self.call_id = Some(call_id.clone());
        true
    }

    /// Mark a local hang-up and return the id the remote side knows
    fn begin_closing(&mut self) -> Option<CallId> {
        self.closing = true;
        self.call_id.clone()
    }
}

/// State machine for one call attempt
///
/// Methods take `&mut self` and are called with the [`SessionHandle`] lock
/// held.
pub struct NegotiationSession {
    this: Weak<Mutex<NegotiationSession>>,
    ctx: SessionContext,
    status: Arc<parking_lot::Mutex<SessionStatus>>,
    peer_id: PeerId,
    role: Role,
    local_stream: Option<LocalStream>,
    remote_stream: Option<MediaStream>,
    pending_remote_offer: Option<SessionDescription>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    peer: Option<Arc<dyn PeerConnectionHandle>>,
    remote_description_set: bool,
    ice_restarts: u32,
    ended_by_remote: Option<EndReason>,
    binder: Arc<MediaSinkBinder>,
    remote_binds: Option<watch::Sender<MediaStream>>,
    pump: Option<JoinHandle<()>>,
}

impl NegotiationSession {
    /// Check if a state transition is valid
    ///
    /// - **Responder**: Ringing → AcquiringMedia
    /// - **Setup**: AcquiringMedia → Negotiating → Connected
    /// - **Waiting for the offer**: Negotiating ⇄ AwaitingRemoteDescription
    /// - **Teardown**: any live state → Ended | Failed
    #[must_use]
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (Ringing, AcquiringMedia)
            | (AcquiringMedia, Negotiating)
            | (Negotiating, AwaitingRemoteDescription)
            | (AwaitingRemoteDescription, Negotiating)
            | (Negotiating, Connected) => true,
            (from, Ended | Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    fn call_id(&self) -> Option<CallId> {
        self.status.lock().call_id.clone()
    }

    fn state(&self) -> SessionState {
        self.status.lock().state
    }

    fn is_released(&self) -> bool {
        self.status.lock().released
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn transition(&mut self, new_state: SessionState) -> bool {
        let old_state = self.state();
        if old_state == new_state {
            return true;
        }
        if !Self::is_valid_transition(old_state, new_state) {
            tracing::warn!(
                call_id = ?self.call_id(),
                old_state = ?old_state,
                new_state = ?new_state,
                "Refusing invalid session state transition"
            );
            return false;
        }
        self.status.lock().state = new_state;
        tracing::debug!(
            call_id = ?self.call_id(),
            old_state = ?old_state,
            new_state = ?new_state,
            "Session state transition"
        );
        self.emit(CallEvent::SessionStateChanged {
            call_id: self.call_id(),
            old_state,
            new_state,
        });
        true
    }

    /// Take ownership of acquired tracks and create the peer connection
    async fn attach_media(&mut self, stream: LocalStream) -> Result<(), CallError> {
        tracing::debug!(
            call_id = ?self.call_id(),
            stream_id = %stream.id,
            tracks = stream.tracks.len(),
            "Local media acquired"
        );
        self.emit(CallEvent::LocalStream {
            call_id: self.call_id(),
            stream: stream.clone(),
        });
        self.spawn_bind_local(stream.clone());
        self.local_stream = Some(stream);
        self.transition(SessionState::Negotiating);

        let pc = self.create_peer().await?;
        if let Some(stream) = &self.local_stream {
            for track in &stream.tracks {
                pc.add_track(track).await?;
            }
        }
        Ok(())
    }

    async fn create_peer(&mut self) -> Result<Arc<dyn PeerConnectionHandle>, CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self.ctx.peers.create(&self.ctx.config.ice_servers, tx).await?;
        self.peer = Some(pc.clone());

        let this = self.this.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = this.upgrade() else {
                    break;
                };
                let mut session = shared.lock().await;
                if session.is_released() {
                    break;
                }
                session.handle_peer_event(event).await;
            }
        }));
        tracing::debug!(call_id = ?self.call_id(), "Peer connection created");
        Ok(pc)
    }

    /// Set the remote offer, drain queued candidates, answer
    async fn apply_remote_offer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        let pc = self.peer.clone().ok_or(PeerError::Closed)?;
        pc.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.drain_pending_candidates(false).await;

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        if let Some(call_id) = self.call_id() {
            self.ctx
                .signaling
                .send_answer(&call_id, answer, &self.peer_id)
                .await?;
        }
        tracing::debug!(call_id = ?self.call_id(), "Answer sent");
        Ok(())
    }

    /// Handle an inbound offer
    ///
    /// Without a peer connection the offer is buffered in a single slot:
    /// an identical retransmission is ignored, a different offer replaces
    /// the buffered one. With a peer connection it is applied immediately;
    /// an offer after a remote description is a renegotiation.
    pub async fn handle_remote_offer(&mut self, offer: SessionDescription, from: Option<PeerId>) {
        if let Some(from) = &from {
            if from != &self.peer_id {
                tracing::warn!(
                    call_id = ?self.call_id(),
                    expected = %self.peer_id,
                    from = %from,
                    "Offer from unexpected peer discarded"
                );
                return;
            }
        }

        if self.peer.is_none() {
            match &self.pending_remote_offer {
                Some(buffered) if buffered.sdp == offer.sdp => {
                    tracing::debug!(call_id = ?self.call_id(), "Duplicate offer ignored");
                }
                Some(_) => {
                    tracing::warn!(call_id = ?self.call_id(), "Buffered offer replaced by a newer one");
                    self.pending_remote_offer = Some(offer);
                }
                None => {
                    tracing::debug!(call_id = ?self.call_id(), state = ?self.state(), "Offer buffered until peer connection exists");
                    self.pending_remote_offer = Some(offer);
                }
            }
            return;
        }

        if self.remote_description_set {
            tracing::debug!(call_id = ?self.call_id(), "Renegotiation offer received");
        }
        if self.state() == SessionState::AwaitingRemoteDescription {
            self.transition(SessionState::Negotiating);
        }
        if let Err(e) = self.apply_remote_offer(offer).await {
            tracing::warn!(call_id = ?self.call_id(), error = %e, "Failed to apply remote offer");
        }
    }

    /// Handle an inbound answer; late or duplicate answers are logged only
    pub async fn handle_remote_answer(&mut self, answer: SessionDescription) {
        if self.role != Role::Initiator {
            tracing::warn!(call_id = ?self.call_id(), "Answer received by responder, ignoring");
            return;
        }
        let Some(pc) = self.peer.clone() else {
            tracing::warn!(call_id = ?self.call_id(), "Answer received without peer connection, ignoring");
            return;
        };
        match pc.set_remote_description(answer).await {
            Ok(()) => {
                self.remote_description_set = true;
                tracing::debug!(call_id = ?self.call_id(), "Remote answer applied");
                self.drain_pending_candidates(false).await;
            }
            Err(e) => {
                tracing::warn!(call_id = ?self.call_id(), error = %e, "Failed to apply remote answer");
            }
        }
    }

    /// Apply a remote candidate, or queue it until a remote description is set
    ///
    /// Earlier candidates still queued are retried first. Once connected a
    /// candidate that fails is discarded instead of re-queued.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let pc = match &self.peer {
            Some(pc) if self.remote_description_set => pc.clone(),
            _ => {
                self.pending_remote_candidates.push_back(candidate);
                tracing::trace!(
                    call_id = ?self.call_id(),
                    queued = self.pending_remote_candidates.len(),
                    "Remote candidate queued"
                );
                return;
            }
        };
        let connected = self.state() == SessionState::Connected;
        if !self.pending_remote_candidates.is_empty() {
            self.pending_remote_candidates.push_back(candidate);
            self.drain_pending_candidates(connected).await;
            return;
        }
        match pc.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {}
            Err(e) if connected => {
                tracing::warn!(call_id = ?self.call_id(), error = %e, "Remote candidate failed, discarded");
            }
            Err(e) => {
                tracing::warn!(call_id = ?self.call_id(), error = %e, "Remote candidate failed, re-queued");
                self.pending_remote_candidates.push_back(candidate);
            }
        }
    }

    /// Apply queued candidates in arrival order
    ///
    /// Failed candidates are re-queued, or discarded when
    /// `discard_failures` is set. Returns the number applied.
    pub async fn drain_pending_candidates(&mut self, discard_failures: bool) -> usize {
        let Some(pc) = self.peer.clone() else {
            return 0;
        };
        if !self.remote_description_set {
            return 0;
        }
        let mut applied = 0;
        let mut failed = VecDeque::new();
        while let Some(candidate) = self.pending_remote_candidates.pop_front() {
            match pc.add_ice_candidate(candidate.clone()).await {
                Ok(()) => applied += 1,
                Err(e) if discard_failures => {
                    tracing::warn!(call_id = ?self.call_id(), error = %e, "Queued candidate discarded");
                }
                Err(_) => failed.push_back(candidate),
            }
        }
        let requeued = failed.len();
        self.pending_remote_candidates = failed;
        if applied > 0 || requeued > 0 {
            tracing::debug!(call_id = ?self.call_id(), applied, requeued, "Drained pending candidates");
        }
        applied
    }

    /// Accumulate a remote track and hand the stream to playback
    pub fn handle_remote_track(&mut self, track: RemoteTrack, stream_ids: Vec<String>) {
        let call_id = self.call_id();
        let stream = self.remote_stream.get_or_insert_with(|| {
            let id = stream_ids.into_iter().next().unwrap_or_else(|| match &call_id {
                Some(call_id) => format!("remote-{call_id}"),
                None => "remote".to_string(),
            });
            MediaStream::new(id)
        });
        if !stream.add_track(track.clone()) {
            tracing::debug!(call_id = ?call_id, track_id = %track.id(), "Remote track already known");
            return;
        }
        track.set_enabled(true);
        let snapshot = stream.clone();
        tracing::debug!(
            call_id = ?call_id,
            track_id = %track.id(),
            kind = ?track.kind(),
            tracks = snapshot.tracks.len(),
            "Remote track added"
        );
        self.emit(CallEvent::RemoteStream {
            call_id,
            stream: snapshot.clone(),
        });
        self.spawn_bind_remote(snapshot);
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => match self.call_id() {
                Some(call_id) => {
                    if let Err(e) = self
                        .ctx
                        .signaling
                        .send_candidate(&call_id, candidate, &self.peer_id)
                        .await
                    {
                        tracing::warn!(call_id = %call_id, error = %e, "Failed to send local candidate");
                    }
                }
                None => self.pending_local_candidates.push(candidate),
            },
            PeerEvent::RemoteTrack { track, stream_ids } => {
                self.handle_remote_track(track, stream_ids);
            }
            PeerEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            PeerEvent::IceConnectionState(state) => {
                tracing::debug!(call_id = ?self.call_id(), ice_state = ?state, "ICE state changed");
                if state == IceConnectionState::Failed {
                    self.restart_ice().await;
                }
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) {
        self.status.lock().connection_state = state;
        self.emit(CallEvent::ConnectionStateChanged {
            call_id: self.call_id(),
            state,
        });
        match state {
            ConnectionState::Connected => {
                self.drain_pending_candidates(true).await;
                if self.state() == SessionState::Negotiating {
                    self.transition(SessionState::Connected);
                    tracing::info!(call_id = ?self.call_id(), "Call connected");
                }
            }
            ConnectionState::Disconnected => {
                tracing::warn!(call_id = ?self.call_id(), "Peer connection disconnected, waiting for ICE");
            }
            ConnectionState::Failed => {
                self.fail("Peer connection failed").await;
            }
            ConnectionState::Closed => {
                self.teardown(SessionState::Ended).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn restart_ice(&mut self) {
        if self.role != Role::Initiator {
            tracing::debug!(call_id = ?self.call_id(), "ICE failed, waiting for initiator restart offer");
            return;
        }
        if self.ice_restarts >= self.ctx.config.max_ice_restarts {
            tracing::warn!(
                call_id = ?self.call_id(),
                attempts = self.ice_restarts,
                "ICE restart budget exhausted"
            );
            return;
        }
        let (Some(pc), Some(call_id)) = (self.peer.clone(), self.call_id()) else {
            return;
        };
        self.ice_restarts += 1;
        tracing::info!(call_id = %call_id, attempt = self.ice_restarts, "Restarting ICE");
        let result = async {
            let offer = pc.create_offer(true).await?;
            pc.set_local_description(offer.clone()).await?;
            self.ctx
                .signaling
                .send_offer(&call_id, offer, &self.peer_id)
                .await?;
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(call_id = %call_id, error = %e, "ICE restart failed");
        }
    }

    async fn flush_local_candidates(&mut self) {
        let Some(call_id) = self.call_id() else {
            return;
        };
        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            if let Err(e) = self
                .ctx
                .signaling
                .send_candidate(&call_id, candidate, &self.peer_id)
                .await
            {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to send local candidate");
            }
        }
    }

    fn spawn_bind_local(&self, stream: LocalStream) {
        let binder = self.binder.clone();
        tokio::spawn(async move {
            if let Err(e) = binder.bind_local(&stream).await {
                tracing::warn!(error = %e, "Local preview not bound");
            }
        });
    }

    /// Remote binds run on one task, always ending with the latest stream
    fn spawn_bind_remote(&mut self, stream: MediaStream) {
        if let Some(binds) = &self.remote_binds {
            binds.send_replace(stream);
            return;
        }
        let (binds, mut latest) = watch::channel(stream);
        let binder = self.binder.clone();
        tokio::spawn(async move {
            loop {
                let stream = latest.borrow_and_update().clone();
                if let Err(e) = binder.bind_remote(&stream).await {
                    tracing::warn!(error = %e, "Remote media not bound");
                }
                if latest.changed().await.is_err() {
                    break;
                }
            }
        });
        self.remote_binds = Some(binds);
    }

    /// Report a failure once and tear down
    async fn fail(&mut self, error: impl std::fmt::Display) {
        if self.is_released() {
            return;
        }
        tracing::error!(call_id = ?self.call_id(), error = %error, "Call failed");
        self.emit(CallEvent::CallFailed {
            call_id: self.call_id(),
            error: error.to_string(),
        });
        self.teardown(SessionState::Failed).await;
    }

    /// Release everything exactly once
    ///
    /// Returns `false` if the session was already released.
    pub async fn teardown(&mut self, final_state: SessionState) -> bool {
        {
            let mut status = self.status.lock();
            if status.released {
                return false;
            }
            status.released = true;
        }
        let old_state = self.state();
        if !old_state.is_terminal() {
            self.status.lock().state = final_state;
            self.emit(CallEvent::SessionStateChanged {
                call_id: self.call_id(),
                old_state,
                new_state: final_state,
            });
        }

        let dropped_candidates = self.pending_remote_candidates.len();
        self.pending_remote_candidates.clear();
        self.pending_local_candidates.clear();
        self.pending_remote_offer = None;

        let stopped_tracks = self
            .local_stream
            .take()
            .map(|stream| stream.stop_all())
            .unwrap_or(0);
        if let Some(pc) = self.peer.take() {
            if let Err(e) = pc.close().await {
                tracing::warn!(call_id = ?self.call_id(), error = %e, "Peer connection close failed");
            }
        }
        if let Some(remote) = &self.remote_stream {
            for track in &remote.tracks {
                track.set_enabled(false);
            }
        }
        self.remote_binds = None;
        self.binder.release();

        tracing::info!(
            call_id = ?self.call_id(),
            old_state = ?old_state,
            final_state = ?final_state,
            stopped_tracks,
            dropped_candidates,
            "Call torn down"
        );
        self.emit(CallEvent::CallEnded {
            call_id: self.call_id(),
            final_state,
        });
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        true
    }
}

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one negotiation session
#[derive(Clone)]
pub struct SessionHandle {
    key: u64,
    role: Role,
    peer_id: PeerId,
    media_kind: MediaKind,
    ctx: SessionContext,
    status: Arc<parking_lot::Mutex<SessionStatus>>,
    inner: Arc<Mutex<NegotiationSession>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status.lock().clone();
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("peer_id", &self.peer_id)
            .field("call_id", &status.call_id)
            .field("state", &status.state)
            .finish()
    }
}

impl SessionHandle {
    fn new(
        ctx: SessionContext,
        role: Role,
        call_id: Option<CallId>,
        peer_id: PeerId,
        media_kind: MediaKind,
        state: SessionState,
    ) -> Self {
        let status = Arc::new(parking_lot::Mutex::new(SessionStatus {
            call_id,
            state,
            connection_state: ConnectionState::New,
            released: false,
            closing: false,
        }));
        let binder = Arc::new(MediaSinkBinder::new(ctx.surfaces.clone(), ctx.config.sink));
        let inner = Arc::new_cyclic(|this| {
            Mutex::new(NegotiationSession {
                this: this.clone(),
                ctx: ctx.clone(),
                status: status.clone(),
                peer_id: peer_id.clone(),
                role,
                local_stream: None,
                remote_stream: None,
                pending_remote_offer: None,
                pending_remote_candidates: VecDeque::new(),
                pending_local_candidates: Vec::new(),
                peer: None,
                remote_description_set: false,
                ice_restarts: 0,
                ended_by_remote: None,
                binder,
                remote_binds: None,
                pump: None,
            })
        });
        Self {
            key: NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed),
            role,
            peer_id,
            media_kind,
            ctx,
            status,
            inner,
        }
    }

    /// Outgoing call, waiting for [`start`](Self::start)
    pub fn initiator(ctx: SessionContext, peer_id: PeerId, media_kind: MediaKind) -> Self {
        Self::new(
            ctx,
            Role::Initiator,
            None,
            peer_id,
            media_kind,
            SessionState::AcquiringMedia,
        )
    }

    /// Incoming call in `Ringing`
    pub fn responder(ctx: SessionContext, call_id: CallId, peer_id: PeerId, media_kind: MediaKind) -> Self {
        Self::new(
            ctx,
            Role::Responder,
            Some(call_id),
            peer_id,
            media_kind,
            SessionState::Ringing,
        )
    }

    /// Unique key of this session
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Initiator or responder
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote participant
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Audio or video
    #[must_use]
    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    /// Relay-assigned call id, once known
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.status.lock().call_id.clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    /// Last reported peer connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.status.lock().connection_state
    }

    /// Whether teardown has run
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.status.lock().released
    }

    /// Whether a new call id may replace this session
    #[must_use]
    pub fn is_supersedable(&self) -> bool {
        let status = self.status.lock();
        status.released || status.state.is_terminal() || status.connection_state.is_terminal_adjacent()
    }

    /// Acquire media and create the peer connection; returns with the lock
    /// held so the caller's next step cannot interleave with inbound signals
    async fn acquire_media(&self) -> Result<MutexGuard<'_, NegotiationSession>, CallError> {
        let constraints = MediaConstraints::for_kind(self.media_kind);
        let acquired = self.ctx.media.acquire(&constraints).await;

        let mut session = self.inner.lock().await;
        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) if session.is_released() => {
                tracing::debug!(error = %e, "Media acquisition failed after call ended");
                return Err(CallError::Cancelled);
            }
            Err(e) => {
                session.fail(&e).await;
                return Err(e.into());
            }
        };
        if session.is_released() {
            let stopped = stream.stop_all();
            tracing::debug!(stopped, "Call ended during media acquisition, tracks discarded");
            return Err(session.cancel_reason());
        }
        if let Err(e) = session.attach_media(stream).await {
            session.fail(&e).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Place the call: acquire media, create the peer connection, ask the
    /// relay for a call id, then send the offer
    ///
    /// Fatal errors tear the session down before they are returned.
    ///
    /// # Errors
    ///
    /// Returns error if media, signaling or offer creation fail, or the call
    /// ends before the offer is sent
    #[tracing::instrument(skip(self), fields(peer = %self.peer_id, kind = %self.media_kind))]
    pub async fn start(&self) -> Result<CallId, CallError> {
        {
            let session = self.inner.lock().await;
            if self.role != Role::Initiator || session.local_stream.is_some() || session.peer.is_some() {
                return Err(CallError::InvalidState(session.state()));
            }
            if session.is_released() {
                return Err(session.cancel_reason());
            }
        }
        drop(self.acquire_media().await?);

        // The id lands on the session before any signal for it is routed
        let status = self.status.clone();
        let initiated = self
            .ctx
            .signaling
            .initiate_with_claim(
                &self.peer_id,
                self.media_kind,
                &self.ctx.config.caller_info,
                move |call_id| {
                    if status.lock().claim_call_id(call_id) {
                        tracing::debug!(call_id = %call_id, "Call id assigned");
                    }
                },
            )
            .await;
        let call_id = match initiated {
            Ok(call_id) => call_id,
            Err(e) => {
                let mut session = self.inner.lock().await;
                if session.is_released() {
                    return Err(session.cancel_reason());
                }
                session.fail(&e).await;
                return Err(e.into());
            }
        };

        let pc = {
            let mut session = self.inner.lock().await;
            let assigned = self.call_id().as_ref() == Some(&call_id);
            if session.is_released() {
                if !assigned {
                    // Ended locally before the relay answered
                    if let Err(e) = self.ctx.signaling.end(&call_id).await {
                        tracing::debug!(call_id = %call_id, error = %e, "Could not end abandoned call");
                    }
                }
                return Err(session.cancel_reason());
            }
            if !assigned {
                let current = self.call_id().unwrap_or_else(|| call_id.clone());
                let error = CallError::CallIdMismatch {
                    current,
                    received: call_id,
                };
                session.fail(&error).await;
                return Err(error);
            }
            session.emit(CallEvent::CallInitiated {
                call_id: call_id.clone(),
                callee: self.peer_id.clone(),
                media_kind: self.media_kind,
            });
            session.flush_local_candidates().await;
            session.peer.clone().ok_or(CallError::Negotiation(PeerError::Closed))?
        };

        let offer = pc.create_offer(false).await;

        let mut session = self.inner.lock().await;
        if session.is_released() {
            tracing::debug!(call_id = %call_id, "Call ended before the offer was sent");
            return Err(session.cancel_reason());
        }
        let sent = async {
            let offer = offer?;
            pc.set_local_description(offer.clone()).await?;
            self.ctx
                .signaling
                .send_offer(&call_id, offer, &self.peer_id)
                .await?;
            Ok::<(), CallError>(())
        }
        .await;
        if let Err(e) = sent {
            session.fail(&e).await;
            return Err(e);
        }
        tracing::info!(call_id = %call_id, "Offer sent");
        Ok(call_id)
    }

    /// Answer a ringing call
    ///
    /// A buffered offer is answered immediately, otherwise the session waits
    /// in `AwaitingRemoteDescription`.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not ringing or media, signaling or
    /// negotiation fail
    #[tracing::instrument(skip(self), fields(call_id = ?self.call_id(), peer = %self.peer_id))]
    pub async fn answer(&self) -> Result<(), CallError> {
        {
            let mut session = self.inner.lock().await;
            if session.is_released() {
                return Err(session.cancel_reason());
            }
            if self.role != Role::Responder || session.state() != SessionState::Ringing {
                return Err(CallError::InvalidState(session.state()));
            }
            session.transition(SessionState::AcquiringMedia);
        }

        let mut session = self.acquire_media().await?;
        let call_id = self.call_id().ok_or(CallError::NoActiveCall)?;
        if let Err(e) = self.ctx.signaling.accept(&call_id).await {
            session.fail(&e).await;
            return Err(e.into());
        }

        match session.pending_remote_offer.take() {
            Some(offer) => {
                tracing::debug!(
                    call_id = %call_id,
                    queued_candidates = session.pending_remote_candidates.len(),
                    "Answering buffered offer"
                );
                if let Err(e) = session.apply_remote_offer(offer).await {
                    session.fail(&e).await;
                    return Err(e);
                }
            }
            None => {
                session.transition(SessionState::AwaitingRemoteDescription);
            }
        }
        Ok(())
    }

    /// Hang up: best-effort `call:end`, then release everything
    pub async fn end(&self) {
        let mut session = self.inner.lock().await;
        if session.is_released() {
            return;
        }
        let known = self.status.lock().begin_closing();
        if let Some(call_id) = known {
            if let Err(e) = self.ctx.signaling.end(&call_id).await {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to send call:end");
            }
        }
        session.teardown(SessionState::Ended).await;
    }

    /// Decline: best-effort `call:reject`, then release everything
    pub async fn reject(&self) {
        let mut session = self.inner.lock().await;
        if session.is_released() {
            return;
        }
        let known = self.status.lock().begin_closing();
        if let Some(call_id) = known {
            if let Err(e) = self.ctx.signaling.reject(&call_id).await {
                tracing::warn!(call_id = %call_id, error = %e, "Failed to send call:reject");
            }
        }
        session.teardown(SessionState::Ended).await;
    }

    /// Tear down without notifying the remote side
    pub async fn terminate(&self, final_state: SessionState) -> bool {
        self.inner.lock().await.teardown(final_state).await
    }

    /// Apply an inbound call signal routed to this session
    pub async fn handle_signal(&self, signal: CallSignal) {
        let mut session = self.inner.lock().await;
        if session.is_released() {
            tracing::debug!(call_id = %signal.call_id(), "Signal for released session ignored");
            return;
        }
        match signal {
            CallSignal::Accepted { call_id } => {
                if self.role == Role::Initiator {
                    tracing::info!(call_id = %call_id, "Call accepted by remote");
                    session.emit(CallEvent::CallAccepted { call_id });
                }
            }
            CallSignal::Rejected { call_id } => {
                session.ended_by_remote = Some(EndReason::Rejected);
                session.emit(CallEvent::EndedByRemote {
                    call_id,
                    reason: EndReason::Rejected,
                });
                session.teardown(SessionState::Ended).await;
            }
            CallSignal::Ended { call_id } => {
                session.ended_by_remote = Some(EndReason::Ended);
                session.emit(CallEvent::EndedByRemote {
                    call_id,
                    reason: EndReason::Ended,
                });
                session.teardown(SessionState::Ended).await;
            }
            CallSignal::Offer { offer, from, .. } => session.handle_remote_offer(offer, from).await,
            CallSignal::Answer { answer, .. } => session.handle_remote_answer(answer).await,
            CallSignal::IceCandidate { candidate, .. } => {
                session.handle_remote_candidate(candidate).await;
            }
            CallSignal::Incoming { .. } | CallSignal::Initiated { .. } => {
                tracing::debug!("Lifecycle signal not handled by session");
            }
        }
    }

    /// Flip local audio; returns `true` when muted
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let session = self.inner.lock().await;
        let stream = session
            .local_stream
            .as_ref()
            .ok_or(CallError::InvalidState(session.state()))?;
        let mut muted = false;
        for track in stream.audio_tracks() {
            track.set_enabled(!track.is_enabled());
            muted = !track.is_enabled();
        }
        tracing::debug!(call_id = ?self.call_id(), muted, "Microphone toggled");
        Ok(muted)
    }

    /// Flip local video; returns `true` when video is on
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        if !self.media_kind.has_video() {
            return Err(CallError::AudioOnly);
        }
        let session = self.inner.lock().await;
        let stream = session
            .local_stream
            .as_ref()
            .ok_or(CallError::InvalidState(session.state()))?;
        let mut enabled = false;
        for track in stream.video_tracks() {
            track.set_enabled(!track.is_enabled());
            enabled = track.is_enabled();
        }
        tracing::debug!(call_id = ?self.call_id(), enabled, "Camera toggled");
        Ok(enabled)
    }

    /// Switch to the other camera; returns the new facing mode
    ///
    /// # Errors
    ///
    /// Returns error on audio calls, before media is attached, or if the
    /// new camera cannot be acquired or swapped in
    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        if !self.media_kind.has_video() {
            return Err(CallError::AudioOnly);
        }
        let (old_track, facing) = {
            let session = self.inner.lock().await;
            let old = session
                .local_stream
                .as_ref()
                .and_then(|s| s.video_tracks().next().cloned())
                .ok_or(CallError::InvalidState(session.state()))?;
            let facing = old.facing().unwrap_or(CameraFacing::User).flipped();
            (old, facing)
        };

        let mut stream = self.ctx.media.acquire(&MediaConstraints::camera(facing)).await?;
        let Some(new_track) = stream.video_tracks().next().cloned() else {
            stream.stop_all();
            return Err(MediaError::DeviceNotFound(format!("{facing:?} camera")).into());
        };
        // Only the camera track is kept
        stream.tracks.retain(|t| t.id() != new_track.id());
        stream.stop_all();

        let mut session = self.inner.lock().await;
        if session.is_released() {
            new_track.stop();
            return Err(CallError::Cancelled);
        }
        let Some(pc) = session.peer.clone() else {
            new_track.stop();
            return Err(CallError::InvalidState(session.state()));
        };
        if let Err(e) = pc.replace_track(old_track.id(), &new_track).await {
            new_track.stop();
            return Err(e.into());
        }
        new_track.set_enabled(old_track.is_enabled());
        let preview = session.local_stream.as_mut().map(|local| {
            local.replace_track(old_track.id(), new_track.clone());
            local.clone()
        });
        old_track.stop();
        if let Some(preview) = preview {
            session.spawn_bind_local(preview);
        }
        tracing::info!(call_id = ?self.call_id(), facing = ?facing, "Camera switched");
        Ok(facing)
    }

    /// Number of queued remote candidates
    pub async fn pending_candidates(&self) -> usize {
        self.inner.lock().await.pending_remote_candidates.len()
    }

    /// Whether an offer is buffered
    pub async fn has_pending_offer(&self) -> bool {
        self.inner.lock().await.pending_remote_offer.is_some()
    }

    /// Local tracks, if acquired
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.inner.lock().await.local_stream.clone()
    }

    /// Remote tracks received so far
    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.lock().await.remote_stream.clone()
    }
}

impl NegotiationSession {
    fn cancel_reason(&self) -> CallError {
        match self.ended_by_remote {
            Some(EndReason::Rejected) => CallError::Rejected,
            _ => CallError::Cancelled,
        }
    }
}
