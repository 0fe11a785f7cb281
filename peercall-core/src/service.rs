//! Call service orchestration
//!
//! [`CallService`] wires the signaling adapter, the registry and the
//! capability providers together. Inbound signals are processed one at a
//! time by a control loop so that routing decisions never interleave.

use crate::identity::PeerId;
use crate::media::{CameraFacing, MediaSource};
use crate::peer::PeerConnectionFactory;
use crate::registry::{Admission, CallRegistry, Route};
use crate::session::{CallError, SessionContext, SessionHandle};
use crate::signaling::{CallSignal, SignalingAdapter, SignalingTransport, Subscription};
use crate::sink::{HeadlessSurfaces, SinkConfig, SurfaceProvider};
use crate::types::{
    CallEvent, CallId, CallerInfo, ConnectionState, IceServer, MediaKind, Role, SessionState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Identity of the local user on the signaling channel
    pub local_peer: PeerId,
    /// Metadata sent with outgoing calls
    pub caller_info: CallerInfo,
    /// STUN/TURN servers for peer connections
    pub ice_servers: Vec<IceServer>,
    /// Playback surface lookup
    pub sink: SinkConfig,
    /// ICE restarts attempted by the initiator per call
    pub max_ice_restarts: u32,
    /// Capacity of the UI event channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            local_peer: PeerId::new(""),
            caller_info: CallerInfo::default(),
            ice_servers: vec![IceServer::default()],
            sink: SinkConfig::default(),
            max_ice_restarts: 3,
            event_capacity: 256,
        }
    }
}

/// Point-in-time view of the current call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    /// Call id, once assigned
    pub call_id: Option<CallId>,
    /// Remote participant
    pub peer: PeerId,
    /// Initiator or responder
    pub role: Role,
    /// Audio or video
    pub media_kind: MediaKind,
    /// Session state
    pub state: SessionState,
    /// Peer connection state
    pub connection_state: ConnectionState,
}

impl CallSnapshot {
    fn of(session: &SessionHandle) -> Self {
        Self {
            call_id: session.call_id(),
            peer: session.peer_id().clone(),
            role: session.role(),
            media_kind: session.media_kind(),
            state: session.state(),
            connection_state: session.connection_state(),
        }
    }
}

/// Main call service
pub struct CallService {
    ctx: SessionContext,
    registry: Arc<CallRegistry>,
    subscription: Subscription,
    control: JoinHandle<()>,
}

impl CallService {
    fn new(ctx: SessionContext) -> Self {
        let registry = Arc::new(CallRegistry::new());
        let (subscription, signals) = ctx.signaling.subscribe();
        let control = tokio::spawn(run_control_loop(ctx.clone(), registry.clone(), signals));
        Self {
            ctx,
            registry,
            subscription,
            control,
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<dyn SignalingTransport>) -> CallServiceBuilder {
        CallServiceBuilder::new(transport)
    }

    /// Local identity
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        self.ctx.signaling.local_peer()
    }

    /// Connect to the relay and announce presence
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot connect
    #[tracing::instrument(skip(self), fields(local = %self.local_peer()))]
    pub async fn connect(&self) -> Result<(), ServiceError> {
        tracing::info!("Connecting call service");
        self.ctx.signaling.connect().await.map_err(CallError::from)?;
        tracing::info!("Call service connected");
        Ok(())
    }

    /// Place a call
    ///
    /// # Errors
    ///
    /// Returns error if another call is live or the attempt fails
    #[tracing::instrument(skip(self), fields(peer = %peer, kind = %media_kind))]
    pub async fn start_call(&self, peer: PeerId, media_kind: MediaKind) -> Result<CallId, ServiceError> {
        tracing::info!("Starting call");
        let session = SessionHandle::initiator(self.ctx.clone(), peer, media_kind);
        if let Some(stale) = self.registry.start(session.clone())? {
            stale.terminate(SessionState::Ended).await;
        }
        match session.start().await {
            Ok(call_id) => {
                tracing::info!(call_id = %call_id, "Call started");
                Ok(call_id)
            }
            Err(e) => {
                self.registry.clear(session.key());
                Err(e.into())
            }
        }
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or answering fails
    #[tracing::instrument(skip(self))]
    pub async fn answer_call(&self) -> Result<(), ServiceError> {
        let session = self.current()?;
        if session.role() != Role::Responder {
            return Err(CallError::InvalidState(session.state()).into());
        }
        tracing::info!(call_id = ?session.call_id(), "Answering call");
        session.answer().await?;
        Ok(())
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if there is no current call
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), ServiceError> {
        let session = self.current()?;
        tracing::info!(call_id = ?session.call_id(), "Rejecting call");
        session.reject().await;
        self.registry.clear(session.key());
        Ok(())
    }

    /// Hang up the current call
    ///
    /// # Errors
    ///
    /// Returns error if there is no current call
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), ServiceError> {
        let session = self.current()?;
        tracing::info!(call_id = ?session.call_id(), "Ending call");
        session.end().await;
        self.registry.clear(session.key());
        Ok(())
    }

    /// Mute or unmute the microphone; returns `true` when muted
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with local media
    pub async fn toggle_mute(&self) -> Result<bool, ServiceError> {
        Ok(self.current()?.toggle_mute().await?)
    }

    /// Turn the camera on or off; returns `true` when on
    ///
    /// # Errors
    ///
    /// Returns error on audio calls or without local media
    pub async fn toggle_video(&self) -> Result<bool, ServiceError> {
        Ok(self.current()?.toggle_video().await?)
    }

    /// Switch between front and back camera
    ///
    /// # Errors
    ///
    /// Returns error on audio calls or if the camera cannot be swapped
    pub async fn switch_camera(&self) -> Result<CameraFacing, ServiceError> {
        Ok(self.current()?.switch_camera().await?)
    }

    /// Current call, if any
    #[must_use]
    pub fn current_call(&self) -> Option<CallSnapshot> {
        self.registry.current().map(|s| CallSnapshot::of(&s))
    }

    /// Session handle of the current call
    #[must_use]
    pub fn current_session(&self) -> Option<SessionHandle> {
        self.registry.current()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.ctx.events.subscribe()
    }

    /// End the current call and stop processing signals
    pub async fn shutdown(&self) {
        if let Some(session) = self.registry.current() {
            session.end().await;
            self.registry.clear(session.key());
        }
        self.subscription.unsubscribe();
        self.control.abort();
        tracing::info!("Call service stopped");
    }

    fn current(&self) -> Result<SessionHandle, CallError> {
        self.registry.current().ok_or(CallError::NoActiveCall)
    }
}

impl Drop for CallService {
    fn drop(&mut self) {
        self.control.abort();
    }
}

async fn run_control_loop(
    ctx: SessionContext,
    registry: Arc<CallRegistry>,
    mut signals: mpsc::UnboundedReceiver<CallSignal>,
) {
    while let Some(signal) = signals.recv().await {
        dispatch_signal(&ctx, &registry, signal).await;
    }
    tracing::debug!("Signal stream closed");
}

async fn dispatch_signal(ctx: &SessionContext, registry: &CallRegistry, signal: CallSignal) {
    match signal {
        CallSignal::Incoming {
            call_id,
            from,
            media_kind,
            caller_info,
        } => {
            let session = SessionHandle::responder(ctx.clone(), call_id.clone(), from.clone(), media_kind);
            admit_incoming(ctx, registry, session, caller_info).await;
        }
        CallSignal::Initiated { call_id } => {
            tracing::warn!(call_id = %call_id, "Unclaimed call:initiated, ending call");
            if let Err(e) = ctx.signaling.end(&call_id).await {
                tracing::debug!(call_id = %call_id, error = %e, "Could not end unclaimed call");
            }
        }
        signal => {
            let call_id = signal.call_id().clone();
            match registry.route(&call_id) {
                Route::Deliver(session) => session.handle_signal(signal).await,
                Route::Superseded { stale } => {
                    stale.terminate(SessionState::Ended).await;
                    handle_unowned(ctx, registry, signal).await;
                }
                Route::NoSession => handle_unowned(ctx, registry, signal).await,
                Route::Unassigned | Route::Mismatch { .. } => {}
            }
        }
    }
}

async fn admit_incoming(
    ctx: &SessionContext,
    registry: &CallRegistry,
    session: SessionHandle,
    caller_info: CallerInfo,
) -> Option<SessionHandle> {
    let Some(call_id) = session.call_id() else {
        return None;
    };
    match registry.admit(session.clone()) {
        Admission::Admitted { stale } => {
            if let Some(stale) = stale {
                stale.terminate(SessionState::Ended).await;
            }
            tracing::info!(call_id = %call_id, from = %session.peer_id(), kind = %session.media_kind(), "Incoming call");
            let _ = ctx.events.send(CallEvent::IncomingCall {
                call_id,
                from: session.peer_id().clone(),
                media_kind: session.media_kind(),
                caller_info,
            });
            Some(session)
        }
        Admission::Duplicate => {
            tracing::debug!(call_id = %call_id, "Duplicate incoming call ignored");
            None
        }
        Admission::Busy { .. } => None,
    }
}

/// Signals with no session: an offer from a known sender starts an incoming
/// call, everything else is dropped
async fn handle_unowned(ctx: &SessionContext, registry: &CallRegistry, signal: CallSignal) {
    match signal {
        CallSignal::Offer {
            call_id,
            offer,
            from: Some(from),
        } => {
            let media_kind = MediaKind::from_sdp(&offer.sdp);
            tracing::debug!(call_id = %call_id, from = %from, "Offer without session treated as incoming call");
            let session = SessionHandle::responder(ctx.clone(), call_id.clone(), from.clone(), media_kind);
            session
                .handle_signal(CallSignal::Offer {
                    call_id,
                    offer,
                    from: Some(from),
                })
                .await;
            admit_incoming(ctx, registry, session, CallerInfo::default()).await;
        }
        signal => {
            tracing::debug!(call_id = %signal.call_id(), "Signal without session dropped");
        }
    }
}

/// Call service builder
pub struct CallServiceBuilder {
    transport: Arc<dyn SignalingTransport>,
    config: CallConfig,
    media: Option<Arc<dyn MediaSource>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    surfaces: Option<Arc<dyn SurfaceProvider>>,
}

impl CallServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            config: CallConfig::default(),
            media: None,
            peers: None,
            surfaces: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local identity
    #[must_use]
    pub fn with_local_peer(mut self, peer: impl Into<PeerId>) -> Self {
        self.config.local_peer = peer.into();
        self
    }

    /// Set the media source
    #[must_use]
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set the playback surface provider
    #[must_use]
    pub fn with_surfaces(mut self, surfaces: Arc<dyn SurfaceProvider>) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    /// Build the service
    ///
    /// Without the `webrtc-rs` feature a media source and a peer factory
    /// must be supplied.
    ///
    /// # Errors
    ///
    /// Returns error if the local identity is blank or a capability is
    /// missing
    pub async fn build(self) -> Result<CallService, ServiceError> {
        if !self.config.local_peer.is_valid() {
            return Err(ServiceError::InitError("local peer id is required".to_string()));
        }
        let media = match self.media {
            Some(media) => media,
            None => default_media_source()?,
        };
        let peers = match self.peers {
            Some(peers) => peers,
            None => default_peer_factory()?,
        };
        let surfaces = self
            .surfaces
            .unwrap_or_else(|| Arc::new(HeadlessSurfaces::new()));

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let signaling = SignalingAdapter::new(self.transport, self.config.local_peer.clone());
        tracing::debug!(local = %self.config.local_peer, "Building call service");
        Ok(CallService::new(SessionContext {
            signaling,
            peers,
            media,
            surfaces,
            events,
            config: Arc::new(self.config),
        }))
    }
}

#[cfg(feature = "webrtc-rs")]
fn default_media_source() -> Result<Arc<dyn MediaSource>, ServiceError> {
    Ok(Arc::new(crate::media::SyntheticMediaSource::new()))
}

#[cfg(not(feature = "webrtc-rs"))]
fn default_media_source() -> Result<Arc<dyn MediaSource>, ServiceError> {
    Err(ServiceError::InitError("no media source configured".to_string()))
}

#[cfg(feature = "webrtc-rs")]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    Ok(Arc::new(crate::peer::WebRtcPeerConnectionFactory::new()))
}

#[cfg(not(feature = "webrtc-rs"))]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, ServiceError> {
    Err(ServiceError::InitError("no peer connection factory configured".to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::MemoryRelay;

    #[test]
    fn test_config_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.max_ice_restarts, 3);
        assert_eq!(config.ice_servers.len(), 1);
        assert!(!config.local_peer.is_valid());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: CallConfig =
            serde_json::from_str(r#"{"local_peer": "alice", "max_ice_restarts": 1}"#).unwrap();
        assert_eq!(config.local_peer.as_str(), "alice");
        assert_eq!(config.max_ice_restarts, 1);
        assert_eq!(config.event_capacity, 256);
    }

    #[tokio::test]
    async fn test_build_requires_local_peer() {
        let relay = MemoryRelay::new();
        let result = CallService::builder(Arc::new(relay.transport("alice"))).build().await;
        assert!(matches!(result, Err(ServiceError::InitError(_))));
    }

    #[cfg(feature = "webrtc-rs")]
    #[tokio::test]
    async fn test_end_without_call() {
        let relay = MemoryRelay::new();
        let service = CallService::builder(Arc::new(relay.transport("alice")))
            .with_local_peer("alice")
            .build()
            .await
            .unwrap();
        assert!(service.current_call().is_none());
        assert!(matches!(
            service.end_call().await,
            Err(ServiceError::Call(CallError::NoActiveCall))
        ));
    }
}
