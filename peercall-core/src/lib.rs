//! peercall - one-to-one call negotiation over a relay signaling channel
//!
//! This library drives the offer/answer/ICE exchange for a single audio or
//! video call between two users whose messages travel through a relay
//! server. It features:
//!
//! - **Negotiation Sessions**: an explicit state machine per call attempt
//!   that buffers early offers and queues early ICE candidates
//! - **Call Registry**: one current call, stale-message rejection and
//!   supersession of dead calls
//! - **Signaling Adapter**: typed call messages, `call:initiate`
//!   correlation and listener re-registration on reconnect
//! - **Media Sink Binding**: local preview and remote playback with
//!   autoplay retry and late-mounting surfaces
//! - **Pluggable Capabilities**: media, peer connections, playback surfaces
//!   and the signaling transport are traits with webrtc-rs and in-memory
//!   implementations
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::{CallService, MediaKind, MemoryRelay, PeerId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = MemoryRelay::new();
//!
//! let service = CallService::builder(Arc::new(relay.transport("alice")))
//!     .with_local_peer("alice")
//!     .build()
//!     .await?;
//! service.connect().await?;
//!
//! // Place a video call
//! let call_id = service.start_call(PeerId::new("bob"), MediaKind::Video).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

/// User identities on the signaling channel
pub mod identity;

/// Core call types and events
pub mod types;

/// Local and remote media tracks
pub mod media;

/// Peer connection capability
pub mod peer;

/// Call signaling messages and adapter
pub mod signaling;

/// In-memory relay and transport
pub mod transport;

/// Playback surface binding
pub mod sink;

/// Per-call negotiation state machine
pub mod session;

/// Current call tracking and message routing
pub mod registry;

/// Call service and configuration
pub mod service;

pub use identity::PeerId;
pub use media::{
    CameraFacing, LocalStream, LocalTrack, MediaConstraints, MediaError, MediaSource, MediaStream,
    RemoteTrack, TrackKind,
};
pub use peer::{PeerConnectionFactory, PeerConnectionHandle, PeerError, PeerEvent, PeerEventSender};
pub use registry::{Admission, CallRegistry, CallSlot, Route};
pub use service::{CallConfig, CallService, CallServiceBuilder, CallSnapshot, ServiceError};
pub use session::{CallError, NegotiationSession, SessionContext, SessionHandle};
pub use signaling::{
    CallSignal, ConnectionObserver, InitiateClaim, SignalingAdapter, SignalingError,
    SignalingTransport, Subscription,
};
pub use sink::{
    BindOutcome, HeadlessSurface, HeadlessSurfaces, MediaSinkBinder, PlaybackError,
    PlaybackSource, PlaybackSurface, SinkConfig, SurfaceProvider, SurfaceSlot, UserGesture,
};
pub use transport::{MemoryRelay, MemoryTransport};
pub use types::{
    CallEvent, CallId, CallerInfo, ConnectionState, EndReason, IceCandidate, IceConnectionState,
    IceServer, MediaKind, Role, SdpType, SessionDescription, SessionState,
};

#[cfg(feature = "webrtc-rs")]
pub use media::SyntheticMediaSource;
#[cfg(feature = "webrtc-rs")]
pub use peer::{WebRtcPeerConnection, WebRtcPeerConnectionFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::PeerId;
    pub use crate::service::{CallConfig, CallService, CallServiceBuilder};
    pub use crate::session::CallError;
    pub use crate::signaling::SignalingTransport;
    pub use crate::transport::MemoryRelay;
    pub use crate::types::{CallEvent, CallId, MediaKind, SessionState};
}
