//! Peer connection capability
//!
//! The negotiation session drives a peer connection through the
//! [`PeerConnectionHandle`] trait and receives its asynchronous callbacks
//! (local ICE candidates, remote tracks, state changes) as [`PeerEvent`]s on
//! an mpsc channel handed to the [`PeerConnectionFactory`]. Callbacks never
//! touch session state directly; the session's own event pump applies them in
//! order.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{ConnectionState, IceCandidate, IceConnectionState, IceServer, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Peer connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Session description rejected or could not be produced
    #[error("SDP error: {0}")]
    Sdp(String),

    /// ICE candidate rejected
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Peer connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and must be sent to the remote peer
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack {
        /// The track
        track: RemoteTrack,
        /// Ids of the remote streams the track belongs to; may be empty
        stream_ids: Vec<String>,
    },
    /// Overall connection state changed
    ConnectionState(ConnectionState),
    /// ICE transport state changed
    IceConnectionState(IceConnectionState),
}

/// Sender half handed to the factory for callback delivery
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One peer connection, exclusively owned by one negotiation session
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    /// Attach a local track for sending
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swap the sending track identified by `old_track_id`
    async fn replace_track(&self, old_track_id: &str, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create an offer, optionally requesting an ICE restart
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Close the connection and release its transports
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections for new sessions
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a peer connection using the given STUN/TURN servers
    ///
    /// Callbacks of the new connection are delivered on `events`.
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnectionHandle>, PeerError>;
}

#[cfg(feature = "webrtc-rs")]
pub use rtc::{WebRtcPeerConnection, WebRtcPeerConnectionFactory};

#[cfg(feature = "webrtc-rs")]
mod rtc {
    use super::{PeerConnectionFactory, PeerConnectionHandle, PeerError, PeerEvent, PeerEventSender};
    use crate::media::{LocalTrack, RemoteTrack, TrackKind};
    use crate::types::{
        ConnectionState, IceCandidate, IceConnectionState, IceServer, SdpType, SessionDescription,
    };
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::Arc;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
    use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
    use webrtc::ice_transport::ice_server::RTCIceServer;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
    use webrtc::rtp_transceiver::RTCRtpTransceiver;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;
    use webrtc::track::track_remote::TrackRemote;

    /// Factory for webrtc-rs peer connections
    #[derive(Debug, Default, Clone)]
    pub struct WebRtcPeerConnectionFactory;

    impl WebRtcPeerConnectionFactory {
        /// Create a new factory
        #[must_use]
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl PeerConnectionFactory for WebRtcPeerConnectionFactory {
        #[tracing::instrument(skip(self, events), fields(ice_servers = ice_servers.len()))]
        async fn create(
            &self,
            ice_servers: &[IceServer],
            events: PeerEventSender,
        ) -> Result<Arc<dyn PeerConnectionHandle>, PeerError> {
            let mut media_engine = MediaEngine::default();
            media_engine
                .register_default_codecs()
                .map_err(|e| PeerError::Create(format!("Failed to register codecs: {e}")))?;

            let mut registry = Registry::new();
            registry = register_default_interceptors(registry, &mut media_engine)
                .map_err(|e| PeerError::Create(format!("Failed to register interceptors: {e}")))?;

            let api = APIBuilder::new()
                .with_media_engine(media_engine)
                .with_interceptor_registry(registry)
                .build();

            let config = RTCConfiguration {
                ice_servers: ice_servers
                    .iter()
                    .map(|s| RTCIceServer {
                        urls: s.urls.clone(),
                        username: s.username.clone().unwrap_or_default(),
                        credential: s.credential.clone().unwrap_or_default(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            };

            let pc = Arc::new(
                api.new_peer_connection(config)
                    .await
                    .map_err(|e| PeerError::Create(e.to_string()))?,
            );
            register_callbacks(&pc, events);
            tracing::debug!("Created webrtc-rs peer connection");

            Ok(Arc::new(WebRtcPeerConnection { pc }))
        }
    }

    fn register_callbacks(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index,
                            sdp_mid: init.sdp_mid,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    let stream_id = track.stream_id();
                    let stream_ids = if stream_id.is_empty() {
                        Vec::new()
                    } else {
                        vec![stream_id]
                    };
                    let id = track.id();
                    let native: Arc<dyn Any + Send + Sync> = track;
                    let _ = tx.send(PeerEvent::RemoteTrack {
                        track: RemoteTrack::with_native(id, kind, Some(native)),
                        stream_ids,
                    });
                })
            },
        ));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::ConnectionState(connection_state(s)));
            })
        }));

        let tx = events;
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::IceConnectionState(ice_state(s)));
            })
        }));
    }

    fn connection_state(s: RTCPeerConnectionState) -> ConnectionState {
        match s {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }

    fn ice_state(s: RTCIceConnectionState) -> IceConnectionState {
        match s {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        }
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        let result = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(PeerError::Sdp("rollback is not supported".to_string()));
            }
        };
        result.map_err(|e| PeerError::Sdp(format!("Invalid SDP: {e}")))
    }

    fn from_rtc(description: RTCSessionDescription) -> SessionDescription {
        let sdp_type = match description.sdp_type {
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            _ => SdpType::Offer,
        };
        SessionDescription {
            sdp_type,
            sdp: description.sdp,
        }
    }

    fn sample_track(track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
        let native = track
            .native()
            .cloned()
            .ok_or_else(|| PeerError::Track(format!("track {} has no native handle", track.id())))?;
        let sample: Arc<dyn TrackLocal + Send + Sync> = native
            .downcast::<TrackLocalStaticSample>()
            .map_err(|_| PeerError::Track(format!("track {} is not a webrtc-rs sample track", track.id())))?;
        Ok(sample)
    }

    /// webrtc-rs backed peer connection
    pub struct WebRtcPeerConnection {
        pc: Arc<RTCPeerConnection>,
    }

    impl WebRtcPeerConnection {
        /// Underlying webrtc-rs connection
        #[must_use]
        pub fn inner(&self) -> &Arc<RTCPeerConnection> {
            &self.pc
        }
    }

    #[async_trait]
    impl PeerConnectionHandle for WebRtcPeerConnection {
        async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
            let native = sample_track(track)?;
            self.pc
                .add_track(native)
                .await
                .map_err(|e| PeerError::Track(format!("Failed to add track {}: {e}", track.id())))?;
            Ok(())
        }

        async fn replace_track(&self, old_track_id: &str, track: &LocalTrack) -> Result<(), PeerError> {
            let native = sample_track(track)?;
            for sender in self.pc.get_senders().await {
                let Some(current) = sender.track().await else {
                    continue;
                };
                if current.id() == old_track_id {
                    return sender
                        .replace_track(Some(native))
                        .await
                        .map_err(|e| PeerError::Track(format!("Failed to replace track: {e}")));
                }
            }
            Err(PeerError::Track(format!("no sender for track {old_track_id}")))
        }

        async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
            let options = RTCOfferOptions {
                ice_restart,
                ..Default::default()
            };
            let offer = self
                .pc
                .create_offer(Some(options))
                .await
                .map_err(|e| PeerError::Sdp(format!("Failed to create offer: {e}")))?;
            Ok(from_rtc(offer))
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| PeerError::Sdp(format!("Failed to create answer: {e}")))?;
            Ok(from_rtc(answer))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
            self.pc
                .set_local_description(to_rtc(description)?)
                .await
                .map_err(|e| PeerError::Sdp(format!("Failed to set local description: {e}")))
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
            self.pc
                .set_remote_description(to_rtc(description)?)
                .await
                .map_err(|e| PeerError::Sdp(format!("Failed to set remote description: {e}")))
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            self.pc
                .add_ice_candidate(init)
                .await
                .map_err(|e| PeerError::Candidate(e.to_string()))
        }

        fn connection_state(&self) -> ConnectionState {
            connection_state(self.pc.connection_state())
        }

        async fn close(&self) -> Result<(), PeerError> {
            self.pc
                .close()
                .await
                .map_err(|e| PeerError::Create(format!("Failed to close peer connection: {e}")))
        }
    }

}
