//! Call types and data structures

use crate::identity::PeerId;
use crate::media::{LocalStream, MediaStream};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
///
/// Call ids are assigned by the relay when a call is initiated and are opaque
/// to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap an id received from the relay
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new random call id (relay side)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of call, fixed when the call is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl MediaKind {
    /// Whether local video is requested for this kind of call
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Guess the kind of call from an SDP body
    pub fn from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|line| line.starts_with("m=video")) {
            Self::Video
        } else {
            Self::Audio
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which side of the offer/answer exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Caller; creates the offer
    Initiator,
    /// Callee; answers the offer
    Responder,
}

/// Negotiation session state
///
/// ```text
///   Ringing ──(answer)──┐
///                       ▼
///              AcquiringMedia ──────────────┐
///                       │                   │
///                       ▼                   │
///                  Negotiating ◄──┐         │
///                   │   │         │         ▼
///                   │   ▼         │       Failed
///                   │ AwaitingRemoteDescription
///                   ▼                       ▲
///                Connected ─────────────────┘
///                   │
///                   ▼
///                 Ended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Incoming call notified, not answered yet
    Ringing,
    /// Waiting for local tracks
    AcquiringMedia,
    /// Responder waiting for the remote offer
    AwaitingRemoteDescription,
    /// Offer/answer in flight or ICE still checking
    Negotiating,
    /// Media path established
    Connected,
    /// Ended normally
    Ended,
    /// Ended by an error
    Failed,
}

impl SessionState {
    /// Whether the session has been torn down
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Whether the session is actively negotiating or carrying media
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

/// Peer connection state as reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Connected
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Failed permanently
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// States in which a call may be superseded by a new call id
    pub fn is_terminal_adjacent(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// ICE transport state as reported by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceConnectionState {
    /// Gathering, no checks yet
    New,
    /// Connectivity checks running
    Checking,
    /// A usable pair was found
    Connected,
    /// Checks finished
    Completed,
    /// Lost connectivity
    Disconnected,
    /// All pairs failed
    Failed,
    /// ICE agent shut down
    Closed,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback
    Rollback,
}

/// Session description as exchanged over signaling (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// SDP media id
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Build a candidate for the given media line
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid,
            username_fragment: None,
        }
    }
}

/// Caller metadata forwarded to the callee with the incoming call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Display name of the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL of the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// STUN/TURN server used by the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::stun("stun:stun.l.google.com:19302")
    }
}

/// Why the remote side ended a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Remote hung up
    Ended,
    /// Remote declined
    Rejected,
}

/// Call event for the UI layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: PeerId,
        /// Audio or video
        media_kind: MediaKind,
        /// Caller metadata
        caller_info: CallerInfo,
    },
    /// Outgoing call acknowledged by the relay
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        callee: PeerId,
        /// Audio or video
        media_kind: MediaKind,
    },
    /// Callee accepted
    CallAccepted {
        /// Call identifier
        call_id: CallId,
    },
    /// Local tracks acquired
    LocalStream {
        /// Call identifier, if already assigned
        call_id: Option<CallId>,
        /// Local tracks
        stream: LocalStream,
    },
    /// Remote tracks updated
    RemoteStream {
        /// Call identifier
        call_id: Option<CallId>,
        /// Remote tracks received so far
        stream: MediaStream,
    },
    /// Session state transition
    SessionStateChanged {
        /// Call identifier
        call_id: Option<CallId>,
        /// Previous state
        old_state: SessionState,
        /// New state
        new_state: SessionState,
    },
    /// Peer connection state changed
    ConnectionStateChanged {
        /// Call identifier
        call_id: Option<CallId>,
        /// New connection state
        state: ConnectionState,
    },
    /// Remote side ended or declined the call
    EndedByRemote {
        /// Call identifier
        call_id: CallId,
        /// Hangup or decline
        reason: EndReason,
    },
    /// Call torn down, resources released
    CallEnded {
        /// Call identifier
        call_id: Option<CallId>,
        /// Final state (`Ended` or `Failed`)
        final_state: SessionState,
    },
    /// Call attempt failed; single user-facing notification
    CallFailed {
        /// Call identifier
        call_id: Option<CallId>,
        /// Error description
        error: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_call_id() {
        let id1 = CallId::generate();
        let id2 = CallId::generate();
        assert_ne!(id1, id2);
        assert_eq!(CallId::new("abc").as_str(), "abc");
    }

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        assert!(MediaKind::Video.has_video());
        assert!(!MediaKind::Audio.has_video());
    }

    #[test]
    fn test_media_kind_from_sdp() {
        let video = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        assert_eq!(MediaKind::from_sdp(video), MediaKind::Video);
        assert_eq!(MediaKind::from_sdp("v=0\r\nm=audio 9 RTP 0\r\n"), MediaKind::Audio);
    }

    #[test]
    fn test_session_description_shape() {
        let offer = SessionDescription::offer("v=0");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 9 typ host", Some("0".into()), Some(0));
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["sdpMid"], "0");
        assert!(json.get("usernameFragment").is_none());

        let parsed: IceCandidate =
            serde_json::from_value(serde_json::json!({"candidate": "candidate:2"})).unwrap();
        assert_eq!(parsed.sdp_mid, None);
        assert_eq!(parsed.sdp_mline_index, None);
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Ended.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Ringing.is_terminal());
        assert!(SessionState::Connected.is_in_progress());
        assert!(SessionState::Negotiating.is_in_progress());
        assert!(!SessionState::AcquiringMedia.is_in_progress());

        assert!(ConnectionState::Closed.is_terminal_adjacent());
        assert!(ConnectionState::Disconnected.is_terminal_adjacent());
        assert!(!ConnectionState::Connecting.is_terminal_adjacent());
    }
}
