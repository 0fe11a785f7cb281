//! Local and remote media tracks
//!
//! Tracks are platform handles wrapped in engine-side bookkeeping: the
//! `enabled` flag used for mute/video toggles and the `stopped` flag that
//! guarantees a local track is released once. The platform object itself is
//! carried as an opaque `native` handle that the matching peer-connection
//! backend downcasts.
//!
//! Track acquisition is abstracted by the [`MediaSource`] capability so that
//! platform-specific capture (browser, mobile, headless) is selected when the
//! service is composed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform denied access to camera/microphone
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Constraints cannot be satisfied
    #[error("Unsupported constraints: {0}")]
    Unsupported(String),

    /// Capture backend error
    #[error("Capture error: {0}")]
    Capture(String),
}

/// Kind of a single track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// Front camera
    User,
    /// Rear camera
    Environment,
}

impl CameraFacing {
    /// The other camera
    pub fn flipped(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// Media constraints for track acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a microphone track
    pub audio: bool,
    /// Request a camera track
    pub video: bool,
    /// Camera to use when `video` is set
    pub facing: CameraFacing,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            facing: CameraFacing::User,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            facing: CameraFacing::User,
        }
    }

    /// Single camera track, used when switching cameras mid-call
    pub fn camera(facing: CameraFacing) -> Self {
        Self {
            audio: false,
            video: true,
            facing,
        }
    }

    /// Constraints for a call of the given kind
    pub fn for_kind(kind: crate::types::MediaKind) -> Self {
        if kind.has_video() {
            Self::video_call()
        } else {
            Self::audio_only()
        }
    }
}

struct LocalTrackInner {
    id: String,
    kind: TrackKind,
    facing: Option<CameraFacing>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    native: Option<Arc<dyn Any + Send + Sync>>,
}

/// Locally captured track, exclusively owned by one call
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    /// Track without a platform handle
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::from_parts(id, kind, None, None)
    }

    /// Track wrapping a platform handle
    pub fn from_parts(
        id: impl Into<String>,
        kind: TrackKind,
        facing: Option<CameraFacing>,
        native: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalTrackInner {
                id: id.into(),
                kind,
                facing,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                native,
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Camera facing for video tracks
    pub fn facing(&self) -> Option<CameraFacing> {
        self.inner.facing
    }

    /// Whether the track is currently sending media
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track (mute / camera off)
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Returns `true` only for the call that stopped it.
    pub fn stop(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(track_id = %self.inner.id, kind = ?self.inner.kind, "Local track stopped");
        }
        first
    }

    /// Whether the track has been stopped
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Platform handle
    pub fn native(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.inner.native.as_ref()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Set of local tracks acquired for one call
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    /// Stream identifier
    pub id: String,
    /// Owned tracks
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Create a stream from acquired tracks
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    /// Stop every track; returns how many were stopped by this call
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Swap a track for its replacement, returning the old one
    pub fn replace_track(&mut self, old_id: &str, new: LocalTrack) -> Option<LocalTrack> {
        let slot = self.tracks.iter_mut().find(|t| t.id() == old_id)?;
        Some(std::mem::replace(slot, new))
    }
}

/// Track received from the remote peer
///
/// Remote tracks are owned by the peer connection; the engine only enables
/// them and hands them to playback.
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    native: Option<Arc<dyn Any + Send + Sync>>,
}

impl RemoteTrack {
    /// Track without a platform handle
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_native(id, kind, None)
    }

    /// Track wrapping a platform handle
    pub fn with_native(
        id: impl Into<String>,
        kind: TrackKind,
        native: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(false)),
            native,
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether playback of this track is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable playback
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Platform handle
    pub fn native(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.native.as_ref()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Collection of remote tracks for playback
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    /// Stream identifier
    pub id: String,
    /// Received tracks
    pub tracks: Vec<RemoteTrack>,
}

impl MediaStream {
    /// Empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Add a track unless one with the same id is present
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    /// Whether the stream has no tracks
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Local media acquisition capability
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire local tracks satisfying the constraints
    ///
    /// This may suspend for as long as the user takes to answer a permission
    /// prompt.
    ///
    /// # Errors
    ///
    /// Returns error if a device is missing or access is denied
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

#[cfg(feature = "webrtc-rs")]
pub use synthetic::SyntheticMediaSource;

#[cfg(feature = "webrtc-rs")]
mod synthetic {
    use super::{CameraFacing, LocalStream, LocalTrack, MediaConstraints, MediaError, MediaSource, TrackKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    /// Headless media source producing webrtc-rs sample tracks
    ///
    /// No capture device is opened; callers write samples into the
    /// `TrackLocalStaticSample` carried as the track's native handle.
    #[derive(Debug, Default)]
    pub struct SyntheticMediaSource {
        counter: AtomicU64,
    }

    impl SyntheticMediaSource {
        /// Create a new source
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn audio_track(&self, stream_id: &str) -> LocalTrack {
            let track_id = format!("audio-{}", self.counter.fetch_add(1, Ordering::Relaxed));
            let codec = RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            };
            tracing::debug!(track_id = %track_id, codec = %codec.mime_type, "Audio track created");
            let native = Arc::new(TrackLocalStaticSample::new(
                codec,
                track_id.clone(),
                stream_id.to_string(),
            ));
            LocalTrack::from_parts(track_id, TrackKind::Audio, None, Some(native))
        }

        fn video_track(&self, stream_id: &str, facing: CameraFacing) -> LocalTrack {
            let track_id = format!("video-{}", self.counter.fetch_add(1, Ordering::Relaxed));
            let codec = RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            };
            tracing::debug!(track_id = %track_id, codec = %codec.mime_type, facing = ?facing, "Video track created");
            let native = Arc::new(TrackLocalStaticSample::new(
                codec,
                track_id.clone(),
                stream_id.to_string(),
            ));
            LocalTrack::from_parts(track_id, TrackKind::Video, Some(facing), Some(native))
        }
    }

    #[async_trait]
    impl MediaSource for SyntheticMediaSource {
        #[tracing::instrument(skip(self))]
        async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
            if !constraints.audio && !constraints.video {
                return Err(MediaError::Unsupported(
                    "at least one of audio or video must be requested".to_string(),
                ));
            }
            let stream_id = format!("local-{}", uuid::Uuid::new_v4());
            let mut tracks = Vec::new();
            if constraints.audio {
                tracks.push(self.audio_track(&stream_id));
            }
            if constraints.video {
                tracks.push(self.video_track(&stream_id, constraints.facing));
            }
            Ok(LocalStream::new(stream_id, tracks))
        }
    }
}
