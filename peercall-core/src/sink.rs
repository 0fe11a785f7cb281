//! Media sink binding
//!
//! Attaches local and remote media to playback surfaces owned by the UI.
//! Surfaces may not be mounted yet when media arrives, so lookups are retried
//! after a short delay. Playback refused by an autoplay policy is retried once
//! on the next user gesture.

use crate::media::{LocalStream, MediaStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Playback errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Autoplay policy refused to start playback
    #[error("Autoplay blocked: {0}")]
    Autoplay(String),

    /// No surface is mounted for the slot
    #[error("Playback surface unavailable: {0:?}")]
    SurfaceUnavailable(SurfaceSlot),

    /// Any other playback failure
    #[error("Playback failed: {0}")]
    Playback(String),
}

/// Where a surface sits in the call UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceSlot {
    /// Local preview
    LocalVideo,
    /// Remote video
    RemoteVideo,
    /// Remote audio for calls without video
    RemoteAudio,
}

/// User interaction that unlocks autoplay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGesture {
    /// Mouse or pen click
    Pointer,
    /// Touch
    Touch,
}

/// Media handed to a surface
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    /// Local tracks (preview)
    Local(LocalStream),
    /// Remote tracks
    Remote(MediaStream),
}

/// A UI element able to render media
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    /// Attach media
    fn attach(&self, source: PlaybackSource, muted: bool);

    /// Remove attached media
    fn detach(&self);

    /// Start playback
    async fn play(&self) -> Result<(), PlaybackError>;
}

/// Resolves surfaces and reports user gestures
pub trait SurfaceProvider: Send + Sync {
    /// Surface for a slot, `None` while it is not mounted
    fn surface(&self, slot: SurfaceSlot) -> Option<Arc<dyn PlaybackSurface>>;

    /// Create an invisible audio element
    ///
    /// # Errors
    ///
    /// Returns error if the platform cannot create one
    fn create_hidden_audio(&self) -> Result<Arc<dyn PlaybackSurface>, PlaybackError>;

    /// Subscribe to user gestures
    fn gestures(&self) -> broadcast::Receiver<UserGesture>;
}

/// Surface lookup retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Delay between surface lookups
    pub retry_delay: Duration,
    /// Lookups before giving up
    pub max_attempts: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(100),
            max_attempts: 10,
        }
    }
}

/// Result of a successful bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Media is playing
    Playing,
    /// Autoplay was refused; playback starts on the next gesture
    AwaitingGesture,
    /// The binder was released while binding
    Released,
}

/// Binds one call's media to playback surfaces
pub struct MediaSinkBinder {
    provider: Arc<dyn SurfaceProvider>,
    config: SinkConfig,
    bound: Mutex<Vec<(SurfaceSlot, Arc<dyn PlaybackSurface>)>>,
    gesture_tasks: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
}

impl MediaSinkBinder {
    /// Create a binder for one call
    pub fn new(provider: Arc<dyn SurfaceProvider>, config: SinkConfig) -> Self {
        Self {
            provider,
            config,
            bound: Mutex::new(Vec::new()),
            gesture_tasks: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Show the local preview, always muted
    ///
    /// # Errors
    ///
    /// Returns error if no preview surface appears within the retry budget
    #[tracing::instrument(skip(self, stream), fields(stream_id = %stream.id))]
    pub async fn bind_local(&self, stream: &LocalStream) -> Result<BindOutcome, PlaybackError> {
        let Some(surface) = self.await_surface(SurfaceSlot::LocalVideo).await? else {
            return Ok(BindOutcome::Released);
        };
        self.attach_and_play(
            SurfaceSlot::LocalVideo,
            surface,
            PlaybackSource::Local(stream.clone()),
            true,
        )
        .await
    }

    /// Play remote media
    ///
    /// Streams without video go to the audio surface, falling back to a
    /// hidden audio element when the UI has none. Once video arrives the
    /// stream moves to the video surface and the audio surface is detached.
    ///
    /// # Errors
    ///
    /// Returns error if no surface can be found or created
    #[tracing::instrument(skip(self, stream), fields(stream_id = %stream.id, tracks = stream.tracks.len()))]
    pub async fn bind_remote(&self, stream: &MediaStream) -> Result<BindOutcome, PlaybackError> {
        let (slot, surface) = if stream.has_video() {
            match self.await_surface(SurfaceSlot::RemoteVideo).await? {
                Some(surface) => (SurfaceSlot::RemoteVideo, surface),
                None => return Ok(BindOutcome::Released),
            }
        } else {
            let surface = match self.bound_surface(SurfaceSlot::RemoteAudio) {
                Some(surface) => surface,
                None => match self.provider.surface(SurfaceSlot::RemoteAudio) {
                    Some(surface) => surface,
                    None => {
                        tracing::debug!("No audio surface mounted, creating hidden audio element");
                        self.provider.create_hidden_audio()?
                    }
                },
            };
            (SurfaceSlot::RemoteAudio, surface)
        };
        for track in &stream.tracks {
            track.set_enabled(true);
        }
        if slot == SurfaceSlot::RemoteVideo {
            self.detach_slot(SurfaceSlot::RemoteAudio);
        }
        self.attach_and_play(slot, surface, PlaybackSource::Remote(stream.clone()), false)
            .await
    }

    /// Detach every surface and cancel pending gesture retries
    ///
    /// Safe to call more than once; later binds become no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.gesture_tasks.lock().drain(..) {
            task.abort();
        }
        let surfaces: Vec<_> = self.bound.lock().drain(..).collect();
        for (_, surface) in &surfaces {
            surface.detach();
        }
        tracing::debug!(surfaces = surfaces.len(), "Media sinks released");
    }

    /// Whether [`release`](Self::release) has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn bound_surface(&self, slot: SurfaceSlot) -> Option<Arc<dyn PlaybackSurface>> {
        self.bound
            .lock()
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, surface)| surface.clone())
    }

    fn detach_slot(&self, slot: SurfaceSlot) {
        let mut detached = Vec::new();
        self.bound.lock().retain(|(s, surface)| {
            if *s == slot {
                detached.push(surface.clone());
                false
            } else {
                true
            }
        });
        for surface in detached {
            surface.detach();
        }
    }

    async fn await_surface(
        &self,
        slot: SurfaceSlot,
    ) -> Result<Option<Arc<dyn PlaybackSurface>>, PlaybackError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.is_released() {
                return Ok(None);
            }
            if let Some(surface) = self.provider.surface(slot) {
                return Ok(Some(surface));
            }
            if attempt < attempts {
                tracing::trace!(slot = ?slot, attempt, "Surface not mounted yet, retrying");
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        tracing::warn!(slot = ?slot, attempts, "Playback surface never appeared");
        Err(PlaybackError::SurfaceUnavailable(slot))
    }

    async fn attach_and_play(
        &self,
        slot: SurfaceSlot,
        surface: Arc<dyn PlaybackSurface>,
        source: PlaybackSource,
        muted: bool,
    ) -> Result<BindOutcome, PlaybackError> {
        if self.is_released() {
            return Ok(BindOutcome::Released);
        }
        surface.attach(source, muted);
        {
            let mut bound = self.bound.lock();
            if !bound.iter().any(|(_, s)| Arc::ptr_eq(s, &surface)) {
                bound.push((slot, surface.clone()));
            }
        }

        match surface.play().await {
            Ok(()) => Ok(BindOutcome::Playing),
            Err(PlaybackError::Autoplay(reason)) => {
                tracing::info!(reason = %reason, "Autoplay blocked, retrying on next user gesture");
                self.retry_on_gesture(surface);
                Ok(BindOutcome::AwaitingGesture)
            }
            Err(e) => Err(e),
        }
    }

    fn retry_on_gesture(&self, surface: Arc<dyn PlaybackSurface>) {
        let mut gestures = self.provider.gestures();
        let task = tokio::spawn(async move {
            loop {
                match gestures.recv().await {
                    Ok(gesture) => {
                        match surface.play().await {
                            Ok(()) => tracing::debug!(gesture = ?gesture, "Playback started after gesture"),
                            Err(e) => tracing::warn!(gesture = ?gesture, error = %e, "Playback retry failed"),
                        }
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            // the receiver drops here, one retry per block
        });
        let mut tasks = self.gesture_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Surface that accepts media without rendering it
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    attached: Mutex<Option<usize>>,
}

impl HeadlessSurface {
    /// Number of tracks currently attached, `None` when detached
    pub fn attached_tracks(&self) -> Option<usize> {
        *self.attached.lock()
    }
}

#[async_trait]
impl PlaybackSurface for HeadlessSurface {
    fn attach(&self, source: PlaybackSource, _muted: bool) {
        let tracks = match source {
            PlaybackSource::Local(stream) => stream.tracks.len(),
            PlaybackSource::Remote(stream) => stream.tracks.len(),
        };
        *self.attached.lock() = Some(tracks);
    }

    fn detach(&self) {
        *self.attached.lock() = None;
    }

    async fn play(&self) -> Result<(), PlaybackError> {
        Ok(())
    }
}

/// Provider with every slot permanently mounted, for services without a UI
pub struct HeadlessSurfaces {
    local: Arc<HeadlessSurface>,
    remote_video: Arc<HeadlessSurface>,
    remote_audio: Arc<HeadlessSurface>,
    gestures: broadcast::Sender<UserGesture>,
}

impl HeadlessSurfaces {
    /// Create the provider
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: Arc::default(),
            remote_video: Arc::default(),
            remote_audio: Arc::default(),
            gestures: broadcast::channel(1).0,
        }
    }

    /// Surface behind a slot
    #[must_use]
    pub fn slot(&self, slot: SurfaceSlot) -> &Arc<HeadlessSurface> {
        match slot {
            SurfaceSlot::LocalVideo => &self.local,
            SurfaceSlot::RemoteVideo => &self.remote_video,
            SurfaceSlot::RemoteAudio => &self.remote_audio,
        }
    }
}

impl Default for HeadlessSurfaces {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceProvider for HeadlessSurfaces {
    fn surface(&self, slot: SurfaceSlot) -> Option<Arc<dyn PlaybackSurface>> {
        Some(self.slot(slot).clone())
    }

    fn create_hidden_audio(&self) -> Result<Arc<dyn PlaybackSurface>, PlaybackError> {
        Ok(self.remote_audio.clone())
    }

    fn gestures(&self) -> broadcast::Receiver<UserGesture> {
        self.gestures.subscribe()
    }
}

impl Drop for MediaSinkBinder {
    fn drop(&mut self) {
        for task in self.gesture_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{RemoteTrack, TrackKind};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct TestSurface {
        attached: Mutex<Option<(bool, bool)>>,
        plays: AtomicUsize,
        blocked_plays: AtomicUsize,
    }

    impl TestSurface {
        fn blocking(times: usize) -> Arc<Self> {
            let surface = Self::default();
            surface.blocked_plays.store(times, Ordering::SeqCst);
            Arc::new(surface)
        }
    }

    #[async_trait]
    impl PlaybackSurface for TestSurface {
        fn attach(&self, source: PlaybackSource, muted: bool) {
            let is_local = matches!(source, PlaybackSource::Local(_));
            *self.attached.lock() = Some((is_local, muted));
        }

        fn detach(&self) {
            *self.attached.lock() = None;
        }

        async fn play(&self) -> Result<(), PlaybackError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            let blocked = self.blocked_plays.load(Ordering::SeqCst);
            if blocked > 0 {
                self.blocked_plays.store(blocked - 1, Ordering::SeqCst);
                return Err(PlaybackError::Autoplay("NotAllowedError".into()));
            }
            Ok(())
        }
    }

    struct TestProvider {
        surfaces: Mutex<HashMap<SurfaceSlot, Arc<TestSurface>>>,
        hidden: Mutex<Vec<Arc<TestSurface>>>,
        gestures: broadcast::Sender<UserGesture>,
    }

    impl TestProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                surfaces: Mutex::new(HashMap::new()),
                hidden: Mutex::new(Vec::new()),
                gestures: broadcast::channel(8).0,
            })
        }

        fn mount(&self, slot: SurfaceSlot, surface: Arc<TestSurface>) {
            self.surfaces.lock().insert(slot, surface);
        }
    }

    impl SurfaceProvider for TestProvider {
        fn surface(&self, slot: SurfaceSlot) -> Option<Arc<dyn PlaybackSurface>> {
            self.surfaces
                .lock()
                .get(&slot)
                .map(|s| s.clone() as Arc<dyn PlaybackSurface>)
        }

        fn create_hidden_audio(&self) -> Result<Arc<dyn PlaybackSurface>, PlaybackError> {
            let surface = Arc::new(TestSurface::default());
            self.hidden.lock().push(surface.clone());
            Ok(surface)
        }

        fn gestures(&self) -> broadcast::Receiver<UserGesture> {
            self.gestures.subscribe()
        }
    }

    fn audio_stream() -> MediaStream {
        let mut stream = MediaStream::new("remote");
        stream.add_track(RemoteTrack::new("a1", TrackKind::Audio));
        stream
    }

    #[tokio::test]
    async fn test_local_preview_is_muted() {
        let provider = TestProvider::new();
        let preview = Arc::new(TestSurface::default());
        provider.mount(SurfaceSlot::LocalVideo, preview.clone());
        let binder = MediaSinkBinder::new(provider, SinkConfig::default());

        let outcome = binder.bind_local(&LocalStream::default()).await.unwrap();
        assert_eq!(outcome, BindOutcome::Playing);
        assert_eq!(*preview.attached.lock(), Some((true, true)));
    }

    #[tokio::test]
    async fn test_audio_only_uses_audio_surface_and_enables_tracks() {
        let provider = TestProvider::new();
        let audio = Arc::new(TestSurface::default());
        let video = Arc::new(TestSurface::default());
        provider.mount(SurfaceSlot::RemoteAudio, audio.clone());
        provider.mount(SurfaceSlot::RemoteVideo, video.clone());
        let binder = MediaSinkBinder::new(provider, SinkConfig::default());

        let stream = audio_stream();
        binder.bind_remote(&stream).await.unwrap();
        assert_eq!(*audio.attached.lock(), Some((false, false)));
        assert!(video.attached.lock().is_none());
        assert!(stream.tracks[0].is_enabled());
    }

    #[tokio::test]
    async fn test_stream_moves_to_video_surface_when_video_arrives() {
        let provider = TestProvider::new();
        let audio = Arc::new(TestSurface::default());
        let video = Arc::new(TestSurface::default());
        provider.mount(SurfaceSlot::RemoteAudio, audio.clone());
        provider.mount(SurfaceSlot::RemoteVideo, video.clone());
        let binder = MediaSinkBinder::new(provider, SinkConfig::default());

        let mut stream = audio_stream();
        binder.bind_remote(&stream).await.unwrap();
        assert!(audio.attached.lock().is_some());

        stream.add_track(RemoteTrack::new("v1", TrackKind::Video));
        binder.bind_remote(&stream).await.unwrap();
        assert!(audio.attached.lock().is_none());
        assert_eq!(*video.attached.lock(), Some((false, false)));
    }

    #[tokio::test]
    async fn test_hidden_audio_created_when_no_surface() {
        let provider = TestProvider::new();
        let binder = MediaSinkBinder::new(provider.clone(), SinkConfig::default());
        binder.bind_remote(&audio_stream()).await.unwrap();
        assert_eq!(provider.hidden.lock().len(), 1);
        assert!(provider.hidden.lock()[0].attached.lock().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_mounted_late_is_found() {
        let provider = TestProvider::new();
        let binder = Arc::new(MediaSinkBinder::new(provider.clone(), SinkConfig::default()));
        let mut stream = MediaStream::new("remote");
        stream.add_track(RemoteTrack::new("v1", TrackKind::Video));

        let b = binder.clone();
        let bind = tokio::spawn(async move { b.bind_remote(&stream).await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        let video = Arc::new(TestSurface::default());
        provider.mount(SurfaceSlot::RemoteVideo, video.clone());

        assert_eq!(bind.await.unwrap().unwrap(), BindOutcome::Playing);
        assert!(video.attached.lock().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_surface_never_mounted_fails() {
        let provider = TestProvider::new();
        let binder = MediaSinkBinder::new(provider, SinkConfig::default());
        let result = binder.bind_local(&LocalStream::default()).await;
        assert_eq!(result, Err(PlaybackError::SurfaceUnavailable(SurfaceSlot::LocalVideo)));
    }

    #[tokio::test]
    async fn test_autoplay_retried_once_on_gesture() {
        let provider = TestProvider::new();
        let audio = TestSurface::blocking(2);
        provider.mount(SurfaceSlot::RemoteAudio, audio.clone());
        let binder = MediaSinkBinder::new(provider.clone(), SinkConfig::default());

        let outcome = binder.bind_remote(&audio_stream()).await.unwrap();
        assert_eq!(outcome, BindOutcome::AwaitingGesture);
        assert_eq!(provider.gestures.receiver_count(), 1);

        provider.gestures.send(UserGesture::Touch).unwrap();
        while provider.gestures.receiver_count() > 0 {
            tokio::task::yield_now().await;
        }
        // Second play was still blocked; the listener is gone anyway
        assert_eq!(audio.plays.load(Ordering::SeqCst), 2);
        assert!(provider.gestures.send(UserGesture::Pointer).is_err());
        assert_eq!(audio.plays.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_detaches_and_cancels_retries() {
        let provider = TestProvider::new();
        let audio = TestSurface::blocking(1);
        provider.mount(SurfaceSlot::RemoteAudio, audio.clone());
        let binder = MediaSinkBinder::new(provider.clone(), SinkConfig::default());
        binder.bind_remote(&audio_stream()).await.unwrap();

        binder.release();
        binder.release();
        assert!(audio.attached.lock().is_none());
        while provider.gestures.receiver_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            binder.bind_remote(&audio_stream()).await.unwrap(),
            BindOutcome::Released
        );
    }
}
