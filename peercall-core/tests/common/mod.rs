//! Shared fakes for call flow tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_core::peer::{PeerConnectionFactory, PeerConnectionHandle, PeerError, PeerEvent, PeerEventSender};
use peercall_core::{
    CallEvent, CallService, ConnectionState, HeadlessSurfaces, IceCandidate, IceServer, LocalStream,
    LocalTrack, MediaConstraints, MediaError, MediaSource, MemoryRelay, MemoryTransport, RemoteTrack, SdpType,
    SessionDescription, TrackKind,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

/// Peer connection operation, as observed by the fake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTrack(TrackKind),
    ReplaceTrack(String),
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Fake peer connection
pub struct FakePeer {
    pub index: usize,
    ops: Mutex<Vec<Op>>,
    kinds: Mutex<Vec<TrackKind>>,
    rejected_candidates: Mutex<Vec<String>>,
    remote_set: AtomicBool,
    local_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    events: PeerEventSender,
    auto_connect: bool,
    offer_gate: Option<Arc<Semaphore>>,
}

impl FakePeer {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the next attempt to add `candidate` fail
    pub fn reject_candidate_once(&self, candidate: impl Into<String>) {
        self.rejected_candidates.lock().push(candidate.into());
    }

    /// Push a peer event as if the native connection raised it
    pub fn raise(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, op: Op) {
        self.ops.lock().push(op);
    }

    fn sdp(&self, kind: &str) -> String {
        let mut sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns={kind}\r\n", self.index);
        for track in self.kinds.lock().iter() {
            match track {
                TrackKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
                TrackKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
            }
        }
        sdp
    }

    fn maybe_connect(&self) {
        if !self.auto_connect
            || !self.local_set.load(Ordering::SeqCst)
            || !self.remote_set.load(Ordering::SeqCst)
            || self.connected.swap(true, Ordering::SeqCst)
        {
            return;
        }
        self.raise(PeerEvent::ConnectionState(ConnectionState::Connecting));
        self.raise(PeerEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerConnectionHandle for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.kinds.lock().push(track.kind());
        self.record(Op::AddTrack(track.kind()));
        Ok(())
    }

    async fn replace_track(&self, old_track_id: &str, _track: &LocalTrack) -> Result<(), PeerError> {
        self.record(Op::ReplaceTrack(old_track_id.to_string()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        if let Some(gate) = &self.offer_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| PeerError::Sdp("offer gate closed".to_string()))?;
            permit.forget();
        }
        self.record(Op::CreateOffer { ice_restart });
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::Sdp("no remote description".to_string()));
        }
        self.record(Op::CreateAnswer);
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(Op::SetLocal(description.sdp_type));
        self.local_set.store(true, Ordering::SeqCst);
        self.raise(PeerEvent::LocalCandidate(IceCandidate::new(
            format!("candidate:{} 1 udp 2122260223 127.0.0.1 5000{} typ host", self.index, self.index),
            Some("0".to_string()),
            Some(0),
        )));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(Op::SetRemote(description.sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        let stream_id = format!("remote-stream-{}", self.index);
        for (n, line) in description.sdp.lines().filter(|l| l.starts_with("m=")).enumerate() {
            let kind = if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            self.raise(PeerEvent::RemoteTrack {
                track: RemoteTrack::new(format!("{stream_id}-{n}"), kind),
                stream_ids: vec![stream_id.clone()],
            });
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::Candidate("remote description not set".to_string()));
        }
        {
            let mut rejected = self.rejected_candidates.lock();
            if let Some(index) = rejected.iter().position(|c| *c == candidate.candidate) {
                rejected.remove(index);
                return Err(PeerError::Candidate("candidate rejected".to_string()));
            }
        }
        self.record(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Closed
        } else if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::New
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(Op::Close);
        }
        Ok(())
    }
}

/// Fake peer connection factory that keeps every connection it creates
#[derive(Default)]
pub struct FakePeers {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    auto_connect: bool,
    offer_gate: Option<Arc<Semaphore>>,
}

impl FakePeers {
    /// Connections reach `Connected` once both descriptions are set
    pub fn connecting() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// `create_offer` waits for a permit on `gate`
    pub fn with_offer_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.offer_gate = Some(gate);
        self
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeers {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnectionHandle>, PeerError> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(FakePeer {
            index: peers.len(),
            ops: Mutex::new(Vec::new()),
            kinds: Mutex::new(Vec::new()),
            rejected_candidates: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            local_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            auto_connect: self.auto_connect,
            offer_gate: self.offer_gate.clone(),
        });
        peers.push(peer.clone());
        let handle: Arc<dyn PeerConnectionHandle> = peer;
        Ok(handle)
    }
}

/// Fake media source that remembers every stream it handed out
#[derive(Default)]
pub struct FakeMedia {
    acquired: Mutex<Vec<LocalStream>>,
    counter: AtomicUsize,
    delay: Option<Duration>,
    failure: Option<MediaError>,
}

impl FakeMedia {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> Vec<LocalStream> {
        self.acquired.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.acquired
            .lock()
            .iter()
            .flat_map(|s| s.tracks.iter())
            .all(LocalTrack::is_stopped)
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(format!("mic-{n}"), TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(LocalTrack::from_parts(
                format!("cam-{n}"),
                TrackKind::Video,
                Some(constraints.facing),
                None,
            ));
        }
        let stream = LocalStream::new(format!("local-{n}"), tracks);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }
}

/// One user wired to a relay with fake capabilities
pub struct Endpoint {
    pub service: Arc<CallService>,
    pub transport: MemoryTransport,
    pub peers: Arc<FakePeers>,
    pub media: Arc<FakeMedia>,
    pub surfaces: Arc<HeadlessSurfaces>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Endpoint {
    pub async fn connect(relay: &MemoryRelay, user: &str) -> Self {
        Self::with_fakes(relay, user, FakePeers::connecting(), FakeMedia::default()).await
    }

    pub async fn with_fakes(relay: &MemoryRelay, user: &str, peers: FakePeers, media: FakeMedia) -> Self {
        init_tracing();
        let peers = Arc::new(peers);
        let media = Arc::new(media);
        let surfaces = Arc::new(HeadlessSurfaces::new());
        let transport = relay.transport(user);
        let service = CallService::builder(Arc::new(transport.clone()))
            .with_local_peer(user)
            .with_peer_factory(peers.clone())
            .with_media_source(media.clone())
            .with_surfaces(surfaces.clone())
            .build()
            .await
            .unwrap();
        service.connect().await.unwrap();
        let events = service.subscribe_events();
        Self {
            service: Arc::new(service),
            transport,
            peers,
            media,
            surfaces,
            events,
        }
    }

    /// Wait for the first event matching `predicate`
    pub async fn expect_event<F>(&mut self, mut predicate: F) -> CallEvent
    where
        F: FnMut(&CallEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap()
    }

    /// Events received so far that match `predicate`
    pub fn drain_matching<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&CallEvent) -> bool,
    {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            if predicate(&event) {
                count += 1;
            }
        }
        count
    }
}

/// Route engine logs to the test harness; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Let spawned dispatch tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
