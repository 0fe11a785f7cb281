//! Offer buffering, candidate ordering, supersession and reconnect behaviour

mod common;

use anyhow::Context;
use common::{eventually, settle, Endpoint, FakeMedia, FakePeers, Op};
use peercall_core::signaling::events;
use peercall_core::{
    CallEvent, ConnectionState, MediaKind, MemoryRelay, PeerEvent, PeerId, SdpType, SessionHandle,
    SessionState, TrackKind,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

const VIDEO_OFFER: &str = "v=0\r\ns=offer\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

fn incoming_payload(call_id: &str, from: &str) -> Value {
    json!({
        "callId": call_id,
        "callerId": from,
        "callType": "video",
        "callerInfo": {"displayName": from},
    })
}

fn offer_payload(call_id: &str, from: &str) -> Value {
    json!({
        "callId": call_id,
        "offer": {"type": "offer", "sdp": VIDEO_OFFER},
        "fromUserId": from,
    })
}

fn candidate_line(n: usize) -> String {
    format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 4000{n} typ host")
}

fn candidate_payload(call_id: &str, from: &str, n: usize) -> Value {
    json!({
        "callId": call_id,
        "candidate": {"candidate": candidate_line(n), "sdpMid": "0", "sdpMLineIndex": 0},
        "fromUserId": from,
    })
}

async fn wait_for_session(endpoint: &Endpoint, call_id: &str) -> SessionHandle {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(session) = endpoint.service.current_session() {
                if session.call_id().is_some_and(|id| id.as_str() == call_id) {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

async fn wait_for_pending(session: &SessionHandle, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.pending_candidates().await != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_buffered_offer_answered_after_delay() {
    let relay = MemoryRelay::new();
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    let event = bob
        .expect_event(|e| matches!(e, CallEvent::IncomingCall { .. }))
        .await;
    match event {
        CallEvent::IncomingCall { caller_info, .. } => {
            assert_eq!(caller_info.display_name.as_deref(), Some("alice"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    for n in 0..3 {
        relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", n));
    }
    let session = wait_for_session(&bob, "call-1").await;
    wait_for_pending(&session, 3).await;
    assert!(session.has_pending_offer().await);
    assert_eq!(bob.peers.created(), 0);

    // The user takes two seconds to pick up
    tokio::time::sleep(Duration::from_secs(2)).await;
    bob.service.answer_call().await.unwrap();

    let peer = bob.peers.last().unwrap();
    assert_eq!(
        peer.ops(),
        vec![
            Op::AddTrack(TrackKind::Audio),
            Op::AddTrack(TrackKind::Video),
            Op::SetRemote(SdpType::Offer),
            Op::AddCandidate(candidate_line(0)),
            Op::AddCandidate(candidate_line(1)),
            Op::AddCandidate(candidate_line(2)),
            Op::CreateAnswer,
            Op::SetLocal(SdpType::Answer),
        ]
    );
    assert_eq!(session.pending_candidates().await, 0);
    assert!(!session.has_pending_offer().await);

    let answers = relay.emitted(&bob_id, events::ANSWER);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0]["callId"], "call-1");
    assert_eq!(answers[0]["toUserId"], "alice");
    assert_eq!(answers[0]["answer"]["type"], "answer");

    // Candidates after the remote description are applied directly
    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 3));
    bob.expect_event(|e| {
        matches!(
            e,
            CallEvent::SessionStateChanged {
                new_state: SessionState::Connected,
                ..
            }
        )
    })
    .await;
    settle().await;
    assert_eq!(peer.ops().last(), Some(&Op::AddCandidate(candidate_line(3))));
}

fn connected(event: &CallEvent) -> bool {
    matches!(
        event,
        CallEvent::SessionStateChanged {
            new_state: SessionState::Connected,
            ..
        }
    )
}

#[tokio::test(start_paused = true)]
async fn test_offer_during_media_acquisition_is_buffered_then_answered() -> anyhow::Result<()> {
    let relay = MemoryRelay::new();
    let mut bob = Endpoint::with_fakes(
        &relay,
        "bob",
        FakePeers::connecting(),
        FakeMedia::delayed(Duration::from_secs(2)),
    )
    .await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
    let session = wait_for_session(&bob, "call-1").await;

    let service = bob.service.clone();
    let answering = tokio::spawn(async move { service.answer_call().await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(session.state(), SessionState::AcquiringMedia);

    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    for n in 0..3 {
        relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", n));
    }
    wait_for_pending(&session, 3).await;
    assert!(session.has_pending_offer().await);
    assert_eq!(bob.peers.created(), 0);

    answering.await??;
    let peer = bob.peers.last().context("answer created no peer connection")?;
    assert_eq!(
        peer.ops(),
        vec![
            Op::AddTrack(TrackKind::Audio),
            Op::AddTrack(TrackKind::Video),
            Op::SetRemote(SdpType::Offer),
            Op::AddCandidate(candidate_line(0)),
            Op::AddCandidate(candidate_line(1)),
            Op::AddCandidate(candidate_line(2)),
            Op::CreateAnswer,
            Op::SetLocal(SdpType::Answer),
        ]
    );
    assert_eq!(session.pending_candidates().await, 0);

    bob.expect_event(connected).await;
    assert_eq!(session.state(), SessionState::Connected);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_foreign_call_cannot_claim_pending_outgoing_call() -> anyhow::Result<()> {
    let relay = MemoryRelay::new();
    let mut alice = Endpoint::with_fakes(
        &relay,
        "alice",
        FakePeers::connecting(),
        FakeMedia::delayed(Duration::from_millis(200)),
    )
    .await;
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let alice_id = PeerId::new("alice");

    let service = alice.service.clone();
    let outgoing = tokio::spawn(async move { service.start_call(PeerId::new("bob"), MediaKind::Video).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Carol's call reaches alice before the relay has assigned alice's id
    relay.inject(&alice_id, events::INCOMING, incoming_payload("carol-call", "carol"));
    relay.inject(&alice_id, events::ICE_CANDIDATE, candidate_payload("carol-call", "carol", 0));
    relay.inject(&alice_id, events::ENDED, json!({"callId": "carol-call", "fromUserId": "carol"}));

    let call_id = outgoing.await??;
    assert_ne!(call_id.as_str(), "carol-call");
    let session = alice.service.current_session().context("outgoing call was dropped")?;
    assert_eq!(session.call_id(), Some(call_id.clone()));
    assert!(!session.is_released());
    assert_eq!(session.pending_candidates().await, 0);
    assert!(relay.emitted(&alice_id, events::END).is_empty());
    assert_eq!(
        alice.drain_matching(|e| matches!(e, CallEvent::IncomingCall { .. } | CallEvent::CallEnded { .. })),
        0
    );

    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { call_id: id, .. } if *id == call_id))
        .await;
    bob.service.answer_call().await?;
    alice.expect_event(connected).await;
    Ok(())
}

#[tokio::test]
async fn test_failed_candidate_is_retried_before_the_next_one() -> anyhow::Result<()> {
    let relay = MemoryRelay::new();
    let bob = Endpoint::with_fakes(&relay, "bob", FakePeers::default(), FakeMedia::default()).await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    let session = wait_for_session(&bob, "call-1").await;
    settle().await;
    bob.service.answer_call().await?;
    assert_eq!(session.state(), SessionState::Negotiating);
    let peer = bob.peers.last().context("answer created no peer connection")?;

    peer.reject_candidate_once(candidate_line(0));
    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 0));
    wait_for_pending(&session, 1).await;
    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 1));
    wait_for_pending(&session, 0).await;

    let applied: Vec<Op> = peer
        .ops()
        .into_iter()
        .filter(|op| matches!(op, Op::AddCandidate(_)))
        .collect();
    assert_eq!(
        applied,
        vec![
            Op::AddCandidate(candidate_line(0)),
            Op::AddCandidate(candidate_line(1)),
        ]
    );

    // Once connected a rejected candidate is dropped, not parked
    peer.raise(PeerEvent::ConnectionState(ConnectionState::Connected));
    eventually(|| session.state() == SessionState::Connected).await;
    peer.reject_candidate_once(candidate_line(2));
    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 2));
    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 3));
    eventually(|| peer.ops().contains(&Op::AddCandidate(candidate_line(3)))).await;
    assert_eq!(session.pending_candidates().await, 0);
    assert!(!peer.ops().contains(&Op::AddCandidate(candidate_line(2))));
    Ok(())
}

#[tokio::test]
async fn test_duplicate_offer_is_ignored_and_newer_offer_replaces() {
    let relay = MemoryRelay::new();
    let bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    relay.inject(
        &bob_id,
        events::OFFER,
        json!({
            "callId": "call-1",
            "offer": {"type": "offer", "sdp": "v=0\r\ns=newer\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"},
            "fromUserId": "alice",
        }),
    );
    let session = wait_for_session(&bob, "call-1").await;
    settle().await;
    assert!(session.has_pending_offer().await);

    bob.service.answer_call().await.unwrap();
    let peer = bob.peers.last().unwrap();
    let remote_sets = peer
        .ops()
        .into_iter()
        .filter(|op| *op == Op::SetRemote(SdpType::Offer))
        .count();
    assert_eq!(remote_sets, 1);

    // Only the newer, audio-only offer produced remote tracks
    settle().await;
    let remote = session.remote_stream().await.unwrap();
    assert_eq!(remote.tracks.len(), 1);
    assert!(!remote.has_video());
}

#[tokio::test]
async fn test_offer_from_wrong_peer_is_discarded() {
    let relay = MemoryRelay::new();
    let bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "mallory"));
    let session = wait_for_session(&bob, "call-1").await;
    settle().await;
    assert!(!session.has_pending_offer().await);
}

#[tokio::test]
async fn test_answer_before_offer_waits_for_remote_description() {
    let relay = MemoryRelay::new();
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    let session = wait_for_session(&bob, "call-1").await;
    bob.service.answer_call().await.unwrap();
    assert_eq!(session.state(), SessionState::AwaitingRemoteDescription);

    relay.inject(&bob_id, events::ICE_CANDIDATE, candidate_payload("call-1", "alice", 0));
    wait_for_pending(&session, 1).await;

    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    bob.expect_event(|e| {
        matches!(
            e,
            CallEvent::SessionStateChanged {
                new_state: SessionState::Connected,
                ..
            }
        )
    })
    .await;

    let ops = bob.peers.last().unwrap().ops();
    let set_remote = ops.iter().position(|op| *op == Op::SetRemote(SdpType::Offer)).unwrap();
    let candidate = ops
        .iter()
        .position(|op| *op == Op::AddCandidate(candidate_line(0)))
        .unwrap();
    assert!(set_remote < candidate);
    assert_eq!(relay.emitted(&bob_id, events::ANSWER).len(), 1);
}

#[tokio::test]
async fn test_message_for_other_call_is_dropped() {
    let relay = MemoryRelay::new();
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. })).await;

    relay.inject(&bob_id, events::OFFER, offer_payload("call-2", "carol"));
    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-3", "dave"));
    relay.inject(&bob_id, events::ENDED, json!({"callId": "call-2", "fromUserId": "carol"}));
    settle().await;

    let current = bob.service.current_call().unwrap();
    assert_eq!(current.call_id.unwrap().as_str(), "call-1");
    assert_eq!(current.state, SessionState::Ringing);
    assert_eq!(bob.drain_matching(|e| matches!(e, CallEvent::IncomingCall { .. })), 0);
    assert_eq!(bob.peers.created(), 0);
}

#[tokio::test]
async fn test_new_call_supersedes_disconnected_session() {
    let relay = MemoryRelay::new();
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    relay.inject(&bob_id, events::OFFER, offer_payload("call-1", "alice"));
    let old = wait_for_session(&bob, "call-1").await;
    settle().await;
    bob.service.answer_call().await.unwrap();
    bob.expect_event(|e| {
        matches!(
            e,
            CallEvent::SessionStateChanged {
                new_state: SessionState::Connected,
                ..
            }
        )
    })
    .await;

    let old_peer = bob.peers.last().unwrap();
    old_peer.raise(PeerEvent::ConnectionState(ConnectionState::Disconnected));
    tokio::time::timeout(Duration::from_secs(5), async {
        while old.connection_state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(old.is_supersedable());

    relay.inject(&bob_id, events::OFFER, offer_payload("call-2", "carol"));
    let event = bob
        .expect_event(|e| matches!(e, CallEvent::IncomingCall { call_id, .. } if call_id.as_str() == "call-2"))
        .await;
    match event {
        CallEvent::IncomingCall { call_id, from, .. } => {
            assert_eq!(call_id.as_str(), "call-2");
            assert_eq!(from.as_str(), "carol");
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(old.is_released());
    assert!(old_peer.is_closed());
    let new = wait_for_session(&bob, "call-2").await;
    assert!(new.has_pending_offer().await);
    assert_eq!(new.state(), SessionState::Ringing);
}

#[tokio::test]
async fn test_reconnect_registers_listeners_once() {
    let relay = MemoryRelay::new();
    let alice = Endpoint::connect(&relay, "alice").await;
    let mut bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");
    assert_eq!(bob.transport.listener_count(), events::INBOUND.len());

    bob.transport.disconnect();
    assert!(!relay.is_online(&bob_id));
    bob.transport.reconnect().await;
    bob.transport.disconnect();
    bob.transport.reconnect().await;

    assert_eq!(bob.transport.listener_count(), events::INBOUND.len());
    assert_eq!(relay.emitted(&bob_id, events::USER_ONLINE).len(), 3);

    alice
        .service
        .start_call(bob_id.clone(), MediaKind::Audio)
        .await
        .unwrap();
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
    settle().await;
    assert_eq!(bob.drain_matching(|e| matches!(e, CallEvent::IncomingCall { .. })), 0);
}

#[tokio::test]
async fn test_call_survives_signaling_reconnect() {
    let relay = MemoryRelay::new();
    let mut alice = Endpoint::connect(&relay, "alice").await;
    let mut bob = Endpoint::connect(&relay, "bob").await;

    alice
        .service
        .start_call(PeerId::new("bob"), MediaKind::Audio)
        .await
        .unwrap();
    bob.expect_event(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.service.answer_call().await.unwrap();
    alice
        .expect_event(|e| {
            matches!(
                e,
                CallEvent::SessionStateChanged {
                    new_state: SessionState::Connected,
                    ..
                }
            )
        })
        .await;

    bob.transport.disconnect();
    bob.transport.reconnect().await;
    assert_eq!(bob.service.current_call().unwrap().state, SessionState::Connected);

    alice.service.end_call().await.unwrap();
    bob.expect_event(|e| matches!(e, CallEvent::EndedByRemote { .. })).await;
    settle().await;
    assert_eq!(bob.drain_matching(|e| matches!(e, CallEvent::EndedByRemote { .. })), 0);
    assert!(bob.service.current_call().is_none());
}

/// Injects `candidates` candidates with the offer at `offer_at`, answering
/// after `answer_at` messages; returns the responder's peer operations
async fn run_interleaving(candidates: usize, offer_at: usize, answer_at: usize) -> Vec<Op> {
    let relay = MemoryRelay::new();
    let bob = Endpoint::connect(&relay, "bob").await;
    let bob_id = PeerId::new("bob");

    relay.inject(&bob_id, events::INCOMING, incoming_payload("call-1", "alice"));
    wait_for_session(&bob, "call-1").await;

    let mut messages = Vec::new();
    let mut next_candidate = 0;
    for position in 0..=candidates {
        if position == offer_at {
            messages.push((events::OFFER, offer_payload("call-1", "alice")));
        } else {
            messages.push((
                events::ICE_CANDIDATE,
                candidate_payload("call-1", "alice", next_candidate),
            ));
            next_candidate += 1;
        }
    }

    for (index, (event, payload)) in messages.into_iter().enumerate() {
        if index == answer_at {
            bob.service.answer_call().await.unwrap();
        }
        relay.inject(&bob_id, event, payload);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    if answer_at > candidates {
        bob.service.answer_call().await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = bob.peers.last().is_some_and(|peer| {
                let ops = peer.ops();
                ops.contains(&Op::CreateAnswer)
                    && ops.iter().filter(|op| matches!(op, Op::AddCandidate(_))).count() == candidates
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    bob.peers.last().map(|peer| peer.ops()).unwrap_or_default()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_candidates_follow_remote_description_in_order(
        candidates in 0usize..5,
        offer_at in 0usize..6,
        answer_at in 0usize..7,
    ) {
        let offer_at = offer_at.min(candidates);
        let answer_at = answer_at.min(candidates + 1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let ops = runtime.block_on(run_interleaving(candidates, offer_at, answer_at));

        let set_remote = ops.iter().position(|op| *op == Op::SetRemote(SdpType::Offer));
        prop_assert!(set_remote.is_some());
        let set_remote = set_remote.unwrap_or_default();

        let applied: Vec<(usize, String)> = ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match op {
                Op::AddCandidate(c) => Some((i, c.clone())),
                _ => None,
            })
            .collect();
        prop_assert!(applied.iter().all(|(i, _)| *i > set_remote));
        let order: Vec<String> = applied.into_iter().map(|(_, c)| c).collect();
        let expected: Vec<String> = (0..candidates).map(candidate_line).collect();
        prop_assert_eq!(order, expected);
    }
}
