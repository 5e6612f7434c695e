//! Signaling-driven relay behaviour with fake transports
//!
//! Run with: cargo test -p fanout-server --test orchestrator_tests

#[macro_use]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeRemoteTrack, FakeTransportFactory, RecordingSignal, offer, rtp};
use fanout_protocol::{OutboundEvent, OutboundSignal, SdpType};
use fanout_server::relay::Relay;
use fanout_server::sfu::{
    ConnectivityState, ForwarderRegistry, MediaKind, SessionConfig, TransportEvent,
};
use fanout_server::signaling::OrchestratorSettings;
use serde_json::{Value, json};

struct Harness {
    relay: Arc<Relay>,
    factory: Arc<FakeTransportFactory>,
    signal: Arc<RecordingSignal>,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(OrchestratorSettings::default())
    }

    fn with_settings(settings: OrchestratorSettings) -> Self {
        let factory = FakeTransportFactory::new();
        let signal = RecordingSignal::new();
        let relay = Relay::new(
            settings,
            Arc::new(ForwarderRegistry::new()),
            factory.clone(),
            signal.clone(),
        );
        Self {
            relay,
            factory,
            signal,
        }
    }

    async fn send(&self, frame: String) {
        self.relay.handle_frame(&frame).await;
    }

    async fn sdp(&self, endpoint: &str, stream: &str, role: &str, session: &str) {
        let description = offer();
        let payload = json!({ "type": "offer", "sdp": description.sdp });
        self.send(frame(endpoint, stream, role, session, "sdp", Some(payload)))
            .await;
    }

    async fn candidate(&self, endpoint: &str, stream: &str, session: &str, candidate: &str) {
        let payload = json!({ "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 });
        self.send(frame(endpoint, stream, "dest", session, "candidate", Some(payload)))
            .await;
    }

    /// Wait until every event queued so far for `endpoint` has been handled
    async fn settle(&self, endpoint: &str) {
        let marker = format!("settle-{}", self.signal.sent().len());
        self.send(frame(endpoint, "settle", "dest", &marker, "reconnect", None))
            .await;
        wait_until!(self.signal.count_named(&marker, "reconnect-ok") == 1);
    }

    async fn subscribers(&self, stream: &str) -> usize {
        self.relay
            .registry()
            .stats()
            .await
            .into_iter()
            .find(|stats| stats.stream_id == stream)
            .map(|stats| stats.subscribers)
            .unwrap_or(0)
    }
}

fn frame(
    endpoint: &str,
    stream: &str,
    role: &str,
    session: &str,
    event: &str,
    payload: Option<Value>,
) -> String {
    let mut values = vec![
        json!(endpoint),
        json!(stream),
        json!(role),
        json!(session),
        json!(event),
    ];
    values.extend(payload);
    Value::Array(values).to_string()
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let harness = Harness::new();
    harness
        .send(r#"["manager-1","process-mgr","ping"]"#.to_string())
        .await;

    assert_eq!(
        harness.signal.sent(),
        vec![OutboundSignal::Pong {
            to: "manager-1".to_string()
        }]
    );
    let wire: Vec<Value> =
        serde_json::from_str(&harness.signal.sent()[0].to_json()).unwrap();
    assert_eq!(wire, vec![json!("manager-1"), json!("process-mgr"), json!("pong")]);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let harness = Harness::new();
    harness.send("not json".to_string()).await;
    harness.send("{}".to_string()).await;
    harness.send(r#"["a","b","c","d"]"#.to_string()).await;
    harness
        .send(frame("ep", "st", "dest", "s1", "dance", None))
        .await;
    harness
        .send(frame("ep", "st", "dest", "s1", "sdp", Some(json!(42))))
        .await;
    harness
        .send(frame("ep", "st", "king", "s1", "ok", None))
        .await;

    harness.settle("ep").await;
    assert!(harness.signal.events_for("s1").is_empty());
    assert_eq!(harness.factory.created(), 0);
}

#[tokio::test]
async fn test_offer_is_answered() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "source", "s1").await;

    wait_until!(harness.signal.count_named("s1", "sdp") == 1);
    let answer = harness.signal.events_for("s1").remove(0);
    match answer {
        OutboundEvent::Sdp(description) => {
            assert_eq!(description.sdp_type, SdpType::Answer);
            assert!(description.sdp.contains("answer-s1"));
        }
        other => panic!("expected sdp answer, got {:?}", other),
    }

    let transport = harness.factory.transport("s1").unwrap();
    assert_eq!(transport.remote_descriptions(), vec![offer()]);
    assert_eq!(transport.params.stream_id, "cam");

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.session_count().await, 1);
}

#[tokio::test]
async fn test_candidates_ahead_of_session_are_cached_then_replayed() {
    let harness = Harness::new();
    harness.candidate("ep", "cam", "s1", "early-1").await;
    harness.candidate("ep", "cam", "s1", "early-2").await;
    harness.settle("ep").await;

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.cached_candidates().await, 2);

    harness.sdp("ep", "cam", "dest", "s1").await;
    wait_until!(harness.signal.count_named("s1", "sdp") == 1);

    let transport = harness.factory.transport("s1").unwrap();
    assert_eq!(transport.candidates(), vec!["early-1", "early-2"]);
    assert_eq!(orchestrator.cached_candidates().await, 0);

    harness.candidate("ep", "cam", "s1", "late").await;
    harness.settle("ep").await;
    assert_eq!(transport.candidates(), vec!["early-1", "early-2", "late"]);
}

#[tokio::test]
async fn test_candidate_for_other_session_is_cached() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "dest", "s1").await;
    harness.candidate("ep", "cam", "s2", "next-session").await;
    harness.settle("ep").await;

    let transport = harness.factory.transport("s1").unwrap();
    assert!(transport.candidates().is_empty());
    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.cached_candidates().await, 1);
}

#[tokio::test]
async fn test_ok_and_reconnect_are_acknowledged() {
    let harness = Harness::new();
    harness.send(frame("ep", "cam", "dest", "s1", "ok", None)).await;
    harness
        .send(frame("ep", "cam", "dest", "s1", "reconnect", None))
        .await;

    wait_until!(harness.signal.events_for("s1").len() == 2);
    assert_eq!(
        harness.signal.events_for("s1"),
        vec![OutboundEvent::Ok, OutboundEvent::ReconnectOk]
    );
}

#[tokio::test]
async fn test_new_offer_replaces_session_for_stream() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "dest", "s1").await;
    harness.sdp("ep", "cam", "dest", "s2").await;
    wait_until!(harness.signal.count_named("s2", "sdp") == 1);

    let first = harness.factory.transport("s1").unwrap();
    let second = harness.factory.transport("s2").unwrap();
    assert_eq!(first.close_count(), 1);
    assert_eq!(second.close_count(), 0);

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    let current = orchestrator.session("cam").await.unwrap();
    assert_eq!(current.session_id(), "s2");
    // The replaced session's slot went back to the pool
    assert_eq!(orchestrator.slots().occupied().await, 1);
}

#[tokio::test]
async fn test_close_for_replaced_session_is_ignored() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "dest", "s1").await;
    harness.sdp("ep", "cam", "dest", "s2").await;
    harness.send(frame("ep", "cam", "dest", "s1", "close", None)).await;
    harness.settle("ep").await;

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.session("cam").await.unwrap().session_id(), "s2");
    assert_eq!(harness.factory.transport("s2").unwrap().close_count(), 0);

    harness.send(frame("ep", "cam", "dest", "s2", "close", None)).await;
    harness.settle("ep").await;
    assert!(orchestrator.session("cam").await.is_none());
    assert_eq!(harness.factory.transport("s2").unwrap().close_count(), 1);
    assert_eq!(orchestrator.slots().occupied().await, 0);
}

#[tokio::test]
async fn test_exhausted_pool_is_reported() {
    let harness = Harness::with_settings(OrchestratorSettings {
        slot_capacity: 1,
        ..Default::default()
    });
    harness.sdp("ep", "a", "dest", "s1").await;
    harness.sdp("ep", "b", "dest", "s2").await;

    wait_until!(harness.signal.count_named("s2", "error") == 1);
    match &harness.signal.events_for("s2")[0] {
        OutboundEvent::Error(reason) => assert!(reason.contains("No free track slot")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(harness.factory.created(), 1);

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert!(orchestrator.session("b").await.is_none());
    assert!(orchestrator.session("a").await.is_some());
}

#[tokio::test]
async fn test_internal_failures_are_not_reported() {
    let harness = Harness::new();
    harness.factory.fail_next_create();
    harness.sdp("ep", "cam", "source", "s1").await;
    harness.settle("ep").await;

    assert!(harness.signal.events_for("s1").is_empty());
    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.session_count().await, 0);
}

#[tokio::test]
async fn test_negotiation_failure_is_reported_and_cleaned_up() {
    let harness = Harness::new();
    harness.factory.reject_next_offer();
    harness.sdp("ep", "cam", "dest", "s1").await;

    wait_until!(harness.signal.count_named("s1", "error") == 1);
    match &harness.signal.events_for("s1")[0] {
        OutboundEvent::Error(reason) => assert!(reason.contains("Negotiation failed")),
        other => panic!("expected error, got {:?}", other),
    }

    let transport = harness.factory.transport("s1").unwrap();
    assert_eq!(transport.close_count(), 1);
    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert!(orchestrator.session("cam").await.is_none());
    assert_eq!(orchestrator.slots().occupied().await, 0);
}

#[tokio::test]
async fn test_failed_replacement_leaves_stream_empty() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "dest", "s1").await;
    wait_until!(harness.signal.count_named("s1", "sdp") == 1);
    let transport = harness.factory.transport("s1").unwrap();

    harness.factory.fail_next_create();
    harness.sdp("ep", "cam", "dest", "s2").await;
    harness.settle("ep").await;

    assert_eq!(transport.close_count(), 1);
    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert!(orchestrator.session("cam").await.is_none());
    assert_eq!(orchestrator.slots().occupied().await, 0);
}

#[tokio::test]
async fn test_local_candidates_are_signaled() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "source", "s1").await;
    wait_until!(harness.factory.transport("s1").is_some());

    let transport = harness.factory.transport("s1").unwrap();
    transport.emit(TransportEvent::LocalCandidate(
        fanout_protocol::IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
    ));

    wait_until!(harness.signal.count_named("s1", "candidate") == 1);
    let wire = harness
        .signal
        .sent()
        .into_iter()
        .find(|m| m.event_name() == "candidate")
        .unwrap()
        .to_values();
    assert_eq!(wire[0], json!("ep"));
    assert_eq!(wire[1], json!("cam"));
    assert_eq!(wire[2], json!("source"));
    assert_eq!(wire[5]["candidate"], json!("candidate:1 1 udp 1 10.0.0.1 5000 typ host"));
}

#[tokio::test]
async fn test_failed_session_is_removed_after_grace() {
    let harness = Harness::with_settings(OrchestratorSettings {
        session: SessionConfig {
            failed_grace: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    });
    harness.sdp("ep", "cam", "dest", "s1").await;
    wait_until!(harness.signal.count_named("s1", "sdp") == 1);

    let transport = harness.factory.transport("s1").unwrap();
    transport.emit(TransportEvent::Connectivity(ConnectivityState::Failed));

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    wait_until!(orchestrator.session_count().await == 0);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(orchestrator.slots().occupied().await, 0);
}

#[tokio::test]
async fn test_closed_connection_removes_session() {
    let harness = Harness::new();
    harness.sdp("ep", "cam", "source", "s1").await;
    wait_until!(harness.signal.count_named("s1", "sdp") == 1);

    let transport = harness.factory.transport("s1").unwrap();
    transport.emit(TransportEvent::Connectivity(ConnectivityState::Closed));

    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    wait_until!(orchestrator.session_count().await == 0);
    assert_eq!(transport.close_count(), 1);
}

#[tokio::test]
async fn test_media_flows_from_source_to_dest() {
    let harness = Harness::new();

    harness.sdp("publisher", "cam", "source", "p1").await;
    wait_until!(harness.signal.count_named("p1", "sdp") == 1);
    let source = harness.factory.transport("p1").unwrap();
    let (track, packets) = FakeRemoteTrack::new(MediaKind::Video, 5000);
    source.emit(TransportEvent::Connectivity(ConnectivityState::Connected));
    source.emit(TransportEvent::RemoteTrack(track));
    wait_until!(harness.relay.registry().get("cam").await.is_some());

    harness.sdp("viewer", "cam", "dest", "v1").await;
    wait_until!(harness.signal.count_named("v1", "sdp") == 1);
    let dest = harness.factory.transport("v1").unwrap();
    assert_eq!(dest.params.local_track_label(), "1");
    dest.emit(TransportEvent::Connectivity(ConnectivityState::Connected));
    wait_until!(harness.subscribers("cam").await == 1);

    for seq in 1..=3 {
        packets.send(rtp(5000, seq)).unwrap();
    }
    wait_until!(dest.written().len() == 3);
    let written = dest.written();
    assert!(written.iter().all(|(kind, _)| *kind == MediaKind::Video));
    let seqs: Vec<u16> = written.iter().map(|(_, p)| p.header.sequence_number).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    // Publisher reconnects; the viewer keeps its subscription and numbering
    harness.sdp("publisher", "cam", "source", "p2").await;
    wait_until!(harness.signal.count_named("p2", "sdp") == 1);
    assert_eq!(source.close_count(), 1);
    assert_eq!(harness.subscribers("cam").await, 1);

    let replacement = harness.factory.transport("p2").unwrap();
    let (track, packets) = FakeRemoteTrack::new(MediaKind::Video, 6000);
    replacement.emit(TransportEvent::Connectivity(ConnectivityState::Connected));
    replacement.emit(TransportEvent::RemoteTrack(track));
    tokio::time::sleep(Duration::from_millis(50)).await;

    packets.send(rtp(6000, 900)).unwrap();
    packets.send(rtp(6000, 901)).unwrap();
    wait_until!(dest.written().len() == 5);
    let seqs: Vec<u16> = dest
        .written()
        .iter()
        .map(|(_, p)| p.header.sequence_number)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    // Viewer leaves
    harness.send(frame("viewer", "cam", "dest", "v1", "close", None)).await;
    wait_until!(harness.subscribers("cam").await == 0);
    assert_eq!(dest.close_count(), 1);
}

#[tokio::test]
async fn test_self_session_loops_back() {
    let harness = Harness::new();
    harness.sdp("ep", "echo", "self", "s1").await;
    wait_until!(harness.signal.count_named("s1", "sdp") == 1);

    let transport = harness.factory.transport("s1").unwrap();
    assert_eq!(transport.params.local_track_label(), "echo");
    let (track, packets) = FakeRemoteTrack::new(MediaKind::Audio, 77);
    transport.emit(TransportEvent::RemoteTrack(track));
    transport.emit(TransportEvent::Connectivity(ConnectivityState::Connected));

    wait_until!({
        let _ = packets.send(rtp(77, 1));
        !transport.written().is_empty()
    });
    assert_eq!(transport.written()[0].0, MediaKind::Audio);
    assert_eq!(transport.written()[0].1.header.ssrc, 77);
}

#[tokio::test]
async fn test_endpoints_are_isolated() {
    let harness = Harness::with_settings(OrchestratorSettings {
        slot_capacity: 1,
        ..Default::default()
    });
    harness.sdp("ep-a", "cam", "dest", "a1").await;
    harness.sdp("ep-b", "cam", "dest", "b1").await;
    wait_until!(harness.signal.count_named("a1", "sdp") == 1);
    wait_until!(harness.signal.count_named("b1", "sdp") == 1);

    let a = harness.relay.orchestrator("ep-a").await.unwrap();
    let b = harness.relay.orchestrator("ep-b").await.unwrap();
    assert_eq!(a.slots().occupied().await, 1);
    assert_eq!(b.slots().occupied().await, 1);
}

#[tokio::test]
async fn test_idle_endpoints_are_pruned() {
    let harness = Harness::new();
    harness.sdp("ep-a", "cam", "dest", "a1").await;
    harness.sdp("ep-b", "cam", "dest", "b1").await;
    harness.send(frame("ep-a", "cam", "dest", "a1", "close", None)).await;
    harness.settle("ep-a").await;
    harness.settle("ep-b").await;

    wait_until!(harness.relay.prune_idle_endpoints().await == 1);
    assert!(harness.relay.orchestrator("ep-a").await.is_none());
    assert!(harness.relay.orchestrator("ep-b").await.is_some());

    // A returning endpoint gets a fresh orchestrator
    harness.sdp("ep-a", "cam", "dest", "a2").await;
    wait_until!(harness.signal.count_named("a2", "sdp") == 1);
    let a = harness.relay.orchestrator("ep-a").await.unwrap();
    assert_eq!(a.session_count().await, 1);
}

#[tokio::test]
async fn test_stats_task_runs_and_prunes() {
    let harness = Harness::new();
    harness.sdp("publisher", "cam", "source", "p1").await;
    wait_until!(harness.signal.count_named("p1", "sdp") == 1);
    harness
        .factory
        .transport("p1")
        .unwrap()
        .emit(TransportEvent::Connectivity(ConnectivityState::Connected));
    wait_until!(harness.relay.registry().get("cam").await.is_some());
    harness.settle("idle").await;

    let stats = harness.relay.spawn_stats(Duration::from_millis(20));
    wait_until!(harness.relay.orchestrator("idle").await.is_none());
    assert!(harness.relay.orchestrator("publisher").await.is_some());
    stats.abort();
}

#[tokio::test]
async fn test_endpoint_with_cached_candidates_is_kept() {
    let harness = Harness::new();
    harness.candidate("ep", "cam", "s1", "candidate:1 1 udp 1 10.0.0.1 5000 typ host").await;
    harness.settle("ep").await;

    assert_eq!(harness.relay.prune_idle_endpoints().await, 0);
    let orchestrator = harness.relay.orchestrator("ep").await.unwrap();
    assert_eq!(orchestrator.cached_candidates().await, 1);
}

#[tokio::test]
async fn test_target_bitrate_is_shared() {
    let harness = Harness::new();
    assert_eq!(harness.relay.target_bitrate(), 500);
    harness.relay.set_target_bitrate(1200);
    assert_eq!(harness.relay.target_bitrate(), 1200);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let harness = Harness::new();
    harness.sdp("publisher", "cam", "source", "p1").await;
    harness.sdp("viewer", "cam", "dest", "v1").await;
    wait_until!(harness.signal.count_named("p1", "sdp") == 1);
    wait_until!(harness.signal.count_named("v1", "sdp") == 1);
    harness
        .factory
        .transport("p1")
        .unwrap()
        .emit(TransportEvent::Connectivity(ConnectivityState::Connected));
    wait_until!(harness.relay.registry().get("cam").await.is_some());

    harness.relay.shutdown().await;

    assert_eq!(harness.factory.transport("p1").unwrap().close_count(), 1);
    assert_eq!(harness.factory.transport("v1").unwrap().close_count(), 1);
    assert!(harness.relay.registry().is_empty().await);
    assert!(harness.relay.orchestrator("viewer").await.is_none());
}
