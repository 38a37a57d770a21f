//! Start/teardown behaviour of the session coordinator against fakes.

use crate::helpers::{Harness, Scripted, eventually};
use plate_voice::config::{DEFAULT_INSTRUCTIONS, SessionConfig};
use plate_voice::realtime::SessionTarget;
use plate_voice::session::{SessionPhase, TeardownStep, VoiceEvent};
use plate_voice::token::SessionCredential;
use plate_voice::VoiceError;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn happy_path_attaches_everything() {
    let h = Harness::new();

    let handle = h.coordinator.start_session(None).await.unwrap();

    assert!(h.coordinator.is_live());
    assert_eq!(h.coordinator.phase(), SessionPhase::Active);
    assert_eq!(handle.agent_id(), Some("agentA"));

    let conn = h.provider.connection(0);
    assert_eq!(conn.token(), "tok1");
    assert_eq!(conn.params.target, SessionTarget::Agent("agentA".into()));
    let sent = conn.sent_local.lock().unwrap().clone().unwrap();
    assert!(sent.same_as(&h.mic.stream(0)));

    let snapshot = h.coordinator.snapshot();
    assert_eq!(snapshot.session_id.as_deref(), Some(handle.id()));
    assert_eq!(snapshot.connection_id.as_deref(), Some("conn-1"));
    assert!(snapshot.microphone_attached);
    assert!(snapshot.remote_attached);
    assert!(!snapshot.starting);

    let sink = h.coordinator.playback_sink().unwrap();
    assert_eq!(sink.id(), "voice-agent-audio");
    assert_eq!(sink.source_id().as_deref(), Some("conn-1-remote"));
    assert!(!sink.is_muted());
    assert!(sink.is_playing());
}

#[tokio::test]
async fn remote_audio_reaches_the_output() {
    let h = Harness::new();
    h.coordinator.start_session(None).await.unwrap();

    h.provider.connection(0).speak(vec![0.25; 16]).await;

    let output = h.output.clone();
    assert!(eventually(|| output.written.lock().unwrap().len() == 16).await);
}

#[tokio::test]
async fn instructions_are_used_only_without_agent() {
    let h = Harness::new();
    h.tokens
        .push(Scripted::Credential(SessionCredential::new("tok2")));
    let handle = h.coordinator.start_session(Some("Be brief")).await.unwrap();
    assert_eq!(handle.agent_id(), None);
    assert_eq!(
        h.provider.connection(0).params.target,
        SessionTarget::Instructions("Be brief".into())
    );

    h.tokens
        .push(Scripted::Credential(SessionCredential::new("tok3")));
    h.coordinator.start_session(None).await.unwrap();
    assert_eq!(
        h.provider.connection(1).params.target,
        SessionTarget::Instructions(DEFAULT_INSTRUCTIONS.into())
    );

    // An agent id wins over caller instructions.
    h.coordinator.start_session(Some("ignored")).await.unwrap();
    assert_eq!(
        h.provider.connection(2).params.target,
        SessionTarget::Agent("agentA".into())
    );
}

#[tokio::test]
async fn teardown_releases_every_resource() {
    let h = Harness::new();
    let handle = h.coordinator.start_session(None).await.unwrap();
    let conn = h.provider.connection(0);
    let mic = h.mic.stream(0);
    let remote = conn.remote().unwrap();

    let report = handle.end().await;

    assert!(report.is_clean());
    assert!(!report.skipped);
    assert_eq!(report.session_id.as_deref(), Some(handle.id()));
    for step in [
        TeardownStep::StopMicrophone,
        TeardownStep::DetachPlayback,
        TeardownStep::Disconnect,
        TeardownStep::CloseTransport,
        TeardownStep::ClearConnection,
    ] {
        assert!(report.ran(step), "missing {step}");
    }

    assert!(!mic.is_active());
    assert!(!remote.is_active());
    assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(conn.transport.closes.load(Ordering::SeqCst), 1);

    let sink = h.coordinator.playback_sink().unwrap();
    assert!(sink.is_muted());
    assert!(sink.source_id().is_none());
    assert!(!sink.is_playing());

    assert!(!h.coordinator.is_live());
    assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
    let snapshot = h.coordinator.snapshot();
    assert!(!snapshot.microphone_attached);
    assert!(!snapshot.remote_attached);
    assert!(snapshot.session_id.is_none());
}

#[tokio::test]
async fn overlapping_ends_run_one_teardown() {
    let h = Harness::new();
    h.coordinator.start_session(None).await.unwrap();

    let (first, second) = tokio::join!(
        h.coordinator.end_active_session(),
        h.coordinator.end_active_session()
    );

    assert!(first.skipped ^ second.skipped);
    let conn = h.provider.connection(0);
    assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(conn.transport.closes.load(Ordering::SeqCst), 1);
    assert!(!h.coordinator.is_live());
}

#[tokio::test]
async fn sequential_ends_are_harmless() {
    let h = Harness::new();
    h.coordinator.start_session(None).await.unwrap();

    h.coordinator.end_active_session().await;
    let again = h.coordinator.end_active_session().await;

    assert!(again.is_clean());
    assert!(!again.ran(TeardownStep::Disconnect));
    assert_eq!(h.provider.connection(0).disconnects.load(Ordering::SeqCst), 1);

    // Ending with nothing ever started is fine too.
    let idle = Harness::new();
    assert!(idle.coordinator.end_active_session().await.is_clean());
}

#[tokio::test]
async fn start_implies_clean_slate() {
    let h = Harness::new();
    h.coordinator.start_session(None).await.unwrap();
    h.coordinator.start_session(None).await.unwrap();

    assert!(!h.mic.stream(0).is_active());
    assert!(h.mic.stream(1).is_active());
    assert!(h.position("disconnect conn-1") < h.position("connect conn-2"));
    assert!(h.position("disconnect conn-1") < h.position("acquire mic-2"));

    let live = h.provider.live_connections();
    assert_eq!(live.len(), 1);
    assert_eq!(
        h.coordinator.snapshot().connection_id.as_deref(),
        Some("conn-2")
    );
    assert_eq!(
        h.coordinator.playback_sink().unwrap().source_id().as_deref(),
        Some("conn-2-remote")
    );
}

#[tokio::test]
async fn failed_disconnect_does_not_stop_teardown() {
    let h = Harness::new();
    h.provider
        .behavior
        .fail_disconnect
        .store(true, Ordering::SeqCst);
    h.coordinator.start_session(None).await.unwrap();
    let conn = h.provider.connection(0);

    let report = h.coordinator.end_active_session().await;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].step, TeardownStep::Disconnect);
    assert!(report.failures[0].message.contains("provider exploded"));
    assert!(!h.mic.stream(0).is_active());
    assert_eq!(conn.transport.closes.load(Ordering::SeqCst), 1);
    assert!(!h.coordinator.is_live());
    assert!(h.coordinator.snapshot().connection_id.is_none());
}

#[tokio::test]
async fn starting_flag_clears_after_success_and_failure() {
    let h = Harness::new();
    h.coordinator.start_session(None).await.unwrap();
    assert!(!h.coordinator.snapshot().starting);

    h.tokens.push(Scripted::Fail(500));
    assert!(h.coordinator.start_session(None).await.is_err());
    let snapshot = h.coordinator.snapshot();
    assert!(!snapshot.starting);
    assert!(!snapshot.ending);
    assert!(!h.coordinator.is_live());
}

#[tokio::test]
async fn token_failure_leaves_microphone_until_end() {
    let h = Harness::new();
    h.tokens.push(Scripted::Fail(500));

    let err = h.coordinator.start_session(None).await.unwrap_err();

    assert_eq!(err.code(), "TOKEN_EXCHANGE_FAILED");
    assert_eq!(err.http_status(), Some(500));
    assert!(h.provider.connections().is_empty());
    assert!(h.coordinator.snapshot().microphone_attached);
    assert!(h.mic.stream(0).is_active());
    assert!(!h.coordinator.is_live());

    h.coordinator.end_active_session().await;

    assert!(!h.mic.stream(0).is_active());
    assert!(!h.coordinator.snapshot().microphone_attached);
}

#[tokio::test]
async fn next_start_reclaims_microphone_left_by_failure() {
    let h = Harness::new();
    h.tokens.push(Scripted::Fail(503));
    assert!(h.coordinator.start_session(None).await.is_err());

    h.coordinator.start_session(None).await.unwrap();

    assert!(!h.mic.stream(0).is_active());
    assert!(h.mic.stream(1).is_active());
}

#[tokio::test]
async fn release_capture_on_failure_rolls_back() {
    let h = Harness::with_config(SessionConfig {
        release_capture_on_failure: true,
        ..SessionConfig::default()
    });
    h.tokens.push(Scripted::Fail(500));

    assert!(h.coordinator.start_session(None).await.is_err());

    assert!(!h.mic.stream(0).is_active());
    assert!(!h.coordinator.snapshot().microphone_attached);
    assert_eq!(h.coordinator.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn capture_denied_surfaces_once() {
    let h = Harness::new();
    h.mic.deny.store(true, Ordering::SeqCst);

    let err = h.coordinator.start_session(None).await.unwrap_err();

    assert!(matches!(err, VoiceError::Capture(_)));
    assert_eq!(h.tokens.calls.load(Ordering::SeqCst), 0);
    assert!(!h.coordinator.is_live());
}

#[tokio::test]
async fn connect_failure_keeps_microphone_attached() {
    let h = Harness::new();
    h.provider
        .behavior
        .fail_connect
        .store(true, Ordering::SeqCst);

    let err = h.coordinator.start_session(None).await.unwrap_err();

    assert_eq!(err.code(), "CONNECTION_FAILED");
    assert!(h.coordinator.snapshot().microphone_attached);
    assert!(!h.coordinator.is_live());
}

#[tokio::test]
async fn missing_remote_stream_leaves_connection_for_teardown() {
    let h = Harness::new();
    h.provider.behavior.no_remote.store(true, Ordering::SeqCst);

    let err = h.coordinator.start_session(None).await.unwrap_err();

    assert!(matches!(err, VoiceError::NoRemoteStream));
    // The connection was installed before the failure.
    assert!(h.coordinator.is_live());

    h.coordinator.end_active_session().await;
    assert!(h.provider.connection(0).is_disconnected());
    assert!(!h.coordinator.is_live());
}

#[tokio::test]
async fn connection_without_media_support_fails_start() {
    let h = Harness::new();
    h.provider.behavior.no_media.store(true, Ordering::SeqCst);

    let err = h.coordinator.start_session(None).await.unwrap_err();

    assert_eq!(err.code(), "CAPABILITY_MISSING");
    h.coordinator.end_active_session().await;
    assert!(h.provider.live_connections().is_empty());
}

#[tokio::test]
async fn playback_refusal_does_not_fail_start() {
    let h = Harness::new();
    h.output.refuse.store(true, Ordering::SeqCst);

    h.coordinator.start_session(None).await.unwrap();

    let sink = h.coordinator.playback_sink().unwrap();
    assert!(!sink.is_playing());
    assert_eq!(sink.source_id().as_deref(), Some("conn-1-remote"));
    assert!(h.coordinator.is_live());
}

#[tokio::test]
async fn sink_is_created_once_and_reused() {
    let h = Harness::new();
    assert!(h.coordinator.playback_sink().is_none());

    h.coordinator.start_session(None).await.unwrap();
    let first = h.coordinator.playback_sink().unwrap() as *const _;
    h.coordinator.start_session(None).await.unwrap();
    let second = h.coordinator.playback_sink().unwrap() as *const _;

    assert_eq!(first, second);
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let h = Harness::new();
    let mut events = h.coordinator.subscribe();

    let handle = h.coordinator.start_session(None).await.unwrap();
    h.tokens.push(Scripted::Fail(500));
    let _ = h.coordinator.start_session(None).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let names: Vec<&str> = seen.iter().map(VoiceEvent::name).collect();
    assert_eq!(
        names,
        vec![
            "voice.starting",
            "voice.live",
            "voice.ended",
            "voice.starting",
            "voice.start_failed"
        ]
    );
    assert_eq!(
        seen[1],
        VoiceEvent::Live {
            session_id: handle.id().to_owned(),
            agent_id: Some("agentA".into()),
        }
    );
    match &seen[4] {
        VoiceEvent::StartFailed { code, .. } => assert_eq!(*code, "TOKEN_EXCHANGE_FAILED"),
        other => panic!("unexpected event {other:?}"),
    }
}
