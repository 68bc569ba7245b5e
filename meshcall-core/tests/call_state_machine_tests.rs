//! Call status state machine tests
//!
//! Idle -> Connecting -> Connected -> Ended, plus the failure and
//! restart paths around it.

use meshcall_core::{
    CallConfig, CallController, CallError, CallEvent, CallId, CallRegistry, CallStatus,
    ConnectionState, LocalRelayChannel, LoopbackBackend, ParticipantId,
};
use std::sync::Arc;
use std::time::Duration;

fn controller(
    registry: &Arc<CallRegistry>,
    name: &str,
) -> (Arc<CallController>, Arc<LoopbackBackend>) {
    let backend = Arc::new(LoopbackBackend::new());
    let controller = Arc::new(CallController::new(
        CallId::parse("room").unwrap(),
        Arc::new(LocalRelayChannel::new(
            Arc::clone(registry),
            ParticipantId::parse(name).unwrap(),
        )),
        backend.clone(),
        CallConfig {
            poll_interval: Duration::from_millis(20),
            ..CallConfig::default()
        },
    ));
    (controller, backend)
}

async fn wait_status(controller: &CallController, status: CallStatus) {
    let mut watch = controller.status_watch();
    tokio::time::timeout(Duration::from_secs(10), watch.wait_for(|s| *s == status))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn new_controller_is_idle() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");
    assert_eq!(alice.status(), CallStatus::Idle);
    assert!(alice.participants().is_empty());
    assert!(alice.peer_manager().is_none());
}

#[tokio::test]
async fn start_alone_stays_connecting() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");
    let mut events = alice.subscribe();

    alice.start_call(true).await.unwrap();
    assert_eq!(alice.status(), CallStatus::Connecting);
    assert!(matches!(
        events.try_recv().unwrap(),
        CallEvent::StatusChanged {
            status: CallStatus::Connecting
        }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.status(), CallStatus::Connecting);
    let room = CallId::parse("room").unwrap();
    assert_eq!(
        registry.participants(&room).unwrap(),
        vec![ParticipantId::parse("alice").unwrap()]
    );
}

#[tokio::test]
async fn first_connection_moves_to_connected() {
    let registry = Arc::new(CallRegistry::default());
    let (bob, _) = controller(&registry, "bob");
    let (alice, _) = controller(&registry, "alice");

    bob.start_call(false).await.unwrap();
    alice.start_call(true).await.unwrap();

    wait_status(&alice, CallStatus::Connected).await;
    wait_status(&bob, CallStatus::Connected).await;
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");

    alice.start_call(false).await.unwrap();
    let err = alice.start_call(false).await.unwrap_err();
    assert_eq!(err, CallError::InvalidState(CallStatus::Connecting));
}

#[tokio::test]
async fn denied_media_returns_to_idle() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, backend) = controller(&registry, "alice");
    backend.deny_media(true);
    let mut events = alice.subscribe();

    let err = alice.start_call(true).await.unwrap_err();
    assert!(matches!(err, CallError::MediaAccessDenied(_)));
    assert_eq!(alice.status(), CallStatus::Idle);
    assert_eq!(registry.active_calls(), 0);
    assert!(alice.peer_manager().is_none());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let CallEvent::Error { error, .. } = event {
            assert!(matches!(error, CallError::MediaAccessDenied(_)));
            saw_error = true;
        }
    }
    assert!(saw_error);

    // Retrying once access is granted works
    backend.deny_media(false);
    alice.start_call(true).await.unwrap();
    assert_eq!(alice.status(), CallStatus::Connecting);
}

#[tokio::test]
async fn end_without_start_does_nothing() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");
    let mut events = alice.subscribe();

    alice.end_call().await.unwrap();
    assert_eq!(alice.status(), CallStatus::Idle);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn ended_call_can_be_restarted() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, backend) = controller(&registry, "alice");

    alice.start_call(true).await.unwrap();
    alice.end_call().await.unwrap();
    assert_eq!(alice.status(), CallStatus::Ended);
    assert_eq!(registry.active_calls(), 0);

    alice.start_call(true).await.unwrap();
    assert_eq!(alice.status(), CallStatus::Connecting);
    assert_eq!(registry.active_calls(), 1);
    // Fresh capture, the first one stays released
    let live = backend.captured_tracks().iter().filter(|t| t.is_live()).count();
    assert_eq!(live, 2);
}

#[tokio::test]
async fn controls_require_a_running_call() {
    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");

    assert_eq!(
        alice.toggle_audio(false).unwrap_err(),
        CallError::InvalidState(CallStatus::Idle)
    );
    assert_eq!(
        alice.start_screen_share().await.unwrap_err(),
        CallError::InvalidState(CallStatus::Idle)
    );

    alice.start_call(false).await.unwrap();
    alice.end_call().await.unwrap();
    assert_eq!(
        alice.toggle_video(true).unwrap_err(),
        CallError::InvalidState(CallStatus::Ended)
    );
}

#[test]
fn connection_transitions_follow_the_state_machine() {
    use ConnectionState::*;

    assert!(New.can_transition_to(Connecting));
    assert!(Connecting.can_transition_to(Connected));
    assert!(Connected.can_transition_to(Disconnected));
    assert!(Disconnected.can_transition_to(Connected));
    assert!(Failed.can_transition_to(Closed));

    assert!(!Closed.can_transition_to(Connecting));
    assert!(!Failed.can_transition_to(Connected));
    assert!(!Connected.can_transition_to(New));

    assert!(Disconnected.is_alive());
    assert!(!Failed.is_alive());
    assert!(!Closed.is_alive());
}

#[tokio::test]
async fn event_stream_reports_the_lifecycle() {
    use tokio_stream::StreamExt;

    let registry = Arc::new(CallRegistry::default());
    let (alice, _) = controller(&registry, "alice");
    let events = alice.events();
    tokio::pin!(events);

    alice.start_call(true).await.unwrap();
    alice.end_call().await.unwrap();

    let seen: Vec<_> = tokio::time::timeout(Duration::from_secs(5), events.take(3).collect::<Vec<_>>())
        .await
        .unwrap();
    assert!(matches!(
        seen[0],
        CallEvent::StatusChanged {
            status: CallStatus::Connecting
        }
    ));
    assert!(matches!(
        seen[1],
        CallEvent::StatusChanged {
            status: CallStatus::Ended
        }
    ));
    assert!(matches!(seen[2], CallEvent::CallEnded));
}
