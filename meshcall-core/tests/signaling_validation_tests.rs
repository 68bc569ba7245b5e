//! Signaling validation and edge case tests

use meshcall_core::signaling::{MAX_SDP_LENGTH, MAX_SIGNALING_PAYLOAD_SIZE};
use meshcall_core::{
    CallId, CallRegistry, IceCandidate, LocalRelayChannel, OutboundSignal, ParticipantId,
    RegistryError, SessionDescription, SignalingError, SignalingHandler, SignalingKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn cid(id: &str) -> CallId {
    CallId::parse(id).unwrap()
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::parse(id).unwrap()
}

fn two_party() -> (CallRegistry, CallId, ParticipantId, ParticipantId) {
    let registry = CallRegistry::default();
    let call = cid("room");
    let (alice, bob) = (pid("alice"), pid("bob"));
    registry.join(&call, &alice).unwrap();
    registry.join(&call, &bob).unwrap();
    (registry, call, alice, bob)
}

fn invalid(result: Result<impl std::fmt::Debug, RegistryError>) -> String {
    match result {
        Err(RegistryError::InvalidMessageFormat(msg)) => msg,
        other => panic!("expected InvalidMessageFormat, got {other:?}"),
    }
}

#[test]
fn relay_rejects_empty_sdp() {
    let (registry, call, alice, bob) = two_party();
    let msg = invalid(registry.relay(
        &call,
        &alice,
        SignalingKind::Offer,
        Some(bob),
        Some(json!({ "type": "offer", "sdp": "  " })),
    ));
    assert!(msg.contains("cannot be empty"));
}

#[test]
fn relay_rejects_missing_payload() {
    let (registry, call, alice, bob) = two_party();
    invalid(registry.relay(&call, &alice, SignalingKind::Answer, Some(bob), None));
}

#[test]
fn relay_rejects_oversized_sdp() {
    let (registry, call, alice, bob) = two_party();
    let sdp = "a".repeat(MAX_SDP_LENGTH + 1);
    let msg = invalid(registry.relay(
        &call,
        &alice,
        SignalingKind::Offer,
        Some(bob),
        Some(json!({ "sdp": sdp })),
    ));
    assert!(msg.contains("too long"));
}

#[test]
fn relay_rejects_oversized_payload() {
    let (registry, call, alice, bob) = two_party();
    let padding = "x".repeat(MAX_SIGNALING_PAYLOAD_SIZE);
    let msg = invalid(registry.relay(
        &call,
        &alice,
        SignalingKind::Offer,
        Some(bob),
        Some(json!({ "sdp": "v=0", "extra": padding })),
    ));
    assert!(msg.contains("too large"));
}

#[test]
fn relay_rejects_mismatched_description_type() {
    let (registry, call, alice, bob) = two_party();
    let msg = invalid(registry.relay(
        &call,
        &alice,
        SignalingKind::Answer,
        Some(bob),
        Some(json!({ "type": "offer", "sdp": "v=0" })),
    ));
    assert!(msg.contains("does not match"));
}

#[test]
fn relay_rejects_malformed_candidate() {
    let (registry, call, alice, bob) = two_party();
    invalid(registry.relay(
        &call,
        &alice,
        SignalingKind::IceCandidate,
        Some(bob),
        Some(json!({ "sdpMid": "0" })),
    ));
}

#[test]
fn relay_accepts_candidate_without_mid() {
    let (registry, call, alice, bob) = two_party();
    assert_ok!(registry.relay(
        &call,
        &alice,
        SignalingKind::IceCandidate,
        Some(bob),
        Some(json!({ "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host" })),
    ));
}

#[test]
fn membership_changes_cannot_be_relayed() {
    let (registry, call, alice, _) = two_party();
    for kind in [SignalingKind::Join, SignalingKind::Leave] {
        invalid(registry.relay(&call, &alice, kind, None, None));
    }
}

#[test]
fn non_member_cannot_relay() {
    let (registry, call, _, bob) = two_party();
    let err = assert_err!(registry.relay(
        &call,
        &pid("mallory"),
        SignalingKind::Offer,
        Some(bob),
        Some(json!({ "sdp": "v=0" })),
    ));
    assert!(matches!(err, RegistryError::NotInCall { .. }));
}

#[test]
fn join_with_malformed_payload_is_rejected() {
    let registry = CallRegistry::default();
    let call = cid("room");
    invalid(registry.join_with(&call, &pid("alice"), Some(json!({ "displayName": 42 }))));
    assert_eq!(registry.active_calls(), 0);
}

#[test]
fn join_display_name_is_recorded() {
    let registry = CallRegistry::default();
    let call = cid("room");
    let delivery = registry
        .join_with(&call, &pid("alice"), Some(json!({ "displayName": "Alice" })))
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message.display_name().as_deref(), Some("Alice"));
}

#[test]
fn ids_reject_empty_and_oversized_values() {
    assert!(CallId::parse("").is_err());
    assert!(ParticipantId::parse("a".repeat(meshcall_core::MAX_ID_LENGTH + 1)).is_err());
    assert!(CallId::parse("a".repeat(meshcall_core::MAX_ID_LENGTH)).is_ok());
}

#[tokio::test]
async fn handler_maps_registry_errors() {
    let registry = Arc::new(CallRegistry::default());
    let handler = SignalingHandler::new(Arc::new(LocalRelayChannel::new(
        Arc::clone(&registry),
        pid("alice"),
    )));

    let err = handler
        .send(
            &cid("ghost"),
            OutboundSignal::description(pid("bob"), &SessionDescription::offer("v=0")),
        )
        .await
        .unwrap_err();
    assert_eq!(err, SignalingError::CallNotFound("ghost".to_string()));

    registry.join(&cid("room"), &pid("bob")).unwrap();
    let err = handler
        .send(
            &cid("room"),
            OutboundSignal::ice_candidate(
                pid("bob"),
                &IceCandidate {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::RelayFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn poll_backs_off_and_recovers() {
    let registry = Arc::new(CallRegistry::default());
    let handler = SignalingHandler::new(Arc::new(LocalRelayChannel::new(
        Arc::clone(&registry),
        pid("alice"),
    )));
    let call = cid("room");

    let started = tokio::time::Instant::now();
    for _ in 0..3 {
        assert_err!(handler.poll(&call, None).await);
    }
    assert_eq!(handler.consecutive_errors(), 3);
    // 100ms + 200ms + 300ms
    assert!(started.elapsed() >= Duration::from_millis(600));

    assert_ok!(handler.join(&call, Some("Alice")).await);
    let snapshot = assert_ok!(handler.poll(&call, None).await);
    assert_eq!(handler.consecutive_errors(), 0);
    assert_eq!(snapshot.participants, vec![pid("alice")]);
    // Own join is not echoed back
    assert!(snapshot.messages.is_empty());
}
