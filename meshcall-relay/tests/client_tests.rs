//! HTTP client against a live relay on a loopback port

use meshcall_core::{
    CallConfig, CallController, CallId, CallRegistry, CallStatus, LoopbackBackend, OutboundSignal,
    ParticipantId, SessionDescription, SignalingChannel, SignalingError, SignalingKind,
};
use meshcall_relay::{
    serve_with, BearerTokenResolver, ClientAuth, HttpSignalingChannel, IdentityResolver,
    TrustedHeaderResolver,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Relay {
    addr: SocketAddr,
    registry: Arc<CallRegistry>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Relay {
    async fn start(resolver: Arc<dyn IdentityResolver>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(CallRegistry::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            async move { serve_with(listener, registry, resolver, shutdown).await.unwrap() }
        });
        Self {
            addr,
            registry,
            shutdown,
            task,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn channel(&self, who: &str) -> HttpSignalingChannel {
        HttpSignalingChannel::new(self.url(), pid(who), ClientAuth::TrustedHeader).unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::parse(id).unwrap()
}

fn cid(id: &str) -> CallId {
    CallId::parse(id).unwrap()
}

#[tokio::test]
async fn channel_round_trip() {
    let relay = Relay::start(Arc::new(TrustedHeaderResolver::default())).await;
    let alice = relay.channel("alice");
    let bob = relay.channel("bob");
    let call = cid("abc");

    let joined = alice.join(&call, Some("Alice")).await.unwrap();
    assert!(joined.is_some());
    assert!(bob.join(&call, None).await.unwrap().is_some());
    assert_eq!(alice.join(&call, Some("Alice")).await.unwrap(), None);

    alice
        .send(
            &call,
            OutboundSignal::description(pid("bob"), &SessionDescription::offer("v=0\r\n")),
        )
        .await
        .unwrap();

    let snapshot = bob.fetch(&call, joined).await.unwrap();
    assert_eq!(snapshot.participants, vec![pid("alice"), pid("bob")]);
    let offer = snapshot
        .messages
        .iter()
        .find(|m| m.kind == SignalingKind::Offer)
        .unwrap();
    assert_eq!(offer.session_description().unwrap().sdp, "v=0\r\n");

    alice.leave(&call).await.unwrap();
    bob.leave(&call).await.unwrap();
    assert_eq!(relay.registry.active_calls(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn errors_map_onto_signaling_errors() {
    let relay = Relay::start(Arc::new(TrustedHeaderResolver::default())).await;
    let alice = relay.channel("alice");

    let err = alice.fetch(&cid("ghost"), None).await.unwrap_err();
    assert_eq!(err, SignalingError::CallNotFound("ghost".to_string()));

    relay.channel("bob").join(&cid("abc"), None).await.unwrap();
    let err = alice
        .send(
            &cid("abc"),
            OutboundSignal::description(pid("bob"), &SessionDescription::offer("v=0")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::RelayFailed(ref msg) if msg.contains("403")));

    alice.join(&cid("abc"), None).await.unwrap();
    let err = alice
        .send(
            &cid("abc"),
            OutboundSignal::description(pid("bob"), &SessionDescription::offer("   ")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalingError::InvalidMessageFormat(_)));

    relay.stop().await;
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let resolver = BearerTokenResolver::new().with_token(pid("alice"), "right");
    let relay = Relay::start(Arc::new(resolver)).await;

    let good = HttpSignalingChannel::new(relay.url(), pid("alice"), ClientAuth::Bearer("right".into()))
        .unwrap();
    let bad = HttpSignalingChannel::new(relay.url(), pid("alice"), ClientAuth::Bearer("wrong".into()))
        .unwrap();

    assert!(good.join(&cid("abc"), None).await.is_ok());
    let err = bad.fetch(&cid("abc"), None).await.unwrap_err();
    assert!(matches!(err, SignalingError::RelayFailed(ref msg) if msg.contains("401")));

    relay.stop().await;
}

#[tokio::test]
async fn unreachable_relay_is_a_relay_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel =
        HttpSignalingChannel::new(format!("http://{addr}"), pid("alice"), ClientAuth::TrustedHeader)
            .unwrap();
    let err = channel.fetch(&cid("abc"), None).await.unwrap_err();
    assert!(matches!(err, SignalingError::RelayFailed(_)));
}

#[tokio::test]
async fn two_controllers_connect_through_the_relay() {
    let relay = Relay::start(Arc::new(TrustedHeaderResolver::default())).await;
    let config = CallConfig {
        poll_interval: Duration::from_millis(25),
        ..CallConfig::default()
    };

    let bob = Arc::new(CallController::new(
        cid("abc"),
        Arc::new(relay.channel("bob")),
        Arc::new(LoopbackBackend::new()),
        config.clone(),
    ));
    let alice = Arc::new(CallController::new(
        cid("abc"),
        Arc::new(relay.channel("alice")),
        Arc::new(LoopbackBackend::new()),
        config,
    ));

    bob.start_call(false).await.unwrap();
    alice.start_call(true).await.unwrap();

    for controller in [&alice, &bob] {
        let mut status = controller.status_watch();
        tokio::time::timeout(
            Duration::from_secs(10),
            status.wait_for(|s| *s == CallStatus::Connected),
        )
        .await
        .unwrap()
        .unwrap();
    }

    alice.end_call().await.unwrap();
    let mut status = bob.status_watch();
    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| *s == CallStatus::Ended),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(relay.registry.active_calls(), 0);

    relay.stop().await;
}
