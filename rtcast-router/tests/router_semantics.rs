//! Router lifecycle semantics, exercised on the scripted endpoint.

use bytes::Bytes;
use rtcast_router::testing::{sdp, MockEndpoint};
use rtcast_router::{
    MediaCapabilities, MediaRouter, RouterError, SessionRegistry, StreamId, SubscriberId,
};
use std::sync::Arc;
use std::time::Duration;

fn new_router(endpoint: &Arc<MockEndpoint>, stream: &str) -> Arc<MediaRouter> {
    MediaRouter::new(
        StreamId::from(stream),
        Arc::clone(endpoint) as Arc<dyn rtcast_router::Endpoint>,
        MediaCapabilities::browser_defaults(),
        true,
    )
}

#[tokio::test]
async fn subscriber_before_publisher_fails() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");

    let err = router.create_subscriber(&sdp(true, true)).await.unwrap_err();
    assert!(matches!(err, RouterError::NoPublisher(_)));
    assert_eq!(router.subscriber_count(), 0);
    assert!(endpoint.egresses().is_empty());
}

#[tokio::test]
async fn second_publisher_is_rejected() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");

    router.create_publisher(&sdp(true, true)).await.unwrap();
    let err = router.create_publisher(&sdp(true, true)).await.unwrap_err();
    assert!(matches!(err, RouterError::PublisherExists(_)));

    // The surviving publisher is the first one; its transport is untouched.
    assert_eq!(endpoint.ingress_transports()[0].close_count(), 0);
}

#[tokio::test]
async fn negotiation_failure_leaves_router_unmodified() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");

    endpoint.fail_next();
    let err = router.create_publisher(&sdp(true, true)).await.unwrap_err();
    assert!(matches!(err, RouterError::NegotiationFailed(_)));
    assert!(router.publisher().is_none());

    // A later publish succeeds.
    router.create_publisher(&sdp(true, true)).await.unwrap();
    assert!(router.publisher().is_some());
}

#[tokio::test]
async fn offer_without_media_is_rejected() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");

    let err = router.create_publisher("v=0\r\ns=-\r\n").await.unwrap_err();
    assert!(matches!(err, RouterError::NoStreamInfo));
    assert!(router.publisher().is_none());
}

#[tokio::test]
async fn subscriber_count_tracks_create_and_stop() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");
    router.create_publisher(&sdp(true, true)).await.unwrap();

    let a = router.create_subscriber(&sdp(true, true)).await.unwrap();
    let b = router.create_subscriber(&sdp(true, true)).await.unwrap();
    assert_eq!(router.subscriber_count(), 2);
    assert_ne!(a.id(), b.id());

    assert_eq!(router.stop_subscriber(a.id()).await, Some(1));
    // Stopping the same id again is a no-op.
    assert_eq!(router.stop_subscriber(a.id()).await, None);
    // Unknown ids are a no-op too.
    assert_eq!(
        router.stop_subscriber(&SubscriberId::random()).await,
        None
    );
    assert_eq!(router.subscriber_count(), 1);

    assert_eq!(router.stop_subscriber(b.id()).await, Some(0));
    assert_eq!(router.subscriber_count(), 0);
}

#[tokio::test]
async fn attach_binds_only_shared_kinds() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");
    let publisher = router.create_publisher(&sdp(true, true)).await.unwrap();

    // An audio+video offer negotiates an answer carrying both kinds.
    let answer = publisher.answer().unwrap();
    assert!(answer.contains("m=audio") && answer.contains("m=video"));

    // Audio+video viewer: both tracks bound.
    router.create_subscriber(&sdp(true, true)).await.unwrap();
    let egress = endpoint.last_egress().unwrap();
    assert!(egress.audio.is_some() && egress.video.is_some());

    publisher
        .audio_track()
        .unwrap()
        .publish(Bytes::from_static(b"a-pkt"));
    publisher
        .video_track()
        .unwrap()
        .publish(Bytes::from_static(b"v-pkt"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(egress.audio.unwrap().packets(), vec![Bytes::from_static(b"a-pkt")]);
    assert_eq!(egress.video.unwrap().packets(), vec![Bytes::from_static(b"v-pkt")]);

    // Audio-only viewer: the video kind is a safe degenerate no-op.
    router.create_subscriber(&sdp(true, false)).await.unwrap();
    let egress = endpoint.last_egress().unwrap();
    assert!(egress.audio.is_some());
    assert!(egress.video.is_none());

    publisher
        .audio_track()
        .unwrap()
        .publish(Bytes::from_static(b"a-pkt2"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        egress.audio.unwrap().packets(),
        vec![Bytes::from_static(b"a-pkt2")]
    );
}

#[tokio::test]
async fn stop_is_idempotent_and_terminal() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");
    router.create_publisher(&sdp(true, true)).await.unwrap();
    let subscriber = router.create_subscriber(&sdp(true, true)).await.unwrap();

    router.stop().await;
    router.stop().await;
    assert!(router.is_stopped());
    assert_eq!(router.subscriber_count(), 0);
    assert!(router.publisher().is_none());

    // Publisher and subscriber transports closed exactly once.
    assert_eq!(endpoint.ingress_transports()[0].close_count(), 1);
    assert_eq!(endpoint.egresses()[0].transport.close_count(), 1);

    // Operations on a stopped router are safe errors/no-ops.
    assert!(matches!(
        router.create_subscriber(&sdp(true, true)).await,
        Err(RouterError::RouterStopped(_))
    ));
    assert!(matches!(
        router.create_publisher(&sdp(true, true)).await,
        Err(RouterError::RouterStopped(_))
    ));
    assert_eq!(router.stop_subscriber(subscriber.id()).await, None);
}

#[tokio::test]
async fn subscriber_stop_is_idempotent() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");
    router.create_publisher(&sdp(true, true)).await.unwrap();
    let subscriber = router.create_subscriber(&sdp(true, true)).await.unwrap();

    subscriber.stop().await;
    subscriber.stop().await;
    assert_eq!(endpoint.egresses()[0].transport.close_count(), 1);
}

#[tokio::test]
async fn concurrent_subscribe_and_stop_keeps_counts_consistent() {
    let endpoint = Arc::new(MockEndpoint::new());
    let router = new_router(&endpoint, "s1");
    router.create_publisher(&sdp(true, true)).await.unwrap();

    let mut create_tasks = Vec::new();
    for _ in 0..16 {
        let router = Arc::clone(&router);
        create_tasks.push(tokio::spawn(async move {
            router.create_subscriber(&sdp(true, true)).await.map(|s| s.id().clone())
        }));
    }
    let mut ids = Vec::new();
    for task in create_tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    assert_eq!(router.subscriber_count(), 16);

    let mut stop_tasks = Vec::new();
    for id in ids {
        let router = Arc::clone(&router);
        stop_tasks.push(tokio::spawn(async move { router.stop_subscriber(&id).await }));
    }
    let mut removals = 0;
    let mut saw_zero = 0;
    for task in stop_tasks {
        if let Some(remaining) = task.await.unwrap() {
            removals += 1;
            if remaining == 0 {
                saw_zero += 1;
            }
        }
    }
    assert_eq!(removals, 16);
    // Exactly one removal observed the map empty: the "last subscriber"
    // decision cannot be duplicated.
    assert_eq!(saw_zero, 1);
    assert_eq!(router.subscriber_count(), 0);
}

#[tokio::test]
async fn registry_allows_one_live_router_per_stream() {
    let endpoint = Arc::new(MockEndpoint::new());
    let registry = SessionRegistry::new();

    let first = new_router(&endpoint, "s1");
    registry.add_router(Arc::clone(&first)).unwrap();
    assert!(matches!(
        registry.add_router(new_router(&endpoint, "s1")),
        Err(RouterError::RouterExists(_))
    ));

    // After full teardown the id is reusable.
    first.stop().await;
    registry.remove_router(first.stream_id());
    registry.add_router(new_router(&endpoint, "s1")).unwrap();
}
