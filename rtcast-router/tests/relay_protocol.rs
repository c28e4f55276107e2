//! Cluster pull/unpull protocol, exercised against wiremock origins.

use rtcast_router::testing::{sdp, MockEndpoint};
use rtcast_router::{
    Endpoint, MediaCapabilities, RelayClient, RouterError, SessionRegistry, StreamId,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn caps() -> MediaCapabilities {
    MediaCapabilities::browser_defaults()
}

#[tokio::test]
async fn pull_skips_bad_origins_and_records_the_good_one() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());

    // First origin answers success but with an empty sdp field.
    let bad_origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s": 10000,
            "d": { "sdp": "" }
        })))
        .expect(1)
        .mount(&bad_origin)
        .await;

    // Second origin answers a valid offer/answer pair.
    let good_origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pull"))
        .and(body_partial_json(json!({ "streamId": "s1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s": 10000,
            "d": { "sdp": sdp(true, true), "subscriberId": "origin-sub-1" }
        })))
        .expect(1)
        .mount(&good_origin)
        .await;

    let relay = RelayClient::new(vec![bad_origin.uri(), good_origin.uri()]);
    let router = relay
        .pull(&StreamId::from("s1"), Arc::clone(&endpoint), &caps())
        .await
        .unwrap();

    assert!(!router.is_origin());
    assert_eq!(router.origin_url(), Some(good_origin.uri()));
    let publisher = router.publisher().unwrap();
    assert_eq!(publisher.id(), "origin-sub-1");
    assert!(publisher.audio_track().is_some() && publisher.video_track().is_some());
}

#[tokio::test]
async fn pull_exhausting_origins_is_stream_not_found() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());

    let not_found = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "s": 10002 })))
        .mount(&not_found)
        .await;

    // Second candidate is unreachable (no server): transport error, also skipped.
    let relay = RelayClient::new(vec![not_found.uri(), "127.0.0.1:1".to_string()]);
    let err = relay
        .pull(&StreamId::from("missing"), endpoint, &caps())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::StreamNotFound(_)));
}

#[tokio::test]
async fn pull_with_no_origins_is_stream_not_found() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());
    let relay = RelayClient::new(Vec::new());
    assert!(!relay.has_origins());
    let err = relay
        .pull(&StreamId::from("s2"), endpoint, &caps())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::StreamNotFound(_)));
}

#[tokio::test]
async fn last_subscriber_detach_unpulls_exactly_once() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());

    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s": 10000,
            "d": { "sdp": sdp(true, true), "subscriberId": "origin-sub-9" }
        })))
        .mount(&origin)
        .await;
    Mock::given(method("POST"))
        .and(path("/unpull"))
        .and(body_partial_json(json!({
            "streamId": "s1",
            "subscriberId": "origin-sub-9"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "s": 10000 })))
        .expect(1)
        .mount(&origin)
        .await;

    let relay = RelayClient::new(vec![origin.uri()]);
    let registry = SessionRegistry::new();
    let router = relay
        .pull(&StreamId::from("s1"), Arc::clone(&endpoint), &caps())
        .await
        .unwrap();
    registry.add_router(Arc::clone(&router)).unwrap();

    let a = router.create_subscriber(&sdp(true, true)).await.unwrap();
    let b = router.create_subscriber(&sdp(true, true)).await.unwrap();

    // Non-last detach: no unpull, router stays registered.
    let remaining = router.stop_subscriber(a.id()).await.unwrap();
    relay.release_if_idle(&registry, &router, remaining).await;
    assert_eq!(registry.router_count(), 1);
    assert!(!router.is_stopped());

    // Last detach: exactly one unpull, router stopped and deregistered.
    let remaining = router.stop_subscriber(b.id()).await.unwrap();
    relay.release_if_idle(&registry, &router, remaining).await;
    assert_eq!(registry.router_count(), 0);
    assert!(router.is_stopped());
}

#[tokio::test]
async fn origin_router_never_unpulls() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());
    let relay = RelayClient::new(vec!["127.0.0.1:1".to_string()]);
    let registry = SessionRegistry::new();

    let router = rtcast_router::MediaRouter::new(
        StreamId::from("local"),
        Arc::clone(&endpoint),
        caps(),
        true,
    );
    router.create_publisher(&sdp(true, true)).await.unwrap();
    registry.add_router(Arc::clone(&router)).unwrap();

    let sub = router.create_subscriber(&sdp(true, true)).await.unwrap();
    let remaining = router.stop_subscriber(sub.id()).await.unwrap();
    relay.release_if_idle(&registry, &router, remaining).await;

    // Origin routers outlive their last viewer.
    assert_eq!(registry.router_count(), 1);
    assert!(!router.is_stopped());
}

#[tokio::test]
async fn unpull_failure_does_not_block_local_teardown() {
    let endpoint: Arc<dyn Endpoint> = Arc::new(MockEndpoint::new());

    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s": 10000,
            "d": { "sdp": sdp(true, true), "subscriberId": "origin-sub-2" }
        })))
        .mount(&origin)
        .await;
    // No /unpull mock: the call 404s, which must only be logged.

    let relay = RelayClient::new(vec![origin.uri()]);
    let registry = SessionRegistry::new();
    let router = relay
        .pull(&StreamId::from("s1"), Arc::clone(&endpoint), &caps())
        .await
        .unwrap();
    registry.add_router(Arc::clone(&router)).unwrap();

    let sub = router.create_subscriber(&sdp(true, true)).await.unwrap();
    let remaining = router.stop_subscriber(sub.id()).await.unwrap();
    relay.release_if_idle(&registry, &router, remaining).await;

    assert!(router.is_stopped());
    assert_eq!(registry.router_count(), 0);
}
