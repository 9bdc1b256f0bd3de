//! Outbound delivery engine tests
//!
//! Each test runs a scripted local inbox that answers from a fixed
//! status sequence, then asserts the engine's retry, dead-peer, and
//! permanent-failure behavior. The test config collapses backoff to
//! zero so the attempt-squared schedule runs in milliseconds.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, extract::State, http::StatusCode, routing::post};
use chrono::Utc;
use common::{StubFetcher, TestServer};
use tokio_test::assert_ok;

use windward::data::{Activity, EntityId, FollowEdge};
use windward::federation::delivery::{DeliveryOutcome, DeliveryTarget, builder};

struct ScriptedInbox {
    hits: AtomicUsize,
    statuses: Vec<u16>,
}

async fn scripted_handler(State(script): State<Arc<ScriptedInbox>>) -> StatusCode {
    let hit = script.hits.fetch_add(1, Ordering::SeqCst);
    let status = script
        .statuses
        .get(hit)
        .or(script.statuses.last())
        .copied()
        .unwrap_or(200);
    StatusCode::from_u16(status).unwrap()
}

/// Start a local inbox that answers from the given status sequence.
async fn spawn_scripted_inbox(statuses: Vec<u16>) -> (String, Arc<ScriptedInbox>) {
    let script = Arc::new(ScriptedInbox {
        hits: AtomicUsize::new(0),
        statuses,
    });

    let app = Router::new()
        .route("/inbox", post(scripted_handler))
        .with_state(script.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}/inbox", addr), script)
}

async fn engine_fixture() -> TestServer {
    TestServer::with_fetcher(Arc::new(StubFetcher::new())).await
}

/// Store a local activity ready for delivery.
async fn store_local_activity(server: &TestServer, uri: &str, kind: &str) -> Activity {
    let payload = match kind {
        "Follow" => builder::follow(uri, "http://localhost/users/admin", "https://remote.test/users/alice"),
        _ => builder::create(
            uri,
            "http://localhost/users/admin",
            builder::note(
                &format!("{uri}/note"),
                "http://localhost/users/admin",
                "<p>hello</p>",
                &Utc::now().to_rfc3339(),
                vec!["https://www.w3.org/ns/activitystreams#Public"],
                vec![],
            ),
            vec!["https://www.w3.org/ns/activitystreams#Public"],
            vec![],
        ),
    };

    let activity = Activity {
        id: EntityId::new().0,
        uri: uri.to_string(),
        kind: kind.to_string(),
        actor_uri: "http://localhost/users/admin".to_string(),
        object_uri: None,
        target_uri: None,
        payload: payload.to_string(),
        published: Utc::now(),
        is_local: true,
        attempt_count: 0,
        last_error: None,
        delivered: false,
        created_at: Utc::now(),
    };
    server.state.db.insert_activity_if_absent(&activity).await.unwrap();
    activity
}

#[tokio::test]
async fn delivery_succeeds_after_transient_failures() {
    let server = engine_fixture().await;
    let (inbox_url, script) = spawn_scripted_inbox(vec![500, 500, 200]).await;

    let activity = store_local_activity(&server, "http://localhost/act/retry-ok", "Create").await;

    let results = tokio_test::assert_ok!(
        server
            .state
            .delivery
            .deliver(&activity.uri, vec![DeliveryTarget::inbox(&inbox_url)])
            .await
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, DeliveryOutcome::Delivered);
    assert_eq!(script.hits.load(Ordering::SeqCst), 3);

    let stored = server
        .state
        .db
        .find_activity_by_uri(&activity.uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.attempt_count, 3, "every issued call is counted");
    assert!(stored.delivered);

    let attempts = server
        .state
        .db
        .list_delivery_attempts(&activity.uri)
        .await
        .unwrap();
    let outcomes: Vec<_> = attempts
        .iter()
        .map(|a| (a.attempt_number, a.outcome.as_str()))
        .collect();
    assert_eq!(outcomes, vec![(1, "retry"), (2, "retry"), (3, "delivered")]);
}

#[tokio::test]
async fn gone_peer_is_recorded_once_and_not_retried() {
    let server = engine_fixture().await;
    let (inbox_url, script) = spawn_scripted_inbox(vec![410]).await;

    let activity = store_local_activity(&server, "http://localhost/act/gone", "Create").await;

    let results = server
        .state
        .delivery
        .deliver(&activity.uri, vec![DeliveryTarget::inbox(&inbox_url)])
        .await
        .unwrap();
    assert_eq!(results[0].1, DeliveryOutcome::Unavailable);
    assert_eq!(script.hits.load(Ordering::SeqCst), 1, "410 is never retried");

    let attempts = server
        .state
        .db
        .list_delivery_attempts(&activity.uri)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, "gone");

    // Exactly one unavailable-peer record for the domain.
    assert_eq!(
        server.state.db.count_unavailable_peers("127.0.0.1").await.unwrap(),
        1
    );

    // Further deliveries to the dead domain are short-circuited before
    // any network call.
    let results = server
        .state
        .delivery
        .deliver(&activity.uri, vec![DeliveryTarget::inbox(&inbox_url)])
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(script.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_ceiling_records_permanent_failure_and_discards_pending_follow() {
    let server = engine_fixture().await;
    let (inbox_url, script) = spawn_scripted_inbox(vec![500]).await;

    let activity = store_local_activity(&server, "http://localhost/act/doomed-follow", "Follow").await;

    // The pending edge recorded when the Follow was sent.
    server
        .state
        .db
        .insert_follow_if_absent(&FollowEdge {
            id: EntityId::new().0,
            source_uri: "http://localhost/users/admin".to_string(),
            target_uri: "https://remote.test/users/alice".to_string(),
            activity_uri: activity.uri.clone(),
            accepted: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let results = server
        .state
        .delivery
        .deliver(&activity.uri, vec![DeliveryTarget::inbox(&inbox_url)])
        .await
        .unwrap();
    assert_eq!(results[0].1, DeliveryOutcome::PermanentFailure);

    // Retried up to the ceiling, no further.
    assert_eq!(script.hits.load(Ordering::SeqCst), 3);

    let stored = server
        .state
        .db
        .find_activity_by_uri(&activity.uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.attempt_count, 3);
    assert!(stored.last_error.is_some());
    assert!(!stored.delivered);

    // The unconfirmable Follow must not leave a stuck pending edge.
    assert!(
        server
            .state
            .db
            .find_follow("http://localhost/users/admin", "https://remote.test/users/alice")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn local_validation_failure_does_not_count_an_attempt() {
    let server = engine_fixture().await;

    let activity =
        store_local_activity(&server, "http://localhost/act/bad-inbox", "Create").await;

    let results = server
        .state
        .delivery
        .deliver(&activity.uri, vec![DeliveryTarget::inbox("not a url")])
        .await
        .unwrap();
    assert_eq!(results[0].1, DeliveryOutcome::PermanentFailure);

    let stored = server
        .state
        .db
        .find_activity_by_uri(&activity.uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.attempt_count, 0,
        "attempt count only moves on issued network calls"
    );
}

#[tokio::test]
async fn fan_out_delivers_to_each_inbox_independently() {
    let server = engine_fixture().await;
    let (good_inbox, good_script) = spawn_scripted_inbox(vec![200]).await;
    let (flaky_inbox, flaky_script) = spawn_scripted_inbox(vec![503, 200]).await;

    let activity = store_local_activity(&server, "http://localhost/act/fanout", "Create").await;

    let results = server
        .state
        .delivery
        .deliver(
            &activity.uri,
            vec![
                DeliveryTarget::inbox(&good_inbox),
                DeliveryTarget::inbox(&flaky_inbox),
            ],
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, outcome)| *outcome == DeliveryOutcome::Delivered));
    assert_eq!(good_script.hits.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_script.hits.load(Ordering::SeqCst), 2);

    let stored = server
        .state
        .db
        .find_activity_by_uri(&activity.uri)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.delivered, "all-inbox success marks the activity delivered");
}
