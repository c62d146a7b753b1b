//! HTTP surface tests
//!
//! Participant and admin routers driven in-process with `tower::ServiceExt`,
//! plus the reqwest-based decision client against a real listener.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::*;
use keel_core::coordinator::{
    ClientConfig, HttpParticipantClient, Participant, ParticipantClient, PushAck,
};
use keel_core::runtime::ShutdownSignal;
use keel_core::store::MemoryCluster;
use keel_core::worker::{self, AssignmentReceiver, ConsumerRegistry, Renouncer};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct NoopRenouncer;

#[async_trait::async_trait]
impl Renouncer for NoopRenouncer {
    async fn renounce_resources(
        &self,
        _resources: &[keel_core::coordinator::Resource],
    ) -> keel_core::Result<()> {
        Ok(())
    }
}

fn participant_router() -> (Router, Arc<AssignmentReceiver>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mut consumers = ConsumerRegistry::new();
    consumers.register(PLUGIN, recorder.clone());
    let receiver = Arc::new(AssignmentReceiver::new(
        "p1:7001",
        consumers,
        Arc::new(NoopRenouncer),
    ));
    (worker::router(receiver.clone()), receiver, recorder)
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

#[tokio::test]
async fn test_push_is_fenced_by_epoch() {
    let (router, receiver, recorder) = participant_router();
    let assignment = json!([{ "input_plugin": "mysql", "name": "a" }]);

    let (status, body) =
        send(&router, Method::POST, "/v1/rebalance?epoch=2", Some(assignment.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "accepted": true, "epoch": 2 }));
    assert_eq!(recorder.current(), vec!["a".to_string()]);

    let (status, body) = send(
        &router,
        Method::POST,
        "/v1/rebalance?epoch=1",
        Some(json!([{ "input_plugin": "mysql", "name": "b" }])),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "leader moved");
    assert_eq!(body["held_epoch"], 2);
    assert_eq!(receiver.held_epoch().await, 2);

    let (status, body) = send(&router, Method::GET, "/v1/assignment", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["held_epoch"], 2);
    assert_eq!(body["resources"], assignment);
}

#[tokio::test]
async fn test_push_without_epoch_is_refused() {
    let (router, _, recorder) = participant_router();

    let (status, _) = send(&router, Method::POST, "/v1/rebalance", Some(json!([]))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(recorder.feeds(), 0);
}

#[tokio::test]
async fn test_participant_endpoints() {
    let (router, _, _) = participant_router();

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&router, Method::POST, "/v1/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consumers"], 0, "Recorder is not pausable");

    let (status, _) = send(&router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes() {
    let cluster = MemoryCluster::new();
    let client = Arc::new(LocalClient::default());
    let p1 = start_node(&cluster, &client, "p1:7001").await;
    eventually("p1 to lead", || async { p1.node.is_leader() }).await;
    let router = p1.node.router();

    let (status, _) = send(
        &router,
        Method::POST,
        "/v1/admin/resources",
        Some(json!({ "input_plugin": "mysql", "name": "orders-db" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        Method::POST,
        "/v1/admin/resources",
        Some(json!({ "input_plugin": "mysql", "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("name"));

    let (_, body) = send(&router, Method::GET, "/v1/admin/resources", None).await;
    assert_eq!(body, json!([{ "input_plugin": "mysql", "name": "orders-db" }]));

    let (_, body) = send(&router, Method::GET, "/v1/admin/leader", None).await;
    assert_eq!(body["leader"], "p1:7001");

    let (_, body) = send(&router, Method::GET, "/v1/admin/participants", None).await;
    assert_eq!(body, json!([{ "endpoint": "p1:7001", "weight": 1 }]));

    let (status, body) = send(&router, Method::POST, "/v1/admin/rebalance", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["accepted"], json!(["p1:7001"]));

    let (status, body) = send(&router, Method::GET, "/v1/admin/decision", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["leader_epoch"], 1);
    assert_eq!(body["assignments"][0]["resources"][0]["name"], "orders-db");

    let (status, body) = send(&router, Method::GET, "/v1/admin/call/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"]["p1:7001"], "p1:7001 health epoch=1");

    for _ in 0..2 {
        let (status, _) = send(&router, Method::DELETE, "/v1/admin/resources/orders-db", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (_, body) = send(&router, Method::GET, "/v1/admin/resources", None).await;
    assert_eq!(body, json!([]));

    p1.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_client_against_live_listener() {
    let (router, _, recorder) = participant_router();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let shutdown = ShutdownSignal::new();
    let server = tokio::spawn(keel_core::http::serve(listener, router, shutdown.clone()));

    let client = HttpParticipantClient::new(ClientConfig::default()).unwrap();
    let participant = Participant::new(endpoint, 1).unwrap();

    let ack = client.push(&participant, 3, &[resource("a"), resource("b")]).await.unwrap();
    assert_eq!(ack, PushAck::Accepted);
    assert_eq!(recorder.current(), vec!["a".to_string(), "b".to_string()]);

    let ack = client.push(&participant, 2, &[]).await.unwrap();
    assert_eq!(ack, PushAck::LeaderMoved { held_epoch: 3 });

    let health = client.call(&participant, "health", "").await.unwrap();
    assert!(health.contains("healthy"));
    assert!(client.call(&participant, "no/such/route", "").await.is_err());

    shutdown.shutdown();
    server.await.unwrap().unwrap();
}
