// ABOUTME: Behavioral tests for correlated request/response over the bus
// Verifies callback-id isolation between concurrent requests and late replies

use super::fixtures::{loopback, payload, ProjectHost};
use busline::bus::MessageBus;
use busline::protocol::{CallbackId, GetProjectResponse, GET_PROJECT_REQUEST, GET_PROJECT_RESPONSE};
use busline::request::{decode, CorrelatedRequest, CorrelationKey, RequestError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_request_through_project_host() {
    let (bus, dyn_bus) = loopback();
    let _host = ProjectHost::new("P")
        .folder("", 100)
        .file("a.txt", 200, "hi")
        .serve(&bus);

    let key = CorrelationKey::for_user("u").with_callback_id(CallbackId::next());
    let listing: GetProjectResponse =
        CorrelatedRequest::new(dyn_bus, GET_PROJECT_RESPONSE, key, decode::<GetProjectResponse>)
            .request(GET_PROJECT_REQUEST, payload(json!({"project": "P"})))
            .await
            .unwrap();

    assert_eq!(listing.username, "u");
    assert_eq!(listing.files.len(), 2);
    // every handler the request installed is gone; only the host remains
    assert_eq!(bus.handler_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_resolve_independently() {
    let (bus, dyn_bus) = loopback();

    let mut waits = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..8 {
        let id = CallbackId::next();
        ids.push(id);
        let request = CorrelatedRequest::new(
            Arc::clone(&dyn_bus),
            GET_PROJECT_RESPONSE,
            CorrelationKey::for_user("u").with_callback_id(id),
            move |message| {
                message
                    .payload
                    .get("project")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| "missing project".to_string())
            },
        )
        .with_timeout(Duration::from_secs(2));
        waits.push(tokio::spawn(request.await_result()));
    }

    // Reply in reverse order from another task
    let replier = Arc::clone(&bus);
    let reply_ids = ids.clone();
    tokio::spawn(async move {
        for id in reply_ids.iter().rev() {
            replier
                .publish(
                    GET_PROJECT_RESPONSE,
                    payload(json!({
                        "username": "u",
                        "callback_id": id.as_u64(),
                        "project": format!("project-{id}"),
                    })),
                )
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    for (wait, id) in waits.into_iter().zip(ids) {
        let project = wait.await.unwrap().unwrap();
        assert_eq!(project, format!("project-{id}"));
    }
    assert_eq!(bus.handler_count(), 0);
}

#[tokio::test]
async fn test_reply_after_timeout_is_not_consumed() {
    let (bus, dyn_bus) = loopback();
    let id = CallbackId::next();
    let result = CorrelatedRequest::new(
        dyn_bus,
        GET_PROJECT_RESPONSE,
        CorrelationKey::for_user("u").with_callback_id(id),
        decode::<GetProjectResponse>,
    )
    .with_timeout(Duration::from_millis(30))
    .request(GET_PROJECT_REQUEST, payload(json!({"project": "P"})))
    .await;

    assert!(matches!(result, Err(RequestError::Timeout { .. })));
    assert_eq!(bus.handler_count(), 0);

    bus.publish(
        GET_PROJECT_RESPONSE,
        payload(json!({"username": "u", "callback_id": id.as_u64(), "project": "P", "files": []})),
    )
    .unwrap();
    assert_eq!(bus.published_of(GET_PROJECT_RESPONSE).len(), 1);
}

#[tokio::test]
async fn test_publish_failure_surfaces_bus_error() {
    let (bus, dyn_bus) = loopback();
    bus.disconnect();

    let result = CorrelatedRequest::new(
        dyn_bus,
        GET_PROJECT_RESPONSE,
        CorrelationKey::for_user("u"),
        decode::<GetProjectResponse>,
    )
    .request(GET_PROJECT_REQUEST, payload(json!({"project": "P"})))
    .await;

    assert!(matches!(result, Err(RequestError::Bus(_))));
    assert_eq!(bus.handler_count(), 0);
}
