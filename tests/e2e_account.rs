//! E2E tests for account operations

mod common;

use common::TestServer;
use mentionbridge::tasks::Task;
use serde_json::Value;

#[tokio::test]
async fn test_link_account_dispatches_first_poll() {
    let server = TestServer::new().await;
    *server.sender.endpoint.lock().unwrap() = Some("https://alice.example.org/wm".to_string());

    let account = server.link_account().await;
    assert_eq!(account["silo"], "twitter");
    assert_eq!(account["id"], "alice");
    assert_eq!(account["status"], "enabled");
    assert_eq!(account["verified"], true);
    assert_eq!(account["webmention_endpoint"], "https://alice.example.org/wm");

    let tasks = server.take_tasks();
    assert_eq!(tasks.len(), 1);
    assert!(matches!(tasks[0], (Task::Poll { .. }, None)));
}

#[tokio::test]
async fn test_account_without_endpoint_is_not_verified() {
    let server = TestServer::new().await;

    let account = server.link_account().await;
    assert_eq!(account["verified"], false);
    assert!(account["webmention_endpoint"].is_null());
}

#[tokio::test]
async fn test_link_account_requires_a_feature() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/accounts"))
        .json(&serde_json::json!({
            "silo": "twitter",
            "id": "alice",
            "features": [],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unknown_silo_is_rejected() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/accounts/myspace/alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_get_missing_account() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/accounts/twitter/nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_disable_listen_stops_polling() {
    let server = TestServer::new().await;
    server.link_account().await;

    let response = server
        .client
        .post(server.url("/accounts/twitter/alice/disable"))
        .json(&serde_json::json!({ "feature": "listen" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let account: Value = response.json().await.unwrap();
    assert_eq!(account["status"], "disabled");

    // the pending poll drops itself
    let ran = server.run_immediate_tasks().await;
    assert_eq!(ran.len(), 1);
    assert!(server.take_tasks().is_empty());

    let response = server
        .client
        .post(server.url("/poll-now"))
        .json(&serde_json::json!({ "silo": "twitter", "id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_poll_now_dispatches_immediate_poll() {
    let server = TestServer::new().await;
    server.link_account().await;
    server.take_tasks();

    let response = server
        .client
        .post(server.url("/poll-now"))
        .json(&serde_json::json!({ "silo": "twitter", "id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let tasks = server.take_tasks();
    assert!(matches!(tasks.as_slice(), [(Task::Poll { .. }, None)]));
}
