//! Callback bridge endpoints over a live ephemeral listener.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rlm_core::CallbackBridge;
use rlm_core::SubCallSink;
use serde_json::Value;
use serde_json::json;

use crate::suite::EchoClient;
use crate::suite::MockClient;

async fn post_json(url: &str, body: Value) -> (reqwest::StatusCode, String) {
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .expect("request");
    let status = response.status();
    let body = response.text().await.expect("body");
    (status, body)
}

#[tokio::test]
async fn query_returns_response_and_records_subcall() {
    let client = Arc::new(MockClient::new(&["bridged answer"]));
    let sink = SubCallSink::default();
    let bridge = CallbackBridge::start(client.clone(), sink.clone(), 4)
        .await
        .expect("bridge start");

    let (status, body) = post_json(
        &format!("http://{}/query", bridge.addr()),
        json!({"prompt": "what now", "model": null}),
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value, json!({"response": "bridged answer"}));

    // The bridge invoked the client with a single user message.
    let seen = client.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].content, "what now");

    bridge.stop().await;
}

#[tokio::test]
async fn query_client_failure_maps_to_500() {
    let client = Arc::new(EchoClient::new());
    let bridge = CallbackBridge::start(client, SubCallSink::default(), 4)
        .await
        .expect("bridge start");

    let (status, body) = post_json(
        &format!("http://{}/query", bridge.addr()),
        json!({"prompt": "please fail"}),
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("llm client error"), "body: {body}");

    bridge.stop().await;
}

#[tokio::test]
async fn batched_queries_keep_slots_for_failures() {
    let client = Arc::new(EchoClient::new());
    let sink = SubCallSink::default();
    let bridge = CallbackBridge::start(client, sink.clone(), 2)
        .await
        .expect("bridge start");

    let (status, body) = post_json(
        &format!("http://{}/query_batched", bridge.addr()),
        json!({"prompts": ["a", "fail-b", "c"]}),
    )
    .await;

    assert_eq!(status, reqwest::StatusCode::OK);
    let value: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value, json!({"responses": ["echo:a", "", "echo:c"]}));

    bridge.stop().await;
}

#[tokio::test]
async fn malformed_body_is_a_client_error() {
    let client = Arc::new(EchoClient::new());
    let bridge = CallbackBridge::start(client, SubCallSink::default(), 4)
        .await
        .expect("bridge start");

    let response = reqwest::Client::new()
        .post(format!("http://{}/query", bridge.addr()))
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .expect("request");
    assert!(response.status().is_client_error());

    bridge.stop().await;
}
