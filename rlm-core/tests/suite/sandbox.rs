//! Sandbox lifecycle: persistent namespace, error surfacing, poisoning,
//! and sub-call attribution through a live bridge.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rlm_core::CallbackBridge;
use rlm_core::RlmSettings;
use rlm_core::Sandbox;
use rlm_core::SubCall;
use rlm_core::SubCallSink;
use tokio_util::sync::CancellationToken;

use crate::suite::EchoClient;
use crate::suite::MockClient;

// Unused unless code dials llm_query.
const DUMMY_ADDR: &str = "127.0.0.1:1";

async fn start_sandbox(addr: &str, sink: SubCallSink) -> Sandbox {
    Sandbox::start(&RlmSettings::default(), addr, sink)
        .await
        .expect("sandbox start")
}

#[tokio::test]
async fn namespace_persists_across_executions() {
    skip_if_no_python!();

    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(DUMMY_ADDR, SubCallSink::default()).await;

    let result = sandbox.execute("a = 41", &cancel).await;
    assert_eq!(result.stdout, "");
    assert_eq!(result.stderr, "");

    let result = sandbox.execute("print(a + 1)", &cancel).await;
    assert_eq!(result.stdout, "42\n");
    assert_eq!(result.stderr, "");

    sandbox.close().await;
}

#[tokio::test]
async fn definitions_persist_in_a_single_namespace() {
    skip_if_no_python!();

    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(DUMMY_ADDR, SubCallSink::default()).await;

    let result = sandbox
        .execute("def double(x):\n    return x * 2", &cancel)
        .await;
    assert_eq!(result.stderr, "");

    // Functions defined earlier must resolve their own module globals.
    let result = sandbox
        .execute("def quadruple(x):\n    return double(double(x))\nprint(quadruple(3))", &cancel)
        .await;
    assert_eq!(result.stdout, "12\n");
    assert_eq!(result.stderr, "");

    sandbox.close().await;
}

#[tokio::test]
async fn user_exceptions_surface_in_stderr_and_are_not_fatal() {
    skip_if_no_python!();

    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(DUMMY_ADDR, SubCallSink::default()).await;

    let result = sandbox
        .execute("print('before')\nraise ValueError('boom')", &cancel)
        .await;
    assert_eq!(result.stdout, "before\n");
    assert!(result.stderr.contains("boom"), "stderr: {}", result.stderr);

    let result = sandbox.execute("print('still alive')", &cancel).await;
    assert_eq!(result.stdout, "still alive\n");
    assert_eq!(result.stderr, "");

    sandbox.close().await;
}

#[tokio::test]
async fn child_death_poisons_the_sandbox() {
    skip_if_no_python!();

    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(DUMMY_ADDR, SubCallSink::default()).await;

    // SystemExit is not an Exception: it escapes the wrapper loop and kills
    // the child without a response frame.
    let result = sandbox.execute("import sys\nsys.exit(0)", &cancel).await;
    assert!(
        result.stderr.contains("Failed to read from sandbox"),
        "stderr: {}",
        result.stderr
    );

    let result = sandbox.execute("print(1)", &cancel).await;
    assert!(
        result.stderr.contains("Failed to read from sandbox"),
        "poisoned sandbox must keep failing, got: {}",
        result.stderr
    );

    sandbox.close().await;
    // Close is idempotent.
    sandbox.close().await;
}

#[tokio::test]
async fn sub_calls_are_attributed_to_the_running_execution() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&["mock says hi"]));
    let sink = SubCallSink::default();
    let bridge = CallbackBridge::start(client.clone(), sink.clone(), 4)
        .await
        .expect("bridge start");
    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(&bridge.addr(), sink).await;

    let result = sandbox.execute("print(llm_query('x'))", &cancel).await;
    assert_eq!(result.stdout, "mock says hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(
        result.sub_calls,
        vec![SubCall {
            model: "mock-model".to_string(),
            prompt: "x".to_string(),
            response: "mock says hi".to_string(),
        }]
    );

    // The next execution starts from an empty pending buffer.
    let result = sandbox.execute("print('quiet')", &cancel).await;
    assert!(result.sub_calls.is_empty());

    sandbox.close().await;
    bridge.stop().await;
}

#[tokio::test]
async fn batched_queries_preserve_prompt_order() {
    skip_if_no_python!();

    let client = Arc::new(EchoClient::new());
    let sink = SubCallSink::default();
    let bridge = CallbackBridge::start(client, sink.clone(), 2)
        .await
        .expect("bridge start");
    let cancel = CancellationToken::new();
    let mut sandbox = start_sandbox(&bridge.addr(), sink).await;

    let result = sandbox
        .execute(
            "print(llm_query_batched(['one', 'two', 'three']))",
            &cancel,
        )
        .await;
    assert_eq!(result.stdout, "['echo:one', 'echo:two', 'echo:three']\n");
    assert_eq!(result.stderr, "");

    let mut prompts: Vec<String> = result
        .sub_calls
        .iter()
        .map(|call| call.prompt.clone())
        .collect();
    prompts.sort();
    assert_eq!(prompts, vec!["one", "three", "two"]);

    sandbox.close().await;
    bridge.stop().await;
}
