//! End-to-end driver scenarios against a scripted mock client and a real
//! python sandbox.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rlm_core::Message;
use rlm_core::Rlm;
use rlm_core::RlmError;
use rlm_core::RlmSettings;
use rlm_core::Role;
use tokio_util::sync::CancellationToken;

use crate::suite::MockClient;

fn settings(max_iterations: u32) -> RlmSettings {
    RlmSettings {
        max_iterations,
        ..RlmSettings::default()
    }
}

#[tokio::test]
async fn immediate_final_answer() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&["FINAL(42)"]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("What is the answer?", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(result.response, "42");
    assert_eq!(result.root_model, "mock-model");
    assert_eq!(result.prompt, "What is the answer?");
    assert_eq!(result.usage_summary.total_calls, 1);
    assert_eq!(client.total_calls(), 1);

    // One leading system message, then the query; no REPL feedback happened.
    let seen = client.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0][0].role, Role::System);
    assert_eq!(seen[0][1], Message::user("Query: What is the answer?"));
}

#[tokio::test]
async fn one_repl_cycle_feeds_output_back() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&[
        "```repl\nprint('hello')\n```",
        "FINAL(hello)",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Print hello", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(result.response, "hello");

    let seen = client.seen();
    assert_eq!(seen.len(), 2);
    let feedback = seen[1].last().expect("feedback message");
    assert_eq!(feedback.role, Role::User);
    assert!(
        feedback.content.starts_with("REPL Output:\nStdout: hello"),
        "unexpected feedback: {}",
        feedback.content
    );
}

#[tokio::test]
async fn budget_exhaustion_returns_sentinel() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&["Thinking...", "Thinking...", "Thinking..."]));
    let engine = Rlm::new(client.clone(), settings(2));
    let result = engine
        .completion("Loop forever", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(
        result.response,
        "Maximum iterations reached without final answer."
    );
    assert_eq!(client.total_calls(), 2);

    // A reply with neither code nor FINAL earns a nudge.
    let seen = client.seen();
    let nudge = seen[1].last().expect("nudge message");
    assert_eq!(
        nudge,
        &Message::user("Please continue or provide a FINAL(answer).")
    );

    // One leading system message, never two consecutive assistant replies.
    let conversation = seen.last().expect("final conversation");
    assert_eq!(conversation[0].role, Role::System);
    for pair in conversation.windows(2) {
        assert!(
            !(pair[0].role == Role::Assistant && pair[1].role == Role::Assistant),
            "consecutive assistant messages"
        );
    }
}

#[tokio::test]
async fn oversized_output_is_truncated_in_feedback() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&[
        "```repl\nprint('A' * 3000)\n```",
        "FINAL(done)",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Flood stdout", None, CancellationToken::new())
        .await
        .expect("completion");
    assert_eq!(result.response, "done");

    let seen = client.seen();
    let feedback = &seen[1].last().expect("feedback message").content;
    let kept = "A".repeat(2000);
    assert!(feedback.contains(&format!("{kept}\n...[Output Truncated]...")));
    assert!(!feedback.contains(&"A".repeat(2001)));
}

#[tokio::test]
async fn code_blocks_execute_before_finalizing() {
    skip_if_no_python!();

    // The reply carries both a code block and a terminal marker; the block's
    // llm_query side effect must be observable even though the completion
    // finalizes in the same iteration.
    let client = Arc::new(MockClient::new(&[
        "```repl\nprint(llm_query('side'))\n```\nFINAL(both)",
        "side-response",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Do both", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(result.response, "both");
    assert_eq!(client.total_calls(), 2);
    // Driver iteration plus one sub-call.
    assert_eq!(result.usage_summary.total_calls, 2);

    let seen = client.seen();
    assert_eq!(seen[1], vec![Message::user("side")]);
}

#[tokio::test]
async fn final_var_surfaces_a_sandbox_variable() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&[
        "```repl\nanswer = 'built up in the repl'\n```",
        "FINAL_VAR(answer)",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Use a variable", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(result.response, "built up in the repl");
}

#[tokio::test]
async fn final_var_with_unknown_name_feeds_back() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&[
        "FINAL_VAR(never_defined)",
        "FINAL(recovered)",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Bad variable", None, CancellationToken::new())
        .await
        .expect("completion");

    assert_eq!(result.response, "recovered");
    let seen = client.seen();
    let feedback = &seen[1].last().expect("feedback message").content;
    assert!(
        feedback.contains("FINAL_VAR(never_defined) failed"),
        "unexpected feedback: {feedback}"
    );
}

#[tokio::test]
async fn context_round_trips_through_the_sandbox() {
    skip_if_no_python!();

    let context = serde_json::json!({
        "title": "it's tricky: ''' \" \\ done",
        "items": [1, 2, 3],
    });
    let client = Arc::new(MockClient::new(&[
        "```repl\nimport json\nprint(json.dumps(context, sort_keys=True))\n```",
        "FINAL(ok)",
    ]));
    let engine = Rlm::new(client.clone(), settings(5));
    let result = engine
        .completion("Inspect context", Some(context.clone()), CancellationToken::new())
        .await
        .expect("completion");
    assert_eq!(result.response, "ok");

    let seen = client.seen();
    let feedback = &seen[1].last().expect("feedback message").content;
    let stdout = feedback
        .strip_prefix("REPL Output:\nStdout: ")
        .and_then(|rest| rest.split("\nStderr:").next())
        .expect("stdout section");
    let round_tripped: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("valid json from sandbox");
    assert_eq!(round_tripped, context);
}

#[tokio::test]
async fn system_prompt_reports_context_shape() {
    skip_if_no_python!();

    let context = serde_json::json!({"k": "v"});
    let context_len = serde_json::to_string(&context).unwrap().chars().count();
    let client = Arc::new(MockClient::new(&["FINAL(done)"]));
    let engine = Rlm::new(client.clone(), settings(5));
    engine
        .completion("Check prompt", Some(context), CancellationToken::new())
        .await
        .expect("completion");

    let seen = client.seen();
    let system = &seen[0][0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("Context Type: object"));
    assert!(
        system
            .content
            .contains(&format!("Context Total Length: {context_len} characters"))
    );
}

#[tokio::test]
async fn cancellation_aborts_at_iteration_boundary() {
    skip_if_no_python!();

    let client = Arc::new(MockClient::new(&["FINAL(never reached)"]));
    let engine = Rlm::new(client.clone(), settings(5));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine
        .completion("Cancelled", None, cancel)
        .await
        .expect_err("cancelled completion");
    assert!(matches!(err, RlmError::Cancelled));
    assert_eq!(client.total_calls(), 0);
}
