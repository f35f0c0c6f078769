//! The driver: owns one completion from request to reply.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bridge::CallbackBridge;
use crate::client::LlmClient;
use crate::config::RlmSettings;
use crate::error::Result;
use crate::error::RlmError;
use crate::observability::RLM_DURATION;
use crate::observability::RLM_ERRORS;
use crate::observability::RLM_ITERATIONS;
use crate::parsing::find_code_blocks;
use crate::parsing::find_final_answer;
use crate::parsing::find_final_var;
use crate::parsing::is_python_identifier;
use crate::sandbox::Sandbox;
use crate::sandbox::SubCallSink;
use crate::types::CompletionResult;
use crate::types::Message;

const TRUNCATION_SUFFIX: &str = "\n...[Output Truncated]...";
const NUDGE_MESSAGE: &str = "Please continue or provide a FINAL(answer).";
const BUDGET_EXHAUSTED_RESPONSE: &str = "Maximum iterations reached without final answer.";

/// Recursive Language Model engine. Drives the LLM through reason →
/// emit-code → execute → feed-back cycles until it emits a terminal marker
/// or the iteration budget runs out.
pub struct Rlm {
    client: Arc<dyn LlmClient>,
    settings: RlmSettings,
}

impl Rlm {
    pub fn new(client: Arc<dyn LlmClient>, settings: RlmSettings) -> Self {
        Self { client, settings }
    }

    /// Runs one completion. `context` defaults to the prompt text when the
    /// caller supplies none. Cancellation is honored at every iteration
    /// boundary and inside the LLM and sandbox calls.
    pub async fn completion(
        &self,
        prompt: &str,
        context: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        let start = Instant::now();
        let result = self.run(prompt, context, &cancel, start).await;
        RLM_DURATION.observe(start.elapsed().as_secs_f64());
        if let Err(err) = &result
            && !matches!(err, RlmError::Cancelled)
        {
            RLM_ERRORS.inc();
        }
        result
    }

    async fn run(
        &self,
        prompt: &str,
        context: Option<Value>,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<CompletionResult> {
        tracing::info!(prompt_len = prompt.len(), "starting rlm completion");

        let sink = SubCallSink::default();
        let bridge = CallbackBridge::start(
            Arc::clone(&self.client),
            sink.clone(),
            self.settings.batch_concurrency,
        )
        .await?;

        let mut sandbox = match Sandbox::start(&self.settings, &bridge.addr(), sink).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                bridge.stop().await;
                return Err(err);
            }
        };

        let outcome = self.drive(prompt, context, cancel, start, &mut sandbox).await;

        // The bridge outlives the sandbox just long enough to drain any last
        // callback that raced with close.
        sandbox.close().await;
        bridge.stop().await;

        outcome
    }

    async fn drive(
        &self,
        prompt: &str,
        context: Option<Value>,
        cancel: &CancellationToken,
        start: Instant,
        sandbox: &mut Sandbox,
    ) -> Result<CompletionResult> {
        let context_value = context.unwrap_or_else(|| Value::String(prompt.to_string()));
        let context_json = serde_json::to_string(&context_value)?;

        let init = context_init_snippet(&context_json)?;
        let init_result = sandbox.execute(&init, cancel).await;
        if !init_result.stderr.is_empty() {
            tracing::warn!(stderr = %init_result.stderr, "context initialization reported errors");
        }

        let system_prompt = compose_system_prompt(
            json_type_name(&context_value),
            context_json.chars().count(),
        );
        let mut messages = vec![
            Message::system(system_prompt),
            Message::user(format!("Query: {prompt}")),
        ];

        for iteration in 0..self.settings.max_iterations {
            if cancel.is_cancelled() {
                tracing::warn!(iteration, "completion cancelled");
                return Err(RlmError::Cancelled);
            }

            tracing::debug!(iteration, "rlm iteration");

            let reply = match cancel
                .run_until_cancelled(self.client.completion(&messages))
                .await
            {
                None => return Err(RlmError::Cancelled),
                Some(reply) => reply?,
            };
            messages.push(Message::assistant(reply.clone()));

            // Code blocks run before the terminal-marker check so that side
            // effects emitted alongside a FINAL land in the same iteration.
            let code_blocks = find_code_blocks(&reply);
            for code in &code_blocks {
                let result = sandbox.execute(code, cancel).await;
                let stdout = truncate_output(&result.stdout, self.settings.max_output_chars);
                let stderr = truncate_output(&result.stderr, self.settings.max_output_chars);
                messages.push(Message::user(format!(
                    "REPL Output:\nStdout: {stdout}\nStderr: {stderr}"
                )));
            }

            if let Some(answer) = find_final_answer(&reply) {
                RLM_ITERATIONS.observe(f64::from(iteration + 1));
                tracing::info!(iterations = iteration + 1, "rlm finished with answer");
                return Ok(self.completion_result(prompt, answer, start));
            }

            if let Some(name) = find_final_var(&reply) {
                match resolve_final_var(&name, sandbox, cancel).await {
                    Ok(answer) => {
                        RLM_ITERATIONS.observe(f64::from(iteration + 1));
                        tracing::info!(
                            iterations = iteration + 1,
                            variable = %name,
                            "rlm finished with variable answer"
                        );
                        return Ok(self.completion_result(prompt, answer, start));
                    }
                    Err(feedback) => messages.push(Message::user(feedback)),
                }
            } else if code_blocks.is_empty() {
                messages.push(Message::user(NUDGE_MESSAGE.to_string()));
            }
        }

        RLM_ITERATIONS.observe(f64::from(self.settings.max_iterations));
        tracing::warn!(
            max_iterations = self.settings.max_iterations,
            "rlm reached max iterations"
        );
        Ok(self.completion_result(prompt, BUDGET_EXHAUSTED_RESPONSE.to_string(), start))
    }

    fn completion_result(&self, prompt: &str, response: String, start: Instant) -> CompletionResult {
        CompletionResult {
            root_model: self.client.model_name().to_string(),
            prompt: prompt.to_string(),
            response,
            usage_summary: self.client.usage_summary(),
            execution_time: start.elapsed().as_secs_f64(),
        }
    }
}

/// Surfaces a sandbox variable as the final answer. Rejections and lookup
/// failures come back as feedback text for the conversation instead of
/// finalizing.
async fn resolve_final_var(
    name: &str,
    sandbox: &mut Sandbox,
    cancel: &CancellationToken,
) -> std::result::Result<String, String> {
    if !is_python_identifier(name) {
        return Err(format!(
            "FINAL_VAR expects the name of a variable defined in the REPL, got {name:?}. {NUDGE_MESSAGE}"
        ));
    }

    let result = sandbox.execute(&format!("print({name})"), cancel).await;
    if !result.stderr.trim().is_empty() {
        return Err(format!(
            "FINAL_VAR({name}) failed:\n{}\n{NUDGE_MESSAGE}",
            result.stderr
        ));
    }

    Ok(result.stdout.trim().to_string())
}

/// Builds the snippet that materializes the caller's context inside the
/// sandbox. The JSON payload is embedded as a Python string literal via a
/// second JSON-string encoding (JSON string escapes are a strict subset of
/// Python's), so arbitrary quote and backslash content survives.
fn context_init_snippet(context_json: &str) -> Result<String> {
    let literal = serde_json::to_string(context_json)?;
    Ok(format!("import json\ncontext = json.loads({literal})"))
}

fn compose_system_prompt(context_type: &str, context_length: usize) -> String {
    format!(
        r#"You are a Recursive Language Model. You are tasked with answering a query with associated context. You can access, transform, and analyze this context interactively in a REPL environment that can recursively query sub-LLMs, which you are strongly encouraged to use as much as possible. You will be queried iteratively until you provide a final answer.

Your context is available in the 'context' variable.
Context Type: {context_type}
Context Total Length: {context_length} characters

The REPL environment is initialized with:
1. A 'context' variable that contains extremely important information about your query. You should check the content of the 'context' variable to understand what you are working with.
2. A 'llm_query' function that allows you to query an LLM inside your REPL environment. Use it like: llm_query("your question") or llm_query("question", model="model-name").
3. The ability to use 'print()' statements to view the output of your REPL code and continue your reasoning.

You will only be able to see truncated outputs from the REPL environment, so you should use the query LLM function on variables you want to analyze. Use these variables as buffers to build up your final answer.
Make sure to explicitly look through the entire context in REPL before answering your query.

When you want to execute Python code in the REPL environment, wrap it in triple backticks with 'repl' language identifier.

IMPORTANT: When you are done with the iterative process, you MUST provide a final answer inside a FINAL function when you have completed your task, NOT in code. Do not use these tags unless you have completed your task. You have two options:
1. Use FINAL(your final answer here) to provide the answer directly
2. Use FINAL_VAR(variable_name) to return a variable you have created in the REPL environment as your final output

Think step by step carefully, plan, and execute this plan immediately in your response. Output to the REPL environment and recursive LLMs as much as possible."#
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Head-truncates to `max_chars` characters, marking the cut with the
/// truncation suffix. At or below the limit the capture passes through
/// byte-identical.
fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let truncated: String = output.chars().take(max_chars).collect();
    format!("{truncated}{TRUNCATION_SUFFIX}")
}
