use serde::Deserialize;
use serde::Serialize;

/// Conversation role. A conversation starts with exactly one `System`
/// message; `User` and `Assistant` messages follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged conversation entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Cumulative token accounting across every LLM invocation made during one
/// completion, driver-initiated and sandbox-initiated alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// One recursive LLM invocation issued from inside sandbox code, attributed
/// to the execution that was in flight when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCall {
    pub model: String,
    pub prompt: String,
    pub response: String,
}

/// Outcome of a single sandbox execution. `stdout` and `stderr` are the
/// exact capture of the interpreter's streams during this execution; user
/// exceptions land in `stderr` rather than failing the call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub execution_time: f64,
    pub sub_calls: Vec<SubCall>,
}

/// The final outward-facing artifact of one completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub root_model: String,
    pub prompt: String,
    pub response: String,
    pub usage_summary: UsageSummary,
    pub execution_time: f64,
}
