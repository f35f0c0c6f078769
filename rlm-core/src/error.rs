use thiserror::Error;

pub type Result<T> = std::result::Result<T, RlmError>;

/// Errors that abort a completion. Sandbox runtime failures and user-code
/// exceptions are not represented here: they surface through
/// [`crate::types::ExecutionResult::stderr`] and the loop continues.
#[derive(Debug, Error)]
pub enum RlmError {
    #[error("llm client error: {0}")]
    Client(String),

    #[error("failed to start sandbox: {0}")]
    SandboxStart(std::io::Error),

    #[error("callback bridge error: {0}")]
    Bridge(std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("completion cancelled")]
    Cancelled,
}
