//! The LLM client contract consumed by the driver and the callback bridge.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Message;
use crate::types::UsageSummary;

/// A chat-completion backend. The driver and the callback bridge share one
/// client per completion, so implementations must tolerate concurrent
/// invocation; usage counters accumulate across all of them.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Runs one completion over the accumulated conversation and returns the
    /// reply text. The implementation maps roles to its vendor equivalents
    /// (including hoisting the single `system` message into a dedicated slot
    /// where required) and updates the usage counters.
    async fn completion(&self, messages: &[Message]) -> Result<String>;

    fn model_name(&self) -> &str;

    fn usage_summary(&self) -> UsageSummary;
}
