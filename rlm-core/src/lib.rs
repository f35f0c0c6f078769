//! Recursive Language Model engine.
//!
//! Drives an LLM conversation through reason → emit-code → execute →
//! feed-back cycles. Executed code runs in a persistent Python sandbox
//! child where the caller's context is materialized as a local variable,
//! and can re-enter the LLM through an in-process callback bridge.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod gemini;
pub mod observability;
pub mod parsing;
pub mod rlm;
pub mod sandbox;
pub mod types;

pub use bridge::CallbackBridge;
pub use client::LlmClient;
pub use config::RlmSettings;
pub use error::Result;
pub use error::RlmError;
pub use gemini::GeminiClient;
pub use rlm::Rlm;
pub use sandbox::Sandbox;
pub use sandbox::SubCallSink;
pub use types::CompletionResult;
pub use types::ExecutionResult;
pub use types::Message;
pub use types::Role;
pub use types::SubCall;
pub use types::UsageSummary;
