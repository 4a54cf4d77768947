//! The Chat LLM external collaborator (spec §6).
//!
//! This is kept close to the teacher's [`ClientWrapper`]-style abstraction: the model
//! endpoint itself is out of scope for this crate (spec §1), so the trait exists only
//! to give the rest of the runtime a narrow, mockable seam.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The role associated with a message sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    System,
    User,
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    Tool { call_id: String },
}

/// A provider-agnostic JSON-schema tool definition forwarded with a chat request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// A tool call returned by the model in a native function-calling response.
#[derive(Debug, Clone)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A single chat message, either sent to or received from the model.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self { role: Role::User, content: content.into(), tool_calls: Vec::new() }
    }

    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self { role: Role::System, content: content.into(), tool_calls: Vec::new() }
    }
}

/// Token accounting for one [`ChatLlm::generate`] call.
#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Trait-driven abstraction over the Chat LLM endpoint.
///
/// Implementations must be thread-safe (`Send + Sync`) so a single instance can be
/// shared across concurrently-running subtasks. The default [`ChatLlm::usage_slot`]
/// reports no usage data; implementations that expose billing information should
/// override it instead of [`ChatLlm::get_last_usage`] directly.
#[async_trait]
pub trait ChatLlm: Send + Sync {
    /// Must support function/tool calling: when `tools` is `Some` and non-empty, the
    /// returned [`Message`] may carry non-empty [`Message::tool_calls`].
    async fn generate(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
        temperature: Option<f32>,
    ) -> Result<Message, Box<dyn Error + Send + Sync>>;

    fn model_name(&self) -> &str;

    async fn get_last_usage(&self) -> Option<TokenUsage> {
        if let Some(slot) = self.usage_slot() {
            slot.lock().await.clone()
        } else {
            None
        }
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        None
    }
}

impl Clone for TokenUsage {
    fn clone(&self) -> Self {
        Self {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
        }
    }
}
