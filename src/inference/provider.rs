//! The chat-completion collaborator contract.
//!
//! The conversation loop talks to a model only through [`ChatCompletion`].
//! Implementations own the transport (HTTP client, local runtime, test fake);
//! [`parse_completion_response`] turns a standard OpenAI-compatible
//! non-streaming body into an [`AssistantReply`] for those that need it.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{AssistantReply, ChatCompletionRequest, ToolCall};

/// One request in, one assistant message out.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: ChatCompletionRequest)
        -> Result<AssistantReply, InferenceError>;
}

/// Parse a non-streaming `/v1/chat/completions` response body.
///
/// Tool call arguments arrive as JSON strings and are decoded here; an empty
/// string decodes to `{}`. Missing tool call ids are generated as
/// `call_<uuid>` so every call can be answered.
pub fn parse_completion_response(body: &str) -> Result<AssistantReply, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        id: Option<String>,
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct Message {
        content: Option<String>,
        name: Option<String>,
        /// DeepSeek-style reasoning field.
        reasoning_content: Option<String>,
        /// Qwen3 / GPT-OSS style reasoning field.
        reasoning: Option<String>,
        tool_calls: Option<Vec<WireToolCall>>,
    }

    #[derive(Deserialize)]
    struct WireToolCall {
        id: Option<String>,
        function: WireFunction,
    }

    #[derive(Deserialize)]
    struct WireFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
        reason: format!("failed to parse completion response: {e}"),
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let arguments = if tc.function.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&tc.function.arguments).map_err(|e| {
                InferenceError::ToolCallParseError {
                    raw_response: tc.function.arguments.clone(),
                    reason: format!("invalid JSON arguments for '{}': {e}", tc.function.name),
                }
            })?
        };
        tool_calls.push(ToolCall {
            id,
            name: tc.function.name,
            arguments,
        });
    }

    let finish_reason = if tool_calls.is_empty() {
        choice.finish_reason
    } else {
        Some("tool_calls".into())
    };

    Ok(AssistantReply {
        id: resp.id,
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        reasoning: choice
            .message
            .reasoning_content
            .or(choice.message.reasoning)
            .filter(|r| !r.is_empty()),
        name: choice.message.name,
        finish_reason,
    })
}
