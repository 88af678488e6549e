//! Conversation: ordered message history plus the reasoning side table.
//!
//! The chat-completion API rejects any transcript where an assistant
//! message's tool calls are not answered by tool messages that immediately
//! follow it, one per call, in call order. [`Conversation::validate_ordering`]
//! checks exactly that so a bad transcript fails locally with a precise
//! error instead of a remote 400.

use std::collections::BTreeMap;

use crate::inference::types::{AssistantReply, ChatMessage, Role, ToolCall};

use super::errors::OrderingError;
use super::types::Message;

/// Message history for one chat session.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    /// Message index → reasoning text. Never sent to the model.
    reasoning: BTreeMap<usize, String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.reasoning.clear();
    }

    /// Append a message. Returns its index.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn add_user_message(&mut self, content: &str) -> usize {
        self.push(Message::user(content))
    }

    /// Append the model's reply. Reasoning goes to the side table only
    /// when `keep_reasoning` is set.
    pub fn push_assistant(&mut self, reply: &AssistantReply, keep_reasoning: bool) -> usize {
        let mut message = Message::assistant(
            reply.content.as_deref().unwrap_or_default(),
            reply.tool_calls.clone(),
        );
        message.name = reply.name.clone();

        let index = self.push(message);
        if keep_reasoning {
            if let Some(reasoning) = reply.reasoning.as_ref().filter(|r| !r.is_empty()) {
                self.reasoning.insert(index, reasoning.clone());
            }
        }
        index
    }

    pub fn reasoning_for(&self, index: usize) -> Option<&str> {
        self.reasoning.get(&index).map(String::as_str)
    }

    // ─── Context Blocks ──────────────────────────────────────────────────

    /// Upsert a tagged system block.
    ///
    /// Replaces the content in place when `id` exists. Otherwise inserts
    /// just before the first non-context message, or appends when every
    /// message is a context block.
    pub fn add_system_context(&mut self, id: &str, content: &str) {
        if let Some(existing) = self
            .messages
            .iter_mut()
            .find(|m| m.context_id.as_deref() == Some(id))
        {
            existing.content = content.to_string();
            return;
        }

        let at = self
            .messages
            .iter()
            .position(|m| !m.is_context())
            .unwrap_or(self.messages.len());
        self.messages.insert(at, Message::context(id, content));
        self.shift_reasoning_after_insert(at);
    }

    /// Remove a tagged system block. Returns whether one was found.
    pub fn remove_context(&mut self, id: &str) -> bool {
        let Some(at) = self
            .messages
            .iter()
            .position(|m| m.context_id.as_deref() == Some(id))
        else {
            return false;
        };
        self.messages.remove(at);
        self.shift_reasoning_after_remove(at);
        true
    }

    fn shift_reasoning_after_insert(&mut self, at: usize) {
        self.reasoning = std::mem::take(&mut self.reasoning)
            .into_iter()
            .map(|(i, r)| if i >= at { (i + 1, r) } else { (i, r) })
            .collect();
    }

    fn shift_reasoning_after_remove(&mut self, at: usize) {
        self.reasoning = std::mem::take(&mut self.reasoning)
            .into_iter()
            .filter(|(i, _)| *i != at)
            .map(|(i, r)| if i > at { (i - 1, r) } else { (i, r) })
            .collect();
    }

    // ─── Tool Calls ──────────────────────────────────────────────────────

    /// Unanswered calls of the most recent assistant message with tool
    /// calls, in call order.
    pub fn pending_tool_calls(&self) -> Vec<ToolCall> {
        let Some(at) = self.messages.iter().rposition(Message::has_tool_calls) else {
            return Vec::new();
        };

        let answered: Vec<&str> = self.messages[at + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages[at]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .cloned()
            .collect()
    }

    /// Check every tool call is answered by exactly one tool message,
    /// contiguous after its assistant message, in call order.
    pub fn validate_ordering(&self) -> Result<(), OrderingError> {
        let msgs = &self.messages;
        let mut i = 0;

        while i < msgs.len() {
            let msg = &msgs[i];

            if msg.role == Role::Tool {
                return Err(OrderingError::OrphanToolResponse {
                    tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
                    index: i,
                });
            }

            if !msg.has_tool_calls() {
                i += 1;
                continue;
            }

            for (k, call) in msg.tool_calls.iter().enumerate() {
                let index = i + 1 + k;
                let Some(next) = msgs.get(index) else {
                    return Err(OrderingError::MissingResponse {
                        call_id: call.id.clone(),
                        assistant_index: i,
                    });
                };

                if next.role != Role::Tool {
                    let answered_later = msgs[index..].iter().any(|m| {
                        m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call.id.as_str())
                    });
                    return Err(if answered_later {
                        OrderingError::InterleavedMessage {
                            call_id: call.id.clone(),
                            index,
                            role: role_name(next.role).to_string(),
                        }
                    } else {
                        OrderingError::MissingResponse {
                            call_id: call.id.clone(),
                            assistant_index: i,
                        }
                    });
                }

                let found = next.tool_call_id.as_deref().unwrap_or_default();
                if found == call.id {
                    continue;
                }
                if msg.tool_calls.iter().any(|c| c.id == found) {
                    return Err(OrderingError::ReorderedResponse {
                        expected: call.id.clone(),
                        found: found.to_string(),
                        index,
                    });
                }
                return Err(OrderingError::OrphanToolResponse {
                    tool_call_id: found.to_string(),
                    index,
                });
            }

            i += 1 + msg.tool_calls.len();
        }

        Ok(())
    }

    // ─── Wire Form ───────────────────────────────────────────────────────

    /// Messages as sent to the model. Reasoning is never included.
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(to_chat_message).collect()
    }
}

fn to_chat_message(msg: &Message) -> ChatMessage {
    let tool_calls = (!msg.tool_calls.is_empty())
        .then(|| msg.tool_calls.iter().map(ToolCall::to_response).collect());

    let content = if msg.has_tool_calls() && msg.content.is_empty() {
        None
    } else {
        Some(msg.content.clone())
    };

    let name = match msg.role {
        Role::User | Role::Assistant => msg.name.clone(),
        Role::System | Role::Tool => None,
    };

    ChatMessage {
        role: msg.role,
        content,
        name,
        tool_call_id: msg.tool_call_id.clone(),
        tool_calls,
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
