//! Conversation orchestrator: model turn → tool calls → tool results → model turn.
//!
//! State machine over one [`Conversation`]:
//! 1. **Idle**: no unresolved tool calls; `send_message` may be called.
//! 2. **AwaitingToolResults**: the latest assistant message requested tools.
//!    `send_message` returns here on purpose so the caller can render the
//!    pending calls before anything executes.
//!
//! `process_tool_calls` runs the pending calls one at a time, in the order the
//! model issued them, appending exactly one tool message per call. Failures
//! become `Error: …` tool messages rather than disappearing, so the model can
//! react to them. `process_and_continue` alternates processing and model turns
//! until the model stops asking for tools or the round cap is hit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{AgentConfig, ModelConfig};
use crate::inference::provider::ChatCompletion;
use crate::inference::types::ChatCompletionRequest;
use crate::mcp_client::{RegisteredTool, ToolCallResult};

use super::conversation::Conversation;
use super::errors::AgentError;
use super::function_bridge::{split_tool_id, FunctionBridge};
use super::tool_router::{ToolExecutor, ToolRouter};
use super::types::{LoopOutcome, Message, OrchestratorEvent, OrchestratorState};

/// Event buffer per subscriber. Slow subscribers see `Lagged`, never block.
const EVENT_CAPACITY: usize = 64;

/// Author name on synthetic tool messages the orchestrator writes itself.
const SYSTEM_AUTHOR: &str = "system";

pub struct ConversationOrchestrator {
    conversation: Conversation,
    bridge: FunctionBridge,
    router: ToolRouter,
    model: Arc<dyn ChatCompletion>,
    model_config: ModelConfig,
    max_tool_rounds: usize,
    tool_call_max_age: Duration,
    events: broadcast::Sender<OrchestratorEvent>,
    /// Set while a background capability refresh is running.
    refresh_in_flight: Arc<AtomicBool>,
}

impl ConversationOrchestrator {
    pub fn new(
        model: Arc<dyn ChatCompletion>,
        tools: Arc<dyn ToolExecutor>,
        model_config: ModelConfig,
        agent: &AgentConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conversation: Conversation::new(),
            bridge: FunctionBridge::new(),
            router: ToolRouter::new(tools, agent.max_tool_result_chars),
            model,
            model_config,
            max_tool_rounds: agent.max_tool_rounds,
            tool_call_max_age: agent.tool_call_max_age(),
            events,
            refresh_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    // ─── History ─────────────────────────────────────────────────────────

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn get_history(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Reasoning kept for the message at `index` (reasoner models only).
    pub fn reasoning_for(&self, index: usize) -> Option<&str> {
        self.conversation.reasoning_for(index)
    }

    pub fn state(&self) -> OrchestratorState {
        if self.conversation.pending_tool_calls().is_empty() {
            OrchestratorState::Idle
        } else {
            OrchestratorState::AwaitingToolResults
        }
    }

    pub fn add_user_message(&mut self, content: &str) {
        self.conversation.add_user_message(content);
    }

    pub fn add_system_context(&mut self, id: &str, content: &str) {
        self.conversation.add_system_context(id, content);
    }

    pub fn remove_context(&mut self, id: &str) -> bool {
        self.conversation.remove_context(id)
    }

    /// Drop the whole history and any outstanding call bookkeeping.
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.bridge.clear();
    }

    // ─── Tool Surface ────────────────────────────────────────────────────

    pub fn get_available_tools(&self) -> Vec<RegisteredTool> {
        self.router.executor().available_tools()
    }

    /// Call a tool directly by its `server:tool` id, outside the model loop.
    pub async fn call_tool(
        &self,
        tool_id: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, AgentError> {
        let (server, tool) = split_tool_id(tool_id).ok_or_else(|| AgentError::InvalidToolId {
            tool_id: tool_id.to_string(),
        })?;
        Ok(self.router.executor().call_tool(server, tool, arguments).await?)
    }

    // ─── Model Turns ─────────────────────────────────────────────────────

    /// Run one model turn and append the reply.
    ///
    /// Fails with [`AgentError::Ordering`] before anything goes over the
    /// network when the transcript is malformed. If the reply requests
    /// tools, they are registered but not executed.
    pub async fn send_message(&mut self) -> Result<Message, AgentError> {
        self.conversation.validate_ordering()?;
        self.spawn_background_refresh();
        self.bridge.cleanup_older_than(self.tool_call_max_age);

        let tools = self
            .bridge
            .tool_definitions(&self.router.executor().available_tools());
        let request = ChatCompletionRequest {
            model: self.model_config.model.clone(),
            messages: self.conversation.to_chat_messages(),
            tools: (!tools.is_empty()).then_some(tools),
            temperature: self.model_config.temperature,
            top_p: self.model_config.top_p,
            max_tokens: self.model_config.max_tokens,
            stream: false,
        };

        let reply = self.model.complete(request).await?;

        for call in &reply.tool_calls {
            match self.bridge.resolve(&call.name) {
                Some((server, tool)) => self.bridge.register_call(
                    &call.id,
                    &format!("{server}:{tool}"),
                    &server,
                    call.arguments.clone(),
                ),
                None => tracing::debug!(
                    call_id = %call.id,
                    function = %call.name,
                    "tool call name does not decode; it will be answered with an error"
                ),
            }
        }

        let index = self
            .conversation
            .push_assistant(&reply, self.model_config.is_reasoner());
        tracing::debug!(
            index,
            tool_calls = reply.tool_calls.len(),
            finish_reason = reply.finish_reason.as_deref().unwrap_or("unknown"),
            "assistant turn appended"
        );
        Ok(self.conversation.messages()[index].clone())
    }

    /// Execute every pending tool call, sequentially, in call order.
    /// Returns how many were processed.
    pub async fn process_tool_calls(&mut self) -> usize {
        let pending = self.conversation.pending_tool_calls();

        for call in &pending {
            self.emit(OrchestratorEvent::ToolCallStarted {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
            });

            let result = self.router.dispatch_single(call, &self.bridge).await;
            let text = self.router.render_result(&result);
            self.conversation
                .push(Message::tool(&call.id, &text).with_name(&call.name));
            self.bridge.complete_call(&call.id);

            self.emit(OrchestratorEvent::ToolCallCompleted {
                call_id: call.id.clone(),
                tool_name: result.tool_name,
                success: result.success,
                execution_time_ms: result.execution_time_ms,
            });
        }

        pending.len()
    }

    /// Alternate tool execution and model turns until the model stops
    /// requesting tools or `max_tool_rounds` rounds have run.
    ///
    /// Hitting the cap is not an error: each still-pending call is answered
    /// with a synthetic error message so the transcript stays valid.
    pub async fn process_and_continue(&mut self) -> Result<LoopOutcome, AgentError> {
        let mut rounds = 0;

        while self.state() == OrchestratorState::AwaitingToolResults {
            if rounds >= self.max_tool_rounds {
                self.close_pending_calls_at_limit(rounds);
                return Ok(LoopOutcome::RoundLimitReached { rounds });
            }

            self.process_tool_calls().await;
            rounds += 1;
            self.send_message().await?;
        }

        Ok(LoopOutcome::Completed { rounds })
    }

    /// Collaborator entry point: one user turn through to the final answer.
    ///
    /// Returns the content of the last message, which is the synthetic
    /// error text when the round cap was hit.
    pub async fn send_user_message_and_get_response(
        &mut self,
        text: &str,
    ) -> Result<String, AgentError> {
        self.add_user_message(text);
        self.send_message().await?;
        let outcome = self.process_and_continue().await?;
        tracing::debug!(?outcome, "conversation turn finished");

        Ok(self
            .conversation
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }

    // ─── Internals ───────────────────────────────────────────────────────

    /// Answer every call in the final batch: one synthetic message per call,
    /// so a reply that asked for N tools at the cap gets N error messages.
    fn close_pending_calls_at_limit(&mut self, rounds: usize) {
        let pending = self.conversation.pending_tool_calls();
        tracing::warn!(
            rounds,
            pending = pending.len(),
            "tool-call round limit reached; stopping the loop"
        );

        for call in &pending {
            let text = format!(
                "Error: tool-call round limit of {} reached; '{}' was not executed",
                self.max_tool_rounds, call.name
            );
            self.conversation
                .push(Message::tool(&call.id, &text).with_name(SYSTEM_AUTHOR));
            self.bridge.complete_call(&call.id);
        }

        self.emit(OrchestratorEvent::RoundLimitReached { rounds });
    }

    /// Refresh capability snapshots without blocking the caller. At most one
    /// refresh runs at a time.
    fn spawn_background_refresh(&self) {
        if self.refresh_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let executor = Arc::clone(self.router.executor());
        let guard = InFlightGuard(Arc::clone(&self.refresh_in_flight));
        tokio::spawn(async move {
            let _guard = guard;
            for (server, e) in executor.refresh_tools().await {
                tracing::warn!(server = %server, error = %e, "background capability refresh failed");
            }
        });
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Clears the refresh flag when the task ends, including by panic.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
