//! The agentic loop controller.
//!
//! One `run` drives a single user message to completion:
//!
//! ```text
//! AwaitingModel ──► StreamingResponse ──► DispatchingTools ──► AwaitingModel
//!                          │
//!                          └──► Terminal
//! ```
//!
//! The loop only stops when the model's stop reason is something other than
//! `tool_use`; there is no iteration cap. Upstream failures end the run with a
//! single `error` event. Tool failures are fed back to the model and reported
//! in a warning block before `done`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use loopwire_config::{AppConfig, MalformedInputPolicy};
use loopwire_core::error::ProviderError;
use loopwire_core::message::{ContentBlock, ConversationId, ConversationTurn};
use loopwire_core::provider::{
    Provider, ProviderRequest, ToolDefinition, UpstreamEvent, UpstreamStream, Usage,
};
use loopwire_core::tool::{ToolContext, ToolOutcome, ToolRegistry};
use loopwire_providers::{RetryPolicy, with_retry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decoder::{DecodedMessage, StreamDecoder};
use crate::dispatch::ToolDispatcher;
use crate::stream_event::DownstreamEvent;

/// Shown to the user when the upstream stays overloaded after every retry.
pub const OVERLOADED_MESSAGE: &str =
    "The AI service is experiencing high demand right now. Please try again in a moment.";

/// One incoming user message plus the conversation it belongs to.
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub conversation_id: ConversationId,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    pub message: String,
}

/// A tool failure recorded for the closing warning block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub tool_name: String,
    pub error: String,
}

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingModel,
    StreamingResponse,
    DispatchingTools,
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopStatus {
    /// `done` was emitted.
    Completed,
    /// An upstream failure ended the run; carries the message sent to the client.
    Failed(String),
    /// The client went away before the run finished.
    Disconnected,
    /// The caller's deadline elapsed.
    TimedOut,
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub conversation_id: ConversationId,
    /// History plus every turn this run appended.
    pub turns: Vec<ConversationTurn>,
    /// All assistant text streamed during the run, warning block included.
    pub assistant_text: String,
    pub iterations: usize,
    pub tool_calls: usize,
    pub failures: Vec<ToolFailure>,
    pub usage: Usage,
    pub status: LoopStatus,
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == LoopStatus::Completed
    }
}

/// Per-request mutable state. Lives for one `run`.
#[derive(Debug)]
struct LoopState {
    conversation_id: ConversationId,
    turns: Vec<ConversationTurn>,
    assistant_text: String,
    phase: Phase,
    failures: Vec<ToolFailure>,
    iterations: usize,
    tool_calls: usize,
    usage: Usage,
}

impl LoopState {
    fn new(request: LoopRequest) -> Self {
        let mut turns = request.history;
        turns.push(ConversationTurn::user(request.message));
        Self {
            conversation_id: request.conversation_id,
            turns,
            assistant_text: String::new(),
            phase: Phase::AwaitingModel,
            failures: Vec::new(),
            iterations: 0,
            tool_calls: 0,
            usage: Usage::default(),
        }
    }

    fn should_continue(&self) -> bool {
        self.phase != Phase::Terminal
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, iteration = self.iterations, "Loop phase change");
        self.phase = phase;
    }

    fn into_outcome(self, status: LoopStatus) -> LoopOutcome {
        LoopOutcome {
            conversation_id: self.conversation_id,
            turns: self.turns,
            assistant_text: self.assistant_text,
            iterations: self.iterations,
            tool_calls: self.tool_calls,
            failures: self.failures,
            usage: self.usage,
            status,
        }
    }
}

/// Why a run stopped before reaching `Terminal`.
#[derive(Debug)]
enum LoopAbort {
    Upstream(ProviderError),
    Disconnected,
    TimedOut(Duration),
}

/// The core agent loop that orchestrates upstream calls and tool execution.
pub struct AgentLoop {
    /// Upstream model, built once per process and shared
    provider: Arc<dyn Provider>,

    dispatcher: ToolDispatcher,

    model: String,

    system_prompt: Option<String>,

    temperature: f32,

    max_tokens: u32,

    /// Backoff for the upstream call only
    retry: RetryPolicy,

    /// What to do with tool input that is not valid JSON
    malformed_input: MalformedInputPolicy,
}

impl AgentLoop {
    /// Create a new agent loop.
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            dispatcher: ToolDispatcher::new(tools),
            model: model.into(),
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 4096,
            retry: RetryPolicy::default(),
            malformed_input: MalformedInputPolicy::default(),
        }
    }

    /// Create a loop with every knob taken from configuration.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: &AppConfig,
    ) -> Self {
        let mut agent = Self::new(provider, config.model.clone(), tools)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
            .with_retry_policy(RetryPolicy::from(&config.agent))
            .with_result_budget(config.agent.tool_result_budget)
            .with_malformed_input(config.agent.malformed_input);
        if let Some(prompt) = &config.system_prompt {
            agent = agent.with_system_prompt(prompt.clone());
        }
        agent
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Character budget for each tool result sent back upstream.
    pub fn with_result_budget(mut self, budget: usize) -> Self {
        self.dispatcher = self.dispatcher.with_result_budget(budget);
        self
    }

    pub fn with_malformed_input(mut self, policy: MalformedInputPolicy) -> Self {
        self.malformed_input = policy;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.dispatcher.registry()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run one user message to completion, reporting progress on `events`.
    ///
    /// Exactly one terminal event (`done` or `error`) is sent unless the
    /// receiver is dropped first.
    pub async fn run(
        &self,
        request: LoopRequest,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> LoopOutcome {
        self.run_until(request, events, None).await
    }

    /// Like [`run`](Self::run), but abandon in-flight work once `deadline`
    /// elapses and report a timeout error instead.
    pub async fn run_with_deadline(
        &self,
        request: LoopRequest,
        events: &mpsc::Sender<DownstreamEvent>,
        deadline: Duration,
    ) -> LoopOutcome {
        self.run_until(request, events, Some(deadline)).await
    }

    async fn run_until(
        &self,
        request: LoopRequest,
        events: &mpsc::Sender<DownstreamEvent>,
        deadline: Option<Duration>,
    ) -> LoopOutcome {
        let mut state = LoopState::new(request);
        info!(
            conversation_id = %state.conversation_id,
            history_turns = state.turns.len() - 1,
            model = %self.model,
            "Agent loop started"
        );

        let result = match deadline {
            Some(limit) => {
                match tokio::time::timeout(limit, self.drive(&mut state, events)).await {
                    Ok(result) => result,
                    Err(_) => Err(LoopAbort::TimedOut(limit)),
                }
            }
            None => self.drive(&mut state, events).await,
        };

        self.conclude(state, result, events).await
    }

    /// Iterate until the model stops asking for tools.
    async fn drive(
        &self,
        state: &mut LoopState,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> Result<(), LoopAbort> {
        let tools = self.dispatcher.registry().definitions();
        let ctx = ToolContext {
            conversation_id: state.conversation_id.clone(),
        };

        while state.should_continue() {
            state.iterations += 1;
            state.enter(Phase::AwaitingModel);
            let request = self.build_request(&state.turns, &tools);
            let (prelude, stream) = self
                .open_stream(&request)
                .await
                .map_err(LoopAbort::Upstream)?;

            state.enter(Phase::StreamingResponse);
            let decoded = self.consume(prelude, stream, state, events).await?;
            state.usage.accumulate(decoded.usage);
            debug!(
                iteration = state.iterations,
                stop_reason = ?decoded.stop_reason,
                blocks = decoded.blocks.len(),
                "Upstream response decoded"
            );

            if decoded.requests_tools() {
                state.enter(Phase::DispatchingTools);
                self.dispatch_tools(decoded, &ctx, state, events).await?;
            } else {
                let blocks = close_unanswered_tools(decoded, state, events).await?;
                if !blocks.is_empty() {
                    state.turns.push(ConversationTurn::assistant(blocks));
                }
                state.enter(Phase::Terminal);
            }
        }
        Ok(())
    }

    fn build_request(&self, turns: &[ConversationTurn], tools: &[ToolDefinition]) -> ProviderRequest {
        ProviderRequest {
            model: self.model.clone(),
            system: self.system_prompt.clone(),
            turns: turns.to_vec(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
        }
    }

    /// Open the upstream stream under the retry policy.
    ///
    /// Overload can arrive as an HTTP status or as an `error` event before
    /// any content, so an attempt only counts as started once the first
    /// content-bearing event is in hand. Events read so far are returned
    /// alongside the stream.
    async fn open_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<(Vec<UpstreamEvent>, UpstreamStream), ProviderError> {
        with_retry(&self.retry, |attempt| {
            let provider = Arc::clone(&self.provider);
            let request = request.clone();
            async move {
                debug!(provider = provider.name(), attempt, "Calling upstream");
                let mut stream = match provider.stream(request).await {
                    Ok(stream) => stream,
                    Err(e) => return Err(e),
                };
                let mut prelude = Vec::new();
                loop {
                    match stream.recv().await {
                        Some(Ok(event @ UpstreamEvent::MessageStart { .. })) => prelude.push(event),
                        Some(Ok(event)) => {
                            prelude.push(event);
                            return Ok((prelude, stream));
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(ProviderError::StreamInterrupted(
                                "stream closed before any content".into(),
                            ));
                        }
                    }
                }
            }
        })
        .await
    }

    /// Feed the whole response through the decoder, forwarding what it emits.
    async fn consume(
        &self,
        prelude: Vec<UpstreamEvent>,
        mut stream: UpstreamStream,
        state: &mut LoopState,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> Result<DecodedMessage, LoopAbort> {
        let mut decoder = StreamDecoder::new();
        for event in prelude {
            absorb(&mut decoder, event, state, events).await?;
        }

        while !decoder.is_complete() {
            match stream.recv().await {
                Some(Ok(event)) => absorb(&mut decoder, event, state, events).await?,
                Some(Err(e)) => return Err(LoopAbort::Upstream(e)),
                None => {
                    return Err(LoopAbort::Upstream(ProviderError::StreamInterrupted(
                        "stream closed before message_stop".into(),
                    )));
                }
            }
        }
        Ok(decoder.finish())
    }

    /// Run every requested tool in emission order and append the two turns
    /// that record the exchange.
    async fn dispatch_tools(
        &self,
        decoded: DecodedMessage,
        ctx: &ToolContext,
        state: &mut LoopState,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> Result<(), LoopAbort> {
        let mut results = Vec::new();

        for (tool_id, tool_name, input) in decoded.tool_invocations() {
            let dispatched = match (self.malformed_input, decoded.malformed_input(tool_id)) {
                (MalformedInputPolicy::ReportToModel, Some(bad)) => {
                    self.dispatcher.reject_malformed(tool_id, tool_name, &bad.error)
                }
                _ => {
                    self.dispatcher
                        .dispatch(tool_id, tool_name, input.clone(), ctx)
                        .await
                }
            };
            state.tool_calls += 1;

            let event = match &dispatched.result.outcome {
                ToolOutcome::Success(_) => DownstreamEvent::ToolResult {
                    tool_id: tool_id.to_string(),
                    tool_name: tool_name.to_string(),
                    summary: dispatched.summary.clone(),
                    truncated: dispatched.result.truncated,
                },
                ToolOutcome::Failure(error) => {
                    state.failures.push(ToolFailure {
                        tool_name: tool_name.to_string(),
                        error: error.clone(),
                    });
                    DownstreamEvent::ToolError {
                        tool_id: tool_id.to_string(),
                        tool_name: tool_name.to_string(),
                        error: error.clone(),
                    }
                }
            };
            emit(events, event).await?;
            results.push(dispatched.result.to_block());
        }

        state.turns.push(ConversationTurn::assistant(decoded.blocks));
        state.turns.push(ConversationTurn::tool_results(results));
        Ok(())
    }

    /// Send the terminal event for however the run ended.
    async fn conclude(
        &self,
        mut state: LoopState,
        result: Result<(), LoopAbort>,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> LoopOutcome {
        let status = match result {
            Ok(()) => match self.finish_success(&mut state, events).await {
                Ok(()) => LoopStatus::Completed,
                Err(_) => LoopStatus::Disconnected,
            },
            Err(LoopAbort::Upstream(e)) => {
                let message = if e.is_overloaded() {
                    OVERLOADED_MESSAGE.to_string()
                } else {
                    e.to_string()
                };
                warn!(
                    conversation_id = %state.conversation_id,
                    iteration = state.iterations,
                    error = %e,
                    "Agent loop aborted by upstream failure"
                );
                let _ = events
                    .send(DownstreamEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                LoopStatus::Failed(message)
            }
            Err(LoopAbort::TimedOut(limit)) => {
                warn!(
                    conversation_id = %state.conversation_id,
                    timeout_secs = limit.as_secs(),
                    "Agent loop exceeded its deadline"
                );
                let _ = events
                    .send(DownstreamEvent::Error {
                        message: format!("Request timed out after {}s", limit.as_secs()),
                    })
                    .await;
                LoopStatus::TimedOut
            }
            Err(LoopAbort::Disconnected) => {
                debug!(conversation_id = %state.conversation_id, "Client disconnected; loop stopped");
                LoopStatus::Disconnected
            }
        };

        info!(
            conversation_id = %state.conversation_id,
            iterations = state.iterations,
            tool_calls = state.tool_calls,
            tool_failures = state.failures.len(),
            input_tokens = state.usage.input_tokens,
            output_tokens = state.usage.output_tokens,
            status = ?status,
            "Agent loop finished"
        );
        state.into_outcome(status)
    }

    async fn finish_success(
        &self,
        state: &mut LoopState,
        events: &mpsc::Sender<DownstreamEvent>,
    ) -> Result<(), LoopAbort> {
        if let Some(warning) = failure_warning(&state.failures) {
            state.assistant_text.push_str(&warning);
            emit(events, DownstreamEvent::TextDelta { content: warning }).await?;
        }
        emit(
            events,
            DownstreamEvent::Done {
                conversation_id: state.conversation_id.to_string(),
                iterations: state.iterations,
                tool_calls: state.tool_calls,
            },
        )
        .await
    }
}

async fn absorb(
    decoder: &mut StreamDecoder,
    event: UpstreamEvent,
    state: &mut LoopState,
    events: &mpsc::Sender<DownstreamEvent>,
) -> Result<(), LoopAbort> {
    let Some(downstream) = decoder.apply(event) else {
        return Ok(());
    };
    if let DownstreamEvent::TextDelta { content } = &downstream {
        state.assistant_text.push_str(content);
    }
    emit(events, downstream).await
}

/// Settle tool blocks in a final response that will never be dispatched.
///
/// Each one already produced a `tool_start`, so it gets a `tool_error` and a
/// recorded failure. The blocks are dropped from the returned content: a
/// stored `tool_use` without a matching result would poison the history.
async fn close_unanswered_tools(
    decoded: DecodedMessage,
    state: &mut LoopState,
    events: &mpsc::Sender<DownstreamEvent>,
) -> Result<Vec<ContentBlock>, LoopAbort> {
    let reason = decoded.stop_reason.as_str().to_string();
    let mut kept = Vec::with_capacity(decoded.blocks.len());

    for block in decoded.blocks {
        let (id, name) = match block {
            ContentBlock::ToolInvocation { id, name, .. } => (id, name),
            other => {
                kept.push(other);
                continue;
            }
        };
        let error = format!("Response ended before the tool could run (stop reason: {reason})");
        warn!(tool = %name, tool_id = %id, stop_reason = %reason, "Dropping unanswered tool invocation");
        state.failures.push(ToolFailure {
            tool_name: name.clone(),
            error: error.clone(),
        });
        emit(
            events,
            DownstreamEvent::ToolError {
                tool_id: id,
                tool_name: name,
                error,
            },
        )
        .await?;
    }
    Ok(kept)
}

async fn emit(
    events: &mpsc::Sender<DownstreamEvent>,
    event: DownstreamEvent,
) -> Result<(), LoopAbort> {
    events
        .send(event)
        .await
        .map_err(|_| LoopAbort::Disconnected)
}

/// Bulleted `tool: error` lines, or `None` when nothing failed.
pub fn failure_warning(failures: &[ToolFailure]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    let mut warning = String::from("\n\n---\n**Warning:** some tools failed while answering:\n");
    for failure in failures {
        let _ = writeln!(warning, "- {}: {}", failure.tool_name, failure.error);
    }
    Some(warning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ScriptedProvider, Step, collect, text_response, tool_response,
    };
    use loopwire_core::message::Role;
    use loopwire_core::provider::{BlockDelta, BlockStart, StopReason};
    use serde_json::json;

    fn request(message: &str) -> LoopRequest {
        LoopRequest {
            conversation_id: ConversationId::from("conv-test"),
            history: vec![],
            message: message.into(),
        }
    }

    fn agent(provider: Arc<ScriptedProvider>) -> AgentLoop {
        let tools = Arc::new(crate::test_helpers::registry());
        AgentLoop::new(provider, "test-model", tools)
            .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100)))
    }

    #[test]
    fn warning_lists_each_failure() {
        let warning = failure_warning(&[
            ToolFailure {
                tool_name: "search".into(),
                error: "timeout".into(),
            },
            ToolFailure {
                tool_name: "scrape".into(),
                error: "404".into(),
            },
        ])
        .unwrap();
        assert!(warning.contains("- search: timeout\n"));
        assert!(warning.contains("- scrape: 404\n"));
        assert!(failure_warning(&[]).is_none());
    }

    #[tokio::test]
    async fn text_only_answer_completes_in_one_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(text_response(
            &["Hello", ", world"],
        ))]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("hi"), &tx).await;
        drop(tx);
        let events = collect(rx).await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.assistant_text, "Hello, world");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(provider.calls(), 1);
        assert_eq!(outcome.turns.len(), 2);
        assert_eq!(outcome.turns[1].role, Role::Assistant);
        assert!(matches!(events.last(), Some(DownstreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn tool_results_are_echoed_upstream() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Respond(tool_response(&[("toolu_1", "echo", r#"{"a":1}"#)])),
            Step::Respond(text_response(&["done"])),
        ]));
        let (tx, _rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("go"), &tx).await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.iterations, 2);

        let second = provider.request(1).unwrap();
        assert_eq!(second.turns.len(), 3);
        assert_eq!(second.turns[2].role, Role::Tool);
        match &second.turns[2].content[0] {
            ContentBlock::ToolResult {
                tool_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_id, "toolu_1");
                assert_eq!(serde_json::from_str::<serde_json::Value>(content).unwrap(), json!({"a": 1}));
                assert!(!is_error);
            }
            other => panic!("Expected tool result, got {other:?}"),
        }
        assert_eq!(second.tools.len(), 2);
    }

    #[tokio::test]
    async fn malformed_input_defaults_to_empty_object() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Respond(tool_response(&[("toolu_1", "echo", r#"{"a": tru"#)])),
            Step::Respond(text_response(&["ok"])),
        ]));
        let (tx, _rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("go"), &tx).await;

        assert!(outcome.is_completed());
        assert!(outcome.failures.is_empty());
        let (_, _, input) = outcome.turns[1].tool_invocations().next().unwrap();
        assert_eq!(input, &json!({}));
        match &provider.request(1).unwrap().turns[2].content[0] {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "{}"),
            other => panic!("Expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_input_reported_to_model_under_strict_policy() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Respond(tool_response(&[("toolu_1", "echo", "{oops")])),
            Step::Respond(text_response(&["retrying"])),
        ]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider.clone())
            .with_malformed_input(MalformedInputPolicy::ReportToModel)
            .run(request("go"), &tx)
            .await;
        drop(tx);
        let events = collect(rx).await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.failures.len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, DownstreamEvent::ToolError { tool_id, .. } if tool_id == "toolu_1")));
        match &provider.request(1).unwrap().turns[2].content[0] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("Expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_use_without_blocks_is_terminal() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(vec![
            UpstreamEvent::MessageStart { usage: None },
            UpstreamEvent::BlockStart {
                index: 0,
                block: BlockStart::Text,
            },
            UpstreamEvent::BlockDelta {
                index: 0,
                delta: BlockDelta::Text("thinking out loud".into()),
            },
            UpstreamEvent::BlockStop { index: 0 },
            UpstreamEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                usage: None,
            },
            UpstreamEvent::MessageStop,
        ])]));
        let (tx, _rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("go"), &tx).await;

        assert!(outcome.is_completed());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn tool_block_cut_off_by_max_tokens_is_closed() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(vec![
            UpstreamEvent::MessageStart { usage: None },
            UpstreamEvent::BlockStart {
                index: 0,
                block: BlockStart::Text,
            },
            UpstreamEvent::BlockDelta {
                index: 0,
                delta: BlockDelta::Text("Looking it up.".into()),
            },
            UpstreamEvent::BlockStop { index: 0 },
            UpstreamEvent::BlockStart {
                index: 1,
                block: BlockStart::ToolInvocation {
                    id: "toolu_1".into(),
                    name: "echo".into(),
                },
            },
            UpstreamEvent::BlockDelta {
                index: 1,
                delta: BlockDelta::PartialJson(r#"{"a":"#.into()),
            },
            UpstreamEvent::MessageDelta {
                stop_reason: Some(StopReason::MaxTokens),
                usage: None,
            },
            UpstreamEvent::MessageStop,
        ])]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("go"), &tx).await;
        drop(tx);
        let events = collect(rx).await;

        assert!(outcome.is_completed());
        assert_eq!(provider.calls(), 1);
        assert_eq!(outcome.tool_calls, 0);
        let kinds: Vec<_> = events.iter().map(DownstreamEvent::event_type).collect();
        assert_eq!(kinds, vec!["text", "tool_start", "tool_error", "text", "done"]);
        match &events[2] {
            DownstreamEvent::ToolError { tool_id, error, .. } => {
                assert_eq!(tool_id, "toolu_1");
                assert!(error.contains("max_tokens"));
            }
            other => panic!("Expected tool error, got {other:?}"),
        }

        let last = outcome.turns.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, vec![ContentBlock::text("Looking it up.")]);
        assert_eq!(last.tool_invocations().count(), 0);
        assert_eq!(outcome.failures.len(), 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_verbatim_and_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Fail(
            ProviderError::AuthenticationFailed("invalid x-api-key".into()),
        )]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("hi"), &tx).await;
        drop(tx);
        let events = collect(rx).await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DownstreamEvent::Error { message } => {
                assert_eq!(message, "Authentication failed: invalid x-api-key");
            }
            other => panic!("Expected error, got {other:?}"),
        }
        assert!(matches!(outcome.status, LoopStatus::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_overload_gets_friendly_message() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Fail(ProviderError::Overloaded("Overloaded".into())),
            Step::Fail(ProviderError::Overloaded("Overloaded".into())),
            Step::Fail(ProviderError::Overloaded("Overloaded".into())),
        ]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("hi"), &tx).await;
        drop(tx);
        let events = collect(rx).await;

        assert_eq!(provider.calls(), 3);
        assert_eq!(
            events,
            vec![DownstreamEvent::Error {
                message: OVERLOADED_MESSAGE.into()
            }]
        );
        assert_eq!(outcome.status, LoopStatus::Failed(OVERLOADED_MESSAGE.into()));
    }

    #[tokio::test(start_paused = true)]
    async fn overload_error_event_before_content_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::StreamError(ProviderError::StreamError {
                error_type: "overloaded_error".into(),
                message: "Overloaded".into(),
            }),
            Step::Respond(text_response(&["recovered"])),
        ]));
        let (tx, _rx) = mpsc::channel(64);
        let outcome = agent(provider.clone()).run(request("hi"), &tx).await;

        assert!(outcome.is_completed());
        assert_eq!(provider.calls(), 2);
        assert_eq!(outcome.assistant_text, "recovered");
    }

    #[tokio::test]
    async fn interrupted_stream_aborts_with_error() {
        let mut events = text_response(&["partial"]);
        events.truncate(3);
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(events)]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider).run(request("hi"), &tx).await;
        drop(tx);
        let events = collect(rx).await;

        assert!(matches!(outcome.status, LoopStatus::Failed(_)));
        assert!(matches!(
            events.as_slice(),
            [DownstreamEvent::TextDelta { .. }, DownstreamEvent::Error { .. }]
        ));
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_loop() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(text_response(&[
            "a", "b",
        ]))]));
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let outcome = agent(provider).run(request("hi"), &tx).await;
        assert_eq!(outcome.status, LoopStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_in_flight_work() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Hang]));
        let (tx, rx) = mpsc::channel(64);
        let outcome = agent(provider)
            .run_with_deadline(request("hi"), &tx, Duration::from_secs(300))
            .await;
        drop(tx);
        let events = collect(rx).await;

        assert_eq!(outcome.status, LoopStatus::TimedOut);
        assert_eq!(
            events,
            vec![DownstreamEvent::Error {
                message: "Request timed out after 300s".into()
            }]
        );
        assert_eq!(outcome.turns.len(), 1);
    }

    #[tokio::test]
    async fn history_is_sent_before_new_message() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Respond(text_response(&[
            "again",
        ]))]));
        let (tx, _rx) = mpsc::channel(64);
        let mut req = request("second question");
        req.history = vec![
            ConversationTurn::user("first question"),
            ConversationTurn::assistant(vec![ContentBlock::text("first answer")]),
        ];
        let outcome = agent(provider.clone())
            .with_system_prompt("Be brief.")
            .run(req, &tx)
            .await;

        let sent = provider.request(0).unwrap();
        assert_eq!(sent.system.as_deref(), Some("Be brief."));
        assert_eq!(sent.turns.len(), 3);
        assert_eq!(sent.turns[2].text(), "second question");
        assert_eq!(outcome.turns.len(), 4);
    }
}
