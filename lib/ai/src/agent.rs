//! The chat agent: drives one inbound message through generation, tool
//! calls and continuation.
//!
//! Each inbound message runs on its own task. The caller gets the receiving
//! half of an unbounded channel that carries `AgentUpdate`s in order and is
//! closed exactly once, when the task ends for any reason.
//!
//! Per model turn the loop:
//!
//! 1. checks for cancellation and loads the session history
//! 2. calls the provider, forwarding streamed text through the emitter
//! 3. persists the model turn
//! 4. if tools were requested, verifies every name, runs the tools in order
//!    and persists their responses as one `tool` turn linked to the model
//!    turn, then goes back to step 1
//!
//! Running out of turns ends the run with `AgentError::TurnLimitExceeded`.
//! Everything persisted up to that point stays persisted.

use crate::error::AgentError;
use crate::prompt::system_prompt;
use crate::provider::{GenerationChunk, GenerationProvider, GenerationRequest, GenerationResponse};
use crate::usage::UsageCounters;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tally_conversation::{
    NewMessage, Part, SessionStore, SessionStoreError, ToolError, ToolRegistry, ToolRequest,
    ToolResponse,
};
use tally_core::{ChannelId, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

fn default_max_turns() -> u32 {
    8
}

/// Agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of provider calls for one inbound message.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

/// How text reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Text is collected and delivered at tool-call boundaries and once at
    /// the end.
    #[default]
    Messages,
    /// Every text increment is forwarded as soon as it arrives.
    Chunks,
}

/// An attachment on an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub content_type: String,
}

/// A message received from a chat channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: ChannelId,
    pub author_id: UserId,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    /// Checks that the message carries text or at least one attachment.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Validation` for an empty message.
    pub fn validate(&self) -> Result<(), AgentError> {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        if !has_text && self.attachments.is_empty() {
            return Err(AgentError::Validation {
                reason: "message has neither text nor attachments".to_string(),
            });
        }
        Ok(())
    }

    fn into_parts(self) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.attachments.len() + 1);
        if let Some(text) = self.text.filter(|t| !t.trim().is_empty()) {
            parts.push(Part::text(text));
        }
        parts.extend(
            self.attachments
                .into_iter()
                .map(|a| Part::media(a.content_type, a.url)),
        );
        parts
    }
}

/// An event on the agent's output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentUpdate {
    /// Model text.
    Text(String),
    /// The model asked for a tool. `text` holds the model text streamed
    /// before the request that had not been delivered as a unit yet. Text
    /// streamed after the request follows as its own `Text` update.
    ToolCall {
        name: String,
        input: JsonValue,
        text: Option<String>,
    },
    /// A tool finished.
    ToolResponse { name: String, output: JsonValue },
    /// The run ended with an error. Always the last event.
    Error(AgentError),
}

/// States of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    AwaitingGeneration,
    StreamingText,
    ToolRequested,
    ToolExecuting,
    AwaitingContinuation,
    Done,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingGeneration => "awaiting_generation",
            Self::StreamingText => "streaming_text",
            Self::ToolRequested => "tool_requested",
            Self::ToolExecuting => "tool_executing",
            Self::AwaitingContinuation => "awaiting_continuation",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Writes updates to the output channel according to the delivery mode.
struct Emitter {
    tx: mpsc::UnboundedSender<AgentUpdate>,
    mode: DeliveryMode,
    state: AgentState,
    /// Text not yet delivered as a unit.
    pending: String,
    /// Pending text captured when the first tool request of a provider call
    /// arrived.
    request_text: Option<String>,
    /// All text seen during the current provider call.
    turn_text: String,
}

impl Emitter {
    fn new(tx: mpsc::UnboundedSender<AgentUpdate>, mode: DeliveryMode) -> Self {
        Self {
            tx,
            mode,
            state: AgentState::Idle,
            pending: String::new(),
            request_text: None,
            turn_text: String::new(),
        }
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "agent state");
            self.state = next;
        }
    }

    fn send(&self, update: AgentUpdate) {
        if self.tx.send(update).is_err() {
            debug!("output receiver dropped");
        }
    }

    fn on_chunk(&mut self, chunk: GenerationChunk) {
        if chunk.is_empty() {
            debug!("skipping empty chunk");
            return;
        }
        if let Some(text) = chunk.text {
            self.push_text(text);
        }
        if !chunk.tool_requests.is_empty() {
            if self.request_text.is_none() {
                self.request_text = Some(std::mem::take(&mut self.pending));
            }
            self.transition(AgentState::ToolRequested);
        }
    }

    fn push_text(&mut self, text: String) {
        if text.trim().is_empty() {
            debug!("skipping blank text chunk");
            return;
        }
        self.transition(AgentState::StreamingText);
        self.turn_text.push_str(&text);
        self.pending.push_str(&text);
        if self.mode == DeliveryMode::Chunks {
            self.send(AgentUpdate::Text(text));
        }
    }

    /// Closes out a provider call and returns the text it produced. Text
    /// the provider returned without streaming is pushed through as one
    /// increment.
    fn finish_generation(&mut self, response: &GenerationResponse) -> String {
        if self.turn_text.is_empty() {
            let text = response.text();
            if !text.is_empty() {
                self.push_text(text);
            }
        }
        std::mem::take(&mut self.turn_text)
    }

    fn tool_call(&mut self, request: &ToolRequest) {
        let text = self
            .request_text
            .take()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| std::mem::take(&mut self.pending));
        self.send(AgentUpdate::ToolCall {
            name: request.name.clone(),
            input: request.input.clone(),
            text: (!text.is_empty()).then_some(text),
        });
        self.flush();
    }

    fn tool_response(&self, name: &str, output: &JsonValue) {
        self.send(AgentUpdate::ToolResponse {
            name: name.to_string(),
            output: output.clone(),
        });
    }

    /// Delivers whatever text is still pending.
    fn flush(&mut self) {
        let mut text = self.request_text.take().unwrap_or_default();
        text.push_str(&std::mem::take(&mut self.pending));
        if self.mode == DeliveryMode::Messages && !text.is_empty() {
            self.send(AgentUpdate::Text(text));
        }
    }

    fn done(&mut self) {
        self.flush();
        self.transition(AgentState::Done);
    }

    fn fail(&mut self, error: AgentError) {
        self.flush();
        self.transition(AgentState::Error);
        self.send(AgentUpdate::Error(error));
    }
}

fn session_error(e: rootcause::Report<SessionStoreError>) -> AgentError {
    AgentError::Session {
        details: e.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The conversational finance agent.
#[derive(Clone)]
pub struct ChatAgent {
    provider: Arc<dyn GenerationProvider>,
    sessions: Arc<SessionStore>,
    tools: Arc<ToolRegistry>,
    usage: Arc<UsageCounters>,
    config: AgentConfig,
}

impl ChatAgent {
    /// Creates an agent with default settings and fresh usage counters.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        sessions: Arc<SessionStore>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            provider,
            sessions,
            tools: Arc::new(tools),
            usage: Arc::new(UsageCounters::new()),
            config: AgentConfig::default(),
        }
    }

    /// Sets the agent configuration.
    #[must_use]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the usage counters.
    #[must_use]
    pub fn usage(&self) -> &Arc<UsageCounters> {
        &self.usage
    }

    /// Returns the session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Starts handling an inbound message.
    ///
    /// Validation happens before anything is spawned. The returned receiver
    /// yields updates until the run finishes; errors after validation arrive
    /// as a final `AgentUpdate::Error`. `cancel` is checked before every
    /// provider call and every tool execution.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Validation` if the message has neither text nor
    /// attachments.
    pub fn run(
        &self,
        inbound: InboundMessage,
        mode: DeliveryMode,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<AgentUpdate>, AgentError> {
        inbound.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let agent = self.clone();
        let span = info_span!(
            "chat",
            channel_id = %inbound.channel_id,
            author_id = %inbound.author_id
        );

        tokio::spawn(
            async move {
                let mut emitter = Emitter::new(tx, mode);
                let outcome = AssertUnwindSafe(agent.chat(inbound, &mut emitter, &cancel))
                    .catch_unwind()
                    .await;

                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(payload) => Some(AgentError::Panicked {
                        message: panic_message(payload.as_ref()),
                    }),
                };

                match failure {
                    None => info!("chat finished"),
                    Some(e) => {
                        match &e {
                            AgentError::Cancelled => info!("chat cancelled"),
                            AgentError::TurnLimitExceeded { .. } => warn!(error = %e, "chat stopped"),
                            _ => error!(error = %e, "chat failed"),
                        }
                        emitter.fail(e);
                    }
                }
            }
            .instrument(span),
        );

        Ok(rx)
    }

    async fn chat(
        &self,
        inbound: InboundMessage,
        emitter: &mut Emitter,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let author_id = inbound.author_id;
        let session = self
            .sessions
            .get_or_create_active_session(&inbound.channel_id, author_id)
            .await
            .map_err(session_error)?;
        self.sessions
            .store_message(&session, NewMessage::user(inbound.into_parts()), author_id, None)
            .await
            .map_err(session_error)?;

        let system = system_prompt(Utc::now());
        let definitions = self.tools.definitions();
        let max_turns = self.config.max_turns;

        for turn in 1..=max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            emitter.transition(AgentState::AwaitingGeneration);

            let history = self
                .sessions
                .get_message_history(&session)
                .await
                .map_err(session_error)?;
            let request = GenerationRequest::new(system.clone(), history)
                .with_tools(definitions.clone())
                .with_max_turns(max_turns);

            let response = {
                let mut on_chunk = |chunk: GenerationChunk| emitter.on_chunk(chunk);
                self.provider.generate(&request, &mut on_chunk).await?
            };
            self.usage.record(response.usage);
            debug!(
                turn,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                total_input_tokens = self.usage.snapshot().input_tokens,
                total_output_tokens = self.usage.snapshot().output_tokens,
                "provider turn finished"
            );

            let turn_text = emitter.finish_generation(&response);
            let requests: Vec<ToolRequest> = response.tool_requests().cloned().collect();
            let mut parts = response.parts;
            if !turn_text.is_empty() && !parts.iter().any(|p| p.as_text().is_some()) {
                parts.insert(0, Part::text(turn_text));
            }

            if requests.is_empty() {
                if parts.is_empty() {
                    warn!(turn, "provider returned an empty turn");
                } else {
                    self.sessions
                        .store_message(&session, NewMessage::model(parts), author_id, None)
                        .await
                        .map_err(session_error)?;
                }
                emitter.done();
                return Ok(());
            }

            let model_message_id = self
                .sessions
                .store_message(&session, NewMessage::model(parts), author_id, None)
                .await
                .map_err(session_error)?;
            emitter.transition(AgentState::ToolRequested);

            if let Some(unknown) = requests.iter().find(|r| !self.tools.contains(&r.name)) {
                error!(tool = %unknown.name, "model requested an unregistered tool");
                return Err(AgentError::ToolNotFound {
                    name: unknown.name.clone(),
                });
            }

            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
                emitter.tool_call(&request);
                emitter.transition(AgentState::ToolExecuting);

                let output = match self.tools.invoke(&request.name, request.input.clone()).await {
                    Ok(output) => output,
                    Err(ToolError::NotFound { name }) => {
                        error!(tool = %name, "tool disappeared from registry");
                        return Err(AgentError::ToolNotFound { name });
                    }
                    Err(e) => {
                        warn!(tool = %request.name, error = %e, "tool call failed");
                        json!({ "error": e.to_string() })
                    }
                };
                debug!(tool = %request.name, "tool call finished");
                emitter.tool_response(&request.name, &output);
                responses.push(ToolResponse {
                    name: request.name,
                    reference: request.reference,
                    output,
                });
            }

            self.sessions
                .store_message(
                    &session,
                    NewMessage::tool(responses),
                    author_id,
                    Some(model_message_id),
                )
                .await
                .map_err(session_error)?;
            emitter.transition(AgentState::AwaitingContinuation);
        }

        Err(AgentError::TurnLimitExceeded { limit: max_turns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::provider::TokenUsage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tally_conversation::{
        AuthorProfile, HouseholdProfile, Message, MessageRole, MemorySessionRepository, Tool,
        ToolDefinition,
    };
    use tally_core::HouseholdId;
    use tally_ledger::{Ledger, MemoryTransactionRepository};

    /// Replays scripted turns. The last script repeats once the queue runs
    /// dry.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<GenerationChunk>>>,
        last: Mutex<Vec<GenerationChunk>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<GenerationChunk>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                last: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
        ) -> Result<GenerationResponse, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = {
                let mut last = self.last.lock().unwrap();
                if let Some(next) = self.scripts.lock().unwrap().pop_front() {
                    *last = next;
                }
                last.clone()
            };

            let mut text = String::new();
            let mut parts = Vec::new();
            for chunk in script {
                if let Some(t) = &chunk.text {
                    text.push_str(t);
                }
                for request in &chunk.tool_requests {
                    parts.push(Part::ToolRequest(request.clone()));
                }
                on_chunk(chunk);
            }
            if !text.trim().is_empty() {
                parts.insert(0, Part::text(text));
            }

            Ok(GenerationResponse {
                parts,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 2,
                },
            })
        }
    }

    struct PanickingProvider;

    #[async_trait]
    impl GenerationProvider for PanickingProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            _on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
        ) -> Result<GenerationResponse, GenerationError> {
            panic!("provider blew up");
        }
    }

    struct LimitedProvider;

    #[async_trait]
    impl GenerationProvider for LimitedProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
        ) -> Result<GenerationResponse, GenerationError> {
            on_chunk(GenerationChunk::text("partial"));
            Err(GenerationError::TurnLimitReached { limit: 2 })
        }
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        type Input = JsonValue;
        type Output = JsonValue;

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("Echo", "Returns its input")
        }

        async fn call(&self, input: JsonValue) -> Result<JsonValue, ToolError> {
            Ok(json!({ "echo": input }))
        }
    }

    fn tool_chunk(name: &str, input: JsonValue) -> GenerationChunk {
        GenerationChunk::tool_request(ToolRequest {
            name: name.to_string(),
            reference: Some(format!("call_{name}")),
            input,
        })
    }

    struct Harness {
        agent: ChatAgent,
        store: Arc<SessionStore>,
        author: AuthorProfile,
        channel: ChannelId,
    }

    impl Harness {
        fn new(provider: Arc<dyn GenerationProvider>, tools: ToolRegistry, max_turns: u32) -> Self {
            let repository = Arc::new(MemorySessionRepository::new());
            let author = AuthorProfile {
                user_id: UserId::new(),
                name: "Ana".to_string(),
                household: Some(HouseholdProfile {
                    id: HouseholdId::new(),
                    name: "Home".to_string(),
                }),
            };
            repository.register_author(author.clone()).unwrap();
            let store = Arc::new(SessionStore::new(repository));
            let agent = ChatAgent::new(provider, Arc::clone(&store), tools)
                .with_config(AgentConfig { max_turns });
            Self {
                agent,
                store,
                author,
                channel: ChannelId::new("chan-1"),
            }
        }

        fn inbound(&self, text: &str) -> InboundMessage {
            InboundMessage {
                channel_id: self.channel.clone(),
                author_id: self.author.user_id,
                text: Some(text.to_string()),
                attachments: Vec::new(),
            }
        }

        async fn run(&self, text: &str, mode: DeliveryMode) -> Vec<AgentUpdate> {
            let rx = self
                .agent
                .run(self.inbound(text), mode, CancellationToken::new())
                .unwrap();
            collect(rx).await
        }

        async fn stored(&self) -> Vec<Message> {
            let session = self
                .store
                .get_or_create_active_session(&self.channel, self.author.user_id)
                .await
                .unwrap();
            self.store.messages(&session).await.unwrap()
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<AgentUpdate>) -> Vec<AgentUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    }

    fn errors(updates: &[AgentUpdate]) -> Vec<&AgentError> {
        updates
            .iter()
            .filter_map(|u| match u {
                AgentUpdate::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn echo_then_done() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(vec![
            vec![
                GenerationChunk::text("A"),
                GenerationChunk::text("B"),
                tool_chunk("Echo", json!({ "x": 1 })),
            ],
            vec![GenerationChunk::text("done")],
        ]))
    }

    #[tokio::test]
    async fn chunks_mode_keeps_text_ahead_of_tool_call() {
        let harness = Harness::new(echo_then_done(), ToolRegistry::new().with_tool(Echo), 4);

        let updates = harness.run("hello", DeliveryMode::Chunks).await;

        assert_eq!(updates[0], AgentUpdate::Text("A".to_string()));
        assert_eq!(updates[1], AgentUpdate::Text("B".to_string()));
        assert_eq!(
            updates[2],
            AgentUpdate::ToolCall {
                name: "Echo".to_string(),
                input: json!({ "x": 1 }),
                text: Some("AB".to_string()),
            }
        );
        assert_eq!(
            updates[3],
            AgentUpdate::ToolResponse {
                name: "Echo".to_string(),
                output: json!({ "echo": { "x": 1 } }),
            }
        );
        assert_eq!(updates[4], AgentUpdate::Text("done".to_string()));
        assert_eq!(updates.len(), 5);
    }

    #[tokio::test]
    async fn messages_mode_aggregates_text() {
        let harness = Harness::new(echo_then_done(), ToolRegistry::new().with_tool(Echo), 4);

        let updates = harness.run("hello", DeliveryMode::Messages).await;

        assert_eq!(updates.len(), 3);
        assert!(matches!(
            &updates[0],
            AgentUpdate::ToolCall { text: Some(text), .. } if text == "AB"
        ));
        assert!(matches!(&updates[1], AgentUpdate::ToolResponse { .. }));
        assert_eq!(updates[2], AgentUpdate::Text("done".to_string()));
    }

    #[tokio::test]
    async fn turns_are_persisted_in_order_with_parent_links() {
        let harness = Harness::new(echo_then_done(), ToolRegistry::new().with_tool(Echo), 4);

        harness.run("hello", DeliveryMode::Messages).await;

        let stored = harness.stored().await;
        let roles: Vec<MessageRole> = stored.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Model,
                MessageRole::Tool,
                MessageRole::Model
            ]
        );
        assert_eq!(stored[0].text(), "hello");
        assert_eq!(stored[1].text(), "AB");
        assert_eq!(stored[1].tool_requests().count(), 1);
        assert_eq!(stored[2].parent_id, Some(stored[1].id));
        assert_eq!(stored[3].text(), "done");
        assert_eq!(harness.agent.usage().calls(), 2);
        assert_eq!(harness.agent.usage().snapshot().total(), 24);
    }

    #[tokio::test]
    async fn turn_limit_stops_with_one_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![tool_chunk(
            "Echo",
            json!({}),
        )]]));
        let harness = Harness::new(provider.clone(), ToolRegistry::new().with_tool(Echo), 3);

        let updates = harness.run("loop forever", DeliveryMode::Messages).await;

        assert_eq!(
            errors(&updates),
            vec![&AgentError::TurnLimitExceeded { limit: 3 }]
        );
        assert!(matches!(updates.last(), Some(AgentUpdate::Error(_))));
        assert_eq!(provider.calls(), 3);

        let stored = harness.stored().await;
        assert_eq!(stored.len(), 7);
        let tool_turns = stored.iter().filter(|m| m.role == MessageRole::Tool).count();
        assert_eq!(tool_turns, 3);
    }

    #[tokio::test]
    async fn provider_turn_limit_maps_to_turn_limit_exceeded() {
        let harness = Harness::new(Arc::new(LimitedProvider), ToolRegistry::new(), 4);

        let updates = harness.run("hi", DeliveryMode::Messages).await;

        assert_eq!(updates[0], AgentUpdate::Text("partial".to_string()));
        assert_eq!(
            errors(&updates),
            vec![&AgentError::TurnLimitExceeded { limit: 2 }]
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![tool_chunk(
            "Nope",
            json!({}),
        )]]));
        let harness = Harness::new(provider.clone(), ToolRegistry::new().with_tool(Echo), 4);

        let updates = harness.run("hi", DeliveryMode::Chunks).await;

        assert_eq!(
            errors(&updates),
            vec![&AgentError::ToolNotFound {
                name: "Nope".to_string()
            }]
        );
        assert_eq!(provider.calls(), 1);
        let stored = harness.stored().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, MessageRole::Model);
    }

    #[tokio::test]
    async fn cancellation_stops_before_provider_call() {
        let provider = echo_then_done();
        let harness = Harness::new(provider.clone(), ToolRegistry::new().with_tool(Echo), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let rx = harness
            .agent
            .run(harness.inbound("hi"), DeliveryMode::Messages, cancel)
            .unwrap();
        let updates = collect(rx).await;

        assert_eq!(updates, vec![AgentUpdate::Error(AgentError::Cancelled)]);
        assert_eq!(provider.calls(), 0);
    }

    /// Cancels the token while generating and asks for a tool.
    struct CancellingProvider {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl GenerationProvider for CancellingProvider {
        async fn generate(
            &self,
            _request: &GenerationRequest,
            on_chunk: &mut (dyn FnMut(GenerationChunk) + Send),
        ) -> Result<GenerationResponse, GenerationError> {
            let request = ToolRequest {
                name: "Counted".to_string(),
                reference: Some("call_1".to_string()),
                input: json!({}),
            };
            on_chunk(GenerationChunk::tool_request(request.clone()));
            self.cancel.cancel();
            Ok(GenerationResponse {
                parts: vec![Part::ToolRequest(request)],
                usage: TokenUsage::default(),
            })
        }
    }

    struct Counted(Arc<AtomicU32>);

    #[async_trait]
    impl Tool for Counted {
        type Input = JsonValue;
        type Output = JsonValue;

        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("Counted", "Counts its calls")
        }

        async fn call(&self, _input: JsonValue) -> Result<JsonValue, ToolError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn cancellation_stops_before_tool_execution() {
        let cancel = CancellationToken::new();
        let tool_calls = Arc::new(AtomicU32::new(0));
        let harness = Harness::new(
            Arc::new(CancellingProvider {
                cancel: cancel.clone(),
            }),
            ToolRegistry::new().with_tool(Counted(Arc::clone(&tool_calls))),
            4,
        );

        let rx = harness
            .agent
            .run(harness.inbound("hi"), DeliveryMode::Messages, cancel)
            .unwrap();
        let updates = collect(rx).await;

        assert_eq!(updates.last(), Some(&AgentUpdate::Error(AgentError::Cancelled)));
        assert!(
            !updates
                .iter()
                .any(|u| matches!(u, AgentUpdate::ToolCall { .. }))
        );
        assert_eq!(tool_calls.load(Ordering::SeqCst), 0);

        let stored = harness.stored().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].role, MessageRole::Model);
        assert_eq!(stored[1].tool_requests().count(), 1);
    }

    #[tokio::test]
    async fn text_after_tool_request_is_not_attached_to_the_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                GenerationChunk::text("Saving "),
                tool_chunk("Echo", json!({ "x": 1 })),
                GenerationChunk::text("one moment"),
            ],
            vec![GenerationChunk::text("done")],
        ]));
        let harness = Harness::new(provider, ToolRegistry::new().with_tool(Echo), 4);

        let updates = harness.run("hello", DeliveryMode::Messages).await;

        assert_eq!(
            updates[0],
            AgentUpdate::ToolCall {
                name: "Echo".to_string(),
                input: json!({ "x": 1 }),
                text: Some("Saving ".to_string()),
            }
        );
        assert_eq!(updates[1], AgentUpdate::Text("one moment".to_string()));
        assert!(matches!(&updates[2], AgentUpdate::ToolResponse { .. }));
        assert_eq!(updates[3], AgentUpdate::Text("done".to_string()));
        assert_eq!(updates.len(), 4);
    }

    #[tokio::test]
    async fn panic_becomes_error_event() {
        let harness = Harness::new(Arc::new(PanickingProvider), ToolRegistry::new(), 4);

        let updates = harness.run("hi", DeliveryMode::Messages).await;

        assert_eq!(updates.len(), 1);
        assert!(matches!(
            &updates[0],
            AgentUpdate::Error(AgentError::Panicked { message }) if message.contains("blew up")
        ));
    }

    #[tokio::test]
    async fn blank_and_empty_chunks_are_skipped() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            GenerationChunk::default(),
            GenerationChunk::text("  "),
            GenerationChunk::text("Hi"),
            GenerationChunk::text(""),
            GenerationChunk::text(" there"),
        ]]));
        let harness = Harness::new(provider, ToolRegistry::new(), 4);

        let updates = harness.run("hello", DeliveryMode::Chunks).await;

        assert_eq!(
            updates,
            vec![
                AgentUpdate::Text("Hi".to_string()),
                AgentUpdate::Text(" there".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_message_fails_fast() {
        let harness = Harness::new(echo_then_done(), ToolRegistry::new(), 4);

        let result = harness
            .agent
            .run(harness.inbound("   "), DeliveryMode::Messages, CancellationToken::new());

        assert!(matches!(result, Err(AgentError::Validation { .. })));
        let session = harness
            .store
            .get_or_create_active_session(&harness.channel, harness.author.user_id)
            .await
            .unwrap();
        assert!(harness.store.messages(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attachment_only_message_is_accepted() {
        let harness = Harness::new(
            Arc::new(ScriptedProvider::new(vec![vec![GenerationChunk::text("Got it")]])),
            ToolRegistry::new(),
            4,
        );
        let mut inbound = harness.inbound("");
        inbound.text = None;
        inbound.attachments.push(Attachment {
            url: "https://cdn.example.com/receipt.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
        });

        let rx = harness
            .agent
            .run(inbound, DeliveryMode::Messages, CancellationToken::new())
            .unwrap();
        let updates = collect(rx).await;

        assert_eq!(updates, vec![AgentUpdate::Text("Got it".to_string())]);
        let stored = harness.stored().await;
        assert_eq!(stored[0].attachment_count(), 1);
    }

    #[tokio::test]
    async fn saves_transactions_through_the_finance_tools() {
        let ledger = Ledger::new(Arc::new(MemoryTransactionRepository::new()));
        let author_id = UserId::new();
        let input = json!({
            "transactions": [{
                "amount": 42.5,
                "author_id": author_id.to_string(),
                "transaction_date": "2025-09-27 10:00:00",
                "description": "Groceries"
            }]
        });
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![tool_chunk("SaveTransactions", input.clone())],
            vec![tool_chunk("SaveTransactions", input)],
            vec![GenerationChunk::text("Saved.")],
        ]));
        let harness = Harness::new(provider, tally_tools::finance_registry(ledger), 5);

        let updates = harness.run("spent 42.50 on groceries", DeliveryMode::Messages).await;

        let outputs: Vec<&JsonValue> = updates
            .iter()
            .filter_map(|u| match u {
                AgentUpdate::ToolResponse { output, .. } => Some(output),
                _ => None,
            })
            .collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0]["succeeded"].as_array().unwrap().len(), 1);
        assert_eq!(outputs[1]["failed"][0]["kind"], "duplicate");
        assert_eq!(
            outputs[1]["failed"][0]["existing_id"],
            outputs[0]["succeeded"][0]["id"]
        );
        assert_eq!(updates.last(), Some(&AgentUpdate::Text("Saved.".to_string())));
    }

    #[tokio::test]
    async fn tool_input_errors_are_returned_to_the_model() {
        let ledger = Ledger::new(Arc::new(MemoryTransactionRepository::new()));
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![tool_chunk("GetTransactions", json!({ "ids": "not a list" }))],
            vec![GenerationChunk::text("Sorry.")],
        ]));
        let harness = Harness::new(provider, tally_tools::finance_registry(ledger), 4);

        let updates = harness.run("show me", DeliveryMode::Messages).await;

        assert!(errors(&updates).is_empty());
        assert!(matches!(
            &updates[1],
            AgentUpdate::ToolResponse { output, .. } if output.get("error").is_some()
        ));
    }
}
