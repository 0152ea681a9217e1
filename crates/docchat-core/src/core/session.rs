//! Chat session: drives one streamed request (plus function-call rounds)
//! through the reconciler and reports progress as [`TurnEvent`]s.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::events::{ErrorKind, EventSender, TurnEvent};
use super::interrupt::{self, InterruptedError};
use crate::config::Config;
use crate::intent::detect_intent;
use crate::models;
use crate::prompts::SYSTEM_PROMPT;
use crate::providers::{
    ChatMessage, FunctionDefinition, OllamaClient, OllamaConfig, ProviderError, functions,
};
use crate::reconciler::turn::{FunctionResult, ReconcileError};
use crate::reconciler::{BlockList, BlockUpdate, OutcomeRx, Reconciler, TurnId};
use crate::render;

/// What a finished turn produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnSummary {
    pub turn: TurnId,
    pub blocks: BlockList,
    pub transcript: String,
    /// Function-call rounds that ran after the first request.
    pub rounds: u32,
    pub malformed_lines: usize,
}

/// A conversation with one model server.
#[derive(Debug)]
pub struct ChatSession {
    client: OllamaClient,
    reconciler: Reconciler,
    outcomes: OutcomeRx,
    history: Vec<ChatMessage>,
    functions: Vec<FunctionDefinition>,
    max_function_rounds: u32,
}

impl ChatSession {
    /// Creates a session using `client` for transport.
    ///
    /// # Errors
    /// Returns an error if the configured system prompt file cannot be read.
    pub fn new(config: &Config, client: OllamaClient) -> Result<Self> {
        let registry = render::registry(&config.render);
        let (reconciler, outcomes) = Reconciler::new(registry, config.render.timeout());
        let system_prompt = config
            .effective_system_prompt()?
            .unwrap_or_else(|| SYSTEM_PROMPT.to_string());

        Ok(Self {
            client,
            reconciler,
            outcomes,
            history: vec![ChatMessage::system(system_prompt)],
            functions: functions::definitions(),
            max_function_rounds: config.max_function_rounds,
        })
    }

    /// Creates a session talking to the configured Ollama server.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built.
    pub fn from_config(config: &Config, model: Option<&str>) -> Result<Self> {
        let model = models::api_identifier(model.unwrap_or(&config.model));
        let ollama = OllamaConfig::new(model, config.ollama.effective_base_url())
            .context("Failed to resolve Ollama settings")?;
        let client = OllamaClient::new(ollama)?;
        Self::new(config, client)
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Conversation so far, system prompt first.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Drops everything but the system prompt.
    pub fn reset(&mut self) {
        self.history.truncate(1);
    }

    /// Sends `prompt` and reconciles the streamed answer.
    ///
    /// On success the prompt, any function-call exchanges, and the assistant
    /// transcript join the history.
    /// On failure the history is unchanged and a `TurnFailed` (or
    /// `Interrupted`) event carries the blocks received so far.
    ///
    /// # Errors
    /// Returns the transport, in-band, or interrupt error that ended the turn.
    pub async fn run_turn(&mut self, prompt: &str, sender: &EventSender) -> Result<TurnSummary> {
        let intent = detect_intent(prompt);
        let turn = self.reconciler.begin_turn();
        info!(%turn, ?intent, model = %self.client.model(), "Starting turn");
        sender
            .send_important(TurnEvent::TurnStarted { turn, intent })
            .await;

        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(intent.decorate(prompt)));

        let rounds = match self.drive(&mut messages, sender).await {
            Ok(rounds) => rounds,
            Err(err) => return Err(self.fail_turn(err, sender).await),
        };

        let transcript = self.reconciler.transcript().to_string();
        let blocks = self.reconciler.blocks().clone();
        let exchanges = messages.split_off(self.history.len() + 1);
        self.history.push(ChatMessage::user(prompt));
        self.history.extend(exchanges);
        if !transcript.is_empty() {
            self.history.push(ChatMessage::assistant(transcript.clone()));
        }

        info!(%turn, blocks = blocks.len(), rounds, "Turn completed");
        sender
            .send_important(TurnEvent::TurnCompleted {
                turn,
                blocks: blocks.clone(),
                transcript: transcript.clone(),
            })
            .await;

        Ok(TurnSummary {
            turn,
            blocks,
            transcript,
            rounds,
            malformed_lines: self.reconciler.malformed_lines(),
        })
    }

    /// Runs the first request and any function-call rounds. Returns the
    /// number of follow-up rounds.
    async fn drive(&mut self, messages: &mut Vec<ChatMessage>, sender: &EventSender) -> Result<u32> {
        let mut rounds = 0;
        loop {
            self.stream_round(messages, sender).await?;
            self.settle_renders(sender).await?;

            let results = self.reconciler.take_function_results();
            if results.is_empty() {
                return Ok(rounds);
            }
            if rounds >= self.max_function_rounds {
                warn!(
                    max = self.max_function_rounds,
                    dropped = results.len(),
                    "Function round limit reached"
                );
                return Ok(rounds);
            }

            rounds += 1;
            let calls = results.iter().map(|r| r.call.clone()).collect();
            append_function_results(messages, results);
            debug!(round = rounds, "Sending function results");
            sender
                .send_important(TurnEvent::FunctionRound {
                    round: rounds,
                    calls,
                })
                .await;
            self.reconciler.begin_round()?;
        }
    }

    /// Streams one request until the transport ends.
    async fn stream_round(&mut self, messages: &[ChatMessage], sender: &EventSender) -> Result<()> {
        let request = self.client.send_chat_stream(messages, &self.functions);
        let mut stream = tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => return Err(InterruptedError.into()),
            result = request => result?,
        };

        loop {
            tokio::select! {
                biased;
                () = interrupt::wait_for_interrupt() => return Err(InterruptedError.into()),
                Some(outcome) = self.outcomes.recv() => {
                    if let Some(update) = self.reconciler.apply(outcome) {
                        self.emit(&[update], sender).await;
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let updates = self.reconciler.ingest(&bytes).map_err(stream_error)?;
                        self.emit(&updates, sender).await;
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        let updates = self.reconciler.finish().map_err(stream_error)?;
                        self.emit(&updates, sender).await;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Waits for every pending render of the current turn.
    async fn settle_renders(&mut self, sender: &EventSender) -> Result<()> {
        while self.reconciler.has_pending() {
            tokio::select! {
                biased;
                () = interrupt::wait_for_interrupt() => return Err(InterruptedError.into()),
                outcome = self.outcomes.recv() => {
                    let Some(outcome) = outcome else {
                        anyhow::bail!("Render channel closed with renders pending");
                    };
                    if let Some(update) = self.reconciler.apply(outcome) {
                        self.emit(&[update], sender).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, updates: &[BlockUpdate], sender: &EventSender) {
        let blocks = self.reconciler.blocks();
        for update in updates {
            match update {
                BlockUpdate::Appended { index } => {
                    if let Some(block) = blocks.get(*index) {
                        sender
                            .send_important(TurnEvent::BlockAppended {
                                index: *index,
                                block: block.clone(),
                            })
                            .await;
                    }
                }
                BlockUpdate::Extended { index, text } => {
                    sender.send_delta(TurnEvent::TextExtended {
                        index: *index,
                        text: text.clone(),
                    });
                }
                BlockUpdate::Resolved { index } => {
                    if let Some(block) = blocks.get(*index) {
                        sender
                            .send_important(TurnEvent::BlockResolved {
                                index: *index,
                                block: block.clone(),
                            })
                            .await;
                    }
                }
            }
        }
    }

    /// Fails the turn, reports it, and hands the error back.
    async fn fail_turn(&mut self, err: anyhow::Error, sender: &EventSender) -> anyhow::Error {
        self.reconciler.fail();
        let blocks = self.reconciler.blocks().clone();

        let event = if err.is::<InterruptedError>() {
            info!(turn = %self.reconciler.turn(), "Turn interrupted");
            TurnEvent::Interrupted { blocks }
        } else if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
            warn!(turn = %self.reconciler.turn(), error = %provider_err, "Turn failed");
            TurnEvent::TurnFailed {
                kind: provider_err.kind.into(),
                message: provider_err.message.clone(),
                details: provider_err.details.clone(),
                blocks,
            }
        } else {
            warn!(turn = %self.reconciler.turn(), error = %err, "Turn failed");
            TurnEvent::TurnFailed {
                kind: ErrorKind::Internal,
                message: err.to_string(),
                details: None,
                blocks,
            }
        };
        sender.send_important(event).await;
        err
    }
}

fn stream_error(err: ReconcileError) -> anyhow::Error {
    match err {
        ReconcileError::Stream(message) => ProviderError::api_error(message).into(),
        other => other.into(),
    }
}

fn append_function_results(messages: &mut Vec<ChatMessage>, results: Vec<FunctionResult>) {
    for result in results {
        let name = result.call.name.clone();
        let content = match result.output {
            Ok(output) => output,
            Err(error) => format!("Error: {error}"),
        };
        messages.push(ChatMessage::assistant_call(result.call));
        messages.push(ChatMessage::function_result(name, content));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::core::events::create_event_channel;
    use crate::providers::Role;
    use crate::reconciler::{BlockKind, BlockStatus};

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines.iter().map(|l| format!("{l}\n")).collect()
    }

    fn content(text: &str) -> serde_json::Value {
        json!({"message": {"role": "assistant", "content": text}, "done": false})
    }

    fn done() -> serde_json::Value {
        json!({"message": {"role": "assistant", "content": ""}, "done": true})
    }

    fn session(server: &MockServer, config: &Config) -> ChatSession {
        let client = OllamaClient::new(OllamaConfig {
            base_url: server.uri(),
            model: "llama2".to_string(),
        })
        .unwrap();
        ChatSession::new(config, client).unwrap()
    }

    fn drain(rx: &mut crate::core::events::TurnEventRx) -> Vec<Arc<TurnEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_run_turn_reconciles_text_and_directive() {
        let server = MockServer::start().await;
        let body = ndjson(&[
            content("Here is a table:\n§§mark"),
            content("down§§| a | b |\n|---|---|\n| 1 | 2 |§§/markdown§§"),
            content("\nDone."),
            done(),
        ]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let mut session = session(&server, &Config::default());
        let (tx, mut rx) = create_event_channel();
        let summary = session
            .run_turn("What is this?", &EventSender::new(tx))
            .await
            .unwrap();

        let kinds: Vec<_> = summary.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BlockKind::Text, BlockKind::Markdown, BlockKind::Text]);
        assert_eq!(summary.blocks.get(0).unwrap().source, "Here is a table:\n");
        let table = summary.blocks.get(1).unwrap();
        assert_eq!(table.status, BlockStatus::Complete);
        assert!(table.output.as_deref().unwrap().contains("<table>"));
        assert_eq!(summary.rounds, 0);

        let history = session.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "What is this?");
        assert_eq!(history[2].content, summary.transcript);

        let events = drain(&mut rx);
        assert!(matches!(*events[0], TurnEvent::TurnStarted { .. }));
        assert!(matches!(
            events.last().map(|e| &**e),
            Some(TurnEvent::TurnCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_function_call_round() {
        let server = MockServer::start().await;
        let follow_up = ndjson(&[content("That was the graph."), done()]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains(r#""role":"function""#))
            .respond_with(ResponseTemplate::new(200).set_body_string(follow_up))
            .with_priority(1)
            .mount(&server)
            .await;

        let first = ndjson(&[json!({
            "message": {
                "role": "assistant",
                "content": "",
                "function_call": {
                    "name": "generateGraph",
                    "arguments": {"code": "graph TD\n  A-->B", "type": "mermaid"}
                }
            },
            "done": true
        })]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first))
            .mount(&server)
            .await;

        let mut session = session(&server, &Config::default());
        let (tx, mut rx) = create_event_channel();
        let summary = session
            .run_turn("Draw a flowchart", &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(summary.rounds, 1);
        let kinds: Vec<_> = summary.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BlockKind::Mermaid, BlockKind::Text]);
        let graph = summary.blocks.get(0).unwrap();
        assert_eq!(graph.status, BlockStatus::Complete);
        assert_eq!(graph.function.as_deref(), Some("generateGraph"));
        assert_eq!(summary.transcript, "That was the graph.");

        let history = session.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[1].content, "Draw a flowchart");
        let call = history[2].function_call.as_ref().unwrap();
        assert_eq!(call.name, "generateGraph");
        assert_eq!(history[3].role, Role::Function);
        assert_eq!(history[3].name.as_deref(), Some("generateGraph"));
        assert!(history[3].content.contains("graph TD"));
        assert_eq!(history[4].content, "That was the graph.");

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(**e, TurnEvent::FunctionRound { round: 1, .. }))
        );
    }

    #[tokio::test]
    async fn test_function_rounds_are_bounded() {
        let server = MockServer::start().await;
        let call = ndjson(&[json!({
            "message": {
                "content": "",
                "function_call": {"name": "generateMarkdown", "arguments": {"content": "*x*"}}
            }
        })]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(call))
            .expect(3)
            .mount(&server)
            .await;

        let config = Config {
            max_function_rounds: 2,
            ..Config::default()
        };
        let mut session = session(&server, &config);
        let (tx, _rx) = create_event_channel();
        let summary = session
            .run_turn("again and again", &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.blocks.len(), 3);
        // Two answered calls; the third round's call was never sent back.
        // Empty transcript adds no assistant text message.
        let roles: Vec<_> = session.history().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Function,
                Role::Assistant,
                Role::Function,
            ]
        );
    }

    #[tokio::test]
    async fn test_http_error_fails_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"error": "model crashed"})),
            )
            .mount(&server)
            .await;

        let mut session = session(&server, &Config::default());
        let (tx, mut rx) = create_event_channel();
        let err = session
            .run_turn("hi", &EventSender::new(tx))
            .await
            .unwrap_err();

        let provider_err = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(provider_err.kind, crate::providers::ProviderErrorKind::HttpStatus);
        assert_eq!(session.history().len(), 1);

        let events = drain(&mut rx);
        assert!(matches!(
            events.last().map(|e| &**e),
            Some(TurnEvent::TurnFailed {
                kind: ErrorKind::HttpStatus,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_in_band_error_keeps_blocks() {
        let server = MockServer::start().await;
        let body = ndjson(&[content("Partial answer"), json!({"error": "out of memory"})]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let mut session = session(&server, &Config::default());
        let (tx, mut rx) = create_event_channel();
        let err = session
            .run_turn("hi", &EventSender::new(tx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("out of memory"));

        let events = drain(&mut rx);
        match events.last().map(|e| &**e) {
            Some(TurnEvent::TurnFailed { kind, blocks, .. }) => {
                assert_eq!(*kind, ErrorKind::ApiError);
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks.get(0).unwrap().source, "Partial answer");
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_feeds_next_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("first question"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson(&[content("ok")])))
            .mount(&server)
            .await;

        let mut session = session(&server, &Config::default());
        let (tx, _rx) = create_event_channel();
        let sender = EventSender::new(tx);
        session.run_turn("first question", &sender).await.unwrap();
        let second = session.run_turn("second question", &sender).await.unwrap();
        assert!(second.turn > TurnId::new(1));
        assert_eq!(session.history().len(), 5);

        session.reset();
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].role, Role::System);
    }
}
