//! Turn state machine: owns one turn's transcript, carry-over, and blocks.
//!
//! ```text
//! Idle ──begin_turn──▶ Streaming ──finish──▶ Finalizing ──(no pending renders)──▶ Idle
//!                         │  ▲                    │
//!                         │  └────begin_round─────┘
//!                         └──fail / in-band error──▶ Idle
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::blocks::{BlockList, TextPush};
use super::directive::{Directive, FunctionCall};
use super::dispatch::{Dispatch, Dispatcher, RenderOutcome, RendererRegistry};
use super::extract::{DirectiveExtractor, Segment};
use super::ingest::{Delta, LineIngestor};

/// Receiving end for render outcomes. Kept apart from the [`Reconciler`] so a
/// caller can `select!` on it while still mutating the reconciler.
pub type OutcomeRx = mpsc::UnboundedReceiver<RenderOutcome>;

/// Monotonic turn identifier used to drop stale render results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TurnId(u64);

impl TurnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Streaming,
    Finalizing,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Idle => write!(f, "idle"),
            TurnState::Streaming => write!(f, "streaming"),
            TurnState::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Change to the block list, for incremental re-rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockUpdate {
    /// A new block was appended at `index`.
    Appended { index: usize },
    /// Text was appended to the text block at `index`.
    Extended { index: usize, text: String },
    /// The directive block at `index` left the processing state.
    Resolved { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    InvalidState {
        operation: &'static str,
        state: TurnState,
    },
    /// The model server reported an error inside the stream.
    Stream(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::InvalidState { operation, state } => {
                write!(f, "cannot {operation} while {state}")
            }
            ReconcileError::Stream(message) => write!(f, "stream error: {message}"),
        }
    }
}

impl std::error::Error for ReconcileError {}

/// A function call made by the model and how its render went.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub call: FunctionCall,
    pub block: usize,
    /// Rendered markup, or the error message.
    pub output: Result<String, String>,
}

#[derive(Debug)]
struct TrackedCall {
    call: FunctionCall,
    block: usize,
}

/// Per-turn reconciler state.
#[derive(Debug)]
pub struct Reconciler {
    state: TurnState,
    turn: TurnId,
    failed: bool,
    ingestor: LineIngestor,
    extractor: DirectiveExtractor,
    transcript: String,
    blocks: BlockList,
    dispatcher: Dispatcher,
    calls: Vec<TrackedCall>,
}

impl Reconciler {
    /// Creates a reconciler and the channel its render outcomes arrive on.
    pub fn new(registry: RendererRegistry, render_timeout: Duration) -> (Self, OutcomeRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = Self {
            state: TurnState::Idle,
            turn: TurnId::new(0),
            failed: false,
            ingestor: LineIngestor::new(),
            extractor: DirectiveExtractor::new(),
            transcript: String::new(),
            blocks: BlockList::new(),
            dispatcher: Dispatcher::new(registry, render_timeout, tx),
            calls: Vec::new(),
        };
        (reconciler, rx)
    }

    /// Starts a new turn, superseding whatever the previous turn left behind.
    pub fn begin_turn(&mut self) -> TurnId {
        if self.state != TurnState::Idle || self.blocks.pending_count() > 0 {
            debug!(turn = %self.turn, state = %self.state, "Superseding unfinished turn");
        }
        self.turn = TurnId::new(self.turn.get() + 1);
        self.state = TurnState::Streaming;
        self.failed = false;
        self.ingestor.reset();
        self.extractor.reset();
        self.transcript.clear();
        self.blocks.clear();
        self.calls.clear();
        self.turn
    }

    /// Opens a follow-up request inside the current turn (after function calls).
    ///
    /// Blocks and transcript carry on; stream parsing starts fresh.
    ///
    /// # Errors
    /// Returns an error if no turn has finished streaming, or the turn failed.
    pub fn begin_round(&mut self) -> Result<(), ReconcileError> {
        if self.state == TurnState::Streaming || self.turn.get() == 0 || self.failed {
            return Err(ReconcileError::InvalidState {
                operation: "begin a follow-up round",
                state: self.state,
            });
        }
        self.ingestor.reset();
        self.extractor.reset();
        self.state = TurnState::Streaming;
        Ok(())
    }

    /// Feeds one raw transport chunk.
    ///
    /// # Errors
    /// Returns an error when not streaming, or when the stream carries an
    /// in-band error (the turn is failed and returns to idle).
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Vec<BlockUpdate>, ReconcileError> {
        self.ensure_streaming("ingest")?;
        let mut updates = Vec::new();
        for delta in self.ingestor.push(chunk) {
            self.handle_delta(delta, &mut updates)?;
        }
        Ok(updates)
    }

    /// Feeds an already-decoded delta.
    ///
    /// # Errors
    /// Same as [`Reconciler::ingest`].
    pub fn ingest_delta(&mut self, delta: Delta) -> Result<Vec<BlockUpdate>, ReconcileError> {
        self.ensure_streaming("ingest")?;
        let mut updates = Vec::new();
        self.handle_delta(delta, &mut updates)?;
        Ok(updates)
    }

    /// Handles end of stream: parses the last line, flushes carry-over as
    /// text, and moves to Finalizing (or straight to Idle if nothing is pending).
    ///
    /// # Errors
    /// Same as [`Reconciler::ingest`].
    pub fn finish(&mut self) -> Result<Vec<BlockUpdate>, ReconcileError> {
        self.ensure_streaming("finish")?;
        let mut updates = Vec::new();
        for delta in self.ingestor.finish() {
            self.handle_delta(delta, &mut updates)?;
        }
        let segments = self.extractor.finish();
        self.apply_segments(segments, &mut updates);

        self.state = TurnState::Finalizing;
        self.settle();
        Ok(updates)
    }

    /// Fails the current turn after a transport error. Blocks stay as they
    /// are; unclassified carry-over is kept as a trailing text block.
    pub fn fail(&mut self) {
        if self.state == TurnState::Idle && self.failed {
            return;
        }
        let segments = self.extractor.flush();
        if !segments.is_empty() {
            debug!(turn = %self.turn, "Keeping carry-over of failed turn as text");
            let mut updates = Vec::new();
            self.apply_segments(segments, &mut updates);
        }
        self.ingestor.reset();
        self.state = TurnState::Idle;
        self.failed = true;
    }

    /// Applies a render outcome. Outcomes from superseded turns are ignored.
    pub fn apply(&mut self, outcome: RenderOutcome) -> Option<BlockUpdate> {
        if outcome.turn != self.turn {
            debug!(
                stale = %outcome.turn,
                current = %self.turn,
                block = outcome.block,
                "Ignoring render result from superseded turn"
            );
            return None;
        }

        let resolved = match outcome.result {
            Ok(output) => self.blocks.complete(outcome.block, output),
            Err(err) => self.blocks.fail(outcome.block, err.to_string()),
        };
        if !resolved {
            warn!(block = outcome.block, "Render result for a block that is not pending");
            return None;
        }

        self.settle();
        Some(BlockUpdate::Resolved {
            index: outcome.block,
        })
    }

    /// Removes and returns the function calls whose renders have resolved.
    pub fn take_function_results(&mut self) -> Vec<FunctionResult> {
        let blocks = &self.blocks;
        let (resolved, pending): (Vec<_>, Vec<_>) = self
            .calls
            .drain(..)
            .partition(|tracked| blocks.get(tracked.block).is_some_and(|b| !b.is_pending()));
        self.calls = pending;

        resolved
            .into_iter()
            .filter_map(|tracked| {
                let block = self.blocks.get(tracked.block)?;
                let output = match &block.error {
                    Some(error) => Err(error.clone()),
                    None => Ok(block.display_text().to_string()),
                };
                Some(FunctionResult {
                    call: tracked.call,
                    block: tracked.block,
                    output,
                })
            })
            .collect()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Text deltas received so far in this turn, sentinels included.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn carry_over(&self) -> &str {
        self.extractor.carry_over()
    }

    pub fn has_pending(&self) -> bool {
        self.blocks.pending_count() > 0
    }

    pub fn malformed_lines(&self) -> usize {
        self.ingestor.malformed_lines()
    }

    fn ensure_streaming(&self, operation: &'static str) -> Result<(), ReconcileError> {
        if self.state == TurnState::Streaming {
            Ok(())
        } else {
            Err(ReconcileError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn settle(&mut self) {
        if self.state == TurnState::Finalizing && !self.has_pending() {
            self.state = TurnState::Idle;
        }
    }

    fn handle_delta(
        &mut self,
        delta: Delta,
        updates: &mut Vec<BlockUpdate>,
    ) -> Result<(), ReconcileError> {
        match delta {
            Delta::Text(text) => {
                self.transcript.push_str(&text);
                let segments = self.extractor.push(&text);
                self.apply_segments(segments, updates);
            }
            Delta::FunctionCall(call) => {
                // Text held back so far precedes the call in the transcript.
                if self.extractor.in_directive() {
                    warn!(
                        turn = %self.turn,
                        function = %call.name,
                        "Function call inside an open directive; surfacing the directive as text"
                    );
                }
                let segments = self.extractor.flush();
                self.apply_segments(segments, updates);

                let directive = call.clone().into_directive();
                let block = self.place_directive(&directive, updates);
                self.calls.push(TrackedCall { call, block });
            }
            Delta::Error(message) => {
                warn!(turn = %self.turn, %message, "Model server reported an error");
                self.fail();
                return Err(ReconcileError::Stream(message));
            }
        }
        Ok(())
    }

    fn apply_segments(&mut self, segments: Vec<Segment>, updates: &mut Vec<BlockUpdate>) {
        for segment in segments {
            match segment {
                Segment::Text(text) => match self.blocks.push_text(&text) {
                    Some(TextPush::Appended(index)) => updates.push(BlockUpdate::Appended { index }),
                    Some(TextPush::Extended(index)) => {
                        updates.push(BlockUpdate::Extended { index, text });
                    }
                    None => {}
                },
                Segment::Directive(directive) => {
                    self.place_directive(&directive, updates);
                }
            }
        }
    }

    fn place_directive(&mut self, directive: &Directive, updates: &mut Vec<BlockUpdate>) -> usize {
        let index = self.blocks.push_placeholder(directive);
        updates.push(BlockUpdate::Appended { index });

        if let Dispatch::Rejected(err) = self.dispatcher.dispatch(self.turn, index, directive) {
            debug!(turn = %self.turn, index, error = %err, "Directive rejected");
            self.blocks.fail(index, err.to_string());
            updates.push(BlockUpdate::Resolved { index });
        }
        index
    }
}
