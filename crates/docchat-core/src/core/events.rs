//! Turn event types for streaming output.
//!
//! Events are serializable so `exec --json` can print them as NDJSON.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::intent::Intent;
use crate::providers::ProviderErrorKind;
use crate::reconciler::{BlockList, FunctionCall, RenderBlock, TurnId};

/// Events emitted while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Turn has started; the request is about to be sent.
    TurnStarted { turn: TurnId, intent: Intent },

    /// A new block was appended (text, or a directive placeholder).
    BlockAppended { index: usize, block: RenderBlock },

    /// Text was appended to an existing text block.
    TextExtended { index: usize, text: String },

    /// A directive block finished rendering or failed.
    BlockResolved { index: usize, block: RenderBlock },

    /// Function results were sent back and another request is starting.
    FunctionRound { round: u32, calls: Vec<FunctionCall> },

    /// Turn finished and every block is resolved.
    TurnCompleted {
        turn: TurnId,
        blocks: BlockList,
        /// Raw text the model produced, sentinels included.
        transcript: String,
    },

    /// Turn failed; blocks received so far are kept.
    TurnFailed {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        blocks: BlockList,
    },

    /// Turn was stopped by the user.
    Interrupted { blocks: BlockList },
}

/// Error categories for `TurnEvent::TurnFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection/request timeout
    Timeout,
    /// Response body could not be read
    Parse,
    /// Error reported in-band by the model server
    ApiError,
    /// Internal/unknown error
    Internal,
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::HttpStatus => ErrorKind::HttpStatus,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Parse => ErrorKind::Parse,
            ProviderErrorKind::ApiError => ErrorKind::ApiError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::HttpStatus => write!(f, "http_status"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Parse => write!(f, "parse"),
            ErrorKind::ApiError => write!(f, "api_error"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Channel-based event sender (async, bounded).
pub type TurnEventTx = mpsc::Sender<Arc<TurnEvent>>;

/// Channel-based event receiver (async, bounded).
pub type TurnEventRx = mpsc::Receiver<Arc<TurnEvent>>;

/// Default channel capacity for event streams.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (TurnEventTx, TurnEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for `TextExtended`, which can be dropped if the
/// consumer is slow. Use `send_important()` for everything else.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: TurnEventTx,
}

impl EventSender {
    pub fn new(tx: TurnEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if channel is full.
    pub fn send_delta(&self, ev: TurnEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery.
    pub async fn send_important(&self, ev: TurnEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}
