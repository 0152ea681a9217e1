//! Directive dispatch: routes directives to renderers without blocking ingestion.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::directive::{Directive, DirectiveKind};
use super::turn::TurnId;

/// Async render function.
pub type RenderFuture = Pin<Box<dyn Future<Output = Result<String, RenderError>> + Send>>;
pub type RenderHandler = Arc<dyn Fn(&str) -> RenderFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderErrorKind {
    /// No renderer for the directive kind.
    Unrecognized,
    /// Payload does not parse under the kind's grammar.
    InvalidPayload,
    /// Renderer ran and reported a failure.
    Failed,
    Timeout,
    Panicked,
}

impl fmt::Display for RenderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderErrorKind::Unrecognized => "unrecognized directive",
            RenderErrorKind::InvalidPayload => "invalid payload",
            RenderErrorKind::Failed => "render failed",
            RenderErrorKind::Timeout => "render timed out",
            RenderErrorKind::Panicked => "renderer panicked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub message: String,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unrecognized(kind: &DirectiveKind) -> Self {
        Self::new(
            RenderErrorKind::Unrecognized,
            format!("no renderer for '{kind}'"),
        )
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(RenderErrorKind::InvalidPayload, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RenderErrorKind::Failed, message)
    }

    fn timeout(limit: Duration) -> Self {
        Self::new(
            RenderErrorKind::Timeout,
            format!("no result after {}ms", limit.as_millis()),
        )
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(RenderErrorKind::Panicked, message)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RenderError {}

/// Renderers keyed by directive kind.
#[derive(Clone, Default)]
pub struct RendererRegistry {
    handlers: HashMap<DirectiveKind, RenderHandler>,
}

impl fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(DirectiveKind::tag).collect();
        kinds.sort_unstable();
        f.debug_struct("RendererRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_renderer(mut self, kind: DirectiveKind, handler: RenderHandler) -> Self {
        self.register(kind, handler);
        self
    }

    /// Registers a renderer. `Unrecognized` kinds are never dispatched, so
    /// registering one has no effect.
    pub fn register(&mut self, kind: DirectiveKind, handler: RenderHandler) {
        if matches!(kind, DirectiveKind::Unrecognized(_)) {
            debug!(tag = kind.tag(), "Ignoring renderer for unrecognized kind");
            return;
        }
        self.handlers.insert(kind, handler);
    }

    pub fn handler(&self, kind: &DirectiveKind) -> Option<&RenderHandler> {
        self.handlers.get(kind)
    }

    pub fn supports(&self, kind: &DirectiveKind) -> bool {
        self.handlers.contains_key(kind)
    }
}

/// Result of one render, tagged with the turn and block it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub turn: TurnId,
    pub block: usize,
    pub result: Result<String, RenderError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Spawned,
    /// Failed fast; no task was started.
    Rejected(RenderError),
}

/// Spawns renders and reports their outcomes on a channel.
#[derive(Debug)]
pub struct Dispatcher {
    registry: RendererRegistry,
    timeout: Duration,
    outcomes: mpsc::UnboundedSender<RenderOutcome>,
}

impl Dispatcher {
    pub fn new(
        registry: RendererRegistry,
        timeout: Duration,
        outcomes: mpsc::UnboundedSender<RenderOutcome>,
    ) -> Self {
        Self {
            registry,
            timeout,
            outcomes,
        }
    }

    /// Starts rendering `directive` for `block` of `turn`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, turn: TurnId, block: usize, directive: &Directive) -> Dispatch {
        let Some(handler) = self.registry.handler(&directive.kind) else {
            return Dispatch::Rejected(RenderError::unrecognized(&directive.kind));
        };

        let handler = Arc::clone(handler);
        let payload = directive.payload.clone();
        let limit = self.timeout;
        let tx = self.outcomes.clone();
        let tag = directive.kind.tag().to_string();

        tokio::spawn(async move {
            let render = AssertUnwindSafe(async move { handler(&payload).await }).catch_unwind();
            let result = match tokio::time::timeout(limit, render).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(RenderError::panicked(panic.as_ref())),
                Err(_elapsed) => Err(RenderError::timeout(limit)),
            };
            if let Err(err) = &result {
                debug!(%turn, block, tag = %tag, error = %err, "Render failed");
            }
            // Receiver is gone once the session is dropped.
            let _ = tx.send(RenderOutcome {
                turn,
                block,
                result,
            });
        });

        Dispatch::Spawned
    }
}
