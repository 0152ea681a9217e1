//! Streaming response reconciler.
//!
//! Raw transport chunks flow through [`ingest`] (NDJSON lines to deltas),
//! [`extract`] (deltas to text and directives), and [`dispatch`] (directives to
//! renderers). [`turn::Reconciler`] owns the per-turn state and keeps the
//! [`blocks::BlockList`] in source order while renders resolve in any order.

pub mod blocks;
pub mod directive;
pub mod dispatch;
pub mod extract;
pub mod ingest;
pub mod turn;

pub use blocks::{BlockKind, BlockList, BlockStatus, RenderBlock};
pub use directive::{Directive, DirectiveKind, FunctionCall};
pub use dispatch::{RenderError, RenderErrorKind, RenderOutcome, RendererRegistry};
pub use ingest::Delta;
pub use turn::{BlockUpdate, OutcomeRx, Reconciler, TurnId, TurnState};
