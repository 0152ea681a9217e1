//! Core module: UI-agnostic turn driver and runtime.
//!
//! This module contains:
//! - `events`: Turn event types for streaming output
//! - `interrupt`: Ctrl+C handling for graceful interruption
//! - `session`: Chat session and the per-turn request loop

pub mod events;
pub mod interrupt;
pub mod session;
