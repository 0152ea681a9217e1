//! Core docchat library (reconciler, providers, renderers, config).

pub mod config;
pub mod core;
pub mod intent;
pub mod logging;
pub mod models;
pub mod prompts;
pub mod providers;
pub mod reconciler;
pub mod render;
pub mod timeline;
