//! Embedded prompt templates.

/// Default system prompt describing the directive block format.
pub const SYSTEM_PROMPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/system_prompt.md"
));
