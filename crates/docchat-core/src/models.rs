//! Built-in model list.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelOption {
    pub id: &'static str,
    pub label: &'static str,
    /// Name sent to the server in the `model` field.
    pub api_identifier: &'static str,
    pub description: &'static str,
}

pub const AVAILABLE_MODELS: &[ModelOption] = &[
    ModelOption {
        id: "llama2",
        label: "Llama 2",
        api_identifier: "llama2",
        description: "General-purpose chat model",
    },
    ModelOption {
        id: "mistral",
        label: "Mistral",
        api_identifier: "mistral",
        description: "Fast 7B model with good instruction following",
    },
];

pub fn default_model() -> &'static ModelOption {
    &AVAILABLE_MODELS[0]
}

/// Looks up a model by id or API identifier.
pub fn find_model(name: &str) -> Option<&'static ModelOption> {
    let name = name.trim();
    AVAILABLE_MODELS
        .iter()
        .find(|m| m.id.eq_ignore_ascii_case(name) || m.api_identifier == name)
}

/// Maps a configured model name to what the server expects.
///
/// Names outside the built-in list pass through unchanged so any pulled
/// Ollama model can be used.
pub fn api_identifier(name: &str) -> &str {
    find_model(name).map_or(name, |m| m.api_identifier)
}
