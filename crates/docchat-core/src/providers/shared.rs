//! Provider-agnostic types shared by the chat transport.

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reconciler::directive::FunctionCall;

/// Standard User-Agent header for docchat requests.
pub const USER_AGENT: &str = concat!("docchat/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Config resolution helpers
// ============================================================================

/// Resolves a base URL with precedence: env > config > default.
///
/// # Arguments
/// * `config_base_url` - Value from config file (if present)
/// * `env_var` - Environment variable name (e.g., "`OLLAMA_BASE_URL`")
/// * `default_url` - Default URL if neither env nor config is set
/// * `provider_name` - Human-readable provider name for error messages
///
/// # Errors
/// Returns an error if the env or config value is not a valid URL.
pub fn resolve_base_url(
    config_base_url: Option<&str>,
    env_var: &str,
    default_url: &str,
    provider_name: &str,
) -> Result<String> {
    let candidates = [
        std::env::var(env_var).ok(),
        config_base_url.map(str::to_string),
    ];

    for candidate in candidates.into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            validate_url(trimmed, provider_name)?;
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
    }

    Ok(default_url.to_string())
}

fn validate_url(url: &str, provider_name: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid {provider_name} base URL: {url}"))?;
    Ok(())
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a function call, fed back to the model.
    Function,
}

/// A chat message with owned data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Function name for `Role::Function` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Function call requested by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates an assistant message recording a function call it made.
    pub fn assistant_call(call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Self::new(Role::Assistant, "")
        }
    }

    /// Creates a function-result message answering an earlier call.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(Role::Function, content)
        }
    }
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection timeout or request timeout
    Timeout,
    /// Failed to read or decode the response body
    Parse,
    /// Error reported in-band by the model server
    ApiError,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
        }
    }
}

/// Structured error from the provider with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    /// Error category
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an HTTP status error, lifting the server's message out of a
    /// JSON body when one is present.
    pub fn http_status(status: u16, body: &str) -> Self {
        let details = (!body.is_empty()).then(|| body.to_string());
        let server_message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| extract_error_message(&json));

        let message = match server_message {
            Some(msg) => format!("HTTP {status}: {msg}"),
            None => format!("HTTP {status}"),
        };

        Self {
            kind: ProviderErrorKind::HttpStatus,
            message,
            details,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    /// Creates an API error (from an in-band error line).
    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ApiError, message)
    }
}

/// Pulls a human-readable message out of `{"error": "..."}` or
/// `{"error": {"message": "..."}}`.
pub(crate) fn extract_error_message(json: &Value) -> Option<String> {
    let error = json.get("error")?;
    error
        .as_str()
        .or_else(|| error.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_extracts_ollama_error() {
        let err = ProviderError::http_status(404, r#"{"error":"model 'llama9' not found"}"#);
        assert_eq!(err.kind, ProviderErrorKind::HttpStatus);
        assert_eq!(err.message, "HTTP 404: model 'llama9' not found");
        assert!(err.details.is_some());
    }

    #[test]
    fn test_http_status_extracts_nested_error() {
        let err = ProviderError::http_status(500, r#"{"error":{"message":"boom"}}"#);
        assert_eq!(err.message, "HTTP 500: boom");
    }

    #[test]
    fn test_http_status_plain_body() {
        let err = ProviderError::http_status(502, "");
        assert_eq!(err.message, "HTTP 502");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_function_result_message_serializes_name() {
        let msg = ChatMessage::function_result("generateGraph", "<svg/>");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "function");
        assert_eq!(json["name"], "generateGraph");
        assert!(json.get("function_call").is_none());
    }

    #[test]
    fn test_resolve_base_url_prefers_config_over_default() {
        let url = resolve_base_url(
            Some("http://gpu-box:11434/"),
            "DOCCHAT_TEST_UNSET_BASE_URL",
            "http://localhost:11434",
            "Ollama",
        )
        .unwrap();
        assert_eq!(url, "http://gpu-box:11434");
    }

    #[test]
    fn test_resolve_base_url_rejects_garbage() {
        let result = resolve_base_url(
            Some("not a url"),
            "DOCCHAT_TEST_UNSET_BASE_URL",
            "http://localhost:11434",
            "Ollama",
        );
        assert!(result.is_err());
    }
}
