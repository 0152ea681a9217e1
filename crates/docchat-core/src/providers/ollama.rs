//! Ollama chat client (`/api/chat`, newline-delimited JSON streaming).

use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::debug;

use super::functions::FunctionDefinition;
use super::shared::{ChatMessage, ProviderError, ProviderErrorKind, USER_AGENT, resolve_base_url};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const BASE_URL_ENV: &str = "OLLAMA_BASE_URL";
const CHAT_PATH: &str = "/api/chat";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw response body chunks, exactly as the transport delivers them.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

impl OllamaConfig {
    /// Resolves the base URL from `OLLAMA_BASE_URL`, then config, then the default.
    ///
    /// # Errors
    /// Returns an error if the resolved URL is invalid.
    pub fn new(model: impl Into<String>, config_base_url: Option<&str>) -> Result<Self> {
        let base_url = resolve_base_url(config_base_url, BASE_URL_ENV, DEFAULT_BASE_URL, "Ollama")?;
        Ok(Self {
            base_url,
            model: model.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "<[FunctionDefinition]>::is_empty")]
    functions: &'a [FunctionDefinition],
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    config: OllamaConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Opens a streaming chat request.
    ///
    /// A non-2xx status is returned as a [`ProviderError`] before any chunk
    /// is read.
    ///
    /// # Errors
    /// Returns an error if the request cannot be sent or the status is not a success.
    pub async fn send_chat_stream(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionDefinition],
    ) -> Result<ByteStream> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            functions,
            function_call: (!functions.is_empty()).then_some("auto"),
        };

        let url = format!("{}{}", self.config.base_url, CHAT_PATH);
        debug!(%url, model = %self.config.model, messages = messages.len(), "Opening chat stream");

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body).into());
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error));
        Ok(Box::pin(stream))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_body() || e.is_decode() {
        ProviderError::new(ProviderErrorKind::Parse, format!("Stream interrupted: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::providers::functions;

    fn client(server: &MockServer) -> OllamaClient {
        OllamaClient::new(OllamaConfig {
            base_url: server.uri(),
            model: "llama2".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_streams_body_and_sends_functions() {
        let server = MockServer::start().await;
        let body = "{\"message\":{\"content\":\"Hi\"}}\n{\"done\":true}\n";
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama2",
                "stream": true,
                "function_call": "auto",
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let stream = client(&server)
            .send_chat_stream(&[ChatMessage::user("hello")], &functions::definitions())
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        let received: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(received, body.as_bytes());
    }

    #[tokio::test]
    async fn test_non_success_status_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"error":"model 'nope' not found"}"#),
            )
            .mount(&server)
            .await;

        let Err(err) = client(&server)
            .send_chat_stream(&[ChatMessage::user("hello")], &[])
            .await
        else {
            panic!("expected an error");
        };
        let provider_err = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(provider_err.kind, ProviderErrorKind::HttpStatus);
        assert_eq!(provider_err.message, "HTTP 404: model 'nope' not found");
    }

    #[test]
    fn test_request_omits_functions_when_empty() {
        let messages = [ChatMessage::user("x")];
        let request = ChatRequest {
            model: "mistral",
            messages: &messages,
            stream: true,
            functions: &[],
            function_call: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("functions").is_none());
        assert!(json.get("function_call").is_none());
    }
}
