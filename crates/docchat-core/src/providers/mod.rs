//! Model server transport.

pub mod functions;
pub mod ollama;
pub mod shared;

pub use functions::FunctionDefinition;
pub use ollama::{ByteStream, OllamaClient, OllamaConfig};
pub use shared::{ChatMessage, ProviderError, ProviderErrorKind, ProviderResult, Role};
