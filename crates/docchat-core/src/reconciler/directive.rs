//! Directive model: render requests embedded in a streamed response.
//!
//! A directive reaches the reconciler one of two ways:
//!
//! - inline sentinels in the text stream (`§§mermaid§§graph TD; A-->B§§/mermaid§§`)
//! - a structured function call (`{"name": "generateGraph", "arguments": {...}}`),
//!   either from the envelope's `function_call` field or wrapped in
//!   `#FUNC_START#...#FUNC_END#` markers inside the text.
//!
//! Both forms normalize to [`Directive`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Kind of directive, which selects the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Markdown,
    Mermaid,
    Netlist,
    /// Anything the reconciler has no renderer for. Holds the tag or call name.
    Unrecognized(String),
}

impl DirectiveKind {
    /// Maps a sentinel tag to a kind.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "markdown" => DirectiveKind::Markdown,
            "mermaid" => DirectiveKind::Mermaid,
            "netlistsvg" | "netlist" => DirectiveKind::Netlist,
            other => DirectiveKind::Unrecognized(other.to_string()),
        }
    }

    /// Returns the canonical sentinel tag for this kind.
    pub fn tag(&self) -> &str {
        match self {
            DirectiveKind::Markdown => "markdown",
            DirectiveKind::Mermaid => "mermaid",
            DirectiveKind::Netlist => "netlistsvg",
            DirectiveKind::Unrecognized(tag) => tag,
        }
    }

    pub fn is_diagram(&self) -> bool {
        matches!(self, DirectiveKind::Mermaid | DirectiveKind::Netlist)
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where a directive came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveOrigin {
    /// Inline `§§tag§§` sentinels.
    Sentinel,
    /// A function call, by name.
    FunctionCall { name: String },
}

/// A complete directive ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub payload: String,
    pub origin: DirectiveOrigin,
}

impl Directive {
    pub fn sentinel(tag: &str, payload: impl Into<String>) -> Self {
        Self {
            kind: DirectiveKind::from_tag(tag),
            payload: payload.into(),
            origin: DirectiveOrigin::Sentinel,
        }
    }

    /// Returns the function name if this directive came from a function call.
    pub fn function_name(&self) -> Option<&str> {
        match &self.origin {
            DirectiveOrigin::FunctionCall { name } => Some(name),
            DirectiveOrigin::Sentinel => None,
        }
    }

    /// Rebuilds the on-wire sentinel form. Only meaningful for sentinel directives.
    pub fn to_sentinel_text(&self) -> String {
        let tag = self.kind.tag();
        format!("§§{tag}§§{}§§/{tag}§§", self.payload)
    }
}

/// A raw function call as sent by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Arguments of `generateMarkdown`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MarkdownArgs {
    pub content: String,
}

/// Arguments of `generateGraph`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GraphArgs {
    pub code: String,
    #[serde(rename = "type")]
    pub graph_type: String,
}

/// The function calls the reconciler knows how to render.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "arguments")]
pub enum KnownCall {
    #[serde(rename = "generateMarkdown")]
    GenerateMarkdown(MarkdownArgs),
    #[serde(rename = "generateGraph")]
    GenerateGraph(GraphArgs),
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Parses a `{"name": ..., "arguments": ...}` object from marker-wrapped text.
    ///
    /// # Errors
    /// Returns an error if the text is not a JSON object with a `name`.
    pub fn from_json_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text.trim())
    }

    /// Returns the arguments as a JSON value, decoding string-encoded arguments.
    ///
    /// OpenAI-style payloads send `"arguments": "{\"code\": ...}"`; Ollama sends
    /// an object. Both end up as an object here when decodable.
    pub fn decoded_arguments(&self) -> Value {
        match &self.arguments {
            Value::String(raw) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            other => other.clone(),
        }
    }

    /// Classifies the call against the known set.
    pub fn classify(&self) -> Option<KnownCall> {
        let tagged = json!({
            "name": self.name,
            "arguments": self.decoded_arguments(),
        });
        serde_json::from_value(tagged).ok()
    }

    /// Converts the call into a directive.
    ///
    /// Unknown names, malformed arguments, and unsupported graph types all
    /// become [`DirectiveKind::Unrecognized`] with the raw arguments as payload.
    pub fn into_directive(self) -> Directive {
        let kind_and_payload = match self.classify() {
            Some(KnownCall::GenerateMarkdown(args)) => Some((DirectiveKind::Markdown, args.content)),
            Some(KnownCall::GenerateGraph(args)) => match DirectiveKind::from_tag(&args.graph_type)
            {
                DirectiveKind::Unrecognized(_) => None,
                kind => Some((kind, args.code)),
            },
            None => None,
        };

        let (kind, payload) = kind_and_payload.unwrap_or_else(|| {
            let raw = match &self.arguments {
                Value::String(raw) => raw.clone(),
                other => other.to_string(),
            };
            (DirectiveKind::Unrecognized(self.name.clone()), raw)
        });

        Directive {
            kind,
            payload,
            origin: DirectiveOrigin::FunctionCall { name: self.name },
        }
    }
}
