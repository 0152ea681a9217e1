//! Diagram directive renderers (mermaid, netlistsvg).
//!
//! Payloads are validated first. A configured external command then turns the
//! source into markup; without one the source is wrapped in the container the
//! page-side renderer picks up (`<pre class="mermaid">`, `<div class="netlistsvg">`).

use std::sync::Arc;

use serde_json::Value;

use super::command::CommandRenderer;
use crate::reconciler::directive::DirectiveKind;
use crate::reconciler::dispatch::{RenderError, RenderHandler};

/// First words mermaid accepts as a diagram declaration.
const MERMAID_KEYWORDS: &[&str] = &[
    "graph",
    "flowchart",
    "sequenceDiagram",
    "classDiagram",
    "stateDiagram",
    "stateDiagram-v2",
    "erDiagram",
    "journey",
    "gantt",
    "pie",
    "quadrantChart",
    "requirementDiagram",
    "gitGraph",
    "mindmap",
    "timeline",
    "sankey-beta",
    "xychart-beta",
    "block-beta",
    "C4Context",
    "C4Container",
    "C4Component",
    "C4Dynamic",
    "C4Deployment",
];

/// Checks that `source` starts with a mermaid diagram declaration.
///
/// Blank lines and `%%` comments before the declaration are skipped.
///
/// # Errors
/// Returns `InvalidPayload` when no known declaration is found.
pub fn validate_mermaid(source: &str) -> Result<(), RenderError> {
    let first = source
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("%%"))
        .ok_or_else(|| RenderError::invalid_payload("empty mermaid diagram"))?;

    let keyword = first
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or_default();

    if MERMAID_KEYWORDS.contains(&keyword) {
        Ok(())
    } else {
        Err(RenderError::invalid_payload(format!(
            "unknown mermaid diagram type '{keyword}'"
        )))
    }
}

/// Checks that `source` is a netlist JSON document with a `modules` object.
///
/// # Errors
/// Returns `InvalidPayload` when the JSON is malformed or has no modules.
pub fn validate_netlist(source: &str) -> Result<Value, RenderError> {
    let netlist: Value = serde_json::from_str(source.trim())
        .map_err(|e| RenderError::invalid_payload(format!("netlist is not valid JSON: {e}")))?;

    if netlist.get("modules").is_some_and(Value::is_object) {
        Ok(netlist)
    } else {
        Err(RenderError::invalid_payload(
            "netlist must contain a \"modules\" object",
        ))
    }
}

/// Escapes text for inclusion in HTML element content.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn container(kind: &DirectiveKind, source: &str) -> String {
    let escaped = escape_html(source.trim());
    match kind {
        DirectiveKind::Netlist => format!("<div class=\"netlistsvg\">{escaped}</div>"),
        _ => format!("<pre class=\"mermaid\">{escaped}</pre>"),
    }
}

fn validate(kind: &DirectiveKind, source: &str) -> Result<(), RenderError> {
    match kind {
        DirectiveKind::Mermaid => validate_mermaid(source),
        DirectiveKind::Netlist => validate_netlist(source).map(|_| ()),
        other => Err(RenderError::unrecognized(other)),
    }
}

/// Validates and renders one diagram.
///
/// # Errors
/// Returns an error if validation fails or the external command fails.
pub async fn render_diagram(
    kind: &DirectiveKind,
    source: &str,
    command: Option<&CommandRenderer>,
) -> Result<String, RenderError> {
    validate(kind, source)?;
    match command {
        Some(command) => command.run(source).await,
        None => Ok(container(kind, source)),
    }
}

/// Builds the handler for a diagram kind.
pub fn handler(kind: DirectiveKind, command: Option<CommandRenderer>) -> RenderHandler {
    let command = command.map(Arc::new);
    Arc::new(move |payload| {
        let kind = kind.clone();
        let command = command.clone();
        let payload = payload.to_string();
        Box::pin(async move { render_diagram(&kind, &payload, command.as_deref()).await })
    })
}
