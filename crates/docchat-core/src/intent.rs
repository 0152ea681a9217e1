//! Keyword-based intent detection for outgoing prompts.
//!
//! The detected intent becomes a short formatting hint appended to the user
//! message so the model picks the right directive.

use serde::Serialize;

const MERMAID_KEYWORDS: &[&str] = &["flowchart", "sequence diagram", "gantt", "mermaid"];
const NETLIST_KEYWORDS: &[&str] = &["circuit", "netlist", "digital logic", "gate diagram"];
const MARKDOWN_KEYWORDS: &[&str] = &["table", "list", "format", "markdown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphKind {
    Mermaid,
    Netlist,
}

impl GraphKind {
    pub fn tag(self) -> &'static str {
        match self {
            GraphKind::Mermaid => "mermaid",
            GraphKind::Netlist => "netlistsvg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "graph", rename_all = "lowercase")]
pub enum Intent {
    Natural,
    Markdown,
    Graph(GraphKind),
    /// Formatted text plus a diagram.
    Combined(GraphKind),
}

impl Intent {
    /// Formatting hint for the model, if the intent calls for one.
    pub fn hint(self) -> Option<String> {
        match self {
            Intent::Natural => None,
            Intent::Markdown => {
                Some("Format the structured parts of the answer inside a §§markdown§§ block.".to_string())
            }
            Intent::Graph(kind) => {
                let tag = kind.tag();
                Some(format!("Answer with a diagram inside a §§{tag}§§ block."))
            }
            Intent::Combined(kind) => {
                let tag = kind.tag();
                Some(format!(
                    "Use a §§markdown§§ block for the formatted text and a §§{tag}§§ block for the diagram."
                ))
            }
        }
    }

    /// Returns the prompt with the hint appended.
    pub fn decorate(self, prompt: &str) -> String {
        match self.hint() {
            Some(hint) => format!("{prompt}\n\n({hint})"),
            None => prompt.to_string(),
        }
    }
}

pub fn detect_intent(message: &str) -> Intent {
    let lower = message.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    let graph = if mentions(MERMAID_KEYWORDS) {
        Some(GraphKind::Mermaid)
    } else if mentions(NETLIST_KEYWORDS) {
        Some(GraphKind::Netlist)
    } else {
        None
    };
    let markdown = mentions(MARKDOWN_KEYWORDS);

    match (graph, markdown) {
        (Some(kind), true) => Intent::Combined(kind),
        (Some(kind), false) => Intent::Graph(kind),
        (None, true) => Intent::Markdown,
        (None, false) => Intent::Natural,
    }
}
