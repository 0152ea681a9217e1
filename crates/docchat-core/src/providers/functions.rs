//! Function definitions advertised to the model.

use serde::Serialize;
use serde_json::{Value, json};

pub const GENERATE_MARKDOWN: &str = "generateMarkdown";
pub const GENERATE_GRAPH: &str = "generateGraph";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// The calls the reconciler can turn into render blocks.
pub fn definitions() -> Vec<FunctionDefinition> {
    vec![
        FunctionDefinition {
            name: GENERATE_MARKDOWN.to_string(),
            description: "Generate fully formatted markdown content for documentation."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "The markdown content to render."
                    }
                },
                "required": ["content"]
            }),
        },
        FunctionDefinition {
            name: GENERATE_GRAPH.to_string(),
            description: "Generate a diagram from source code.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Diagram source: mermaid text or a netlist JSON document."
                    },
                    "type": {
                        "type": "string",
                        "enum": ["mermaid", "netlistsvg"],
                        "description": "Which diagram renderer to use."
                    }
                },
                "required": ["code", "type"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::directive::{DirectiveKind, FunctionCall};

    #[test]
    fn test_definitions_match_known_calls() {
        let defs = definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![GENERATE_MARKDOWN, GENERATE_GRAPH]);

        // Every advertised enum value must map to a renderable kind.
        let graph_types = defs[1].parameters["properties"]["type"]["enum"]
            .as_array()
            .unwrap();
        for graph_type in graph_types {
            let call = FunctionCall::new(
                GENERATE_GRAPH,
                json!({"code": "x", "type": graph_type}),
            );
            assert!(!matches!(
                call.into_directive().kind,
                DirectiveKind::Unrecognized(_)
            ));
        }
    }
}
