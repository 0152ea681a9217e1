//! Renderers for directive payloads.

pub mod command;
pub mod diagram;
pub mod markdown;

use tracing::warn;

use crate::config::RenderConfig;
use crate::reconciler::directive::DirectiveKind;
use crate::reconciler::dispatch::RendererRegistry;
use command::CommandRenderer;

/// Builds the renderer registry for markdown, mermaid, and netlist directives.
pub fn registry(config: &RenderConfig) -> RendererRegistry {
    RendererRegistry::new()
        .with_renderer(DirectiveKind::Markdown, markdown::handler())
        .with_renderer(
            DirectiveKind::Mermaid,
            diagram::handler(
                DirectiveKind::Mermaid,
                external("mermaid_command", config.mermaid_command.as_deref()),
            ),
        )
        .with_renderer(
            DirectiveKind::Netlist,
            diagram::handler(
                DirectiveKind::Netlist,
                external("netlist_command", config.netlist_command.as_deref()),
            ),
        )
}

fn external(key: &str, argv: Option<&[String]>) -> Option<CommandRenderer> {
    let argv = argv?;
    let renderer = CommandRenderer::from_argv(argv);
    if renderer.is_none() {
        warn!(key, "Ignoring empty render command");
    }
    renderer
}
