//! Markdown directive renderer.

use std::sync::Arc;

use pulldown_cmark::{Options, Parser, html};

use crate::reconciler::dispatch::{RenderError, RenderHandler};

/// Renders markdown to HTML inside a `markdown-block` container.
///
/// # Errors
/// Returns an error if the payload is blank.
pub fn render_markdown(source: &str) -> Result<String, RenderError> {
    if source.trim().is_empty() {
        return Err(RenderError::invalid_payload("empty markdown"));
    }

    let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let parser = Parser::new_ext(source, options);

    let mut out = String::from("<div class=\"markdown-block\">");
    html::push_html(&mut out, parser);
    out.push_str("</div>");
    Ok(out)
}

pub fn handler() -> RenderHandler {
    Arc::new(|payload| {
        let result = render_markdown(payload);
        Box::pin(async move { result })
    })
}
