//! Ordered render blocks for one turn.

use serde::Serialize;

use super::directive::{Directive, DirectiveKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Markdown,
    Mermaid,
    Netlist,
    Unrecognized,
}

impl From<&DirectiveKind> for BlockKind {
    fn from(kind: &DirectiveKind) -> Self {
        match kind {
            DirectiveKind::Markdown => BlockKind::Markdown,
            DirectiveKind::Mermaid => BlockKind::Mermaid,
            DirectiveKind::Netlist => BlockKind::Netlist,
            DirectiveKind::Unrecognized(_) => BlockKind::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Complete,
    Processing,
    Failed,
}

/// One displayable unit of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderBlock {
    pub kind: BlockKind,
    pub status: BlockStatus,
    /// Plain text for text blocks, raw payload for directive blocks.
    pub source: String,
    /// Rendered markup once complete, fenced fallback once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Function name when the directive came from a function call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Sentinel tag, used for the fallback fence.
    #[serde(skip)]
    tag: String,
}

impl RenderBlock {
    fn text(text: &str) -> Self {
        Self {
            kind: BlockKind::Text,
            status: BlockStatus::Complete,
            source: text.to_string(),
            output: None,
            error: None,
            function: None,
            tag: String::new(),
        }
    }

    fn placeholder(directive: &Directive) -> Self {
        Self {
            kind: BlockKind::from(&directive.kind),
            status: BlockStatus::Processing,
            source: directive.payload.clone(),
            output: None,
            error: None,
            function: directive.function_name().map(str::to_string),
            tag: directive.kind.tag().to_string(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == BlockStatus::Processing
    }

    /// Text to display: rendered output when there is one, otherwise the source.
    pub fn display_text(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.source)
    }

    /// Raw payload wrapped in a fenced code block. The fence is longer than
    /// any backtick run inside the payload.
    pub fn fallback(&self) -> String {
        let fence = "`".repeat(longest_backtick_run(&self.source).max(2) + 1);
        format!("{fence}{}\n{}\n{fence}", self.tag, self.source)
    }
}

fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for ch in text.chars() {
        if ch == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

/// Append-only block sequence. Blocks keep their index for the whole turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BlockList {
    blocks: Vec<RenderBlock>,
}

/// What `push_text` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPush {
    Appended(usize),
    Extended(usize),
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text, extending the trailing text block if there is one.
    pub fn push_text(&mut self, text: &str) -> Option<TextPush> {
        if text.is_empty() {
            return None;
        }
        if let Some(last) = self.blocks.last_mut()
            && last.kind == BlockKind::Text
        {
            last.source.push_str(text);
            return Some(TextPush::Extended(self.blocks.len() - 1));
        }
        self.blocks.push(RenderBlock::text(text));
        Some(TextPush::Appended(self.blocks.len() - 1))
    }

    /// Appends a processing placeholder for a directive and returns its index.
    pub fn push_placeholder(&mut self, directive: &Directive) -> usize {
        self.blocks.push(RenderBlock::placeholder(directive));
        self.blocks.len() - 1
    }

    /// Resolves a processing block with rendered output.
    ///
    /// Returns false if the index is unknown or the block already resolved.
    pub fn complete(&mut self, index: usize, output: String) -> bool {
        let Some(block) = self.pending_mut(index) else {
            return false;
        };
        block.status = BlockStatus::Complete;
        block.output = Some(output);
        true
    }

    /// Marks a processing block failed; its output becomes the fenced fallback.
    pub fn fail(&mut self, index: usize, error: impl Into<String>) -> bool {
        let Some(block) = self.pending_mut(index) else {
            return false;
        };
        block.status = BlockStatus::Failed;
        block.output = Some(block.fallback());
        block.error = Some(error.into());
        true
    }

    fn pending_mut(&mut self, index: usize) -> Option<&mut RenderBlock> {
        self.blocks.get_mut(index).filter(|block| block.is_pending())
    }

    pub fn get(&self, index: usize) -> Option<&RenderBlock> {
        self.blocks.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RenderBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_pending()).count()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

impl<'a> IntoIterator for &'a BlockList {
    type Item = &'a RenderBlock;
    type IntoIter = std::slice::Iter<'a, RenderBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_extends_trailing_text_block() {
        let mut list = BlockList::new();
        assert_eq!(list.push_text("Hel"), Some(TextPush::Appended(0)));
        assert_eq!(list.push_text("lo"), Some(TextPush::Extended(0)));
        assert_eq!(list.push_text(""), None);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().source, "Hello");
    }

    #[test]
    fn test_placeholder_breaks_text_run() {
        let mut list = BlockList::new();
        list.push_text("a");
        let idx = list.push_placeholder(&Directive::sentinel("mermaid", "graph TD"));
        list.push_text("b");
        assert_eq!(idx, 1);
        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1).unwrap().status, BlockStatus::Processing);
        assert_eq!(list.pending_count(), 1);
    }

    #[test]
    fn test_resolution_order_does_not_change_positions() {
        let mut list = BlockList::new();
        let a = list.push_placeholder(&Directive::sentinel("markdown", "A"));
        let b = list.push_placeholder(&Directive::sentinel("mermaid", "B"));

        assert!(list.complete(b, "<b/>".to_string()));
        assert!(list.complete(a, "<a/>".to_string()));

        let outputs: Vec<_> = list.iter().map(RenderBlock::display_text).collect();
        assert_eq!(outputs, vec!["<a/>", "<b/>"]);
    }

    #[test]
    fn test_fail_uses_fenced_fallback() {
        let mut list = BlockList::new();
        let idx = list.push_placeholder(&Directive::sentinel("mermaid", "not a graph"));
        assert!(list.fail(idx, "bad diagram"));

        let block = list.get(idx).unwrap();
        assert_eq!(block.status, BlockStatus::Failed);
        assert_eq!(block.output.as_deref(), Some("```mermaid\nnot a graph\n```"));
        assert_eq!(block.error.as_deref(), Some("bad diagram"));
    }

    #[test]
    fn test_fallback_fence_outgrows_payload_backticks() {
        let mut list = BlockList::new();
        let payload = "Example:\n```js\nlet a = 1;\n```";
        let idx = list.push_placeholder(&Directive::sentinel("markdown", payload));
        assert!(list.fail(idx, "render failed"));

        assert_eq!(
            list.get(idx).unwrap().output.as_deref(),
            Some("````markdown\nExample:\n```js\nlet a = 1;\n```\n````")
        );
    }

    #[test]
    fn test_resolved_block_cannot_be_resolved_again() {
        let mut list = BlockList::new();
        let idx = list.push_placeholder(&Directive::sentinel("markdown", "x"));
        assert!(list.complete(idx, "<p>x</p>".to_string()));
        assert!(!list.fail(idx, "late"));
        assert!(!list.complete(99, String::new()));
        assert_eq!(list.get(idx).unwrap().status, BlockStatus::Complete);
    }

    #[test]
    fn test_serializes_as_array() {
        let mut list = BlockList::new();
        list.push_text("hi");
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json[0]["kind"], "text");
        assert_eq!(json[0]["status"], "complete");
        assert!(json[0].get("output").is_none());
    }
}
