//! Streamed stdout/stderr rendering of turn events.
//!
//! # Output contract
//! - Blocks are written to stdout in source order. A block after a pending
//!   diagram waits until the diagram resolves.
//! - Render failures, function rounds, turn errors, and interrupts go to stderr.
//! - In JSON mode every event is one line of JSON on stdout.

use std::io::{Write, stderr, stdout};

use docchat_core::core::events::{TurnEvent, TurnEventRx};
use docchat_core::reconciler::{BlockKind, BlockList, BlockStatus, RenderBlock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Blocks,
    Json,
}

/// Writes blocks in order as they become displayable.
#[derive(Debug, Default)]
pub struct BlockPrinter {
    blocks: Vec<RenderBlock>,
    /// Blocks fully written.
    flushed: usize,
    /// Bytes already written of the block at `flushed` (open text block).
    written: usize,
    needs_final_newline: bool,
}

impl BlockPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event and writes whatever became displayable.
    pub fn handle_event(&mut self, event: &TurnEvent, out: &mut impl Write, err: &mut impl Write) {
        match event {
            TurnEvent::TurnStarted { .. } => {
                *self = Self::new();
            }
            TurnEvent::BlockAppended { index, block } => {
                self.store(*index, block.clone());
            }
            TurnEvent::BlockResolved { index, block } => {
                self.store(*index, block.clone());
                if block.status == BlockStatus::Failed
                    && let Some(error) = &block.error
                {
                    let _ = writeln!(err, "Render failed ({}): {error}", kind_name(block.kind));
                }
            }
            TurnEvent::TextExtended { index, text } => {
                if let Some(block) = self.blocks.get_mut(*index) {
                    block.source.push_str(text);
                }
            }
            TurnEvent::FunctionRound { round, calls } => {
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                let _ = writeln!(err, "Function round {round}: {}", names.join(", "));
            }
            TurnEvent::TurnCompleted { blocks, .. } => {
                self.replace(blocks);
                self.flush(out, true);
                self.finish_line(out);
                return;
            }
            TurnEvent::TurnFailed {
                message,
                details,
                blocks,
                ..
            } => {
                self.replace(blocks);
                self.flush(out, true);
                self.finish_line(out);
                let _ = writeln!(err, "Error: {message}");
                if let Some(details) = details {
                    let _ = writeln!(err, "{details}");
                }
                return;
            }
            TurnEvent::Interrupted { blocks } => {
                self.replace(blocks);
                self.flush(out, true);
                self.finish_line(out);
                let _ = writeln!(err, "Interrupted.");
                return;
            }
        }
        self.flush(out, false);
    }

    fn store(&mut self, index: usize, block: RenderBlock) {
        if index < self.blocks.len() {
            // Keep text that arrived through deltas after this snapshot.
            let known = &self.blocks[index];
            if block.kind == BlockKind::Text && known.source.len() > block.source.len() {
                return;
            }
            self.blocks[index] = block;
        } else if index == self.blocks.len() {
            self.blocks.push(block);
        }
    }

    fn replace(&mut self, blocks: &BlockList) {
        self.blocks = blocks.iter().cloned().collect();
    }

    /// Writes resolved blocks from `flushed` on. The trailing text block
    /// stays open for more deltas unless `done`.
    fn flush(&mut self, out: &mut impl Write, done: bool) {
        while let Some(block) = self.blocks.get(self.flushed) {
            if block.is_pending() {
                break;
            }
            let is_last = self.flushed + 1 == self.blocks.len();

            if block.kind == BlockKind::Text {
                if let Some(rest) = block.source.get(self.written..)
                    && !rest.is_empty()
                {
                    let _ = write!(out, "{rest}");
                    self.needs_final_newline = !rest.ends_with('\n');
                }
                self.written = block.source.len();
                if is_last && !done {
                    break;
                }
            } else {
                if self.needs_final_newline {
                    let _ = writeln!(out);
                }
                let _ = writeln!(out, "{}", block.display_text());
                self.needs_final_newline = false;
            }

            self.flushed += 1;
            self.written = 0;
        }
        let _ = out.flush();
    }

    fn finish_line(&mut self, out: &mut impl Write) {
        if self.needs_final_newline {
            let _ = writeln!(out);
            let _ = out.flush();
            self.needs_final_newline = false;
        }
    }
}

fn kind_name(kind: BlockKind) -> &'static str {
    match kind {
        BlockKind::Text => "text",
        BlockKind::Markdown => "markdown",
        BlockKind::Mermaid => "mermaid",
        BlockKind::Netlist => "netlist",
        BlockKind::Unrecognized => "unrecognized",
    }
}

/// Spawns a task that renders events until the channel closes.
pub fn spawn_printer_task(mut rx: TurnEventRx, mode: OutputMode) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut printer = BlockPrinter::new();
        let mut out = stdout();
        let mut err = stderr();
        while let Some(event) = rx.recv().await {
            match mode {
                OutputMode::Blocks => printer.handle_event(&event, &mut out, &mut err),
                OutputMode::Json => match serde_json::to_string(event.as_ref()) {
                    Ok(line) => {
                        let _ = writeln!(out, "{line}");
                        let _ = out.flush();
                    }
                    Err(e) => {
                        let _ = writeln!(err, "Failed to encode event: {e}");
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use docchat_core::intent::Intent;
    use docchat_core::reconciler::{Directive, TurnId};

    use super::*;

    /// Builds `[text, mermaid placeholder, text]`.
    fn blocks() -> BlockList {
        let mut list = BlockList::new();
        list.push_text("Before ");
        list.push_placeholder(&Directive::sentinel("mermaid", "graph TD"));
        list.push_text("after");
        list
    }

    fn appended(list: &BlockList, index: usize) -> TurnEvent {
        TurnEvent::BlockAppended {
            index,
            block: list.get(index).unwrap().clone(),
        }
    }

    fn run(events: &[TurnEvent]) -> (String, String) {
        let mut printer = BlockPrinter::new();
        let mut out = Vec::new();
        let mut err = Vec::new();
        for event in events {
            printer.handle_event(event, &mut out, &mut err);
        }
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_text_after_pending_block_waits() {
        let list = blocks();
        let mut printer = BlockPrinter::new();
        let mut out = Vec::new();
        let mut err = Vec::new();

        for event in [
            TurnEvent::TurnStarted {
                turn: TurnId::new(1),
                intent: Intent::Natural,
            },
            appended(&list, 0),
            appended(&list, 1),
            appended(&list, 2),
        ] {
            printer.handle_event(&event, &mut out, &mut err);
        }
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "Before ");

        let mut resolved = list.clone();
        resolved.complete(1, "<pre class=\"mermaid\">graph TD</pre>".to_string());
        printer.handle_event(
            &TurnEvent::BlockResolved {
                index: 1,
                block: resolved.get(1).unwrap().clone(),
            },
            &mut out,
            &mut err,
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Before \n<pre class=\"mermaid\">graph TD</pre>\nafter"
        );
        assert!(err.is_empty());
    }

    #[test]
    fn test_text_deltas_stream_through() {
        let mut list = BlockList::new();
        list.push_text("Hel");
        let (out, _) = run(&[
            appended(&list, 0),
            TurnEvent::TextExtended {
                index: 0,
                text: "lo".to_string(),
            },
            TurnEvent::TurnCompleted {
                turn: TurnId::new(1),
                blocks: {
                    let mut done = list.clone();
                    done.push_text("lo");
                    done
                },
                transcript: "Hello".to_string(),
            },
        ]);
        assert_eq!(out, "Hello\n");
    }

    #[test]
    fn test_failed_block_prints_fallback_and_error() {
        let mut list = blocks();
        list.fail(1, "renderer exited with status 1");
        let (out, err) = run(&[TurnEvent::TurnCompleted {
            turn: TurnId::new(1),
            blocks: list,
            transcript: String::new(),
        }]);
        assert_eq!(out, "Before \n```mermaid\ngraph TD\n```\nafter\n");
        assert!(err.is_empty());

        let mut list = blocks();
        list.fail(1, "renderer exited with status 1");
        let (_, err) = run(&[TurnEvent::BlockResolved {
            index: 1,
            block: list.get(1).unwrap().clone(),
        }]);
        assert_eq!(err, "Render failed (mermaid): renderer exited with status 1\n");
    }

    #[test]
    fn test_turn_failed_reports_error() {
        let mut list = BlockList::new();
        list.push_text("partial");
        let (out, err) = run(&[TurnEvent::TurnFailed {
            kind: docchat_core::core::events::ErrorKind::ApiError,
            message: "out of memory".to_string(),
            details: None,
            blocks: list,
        }]);
        assert_eq!(out, "partial\n");
        assert_eq!(err, "Error: out of memory\n");
    }
}
