//! Incremental directive extraction over streamed text.
//!
//! The extractor keeps a consumed-offset cursor into its buffer. Text before
//! the cursor has been classified and handed out exactly once; text after it
//! is carry-over: an open directive waiting for its closing marker, or a
//! trailing fragment that might still turn into an opening marker.

use tracing::warn;

use super::directive::{Directive, DirectiveKind, DirectiveOrigin, FunctionCall};

const SENTINEL: &str = "§§";
const FUNC_START: &str = "#FUNC_START#";
const FUNC_END: &str = "#FUNC_END#";
/// Longest tag accepted between sentinels. Bounds how much text a
/// half-written opener can hold back.
const MAX_TAG_LEN: usize = 32;

/// A classified piece of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Directive(Directive),
}

#[derive(Debug, Clone)]
enum OpenMarker {
    Sentinel { tag: String },
    FunctionCall,
}

impl OpenMarker {
    fn closer(&self) -> String {
        match self {
            OpenMarker::Sentinel { tag } => format!("{SENTINEL}/{tag}{SENTINEL}"),
            OpenMarker::FunctionCall => FUNC_END.to_string(),
        }
    }

    fn describe(&self) -> &str {
        match self {
            OpenMarker::Sentinel { tag } => tag,
            OpenMarker::FunctionCall => "function_call",
        }
    }

    fn into_directive(self, payload: &str) -> Directive {
        match self {
            OpenMarker::Sentinel { tag } => Directive::sentinel(&tag, payload),
            OpenMarker::FunctionCall => match FunctionCall::from_json_text(payload) {
                Ok(call) => call.into_directive(),
                Err(err) => {
                    warn!(error = %err, "Malformed function call between markers");
                    Directive {
                        kind: DirectiveKind::Unrecognized("function_call".to_string()),
                        payload: payload.to_string(),
                        origin: DirectiveOrigin::Sentinel,
                    }
                }
            },
        }
    }
}

#[derive(Debug)]
struct OpenDirective {
    marker: OpenMarker,
    body_start: usize,
}

enum MarkerMatch {
    Complete { len: usize, marker: OpenMarker },
    Partial,
    None,
}

enum Scan {
    Opener {
        at: usize,
        len: usize,
        marker: OpenMarker,
    },
    Partial {
        at: usize,
    },
    Clear,
}

/// Splits streamed text into plain text and complete directives.
#[derive(Debug, Default)]
pub struct DirectiveExtractor {
    buffer: String,
    cursor: usize,
    open: Option<OpenDirective>,
    /// Where the next closing-marker search starts.
    search_from: usize,
}

impl DirectiveExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly arrived text and returns every segment that became complete.
    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        self.buffer.push_str(text);
        let mut segments = Vec::new();

        loop {
            if let Some(open) = self.open.take() {
                let closer = open.marker.closer();
                let from = self.search_from.max(open.body_start);
                if let Some(rel) = self.buffer[from..].find(&closer) {
                    let close_at = from + rel;
                    let payload = &self.buffer[open.body_start..close_at];
                    segments.push(Segment::Directive(open.marker.into_directive(payload)));
                    self.cursor = close_at + closer.len();
                    self.search_from = self.cursor;
                    continue;
                }

                // Closer may be split across pushes; back off by its length.
                let rewind = self.buffer.len().saturating_sub(closer.len() - 1);
                self.search_from = floor_char_boundary(&self.buffer, rewind).max(open.body_start);
                self.open = Some(open);
                break;
            }

            let rest = &self.buffer[self.cursor..];
            match scan_for_opener(rest) {
                Scan::Opener { at, len, marker } => {
                    push_text(&mut segments, &rest[..at]);
                    self.cursor += at;
                    let body_start = self.cursor + len;
                    self.open = Some(OpenDirective { marker, body_start });
                    self.search_from = body_start;
                }
                Scan::Partial { at } => {
                    push_text(&mut segments, &rest[..at]);
                    self.cursor += at;
                    break;
                }
                Scan::Clear => {
                    push_text(&mut segments, rest);
                    self.cursor = self.buffer.len();
                    break;
                }
            }
        }

        self.compact();
        segments
    }

    /// End of stream: flushes all carry-over as plain text and resets the
    /// extractor. An unclosed directive is surfaced verbatim, opener included.
    pub fn finish(&mut self) -> Vec<Segment> {
        if let Some(open) = &self.open {
            warn!(
                directive = open.marker.describe(),
                "Stream ended inside an unclosed directive; flushing as text"
            );
        }
        self.flush()
    }

    /// Surfaces the carry-over as plain text without waiting for more input,
    /// then starts over with an empty buffer.
    pub fn flush(&mut self) -> Vec<Segment> {
        let rest = self.buffer.split_off(self.cursor);
        self.reset();
        if rest.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Text(rest)]
        }
    }

    /// Unclassified suffix of everything pushed so far.
    pub fn carry_over(&self) -> &str {
        &self.buffer[self.cursor..]
    }

    /// Returns true while an opener has been seen without its closer.
    pub fn in_directive(&self) -> bool {
        self.open.is_some()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.buffer.drain(..self.cursor);
        if let Some(open) = &mut self.open {
            open.body_start -= self.cursor;
        }
        self.search_from = self.search_from.saturating_sub(self.cursor);
        self.cursor = 0;
    }
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Text(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn scan_for_opener(rest: &str) -> Scan {
    for (at, ch) in rest.char_indices() {
        let tail = &rest[at..];
        let found = match ch {
            '§' => match_sentinel_opener(tail),
            '#' => match_function_opener(tail),
            _ => continue,
        };
        match found {
            MarkerMatch::Complete { len, marker } => return Scan::Opener { at, len, marker },
            MarkerMatch::Partial => return Scan::Partial { at },
            MarkerMatch::None => {}
        }
    }
    Scan::Clear
}

fn match_sentinel_opener(tail: &str) -> MarkerMatch {
    let Some(after) = tail.strip_prefix(SENTINEL) else {
        return if SENTINEL.starts_with(tail) {
            MarkerMatch::Partial
        } else {
            MarkerMatch::None
        };
    };

    let tag_len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
        .count();
    if tag_len == 0 {
        return if after.is_empty() {
            MarkerMatch::Partial
        } else {
            MarkerMatch::None
        };
    }
    if tag_len > MAX_TAG_LEN || !after.as_bytes()[0].is_ascii_alphabetic() {
        return MarkerMatch::None;
    }

    let (tag, rest) = after.split_at(tag_len);
    if rest.starts_with(SENTINEL) {
        MarkerMatch::Complete {
            len: SENTINEL.len() * 2 + tag_len,
            marker: OpenMarker::Sentinel {
                tag: tag.to_string(),
            },
        }
    } else if SENTINEL.starts_with(rest) {
        // Covers both "" and a lone "§" at the end of the buffer.
        MarkerMatch::Partial
    } else {
        MarkerMatch::None
    }
}

fn match_function_opener(tail: &str) -> MarkerMatch {
    if tail.starts_with(FUNC_START) {
        MarkerMatch::Complete {
            len: FUNC_START.len(),
            marker: OpenMarker::FunctionCall,
        }
    } else if FUNC_START.starts_with(tail) {
        MarkerMatch::Partial
    } else {
        MarkerMatch::None
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<Segment> {
        let mut extractor = DirectiveExtractor::new();
        let mut segments = Vec::new();
        for chunk in chunks {
            segments.extend(extractor.push(chunk));
        }
        segments.extend(extractor.finish());
        merge_text(segments)
    }

    fn merge_text(segments: Vec<Segment>) -> Vec<Segment> {
        let mut merged: Vec<Segment> = Vec::new();
        for segment in segments {
            match (merged.last_mut(), segment) {
                (Some(Segment::Text(last)), Segment::Text(text)) => last.push_str(&text),
                (_, segment) => merged.push(segment),
            }
        }
        merged
    }

    fn reconstruct(segments: &[Segment]) -> String {
        segments
            .iter()
            .map(|segment| match segment {
                Segment::Text(text) => text.clone(),
                Segment::Directive(directive) => directive.to_sentinel_text(),
            })
            .collect()
    }

    #[test]
    fn test_markdown_split_across_chunks() {
        let segments = run(&["§§markdown§§Hel", "lo§§/markdown§§ world"]);
        assert_eq!(
            segments,
            vec![
                Segment::Directive(Directive::sentinel("markdown", "Hello")),
                Segment::Text(" world".to_string()),
            ]
        );
    }

    #[test]
    fn test_text_is_emitted_before_directive_closes() {
        let mut extractor = DirectiveExtractor::new();
        let first = extractor.push("Intro ");
        assert_eq!(first, vec![Segment::Text("Intro ".to_string())]);

        let second = extractor.push("§§mermaid§§graph TD");
        assert!(second.is_empty());
        assert!(extractor.in_directive());
        assert_eq!(extractor.carry_over(), "§§mermaid§§graph TD");

        let third = extractor.push("; A-->B§§/mermaid§§");
        assert_eq!(
            third,
            vec![Segment::Directive(Directive::sentinel(
                "mermaid",
                "graph TD; A-->B"
            ))]
        );
        assert_eq!(extractor.carry_over(), "");
    }

    #[test]
    fn test_every_split_point_gives_same_result() {
        let full = "Intro §§markdown§§# Doc\n\n| a | b |§§/markdown§§ then \
                    §§mermaid§§graph LR; X-->Y§§/mermaid§§ and ünïcödé § done §§/markdown§§";
        let expected = run(&[full]);
        assert_eq!(reconstruct(&expected), full);

        let boundaries: Vec<usize> = full.char_indices().map(|(i, _)| i).collect();
        for &split in &boundaries {
            let (a, b) = full.split_at(split);
            let segments = run(&[a, b]);
            assert_eq!(segments, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_char_by_char_feed_dispatches_each_directive_once() {
        let full = "a§§markdown§§x§§/markdown§§b§§netlistsvg§§{}§§/netlistsvg§§c";
        let chars: Vec<String> = full.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        let segments = run(&refs);

        let directives: Vec<_> = segments
            .iter()
            .filter(|s| matches!(s, Segment::Directive(_)))
            .collect();
        assert_eq!(directives.len(), 2);
        assert_eq!(reconstruct(&segments), full);
    }

    #[test]
    fn test_lossless_at_every_pause_point() {
        let full = "pre §§markdown§§body§§/markdown§§ mid §§mer";
        let mut extractor = DirectiveExtractor::new();
        let mut emitted = String::new();
        let mut received = String::new();
        for ch in full.chars() {
            let piece = ch.to_string();
            received.push_str(&piece);
            for segment in extractor.push(&piece) {
                emitted.push_str(&reconstruct(&[segment]));
            }
            assert_eq!(format!("{emitted}{}", extractor.carry_over()), received);
        }
    }

    #[test]
    fn test_flush_surfaces_carry_over_and_starts_fresh() {
        let mut extractor = DirectiveExtractor::new();
        extractor.push("see §§mermaid§§graph");
        assert!(extractor.in_directive());

        let segments = extractor.flush();
        assert_eq!(segments, vec![Segment::Text("§§mermaid§§graph".to_string())]);
        assert!(!extractor.in_directive());
        assert_eq!(extractor.carry_over(), "");

        let segments = extractor.push(" TD§§/mermaid§§ done");
        assert!(segments.iter().all(|s| matches!(s, Segment::Text(_))));
        assert_eq!(reconstruct(&segments), " TD§§/mermaid§§ done");
    }

    #[test]
    fn test_partial_opener_is_held_back() {
        let mut extractor = DirectiveExtractor::new();
        let segments = extractor.push("Hello §");
        assert_eq!(segments, vec![Segment::Text("Hello ".to_string())]);
        assert_eq!(extractor.carry_over(), "§");

        let segments = extractor.push("§mermaid§§x§§/mermaid§§");
        assert_eq!(
            segments,
            vec![Segment::Directive(Directive::sentinel("mermaid", "x"))]
        );
    }

    #[test]
    fn test_lone_section_sign_becomes_text() {
        let segments = run(&["See §", " 4.2 for details"]);
        assert_eq!(
            segments,
            vec![Segment::Text("See § 4.2 for details".to_string())]
        );
    }

    #[test]
    fn test_stray_closer_is_text() {
        let segments = run(&["oops §§/markdown§§ here"]);
        assert_eq!(
            segments,
            vec![Segment::Text("oops §§/markdown§§ here".to_string())]
        );
    }

    #[test]
    fn test_unclosed_directive_flushes_as_text() {
        let segments = run(&["before §§markdown§§never ", "closed"]);
        assert_eq!(
            segments,
            vec![Segment::Text(
                "before §§markdown§§never closed".to_string()
            )]
        );
    }

    #[test]
    fn test_mismatched_closer_keeps_waiting() {
        let mut extractor = DirectiveExtractor::new();
        let segments = extractor.push("§§markdown§§a§§/mermaid§§b");
        assert!(segments.is_empty());
        let segments = extractor.push("§§/markdown§§");
        assert_eq!(
            segments,
            vec![Segment::Directive(Directive::sentinel(
                "markdown",
                "a§§/mermaid§§b"
            ))]
        );
    }

    #[test]
    fn test_unknown_tag_is_unrecognized_directive() {
        let segments = run(&["§§plantuml§§@startuml§§/plantuml§§"]);
        let Segment::Directive(directive) = &segments[0] else {
            panic!("expected directive, got {segments:?}");
        };
        assert_eq!(
            directive.kind,
            DirectiveKind::Unrecognized("plantuml".to_string())
        );
    }

    #[test]
    fn test_overlong_tag_is_not_held_back() {
        let long = "a".repeat(MAX_TAG_LEN + 1);
        let mut extractor = DirectiveExtractor::new();
        let segments = extractor.push(&format!("§§{long}"));
        assert_eq!(segments, vec![Segment::Text(format!("§§{long}"))]);
        assert_eq!(extractor.carry_over(), "");
    }

    #[test]
    fn test_function_markers() {
        let segments = run(&[
            "Here: #FUNC_START#{\"name\":\"generateGraph\",",
            "\"arguments\":{\"code\":\"graph TD\",\"type\":\"mermaid\"}}#FUNC_E",
            "ND# done",
        ]);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::Text("Here: ".to_string()));
        let Segment::Directive(directive) = &segments[1] else {
            panic!("expected directive");
        };
        assert_eq!(directive.kind, DirectiveKind::Mermaid);
        assert_eq!(directive.payload, "graph TD");
        assert_eq!(directive.function_name(), Some("generateGraph"));
        assert_eq!(segments[2], Segment::Text(" done".to_string()));
    }

    #[test]
    fn test_malformed_function_marker_payload() {
        let segments = run(&["#FUNC_START#{broken#FUNC_END#"]);
        let Segment::Directive(directive) = &segments[0] else {
            panic!("expected directive");
        };
        assert_eq!(
            directive.kind,
            DirectiveKind::Unrecognized("function_call".to_string())
        );
        assert_eq!(directive.payload, "{broken");
    }

    #[test]
    fn test_hash_in_text_is_not_held_back() {
        let mut extractor = DirectiveExtractor::new();
        let segments = extractor.push("# Heading\n");
        assert_eq!(segments, vec![Segment::Text("# Heading\n".to_string())]);
        assert_eq!(extractor.carry_over(), "");
    }

    #[test]
    fn test_closer_split_mid_character() {
        let mut extractor = DirectiveExtractor::new();
        assert!(extractor.push("§§markdown§§body§").is_empty());
        assert!(extractor.push("§/mark").is_empty());
        let segments = extractor.push("down§§");
        assert_eq!(
            segments,
            vec![Segment::Directive(Directive::sentinel("markdown", "body"))]
        );
    }
}
