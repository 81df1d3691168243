//! document escaper/restorer
//!
//! Streams a document line by line through the [Transcoder]. Line endings (`\n`, `\r\n` or
//! none on the last line) are kept byte for byte, so `restore(escape(doc)) == doc`.
//!
//! Block scalar bodies (`key: |`, `- >-`, ...) are literal text to YAML and pass through as is
//! in both directions.
use crate::scanner::ScanError;
use crate::transcode::{Ledger, RestoreMismatch, Transcoder};

/// One manifest file as read from the package, before escaping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDocument {
    text: String,
}

impl TemplateDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lines with their line endings
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.split_inclusive('\n')
    }
}

impl From<String> for TemplateDocument {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for TemplateDocument {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Valid YAML form of a [TemplateDocument] together with the marks needed to restore it
#[derive(Debug, Clone)]
pub struct EscapedDocument {
    text: String,
    ledger: Ledger,
}

impl EscapedDocument {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredDocument {
    pub text: String,
    pub mismatches: Vec<RestoreMismatch>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {error}")]
pub struct EscapeError {
    /// 1-based
    pub line: usize,
    pub error: ScanError,
}

pub fn escape(
    document: &TemplateDocument,
    transcoder: &Transcoder,
) -> Result<EscapedDocument, EscapeError> {
    let mut text = String::with_capacity(document.text().len());
    let mut ledger = Ledger::default();
    let mut blocks = BlockScalars::default();

    for (index, raw) in document.lines().enumerate() {
        let (content, ending) = split_line_ending(raw);
        if blocks.in_body(content) {
            text.push_str(raw);
            continue;
        }
        blocks.observe(content);

        let escaped = transcoder
            .escape_line(content, index + 1, &mut ledger)
            .map_err(|error| EscapeError {
                line: index + 1,
                error,
            })?;
        text.push_str(&escaped);
        text.push_str(ending);
    }

    tracing::debug!(
        escaped = ledger.escaped().count(),
        quoted = ledger.marks().len(),
        "document escaped"
    );

    Ok(EscapedDocument { text, ledger })
}

/// Undo [escape] on `text`, which is the escaped document or the overlay engine's rendition of it
pub fn restore(text: &str, ledger: &Ledger, transcoder: &Transcoder) -> RestoredDocument {
    let mut restored = String::with_capacity(text.len());
    let mut cursor = ledger.cursor();
    let mut blocks = BlockScalars::default();

    for raw in text.split_inclusive('\n') {
        let (content, ending) = split_line_ending(raw);
        if blocks.in_body(content) {
            restored.push_str(raw);
            continue;
        }
        blocks.observe(content);

        restored.push_str(&transcoder.restore_line(content, &mut cursor));
        restored.push_str(ending);
    }

    let mismatches = cursor.into_mismatches();
    for mismatch in &mismatches {
        tracing::warn!(
            line = mismatch.line,
            expression = %mismatch.expression,
            "escaped value missing from overlay output"
        );
    }

    RestoredDocument {
        text: restored,
        mismatches,
    }
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    let content_len = raw
        .strip_suffix("\r\n")
        .or_else(|| raw.strip_suffix('\n'))
        .unwrap_or(raw)
        .len();
    raw.split_at(content_len)
}

/// Tracks whether lines belong to the body of a block scalar
#[derive(Debug, Default)]
struct BlockScalars {
    /// indentation the body has to exceed
    parent_indent: Option<usize>,
}

impl BlockScalars {
    fn in_body(&mut self, content: &str) -> bool {
        let Some(parent_indent) = self.parent_indent else {
            return false;
        };

        if content.trim().is_empty() || indentation(content) > parent_indent {
            return true;
        }

        self.parent_indent = None;
        false
    }

    fn observe(&mut self, content: &str) {
        self.parent_indent = block_header(content);
        if let Some(indent) = self.parent_indent {
            tracing::trace!(indent, content, "block scalar");
        }
    }
}

fn indentation(content: &str) -> usize {
    content.len() - content.trim_start_matches(' ').len()
}

/// Indentation a block scalar body must exceed, if `content` opens one
fn block_header(content: &str) -> Option<usize> {
    if content.trim_start().starts_with('#') {
        return None;
    }

    let value = match content.find(" #") {
        Some(comment) => &content[..comment],
        None => content,
    }
    .trim_end();

    let indicator_start = value.rfind(['|', '>'])?;
    let (head, indicator) = value.split_at(indicator_start);
    if indicator.len() > 3
        || !indicator[1..]
            .chars()
            .all(|c| matches!(c, '+' | '-' | '1'..='9'))
    {
        return None;
    }

    // walk past sequence entries, `- - |`
    let mut column = indentation(head);
    let mut entry_column = None;
    while head[column..].starts_with('-') && head[column + 1..].starts_with(' ') {
        entry_column = Some(column);
        column += 1 + indentation(&head[column + 1..]);
    }

    let node = head[column..].trim_end();
    if node.is_empty() {
        return Some(entry_column.unwrap_or(column));
    }

    node.ends_with(':').then_some(column)
}
