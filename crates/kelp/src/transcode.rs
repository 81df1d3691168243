//! line transcoder
//!
//! Escaping turns every plain scalar that contains a template expression into a double quoted
//! scalar. Restoring removes exactly those quotes again.
//!
//! Escaped text alone does not tell which quotes were added: `image: "{{ .image }}"` may have
//! been written like that by hand. The [Ledger] is the recoverable marker. It lists every
//! expression-bearing quoted scalar of the escaped document in order, tagged with its [Origin].
//! Restore matches quoted scalars by their decoded value, so it keeps working when the overlay
//! engine re-emits a value with a different quote style.
//!
//! Quoted scalars whose expressions contain the quote character (`"{{ include "x" . }}"`) are
//! not valid YAML as written. Escaping encodes those quotes and the ledger keeps the source
//! text to put back.
use crate::scanner::{
    encode_double_quoted, Delimiters, ExpressionSpan, Lexeme, Lexer, QuotedScalar, ScanError,
};

/// Who put the quotes around a scalar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// quoted while escaping
    Added,
    /// quoted in the template source
    Original,
    /// quoted in the template source, with quotes inside expressions encoded while escaping
    ///
    /// Holds the scalar as written in the source.
    Requoted(String),
}

impl Origin {
    /// `true` if escaping changed the scalar
    pub fn is_escaped(&self) -> bool {
        !matches!(self, Origin::Original)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, derive_new::new)]
pub struct Mark {
    /// 1-based line number in the template source
    pub line: usize,
    /// Scalar value without quotes
    pub content: String,
    pub origin: Origin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    marks: Vec<Mark>,
}

impl Ledger {
    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    /// Marks of scalars that escaping changed
    pub fn escaped(&self) -> impl Iterator<Item = &Mark> {
        self.marks.iter().filter(|mark| mark.origin.is_escaped())
    }

    fn push(&mut self, mark: Mark) {
        tracing::trace!(?mark, "ledger");
        self.marks.push(mark);
    }

    pub fn cursor(&self) -> LedgerCursor {
        LedgerCursor {
            marks: &self.marks,
            consumed: vec![false; self.marks.len()],
        }
    }
}

/// Restore progress through a [Ledger]
pub struct LedgerCursor<'l> {
    marks: &'l [Mark],
    consumed: Vec<bool>,
}

impl<'l> LedgerCursor<'l> {
    /// Consume the first pending mark with the given content
    fn take(&mut self, content: &str, escaped_only: bool) -> Option<&'l Mark> {
        let marks = self.marks;
        let index = marks.iter().enumerate().position(|(index, mark)| {
            !self.consumed[index]
                && mark.content == content
                && (!escaped_only || mark.origin.is_escaped())
        })?;

        self.consumed[index] = true;
        Some(&marks[index])
    }

    /// Every escaped mark that was never found
    pub fn into_mismatches(self) -> Vec<RestoreMismatch> {
        self.marks
            .iter()
            .zip(self.consumed)
            .filter(|(mark, consumed)| !consumed && mark.origin.is_escaped())
            .map(|(mark, _)| RestoreMismatch::new(mark.line, mark.content.clone()))
            .collect()
    }
}

/// An escaped scalar that could not be located while restoring
///
/// Non-fatal. The document is still emitted, the scalar stays in whatever form the overlay
/// engine produced (or was removed by it).
#[derive(Debug, Clone, PartialEq, Eq, derive_new::new, serde::Serialize)]
pub struct RestoreMismatch {
    /// 1-based line number in the template source
    pub line: usize,
    pub expression: String,
}

impl std::fmt::Display for RestoreMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "escaped value from line {} not found in overlay output: {}",
            self.line, self.expression
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcoder {
    delimiters: Delimiters,
}

impl Transcoder {
    pub fn new(delimiters: Delimiters) -> Self {
        Self { delimiters }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    /// Quote plain scalars containing expressions, recording every quoted scalar in `ledger`
    ///
    /// `line` must not contain its line ending.
    pub fn escape_line(
        &self,
        line: &str,
        line_number: usize,
        ledger: &mut Ledger,
    ) -> Result<String, ScanError> {
        let mut escaped = String::with_capacity(line.len() + 2);
        let mut copied = 0;
        let mut bare_expression = false;
        let mut quoted_expressions: Vec<ExpressionSpan> = Vec::new();

        for lexeme in Lexer::new(line, &self.delimiters) {
            match lexeme? {
                Lexeme::Expression(span) if span.already_quoted() => quoted_expressions.push(span),
                Lexeme::Expression(_) => bare_expression = true,
                Lexeme::Plain(plain) => {
                    if !std::mem::take(&mut bare_expression) {
                        continue;
                    }

                    let content = &line[plain.start..plain.end];
                    escaped.push_str(&line[copied..plain.start]);
                    escaped.push('"');
                    escaped.push_str(&encode_double_quoted(content));
                    escaped.push('"');
                    copied = plain.end;

                    ledger.push(Mark::new(line_number, content.to_string(), Origin::Added));
                }
                Lexeme::Quoted(quoted) => {
                    let expressions = std::mem::take(&mut quoted_expressions);

                    if let Some(requoted) = quoted.requote(line, &expressions) {
                        let scalar = QuotedScalar {
                            start: 0,
                            end: requoted.len(),
                            ..quoted
                        };
                        if let Some(content) = scalar.decode(&requoted) {
                            let source = line[quoted.start..quoted.end].to_string();
                            escaped.push_str(&line[copied..quoted.start]);
                            escaped.push_str(&requoted);
                            copied = quoted.end;

                            let origin = Origin::Requoted(source);
                            ledger.push(Mark::new(line_number, content, origin));
                            continue;
                        }
                        tracing::debug!(line, "unable to requote scalar");
                    }

                    let Some(content) = quoted.decode(line) else {
                        continue;
                    };
                    if content.contains(self.delimiters.open()) {
                        ledger.push(Mark::new(line_number, content, Origin::Original));
                    }
                }
            }
        }

        escaped.push_str(&line[copied..]);
        Ok(escaped)
    }

    /// Undo [Transcoder::escape_line]
    ///
    /// Lines that do not lex are returned unchanged.
    pub fn restore_line(&self, line: &str, cursor: &mut LedgerCursor) -> String {
        let mut restored = String::with_capacity(line.len());
        let mut copied = 0;
        let mut bare_expression = false;

        for lexeme in Lexer::new(line, &self.delimiters) {
            let lexeme = match lexeme {
                Ok(lexeme) => lexeme,
                Err(error) => {
                    tracing::debug!(%error, line, "not restoring remainder of line");
                    break;
                }
            };

            let (start, end, mark) = match lexeme {
                Lexeme::Expression(span) => {
                    bare_expression |= !span.already_quoted();
                    continue;
                }
                Lexeme::Plain(plain) => {
                    // the engine emitted an escaped value without quotes
                    if !std::mem::take(&mut bare_expression) {
                        continue;
                    }
                    let mark = cursor.take(&line[plain.start..plain.end], true);
                    (plain.start, plain.end, mark)
                }
                Lexeme::Quoted(quoted) => {
                    let Some(content) = quoted.decode(line) else {
                        continue;
                    };
                    if !content.contains(self.delimiters.open()) {
                        continue;
                    }

                    let mark = cursor.take(&content, false);
                    if mark.is_none() {
                        tracing::debug!(%content, "quoted expression not in ledger");
                    }
                    (quoted.start, quoted.end, mark)
                }
            };

            let replacement = match mark.map(|mark| (&mark.origin, &mark.content)) {
                Some((Origin::Added, content)) => content.as_str(),
                Some((Origin::Requoted(source), _)) => source.as_str(),
                Some((Origin::Original, _)) | None => continue,
            };

            restored.push_str(&line[copied..start]);
            restored.push_str(replacement);
            copied = end;
        }

        restored.push_str(&line[copied..]);
        restored
    }
}
