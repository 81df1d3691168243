//! template expression scanner
//!
//! A single pass lexer over one line of YAML text. It reports
//! - template expression spans (`{{ ... }}`), flagged when they sit inside a quoted scalar
//! - quoted scalar regions (`"..."` / `'...'`)
//! - plain scalar regions (unquoted values and keys)
//!
//! Offsets are byte offsets into the line. All of them lie on `char` boundaries.
//!
//! Quote tracking follows YAML instead of counting quote characters: a quote only opens a
//! quoted scalar where a scalar may begin, so the apostrophe in `it's {{ .x }}` is plain text.
//!
//! Expressions may nest. Delimiter depth is counted and a span ends at the close marker that
//! brings the depth back to zero, `{{ a {{ b }} c }}` is one span.

/// Delimiter pair marking a template expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    open: String,
    close: String,
}

impl Delimiters {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Result<Self, DelimiterError> {
        let open = open.into();
        let close = close.into();

        for marker in [&open, &close] {
            if marker.is_empty() {
                return Err(DelimiterError::Empty);
            }
            if marker
                .chars()
                .any(|c| c.is_whitespace() || c == '"' || c == '\'')
            {
                return Err(DelimiterError::InvalidCharacter(marker.clone()));
            }
        }

        if open == close {
            return Err(DelimiterError::Identical(open));
        }

        Ok(Self { open, close })
    }

    pub fn open(&self) -> &str {
        &self.open
    }

    pub fn close(&self) -> &str {
        &self.close
    }
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            open: "{{".to_string(),
            close: "}}".to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DelimiterError {
    #[error("delimiters must not be empty")]
    Empty,
    #[error("delimiter '{0}' must not contain whitespace or quotes")]
    InvalidCharacter(String),
    #[error("open and close delimiter are both '{0}'")]
    Identical(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    Single,
    Double,
}

impl QuoteStyle {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '"' => Some(QuoteStyle::Double),
            '\'' => Some(QuoteStyle::Single),
            _ => None,
        }
    }
}

/// Half-open byte range `[start, end)` of one template expression, delimiters included
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_new::new)]
pub struct ExpressionSpan {
    pub start: usize,
    pub end: usize,
    /// Style of the quoted scalar enclosing the span, if any
    pub quoted: Option<QuoteStyle>,
}

impl ExpressionSpan {
    pub fn already_quoted(&self) -> bool {
        self.quoted.is_some()
    }

    pub fn text<'l>(&self, line: &'l str) -> &'l str {
        &line[self.start..self.end]
    }
}

/// A quoted scalar including its quote characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedScalar {
    pub start: usize,
    pub end: usize,
    pub style: QuoteStyle,
    /// `false` if the line ended before the closing quote
    pub terminated: bool,
}

impl QuotedScalar {
    /// Value of the scalar with quoting removed
    ///
    /// Returns [None] for unterminated scalars and escape sequences we do not understand.
    pub fn decode(&self, line: &str) -> Option<String> {
        if !self.terminated {
            return None;
        }

        let inner = &line[self.start + 1..self.end - 1];
        match self.style {
            QuoteStyle::Single => Some(inner.replace("''", "'")),
            QuoteStyle::Double => decode_double_quoted(inner),
        }
    }

    /// Valid YAML for a scalar whose expressions contain its own quote character
    ///
    /// `"{{ include "x" . }}"` becomes `"{{ include \"x\" . }}"`, text outside of expressions is
    /// kept as written. Returns [None] when the scalar needs no change. `expressions` must be
    /// the spans inside this scalar, in order.
    pub fn requote(&self, line: &str, expressions: &[ExpressionSpan]) -> Option<String> {
        let needs_escape = |c: char| match self.style {
            QuoteStyle::Double => c == '"' || c == '\\',
            QuoteStyle::Single => c == '\'',
        };

        if !self.terminated
            || !expressions
                .iter()
                .any(|span| span.text(line).contains(needs_escape))
        {
            return None;
        }

        let mut requoted = String::with_capacity(self.end - self.start + 8);
        let mut pos = self.start;
        for span in expressions {
            requoted.push_str(&line[pos..span.start]);
            for c in span.text(line).chars() {
                match self.style {
                    QuoteStyle::Double if needs_escape(c) => requoted.push('\\'),
                    QuoteStyle::Single if needs_escape(c) => requoted.push('\''),
                    _ => {}
                }
                requoted.push(c);
            }
            pos = span.end;
        }
        requoted.push_str(&line[pos..self.end]);

        Some(requoted)
    }
}

/// An unquoted scalar, trailing whitespace excluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainScalar {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexeme {
    Expression(ExpressionSpan),
    Quoted(QuotedScalar),
    Plain(PlainScalar),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("unterminated expression starting at column {}", .start + 1)]
    UnterminatedExpression { start: usize },
}

/// Iterator over the [Lexeme]s of a single line
///
/// Lexemes are produced in order of their end offset: the spans inside a scalar come before
/// the scalar itself. After an error the iterator is exhausted.
pub struct Lexer<'l> {
    line: &'l str,
    delimiters: &'l Delimiters,
    pos: usize,
    quote: Option<(QuoteStyle, usize)>,
    plain: Option<PlainScalar>,
    flow_depth: usize,
    done: bool,
}

impl<'l> Lexer<'l> {
    pub fn new(line: &'l str, delimiters: &'l Delimiters) -> Self {
        Self {
            line,
            delimiters,
            pos: 0,
            quote: None,
            plain: None,
            flow_depth: 0,
            done: false,
        }
    }

    fn rest(&self) -> &'l str {
        &self.line[self.pos..]
    }

    fn next_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// `true` if the character after the current one is whitespace or the end of line
    fn followed_by_space(&self) -> bool {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next().map_or(true, char::is_whitespace)
    }

    fn preceded_by_space(&self) -> bool {
        self.line[..self.pos]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace)
    }

    /// Byte offset after the close marker balancing the open marker at `start`
    fn find_close(&self, start: usize) -> Option<usize> {
        let open = self.delimiters.open();
        let close = self.delimiters.close();

        let mut depth = 0usize;
        let mut i = start;
        while i < self.line.len() {
            let rest = &self.line[i..];
            if rest.starts_with(open) {
                depth += 1;
                i += open.len();
            } else if rest.starts_with(close) {
                depth -= 1;
                i += close.len();
                if depth == 0 {
                    return Some(i);
                }
            } else {
                i += rest.chars().next().map_or(1, char::len_utf8);
            }
        }

        None
    }

    fn extend_plain(&mut self, start: usize, end: usize) {
        match &mut self.plain {
            Some(plain) => plain.end = end,
            None => self.plain = Some(PlainScalar { start, end }),
        }
    }

    fn expression(&mut self) -> Result<Lexeme, ScanError> {
        let start = self.pos;
        let Some(end) = self.find_close(start) else {
            self.done = true;
            return Err(ScanError::UnterminatedExpression { start });
        };

        self.pos = end;
        let quoted = self.quote.map(|(style, _)| style);
        if quoted.is_none() {
            self.extend_plain(start, end);
        }

        let span = ExpressionSpan::new(start, end, quoted);
        tracing::trace!(?span, "expression");
        Ok(Lexeme::Expression(span))
    }

    /// Advance inside a quoted scalar, returning it once closed
    fn quoted(&mut self, style: QuoteStyle, start: usize, c: char) -> Option<Lexeme> {
        match (style, c) {
            (QuoteStyle::Double, '\\') => {
                self.pos += 1;
                if let Some(escaped) = self.next_char() {
                    self.pos += escaped.len_utf8();
                }
                None
            }
            (QuoteStyle::Single, '\'') if self.rest()[1..].starts_with('\'') => {
                self.pos += 2;
                None
            }
            (QuoteStyle::Double, '"') | (QuoteStyle::Single, '\'') => {
                self.pos += 1;
                self.quote = None;
                Some(Lexeme::Quoted(QuotedScalar {
                    start,
                    end: self.pos,
                    style,
                    terminated: true,
                }))
            }
            _ => {
                self.pos += c.len_utf8();
                None
            }
        }
    }

    /// Advance outside of quotes. Returns a lexeme when a plain scalar ends.
    fn unquoted(&mut self, c: char) -> Option<Lexeme> {
        let pos = self.pos;

        let ends_plain = match c {
            ':' => self.followed_by_space(),
            ',' | ']' | '}' => self.flow_depth > 0,
            _ => false,
        };

        if ends_plain {
            if c == ']' || c == '}' {
                self.flow_depth -= 1;
            }
            self.pos += 1;
            return self.plain.take().map(Lexeme::Plain);
        }

        self.pos += c.len_utf8();

        if c.is_whitespace() || self.plain.is_some() {
            if !c.is_whitespace() {
                self.extend_plain(pos, self.pos);
            }
            return None;
        }

        // at the start of a node
        if let Some(style) = QuoteStyle::from_char(c) {
            self.quote = Some((style, pos));
            return None;
        }

        let indicator = self.line[pos + 1..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace);
        match c {
            '[' | '{' => self.flow_depth += 1,
            '-' | '?' if indicator => {}
            _ => self.extend_plain(pos, self.pos),
        }

        None
    }
}

impl<'l> Iterator for Lexer<'l> {
    type Item = Result<Lexeme, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let Some(c) = self.next_char() else {
                self.done = true;
                if let Some((style, start)) = self.quote.take() {
                    return Some(Ok(Lexeme::Quoted(QuotedScalar {
                        start,
                        end: self.line.len(),
                        style,
                        terminated: false,
                    })));
                }
                return self.plain.take().map(|plain| Ok(Lexeme::Plain(plain)));
            };

            if self.rest().starts_with(self.delimiters.open()) {
                return Some(self.expression());
            }

            let lexeme = match self.quote {
                Some((style, start)) => self.quoted(style, start, c),
                None if c == '#' && self.preceded_by_space() => {
                    self.done = true;
                    self.plain.take().map(Lexeme::Plain)
                }
                None => self.unquoted(c),
            };

            if let Some(lexeme) = lexeme {
                return Some(Ok(lexeme));
            }
        }

        None
    }
}

/// Lazily scan `line` for template expressions
pub fn scan<'l>(
    line: &'l str,
    delimiters: &'l Delimiters,
) -> impl Iterator<Item = Result<ExpressionSpan, ScanError>> + 'l {
    Lexer::new(line, delimiters).filter_map(|lexeme| match lexeme {
        Ok(Lexeme::Expression(span)) => Some(Ok(span)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    })
}

/// Encode `value` as the body of a double quoted YAML scalar (without the quotes)
pub fn encode_double_quoted(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => encoded.push_str("\\\\"),
            '"' => encoded.push_str("\\\""),
            c => encoded.push(c),
        }
    }
    encoded
}

fn decode_double_quoted(inner: &str) -> Option<String> {
    let mut decoded = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }

        let escaped = match chars.next()? {
            '\\' => '\\',
            '"' => '"',
            '/' => '/',
            ' ' => ' ',
            '\t' => '\t',
            '0' => '\0',
            'a' => '\u{07}',
            'b' => '\u{08}',
            't' => '\t',
            'n' => '\n',
            'v' => '\u{0B}',
            'f' => '\u{0C}',
            'r' => '\r',
            'e' => '\u{1B}',
            'N' => '\u{85}',
            '_' => '\u{A0}',
            'L' => '\u{2028}',
            'P' => '\u{2029}',
            'x' => decode_hex(&mut chars, 2)?,
            'u' => decode_hex(&mut chars, 4)?,
            'U' => decode_hex(&mut chars, 8)?,
            _ => return None,
        };
        decoded.push(escaped);
    }

    Some(decoded)
}

fn decode_hex(chars: &mut std::str::Chars, digits: usize) -> Option<char> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spans(line: &str) -> Result<Vec<ExpressionSpan>, ScanError> {
        scan(line, &Delimiters::default()).collect()
    }

    fn lexemes(line: &str) -> Vec<Lexeme> {
        let delimiters = Delimiters::default();
        Lexer::new(line, &delimiters)
            .collect::<Result<_, _>>()
            .expect("line must lex")
    }

    #[test]
    fn single_expression() {
        let line = "image: {{ .Values.image }}";
        let spans = spans(line).unwrap();

        assert_eq!(spans, vec![ExpressionSpan::new(7, 26, None)]);
        assert_eq!(spans[0].text(line), "{{ .Values.image }}");
    }

    #[test]
    fn one_span_per_balanced_pair() {
        let line = "image: {{ .Values.repo }}:{{ .Values.tag }} # {{ not scanned";
        let spans = spans(line).unwrap();

        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text(line), "{{ .Values.repo }}");
        assert_eq!(spans[1].text(line), "{{ .Values.tag }}");
    }

    #[test]
    fn quoted_expression() {
        let line = r#"msg: "literal {{ text }}""#;
        let spans = spans(line).unwrap();

        assert_eq!(spans.len(), 1);
        assert!(spans[0].already_quoted());
        assert_eq!(spans[0].quoted, Some(QuoteStyle::Double));
    }

    #[test]
    fn apostrophe_in_plain_scalar_is_not_a_quote() {
        let spans = spans("description: it's {{ .Values.name }}").unwrap();

        assert_eq!(spans.len(), 1);
        assert!(!spans[0].already_quoted());
    }

    #[test]
    fn unterminated_expression() {
        assert_eq!(
            spans("broken: {{ .Values.x"),
            Err(ScanError::UnterminatedExpression { start: 8 })
        );
    }

    #[test]
    fn nested_expression_is_one_span() {
        let line = "value: {{ a {{ b }} c }}";
        let spans = spans(line).unwrap();

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text(line), "{{ a {{ b }} c }}");

        assert_eq!(
            super::scan("value: {{ a {{ b }}", &Delimiters::default()).last(),
            Some(Err(ScanError::UnterminatedExpression { start: 7 }))
        );
    }

    #[test]
    fn scanning_is_repeatable() {
        let line = r#"- {{ .a }}-{{ .b }}: "{{ .c }}" # {{ .d }}"#;
        assert_eq!(spans(line), spans(line));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(spans("# {{ .Values.x").unwrap(), vec![]);
        assert_eq!(spans("   # {{ .Values.x }}").unwrap(), vec![]);
    }

    #[test]
    fn hash_inside_expression_is_not_a_comment() {
        let line = r##"color: {{ .Values.color | default "#fff" }}"##;
        assert_eq!(spans(line).unwrap().len(), 1);
    }

    #[test]
    fn plain_scalars() {
        let line = "- name: {{ .Release.Name }}-web   # trailing";
        let plains: Vec<_> = lexemes(line)
            .into_iter()
            .filter_map(|lexeme| match lexeme {
                Lexeme::Plain(plain) => Some(&line[plain.start..plain.end]),
                _ => None,
            })
            .collect();

        assert_eq!(plains, vec!["name", "{{ .Release.Name }}-web"]);
    }

    #[test]
    fn flow_sequence() {
        let line = r#"args: [{{ .a }}, "b", 'c''d']"#;
        let lexemes = lexemes(line);

        let quoted: Vec<_> = lexemes
            .iter()
            .filter_map(|lexeme| match lexeme {
                Lexeme::Quoted(quoted) => quoted.decode(line),
                _ => None,
            })
            .collect();
        assert_eq!(quoted, vec!["b".to_string(), "c'd".to_string()]);

        assert!(lexemes.contains(&Lexeme::Plain(PlainScalar { start: 7, end: 15 })));
    }

    #[test]
    fn unterminated_quote_is_closed_at_end_of_line() {
        let line = r#"key: "open {{ .x }}"#;
        let last = lexemes(line).pop();

        assert_eq!(
            last,
            Some(Lexeme::Quoted(QuotedScalar {
                start: 5,
                end: line.len(),
                style: QuoteStyle::Double,
                terminated: false,
            }))
        );
    }

    #[test]
    fn double_quoted_decoding() {
        let value = r#"{{ include "x" . }} \ end"#;
        let line = format!("\"{}\"", encode_double_quoted(value));
        let quoted = QuotedScalar {
            start: 0,
            end: line.len(),
            style: QuoteStyle::Double,
            terminated: true,
        };

        assert_eq!(quoted.decode(&line).as_deref(), Some(value));
        assert_eq!(decode_double_quoted(r"\x41é"), Some("Aé".to_string()));
        assert_eq!(decode_double_quoted(r"\q"), None);
    }

    #[test]
    fn requote_expression_quotes() {
        let line = r#"a: "{{ include "x" . }}\t" b: '{{ 'y' }}'"#;
        let mut spans = vec![];
        let mut quoted = vec![];
        for lexeme in lexemes(line) {
            match lexeme {
                Lexeme::Expression(span) => spans.push(span),
                Lexeme::Quoted(scalar) => quoted.push(scalar),
                Lexeme::Plain(_) => {}
            }
        }

        assert_eq!(
            quoted[0].requote(line, &spans[..1]).as_deref(),
            Some(r#""{{ include \"x\" . }}\t""#)
        );
        assert_eq!(
            quoted[1].requote(line, &spans[1..]).as_deref(),
            Some("'{{ ''y'' }}'")
        );

        let valid = r#"a: "{{ .x }}""#;
        let spans = scan(valid, &Delimiters::default())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let scalar = QuotedScalar {
            start: 3,
            end: valid.len(),
            style: QuoteStyle::Double,
            terminated: true,
        };
        assert_eq!(scalar.requote(valid, &spans), None);
    }

    #[test]
    fn custom_delimiters() {
        let delimiters = Delimiters::new("<%", "%>").unwrap();
        let line = "image: <% image %> {{ ignored }}";
        let spans: Vec<_> = scan(line, &delimiters).collect::<Result<_, _>>().unwrap();

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text(line), "<% image %>");
    }

    #[test]
    fn delimiter_validation() {
        assert_eq!(Delimiters::new("", "}}"), Err(DelimiterError::Empty));
        assert_eq!(
            Delimiters::new("{{", "{{"),
            Err(DelimiterError::Identical("{{".to_string()))
        );
        assert!(matches!(
            Delimiters::new("\"", "}}"),
            Err(DelimiterError::InvalidCharacter(_))
        ));
    }
}
