//! Single-pass tag scanner.
//!
//! Finds every `{{ … }}` and `{% … %}` span in a source string without
//! interpreting what is inside. Tags never nest at this level: a second
//! opener while one is pending is a syntax error, so spans from one scan are
//! ordered and non-overlapping.

use crate::error::{ParseError, ParseErrorKind};

type ScanResult<T> = Result<T, ParseError>;

const OPEN_CHAR: char = '{';
const CLOSE_CHAR: char = '}';

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// `{{ expr }}`
    Expression,
    /// `{% stmt %}`
    Statement,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MarkerType {
    ExpressionStart,
    ExpressionEnd,
    StatementStart,
    StatementEnd,
}

/// One delimiter of the symbol table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub text: &'static str,
    pub kind: TagKind,
    pub marker: MarkerType,
    /// For openers, the closer marker that terminates them.
    pub until: Option<MarkerType>,
}

/// Static mapping of delimiter sequences to tag kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    openers: [Symbol; 2],
    closers: [Symbol; 2],
}

pub static SYMBOLS: SymbolTable = SymbolTable {
    openers: [
        Symbol {
            text: "{{",
            kind: TagKind::Expression,
            marker: MarkerType::ExpressionStart,
            until: Some(MarkerType::ExpressionEnd),
        },
        Symbol {
            text: "{%",
            kind: TagKind::Statement,
            marker: MarkerType::StatementStart,
            until: Some(MarkerType::StatementEnd),
        },
    ],
    closers: [
        Symbol {
            text: "}}",
            kind: TagKind::Expression,
            marker: MarkerType::ExpressionEnd,
            until: None,
        },
        Symbol {
            text: "%}",
            kind: TagKind::Statement,
            marker: MarkerType::StatementEnd,
            until: None,
        },
    ],
};

impl SymbolTable {
    /// The opener starting exactly at byte `pos`, if any.
    fn opener_at(&self, input: &str, pos: usize) -> Option<&Symbol> {
        let rest = input.get(pos..)?;
        self.openers.iter().find(|s| rest.starts_with(s.text))
    }

    /// The closer ending with the byte at `pos`, if any.
    fn closer_ending_at(&self, input: &str, pos: usize) -> Option<&Symbol> {
        let start = pos.checked_sub(1)?;
        let candidate = input.get(start..=pos)?;
        self.closers.iter().find(|s| s.text == candidate)
    }
}

/// A position in the source. `offset` is a byte offset; `row` and `col` are
/// zero-based, with `col` counted in characters.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Marker {
    pub ty: MarkerType,
    pub offset: usize,
    pub row: usize,
    pub col: usize,
}

/// The extent of one tag. `start.offset` is the first byte of the opener and
/// `end.offset` is one past the last byte of the closer.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Marker,
    pub end: Marker,
}

impl Span {
    pub const fn kind(&self) -> TagKind {
        match self.start.ty {
            MarkerType::StatementStart | MarkerType::StatementEnd => TagKind::Statement,
            MarkerType::ExpressionStart | MarkerType::ExpressionEnd => TagKind::Expression,
        }
    }

    pub const fn is_statement(&self) -> bool {
        matches!(self.kind(), TagKind::Statement)
    }

    pub const fn range(&self) -> std::ops::Range<usize> {
        self.start.offset..self.end.offset
    }

    /// The whole tag text, delimiters included.
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        source.get(self.range()).unwrap_or_default()
    }

    /// The trimmed text between the delimiters.
    pub fn inner<'s>(&self, source: &'s str) -> &'s str {
        let from = self.start.offset.saturating_add(2);
        let to = self.end.offset.saturating_sub(2);
        source.get(from..to).map(str::trim).unwrap_or_default()
    }
}

struct Scanner<'a> {
    input: &'a str,
    /// Current line number (0-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
    pending: Option<(Marker, &'static Symbol)>,
    /// First byte after the most recent opener; closers may not overlap it.
    open_end: usize,
    /// First byte after the most recent closer.
    close_end: usize,
    spans: Vec<Span>,
}

impl<'a> Scanner<'a> {
    const fn new(input: &'a str) -> Self {
        Scanner {
            input,
            line: 0,
            line_start_pos: 0,
            pending: None,
            open_end: 0,
            close_end: 0,
            spans: Vec::new(),
        }
    }

    #[inline]
    fn marker(&self, ty: MarkerType, pos: usize) -> Marker {
        Marker {
            ty,
            offset: pos,
            row: self.line,
            col: self
                .input
                .get(self.line_start_pos..pos)
                .map_or(0, |line| line.chars().count()),
        }
    }

    #[inline]
    fn make_error(marker: &Marker, kind: ParseErrorKind) -> ParseError {
        ParseError {
            line: marker.row.saturating_add(1),
            column: marker.col.saturating_add(1),
            kind,
        }
    }

    fn open(&mut self, pos: usize) -> ScanResult<()> {
        if pos < self.open_end {
            return Ok(());
        }
        let Some(symbol) = SYMBOLS.opener_at(self.input, pos) else {
            return Ok(());
        };
        if let Some((pending, open)) = &self.pending {
            return Err(Self::make_error(
                pending,
                ParseErrorKind::UnterminatedTag {
                    open: open.text.to_string(),
                },
            ));
        }
        self.pending = Some((self.marker(symbol.marker, pos), symbol));
        self.open_end = pos.saturating_add(symbol.text.len());
        Ok(())
    }

    fn close(&mut self, pos: usize) -> ScanResult<()> {
        let Some(symbol) = SYMBOLS.closer_ending_at(self.input, pos) else {
            return Ok(());
        };
        let close_start = pos.saturating_sub(1);
        if close_start < self.close_end || (self.pending.is_some() && close_start < self.open_end) {
            return Ok(());
        }
        let end = self.marker(symbol.marker, pos.saturating_add(1));
        let Some((start, open)) = self.pending.take() else {
            return Err(Self::make_error(
                &self.marker(symbol.marker, close_start),
                ParseErrorKind::UnexpectedClose {
                    close: symbol.text.to_string(),
                },
            ));
        };
        if open.until != Some(symbol.marker) {
            return Err(Self::make_error(
                &start,
                ParseErrorKind::MismatchedClose {
                    open: open.text.to_string(),
                    close: symbol.text.to_string(),
                },
            ));
        }
        self.close_end = end.offset;
        self.spans.push(Span { start, end });
        Ok(())
    }

    fn run(mut self) -> ScanResult<Vec<Span>> {
        for (pos, current_char) in self.input.char_indices() {
            match current_char {
                OPEN_CHAR => self.open(pos)?,
                CLOSE_CHAR => self.close(pos)?,
                '\n' => {
                    self.line = self.line.saturating_add(1);
                    self.line_start_pos = pos.saturating_add(1);
                }
                _ => {}
            }
        }

        if let Some((pending, open)) = &self.pending {
            return Err(Self::make_error(
                pending,
                ParseErrorKind::UnterminatedTag {
                    open: open.text.to_string(),
                },
            ));
        }
        Ok(self.spans)
    }
}

/// Scans `source` for tag spans.
///
/// # Errors
/// Returns a [`ParseError`] on an unexpected or mismatched close delimiter, or
/// on a tag left open when another opens or the input ends.
pub fn scan(source: &str) -> Result<Vec<Span>, ParseError> {
    Scanner::new(source).run()
}

/// [`scan`] restricted to statement (`{% %}`) spans.
pub fn scan_statements(source: &str) -> Result<Vec<Span>, ParseError> {
    Ok(scan(source)?.into_iter().filter(Span::is_statement).collect())
}

/// Splits a statement's inner text into its leading keyword and the trimmed
/// remainder, e.g. `"if user and x"` into `("if", "user and x")`.
pub fn keyword_and_rest(inner: &str) -> Option<(&str, &str)> {
    let inner = inner.trim();
    let mut chars = inner.char_indices();
    let (_, first) = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let end = chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(inner.len(), |(i, _)| i);
    let (keyword, rest) = inner.split_at(end);
    Some((keyword, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts<'s>(source: &'s str) -> Vec<&'s str> {
        scan(source).unwrap().iter().map(|s| s.text(source)).collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_plain_text_has_no_spans() {
        assert!(scan("just some text, { and } alone").unwrap().is_empty());
        assert!(scan("").unwrap().is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expression_and_statement_spans() {
        let source = "a {{ name }} b {% if x %}c{% endif %}";
        let spans = scan(source).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].kind(), TagKind::Expression);
        assert_eq!(spans[0].inner(source), "name");
        assert_eq!(spans[1].kind(), TagKind::Statement);
        assert_eq!(spans[1].inner(source), "if x");
        assert_eq!(spans[2].text(source), "{% endif %}");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_spans_are_ordered_and_disjoint() {
        let source = "{{a}}{%b%}\n  {{ c }}x{% d %}{{e}}";
        let spans = scan(source).unwrap();
        assert_eq!(spans.len(), 5);
        for pair in spans.windows(2) {
            assert!(pair[0].start.offset < pair[0].end.offset);
            assert!(pair[0].end.offset <= pair[1].start.offset);
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_rows_and_columns() {
        let source = "line one\n  {{ x }}";
        let spans = scan(source).unwrap();
        assert_eq!(spans[0].start.row, 1);
        assert_eq!(spans[0].start.col, 2);
        assert_eq!(spans[0].start.offset, 11);
        assert_eq!(spans[0].end.offset, source.len());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_triple_braces_do_not_reuse_delimiters() {
        assert_eq!(texts("{{{ x }}}"), vec!["{{{ x }}"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_multibyte_text_is_skipped() {
        let source = "héllo {{ wörld }} ✓";
        let spans = scan(source).unwrap();
        assert_eq!(spans[0].inner(source), "wörld");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unexpected_close() {
        let err = scan("oops }} here").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 6);
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedClose { ref close } if close == "}}"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_columns_count_characters() {
        let err = scan("ééé }}").unwrap_err();
        assert_eq!(err.column, 5);
        let spans = scan("✓ ü\n¿ {{ x }}").unwrap();
        assert_eq!(spans[0].start.row, 1);
        assert_eq!(spans[0].start.col, 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_mismatched_close() {
        let err = scan("\n{% if x }}").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 1);
        assert!(matches!(
            err.kind,
            ParseErrorKind::MismatchedClose { ref open, ref close } if open == "{%" && close == "}}"
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_second_opener_is_unterminated() {
        let err = scan("{{ a {% b %}").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnterminatedTag { ref open } if open == "{{"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_open_at_eof_is_unterminated() {
        let err = scan("text {% if").unwrap_err();
        assert_eq!(err.column, 6);
        assert!(matches!(err.kind, ParseErrorKind::UnterminatedTag { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_scan_is_pure() {
        let source = "{% for x in xs %}{{ x }}{% endfor %}";
        assert_eq!(scan(source).unwrap(), scan(source).unwrap());
        assert_eq!(scan_statements(source).unwrap().len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_keyword_and_rest() {
        assert_eq!(keyword_and_rest("  if user and x "), Some(("if", "user and x")));
        assert_eq!(keyword_and_rest("endfor"), Some(("endfor", "")));
        assert_eq!(keyword_and_rest("super()"), Some(("super", "()")));
        assert_eq!(keyword_and_rest("\"quoted\""), None);
        assert_eq!(keyword_and_rest(""), None);
    }
}
