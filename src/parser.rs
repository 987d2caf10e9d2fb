use crate::{
    ast::{ArithOp, CompareOp, Expr, TEST_NAMES},
    error::{ParseError, ParseErrorKind},
    value::Value,
};

type ParseResult<T> = Result<T, ParseError>;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
}

#[inline]
const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

#[inline]
const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

impl<'a> Parser<'a> {
    const fn new(input: &'a str) -> Self {
        Parser {
            input,
            pos: 0,
            line: 1,
            line_start_pos: 0,
        }
    }

    #[inline]
    fn current_column(&self) -> usize {
        self.input
            .get(self.line_start_pos..self.pos)
            .map_or(0, |line| line.chars().count())
            .saturating_add(1)
    }

    #[inline]
    fn make_error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            line: self.line,
            column: self.current_column(),
            kind,
        }
    }

    #[inline]
    fn rest(&self) -> &'a str {
        self.input.get(self.pos..).unwrap_or_default()
    }

    #[inline]
    fn current_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Advances the parser position past `current_char`, updating line
    /// tracking when it is a newline.
    #[inline]
    fn advance_by_char(&mut self, current_char: char) {
        let char_len = current_char.len_utf8();
        if current_char == '\n' {
            self.line = self.line.saturating_add(1);
            self.line_start_pos = self.pos.saturating_add(char_len);
        }
        self.pos = self.pos.saturating_add(char_len);
    }

    /// Advances the parser position by `len` bytes of text without newlines.
    #[inline]
    const fn advance_bytes_no_newline(&mut self, len: usize) {
        self.pos = self.pos.saturating_add(len);
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// Peek if the remaining input starts with `s`
    fn peek(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    /// Peek for a keyword: `s` followed by something that cannot continue an
    /// identifier.
    fn peek_keyword(&self, s: &str) -> bool {
        self.peek(s)
            && !self
                .rest()
                .get(s.len()..)
                .and_then(|r| r.chars().next())
                .is_some_and(is_ident_char)
    }

    /// Consume `s` if the remaining input starts with it.
    /// Assumes `s` does not contain newlines.
    fn consume(&mut self, s: &str) -> bool {
        if self.peek(s) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    fn consume_keyword(&mut self, s: &str) -> bool {
        if self.peek_keyword(s) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    /// Consume `s` unless it is immediately followed by one of `not_before`,
    /// so that e.g. `|` is not taken from `||`.
    fn consume_op(&mut self, s: &str, not_before: &[char]) -> bool {
        let follows = self
            .rest()
            .get(s.len()..)
            .and_then(|r| r.chars().next());
        if self.peek(s) && !follows.is_some_and(|c| not_before.contains(&c)) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    fn consume_whitespace(&mut self) {
        while let Some(current_char) = self.current_char() {
            if !current_char.is_whitespace() {
                break;
            }
            self.advance_by_char(current_char);
        }
    }

    /// Expect `s` to be the start of the remaining input, consume it or return Err.
    fn expect(&mut self, s: &str) -> ParseResult<()> {
        self.consume_whitespace();
        if self.consume(s) {
            return Ok(());
        }
        if self.eof() {
            return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(s.to_string()))));
        }
        let found: String = self.rest().chars().take(s.len().saturating_add(10)).collect();
        Err(self.make_error(ParseErrorKind::UnexpectedToken {
            expected: format!("'{}'", s),
            found: format!("'{}'", found),
        }))
    }

    /// Consume and return an identifier (alphanumeric + '_' + '$').
    fn consume_identifier(&mut self) -> ParseResult<&'a str> {
        self.consume_whitespace();
        let start = self.pos;
        match self.current_char() {
            Some(c) if is_ident_start(c) => {}
            Some(c) => {
                return Err(self.make_error(ParseErrorKind::InvalidIdentifier {
                    at_char: c.to_string(),
                }));
            }
            None => {
                return Err(self.make_error(ParseErrorKind::Expected {
                    description: "identifier".to_string(),
                }));
            }
        }
        while let Some(c) = self.current_char() {
            if !is_ident_char(c) {
                break;
            }
            self.advance_by_char(c);
        }
        Ok(self.input.get(start..self.pos).unwrap_or_default())
    }

    // --- Expression Parsing (Recursive Descent) ---
    // Precedence: conditional -> OR -> AND -> NOT -> comparison -> additive
    // -> multiplicative -> unary -> postfix -> primary

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.parse_conditional()
    }

    // Handles `a if cond else b`
    fn parse_conditional(&mut self) -> ParseResult<Expr> {
        let then = self.parse_or_expression()?;
        self.consume_whitespace();
        if !self.consume_keyword("if") {
            return Ok(then);
        }
        let condition = self.parse_or_expression()?;
        self.consume_whitespace();
        let otherwise = if self.consume_keyword("else") {
            Some(Box::new(self.parse_conditional()?))
        } else {
            None
        };
        Ok(Expr::Conditional {
            then: Box::new(then),
            condition: Box::new(condition),
            otherwise,
        })
    }

    // Handles OR (`or`, `||`)
    fn parse_or_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and_expression()?;
        loop {
            self.consume_whitespace();
            if self.consume_keyword("or") || self.consume("||") {
                let right = self.parse_and_expression()?;
                left = Expr::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            } else {
                break;
            }
        }
        Ok(left)
    }

    // Handles AND (`and`, `&&`)
    fn parse_and_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not_expression()?;
        loop {
            self.consume_whitespace();
            if self.consume_keyword("and") || self.consume("&&") {
                let right = self.parse_not_expression()?;
                left = Expr::And {
                    left: Box::new(left),
                    right: Box::new(right),
                };
            } else {
                break;
            }
        }
        Ok(left)
    }

    // Handles NOT (`not`, `!`)
    fn parse_not_expression(&mut self) -> ParseResult<Expr> {
        self.consume_whitespace();
        if self.consume_keyword("not") || self.consume_op("!", &['=']) {
            let condition = self.parse_not_expression()?;
            Ok(Expr::Not(Box::new(condition)))
        } else {
            self.parse_compare_expression()
        }
    }

    fn parse_compare_op(&mut self) -> Option<CompareOp> {
        const OPS: [(&str, CompareOp); 6] = [
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            ("<=", CompareOp::Le),
            (">=", CompareOp::Ge),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
        ];
        OPS.iter()
            .find(|(text, _)| self.consume(text))
            .map(|(_, op)| *op)
    }

    /// Consumes `not in`, allowing any whitespace between the two words.
    fn consume_not_in(&mut self) -> bool {
        if !self.peek_keyword("not") {
            return false;
        }
        let (pos, line, line_start_pos) = (self.pos, self.line, self.line_start_pos);
        self.advance_bytes_no_newline("not".len());
        self.consume_whitespace();
        if self.consume_keyword("in") {
            return true;
        }
        self.pos = pos;
        self.line = line;
        self.line_start_pos = line_start_pos;
        false
    }

    fn parse_compare_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_additive_expression()?;
        loop {
            self.consume_whitespace();
            if let Some(op) = self.parse_compare_op() {
                let right = self.parse_additive_expression()?;
                left = Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            } else if self.consume_keyword("is") {
                left = self.parse_test(left)?;
            } else if self.peek_keyword("in") || self.peek_keyword("not") {
                let negated = if self.consume_keyword("in") {
                    false
                } else if self.consume_not_in() {
                    true
                } else {
                    break;
                };
                let container = self.parse_additive_expression()?;
                left = Expr::In {
                    item: Box::new(left),
                    container: Box::new(container),
                    negated,
                };
            } else {
                break;
            }
        }
        Ok(left)
    }

    // After `is`: a named test, or plain equality against the operand.
    fn parse_test(&mut self, target: Expr) -> ParseResult<Expr> {
        self.consume_whitespace();
        let negated = self.consume_keyword("not");
        self.consume_whitespace();
        if let Some(name) = TEST_NAMES.iter().find(|name| self.peek_keyword(name)) {
            self.advance_bytes_no_newline(name.len());
            self.consume_whitespace();
            let args = if self.consume("(") {
                self.parse_list(")")?
            } else {
                Vec::new()
            };
            return Ok(Expr::Test {
                target: Box::new(target),
                name: (*name).to_string(),
                args,
                negated,
            });
        }
        let right = self.parse_additive_expression()?;
        Ok(Expr::Compare {
            op: if negated { CompareOp::Ne } else { CompareOp::Eq },
            left: Box::new(target),
            right: Box::new(right),
        })
    }

    fn parse_additive_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative_expression()?;
        loop {
            self.consume_whitespace();
            let op = if self.consume("+") {
                ArithOp::Add
            } else if self.consume("-") {
                ArithOp::Sub
            } else if self.consume("~") {
                ArithOp::Concat
            } else {
                break;
            };
            let right = self.parse_multiplicative_expression()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative_expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary_expression()?;
        loop {
            self.consume_whitespace();
            let op = if self.consume("*") {
                ArithOp::Mul
            } else if self.consume("/") {
                ArithOp::Div
            } else if self.consume("%") {
                ArithOp::Rem
            } else {
                break;
            };
            let right = self.parse_unary_expression()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> ParseResult<Expr> {
        self.consume_whitespace();
        if self.consume("-") {
            let operand = self.parse_unary_expression()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        if self.consume("+") {
            return self.parse_unary_expression();
        }
        self.parse_postfix_expression()
    }

    /// Comma separated expressions up to (and including) `close`.
    fn parse_list(&mut self, close: &str) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        self.consume_whitespace();
        if self.consume(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_expression()?);
            self.consume_whitespace();
            if self.consume(",") {
                self.consume_whitespace();
                // Trailing comma
                if self.consume(close) {
                    return Ok(items);
                }
                continue;
            }
            self.expect(close)?;
            return Ok(items);
        }
    }

    fn parse_postfix_expression(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary_expression()?;
        loop {
            self.consume_whitespace();
            if self.consume(".") {
                let start = self.pos;
                while let Some(c) = self.current_char() {
                    if !is_ident_char(c) {
                        break;
                    }
                    self.advance_by_char(c);
                }
                if start == self.pos {
                    return Err(self.make_error(ParseErrorKind::Expected {
                        description: "attribute name after '.'".to_string(),
                    }));
                }
                expr = Expr::Attribute {
                    target: Box::new(expr),
                    name: self.input.get(start..self.pos).unwrap_or_default().to_string(),
                };
            } else if self.consume("[") {
                let index = self.parse_expression()?;
                self.expect("]")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.consume("(") {
                let args = self.parse_list(")")?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else if self.consume_op("|", &['|']) {
                let name = self.consume_identifier()?.to_string();
                self.consume_whitespace();
                let args = if self.consume("(") {
                    self.parse_list(")")?
                } else {
                    Vec::new()
                };
                expr = Expr::Filter {
                    target: Box::new(expr),
                    name,
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_number(&mut self) -> ParseResult<Expr> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(c) = self.current_char() {
            let next_is_digit = self
                .rest()
                .get(1..)
                .and_then(|r| r.chars().next())
                .is_some_and(|n| n.is_ascii_digit());
            if c.is_ascii_digit() || c == '_' {
                self.advance_by_char(c);
            } else if c == '.' && !seen_dot && next_is_digit {
                seen_dot = true;
                self.advance_by_char(c);
            } else {
                break;
            }
        }
        let text: String = self
            .input
            .get(start..self.pos)
            .unwrap_or_default()
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let value = if seen_dot {
            text.parse::<f64>().map(Value::Float).ok()
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .ok()
                .or_else(|| text.parse::<f64>().map(Value::Float).ok())
        };
        value.map(Expr::Literal).ok_or_else(|| {
            self.make_error(ParseErrorKind::Message(format!("invalid number '{}'", text)))
        })
    }

    fn parse_string(&mut self, quote: char) -> ParseResult<Expr> {
        self.advance_by_char(quote);
        let mut value = String::new();
        loop {
            let Some(c) = self.current_char() else {
                return Err(self.make_error(ParseErrorKind::unexpected_eof(Some(quote.to_string()))));
            };
            self.advance_by_char(c);
            if c == quote {
                return Ok(Expr::Literal(Value::String(value)));
            }
            if c != '\\' {
                value.push(c);
                continue;
            }
            let Some(escaped) = self.current_char() else {
                continue;
            };
            self.advance_by_char(escaped);
            match escaped {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                other => value.push(other),
            }
        }
    }

    fn parse_primary_expression(&mut self) -> ParseResult<Expr> {
        self.consume_whitespace();
        let Some(c) = self.current_char() else {
            return Err(self.make_error(ParseErrorKind::unexpected_eof(Some("expression".to_string()))));
        };
        match c {
            '0'..='9' => self.parse_number(),
            '"' | '\'' => self.parse_string(c),
            '[' => {
                self.advance_by_char(c);
                Ok(Expr::Array(self.parse_list("]")?))
            }
            '(' => {
                self.advance_by_char(c);
                let inner = self.parse_expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            _ => {
                let name = self.consume_identifier()?;
                Ok(match name {
                    "true" | "True" => Expr::Literal(Value::Bool(true)),
                    "false" | "False" => Expr::Literal(Value::Bool(false)),
                    "null" | "nil" | "none" | "None" | "undefined" => Expr::Literal(Value::Null),
                    _ => Expr::Variable(name.to_string()),
                })
            }
        }
    }
}

/// Parses a complete expression string.
pub(crate) fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::new(input);
    let expr = parser.parse_expression()?;
    parser.consume_whitespace();

    if !parser.eof() {
        return Err(parser.make_error(ParseErrorKind::Message(format!(
            "Parser did not consume entire input. Remaining: '{}'",
            parser.rest()
        ))));
    }

    Ok(expr)
}


#[cfg(test)]
mod tests {
    use super::*;

    // Helper macros for quick AST node creation in tests
    macro_rules! var {
        ($name:expr) => {
            Expr::Variable($name.to_string())
        };
    }
    macro_rules! lit {
        ($value:expr) => {
            Expr::Literal(Value::from($value))
        };
    }

    fn boxed(expr: Expr) -> Box<Expr> {
        Box::new(expr)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_simple_variable() {
        assert_eq!(parse_expression("  name ").unwrap(), var!("name"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_literals() {
        assert_eq!(parse_expression("42").unwrap(), lit!(42));
        assert_eq!(parse_expression("2.5").unwrap(), lit!(2.5));
        assert_eq!(parse_expression("'it\\'s'").unwrap(), lit!("it's"));
        assert_eq!(parse_expression("\"a\\nb\"").unwrap(), lit!("a\nb"));
        assert_eq!(parse_expression("true").unwrap(), lit!(true));
        assert_eq!(parse_expression("null").unwrap(), Expr::Literal(Value::Null));
        assert_eq!(
            parse_expression("[1, 'two',]").unwrap(),
            Expr::Array(vec![lit!(1), lit!("two")])
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dotted_path_and_index() {
        assert_eq!(
            parse_expression("user.address[0]").unwrap(),
            Expr::Index {
                target: boxed(Expr::Attribute {
                    target: boxed(var!("user")),
                    name: "address".to_string(),
                }),
                index: boxed(lit!(0)),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filter_chain_with_args() {
        assert_eq!(
            parse_expression("name | trim | replace('a', \"b\")").unwrap(),
            Expr::Filter {
                target: boxed(Expr::Filter {
                    target: boxed(var!("name")),
                    name: "trim".to_string(),
                    args: vec![],
                }),
                name: "replace".to_string(),
                args: vec![lit!("a"), lit!("b")],
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_function_call() {
        assert_eq!(
            parse_expression("range(1, 3)").unwrap(),
            Expr::Call {
                callee: boxed(var!("range")),
                args: vec![lit!(1), lit!(3)],
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_condition_precedence_and_then_or() {
        // a or b and c => a or (b and c)
        assert_eq!(
            parse_expression("a or b and c").unwrap(),
            Expr::Or {
                left: boxed(var!("a")),
                right: boxed(Expr::And {
                    left: boxed(var!("b")),
                    right: boxed(var!("c")),
                }),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_condition_not_binds_tighter_than_and() {
        assert_eq!(
            parse_expression("!a && b").unwrap(),
            Expr::And {
                left: boxed(Expr::Not(boxed(var!("a")))),
                right: boxed(var!("b")),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_comparison_and_arithmetic() {
        assert_eq!(
            parse_expression("a + 1 * 2 >= 3").unwrap(),
            Expr::Compare {
                op: CompareOp::Ge,
                left: boxed(Expr::Arith {
                    op: ArithOp::Add,
                    left: boxed(var!("a")),
                    right: boxed(Expr::Arith {
                        op: ArithOp::Mul,
                        left: boxed(lit!(1)),
                        right: boxed(lit!(2)),
                    }),
                }),
                right: boxed(lit!(3)),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_membership() {
        assert_eq!(
            parse_expression("x not in items").unwrap(),
            Expr::In {
                item: boxed(var!("x")),
                container: boxed(var!("items")),
                negated: true,
            }
        );
        assert_eq!(
            parse_expression("x in items").unwrap(),
            Expr::In {
                item: boxed(var!("x")),
                container: boxed(var!("items")),
                negated: false,
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_is_tests() {
        assert_eq!(
            parse_expression("n is divisibleby(3)").unwrap(),
            Expr::Test {
                target: boxed(var!("n")),
                name: "divisibleby".to_string(),
                args: vec![lit!(3)],
                negated: false,
            }
        );
        assert_eq!(
            parse_expression("user is not defined").unwrap(),
            Expr::Test {
                target: boxed(var!("user")),
                name: "defined".to_string(),
                args: vec![],
                negated: true,
            }
        );
        // Unknown test names fall back to equality
        assert_eq!(
            parse_expression("a is b").unwrap(),
            Expr::Compare {
                op: CompareOp::Eq,
                left: boxed(var!("a")),
                right: boxed(var!("b")),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_conditional() {
        assert_eq!(
            parse_expression("'y' if ok else 'n'").unwrap(),
            Expr::Conditional {
                then: boxed(lit!("y")),
                condition: boxed(var!("ok")),
                otherwise: Some(boxed(lit!("n"))),
            }
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_incomplete_and() {
        let err = parse_expression("a and").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 6);
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedEOF { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_trailing_garbage() {
        let err = parse_expression("a b").unwrap_err();
        assert_eq!(err.column, 3);
        assert!(matches!(err.kind, ParseErrorKind::Message(_)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_column_counts_characters() {
        let err = parse_expression("'ééé' b").unwrap_err();
        assert_eq!(err.column, 7);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unterminated_string() {
        let err = parse_expression("'abc").unwrap_err();
        assert!(matches!(err.kind, ParseErrorKind::UnexpectedEOF { .. }));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_super_call_parses() {
        assert_eq!(
            parse_expression("super()").unwrap(),
            Expr::Call {
                callee: boxed(var!("super")),
                args: vec![],
            }
        );
    }
}
