// Definition parser
// Recursive descent over the token stream produced by `Lexer`

use super::lexer::{Lexer, Spanned, Token};
use crate::error::SyntaxError;
use std::fmt;

/// Parsed definition expression. Infix operators become `Call`s named after
/// the operator symbol, so `a + b` is `Call { name: "+", args: [a, b] }`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    /// Bare identifier: an input variable or another definition.
    Operand(String),
    Call { name: String, args: Vec<Expr>, kwargs: Vec<(String, Expr)> },
}

impl Expr {
    pub fn call(name: &str, args: Vec<Expr>) -> Self {
        Expr::Call { name: name.to_string(), args, kwargs: Vec::new() }
    }

    /// Every bare identifier referenced by this expression, in first-seen order.
    pub fn operand_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_operands(&mut out);
        out
    }

    fn collect_operands(&self, out: &mut Vec<String>) {
        match self {
            Expr::Operand(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Call { args, kwargs, .. } => {
                for a in args {
                    a.collect_operands(out);
                }
                for (_, v) in kwargs {
                    v.collect_operands(out);
                }
            }
            Expr::Number(_) | Expr::Text(_) => {}
        }
    }
}

fn is_operator(name: &str) -> bool {
    matches!(name, "+" | "-" | "*" | "/" | "^")
}

/// Canonical, fully parenthesized text. Used for provenance attributes.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Text(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Expr::Operand(name) => write!(f, "{}", name),
            Expr::Call { name, args, kwargs } if is_operator(name) && kwargs.is_empty() => match args.as_slice() {
                [only] => write!(f, "({}{})", name, only),
                [lhs, rhs] => write!(f, "({} {} {})", lhs, name, rhs),
                _ => write_call(f, name, args, kwargs),
            },
            Expr::Call { name, args, kwargs } => write_call(f, name, args, kwargs),
        }
    }
}

fn write_call(f: &mut fmt::Formatter<'_>, name: &str, args: &[Expr], kwargs: &[(String, Expr)]) -> fmt::Result {
    write!(f, "{}(", name)?;
    let mut first = true;
    for a in args {
        if !first { write!(f, ", ")?; }
        first = false;
        write!(f, "{}", a)?;
    }
    for (k, v) in kwargs {
        if !first { write!(f, ", ")?; }
        first = false;
        write!(f, "{}={}", k, v)?;
    }
    write!(f, ")")
}

/// Deepest nesting of parentheses, calls and unary signs accepted.
const MAX_DEPTH: usize = 128;

pub struct ExprParser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self { tokens, position: 0, depth: 0 }
    }

    /// Parse a complete definition string.
    pub fn parse_str(input: &str) -> Result<Expr, SyntaxError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self::new(tokens);
        parser.parse()
    }

    pub fn parse(&mut self) -> Result<Expr, SyntaxError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty expression"));
        }
        let expr = self.parse_additive()?;
        if !self.check(&Token::Eof) {
            return Err(self.error("unexpected token after expression"));
        }
        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Additive: + -          (left)
    // 2. Multiplicative: * /    (left)
    // 3. Unary: + -
    // 4. Power: ^ **            (right, exponent may carry a sign)
    // 5. Primary: literal, identifier, call, ( )

    fn parse_additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => "+",
                Token::Minus => "-",
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::call(op, vec![left, right]);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => "*",
                Token::Slash => "/",
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::call(op, vec![left, right]);
        }
        Ok(left)
    }

    // Every nested subexpression passes through here, so this bounds recursion.
    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.depth == MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let result = self.parse_signed();
        self.depth -= 1;
        result
    }

    fn parse_signed(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(match self.parse_unary()? {
                    Expr::Number(n) => Expr::Number(-n),
                    other => Expr::call("-", vec![other]),
                })
            }
            Token::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_primary()?;
        if self.check(&Token::Caret) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::call("^", vec![base, exponent]));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Text(s) => {
                self.advance();
                Ok(Expr::Text(s))
            }
            Token::Identifier(name) => {
                self.advance();
                if self.check(&Token::LParen) {
                    self.advance();
                    self.parse_call(name)
                } else {
                    Ok(Expr::Operand(name))
                }
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_additive()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            _ => Err(self.error("unexpected token")),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        if self.check(&Token::RParen) {
            self.advance();
            return Ok(Expr::Call { name, args, kwargs });
        }

        loop {
            if let (Token::Identifier(key), Token::Assign) = (self.peek().clone(), self.peek_at(1)) {
                self.advance();
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == key) {
                    return Err(self.error_at(self.position - 2, "duplicate keyword argument"));
                }
                let value = self.parse_additive()?;
                kwargs.push((key, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument after keyword argument"));
                }
                args.push(self.parse_additive()?);
            }

            match self.peek() {
                Token::Comma => {
                    self.advance();
                }
                Token::RParen => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error("expected ',' or ')' in argument list")),
            }
        }

        Ok(Expr::Call { name, args, kwargs })
    }

    // Helpers

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens.get(self.position + ahead).map(|s| &s.token).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), SyntaxError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> SyntaxError {
        self.error_at(self.position, message)
    }

    fn error_at(&self, index: usize, message: &str) -> SyntaxError {
        let (token, position) = match self.tokens.get(index) {
            Some(s) => (s.token.to_string(), s.position),
            None => (Token::Eof.to_string(), self.tokens.last().map(|s| s.position).unwrap_or(0)),
        };
        SyntaxError { message: message.to_string(), token, position }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn op(name: &str) -> Expr {
        Expr::Operand(name.to_string())
    }

    #[rstest]
    #[case("a + b * c", "(a + (b * c))")]
    #[case("a - b - c", "((a - b) - c)")]
    #[case("a / b * c", "((a / b) * c)")]
    #[case("a ^ b ^ c", "(a ^ (b ^ c))")]
    #[case("a ** 2", "(a ^ 2)")]
    #[case("-a ^ 2", "(-(a ^ 2))")]
    #[case("a ^ -2", "(a ^ -2)")]
    #[case("(a + b) * c", "((a + b) * c)")]
    #[case("-3", "-3")]
    #[case("+a", "a")]
    fn test_precedence_and_associativity(#[case] input: &str, #[case] canonical: &str) {
        assert_eq!(ExprParser::parse_str(input).unwrap().to_string(), canonical);
    }

    #[test]
    fn test_call_with_keyword_arguments() {
        let expr = ExprParser::parse_str("average(tas - 273.15, dim='time')").unwrap();
        assert_eq!(
            expr,
            Expr::Call {
                name: "average".into(),
                args: vec![Expr::call("-", vec![op("tas"), Expr::Number(273.15)])],
                kwargs: vec![("dim".into(), Expr::Text("time".into()))],
            }
        );
        assert_eq!(expr.to_string(), "average((tas - 273.15), dim='time')");
    }

    #[test]
    fn test_operand_names_are_unique_in_order() {
        let expr = ExprParser::parse_str("x * y + f(x, z)").unwrap();
        assert_eq!(expr.operand_names(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_error_reports_offending_token() {
        let err = ExprParser::parse_str("a +* b").unwrap_err();
        assert_eq!(err.token, "*");
        assert_eq!(err.position, 3);
    }

    #[rstest]
    #[case("", "empty expression")]
    #[case("(a + b", "expected ')'")]
    #[case("f(a b)", "expected ',' or ')' in argument list")]
    #[case("f(dim='t', a)", "positional argument after keyword argument")]
    #[case("a b", "unexpected token after expression")]
    fn test_malformed_definitions(#[case] input: &str, #[case] message: &str) {
        assert_eq!(ExprParser::parse_str(input).unwrap_err().message, message);
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let text = "sqrt(u^2 + v^2) / 2";
        assert_eq!(ExprParser::parse_str(text), ExprParser::parse_str(text));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let nested = |n: usize| format!("{}x{}", "(".repeat(n), ")".repeat(n));
        assert_eq!(ExprParser::parse_str(&nested(100)).unwrap(), op("x"));

        let err = ExprParser::parse_str(&nested(20_000)).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");
        assert_eq!(err.position, MAX_DEPTH);
        assert!(ExprParser::parse_str(&format!("{}1", "-".repeat(5_000))).is_err());
    }
}
