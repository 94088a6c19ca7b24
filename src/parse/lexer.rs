// Definition lexer
// Tokenizes expressions like `average(tas - 273.15, dim='time') ** 2`

use crate::error::SyntaxError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Text(String),
    Identifier(String),

    Plus,   // +
    Minus,  // -
    Star,   // *
    Slash,  // /
    Caret,  // ^ or **
    Assign, // =
    Comma,  // ,
    LParen, // (
    RParen, // )

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Text(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Caret => write!(f, "^"),
            Token::Assign => write!(f, "="),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, chars: input.char_indices().peekable() }
    }

    /// Tokenize the entire input. The last token is always `Eof`.
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    pub fn next_token(&mut self) -> Result<Spanned, SyntaxError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Spanned { token: Token::Eof, position: self.input.len() });
        };

        let token = match ch {
            '+' => self.single(Token::Plus),
            '-' => self.single(Token::Minus),
            '/' => self.single(Token::Slash),
            '^' => self.single(Token::Caret),
            '=' => self.single(Token::Assign),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '*' => {
                self.advance();
                if self.peek_char() == Some('*') {
                    self.advance();
                    Token::Caret
                } else {
                    Token::Star
                }
            }
            '\'' | '"' => self.read_string(pos, ch)?,
            '0'..='9' | '.' => self.read_number(pos)?,
            c if c.is_alphabetic() || c == '_' => self.read_identifier(),
            _ => {
                return Err(SyntaxError {
                    message: "unexpected character".to_string(),
                    token: ch.to_string(),
                    position: pos,
                })
            }
        };

        Ok(Spanned { token, position: pos })
    }

    fn single(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map(|&(i, _)| i).unwrap_or(self.input.len())
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_whitespace()) {
            self.advance();
        }
    }

    fn read_string(&mut self, start: usize, quote: char) -> Result<Token, SyntaxError> {
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, c)) if c == quote => return Ok(Token::Text(value)),
                Some((_, '\\')) => match self.advance() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, c)) => value.push(c),
                    None => break,
                },
                Some((_, c)) => value.push(c),
                None => break,
            }
        }
        Err(SyntaxError {
            message: "unterminated string literal".to_string(),
            token: self.input[start..].to_string(),
            position: start,
        })
    }

    fn read_number(&mut self, start: usize) -> Result<Token, SyntaxError> {
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.advance();
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            self.advance();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.advance();
            }
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let end = self.offset();
        let text = &self.input[start..end];
        text.parse::<f64>().map(Token::Number).map_err(|_| SyntaxError {
            message: "invalid numeric literal".to_string(),
            token: text.to_string(),
            position: start,
        })
    }

    fn read_identifier(&mut self) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Token::Identifier(name)
    }
}
