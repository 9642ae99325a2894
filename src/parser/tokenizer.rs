//! Hand-written lazy tokenizer for the DSL.
//!
//! Tokens carry their source text and position (1-based line, 0-based
//! column). The iterator yields `Result` so a bad character surfaces as a
//! positioned `ParseError` exactly where scanning stopped.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::ParseError;

pub const KEYWORDS: &[&str] = &[
    "and", "or", "not", "if", "piecewise", "use", "as", "in", "bind", "label", "dot",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    Ident,
    Keyword,
    Plus,
    Minus,
    Star,
    Slash,
    /// `//`, floored division.
    SlashSlash,
    Percent,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    /// Single `=`.
    Assign,
    Eq,
    NotEq,
    Less,
    LessEq,
    More,
    MoreEq,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based source line.
    pub line: usize,
    /// 0-based character column.
    pub col: usize,
}

pub struct Tokenizer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self::at(text, 1, 0)
    }

    /// Tokenizer for a fragment that starts at a known position inside a
    /// larger source, so token positions stay absolute.
    pub fn at(text: &'a str, line: usize, col: usize) -> Self {
        Self {
            chars: text.chars().peekable(),
            line,
            col,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while matches!(self.chars.peek(), Some(&c) if c != '\n') {
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn take_number(&mut self, first: char) -> Token {
        let (line, col) = (self.line, self.col - 1);
        let mut text = String::from(first);
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
            text.push(self.bump().unwrap_or_default());
        }
        let mut fraction_digits = true;
        if self.chars.peek() == Some(&'.') {
            text.push(self.bump().unwrap_or_default());
            fraction_digits = false;
            while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                text.push(self.bump().unwrap_or_default());
                fraction_digits = true;
            }
        }
        // an exponent needs digits before it; "5.e3" stays "5." + ident
        if fraction_digits && matches!(self.chars.peek(), Some('e') | Some('E')) {
            let mut probe = self.chars.clone();
            probe.next();
            let exponent_ok = match probe.next() {
                Some(c) if c.is_ascii_digit() => true,
                Some('+') | Some('-') => {
                    matches!(probe.next(), Some(c) if c.is_ascii_digit())
                }
                _ => false,
            };
            if exponent_ok {
                text.push(self.bump().unwrap_or_default());
                if matches!(self.chars.peek(), Some('+') | Some('-')) {
                    text.push(self.bump().unwrap_or_default());
                }
                while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                    text.push(self.bump().unwrap_or_default());
                }
            }
        }
        Token {
            kind: TokenKind::Number,
            text,
            line,
            col,
        }
    }

    fn take_word(&mut self, first: char) -> Token {
        let (line, col) = (self.line, self.col - 1);
        let mut text = String::from(first);
        while matches!(self.chars.peek(), Some(&c) if c.is_ascii_alphanumeric() || c == '_') {
            text.push(self.bump().unwrap_or_default());
        }
        let kind = if is_keyword(&text) {
            TokenKind::Keyword
        } else {
            TokenKind::Ident
        };
        Token {
            kind,
            text,
            line,
            col,
        }
    }

    fn follow(&mut self, next: char) -> bool {
        if self.chars.peek() == Some(&next) {
            self.bump();
            true
        } else {
            false
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Result<Token, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.skip_trivia();
        let (line, col) = (self.line, self.col);
        let c = self.bump()?;
        if c.is_ascii_digit() {
            return Some(Ok(self.take_number(c)));
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return Some(Ok(self.take_word(c)));
        }
        let (kind, text) = match c {
            '+' => (TokenKind::Plus, "+"),
            '-' => (TokenKind::Minus, "-"),
            '*' => (TokenKind::Star, "*"),
            '/' => {
                if self.follow('/') {
                    (TokenKind::SlashSlash, "//")
                } else {
                    (TokenKind::Slash, "/")
                }
            }
            '%' => (TokenKind::Percent, "%"),
            '^' => (TokenKind::Caret, "^"),
            '(' => (TokenKind::LParen, "("),
            ')' => (TokenKind::RParen, ")"),
            '[' => (TokenKind::LBracket, "["),
            ']' => (TokenKind::RBracket, "]"),
            ',' => (TokenKind::Comma, ","),
            '.' => (TokenKind::Dot, "."),
            ':' => (TokenKind::Colon, ":"),
            '=' => {
                if self.follow('=') {
                    (TokenKind::Eq, "==")
                } else {
                    (TokenKind::Assign, "=")
                }
            }
            '!' => {
                if self.follow('=') {
                    (TokenKind::NotEq, "!=")
                } else {
                    return Some(Err(ParseError::new(
                        "Syntax error",
                        line,
                        col,
                        "expected '=' after '!'",
                    )));
                }
            }
            '<' => {
                if self.follow('=') {
                    (TokenKind::LessEq, "<=")
                } else {
                    (TokenKind::Less, "<")
                }
            }
            '>' => {
                if self.follow('=') {
                    (TokenKind::MoreEq, ">=")
                } else {
                    (TokenKind::More, ">")
                }
            }
            other => {
                return Some(Err(ParseError::new(
                    "Syntax error",
                    line,
                    col,
                    format!("unexpected character '{other}'"),
                )))
            }
        };
        Some(Ok(Token {
            kind,
            text: text.to_string(),
            line,
            col,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Tokenizer::new(text).map(|t| t.unwrap().kind).collect()
    }

    #[test]
    fn operators_and_positions() {
        let tokens: Vec<Token> = Tokenizer::new("dot(V) = -i // 2")
            .map(|t| t.unwrap())
            .collect();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["dot", "(", "V", ")", "=", "-", "i", "//", "2"]);
        assert_eq!(tokens[0].kind, TokenKind::Keyword);
        assert_eq!(tokens[2].kind, TokenKind::Ident);
        assert_eq!(tokens[0].col, 0);
        assert_eq!(tokens[7].col, 12);
        assert!(tokens.iter().all(|t| t.line == 1));
    }

    #[test]
    fn number_forms() {
        let texts: Vec<String> = Tokenizer::new("5 5. 2.5e+7 1e-3 0.5")
            .map(|t| t.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["5", "5.", "2.5e+7", "1e-3", "0.5"]);
        // an exponent without digits before it is not absorbed
        let texts: Vec<String> = Tokenizer::new("5.e3").map(|t| t.unwrap().text).collect();
        assert_eq!(texts, vec!["5.", "e3"]);
    }

    #[test]
    fn comments_and_lines() {
        let tokens: Vec<Token> = Tokenizer::new("a + b # trailing\n  c")
            .map(|t| t.unwrap())
            .collect();
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "+", "b", "c"]);
        assert_eq!(tokens[3].line, 2);
        assert_eq!(tokens[3].col, 2);
    }

    #[test]
    fn comparison_tokens() {
        assert_eq!(
            kinds("== != <= >= < > ="),
            vec![
                TokenKind::Eq,
                TokenKind::NotEq,
                TokenKind::LessEq,
                TokenKind::MoreEq,
                TokenKind::Less,
                TokenKind::More,
                TokenKind::Assign,
            ]
        );
    }

    #[test]
    fn bad_character_is_positioned() {
        let err = Tokenizer::new("a + $b")
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.col, 4);
    }

    #[test]
    fn fragment_positions_are_absolute() {
        let tokens: Vec<Token> = Tokenizer::at("x + y", 7, 10).map(|t| t.unwrap()).collect();
        assert_eq!(tokens[0].line, 7);
        assert_eq!(tokens[0].col, 10);
        assert_eq!(tokens[2].col, 14);
    }
}
