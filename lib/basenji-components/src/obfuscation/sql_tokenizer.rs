//! SQL tokenizer for obfuscation.

use snafu::Snafu;

/// Token types recognized by the SQL tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Id,
    QuotedId,
    String,
    Number,
    BooleanLiteral,
    Null,
    ValueArg,
    Comment,
    Operator,
    Char,
}

/// A token, borrowed from the query being tokenized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
}

/// Tokenization error.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(context(suffix(false)))]
pub enum TokenizeError {
    #[snafu(display("unterminated string starting at byte {}", offset))]
    UnterminatedString { offset: usize },

    #[snafu(display("unterminated quoted identifier starting at byte {}", offset))]
    UnterminatedQuotedId { offset: usize },

    #[snafu(display("unterminated comment starting at byte {}", offset))]
    UnterminatedComment { offset: usize },
}

const TWO_CHAR_OPERATORS: &[&str] = &["<=", ">=", "<>", "!=", "||", "::", ":=", "=>", "->", "<<", ">>"];

/// SQL tokenizer that breaks SQL strings into tokens.
pub struct SqlTokenizer<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> SqlTokenizer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.sql[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.sql[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn bump_while<F: Fn(char) -> bool>(&mut self, f: F) {
        while let Some(c) = self.peek() {
            if !f(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token<'a> {
        Token {
            kind,
            text: &self.sql[start..self.pos],
        }
    }

    /// Scans the next token.
    ///
    /// Returns `Ok(None)` once the input is exhausted.
    pub fn scan(&mut self) -> Result<Option<Token<'a>>, TokenizeError> {
        self.bump_while(char::is_whitespace);

        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let token = match c {
            c if is_leading_letter(c) => self.scan_identifier(start),
            c if c.is_ascii_digit() => self.scan_number(start),
            '.' if self.peek_second().is_some_and(|n| n.is_ascii_digit()) => self.scan_number(start),
            '\'' => self.scan_string(start)?,
            '"' => self.scan_quoted_id(start, '"')?,
            '`' => self.scan_quoted_id(start, '`')?,
            '-' if self.peek_second() == Some('-') => self.scan_comment_to_eol(start),
            '#' => self.scan_comment_to_eol(start),
            '/' if self.peek_second() == Some('*') => self.scan_comment_multiline(start)?,
            '?' => {
                self.bump();
                self.token(TokenKind::ValueArg, start)
            }
            ':' if self.peek_second().is_some_and(is_leading_letter) => {
                self.bump();
                self.bump_while(is_identifier_char);
                self.token(TokenKind::ValueArg, start)
            }
            '$' if self.peek_second().is_some_and(|n| n.is_ascii_digit()) => {
                self.bump();
                self.bump_while(|c| c.is_ascii_digit());
                self.token(TokenKind::ValueArg, start)
            }
            '@' => {
                self.bump();
                self.bump_while(|c| c == '@' || is_identifier_char(c));
                self.token(TokenKind::Id, start)
            }
            _ => self.scan_operator(start),
        };

        Ok(Some(token))
    }

    fn scan_identifier(&mut self, start: usize) -> Token<'a> {
        self.bump_while(is_identifier_char);
        let text = &self.sql[start..self.pos];
        let kind = if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
            TokenKind::BooleanLiteral
        } else if text.eq_ignore_ascii_case("null") {
            TokenKind::Null
        } else {
            TokenKind::Id
        };
        Token { kind, text }
    }

    fn scan_number(&mut self, start: usize) -> Token<'a> {
        loop {
            self.bump_while(|c| c.is_ascii_alphanumeric() || c == '.');
            let exponent = matches!(self.sql[start..self.pos].chars().last(), Some('e' | 'E'));
            match self.peek() {
                Some('+' | '-') if exponent && self.peek_second().is_some_and(|n| n.is_ascii_digit()) => {
                    self.bump();
                }
                _ => break,
            }
        }
        self.token(TokenKind::Number, start)
    }

    fn scan_string(&mut self, start: usize) -> Result<Token<'a>, TokenizeError> {
        self.bump();
        loop {
            match self.bump() {
                None => return UnterminatedString { offset: start }.fail(),
                Some('\\') => {
                    if self.bump().is_none() {
                        return UnterminatedString { offset: start }.fail();
                    }
                }
                Some('\'') => {
                    // A doubled quote is an escaped quote.
                    if self.peek() == Some('\'') {
                        self.bump();
                    } else {
                        return Ok(self.token(TokenKind::String, start));
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn scan_quoted_id(&mut self, start: usize, delim: char) -> Result<Token<'a>, TokenizeError> {
        self.bump();
        loop {
            match self.bump() {
                None => return UnterminatedQuotedId { offset: start }.fail(),
                Some(c) if c == delim => {
                    if self.peek() == Some(delim) {
                        self.bump();
                    } else {
                        return Ok(self.token(TokenKind::QuotedId, start));
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn scan_comment_to_eol(&mut self, start: usize) -> Token<'a> {
        self.bump_while(|c| c != '\n');
        self.token(TokenKind::Comment, start)
    }

    fn scan_comment_multiline(&mut self, start: usize) -> Result<Token<'a>, TokenizeError> {
        match self.sql[self.pos + 2..].find("*/") {
            Some(end) => {
                self.pos += 2 + end + 2;
                Ok(self.token(TokenKind::Comment, start))
            }
            None => UnterminatedComment { offset: start }.fail(),
        }
    }

    fn scan_operator(&mut self, start: usize) -> Token<'a> {
        let rest = &self.sql[start..];
        if let Some(op) = TWO_CHAR_OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            self.pos += op.len();
            return self.token(TokenKind::Operator, start);
        }
        self.bump();
        self.token(TokenKind::Char, start)
    }
}

fn is_leading_letter(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$')
}
