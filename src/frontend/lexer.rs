use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;
use strum::EnumString;

use super::SourceFile;
use crate::diagnostics::{Location, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub loc: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /* Words */
    Keyword(Keyword), // wait
    Identifier,       // total

    /* Literals */
    NumberLiteral,  // 1 or 1.5
    StringLiteral,  // "hello, world"
    BooleanLiteral, // true

    /* Delimiters */
    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    Semicolon,    // ;
    Comma,        // ,

    /* Unary Ops */
    Bang, // !

    /* Unary + Binary Ops */
    Minus, // -

    /* Binary Ops */
    Plus,                 // +
    Asterisk,             // *
    Divide,               // /
    LogicalAnd,           // &&
    LogicalOr,            // ||
    DoubleEquals,         // ==
    NotEquals,            // !=
    LessThan,             // <
    LessThanOrEqualTo,    // <=
    GreaterThan,          // >
    GreaterThanOrEqualTo, // >=

    /* Other */
    Question, // ?
    Colon,    // :
    Equals,   // =
}

impl TokenKind {
    pub fn is_comparison_operator(&self) -> bool {
        matches!(
            self,
            Self::DoubleEquals
                | Self::NotEquals
                | Self::LessThan
                | Self::LessThanOrEqualTo
                | Self::GreaterThan
                | Self::GreaterThanOrEqualTo
        )
    }

    pub fn is_term_operator(&self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    pub fn is_factor_operator(&self) -> bool {
        matches!(self, Self::Asterisk | Self::Divide)
    }

    pub fn is_unary_operator(&self) -> bool {
        matches!(self, Self::Bang | Self::Minus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Keyword {
    Wait,
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        (';', TokenKind::Semicolon),
        (',', TokenKind::Comma),
        ('?', TokenKind::Question),
        (':', TokenKind::Colon),
        ('+', TokenKind::Plus),
        ('-', TokenKind::Minus),
        ('*', TokenKind::Asterisk),
        ('/', TokenKind::Divide),
        ('!', TokenKind::Bang),
        ('=', TokenKind::Equals),
        ('<', TokenKind::LessThan),
        ('>', TokenKind::GreaterThan),
    ])
});

/// Two char operator sequences, checked before the single char table.
static DOUBLE_TOKENS: Lazy<BTreeMap<(char, char), TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        (('&', '&'), TokenKind::LogicalAnd),
        (('|', '|'), TokenKind::LogicalOr),
        (('=', '='), TokenKind::DoubleEquals),
        (('!', '='), TokenKind::NotEquals),
        (('<', '='), TokenKind::LessThanOrEqualTo),
        (('>', '='), TokenKind::GreaterThanOrEqualTo),
    ])
});

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    chars: PeekNth<Chars<'source>>,
    position: usize,
    line: u32,
    column: u32,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn source(&self) -> &'source SourceFile {
        self.source
    }

    fn location(&self) -> Location {
        Location::new(self.line, self.column)
    }

    /// Where the lexer currently stands; once the stream is exhausted this
    /// is the position just past the last token.
    pub fn location_at_end(&self) -> Location {
        self.location()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;

        self.position += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }

        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
                self.bump();
            }

            if self.chars.peek() == Some(&'/') && self.chars.peek_nth(1) == Some(&'/') {
                while self.chars.peek().is_some_and(|&c| c != '\n') {
                    self.bump();
                }
                continue;
            }

            break;
        }
    }

    /// Produces the next token, or `None` at end of input. Lexical problems
    /// (stray characters, unterminated strings, bad escapes) surface as
    /// `Message`s carrying the offending location.
    pub fn next_token(&mut self) -> Result<Option<Token>, Message> {
        self.skip_whitespace_and_comments();

        let loc = self.location();
        let start = self.position;

        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };

        if c.is_ascii_digit() {
            return Ok(Some(self.lex_number(start, loc)));
        }

        if c.is_alphabetic() || c == '_' {
            return Ok(Some(self.lex_word(start, loc)));
        }

        if c == '"' {
            return self.lex_string(start, loc).map(Some);
        }

        if let Some(&next) = self.chars.peek_nth(1) {
            if let Some(&kind) = DOUBLE_TOKENS.get(&(c, next)) {
                self.bump();
                self.bump();
                return Ok(Some(Token {
                    kind,
                    span: Span::new(start, self.position),
                    loc,
                }));
            }
        }

        if let Some(&kind) = SINGLE_TOKENS.get(&c) {
            self.bump();
            return Ok(Some(Token {
                kind,
                span: Span::new(start, self.position),
                loc,
            }));
        }

        Err(Message::error(loc, format!("Unexpected character `{c}`")))
    }

    fn lex_number(&mut self, start: usize, loc: Location) -> Token {
        while self.chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }

        if self.chars.peek() == Some(&'.')
            && self.chars.peek_nth(1).is_some_and(|c| c.is_ascii_digit())
        {
            self.bump();
            while self.chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }

        Token {
            kind: TokenKind::NumberLiteral,
            span: Span::new(start, self.position),
            loc,
        }
    }

    fn lex_word(&mut self, start: usize, loc: Location) -> Token {
        while self
            .chars
            .peek()
            .is_some_and(|&c| c.is_alphanumeric() || c == '_')
        {
            self.bump();
        }

        let word = &self.source.contents[start..self.position];
        let kind = match word {
            "true" | "false" => TokenKind::BooleanLiteral,
            _ => word
                .parse::<Keyword>()
                .map(TokenKind::Keyword)
                .unwrap_or(TokenKind::Identifier),
        };

        Token {
            kind,
            span: Span::new(start, self.position),
            loc,
        }
    }

    fn lex_string(&mut self, start: usize, loc: Location) -> Result<Token, Message> {
        self.bump(); // opening quote

        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => {
                    let escape_loc = self.location();
                    match self.bump() {
                        Some('n' | 't' | '"' | '\\') => {}
                        Some(c) => {
                            return Err(Message::error(
                                escape_loc,
                                format!("Unknown escape sequence `\\{c}` in string literal"),
                            ));
                        }
                        None => {
                            return Err(Message::error(loc, "Unterminated string literal"));
                        }
                    }
                }
                Some('\n') | None => {
                    return Err(Message::error(loc, "Unterminated string literal"));
                }
                Some(_) => {}
            }
        }

        Ok(Token {
            kind: TokenKind::StringLiteral,
            span: Span::new(start, self.position),
            loc,
        })
    }
}

/// Resolves the escape sequences of a string literal body (the span between
/// the quotes). The lexer has already rejected unknown escapes.
pub fn unescape(raw: &str) -> String {
    let mut value = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }

        match chars.next() {
            Some('n') => value.push('\n'),
            Some('t') => value.push('\t'),
            Some('"') => value.push('"'),
            Some('\\') => value.push('\\'),
            _ => unreachable!("lexer admits only known escapes"),
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::SourceFileOrigin;

    fn lex(contents: &str) -> Vec<(TokenKind, u32, u32)> {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut lexer = Lexer::new(&source);
        let mut tokens = Vec::new();

        while let Some(token) = lexer.next_token().expect("lexing failed") {
            tokens.push((token.kind, token.loc.line, token.loc.column));
        }

        tokens
    }

    #[test]
    fn operators_and_positions() {
        let tokens = lex("a <= b\n&& c");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Identifier, 1, 1),
                (TokenKind::LessThanOrEqualTo, 1, 3),
                (TokenKind::Identifier, 1, 6),
                (TokenKind::LogicalAnd, 2, 1),
                (TokenKind::Identifier, 2, 4),
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex("x = 1; // trailing\n// full line\ny = 2;");
        assert_eq!(tokens.len(), 8);
        assert_eq!(tokens[4].1, 3);
    }

    #[test]
    fn numbers_and_words() {
        let tokens = lex("wait true 1.25 mean");
        assert_eq!(
            tokens.iter().map(|t| t.0).collect::<Vec<_>>(),
            vec![
                TokenKind::Keyword(Keyword::Wait),
                TokenKind::BooleanLiteral,
                TokenKind::NumberLiteral,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let source = SourceFile {
            contents: r#""a\n\"b""#.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut lexer = Lexer::new(&source);
        let token = lexer.next_token().unwrap().unwrap();
        assert_eq!(token.kind, TokenKind::StringLiteral);

        let raw = &source.contents[token.span.start + 1..token.span.end - 1];
        assert_eq!(unescape(raw), "a\n\"b");
    }

    #[test]
    fn stray_character_is_reported() {
        let source = SourceFile {
            contents: "x = @;".to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut lexer = Lexer::new(&source);
        lexer.next_token().unwrap();
        lexer.next_token().unwrap();
        let error = lexer.next_token().unwrap_err();
        assert!(error.text.contains('@'));
    }
}
