//! Scanner: source text to tokens
//!
//! Scans the whole source eagerly into a `Vec<Token>` ending in `Eof`.
//! Tokens own their lexeme and carry a 1-based line number. Scan
//! failures (unexpected character, unterminated string) become `Error`
//! tokens whose lexeme is the message; the compiler turns them into
//! diagnostics at the point it would have consumed them.
//!
//! Identifiers are ASCII `[A-Za-z_][A-Za-z0-9_]*`; keywords are
//! recognized by a small first-character trie. String literals may span
//! lines (which are counted) and have their quotes stripped. `//`
//! starts a comment to end of line. Non-ASCII bytes are fine inside
//! strings and comments.

/// Token kind. `Error` carries the scan failure message as its lexeme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character punctuation.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    // One- or two-character operators.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    Number,
    String,
    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Error,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    /// 1-based source line.
    pub line: usize,
}

/// Scan `source` into tokens; the last token is always `Eof`.
pub fn scan(source: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = scanner.scan_token();
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return tokens;
        }
    }
}

struct Scanner<'a> {
    source: &'a [u8],
    start: usize,
    current: usize,
    line: usize,
}

fn is_alpha(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_digit(byte: u8) -> bool {
    byte.is_ascii_digit()
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }
        let byte = self.advance();
        if is_alpha(byte) {
            return self.identifier();
        }
        if is_digit(byte) {
            return self.number();
        }
        match byte {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.match_byte(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character.", self.line),
        }
    }

    fn identifier(&mut self) -> Token {
        while !self.is_at_end() && (is_alpha(self.peek()) || is_digit(self.peek())) {
            self.advance();
        }
        self.make_token(self.identifier_kind())
    }

    fn number(&mut self) -> Token {
        while !self.is_at_end() && is_digit(self.peek()) {
            self.advance();
        }
        if !self.is_at_end() && self.peek() == b'.' && is_digit(self.peek_next()) {
            self.advance();
            while !self.is_at_end() && is_digit(self.peek()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    /// A string literal. The quotes are stripped from the lexeme.
    /// Newlines inside are counted; a terminated token carries its
    /// ending line, an unterminated one reports the line it began on.
    fn string(&mut self) -> Token {
        let opening_line = self.line;
        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.", opening_line);
        }
        self.advance();
        Token {
            kind: TokenKind::String,
            lexeme: self.text(self.start + 1, self.current - 1),
            line: self.line,
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            lexeme: self.text(self.start, self.current),
            line: self.line,
        }
    }

    fn error_token(&self, message: &str, line: usize) -> Token {
        Token {
            kind: TokenKind::Error,
            lexeme: message.to_string(),
            line,
        }
    }

    /// Lexeme slice. Lossy conversion keeps an unexpected non-ASCII
    /// byte from panicking the scanner; valid literals pass through
    /// untouched.
    fn text(&self, from: usize, to: usize) -> String {
        String::from_utf8_lossy(&self.source[from..to]).into_owned()
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source[self.current];
        self.current += 1;
        byte
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn peek(&self) -> u8 {
        self.source[self.current]
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 < self.source.len() {
            self.source[self.current + 1]
        } else {
            0
        }
    }

    fn skip_whitespace(&mut self) {
        while !self.is_at_end() {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while !self.is_at_end() && self.peek() != b'\n' {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn check_keyword(&self, offset: usize, rest: &str, kind: TokenKind) -> TokenKind {
        let from = self.start + offset;
        let to = from + rest.len();
        if self.current == to && &self.source[from..to] == rest.as_bytes() {
            kind
        } else {
            TokenKind::Identifier
        }
    }

    /// Keyword trie keyed on the first byte (then second for f/t).
    fn identifier_kind(&self) -> TokenKind {
        match self.source[self.start] {
            b'a' => self.check_keyword(1, "nd", TokenKind::And),
            b'c' => self.check_keyword(1, "lass", TokenKind::Class),
            b'e' => self.check_keyword(1, "lse", TokenKind::Else),
            b'f' if self.current > self.start + 1 => match self.source[self.start + 1] {
                b'a' => self.check_keyword(2, "lse", TokenKind::False),
                b'o' => self.check_keyword(2, "r", TokenKind::For),
                b'u' => self.check_keyword(2, "n", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => self.check_keyword(1, "f", TokenKind::If),
            b'n' => self.check_keyword(1, "il", TokenKind::Nil),
            b'o' => self.check_keyword(1, "r", TokenKind::Or),
            b'p' => self.check_keyword(1, "rint", TokenKind::Print),
            b'r' => self.check_keyword(1, "eturn", TokenKind::Return),
            b's' => self.check_keyword(1, "uper", TokenKind::Super),
            b't' if self.current > self.start + 1 => match self.source[self.start + 1] {
                b'h' => self.check_keyword(2, "is", TokenKind::This),
                b'r' => self.check_keyword(2, "ue", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            b'v' => self.check_keyword(1, "ar", TokenKind::Var),
            b'w' => self.check_keyword(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source_is_just_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_punctuation_and_operators() {
        assert_eq!(
            kinds("(){};,.-+/*"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("! != = == > >= < <="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("and class else false for fun if nil or print return super this true var while"),
            vec![
                TokenKind::And,
                TokenKind::Class,
                TokenKind::Else,
                TokenKind::False,
                TokenKind::For,
                TokenKind::Fun,
                TokenKind::If,
                TokenKind::Nil,
                TokenKind::Or,
                TokenKind::Print,
                TokenKind::Return,
                TokenKind::Super,
                TokenKind::This,
                TokenKind::True,
                TokenKind::Var,
                TokenKind::While,
                TokenKind::Eof,
            ]
        );
        // Prefixes and extensions of keywords are identifiers.
        assert_eq!(
            kinds("an android fa force truth _if f"),
            vec![TokenKind::Identifier; 7]
                .into_iter()
                .chain([TokenKind::Eof])
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = scan("0 12 3.25");
        assert_eq!(tokens[0].lexeme, "0");
        assert_eq!(tokens[1].lexeme, "12");
        assert_eq!(tokens[2].lexeme, "3.25");
        assert!(tokens[..3].iter().all(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn test_leading_dot_is_not_a_number() {
        assert_eq!(
            kinds(".5"),
            vec![TokenKind::Dot, TokenKind::Number, TokenKind::Eof]
        );
        // A trailing dot splits off as punctuation too.
        assert_eq!(
            kinds("5."),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_quotes_are_stripped() {
        let tokens = scan("\"hello\"");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, "hello");
        let tokens = scan("\"\"");
        assert_eq!(tokens[0].lexeme, "");
    }

    #[test]
    fn test_multiline_string_counts_lines() {
        let tokens = scan("\"a\nb\"\nx");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, "a\nb");
        assert_eq!(tokens[0].line, 2);
        // The identifier after the literal lands on line 3.
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn test_unterminated_string_reports_opening_line() {
        let tokens = scan("var x;\n\"abc\ndef");
        let error = tokens.iter().find(|t| t.kind == TokenKind::Error).unwrap();
        assert_eq!(error.lexeme, "Unterminated string.");
        assert_eq!(error.line, 2);
    }

    #[test]
    fn test_comments_and_unicode_are_skipped() {
        assert_eq!(kinds("// nothing here\n// déjà vu\n"), vec![TokenKind::Eof]);
        let tokens = scan("x // trailing\n+ y");
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![
                TokenKind::Identifier,
                TokenKind::Plus,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unexpected_character() {
        let tokens = scan("@");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unexpected character.");
    }

    #[test]
    fn test_line_numbers_are_one_based() {
        let tokens = scan("a\nb\n\nc");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 4);
    }
}
