use std::net::IpAddr;
use std::sync::Arc;

use net::ip::Cidr;

use crate::source::{FilePos, SourceRange};
use crate::token::{Token, TokenKind};

/// A lexical error. The parser turns these into TokenError diagnostics.
#[derive(Clone, Debug)]
pub struct TokenError {
    pub range: SourceRange,
    pub text: String,
}

/// Pull-based tokenizer over one source unit.
pub struct Lexer {
    file: Arc<str>,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,

    /// Whether the *next* `/` starts a regex literal. True after operators
    /// and at statement boundaries, false after a value-like token.
    expects_value: bool,
}

impl Lexer {
    pub fn new(source: &str, filename: &str) -> Self {
        Self {
            file: Arc::from(filename),
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            expects_value: true,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn here(&self) -> FilePos {
        FilePos::new(self.line, self.column, self.pos as u32)
    }

    fn range_from(&self, begin: FilePos) -> SourceRange {
        SourceRange::new(self.file.clone(), begin, self.here())
    }

    fn error(&self, begin: FilePos, text: impl Into<String>) -> TokenError {
        TokenError {
            range: self.range_from(begin),
            text: text.into(),
        }
    }

    /// Skips whitespace and all three comment forms. `/` not followed by
    /// `/` or `*` is left alone for the operator path.
    fn consume_space(&mut self) -> Result<(), TokenError> {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek() == Some('/') => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek() == Some('*') => {
                    let begin = self.here();
                    self.bump();
                    self.bump();
                    loop {
                        match self.current() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(self.error(begin, "unterminated block comment"))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Produces the next token. Eof repeats once the input is exhausted.
    pub fn next_token(&mut self) -> Result<Token, TokenError> {
        self.consume_space()?;

        let begin = self.here();
        let kind = match self.current() {
            None => TokenKind::Eof,
            Some('=') => {
                self.bump();
                match self.current() {
                    Some('=') => {
                        self.bump();
                        TokenKind::Equal
                    }
                    Some('^') => {
                        self.bump();
                        TokenKind::PrefixMatch
                    }
                    Some('$') => {
                        self.bump();
                        TokenKind::SuffixMatch
                    }
                    Some('~') => {
                        self.bump();
                        TokenKind::RegexMatch
                    }
                    Some('>') => {
                        self.bump();
                        TokenKind::KeyAssign
                    }
                    _ => TokenKind::Assign,
                }
            }
            Some('<') => {
                self.bump();
                match self.current() {
                    Some('<') => {
                        self.bump();
                        TokenKind::Shl
                    }
                    Some('=') => {
                        self.bump();
                        TokenKind::LessOrEqual
                    }
                    _ => TokenKind::Less,
                }
            }
            Some('>') => {
                self.bump();
                match self.current() {
                    Some('>') => {
                        self.bump();
                        TokenKind::Shr
                    }
                    Some('=') => {
                        self.bump();
                        TokenKind::GreaterOrEqual
                    }
                    _ => TokenKind::Greater,
                }
            }
            Some('|') => {
                self.bump();
                match self.current() {
                    Some('|') => {
                        self.bump();
                        TokenKind::Or
                    }
                    _ => TokenKind::BitOr,
                }
            }
            Some('&') => {
                self.bump();
                match self.current() {
                    Some('&') => {
                        self.bump();
                        TokenKind::And
                    }
                    _ => TokenKind::BitAnd,
                }
            }
            Some('!') => {
                self.bump();
                match self.current() {
                    Some('=') => {
                        self.bump();
                        TokenKind::UnEqual
                    }
                    _ => TokenKind::Not,
                }
            }
            Some('^') => {
                self.bump();
                TokenKind::BitXor
            }
            Some('+') => {
                self.bump();
                TokenKind::Plus
            }
            Some('-') => {
                self.bump();
                TokenKind::Minus
            }
            Some('*') => {
                self.bump();
                match self.current() {
                    Some('*') => {
                        self.bump();
                        TokenKind::Pow
                    }
                    _ => TokenKind::Mul,
                }
            }
            Some('/') => {
                if self.expects_value {
                    self.lex_regex(begin)?
                } else {
                    self.bump();
                    TokenKind::Div
                }
            }
            Some('%') => {
                self.bump();
                TokenKind::Mod
            }
            Some('{') => {
                self.bump();
                TokenKind::Begin
            }
            Some('}') => {
                self.bump();
                TokenKind::End
            }
            Some('(') => {
                self.bump();
                TokenKind::RndOpen
            }
            Some(')') => {
                self.bump();
                TokenKind::RndClose
            }
            Some('[') => {
                self.bump();
                TokenKind::BrOpen
            }
            Some(']') => {
                self.bump();
                TokenKind::BrClose
            }
            Some(';') => {
                self.bump();
                TokenKind::Semicolon
            }
            Some(',') => {
                self.bump();
                TokenKind::Comma
            }
            Some('"') => self.lex_string(begin, '"')?,
            Some('\'') => self.lex_string(begin, '\'')?,
            Some(':') if self.peek() == Some(':') => self.lex_ipv6(begin)?,
            Some(ch) if ch.is_ascii_digit() => self.lex_number(begin)?,
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => self.lex_ident(),
            Some(ch) => {
                self.bump();
                return Err(self.error(begin, format!("unexpected character '{}'", ch)));
            }
        };

        self.expects_value = kind.expects_value();

        Ok(Token {
            kind,
            range: self.range_from(begin),
        })
    }

    /// String literal. Both quote forms unescape `\\ \r \n \t` plus the
    /// delimiter itself; anything else after a backslash is kept verbatim.
    fn lex_string(&mut self, begin: FilePos, delim: char) -> Result<TokenKind, TokenError> {
        self.bump(); // opening delimiter

        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(begin, "unterminated string literal")),
                Some(ch) if ch == delim => break,
                Some('\\') => match self.bump() {
                    None => return Err(self.error(begin, "unterminated string literal")),
                    Some('\\') => value.push('\\'),
                    Some('r') => value.push('\r'),
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(ch) if ch == delim => value.push(ch),
                    Some(ch) => {
                        value.push('\\');
                        value.push(ch);
                    }
                },
                Some(ch) => value.push(ch),
            }
        }

        Ok(TokenKind::Str(value))
    }

    /// Regex literal `/.../`; `\/` embeds a slash.
    fn lex_regex(&mut self, begin: FilePos) -> Result<TokenKind, TokenError> {
        self.bump(); // opening slash

        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(begin, "unterminated regex literal")),
                Some('/') => break,
                Some('\\') if self.current() == Some('/') => {
                    self.bump();
                    value.push('/');
                }
                Some('\\') => {
                    value.push('\\');
                    if let Some(ch) = self.bump() {
                        value.push(ch);
                    }
                }
                Some(ch) => value.push(ch),
            }
        }

        Ok(TokenKind::RegExp(value))
    }

    fn lex_digits(&mut self, text: &mut String) {
        while let Some(ch) = self.current() {
            if !ch.is_ascii_digit() {
                break;
            }
            text.push(ch);
            self.bump();
        }
    }

    /// Number literal, or a dotted-quad IPv4 literal (an integer followed by
    /// exactly three more dotted components), optionally extended to a CIDR
    /// by `/prefix`.
    fn lex_number(&mut self, begin: FilePos) -> Result<TokenKind, TokenError> {
        let mut text = String::new();
        self.lex_digits(&mut text);

        if self.current() != Some('.') {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(begin, "integer literal out of range"))?;
            return Ok(TokenKind::Number(value));
        }

        // 2nd..4th IPv4 components.
        for _ in 0..3 {
            if self.current() != Some('.') {
                return Err(self.error(begin, "malformed IP literal"));
            }
            self.bump();
            text.push('.');

            if !matches!(self.current(), Some(ch) if ch.is_ascii_digit()) {
                return Err(self.error(begin, "malformed IP literal"));
            }
            self.lex_digits(&mut text);
        }

        let addr: IpAddr = text
            .parse()
            .map_err(|_| self.error(begin, format!("malformed IP literal '{}'", text)))?;

        self.lex_optional_prefix(begin, addr)
    }

    /// IPv6 literal hook: handles the `::`-prefixed forms.
    fn lex_ipv6(&mut self, begin: FilePos) -> Result<TokenKind, TokenError> {
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_hexdigit() || ch == ':' || ch == '.' {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }

        let addr: IpAddr = text
            .parse()
            .map_err(|_| self.error(begin, format!("malformed IPv6 literal '{}'", text)))?;

        self.lex_optional_prefix(begin, addr)
    }

    /// `<ip>/<prefix>` makes a CIDR literal; a bare slash stays a division.
    fn lex_optional_prefix(
        &mut self,
        begin: FilePos,
        addr: IpAddr,
    ) -> Result<TokenKind, TokenError> {
        if self.current() == Some('/') && matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
            self.bump();
            let mut text = String::new();
            self.lex_digits(&mut text);
            let prefix: u8 = text
                .parse()
                .map_err(|_| self.error(begin, "CIDR prefix out of range"))?;
            let cidr = Cidr::new(addr, prefix)
                .map_err(|_| self.error(begin, format!("CIDR prefix /{} out of range", prefix)))?;
            return Ok(TokenKind::Cidr(cidr));
        }

        Ok(TokenKind::IP(addr))
    }

    fn lex_ident(&mut self) -> TokenKind {
        let mut name = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                name.push(ch);
                self.bump();
            } else {
                break;
            }
        }

        match TokenKind::keyword(&name) {
            Some(kind) => kind,
            None => TokenKind::Ident(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, "test.flow");
        let mut out = vec![];
        loop {
            let token = lexer.next_token().unwrap();
            if token.kind == TokenKind::Eof {
                return out;
            }
            out.push(token.kind);
        }
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            lex_all("handler main { serve; }"),
            vec![
                TokenKind::Handler,
                TokenKind::Ident("main".into()),
                TokenKind::Begin,
                TokenKind::Ident("serve".into()),
                TokenKind::Semicolon,
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn dotted_idents() {
        assert_eq!(
            lex_all("req.path"),
            vec![TokenKind::Ident("req.path".into())]
        );
    }

    #[test]
    fn booleans() {
        assert_eq!(
            lex_all("true yes false no"),
            vec![
                TokenKind::Bool(true),
                TokenKind::Bool(true),
                TokenKind::Bool(false),
                TokenKind::Bool(false),
            ]
        );
    }

    #[test]
    fn numbers_ips_cidrs() {
        assert_eq!(
            lex_all("42 127.0.0.1 10.0.0.0/8 ::1"),
            vec![
                TokenKind::Number(42),
                TokenKind::IP("127.0.0.1".parse().unwrap()),
                TokenKind::Cidr(Cidr::new("10.0.0.0".parse().unwrap(), 8).unwrap()),
                TokenKind::IP("::1".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            lex_all(r#""a\n\t\\b" 'c\nd'"#),
            vec![
                TokenKind::Str("a\n\t\\b".into()),
                TokenKind::Str("c\nd".into()),
            ]
        );
    }

    #[test]
    fn regex_vs_division() {
        // After an operator a slash starts a regex; after a value it divides.
        assert_eq!(
            lex_all("a =~ /foo.*/"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::RegexMatch,
                TokenKind::RegExp("foo.*".into()),
            ]
        );
        assert_eq!(
            lex_all("a / b"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Div,
                TokenKind::Ident("b".into()),
            ]
        );
    }

    #[test]
    fn comments() {
        assert_eq!(
            lex_all("1 # line\n2 // line\n3 /* block\nblock */ 4"),
            vec![
                TokenKind::Number(1),
                TokenKind::Number(2),
                TokenKind::Number(3),
                TokenKind::Number(4),
            ]
        );
    }

    #[test]
    fn multi_char_operators() {
        assert_eq!(
            lex_all("== != <= >= << >> ** =^ =$ =~ => || &&"),
            vec![
                TokenKind::Equal,
                TokenKind::UnEqual,
                TokenKind::LessOrEqual,
                TokenKind::GreaterOrEqual,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Pow,
                TokenKind::PrefixMatch,
                TokenKind::SuffixMatch,
                TokenKind::RegexMatch,
                TokenKind::KeyAssign,
                TokenKind::Or,
                TokenKind::And,
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("\"abc", "test.flow");
        let err = lexer.next_token().unwrap_err();
        assert!(err.text.contains("unterminated"));
        assert_eq!(err.range.begin.line, 1);
    }

    #[test]
    fn unknown_character_errors() {
        let mut lexer = Lexer::new("@", "test.flow");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn token_ranges() {
        let mut lexer = Lexer::new("handler main", "test.flow");
        let token = lexer.next_token().unwrap();
        assert_eq!(token.range.begin.column, 1);
        let token = lexer.next_token().unwrap();
        assert_eq!(token.range.begin.column, 9);
        assert_eq!(token.range.begin.line, 1);
    }
}
