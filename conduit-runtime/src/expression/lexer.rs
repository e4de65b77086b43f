// Expression lexer
// Tokenizes `${{ }}` expressions and splits attribute strings into text and expression segments

use std::fmt;

/// Token types for block expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    Identifier(String),

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,      // &&
    Or,       // ||
    Not,      // !
    Dot,      // .
    Comma,    // ,
    Colon,    // :
    Question, // ?

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    LBrace,   // {
    RBrace,   // }

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Eof => write!(f, "end of expression"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input; the last token is always `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };
        self.position = pos;

        let single = match ch {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '?' => Some(Token::Question),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '=' => self.pair('=', Token::Eq, None, "expected '==' operator"),
            '!' => self.pair('=', Token::Ne, Some(Token::Not), ""),
            '<' => self.pair('=', Token::Le, Some(Token::Lt), ""),
            '>' => self.pair('=', Token::Ge, Some(Token::Gt), ""),
            '&' => self.pair('&', Token::And, None, "expected '&&' operator"),
            '|' => self.pair('|', Token::Or, None, "expected '||' operator"),
            '\'' | '"' => self.read_string(ch),
            '0'..='9' => self.read_number(),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),
            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    /// Lex a one- or two-character operator starting at the current char
    fn pair(
        &mut self,
        second: char,
        double: Token,
        single: Option<Token>,
        message: &str,
    ) -> Result<Token, LexError> {
        let pos = self.position;
        self.advance();
        if self.peek_char() == Some(second) {
            self.advance();
            return Ok(double);
        }
        single.ok_or_else(|| LexError {
            message: message.to_string(),
            position: pos,
        })
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(ch) if ch.is_whitespace()) {
            self.advance();
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance();

        let mut value = String::new();
        loop {
            match self.advance() {
                Some((_, ch)) if ch == quote => {
                    // A doubled quote is an escaped quote
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        return Ok(Token::String(value));
                    }
                }
                Some((_, '\\')) if quote == '"' => match self.advance() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, other)) => value.push(other),
                    None => break,
                },
                Some((_, ch)) => value.push(ch),
                None => break,
            }
        }

        Err(LexError {
            message: "unterminated string".to_string(),
            position: start,
        })
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();

        while let Some(ch) = self.peek_char().filter(char::is_ascii_digit) {
            num_str.push(ch);
            self.advance();
        }

        // A '.' is a decimal point only when a digit follows it
        if self.peek_char() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, c)) if c.is_ascii_digit()) {
                num_str.push('.');
                self.advance();
                while let Some(ch) = self.peek_char().filter(char::is_ascii_digit) {
                    num_str.push(ch);
                    self.advance();
                }
            }
        }

        num_str.parse::<f64>().map(Token::Number).map_err(|_| LexError {
            message: format!("invalid number: {}", num_str),
            position: start,
        })
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

/// A piece of an attribute string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text
    Text(String),
    /// The trimmed source of a `${{ }}` expression
    Expression(String),
}

/// Split a string into literal text and `${{ }}` expression segments.
///
/// An unterminated `${{` is kept as literal text.
pub fn extract_expressions(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let Some(open) = rest.find("${{") else {
            segments.push(Segment::Text(rest.to_string()));
            break;
        };
        let Some(close) = find_closing(&rest[open + 3..]) else {
            segments.push(Segment::Text(rest.to_string()));
            break;
        };

        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let body = &rest[open + 3..open + 3 + close];
        segments.push(Segment::Expression(body.trim().to_string()));
        rest = &rest[open + 3 + close + 2..];
    }

    segments
}

/// Offset of the `}}` closing an expression, skipping quoted strings and nested braces
fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'{' => depth += 1,
                b'}' if depth > 0 => depth -= 1,
                b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
                _ => {}
            },
        }
        i += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            lex("a.b == 'x' && !c >= 1.5"),
            vec![
                Token::Identifier("a".into()),
                Token::Dot,
                Token::Identifier("b".into()),
                Token::Eq,
                Token::String("x".into()),
                Token::And,
                Token::Not,
                Token::Identifier("c".into()),
                Token::Ge,
                Token::Number(1.5),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_with_escapes() {
        assert_eq!(lex("'it''s'"), vec![Token::String("it's".into()), Token::Eof]);
        assert_eq!(lex(r#""a\"b""#), vec![Token::String("a\"b".into()), Token::Eof]);
    }

    #[test]
    fn test_lex_errors() {
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a # b").tokenize().is_err());
    }

    #[test]
    fn test_extract_expressions() {
        assert_eq!(
            extract_expressions("http://${{ export.host.value }}:${{ 8080 }}/push"),
            vec![
                Segment::Text("http://".into()),
                Segment::Expression("export.host.value".into()),
                Segment::Text(":".into()),
                Segment::Expression("8080".into()),
                Segment::Text("/push".into()),
            ]
        );
    }

    #[test]
    fn test_extract_expressions_with_nested_braces() {
        assert_eq!(
            extract_expressions("${{ {'a': '}}'} }}"),
            vec![Segment::Expression("{'a': '}}'}".into())]
        );
        assert_eq!(
            extract_expressions("plain ${{ oops"),
            vec![Segment::Text("plain ${{ oops".into())]
        );
    }
}
