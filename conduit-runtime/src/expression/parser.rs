// Expression parser
// Builds an AST from expression tokens and extracts the node references it reads

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Abstract syntax tree for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Dotted reference into the scope: `loki.echo.out.receiver`, `export.tenants[0]`
    Reference(Reference),

    /// Builtin call: `concat(a, b)`
    FunctionCall { name: String, args: Vec<Expr> },

    /// Index access on a computed value: `split(x, ',')[0]`
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Member access on a computed value: `coalesce(a, b).key`
    Member { object: Box<Expr>, property: String },

    Unary { op: UnaryOp, expr: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `condition ? then : else`
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    Array(Vec<Expr>),

    Object(Vec<(String, Expr)>),
}

/// A reference path read from the scope
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    Property(String),
    Index(Box<Expr>),
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    /// The leading run of property names, the part a node identity can match
    pub fn name_path(&self) -> Vec<&str> {
        self.parts
            .iter()
            .map_while(|part| match part {
                ReferencePart::Property(name) => Some(name.as_str()),
                ReferencePart::Index(_) => None,
            })
            .collect()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            match part {
                ReferencePart::Property(name) if i == 0 => write!(f, "{}", name)?,
                ReferencePart::Property(name) => write!(f, ".{}", name)?,
                ReferencePart::Index(_) => write!(f, "[..]")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<Self> {
        Some(match token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::And => BinaryOp::And,
            Token::Or => BinaryOp::Or,
            _ => return None,
        })
    }

    /// Binding power; higher binds tighter
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

/// Parser error
#[derive(Debug, Clone, PartialEq)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at token {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Precedence-climbing parser over a token vector
pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        let expr = self.parse_ternary()?;
        if self.peek() != &Token::Eof {
            return Err(self.error(&format!("unexpected token '{}'", self.peek())));
        }
        Ok(expr)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseExprError> {
        let condition = self.parse_binary(1)?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }

        let then_expr = self.parse_ternary()?;
        self.expect(&Token::Colon, "expected ':' in ternary expression")?;
        let else_expr = self.parse_ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        while let Some(op) = BinaryOp::from_token(self.peek()) {
            if op.precedence() < min_precedence {
                break;
            }
            self.advance();
            // All binary operators are left-associative
            let right = self.parse_binary(op.precedence() + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let property = self.identifier("expected property name after '.'")?;
                expr = match expr {
                    Expr::Reference(mut reference) => {
                        reference.parts.push(ReferencePart::Property(property));
                        Expr::Reference(reference)
                    }
                    other => Expr::Member {
                        object: Box::new(other),
                        property,
                    },
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_ternary()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                expr = match expr {
                    Expr::Reference(mut reference) => {
                        reference.parts.push(ReferencePart::Index(Box::new(index)));
                        Expr::Reference(reference)
                    }
                    other => Expr::Index {
                        object: Box::new(other),
                        index: Box::new(index),
                    },
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        let token = self.advance().clone();
        match token {
            Token::Null => Ok(Expr::Null),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::Identifier(name) if self.peek() == &Token::LParen => {
                let args = self.parse_list(&Token::LParen, &Token::RParen, Self::parse_ternary)?;
                Ok(Expr::FunctionCall { name, args })
            }
            Token::Identifier(name) => Ok(Expr::Reference(Reference::new(name))),
            Token::LParen => {
                let expr = self.parse_ternary()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                self.position -= 1;
                let items =
                    self.parse_list(&Token::LBracket, &Token::RBracket, Self::parse_ternary)?;
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                self.position -= 1;
                let pairs = self.parse_list(&Token::LBrace, &Token::RBrace, Self::parse_pair)?;
                Ok(Expr::Object(pairs))
            }
            token => Err(self.error(&format!("unexpected token '{}'", token))),
        }
    }

    fn parse_pair(&mut self) -> Result<(String, Expr), ParseExprError> {
        let key = match self.advance().clone() {
            Token::Identifier(s) | Token::String(s) => s,
            _ => return Err(self.error("expected object key")),
        };
        self.expect(&Token::Colon, "expected ':' after object key")?;
        Ok((key, self.parse_ternary()?))
    }

    /// Parse `open item, item, ... close`, allowing a trailing comma
    fn parse_list<T>(
        &mut self,
        open: &Token,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseExprError>,
    ) -> Result<Vec<T>, ParseExprError> {
        self.expect(open, &format!("expected '{}'", open))?;
        let mut items = Vec::new();
        while self.peek() != close {
            items.push(item(self)?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close, &format!("expected '{}'", close))?;
        Ok(items)
    }

    fn identifier(&mut self, message: &str) -> Result<String, ParseExprError> {
        match self.advance().clone() {
            Token::Identifier(name) => Ok(name),
            _ => Err(self.error(message)),
        }
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, message: &str) -> Result<(), ParseExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

/// Collect every scope reference an expression reads, in source order.
pub fn collect_references<'a>(expr: &'a Expr, out: &mut Vec<&'a Reference>) {
    match expr {
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => {}
        Expr::Reference(reference) => {
            out.push(reference);
            for part in &reference.parts {
                if let ReferencePart::Index(index) = part {
                    collect_references(index, out);
                }
            }
        }
        Expr::FunctionCall { args, .. } | Expr::Array(args) => {
            args.iter().for_each(|arg| collect_references(arg, out));
        }
        Expr::Index { object, index } => {
            collect_references(object, out);
            collect_references(index, out);
        }
        Expr::Member { object, .. } => collect_references(object, out),
        Expr::Unary { expr, .. } => collect_references(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_references(left, out);
            collect_references(right, out);
        }
        Expr::Ternary {
            condition,
            then_expr,
            else_expr,
        } => {
            collect_references(condition, out);
            collect_references(then_expr, out);
            collect_references(else_expr, out);
        }
        Expr::Object(pairs) => pairs
            .iter()
            .for_each(|(_, value)| collect_references(value, out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(path: &[&str]) -> Expr {
        Expr::Reference(Reference {
            parts: path
                .iter()
                .map(|p| ReferencePart::Property(p.to_string()))
                .collect(),
        })
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(ExprParser::parse_str("null").unwrap(), Expr::Null);
        assert_eq!(ExprParser::parse_str("true").unwrap(), Expr::Bool(true));
        assert_eq!(ExprParser::parse_str("42").unwrap(), Expr::Number(42.0));
        assert_eq!(
            ExprParser::parse_str("'hello'").unwrap(),
            Expr::String("hello".to_string())
        );
    }

    #[test]
    fn test_parse_dotted_reference() {
        assert_eq!(
            ExprParser::parse_str("loki.echo.out.receiver").unwrap(),
            reference(&["loki", "echo", "out", "receiver"])
        );
    }

    #[test]
    fn test_precedence_and_associativity() {
        let expr = ExprParser::parse_str("1 + 2 * 3 == 7 && a").unwrap();
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::And);
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Eq, .. }));

        let expr = ExprParser::parse_str("10 - 4 - 3").unwrap();
        let Expr::Binary { left, right, .. } = expr else {
            panic!("expected binary");
        };
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Sub, .. }));
        assert_eq!(*right, Expr::Number(3.0));
    }

    #[test]
    fn test_parse_collections_and_calls() {
        let expr = ExprParser::parse_str("[a.b, {'k': 1, v: concat('x', c),},]").unwrap();
        let Expr::Array(items) = expr else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Expr::Object(pairs) if pairs.len() == 2));
    }

    #[test]
    fn test_collect_references() {
        let expr =
            ExprParser::parse_str("coalesce(export.a.value, x.y[export.idx.value]) ? 1 : z")
                .unwrap();
        let mut refs = Vec::new();
        collect_references(&expr, &mut refs);
        let names: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        assert_eq!(names, vec!["export.a.value", "x.y[..]", "export.idx.value", "z"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("1 +").is_err());
        assert!(ExprParser::parse_str("(1").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("a.").is_err());
    }
}
