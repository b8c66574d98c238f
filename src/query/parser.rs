//! Recursive-descent parser for a small XPath subset.
//!
//! Grammar:
//! ```text
//! query      := path ('|' path)*
//! path       := '/' relative? | '//' relative | relative
//! relative   := step (('/' | '//') step)*
//! step       := '.' | '..' | axis? test predicate*
//! axis       := AXIS '::' | '@'
//! test       := '*' | 'text()' | 'node()' | NAME
//! predicate  := '[' (NUMBER | 'last()' | or_expr) ']'
//! or_expr    := and_expr ('or' and_expr)*
//! and_expr   := unary ('and' unary)*
//! unary      := 'not(' or_expr ')' | FUNC '(' operand ',' operand ')'
//!             | '(' or_expr ')' | operand (op operand)?
//! operand    := LITERAL | NUMBER | path
//! op         := '=' | '!=' | '<' | '<=' | '>' | '>='
//! ```

use super::QueryError;

/// A parsed query: the union of one or more location paths.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub paths: Vec<LocationPath>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfNode,
    Parent,
    Ancestor,
    Attribute,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Axis::Child,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "self" => Axis::SelfNode,
            "parent" => Axis::Parent,
            "ancestor" => Axis::Ancestor,
            "attribute" => Axis::Attribute,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeTest {
    Name(String),
    Any,
    Text,
    Node,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Position(usize),
    Last,
    Expr(BoolExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoolExpr {
    Or(Box<BoolExpr>, Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Not(Box<BoolExpr>),
    Exists(LocationPath),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Contains(Operand, Operand),
    StartsWith(Operand, Operand),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(String),
    Number(f64),
    Path(LocationPath),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Slash,
    DoubleSlash,
    Dot,
    DotDot,
    At,
    Star,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    ColonColon,
    Op(CompareOp),
    Name(String),
    Literal(String),
    Number(f64),
    Eof,
}

/// Parse a query expression.
pub fn parse(expr: &str) -> Result<Query, QueryError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        expr,
        tokens,
        pos: 0,
    };
    let query = parser.query()?;
    parser.expect(&Token::Eof)?;
    Ok(query)
}

fn tokenize(expr: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '/' if next == Some('/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '.' if next == Some('.') => {
                tokens.push(Token::DotDot);
                i += 2;
            }
            '.' if next.map_or(false, |n| n.is_ascii_digit()) => {
                let (number, end) = read_number(&chars, i);
                tokens.push(Token::Number(number));
                i = end;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            ':' if next == Some(':') => {
                tokens.push(Token::ColonColon);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Neq));
                i += 2;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Lte));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CompareOp::Lt));
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Gte));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CompareOp::Gt));
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|offset| i + 1 + offset)
                    .ok_or_else(|| syntax(expr, "unterminated string literal"))?;
                tokens.push(Token::Literal(chars[i + 1..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() => {
                let (number, end) = read_number(&chars, i);
                tokens.push(Token::Number(number));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    let is_name_char = ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.');
                    // a single ':' is a namespace prefix separator, '::' an axis
                    let is_prefix_colon =
                        ch == ':' && chars.get(i + 1) != Some(&':') && i > start;
                    if is_name_char || is_prefix_colon {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => {
                return Err(syntax(expr, &format!("unexpected character '{}'", other)));
            }
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn read_number(chars: &[char], start: usize) -> (f64, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
        end += 1;
    }
    let text: String = chars[start..end].iter().collect();
    (text.parse().unwrap_or(f64::NAN), end)
}

fn syntax(expr: &str, message: &str) -> QueryError {
    QueryError::Syntax {
        expr: expr.to_string(),
        message: message.to_string(),
    }
}

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), QueryError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}, found {:?}", token, self.peek())))
        }
    }

    fn error(&self, message: &str) -> QueryError {
        syntax(self.expr, message)
    }

    fn query(&mut self) -> Result<Query, QueryError> {
        let mut paths = vec![self.path()?];
        while self.eat(&Token::Pipe) {
            paths.push(self.path()?);
        }
        Ok(Query { paths })
    }

    fn path(&mut self) -> Result<LocationPath, QueryError> {
        match self.peek() {
            Token::Slash => {
                self.advance();
                let steps = if self.starts_step() {
                    self.relative()?
                } else {
                    Vec::new()
                };
                Ok(LocationPath {
                    absolute: true,
                    steps,
                })
            }
            Token::DoubleSlash => {
                self.advance();
                let mut steps = vec![descendant_or_self()];
                steps.extend(self.relative()?);
                Ok(LocationPath {
                    absolute: true,
                    steps,
                })
            }
            _ => Ok(LocationPath {
                absolute: false,
                steps: self.relative()?,
            }),
        }
    }

    fn starts_step(&self) -> bool {
        matches!(
            self.peek(),
            Token::Dot | Token::DotDot | Token::At | Token::Star | Token::Name(_)
        )
    }

    fn relative(&mut self) -> Result<Vec<Step>, QueryError> {
        let mut steps = vec![self.step()?];
        loop {
            match self.peek() {
                Token::Slash => {
                    self.advance();
                    steps.push(self.step()?);
                }
                Token::DoubleSlash => {
                    self.advance();
                    steps.push(descendant_or_self());
                    steps.push(self.step()?);
                }
                _ => return Ok(steps),
            }
        }
    }

    fn step(&mut self) -> Result<Step, QueryError> {
        match self.peek() {
            Token::Dot => {
                self.advance();
                return Ok(Step {
                    axis: Axis::SelfNode,
                    test: NodeTest::Node,
                    predicates: Vec::new(),
                });
            }
            Token::DotDot => {
                self.advance();
                return Ok(Step {
                    axis: Axis::Parent,
                    test: NodeTest::Node,
                    predicates: Vec::new(),
                });
            }
            _ => {}
        }

        let axis = if self.eat(&Token::At) {
            Axis::Attribute
        } else if let (Token::Name(name), Token::ColonColon) = (self.peek(), self.peek_at(1)) {
            let axis = Axis::from_name(name)
                .ok_or_else(|| self.error(&format!("unknown axis '{}'", name)))?;
            self.advance();
            self.advance();
            axis
        } else {
            Axis::Child
        };

        let test = match self.advance() {
            Token::Star => NodeTest::Any,
            Token::Name(name) if self.peek() == &Token::LParen => {
                self.advance();
                self.expect(&Token::RParen)?;
                match name.as_str() {
                    "text" => NodeTest::Text,
                    "node" => NodeTest::Node,
                    other => return Err(self.error(&format!("unknown node test '{}()'", other))),
                }
            }
            Token::Name(name) => NodeTest::Name(name),
            other => return Err(self.error(&format!("expected node test, found {:?}", other))),
        };

        let mut predicates = Vec::new();
        while self.eat(&Token::LBracket) {
            predicates.push(self.predicate()?);
            self.expect(&Token::RBracket)?;
        }

        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn predicate(&mut self) -> Result<Predicate, QueryError> {
        if let (Token::Number(n), Token::RBracket) = (self.peek(), self.peek_at(1)) {
            let n = *n;
            if n < 1.0 || n.fract() != 0.0 {
                return Err(self.error(&format!("invalid position {}", n)));
            }
            self.advance();
            return Ok(Predicate::Position(n as usize));
        }
        if let (Token::Name(name), Token::LParen, Token::RParen, Token::RBracket) = (
            self.peek(),
            self.peek_at(1),
            self.peek_at(2),
            self.peek_at(3),
        ) {
            if name == "last" {
                self.advance();
                self.advance();
                self.advance();
                return Ok(Predicate::Last);
            }
        }
        Ok(Predicate::Expr(self.or_expr()?))
    }

    fn or_expr(&mut self) -> Result<BoolExpr, QueryError> {
        let mut left = self.and_expr()?;
        while self.peek() == &Token::Name("or".to_string()) {
            self.advance();
            let right = self.and_expr()?;
            left = BoolExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<BoolExpr, QueryError> {
        let mut left = self.unary()?;
        while self.peek() == &Token::Name("and".to_string()) {
            self.advance();
            let right = self.unary()?;
            left = BoolExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<BoolExpr, QueryError> {
        if let (Token::Name(name), Token::LParen) = (self.peek(), self.peek_at(1)) {
            let name = name.clone();
            match name.as_str() {
                "not" => {
                    self.advance();
                    self.advance();
                    let inner = self.or_expr()?;
                    self.expect(&Token::RParen)?;
                    return Ok(BoolExpr::Not(Box::new(inner)));
                }
                "contains" | "starts-with" => {
                    self.advance();
                    self.advance();
                    let haystack = self.operand()?;
                    self.expect(&Token::Comma)?;
                    let needle = self.operand()?;
                    self.expect(&Token::RParen)?;
                    return Ok(if name == "contains" {
                        BoolExpr::Contains(haystack, needle)
                    } else {
                        BoolExpr::StartsWith(haystack, needle)
                    });
                }
                _ => {}
            }
        }

        if self.eat(&Token::LParen) {
            let inner = self.or_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        let left = self.operand()?;
        if let Token::Op(op) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.operand()?;
            return Ok(BoolExpr::Compare { left, op, right });
        }

        match left {
            Operand::Path(path) => Ok(BoolExpr::Exists(path)),
            other => Err(self.error(&format!("expected a comparison after {:?}", other))),
        }
    }

    fn operand(&mut self) -> Result<Operand, QueryError> {
        match self.peek().clone() {
            Token::Literal(text) => {
                self.advance();
                Ok(Operand::Literal(text))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Operand::Number(n))
            }
            _ => Ok(Operand::Path(self.path()?)),
        }
    }
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::Node,
        predicates: Vec::new(),
    }
}
