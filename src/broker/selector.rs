//! Message selectors: the SQL-92-like filter subset used to route messages.
//!
//! Supported: `AND`, `OR`, `NOT`, parentheses, `IS [NOT] NULL`,
//! `=`, `<>`, `<`, `<=`, `>`, `>=`, `[NOT] IN (...)`, `[NOT] LIKE '...'`,
//! string literals (`'it''s'`), numbers and `TRUE`/`FALSE`. Identifiers name
//! message properties or the `JMS*` header fields. Evaluation uses
//! three-valued logic: a comparison against an absent property is unknown,
//! and only a definite `true` selects a message.

use thiserror::Error;

use super::BrokerMessage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct SelectorError {
    pub message: String,
    pub offset: usize,
}

/// Deepest nesting of parentheses and `NOT` a selector may use.
pub const MAX_NESTING: usize = 128;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    Not,
    Is,
    Null,
    In,
    Like,
    True,
    False,
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Ident(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    IsNull {
        ident: String,
        negated: bool,
    },
    Compare {
        op: CmpOp,
        left: Operand,
        right: Operand,
    },
    In {
        ident: String,
        values: Vec<Value>,
        negated: bool,
    },
    Like {
        ident: String,
        pattern: String,
        negated: bool,
    },
    Operand(Operand),
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, SelectorError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |message: &str, offset: usize| SelectorError {
        message: message.to_string(),
        offset,
    };

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let token = match c {
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            ',' => {
                i += 1;
                Token::Comma
            }
            '=' => {
                i += 1;
                Token::Op(CmpOp::Eq)
            }
            '<' => {
                i += 1;
                match chars.get(i) {
                    Some('>') => {
                        i += 1;
                        Token::Op(CmpOp::Ne)
                    }
                    Some('=') => {
                        i += 1;
                        Token::Op(CmpOp::Le)
                    }
                    _ => Token::Op(CmpOp::Lt),
                }
            }
            '>' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                    Token::Op(CmpOp::Ge)
                } else {
                    Token::Op(CmpOp::Gt)
                }
            }
            '\'' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                        None => return Err(err("unterminated string literal", start)),
                    }
                }
                Token::Str(s)
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| err("invalid number", start))?;
                Token::Num(n)
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "IN" => Token::In,
                    "LIKE" => Token::Like,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                }
            }
            _ => return Err(err(&format!("unexpected character '{}'", c), start)),
        };
        tokens.push((token, start));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, o)| *o).unwrap_or(self.end)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, SelectorError> {
        Err(SelectorError {
            message: message.into(),
            offset: self.offset(),
        })
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Enter one nesting level, failing past [`MAX_NESTING`].
    fn descend(&mut self) -> Result<(), SelectorError> {
        if self.depth == MAX_NESTING {
            return self.error(format!("nesting deeper than {}", MAX_NESTING));
        }
        self.depth += 1;
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, SelectorError> {
        let mut terms = vec![self.and()?];
        while self.eat(&Token::Or) {
            terms.push(self.and()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn and(&mut self) -> Result<Expr, SelectorError> {
        let mut terms = vec![self.not()?];
        while self.eat(&Token::And) {
            terms.push(self.not()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::And(terms),
        })
    }

    fn not(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.predicate()
    }

    fn literal(&mut self) -> Result<Value, SelectorError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            _ => {
                self.pos -= 1;
                self.error("expected a literal")
            }
        }
    }

    fn operand(&mut self) -> Result<Operand, SelectorError> {
        if let Some(Token::Ident(name)) = self.peek() {
            let name = name.clone();
            self.pos += 1;
            return Ok(Operand::Ident(name));
        }
        self.literal().map(Operand::Literal)
    }

    fn predicate(&mut self) -> Result<Expr, SelectorError> {
        if self.eat(&Token::LParen) {
            self.descend()?;
            let inner = self.or()?;
            if !self.eat(&Token::RParen) {
                return self.error("expected ')'");
            }
            self.depth -= 1;
            return Ok(inner);
        }

        let left = self.operand()?;
        let ident = match &left {
            Operand::Ident(name) => Some(name.clone()),
            Operand::Literal(_) => None,
        };

        match self.peek().cloned() {
            Some(Token::Op(op)) => {
                self.pos += 1;
                let right = self.operand()?;
                Ok(Expr::Compare { op, left, right })
            }
            Some(Token::Is) => {
                self.pos += 1;
                let negated = self.eat(&Token::Not);
                if !self.eat(&Token::Null) {
                    return self.error("expected NULL");
                }
                match ident {
                    Some(ident) => Ok(Expr::IsNull { ident, negated }),
                    None => self.error("IS NULL requires an identifier"),
                }
            }
            Some(Token::Not) | Some(Token::In) | Some(Token::Like) => {
                let negated = self.eat(&Token::Not);
                let ident = match ident {
                    Some(ident) => ident,
                    None => return self.error("IN/LIKE require an identifier"),
                };
                match self.next() {
                    Some(Token::In) => {
                        if !self.eat(&Token::LParen) {
                            return self.error("expected '('");
                        }
                        let mut values = vec![self.literal()?];
                        while self.eat(&Token::Comma) {
                            values.push(self.literal()?);
                        }
                        if !self.eat(&Token::RParen) {
                            return self.error("expected ')'");
                        }
                        Ok(Expr::In {
                            ident,
                            values,
                            negated,
                        })
                    }
                    Some(Token::Like) => match self.next() {
                        Some(Token::Str(pattern)) => Ok(Expr::Like {
                            ident,
                            pattern,
                            negated,
                        }),
                        _ => {
                            self.pos -= 1;
                            self.error("LIKE requires a string pattern")
                        }
                    },
                    _ => {
                        self.pos -= 1;
                        self.error("expected IN or LIKE")
                    }
                }
            }
            _ => Ok(Expr::Operand(left)),
        }
    }
}

/// `%` matches any run of characters and `_` exactly one. Backtracks only
/// to the most recent `%`, so the cost is bounded by value times pattern.
fn like(value: &[char], pattern: &[char]) -> bool {
    let (mut v, mut p) = (0, 0);
    // Pattern index after the last `%`, and the value index it resumes from.
    let mut resume: Option<(usize, usize)> = None;
    while v < value.len() {
        match pattern.get(p) {
            Some('%') => {
                p += 1;
                resume = Some((p, v));
            }
            Some(c) if *c == '_' || *c == value[v] => {
                v += 1;
                p += 1;
            }
            _ => match resume {
                Some((after, from)) => {
                    p = after;
                    v = from + 1;
                    resume = Some((after, v));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

fn resolve(operand: &Operand, lookup: &dyn Fn(&str) -> Option<String>) -> Option<Value> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Ident(name) => lookup(name).map(Value::Str),
    }
}

fn as_num(v: &Value) -> Option<f64> {
    match v {
        Value::Num(n) => Some(*n),
        Value::Str(s) => s.trim().parse().ok(),
        Value::Bool(_) => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Str(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::Str(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x == y),
        (Value::Num(_), _) | (_, Value::Num(_)) => Some(as_num(a)? == as_num(b)?),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => Some(as_bool(a)? == as_bool(b)?),
    }
}

impl Expr {
    /// Evaluate with SQL three-valued logic; `None` is unknown.
    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Option<bool> {
        match self {
            Expr::Or(terms) => {
                let mut result = Some(false);
                for term in terms {
                    match term.eval(lookup) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => result = None,
                    }
                }
                result
            }
            Expr::And(terms) => {
                let mut result = Some(true);
                for term in terms {
                    match term.eval(lookup) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => result = None,
                    }
                }
                result
            }
            Expr::Not(e) => e.eval(lookup).map(|b| !b),
            Expr::IsNull { ident, negated } => Some(lookup(ident).is_none() != *negated),
            Expr::Compare { op, left, right } => {
                let l = resolve(left, lookup)?;
                let r = resolve(right, lookup)?;
                match op {
                    CmpOp::Eq => values_equal(&l, &r),
                    CmpOp::Ne => values_equal(&l, &r).map(|b| !b),
                    _ => {
                        let ordering = match (&l, &r) {
                            (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
                            _ => as_num(&l)?.partial_cmp(&as_num(&r)?),
                        }?;
                        Some(match op {
                            CmpOp::Lt => ordering.is_lt(),
                            CmpOp::Le => ordering.is_le(),
                            CmpOp::Gt => ordering.is_gt(),
                            CmpOp::Ge => ordering.is_ge(),
                            CmpOp::Eq | CmpOp::Ne => unreachable!(),
                        })
                    }
                }
            }
            Expr::In {
                ident,
                values,
                negated,
            } => {
                let v = Value::Str(lookup(ident)?);
                let found = values
                    .iter()
                    .any(|candidate| values_equal(&v, candidate) == Some(true));
                Some(found != *negated)
            }
            Expr::Like {
                ident,
                pattern,
                negated,
            } => {
                let v: Vec<char> = lookup(ident)?.chars().collect();
                let p: Vec<char> = pattern.chars().collect();
                Some(like(&v, &p) != *negated)
            }
            Expr::Operand(o) => resolve(o, lookup).as_ref().and_then(as_bool),
        }
    }
}

/// A parsed selector. The empty selector selects everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    expr: Option<Expr>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::default());
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: input.len(),
            depth: 0,
        };
        let expr = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return parser.error("unexpected trailing input");
        }
        Ok(Self { expr: Some(expr) })
    }

    pub fn expr(&self) -> Option<&Expr> {
        self.expr.as_ref()
    }

    /// Evaluate against message properties and `JMS*` header fields.
    pub fn matches(&self, message: &BrokerMessage) -> bool {
        let expr = match &self.expr {
            Some(e) => e,
            None => return true,
        };
        let lookup = |name: &str| -> Option<String> {
            match name {
                "JMSMessageID" => message.id.clone(),
                "JMSCorrelationID" => message.correlation_id.clone(),
                "JMSType" => message.message_type.clone(),
                "JMSPriority" => message.priority.map(|p| p.to_string()),
                "JMSTimestamp" => message.timestamp.map(|t| t.to_string()),
                "JMSExpiration" => message.expiration.map(|t| t.to_string()),
                _ => message.property(name).map(str::to_string),
            }
        };
        expr.eval(&lookup) == Some(true)
    }
}
