//! Boolean expressions for `condition` nodes.
//!
//! A small whitelisted language evaluated against the execution parameters.
//! Nothing in it can reach the host: the only inputs are literals and
//! parameter lookups.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | 'string' | "string" | true | false | null
//!          | path | "(" expr ")"
//! ```
//!
//! Paths are dotted (`params.region`, `retries`, `build.targets.0`); the
//! leading `params.` is optional. Missing parameters evaluate to `null`.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::WorkflowError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse `source`.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Condition` with the position of the problem.
    pub fn parse(source: &str) -> Result<Self, WorkflowError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(WorkflowError::Condition("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(token) = parser.peek() {
            return Err(WorkflowError::Condition(format!(
                "unexpected {:?} at token {} in '{}'",
                token, parser.pos, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate against execution parameters and coerce the result to bool.
    pub fn evaluate(&self, params: &Map<String, Value>) -> bool {
        truthy(&eval(&self.expr, params))
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, params: &Map<String, Value>) -> Result<bool, WorkflowError> {
    Ok(Condition::parse(source)?.evaluate(params))
}

fn tokenize(source: &str) -> Result<Vec<Token>, WorkflowError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(WorkflowError::Condition(format!(
                                "unterminated string in '{}'",
                                source
                            )))
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => ("==", 2),
                    ('!', Some('=')) => ("!=", 2),
                    ('<', Some('=')) => ("<=", 2),
                    ('>', Some('=')) => (">=", 2),
                    ('&', Some('&')) => ("&&", 2),
                    ('|', Some('|')) => ("||", 2),
                    ('!', _) => ("!", 1),
                    ('<', _) => ("<", 1),
                    ('>', _) => (">", 1),
                    _ => {
                        return Err(WorkflowError::Condition(format!(
                            "unexpected '{}' at offset {} in '{}'",
                            c, i, source
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|d| d.is_ascii_digit() || *d == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| {
                    WorkflowError::Condition(format!("invalid number '{}' in '{}'", text, source))
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|d| d.is_ascii_alphanumeric() || *d == '_' || *d == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                return Err(WorkflowError::Condition(format!(
                    "unexpected '{}' at offset {} in '{}'",
                    c, i, source
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, op: &str, word: &str) -> bool {
        let hit = match self.peek() {
            Some(Token::Op(o)) => *o == op,
            Some(Token::Ident(id)) => id == word,
            _ => false,
        };
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn or(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.and()?;
        while self.eat_keyword("||", "or") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, WorkflowError> {
        let mut left = self.unary()?;
        while self.eat_keyword("&&", "and") {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, WorkflowError> {
        if self.eat_keyword("!", "not") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, WorkflowError> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => CmpOp::Eq,
            Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn primary(&mut self) -> Result<Expr, WorkflowError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(id)) => Ok(match id.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                "and" | "or" | "not" => {
                    return Err(WorkflowError::Condition(format!("unexpected '{}'", id)))
                }
                _ => Expr::Path(parse_path(&id)?),
            }),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(WorkflowError::Condition("missing ')'".to_string())),
                }
            }
            Some(token) => Err(WorkflowError::Condition(format!("unexpected {:?}", token))),
            None => Err(WorkflowError::Condition(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

fn parse_path(id: &str) -> Result<Vec<String>, WorkflowError> {
    let mut segments: Vec<String> = id.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(WorkflowError::Condition(format!("invalid path '{}'", id)));
    }
    if segments.len() > 1 && segments[0] == "params" {
        segments.remove(0);
    }
    Ok(segments)
}

fn lookup(path: &[String], params: &Map<String, Value>) -> Value {
    let Some((first, rest)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = match params.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn eval(expr: &Expr, params: &Map<String, Value>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(path) => lookup(path, params),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, params))),
        Expr::And(left, right) => {
            Value::Bool(truthy(&eval(left, params)) && truthy(&eval(right, params)))
        }
        Expr::Or(left, right) => {
            Value::Bool(truthy(&eval(left, params)) || truthy(&eval(right, params)))
        }
        Expr::Compare(op, left, right) => {
            let (left, right) = (eval(left, params), eval(right, params));
            Value::Bool(compare(*op, &left, &right))
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right),
        CmpOp::Ne => !(ordering == Some(Ordering::Equal) || (ordering.is_none() && left == right)),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
