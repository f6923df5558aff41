//! Sandboxed expression evaluation.
//!
//! Expressions drive condition branches, loop filters, and transform
//! operations. The language is deliberately small: literals, `${...}`
//! references, in-scope variables, member/index access, arithmetic,
//! comparisons, boolean logic with JS-like truthiness, ternaries, and
//! array/object literals. Evaluation is pure (no IO, no host globals) and
//! checks a deadline between node evaluations, so a runaway expression
//! fails with a timeout instead of stalling the scheduler.
//!
//! `extract_references` is the side channel used by dependency analysis:
//! it returns the first path segment of every reference in an expression,
//! excluding internal roots and scoped loop variables.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::reference::{
    self, CONTEXT_ROOT, ExprEval, METADATA_ROOT, ResolveEnv, access_index, access_key,
    find_closing_brace, type_name,
};

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Expression evaluator with a per-evaluation time budget.
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    budget: Duration,
}

impl Evaluator {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Evaluate `source` against the environment, returning the value.
    pub fn evaluate(&self, source: &str, env: &ResolveEnv<'_>) -> Result<Value> {
        let deadline = Instant::now() + self.budget;
        let tokens = lex(source)?;
        let ast = Parser::new(tokens, source).parse()?;
        let ctx = EvalCtx {
            evaluator: self,
            deadline,
            source,
        };
        ctx.eval(&ast, env)
    }

    /// JS-like truthiness: null and empty strings are false, zero is
    /// false, arrays and objects are true.
    pub fn truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl ExprEval for Evaluator {
    fn eval_in_env(&self, expr: &str, env: &ResolveEnv<'_>) -> Result<Value> {
        self.evaluate(expr, env)
    }
}

/// First path segments of all references in `source` that name steps:
/// internal roots (`context`, `metadata`) and scoped variables are
/// excluded.
pub fn extract_references(source: &str, scoped: &HashSet<String>) -> BTreeSet<String> {
    reference::extract_reference_roots(source)
        .into_iter()
        .filter(|root| root != CONTEXT_ROOT && root != METADATA_ROOT && !scoped.contains(root))
        .collect()
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Ref(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn expr_error(source: &str, message: impl Into<String>) -> FlowError {
    FlowError::Expression {
        expression: source.to_string(),
        message: message.into(),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '$' if i + 1 < chars.len() && chars[i + 1] == '{' => {
                let close = find_closing_brace(&chars, i + 2)
                    .ok_or_else(|| expr_error(source, "unclosed reference"))?;
                let content: String = chars[i + 2..close].iter().collect();
                tokens.push(Token::Ref(content));
                i = close + 1;
            }
            '0'..='9' => {
                let mut text = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    text.push(chars[i]);
                    i += 1;
                }
                let number = text
                    .parse::<f64>()
                    .map_err(|_| expr_error(source, format!("invalid number '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(expr_error(source, "unterminated string"));
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(text));
            }
            c if is_ident_start(c) => {
                let mut text = String::new();
                while i < chars.len() && is_ident_char(chars[i]) {
                    text.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Ident(text));
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '!' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(expr_error(source, "unexpected '=' (did you mean '==')"));
                }
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if i + 1 < chars.len() && chars[i + 1] == '&' {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(expr_error(source, "unexpected '&' (did you mean '&&')"));
                }
            }
            '|' => {
                if i + 1 < chars.len() && chars[i + 1] == '|' {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(expr_error(source, "unexpected '|' (did you mean '||')"));
                }
            }
            other => {
                return Err(expr_error(source, format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Ast {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Ref(String),
    Var(String),
    Array(Vec<Ast>),
    Object(Vec<(String, Ast)>),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, source: &'a str) -> Self {
        Self {
            tokens,
            pos: 0,
            source,
        }
    }

    fn parse(mut self) -> Result<Ast> {
        if self.tokens.is_empty() {
            return Err(expr_error(self.source, "empty expression"));
        }
        let ast = self.ternary()?;
        if self.pos < self.tokens.len() {
            return Err(expr_error(
                self.source,
                format!("unexpected trailing token {:?}", self.tokens[self.pos]),
            ));
        }
        Ok(ast)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(expr_error(
                self.source,
                format!("expected {what}, found {t:?}"),
            )),
            None => Err(expr_error(self.source, format!("expected {what}"))),
        }
    }

    fn ternary(&mut self) -> Result<Ast> {
        let cond = self.or()?;
        if matches!(self.peek(), Some(Token::Question)) {
            self.advance();
            let then = self.ternary()?;
            self.expect(Token::Colon, "':' in ternary")?;
            let otherwise = self.ternary()?;
            return Ok(Ast::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Ast> {
        let mut left = self.and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let right = self.and()?;
            left = Ast::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Ast> {
        let mut left = self.equality()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let right = self.equality()?;
            left = Ast::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Ast> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.comparison()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Ast> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Ast> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Ast> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Ast> {
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                Ok(Ast::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Ast::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Ast> {
        let mut node = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            node = Ast::Member(Box::new(node), name);
                        }
                        other => {
                            return Err(expr_error(
                                self.source,
                                format!("expected property name after '.', found {other:?}"),
                            ));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.ternary()?;
                    self.expect(Token::RBracket, "']'")?;
                    node = Ast::Index(Box::new(node), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn primary(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Ast::Number(n)),
            Some(Token::Str(s)) => Ok(Ast::Str(s)),
            Some(Token::Ref(r)) => Ok(Ast::Ref(r)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Ast::Bool(true)),
                "false" => Ok(Ast::Bool(false)),
                "null" => Ok(Ast::Null),
                _ => Ok(Ast::Var(name)),
            },
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.advance();
                    return Ok(Ast::Array(items));
                }
                loop {
                    items.push(self.ternary()?);
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => {
                            return Err(expr_error(
                                self.source,
                                format!("expected ',' or ']' in array, found {other:?}"),
                            ));
                        }
                    }
                }
                Ok(Ast::Array(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if matches!(self.peek(), Some(Token::RBrace)) {
                    self.advance();
                    return Ok(Ast::Object(entries));
                }
                loop {
                    let key = match self.advance() {
                        Some(Token::Ident(k)) => k,
                        Some(Token::Str(k)) => k,
                        other => {
                            return Err(expr_error(
                                self.source,
                                format!("expected object key, found {other:?}"),
                            ));
                        }
                    };
                    self.expect(Token::Colon, "':' after object key")?;
                    entries.push((key, self.ternary()?));
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBrace) => break,
                        other => {
                            return Err(expr_error(
                                self.source,
                                format!("expected ',' or '}}' in object, found {other:?}"),
                            ));
                        }
                    }
                }
                Ok(Ast::Object(entries))
            }
            other => Err(expr_error(
                self.source,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

struct EvalCtx<'a> {
    evaluator: &'a Evaluator,
    deadline: Instant,
    source: &'a str,
}

impl EvalCtx<'_> {
    fn eval(&self, ast: &Ast, env: &ResolveEnv<'_>) -> Result<Value> {
        if Instant::now() >= self.deadline {
            return Err(FlowError::OperationTimeout {
                operation: "expression evaluation".to_string(),
                timeout_ms: self.evaluator.budget.as_millis() as u64,
            });
        }
        match ast {
            Ast::Null => Ok(Value::Null),
            Ast::Bool(b) => Ok(Value::Bool(*b)),
            Ast::Number(n) => norm_number(*n, self.source),
            Ast::Str(s) => Ok(Value::String(s.clone())),
            Ast::Ref(raw) => {
                let mut visited = HashSet::new();
                reference::resolve_path(raw, env, self.evaluator, &mut visited)
            }
            Ast::Var(name) => env.scope.lookup(name).cloned().ok_or_else(|| {
                expr_error(self.source, format!("unknown identifier '{name}'"))
            }),
            Ast::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, env)?);
                }
                Ok(Value::Array(out))
            }
            Ast::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, env)?);
                }
                Ok(Value::Object(map))
            }
            Ast::Unary(op, inner) => {
                let value = self.eval(inner, env)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!Evaluator::truthy(&value))),
                    UnaryOp::Neg => norm_number(-self.number(&value)?, self.source),
                }
            }
            Ast::Binary(op, left, right) => self.binary(*op, left, right, env),
            Ast::Ternary(cond, then, otherwise) => {
                let cond = self.eval(cond, env)?;
                if Evaluator::truthy(&cond) {
                    self.eval(then, env)
                } else {
                    self.eval(otherwise, env)
                }
            }
            Ast::Member(obj, key) => {
                let value = self.eval(obj, env)?;
                access_key(&value, key, self.source)
            }
            Ast::Index(obj, index) => {
                let value = self.eval(obj, env)?;
                let index = self.eval(index, env)?;
                match index {
                    Value::String(key) => access_key(&value, &key, self.source),
                    Value::Number(n) => {
                        let i = n.as_u64().ok_or_else(|| {
                            expr_error(self.source, "index must be a non-negative integer")
                        })?;
                        access_index(&value, i as usize, self.source)
                    }
                    other => Err(expr_error(
                        self.source,
                        format!("cannot index with {}", type_name(&other)),
                    )),
                }
            }
        }
    }

    fn binary(&self, op: BinaryOp, left: &Ast, right: &Ast, env: &ResolveEnv<'_>) -> Result<Value> {
        // Short-circuiting operators return the deciding operand.
        if op == BinaryOp::And {
            let l = self.eval(left, env)?;
            return if Evaluator::truthy(&l) {
                self.eval(right, env)
            } else {
                Ok(l)
            };
        }
        if op == BinaryOp::Or {
            let l = self.eval(left, env)?;
            return if Evaluator::truthy(&l) {
                Ok(l)
            } else {
                self.eval(right, env)
            };
        }

        let l = self.eval(left, env)?;
        let r = self.eval(right, env)?;
        match op {
            BinaryOp::Add => {
                if l.is_string() || r.is_string() {
                    let mut out = reference::value_to_text(&l)?;
                    out.push_str(&reference::value_to_text(&r)?);
                    Ok(Value::String(out))
                } else {
                    norm_number(self.number(&l)? + self.number(&r)?, self.source)
                }
            }
            BinaryOp::Sub => norm_number(self.number(&l)? - self.number(&r)?, self.source),
            BinaryOp::Mul => norm_number(self.number(&l)? * self.number(&r)?, self.source),
            BinaryOp::Div => {
                let divisor = self.number(&r)?;
                if divisor == 0.0 {
                    return Err(expr_error(self.source, "division by zero"));
                }
                norm_number(self.number(&l)? / divisor, self.source)
            }
            BinaryOp::Rem => {
                let divisor = self.number(&r)?;
                if divisor == 0.0 {
                    return Err(expr_error(self.source, "modulo by zero"));
                }
                norm_number(self.number(&l)? % divisor, self.source)
            }
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = self.compare(&l, &r)?;
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn number(&self, value: &Value) -> Result<f64> {
        value.as_f64().ok_or_else(|| {
            expr_error(
                self.source,
                format!("expected a number, got {}", type_name(value)),
            )
        })
    }

    fn compare(&self, l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
        match (l, r) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b)
                    .ok_or_else(|| expr_error(self.source, "cannot compare NaN"))
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(expr_error(
                self.source,
                format!("cannot compare {} with {}", type_name(l), type_name(r)),
            )),
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        _ => l == r,
    }
}

/// Numbers with no fractional part normalize to JSON integers.
fn norm_number(x: f64, source: &str) -> Result<Value> {
    if !x.is_finite() {
        return Err(expr_error(source, "arithmetic produced a non-finite number"));
    }
    if x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        Ok(Value::from(x as i64))
    } else {
        Ok(Value::from(x))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeChain;
    use serde_json::json;
    use std::collections::HashMap;

    fn eval(source: &str) -> Result<Value> {
        eval_with(source, &ScopeChain::new())
    }

    fn eval_with(source: &str, scope: &ScopeChain) -> Result<Value> {
        let results = HashMap::from([
            ("fetch".to_string(), json!({ "result": { "count": 4, "tags": ["a", "b"] } })),
            ("limits".to_string(), json!({ "result": 10 })),
        ]);
        let context = HashMap::from([("threshold".to_string(), json!(5))]);
        let metadata = HashMap::new();
        let env = ResolveEnv {
            results: &results,
            context: &context,
            metadata: &metadata,
            scope,
        };
        Evaluator::new(Duration::from_millis(500)).evaluate(source, &env)
    }

    // -------------------------------------------------------------------
    // Literals and arithmetic
    // -------------------------------------------------------------------

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(eval("10 % 3").unwrap(), json!(1));
        assert_eq!(eval("7 / 2").unwrap(), json!(3.5));
    }

    #[test]
    fn test_integer_normalization() {
        assert_eq!(eval("2 * 3").unwrap(), json!(6));
        assert_eq!(eval("1.5 + 1.5").unwrap(), json!(3));
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(eval("-4 + 1").unwrap(), json!(-3));
        assert_eq!(eval("!0").unwrap(), json!(true));
        assert_eq!(eval("!'text'").unwrap(), json!(false));
    }

    #[test]
    fn test_division_by_zero_fails() {
        let err = eval("1 / 0").unwrap_err();
        assert!(err.to_string().contains("division by zero"), "got: {err}");
    }

    // -------------------------------------------------------------------
    // Strings, comparisons, equality
    // -------------------------------------------------------------------

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval("'a' + 'b'").unwrap(), json!("ab"));
        assert_eq!(eval("'n=' + 3").unwrap(), json!("n=3"));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("3 > 2").unwrap(), json!(true));
        assert_eq!(eval("'apple' < 'banana'").unwrap(), json!(true));
        assert_eq!(eval("2 >= 2 && 1 != 2").unwrap(), json!(true));
    }

    #[test]
    fn test_equality_across_number_forms() {
        assert_eq!(eval("4 == 4.0").unwrap(), json!(true));
        assert_eq!(eval("'4' == 4").unwrap(), json!(false));
    }

    // -------------------------------------------------------------------
    // Boolean logic and ternary
    // -------------------------------------------------------------------

    #[test]
    fn test_and_or_return_operands() {
        assert_eq!(eval("0 || 'fallback'").unwrap(), json!("fallback"));
        assert_eq!(eval("'x' && 5").unwrap(), json!(5));
        assert_eq!(eval("null && 5").unwrap(), json!(null));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(eval("2 > 1 ? 'high' : 'low'").unwrap(), json!("high"));
        assert_eq!(eval("0 ? 'high' : 'low'").unwrap(), json!("low"));
    }

    // -------------------------------------------------------------------
    // References, member and index access
    // -------------------------------------------------------------------

    #[test]
    fn test_reference_member_access() {
        assert_eq!(eval("${fetch.result.count} + 1").unwrap(), json!(5));
        assert_eq!(eval("${fetch.result}.count * 2").unwrap(), json!(8));
        assert_eq!(eval("${fetch.result.tags}[1]").unwrap(), json!("b"));
    }

    #[test]
    fn test_reference_against_context() {
        assert_eq!(
            eval("${fetch.result.count} < ${context.threshold}").unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_scope_variables() {
        let mut scope = ScopeChain::new();
        scope.push(HashMap::from([
            ("item".to_string(), json!({ "value": 6 })),
            ("$index".to_string(), json!(2)),
        ]));
        assert_eq!(eval_with("item.value * $index", &scope).unwrap(), json!(12));
        assert_eq!(eval_with("${item.value} > 5", &scope).unwrap(), json!(true));
    }

    #[test]
    fn test_unknown_identifier_fails() {
        let err = eval("bogus + 1").unwrap_err();
        assert!(err.to_string().contains("unknown identifier"), "got: {err}");
    }

    // -------------------------------------------------------------------
    // Array and object literals
    // -------------------------------------------------------------------

    #[test]
    fn test_array_and_object_literals() {
        assert_eq!(eval("[1, 2 + 3]").unwrap(), json!([1, 5]));
        assert_eq!(
            eval("{ total: ${fetch.result.count}, label: 'x' }").unwrap(),
            json!({ "total": 4, "label": "x" })
        );
        assert_eq!(eval("[]").unwrap(), json!([]));
    }

    // -------------------------------------------------------------------
    // Budget
    // -------------------------------------------------------------------

    #[test]
    fn test_zero_budget_times_out() {
        let results = HashMap::new();
        let context = HashMap::new();
        let metadata = HashMap::new();
        let scope = ScopeChain::new();
        let env = ResolveEnv {
            results: &results,
            context: &context,
            metadata: &metadata,
            scope: &scope,
        };
        let err = Evaluator::new(Duration::ZERO)
            .evaluate("1 + 1", &env)
            .unwrap_err();
        assert_eq!(
            err.kind(),
            rpcflow_types::error::ErrorKind::OperationTimeout
        );
    }

    // -------------------------------------------------------------------
    // Reference extraction
    // -------------------------------------------------------------------

    #[test]
    fn test_extract_references_filters_internal_and_scoped() {
        let scoped: HashSet<String> =
            ["item".to_string(), "$index".to_string()].into_iter().collect();
        let refs = extract_references(
            "${fetch.result} + ${item.value} + ${context.limit} + ${other.x[${inner.y}]}",
            &scoped,
        );
        let expected: BTreeSet<String> = ["fetch", "inner", "other"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(refs, expected);
    }
}
