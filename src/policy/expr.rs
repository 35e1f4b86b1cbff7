//! 受限表达式语言：规则条件与参数改写
//!
//! 词法 -> 递归下降解析为 AST，策略加载时编译一次。求值只读取 `tool` / `context` / `args` 三个绑定，
//! 没有赋值（改写作用在参数副本上）、没有循环、没有 I/O；嵌套深度与 token 数在解析期限定。

use std::cmp::Ordering;

use serde_json::{Map, Value};
use thiserror::Error;

/// 最大嵌套深度
pub const MAX_DEPTH: usize = 64;
/// 单个表达式的最大 token 数
pub const MAX_TOKENS: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found} at {pos}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        pos: usize,
    },

    #[error("unexpected end of expression, expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("unknown binding '{0}' (expected tool, context or args)")]
    UnknownRoot(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("expression too large (nesting deeper than 64 or more than 4096 tokens)")]
    TooComplex,

    #[error("type error: {0}")]
    Type(String),

    #[error("transform target must be an args path, got '{0}'")]
    InvalidTarget(String),
}

// ---------------------------------------------------------------------------
// 词法

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Minus,
    Semi,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {n}"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Ident(s) => format!("identifier '{s}'"),
            other => format!("{other:?}"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if tokens.len() > MAX_TOKENS {
            return Err(ExprError::TooComplex);
        }
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let following = chars.get(i + 1).copied();
        let two = |next: char| following == Some(next);
        let (token, width) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            ',' => (Token::Comma, 1),
            '.' => (Token::Dot, 1),
            ';' => (Token::Semi, 1),
            '-' => (Token::Minus, 1),
            '!' if two('=') => (Token::Ne, 2),
            '!' => (Token::Not, 1),
            '=' if two('=') => (Token::Eq, 2),
            '=' => (Token::Assign, 1),
            '<' if two('=') => (Token::Le, 2),
            '<' => (Token::Lt, 1),
            '>' if two('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '&' if two('&') => (Token::And, 2),
            '|' if two('|') => (Token::Or, 2),
            '\'' | '"' => {
                let (s, end) = lex_string(&chars, i)?;
                tokens.push((Token::Str(s), start));
                i = end;
                continue;
            }
            c if c.is_ascii_digit() => {
                let mut end = i;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                // 紧跟在 `.` 之后的数字是路径下标（args.items.0.1），不吞小数部分；
                // 小数点后必须跟数字，否则留给路径访问（args.items.0.name）
                let after_dot = matches!(tokens.last(), Some((Token::Dot, _)));
                if !after_dot
                    && end + 1 < chars.len() && chars[end] == '.' && chars[end + 1].is_ascii_digit() {
                    end += 1;
                    while end < chars.len() && chars[end].is_ascii_digit() {
                        end += 1;
                    }
                }
                let text: String = chars[i..end].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push((Token::Num(n), start));
                i = end;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                tokens.push((Token::Ident(chars[i..end].iter().collect()), start));
                i = end;
                continue;
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, pos: i }),
        };
        tokens.push((token, start));
        i += width;
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars.get(i + 1).ok_or(ExprError::UnterminatedString(start))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::UnterminatedString(start))
}

// ---------------------------------------------------------------------------
// AST

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Tool,
    Context,
    Args,
}

impl Root {
    fn parse(name: &str) -> Result<Self, ExprError> {
        match name {
            "tool" => Ok(Root::Tool),
            "context" => Ok(Root::Context),
            "args" => Ok(Root::Args),
            other => Err(ExprError::UnknownRoot(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Root::Tool => "tool",
            Root::Context => "context",
            Root::Args => "args",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// 内置函数（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Len,
    Contains,
    StartsWith,
    EndsWith,
    Lower,
    Exists,
    Min,
    Max,
}

impl Func {
    fn parse(name: &str) -> Result<Self, ExprError> {
        Ok(match name {
            "len" => Func::Len,
            "contains" => Func::Contains,
            "starts_with" => Func::StartsWith,
            "ends_with" => Func::EndsWith,
            "lower" => Func::Lower,
            "exists" => Func::Exists,
            "min" => Func::Min,
            "max" => Func::Max,
            other => return Err(ExprError::UnknownFunction(other.to_string())),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Func::Len => "len",
            Func::Contains => "contains",
            Func::StartsWith => "starts_with",
            Func::EndsWith => "ends_with",
            Func::Lower => "lower",
            Func::Exists => "exists",
            Func::Min => "min",
            Func::Max => "max",
        }
    }

    fn arity(self) -> usize {
        match self {
            Func::Len | Func::Lower | Func::Exists => 1,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Path(Root, Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// 解析

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(src: &str) -> Result<Self, ExprError> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
            depth: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), ExprError> {
        match self.next() {
            Some((t, _)) if t == want => Ok(()),
            Some((t, pos)) => Err(ExprError::UnexpectedToken {
                found: t.describe(),
                expected,
                pos,
            }),
            None => Err(ExprError::UnexpectedEnd(expected)),
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooComplex);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Ident(s)) if s == "in" => BinOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary();
                self.leave();
                Ok(Expr::Not(Box::new(inner?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.parse_unary();
                self.leave();
                Ok(Expr::Neg(Box::new(inner?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let (token, pos) = self.next().ok_or(ExprError::UnexpectedEnd("a value"))?;
        match token {
            Token::Num(n) => Ok(Expr::Literal(number_value(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.parse_list(Token::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    let func = Func::parse(&name)?;
                    self.pos += 1;
                    let args = self.parse_list(Token::RParen, "')'")?;
                    if args.len() != func.arity() {
                        return Err(ExprError::Arity {
                            name: func.name(),
                            expected: func.arity(),
                            got: args.len(),
                        });
                    }
                    Ok(Expr::Call(func, args))
                }
                _ => {
                    let root = Root::parse(&name)?;
                    let segments = self.parse_segments()?;
                    Ok(Expr::Path(root, segments))
                }
            },
            other => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "a value",
                pos,
            }),
        }
    }

    /// `.name` / `.0` 组成的访问路径
    fn parse_segments(&mut self) -> Result<Vec<String>, ExprError> {
        let mut segments = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            match self.next() {
                Some((Token::Ident(s), _)) => segments.push(s),
                Some((Token::Num(n), _)) if n.fract() == 0.0 && n >= 0.0 => {
                    segments.push(format!("{}", n as u64))
                }
                Some((t, pos)) => {
                    return Err(ExprError::UnexpectedToken {
                        found: t.describe(),
                        expected: "a field name",
                        pos,
                    })
                }
                None => return Err(ExprError::UnexpectedEnd("a field name")),
            }
        }
        Ok(segments)
    }

    fn parse_list(&mut self, close: Token, expected: &'static str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            match self.next() {
                Some((Token::Comma, _)) => continue,
                Some((t, _)) if t == close => return Ok(items),
                Some((t, pos)) => {
                    return Err(ExprError::UnexpectedToken {
                        found: t.describe(),
                        expected,
                        pos,
                    })
                }
                None => return Err(ExprError::UnexpectedEnd(expected)),
            }
        }
    }
}

impl Expr {
    /// 编译条件表达式
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(src)?;
        let expr = parser.parse_expr()?;
        match parser.next() {
            None => Ok(expr),
            Some((t, pos)) => Err(ExprError::UnexpectedToken {
                found: t.describe(),
                expected: "end of expression",
                pos,
            }),
        }
    }

    /// 对绑定求值；bindings 形如 `{"tool": .., "context": .., "args": ..}`
    pub fn eval(&self, bindings: &Value) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Array(items) => items
                .iter()
                .map(|e| e.eval(bindings))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Path(root, segments) => Ok(lookup(bindings.get(root.as_str()), segments)),
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(&inner.eval(bindings)?, "!")?)),
            Expr::Neg(inner) => match inner.eval(bindings)?.as_f64() {
                Some(n) => Ok(number_value(-n)),
                None => Err(ExprError::Type("unary '-' expects a number".to_string())),
            },
            Expr::And(lhs, rhs) => {
                if !as_bool(&lhs.eval(bindings)?, "&&")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&rhs.eval(bindings)?, "&&")?))
            }
            Expr::Or(lhs, rhs) => {
                if as_bool(&lhs.eval(bindings)?, "||")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&rhs.eval(bindings)?, "||")?))
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(bindings)?;
                let b = rhs.eval(bindings)?;
                Ok(Value::Bool(binary(*op, &a, &b)))
            }
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|e| e.eval(bindings))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*func, &values)
            }
        }
    }

    /// 条件必须求值为布尔
    pub fn eval_bool(&self, bindings: &Value) -> Result<bool, ExprError> {
        match self.eval(bindings)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::Type(format!(
                "condition must evaluate to a boolean, got {}",
                type_name(&other)
            ))),
        }
    }
}

fn lookup(root: Option<&Value>, segments: &[String]) -> Value {
    let mut current = match root {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// 整数值保持为整数（100 而不是 100.0），以便与 JSON 参数直接比较
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn as_bool(value: &Value, op: &str) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| {
        ExprError::Type(format!("'{op}' expects booleans, got {}", type_name(value)))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 数字按 f64 比较（1 == 1.0），数组逐项比较，其余按 JSON 相等
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// 不可比较的值（如 null 与数字）做大小比较时结果为 false
fn binary(op: BinOp, a: &Value, b: &Value) -> bool {
    match op {
        BinOp::Eq => values_equal(a, b),
        BinOp::Ne => !values_equal(a, b),
        BinOp::Lt => compare(a, b) == Some(Ordering::Less),
        BinOp::Le => matches!(compare(a, b), Some(Ordering::Less | Ordering::Equal)),
        BinOp::Gt => compare(a, b) == Some(Ordering::Greater),
        BinOp::Ge => matches!(compare(a, b), Some(Ordering::Greater | Ordering::Equal)),
        BinOp::In => contains(b, a),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.iter().any(|item| values_equal(item, needle)),
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn call(func: Func, args: &[Value]) -> Result<Value, ExprError> {
    match func {
        Func::Len => match &args[0] {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(ExprError::Type(format!("len() of {}", type_name(other)))),
        },
        Func::Contains => Ok(Value::Bool(contains(&args[0], &args[1]))),
        Func::StartsWith => Ok(Value::Bool(match (&args[0], &args[1]) {
            (Value::String(s), Value::String(p)) => s.starts_with(p.as_str()),
            _ => false,
        })),
        Func::EndsWith => Ok(Value::Bool(match (&args[0], &args[1]) {
            (Value::String(s), Value::String(p)) => s.ends_with(p.as_str()),
            _ => false,
        })),
        Func::Lower => match &args[0] {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Err(ExprError::Type(format!("lower() of {}", type_name(other)))),
        },
        Func::Exists => Ok(Value::Bool(!args[0].is_null())),
        Func::Min | Func::Max => {
            let (Some(a), Some(b)) = (args[0].as_f64(), args[1].as_f64()) else {
                return Err(ExprError::Type(format!("{}() expects numbers", func.name())));
            };
            let picked = if func == Func::Min { a.min(b) } else { a.max(b) };
            Ok(number_value(picked))
        }
    }
}

// ---------------------------------------------------------------------------
// 参数改写

/// 改写表达式：`args.limit = min(args.limit, 100); args.dry_run = true`
///
/// 所有右值都基于改写前的绑定求值，结果写入参数副本。
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    assignments: Vec<(Vec<String>, Expr)>,
}

impl Transform {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let mut parser = Parser::new(src)?;
        let mut assignments = Vec::new();

        while !parser.at_end() {
            if parser.peek() == Some(&Token::Semi) {
                parser.pos += 1;
                continue;
            }
            let target = match parser.next() {
                Some((Token::Ident(name), _)) if name == "args" => parser.parse_segments()?,
                Some((t, _)) => return Err(ExprError::InvalidTarget(t.describe())),
                None => return Err(ExprError::UnexpectedEnd("an assignment")),
            };
            if target.is_empty() {
                return Err(ExprError::InvalidTarget("args".to_string()));
            }
            parser.expect(Token::Assign, "'='")?;
            let value = parser.parse_expr()?;
            match parser.next() {
                None | Some((Token::Semi, _)) => {}
                Some((t, pos)) => {
                    return Err(ExprError::UnexpectedToken {
                        found: t.describe(),
                        expected: "';'",
                        pos,
                    })
                }
            }
            assignments.push((target, value));
        }

        if assignments.is_empty() {
            return Err(ExprError::UnexpectedEnd("an assignment"));
        }
        Ok(Self { assignments })
    }

    /// 返回改写后的参数副本；原参数不是对象时以空对象为起点
    pub fn apply(&self, bindings: &Value) -> Result<Value, ExprError> {
        let mut args = match bindings.get("args") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => Value::Object(Map::new()),
        };
        for (path, expr) in &self.assignments {
            let value = expr.eval(bindings)?;
            set_path(&mut args, path, value);
        }
        Ok(args)
    }
}

fn set_path(target: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = target;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings() -> Value {
        json!({
            "tool": { "name": "delete_service", "verb": "delete", "mutates": true, "scope": "service",
                      "tags": ["services", "danger"] },
            "context": { "session_cost": 3.5, "published": true, "user_id": "ops" },
            "args": { "id": "svc-1", "limit": 500, "items": [{ "name": "a" }], "note": "Prod change" }
        })
    }

    fn eval(src: &str) -> Value {
        Expr::parse(src).unwrap().eval(&bindings()).unwrap()
    }

    #[test]
    fn test_paths_and_comparisons() {
        assert_eq!(eval("tool.mutates && context.published"), json!(true));
        assert_eq!(eval("context.session_cost > 3"), json!(true));
        assert_eq!(eval("context.session_cost <= 3.5"), json!(true));
        assert_eq!(eval("tool.verb == 'delete'"), json!(true));
        assert_eq!(eval("tool.verb != \"delete\""), json!(false));
        assert_eq!(eval("args.items.0.name == 'a'"), json!(true));
        assert_eq!(eval("args.missing.deep"), Value::Null);
    }

    #[test]
    fn test_numeric_path_segments() {
        let bindings = json!({"args": {"items": [["a", "b"], ["c", "d"]], "rate": 0.5}});
        let second = Expr::parse("args.items.0.1").unwrap();
        assert_eq!(second.eval(&bindings).unwrap(), json!("b"));
        assert_eq!(Expr::parse("args.items.1.0 == 'c'").unwrap().eval_bool(&bindings), Ok(true));
        // 非路径位置的小数照常解析
        assert_eq!(Expr::parse("args.rate == 0.5").unwrap().eval_bool(&bindings), Ok(true));
    }

    #[test]
    fn test_in_and_functions() {
        assert_eq!(eval("'danger' in tool.tags"), json!(true));
        assert_eq!(eval("tool.scope in ['form', 'workflow']"), json!(false));
        assert_eq!(eval("contains(lower(args.note), 'prod')"), json!(true));
        assert_eq!(eval("starts_with(tool.name, 'delete_')"), json!(true));
        assert_eq!(eval("ends_with(tool.name, '_form')"), json!(false));
        assert_eq!(eval("len(args.items) == 1"), json!(true));
        assert_eq!(eval("exists(args.id) && !exists(args.nope)"), json!(true));
        assert_eq!(eval("min(args.limit, 100)"), json!(100));
        assert_eq!(eval("max(-1, 2.5)"), json!(2.5));
    }

    #[test]
    fn test_short_circuit_skips_type_error() {
        // 右侧 args.id 是字符串，若被求值会触发类型错误
        assert_eq!(eval("false && args.id"), json!(false));
        assert_eq!(eval("true || args.id"), json!(true));
    }

    #[test]
    fn test_incomparable_ordering_is_false() {
        assert_eq!(eval("args.missing > 10"), json!(false));
        assert_eq!(eval("args.id < 10"), json!(false));
    }

    #[test]
    fn test_non_boolean_condition_is_error() {
        let expr = Expr::parse("args.id").unwrap();
        assert!(matches!(expr.eval_bool(&bindings()), Err(ExprError::Type(_))));
        let expr = Expr::parse("!args.limit").unwrap();
        assert!(expr.eval_bool(&bindings()).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Expr::parse("env.HOME == 1"), Err(ExprError::UnknownRoot(_))));
        assert!(matches!(Expr::parse("system('rm')"), Err(ExprError::UnknownFunction(_))));
        assert!(matches!(Expr::parse("len(1, 2)"), Err(ExprError::Arity { .. })));
        assert!(matches!(Expr::parse("'open"), Err(ExprError::UnterminatedString(0))));
        assert!(matches!(Expr::parse("a & b"), Err(ExprError::UnexpectedChar { .. })));
        assert!(Expr::parse("tool.mutates &&").is_err());
        assert!(Expr::parse("(true").is_err());
        assert!(Expr::parse("true true").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}true{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(Expr::parse(&deep), Err(ExprError::TooComplex));
        let ok = format!("{}true{}", "(".repeat(10), ")".repeat(10));
        assert!(Expr::parse(&ok).is_ok());
    }

    #[test]
    fn test_transform_rewrites_copy() {
        let t = Transform::parse("args.limit = min(args.limit, 100); args.options.dry_run = true;")
            .unwrap();
        let b = bindings();
        let out = t.apply(&b).unwrap();
        assert_eq!(out["limit"], json!(100));
        assert_eq!(out["options"]["dry_run"], json!(true));
        assert_eq!(out["id"], json!("svc-1"));
        assert_eq!(b["args"]["limit"], json!(500));
    }

    #[test]
    fn test_transform_rejects_non_args_target() {
        assert!(matches!(
            Transform::parse("context.session_cost = 0"),
            Err(ExprError::InvalidTarget(_))
        ));
        assert!(matches!(Transform::parse("args = 1"), Err(ExprError::InvalidTarget(_))));
        assert!(Transform::parse("").is_err());
    }
}
