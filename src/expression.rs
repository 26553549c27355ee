//! Transformation expressions.
//!
//! A small, closed grammar in the style of a pandas one-liner:
//!
//! ```text
//! expr    := or_expr [ "if" or_expr "else" expr ]
//! or_expr := and_expr { "or" and_expr }
//! and_expr:= not_expr { "and" not_expr }
//! not_expr:= "not" not_expr | compare
//! compare := sum [ ("==" | "!=" | "<" | "<=" | ">" | ">=") sum ]
//! sum     := term { ("+" | "-") term }
//! term    := unary { ("*" | "/" | "%") unary }
//! unary   := "-" unary | postfix
//! postfix := primary { ".str." name "()" | "." method "(" args ")" }
//! primary := literal | frame "[" string "]" | helper "(" args ")" | "(" expr ")"
//! ```
//!
//! `frame` is `df`/`source` (the source table) or `renamed`/`derived` (the
//! table being built). Only the helpers in `Helper` can be called. Text is
//! parsed into an `Expr` tree once and evaluated column-wise against `Columns`.

use crate::error::{QaError, Result};
use crate::table::{Cell, Columns};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(v) => write!(f, "{}", v),
            Token::Float(v) => write!(f, "{}", v),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::End => write!(f, "end of expression"),
            other => {
                let sym = match other {
                    Token::LParen => "(",
                    Token::RParen => ")",
                    Token::LBracket => "[",
                    Token::RBracket => "]",
                    Token::Comma => ",",
                    Token::Dot => ".",
                    Token::Assign => "=",
                    Token::Plus => "+",
                    Token::Minus => "-",
                    Token::Star => "*",
                    Token::Slash => "/",
                    Token::Percent => "%",
                    Token::Eq => "==",
                    Token::Ne => "!=",
                    Token::Lt => "<",
                    Token::Le => "<=",
                    Token::Gt => ">",
                    _ => ">=",
                };
                f.write_str(sym)
            }
        }
    }
}

fn syntax(message: impl Into<String>) -> QaError {
    QaError::Expression(message.into())
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let token = if literal.contains('.') {
                literal
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| syntax(format!("bad number '{}'", literal)))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Token::Int)
                    .map_err(|_| syntax(format!("bad number '{}'", literal)))?
            };
            tokens.push(token);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax("unterminated string literal")),
                    Some(&ch) if ch == quote => break,
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| syntax("unterminated string literal"))?;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        value.push(ch);
                        i += 1;
                    }
                }
            }
            i += 1;
            tokens.push(Token::Str(value));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', _) => (Token::Assign, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            _ => return Err(syntax(format!("unexpected character '{}'", c))),
        };
        tokens.push(token);
        i += width;
    }

    tokens.push(Token::End);
    Ok(tokens)
}

/// Which table a column reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Source,
    Derived,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Str,
    Int,
    Float,
}

/// The whitelisted helper library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// `cap_value(x, cap=10000)`: element-wise minimum.
    CapValue,
    /// `concat(a, b, sep=' ')`
    Concat,
    /// `years_since(dates)`: calendar years between each date and today.
    YearsSince,
    Upper,
    Lower,
    Strip,
    Title,
    /// `round(x, ndigits=0)`
    Round,
    /// First non-missing argument.
    Coalesce,
    FillNa,
    AsType(CastKind),
}

impl Helper {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "cap_value" => Helper::CapValue,
            "concat" => Helper::Concat,
            "years_since" => Helper::YearsSince,
            "upper" => Helper::Upper,
            "lower" => Helper::Lower,
            "strip" => Helper::Strip,
            "title" => Helper::Title,
            "round" => Helper::Round,
            "coalesce" => Helper::Coalesce,
            "fillna" => Helper::FillNa,
            "str" => Helper::AsType(CastKind::Str),
            "int" => Helper::AsType(CastKind::Int),
            "float" => Helper::AsType(CastKind::Float),
            _ => return None,
        })
    }

    /// Parameter names; empty for the variadic `coalesce`.
    fn params(&self) -> &'static [&'static str] {
        match self {
            Helper::CapValue => &["x", "cap"],
            Helper::Concat => &["a", "b", "sep"],
            Helper::YearsSince => &["date_series"],
            Helper::Round => &["x", "ndigits"],
            Helper::FillNa => &["x", "value"],
            Helper::Coalesce => &[],
            Helper::Upper | Helper::Lower | Helper::Strip | Helper::Title | Helper::AsType(_) => &["x"],
        }
    }

    fn default_arg(&self, param: &str) -> Option<Cell> {
        match (self, param) {
            (Helper::CapValue, "cap") => Some(Cell::Int(10000)),
            (Helper::Concat, "sep") => Some(Cell::str(" ")),
            (Helper::Round, "ndigits") => Some(Cell::Int(0)),
            _ => None,
        }
    }

    fn string_method(name: &str) -> Option<Self> {
        match name {
            "upper" => Some(Helper::Upper),
            "lower" => Some(Helper::Lower),
            "strip" => Some(Helper::Strip),
            "title" => Some(Helper::Title),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Cell),
    Column(Frame, String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Arguments are bound to the helper's parameters, defaults included.
    Call(Helper, Vec<Expr>),
}

impl Expr {
    fn collect_columns<'a>(&'a self, out: &mut Vec<(Frame, &'a str)>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Column(frame, name) => out.push((*frame, name.as_str())),
            Expr::Neg(e) | Expr::Not(e) => e.collect_columns(out),
            Expr::Binary(_, l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_columns(out);
                then.collect_columns(out);
                otherwise.collect_columns(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }
}

static END: Token = Token::End;

/// Bound on nesting and operator chains, so the AST stays shallow enough
/// to parse, evaluate and drop recursively.
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn deepen(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(syntax("expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    /// Run `rule` one level deeper.
    fn nested(&mut self, rule: fn(&mut Self) -> Result<Expr>) -> Result<Expr> {
        let mark = self.depth;
        self.deepen()?;
        let result = rule(self);
        self.depth = mark;
        result
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&END)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Token::Ident(w) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(syntax(format!("expected {} but found {}", token, self.peek())))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(syntax(format!("expected a name but found {}", other))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr> {
        let value = self.or_expr()?;
        if self.eat_keyword("if") {
            let cond = self.or_expr()?;
            if !self.eat_keyword("else") {
                return Err(syntax("conditional expression is missing 'else'"));
            }
            let otherwise = self.expr()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mark = self.depth;
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            self.deepen()?;
            let right = self.and_expr()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mark = self.depth;
        let mut left = self.not_expr()?;
        while self.eat_keyword("and") {
            self.deepen()?;
            let right = self.not_expr()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.nested(Self::not_expr)?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr> {
        let left = self.sum()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.sum()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn sum(&mut self) -> Result<Expr> {
        let mark = self.depth;
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr> {
        let mark = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            self.deepen()?;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = mark;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mark = self.depth;
        let mut expr = self.primary()?;
        while self.eat(&Token::Dot) {
            self.deepen()?;
            let name = self.expect_ident()?;
            expr = match name.as_str() {
                "str" => {
                    self.expect(Token::Dot)?;
                    let method = self.expect_ident()?;
                    let helper = Helper::string_method(&method)
                        .ok_or_else(|| syntax(format!("unsupported string method '.str.{}'", method)))?;
                    self.expect(Token::LParen)?;
                    self.expect(Token::RParen)?;
                    Expr::Call(helper, vec![expr])
                }
                "astype" => {
                    self.expect(Token::LParen)?;
                    let kind = match self.advance() {
                        Token::Ident(t) | Token::Str(t) => match t.as_str() {
                            "str" => CastKind::Str,
                            "int" | "int64" => CastKind::Int,
                            "float" | "float64" => CastKind::Float,
                            other => return Err(syntax(format!("unsupported astype target '{}'", other))),
                        },
                        other => return Err(syntax(format!("unsupported astype target {}", other))),
                    };
                    self.expect(Token::RParen)?;
                    Expr::Call(Helper::AsType(kind), vec![expr])
                }
                "fillna" | "round" => {
                    let helper = Helper::from_name(&name)
                        .ok_or_else(|| syntax(format!("unsupported method '.{}'", name)))?;
                    self.expect(Token::LParen)?;
                    let (positional, keywords) = self.call_args()?;
                    let mut args = vec![expr];
                    args.extend(positional);
                    Expr::Call(helper, bind_args(helper, args, keywords)?)
                }
                other => return Err(syntax(format!("unsupported method '.{}'", other))),
            };
        }
        self.depth = mark;
        Ok(expr)
    }

    /// Arguments after an already consumed `(`, through the closing `)`.
    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut positional = Vec::new();
        let mut keywords = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok((positional, keywords));
        }
        loop {
            let is_keyword = matches!(self.peek(), Token::Ident(_))
                && self.tokens.get(self.pos + 1) == Some(&Token::Assign);
            if is_keyword {
                let name = self.expect_ident()?;
                self.advance();
                keywords.push((name, self.expr()?));
            } else if !keywords.is_empty() {
                return Err(syntax("positional argument follows keyword argument"));
            } else {
                positional.push(self.expr()?);
            }
            if self.eat(&Token::RParen) {
                return Ok((positional, keywords));
            }
            self.expect(Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::Int(v) => Ok(Expr::Literal(Cell::Int(v))),
            Token::Float(v) => Ok(Expr::Literal(Cell::Float(v))),
            Token::Str(s) => Ok(Expr::Literal(Cell::Str(s))),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "None" => Ok(Expr::Literal(Cell::Null)),
                "True" => Ok(Expr::Literal(Cell::Bool(true))),
                "False" => Ok(Expr::Literal(Cell::Bool(false))),
                "df" | "source" | "renamed" | "derived" => {
                    let frame = if name == "df" || name == "source" {
                        Frame::Source
                    } else {
                        Frame::Derived
                    };
                    self.expect(Token::LBracket)?;
                    let column = match self.advance() {
                        Token::Str(column) => column,
                        other => return Err(syntax(format!("column name must be a string, found {}", other))),
                    };
                    self.expect(Token::RBracket)?;
                    Ok(Expr::Column(frame, column))
                }
                _ => {
                    let helper = Helper::from_name(&name)
                        .ok_or_else(|| syntax(format!("unknown name '{}'", name)))?;
                    self.expect(Token::LParen)?;
                    let (positional, keywords) = self.call_args()?;
                    Ok(Expr::Call(helper, bind_args(helper, positional, keywords)?))
                }
            },
            other => Err(syntax(format!("unexpected {}", other))),
        }
    }
}

fn bind_args(helper: Helper, positional: Vec<Expr>, keywords: Vec<(String, Expr)>) -> Result<Vec<Expr>> {
    let params = helper.params();

    if params.is_empty() {
        if !keywords.is_empty() || positional.is_empty() {
            return Err(syntax(format!("{:?} takes one or more positional arguments", helper)));
        }
        return Ok(positional);
    }

    if positional.len() > params.len() {
        return Err(syntax(format!(
            "{:?} takes at most {} arguments ({} given)",
            helper,
            params.len(),
            positional.len()
        )));
    }

    let mut slots: Vec<Option<Expr>> = positional.into_iter().map(Some).collect();
    slots.resize(params.len(), None);

    for (name, value) in keywords {
        let idx = params
            .iter()
            .position(|p| *p == name)
            .ok_or_else(|| syntax(format!("{:?} got an unexpected keyword '{}'", helper, name)))?;
        if slots[idx].is_some() {
            return Err(syntax(format!("{:?} got multiple values for '{}'", helper, name)));
        }
        slots[idx] = Some(value);
    }

    params
        .iter()
        .zip(slots)
        .map(|(param, slot)| {
            slot.or_else(|| helper.default_arg(param).map(Expr::Literal))
                .ok_or_else(|| syntax(format!("{:?} is missing argument '{}'", helper, param)))
        })
        .collect()
}

/// A parsed transformation expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    text: String,
    root: Expr,
}

/// Tables and clock an expression is evaluated against.
pub struct EvalContext<'a> {
    pub source: &'a Columns,
    pub derived: &'a Columns,
    pub today: NaiveDate,
}

enum Value {
    Scalar(Cell),
    Column(Vec<Cell>),
}

impl Value {
    fn at(&self, idx: usize) -> &Cell {
        match self {
            Value::Scalar(cell) => cell,
            Value::Column(cells) => &cells[idx],
        }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, Value::Scalar(_))
    }
}

/// Apply `f` row by row, broadcasting scalars. All-scalar input stays scalar.
fn map_rows<F>(args: &[Value], height: usize, f: F) -> Result<Value>
where
    F: Fn(&[&Cell]) -> Result<Cell>,
{
    if args.iter().all(Value::is_scalar) {
        let row: Vec<&Cell> = args.iter().map(|v| v.at(0)).collect();
        return Ok(Value::Scalar(f(&row)?));
    }
    let mut out = Vec::with_capacity(height);
    for idx in 0..height {
        let row: Vec<&Cell> = args.iter().map(|v| v.at(idx)).collect();
        out.push(f(&row)?);
    }
    Ok(Value::Column(out))
}

/// Numeric view for arithmetic; booleans count as 0/1, text never does.
fn number(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Cell::Int(v) => Some(*v as f64),
        Cell::Float(v) => Some(*v),
        _ => None,
    }
}

fn int_of(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Bool(b) => Some(*b as i64),
        Cell::Int(v) => Some(*v),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, a: &Cell, b: &Cell) -> Result<Cell> {
    if a.is_missing() || b.is_missing() {
        return Ok(Cell::Null);
    }
    if let (Cell::Str(x), Cell::Str(y), BinaryOp::Add) = (a, b, op) {
        return Ok(Cell::Str(format!("{}{}", x, y)));
    }

    let unsupported = || syntax(format!("unsupported operand types for {:?}: {:?} and {:?}", op, a, b));

    if let (Some(x), Some(y)) = (int_of(a), int_of(b)) {
        let overflow = || syntax(format!("integer overflow in {:?}", op));
        return Ok(match op {
            BinaryOp::Add => Cell::Int(x.checked_add(y).ok_or_else(overflow)?),
            BinaryOp::Sub => Cell::Int(x.checked_sub(y).ok_or_else(overflow)?),
            BinaryOp::Mul => Cell::Int(x.checked_mul(y).ok_or_else(overflow)?),
            BinaryOp::Div if y == 0 => Cell::Null,
            BinaryOp::Div => Cell::Float(x as f64 / y as f64),
            BinaryOp::Mod if y == 0 => Cell::Null,
            BinaryOp::Mod => Cell::Int(((x % y) + y) % y),
            _ => return Err(unsupported()),
        });
    }

    let (x, y) = number(a).zip(number(b)).ok_or_else(unsupported)?;
    Ok(match op {
        BinaryOp::Add => Cell::Float(x + y),
        BinaryOp::Sub => Cell::Float(x - y),
        BinaryOp::Mul => Cell::Float(x * y),
        BinaryOp::Div if y == 0.0 => Cell::Null,
        BinaryOp::Div => Cell::Float(x / y),
        BinaryOp::Mod if y == 0.0 => Cell::Null,
        BinaryOp::Mod => Cell::Float(x - y * (x / y).floor()),
        _ => return Err(unsupported()),
    })
}

fn comparison(op: BinaryOp, a: &Cell, b: &Cell) -> Result<Cell> {
    if a.is_missing() || b.is_missing() {
        return Ok(Cell::Bool(op == BinaryOp::Ne));
    }
    let ordering = match (number(a), number(b), a, b) {
        (Some(x), Some(y), _, _) => x.partial_cmp(&y),
        (_, _, Cell::Str(x), Cell::Str(y)) => Some(x.cmp(y)),
        _ => None,
    };
    let result = match (op, ordering) {
        (BinaryOp::Eq, ord) => ord == Some(std::cmp::Ordering::Equal),
        (BinaryOp::Ne, ord) => ord != Some(std::cmp::Ordering::Equal),
        (_, None) => {
            return Err(syntax(format!("cannot order {:?} and {:?}", a, b)));
        }
        (BinaryOp::Lt, Some(ord)) => ord.is_lt(),
        (BinaryOp::Le, Some(ord)) => ord.is_le(),
        (BinaryOp::Gt, Some(ord)) => ord.is_gt(),
        (BinaryOp::Ge, Some(ord)) => ord.is_ge(),
        _ => return Err(syntax(format!("{:?} is not a comparison", op))),
    };
    Ok(Cell::Bool(result))
}

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%Y%m%d"];
const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Lenient date parsing; unparsable text is `None`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                .map(|dt| dt.date())
        })
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

fn cast(kind: CastKind, cell: &Cell) -> Result<Cell> {
    if cell.is_missing() {
        return Ok(Cell::Null);
    }
    let fail = || syntax(format!("cannot convert {:?} to {:?}", cell, kind));
    Ok(match kind {
        CastKind::Str => Cell::Str(cell.to_string()),
        CastKind::Int => match cell {
            Cell::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Cell::Int)
                .or_else(|_| s.trim().parse::<f64>().map(|v| Cell::Int(v.trunc() as i64)))
                .map_err(|_| fail())?,
            other => Cell::Int(number(other).ok_or_else(fail)?.trunc() as i64),
        },
        CastKind::Float => Cell::Float(match cell {
            Cell::Str(_) => cell.as_f64().ok_or_else(fail)?,
            other => number(other).ok_or_else(fail)?,
        }),
    })
}

fn call_helper(helper: Helper, row: &[&Cell], today: NaiveDate) -> Result<Cell> {
    let Some(first) = row.first().copied() else {
        return Ok(Cell::Null);
    };
    let text_op = |f: fn(&str) -> String| -> Cell {
        match first.text() {
            Some(text) => Cell::Str(f(&text)),
            None => Cell::Null,
        }
    };

    match helper {
        Helper::CapValue => {
            let (x, cap) = (first, row[1]);
            if x.is_missing() {
                return Ok(Cell::Null);
            }
            if let (Some(a), Some(b)) = (int_of(x), int_of(cap)) {
                return Ok(Cell::Int(a.min(b)));
            }
            let (a, b) = number(x)
                .zip(number(cap))
                .ok_or_else(|| syntax(format!("cap_value needs numbers, got {:?} and {:?}", x, cap)))?;
            Ok(Cell::Float(a.min(b)))
        }
        Helper::Concat => {
            let (a, b) = (first, row[1]);
            if a.is_missing() && b.is_missing() {
                return Ok(Cell::Null);
            }
            let sep = row[2].text().unwrap_or_default();
            Ok(Cell::Str(format!(
                "{}{}{}",
                a.text().unwrap_or_default(),
                sep,
                b.text().unwrap_or_default()
            )))
        }
        Helper::YearsSince => Ok(first
            .text()
            .and_then(|t| parse_date(&t))
            .map(|d| Cell::Int((today.year() - d.year()) as i64))
            .unwrap_or(Cell::Null)),
        Helper::Upper => Ok(text_op(|s| s.to_uppercase())),
        Helper::Lower => Ok(text_op(|s| s.to_lowercase())),
        Helper::Strip => Ok(text_op(|s| s.trim().to_string())),
        Helper::Title => Ok(text_op(title_case)),
        Helper::Round => {
            if first.is_missing() {
                return Ok(Cell::Null);
            }
            let digits = int_of(row[1]).ok_or_else(|| syntax("round ndigits must be an integer"))?;
            match first {
                Cell::Int(v) if digits >= 0 => Ok(Cell::Int(*v)),
                other => {
                    let x = number(other).ok_or_else(|| syntax(format!("cannot round {:?}", other)))?;
                    let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
                    Ok(Cell::Float((x * factor).round() / factor))
                }
            }
        }
        Helper::Coalesce => Ok(row
            .iter()
            .find(|c| !c.is_missing())
            .map(|c| (*c).clone())
            .unwrap_or(Cell::Null)),
        Helper::FillNa => Ok(if first.is_missing() {
            row[1].clone()
        } else {
            first.clone()
        }),
        Helper::AsType(kind) => cast(kind, first),
    }
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if parser.peek() != &Token::End {
            return Err(syntax(format!("unexpected {} after expression", parser.peek())));
        }
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Column references in the order they appear.
    pub fn columns(&self) -> Vec<(Frame, &str)> {
        let mut out = Vec::new();
        self.root.collect_columns(&mut out);
        out
    }

    /// Evaluate to one cell per source row.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Vec<Cell>> {
        let height = ctx.source.height();
        match self.eval(&self.root, ctx, height)? {
            Value::Scalar(cell) => Ok(vec![cell; height]),
            Value::Column(cells) => Ok(cells),
        }
    }

    fn eval(&self, expr: &Expr, ctx: &EvalContext<'_>, height: usize) -> Result<Value> {
        match expr {
            Expr::Literal(cell) => Ok(Value::Scalar(cell.clone())),
            Expr::Column(frame, name) => {
                let (table, label) = match frame {
                    Frame::Source => (ctx.source, "df"),
                    Frame::Derived => (ctx.derived, "renamed"),
                };
                let cells = table
                    .get(name)
                    .ok_or_else(|| syntax(format!("column '{}' not found in {}", name, label)))?;
                if cells.len() != height {
                    return Err(syntax(format!("column '{}' has {} rows, expected {}", name, cells.len(), height)));
                }
                Ok(Value::Column(cells.to_vec()))
            }
            Expr::Neg(inner) => {
                let value = self.eval(inner, ctx, height)?;
                map_rows(&[value], height, |row| arithmetic(BinaryOp::Sub, &Cell::Int(0), row[0]))
            }
            Expr::Not(inner) => {
                let value = self.eval(inner, ctx, height)?;
                map_rows(&[value], height, |row| Ok(Cell::Bool(!row[0].truthy())))
            }
            Expr::Binary(op, left, right) => {
                let args = [self.eval(left, ctx, height)?, self.eval(right, ctx, height)?];
                let op = *op;
                map_rows(&args, height, |row| match op {
                    BinaryOp::And => Ok(Cell::Bool(row[0].truthy() && row[1].truthy())),
                    BinaryOp::Or => Ok(Cell::Bool(row[0].truthy() || row[1].truthy())),
                    BinaryOp::Eq
                    | BinaryOp::Ne
                    | BinaryOp::Lt
                    | BinaryOp::Le
                    | BinaryOp::Gt
                    | BinaryOp::Ge => comparison(op, row[0], row[1]),
                    _ => arithmetic(op, row[0], row[1]),
                })
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                let args = [
                    self.eval(cond, ctx, height)?,
                    self.eval(then, ctx, height)?,
                    self.eval(otherwise, ctx, height)?,
                ];
                map_rows(&args, height, |row| {
                    Ok(if row[0].truthy() { row[1].clone() } else { row[2].clone() })
                })
            }
            Expr::Call(helper, args) => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a, ctx, height))
                    .collect::<Result<Vec<_>>>()?;
                map_rows(&values, height, |row| call_helper(*helper, row, ctx.today))
            }
        }
    }
}
