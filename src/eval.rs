//! MapCSS expression evaluation.
//!
//! Style template fields hold either a literal value or an expression
//! tree evaluated per object. Expressions compute over strings; numeric
//! and boolean behavior comes from coercion at each operator, and a value
//! that fails its final coercion leaves the style field untouched.

use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::color::Color;
use crate::strings::{StringTable, Tags};

/// Everything an expression may consult while evaluating.
pub struct EvalContext<'a> {
    pub tags: &'a Tags,
    pub strings: &'a StringTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Equal,
    Unequal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    StringEqual,
    StringUnequal,
    Add,
    Sub,
    Mul,
    Div,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Boolean,
    Str,
    Num,
    Sqrt,
    Int,
    Not,
    Tag,
    Cond,
    Colgen,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        Some(match name {
            "boolean" => Func::Boolean,
            "str" => Func::Str,
            "num" => Func::Num,
            "sqrt" => Func::Sqrt,
            "int" => Func::Int,
            "not" => Func::Not,
            "tag" => Func::Tag,
            "cond" => Func::Cond,
            "colgen" => Func::Colgen,
            _ => return None,
        })
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(String),
    Binary {
        lhs: Box<Expr>,
        op: BinaryOp,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Call {
        func: Func,
        args: Vec<Expr>,
    },
}

/// Parse a string as an integer, accepting leading zeros and a sign.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let digits = s.strip_prefix('-').or_else(|| s.strip_prefix('+')).unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i64>().ok()
}

/// Parse a string as a number; the whole string must be consumed.
pub fn parse_num(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// Truthiness: every nonempty string except the literal negatives.
pub fn to_bool(s: &str) -> bool {
    !matches!(s, "" | "false" | "no" | "0")
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Format a number the way stylesheets expect: integers without `.0`.
pub fn format_num(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Integer-first arithmetic: both operands integral keeps integer
/// semantics (notably truncating division), otherwise float math.
fn calculate(
    left: &str,
    right: &str,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> String {
    if let (Some(i1), Some(i2)) = (parse_int(left), parse_int(right)) {
        return format!("{}", int_op(i1, i2));
    }
    if let (Some(f1), Some(f2)) = (parse_num(left), parse_num(right)) {
        return format_num(float_op(f1, f2));
    }
    String::new()
}

fn compare_floats(left: &str, right: &str, op: impl Fn(f64, f64) -> bool) -> &'static str {
    match (parse_num(left), parse_num(right)) {
        (Some(f1), Some(f2)) => bool_str(op(f1, f2)),
        _ => "false",
    }
}

/// Deterministic per-seed byte source for `colgen`.
struct ColorSeed(u64);

impl ColorSeed {
    fn from_str(seed: &str) -> Self {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in seed.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self(hash)
    }

    fn next_byte(&mut self) -> u8 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        (z ^ (z >> 31)) as u8
    }
}

fn colgen(args: &[Expr], ctx: &EvalContext<'_>) -> String {
    if args.is_empty() || args.len() > 3 {
        return String::new();
    }
    let seed = args[0].eval(ctx);

    // mode 0 = direct, 1 = base multiplication, 2 = between base and top
    let mut mode = 0;
    let mut base = Color::WHITE;
    let mut top = Color::WHITE;
    if args.len() >= 2 {
        if let Some(c) = Color::parse(&args[1].eval(ctx)) {
            base = c;
            mode += 1;
            if args.len() >= 3 {
                if let Some(c) = Color::parse(&args[2].eval(ctx)) {
                    top = c;
                    mode += 1;
                }
            }
        }
    }

    let mut rng = ColorSeed::from_str(&seed);
    let random = Color::rgba(
        rng.next_byte(),
        rng.next_byte(),
        rng.next_byte(),
        rng.next_byte(),
    );

    let result = match mode {
        0 => random.with_alpha(0.3),
        1 => base.mul(&random).with_alpha(base.a),
        _ => base.add(&random.mul(&top.sub_clamped(&base))),
    };
    result.to_hex_rgba()
}

impl Expr {
    /// Evaluate to a string. Never panics; failures yield `""`.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> String {
        match self {
            Expr::Literal(s) => s.clone(),
            Expr::Binary { lhs, op, rhs } => {
                let first = lhs.eval(ctx);
                let second = rhs.eval(ctx);
                match op {
                    BinaryOp::Equal => {
                        if first == second {
                            return "true".into();
                        }
                        match (parse_int(&first), parse_int(&second)) {
                            (Some(i1), Some(i2)) => bool_str(i1 == i2).into(),
                            _ => "false".into(),
                        }
                    }
                    BinaryOp::Unequal => match (parse_int(&first), parse_int(&second)) {
                        (Some(i1), Some(i2)) => bool_str(i1 != i2).into(),
                        _ => bool_str(first != second).into(),
                    },
                    BinaryOp::Less => compare_floats(&first, &second, |a, b| a < b).into(),
                    BinaryOp::LessEqual => compare_floats(&first, &second, |a, b| a <= b).into(),
                    BinaryOp::Greater => compare_floats(&first, &second, |a, b| a > b).into(),
                    BinaryOp::GreaterEqual => compare_floats(&first, &second, |a, b| a >= b).into(),
                    BinaryOp::StringEqual => bool_str(first == second).into(),
                    BinaryOp::StringUnequal => bool_str(first != second).into(),
                    BinaryOp::Add => {
                        calculate(&first, &second, |a, b| a.wrapping_add(b), |a, b| a + b)
                    }
                    BinaryOp::Sub => {
                        calculate(&first, &second, |a, b| a.wrapping_sub(b), |a, b| a - b)
                    }
                    BinaryOp::Mul => {
                        calculate(&first, &second, |a, b| a.wrapping_mul(b), |a, b| a * b)
                    }
                    BinaryOp::Div => {
                        if parse_int(&second) == Some(0) {
                            return String::new();
                        }
                        calculate(&first, &second, |a, b| a.wrapping_div(b), |a, b| a / b)
                    }
                    BinaryOp::Concat => first + &second,
                }
            }
            Expr::Unary { op, expr } => {
                let value = expr.eval(ctx);
                match op {
                    UnaryOp::Not => bool_str(!to_bool(&value)).into(),
                    UnaryOp::Neg => match parse_num(&value) {
                        Some(n) => format_num(-n),
                        None => String::new(),
                    },
                }
            }
            Expr::Call { func, args } => {
                let first = match args.first() {
                    Some(arg) => arg.eval(ctx),
                    None => return String::new(),
                };
                match func {
                    Func::Str => first,
                    Func::Boolean => bool_str(to_bool(&first)).into(),
                    Func::Num => {
                        if parse_num(&first).is_some() {
                            first
                        } else {
                            String::new()
                        }
                    }
                    Func::Sqrt => match parse_num(&first) {
                        Some(n) => format_num(n.sqrt()),
                        None => String::new(),
                    },
                    Func::Int => match parse_num(&first) {
                        Some(n) => format!("{}", n.floor() as i64),
                        None => String::new(),
                    },
                    Func::Not => bool_str(!to_bool(&first)).into(),
                    Func::Tag => ctx
                        .tags
                        .get_str(&first, ctx.strings)
                        .map(|v| v.as_str().to_string())
                        .unwrap_or_default(),
                    Func::Cond => {
                        if args.len() != 3 {
                            return String::new();
                        }
                        if to_bool(&first) {
                            args[1].eval(ctx)
                        } else {
                            args[2].eval(ctx)
                        }
                    }
                    Func::Colgen => colgen(args, ctx),
                }
            }
        }
    }

    fn is_bare_literal(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

// ---- expression parser -------------------------------------------------

struct ExprParser<'a> {
    input: &'a [u8],
    pos: usize,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'#'
}

impl<'a> ExprParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.input[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Match a word operator (`eq`, `ne`) with a boundary check.
    fn eat_word_op(&mut self, word: &str) -> bool {
        let rest = &self.input[self.pos..];
        if rest.starts_with(word.as_bytes()) {
            match rest.get(word.len()) {
                Some(&b) if is_word_byte(b) => false,
                _ => {
                    self.pos += word.len();
                    true
                }
            }
        } else {
            false
        }
    }

    fn comparison(&mut self) -> Option<Expr> {
        let mut lhs = self.additive()?;
        loop {
            self.skip_ws();
            let op = if self.eat("==") {
                BinaryOp::Equal
            } else if self.eat("!=") {
                BinaryOp::Unequal
            } else if self.eat("<=") {
                BinaryOp::LessEqual
            } else if self.eat(">=") {
                BinaryOp::GreaterEqual
            } else if self.eat("<") {
                BinaryOp::Less
            } else if self.eat(">") {
                BinaryOp::Greater
            } else if self.eat_word_op("eq") {
                BinaryOp::StringEqual
            } else if self.eat_word_op("ne") {
                BinaryOp::StringUnequal
            } else {
                return Some(lhs);
            };
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
    }

    fn additive(&mut self) -> Option<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            self.skip_ws();
            let op = if self.eat("+") {
                BinaryOp::Add
            } else if self.eat("-") {
                BinaryOp::Sub
            } else {
                return Some(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Option<Expr> {
        let mut lhs = self.tight()?;
        loop {
            self.skip_ws();
            if self.eat("*") {
                let rhs = self.tight()?;
                lhs = Expr::Binary {
                    lhs: Box::new(lhs),
                    op: BinaryOp::Mul,
                    rhs: Box::new(rhs),
                };
            } else {
                return Some(lhs);
            }
        }
    }

    /// Division and concatenation bind tightest of the binary operators.
    fn tight(&mut self) -> Option<Expr> {
        let mut lhs = self.primary()?;
        loop {
            self.skip_ws();
            let op = if self.eat("/") {
                BinaryOp::Div
            } else if self.eat(".") {
                BinaryOp::Concat
            } else {
                return Some(lhs);
            };
            let rhs = self.primary()?;
            lhs = Expr::Binary {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
    }

    fn primary(&mut self) -> Option<Expr> {
        self.skip_ws();
        match self.peek()? {
            b'(' => {
                self.pos += 1;
                let inner = self.comparison()?;
                self.skip_ws();
                if !self.eat(")") {
                    return None;
                }
                Some(inner)
            }
            b'!' => {
                self.pos += 1;
                let inner = self.primary()?;
                Some(Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(inner),
                })
            }
            b'-' => {
                self.pos += 1;
                let inner = self.primary()?;
                Some(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                })
            }
            b'\'' => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|b| b != b'\'') {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return None;
                }
                let text = std::str::from_utf8(&self.input[start..self.pos]).ok()?;
                self.pos += 1;
                Some(Expr::Literal(text.to_string()))
            }
            b if is_word_byte(b) => {
                let start = self.pos;
                while self.peek().is_some_and(is_word_byte) {
                    self.pos += 1;
                }
                let word = std::str::from_utf8(&self.input[start..self.pos]).ok()?;
                self.skip_ws();
                if self.peek() == Some(b'(') {
                    let func = Func::from_name(word)?;
                    self.pos += 1;
                    let mut args = vec![self.comparison()?];
                    loop {
                        self.skip_ws();
                        if self.eat(",") {
                            args.push(self.comparison()?);
                        } else if self.eat(")") {
                            break;
                        } else {
                            return None;
                        }
                    }
                    Some(Expr::Call { func, args })
                } else {
                    Some(Expr::Literal(word.to_string()))
                }
            }
            _ => None,
        }
    }
}

/// Parse a complete expression; the full input must be consumed.
pub fn parse_expression(input: &str) -> Option<Expr> {
    let mut parser = ExprParser::new(input);
    let expr = parser.comparison()?;
    parser.skip_ws();
    if parser.pos == parser.input.len() {
        Some(expr)
    } else {
        None
    }
}

// ---- typed template fields ---------------------------------------------

/// A type an evaluated string can coerce into.
pub trait EvalTarget: Sized + Clone {
    fn from_eval_str(s: &str) -> Option<Self>;
    fn type_name() -> &'static str;
}

/// Strip a trailing size unit. `pt` values are scaled to pixels,
/// percentages pass through as plain numbers.
fn parse_dimension(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(v) = s.strip_suffix("px") {
        return parse_num(v);
    }
    if let Some(v) = s.strip_suffix("pt") {
        return parse_num(v).map(|n| n * 96.0 / 72.0);
    }
    if let Some(v) = s.strip_suffix('%') {
        return parse_num(v);
    }
    parse_num(s)
}

impl EvalTarget for f64 {
    fn from_eval_str(s: &str) -> Option<Self> {
        parse_dimension(s)
    }

    fn type_name() -> &'static str {
        "number"
    }
}

impl EvalTarget for i32 {
    fn from_eval_str(s: &str) -> Option<Self> {
        parse_num(s).map(|n| n as i32)
    }

    fn type_name() -> &'static str {
        "integer"
    }
}

impl EvalTarget for bool {
    fn from_eval_str(s: &str) -> Option<Self> {
        Some(to_bool(s))
    }

    fn type_name() -> &'static str {
        "boolean"
    }
}

impl EvalTarget for String {
    fn from_eval_str(s: &str) -> Option<Self> {
        Some(s.to_string())
    }

    fn type_name() -> &'static str {
        "string"
    }
}

impl EvalTarget for Color {
    fn from_eval_str(s: &str) -> Option<Self> {
        Color::parse(s)
    }

    fn type_name() -> &'static str {
        "color"
    }
}

impl EvalTarget for Vec<f64> {
    fn from_eval_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Some(Vec::new());
        }
        s.split(',').map(parse_dimension).collect()
    }

    fn type_name() -> &'static str {
        "dash list"
    }
}

#[derive(Debug)]
enum EvalSource<T> {
    Literal(T),
    Expr(Expr),
}

/// Position info carried for eval warnings.
#[derive(Debug, Clone, Default)]
pub struct EvalInfo {
    pub line: u32,
    pub content: String,
}

/// A style template field: a literal of `T` or a deferred expression.
#[derive(Debug)]
pub struct Eval<T> {
    source: EvalSource<T>,
    info: EvalInfo,
    warned: AtomicBool,
}

fn strip_eval_wrapper(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix("eval(")?.strip_suffix(')')?.trim();
    if let Some(unquoted) = inner
        .strip_prefix('"')
        .and_then(|i| i.strip_suffix('"'))
    {
        return Some(unquoted);
    }
    Some(inner)
}

impl<T: EvalTarget> Eval<T> {
    pub fn literal(value: T) -> Self {
        Self {
            source: EvalSource::Literal(value),
            info: EvalInfo::default(),
            warned: AtomicBool::new(false),
        }
    }

    /// Parse an attribute value as a literal of `T` or an expression.
    ///
    /// An `eval("...")` wrapper forces expression parsing. Otherwise
    /// direct conversion is tried first (`2.5` is the number, never the
    /// concatenation of `2` and `5`), and only values that fail it are
    /// parsed as deferred expressions.
    pub fn parse(raw: &str, info: EvalInfo) -> Result<Self, String> {
        let raw = raw.trim();
        if let Some(inner) = strip_eval_wrapper(raw) {
            return match parse_expression(inner) {
                Some(expr) => Ok(Self {
                    source: EvalSource::Expr(expr),
                    info,
                    warned: AtomicBool::new(false),
                }),
                None => Err(format!("'{inner}' is not a valid expression")),
            };
        }
        if let Some(value) = T::from_eval_str(raw) {
            return Ok(Self {
                source: EvalSource::Literal(value),
                info,
                warned: AtomicBool::new(false),
            });
        }
        if let Some(expr) = parse_expression(raw) {
            if !expr.is_bare_literal() {
                return Ok(Self {
                    source: EvalSource::Expr(expr),
                    info,
                    warned: AtomicBool::new(false),
                });
            }
        }
        Err(format!(
            "failed to parse '{}' as an expression or a {}",
            raw,
            T::type_name()
        ))
    }

    /// Overwrite `out` with this field's value for the given object.
    ///
    /// A failed coercion leaves `out` untouched and warns once for this
    /// field.
    pub fn apply(&self, ctx: &EvalContext<'_>, out: &mut T) {
        match &self.source {
            EvalSource::Literal(value) => *out = value.clone(),
            EvalSource::Expr(expr) => {
                let result = expr.eval(ctx);
                match T::from_eval_str(&result) {
                    Some(value) => *out = value,
                    None => {
                        if !self.warned.swap(true, Ordering::Relaxed) {
                            warn!(
                                "evaluation produced \"{}\" which is not a {} \
                                 [line {}: \"{}\"]",
                                result,
                                T::type_name(),
                                self.info.line,
                                self.info.content
                            );
                        }
                    }
                }
            }
        }
    }
}
