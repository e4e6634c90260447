#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use cf_columnar::{ArithmeticOp, Column, ColumnError, ComparisonOp, arithmetic, compare};
use cf_frame::DataFrame;
use cf_groupby::AggregationKind;
use cf_types::{NullKind, Scalar, TypeError, parse_datetime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Function names that cannot be used as column references.
pub const FUNCTION_NAMES: [&str; 3] = ["date", "percentile", "years"];
/// Logical keywords that cannot be used as column references.
pub const OPERATOR_NAMES: [&str; 4] = ["and", "or", "not", "in"];
pub const SPECIAL_NAMES: [&str; 1] = ["default"];

/// Every word a column reference may not spell, compared case-insensitively.
#[must_use]
pub fn reserved_words() -> BTreeSet<&'static str> {
    cf_groupby::registry()
        .keys()
        .copied()
        .chain(FUNCTION_NAMES)
        .chain(OPERATOR_NAMES)
        .chain(SPECIAL_NAMES)
        .collect()
}

#[must_use]
pub fn is_reserved_word(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    reserved_words().contains(lower.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseArm {
    pub condition: Expr,
    pub value: Expr,
}

/// One node of a compiled formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Scalar,
    },
    Column {
        name: String,
    },
    Negate {
        expr: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: ComparisonOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        values: Vec<String>,
    },
    Date {
        text: String,
        seconds: i64,
    },
    Percentile {
        expr: Box<Expr>,
    },
    Case {
        arms: Vec<CaseArm>,
        default: Option<Box<Expr>>,
    },
}

impl Expr {
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column { name: name.into() }
    }

    #[must_use]
    pub fn literal(value: impl Into<Scalar>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    /// Direct sub-expressions, in evaluation order.
    #[must_use]
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Self::Literal { .. } | Self::Column { .. } | Self::Date { .. } => Vec::new(),
            Self::Negate { expr } | Self::Not { expr } | Self::Percentile { expr } => {
                vec![expr.as_ref()]
            }
            Self::In { expr, .. } => vec![expr.as_ref()],
            Self::Arithmetic { left, right, .. }
            | Self::Compare { left, right, .. }
            | Self::And { left, right }
            | Self::Or { left, right } => vec![left.as_ref(), right.as_ref()],
            Self::Case { arms, default } => arms
                .iter()
                .flat_map(|arm| [&arm.condition, &arm.value])
                .chain(default.as_deref())
                .collect(),
        }
    }

    /// The column this node itself refers to, if it is a reference.
    #[must_use]
    pub fn own_column(&self) -> Option<&str> {
        match self {
            Self::Column { name } => Some(name),
            _ => None,
        }
    }
}

/// Union of every column referenced anywhere in `expr`.
#[must_use]
pub fn dependent_columns(expr: &Expr) -> BTreeSet<String> {
    fn visit(expr: &Expr, out: &mut BTreeSet<String>) {
        if let Some(name) = expr.own_column() {
            out.insert(name.to_owned());
        }
        for child in expr.children() {
            visit(child, out);
        }
    }

    let mut out = BTreeSet::new();
    visit(expr, &mut out);
    out
}

/// Where and why a formula failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub message: String,
    /// The offending text, empty at end of input.
    pub fragment: String,
    /// Byte offset of `fragment` in the formula.
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fragment.is_empty() {
            write!(f, "{} at end of formula (position {})", self.message, self.position)
        } else {
            write!(
                f,
                "{} at {:?} (position {})",
                self.message, self.fragment, self.position
            )
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse failure: {0}")]
    Parse(#[from] ParseError),
    #[error("reserved word {word:?} cannot be used as a column reference (position {position})")]
    ReservedWord { word: String, position: usize },
    #[error("unknown aggregation: {0}")]
    UnknownAggregation(String),
    #[error("missing column reference: {0}")]
    MissingColumn(String),
    #[error("no schema for dataset, add data or wait for it to finish processing")]
    NoSchema,
    #[error("no case matched and no default was given")]
    CaseWithoutDefault,
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// The result of compiling one formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFormula {
    /// One expression per aggregation argument, or exactly one otherwise.
    pub expressions: Vec<Expr>,
    pub dependent_columns: BTreeSet<String>,
    pub aggregation: Option<AggregationKind>,
}

impl ParsedFormula {
    #[must_use]
    pub fn is_aggregation(&self) -> bool {
        self.aggregation.is_some()
    }
}

// ── Tokenizer ──

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    EqEq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    And,
    Or,
    Not,
    In,
    Case,
    Default,
    Date,
    Percentile,
    Years,
    Aggregation(AggregationKind),
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    text: String,
    position: usize,
}

fn keyword(word: &str) -> Option<Token> {
    let lower = word.to_ascii_lowercase();
    let token = match lower.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "case" => Token::Case,
        "default" => Token::Default,
        "date" => Token::Date,
        "percentile" => Token::Percentile,
        "years" => Token::Years,
        other => Token::Aggregation(AggregationKind::from_name(other)?),
    };
    Some(token)
}

fn parse_error(message: impl Into<String>, fragment: impl Into<String>, position: usize) -> ParseError {
    ParseError {
        message: message.into(),
        fragment: fragment.into(),
        position,
    }
}

fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let offset = |i: usize| chars.get(i).map_or(input.len(), |(pos, _)| *pos);
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (start, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).map(|(_, c)| *c);

        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', _) => (Token::Lt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('^', _) => (Token::Caret, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            (':', _) => (Token::Colon, 1),
            ('=', _) => {
                return Err(parse_error("expected '==' but found single '='", "=", start));
            }
            ('"', _) => {
                let mut end = i + 1;
                while end < chars.len() && chars[end].1 != '"' {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(parse_error(
                        "unterminated string literal",
                        &input[start..],
                        start,
                    ));
                }
                let text = &input[offset(i + 1)..offset(end)];
                (Token::Str(text.to_owned()), end + 1 - i)
            }
            _ if c.is_ascii_digit() => {
                let mut end = i;
                while end < chars.len() && chars[end].1.is_ascii_digit() {
                    end += 1;
                }
                let is_real = end + 1 < chars.len()
                    && chars[end].1 == '.'
                    && chars[end + 1].1.is_ascii_digit();
                if is_real {
                    end += 1;
                    while end < chars.len() && chars[end].1.is_ascii_digit() {
                        end += 1;
                    }
                }
                let text = &input[start..offset(end)];
                let token = if is_real {
                    Token::Float(
                        text.parse::<f64>()
                            .map_err(|_| parse_error("invalid real", text, start))?,
                    )
                } else {
                    Token::Int(
                        text.parse::<i64>()
                            .map_err(|_| parse_error("invalid integer", text, start))?,
                    )
                };
                (token, end - i)
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let mut end = i;
                while end < chars.len() && (chars[end].1.is_alphanumeric() || chars[end].1 == '_')
                {
                    end += 1;
                }
                let word = &input[start..offset(end)];
                (
                    keyword(word).unwrap_or_else(|| Token::Ident(word.to_owned())),
                    end - i,
                )
            }
            _ => {
                return Err(parse_error(
                    format!("unexpected character '{c}'"),
                    c.to_string(),
                    start,
                ));
            }
        };

        let end = offset(i + width);
        tokens.push(Spanned {
            token,
            text: input[start..end].to_owned(),
            position: start,
        });
        i += width;
    }

    Ok(tokens)
}

// ── Parser ──
//
//   formula    → AGGREGATION "(" [ trans ( "," trans )* ] ")" | trans
//   trans      → "percentile" trans | case_expr
//   case_expr  → "case" arm ( "," arm )* [ "," "default" ":" value ] | or_expr
//   arm        → or_expr ":" value
//   or_expr    → and_expr ( "or" and_expr )*
//   and_expr   → not_expr ( "and" not_expr )*
//   not_expr   → "not" not_expr | in_expr
//   in_expr    → comparison [ "in" "[" STRING ( "," STRING )* "]" ]
//   comparison → add_expr ( ("==" | "!=" | ">" | ">=" | "<" | "<=") add_expr )*
//   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
//   mul_expr   → power ( ("*" | "/") power )*
//   power      → signed [ "^" power ]
//   signed     → ("+" | "-") signed | atom
//   atom       → REAL | INTEGER | STRING | IDENT | "date" "(" STRING ")" | "(" trans ")"

struct Cursor<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    end: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|spanned| &spanned.token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        match self.tokens.get(self.pos) {
            Some(spanned) => parse_error(message, spanned.text.clone(), spanned.position).into(),
            None => parse_error(message, "", self.end).into(),
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }
}

/// Compile `formula` into its expressions, referenced columns and optional
/// aggregation.
///
/// `sum(x)` yields one expression over `x` with `aggregation` set;
/// `ratio(a, b)` yields two. Anything else yields a single expression.
pub fn parse_formula(formula: &str) -> Result<ParsedFormula, ExprError> {
    let tokens = tokenize(formula)?;
    let mut cur = Cursor {
        tokens: &tokens,
        pos: 0,
        end: formula.len(),
    };

    let (expressions, aggregation) = match cur.peek() {
        Some(Token::Aggregation(kind)) => {
            let kind = *kind;
            cur.pos += 1;
            cur.expect(&Token::LParen, "'(' after aggregation name")?;
            let mut args = Vec::new();
            if cur.peek() != Some(&Token::RParen) {
                args.push(parse_trans(&mut cur)?);
                while cur.eat(&Token::Comma) {
                    args.push(parse_trans(&mut cur)?);
                }
            }
            cur.expect(&Token::RParen, "closing ')'")?;
            if args.len() != kind.arity() {
                return Err(parse_error(
                    format!("{kind} takes {} argument(s) but {} given", kind.arity(), args.len()),
                    formula,
                    0,
                )
                .into());
            }
            (args, Some(kind))
        }
        Some(Token::Ident(name)) if cur.tokens.get(1).map(|t| &t.token) == Some(&Token::LParen) => {
            return Err(ExprError::UnknownAggregation(name.clone()));
        }
        _ => (vec![parse_trans(&mut cur)?], None),
    };

    if cur.pos < tokens.len() {
        return Err(cur.error("unexpected trailing input"));
    }

    let dependent_columns = expressions.iter().flat_map(dependent_columns).collect();
    Ok(ParsedFormula {
        expressions,
        dependent_columns,
        aggregation,
    })
}

fn parse_trans(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    if cur.eat(&Token::Percentile) {
        let inner = parse_trans(cur)?;
        return Ok(Expr::Percentile {
            expr: Box::new(inner),
        });
    }
    parse_case(cur)
}

fn parse_case(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    if !cur.eat(&Token::Case) {
        return parse_or(cur);
    }

    let mut arms = Vec::new();
    let mut default = None;
    loop {
        if cur.eat(&Token::Default) {
            cur.expect(&Token::Colon, "':' after default")?;
            default = Some(Box::new(parse_signed(cur)?));
            break;
        }
        let condition = parse_or(cur)?;
        cur.expect(&Token::Colon, "':' after case condition")?;
        let value = parse_signed(cur)?;
        arms.push(CaseArm { condition, value });
        if !cur.eat(&Token::Comma) {
            break;
        }
    }

    if arms.is_empty() {
        return Err(cur.error("case needs at least one condition"));
    }
    Ok(Expr::Case { arms, default })
}

fn parse_or(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let mut left = parse_and(cur)?;
    while cur.eat(&Token::Or) {
        let right = parse_and(cur)?;
        left = Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_and(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let mut left = parse_not(cur)?;
    while cur.eat(&Token::And) {
        let right = parse_not(cur)?;
        left = Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_not(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    if cur.eat(&Token::Not) {
        let inner = parse_not(cur)?;
        return Ok(Expr::Not {
            expr: Box::new(inner),
        });
    }
    parse_in(cur)
}

fn parse_in(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let left = parse_comparison(cur)?;
    if !cur.eat(&Token::In) {
        return Ok(left);
    }

    cur.expect(&Token::LBracket, "'[' to open membership list")?;
    let mut values = Vec::new();
    loop {
        match cur.peek() {
            Some(Token::Str(value)) => {
                values.push(value.clone());
                cur.pos += 1;
            }
            _ => return Err(cur.error("expected a double-quoted string")),
        }
        if !cur.eat(&Token::Comma) {
            break;
        }
    }
    cur.expect(&Token::RBracket, "']' to close membership list")?;

    Ok(Expr::In {
        expr: Box::new(left),
        values,
    })
}

fn parse_comparison(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let mut left = parse_add(cur)?;
    loop {
        let op = match cur.peek() {
            Some(Token::EqEq) => ComparisonOp::Eq,
            Some(Token::NotEq) => ComparisonOp::Ne,
            Some(Token::Gt) => ComparisonOp::Gt,
            Some(Token::Ge) => ComparisonOp::Ge,
            Some(Token::Lt) => ComparisonOp::Lt,
            Some(Token::Le) => ComparisonOp::Le,
            _ => return Ok(left),
        };
        cur.pos += 1;
        let right = parse_add(cur)?;
        left = Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
}

fn parse_add(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let mut left = parse_mul(cur)?;
    loop {
        let op = match cur.peek() {
            Some(Token::Plus) => ArithmeticOp::Add,
            Some(Token::Minus) => ArithmeticOp::Sub,
            _ => return Ok(left),
        };
        cur.pos += 1;
        let right = parse_mul(cur)?;
        left = Expr::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
}

fn parse_mul(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let mut left = parse_power(cur)?;
    loop {
        let op = match cur.peek() {
            Some(Token::Star) => ArithmeticOp::Mul,
            Some(Token::Slash) => ArithmeticOp::Div,
            _ => return Ok(left),
        };
        cur.pos += 1;
        let right = parse_power(cur)?;
        left = Expr::Arithmetic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
}

fn parse_power(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let base = parse_signed(cur)?;
    if cur.eat(&Token::Caret) {
        let exponent = parse_power(cur)?;
        return Ok(Expr::Arithmetic {
            op: ArithmeticOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent),
        });
    }
    Ok(base)
}

fn parse_signed(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    if cur.eat(&Token::Minus) {
        let inner = parse_signed(cur)?;
        return Ok(Expr::Negate {
            expr: Box::new(inner),
        });
    }
    if cur.eat(&Token::Plus) {
        return parse_signed(cur);
    }
    parse_atom(cur)
}

fn parse_atom(cur: &mut Cursor<'_>) -> Result<Expr, ExprError> {
    let tokens = cur.tokens;
    let Some(spanned) = tokens.get(cur.pos) else {
        return Err(cur.error("unexpected end of formula"));
    };

    let expr = match &spanned.token {
        Token::Int(n) => Expr::literal(*n),
        Token::Float(f) => Expr::literal(*f),
        Token::Str(s) => Expr::literal(s.as_str()),
        Token::Ident(name) => Expr::column(name.as_str()),
        Token::Date => {
            cur.pos += 1;
            cur.expect(&Token::LParen, "'(' after date")?;
            let Some(Spanned {
                token: Token::Str(text),
                position,
                ..
            }) = tokens.get(cur.pos)
            else {
                return Err(cur.error("date expects a double-quoted string"));
            };
            let seconds = parse_datetime(text).ok_or_else(|| {
                parse_error("unrecognised date", text.clone(), *position)
            })?;
            let text = text.clone();
            cur.pos += 1;
            cur.expect(&Token::RParen, "closing ')'")?;
            return Ok(Expr::Date { text, seconds });
        }
        Token::LParen => {
            cur.pos += 1;
            let inner = parse_trans(cur)?;
            cur.expect(&Token::RParen, "closing ')'")?;
            return Ok(inner);
        }
        Token::Aggregation(_)
        | Token::And
        | Token::Or
        | Token::Not
        | Token::In
        | Token::Default
        | Token::Percentile
        | Token::Years => {
            return Err(ExprError::ReservedWord {
                word: spanned.text.clone(),
                position: spanned.position,
            });
        }
        _ => return Err(cur.error("unexpected token")),
    };

    cur.pos += 1;
    Ok(expr)
}

// ── Validation ──

/// A source of known column names, such as a dataset schema.
pub trait ColumnLookup {
    fn has_column(&self, name: &str) -> bool;
    fn is_empty(&self) -> bool;
}

impl ColumnLookup for BTreeSet<String> {
    fn has_column(&self, name: &str) -> bool {
        self.contains(name)
    }

    fn is_empty(&self) -> bool {
        BTreeSet::is_empty(self)
    }
}

impl<V> ColumnLookup for BTreeMap<String, V> {
    fn has_column(&self, name: &str) -> bool {
        self.contains_key(name)
    }

    fn is_empty(&self) -> bool {
        BTreeMap::is_empty(self)
    }
}

impl ColumnLookup for DataFrame {
    fn has_column(&self, name: &str) -> bool {
        DataFrame::has_column(self, name)
    }

    fn is_empty(&self) -> bool {
        self.columns().is_empty()
    }
}

/// Parse `formula` and check every referenced column exists in `schema`.
///
/// Fails when no schema is available yet. Returns the aggregation the
/// formula calls, if any.
pub fn validate_formula<L: ColumnLookup + ?Sized>(
    formula: &str,
    schema: Option<&L>,
) -> Result<Option<AggregationKind>, ExprError> {
    let parsed = parse_formula(formula)?;
    let schema = schema
        .filter(|schema| !schema.is_empty())
        .ok_or(ExprError::NoSchema)?;
    if let Some(missing) = parsed
        .dependent_columns
        .iter()
        .find(|column| !schema.has_column(column))
    {
        return Err(ExprError::MissingColumn(missing.clone()));
    }
    Ok(parsed.aggregation)
}

// ── Evaluation ──

/// The table an expression is evaluated against.
///
/// Percentile ranks need the whole column, so they are computed once per
/// distinct inner expression and reused for every row.
pub struct EvalContext<'a> {
    frame: &'a DataFrame,
    ranks: RefCell<Vec<(Expr, Rc<Vec<Scalar>>)>>,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub fn new(frame: &'a DataFrame) -> Self {
        Self {
            frame,
            ranks: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn frame(&self) -> &'a DataFrame {
        self.frame
    }

    fn value(&self, name: &str, row: usize) -> Result<Scalar, ExprError> {
        let column = self
            .frame
            .column(name)
            .ok_or_else(|| ExprError::MissingColumn(name.to_owned()))?;
        Ok(column
            .value(row)
            .cloned()
            .unwrap_or(Scalar::Null(NullKind::Null)))
    }

    fn percentile_ranks(&self, inner: &Expr) -> Result<Rc<Vec<Scalar>>, ExprError> {
        if let Some((_, ranks)) = self.ranks.borrow().iter().find(|(expr, _)| expr == inner) {
            return Ok(Rc::clone(ranks));
        }

        let values = (0..self.frame.len())
            .map(|row| evaluate_row(inner, self, row))
            .collect::<Result<Vec<_>, _>>()?;
        let ranks = Rc::new(percentile_of_scores(&values)?);
        self.ranks
            .borrow_mut()
            .push((inner.clone(), Rc::clone(&ranks)));
        Ok(ranks)
    }
}

/// Percentile rank of each value among the non-missing values, counting
/// ties as the mean of the strict and inclusive ranks.
fn percentile_of_scores(values: &[Scalar]) -> Result<Vec<Scalar>, ExprError> {
    let mut present = Vec::with_capacity(values.len());
    for value in values {
        if !value.is_missing() {
            present.push(value.to_f64()?);
        }
    }
    present.sort_by(f64::total_cmp);
    let n = present.len() as f64;

    values
        .iter()
        .map(|value| {
            if value.is_missing() {
                return Ok(Scalar::Null(NullKind::NaN));
            }
            let score = value.to_f64()?;
            let left = present.partition_point(|v| *v < score);
            let right = present.partition_point(|v| *v <= score);
            let bump = usize::from(right > left);
            Ok(Scalar::Float64((left + right + bump) as f64 * 50.0 / n))
        })
        .collect()
}

fn truthy(value: &Scalar) -> Result<bool, ExprError> {
    if value.is_missing() {
        return Ok(false);
    }
    Ok(value.to_bool()?)
}

/// Evaluate `expr` for row `row` of the context's frame.
pub fn evaluate_row(expr: &Expr, ctx: &EvalContext<'_>, row: usize) -> Result<Scalar, ExprError> {
    let value = match expr {
        Expr::Literal { value } => value.clone(),
        Expr::Column { name } => ctx.value(name, row)?,
        Expr::Negate { expr } => match evaluate_row(expr, ctx, row)? {
            Scalar::Int64(v) => v
                .checked_neg()
                .map_or(Scalar::Float64(-(v as f64)), Scalar::Int64),
            other if other.is_missing() => other,
            other => Scalar::Float64(-other.to_f64()?),
        },
        Expr::Arithmetic { op, left, right } => {
            let lhs = evaluate_row(left, ctx, row)?;
            let rhs = evaluate_row(right, ctx, row)?;
            arithmetic(&lhs, &rhs, *op)?
        }
        Expr::Compare { op, left, right } => {
            let lhs = evaluate_row(left, ctx, row)?;
            let rhs = evaluate_row(right, ctx, row)?;
            compare(&lhs, &rhs, *op)?
        }
        Expr::And { left, right } => Scalar::Bool(
            truthy(&evaluate_row(left, ctx, row)?)? && truthy(&evaluate_row(right, ctx, row)?)?,
        ),
        Expr::Or { left, right } => Scalar::Bool(
            truthy(&evaluate_row(left, ctx, row)?)? || truthy(&evaluate_row(right, ctx, row)?)?,
        ),
        Expr::Not { expr } => Scalar::Bool(!truthy(&evaluate_row(expr, ctx, row)?)?),
        Expr::In { expr, values } => {
            let value = evaluate_row(expr, ctx, row)?;
            let rendered = value.render();
            Scalar::Bool(!value.is_missing() && values.iter().any(|v| *v == rendered))
        }
        Expr::Date { seconds, .. } => Scalar::Datetime(*seconds),
        Expr::Percentile { expr } => ctx
            .percentile_ranks(expr)?
            .get(row)
            .cloned()
            .unwrap_or(Scalar::Null(NullKind::NaN)),
        Expr::Case { arms, default } => {
            for arm in arms {
                if truthy(&evaluate_row(&arm.condition, ctx, row)?)? {
                    return evaluate_row(&arm.value, ctx, row);
                }
            }
            match default {
                Some(default) => evaluate_row(default, ctx, row)?,
                None => return Err(ExprError::CaseWithoutDefault),
            }
        }
    };
    Ok(value)
}

/// Evaluate `expr` for every row of `frame`.
pub fn evaluate_column(expr: &Expr, frame: &DataFrame) -> Result<Column, ExprError> {
    let ctx = EvalContext::new(frame);
    let values = (0..frame.len())
        .map(|row| evaluate_row(expr, &ctx, row))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Column::from_values(values)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use cf_columnar::{ArithmeticOp, ComparisonOp};
    use cf_frame::{DataFrame, Row};
    use cf_groupby::AggregationKind;
    use cf_types::{NullKind, Scalar};
    use proptest::prelude::*;

    use super::{
        Expr, ExprError, dependent_columns, evaluate_column, is_reserved_word, parse_formula,
        validate_formula,
    };

    fn frame(rows: &[&[(&str, Scalar)]]) -> DataFrame {
        let rows = rows
            .iter()
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(name, value)| ((*name).to_owned(), value.clone()))
                    .collect::<Row>()
            })
            .collect::<Vec<_>>();
        DataFrame::from_rows(&rows).expect("frame")
    }

    fn eval(formula: &str, data: &DataFrame) -> Vec<Scalar> {
        let parsed = parse_formula(formula).expect("parse");
        evaluate_column(&parsed.expressions[0], data)
            .expect("evaluate")
            .into_values()
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| (*item).to_owned()).collect()
    }

    #[test]
    fn dependent_columns_exclude_reserved_words() {
        let parsed = parse_formula("amount + gps_alt * gps_precision").expect("parse");
        assert_eq!(
            parsed.dependent_columns,
            names(&["amount", "gps_alt", "gps_precision"])
        );
        assert_eq!(parsed.aggregation, None);
        assert_eq!(parsed.expressions.len(), 1);
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let parsed = parse_formula("a + b * 2").expect("parse");
        match &parsed.expressions[0] {
            Expr::Arithmetic {
                op: ArithmeticOp::Add,
                left,
                right,
            } => {
                assert_eq!(**left, Expr::column("a"));
                assert!(matches!(
                    **right,
                    Expr::Arithmetic {
                        op: ArithmeticOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected addition, got {other:?}"),
        }
    }

    #[test]
    fn exponent_is_right_associative() {
        let data = frame(&[&[("x", Scalar::Int64(2))]]);
        assert_eq!(eval("x ^ 3 ^ 2", &data), vec![Scalar::Int64(512)]);
        assert_eq!(eval("-x ^ 2", &data), vec![Scalar::Int64(4)]);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let parsed = parse_formula("SUM(amount)").expect("parse");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Sum));

        let data = frame(&[&[("a", Scalar::Int64(1))]]);
        assert_eq!(eval("NOT a == 2", &data), vec![Scalar::Bool(true)]);
    }

    #[test]
    fn ratio_yields_one_expression_per_argument() {
        let parsed = parse_formula("ratio(amount, gps_alt + 1)").expect("parse");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Ratio));
        assert_eq!(parsed.expressions.len(), 2);
        assert_eq!(parsed.dependent_columns, names(&["amount", "gps_alt"]));
    }

    #[test]
    fn aggregation_arity_is_checked() {
        let err = parse_formula("ratio(amount)").expect_err("arity");
        assert!(matches!(err, ExprError::Parse(_)));
    }

    #[test]
    fn unknown_aggregation_is_reported_by_name() {
        let err = parse_formula("count(amount)").expect_err("unknown");
        assert!(matches!(err, ExprError::UnknownAggregation(name) if name == "count"));
    }

    #[test]
    fn reserved_word_cannot_be_a_column() {
        for formula in ["years + 1", "amount + default", "amount * Mean"] {
            let err = parse_formula(formula).expect_err(formula);
            assert!(
                matches!(err, ExprError::ReservedWord { .. }),
                "{formula}: {err:?}"
            );
        }
        assert!(is_reserved_word("Percentile"));
        assert!(!is_reserved_word("amount"));
    }

    #[test]
    fn parse_error_carries_fragment_and_position() {
        match parse_formula("amount + ) 2").expect_err("bad") {
            ExprError::Parse(err) => {
                assert_eq!(err.fragment, ")");
                assert_eq!(err.position, 9);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        match parse_formula("amount +").expect_err("truncated") {
            ExprError::Parse(err) => {
                assert_eq!(err.fragment, "");
                assert_eq!(err.position, 8);
            }
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(parse_formula("amount = 2").is_err());
    }

    #[test]
    fn logical_and_comparison_evaluate_row_wise() {
        let data = frame(&[
            &[("amount", Scalar::Int64(2))],
            &[("amount", Scalar::Int64(20))],
            &[("amount", Scalar::Int64(5))],
        ]);
        assert_eq!(
            eval("amount == 2 or 10 < amount", &data),
            vec![Scalar::Bool(true), Scalar::Bool(true), Scalar::Bool(false)]
        );
        assert_eq!(
            eval("not (amount == 2 or 10 < amount)", &data),
            vec![Scalar::Bool(false), Scalar::Bool(false), Scalar::Bool(true)]
        );
    }

    #[test]
    fn membership_compares_rendered_values() {
        let data = frame(&[
            &[("amount", Scalar::Float64(9.0))],
            &[("amount", Scalar::Float64(3.0))],
            &[("amount", Scalar::Null(NullKind::NaN))],
        ]);
        assert_eq!(
            eval(r#"amount in ["9.0", "2.0", "20.0"]"#, &data),
            vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(false)]
        );
    }

    #[test]
    fn case_is_first_match_wins_with_default() {
        let data = frame(&[
            &[("food", Scalar::from("morning_food"))],
            &[("food", Scalar::from("lunch"))],
        ]);
        assert_eq!(
            eval(r#"case food in ["morning_food"]: 1, default: 3"#, &data),
            vec![Scalar::Int64(1), Scalar::Int64(3)]
        );
    }

    #[test]
    fn case_without_default_fails_when_nothing_matches() {
        let data = frame(&[&[("x", Scalar::Int64(0))]]);
        let parsed = parse_formula("case x > 1: 1").expect("parse");
        let err = evaluate_column(&parsed.expressions[0], &data).expect_err("no match");
        assert!(matches!(err, ExprError::CaseWithoutDefault));
    }

    #[test]
    fn date_differences_are_seconds() {
        let data = frame(&[&[("submit_date", Scalar::Datetime(0))]]);
        assert_eq!(
            eval(r#"date("09-04-2012") - submit_date > 21078000"#, &data),
            vec![Scalar::Bool(true)]
        );
        assert!(parse_formula(r#"date("not a date")"#).is_err());
    }

    #[test]
    fn percentile_uses_rank_ties() {
        let data = frame(&[
            &[("x", Scalar::Int64(1))],
            &[("x", Scalar::Int64(2))],
            &[("x", Scalar::Int64(2))],
            &[("x", Scalar::Int64(4))],
        ]);
        assert_eq!(
            eval("percentile(x)", &data),
            vec![
                Scalar::Float64(25.0),
                Scalar::Float64(62.5),
                Scalar::Float64(62.5),
                Scalar::Float64(100.0),
            ]
        );
    }

    #[test]
    fn missing_operands_propagate_as_nan() {
        let data = frame(&[&[("a", Scalar::Null(NullKind::Null)), ("b", Scalar::Int64(1))]]);
        assert!(eval("a + b", &data)[0].is_missing());
    }

    #[test]
    fn comparison_chains_left_to_right() {
        let parsed = parse_formula("a < b == c").expect("parse");
        assert!(matches!(
            parsed.expressions[0],
            Expr::Compare {
                op: ComparisonOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn validate_requires_schema_and_known_columns() {
        let schema = names(&["amount", "region"]);
        assert_eq!(
            validate_formula("sum(amount)", Some(&schema)).expect("valid"),
            Some(AggregationKind::Sum)
        );
        assert_eq!(validate_formula("amount * 2", Some(&schema)).expect("valid"), None);
        assert!(matches!(
            validate_formula("amount + missing", Some(&schema)),
            Err(ExprError::MissingColumn(name)) if name == "missing"
        ));
        assert!(matches!(
            validate_formula("amount", None::<&BTreeSet<String>>),
            Err(ExprError::NoSchema)
        ));
        assert!(matches!(
            validate_formula("amount", Some(&BTreeSet::<String>::new())),
            Err(ExprError::NoSchema)
        ));
    }

    fn ident() -> impl Strategy<Value = String> {
        "[a-z_][a-z0-9_]{0,6}".prop_filter("reserved", |name| {
            !is_reserved_word(name) && name != "case"
        })
    }

    proptest! {
        #[test]
        fn dependent_columns_match_referenced_identifiers(
            idents in prop::collection::vec(ident(), 1..5),
            ops in prop::collection::vec(prop::sample::select(vec!["+", "-", "*", "/"]), 4),
        ) {
            let mut formula = idents[0].clone();
            for (idx, name) in idents.iter().enumerate().skip(1) {
                formula.push_str(&format!(" {} {name}", ops[idx - 1]));
            }

            let parsed = parse_formula(&formula).expect("parse");
            let expected = idents.iter().cloned().collect::<BTreeSet<_>>();
            prop_assert_eq!(&parsed.dependent_columns, &expected);
            prop_assert_eq!(dependent_columns(&parsed.expressions[0]), expected);
        }

        #[test]
        fn parsing_is_pure(a in -1000_i64..1000, b in 1_i64..1000) {
            let formula = format!("x * {b} + {a} - x / {b}");
            let first = parse_formula(&formula).expect("first");
            let second = parse_formula(&formula).expect("second");
            prop_assert_eq!(&first, &second);

            let data = frame(&[&[("x", Scalar::Int64(a))]]);
            let lhs = evaluate_column(&first.expressions[0], &data).expect("lhs");
            let rhs = evaluate_column(&second.expressions[0], &data).expect("rhs");
            prop_assert!(lhs.semantic_eq(&rhs));
        }

        #[test]
        fn arbitrary_input_never_panics(input in ".{0,40}") {
            let _ = parse_formula(&input);
        }
    }
}
