//! Expression parsing.

use std::fmt;

use pest::error::InputLocation;
use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use tracing::debug;

use super::Value;
use crate::error::{QuarryError, QuarryResult};

#[derive(Parser)]
#[grammar = "eval/expr.pest"]
struct ExprParser;

/// A parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr
{
    Ident(String),
    Literal(Value),
    /// `base.field`; also `pkg.Name` before package lookup
    Selector
    {
        base: Box<Expr>,
        field: String,
    },
    /// `base[index]`
    Index
    {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Deref(Box<Expr>),
    AddrOf(Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
}

impl Expr
{
    fn is_unary(&self) -> bool
    {
        matches!(self, Expr::Deref(_) | Expr::AddrOf(_) | Expr::Neg(_) | Expr::Not(_))
    }
}

impl fmt::Display for Expr
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Expr::Ident(name) => f.write_str(name),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Selector { base, field } if base.is_unary() => write!(f, "({base}).{field}"),
            Expr::Selector { base, field } => write!(f, "{base}.{field}"),
            Expr::Index { base, index } if base.is_unary() => write!(f, "({base})[{index}]"),
            Expr::Index { base, index } => write!(f, "{base}[{index}]"),
            Expr::Deref(inner) => write!(f, "*{inner}"),
            Expr::AddrOf(inner) => write!(f, "&{inner}"),
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Not(inner) => write!(f, "!{inner}"),
        }
    }
}

/// Parse `input` into an expression tree.
pub fn parse_expression(input: &str) -> QuarryResult<Expr>
{
    debug!(input, "parsing expression");
    let mut pairs = ExprParser::parse(Rule::expression, input).map_err(|err| {
        let offset = match err.location {
            InputLocation::Pos(pos) | InputLocation::Span((pos, _)) => pos,
        };
        QuarryError::Parse {
            offset,
            message: err.variant.message().into_owned(),
        }
    })?;
    let expression = next(&mut pairs, input.len())?;
    let mut inner = expression.into_inner();
    build_expr(next(&mut inner, input.len())?)
}

fn next<'i>(pairs: &mut Pairs<'i, Rule>, offset: usize) -> QuarryResult<Pair<'i, Rule>>
{
    pairs.next().ok_or_else(|| QuarryError::Parse {
        offset,
        message: "unexpected end of expression".into(),
    })
}

fn unexpected(pair: &Pair<'_, Rule>) -> QuarryError
{
    QuarryError::Parse {
        offset: pair.as_span().start(),
        message: format!("unexpected {:?}", pair.as_rule()),
    }
}

fn build_expr(pair: Pair<'_, Rule>) -> QuarryResult<Expr>
{
    let mut prefixes = Vec::new();
    let mut operand = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::prefix_op => prefixes.push(next(&mut inner.clone().into_inner(), inner.as_span().start())?),
            Rule::postfix_expr => operand = Some(build_postfix(inner)?),
            _ => return Err(unexpected(&inner)),
        }
    }
    let mut expr = operand.ok_or_else(|| QuarryError::Parse {
        offset: 0,
        message: "missing operand".into(),
    })?;

    // The operator closest to the operand applies first
    for op in prefixes.into_iter().rev() {
        expr = match op.as_rule() {
            Rule::deref_op => Expr::Deref(Box::new(expr)),
            Rule::addr_op => Expr::AddrOf(Box::new(expr)),
            Rule::neg_op => Expr::Neg(Box::new(expr)),
            Rule::not_op => Expr::Not(Box::new(expr)),
            _ => return Err(unexpected(&op)),
        };
    }
    Ok(expr)
}

fn build_postfix(pair: Pair<'_, Rule>) -> QuarryResult<Expr>
{
    let start = pair.as_span().start();
    let mut inner = pair.into_inner();
    let mut expr = build_primary(next(&mut inner, start)?)?;
    for postfix in inner {
        let at = postfix.as_span().start();
        expr = match postfix.as_rule() {
            Rule::selector => Expr::Selector {
                base: Box::new(expr),
                field: next(&mut postfix.into_inner(), at)?.as_str().to_string(),
            },
            Rule::index => Expr::Index {
                base: Box::new(expr),
                index: Box::new(build_expr(next(&mut postfix.into_inner(), at)?)?),
            },
            _ => return Err(unexpected(&postfix)),
        };
    }
    Ok(expr)
}

fn build_primary(pair: Pair<'_, Rule>) -> QuarryResult<Expr>
{
    let text = pair.as_str();
    let at = pair.as_span().start();
    let number_error = |err: &dyn fmt::Display| QuarryError::Parse {
        offset: at,
        message: format!("invalid number {text}: {err}"),
    };
    match pair.as_rule() {
        Rule::identifier => Ok(Expr::Ident(text.to_string())),
        Rule::expr => build_expr(pair),
        Rule::integer => {
            let n = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => text.parse::<u64>(),
            }
            .map_err(|err| number_error(&err))?;
            Ok(Expr::Literal(i64::try_from(n).map_or(Value::Uint(n), Value::Int)))
        }
        Rule::float => Ok(Expr::Literal(Value::Float(
            text.parse::<f64>().map_err(|err| number_error(&err))?,
        ))),
        Rule::imaginary => {
            let imag = text[..text.len() - 1].parse::<f64>().map_err(|err| number_error(&err))?;
            Ok(Expr::Literal(Value::Complex(0.0, imag)))
        }
        Rule::string => {
            let body = next(&mut pair.into_inner(), at)?;
            Ok(Expr::Literal(Value::String(unescape(body.as_str(), at)?)))
        }
        _ => Err(unexpected(&pair)),
    }
}

fn unescape(raw: &str, offset: usize) -> QuarryResult<String>
{
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = match chars.next() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some(c @ ('\\' | '"' | '\'')) => c,
            other => {
                return Err(QuarryError::Parse {
                    offset,
                    message: format!("unknown escape sequence \\{}", other.unwrap_or(' ')),
                })
            }
        };
        out.push(escaped);
    }
    Ok(out)
}
