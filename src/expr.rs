//! Reference expressions evaluated against already-decoded values.
//!
//! The decoder hands every non-literal [`Reference`](crate::grammar::Reference)
//! to an [`Evaluator`] together with a [`Context`]. [`Expressions`] is the
//! default implementation, parsed with PEST (`expr.pest`).

use crate::decode::Frame;
use crate::grammar::{parse_int, ElementId, Schema};
use crate::value::Value;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "expr.pest"]
struct ExprParser;

/// Result of evaluating a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eval {
    Int(i64),
    /// The expression names a non-numeric value (e.g. a structure).
    Element(ElementId),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error in `{expr}`: {message}")]
    Parse { expr: String, message: String },
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("`{0}` is not numeric")]
    NotNumeric(String),
    #[error("division by zero")]
    DivideByZero,
    #[error("arithmetic overflow in `{0}`")]
    Overflow(String),
    #[error("unsupported expression: {0}")]
    Unsupported(String),
}

/// Evaluates reference expressions. Implementations must be pure: the same
/// expression over the same context always yields the same result.
pub trait Evaluator {
    fn evaluate(&self, expr: &str, ctx: &Context<'_>) -> Result<Eval, ExpressionError>;
}

/// Read-only view over everything decoded so far.
///
/// Names resolve innermost container first and, within a container, most recent
/// value first; a dotted tail (`header.count`) descends into the found value's
/// children.
#[derive(Debug, Clone, Copy)]
pub struct Context<'d> {
    schema: &'d Schema,
    frames: &'d [Frame],
}

impl<'d> Context<'d> {
    pub(crate) fn new(schema: &'d Schema, frames: &'d [Frame]) -> Self {
        Context { schema, frames }
    }

    /// Context with no decoded values (constant expressions only).
    pub fn empty(schema: &'d Schema) -> Self {
        Context { schema, frames: &[] }
    }

    pub fn schema(&self) -> &'d Schema {
        self.schema
    }

    /// Completed values of the innermost open container.
    pub fn siblings(&self) -> &'d [Value] {
        self.frames.last().map(|f| f.children.as_slice()).unwrap_or(&[])
    }

    pub fn lookup(&self, path: &[&str]) -> Option<&'d Value> {
        let (first, rest) = path.split_first()?;
        let schema = self.schema;
        let found = self
            .frames
            .iter()
            .rev()
            .find_map(|f| f.children.iter().rev().find(|v| v.has_name(schema, first)))
            .or_else(|| {
                self.frames
                    .iter()
                    .rev()
                    .find_map(|f| f.children.iter().rev().find_map(|v| v.find_named(schema, first)))
            })?;
        rest.iter().try_fold(found, |v, seg| v.child_named(schema, seg))
    }

    /// Most recent completed value of `element`, searched depth-first.
    pub fn find(&self, element: ElementId) -> Option<&'d Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.children.iter().rev().find_map(|v| v.find(element)))
    }

    /// Start offset of the innermost open container decoding `element`
    /// (either as its own element or as the structure behind a reference).
    pub fn container_start(&self, element: ElementId) -> Option<u64> {
        self.frames
            .iter()
            .rev()
            .filter(|f| !f.side)
            .find(|f| f.element == element || f.definition == Some(element))
            .map(|f| f.start)
    }
}

/// Default evaluator: integer arithmetic over names of decoded values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expressions;

impl Evaluator for Expressions {
    fn evaluate(&self, expr: &str, ctx: &Context<'_>) -> Result<Eval, ExpressionError> {
        if let Some(n) = parse_int(expr.trim()) {
            return Ok(Eval::Int(n));
        }
        if let Ok(mut pairs) = ExprParser::parse(Rule::lone_path, expr) {
            if let Some(path) = pairs.next().and_then(|p| p.into_inner().next()) {
                let segments: Vec<&str> = path.into_inner().map(|p| p.as_str()).collect();
                let value = ctx
                    .lookup(&segments)
                    .ok_or_else(|| ExpressionError::UnknownName(segments.join(".")))?;
                return Ok(match value.as_i64() {
                    Some(n) => Eval::Int(n),
                    None => Eval::Element(value.element),
                });
            }
        }
        let pairs = ExprParser::parse(Rule::expression, expr).map_err(|e| ExpressionError::Parse {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        let top = pairs
            .into_iter()
            .next()
            .and_then(|p| p.into_inner().next())
            .ok_or_else(|| ExpressionError::Parse { expr: expr.to_string(), message: "empty".to_string() })?;
        eval_pair(top, ctx).map(Eval::Int)
    }
}

fn eval_pair(pair: Pair<'_, Rule>, ctx: &Context<'_>) -> Result<i64, ExpressionError> {
    match pair.as_rule() {
        Rule::logical_or
        | Rule::logical_and
        | Rule::comparison
        | Rule::bit_or
        | Rule::bit_xor
        | Rule::bit_and
        | Rule::shift
        | Rule::sum
        | Rule::product => {
            let mut inner = pair.into_inner();
            let first = inner
                .next()
                .ok_or_else(|| ExpressionError::Unsupported("empty operand".to_string()))?;
            let mut acc = eval_pair(first, ctx)?;
            while let Some(op) = inner.next() {
                let rhs = inner
                    .next()
                    .ok_or_else(|| ExpressionError::Unsupported(format!("missing operand after `{}`", op.as_str())))?;
                acc = binary(op.as_str(), acc, eval_pair(rhs, ctx)?)?;
            }
            Ok(acc)
        }
        Rule::unary => {
            let mut ops = Vec::new();
            for inner in pair.into_inner() {
                if inner.as_rule() == Rule::op_unary {
                    ops.push(inner.as_str());
                    continue;
                }
                let mut v = eval_pair(inner, ctx)?;
                for op in ops.iter().rev() {
                    v = match *op {
                        "-" => v.checked_neg().ok_or_else(|| ExpressionError::Overflow(format!("-{}", v)))?,
                        "!" => (v == 0) as i64,
                        "~" => !v,
                        other => return Err(ExpressionError::Unsupported(other.to_string())),
                    };
                }
                return Ok(v);
            }
            Err(ExpressionError::Unsupported("unary without operand".to_string()))
        }
        Rule::number => {
            let text = pair.as_str();
            parse_int(text).ok_or_else(|| ExpressionError::Overflow(text.to_string()))
        }
        Rule::path => {
            let segments: Vec<&str> = pair.into_inner().map(|p| p.as_str()).collect();
            let name = segments.join(".");
            let value = ctx
                .lookup(&segments)
                .ok_or_else(|| ExpressionError::UnknownName(name.clone()))?;
            value.as_i64().ok_or(ExpressionError::NotNumeric(name))
        }
        other => Err(ExpressionError::Unsupported(format!("{:?}", other))),
    }
}

fn binary(op: &str, a: i64, b: i64) -> Result<i64, ExpressionError> {
    let overflow = || ExpressionError::Overflow(format!("{} {} {}", a, op, b));
    let shift = || u32::try_from(b).ok();
    Ok(match op {
        "||" => (a != 0 || b != 0) as i64,
        "&&" => (a != 0 && b != 0) as i64,
        "==" => (a == b) as i64,
        "!=" => (a != b) as i64,
        "<" => (a < b) as i64,
        "<=" => (a <= b) as i64,
        ">" => (a > b) as i64,
        ">=" => (a >= b) as i64,
        "|" => a | b,
        "^" => a ^ b,
        "&" => a & b,
        "<<" => shift().and_then(|s| a.checked_shl(s)).ok_or_else(overflow)?,
        ">>" => shift().and_then(|s| a.checked_shr(s)).ok_or_else(overflow)?,
        "+" => a.checked_add(b).ok_or_else(overflow)?,
        "-" => a.checked_sub(b).ok_or_else(overflow)?,
        "*" => a.checked_mul(b).ok_or_else(overflow)?,
        "/" | "%" if b == 0 => return Err(ExpressionError::DivideByZero),
        "/" => a.checked_div(b).ok_or_else(overflow)?,
        "%" => a.checked_rem(b).ok_or_else(overflow)?,
        other => return Err(ExpressionError::Unsupported(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Element;
    use crate::value::{Extra, NumberValue};

    fn eval(expr: &str) -> Result<Eval, ExpressionError> {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let schema = b.build(g);
        Expressions.evaluate(expr, &Context::empty(&schema))
    }

    fn number(element: ElementId, offset: u64, v: u64) -> Value {
        let mut value = Value::new(element, offset, 4);
        value.extra = Extra::Number { value: NumberValue::Unsigned(v), matched: None, masks: Vec::new(), bits: None };
        value
    }

    #[test]
    fn test_literals_and_precedence() {
        assert_eq!(eval("0x10").unwrap(), Eval::Int(16));
        assert_eq!(eval("2 + 3 * 4").unwrap(), Eval::Int(14));
        assert_eq!(eval("(2 + 3) * 4").unwrap(), Eval::Int(20));
        assert_eq!(eval("1 << 4 | 1").unwrap(), Eval::Int(17));
        assert_eq!(eval("0b101 & 3").unwrap(), Eval::Int(1));
        assert_eq!(eval("-3 + ~0").unwrap(), Eval::Int(-4));
        assert_eq!(eval("5 > 3 && 2 != 2 || !0").unwrap(), Eval::Int(1));
        assert_eq!(eval("7 % 4 - 10 / 3").unwrap(), Eval::Int(0));
    }

    #[test]
    fn test_arithmetic_errors() {
        assert_eq!(eval("1 / 0"), Err(ExpressionError::DivideByZero));
        assert!(matches!(eval("9223372036854775807 + 1"), Err(ExpressionError::Overflow(_))));
        assert!(matches!(eval("1 << 64"), Err(ExpressionError::Overflow(_))));
        assert!(matches!(eval("1 +"), Err(ExpressionError::Parse { .. })));
        assert_eq!(eval("missing"), Err(ExpressionError::UnknownName("missing".to_string())));
    }

    #[test]
    fn test_names_resolve_most_recent_first() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let s = b.add(g, Element::structure("header"));
        let count = b.add(s, Element::number("count").length("4"));
        let schema = b.build(g);

        let mut outer = Frame::scope(g, 0, 64);
        let mut header = Value::new(s, 0, 4);
        header.children.push(number(count, 0, 2));
        outer.children.push(header);
        let mut inner = Frame::scope(s, 4, 64);
        inner.side = false;
        inner.children.push(number(count, 4, 3));
        inner.children.push(number(count, 8, 5));
        let frames = vec![outer, inner];
        let ctx = Context::new(&schema, &frames);

        assert_eq!(Expressions.evaluate("count * 2", &ctx).unwrap(), Eval::Int(10));
        assert_eq!(Expressions.evaluate("header.count", &ctx).unwrap(), Eval::Int(2));
        assert_eq!(Expressions.evaluate("header", &ctx).unwrap(), Eval::Element(s));
        assert!(matches!(Expressions.evaluate("header + 1", &ctx), Err(ExpressionError::NotNumeric(_))));
        assert_eq!(ctx.find(count).map(|v| v.offset), Some(8));
        assert_eq!(ctx.container_start(s), Some(4));
    }
}
