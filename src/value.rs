//! Decoded values: one [`Value`] per element instance, with children for
//! containers and a kind-specific [`Extra`] payload for leaves.

use crate::grammar::{ElementId, Endian, Schema};
use crate::resolve::CycleError;
use std::fmt;

/// Numeric payload of a `Number` (or the raw pointer of an `Offset`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

impl NumberValue {
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            NumberValue::Unsigned(x) => i64::try_from(x).ok(),
            NumberValue::Signed(x) => Some(x),
            NumberValue::Float(x) if x.is_finite() && x.fract() == 0.0 => {
                if x >= i64::MIN as f64 && x <= i64::MAX as f64 {
                    Some(x as i64)
                } else {
                    None
                }
            }
            NumberValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            NumberValue::Unsigned(x) => x as f64,
            NumberValue::Signed(x) => x as f64,
            NumberValue::Float(x) => x,
        }
    }

    /// Bit pattern used for masks.
    pub fn raw_bits(&self) -> u64 {
        match *self {
            NumberValue::Unsigned(x) => x,
            NumberValue::Signed(x) => x as u64,
            NumberValue::Float(x) => x.to_bits(),
        }
    }
}

impl fmt::Display for NumberValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberValue::Unsigned(x) => write!(f, "{}", x),
            NumberValue::Signed(x) => write!(f, "{}", x),
            NumberValue::Float(x) => write!(f, "{}", x),
        }
    }
}

/// Exact position of a bit field: absolute bit index (`byte * 8 + bit`, LSB
/// first) and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub first_bit: u64,
    pub bits: u64,
}

/// A mask applied to a number: the extracted field and its matched name.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskValue {
    pub name: String,
    pub value: u64,
    pub matched: Option<String>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Extra {
    /// Containers and elements with nothing beyond their byte range.
    #[default]
    None,
    Number {
        value: NumberValue,
        /// Name of the fixed value equal to `value`, if any.
        matched: Option<String>,
        masks: Vec<MaskValue>,
        bits: Option<BitSpan>,
    },
    String {
        text: String,
        matched: Option<String>,
    },
    /// Bytes are not kept; re-read them from the input by offset/len.
    Binary {
        matched: Option<String>,
    },
    Offset {
        pointer: u64,
        /// Absolute address, `None` when a null pointer was not followed.
        target: Option<u64>,
        /// Value decoded at `target` (side tree, outside parent contiguity).
        referenced: Option<Box<Value>>,
    },
    Custom {
        text: String,
    },
}

/// One decoded element instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub offset: u64,
    pub len: u64,
    pub element: ElementId,
    pub extra: Extra,
    /// Contiguous children, in decode order (containers only).
    pub children: Vec<Value>,
    /// Byte order the value was read with (numbers and offsets).
    pub byte_order: Option<Endian>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{value}: element {element} is not part of the grammar")]
    UnknownElement { value: String, element: ElementId },
    #[error("{value}: a {kind} value cannot have children")]
    UnexpectedChildren { value: String, kind: &'static str },
    #[error("{parent}: child {child} starts at {found:#x}, expected {expected:#x}")]
    ChildOffset {
        parent: String,
        child: String,
        expected: u64,
        found: u64,
    },
    #[error("{parent}: children end at {found:#x}, expected {expected:#x}")]
    ChildrenEnd { parent: String, expected: u64, found: u64 },
    #[error("{value}: offset + len overflows")]
    Overflow { value: String },
    #[error("in value referenced by {offset}: {source}")]
    SideTree {
        offset: String,
        #[source]
        source: Box<ValidationError>,
    },
}

impl Value {
    pub fn new(element: ElementId, offset: u64, len: u64) -> Self {
        Value { offset, len, element, extra: Extra::None, children: Vec::new(), byte_order: None }
    }

    /// First byte after the value.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn name<'s>(&self, schema: &'s Schema) -> Result<&'s str, CycleError> {
        match schema.node(self.element) {
            Some(node) => node.name(),
            None => Ok(""),
        }
    }

    pub fn description<'s>(&self, schema: &'s Schema) -> Result<&'s str, CycleError> {
        match schema.node(self.element) {
            Some(node) => node.description(),
            None => Ok(""),
        }
    }

    pub(crate) fn has_name(&self, schema: &Schema, name: &str) -> bool {
        matches!(self.name(schema), Ok(n) if n == name)
    }

    /// Integer view: numbers that fit `i64`, and offset pointers.
    pub fn as_i64(&self) -> Option<i64> {
        match &self.extra {
            Extra::Number { value, .. } => value.as_i64(),
            Extra::Offset { pointer, .. } => i64::try_from(*pointer).ok(),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<NumberValue> {
        match &self.extra {
            Extra::Number { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.extra {
            Extra::String { text, .. } | Extra::Custom { text } => Some(text),
            _ => None,
        }
    }

    /// Name of the matched fixed value (numbers, strings, binaries).
    pub fn matched(&self) -> Option<&str> {
        match &self.extra {
            Extra::Number { matched, .. } | Extra::String { matched, .. } | Extra::Binary { matched } => {
                matched.as_deref()
            }
            _ => None,
        }
    }

    /// Side tree of an offset.
    pub fn referenced(&self) -> Option<&Value> {
        match &self.extra {
            Extra::Offset { referenced, .. } => referenced.as_deref(),
            _ => None,
        }
    }

    /// Depth-first search (self included) over structural children.
    pub fn find(&self, element: ElementId) -> Option<&Value> {
        if self.element == element {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(element))
    }

    /// Last direct child named `name`.
    pub fn child_named(&self, schema: &Schema, name: &str) -> Option<&Value> {
        self.children.iter().rev().find(|c| c.has_name(schema, name))
    }

    /// Most recent value named `name` in this subtree (self included).
    pub fn find_named(&self, schema: &Schema, name: &str) -> Option<&Value> {
        if self.has_name(schema, name) {
            return Some(self);
        }
        self.children.iter().rev().find_map(|c| c.find_named(schema, name))
    }

    /// Check the structural invariants of the tree rooted here: elements exist,
    /// only containers have children, children tile their parent exactly. Offset
    /// side trees are checked on their own.
    pub fn validate(&self, schema: &Schema) -> Result<(), ValidationError> {
        let label = || self.label(schema);
        let element = schema
            .get(self.element)
            .ok_or_else(|| ValidationError::UnknownElement { value: label(), element: self.element })?;
        let end = self
            .offset
            .checked_add(self.len)
            .ok_or_else(|| ValidationError::Overflow { value: label() })?;
        if !self.children.is_empty() {
            if !element.kind.produces_children() {
                return Err(ValidationError::UnexpectedChildren { value: label(), kind: element.kind.kind_name() });
            }
            let mut cursor = self.offset;
            for child in &self.children {
                if child.offset != cursor {
                    return Err(ValidationError::ChildOffset {
                        parent: label(),
                        child: child.label(schema),
                        expected: cursor,
                        found: child.offset,
                    });
                }
                child.validate(schema)?;
                cursor = child.end();
            }
            if cursor != end {
                return Err(ValidationError::ChildrenEnd { parent: label(), expected: end, found: cursor });
            }
        }
        if let Some(side) = self.referenced() {
            side.validate(schema)
                .map_err(|e| ValidationError::SideTree { offset: label(), source: Box::new(e) })?;
        }
        Ok(())
    }

    fn label(&self, schema: &Schema) -> String {
        match schema.node(self.element) {
            Some(node) => format!("{}@{:#x}", node.label(), self.offset),
            None => format!("{}@{:#x}", self.element, self.offset),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:#x}+{}]", self.element, self.offset, self.len)?;
        match &self.extra {
            Extra::None => Ok(()),
            Extra::Number { value, .. } => write!(f, " = {}", value),
            Extra::String { text, .. } | Extra::Custom { text } => write!(f, " = {:?}", text),
            Extra::Binary { matched } => match matched {
                Some(name) => write!(f, " = {}", name),
                None => Ok(()),
            },
            Extra::Offset { pointer, target, .. } => match target {
                Some(t) => write!(f, " -> {:#x} (pointer {:#x})", t, pointer),
                None => write!(f, " -> null"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Element;

    fn number(element: ElementId, offset: u64, len: u64, v: u64) -> Value {
        let mut value = Value::new(element, offset, len);
        value.extra = Extra::Number { value: NumberValue::Unsigned(v), matched: None, masks: Vec::new(), bits: None };
        value
    }

    fn schema() -> (Schema, ElementId, ElementId, ElementId) {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let s = b.add(g, Element::structure("s"));
        let n = b.add(s, Element::number("n").length("2"));
        (b.build(g), g, s, n)
    }

    #[test]
    fn validate_accepts_tiling_children() {
        let (schema, _, s, n) = schema();
        let mut parent = Value::new(s, 4, 4);
        parent.children = vec![number(n, 4, 2, 1), number(n, 6, 2, 2)];
        assert!(parent.validate(&schema).is_ok());
        assert_eq!(parent.child_named(&schema, "n").and_then(Value::as_i64), Some(2));
        assert_eq!(parent.find(n).map(|v| v.offset), Some(4));
    }

    #[test]
    fn validate_reports_gap_and_short_cover() {
        let (schema, _, s, n) = schema();
        let mut gap = Value::new(s, 0, 4);
        gap.children = vec![number(n, 0, 2, 1), number(n, 3, 1, 2)];
        assert!(matches!(
            gap.validate(&schema),
            Err(ValidationError::ChildOffset { expected: 2, found: 3, .. })
        ));

        let mut short = Value::new(s, 0, 4);
        short.children = vec![number(n, 0, 2, 1)];
        assert!(matches!(
            short.validate(&schema),
            Err(ValidationError::ChildrenEnd { expected: 4, found: 2, .. })
        ));
    }

    #[test]
    fn validate_rejects_children_on_leaves_and_bad_side_trees() {
        let (schema, _, _, n) = schema();
        let mut leaf = number(n, 0, 2, 1);
        leaf.children.push(number(n, 0, 2, 1));
        assert!(matches!(leaf.validate(&schema), Err(ValidationError::UnexpectedChildren { .. })));

        let mut bad_side = Value::new(n, 0, 2);
        bad_side.children.push(number(n, 0, 2, 1));
        let mut ptr = Value::new(n, 0, 1);
        ptr.extra = Extra::Offset { pointer: 8, target: Some(8), referenced: Some(Box::new(bad_side)) };
        assert!(matches!(ptr.validate(&schema), Err(ValidationError::SideTree { .. })));
        assert_eq!(ptr.as_i64(), Some(8));
    }
}
