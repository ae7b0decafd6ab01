//! Format decoded values for display: one-line rendering per the element's
//! effective `Display`, and an indented text dump of a whole tree.

use crate::grammar::{Display, Schema};
use crate::input::{Input, InputError};
use crate::resolve::CycleError;
use crate::value::{Extra, NumberValue, Value};

/// Binary payloads longer than this are elided when rendered.
const BINARY_PREVIEW: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("{0}")]
    Cycle(#[from] CycleError),
    #[error("{0}")]
    Input(#[from] InputError),
}

impl Value {
    /// Render this value per its effective `Display`. Binary bytes are re-read
    /// from `input` (the cursor is left untouched). Containers render as empty.
    pub fn format(&self, schema: &Schema, input: &mut dyn Input) -> Result<String, FormatError> {
        let display = match schema.node(self.element) {
            Some(node) => node.display()?,
            None => Display::Dec,
        };
        Ok(match &self.extra {
            Extra::None => String::new(),
            Extra::Number { value, matched, bits, .. } => {
                let width = bits.map(|b| b.bits).unwrap_or(self.len * 8);
                let number = format_number(*value, display, width);
                match matched {
                    Some(name) => format!("{} ({})", name, number),
                    None => number,
                }
            }
            Extra::String { text, .. } | Extra::Custom { text } => text.clone(),
            Extra::Binary { matched: Some(name) } => name.clone(),
            Extra::Binary { matched: None } => {
                let shown = self.len.min(BINARY_PREVIEW as u64) as usize;
                let mut buf = vec![0u8; shown];
                input.read_exact_at(&mut buf, self.offset)?;
                let mut text = hex_string(&buf);
                if self.len > shown as u64 {
                    text.push_str(" ..");
                }
                text
            }
            Extra::Offset { pointer, target, .. } => {
                let pointer = format_number(NumberValue::Unsigned(*pointer), display, self.len * 8);
                match target {
                    Some(t) => format!("{} -> {:#x}", pointer, t),
                    None => format!("{} -> null", pointer),
                }
            }
        })
    }
}

/// Integer rendering per `display`; `width` (bits) bounds the two's complement
/// pattern shown for negative numbers in non-decimal bases.
pub fn format_number(value: NumberValue, display: Display, width: u64) -> String {
    let bits = match value {
        NumberValue::Float(x) => return format!("{}", x),
        NumberValue::Signed(x) if display == Display::Dec => return format!("{}", x),
        NumberValue::Unsigned(x) if display == Display::Dec => return format!("{}", x),
        other => other.raw_bits(),
    };
    let bits = if width > 0 && width < 64 { bits & ((1u64 << width) - 1) } else { bits };
    match display {
        Display::Hex => format!("0x{:X}", bits),
        Display::Octal => format!("0o{:o}", bits),
        Display::Binary => format!("0b{:b}", bits),
        Display::Dec => format!("{}", bits),
    }
}

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}

/// Multi-line dump of the tree rooted at `value`: one line per value with
/// offset, length, name and rendering; masks and offset side trees nested below.
pub fn dump_tree(value: &Value, schema: &Schema, input: &mut dyn Input) -> Result<String, FormatError> {
    let mut lines = Vec::new();
    dump_into(value, schema, input, 0, &mut lines)?;
    Ok(lines.join("\n"))
}

fn dump_into(
    value: &Value,
    schema: &Schema,
    input: &mut dyn Input,
    indent: usize,
    lines: &mut Vec<String>,
) -> Result<(), FormatError> {
    let pad = "  ".repeat(indent);
    let name = match schema.node(value.element) {
        Some(node) if !node.name()?.is_empty() => node.name()?.to_string(),
        Some(node) => node.label(),
        None => value.element.to_string(),
    };
    let rendered = value.format(schema, input)?;
    if rendered.is_empty() {
        lines.push(format!("{}{} [{:#x}+{}]", pad, name, value.offset, value.len));
    } else {
        lines.push(format!("{}{} [{:#x}+{}]: {}", pad, name, value.offset, value.len, rendered));
    }
    if let Extra::Number { masks, .. } = &value.extra {
        for mask in masks {
            match &mask.matched {
                Some(m) => lines.push(format!("{}  .{} = {} ({})", pad, mask.name, m, mask.value)),
                None => lines.push(format!("{}  .{} = {}", pad, mask.name, mask.value)),
            }
        }
    }
    for child in &value.children {
        dump_into(child, schema, input, indent + 1, lines)?;
    }
    if let Some(side) = value.referenced() {
        lines.push(format!("{}  ->", pad));
        dump_into(side, schema, input, indent + 2, lines)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_per_display() {
        assert_eq!(format_number(NumberValue::Unsigned(255), Display::Dec, 8), "255");
        assert_eq!(format_number(NumberValue::Unsigned(255), Display::Hex, 8), "0xFF");
        assert_eq!(format_number(NumberValue::Unsigned(8), Display::Octal, 8), "0o10");
        assert_eq!(format_number(NumberValue::Unsigned(5), Display::Binary, 8), "0b101");
        assert_eq!(format_number(NumberValue::Float(1.5), Display::Hex, 32), "1.5");
    }

    #[test]
    fn format_negative_uses_field_width() {
        assert_eq!(format_number(NumberValue::Signed(-2), Display::Dec, 16), "-2");
        assert_eq!(format_number(NumberValue::Signed(-2), Display::Hex, 16), "0xFFFE");
        assert_eq!(format_number(NumberValue::Signed(-1), Display::Hex, 64), "0xFFFFFFFFFFFFFFFF");
    }
}
