//! # ufwb: binary template engine
//!
//! Decode arbitrary binary files against declarative grammars (file-format
//! templates) into a tree of typed, offset-annotated values.
//!
//! ## Model
//!
//! - **Grammar** ([`Schema`]): an arena of [`Element`]s linked by [`ElementId`].
//!   Elements inherit unset attributes from their `extends` template and, for
//!   format attributes (endian, display, encoding, length unit), from their
//!   lexical `parent` ([`resolve`]).
//! - **Input** ([`Input`]): any seekable byte source ([`SliceInput`], [`ReaderInput`]).
//! - **Decoder** ([`Decoder`]): walks the grammar over the input. Lengths, repeat
//!   bounds and value expressions may reference already-decoded values through
//!   an [`Evaluator`].
//! - **Values** ([`Value`]): offset/length per element instance, children for
//!   containers, payloads for leaves; offsets carry the decoded target as a side tree.
//!
//! ## Element kinds
//!
//! - Containers: `Grammar`, `GrammarRef`, `Structure`, `StructRef`
//! - Leaves: `Number` (integers, floats, bit fields, masks), `String`, `Binary`
//! - `Offset` (pointer + referenced element), `Custom` / `Script` (via [`ScriptHost`])
//!
//! ## Example
//!
//! ```
//! use ufwb::{Decoder, Element, Endian, Schema, SliceInput};
//!
//! let mut b = Schema::builder();
//! let g = b.define(Element::grammar("records"));
//! let rec = b.add(g, Element::structure("rec"));
//! b.add(rec, Element::number("count").length("1"));
//! let item = b.add(rec, Element::structure("item").repeat_max("count"));
//! b.add(item, Element::number("value").length("4").endian(Endian::Big));
//! let schema = b.build(g);
//!
//! let data = [0x02, 0, 0, 0, 0x07, 0, 0, 0, 0x09];
//! let root = Decoder::new(&schema).decode(&mut SliceInput::new(&data)).unwrap();
//! assert_eq!(root.len, 9);
//! assert_eq!(root.children[0].children.len(), 3);
//! ```
//!
//! See `tests/decode.rs` for more.

pub mod decode;
pub mod dump;
pub mod expr;
pub mod grammar;
pub mod input;
pub mod lint;
pub mod resolve;
pub mod value;

pub use decode::{
    get_decode_profile, reset_decode_profile, DecodeError, DecodeErrorKind, DecodeOptions, Decoder, ScriptCall,
    ScriptHost, ScriptOutput,
};
pub use dump::{dump_tree, FormatError};
pub use expr::{Context, Eval, Evaluator, ExpressionError, Expressions};
pub use grammar::{
    Colour, Display, Element, ElementId, ElementKind, Endian, FixedBinaryValue, FixedStringValue, FixedValue,
    LengthUnit, Mask, NumberKind, Order, Reference, Schema, SchemaBuilder, StringType,
};
pub use input::{Input, InputError, ReaderInput, SliceInput};
pub use lint::{lint, LintMessage, LintRule, Severity};
pub use resolve::{CycleError, Node};
pub use value::{BitSpan, Extra, MaskValue, NumberValue, ValidationError, Value};
