//! Grammar object graph: every element of a template lives in one arena ([`Schema`])
//! and links to others by [`ElementId`].
//!
//! `extends` (template inheritance) and `parent` (lexical container) are plain
//! indices, never ownership. Attributes are `Option`s: `None` means "unset, fall
//! back", so a legitimately zero id or length is never confused with unset.
//! See [`resolve`](crate::resolve) for the fallback rules.

use std::fmt;

/// Index of an element inside a [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A quantity that may depend on already-decoded data: a literal integer or an
/// expression handed to the [`Evaluator`](crate::expr::Evaluator) at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Literal(i64),
    Expr(String),
}

impl Reference {
    /// Parse grammar text. Empty (or blank) text means "unset" and yields `None`.
    pub fn parse(text: &str) -> Option<Reference> {
        let t = text.trim();
        if t.is_empty() {
            return None;
        }
        Some(match parse_int(t) {
            Some(n) => Reference::Literal(n),
            None => Reference::Expr(t.to_string()),
        })
    }

    pub fn as_literal(&self) -> Option<i64> {
        match self {
            Reference::Literal(n) => Some(*n),
            Reference::Expr(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Literal(n) => write!(f, "{}", n),
            Reference::Expr(e) => f.write_str(e),
        }
    }
}

/// Integer literal: optional sign, then decimal, `0x` hex or `0b` binary.
pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()?
    } else if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
        body.parse::<u64>().ok()?
    } else {
        return None;
    };
    if neg {
        0i64.checked_sub_unsigned(magnitude)
    } else {
        i64::try_from(magnitude).ok()
    }
}

/// Byte order of multi-byte numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// How a number is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Display {
    Dec,
    Hex,
    Octal,
    Binary,
}

/// Granularity of `Length` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Bit,
    Byte,
}

impl LengthUnit {
    /// Number of bits in one unit.
    pub fn bits(self) -> u64 {
        match self {
            LengthUnit::Bit => 1,
            LengthUnit::Byte => 8,
        }
    }
}

/// Child ordering of a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Children decoded in declaration order.
    Fixed,
    /// At each position the first child definition that decodes wins.
    Variable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    Unsigned,
    Signed,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringType {
    FixedLength,
    ZeroTerminated,
    Pascal,
    DelimiterTerminated,
}

/// RGB colour used by viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colour(pub u32);

impl Colour {
    pub const WHITE: Colour = Colour(0xFF_FF_FF);
    pub const BLACK: Colour = Colour(0x00_00_00);
}

/// Named fixed value of a number (or of a mask).
#[derive(Debug, Clone, PartialEq)]
pub struct FixedValue {
    pub name: String,
    pub value: i64,
    pub description: Option<String>,
}

impl FixedValue {
    pub fn new(name: &str, value: i64) -> Self {
        FixedValue { name: name.to_string(), value, description: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedStringValue {
    pub name: String,
    pub value: String,
}

impl FixedStringValue {
    pub fn new(name: &str, value: &str) -> Self {
        FixedStringValue { name: name.to_string(), value: value.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedBinaryValue {
    pub name: String,
    pub value: Vec<u8>,
}

impl FixedBinaryValue {
    pub fn new(name: &str, value: &[u8]) -> Self {
        FixedBinaryValue { name: name.to_string(), value: value.to_vec() }
    }
}

/// Named bit-field extracted from a number: `(raw & mask) >> mask.trailing_zeros()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub name: String,
    pub mask: u64,
    pub values: Vec<FixedValue>,
}

impl Mask {
    pub fn new(name: &str, mask: u64) -> Self {
        Mask { name: name.to_string(), mask, values: Vec::new() }
    }
}

/// Attributes shared by every element kind.
#[derive(Debug, Clone, Default)]
pub struct Common {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub elem_type: Option<String>,
    pub fill_colour: Option<Colour>,
    pub stroke_colour: Option<Colour>,
    pub repeat_min: Option<Reference>,
    pub repeat_max: Option<Reference>,
    /// Template inheritance: unset attributes come from this element.
    pub extends: Option<ElementId>,
    /// Lexical container: unset format attributes come from here.
    pub parent: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct GrammarDef {
    pub children: Vec<ElementId>,
    /// When set, only this element is decoded; the other top-level elements are definitions.
    pub start: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct GrammarRefDef {
    pub filename: Option<String>,
    pub uti: Option<String>,
    pub disabled: Option<bool>,
    /// The loaded grammar, linked by the loader.
    pub grammar: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct StructureDef {
    pub children: Vec<ElementId>,
    pub order: Option<Order>,
    pub encoding: Option<String>,
    pub endian: Option<Endian>,
    pub display: Option<Display>,
    pub length_unit: Option<LengthUnit>,
    pub length: Option<Reference>,
    pub length_offset: Option<Reference>,
}

#[derive(Debug, Clone, Default)]
pub struct StructRefDef {
    pub structure: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct NumberDef {
    pub kind: Option<NumberKind>,
    pub length: Option<Reference>,
    pub length_unit: Option<LengthUnit>,
    pub endian: Option<Endian>,
    pub display: Option<Display>,
    pub must_match: Option<bool>,
    pub min_val: Option<Reference>,
    pub max_val: Option<Reference>,
    pub values: Option<Vec<FixedValue>>,
    pub masks: Option<Vec<Mask>>,
    /// When set the value is computed, not read.
    pub value_expression: Option<Reference>,
}

#[derive(Debug, Clone, Default)]
pub struct StringDef {
    pub typ: Option<StringType>,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
    pub length: Option<Reference>,
    pub length_unit: Option<LengthUnit>,
    pub must_match: Option<bool>,
    pub values: Option<Vec<FixedStringValue>>,
}

#[derive(Debug, Clone, Default)]
pub struct BinaryDef {
    pub length: Option<Reference>,
    pub length_unit: Option<LengthUnit>,
    pub must_match: Option<bool>,
    pub values: Option<Vec<FixedBinaryValue>>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomDef {
    pub length: Option<Reference>,
    pub length_unit: Option<LengthUnit>,
    pub script: Option<ElementId>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetDef {
    pub length: Option<Reference>,
    pub length_unit: Option<LengthUnit>,
    pub endian: Option<Endian>,
    pub display: Option<Display>,
    /// Element decoded at the pointed-to address.
    pub references: Option<ElementId>,
    /// Base of the pointer arithmetic; absent means absolute.
    pub relative_to: Option<ElementId>,
    /// Element whose decoded value bounds the referenced region.
    pub referenced_size: Option<ElementId>,
    pub follow_null_reference: Option<bool>,
    pub additional: Option<Reference>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptDef {
    pub language: Option<String>,
    pub source: Option<String>,
}

/// The ten element variants.
#[derive(Debug, Clone)]
pub enum ElementKind {
    Grammar(GrammarDef),
    GrammarRef(GrammarRefDef),
    Structure(StructureDef),
    StructRef(StructRefDef),
    Number(NumberDef),
    String(StringDef),
    Binary(BinaryDef),
    Custom(CustomDef),
    Offset(OffsetDef),
    Script(ScriptDef),
}

impl ElementKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ElementKind::Grammar(_) => "grammar",
            ElementKind::GrammarRef(_) => "grammarref",
            ElementKind::Structure(_) => "structure",
            ElementKind::StructRef(_) => "structref",
            ElementKind::Number(_) => "number",
            ElementKind::String(_) => "string",
            ElementKind::Binary(_) => "binary",
            ElementKind::Custom(_) => "custom",
            ElementKind::Offset(_) => "offset",
            ElementKind::Script(_) => "script",
        }
    }

    /// Kinds whose values may carry children.
    pub fn produces_children(&self) -> bool {
        matches!(self, ElementKind::Grammar(_) | ElementKind::Structure(_) | ElementKind::StructRef(_))
    }

    /// Declared children (grammar and structure only).
    pub fn children(&self) -> &[ElementId] {
        match self {
            ElementKind::Grammar(g) => &g.children,
            ElementKind::Structure(s) => &s.children,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<ElementId>> {
        match self {
            ElementKind::Grammar(g) => Some(&mut g.children),
            ElementKind::Structure(s) => Some(&mut s.children),
            _ => None,
        }
    }
}

/// One grammar node.
#[derive(Debug, Clone)]
pub struct Element {
    pub common: Common,
    pub kind: ElementKind,
}

impl Element {
    pub fn new(name: &str, kind: ElementKind) -> Self {
        let common = Common {
            name: if name.is_empty() { None } else { Some(name.to_string()) },
            ..Common::default()
        };
        Element { common, kind }
    }

    pub fn grammar(name: &str) -> Self {
        Self::new(name, ElementKind::Grammar(GrammarDef::default()))
    }

    pub fn grammar_ref(name: &str) -> Self {
        Self::new(name, ElementKind::GrammarRef(GrammarRefDef::default()))
    }

    pub fn structure(name: &str) -> Self {
        Self::new(name, ElementKind::Structure(StructureDef::default()))
    }

    pub fn struct_ref(name: &str, structure: ElementId) -> Self {
        Self::new(name, ElementKind::StructRef(StructRefDef { structure: Some(structure) }))
    }

    pub fn number(name: &str) -> Self {
        Self::new(name, ElementKind::Number(NumberDef::default()))
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, ElementKind::String(StringDef::default()))
    }

    pub fn binary(name: &str) -> Self {
        Self::new(name, ElementKind::Binary(BinaryDef::default()))
    }

    pub fn custom(name: &str, script: ElementId) -> Self {
        Self::new(name, ElementKind::Custom(CustomDef { script: Some(script), ..CustomDef::default() }))
    }

    pub fn offset(name: &str) -> Self {
        Self::new(name, ElementKind::Offset(OffsetDef::default()))
    }

    pub fn script(name: &str, language: &str, source: &str) -> Self {
        Self::new(
            name,
            ElementKind::Script(ScriptDef {
                language: Some(language.to_string()),
                source: Some(source.to_string()),
            }),
        )
    }

    // Chainable setters. Attributes a kind does not carry are left untouched.

    pub fn id(mut self, id: i64) -> Self {
        self.common.id = Some(id);
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.common.description = Some(text.to_string());
        self
    }

    pub fn elem_type(mut self, text: &str) -> Self {
        self.common.elem_type = Some(text.to_string());
        self
    }

    pub fn fill_colour(mut self, c: Colour) -> Self {
        self.common.fill_colour = Some(c);
        self
    }

    pub fn stroke_colour(mut self, c: Colour) -> Self {
        self.common.stroke_colour = Some(c);
        self
    }

    pub fn repeat_min(mut self, r: &str) -> Self {
        self.common.repeat_min = Reference::parse(r);
        self
    }

    pub fn repeat_max(mut self, r: &str) -> Self {
        self.common.repeat_max = Reference::parse(r);
        self
    }

    pub fn repeat(self, min: &str, max: &str) -> Self {
        self.repeat_min(min).repeat_max(max)
    }

    pub fn extends(mut self, base: ElementId) -> Self {
        self.common.extends = Some(base);
        self
    }

    pub fn length(mut self, r: &str) -> Self {
        let r = Reference::parse(r);
        match &mut self.kind {
            ElementKind::Structure(d) => d.length = r,
            ElementKind::Number(d) => d.length = r,
            ElementKind::String(d) => d.length = r,
            ElementKind::Binary(d) => d.length = r,
            ElementKind::Custom(d) => d.length = r,
            ElementKind::Offset(d) => d.length = r,
            _ => {}
        }
        self
    }

    pub fn length_unit(mut self, unit: LengthUnit) -> Self {
        match &mut self.kind {
            ElementKind::Structure(d) => d.length_unit = Some(unit),
            ElementKind::Number(d) => d.length_unit = Some(unit),
            ElementKind::String(d) => d.length_unit = Some(unit),
            ElementKind::Binary(d) => d.length_unit = Some(unit),
            ElementKind::Custom(d) => d.length_unit = Some(unit),
            ElementKind::Offset(d) => d.length_unit = Some(unit),
            _ => {}
        }
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        match &mut self.kind {
            ElementKind::Structure(d) => d.endian = Some(endian),
            ElementKind::Number(d) => d.endian = Some(endian),
            ElementKind::Offset(d) => d.endian = Some(endian),
            _ => {}
        }
        self
    }

    pub fn display(mut self, display: Display) -> Self {
        match &mut self.kind {
            ElementKind::Structure(d) => d.display = Some(display),
            ElementKind::Number(d) => d.display = Some(display),
            ElementKind::Offset(d) => d.display = Some(display),
            _ => {}
        }
        self
    }

    pub fn encoding(mut self, label: &str) -> Self {
        match &mut self.kind {
            ElementKind::Structure(d) => d.encoding = Some(label.to_string()),
            ElementKind::String(d) => d.encoding = Some(label.to_string()),
            _ => {}
        }
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        if let ElementKind::Structure(d) = &mut self.kind {
            d.order = Some(order);
        }
        self
    }

    pub fn length_offset(mut self, r: &str) -> Self {
        if let ElementKind::Structure(d) = &mut self.kind {
            d.length_offset = Reference::parse(r);
        }
        self
    }

    pub fn number_kind(mut self, kind: NumberKind) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.kind = Some(kind);
        }
        self
    }

    pub fn must_match(mut self, yes: bool) -> Self {
        match &mut self.kind {
            ElementKind::Number(d) => d.must_match = Some(yes),
            ElementKind::String(d) => d.must_match = Some(yes),
            ElementKind::Binary(d) => d.must_match = Some(yes),
            _ => {}
        }
        self
    }

    pub fn min_val(mut self, r: &str) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.min_val = Reference::parse(r);
        }
        self
    }

    pub fn max_val(mut self, r: &str) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.max_val = Reference::parse(r);
        }
        self
    }

    pub fn values(mut self, values: Vec<FixedValue>) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.values = Some(values);
        }
        self
    }

    pub fn masks(mut self, masks: Vec<Mask>) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.masks = Some(masks);
        }
        self
    }

    pub fn value_expression(mut self, r: &str) -> Self {
        if let ElementKind::Number(d) = &mut self.kind {
            d.value_expression = Reference::parse(r);
        }
        self
    }

    pub fn string_type(mut self, typ: StringType) -> Self {
        if let ElementKind::String(d) = &mut self.kind {
            d.typ = Some(typ);
        }
        self
    }

    pub fn delimiter(mut self, byte: u8) -> Self {
        if let ElementKind::String(d) = &mut self.kind {
            d.delimiter = Some(byte);
        }
        self
    }

    pub fn string_values(mut self, values: Vec<FixedStringValue>) -> Self {
        if let ElementKind::String(d) = &mut self.kind {
            d.values = Some(values);
        }
        self
    }

    pub fn binary_values(mut self, values: Vec<FixedBinaryValue>) -> Self {
        if let ElementKind::Binary(d) = &mut self.kind {
            d.values = Some(values);
        }
        self
    }

    pub fn references(mut self, target: ElementId) -> Self {
        if let ElementKind::Offset(d) = &mut self.kind {
            d.references = Some(target);
        }
        self
    }

    pub fn relative_to(mut self, base: ElementId) -> Self {
        if let ElementKind::Offset(d) = &mut self.kind {
            d.relative_to = Some(base);
        }
        self
    }

    pub fn referenced_size(mut self, size: ElementId) -> Self {
        if let ElementKind::Offset(d) = &mut self.kind {
            d.referenced_size = Some(size);
        }
        self
    }

    pub fn follow_null_reference(mut self, yes: bool) -> Self {
        if let ElementKind::Offset(d) = &mut self.kind {
            d.follow_null_reference = Some(yes);
        }
        self
    }

    pub fn additional(mut self, r: &str) -> Self {
        if let ElementKind::Offset(d) = &mut self.kind {
            d.additional = Reference::parse(r);
        }
        self
    }

    pub fn linked_grammar(mut self, grammar: ElementId) -> Self {
        if let ElementKind::GrammarRef(d) = &mut self.kind {
            d.grammar = Some(grammar);
        }
        self
    }

    pub fn filename(mut self, name: &str) -> Self {
        if let ElementKind::GrammarRef(d) = &mut self.kind {
            d.filename = Some(name.to_string());
        }
        self
    }

    pub fn disabled(mut self, yes: bool) -> Self {
        if let ElementKind::GrammarRef(d) = &mut self.kind {
            d.disabled = Some(yes);
        }
        self
    }
}

/// Arena holding a fully linked grammar graph. Read-only once built; share it
/// freely between concurrent decodes.
#[derive(Debug, Clone)]
pub struct Schema {
    elements: Vec<Element>,
    root: ElementId,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Element decoded by [`Decoder::decode`](crate::decode::Decoder::decode).
    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &Element)> + '_ {
        self.elements
            .iter()
            .enumerate()
            .map(|(i, e)| (ElementId(i as u32), e))
    }

    /// First element whose own (not inherited) name is `name`.
    pub fn find_by_name(&self, name: &str) -> Option<ElementId> {
        self.iter()
            .find(|(_, e)| e.common.name.as_deref() == Some(name))
            .map(|(id, _)| id)
    }
}

/// Builds a [`Schema`], wiring `parent` back-references as children are added.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    elements: Vec<Element>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element that is not a child of anything (root grammar, templates,
    /// scripts, structures only reachable through `StructRef`).
    pub fn define(&mut self, element: Element) -> ElementId {
        let id = ElementId(self.elements.len() as u32);
        self.elements.push(element);
        id
    }

    /// Append `element` to `container`'s children. Children of a structure get
    /// it as `parent`; top-level grammar children have no parent.
    pub fn add(&mut self, container: ElementId, mut element: Element) -> ElementId {
        let is_grammar = matches!(
            self.elements.get(container.index()).map(|c| &c.kind),
            Some(ElementKind::Grammar(_))
        );
        if !is_grammar {
            element.common.parent = Some(container);
        }
        let id = self.define(element);
        if let Some(children) = self
            .elements
            .get_mut(container.index())
            .and_then(|c| c.kind.children_mut())
        {
            children.push(id);
        }
        id
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(id.index())
    }

    pub fn set_extends(&mut self, id: ElementId, base: ElementId) {
        if let Some(e) = self.get_mut(id) {
            e.common.extends = Some(base);
        }
    }

    pub fn set_start(&mut self, grammar: ElementId, start: ElementId) {
        if let Some(Element { kind: ElementKind::Grammar(g), .. }) = self.get_mut(grammar) {
            g.start = Some(start);
        }
    }

    pub fn build(self, root: ElementId) -> Schema {
        Schema { elements: self.elements, root }
    }
}
