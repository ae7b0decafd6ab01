//! Decode engine: walk a [`Schema`] over an [`Input`] and build a [`Value`] tree.
//!
//! # Model
//!
//! The decoder keeps a stack of open containers (frames). Each frame records
//! where the container starts, the end of its bound (declared length, or the
//! enclosing bound when none is declared), the values completed so far and the
//! bit-packing state for sub-byte numbers. Expressions see the frames through a
//! read-only [`Context`].
//!
//! # Repeats
//!
//! Every element is decoded between `RepeatMin` and `RepeatMax` times (negative
//! max: unbounded). Once the minimum is met, an instance that fails with a
//! mismatch (short read, must-match, range, length) is rewound and ends the
//! repeat; before the minimum is met the failure is returned.
//!
//! # Offsets
//!
//! An offset reads a pointer, computes the absolute target, decodes the
//! referenced element there as a side tree and restores the cursor. Side trees
//! are stored in the offset's payload, never as children, so parent/child
//! contiguity is unaffected.
//!
//! # Profiling
//!
//! Enable the **`decode_profile`** feature and use [`reset_decode_profile`] /
//! [`get_decode_profile`] for a per-element-kind timing breakdown. Run the
//! `decode_records` bench with `--features decode_profile` to print it.

use crate::expr::{Context, Eval, Evaluator, ExpressionError, Expressions};
use crate::grammar::*;
use crate::input::{Input, InputError};
use crate::resolve::{CycleError, Node};
use crate::value::*;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE};
use log::{debug, trace, warn};
#[cfg(feature = "decode_profile")]
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::SeekFrom;
#[cfg(feature = "decode_profile")]
use std::time::Instant;

/// Decoder limits and behaviour switches.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Nesting limit for containers and offset dereferences.
    pub max_depth: usize,
    /// Cap on the instances produced for one element.
    pub max_repeat: u64,
    /// Run [`Value::validate`] on the finished tree.
    pub validate: bool,
    /// When `false`, must-match and range violations are recorded as warnings
    /// and decoding continues.
    pub strict: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions { max_depth: 256, max_repeat: 1 << 20, validate: cfg!(debug_assertions), strict: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("short read: wanted {wanted} bytes, {available} available")]
    ShortRead { wanted: u64, available: u64 },
    #[error("IO: {0}")]
    Io(std::io::Error),
    #[error("Validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("length mismatch: declared {declared} bytes, consumed {consumed}")]
    LengthMismatch { declared: u64, consumed: u64 },
    #[error("value {value} matches none of [{}]", .allowed.join(", "))]
    MustMatch { value: String, allowed: Vec<String> },
    #[error("value {value} outside [{}, {}]", bound(.min), bound(.max))]
    Range {
        value: String,
        min: Option<i64>,
        max: Option<i64>,
    },
    #[error("expression: {0}")]
    Expression(#[from] ExpressionError),
    #[error("{0}")]
    Cycle(#[from] CycleError),
    #[error("unresolved: {0}")]
    Unresolved(String),
    #[error("script: {0}")]
    Script(String),
    #[error("encoding: {0}")]
    Encoding(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("nesting deeper than {0}")]
    DepthExceeded(usize),
    #[error("pointer loop at {target:#x}")]
    PointerLoop { target: u64 },
    #[error("more than {0} instances")]
    RepeatLimit(u64),
    #[error("{found} instances, at least {min} required")]
    RepeatMin { min: u64, found: u64 },
}

fn bound(b: &Option<i64>) -> String {
    b.map_or_else(|| "-".to_string(), |v| v.to_string())
}

impl From<InputError> for DecodeErrorKind {
    fn from(e: InputError) -> Self {
        match e {
            InputError::ShortRead { wanted, partial, .. } => {
                DecodeErrorKind::ShortRead { wanted: wanted as u64, available: partial.len() as u64 }
            }
            InputError::Io(e) => DecodeErrorKind::Io(e),
        }
    }
}

/// A decode failure: what went wrong, for which element, at which byte offset.
#[derive(Debug, thiserror::Error)]
#[error("{name} at {offset:#x}: {kind}")]
pub struct DecodeError {
    pub element: ElementId,
    /// `kind:name` label of the element.
    pub name: String,
    pub offset: u64,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    /// Failures that only mean "this instance is not here": they end an
    /// unbounded repeat or reject a variable-order alternative.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self.kind,
            DecodeErrorKind::ShortRead { .. }
                | DecodeErrorKind::MustMatch { .. }
                | DecodeErrorKind::Range { .. }
                | DecodeErrorKind::LengthMismatch { .. }
                | DecodeErrorKind::RepeatMin { .. }
                | DecodeErrorKind::Encoding(_)
        )
    }

    /// Where the read that came up short would have ended.
    fn short_read_end(&self) -> Option<u64> {
        match self.kind {
            DecodeErrorKind::ShortRead { wanted, .. } => Some(self.offset.saturating_add(wanted)),
            _ => None,
        }
    }
}

fn err(node: Node<'_>, offset: u64, kind: impl Into<DecodeErrorKind>) -> DecodeError {
    DecodeError { element: node.id(), name: node.label(), offset, kind: kind.into() }
}

/// Attach element and offset to a lower-level error.
trait At<T> {
    fn at(self, node: Node<'_>, offset: u64) -> Result<T, DecodeError>;
}

impl<T, E: Into<DecodeErrorKind>> At<T> for Result<T, E> {
    fn at(self, node: Node<'_>, offset: u64) -> Result<T, DecodeError> {
        self.map_err(|e| err(node, offset, e))
    }
}

// ---------------------------------------------------------------------------
// Script boundary

/// What a script sees when it decodes a `Custom` element.
pub struct ScriptCall<'c> {
    pub element: ElementId,
    /// Absolute offset the element starts at (cursor is there on entry).
    pub start: u64,
    /// Declared length in bytes, if the element has one.
    pub length: Option<u64>,
    /// End of the enclosing bound; the script must not consume past it.
    pub limit: u64,
    pub input: &'c mut dyn Input,
    pub context: &'c Context<'c>,
}

/// Result of a script run: bytes consumed from `start` and the rendered value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub len: u64,
    pub text: String,
}

/// Runs grammar scripts. The engine re-seeks to `start + len` afterwards, so a
/// host may leave the cursor anywhere.
pub trait ScriptHost {
    fn run(&self, script: &ScriptDef, call: ScriptCall<'_>) -> Result<ScriptOutput, String>;
}

// ---------------------------------------------------------------------------
// Decode state

/// Bit-level packing state for sub-byte numbers. Bits are consumed LSB-first
/// within each byte (bit 0 = least significant bit).
#[derive(Clone, Copy, Debug)]
pub(crate) struct BitReadState {
    cur: u8,
    next_bit: u8, // 0..=8, where 8 means "need new byte"
}

impl Default for BitReadState {
    fn default() -> Self {
        BitReadState { cur: 0, next_bit: 8 }
    }
}

impl BitReadState {
    fn is_aligned(&self) -> bool {
        self.next_bit == 8
    }
}

/// One open container (or the scope of a root/offset decode).
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) element: ElementId,
    /// Structure behind a `StructRef`.
    pub(crate) definition: Option<ElementId>,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) children: Vec<Value>,
    pub(crate) bits: BitReadState,
    /// Scope frames are not containers: `relativeTo` never resolves to them.
    pub(crate) side: bool,
}

impl Frame {
    pub(crate) fn scope(element: ElementId, start: u64, end: u64) -> Self {
        Frame { element, definition: None, start, end, children: Vec::new(), bits: BitReadState::default(), side: true }
    }

    fn container(element: ElementId, definition: Option<ElementId>, start: u64, end: u64) -> Self {
        Frame { definition, side: false, ..Frame::scope(element, start, end) }
    }
}

struct State {
    /// Never empty: the scope frame pushed by `new` stays for the whole decode.
    frames: Vec<Frame>,
    end_of_data: u64,
    depth: usize,
    /// (target, element) pairs currently being dereferenced.
    following: Vec<(u64, ElementId)>,
    warnings: Vec<DecodeError>,
}

impl State {
    fn new(element: ElementId, start: u64, end_of_data: u64) -> Self {
        State {
            frames: vec![Frame::scope(element, start, end_of_data)],
            end_of_data,
            depth: 0,
            following: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let n = self.frames.len();
        &mut self.frames[n - 1]
    }

    fn enter(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Close the frame opened by the matching `enter`.
    fn leave(&mut self) -> Frame {
        let n = self.frames.len();
        self.frames.swap_remove(n - 1)
    }

    fn limit(&self) -> u64 {
        self.top().end
    }

    fn align(&mut self) {
        self.top_mut().bits = BitReadState::default();
    }

    fn context<'d>(&'d self, schema: &'d Schema) -> Context<'d> {
        Context::new(schema, &self.frames)
    }
}

/// Cursor, bit state and warning count before an attempt, for rewinding.
#[derive(Clone, Copy)]
struct Mark {
    pos: u64,
    bits: BitReadState,
    warnings: usize,
}

/// Raw integer read for numbers and offsets.
struct RawRead {
    raw: u64,
    offset: u64,
    len: u64,
    bits: Option<BitSpan>,
    width: u64,
}

static EXPRESSIONS: Expressions = Expressions;

// ---------------------------------------------------------------------------
// Decoder

/// Decodes inputs against one schema. Holds no per-decode state; reuse it.
pub struct Decoder<'s> {
    schema: &'s Schema,
    evaluator: &'s dyn Evaluator,
    scripts: Option<&'s dyn ScriptHost>,
    options: DecodeOptions,
}

impl<'s> Decoder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Decoder { schema, evaluator: &EXPRESSIONS, scripts: None, options: DecodeOptions::default() }
    }

    pub fn with_evaluator(mut self, evaluator: &'s dyn Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_script_host(mut self, host: &'s dyn ScriptHost) -> Self {
        self.scripts = Some(host);
        self
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Decode the schema root from the input's current position.
    pub fn decode(&self, input: &mut dyn Input) -> Result<Value, DecodeError> {
        self.decode_with_warnings(input).map(|(value, _)| value)
    }

    /// Like [`decode`](Self::decode), also returning the constraint violations
    /// tolerated in lenient mode.
    pub fn decode_with_warnings(&self, input: &mut dyn Input) -> Result<(Value, Vec<DecodeError>), DecodeError> {
        self.run(self.schema.root(), input)
    }

    /// Decode one instance of `element` from the current position. Returns the
    /// value and the number of bytes consumed.
    pub fn decode_element(&self, element: ElementId, input: &mut dyn Input) -> Result<(Value, u64), DecodeError> {
        let (value, _) = self.run(element, input)?;
        let consumed = value.len;
        Ok((value, consumed))
    }

    fn run(&self, element: ElementId, input: &mut dyn Input) -> Result<(Value, Vec<DecodeError>), DecodeError> {
        let node = self.node(element, 0)?;
        let start = input.tell().at(node, 0)?;
        let end_of_data = input.size().at(node, start)?;
        let mut st = State::new(element, start, end_of_data);
        let value = self.decode_one(&mut st, input, node)?;
        if self.options.validate {
            value.validate(self.schema).at(node, value.offset)?;
        }
        Ok((value, st.warnings))
    }

    fn node(&self, id: ElementId, offset: u64) -> Result<Node<'s>, DecodeError> {
        self.schema.node(id).ok_or_else(|| DecodeError {
            element: id,
            name: id.to_string(),
            offset,
            kind: DecodeErrorKind::Unresolved(format!("element {} is not part of the grammar", id)),
        })
    }

    fn decode_one(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<Value, DecodeError> {
        #[cfg(feature = "decode_profile")]
        let _guard = ProfileGuard::new(node.kind().kind_name());
        let pos = input.tell().at(node, 0)?;
        if st.depth >= self.options.max_depth {
            return Err(err(node, pos, DecodeErrorKind::DepthExceeded(self.options.max_depth)));
        }
        st.depth += 1;
        let result = match node.kind() {
            ElementKind::Grammar(g) => {
                let children = match &g.start {
                    Some(start) => std::slice::from_ref(start),
                    None => g.children.as_slice(),
                };
                self.decode_container(st, input, node, None, children, Order::Fixed, None)
            }
            ElementKind::GrammarRef(_) => self.decode_grammar_ref(st, input, node, pos),
            ElementKind::Structure(_) => self.decode_structure(st, input, node, node),
            ElementKind::StructRef(_) => {
                let target = node
                    .structure()
                    .at(node, pos)?
                    .ok_or_else(|| err(node, pos, DecodeErrorKind::Unresolved("structref without structure".into())))?;
                let def = self.node(target, pos)?;
                match def.kind() {
                    ElementKind::Structure(_) => self.decode_structure(st, input, node, def),
                    other => Err(err(
                        node,
                        pos,
                        DecodeErrorKind::Unresolved(format!("{} is a {}, not a structure", target, other.kind_name())),
                    )),
                }
            }
            ElementKind::Number(_) => self.decode_number(st, input, node),
            ElementKind::String(_) => self.decode_string(st, input, node),
            ElementKind::Binary(_) => self.decode_binary(st, input, node),
            ElementKind::Custom(_) => match node.script().at(node, pos)? {
                Some(script) => self.decode_scripted(st, input, node, script),
                None => Err(err(node, pos, DecodeErrorKind::Unresolved("custom element without script".into()))),
            },
            ElementKind::Offset(_) => self.decode_offset(st, input, node),
            ElementKind::Script(_) => self.decode_scripted(st, input, node, node.id()),
        };
        st.depth -= 1;
        result
    }

    // --- containers ---

    fn decode_grammar_ref(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        pos: u64,
    ) -> Result<Value, DecodeError> {
        if node.disabled().at(node, pos)? {
            return Ok(Value::new(node.id(), pos, 0));
        }
        let target = node.grammar().at(node, pos)?.ok_or_else(|| {
            let file = node.filename().unwrap_or("");
            err(node, pos, DecodeErrorKind::Unresolved(format!("grammar `{}` is not linked", file)))
        })?;
        let grammar = self.node(target, pos)?;
        if !matches!(grammar.kind(), ElementKind::Grammar(_)) {
            return Err(err(
                node,
                pos,
                DecodeErrorKind::Unresolved(format!("{} is a {}, not a grammar", target, grammar.kind().kind_name())),
            ));
        }
        self.decode_one(st, input, grammar)
    }

    /// `node` is the element the value is for (structure or structref); `def`
    /// is the structure whose children are decoded.
    fn decode_structure(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        def: Node<'s>,
    ) -> Result<Value, DecodeError> {
        st.align();
        let pos = input.tell().at(node, 0)?;
        let order = node.order().at(node, pos)?;
        let bound = match node.length().at(node, pos)? {
            Some(length) => {
                let mut units = i128::from(self.eval_count(st, node, pos, length)?);
                if let Some(extra) = node.length_offset().at(node, pos)? {
                    units += i128::from(self.eval_int(st, node, pos, extra)?);
                }
                let units = u64::try_from(units).map_err(|_| {
                    err(node, pos, DecodeErrorKind::Range { value: units.to_string(), min: Some(0), max: None })
                })?;
                let unit = node.length_unit().at(node, pos)?;
                Some(to_bytes(node, pos, units, unit)?)
            }
            None => None,
        };
        let definition = (def.id() != node.id()).then(|| def.id());
        self.decode_container(st, input, node, definition, def.kind().children(), order, bound)
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_container(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        definition: Option<ElementId>,
        children: &[ElementId],
        order: Order,
        bound: Option<u64>,
    ) -> Result<Value, DecodeError> {
        st.align();
        let start = input.tell().at(node, 0)?;
        let limit = st.limit();
        let end = match bound {
            Some(n) => match start.checked_add(n).filter(|&end| end <= limit) {
                Some(end) => end,
                None => {
                    return Err(err(
                        node,
                        start,
                        DecodeErrorKind::ShortRead { wanted: n, available: limit.saturating_sub(start) },
                    ))
                }
            },
            None => limit,
        };
        debug!("{} [{:#x}..{:#x}]", node.label(), start, end);
        st.enter(Frame::container(node.id(), definition, start, end));
        let outcome = match order {
            Order::Fixed => self.decode_fixed(st, input, children),
            Order::Variable => self.decode_variable(st, input, node, children),
        };
        let frame = st.leave();
        if let (Err(e), Some(declared)) = (&outcome, bound) {
            // A child that needs bytes past the declared length, while the data
            // continues beyond it, overruns the structure.
            if let Some(reach) = e.short_read_end() {
                if end < limit && (start..=end).contains(&e.offset) && reach > end {
                    return Err(err(node, start, DecodeErrorKind::LengthMismatch { declared, consumed: reach - start }));
                }
            }
        }
        outcome?;
        let consumed = input.tell().at(node, start)?.saturating_sub(start);
        let len = match bound {
            Some(declared) if declared != consumed => {
                return Err(err(node, start, DecodeErrorKind::LengthMismatch { declared, consumed }))
            }
            Some(declared) => declared,
            None => consumed,
        };
        let mut value = Value::new(node.id(), start, len);
        value.children = frame.children;
        Ok(value)
    }

    fn decode_fixed(&self, st: &mut State, input: &mut dyn Input, children: &[ElementId]) -> Result<(), DecodeError> {
        for &id in children {
            let child = self.node(id, st.top().start)?;
            if self.is_disabled(child)? {
                trace!("{} disabled", child.label());
                continue;
            }
            self.decode_repeated(st, input, child)?;
        }
        Ok(())
    }

    /// Decode consecutive instances of `node`; returns how many were produced.
    fn decode_repeated(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<u64, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let (min, max) = self.repeat_bounds(st, node, pos)?;
        let mut count = 0u64;
        loop {
            if max.is_some_and(|m| count >= m) {
                break;
            }
            let mark = self.mark(st, input, node)?;
            if count >= min && self.exhausted(st, mark.pos) {
                break;
            }
            if count >= self.options.max_repeat {
                return Err(err(node, mark.pos, DecodeErrorKind::RepeatLimit(self.options.max_repeat)));
            }
            match self.decode_one(st, input, node) {
                Ok(value) => {
                    let empty = value.len == 0;
                    st.top_mut().children.push(value);
                    count += 1;
                    if empty && max.is_none() {
                        break;
                    }
                }
                // Only an open-ended run stops at the first instance that does not
                // fit; a bounded one ends at its maximum or at the end of data.
                Err(e) if max.is_none() && count >= min && e.is_mismatch() => {
                    debug!("{} ends after {} instances: {}", node.label(), count, e);
                    self.rewind(st, input, node, mark)?;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// At each position try the children in declaration order; the first that
    /// decodes wins. Stops when nothing matches or the bound is exhausted.
    fn decode_variable(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        children: &[ElementId],
    ) -> Result<(), DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let mut slots = Vec::with_capacity(children.len());
        for &id in children {
            let child = self.node(id, pos)?;
            if self.is_disabled(child)? {
                continue;
            }
            let (min, max) = self.repeat_bounds(st, child, pos)?;
            slots.push((child, min, max, 0u64));
        }
        let mut total = 0u64;
        loop {
            let mark = self.mark(st, input, node)?;
            if self.exhausted(st, mark.pos) {
                break;
            }
            let mut decoded = None;
            for (child, _, max, count) in slots.iter_mut() {
                if max.is_some_and(|m| *count >= m) {
                    continue;
                }
                match self.decode_one(st, input, *child) {
                    Ok(value) => {
                        decoded = Some(value.len);
                        st.top_mut().children.push(value);
                        *count += 1;
                        break;
                    }
                    Err(e) if e.is_mismatch() => {
                        trace!("{} does not match at {:#x}: {}", child.label(), mark.pos, e);
                        self.rewind(st, input, node, mark)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            match decoded {
                Some(len) if len > 0 => {
                    total += 1;
                    if total >= self.options.max_repeat {
                        return Err(err(node, mark.pos, DecodeErrorKind::RepeatLimit(self.options.max_repeat)));
                    }
                }
                _ => break,
            }
        }
        for (child, min, _, count) in &slots {
            if count < min {
                return Err(err(*child, pos, DecodeErrorKind::RepeatMin { min: *min, found: *count }));
            }
        }
        Ok(())
    }

    fn repeat_bounds(&self, st: &State, node: Node<'s>, pos: u64) -> Result<(u64, Option<u64>), DecodeError> {
        let min = self.eval_int(st, node, pos, &node.repeat_min().at(node, pos)?)?;
        let max = self.eval_int(st, node, pos, &node.repeat_max().at(node, pos)?)?;
        let min = u64::try_from(min)
            .map_err(|_| err(node, pos, DecodeErrorKind::Unsupported(format!("negative repeatMin {}", min))))?;
        // Negative max: unbounded.
        let max = u64::try_from(max).ok();
        Ok((max.map_or(min, |m| min.min(m)), max))
    }

    fn is_disabled(&self, node: Node<'s>) -> Result<bool, DecodeError> {
        match node.kind() {
            ElementKind::GrammarRef(_) => node.disabled().at(node, 0),
            _ => Ok(false),
        }
    }

    fn exhausted(&self, st: &State, pos: u64) -> bool {
        pos >= st.limit() && st.top().bits.is_aligned()
    }

    fn mark(&self, st: &State, input: &mut dyn Input, node: Node<'s>) -> Result<Mark, DecodeError> {
        Ok(Mark { pos: input.tell().at(node, 0)?, bits: st.top().bits, warnings: st.warnings.len() })
    }

    fn rewind(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>, mark: Mark) -> Result<(), DecodeError> {
        input.seek(SeekFrom::Start(mark.pos)).at(node, mark.pos)?;
        st.top_mut().bits = mark.bits;
        st.warnings.truncate(mark.warnings);
        Ok(())
    }

    // --- leaves ---

    fn decode_number(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<Value, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let kind = node.number_kind().at(node, pos)?;
        let endian = node.endian().at(node, pos)?;
        if let Some(expr) = node.value_expression().at(node, pos)? {
            let computed = self.eval_int(st, node, pos, expr)?;
            let (offset, len) = match node.length().at(node, pos)? {
                Some(length) => {
                    st.align();
                    let offset = input.tell().at(node, pos)?;
                    let n = self.length_bytes(st, node, offset, length)?;
                    self.skip(st, input, node, n)?;
                    (offset, n)
                }
                None => (pos, 0),
            };
            let value = match kind {
                NumberKind::Float => NumberValue::Float(computed as f64),
                NumberKind::Unsigned if computed >= 0 => NumberValue::Unsigned(computed as u64),
                _ => NumberValue::Signed(computed),
            };
            return self.finish_number(st, node, offset, len, value, None, endian);
        }
        let read = self.read_integer(st, input, node, endian)?;
        let value = match kind {
            NumberKind::Unsigned => NumberValue::Unsigned(read.raw),
            NumberKind::Signed => NumberValue::Signed(sign_extend(read.raw, read.width)),
            NumberKind::Float => match read.width {
                32 => NumberValue::Float(f32::from_bits(read.raw as u32) as f64),
                64 => NumberValue::Float(f64::from_bits(read.raw)),
                other => {
                    return Err(err(
                        node,
                        read.offset,
                        DecodeErrorKind::Unsupported(format!("{}-bit float", other)),
                    ))
                }
            },
        };
        self.finish_number(st, node, read.offset, read.len, value, read.bits, endian)
    }

    fn read_integer(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        endian: Endian,
    ) -> Result<RawRead, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let length = node
            .length()
            .at(node, pos)?
            .ok_or_else(|| err(node, pos, DecodeErrorKind::Unsupported("number without length".into())))?;
        let unit = node.length_unit().at(node, pos)?;
        let units = self.eval_count(st, node, pos, length)?;
        let width = units
            .checked_mul(unit.bits())
            .filter(|w| (1..=64).contains(w))
            .ok_or_else(|| {
                err(node, pos, DecodeErrorKind::Unsupported(format!("{} {:?}s is not a 1..64-bit number", units, unit)))
            })?;
        match unit {
            LengthUnit::Bit => self.read_bits(st, input, node, width),
            LengthUnit::Byte => {
                st.align();
                let offset = input.tell().at(node, pos)?;
                let buf = self.read(st, input, node, width / 8)?;
                let raw = bytes_to_u64(&buf, endian);
                trace!("{} read {:#x} at {:#x}", node.label(), raw, offset);
                Ok(RawRead { raw, offset, len: width / 8, bits: None, width })
            }
        }
    }

    /// Read `width` bits LSB-first, pulling new bytes from the input as needed.
    /// The value's length counts only bytes newly consumed.
    fn read_bits(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        width: u64,
    ) -> Result<RawRead, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let limit = st.limit();
        let mut bits = st.top().bits;
        let first_bit = if bits.is_aligned() {
            pos * 8
        } else {
            pos.saturating_sub(1) * 8 + u64::from(bits.next_bit)
        };
        let mut raw = 0u64;
        let mut consumed = 0u64;
        for i in 0..width {
            if bits.is_aligned() {
                if pos + consumed >= limit {
                    return Err(err(
                        node,
                        pos,
                        DecodeErrorKind::ShortRead { wanted: (width - i).div_ceil(8), available: 0 },
                    ));
                }
                bits.cur = input.read_byte().at(node, pos)?;
                bits.next_bit = 0;
                consumed += 1;
            }
            if (bits.cur >> bits.next_bit) & 1 == 1 {
                raw |= 1 << i;
            }
            bits.next_bit += 1;
        }
        st.top_mut().bits = bits;
        trace!("{} read {} bits {:#x} at bit {}", node.label(), width, raw, first_bit);
        Ok(RawRead { raw, offset: pos, len: consumed, bits: Some(BitSpan { first_bit, bits: width }), width })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_number(
        &self,
        st: &mut State,
        node: Node<'s>,
        pos: u64,
        len: u64,
        value: NumberValue,
        bits: Option<BitSpan>,
        endian: Endian,
    ) -> Result<Value, DecodeError> {
        let fixed = node.number_values().at(node, pos)?;
        let matched = value
            .as_i64()
            .and_then(|v| fixed.iter().find(|f| f.value == v))
            .map(|f| f.name.clone());
        if !fixed.is_empty() && matched.is_none() && node.must_match().at(node, pos)? {
            let allowed = fixed.iter().map(|f| format!("{}={}", f.name, f.value)).collect();
            self.violation(st, err(node, pos, DecodeErrorKind::MustMatch { value: value.to_string(), allowed }))?;
        }
        let min = match node.min_val().at(node, pos)? {
            Some(r) => Some(self.eval_int(st, node, pos, r)?),
            None => None,
        };
        let max = match node.max_val().at(node, pos)? {
            Some(r) => Some(self.eval_int(st, node, pos, r)?),
            None => None,
        };
        if min.is_some_and(|m| below(value, m)) || max.is_some_and(|m| above(value, m)) {
            self.violation(st, err(node, pos, DecodeErrorKind::Range { value: value.to_string(), min, max }))?;
        }
        let raw = value.raw_bits();
        let masks = node
            .masks()
            .at(node, pos)?
            .iter()
            .map(|mask| {
                let extracted = if mask.mask == 0 { 0 } else { (raw & mask.mask) >> mask.mask.trailing_zeros() };
                let matched = mask
                    .values
                    .iter()
                    .find(|f| i64::try_from(extracted).ok() == Some(f.value))
                    .map(|f| f.name.clone());
                MaskValue { name: mask.name.clone(), value: extracted, matched }
            })
            .collect();
        trace!("{} = {}", node.label(), value);
        let mut out = Value::new(node.id(), pos, len);
        out.extra = Extra::Number { value, matched, masks, bits };
        out.byte_order = Some(endian);
        Ok(out)
    }

    fn decode_string(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<Value, DecodeError> {
        st.align();
        let pos = input.tell().at(node, 0)?;
        let label = node.encoding().at(node, pos)?;
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| err(node, pos, DecodeErrorKind::Unsupported(format!("unknown encoding `{}`", label))))?;
        let unit: u64 = if encoding == UTF_16LE || encoding == UTF_16BE { 2 } else { 1 };
        let delimiter = node.delimiter().at(node, pos)?;
        let typ = node.string_type().at(node, pos)?.unwrap_or(if delimiter.is_some() {
            StringType::DelimiterTerminated
        } else {
            StringType::FixedLength
        });
        let declared = match node.length().at(node, pos)? {
            Some(length) => Some(self.length_bytes(st, node, pos, length)?),
            None => None,
        };
        let rest = st.limit().saturating_sub(pos);

        let raw = match typ {
            StringType::FixedLength => {
                let mut bytes = self.read(st, input, node, declared.unwrap_or(rest))?;
                while bytes.len() as u64 >= unit && bytes[bytes.len() - unit as usize..].iter().all(|&b| b == 0) {
                    bytes.truncate(bytes.len() - unit as usize);
                }
                bytes
            }
            StringType::Pascal => {
                let n = u64::from(self.read(st, input, node, 1)?[0]);
                if let Some(slot) = declared.filter(|&slot| slot <= n) {
                    return Err(err(node, pos, DecodeErrorKind::LengthMismatch { declared: slot, consumed: n + 1 }));
                }
                let bytes = self.read(st, input, node, n)?;
                if let Some(slot) = declared {
                    self.skip(st, input, node, slot - n - 1)?;
                }
                bytes
            }
            StringType::ZeroTerminated | StringType::DelimiterTerminated => {
                let term = match typ {
                    StringType::ZeroTerminated => 0,
                    _ => delimiter.unwrap_or(0),
                };
                let terminator: Vec<u8> = match unit {
                    2 if encoding == UTF_16BE => vec![0, term],
                    2 => vec![term, 0],
                    _ => vec![term],
                };
                let window = declared.unwrap_or(rest);
                let mut text = Vec::new();
                let mut consumed = 0u64;
                let mut found = false;
                while consumed + unit <= window {
                    let chunk = self.read(st, input, node, unit)?;
                    consumed += unit;
                    if chunk == terminator {
                        found = true;
                        break;
                    }
                    text.extend_from_slice(&chunk);
                }
                match declared {
                    Some(n) => self.skip(st, input, node, n - consumed)?,
                    None if !found => {
                        return Err(err(
                            node,
                            pos,
                            DecodeErrorKind::ShortRead { wanted: consumed + unit, available: rest },
                        ))
                    }
                    None => {}
                }
                text
            }
        };
        let len = input.tell().at(node, pos)? - pos;

        let (text, malformed) = encoding.decode_without_bom_handling(&raw);
        if malformed {
            return Err(err(node, pos, DecodeErrorKind::Encoding(format!("malformed {} text", encoding.name()))));
        }
        let text = text.into_owned();
        let fixed = node.string_values().at(node, pos)?;
        let matched = fixed.iter().find(|f| f.value == text).map(|f| f.name.clone());
        if !fixed.is_empty() && matched.is_none() && node.must_match().at(node, pos)? {
            let allowed = fixed.iter().map(|f| format!("{}={:?}", f.name, f.value)).collect();
            self.violation(st, err(node, pos, DecodeErrorKind::MustMatch { value: format!("{:?}", text), allowed }))?;
        }
        trace!("{} = {:?}", node.label(), text);
        let mut value = Value::new(node.id(), pos, len);
        value.extra = Extra::String { text, matched };
        Ok(value)
    }

    fn decode_binary(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<Value, DecodeError> {
        st.align();
        let pos = input.tell().at(node, 0)?;
        let n = match node.length().at(node, pos)? {
            Some(length) => self.length_bytes(st, node, pos, length)?,
            None => st.limit().saturating_sub(pos),
        };
        let fixed = node.binary_values().at(node, pos)?;
        let matched = if fixed.is_empty() {
            self.skip(st, input, node, n)?;
            None
        } else {
            let bytes = self.read(st, input, node, n)?;
            let matched = fixed.iter().find(|f| f.value == bytes).map(|f| f.name.clone());
            if matched.is_none() && node.must_match().at(node, pos)? {
                let allowed = fixed.iter().map(|f| format!("{}={}", f.name, hex(&f.value))).collect();
                self.violation(st, err(node, pos, DecodeErrorKind::MustMatch { value: hex(&bytes), allowed }))?;
            }
            matched
        };
        trace!("{} {} bytes at {:#x}", node.label(), n, pos);
        let mut value = Value::new(node.id(), pos, n);
        value.extra = Extra::Binary { matched };
        Ok(value)
    }

    fn decode_scripted(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        script_id: ElementId,
    ) -> Result<Value, DecodeError> {
        st.align();
        let pos = input.tell().at(node, 0)?;
        let script = match self.node(script_id, pos)?.kind() {
            ElementKind::Script(s) => s,
            other => {
                return Err(err(
                    node,
                    pos,
                    DecodeErrorKind::Unresolved(format!("{} is a {}, not a script", script_id, other.kind_name())),
                ))
            }
        };
        let host = self
            .scripts
            .ok_or_else(|| err(node, pos, DecodeErrorKind::Script("no script host configured".into())))?;
        let declared = match node.length().at(node, pos)? {
            Some(length) => Some(self.length_bytes(st, node, pos, length)?),
            None => None,
        };
        let limit = st.limit();
        let ctx = st.context(self.schema);
        let call = ScriptCall { element: node.id(), start: pos, length: declared, limit, input: &mut *input, context: &ctx };
        let out = host.run(script, call).map_err(|m| err(node, pos, DecodeErrorKind::Script(m)))?;
        let end = pos.checked_add(out.len).filter(|&e| e <= limit).ok_or_else(|| {
            err(node, pos, DecodeErrorKind::ShortRead { wanted: out.len, available: limit.saturating_sub(pos) })
        })?;
        input.seek(SeekFrom::Start(end)).at(node, pos)?;
        let mut value = Value::new(node.id(), pos, out.len);
        value.extra = Extra::Custom { text: out.text };
        Ok(value)
    }

    // --- offsets ---

    fn decode_offset(&self, st: &mut State, input: &mut dyn Input, node: Node<'s>) -> Result<Value, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let endian = node.endian().at(node, pos)?;
        let read = self.read_integer(st, input, node, endian)?;
        let pos = read.offset;
        let pointer = read.raw;
        let target = if pointer == 0 && !node.follow_null_reference().at(node, pos)? {
            None
        } else {
            let base = match node.relative_to().at(node, pos)? {
                Some(rel) => self.base_address(st, node, pos, rel)?,
                None => 0,
            };
            let additional = match node.additional().at(node, pos)? {
                Some(r) => self.eval_int(st, node, pos, r)?,
                None => 0,
            };
            let absolute = i128::from(base) + i128::from(pointer) + i128::from(additional);
            Some(u64::try_from(absolute).map_err(|_| {
                err(node, pos, DecodeErrorKind::Range { value: absolute.to_string(), min: Some(0), max: None })
            })?)
        };
        let referenced = match (target, node.references().at(node, pos)?) {
            (Some(t), Some(element)) => Some(Box::new(self.follow(st, input, node, pos, t, element)?)),
            _ => None,
        };
        let mut value = Value::new(node.id(), pos, read.len);
        value.extra = Extra::Offset { pointer, target, referenced };
        value.byte_order = Some(endian);
        Ok(value)
    }

    fn base_address(&self, st: &State, node: Node<'s>, pos: u64, rel: ElementId) -> Result<u64, DecodeError> {
        if rel == node.id() {
            return Ok(pos);
        }
        let ctx = st.context(self.schema);
        ctx.container_start(rel).or_else(|| ctx.find(rel).map(|v| v.offset)).ok_or_else(|| {
            err(
                node,
                pos,
                DecodeErrorKind::Unresolved(format!("relativeTo {} is neither open nor decoded", rel)),
            )
        })
    }

    /// Decode `element` at `target` as a side tree, then restore the cursor.
    fn follow(
        &self,
        st: &mut State,
        input: &mut dyn Input,
        node: Node<'s>,
        pos: u64,
        target: u64,
        element: ElementId,
    ) -> Result<Value, DecodeError> {
        if st.following.contains(&(target, element)) {
            return Err(err(node, pos, DecodeErrorKind::PointerLoop { target }));
        }
        let referenced = self.node(element, pos)?;
        let size = match node.referenced_size().at(node, pos)? {
            Some(size_id) => {
                let ctx = st.context(self.schema);
                let size_value = ctx.find(size_id).ok_or_else(|| {
                    err(node, pos, DecodeErrorKind::Unresolved(format!("referenced size {} not decoded yet", size_id)))
                })?;
                let n = size_value
                    .as_i64()
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| err(node, pos, ExpressionError::NotNumeric(size_id.to_string())))?;
                Some(n)
            }
            None => None,
        };
        let end = match size {
            Some(n) => target.checked_add(n),
            None => Some(st.end_of_data),
        };
        let end = end.filter(|&e| target <= e && e <= st.end_of_data).ok_or_else(|| {
            err(
                node,
                pos,
                DecodeErrorKind::ShortRead {
                    wanted: size.unwrap_or(1),
                    available: st.end_of_data.saturating_sub(target),
                },
            )
        })?;
        let resume = input.tell().at(node, pos)?;
        debug!("{} -> {} at {:#x}", node.label(), referenced.label(), target);
        input.seek(SeekFrom::Start(target)).at(node, pos)?;
        st.following.push((target, element));
        st.enter(Frame::scope(element, target, end));
        let result = self.decode_one(st, input, referenced);
        st.leave();
        st.following.pop();
        input.seek(SeekFrom::Start(resume)).at(node, pos)?;
        result
    }

    // --- helpers ---

    fn violation(&self, st: &mut State, e: DecodeError) -> Result<(), DecodeError> {
        if self.options.strict {
            return Err(e);
        }
        warn!("{}", e);
        st.warnings.push(e);
        Ok(())
    }

    fn eval(&self, st: &State, node: Node<'s>, pos: u64, r: &Reference) -> Result<Eval, DecodeError> {
        match r {
            Reference::Literal(n) => Ok(Eval::Int(*n)),
            Reference::Expr(expr) => self.evaluator.evaluate(expr, &st.context(self.schema)).at(node, pos),
        }
    }

    fn eval_int(&self, st: &State, node: Node<'s>, pos: u64, r: &Reference) -> Result<i64, DecodeError> {
        match self.eval(st, node, pos, r)? {
            Eval::Int(n) => Ok(n),
            Eval::Element(id) => Err(err(node, pos, ExpressionError::NotNumeric(format!("{} (element {})", r, id)))),
        }
    }

    fn eval_count(&self, st: &State, node: Node<'s>, pos: u64, r: &Reference) -> Result<u64, DecodeError> {
        let n = self.eval_int(st, node, pos, r)?;
        u64::try_from(n).map_err(|_| err(node, pos, DecodeErrorKind::Range { value: n.to_string(), min: Some(0), max: None }))
    }

    /// Evaluate `length` in the element's length unit and convert to bytes.
    fn length_bytes(&self, st: &State, node: Node<'s>, pos: u64, length: &Reference) -> Result<u64, DecodeError> {
        let units = self.eval_count(st, node, pos, length)?;
        let unit = node.length_unit().at(node, pos)?;
        to_bytes(node, pos, units, unit)
    }

    /// Read `n` bytes at the cursor, refusing to cross the current bound.
    fn read(&self, st: &State, input: &mut dyn Input, node: Node<'s>, n: u64) -> Result<Vec<u8>, DecodeError> {
        let pos = self.check_bound(st, input, node, n)?;
        let len = usize::try_from(n)
            .map_err(|_| err(node, pos, DecodeErrorKind::Unsupported(format!("{} bytes do not fit in memory", n))))?;
        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf).at(node, pos)?;
        Ok(buf)
    }

    fn skip(&self, st: &State, input: &mut dyn Input, node: Node<'s>, n: u64) -> Result<(), DecodeError> {
        let pos = self.check_bound(st, input, node, n)?;
        input.seek(SeekFrom::Start(pos + n)).at(node, pos)?;
        Ok(())
    }

    fn check_bound(&self, st: &State, input: &mut dyn Input, node: Node<'s>, n: u64) -> Result<u64, DecodeError> {
        let pos = input.tell().at(node, 0)?;
        let limit = st.limit();
        if pos.checked_add(n).map_or(true, |end| end > limit) {
            return Err(err(node, pos, DecodeErrorKind::ShortRead { wanted: n, available: limit.saturating_sub(pos) }));
        }
        Ok(pos)
    }
}

fn to_bytes(node: Node<'_>, pos: u64, units: u64, unit: LengthUnit) -> Result<u64, DecodeError> {
    let bits = units
        .checked_mul(unit.bits())
        .ok_or_else(|| err(node, pos, DecodeErrorKind::Unsupported(format!("length {} overflows", units))))?;
    if bits % 8 != 0 {
        return Err(err(
            node,
            pos,
            DecodeErrorKind::Unsupported(format!("length of {} bits is not a whole number of bytes", bits)),
        ));
    }
    Ok(bits / 8)
}

fn bytes_to_u64(buf: &[u8], endian: Endian) -> u64 {
    match endian {
        Endian::Big => match buf.len() {
            1 => buf[0] as u64,
            2 => BigEndian::read_u16(buf) as u64,
            4 => BigEndian::read_u32(buf) as u64,
            8 => BigEndian::read_u64(buf),
            n => BigEndian::read_uint(buf, n),
        },
        Endian::Little => match buf.len() {
            1 => buf[0] as u64,
            2 => LittleEndian::read_u16(buf) as u64,
            4 => LittleEndian::read_u32(buf) as u64,
            8 => LittleEndian::read_u64(buf),
            n => LittleEndian::read_uint(buf, n),
        },
    }
}

fn sign_extend(raw: u64, width: u64) -> i64 {
    if width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

fn below(value: NumberValue, min: i64) -> bool {
    match value {
        NumberValue::Unsigned(x) => min > 0 && x < min as u64,
        NumberValue::Signed(x) => x < min,
        NumberValue::Float(x) => x < min as f64,
    }
}

fn above(value: NumberValue, max: i64) -> bool {
    match value {
        NumberValue::Unsigned(x) => max < 0 || x > max as u64,
        NumberValue::Signed(x) => x > max,
        NumberValue::Float(x) => x > max as f64,
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out: String = bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    if bytes.len() > 16 {
        out.push_str("..");
    }
    out
}

// --- Decode profiling (feature "decode_profile") ---
//
// Each decode_one call records its inclusive time under the element kind name
// ("structure", "number", ...). Nested containers therefore include their children.

#[cfg(feature = "decode_profile")]
thread_local!(static DECODE_PROFILE: RefCell<HashMap<String, u64>> = RefCell::new(HashMap::new()));

#[cfg(feature = "decode_profile")]
struct ProfileGuard {
    label: &'static str,
    start: Instant,
}

#[cfg(feature = "decode_profile")]
impl ProfileGuard {
    fn new(label: &'static str) -> Self {
        Self { label, start: Instant::now() }
    }
}

#[cfg(feature = "decode_profile")]
impl Drop for ProfileGuard {
    fn drop(&mut self) {
        let ns = self.start.elapsed().as_nanos() as u64;
        DECODE_PROFILE.with(|p| *p.borrow_mut().entry(self.label.to_string()).or_insert(0) += ns);
    }
}

/// Resets accumulated decode profile stats.
#[cfg(feature = "decode_profile")]
pub fn reset_decode_profile() {
    DECODE_PROFILE.with(|p| p.borrow_mut().clear());
}

/// Returns accumulated decode profile: element kind → total nanoseconds.
#[cfg(feature = "decode_profile")]
pub fn get_decode_profile() -> HashMap<String, u64> {
    DECODE_PROFILE.with(|p| p.borrow().clone())
}

#[cfg(not(feature = "decode_profile"))]
/// No-op when the `decode_profile` feature is not enabled.
pub fn reset_decode_profile() {}

#[cfg(not(feature = "decode_profile"))]
/// Returns an empty map when the `decode_profile` feature is not enabled.
pub fn get_decode_profile() -> HashMap<String, u64> {
    HashMap::new()
}
