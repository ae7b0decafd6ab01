//! Attribute resolution: the effective value of an attribute for an element.
//!
//! Every attribute is described once by an [`Attribute`] descriptor (how to read
//! the locally set value and which fallback chains apply). A single walk,
//! [`Schema::lookup`], tries in order:
//!
//! 1. the value set on the element itself;
//! 2. for a `StructRef`, the referenced structure (non-identity attributes only);
//! 3. the `extends` template, recursively;
//! 4. for [`Scope::Structural`] attributes (endian, display, encoding, length
//!    unit), the lexical `parent`, recursively.
//!
//! Hardcoded defaults are applied by the typed accessors on [`Node`]. A walk
//! that comes back to an element already on its chain fails with
//! [`CycleError`] instead of recursing forever.

use crate::grammar::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("attribute `{attribute}` loops back to element {element} after {depth} inheritance links (cycle in extends/parent)")]
pub struct CycleError {
    pub attribute: &'static str,
    pub element: ElementId,
    /// Links followed before the walk returned to `element`.
    pub depth: usize,
}

/// Which fallback chains an attribute follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Own value, then `extends`.
    Identity,
    /// Own value, referenced structure, then `extends`.
    Template,
    /// Like `Template`, then the lexical `parent`.
    Structural,
}

/// Descriptor of one optional attribute.
pub struct Attribute<T: ?Sized + 'static> {
    pub name: &'static str,
    pub scope: Scope,
    pub local: fn(&Element) -> Option<&T>,
}

impl Schema {
    /// Effective value of `attr` for `id` before defaults; `Ok(None)` when no
    /// element along the chains sets it.
    pub fn lookup<T: ?Sized + 'static>(&self, id: ElementId, attr: &Attribute<T>) -> Result<Option<&T>, CycleError> {
        self.lookup_on(id, attr, &mut Vec::new())
    }

    /// `chain` holds the elements whose fallbacks are being walked. The walk
    /// from an element is the same every time, so meeting one of them again
    /// means the lookup would never finish.
    fn lookup_on<T: ?Sized + 'static>(
        &self,
        id: ElementId,
        attr: &Attribute<T>,
        chain: &mut Vec<ElementId>,
    ) -> Result<Option<&T>, CycleError> {
        if chain.contains(&id) {
            return Err(CycleError { attribute: attr.name, element: id, depth: chain.len() });
        }
        // Dangling ids resolve to nothing; the linter reports them.
        let element = match self.get(id) {
            Some(e) => e,
            None => return Ok(None),
        };
        if let Some(v) = (attr.local)(element) {
            return Ok(Some(v));
        }
        chain.push(id);
        let found = self.fallback(id, element, attr, chain);
        chain.pop();
        found
    }

    fn fallback<'a, T: ?Sized + 'static>(
        &'a self,
        id: ElementId,
        element: &'a Element,
        attr: &Attribute<T>,
        chain: &mut Vec<ElementId>,
    ) -> Result<Option<&'a T>, CycleError> {
        if attr.scope != Scope::Identity {
            if let ElementKind::StructRef(_) = element.kind {
                if let Some(&target) = self.lookup(id, &STRUCTURE)? {
                    if let Some(v) = self.lookup_on(target, attr, chain)? {
                        return Ok(Some(v));
                    }
                }
            }
        }
        if let Some(base) = element.common.extends {
            if let Some(v) = self.lookup_on(base, attr, chain)? {
                return Ok(Some(v));
            }
        }
        if attr.scope == Scope::Structural {
            if let Some(parent) = element.common.parent {
                return self.lookup_on(parent, attr, chain);
            }
        }
        Ok(None)
    }

    /// Resolving handle for `id`, or `None` for an id outside this schema.
    pub fn node(&self, id: ElementId) -> Option<Node<'_>> {
        self.get(id).map(|element| Node { schema: self, id, element })
    }
}

// ---------------------------------------------------------------------------
// Descriptor table

macro_rules! attribute {
    ($konst:ident, $name:literal, $scope:ident, $ty:ty, |$e:ident| $body:expr) => {
        pub const $konst: Attribute<$ty> = Attribute {
            name: $name,
            scope: Scope::$scope,
            local: {
                fn local($e: &Element) -> Option<&$ty> {
                    $body
                }
                local
            },
        };
    };
}

attribute!(ID, "id", Identity, i64, |e| e.common.id.as_ref());
attribute!(NAME, "name", Identity, str, |e| e.common.name.as_deref());
attribute!(DESCRIPTION, "description", Identity, str, |e| e.common.description.as_deref());
attribute!(ELEM_TYPE, "elemType", Identity, str, |e| e.common.elem_type.as_deref());
attribute!(STRUCTURE, "structure", Identity, ElementId, |e| match &e.kind {
    ElementKind::StructRef(d) => d.structure.as_ref(),
    _ => None,
});

attribute!(FILL_COLOUR, "fillColour", Template, Colour, |e| e.common.fill_colour.as_ref());
attribute!(STROKE_COLOUR, "strokeColour", Template, Colour, |e| e.common.stroke_colour.as_ref());
attribute!(REPEAT_MIN, "repeatMin", Template, Reference, |e| e.common.repeat_min.as_ref());
attribute!(REPEAT_MAX, "repeatMax", Template, Reference, |e| e.common.repeat_max.as_ref());
attribute!(LENGTH, "length", Template, Reference, |e| match &e.kind {
    ElementKind::Structure(d) => d.length.as_ref(),
    ElementKind::Number(d) => d.length.as_ref(),
    ElementKind::String(d) => d.length.as_ref(),
    ElementKind::Binary(d) => d.length.as_ref(),
    ElementKind::Custom(d) => d.length.as_ref(),
    ElementKind::Offset(d) => d.length.as_ref(),
    _ => None,
});
attribute!(LENGTH_OFFSET, "lengthOffset", Template, Reference, |e| match &e.kind {
    ElementKind::Structure(d) => d.length_offset.as_ref(),
    _ => None,
});
attribute!(ORDER, "order", Template, Order, |e| match &e.kind {
    ElementKind::Structure(d) => d.order.as_ref(),
    _ => None,
});
attribute!(MUST_MATCH, "mustMatch", Template, bool, |e| match &e.kind {
    ElementKind::Number(d) => d.must_match.as_ref(),
    ElementKind::String(d) => d.must_match.as_ref(),
    ElementKind::Binary(d) => d.must_match.as_ref(),
    _ => None,
});
attribute!(NUMBER_KIND, "type", Template, NumberKind, |e| match &e.kind {
    ElementKind::Number(d) => d.kind.as_ref(),
    _ => None,
});
attribute!(MIN_VAL, "minVal", Template, Reference, |e| match &e.kind {
    ElementKind::Number(d) => d.min_val.as_ref(),
    _ => None,
});
attribute!(MAX_VAL, "maxVal", Template, Reference, |e| match &e.kind {
    ElementKind::Number(d) => d.max_val.as_ref(),
    _ => None,
});
attribute!(NUMBER_VALUES, "values", Template, [FixedValue], |e| match &e.kind {
    ElementKind::Number(d) => d.values.as_deref(),
    _ => None,
});
attribute!(MASKS, "masks", Template, [Mask], |e| match &e.kind {
    ElementKind::Number(d) => d.masks.as_deref(),
    _ => None,
});
attribute!(VALUE_EXPRESSION, "valueExpression", Template, Reference, |e| match &e.kind {
    ElementKind::Number(d) => d.value_expression.as_ref(),
    _ => None,
});
attribute!(STRING_TYPE, "type", Template, StringType, |e| match &e.kind {
    ElementKind::String(d) => d.typ.as_ref(),
    _ => None,
});
attribute!(DELIMITER, "delimiter", Template, u8, |e| match &e.kind {
    ElementKind::String(d) => d.delimiter.as_ref(),
    _ => None,
});
attribute!(STRING_VALUES, "values", Template, [FixedStringValue], |e| match &e.kind {
    ElementKind::String(d) => d.values.as_deref(),
    _ => None,
});
attribute!(BINARY_VALUES, "values", Template, [FixedBinaryValue], |e| match &e.kind {
    ElementKind::Binary(d) => d.values.as_deref(),
    _ => None,
});
attribute!(SCRIPT, "script", Template, ElementId, |e| match &e.kind {
    ElementKind::Custom(d) => d.script.as_ref(),
    _ => None,
});
attribute!(REFERENCES, "references", Template, ElementId, |e| match &e.kind {
    ElementKind::Offset(d) => d.references.as_ref(),
    _ => None,
});
attribute!(RELATIVE_TO, "relativeTo", Template, ElementId, |e| match &e.kind {
    ElementKind::Offset(d) => d.relative_to.as_ref(),
    _ => None,
});
attribute!(REFERENCED_SIZE, "referencedSize", Template, ElementId, |e| match &e.kind {
    ElementKind::Offset(d) => d.referenced_size.as_ref(),
    _ => None,
});
attribute!(FOLLOW_NULL_REFERENCE, "followNullReference", Template, bool, |e| match &e.kind {
    ElementKind::Offset(d) => d.follow_null_reference.as_ref(),
    _ => None,
});
attribute!(ADDITIONAL, "additional", Template, Reference, |e| match &e.kind {
    ElementKind::Offset(d) => d.additional.as_ref(),
    _ => None,
});
attribute!(GRAMMAR, "grammar", Template, ElementId, |e| match &e.kind {
    ElementKind::GrammarRef(d) => d.grammar.as_ref(),
    _ => None,
});
attribute!(FILENAME, "filename", Template, str, |e| match &e.kind {
    ElementKind::GrammarRef(d) => d.filename.as_deref(),
    _ => None,
});
attribute!(UTI, "uti", Template, str, |e| match &e.kind {
    ElementKind::GrammarRef(d) => d.uti.as_deref(),
    _ => None,
});
attribute!(DISABLED, "disabled", Template, bool, |e| match &e.kind {
    ElementKind::GrammarRef(d) => d.disabled.as_ref(),
    _ => None,
});

attribute!(ENDIAN, "endian", Structural, Endian, |e| match &e.kind {
    ElementKind::Structure(d) => d.endian.as_ref(),
    ElementKind::Number(d) => d.endian.as_ref(),
    ElementKind::Offset(d) => d.endian.as_ref(),
    _ => None,
});
attribute!(DISPLAY, "display", Structural, Display, |e| match &e.kind {
    ElementKind::Structure(d) => d.display.as_ref(),
    ElementKind::Number(d) => d.display.as_ref(),
    ElementKind::Offset(d) => d.display.as_ref(),
    _ => None,
});
attribute!(ENCODING, "encoding", Structural, str, |e| match &e.kind {
    ElementKind::Structure(d) => d.encoding.as_deref(),
    ElementKind::String(d) => d.encoding.as_deref(),
    _ => None,
});
attribute!(LENGTH_UNIT, "lengthUnit", Structural, LengthUnit, |e| match &e.kind {
    ElementKind::Structure(d) => d.length_unit.as_ref(),
    ElementKind::Number(d) => d.length_unit.as_ref(),
    ElementKind::String(d) => d.length_unit.as_ref(),
    ElementKind::Binary(d) => d.length_unit.as_ref(),
    ElementKind::Custom(d) => d.length_unit.as_ref(),
    ElementKind::Offset(d) => d.length_unit.as_ref(),
    _ => None,
});

const ONE: Reference = Reference::Literal(1);

/// An element together with its schema, answering effective attribute values.
#[derive(Debug, Clone, Copy)]
pub struct Node<'s> {
    schema: &'s Schema,
    id: ElementId,
    element: &'s Element,
}

impl<'s> Node<'s> {
    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn element(&self) -> &'s Element {
        self.element
    }

    pub fn kind(&self) -> &'s ElementKind {
        &self.element.kind
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    pub fn lookup<T: ?Sized + 'static>(&self, attr: &Attribute<T>) -> Result<Option<&'s T>, CycleError> {
        self.schema.lookup(self.id, attr)
    }

    pub fn extends(&self) -> Option<Node<'s>> {
        self.element.common.extends.and_then(|id| self.schema.node(id))
    }

    pub fn parent(&self) -> Option<Node<'s>> {
        self.element.common.parent.and_then(|id| self.schema.node(id))
    }

    // Identity

    /// The grammar-declared `Id`, if any element in the `extends` chain sets one.
    pub fn ident(&self) -> Result<Option<i64>, CycleError> {
        Ok(self.lookup(&ID)?.copied())
    }

    pub fn name(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&NAME)?.unwrap_or(""))
    }

    pub fn description(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&DESCRIPTION)?.unwrap_or(""))
    }

    pub fn elem_type(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&ELEM_TYPE)?.unwrap_or(""))
    }

    /// `kind:name` label used in diagnostics.
    pub fn label(&self) -> String {
        let name = self.name().unwrap_or("");
        if name.is_empty() {
            format!("{}{}", self.element.kind.kind_name(), self.id)
        } else {
            format!("{}:{}", self.element.kind.kind_name(), name)
        }
    }

    // Presentation

    pub fn fill_colour(&self) -> Result<Colour, CycleError> {
        Ok(self.lookup(&FILL_COLOUR)?.copied().unwrap_or(Colour::WHITE))
    }

    pub fn stroke_colour(&self) -> Result<Colour, CycleError> {
        Ok(self.lookup(&STROKE_COLOUR)?.copied().unwrap_or(Colour::BLACK))
    }

    pub fn display(&self) -> Result<Display, CycleError> {
        Ok(self.lookup(&DISPLAY)?.copied().unwrap_or(Display::Dec))
    }

    // Layout

    pub fn repeat_min(&self) -> Result<Reference, CycleError> {
        Ok(self.lookup(&REPEAT_MIN)?.cloned().unwrap_or(ONE))
    }

    pub fn repeat_max(&self) -> Result<Reference, CycleError> {
        Ok(self.lookup(&REPEAT_MAX)?.cloned().unwrap_or(ONE))
    }

    pub fn endian(&self) -> Result<Endian, CycleError> {
        Ok(self.lookup(&ENDIAN)?.copied().unwrap_or(Endian::Little))
    }

    pub fn encoding(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&ENCODING)?.unwrap_or("UTF-8"))
    }

    pub fn length_unit(&self) -> Result<LengthUnit, CycleError> {
        Ok(self.lookup(&LENGTH_UNIT)?.copied().unwrap_or(LengthUnit::Byte))
    }

    pub fn length(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&LENGTH)
    }

    pub fn length_offset(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&LENGTH_OFFSET)
    }

    pub fn order(&self) -> Result<Order, CycleError> {
        Ok(self.lookup(&ORDER)?.copied().unwrap_or(Order::Fixed))
    }

    // Constraints and payload

    pub fn must_match(&self) -> Result<bool, CycleError> {
        Ok(self.lookup(&MUST_MATCH)?.copied().unwrap_or(true))
    }

    pub fn number_kind(&self) -> Result<NumberKind, CycleError> {
        Ok(self.lookup(&NUMBER_KIND)?.copied().unwrap_or(NumberKind::Unsigned))
    }

    pub fn min_val(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&MIN_VAL)
    }

    pub fn max_val(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&MAX_VAL)
    }

    pub fn number_values(&self) -> Result<&'s [FixedValue], CycleError> {
        Ok(self.lookup(&NUMBER_VALUES)?.unwrap_or(&[]))
    }

    pub fn masks(&self) -> Result<&'s [Mask], CycleError> {
        Ok(self.lookup(&MASKS)?.unwrap_or(&[]))
    }

    pub fn value_expression(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&VALUE_EXPRESSION)
    }

    pub fn string_type(&self) -> Result<Option<StringType>, CycleError> {
        Ok(self.lookup(&STRING_TYPE)?.copied())
    }

    pub fn delimiter(&self) -> Result<Option<u8>, CycleError> {
        Ok(self.lookup(&DELIMITER)?.copied())
    }

    pub fn string_values(&self) -> Result<&'s [FixedStringValue], CycleError> {
        Ok(self.lookup(&STRING_VALUES)?.unwrap_or(&[]))
    }

    pub fn binary_values(&self) -> Result<&'s [FixedBinaryValue], CycleError> {
        Ok(self.lookup(&BINARY_VALUES)?.unwrap_or(&[]))
    }

    // Links

    pub fn structure(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&STRUCTURE)?.copied())
    }

    pub fn script(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&SCRIPT)?.copied())
    }

    pub fn references(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&REFERENCES)?.copied())
    }

    pub fn relative_to(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&RELATIVE_TO)?.copied())
    }

    pub fn referenced_size(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&REFERENCED_SIZE)?.copied())
    }

    pub fn follow_null_reference(&self) -> Result<bool, CycleError> {
        Ok(self.lookup(&FOLLOW_NULL_REFERENCE)?.copied().unwrap_or(false))
    }

    pub fn additional(&self) -> Result<Option<&'s Reference>, CycleError> {
        self.lookup(&ADDITIONAL)
    }

    pub fn grammar(&self) -> Result<Option<ElementId>, CycleError> {
        Ok(self.lookup(&GRAMMAR)?.copied())
    }

    pub fn filename(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&FILENAME)?.unwrap_or(""))
    }

    pub fn uti(&self) -> Result<&'s str, CycleError> {
        Ok(self.lookup(&UTI)?.unwrap_or(""))
    }

    pub fn disabled(&self) -> Result<bool, CycleError> {
        Ok(self.lookup(&DISABLED)?.copied().unwrap_or(false))
    }
}
