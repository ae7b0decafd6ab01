//! Grammar linter: authoring errors that would otherwise only surface mid-decode.
//!
//! ## Rules
//!
//! - **Cycles**: an element must not reach itself through `extends` or `parent`.
//! - **Extends kind**: a template must be of the same kind as the element extending it.
//! - **Dangling ids**: every linked id (children, start, extends, parent, structure,
//!   script, grammar, references, relativeTo, referencedSize) must exist.
//! - **Missing links**: a `StructRef` needs a structure, a `Custom` a script and an
//!   enabled `GrammarRef` a linked grammar, each of the right kind.
//! - **Offset target**: an `Offset` without `References` only yields the pointer (warning).
//! - **Container parent**: `parent` must be a structure or grammar.

use crate::grammar::{Element, ElementId, ElementKind, Schema};
use crate::resolve::Node;
use std::collections::HashSet;
use std::mem::discriminant;

/// Severity of a lint finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Identifies which rule produced the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintRule {
    ExtendsCycle,
    ParentCycle,
    ExtendsKindMismatch,
    DanglingId,
    MissingStructure,
    MissingScript,
    MissingGrammar,
    OffsetWithoutReferences,
    NonContainerParent,
}

/// A single lint message for one element.
#[derive(Debug, Clone)]
pub struct LintMessage {
    pub element: ElementId,
    /// `kind:name` label of the element.
    pub name: String,
    pub rule: LintRule,
    pub severity: Severity,
    pub message: String,
}

/// Run all lint rules on `schema`. Returns messages in element order.
pub fn lint(schema: &Schema) -> Vec<LintMessage> {
    let mut out = Vec::new();
    for (id, element) in schema.iter() {
        let node = match schema.node(id) {
            Some(n) => n,
            None => continue,
        };
        let mut push = |rule: LintRule, severity: Severity, message: String| {
            out.push(LintMessage { element: id, name: node.label(), rule, severity, message });
        };

        if let Some(base) = element.common.extends {
            match schema.get(base) {
                None => push(LintRule::DanglingId, Severity::Error, format!("extends {} does not exist", base)),
                Some(b) if discriminant(&b.kind) != discriminant(&element.kind) => push(
                    LintRule::ExtendsKindMismatch,
                    Severity::Error,
                    format!("extends {} which is a {}", base, b.kind.kind_name()),
                ),
                Some(_) => {}
            }
        }
        if reaches_itself(schema, id, |e| e.common.extends) {
            push(LintRule::ExtendsCycle, Severity::Error, "extends chain loops back to this element".to_string());
        }

        if let Some(parent) = element.common.parent {
            match schema.get(parent) {
                None => push(LintRule::DanglingId, Severity::Error, format!("parent {} does not exist", parent)),
                Some(p) if !matches!(p.kind, ElementKind::Structure(_) | ElementKind::Grammar(_)) => push(
                    LintRule::NonContainerParent,
                    Severity::Error,
                    format!("parent {} is a {}", parent, p.kind.kind_name()),
                ),
                Some(_) => {}
            }
        }
        if reaches_itself(schema, id, |e| e.common.parent) {
            push(LintRule::ParentCycle, Severity::Error, "parent chain loops back to this element".to_string());
        }

        for &child in element.kind.children() {
            if schema.get(child).is_none() {
                push(LintRule::DanglingId, Severity::Error, format!("child {} does not exist", child));
            }
        }

        match &element.kind {
            ElementKind::Grammar(g) => {
                if let Some(start) = g.start {
                    if schema.get(start).is_none() {
                        push(LintRule::DanglingId, Severity::Error, format!("start {} does not exist", start));
                    }
                }
            }
            ElementKind::StructRef(_) => check_link(
                schema,
                node.structure().ok().flatten(),
                "structure",
                |k| matches!(k, ElementKind::Structure(_)),
                LintRule::MissingStructure,
                &mut push,
            ),
            ElementKind::Custom(_) => check_link(
                schema,
                node.script().ok().flatten(),
                "script",
                |k| matches!(k, ElementKind::Script(_)),
                LintRule::MissingScript,
                &mut push,
            ),
            ElementKind::GrammarRef(_) if !node.disabled().unwrap_or(false) => check_link(
                schema,
                node.grammar().ok().flatten(),
                "grammar",
                |k| matches!(k, ElementKind::Grammar(_)),
                LintRule::MissingGrammar,
                &mut push,
            ),
            ElementKind::Offset(_) => check_offset(schema, node, &mut push),
            _ => {}
        }
    }
    out
}

fn check_link(
    schema: &Schema,
    link: Option<ElementId>,
    what: &str,
    right_kind: impl Fn(&ElementKind) -> bool,
    rule: LintRule,
    push: &mut impl FnMut(LintRule, Severity, String),
) {
    match link.map(|id| (id, schema.get(id))) {
        None => push(rule, Severity::Error, format!("no {} linked", what)),
        Some((id, None)) => push(LintRule::DanglingId, Severity::Error, format!("{} {} does not exist", what, id)),
        Some((id, Some(target))) if !right_kind(&target.kind) => push(
            rule,
            Severity::Error,
            format!("{} {} is a {}", what, id, target.kind.kind_name()),
        ),
        Some(_) => {}
    }
}

fn check_offset(schema: &Schema, node: Node<'_>, push: &mut impl FnMut(LintRule, Severity, String)) {
    match node.references().ok().flatten() {
        None => push(
            LintRule::OffsetWithoutReferences,
            Severity::Warning,
            "offset has no references; only the pointer is decoded".to_string(),
        ),
        Some(id) if schema.get(id).is_none() => {
            push(LintRule::DanglingId, Severity::Error, format!("references {} does not exist", id))
        }
        Some(_) => {}
    }
    let links = [
        ("relativeTo", node.relative_to().ok().flatten()),
        ("referencedSize", node.referenced_size().ok().flatten()),
    ];
    for (what, link) in links {
        if let Some(id) = link {
            if schema.get(id).is_none() {
                push(LintRule::DanglingId, Severity::Error, format!("{} {} does not exist", what, id));
            }
        }
    }
}

/// Whether following `next` from `start` comes back to `start`.
fn reaches_itself(
    schema: &Schema,
    start: ElementId,
    next: impl Fn(&Element) -> Option<ElementId>,
) -> bool {
    let mut seen = HashSet::new();
    let mut cur = schema.get(start).and_then(&next);
    while let Some(id) = cur {
        if id == start {
            return true;
        }
        if !seen.insert(id) {
            return false;
        }
        cur = schema.get(id).and_then(&next);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Endian;

    fn rules(schema: &Schema) -> Vec<LintRule> {
        lint(schema).iter().map(|m| m.rule).collect()
    }

    #[test]
    fn lint_clean_schema_passes() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let be = b.define(Element::number("be").endian(Endian::Big));
        let point = b.define(Element::structure("point"));
        b.add(point, Element::number("x").length("2").extends(be));
        let s = b.add(g, Element::structure("s"));
        b.add(s, Element::struct_ref("origin", point));
        b.add(s, Element::offset("ptr").length("4").references(point).relative_to(s));
        let msgs = lint(&b.build(g));
        assert!(msgs.is_empty(), "clean schema should have no findings: {:?}", msgs);
    }

    #[test]
    fn lint_extends_cycle() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let a = b.add(g, Element::number("a"));
        let z = b.define(Element::number("z"));
        b.set_extends(a, z);
        b.set_extends(z, a);
        let msgs = lint(&b.build(g));
        let cycles: Vec<_> = msgs.iter().filter(|m| m.rule == LintRule::ExtendsCycle).collect();
        assert_eq!(cycles.len(), 2, "{:?}", msgs);
        assert_eq!(cycles[0].name, "number:a");
        assert_eq!(cycles[0].severity, Severity::Error);
    }

    #[test]
    fn lint_extends_kind_mismatch_and_dangling() {
        let mut other = Schema::builder();
        let far = (0..6).map(|i| other.define(Element::binary(&format!("b{}", i)))).last();

        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let s = b.define(Element::structure("tpl"));
        b.add(g, Element::number("n").extends(s));
        let d = b.add(g, Element::number("d"));
        if let Some(far) = far {
            b.set_extends(d, far);
        }
        let found = rules(&b.build(g));
        assert!(found.contains(&LintRule::ExtendsKindMismatch), "{:?}", found);
        assert!(found.contains(&LintRule::DanglingId), "{:?}", found);
    }

    #[test]
    fn lint_links_of_wrong_kind() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let n = b.define(Element::number("not_a_structure"));
        b.add(g, Element::struct_ref("r", n));
        b.add(g, Element::custom("c", n));
        b.add(g, Element::grammar_ref("unlinked"));
        b.add(g, Element::grammar_ref("off").disabled(true));
        let found = rules(&b.build(g));
        assert_eq!(
            found,
            vec![LintRule::MissingStructure, LintRule::MissingScript, LintRule::MissingGrammar]
        );
    }

    #[test]
    fn lint_offset_without_references_warns() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        b.add(g, Element::offset("ptr").length("4"));
        let msgs = lint(&b.build(g));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].rule, LintRule::OffsetWithoutReferences);
        assert_eq!(msgs[0].severity, Severity::Warning);
    }

    #[test]
    fn lint_parent_must_be_container() {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("g"));
        let n = b.add(g, Element::number("n"));
        let m = b.add(g, Element::number("m"));
        if let Some(e) = b.get_mut(m) {
            e.common.parent = Some(n);
        }
        let found = rules(&b.build(g));
        assert_eq!(found, vec![LintRule::NonContainerParent]);
    }
}
