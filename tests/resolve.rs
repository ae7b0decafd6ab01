//! Attribute resolution: own value, structref target, extends chain, lexical parent, defaults.

use ufwb::resolve::{ENDIAN, LENGTH};
use ufwb::{Colour, Decoder, Display, Element, Endian, LengthUnit, Order, Reference, Schema, SliceInput};

#[test]
fn test_defaults() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let n = b.add(g, Element::number("n"));
    let schema = b.build(g);
    let node = schema.node(n).unwrap();

    assert_eq!(node.repeat_min().unwrap(), Reference::Literal(1));
    assert_eq!(node.repeat_max().unwrap(), Reference::Literal(1));
    assert_eq!(node.endian().unwrap(), Endian::Little);
    assert_eq!(node.display().unwrap(), Display::Dec);
    assert_eq!(node.encoding().unwrap(), "UTF-8");
    assert_eq!(node.length_unit().unwrap(), LengthUnit::Byte);
    assert_eq!(node.order().unwrap(), Order::Fixed);
    assert_eq!(node.fill_colour().unwrap(), Colour::WHITE);
    assert!(node.must_match().unwrap());
    assert!(!node.follow_null_reference().unwrap());
    assert_eq!(node.length().unwrap(), None);
    assert_eq!(node.description().unwrap(), "");
}

#[test]
fn test_own_value_wins_over_extends() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let base = b.define(Element::number("base").length("4").endian(Endian::Big).display(Display::Hex));
    let n = b.add(g, Element::number("n").length("2").extends(base));
    let schema = b.build(g);
    let node = schema.node(n).unwrap();

    assert_eq!(node.length().unwrap(), Some(&Reference::Literal(2)));
    assert_eq!(node.endian().unwrap(), Endian::Big);
    assert_eq!(node.display().unwrap(), Display::Hex);
    assert_eq!(node.name().unwrap(), "n");
}

#[test]
fn test_extends_chain_is_transitive() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let root_tpl = b.define(Element::number("root").length("8").description("eight bytes"));
    let mid = b.define(Element::number("mid").extends(root_tpl));
    let n = b.add(g, Element::number("n").extends(mid));
    let schema = b.build(g);
    let node = schema.node(n).unwrap();

    assert_eq!(node.length().unwrap(), Some(&Reference::Literal(8)));
    assert_eq!(node.description().unwrap(), "eight bytes");
    assert_eq!(node.extends().map(|e| e.id()), Some(mid));
}

#[test]
fn test_format_attributes_come_from_enclosing_structure() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let outer = b.add(g, Element::structure("outer").endian(Endian::Big).encoding("UTF-16LE"));
    let inner = b.add(outer, Element::structure("inner"));
    let n = b.add(inner, Element::number("n").length("2"));
    let s = b.add(inner, Element::string("s"));
    let schema = b.build(g);

    assert_eq!(schema.node(n).unwrap().endian().unwrap(), Endian::Big);
    assert_eq!(schema.node(s).unwrap().encoding().unwrap(), "UTF-16LE");
    assert_eq!(schema.lookup(n, &ENDIAN).unwrap(), Some(&Endian::Big));
    assert_eq!(schema.node(n).unwrap().parent().map(|p| p.id()), Some(inner));
}

#[test]
fn test_layout_attributes_do_not_come_from_parent() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let s = b.add(g, Element::structure("s").length("16").repeat_max("4"));
    let n = b.add(s, Element::number("n"));
    let schema = b.build(g);
    let node = schema.node(n).unwrap();

    assert_eq!(schema.lookup(n, &LENGTH).unwrap(), None);
    assert_eq!(node.repeat_max().unwrap(), Reference::Literal(1));
}

#[test]
fn test_extends_is_tried_before_parent() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let little = b.define(Element::number("le").endian(Endian::Little));
    let s = b.add(g, Element::structure("s").endian(Endian::Big));
    let n = b.add(s, Element::number("n").extends(little));
    let schema = b.build(g);

    assert_eq!(schema.node(n).unwrap().endian().unwrap(), Endian::Little);
}

#[test]
fn test_structref_defers_to_structure_before_extends() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let target = b.define(Element::structure("target").length("12").description("target doc"));
    let other = b.define(Element::structure("other").length("99").endian(Endian::Big));
    let r = b.add(g, Element::struct_ref("ref", target).extends(other));
    let schema = b.build(g);
    let node = schema.node(r).unwrap();

    assert_eq!(node.structure().unwrap(), Some(target));
    assert_eq!(node.length().unwrap(), Some(&Reference::Literal(12)));
    // Not set on the target: falls through to extends.
    assert_eq!(node.endian().unwrap(), Endian::Big);
    // Identity attributes stay with the reference itself.
    assert_eq!(node.name().unwrap(), "ref");
    assert_eq!(node.description().unwrap(), "");
}

#[test]
fn test_extends_cycle_is_an_error() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let a = b.add(g, Element::number("a"));
    let c = b.define(Element::number("c").length("1"));
    let z = b.define(Element::number("z"));
    b.set_extends(a, z);
    b.set_extends(z, a);
    b.set_extends(c, a);
    let schema = b.build(g);

    let e = schema.node(a).unwrap().length().unwrap_err();
    assert_eq!(e.attribute, "length");
    assert_eq!((e.element, e.depth), (a, 2));
    // A value found before the loop is reached still resolves.
    assert_eq!(schema.node(c).unwrap().length().unwrap(), Some(&Reference::Literal(1)));
    assert_eq!(schema.node(a).unwrap().name().unwrap(), "a");
}

#[test]
fn test_deep_nesting_is_not_a_cycle() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let top = b.add(g, Element::structure("s0").endian(Endian::Big));
    let mut container = top;
    for i in 1..100 {
        container = b.add(container, Element::structure(&format!("s{}", i)));
    }
    let n = b.add(container, Element::number("n").length("2"));
    let schema = b.build(g);

    assert_eq!(schema.node(n).unwrap().endian().unwrap(), Endian::Big);
    assert_eq!(schema.node(n).unwrap().display().unwrap(), Display::Dec);

    let root = Decoder::new(&schema).decode(&mut SliceInput::new(&[0x01, 0x02])).unwrap();
    let mut v = &root;
    while let Some(child) = v.children.first() {
        v = child;
    }
    assert_eq!(v.element, n);
    assert_eq!(v.as_i64(), Some(0x0102));
}

#[test]
fn test_recursive_structref_is_not_a_cycle() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let node = b.add(g, Element::structure("node").endian(Endian::Big));
    let next = b.add(node, Element::struct_ref("next", node).repeat("0", "1"));
    let schema = b.build(g);

    assert_eq!(schema.node(next).unwrap().endian().unwrap(), Endian::Big);
    assert_eq!(schema.node(next).unwrap().encoding().unwrap(), "UTF-8");
}

#[test]
fn test_parent_cycle_is_an_error_for_structural_only() {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let s = b.define(Element::structure("s"));
    let t = b.define(Element::structure("t"));
    b.get_mut(s).unwrap().common.parent = Some(t);
    b.get_mut(t).unwrap().common.parent = Some(s);
    let schema = b.build(g);
    let node = schema.node(s).unwrap();

    assert!(node.endian().is_err());
    assert_eq!(node.order().unwrap(), Order::Fixed);
}

#[test]
fn test_dangling_ids_resolve_to_nothing() {
    let mut other = Schema::builder();
    let far = (0..8).map(|i| other.define(Element::number(&format!("n{}", i)))).last().unwrap();

    let mut b = Schema::builder();
    let g = b.define(Element::grammar("g"));
    let n = b.add(g, Element::number("n"));
    b.set_extends(n, far);
    let schema = b.build(g);

    assert_eq!(schema.node(n).unwrap().length().unwrap(), None);
    assert!(schema.node(far).is_none());
}
