//! Property tests: decoded trees tile their input, whatever the bytes.

use proptest::prelude::*;
use ufwb::{Decoder, Element, ElementId, Schema, SchemaBuilder, SliceInput, Value};

/// `count: u8` then `count` chunks of `len: u8` + `payload[len]`.
fn counted_chunks() -> (Schema, ElementId) {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("chunks"));
    let file = b.add(g, Element::structure("file"));
    b.add(file, Element::number("count").length("1"));
    let chunk = b.add(file, Element::structure("chunk").repeat_max("count"));
    b.add(chunk, Element::number("len").length("1"));
    let payload = b.add(chunk, Element::binary("payload").length("len"));
    (b.build(g), payload)
}

/// Unbounded run of length-prefixed chunks, ending wherever the data stops fitting.
fn open_chunks() -> Schema {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("stream"));
    let chunk = b.add(g, Element::structure("chunk").repeat("0", "-1"));
    b.add(chunk, Element::number("len").length("1"));
    b.add(chunk, Element::binary("payload").length("len"));
    b.build(g)
}

/// Random nested layout of fixed-length numbers and structures, some of which
/// declare their exact length.
#[derive(Debug, Clone)]
enum Shape {
    Number(u8),
    Structure { bounded: bool, children: Vec<Shape> },
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = (1u8..=8).prop_map(Shape::Number);
    leaf.prop_recursive(4, 32, 4, |inner| {
        (any::<bool>(), prop::collection::vec(inner, 0..4))
            .prop_map(|(bounded, children)| Shape::Structure { bounded, children })
    })
}

fn size(s: &Shape) -> u64 {
    match s {
        Shape::Number(n) => u64::from(*n),
        Shape::Structure { children, .. } => children.iter().map(size).sum(),
    }
}

fn add_shape(b: &mut SchemaBuilder, container: ElementId, s: &Shape, i: usize) {
    match s {
        Shape::Number(n) => {
            b.add(container, Element::number(&format!("n{}", i)).length(&n.to_string()));
        }
        Shape::Structure { bounded, children } => {
            let mut e = Element::structure(&format!("s{}", i));
            if *bounded {
                e = e.length(&size(s).to_string());
            }
            let id = b.add(container, e);
            for (j, c) in children.iter().enumerate() {
                add_shape(b, id, c, j);
            }
        }
    }
}

fn leaves(v: &Value, out: &mut Vec<(u64, u64)>) {
    if v.children.is_empty() {
        out.push((v.offset, v.len));
    }
    for c in &v.children {
        leaves(c, out);
    }
}

proptest! {
    #[test]
    fn prop_nested_fixed_layouts_tile(
        (layout, data) in shape().prop_flat_map(|s| {
            let n = size(&s) as usize;
            (Just(s), prop::collection::vec(any::<u8>(), n..=n))
        })
    ) {
        let mut b = Schema::builder();
        let g = b.define(Element::grammar("nested"));
        add_shape(&mut b, g, &layout, 0);
        let schema = b.build(g);

        let root = Decoder::new(&schema).decode(&mut SliceInput::new(&data)).unwrap();
        prop_assert!(root.validate(&schema).is_ok());
        prop_assert_eq!(root.len, data.len() as u64);
    }

    #[test]
    fn prop_counted_chunks_cover_input(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..12), 0..8)) {
        let mut data = vec![payloads.len() as u8];
        for p in &payloads {
            data.push(p.len() as u8);
            data.extend_from_slice(p);
        }
        let (schema, payload) = counted_chunks();
        let root = Decoder::new(&schema).decode(&mut SliceInput::new(&data)).unwrap();
        prop_assert!(root.validate(&schema).is_ok());
        prop_assert_eq!(root.len, data.len() as u64);

        let file = &root.children[0];
        prop_assert_eq!(file.children.len(), payloads.len() + 1);
        for (chunk, p) in file.children[1..].iter().zip(&payloads) {
            let body = chunk.find(payload).unwrap();
            prop_assert_eq!(body.len, p.len() as u64);
        }

        let mut spans = Vec::new();
        leaves(&root, &mut spans);
        let mut cursor = 0;
        for (offset, len) in spans {
            prop_assert_eq!(offset, cursor);
            cursor += len;
        }
        prop_assert_eq!(cursor, data.len() as u64);
    }

    #[test]
    fn prop_open_repeat_never_overruns(data in prop::collection::vec(any::<u8>(), 0..64)) {
        let schema = open_chunks();
        let root = Decoder::new(&schema).decode(&mut SliceInput::new(&data)).unwrap();
        prop_assert!(root.validate(&schema).is_ok());
        prop_assert!(root.len <= data.len() as u64);
        for chunk in &root.children {
            prop_assert_eq!(chunk.len, 1 + chunk.children[1].len);
        }
    }
}
