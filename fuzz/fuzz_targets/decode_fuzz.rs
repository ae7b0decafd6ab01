//! Decoder fuzz target: decode arbitrary bytes against a grammar that exercises
//! counts, bit fields, strings, bounded structures and self-referencing offsets.
//! The decoder must not panic; it returns a validated tree or a DecodeError.
//! Build with: cargo fuzz run decode_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fn schema() -> ufwb::Schema {
    use ufwb::{Element, LengthUnit, Order, StringType};
    let mut b = ufwb::Schema::builder();
    let g = b.define(Element::grammar("fuzz"));
    let node = b.add(g, Element::structure("node").order(Order::Fixed));
    b.add(node, Element::number("count").length("1"));
    b.add(node, Element::number("bits").length("3").length_unit(LengthUnit::Bit).repeat_max("count"));
    let body = b.add(node, Element::structure("body").length("count").repeat("0", "2"));
    b.add(body, Element::string("s").string_type(StringType::ZeroTerminated));
    b.add(body, Element::binary("rest"));
    b.add(node, Element::offset("next").length("1").references(node).follow_null_reference(true));
    let chunks = b.add(g, Element::structure("chunks").order(Order::Variable));
    b.add(chunks, Element::string("utf16").length("4").encoding("UTF-16BE").repeat("0", "-1"));
    b.add(chunks, Element::number("n").length("2").min_val("0x100").repeat("0", "-1"));
    b.build(g)
}

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let schema = schema();
    let decoder = ufwb::Decoder::new(&schema).with_options(ufwb::DecodeOptions {
        max_depth: 64,
        validate: true,
        ..Default::default()
    });
    let _ = decoder.decode(&mut ufwb::SliceInput::new(data));
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run decode_fuzz");
}
