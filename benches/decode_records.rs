//! Benchmark: decode a synthetic record file (header + count-driven records with
//! bit fields, masks, strings and an offset table) with and without tree validation.
//! Run with `--features decode_profile` for a per-element-kind breakdown.

#[cfg(feature = "decode_profile")]
use ufwb::{get_decode_profile, reset_decode_profile};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ufwb::{
    DecodeOptions, Decoder, Element, Endian, FixedValue, LengthUnit, Mask, Schema, SliceInput, StringType,
};

const RECORDS: usize = 10_000;

/// `magic "RECS"`, `count: u32be`, `table_ptr: u32be -> u8[4]`, then `count` records of
/// `{ kind: u8 (fixed values), flags: u8 (masks), hi: 3 bits, lo: 5 bits,
///    len: u16be, name: zero-terminated, payload[len] }`.
fn records_schema() -> Schema {
    let mut b = Schema::builder();
    let g = b.define(Element::grammar("records"));
    let table = b.define(Element::binary("table").length("4"));
    let file = b.add(g, Element::structure("file").endian(Endian::Big));
    b.add(file, Element::string("magic").length("4"));
    b.add(file, Element::number("count").length("4"));
    b.add(file, Element::offset("table_ptr").length("4").references(table));
    let rec = b.add(file, Element::structure("record").repeat_max("count"));
    b.add(
        rec,
        Element::number("kind")
            .length("1")
            .values(vec![FixedValue::new("a", 1), FixedValue::new("b", 2), FixedValue::new("c", 3)]),
    );
    b.add(rec, Element::number("flags").length("1").masks(vec![Mask::new("hi", 0xF0), Mask::new("lo", 0x0F)]));
    b.add(rec, Element::number("hi").length("3").length_unit(LengthUnit::Bit));
    b.add(rec, Element::number("lo").length("5").length_unit(LengthUnit::Bit));
    b.add(rec, Element::number("len").length("2"));
    b.add(rec, Element::string("name").string_type(StringType::ZeroTerminated));
    b.add(rec, Element::binary("payload").length("len"));
    b.build(g)
}

fn records_data(n: usize) -> Vec<u8> {
    let mut out = b"RECS".to_vec();
    out.extend_from_slice(&(n as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    for i in 0..n {
        out.push((i % 3) as u8 + 1);
        out.push(i as u8);
        out.push((i * 7) as u8);
        let len = (i % 17) as u16;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(format!("rec{}", i).as_bytes());
        out.push(0);
        out.extend((0..len).map(|x| x as u8));
    }
    let table_at = out.len() as u32;
    out[8..12].copy_from_slice(&table_at.to_be_bytes());
    out.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    out
}

fn bench_decode_records(c: &mut Criterion) {
    let schema = records_schema();
    let data = records_data(RECORDS);
    let fast = Decoder::new(&schema).with_options(DecodeOptions { validate: false, ..DecodeOptions::default() });
    let checked = Decoder::new(&schema).with_options(DecodeOptions { validate: true, ..DecodeOptions::default() });

    let root = fast.decode(&mut SliceInput::new(&data)).expect("decode");
    eprintln!(
        "decode_records: {} records, {} bytes, {} values under file (one warm-up pass)",
        RECORDS,
        data.len(),
        root.children[0].children.len()
    );

    c.bench_function("decode_records", |b| {
        b.iter(|| {
            let root = fast.decode(&mut SliceInput::new(black_box(&data))).expect("decode");
            black_box(root.len)
        });
    });

    c.bench_function("decode_records_validated", |b| {
        b.iter(|| {
            let root = checked.decode(&mut SliceInput::new(black_box(&data))).expect("decode");
            black_box(root.len)
        });
    });

    const ITERS: u32 = 20;
    let start = std::time::Instant::now();
    for _ in 0..ITERS {
        let _ = fast.decode(&mut SliceInput::new(&data));
    }
    let ns = start.elapsed().as_nanos() / (ITERS as u128);
    let records_per_sec = (RECORDS as f64) / (ns as f64 / 1e9);
    let mb_per_sec = (data.len() as f64) / (ns as f64 / 1e9) / 1e6;
    eprintln!();
    eprintln!("--- Sustainable decode rate ({} records, {} bytes) ---", RECORDS, data.len());
    eprintln!(
        "  decode | {:>10.2} us/file | ~{:.2} M records/s | {:>6.2} MB/s",
        ns as f64 / 1000.0,
        records_per_sec / 1e6,
        mb_per_sec
    );
    eprintln!("---");

    // With decode_profile feature: one decode run and print hotspot breakdown
    #[cfg(feature = "decode_profile")]
    {
        reset_decode_profile();
        let _ = fast.decode(&mut SliceInput::new(&data));
        let profile = get_decode_profile();
        let total_ns: u64 = profile.values().sum();
        eprintln!();
        eprintln!("decode hotspot (one full decode, decode_profile feature, inclusive times):");
        let mut by_label: Vec<_> = profile.into_iter().collect();
        by_label.sort_by(|a, b| b.1.cmp(&a.1));
        for (label, ns) in &by_label {
            let pct = if total_ns > 0 { *ns as f64 / total_ns as f64 * 100.0 } else { 0.0 };
            eprintln!("  {:20} {:>12} ns  {:5.1}%", label, ns, pct);
        }
        eprintln!("  {:20} {:>12} ns  100.0%", "TOTAL", total_ns);
    }
}

criterion_group!(benches, bench_decode_records);
criterion_main!(benches);
