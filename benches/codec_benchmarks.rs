//! Benchmarks for CQ-code parsing and serialization.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use cqrpc::{parse_with, serialize_with, CodecOptions, ImageType, MessageChain, Tag};

/// A group message with a mix of text, mentions and media.
fn sample_message(repeat: usize) -> String {
    let chain = (0..repeat).fold(MessageChain::new(), |chain, i| {
        chain
            .tag(Tag::reply(i).unwrap())
            .text(format!("line {} with [brackets], commas & ampersands ", i))
            .tag(Tag::at(10000 + i).unwrap())
            .tag(Tag::image("https://example.com/a.png?x=1,y=2", ImageType::Normal).unwrap())
            .tag(Tag::face(14).unwrap())
    });
    chain.to_text(&CodecOptions::cq())
}

/// Benchmarks parsing message text into segments.
fn bench_parse(c: &mut Criterion) {
    let options = CodecOptions::cq();
    let short = sample_message(1);
    let long = sample_message(64);
    c.bench_function("parse_short", |b| {
        b.iter(|| black_box(parse_with(black_box(&short), &options)))
    });
    c.bench_function("parse_long", |b| {
        b.iter(|| black_box(parse_with(black_box(&long), &options)))
    });
    let malformed = "[CQ:at,qq=1 [CQ: [face] ]]]".repeat(64);
    c.bench_function("parse_malformed", |b| {
        b.iter(|| black_box(parse_with(black_box(&malformed), &options)))
    });
}

/// Benchmarks serializing segments back to text.
fn bench_serialize(c: &mut Criterion) {
    let options = CodecOptions::cq();
    let chain = parse_with(&sample_message(64), &options);
    c.bench_function("serialize_long", |b| {
        b.iter(|| black_box(serialize_with(black_box(chain.segments()), &options)))
    });
}

criterion_group!(benches, bench_parse, bench_serialize);
criterion_main!(benches);
