use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use grcc::eval::RhaiEvaluator;
use grcc::generator::{generate, GeneratorKind, GeneratorOptions};
use grcc::platform::{Platform, PlatformConfig};
use grcc::schema::parse_block_schema;

// Benchmark scenarios exercise the hot pipeline path: namespace
// rebuild + structural rewrite, validation, and code generation.

const TEST_SOURCE: &str = r#"
id: test_source
label: Test Source
flags: [python]
parameters:
-   id: nports
    label: Num Ports
    dtype: int
    default: 1
outputs:
-   domain: stream
    dtype: float
    multiplicity: ${ nports }
templates:
    imports: from gnuradio import blocks
    make: blocks.null_source(4)
"#;

const TEST_COPY: &str = r#"
id: test_copy
label: Test Copy
flags: [python]
inputs:
-   domain: stream
    dtype: float
outputs:
-   domain: stream
    dtype: float
templates:
    imports: from gnuradio import blocks
    make: blocks.copy(4)
"#;

const TEST_SINK: &str = r#"
id: test_sink
label: Test Sink
flags: [python]
parameters:
-   id: nports
    label: Num Ports
    dtype: int
    default: 1
inputs:
-   domain: stream
    dtype: float
    multiplicity: ${ nports }
templates:
    imports: from gnuradio import blocks
    make: blocks.null_sink(4)
"#;

fn bench_platform() -> Platform {
    let mut p = Platform::new(PlatformConfig::default()).unwrap();
    for text in [TEST_SOURCE, TEST_COPY, TEST_SINK] {
        p.register_block_schema(parse_block_schema(text).unwrap());
    }
    p
}

/// A chain of n copy blocks between a source and a sink, with a handful
/// of dependent variables feeding the namespace rebuild.
fn build_chain(platform: &Platform, evaluator: &RhaiEvaluator, n: usize) -> grcc::flowgraph::FlowGraph {
    let mut fg = platform.make_flowgraph();

    for (name, value) in [
        ("samp_rate", "32000"),
        ("decim", "samp_rate / 4"),
        ("gain", "decim * 2"),
    ] {
        let id = fg.new_block(platform, "variable");
        fg.block_mut(id).set_name(name);
        fg.block_mut(id).set_param_value("value", value);
    }

    let mut prev = {
        let id = fg.new_block(platform, "test_source");
        fg.block_mut(id).set_name("src");
        "src".to_string()
    };
    for i in 0..n {
        let id = fg.new_block(platform, "test_copy");
        let name = format!("copy_{}", i);
        fg.block_mut(id).set_name(name.clone());
        fg.rewrite(evaluator).unwrap();
        fg.connect(&prev, "0", &name, "0").unwrap();
        prev = name;
    }
    let id = fg.new_block(platform, "test_sink");
    fg.block_mut(id).set_name("snk");
    fg.rewrite(evaluator).unwrap();
    fg.connect(&prev, "0", "snk", "0").unwrap();
    fg
}

fn bench_rewrite(c: &mut Criterion) {
    let platform = bench_platform();
    let evaluator = RhaiEvaluator::new();
    let mut group = c.benchmark_group("rewrite");
    for n in [4usize, 16, 64] {
        let mut fg = build_chain(&platform, &evaluator, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| fg.rewrite(&evaluator).unwrap());
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let platform = bench_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = build_chain(&platform, &evaluator, 16);
    fg.rewrite(&evaluator).unwrap();
    c.bench_function("validate_chain_16", |b| {
        b.iter(|| fg.validate(&platform, &evaluator));
    });
}

fn bench_generate(c: &mut Criterion) {
    let platform = bench_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = build_chain(&platform, &evaluator, 16);
    fg.rewrite(&evaluator).unwrap();
    let options = GeneratorOptions::default();
    c.bench_function("generate_python_chain_16", |b| {
        b.iter(|| generate(&fg, &platform, GeneratorKind::PythonTop, &options).unwrap());
    });
}

fn bench_import(c: &mut Criterion) {
    let platform = bench_platform();
    let evaluator = RhaiEvaluator::new();
    let fg = build_chain(&platform, &evaluator, 16);
    let file = fg.export_data();
    c.bench_function("import_chain_16", |b| {
        b.iter(|| {
            let mut fresh = platform.make_flowgraph();
            fresh
                .import_data(&platform, &file, &evaluator)
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_rewrite,
    bench_validate,
    bench_generate,
    bench_import
);
criterion_main!(benches);
