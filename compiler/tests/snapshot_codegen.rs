// Snapshot tests for rendered code fragments.
//
// Inline snapshots pin the exact text of the load-bearing generated
// lines: block make statements, variable assignments, and connect calls.

use grcc::eval::RhaiEvaluator;
use grcc::generator::{generate, GeneratorKind, GeneratorOptions};
use grcc::platform::{Platform, PlatformConfig};
use grcc::schema::parse_block_schema;

const TEST_SOURCE: &str = r#"
id: test_source
label: Test Source
flags: [python]
parameters:
-   id: type
    label: Type
    dtype: enum
    default: float
    options: [complex, float]
    option_attributes:
        size: [8, 4]
outputs:
-   domain: stream
    dtype: ${ type }
templates:
    imports: from gnuradio import blocks
    make: blocks.null_source(${type.size})
"#;

const TEST_SINK: &str = r#"
id: test_sink
label: Test Sink
flags: [python]
inputs:
-   domain: stream
    dtype: float
templates:
    imports: from gnuradio import blocks
    make: blocks.null_sink(4)
"#;

fn generated_python() -> String {
    let mut platform = Platform::new(PlatformConfig::default()).unwrap();
    for text in [TEST_SOURCE, TEST_SINK] {
        platform.register_block_schema(parse_block_schema(text).unwrap());
    }
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();

    let var = fg.new_block(&platform, "variable");
    fg.block_mut(var).set_name("samp_rate");
    fg.block_mut(var).set_param_value("value", "32000");
    let src = fg.new_block(&platform, "test_source");
    let snk = fg.new_block(&platform, "test_sink");
    fg.block_mut(src).set_name("src0");
    fg.block_mut(snk).set_name("snk0");
    fg.rewrite(&evaluator).unwrap();
    fg.connect("src0", "0", "snk0", "0").unwrap();

    let output = generate(
        &fg,
        &platform,
        GeneratorKind::PythonTop,
        &GeneratorOptions::default(),
    )
    .unwrap();
    output.files[0].content.clone()
}

fn line_containing<'a>(text: &'a str, needle: &str) -> &'a str {
    text.lines()
        .find(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line containing {:?}", needle))
        .trim()
}

#[test]
fn variable_assignment_line() {
    let content = generated_python();
    insta::assert_snapshot!(
        line_containing(&content, "self.samp_rate ="),
        @"self.samp_rate = samp_rate = 32000"
    );
}

#[test]
fn block_make_line() {
    let content = generated_python();
    insta::assert_snapshot!(
        line_containing(&content, "self.src0 ="),
        @"self.src0 = blocks.null_source(4)"
    );
}

#[test]
fn connect_line() {
    let content = generated_python();
    insta::assert_snapshot!(
        line_containing(&content, "self.connect"),
        @"self.connect((self.src0, 0), (self.snk0, 0))"
    );
}

#[test]
fn class_header_line() {
    let content = generated_python();
    insta::assert_snapshot!(
        line_containing(&content, "class "),
        @"class top_block(gr.top_block):"
    );
}
