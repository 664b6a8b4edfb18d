// End-to-end generation: validated flow graphs through the generator
// backends to files on disk.
//
// Positive cases assert on the emitted file set and load-bearing lines
// of the rendered output rather than full texts.

use grcc::eval::RhaiEvaluator;
use grcc::generator::{generate, write_output, GeneratorKind, GeneratorOptions};
use grcc::platform::{Platform, PlatformConfig};
use grcc::schema::parse_block_schema;

const TEST_SOURCE: &str = r#"
id: test_source
label: Test Source
flags: [python, cpp]
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
cpp_templates:
    includes: ['#include <gnuradio/blocks/null_source.h>']
    declarations: gr::blocks::null_source::sptr ${id};
    make: this->${id} = gr::blocks::null_source::make(${type.size});
    packages: [gnuradio-blocks]
    link: [gnuradio::gnuradio-blocks]
"#;

const TEST_SINK: &str = r#"
id: test_sink
label: Test Sink
flags: [python, cpp]
parameters:
-   id: type
    label: Type
    dtype: enum
    default: float
    options: [complex, float]
    option_attributes:
        size: [8, 4]
inputs:
-   domain: stream
    dtype: ${ type }
templates:
    imports: from gnuradio import blocks
    make: blocks.null_sink(${type.size})
cpp_templates:
    includes: ['#include <gnuradio/blocks/null_sink.h>']
    declarations: gr::blocks::null_sink::sptr ${id};
    make: this->${id} = gr::blocks::null_sink::make(${type.size});
    packages: [gnuradio-blocks]
    link: [gnuradio::gnuradio-blocks]
"#;

fn test_platform() -> Platform {
    let mut p = Platform::new(PlatformConfig::default()).expect("builtin platform");
    for text in [TEST_SOURCE, TEST_SINK] {
        p.register_block_schema(parse_block_schema(text).expect("test schema"));
    }
    p
}

/// Minimal valid source→sink graph with stable block names.
fn minimal_graph(
    platform: &Platform,
    evaluator: &RhaiEvaluator,
) -> grcc::flowgraph::FlowGraph {
    let mut fg = platform.make_flowgraph();
    let src = fg.new_block(platform, "test_source");
    let snk = fg.new_block(platform, "test_sink");
    fg.block_mut(src).set_name("src0");
    fg.block_mut(snk).set_name("snk0");
    fg.rewrite(evaluator).unwrap();
    fg.connect("src0", "0", "snk0", "0").unwrap();

    let diags = fg.validate(platform, evaluator);
    assert!(
        !grcc::diag::has_errors(&diags),
        "graph unexpectedly invalid: {:?}",
        diags.iter().map(|d| d.to_string()).collect::<Vec<_>>()
    );
    fg
}

#[test]
fn python_top_generates_runnable_script() {
    let platform = test_platform();
    let evaluator = RhaiEvaluator::new();
    let fg = minimal_graph(&platform, &evaluator);

    let dir = tempfile::tempdir().unwrap();
    let options = GeneratorOptions {
        output_dir: dir.path().to_path_buf(),
    };
    let output = generate(&fg, &platform, GeneratorKind::PythonTop, &options).unwrap();
    let paths = write_output(&output).unwrap();

    // The generator reports the emitted file path.
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("top_block.py"));
    assert!(paths[0].exists());

    let content = std::fs::read_to_string(&paths[0]).unwrap();
    assert!(content.starts_with("#!/usr/bin/env python3"));
    assert!(content.contains("class top_block(gr.top_block):"));
    assert!(content.contains("self.src0 = blocks.null_source(4)"));
    assert!(content.contains("self.snk0 = blocks.null_sink(4)"));
    assert!(content.contains("self.connect((self.src0, 0), (self.snk0, 0))"));
    assert!(content.contains("if __name__ == '__main__':"));
    // Imports are deduplicated.
    assert_eq!(content.matches("from gnuradio import blocks").count(), 1);
}

#[test]
fn variables_render_in_dependency_order_with_setters() {
    let platform = test_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();

    let b = fg.new_block(&platform, "variable");
    fg.block_mut(b).set_name("doubled");
    fg.block_mut(b).set_param_value("value", "samp_rate * 2");
    let a = fg.new_block(&platform, "variable");
    fg.block_mut(a).set_name("samp_rate");
    fg.block_mut(a).set_param_value("value", "32000");
    fg.rewrite(&evaluator).unwrap();

    let output = generate(
        &fg,
        &platform,
        GeneratorKind::PythonTop,
        &GeneratorOptions::default(),
    )
    .unwrap();
    let content = &output.files[0].content;

    let samp = content
        .find("self.samp_rate = samp_rate = 32000")
        .expect("samp_rate assignment");
    let doubled = content
        .find("self.doubled = doubled = samp_rate * 2")
        .expect("doubled assignment");
    assert!(samp < doubled, "dependency must be assigned first");

    assert!(content.contains("def set_samp_rate(self, samp_rate):"));
    // Changing samp_rate re-evaluates the dependent variable.
    assert!(content.contains("self.set_doubled(samp_rate * 2)"));
}

#[test]
fn hier_block_emits_descriptor_with_pad_order() {
    let platform = test_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();
    fg.options_block_mut().set_name("my_hier_blk");
    fg.options_block_mut()
        .set_param_value("generate_options", "hb");

    let pad_a = fg.new_block(&platform, "pad_source");
    let pad_b = fg.new_block(&platform, "pad_source");
    let out_x = fg.new_block(&platform, "pad_sink");
    let out_y = fg.new_block(&platform, "pad_sink");
    fg.block_mut(pad_a).set_name("pad_a");
    fg.block_mut(pad_a).set_param_value("label", "alpha");
    fg.block_mut(pad_a).set_param_value("type", "float");
    fg.block_mut(pad_b).set_name("pad_b");
    fg.block_mut(pad_b).set_param_value("label", "beta");
    fg.block_mut(pad_b).set_param_value("type", "float");
    fg.block_mut(out_x).set_name("out_x");
    fg.block_mut(out_x).set_param_value("type", "float");
    fg.block_mut(out_y).set_name("out_y");
    fg.block_mut(out_y).set_param_value("type", "float");

    let gain = fg.new_block(&platform, "parameter");
    fg.block_mut(gain).set_name("gain");
    fg.block_mut(gain).set_param_value("value", "1");

    fg.rewrite(&evaluator).unwrap();
    fg.connect("pad_a", "0", "out_x", "0").unwrap();
    fg.connect("pad_b", "0", "out_y", "0").unwrap();

    let diags = fg.validate(&platform, &evaluator);
    assert!(!grcc::diag::has_errors(&diags), "{:?}", diags);

    let output = generate(
        &fg,
        &platform,
        GeneratorKind::PythonHier,
        &GeneratorOptions::default(),
    )
    .unwrap();

    let py = output
        .files
        .iter()
        .find(|f| f.path.to_string_lossy().ends_with("my_hier_blk.py"))
        .expect("python file");
    assert!(py.content.contains("class my_hier_blk(gr.hier_block2):"));
    assert!(py.content.contains("def __init__(self, gain=1):"));
    assert!(py.content.contains("gr.io_signaturev(2, 2, [4, 4])"));

    let descriptor = output
        .files
        .iter()
        .find(|f| f.path.to_string_lossy().ends_with("my_hier_blk.block.yml"))
        .expect("descriptor file");
    let schema = parse_block_schema(&descriptor.content).unwrap();
    assert_eq!(schema.id, "my_hier_blk");
    // Descriptor ordering mirrors the pad sort-by-name order used for
    // the io signature: pad_a before pad_b, out_x before out_y.
    assert_eq!(schema.inputs.len(), 2);
    assert_eq!(schema.inputs[0].label, "alpha");
    assert_eq!(schema.inputs[1].label, "beta");
    assert_eq!(schema.outputs.len(), 2);
    assert_eq!(schema.parameters.len(), 1);
    assert_eq!(schema.parameters[0].id, "gain");
}

#[test]
fn cpp_top_emits_sources_and_build_file() {
    let platform = test_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = minimal_graph(&platform, &evaluator);
    fg.options_block_mut()
        .set_param_value("output_language", "cpp");

    let output = generate(
        &fg,
        &platform,
        GeneratorKind::CppTop,
        &GeneratorOptions::default(),
    )
    .unwrap();

    let names: Vec<String> = output
        .files
        .iter()
        .map(|f| f.path.to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("top_block.hpp")));
    assert!(names.iter().any(|n| n.ends_with("top_block.cpp")));
    assert!(names.iter().any(|n| n.ends_with("CMakeLists.txt")));

    let hpp = &output.files[0].content;
    assert!(hpp.contains("#include <gnuradio/blocks/null_source.h>"));
    assert!(hpp.contains("gr::blocks::null_source::sptr src0;"));

    let cpp = &output.files[1].content;
    assert!(cpp.contains("this->src0 = gr::blocks::null_source::make(4);"));
    assert!(cpp.contains("tb->connect(src0, 0, snk0, 0);"));

    let cmake = &output.files[2].content;
    assert!(cmake.contains("add_executable(top_block top_block.cpp)"));
    assert!(cmake.contains("gnuradio::gnuradio-blocks"));
}

#[test]
fn embedded_python_block_gets_its_own_module() {
    let platform = test_platform();
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();

    let src = fg.new_block(&platform, "test_source");
    let epy = fg.new_block(&platform, "epy_block");
    let snk = fg.new_block(&platform, "test_sink");
    fg.block_mut(src).set_name("src0");
    fg.block_mut(epy).set_name("scale0");
    fg.block_mut(snk).set_name("snk0");
    fg.block_mut(epy).set_param_value(
        "_source_code",
        r#"
import numpy as np
from gnuradio import gr

class blk(gr.sync_block):
    """Scale by a constant"""

    def __init__(self, factor=2.0):
        gr.sync_block.__init__(self, name='Scale', in_sig=[np.float32], out_sig=[np.float32])
        self.factor = factor
"#,
    );
    fg.rewrite(&evaluator).unwrap();
    fg.connect("src0", "0", "scale0", "0").unwrap();
    fg.connect("scale0", "0", "snk0", "0").unwrap();

    let diags = fg.validate(&platform, &evaluator);
    assert!(!grcc::diag::has_errors(&diags), "{:?}", diags);

    let output = generate(
        &fg,
        &platform,
        GeneratorKind::PythonTop,
        &GeneratorOptions::default(),
    )
    .unwrap();

    let main_py = &output.files[0].content;
    assert!(main_py.contains("import top_block_scale0 as top_block_scale0"));
    assert!(main_py.contains("self.scale0 = top_block_scale0.blk(factor=2.0)"));

    let module = output
        .files
        .iter()
        .find(|f| f.path.to_string_lossy().ends_with("top_block_scale0.py"))
        .expect("embedded module file");
    assert!(module.content.contains("class blk(gr.sync_block):"));
}

#[test]
fn gui_block_in_no_gui_mode_refuses_generation() {
    let mut platform = test_platform();
    platform.register_block_schema(
        parse_block_schema(
            r#"
id: test_gui_sink
label: GUI Sink
flags: [python, need_qt_gui]
inputs:
-   domain: stream
    dtype: float
templates:
    make: qtgui.time_sink_f()
"#,
        )
        .unwrap(),
    );
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();
    let src = fg.new_block(&platform, "test_source");
    let snk = fg.new_block(&platform, "test_gui_sink");
    fg.block_mut(src).set_name("src0");
    fg.block_mut(snk).set_name("gui0");
    fg.rewrite(&evaluator).unwrap();
    fg.connect("src0", "0", "gui0", "0").unwrap();

    let diags = fg.validate(&platform, &evaluator);
    assert!(
        diags
            .iter()
            .any(|d| d.code == Some(grcc::diag::codes::E0402)),
        "expected GUI-mode error"
    );
}
