use clap::Parser;
use std::path::PathBuf;

use grcc::diag::{DiagLevel, Diagnostic};
use grcc::eval::RhaiEvaluator;
use grcc::generator::{generate, write_output, GeneratorOptions};
use grcc::platform::{Platform, PlatformConfig};
use grcc::schema;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Generated program source files
    Source,
    /// Normalized flow-graph document
    Yaml,
    /// Validate only, no output
    Check,
}

#[derive(Parser, Debug)]
#[command(
    name = "grcc",
    version,
    about = "grcc — compiles .grc flow-graph documents to runnable Python/C++ programs"
)]
struct Cli {
    /// Input flow-graph file (.grc)
    source: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Block/domain descriptor search directory (repeatable)
    #[arg(short = 'B', long = "block-path")]
    block_path: Vec<PathBuf>,

    /// Descriptor cache file
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Source)]
    emit: EmitStage,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

fn report(diags: &[Diagnostic]) -> bool {
    let mut any_error = false;
    for d in diags {
        eprintln!("grcc: {}", d);
        if d.level == DiagLevel::Error {
            any_error = true;
        }
    }
    any_error
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        eprintln!("grcc: source = {}", cli.source.display());
        eprintln!("grcc: output = {}", cli.output.display());
        eprintln!("grcc: emit   = {:?}", cli.emit);
    }

    // ── Build the platform ──
    let mut platform = match Platform::new(PlatformConfig {
        search_paths: cli.block_path.clone(),
        cache_path: cli.cache.clone(),
    }) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("grcc: error: {}", e);
            std::process::exit(2);
        }
    };
    let load_diags = platform.build_library();
    report(&load_diags);
    if cli.verbose {
        eprintln!("grcc: {} block types registered", platform.len());
    }

    // ── Read and parse the document ──
    let text = match std::fs::read_to_string(&cli.source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("grcc: error: {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };
    let file = match schema::parse_flowgraph(&text) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("grcc: error: {}: {}", cli.source.display(), e);
            std::process::exit(1);
        }
    };

    // ── Import, rewrite, validate ──
    let evaluator = RhaiEvaluator::new();
    let mut fg = platform.make_flowgraph();
    let import = match fg.import_data(&platform, &file, &evaluator) {
        Ok(r) => r,
        Err(cycle) => {
            eprintln!("grcc: error: {}", cycle);
            std::process::exit(1);
        }
    };
    report(&import.diagnostics);

    if cli.verbose {
        eprintln!(
            "grcc: imported {} blocks, {} connections",
            fg.blocks.len(),
            fg.connections.len()
        );
    }

    let validate_diags = fg.validate(&platform, &evaluator);
    let invalid = report(&validate_diags);
    if invalid {
        eprintln!("grcc: flow graph is invalid, aborting");
        std::process::exit(1);
    }

    match cli.emit {
        EmitStage::Check => {
            eprintln!("grcc: ok");
        }
        EmitStage::Yaml => {
            let exported = fg.export_data();
            match schema::flowgraph_to_yaml(&exported) {
                Ok(text) => print!("{}", text),
                Err(e) => {
                    eprintln!("grcc: error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        EmitStage::Source => {
            let kind = match platform.generator_for(fg.output_language(), &fg.generate_options()) {
                Some(k) => k,
                None => {
                    eprintln!(
                        "grcc: error: no generator for {} / {}",
                        fg.output_language().as_str(),
                        fg.generate_options()
                    );
                    std::process::exit(1);
                }
            };
            let options = GeneratorOptions {
                output_dir: cli.output.clone(),
            };
            let output = match generate(&fg, &platform, kind, &options) {
                Ok(o) => o,
                Err(e) => {
                    eprintln!("grcc: error: {}", e);
                    std::process::exit(1);
                }
            };
            match write_output(&output) {
                Ok(paths) => {
                    for p in paths {
                        eprintln!("grcc: wrote {}", p.display());
                    }
                }
                Err(e) => {
                    eprintln!("grcc: error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
