// platform.rs — Block/domain registry and element factory
//
// The Platform owns the catalog of block-type schemas (built-ins from an
// enumerated list, plus YAML descriptors discovered on a search path),
// the domain descriptors that govern connection compatibility and
// per-domain-pair connection templates, and the generator dispatch
// table. Constructed once per compiler invocation; `build_library` is
// idempotent and may be called again to reload descriptions.
//
// Preconditions: none.
// Postconditions: a constructed Platform always has the built-in block
//                 types; an empty built-in set is a broken install and
//                 refuses construction.
// Failure modes: I/O and parse problems during library build are skipped
//                with a logged warning; only a missing built-in set is
//                fatal.
// Side effects: reads descriptor files; maintains the descriptor cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::block::{Block, BlockId};
use crate::diag::{codes, Diagnostic, ElemPath};
use crate::flowgraph::FlowGraph;
use crate::generator::GeneratorKind;
use crate::param::OutputLanguage;
use crate::schema::{
    parse_block_schema, parse_domain_schema, BlockSchema, DomainSchema, DomainTemplateSchema,
};

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PlatformError {
    /// No built-in block types could be registered — broken install.
    NoBuiltins(String),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    DuplicateBlock {
        key: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NoBuiltins(m) => {
                write!(f, "no built-in block types available: {}", m)
            }
            PlatformError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            PlatformError::DuplicateBlock { key, first, second } => write!(
                f,
                "duplicate block type '{}': first defined in {}, redefined in {}",
                key,
                first.display(),
                second.display()
            ),
        }
    }
}

impl std::error::Error for PlatformError {}

// ── Built-in descriptors ─────────────────────────────────────────────────

// Built-ins are ordinary descriptors, registered from this enumerated
// list at construction rather than through registration side effects.
const BUILTIN_BLOCKS: &[&str] = &[
    // options
    r#"
id: options
label: Options
parameters:
-   id: title
    label: Title
    dtype: string
-   id: author
    label: Author
    dtype: string
    hide: part
-   id: description
    label: Description
    dtype: string
    hide: part
-   id: output_language
    label: Output Language
    dtype: enum
    default: python
    options: [python, cpp]
    option_labels: [Python, C++]
-   id: generate_options
    label: Generate Options
    dtype: enum
    default: no_gui
    options: [no_gui, qt_gui, hb, hb_qt_gui]
    option_labels: [No GUI, QT GUI, Hier Block, Hier Block (QT GUI)]
-   id: run_options
    label: Run Options
    dtype: enum
    default: run
    options: [run, prompt]
    option_labels: [Run to Completion, Prompt for Exit]
    hide: part
-   id: category
    label: Category
    dtype: string
    default: '[GRC Hier Blocks]'
    hide: part
templates:
    imports: |-
        from gnuradio import gr
        import signal
"#,
    // variable
    r#"
id: variable
label: Variable
flags: [show_id]
parameters:
-   id: value
    label: Value
    dtype: raw
    default: '0'
templates:
    var_make: self.${id} = ${id} = ${value}
    callbacks:
    - self.set_${id}(${value})
"#,
    // parameter
    r#"
id: parameter
label: Parameter
flags: [show_id]
parameters:
-   id: label
    label: Label
    dtype: string
    hide: part
-   id: value
    label: Value
    dtype: raw
    default: '0'
templates:
    var_make: self.${id} = ${id} = ${value}
"#,
    // import
    r#"
id: import
label: Import
parameters:
-   id: imported
    label: Import
    dtype: _multiline
templates:
    imports: ${imported}
"#,
    // virtual source/sink
    r#"
id: virtual_source
label: Virtual Source
parameters:
-   id: stream_id
    label: Stream ID
    dtype: stream_id
outputs:
-   domain: stream
    dtype: ''
"#,
    r#"
id: virtual_sink
label: Virtual Sink
parameters:
-   id: stream_id
    label: Stream ID
    dtype: stream_id
inputs:
-   domain: stream
    dtype: ''
"#,
    // pad source/sink (hier block boundaries)
    r#"
id: pad_source
label: Pad Source
parameters:
-   id: label
    label: Label
    dtype: string
    default: in
-   id: type
    label: Output Type
    dtype: enum
    default: complex
    options: [complex, float, int, short, byte, message]
    option_attributes:
        size: [8, 4, 4, 2, 1, 0]
-   id: vlen
    label: Vector Length
    dtype: int
    default: 1
-   id: num_streams
    label: Num Streams
    dtype: int
    default: 1
-   id: optional
    label: Optional
    dtype: bool
    default: 'False'
    hide: part
outputs:
-   domain: stream
    dtype: ${ type }
    vlen: ${ vlen }
    multiplicity: ${ num_streams }
    optional: ${ optional }
"#,
    r#"
id: pad_sink
label: Pad Sink
parameters:
-   id: label
    label: Label
    dtype: string
    default: out
-   id: type
    label: Input Type
    dtype: enum
    default: complex
    options: [complex, float, int, short, byte, message]
    option_attributes:
        size: [8, 4, 4, 2, 1, 0]
-   id: vlen
    label: Vector Length
    dtype: int
    default: 1
-   id: num_streams
    label: Num Streams
    dtype: int
    default: 1
-   id: optional
    label: Optional
    dtype: bool
    default: 'False'
    hide: part
inputs:
-   domain: stream
    dtype: ${ type }
    vlen: ${ vlen }
    multiplicity: ${ num_streams }
    optional: ${ optional }
"#,
    // embedded python block / module
    r#"
id: epy_block
label: Python Block
parameters:
-   id: _source_code
    label: Source Code
    dtype: _multiline_python_external
"#,
    r#"
id: epy_module
label: Python Module
parameters:
-   id: source_code
    label: Source Code
    dtype: _multiline_python_external
"#,
    // note
    r#"
id: note
label: Note
parameters:
-   id: note
    label: Note
    dtype: string
"#,
];

const BUILTIN_DOMAINS: &[&str] = &[
    r#"
id: stream
label: Stream
color: '#FFFFFF'
multiple_connections_per_input: false
multiple_connections_per_output: true
templates:
-   type: [stream, stream]
    connect: self.connect((${src_blk}, ${src_idx}), (${snk_blk}, ${snk_idx}))
    cpp_connect: this->connect(${src_blk}, ${src_idx}, ${snk_blk}, ${snk_idx});
"#,
    r#"
id: message
label: Message
color: '#777777'
multiple_connections_per_input: true
multiple_connections_per_output: true
templates:
-   type: [message, message]
    connect: self.msg_connect((${src_blk}, '${src_key}'), (${snk_blk}, '${snk_key}'))
    cpp_connect: this->msg_connect(${src_blk}, "${src_key}", ${snk_blk}, "${snk_key}");
"#,
];

// ── Platform config ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PlatformConfig {
    /// Directories scanned for `*.block.yml` / `*.domain.yml`.
    pub search_paths: Vec<PathBuf>,
    /// Optional JSON cache of parsed descriptors, keyed by content hash.
    pub cache_path: Option<PathBuf>,
}

// ── Platform ─────────────────────────────────────────────────────────────

pub struct Platform {
    block_schemas: BTreeMap<String, BlockSchema>,
    /// Where each non-builtin schema came from (duplicate reporting).
    schema_origins: BTreeMap<String, PathBuf>,
    builtin_keys: BTreeSet<String>,
    domains: BTreeMap<String, DomainSchema>,
    config: PlatformConfig,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Result<Platform, PlatformError> {
        let mut platform = Platform {
            block_schemas: BTreeMap::new(),
            schema_origins: BTreeMap::new(),
            builtin_keys: BTreeSet::new(),
            domains: BTreeMap::new(),
            config,
        };
        for text in BUILTIN_BLOCKS {
            let schema =
                parse_block_schema(text).map_err(|e| PlatformError::NoBuiltins(e.to_string()))?;
            platform.builtin_keys.insert(schema.id.clone());
            platform.block_schemas.insert(schema.id.clone(), schema);
        }
        for text in BUILTIN_DOMAINS {
            let schema =
                parse_domain_schema(text).map_err(|e| PlatformError::NoBuiltins(e.to_string()))?;
            platform.domains.insert(schema.id.clone(), schema);
        }
        if platform.block_schemas.is_empty() {
            return Err(PlatformError::NoBuiltins("empty registry".to_string()));
        }
        Ok(platform)
    }

    // ── Library build ───────────────────────────────────────────────

    /// (Re)load descriptors from the search paths. Idempotent: loaded
    /// descriptions are replaced wholesale, built-ins are kept.
    /// Malformed files are skipped with a warning diagnostic.
    pub fn build_library(&mut self) -> Vec<Diagnostic> {
        let mut diags = Vec::new();

        let builtins = self.builtin_keys.clone();
        self.block_schemas.retain(|key, _| builtins.contains(key));
        self.schema_origins.clear();

        let mut cache = self.load_cache();
        let mut cache_dirty = false;

        let mut files = Vec::new();
        for root in self.config.search_paths.clone() {
            collect_files(&root, &mut files);
        }
        files.sort();

        for path in files {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let is_block = name.ends_with(".block.yml");
            let is_domain = name.ends_with(".domain.yml");
            if !is_block && !is_domain {
                continue;
            }
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable descriptor");
                    diags.push(
                        Diagnostic::warning(
                            ElemPath::graph(),
                            format!("skipping {}: {}", path.display(), e),
                        )
                        .with_code(codes::W0300),
                    );
                    continue;
                }
            };

            if is_domain {
                match parse_domain_schema(&text) {
                    Ok(schema) => {
                        self.domains.insert(schema.id.clone(), schema);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping malformed domain");
                        diags.push(
                            Diagnostic::warning(
                                ElemPath::graph(),
                                format!("skipping {}: {}", path.display(), e),
                            )
                            .with_code(codes::W0300),
                        );
                    }
                }
                continue;
            }

            let key = hash_hex(&text);
            let schema = match cache.get(&key) {
                Some(schema) => schema.clone(),
                None => match parse_block_schema(&text) {
                    Ok(schema) => {
                        cache.insert(key, schema.clone());
                        cache_dirty = true;
                        schema
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping malformed descriptor");
                        diags.push(
                            Diagnostic::warning(
                                ElemPath::graph(),
                                format!("skipping {}: {}", path.display(), e),
                            )
                            .with_code(codes::W0300),
                        );
                        continue;
                    }
                },
            };

            if let Some(first) = self.schema_origins.get(&schema.id) {
                warn!(
                    key = %schema.id,
                    first = %first.display(),
                    second = %path.display(),
                    "duplicate block descriptor; keeping the first"
                );
                continue;
            }
            self.schema_origins.insert(schema.id.clone(), path);
            self.block_schemas.insert(schema.id.clone(), schema);
        }

        if cache_dirty {
            self.store_cache(&cache);
        }
        diags
    }

    fn load_cache(&self) -> BTreeMap<String, BlockSchema> {
        let Some(path) = &self.config.cache_path else {
            return BTreeMap::new();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn store_cache(&self, cache: &BTreeMap<String, BlockSchema>) {
        let Some(path) = &self.config.cache_path else {
            return;
        };
        if let Ok(text) = serde_json::to_string(cache) {
            if let Err(e) = std::fs::write(path, text) {
                warn!(path = %path.display(), error = %e, "failed to write descriptor cache");
            }
        }
    }

    // ── Catalog access ──────────────────────────────────────────────

    pub fn block_schema(&self, key: &str) -> Option<&BlockSchema> {
        self.block_schemas.get(key)
    }

    /// Register a schema directly (tests, generated hier blocks).
    pub fn register_block_schema(&mut self, schema: BlockSchema) {
        self.block_schemas.insert(schema.id.clone(), schema);
    }

    pub fn block_keys(&self) -> impl Iterator<Item = &str> {
        self.block_schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.block_schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_schemas.is_empty()
    }

    /// Loaded blocks grouped by category path, for front-ends.
    pub fn categories(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for schema in self.block_schemas.values() {
            out.entry(schema.category.clone())
                .or_default()
                .push(schema.id.clone());
        }
        out
    }

    pub fn domain(&self, id: &str) -> Option<&DomainSchema> {
        self.domains.get(id)
    }

    /// Connection template for a (source domain, sink domain) pair.
    pub fn connection_template(
        &self,
        src_domain: &str,
        snk_domain: &str,
    ) -> Option<&DomainTemplateSchema> {
        self.domains.values().flat_map(|d| &d.templates).find(|t| {
            t.domain_pair.len() == 2
                && t.domain_pair[0] == src_domain
                && t.domain_pair[1] == snk_domain
        })
    }

    // ── Factories ───────────────────────────────────────────────────

    pub fn make_flowgraph(&self) -> FlowGraph {
        let options = self.make_block(BlockId(0), "options", &BTreeMap::new());
        FlowGraph::new(options)
    }

    /// Build a block instance. Unknown keys fall back to a sibling
    /// descriptor on the search path (auto-built hier blocks), then to a
    /// dummy block carrying the raw parameter bag.
    pub fn make_block(
        &self,
        id: BlockId,
        key: &str,
        params: &BTreeMap<String, String>,
    ) -> Block {
        if let Some(schema) = self.block_schemas.get(key) {
            return Block::from_schema(id, schema);
        }
        if let Some(schema) = self.discover_block(key) {
            return Block::from_schema(id, &schema);
        }
        Block::make_dummy(id, key, params)
    }

    /// Look for `<key>.block.yml` on the search path without
    /// registering it.
    pub fn discover_block(&self, key: &str) -> Option<BlockSchema> {
        for root in &self.config.search_paths {
            let candidate = root.join(format!("{}.block.yml", key));
            if let Ok(text) = std::fs::read_to_string(&candidate) {
                match parse_block_schema(&text) {
                    Ok(schema) if schema.id == key => return Some(schema),
                    Ok(_) | Err(_) => {
                        warn!(path = %candidate.display(), key, "descriptor does not match its key");
                    }
                }
            }
        }
        None
    }

    // ── Generator dispatch ──────────────────────────────────────────

    /// The generator class table, keyed by output language and
    /// generate mode.
    pub fn generator_for(
        &self,
        language: OutputLanguage,
        generate_options: &str,
    ) -> Option<GeneratorKind> {
        match (language, generate_options) {
            (OutputLanguage::Python, "no_gui") => Some(GeneratorKind::PythonTop),
            (OutputLanguage::Python, "qt_gui") => Some(GeneratorKind::PythonQtGui),
            (OutputLanguage::Python, "hb") | (OutputLanguage::Python, "hb_qt_gui") => {
                Some(GeneratorKind::PythonHier)
            }
            (OutputLanguage::Cpp, "no_gui") => Some(GeneratorKind::CppTop),
            (OutputLanguage::Cpp, "hb") => Some(GeneratorKind::CppHier),
            _ => None,
        }
    }
}

fn hash_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKind;

    fn platform() -> Platform {
        Platform::new(PlatformConfig::default()).unwrap()
    }

    #[test]
    fn builtins_are_registered() {
        let p = platform();
        for key in [
            "options",
            "variable",
            "parameter",
            "import",
            "virtual_source",
            "virtual_sink",
            "pad_source",
            "pad_sink",
            "epy_block",
            "epy_module",
            "note",
        ] {
            assert!(p.block_schema(key).is_some(), "missing builtin {}", key);
        }
        assert!(p.domain("stream").is_some());
        assert!(p.domain("message").is_some());
    }

    #[test]
    fn connection_template_lookup() {
        let p = platform();
        let t = p.connection_template("stream", "stream").unwrap();
        assert!(t.connect.contains("self.connect"));
        assert!(p.connection_template("stream", "message").is_none());
    }

    #[test]
    fn unknown_key_yields_dummy() {
        let p = platform();
        let mut params = BTreeMap::new();
        params.insert("freq".to_string(), "100".to_string());
        let b = p.make_block(BlockId(0), "never_heard_of_it", &params);
        assert_eq!(b.kind, BlockKind::Dummy);
        assert!(b.param("freq").is_some());
    }

    #[test]
    fn make_flowgraph_has_options() {
        let p = platform();
        let fg = p.make_flowgraph();
        assert_eq!(fg.options_block().kind, BlockKind::Options);
        assert_eq!(fg.options_block().name, "top_block");
    }

    #[test]
    fn build_library_loads_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("test_scale.block.yml"),
            r#"
id: test_scale
label: Scale
flags: [python]
parameters:
-   id: k
    label: K
    dtype: real
    default: 1.0
inputs:
-   domain: stream
    dtype: float
outputs:
-   domain: stream
    dtype: float
templates:
    make: blocks.multiply_const_ff(${k})
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.block.yml"), "label: [oops").unwrap();

        let mut p = Platform::new(PlatformConfig {
            search_paths: vec![dir.path().to_path_buf()],
            cache_path: Some(dir.path().join("cache.json")),
        })
        .unwrap();

        let diags = p.build_library();
        assert!(p.block_schema("test_scale").is_some());
        assert!(diags.iter().any(|d| d.message.contains("broken.block.yml")));

        // Idempotent: a second build yields the same catalog, now
        // served from the cache.
        let before = p.len();
        p.build_library();
        assert_eq!(p.len(), before);
        assert!(dir.path().join("cache.json").exists());
    }

    #[test]
    fn discover_block_on_search_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("my_hier.block.yml"),
            "id: my_hier\nlabel: My Hier\n",
        )
        .unwrap();
        let p = Platform::new(PlatformConfig {
            search_paths: vec![dir.path().to_path_buf()],
            cache_path: None,
        })
        .unwrap();
        let b = p.make_block(BlockId(0), "my_hier", &BTreeMap::new());
        assert_eq!(b.kind, BlockKind::Standard);
        assert_eq!(b.label, "My Hier");
    }

    #[test]
    fn generator_table() {
        let p = platform();
        assert_eq!(
            p.generator_for(OutputLanguage::Python, "no_gui"),
            Some(GeneratorKind::PythonTop)
        );
        assert_eq!(
            p.generator_for(OutputLanguage::Python, "hb"),
            Some(GeneratorKind::PythonHier)
        );
        assert_eq!(
            p.generator_for(OutputLanguage::Cpp, "no_gui"),
            Some(GeneratorKind::CppTop)
        );
        assert_eq!(p.generator_for(OutputLanguage::Cpp, "qt_gui"), None);
    }
}
