// schema.rs — Descriptor and persisted-document schemas
//
// Serde types for the three document kinds the compiler consumes or
// produces: block-type descriptors, domain descriptors, and persisted
// flow graphs. Also detects and converts the legacy XML dialect.
//
// Preconditions: none.
// Postconditions: parse functions return owned data, no interning.
// Failure modes: malformed documents produce `SchemaError`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SchemaError {
    Yaml(String),
    Json(String),
    LegacyXml(String),
    /// Structurally valid but semantically unusable document.
    Invalid(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Yaml(m) => write!(f, "yaml: {}", m),
            SchemaError::Json(m) => write!(f, "json: {}", m),
            SchemaError::LegacyXml(m) => write!(f, "legacy xml: {}", m),
            SchemaError::Invalid(m) => write!(f, "{}", m),
        }
    }
}

impl std::error::Error for SchemaError {}

// ── Block-type descriptors ───────────────────────────────────────────────

/// A block-type description, the unit loaded by the platform's library
/// build. Mirrors the on-disk YAML shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BlockSchema {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub documentation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asserts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParamSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PortSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PortSchema>,
    #[serde(default, skip_serializing_if = "TemplatesSchema::is_empty")]
    pub templates: TemplatesSchema,
    #[serde(default, skip_serializing_if = "CppTemplatesSchema::is_empty")]
    pub cpp_templates: CppTemplatesSchema,
    #[serde(default = "default_file_format")]
    pub file_format: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ParamSchema {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
    /// Enum choices; labels and per-option attribute columns ride along
    /// in parallel lists, matching the descriptor dialect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub option_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub option_attributes: BTreeMap<String, Vec<serde_yaml::Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hide: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PortSchema {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dtype: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vlen: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub multiplicity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub optional: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hide: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TemplatesSchema {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub imports: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub make: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub var_make: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<String>,
}

impl TemplatesSchema {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
            && self.make.is_empty()
            && self.var_make.is_empty()
            && self.callbacks.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CppTemplatesSchema {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub declarations: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub make: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub translations: BTreeMap<String, String>,
}

impl CppTemplatesSchema {
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
            && self.declarations.is_empty()
            && self.make.is_empty()
            && self.callbacks.is_empty()
            && self.link.is_empty()
            && self.packages.is_empty()
            && self.translations.is_empty()
    }
}

fn default_file_format() -> u32 {
    1
}

/// Parse a block descriptor document.
pub fn parse_block_schema(text: &str) -> Result<BlockSchema, SchemaError> {
    let schema: BlockSchema =
        serde_yaml::from_str(text).map_err(|e| SchemaError::Yaml(e.to_string()))?;
    if schema.id.is_empty() {
        return Err(SchemaError::Invalid("descriptor has no id".to_string()));
    }
    Ok(schema)
}

// ── Domain descriptors ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DomainSchema {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub multiple_connections_per_input: bool,
    #[serde(default)]
    pub multiple_connections_per_output: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<DomainTemplateSchema>,
}

/// Connection code for one (source domain, sink domain) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DomainTemplateSchema {
    #[serde(rename = "type")]
    pub domain_pair: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connect: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpp_connect: String,
}

pub fn parse_domain_schema(text: &str) -> Result<DomainSchema, SchemaError> {
    let schema: DomainSchema =
        serde_yaml::from_str(text).map_err(|e| SchemaError::Yaml(e.to_string()))?;
    if schema.id.is_empty() {
        return Err(SchemaError::Invalid("domain has no id".to_string()));
    }
    Ok(schema)
}

// ── Persisted flow graphs ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GrcFile {
    #[serde(default)]
    pub options: GrcBlockEntry,
    #[serde(default)]
    pub blocks: Vec<GrcBlockEntry>,
    #[serde(default)]
    pub connections: Vec<GrcConnection>,
    #[serde(default)]
    pub metadata: GrcMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GrcBlockEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub states: BTreeMap<String, serde_yaml::Value>,
}

impl GrcBlockEntry {
    /// Parameter bag with scalars normalized to strings.
    pub fn param_strings(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), yaml_scalar_to_string(v)))
            .collect()
    }

    pub fn state_str(&self, key: &str) -> Option<String> {
        self.states.get(key).map(yaml_scalar_to_string)
    }
}

/// The two persisted connection shapes: the 4-tuple and the dict form
/// carrying extra per-connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GrcConnection {
    Tuple(Vec<serde_yaml::Value>),
    Dict {
        src_blk_id: String,
        src_port_id: String,
        snk_blk_id: String,
        snk_port_id: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

/// A normalized connection reference, independent of persisted shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnRef {
    pub src_block: String,
    pub src_port: String,
    pub snk_block: String,
    pub snk_port: String,
    pub params: BTreeMap<String, String>,
}

impl GrcConnection {
    pub fn normalize(&self) -> Result<ConnRef, SchemaError> {
        match self {
            GrcConnection::Tuple(items) => {
                if items.len() != 4 {
                    return Err(SchemaError::Invalid(format!(
                        "connection tuple has {} elements, expected 4",
                        items.len()
                    )));
                }
                Ok(ConnRef {
                    src_block: yaml_scalar_to_string(&items[0]),
                    src_port: yaml_scalar_to_string(&items[1]),
                    snk_block: yaml_scalar_to_string(&items[2]),
                    snk_port: yaml_scalar_to_string(&items[3]),
                    params: BTreeMap::new(),
                })
            }
            GrcConnection::Dict {
                src_blk_id,
                src_port_id,
                snk_blk_id,
                snk_port_id,
                params,
            } => Ok(ConnRef {
                src_block: src_blk_id.clone(),
                src_port: src_port_id.clone(),
                snk_block: snk_blk_id.clone(),
                snk_port: snk_port_id.clone(),
                params: params.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrcMetadata {
    #[serde(default = "default_file_format")]
    pub file_format: u32,
    #[serde(default)]
    pub grc_version: String,
}

impl Default for GrcMetadata {
    fn default() -> Self {
        GrcMetadata {
            file_format: default_file_format(),
            grc_version: String::new(),
        }
    }
}

/// Render a YAML scalar the way the parameter system expects it:
/// booleans in Python spelling, numbers verbatim, null empty.
pub fn yaml_scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(true) => "True".to_string(),
        serde_yaml::Value::Bool(false) => "False".to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Parse a persisted flow-graph document: legacy XML is detected by
/// sniffing for a `<flow_graph>` root tag, JSON by a leading brace,
/// everything else is YAML.
pub fn parse_flowgraph(text: &str) -> Result<GrcFile, SchemaError> {
    if sniff_legacy_xml(text) {
        return convert_legacy_xml(text);
    }
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        return serde_json::from_str(text).map_err(|e| SchemaError::Json(e.to_string()));
    }
    serde_yaml::from_str(text).map_err(|e| SchemaError::Yaml(e.to_string()))
}

/// Serialize a flow graph for persistence.
pub fn flowgraph_to_yaml(file: &GrcFile) -> Result<String, SchemaError> {
    serde_yaml::to_string(file).map_err(|e| SchemaError::Yaml(e.to_string()))
}

// ── Legacy XML ───────────────────────────────────────────────────────────

/// Detect the legacy dialect without attempting structured parsing.
pub fn sniff_legacy_xml(text: &str) -> bool {
    text.trim_start().starts_with("<?xml") || text.contains("<flow_graph>")
}

/// Extract the body of every non-nested `<tag>...</tag>` occurrence.
fn extract_all<'a>(s: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(start) = s[pos..].find(&open) {
        let body_start = pos + start + open.len();
        match s[body_start..].find(&close) {
            Some(end) => {
                out.push(&s[body_start..body_start + end]);
                pos = body_start + end + close.len();
            }
            None => break,
        }
    }
    out
}

fn extract_one<'a>(s: &'a str, tag: &str) -> Option<&'a str> {
    extract_all(s, tag).into_iter().next()
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Convert a legacy `<flow_graph>` document into the current format.
/// Covers block, param, and connection elements only.
pub fn convert_legacy_xml(text: &str) -> Result<GrcFile, SchemaError> {
    let root = extract_one(text, "flow_graph")
        .ok_or_else(|| SchemaError::LegacyXml("no <flow_graph> root".to_string()))?;

    let mut file = GrcFile::default();
    let mut found_options = false;

    for body in extract_all(root, "block") {
        let key = extract_one(body, "key")
            .map(str::trim)
            .ok_or_else(|| SchemaError::LegacyXml("block without <key>".to_string()))?;

        let mut entry = GrcBlockEntry {
            id: key.to_string(),
            ..Default::default()
        };
        for param_body in extract_all(body, "param") {
            let pkey = extract_one(param_body, "key").map(str::trim).unwrap_or("");
            let pvalue = extract_one(param_body, "value").unwrap_or("");
            if pkey.is_empty() {
                continue;
            }
            if pkey == "id" {
                entry.name = xml_unescape(pvalue.trim());
            }
            entry.parameters.insert(
                pkey.to_string(),
                serde_yaml::Value::String(xml_unescape(pvalue)),
            );
        }

        if key == "options" && !found_options {
            found_options = true;
            file.options = entry;
        } else {
            file.blocks.push(entry);
        }
    }

    for body in extract_all(root, "connection") {
        let get = |tag: &str| -> Result<String, SchemaError> {
            extract_one(body, tag)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| SchemaError::LegacyXml(format!("connection without <{}>", tag)))
        };
        file.connections.push(GrcConnection::Tuple(vec![
            serde_yaml::Value::String(get("source_block_id")?),
            serde_yaml::Value::String(get("source_key")?),
            serde_yaml::Value::String(get("sink_block_id")?),
            serde_yaml::Value::String(get("sink_key")?),
        ]));
    }

    file.metadata = GrcMetadata {
        file_format: 1,
        grc_version: "legacy".to_string(),
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
id: analog_sig_source
label: Signal Source
category: '[Core]/Waveform Generators'
flags: [python, cpp]

parameters:
-   id: type
    label: Output Type
    dtype: enum
    options: [complex, float]
    option_labels: [Complex, Float]
    option_attributes:
        size: [8, 4]
-   id: freq
    label: Frequency
    dtype: real
    default: 1000

inputs: []
outputs:
-   domain: stream
    dtype: ${ type }

templates:
    imports: from gnuradio import analog
    make: analog.sig_source_${type}(${freq})

file_format: 1
"#;

    #[test]
    fn parse_descriptor() {
        let schema = parse_block_schema(DESCRIPTOR).unwrap();
        assert_eq!(schema.id, "analog_sig_source");
        assert_eq!(schema.parameters.len(), 2);
        assert_eq!(schema.parameters[0].options.len(), 2);
        assert_eq!(
            schema.parameters[0].option_attributes.get("size").unwrap().len(),
            2
        );
        assert_eq!(schema.outputs.len(), 1);
        assert_eq!(schema.outputs[0].dtype, "${ type }");
        assert_eq!(schema.file_format, 1);
    }

    #[test]
    fn descriptor_without_id_is_invalid() {
        assert!(parse_block_schema("label: No Id").is_err());
    }

    #[test]
    fn parse_domain() {
        let text = r#"
id: stream
label: Stream
color: '#FFFFFF'
multiple_connections_per_output: true
templates:
-   type: [stream, stream]
    connect: self.connect((${src_blk}, ${src_idx}), (${snk_blk}, ${snk_idx}))
"#;
        let d = parse_domain_schema(text).unwrap();
        assert_eq!(d.id, "stream");
        assert!(d.multiple_connections_per_output);
        assert!(!d.multiple_connections_per_input);
        assert_eq!(d.templates[0].domain_pair, vec!["stream", "stream"]);
    }

    #[test]
    fn flowgraph_roundtrip_both_connection_shapes() {
        let text = r#"
options:
  name: top
  id: options
  parameters:
    title: Test
blocks:
- name: src0
  id: null_source
  parameters:
    type: complex
- name: snk0
  id: null_sink
connections:
- [src0, '0', snk0, '0']
- src_blk_id: src0
  src_port_id: '0'
  snk_blk_id: snk0
  snk_port_id: '0'
  params:
    buffer_size: '64'
metadata:
  file_format: 2
  grc_version: 0.3.0
"#;
        let file = parse_flowgraph(text).unwrap();
        assert_eq!(file.blocks.len(), 2);
        assert_eq!(file.connections.len(), 2);
        let c0 = file.connections[0].normalize().unwrap();
        assert_eq!(c0.src_block, "src0");
        assert!(c0.params.is_empty());
        let c1 = file.connections[1].normalize().unwrap();
        assert_eq!(c1.params.get("buffer_size").map(String::as_str), Some("64"));

        let yaml = flowgraph_to_yaml(&file).unwrap();
        let reparsed = parse_flowgraph(&yaml).unwrap();
        assert_eq!(reparsed.connections.len(), 2);
        assert_eq!(reparsed.metadata.file_format, 2);
    }

    #[test]
    fn tuple_with_wrong_arity_is_invalid() {
        let c = GrcConnection::Tuple(vec![serde_yaml::Value::String("a".into())]);
        assert!(c.normalize().is_err());
    }

    #[test]
    fn yaml_scalars_normalize() {
        assert_eq!(
            yaml_scalar_to_string(&serde_yaml::Value::Bool(true)),
            "True"
        );
        assert_eq!(yaml_scalar_to_string(&serde_yaml::Value::Null), "");
        let n: serde_yaml::Value = serde_yaml::from_str("32000").unwrap();
        assert_eq!(yaml_scalar_to_string(&n), "32000");
    }

    #[test]
    fn json_documents_parse() {
        let text = r#"{"options": {"name": "top", "id": "options"}, "blocks": [], "connections": [], "metadata": {"file_format": 1}}"#;
        let file = parse_flowgraph(text).unwrap();
        assert_eq!(file.options.name, "top");
    }

    #[test]
    fn legacy_xml_sniff_and_convert() {
        let xml = r#"<?xml version='1.0' encoding='utf-8'?>
<flow_graph>
  <block>
    <key>options</key>
    <param><key>id</key><value>top_block</value></param>
    <param><key>title</key><value>Legacy &amp; Old</value></param>
  </block>
  <block>
    <key>null_source</key>
    <param><key>id</key><value>src0</value></param>
  </block>
  <block>
    <key>null_sink</key>
    <param><key>id</key><value>snk0</value></param>
  </block>
  <connection>
    <source_block_id>src0</source_block_id>
    <sink_block_id>snk0</sink_block_id>
    <source_key>0</source_key>
    <sink_key>0</sink_key>
  </connection>
</flow_graph>
"#;
        assert!(sniff_legacy_xml(xml));
        let file = parse_flowgraph(xml).unwrap();
        assert_eq!(file.options.name, "top_block");
        assert_eq!(
            file.options.parameters.get("title"),
            Some(&serde_yaml::Value::String("Legacy & Old".to_string()))
        );
        assert_eq!(file.blocks.len(), 2);
        let c = file.connections[0].normalize().unwrap();
        assert_eq!(
            (c.src_block.as_str(), c.snk_block.as_str()),
            ("src0", "snk0")
        );
    }

    #[test]
    fn non_xml_is_not_sniffed() {
        assert!(!sniff_legacy_xml("options:\n  name: top\n"));
    }
}
