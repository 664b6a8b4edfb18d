// block.rs — Flow-graph nodes
//
// A Block owns its params and ports and declares the templates code
// generation renders. Shape is dynamic: multiplicity clones, dtype
// templates, and embedded-source introspection are all re-derived by
// `rewrite()`. State is tri-state (enabled/disabled/bypassed).
//
// Preconditions: rewrite/validate need the namespace built by the owning
//                flow graph.
// Postconditions: after rewrite, every master port has exactly
//                 multiplicity-1 clones and positional keys are
//                 renumbered per-domain.
// Failure modes: evaluation problems surface as diagnostics; introspection
//                failure falls back to the last good shape.
// Side effects: none outside the block.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sha2::{Digest, Sha256};

use crate::diag::{codes, Diagnostic, ElemPath};
use crate::eval::EvalCtx;
use crate::param::{
    template_expr, EnumOption, Hide, OutputLanguage, Param, ParamDtype,
};
use crate::port::{Port, PortDirection, PortDomain, PortId};
use crate::schema::{yaml_scalar_to_string, BlockSchema, ParamSchema, PortSchema};

// ── Identity and state ───────────────────────────────────────────────────

/// Arena index of a block within its flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Enabled,
    Disabled,
    Bypassed,
}

impl BlockState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enabled" | "true" | "True" | "1" => Some(BlockState::Enabled),
            "disabled" | "false" | "False" | "0" => Some(BlockState::Disabled),
            "bypassed" => Some(BlockState::Bypassed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Enabled => "enabled",
            BlockState::Disabled => "disabled",
            BlockState::Bypassed => "bypassed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockFlag {
    Throttle,
    DisableBypass,
    NeedQtGui,
    Deprecated,
    NotDsp,
    ShowId,
    Python,
    Cpp,
}

impl BlockFlag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "throttle" => Some(BlockFlag::Throttle),
            "disable_bypass" => Some(BlockFlag::DisableBypass),
            "need_qt_gui" => Some(BlockFlag::NeedQtGui),
            "deprecated" => Some(BlockFlag::Deprecated),
            "not_dsp" => Some(BlockFlag::NotDsp),
            "show_id" => Some(BlockFlag::ShowId),
            "python" => Some(BlockFlag::Python),
            "cpp" => Some(BlockFlag::Cpp),
            _ => None,
        }
    }
}

/// Built-in structural roles a block can play beyond a plain DSP node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Standard,
    Options,
    Variable,
    Parameter,
    Import,
    VirtualSource,
    VirtualSink,
    PadSource,
    PadSink,
    EpyBlock,
    EpyModule,
    Note,
    Dummy,
}

impl BlockKind {
    /// Kind implied by a block-type key; everything else is Standard.
    pub fn from_key(key: &str) -> Self {
        match key {
            "options" => BlockKind::Options,
            "variable" => BlockKind::Variable,
            "parameter" => BlockKind::Parameter,
            "import" => BlockKind::Import,
            "virtual_source" => BlockKind::VirtualSource,
            "virtual_sink" => BlockKind::VirtualSink,
            "pad_source" => BlockKind::PadSource,
            "pad_sink" => BlockKind::PadSink,
            "epy_block" => BlockKind::EpyBlock,
            "epy_module" => BlockKind::EpyModule,
            "note" => BlockKind::Note,
            _ => BlockKind::Standard,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, BlockKind::VirtualSource | BlockKind::VirtualSink)
    }
}

// ── Templates ────────────────────────────────────────────────────────────

/// Code-generation templates for one output language.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockTemplates {
    pub imports: Vec<String>,
    pub make: String,
    pub var_make: String,
    pub callbacks: Vec<String>,
    pub includes: Vec<String>,
    pub declarations: String,
    pub link: Vec<String>,
    pub packages: Vec<String>,
    pub translations: BTreeMap<String, String>,
}

// ── Embedded-source introspection ────────────────────────────────────────

/// The shape an embedded block derives from its source parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EpyShape {
    /// Constructor keyword arguments: (name, default expression).
    pub params: Vec<(String, String)>,
    pub in_sig: Vec<String>,
    pub out_sig: Vec<String>,
    /// Names with a `set_<name>` method.
    pub callbacks: Vec<String>,
    pub doc: String,
}

/// Introspection state machine: a pure function of (source text,
/// previous state). Failure keeps the last good shape available.
#[derive(Debug, Clone, Default)]
pub enum EpyState {
    #[default]
    Unintrospected,
    Introspected {
        source_hash: [u8; 32],
        shape: EpyShape,
    },
    Failed {
        source_hash: [u8; 32],
        last_good: Option<EpyShape>,
        error: String,
    },
}

impl EpyState {
    pub fn last_good_shape(&self) -> Option<&EpyShape> {
        match self {
            EpyState::Introspected { shape, .. } => Some(shape),
            EpyState::Failed { last_good, .. } => last_good.as_ref(),
            EpyState::Unintrospected => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            EpyState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

fn hash_source(src: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(src.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Extract balanced delimiter content. Returns index of the closing
/// delimiter.
fn extract_balanced(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    if start >= bytes.len() || bytes[start] != open {
        return None;
    }
    let mut depth = 0;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == open {
            depth += 1;
        } else if bytes[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Split by commas at the top level (respecting nested `()`/`[]`).
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, &b) in s.as_bytes().iter().enumerate() {
        match b {
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn map_numpy_dtype(s: &str) -> Option<&'static str> {
    match s.trim() {
        "np.complex64" | "numpy.complex64" | "complex" => Some("complex"),
        "np.float32" | "numpy.float32" | "float" => Some("float"),
        "np.int32" | "numpy.int32" | "int" => Some("int"),
        "np.int16" | "numpy.int16" => Some("short"),
        "np.int8" | "numpy.int8" | "np.uint8" | "numpy.uint8" => Some("byte"),
        _ => None,
    }
}

/// Scan a signature list `in_sig=[np.float32, ...]` after `needle`.
fn scan_signature(src: &str, needle: &str) -> Result<Vec<String>, String> {
    let pos = match src.find(needle) {
        Some(p) => p,
        None => return Ok(Vec::new()),
    };
    let after = &src[pos + needle.len()..];
    let eq = after
        .find('=')
        .ok_or_else(|| format!("{} has no value", needle))?;
    let rest = after[eq + 1..].trim_start();
    if rest.starts_with("None") {
        return Ok(Vec::new());
    }
    let bytes = rest.as_bytes();
    if bytes.first() != Some(&b'[') {
        return Err(format!("{} is not a list", needle));
    }
    let end = extract_balanced(bytes, 0, b'[', b']')
        .ok_or_else(|| format!("unbalanced brackets in {}", needle))?;
    let inner = &rest[1..end];
    let mut out = Vec::new();
    for item in split_top_level_commas(inner) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let dtype = map_numpy_dtype(item)
            .ok_or_else(|| format!("unsupported {} entry '{}'", needle, item))?;
        out.push(dtype.to_string());
    }
    Ok(out)
}

/// Text-level introspection of an embedded block's source. Extracts the
/// constructor keyword arguments, the port signatures, the docstring and
/// the `set_*` callback names.
pub fn introspect_epy_source(src: &str) -> Result<EpyShape, String> {
    if src.trim().is_empty() {
        return Err("empty source".to_string());
    }
    if !src.contains("class ") {
        return Err("no class definition found".to_string());
    }

    let mut shape = EpyShape::default();

    // Constructor keyword arguments.
    if let Some(pos) = src.find("def __init__") {
        let bytes = src.as_bytes();
        let paren = src[pos..]
            .find('(')
            .map(|o| pos + o)
            .ok_or("malformed __init__")?;
        let close = extract_balanced(bytes, paren, b'(', b')')
            .ok_or("unbalanced parentheses in __init__")?;
        let inner = &src[paren + 1..close];
        for (i, arg) in split_top_level_commas(inner).iter().enumerate() {
            let arg = arg.trim();
            if i == 0 {
                if arg != "self" {
                    return Err("__init__ does not take self first".to_string());
                }
                continue;
            }
            if arg.is_empty() || arg.starts_with('*') {
                continue;
            }
            match arg.split_once('=') {
                Some((name, default)) => shape
                    .params
                    .push((name.trim().to_string(), default.trim().to_string())),
                None => shape.params.push((arg.to_string(), String::new())),
            }
        }
    }

    shape.in_sig = scan_signature(src, "in_sig")?;
    shape.out_sig = scan_signature(src, "out_sig")?;

    // Docstring: first triple-quoted string.
    if let Some(start) = src.find("\"\"\"") {
        if let Some(len) = src[start + 3..].find("\"\"\"") {
            shape.doc = src[start + 3..start + 3 + len].trim().to_string();
        }
    }

    // Settable callbacks: `def set_<name>(`.
    let mut pos = 0;
    while let Some(found) = src[pos..].find("def set_") {
        let name_start = pos + found + "def set_".len();
        let name: String = src[name_start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() && src[name_start + name.len()..].starts_with('(') {
            shape.callbacks.push(name);
        }
        pos = name_start;
    }

    Ok(shape)
}

// ── Block ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// Block-type key, unique within the platform.
    pub key: String,
    /// Instance name; mirrors the `id` param.
    pub name: String,
    pub kind: BlockKind,
    pub label: String,
    pub category: String,
    pub flags: BTreeSet<BlockFlag>,
    pub documentation: String,
    pub asserts: Vec<String>,
    pub templates: BlockTemplates,
    pub cpp_templates: BlockTemplates,
    pub params: Vec<Param>,
    pub sinks: Vec<Port>,
    pub sources: Vec<Port>,
    pub state: BlockState,
    pub bus_sink: bool,
    pub bus_source: bool,
    pub epy: EpyState,
    next_port_id: u32,
}

/// Ports removed by a rewrite; the flow graph disconnects them.
#[derive(Debug, Default)]
pub struct BlockRewriteResult {
    pub removed_ports: Vec<PortId>,
    pub errors: Vec<Diagnostic>,
}

impl Block {
    pub fn from_schema(id: BlockId, schema: &BlockSchema) -> Block {
        let kind = BlockKind::from_key(&schema.id);
        let mut flags: BTreeSet<BlockFlag> = schema
            .flags
            .iter()
            .filter_map(|f| BlockFlag::parse(f))
            .collect();
        if !matches!(kind, BlockKind::Standard) {
            flags.insert(BlockFlag::NotDsp);
        }

        let mut block = Block {
            id,
            key: schema.id.clone(),
            name: String::new(),
            kind,
            label: if schema.label.is_empty() {
                schema.id.clone()
            } else {
                schema.label.clone()
            },
            category: schema.category.clone(),
            flags,
            documentation: schema.documentation.clone(),
            asserts: schema.asserts.clone(),
            templates: BlockTemplates {
                imports: lines_of(&schema.templates.imports),
                make: schema.templates.make.clone(),
                var_make: schema.templates.var_make.clone(),
                callbacks: schema.templates.callbacks.clone(),
                ..Default::default()
            },
            cpp_templates: BlockTemplates {
                includes: schema.cpp_templates.includes.clone(),
                make: schema.cpp_templates.make.clone(),
                declarations: schema.cpp_templates.declarations.clone(),
                callbacks: schema.cpp_templates.callbacks.clone(),
                link: schema.cpp_templates.link.clone(),
                packages: schema.cpp_templates.packages.clone(),
                translations: schema.cpp_templates.translations.clone(),
                ..Default::default()
            },
            params: Vec::new(),
            sinks: Vec::new(),
            sources: Vec::new(),
            state: BlockState::Enabled,
            bus_sink: false,
            bus_source: false,
            epy: EpyState::Unintrospected,
            next_port_id: 0,
        };

        // The factory-provided id param always comes first.
        block
            .params
            .push(Param::new("id", "ID", ParamDtype::Id).with_hide("part"));
        for ps in &schema.parameters {
            block.params.push(param_from_schema(ps));
        }
        block.add_factory_params();

        for (i, ps) in schema.inputs.iter().enumerate() {
            let port = block.port_from_schema(ps, PortDirection::Sink, i);
            block.sinks.push(port);
        }
        for (i, ps) in schema.outputs.iter().enumerate() {
            let port = block.port_from_schema(ps, PortDirection::Source, i);
            block.sources.push(port);
        }

        block
    }

    /// Placeholder for an unknown block type: carries the raw parameter
    /// bag, always fails validation.
    pub fn make_dummy(id: BlockId, key: &str, params: &BTreeMap<String, String>) -> Block {
        let mut block = Block {
            id,
            key: key.to_string(),
            name: String::new(),
            kind: BlockKind::Dummy,
            label: format!("Missing Block ({})", key),
            category: String::new(),
            flags: BTreeSet::from([BlockFlag::NotDsp]),
            documentation: String::new(),
            asserts: Vec::new(),
            templates: BlockTemplates::default(),
            cpp_templates: BlockTemplates::default(),
            params: Vec::new(),
            sinks: Vec::new(),
            sources: Vec::new(),
            state: BlockState::Enabled,
            bus_sink: false,
            bus_source: false,
            epy: EpyState::Unintrospected,
            next_port_id: 0,
        };
        block
            .params
            .push(Param::new("id", "ID", ParamDtype::Id).with_hide("part"));
        for (k, v) in params {
            if k == "id" {
                continue;
            }
            let mut p = Param::new(k.clone(), k.clone(), ParamDtype::Raw);
            p.set_value(v.clone());
            block.params.push(p);
        }
        block
    }

    fn add_factory_params(&mut self) {
        // Standard params every block carries; DSP-only extras are
        // skipped for structural blocks.
        if !self.flags.contains(&BlockFlag::NotDsp) {
            self.params
                .push(Param::new("alias", "Block Alias", ParamDtype::String).with_hide("part"));
            self.params
                .push(Param::new("affinity", "Core Affinity", ParamDtype::Raw).with_hide("part"));
            self.params.push(
                Param::new("minoutbuf", "Min Output Buffer", ParamDtype::Int)
                    .with_default("0")
                    .with_hide("part"),
            );
            self.params.push(
                Param::new("maxoutbuf", "Max Output Buffer", ParamDtype::Int)
                    .with_default("0")
                    .with_hide("part"),
            );
        }
        self.params
            .push(Param::new("comment", "Comment", ParamDtype::Multiline).with_hide("part"));
    }

    fn port_from_schema(&mut self, ps: &PortSchema, direction: PortDirection, index: usize) -> Port {
        let base_key = if ps.id.is_empty() {
            index.to_string()
        } else {
            ps.id.clone()
        };
        let pid = self.alloc_port_id();
        let mut port = Port::new(pid, direction, base_key, ps.dtype.clone());
        port.label = ps.label.clone();
        if let Some(domain) = PortDomain::parse(&ps.domain) {
            port.domain = domain;
        }
        port.vlen_template = ps.vlen.clone();
        port.multiplicity_template = ps.multiplicity.clone();
        port.optional_template = ps.optional.clone();
        port.hidden_template = ps.hide.clone();
        port
    }

    pub fn alloc_port_id(&mut self) -> PortId {
        let id = PortId(self.next_port_id);
        self.next_port_id += 1;
        id
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn ports(&self, direction: PortDirection) -> &[Port] {
        match direction {
            PortDirection::Sink => &self.sinks,
            PortDirection::Source => &self.sources,
        }
    }

    pub fn ports_mut(&mut self, direction: PortDirection) -> &mut Vec<Port> {
        match direction {
            PortDirection::Sink => &mut self.sinks,
            PortDirection::Source => &mut self.sources,
        }
    }

    pub fn port_by_id(&self, direction: PortDirection, id: PortId) -> Option<&Port> {
        self.ports(direction).iter().find(|p| p.id == id)
    }

    pub fn port_by_id_mut(&mut self, direction: PortDirection, id: PortId) -> Option<&mut Port> {
        self.ports_mut(direction).iter_mut().find(|p| p.id == id)
    }

    /// Find a port by its current key, or by name for message ports.
    pub fn port_by_key(&self, direction: PortDirection, key: &str) -> Option<&Port> {
        self.ports(direction).iter().find(|p| p.key == key)
    }

    /// Any-direction lookup by id (connections know the direction from
    /// their endpoint role, but diagnostics sometimes do not).
    pub fn port_any(&self, id: PortId) -> Option<&Port> {
        self.sinks
            .iter()
            .chain(self.sources.iter())
            .find(|p| p.id == id)
    }

    pub fn param(&self, id: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.id == id)
    }

    pub fn param_mut(&mut self, id: &str) -> Option<&mut Param> {
        self.params.iter_mut().find(|p| p.id == id)
    }

    pub fn param_value(&self, id: &str) -> Option<&str> {
        self.param(id).map(|p| p.value.as_str())
    }

    pub fn set_param_value(&mut self, id: &str, value: impl Into<String>) {
        let value = value.into();
        if id == "id" {
            self.name = value.clone();
        }
        if let Some(p) = self.param_mut(id) {
            p.set_value(value);
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if let Some(p) = self.param_mut("id") {
            p.set_value(name.clone());
        }
        self.name = name;
    }

    // ── State ───────────────────────────────────────────────────────

    /// Enabled in the wider sense: participates in validation and
    /// codegen (bypassed blocks still route connections).
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, BlockState::Disabled)
    }

    pub fn is_bypassed(&self) -> bool {
        matches!(self.state, BlockState::Bypassed)
    }

    /// Check bypass eligibility: one enabled sink, one enabled source,
    /// identical dtype, and no disable_bypass flag.
    pub fn can_bypass(&self) -> Result<(), String> {
        if self.flags.contains(&BlockFlag::DisableBypass) {
            return Err("block disallows bypass".to_string());
        }
        let sinks: Vec<&Port> = self.sinks.iter().filter(|p| !p.hidden).collect();
        let sources: Vec<&Port> = self.sources.iter().filter(|p| !p.hidden).collect();
        if sinks.len() != 1 || sources.len() != 1 {
            return Err(format!(
                "bypass needs exactly one sink and one source, found {} and {}",
                sinks.len(),
                sources.len()
            ));
        }
        if !crate::port::dtypes_compatible(&sinks[0].dtype, &sources[0].dtype) {
            return Err(format!(
                "bypass needs matching port types, found {} and {}",
                sinks[0].dtype, sources[0].dtype
            ));
        }
        Ok(())
    }

    /// Enter the bypassed state; a no-op returning false when the block
    /// is not eligible.
    pub fn set_bypassed(&mut self) -> bool {
        match self.can_bypass() {
            Ok(()) => {
                self.state = BlockState::Bypassed;
                true
            }
            Err(_) => false,
        }
    }

    // ── Rewrite ─────────────────────────────────────────────────────

    /// Re-derive the block's dynamic shape. Steps: embedded-source
    /// introspection, dtype template resolution, per-port attribute
    /// evaluation, clone management, positional re-keying.
    pub fn rewrite(&mut self, ctx: &EvalCtx<'_>) -> BlockRewriteResult {
        let mut result = BlockRewriteResult::default();

        if self.kind == BlockKind::EpyBlock {
            self.rewrite_epy(&mut result);
        }

        self.resolve_dtype_templates();

        // Port templates resolve `${param}` against this block's params
        // before touching the shared namespace.
        let param_subs: BTreeMap<String, String> = self
            .params
            .iter()
            .map(|p| (p.id.clone(), p.value.trim().to_string()))
            .collect();

        for direction in [PortDirection::Sink, PortDirection::Source] {
            let name = self.name.clone();
            for port in self.ports_mut(direction) {
                for err in port.rewrite(ctx, &param_subs) {
                    result.errors.push(
                        Diagnostic::error(
                            ElemPath::port(name.clone(), direction.as_str(), port.key.clone()),
                            err,
                        )
                        .with_code(codes::E0303),
                    );
                }
            }
            let removed = self.rewrite_clones(direction);
            result.removed_ports.extend(removed);
        }

        self.renumber_keys();
        result
    }

    /// Replace `${param}` dtype templates with the referenced param's
    /// current value.
    fn resolve_dtype_templates(&mut self) {
        let values: BTreeMap<String, String> = self
            .params
            .iter()
            .map(|p| (p.id.clone(), p.value.trim().to_string()))
            .collect();
        for port in self.sinks.iter_mut().chain(self.sources.iter_mut()) {
            if let Some(expr) = template_expr(&port.dtype_template) {
                if let Some(v) = values.get(expr) {
                    port.dtype = v.clone();
                }
            }
        }
    }

    /// Ensure each master has exactly multiplicity-1 clones, inserted
    /// immediately after it. Returns the ids of removed ports.
    fn rewrite_clones(&mut self, direction: PortDirection) -> Vec<PortId> {
        let old = std::mem::take(self.ports_mut(direction));
        let mut masters: Vec<Port> = Vec::new();
        let mut clone_groups: BTreeMap<String, Vec<Port>> = BTreeMap::new();
        for p in old {
            if p.is_master() {
                masters.push(p);
            } else {
                clone_groups.entry(p.base_key.clone()).or_default().push(p);
            }
        }

        let mut removed = Vec::new();
        let mut rebuilt: Vec<Port> = Vec::new();

        for master in masters {
            let n = master.multiplicity.max(1);
            let mut group = clone_groups.remove(&master.base_key).unwrap_or_default();
            group.sort_by_key(|c| c.clone_ordinal);
            let template = master.clone();
            rebuilt.push(master);
            let mut reuse = group.into_iter();
            for ordinal in 1..n {
                match reuse.next() {
                    Some(mut clone) => {
                        clone.clone_ordinal = ordinal;
                        clone.dtype = template.dtype.clone();
                        clone.vlen = template.vlen;
                        clone.domain = template.domain;
                        clone.hidden = template.hidden;
                        clone.optional = template.optional;
                        rebuilt.push(clone);
                    }
                    None => {
                        // Port ids come from the shared allocator; the
                        // placeholder id is patched below, after the
                        // ports vec borrow ends.
                        let placeholder = template.make_clone(PortId(u32::MAX), ordinal);
                        rebuilt.push(placeholder);
                    }
                }
            }
            removed.extend(reuse.map(|c| c.id));
        }

        // Orphan clones whose master vanished.
        for (_, group) in clone_groups {
            removed.extend(group.into_iter().map(|c| c.id));
        }

        // Allocate real ids for newly created clones.
        for port in rebuilt.iter_mut() {
            if port.id == PortId(u32::MAX) {
                port.id = PortId(self.next_port_id);
                self.next_port_id += 1;
            }
        }

        *self.ports_mut(direction) = rebuilt;
        removed
    }

    /// Positional (digit-keyed) ports are renumbered `"0","1",...` per
    /// domain; named ports get ordinal-suffixed keys for clones.
    fn renumber_keys(&mut self) {
        for direction in [PortDirection::Sink, PortDirection::Source] {
            let mut stream_counter = 0usize;
            let mut bus_counter = 0usize;
            for port in self.ports_mut(direction) {
                let positional = port.base_key.chars().all(|c| c.is_ascii_digit());
                if port.dtype == "bus" {
                    port.key = format!("bus{}", bus_counter);
                    bus_counter += 1;
                } else if port.domain == PortDomain::Stream && positional {
                    port.key = stream_counter.to_string();
                    stream_counter += 1;
                } else if port.clone_ordinal > 0 {
                    port.key = format!("{}{}", port.base_key, port.clone_ordinal);
                } else {
                    port.key = port.base_key.clone();
                }
            }
        }
    }

    fn rewrite_epy(&mut self, result: &mut BlockRewriteResult) {
        let src = self
            .param_value("_source_code")
            .unwrap_or_default()
            .to_string();
        let hash = hash_source(&src);
        if let EpyState::Introspected { source_hash, .. } = &self.epy {
            if *source_hash == hash {
                return;
            }
        }
        match introspect_epy_source(&src) {
            Ok(shape) => {
                let removed = self.apply_epy_shape(&shape);
                result.removed_ports.extend(removed);
                self.epy = EpyState::Introspected {
                    source_hash: hash,
                    shape,
                };
            }
            Err(error) => {
                let last_good = self.epy.last_good_shape().cloned();
                if let Some(shape) = &last_good {
                    let removed = self.apply_epy_shape(shape);
                    result.removed_ports.extend(removed);
                }
                self.epy = EpyState::Failed {
                    source_hash: hash,
                    last_good,
                    error,
                };
            }
        }
    }

    /// Regenerate params/ports from an introspected shape, preserving
    /// existing param values and reusing ports positionally so live
    /// connections survive compatible edits.
    fn apply_epy_shape(&mut self, shape: &EpyShape) -> Vec<PortId> {
        self.documentation = shape.doc.clone();

        // Params: id and _source_code are structural, everything else
        // follows the shape.
        let mut kept: Vec<Param> = Vec::new();
        for p in self.params.drain(..) {
            if p.id == "id" || p.id == "_source_code" || p.id == "comment" {
                kept.push(p);
            } else if let Some((_, default)) = shape.params.iter().find(|(n, _)| *n == p.id) {
                let mut keep = p;
                keep.default = default.clone();
                kept.push(keep);
            }
        }
        for (name, default) in &shape.params {
            if !kept.iter().any(|p| p.id == *name) {
                // Insert before the trailing comment param.
                let insert_at = kept.len().saturating_sub(1);
                kept.insert(
                    insert_at,
                    Param::new(name.clone(), name.clone(), ParamDtype::Raw)
                        .with_default(default.clone()),
                );
            }
        }
        self.params = kept;

        self.templates.callbacks = shape
            .callbacks
            .iter()
            .map(|n| format!("set_{}(${{{}}})", n, n))
            .collect();

        let mut removed = Vec::new();
        removed.extend(self.resize_epy_ports(PortDirection::Sink, &shape.in_sig));
        removed.extend(self.resize_epy_ports(PortDirection::Source, &shape.out_sig));
        removed
    }

    fn resize_epy_ports(&mut self, direction: PortDirection, sig: &[String]) -> Vec<PortId> {
        let mut removed = Vec::new();
        let have = self.ports(direction).len();
        for (i, dtype) in sig.iter().enumerate() {
            if i < have {
                let port = &mut self.ports_mut(direction)[i];
                port.dtype = dtype.clone();
                port.dtype_template = dtype.clone();
            } else {
                let pid = self.alloc_port_id();
                let port = Port::new(pid, direction, i.to_string(), dtype.clone());
                self.ports_mut(direction).push(port);
            }
        }
        while self.ports(direction).len() > sig.len() {
            let port = self.ports_mut(direction).pop().expect("len checked");
            removed.push(port.id);
        }
        removed
    }

    // ── Bus aggregation ─────────────────────────────────────────────

    pub fn is_bussified(&self, direction: PortDirection) -> bool {
        match direction {
            PortDirection::Sink => self.bus_sink,
            PortDirection::Source => self.bus_source,
        }
    }

    /// The bus partition: an explicit `bus_structure` param if present,
    /// otherwise contiguous clone groups.
    pub fn bus_structure(&self, direction: PortDirection) -> Vec<Vec<usize>> {
        let real: Vec<(usize, &Port)> = self
            .ports(direction)
            .iter()
            .enumerate()
            .filter(|(_, p)| p.dtype != "bus")
            .collect();

        if let Some(p) = self.param(&format!("bus_structure_{}", direction.as_str())) {
            if let Some(v) = p.cached() {
                if let crate::eval::Value::List(groups) = v {
                    let mut out = Vec::new();
                    for g in groups {
                        if let crate::eval::Value::List(items) = g {
                            out.push(
                                items.iter().filter_map(|i| i.as_int()).map(|i| i as usize).collect(),
                            );
                        }
                    }
                    if !out.is_empty() {
                        return out;
                    }
                }
            }
        }

        // Auto-partition: one bus per clone group.
        let mut out: Vec<Vec<usize>> = Vec::new();
        let mut current_base: Option<&str> = None;
        for (pos, (_, port)) in real.iter().enumerate() {
            if current_base == Some(port.base_key.as_str()) && port.clone_ordinal > 0 {
                out.last_mut().expect("group started").push(pos);
            } else {
                current_base = Some(port.base_key.as_str());
                out.push(vec![pos]);
            }
        }
        out
    }

    /// Toggle bus aggregation on one side: hide the real ports behind
    /// synthetic bus ports, or restore them. Returns removed port ids.
    pub fn set_bussified(&mut self, direction: PortDirection, on: bool) -> Vec<PortId> {
        if self.is_bussified(direction) == on {
            return Vec::new();
        }
        let mut removed = Vec::new();
        if on {
            let structure = self.bus_structure(direction);
            for port in self.ports_mut(direction).iter_mut() {
                port.bus_folded = true;
                port.hidden = true;
            }
            for (i, _group) in structure.iter().enumerate() {
                let pid = self.alloc_port_id();
                let mut bus = Port::new(pid, direction, format!("bus{}", i), "bus");
                bus.key = format!("bus{}", i);
                self.ports_mut(direction).push(bus);
            }
        } else {
            let ports = self.ports_mut(direction);
            let mut kept = Vec::new();
            for mut p in ports.drain(..) {
                if p.dtype == "bus" {
                    removed.push(p.id);
                } else {
                    p.bus_folded = false;
                    p.hidden = false;
                    kept.push(p);
                }
            }
            *ports = kept;
        }
        match direction {
            PortDirection::Sink => self.bus_sink = on,
            PortDirection::Source => self.bus_source = on,
        }
        removed
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Block-local validation: params, asserts, mode/language
    /// compatibility. Graph-level checks (uniqueness, connectivity)
    /// live on the flow graph.
    pub fn validate(&mut self, ctx: &EvalCtx<'_>, gen: &GenerateContext) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let path = ElemPath::block(self.name.clone());

        if self.kind == BlockKind::Dummy {
            diags.push(
                Diagnostic::error(path.clone(), format!("block id '{}' not found", self.key))
                    .with_code(codes::E0100),
            );
            return diags;
        }

        if self.flags.contains(&BlockFlag::Deprecated) {
            diags.push(
                Diagnostic::warning(path.clone(), "block type is deprecated")
                    .with_code(codes::W0100),
            );
        }

        if gen.language == OutputLanguage::Cpp
            && self.kind == BlockKind::Standard
            && !self.flags.contains(&BlockFlag::Cpp)
        {
            diags.push(
                Diagnostic::error(path.clone(), "block does not support C++ output")
                    .with_code(codes::E0401),
            );
        }

        if self.flags.contains(&BlockFlag::NeedQtGui) && !gen.gui_mode {
            diags.push(
                Diagnostic::error(
                    path.clone(),
                    "GUI block used in a flow graph generated without a GUI",
                )
                .with_code(codes::E0402),
            );
        }

        // Param evaluation; import failures downgrade to warnings.
        let name = self.name.clone();
        for param in &mut self.params {
            let hide = param.hide_state(ctx);
            if hide == Hide::All && param.dtype != ParamDtype::Id {
                continue;
            }
            if let Err(e) = param.evaluate(ctx) {
                let ppath = ElemPath::param(name.clone(), param.id.clone());
                if param.dtype == ParamDtype::Import {
                    diags.push(
                        Diagnostic::warning(ppath, e.message).with_code(codes::W0200),
                    );
                } else {
                    diags.push(Diagnostic::error(ppath, e.message).with_code(codes::E0200));
                }
            }
        }

        // Declared assertions: each must evaluate truthy.
        for assertion in &self.asserts {
            let expr = template_expr(assertion).unwrap_or(assertion.as_str());
            match ctx.eval(expr) {
                Ok(v) if v.truthy() => {}
                Ok(_) => diags.push(
                    Diagnostic::error(path.clone(), format!("assertion failed: {}", assertion))
                        .with_code(codes::E0400),
                ),
                Err(e) => diags.push(
                    Diagnostic::error(
                        path.clone(),
                        format!("assertion could not be evaluated: {}", e.message),
                    )
                    .with_code(codes::E0400),
                ),
            }
        }

        if let Some(error) = self.epy.error() {
            diags.push(
                Diagnostic::error(path, format!("introspection failed: {}", error))
                    .with_code(codes::E0501),
            );
        }

        diags
    }

    /// Synthesize a missing port key (dummy blocks only) so persisted
    /// connections survive a missing block type.
    pub fn add_missing_port(&mut self, direction: PortDirection, key: &str) -> PortId {
        let pid = self.alloc_port_id();
        let mut port = Port::new(pid, direction, key.to_string(), "");
        port.key = key.to_string();
        self.ports_mut(direction).push(port);
        pid
    }
}

/// Generate-mode facts blocks validate against.
#[derive(Debug, Clone, Copy)]
pub struct GenerateContext {
    pub language: OutputLanguage,
    pub gui_mode: bool,
}

impl Default for GenerateContext {
    fn default() -> Self {
        GenerateContext {
            language: OutputLanguage::Python,
            gui_mode: false,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.key)
    }
}

fn lines_of(s: &str) -> Vec<String> {
    s.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn param_from_schema(ps: &ParamSchema) -> Param {
    let dtype = ParamDtype::parse(&ps.dtype).unwrap_or(ParamDtype::Raw);
    let mut options = Vec::new();
    for (i, value) in ps.options.iter().enumerate() {
        let value = yaml_scalar_to_string(value);
        let label = ps.option_labels.get(i).cloned().unwrap_or_else(|| value.clone());
        let mut attributes = BTreeMap::new();
        for (attr, column) in &ps.option_attributes {
            if let Some(cell) = column.get(i) {
                attributes.insert(attr.clone(), yaml_scalar_to_string(cell));
            }
        }
        options.push(EnumOption {
            value,
            label,
            attributes,
        });
    }

    let mut param = Param::new(ps.id.clone(), ps.label.clone(), dtype)
        .with_options(options)
        .with_hide(ps.hide.clone());
    if let Some(default) = &ps.default {
        param = param.with_default(yaml_scalar_to_string(default));
    } else if dtype == ParamDtype::Enum {
        // Enum params default to their first option.
        if let Some(first) = param.options.first() {
            let v = first.value.clone();
            param = param.with_default(v);
        }
    }
    param.category = ps.category.clone();
    param
}
