// port.rs — Typed connection points on blocks
//
// A Port belongs to one block, carries a direction, a domain (stream or
// message), a dtype from the fixed type table, a templated vector length
// and a templated multiplicity. Ports with multiplicity N form a clone
// group: the master plus N-1 clones, kept consistent on every rewrite.
//
// Preconditions: expression evaluation needs the flow graph's namespace.
// Postconditions: `rewrite` re-derives vlen/multiplicity/hidden/optional;
//                 clone bookkeeping itself lives on Block.
// Failure modes: bad multiplicity/vlen expressions are recorded, not
//                panicked.
// Side effects: none outside the Port.

use std::fmt;

use crate::eval::{EvalCtx, Value};

// ── Identity ─────────────────────────────────────────────────────────────

/// Stable identifier for a port within its block. Keys are display and
/// persistence artifacts that change on renumbering; the id never does,
/// so connections reference ports by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortDirection {
    Source,
    Sink,
}

impl PortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortDirection::Source => "source",
            PortDirection::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortDomain {
    Stream,
    Message,
}

impl PortDomain {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "stream" => Some(PortDomain::Stream),
            "message" => Some(PortDomain::Message),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortDomain::Stream => "stream",
            PortDomain::Message => "message",
        }
    }
}

// ── Type table ───────────────────────────────────────────────────────────

/// One entry of the fixed stream type table. Size is the per-item byte
/// count; the color is purely for display front-ends.
#[derive(Debug, Clone, Copy)]
pub struct StreamTypeInfo {
    pub name: &'static str,
    pub size: usize,
    pub color: &'static str,
    pub aliases: &'static [&'static str],
}

pub const STREAM_TYPES: &[StreamTypeInfo] = &[
    StreamTypeInfo {
        name: "complex",
        size: 8,
        color: "#3399FF",
        aliases: &["fc32"],
    },
    StreamTypeInfo {
        name: "float",
        size: 4,
        color: "#FF8C69",
        aliases: &["f32"],
    },
    StreamTypeInfo {
        name: "int",
        size: 4,
        color: "#00FF99",
        aliases: &["s32"],
    },
    StreamTypeInfo {
        name: "short",
        size: 2,
        color: "#FFFF66",
        aliases: &["s16"],
    },
    StreamTypeInfo {
        name: "byte",
        size: 1,
        color: "#AC37FF",
        aliases: &["s8"],
    },
    StreamTypeInfo {
        name: "bits",
        size: 1,
        color: "#FF66FF",
        aliases: &[],
    },
    StreamTypeInfo {
        name: "message",
        size: 0,
        color: "#777777",
        aliases: &[],
    },
    StreamTypeInfo {
        name: "bus",
        size: 0,
        color: "#FFFFFF",
        aliases: &[],
    },
];

/// Look up a type by canonical name or alias.
pub fn type_info(name: &str) -> Option<&'static StreamTypeInfo> {
    STREAM_TYPES
        .iter()
        .find(|t| t.name == name || t.aliases.contains(&name))
}

/// Canonical name for a type or alias.
pub fn canonical_dtype(name: &str) -> Option<&'static str> {
    type_info(name).map(|t| t.name)
}

/// True when two dtypes are identical or alias-compatible.
pub fn dtypes_compatible(a: &str, b: &str) -> bool {
    match (canonical_dtype(a), canonical_dtype(b)) {
        (Some(ca), Some(cb)) => ca == cb,
        _ => a == b,
    }
}

// ── Loop error ───────────────────────────────────────────────────────────

/// A cycle encountered while resolving an untyped port through the
/// connection graph (possibly across virtual source/sink pairs).
#[derive(Debug, Clone)]
pub struct LoopError {
    /// Block names visited, in traversal order.
    pub path: Vec<String>,
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loop detected while resolving port type: {}",
            self.path.join(" → ")
        )
    }
}

impl std::error::Error for LoopError {}

// ── Port ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Port {
    pub id: PortId,
    /// Current key: positional digits for stream ports, names for
    /// message ports. Renumbered per-domain on every rewrite.
    pub key: String,
    pub label: String,
    pub direction: PortDirection,
    pub domain: PortDomain,
    /// Declared dtype: a literal type name, a `${param}` reference, or
    /// empty (resolve from connected ports).
    pub dtype_template: String,
    /// Concrete dtype after rewrite; empty while unresolved.
    pub dtype: String,
    pub vlen_template: String,
    pub vlen: usize,
    /// Multiplicity expression; meaningful on the master only.
    pub multiplicity_template: String,
    pub multiplicity: usize,
    pub optional_template: String,
    pub optional: bool,
    pub hidden_template: String,
    pub hidden: bool,
    /// Clone-group key shared by a master and its clones.
    pub base_key: String,
    /// 0 for the master, 1.. for clones.
    pub clone_ordinal: usize,
    /// Hidden because the block side is currently bussified.
    pub bus_folded: bool,
}

impl Port {
    pub fn new(
        id: PortId,
        direction: PortDirection,
        base_key: impl Into<String>,
        dtype: impl Into<String>,
    ) -> Self {
        let base_key = base_key.into();
        let dtype_template = dtype.into();
        Port {
            id,
            key: base_key.clone(),
            label: String::new(),
            direction,
            domain: PortDomain::Stream,
            dtype: if dtype_template.contains("${") {
                String::new()
            } else {
                dtype_template.clone()
            },
            dtype_template,
            vlen_template: String::new(),
            vlen: 1,
            multiplicity_template: String::new(),
            multiplicity: 1,
            optional_template: String::new(),
            optional: false,
            hidden_template: String::new(),
            hidden: false,
            base_key,
            clone_ordinal: 0,
            bus_folded: false,
        }
    }

    pub fn is_master(&self) -> bool {
        self.clone_ordinal == 0
    }

    /// Ports with a digit key are positional and renumbered; named ports
    /// keep a stable key.
    pub fn has_positional_key(&self) -> bool {
        !self.key.is_empty() && self.key.chars().all(|c| c.is_ascii_digit())
    }

    /// Per-item byte size: dtype size × vector length. Zero while the
    /// dtype is unresolved or message-domain.
    pub fn item_size(&self) -> usize {
        type_info(&self.dtype).map(|t| t.size * self.vlen).unwrap_or(0)
    }

    /// Clone this master for ordinal `n`, mirroring dtype/vlen.
    pub fn make_clone(&self, id: PortId, ordinal: usize) -> Port {
        let mut clone = self.clone();
        clone.id = id;
        clone.clone_ordinal = ordinal;
        clone.multiplicity = 1;
        clone
    }

    /// Re-derive the evaluated attributes from their templates.
    /// `subs` maps the owning block's param ids to their raw values —
    /// `${param}` templates resolve there before falling back to the
    /// namespace. Idempotent given a stable namespace. Returns error
    /// strings for attributes that failed to evaluate.
    pub fn rewrite(
        &mut self,
        ctx: &EvalCtx<'_>,
        subs: &std::collections::BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        match eval_usize(&self.vlen_template, 1, ctx, subs) {
            Ok(v) if v >= 1 => self.vlen = v,
            Ok(v) => errors.push(format!("vlen must be positive, got {}", v)),
            Err(e) => errors.push(format!("vlen: {}", e)),
        }

        if self.is_master() {
            match eval_usize(&self.multiplicity_template, 1, ctx, subs) {
                Ok(v) if v >= 1 => self.multiplicity = v,
                Ok(v) => errors.push(format!("multiplicity must be positive, got {}", v)),
                Err(e) => errors.push(format!("multiplicity: {}", e)),
            }
        }

        self.hidden = eval_flag(&self.hidden_template, ctx, subs) || self.bus_folded;
        self.optional = eval_flag(&self.optional_template, ctx, subs);

        // A declared literal dtype wins; `${...}` references were
        // resolved by the owning block before this call.
        if !self.dtype_template.is_empty() && !self.dtype_template.contains("${") {
            self.dtype = self.dtype_template.clone();
        }

        // Message-typed ports flip to the message domain and are keyed
        // by name; the reverse flip restores a positional key.
        if self.dtype == "message" && self.domain == PortDomain::Stream {
            self.domain = PortDomain::Message;
            self.key = self.base_key.clone();
        } else if self.dtype != "message" && self.domain == PortDomain::Message {
            // Only flip back if the port was not declared message-domain.
            if self.dtype_template != "message" {
                self.domain = PortDomain::Stream;
            }
        }

        errors
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.direction.as_str(), self.key)
    }
}

/// Evaluate a templated non-negative integer attribute. Empty templates
/// take the default; `${param}` references resolve through `subs`;
/// digit literals avoid the evaluator entirely.
fn eval_usize(
    template: &str,
    default: usize,
    ctx: &EvalCtx<'_>,
    subs: &std::collections::BTreeMap<String, String>,
) -> Result<usize, String> {
    let t = template.trim();
    let t = crate::param::template_expr(t).unwrap_or(t);
    let t = subs.get(t).map(String::as_str).unwrap_or(t).trim();
    if t.is_empty() {
        return Ok(default);
    }
    if let Ok(v) = t.parse::<usize>() {
        return Ok(v);
    }
    match ctx.eval(t) {
        Ok(v) => v
            .as_int()
            .filter(|i| *i >= 0)
            .map(|i| i as usize)
            .ok_or_else(|| format!("'{}' did not evaluate to a non-negative integer", t)),
        Err(e) => Err(e.message),
    }
}

/// Evaluate a templated boolean attribute; failures read as false.
fn eval_flag(
    template: &str,
    ctx: &EvalCtx<'_>,
    subs: &std::collections::BTreeMap<String, String>,
) -> bool {
    let t = template.trim();
    let t = crate::param::template_expr(t).unwrap_or(t);
    let t = subs.get(t).map(String::as_str).unwrap_or(t).trim();
    match t {
        "" => false,
        "True" | "true" | "1" => true,
        "False" | "false" | "0" => false,
        expr => ctx
            .eval(expr)
            .map(|v: Value| v.truthy())
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{EvalCtx, Namespace, RhaiEvaluator, Value};
    use std::collections::BTreeMap;

    #[test]
    fn type_table_lookup_and_aliases() {
        assert_eq!(type_info("complex").unwrap().size, 8);
        assert_eq!(canonical_dtype("fc32"), Some("complex"));
        assert!(dtypes_compatible("complex", "fc32"));
        assert!(dtypes_compatible("float", "f32"));
        assert!(!dtypes_compatible("float", "int"));
        assert!(type_info("quaternion").is_none());
    }

    #[test]
    fn item_size_scales_with_vlen() {
        let mut p = Port::new(PortId(0), PortDirection::Source, "0", "float");
        assert_eq!(p.item_size(), 4);
        p.vlen = 16;
        assert_eq!(p.item_size(), 64);
    }

    #[test]
    fn rewrite_evaluates_templates() {
        let ev = RhaiEvaluator::new();
        let mut ns = Namespace::new();
        ns.insert("nchan".into(), Value::Int(4));
        let ctx = EvalCtx::new(&ev, &ns);

        let mut p = Port::new(PortId(0), PortDirection::Sink, "0", "complex");
        p.vlen_template = "nchan * 2".into();
        p.multiplicity_template = "nchan".into();
        p.hidden_template = "nchan > 8".into();
        let errors = p.rewrite(&ctx, &BTreeMap::new());
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(p.vlen, 8);
        assert_eq!(p.multiplicity, 4);
        assert!(!p.hidden);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let ev = RhaiEvaluator::new();
        let ns = Namespace::new();
        let ctx = EvalCtx::new(&ev, &ns);
        let mut p = Port::new(PortId(0), PortDirection::Sink, "0", "float");
        p.vlen_template = "2".into();
        p.rewrite(&ctx, &BTreeMap::new());
        let snapshot = (p.vlen, p.multiplicity, p.hidden, p.optional);
        p.rewrite(&ctx, &BTreeMap::new());
        assert_eq!(snapshot, (p.vlen, p.multiplicity, p.hidden, p.optional));
    }

    #[test]
    fn bad_multiplicity_reports_error() {
        let ev = RhaiEvaluator::new();
        let ns = Namespace::new();
        let ctx = EvalCtx::new(&ev, &ns);
        let mut p = Port::new(PortId(0), PortDirection::Source, "0", "float");
        p.multiplicity_template = "0".into();
        let errors = p.rewrite(&ctx, &BTreeMap::new());
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("multiplicity"));
    }

    #[test]
    fn message_dtype_flips_domain_and_key() {
        let ev = RhaiEvaluator::new();
        let ns = Namespace::new();
        let ctx = EvalCtx::new(&ev, &ns);
        let mut p = Port::new(PortId(0), PortDirection::Sink, "in", "message");
        p.key = "0".into();
        p.rewrite(&ctx, &BTreeMap::new());
        assert_eq!(p.domain, PortDomain::Message);
        assert_eq!(p.key, "in");
    }

    #[test]
    fn clone_mirrors_master() {
        let mut master = Port::new(PortId(0), PortDirection::Source, "0", "short");
        master.vlen = 3;
        master.multiplicity = 4;
        let c = master.make_clone(PortId(7), 2);
        assert_eq!(c.dtype, "short");
        assert_eq!(c.vlen, 3);
        assert_eq!(c.clone_ordinal, 2);
        assert_eq!(c.multiplicity, 1);
        assert_eq!(c.base_key, "0");
    }

    #[test]
    fn positional_key_detection() {
        let p = Port::new(PortId(0), PortDirection::Source, "0", "float");
        assert!(p.has_positional_key());
        let p = Port::new(PortId(1), PortDirection::Source, "freq", "message");
        assert!(!p.has_positional_key());
    }

    #[test]
    fn loop_error_display() {
        let e = LoopError {
            path: vec!["v_src0".into(), "v_snk0".into(), "v_src0".into()],
        };
        assert_eq!(
            e.to_string(),
            "loop detected while resolving port type: v_src0 → v_snk0 → v_src0"
        );
    }
}
