// param.rs — Block parameter model and evaluation
//
// A Param is a single typed configuration value on a block. Its raw value
// is an expression evaluated against the flow graph's namespace; the
// semantic type is fixed by `ParamDtype`. Evaluation memoizes the
// `stringify`/`listify` flags that code generation later consults through
// `to_code()`.
//
// Preconditions: evaluation requires a namespace built by the owning
//                flow graph's rewrite pass.
// Postconditions: `evaluate` caches the result until the next rewrite.
// Failure modes: type mismatches and evaluation errors are returned, not
//                panicked; callers convert them into diagnostics.
// Side effects: none outside the Param itself.

use std::collections::BTreeMap;
use std::fmt;

use crate::eval::{EvalCtx, EvalError, Value};

// ── Output language ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLanguage {
    Python,
    Cpp,
}

impl OutputLanguage {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "python" => Some(OutputLanguage::Python),
            "cpp" => Some(OutputLanguage::Cpp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputLanguage::Python => "python",
            OutputLanguage::Cpp => "cpp",
        }
    }
}

// ── Parameter dtype ──────────────────────────────────────────────────────

/// Closed enumeration of parameter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDtype {
    Raw,
    Enum,
    Int,
    Real,
    Complex,
    Hex,
    Bool,
    IntVector,
    RealVector,
    ComplexVector,
    String,
    FileOpen,
    FileSave,
    Multiline,
    MultilinePythonExternal,
    Id,
    StreamId,
    GridPos,
    GuiHint,
    Import,
    BusStructure,
}

impl ParamDtype {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(ParamDtype::Raw),
            "enum" => Some(ParamDtype::Enum),
            "int" | "short" | "byte" => Some(ParamDtype::Int),
            "real" | "float" => Some(ParamDtype::Real),
            "complex" => Some(ParamDtype::Complex),
            "hex" => Some(ParamDtype::Hex),
            "bool" => Some(ParamDtype::Bool),
            "int_vector" => Some(ParamDtype::IntVector),
            "real_vector" | "float_vector" => Some(ParamDtype::RealVector),
            "complex_vector" => Some(ParamDtype::ComplexVector),
            "string" => Some(ParamDtype::String),
            "file_open" => Some(ParamDtype::FileOpen),
            "file_save" => Some(ParamDtype::FileSave),
            "_multiline" => Some(ParamDtype::Multiline),
            "_multiline_python_external" => Some(ParamDtype::MultilinePythonExternal),
            "id" | "name" => Some(ParamDtype::Id),
            "stream_id" => Some(ParamDtype::StreamId),
            "grid_pos" => Some(ParamDtype::GridPos),
            "gui_hint" => Some(ParamDtype::GuiHint),
            "import" => Some(ParamDtype::Import),
            "bus_structure" => Some(ParamDtype::BusStructure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamDtype::Raw => "raw",
            ParamDtype::Enum => "enum",
            ParamDtype::Int => "int",
            ParamDtype::Real => "real",
            ParamDtype::Complex => "complex",
            ParamDtype::Hex => "hex",
            ParamDtype::Bool => "bool",
            ParamDtype::IntVector => "int_vector",
            ParamDtype::RealVector => "real_vector",
            ParamDtype::ComplexVector => "complex_vector",
            ParamDtype::String => "string",
            ParamDtype::FileOpen => "file_open",
            ParamDtype::FileSave => "file_save",
            ParamDtype::Multiline => "_multiline",
            ParamDtype::MultilinePythonExternal => "_multiline_python_external",
            ParamDtype::Id => "id",
            ParamDtype::StreamId => "stream_id",
            ParamDtype::GridPos => "grid_pos",
            ParamDtype::GuiHint => "gui_hint",
            ParamDtype::Import => "import",
            ParamDtype::BusStructure => "bus_structure",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(
            self,
            ParamDtype::IntVector | ParamDtype::RealVector | ParamDtype::ComplexVector
        )
    }

    pub fn is_stringlike(&self) -> bool {
        matches!(
            self,
            ParamDtype::String
                | ParamDtype::FileOpen
                | ParamDtype::FileSave
                | ParamDtype::Multiline
                | ParamDtype::MultilinePythonExternal
        )
    }
}

// ── Hide policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hide {
    #[default]
    None,
    Part,
    All,
}

impl Hide {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "none" => Some(Hide::None),
            "part" => Some(Hide::Part),
            "all" => Some(Hide::All),
            _ => None,
        }
    }
}

// ── Enum options ─────────────────────────────────────────────────────────

/// One choice of an enum-constrained parameter, with its `opt` attribute
/// sub-map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnumOption {
    pub value: String,
    pub label: String,
    pub attributes: BTreeMap<String, String>,
}

// ── Identifier rules ─────────────────────────────────────────────────────

/// Names an id-typed param may never take: they would shadow identifiers
/// the generated program depends on.
pub const RESERVED_IDS: &[&str] = &[
    "self", "options", "gr", "blocks", "firdes", "import", "def", "class", "return", "lambda",
    "in", "if", "else", "elif", "for", "while", "not", "and", "or", "None", "True", "False",
    "print", "int", "float", "complex", "str", "bool", "len", "list", "tuple", "dict", "set",
];

pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ── Grid positions ───────────────────────────────────────────────────────

/// A parsed `grid_pos`/`gui_hint` cell claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPos {
    /// Optional `container@index` prefix of a gui_hint.
    pub container: Option<String>,
    pub row: i64,
    pub col: i64,
    pub row_span: i64,
    pub col_span: i64,
}

impl GridPos {
    /// Every (row, col) cell this claim covers within its container.
    pub fn cells(&self) -> Vec<(String, i64, i64)> {
        let container = self.container.clone().unwrap_or_default();
        let mut out = Vec::new();
        for r in self.row..self.row + self.row_span {
            for c in self.col..self.col + self.col_span {
                out.push((container.clone(), r, c));
            }
        }
        out
    }
}

/// Parse `row,col[,row_span,col_span]` with an optional `container:`
/// prefix (gui_hint syntax). Row/col must be non-negative, spans positive.
pub fn parse_grid_pos(raw: &str) -> Result<Option<GridPos>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let (container, rest) = match trimmed.split_once(':') {
        Some((prefix, rest)) => (Some(prefix.trim().to_string()), rest),
        None => (None, trimmed),
    };
    let parts: Vec<&str> = rest
        .trim_matches(|c| c == '[' || c == ']' || c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .collect();
    if parts.len() != 2 && parts.len() != 4 {
        return Err(format!(
            "expected 2 or 4 comma-separated integers, found {}",
            parts.len()
        ));
    }
    let mut nums = Vec::with_capacity(4);
    for p in &parts {
        let n: i64 = p
            .parse()
            .map_err(|_| format!("'{}' is not an integer", p))?;
        nums.push(n);
    }
    let (row, col) = (nums[0], nums[1]);
    let (row_span, col_span) = if nums.len() == 4 {
        (nums[2], nums[3])
    } else {
        (1, 1)
    };
    if row < 0 || col < 0 {
        return Err("row and column must be non-negative".to_string());
    }
    if row_span <= 0 || col_span <= 0 {
        return Err("spans must be positive".to_string());
    }
    Ok(Some(GridPos {
        container,
        row,
        col,
        row_span,
        col_span,
    }))
}

// ── Param ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Param {
    pub id: String,
    pub label: String,
    pub dtype: ParamDtype,
    /// Raw value expression as entered/imported.
    pub value: String,
    pub default: String,
    pub options: Vec<EnumOption>,
    /// Hide policy, possibly a `${...}` template.
    pub hide: String,
    pub category: String,
    stringify: bool,
    listify: bool,
    cached: Option<Value>,
}

impl Param {
    pub fn new(id: impl Into<String>, label: impl Into<String>, dtype: ParamDtype) -> Self {
        Param {
            id: id.into(),
            label: label.into(),
            dtype,
            value: String::new(),
            default: String::new(),
            options: Vec::new(),
            hide: String::new(),
            category: String::new(),
            stringify: false,
            listify: false,
            cached: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        let d = default.into();
        self.value = d.clone();
        self.default = d;
        self
    }

    pub fn with_hide(mut self, hide: impl Into<String>) -> Self {
        self.hide = hide.into();
        self
    }

    pub fn with_options(mut self, options: Vec<EnumOption>) -> Self {
        self.options = options;
        self
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.invalidate();
    }

    pub fn is_default(&self) -> bool {
        self.value == self.default
    }

    /// Drop the memoized evaluation; called on every namespace rebuild.
    pub fn invalidate(&mut self) {
        self.cached = None;
        self.stringify = false;
        self.listify = false;
    }

    pub fn cached(&self) -> Option<&Value> {
        self.cached.as_ref()
    }

    pub fn stringify(&self) -> bool {
        self.stringify
    }

    pub fn listify(&self) -> bool {
        self.listify
    }

    /// The selected enum option, if this is an enum param with a valid
    /// value.
    pub fn selected_option(&self) -> Option<&EnumOption> {
        self.options.iter().find(|o| o.value == self.value)
    }

    /// Attribute lookup on the selected enum option (`opt` sub-map).
    pub fn opt(&self, key: &str) -> Option<&str> {
        self.selected_option()
            .and_then(|o| o.attributes.get(key))
            .map(String::as_str)
    }

    /// Evaluate the hide policy. Templated policies that fail to
    /// evaluate fall back to `none`.
    pub fn hide_state(&self, ctx: &EvalCtx<'_>) -> Hide {
        let raw = self.hide.trim();
        if let Some(h) = Hide::parse(raw) {
            return h;
        }
        if let Some(expr) = template_expr(raw) {
            if let Ok(v) = ctx.eval(expr) {
                if let Some(h) = v.as_str().and_then(Hide::parse) {
                    return h;
                }
                return if v.truthy() { Hide::All } else { Hide::None };
            }
        }
        Hide::None
    }

    /// Evaluate the raw value according to the dtype contract (§4.1
    /// behavior table). Caches the result and the stringify/listify
    /// flags.
    pub fn evaluate(&mut self, ctx: &EvalCtx<'_>) -> Result<Value, EvalError> {
        self.stringify = false;
        self.listify = false;
        let result = self.evaluate_inner(ctx);
        if let Ok(v) = &result {
            self.cached = Some(v.clone());
        }
        result
    }

    fn evaluate_inner(&mut self, ctx: &EvalCtx<'_>) -> Result<Value, EvalError> {
        let raw = self.value.clone();
        match self.dtype {
            ParamDtype::Raw | ParamDtype::BusStructure => {
                Ok(ctx.eval(&raw).unwrap_or(Value::Str(raw)))
            }
            ParamDtype::Enum => {
                if self.options.iter().any(|o| o.value == raw) {
                    Ok(Value::Str(raw))
                } else {
                    Err(EvalError::new(format!(
                        "'{}' is not one of the declared options",
                        raw
                    )))
                }
            }
            ParamDtype::Int | ParamDtype::Hex => {
                let v = ctx.eval(&raw)?;
                v.as_int().map(Value::Int).ok_or_else(|| {
                    EvalError::new(format!("'{}' evaluated to {}, expected int", raw, v.type_name()))
                })
            }
            ParamDtype::Real => {
                let v = ctx.eval(&raw)?;
                v.as_f64().map(Value::Float).ok_or_else(|| {
                    EvalError::new(format!(
                        "'{}' evaluated to {}, expected real",
                        raw,
                        v.type_name()
                    ))
                })
            }
            ParamDtype::Complex => {
                let v = ctx.eval(&raw)?;
                match v {
                    Value::Complex(..) => Ok(v),
                    other => other.as_f64().map(|f| Value::Complex(f, 0.0)).ok_or_else(|| {
                        EvalError::new(format!("'{}' is not a complex scalar", raw))
                    }),
                }
            }
            ParamDtype::Bool => {
                let v = ctx.eval(&raw)?;
                match v {
                    Value::Bool(b) => Ok(Value::Bool(b)),
                    Value::Int(i) => Ok(Value::Bool(i != 0)),
                    other => Err(EvalError::new(format!(
                        "'{}' evaluated to {}, expected bool",
                        raw,
                        other.type_name()
                    ))),
                }
            }
            ParamDtype::IntVector | ParamDtype::RealVector | ParamDtype::ComplexVector => {
                let v = ctx.eval(&raw)?;
                let items = match v {
                    Value::List(items) => items,
                    scalar => {
                        // Non-vector supplied where a vector is expected:
                        // auto-wrap and remember for code generation.
                        self.listify = true;
                        vec![scalar]
                    }
                };
                for item in &items {
                    let ok = match self.dtype {
                        ParamDtype::IntVector => item.as_int().is_some(),
                        ParamDtype::RealVector => item.as_f64().is_some(),
                        ParamDtype::ComplexVector => {
                            item.as_f64().is_some() || matches!(item, Value::Complex(..))
                        }
                        _ => unreachable!(),
                    };
                    if !ok {
                        return Err(EvalError::new(format!(
                            "'{}' contains a {} element, expected {}",
                            raw,
                            item.type_name(),
                            self.dtype.as_str()
                        )));
                    }
                }
                Ok(Value::List(items))
            }
            ParamDtype::String
            | ParamDtype::FileOpen
            | ParamDtype::FileSave
            | ParamDtype::Multiline
            | ParamDtype::MultilinePythonExternal => match ctx.eval(&raw) {
                Ok(Value::Str(s)) => Ok(Value::Str(s)),
                _ => {
                    // Not a real string expression: take the text
                    // verbatim and quote it at code-generation time.
                    self.stringify = true;
                    Ok(Value::Str(raw))
                }
            },
            ParamDtype::Id => {
                let t = raw.trim();
                if !is_valid_identifier(t) {
                    return Err(EvalError::new(format!("'{}' is not a valid identifier", t)));
                }
                if RESERVED_IDS.contains(&t) {
                    return Err(EvalError::new(format!("'{}' is a reserved identifier", t)));
                }
                Ok(Value::Str(t.to_string()))
            }
            ParamDtype::StreamId => {
                self.stringify = true;
                Ok(Value::Str(raw))
            }
            ParamDtype::GridPos | ParamDtype::GuiHint => match parse_grid_pos(&raw) {
                Ok(_) => Ok(Value::Str(raw)),
                Err(e) => Err(EvalError::new(e)),
            },
            ParamDtype::Import => {
                let bound = ctx.evaluator.exec_bindings(&raw)?;
                Ok(Value::List(
                    bound.keys().map(|k| Value::Str(k.clone())).collect(),
                ))
            }
        }
    }

    /// Render this parameter for generated code. Python output re-embeds
    /// the raw expression (the generated program evaluates it); C++
    /// output renders the evaluated value.
    pub fn to_code(&self, lang: OutputLanguage) -> String {
        match lang {
            OutputLanguage::Python => {
                if self.stringify {
                    format!("'{}'", self.value.replace('\\', "\\\\").replace('\'', "\\'"))
                } else if self.listify {
                    format!("({}, )", self.value)
                } else {
                    self.value.clone()
                }
            }
            OutputLanguage::Cpp => {
                if self.stringify {
                    return format!(
                        "\"{}\"",
                        self.value.replace('\\', "\\\\").replace('"', "\\\"")
                    );
                }
                match &self.cached {
                    Some(v) => v.to_cpp(),
                    None => self.value.clone(),
                }
            }
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.id, self.value)
    }
}

/// Strip a `${ ... }` wrapper, returning the inner expression.
pub fn template_expr(raw: &str) -> Option<&str> {
    let t = raw.trim();
    t.strip_prefix("${")?.strip_suffix('}').map(str::trim)
}
