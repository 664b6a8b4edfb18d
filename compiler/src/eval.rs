// eval.rs — Expression evaluation behind a capability interface
//
// Parameter and variable values are live expressions evaluated against the
// flow graph's shared namespace. The evaluator is an injected dependency:
// the default implementation runs a hardened rhai engine, and tests may
// substitute `LiteralEvaluator`, which only resolves literal constants and
// identifier references.
//
// Preconditions: none.
// Postconditions: evaluation never mutates the namespace it is given.
// Failure modes: syntax/runtime errors surface as `EvalError`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use rhai::{Array, Dynamic, Engine, Scope, FLOAT, INT};

// ── Values ───────────────────────────────────────────────────────────────

/// An evaluated namespace value. Closed sum type over everything a
/// parameter expression may produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(..) => "complex",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    /// Truthiness follows the conventions of the expression language:
    /// zero, empty and none are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Complex(re, im) => *re != 0.0 || *im != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Render as a Python literal.
    pub fn to_python(&self) -> String {
        match self {
            Value::None => "None".into(),
            Value::Bool(true) => "True".into(),
            Value::Bool(false) => "False".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Complex(re, im) => format!("({}{:+}j)", format_float(*re), im),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.to_python()).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }

    /// Render as a C++ expression.
    pub fn to_cpp(&self) -> String {
        match self {
            Value::None => "{}".into(),
            Value::Bool(true) => "true".into(),
            Value::Bool(false) => "false".into(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Complex(re, im) => {
                format!("std::complex<float>({}, {})", format_float(*re), format_float(*im))
            }
            Value::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.to_cpp()).collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

/// The shared evaluation namespace: identifier → value, rebuilt on every
/// flow-graph rewrite. BTreeMap keeps iteration deterministic.
pub type Namespace = BTreeMap<String, Value>;

// ── Error type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        EvalError {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

// ── Capability trait ─────────────────────────────────────────────────────

/// Expression evaluation capability. The compiler core never talks to a
/// scripting engine directly; everything routes through this trait.
pub trait Evaluator {
    /// Evaluate a single expression against a read-only namespace.
    fn eval(&self, expr: &str, ns: &Namespace) -> Result<Value, EvalError>;

    /// Execute a statement (an `import`-style binding) in an isolated
    /// scope and return the names it bound.
    fn exec_bindings(&self, stmt: &str) -> Result<Namespace, EvalError>;
}

/// Borrowed evaluation context threaded through rewrite/validate passes.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub evaluator: &'a dyn Evaluator,
    pub ns: &'a Namespace,
}

impl<'a> EvalCtx<'a> {
    pub fn new(evaluator: &'a dyn Evaluator, ns: &'a Namespace) -> Self {
        EvalCtx { evaluator, ns }
    }

    pub fn eval(&self, expr: &str) -> Result<Value, EvalError> {
        self.evaluator.eval(expr, self.ns)
    }
}

// ── rhai implementation ──────────────────────────────────────────────────

/// Complex scalar registered with the engine as `complex(re, im)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cpx {
    re: f64,
    im: f64,
}

/// Default evaluator: a hardened rhai engine.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        Self::configure(&mut engine);
        RhaiEvaluator { engine }
    }

    /// Safety limits plus the handful of math helpers parameter
    /// expressions conventionally use.
    fn configure(engine: &mut Engine) {
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(100_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(10_000);

        engine.register_type_with_name::<Cpx>("complex");
        engine.register_fn("complex", |re: FLOAT, im: FLOAT| Cpx { re, im });
        engine.register_fn("complex", |re: INT, im: INT| Cpx {
            re: re as f64,
            im: im as f64,
        });
        engine.register_fn("+", |a: Cpx, b: Cpx| Cpx {
            re: a.re + b.re,
            im: a.im + b.im,
        });
        engine.register_fn("-", |a: Cpx, b: Cpx| Cpx {
            re: a.re - b.re,
            im: a.im - b.im,
        });
        engine.register_fn("*", |a: Cpx, b: Cpx| Cpx {
            re: a.re * b.re - a.im * b.im,
            im: a.re * b.im + a.im * b.re,
        });
        engine.register_fn("*", |a: Cpx, b: FLOAT| Cpx {
            re: a.re * b,
            im: a.im * b,
        });
        engine.register_fn("*", |a: FLOAT, b: Cpx| Cpx {
            re: b.re * a,
            im: b.im * a,
        });

        engine.register_fn("abs", |x: FLOAT| x.abs());
        engine.register_fn("sqrt", |x: FLOAT| x.sqrt());
        engine.register_fn("pow", |x: FLOAT, y: FLOAT| x.powf(y));
        engine.register_fn("exp", |x: FLOAT| x.exp());
        engine.register_fn("log", |x: FLOAT| x.ln());
        engine.register_fn("log10", |x: FLOAT| x.log10());
        engine.register_fn("sin", |x: FLOAT| x.sin());
        engine.register_fn("cos", |x: FLOAT| x.cos());
        engine.register_fn("tan", |x: FLOAT| x.tan());
        engine.register_fn("atan2", |y: FLOAT, x: FLOAT| y.atan2(x));
        engine.register_fn("floor", |x: FLOAT| x.floor());
        engine.register_fn("ceil", |x: FLOAT| x.ceil());
        engine.register_fn("round", |x: FLOAT| x.round());
        engine.register_fn("min", |a: FLOAT, b: FLOAT| a.min(b));
        engine.register_fn("max", |a: FLOAT, b: FLOAT| a.max(b));
        engine.register_fn("min", |a: INT, b: INT| a.min(b));
        engine.register_fn("max", |a: INT, b: INT| a.max(b));
    }

    fn scope_from_namespace<'s>(ns: &Namespace) -> Scope<'s> {
        let mut scope = Scope::new();
        // Conveniences expressions in legacy documents rely on.
        scope.push("True", true);
        scope.push("False", false);
        scope.push_dynamic("None", Dynamic::UNIT);
        scope.push("pi", std::f64::consts::PI);
        for (name, value) in ns {
            scope.push_dynamic(name.as_str(), value_to_dynamic(value));
        }
        scope
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator for RhaiEvaluator {
    fn eval(&self, expr: &str, ns: &Namespace) -> Result<Value, EvalError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(EvalError::new("empty expression"));
        }
        let mut scope = Self::scope_from_namespace(ns);
        let result = self
            .engine
            .eval_expression_with_scope::<Dynamic>(&mut scope, trimmed)
            .map_err(|e| EvalError::new(format!("'{}': {}", trimmed, e)))?;
        dynamic_to_value(&result)
            .ok_or_else(|| EvalError::new(format!("'{}': unsupported result type", trimmed)))
    }

    fn exec_bindings(&self, stmt: &str) -> Result<Namespace, EvalError> {
        let mut scope = Scope::new();
        self.engine
            .run_with_scope(&mut scope, stmt)
            .map_err(|e| EvalError::new(format!("'{}': {}", stmt.trim(), e)))?;
        let mut ns = Namespace::new();
        for (name, _constant, value) in scope.iter() {
            if let Some(v) = dynamic_to_value(&value) {
                ns.insert(name.to_string(), v);
            }
        }
        Ok(ns)
    }
}

fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::None => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i as INT),
        Value::Float(f) => Dynamic::from(*f as FLOAT),
        Value::Complex(re, im) => Dynamic::from(Cpx { re: *re, im: *im }),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::List(items) => {
            let arr: Array = items.iter().map(value_to_dynamic).collect();
            Dynamic::from(arr)
        }
    }
}

fn dynamic_to_value(d: &Dynamic) -> Option<Value> {
    if d.is_unit() {
        return Some(Value::None);
    }
    if let Ok(b) = d.as_bool() {
        return Some(Value::Bool(b));
    }
    if let Ok(i) = d.as_int() {
        return Some(Value::Int(i));
    }
    if let Ok(f) = d.as_float() {
        return Some(Value::Float(f));
    }
    if let Some(c) = d.clone().try_cast::<Cpx>() {
        return Some(Value::Complex(c.re, c.im));
    }
    if let Ok(s) = d.clone().into_string() {
        return Some(Value::Str(s));
    }
    if let Some(arr) = d.clone().try_cast::<Array>() {
        let mut items = Vec::with_capacity(arr.len());
        for elem in &arr {
            items.push(dynamic_to_value(elem)?);
        }
        return Some(Value::List(items));
    }
    None
}

// ── Literal evaluator (tests, restricted contexts) ───────────────────────

/// Resolves only literal constants and bare identifier references.
/// Everything else is an error. Useful for exercising the pipeline
/// without a scripting engine.
pub struct LiteralEvaluator;

impl LiteralEvaluator {
    fn literal(token: &str, ns: &Namespace) -> Result<Value, EvalError> {
        let t = token.trim();
        match t {
            "" => return Err(EvalError::new("empty expression")),
            "True" | "true" => return Ok(Value::Bool(true)),
            "False" | "false" => return Ok(Value::Bool(false)),
            "None" => return Ok(Value::None),
            _ => {}
        }
        if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
            if let Ok(i) = i64::from_str_radix(hex, 16) {
                return Ok(Value::Int(i));
            }
        }
        if let Ok(i) = t.parse::<i64>() {
            return Ok(Value::Int(i));
        }
        if let Ok(f) = t.parse::<f64>() {
            return Ok(Value::Float(f));
        }
        if (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2)
            || (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
        {
            return Ok(Value::Str(t[1..t.len() - 1].to_string()));
        }
        if let Some(v) = ns.get(t) {
            return Ok(v.clone());
        }
        Err(EvalError::new(format!("'{}': not a literal or known name", t)))
    }
}

impl Evaluator for LiteralEvaluator {
    fn eval(&self, expr: &str, ns: &Namespace) -> Result<Value, EvalError> {
        let t = expr.trim();
        if t.starts_with('[') && t.ends_with(']') {
            let inner = &t[1..t.len() - 1];
            let mut items = Vec::new();
            for part in inner.split(',') {
                if part.trim().is_empty() {
                    continue;
                }
                items.push(Self::literal(part, ns)?);
            }
            return Ok(Value::List(items));
        }
        Self::literal(t, ns)
    }

    fn exec_bindings(&self, _stmt: &str) -> Result<Namespace, EvalError> {
        Err(EvalError::new("literal evaluator cannot execute statements"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(pairs: &[(&str, Value)]) -> Namespace {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn rhai_arithmetic() {
        let ev = RhaiEvaluator::new();
        let n = ns(&[("samp_rate", Value::Int(32000))]);
        assert_eq!(ev.eval("samp_rate * 2", &n).unwrap(), Value::Int(64000));
    }

    #[test]
    fn rhai_float_and_namespace() {
        let ev = RhaiEvaluator::new();
        let n = ns(&[("a", Value::Float(1.5))]);
        assert_eq!(ev.eval("a + 0.5", &n).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn rhai_list_result() {
        let ev = RhaiEvaluator::new();
        let v = ev.eval("[1, 2, 3]", &Namespace::new()).unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn rhai_complex_constructor() {
        let ev = RhaiEvaluator::new();
        let v = ev.eval("complex(1.0, -1.0)", &Namespace::new()).unwrap();
        assert_eq!(v, Value::Complex(1.0, -1.0));
    }

    #[test]
    fn rhai_error_names_expression() {
        let ev = RhaiEvaluator::new();
        let err = ev.eval("nonexistent + 1", &Namespace::new()).unwrap_err();
        assert!(err.message.contains("nonexistent"), "got: {}", err.message);
    }

    #[test]
    fn rhai_bindings_capture_names() {
        let ev = RhaiEvaluator::new();
        let bound = ev.exec_bindings("let tau = 6.28; let n = 4;").unwrap();
        assert_eq!(bound.get("tau"), Some(&Value::Float(6.28)));
        assert_eq!(bound.get("n"), Some(&Value::Int(4)));
    }

    #[test]
    fn rhai_python_style_constants() {
        let ev = RhaiEvaluator::new();
        assert_eq!(
            ev.eval("True", &Namespace::new()).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn literal_evaluator_literals_only() {
        let ev = LiteralEvaluator;
        let n = ns(&[("freq", Value::Int(100))]);
        assert_eq!(ev.eval("42", &n).unwrap(), Value::Int(42));
        assert_eq!(ev.eval("0x10", &n).unwrap(), Value::Int(16));
        assert_eq!(ev.eval("freq", &n).unwrap(), Value::Int(100));
        assert_eq!(ev.eval("'hi'", &n).unwrap(), Value::Str("hi".into()));
        assert!(ev.eval("freq * 2", &n).is_err());
    }

    #[test]
    fn python_rendering() {
        assert_eq!(Value::Bool(true).to_python(), "True");
        assert_eq!(Value::Float(2.0).to_python(), "2.0");
        assert_eq!(Value::Str("a'b".into()).to_python(), "'a\\'b'");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2)]).to_python(),
            "[1, 2]"
        );
    }

    #[test]
    fn cpp_rendering() {
        assert_eq!(Value::Bool(true).to_cpp(), "true");
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2)]).to_cpp(),
            "{1, 2}"
        );
        assert_eq!(
            Value::Complex(0.0, 1.0).to_cpp(),
            "std::complex<float>(0.0, 1.0)"
        );
    }
}
