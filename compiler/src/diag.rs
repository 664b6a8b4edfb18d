// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler phases.
// grcc consumes structured documents rather than source text, so a
// diagnostic is anchored to the path of the offending element (block,
// param, port, connection) instead of a byte span.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0200`, `W0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// Unparseable flow-graph document.
    pub const E0001: DiagCode = DiagCode("E0001");
    /// Unknown block type on import.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Connection endpoint references a missing port key.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Parameter expression failed to evaluate.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// Parameter evaluated to a value of the wrong type.
    pub const E0201: DiagCode = DiagCode("E0201");
    /// Malformed identifier.
    pub const E0202: DiagCode = DiagCode("E0202");
    /// Duplicate identifier.
    pub const E0203: DiagCode = DiagCode("E0203");
    /// Identifier shadows a reserved name.
    pub const E0204: DiagCode = DiagCode("E0204");
    /// Value is not one of the declared enum options.
    pub const E0205: DiagCode = DiagCode("E0205");
    /// Overlapping GUI grid cells.
    pub const E0206: DiagCode = DiagCode("E0206");
    /// Connected port types differ.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Connected port item sizes differ.
    pub const E0301: DiagCode = DiagCode("E0301");
    /// Virtual port resolution loop.
    pub const E0302: DiagCode = DiagCode("E0302");
    /// Port multiplicity evaluated to an invalid count.
    pub const E0303: DiagCode = DiagCode("E0303");
    /// Port is not connected.
    pub const E0304: DiagCode = DiagCode("E0304");
    /// Too many connections on a single-connection port.
    pub const E0305: DiagCode = DiagCode("E0305");
    /// Block assertion failed.
    pub const E0400: DiagCode = DiagCode("E0400");
    /// Block does not support the selected output language.
    pub const E0401: DiagCode = DiagCode("E0401");
    /// Block requires a GUI generate mode.
    pub const E0402: DiagCode = DiagCode("E0402");
    /// Virtual stream id unmatched or duplicated.
    pub const E0404: DiagCode = DiagCode("E0404");
    /// Circular dependency among variables (fatal during sort).
    pub const E0500: DiagCode = DiagCode("E0500");
    /// Embedded block introspection failed.
    pub const E0501: DiagCode = DiagCode("E0501");
    /// Deprecated block type.
    pub const W0100: DiagCode = DiagCode("W0100");
    /// Import statement failed to execute.
    pub const W0200: DiagCode = DiagCode("W0200");
    /// Descriptor skipped during library load.
    pub const W0300: DiagCode = DiagCode("W0300");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Element path ─────────────────────────────────────────────────────────

/// Identity of the element a diagnostic is attached to.
///
/// Paths are built root-down: a bare block name, a `block.param` pair, a
/// `block.port` pair, or a `src→snk` connection. The empty path addresses
/// the flow graph itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ElemPath {
    segments: Vec<String>,
}

impl ElemPath {
    /// The flow graph itself.
    pub fn graph() -> Self {
        Self::default()
    }

    pub fn block(name: impl Into<String>) -> Self {
        ElemPath {
            segments: vec![name.into()],
        }
    }

    pub fn param(block: impl Into<String>, param: impl Into<String>) -> Self {
        ElemPath {
            segments: vec![block.into(), param.into()],
        }
    }

    pub fn port(block: impl Into<String>, direction: &str, key: impl Into<String>) -> Self {
        ElemPath {
            segments: vec![block.into(), format!("{}[{}]", direction, key.into())],
        }
    }

    pub fn connection(src: impl fmt::Display, snk: impl fmt::Display) -> Self {
        ElemPath {
            segments: vec![format!("{}→{}", src, snk)],
        }
    }

    /// The block-level segment, if any.
    pub fn block_name(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn is_graph(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for ElemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "<flow graph>")
        } else {
            write!(f, "{}", self.segments.join("."))
        }
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub path: ElemPath,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code or hint.
    pub fn new(level: DiagLevel, path: ElemPath, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            path,
            message: message.into(),
            hint: None,
        }
    }

    pub fn error(path: ElemPath, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, path, message)
    }

    pub fn warning(path: ElemPath, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, path, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}: {}", level, code, self.path, self.message)?;
        } else {
            write!(f, "{}: {}: {}", level, self.path, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::error(ElemPath::block("src0"), "something failed");
        assert_eq!(format!("{d}"), "error: src0: something failed");
    }

    #[test]
    fn display_with_code_and_param_path() {
        let d = Diagnostic::warning(ElemPath::param("fir0", "taps"), "unused value")
            .with_code(codes::W0100);
        assert_eq!(format!("{d}"), "warning[W0100]: fir0.taps: unused value");
    }

    #[test]
    fn graph_path_display() {
        let d = Diagnostic::error(ElemPath::graph(), "no blocks");
        assert_eq!(format!("{d}"), "error: <flow graph>: no blocks");
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::error(ElemPath::port("b0", "sink", "0"), "type mismatch")
            .with_code(codes::E0300)
            .with_hint("insert a type converter block");

        assert_eq!(d.code, Some(codes::E0300));
        assert_eq!(d.hint.as_deref(), Some("insert a type converter block"));
        assert_eq!(d.path.block_name(), Some("b0"));
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let diags = vec![Diagnostic::warning(ElemPath::graph(), "w")];
        assert!(!has_errors(&diags));
        let diags = vec![
            Diagnostic::warning(ElemPath::graph(), "w"),
            Diagnostic::error(ElemPath::graph(), "e"),
        ];
        assert!(has_errors(&diags));
    }
}
