// order.rs — Textual dependency analysis and topological ordering
//
// Variable and parameter blocks reference each other by name inside their
// value expressions. Dependency detection is textual: tokenize the
// expression and collect identifiers, then order the blocks so every
// referenced name is evaluated first.
//
// Preconditions: none.
// Postconditions: `toposort` returns indices covering every item exactly
//                 once, or a cycle error naming the unresolved items.
// Failure modes: a true circular dependency.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use logos::Logos;

// ── Expression tokens ────────────────────────────────────────────────────

/// Token set for the expression dialect. Only identifiers matter for
/// dependency analysis; the remaining tokens exist so string literal
/// contents are never mistaken for references.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum ExprToken {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r"[0-9][0-9A-Za-z_.]*")]
    Number,

    #[regex(r#""([^"\\]|\\.)*""#)]
    DoubleQuoted,

    #[regex(r#"'([^'\\]|\\.)*'"#)]
    SingleQuoted,

    #[regex(r"[+\-*/%(),\[\]{}<>=!&|^~:;.@$#?]")]
    Punct,
}

/// Collect every identifier referenced by an expression.
///
/// String literal contents are skipped; unknown characters are ignored
/// (the evaluator reports real syntax errors later).
pub fn extract_identifiers(expr: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut lex = ExprToken::lexer(expr);
    while let Some(token) = lex.next() {
        if let Ok(ExprToken::Ident) = token {
            out.insert(lex.slice().to_string());
        }
    }
    out
}

// ── Topological sort ─────────────────────────────────────────────────────

/// A circular dependency among the sorted items. Fatal for the caller's
/// evaluation phase.
#[derive(Debug, Clone)]
pub struct SortCycleError {
    /// Names of the items left unsorted when progress stopped.
    pub cycle: Vec<String>,
}

impl fmt::Display for SortCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circular dependency among: {}",
            self.cycle.join(", ")
        )
    }
}

impl std::error::Error for SortCycleError {}

/// Order items so that every dependency precedes its dependents.
///
/// `items` pairs each name with the set of names it references.
/// References to names outside the item set are ignored — they resolve
/// from the wider namespace, not from this sort. Returns indices into
/// `items`. Ready items are released in name order, so the result is
/// deterministic for a given input.
pub fn toposort(items: &[(String, BTreeSet<String>)]) -> Result<Vec<usize>, SortCycleError> {
    let index_of: BTreeMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();

    // dependents[i] = indices that reference item i; indegree counts
    // in-set dependencies only.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut indegree: Vec<usize> = vec![0; items.len()];

    for (i, (name, deps)) in items.iter().enumerate() {
        for dep in deps {
            // Self-reference counts as a cycle of one.
            if dep == name {
                return Err(SortCycleError {
                    cycle: vec![name.clone()],
                });
            }
            if let Some(&j) = index_of.get(dep.as_str()) {
                dependents[j].push(i);
                indegree[i] += 1;
            }
        }
    }

    let mut ready: BTreeMap<&str, usize> = items
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();

    let mut order = Vec::with_capacity(items.len());
    while let Some((_, i)) = ready.pop_first() {
        order.push(i);
        for &dep in &dependents[i] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                ready.insert(items[dep].0.as_str(), dep);
            }
        }
    }

    if order.len() != items.len() {
        let mut cycle: Vec<String> = items
            .iter()
            .enumerate()
            .filter(|(i, _)| !order.contains(i))
            .map(|(_, (name, _))| name.clone())
            .collect();
        cycle.sort();
        return Err(SortCycleError { cycle });
    }

    Ok(order)
}

/// Convenience: sort (name, expression) pairs by textual dependency.
pub fn toposort_exprs(pairs: &[(String, String)]) -> Result<Vec<usize>, SortCycleError> {
    let items: Vec<(String, BTreeSet<String>)> = pairs
        .iter()
        .map(|(name, expr)| (name.clone(), extract_identifiers(expr)))
        .collect();
    toposort(&items)
}
