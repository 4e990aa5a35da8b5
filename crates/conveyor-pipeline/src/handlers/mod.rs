//! Stage handlers.
//!
//! The handler set is closed (start, exit, tool, verification, codergen), so
//! dispatch is a match on [`NodeKind`] rather than a registry of trait
//! objects. Start and exit are structural and produce a bare success.

pub mod codergen;
pub mod tool;
pub mod verification;

use conveyor_types::Outcome;

/// Split a comma-separated attribute value, dropping blanks.
pub(crate) fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Structural nodes: no side effects, always succeed.
pub fn execute_structural() -> Outcome {
    Outcome::success()
}
