//! Shared types for the Conveyor pipeline engine.
//!
//! This crate provides the foundational types used across the other Conveyor
//! crates:
//! - `ConveyorError` — unified error taxonomy
//! - `Context` — run-scoped key-value store threaded through stages
//! - `Outcome` / `OutcomeKind` — the structured result of executing a stage

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for all Conveyor subsystems.
///
/// Stage-level failures are *not* errors: they are [`Outcome`] records with
/// `outcome = fail` and the pipeline keeps routing. These variants cover the
/// conditions that terminate a run.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    #[error("parse error at line {line}, col {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("handler '{handler}' failed on node '{node}': {message}")]
    Handler {
        handler: String,
        node: String,
        message: String,
    },

    #[error("agent timed out on node '{node}' after {timeout_secs}s")]
    AgentTimeout { node: String, timeout_secs: u64 },

    #[error("no route from node {node} for outcome {outcome}")]
    NoRoute { node: String, outcome: String },

    #[error("resume failed: no route from {node}")]
    ResumeMismatch { node: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A convenience alias for `Result<T, ConveyorError>`.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ---------------------------------------------------------------------------
// OutcomeKind — the tagged result of a stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Fail,
    Retry,
    PartialSuccess,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Fail => "fail",
            OutcomeKind::Retry => "retry",
            OutcomeKind::PartialSuccess => "partial_success",
        }
    }

    /// Parse an outcome tag. Returns `None` for anything outside the
    /// closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "success" => Some(OutcomeKind::Success),
            "fail" => Some(OutcomeKind::Fail),
            "retry" => Some(OutcomeKind::Retry),
            "partial_success" => Some(OutcomeKind::PartialSuccess),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a stage
// ---------------------------------------------------------------------------

/// The structured result a handler returns for one stage.
///
/// Serialized verbatim as the node's `status.json` artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub schema_version: u32,
    pub outcome: OutcomeKind,
    #[serde(default)]
    pub preferred_next_label: String,
    #[serde(default)]
    pub suggested_next_ids: Vec<String>,
    #[serde(default)]
    pub context_updates: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub failure_reason: String,
}

impl Outcome {
    pub fn new(outcome: OutcomeKind) -> Self {
        Self {
            schema_version: 1,
            outcome,
            preferred_next_label: String::new(),
            suggested_next_ids: Vec::new(),
            context_updates: BTreeMap::new(),
            notes: String::new(),
            failure_reason: String::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(OutcomeKind::Success)
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        let mut out = Self::new(OutcomeKind::Fail);
        out.failure_reason = reason.into();
        out
    }
}

// ---------------------------------------------------------------------------
// Context — run-scoped key-value store
// ---------------------------------------------------------------------------

/// Mutable key-value state for one pipeline run.
///
/// The engine owns the context and passes it down the execution loop; stages
/// read it by reference and propose updates through their outcome record.
/// Keys are plain strings; values are arbitrary JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, serde_json::Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// String accessor. Returns `None` when the key is absent or not a
    /// JSON string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Merge `updates` into the context. Keys not present in `updates` are
    /// preserved.
    pub fn merge(&mut self, updates: &BTreeMap<String, serde_json::Value>) {
        for (k, v) in updates {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn values(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.values
    }

    pub fn from_values(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self { values }
    }

    /// Compute the added/updated/removed delta from `before` to `self`.
    pub fn delta(&self, before: &Context) -> ContextDelta {
        let mut delta = ContextDelta::default();
        for (k, after) in &self.values {
            match before.values.get(k) {
                None => {
                    delta.added.insert(k.clone(), after.clone());
                }
                Some(prev) if prev != after => {
                    delta.updated.insert(
                        k.clone(),
                        ContextChange {
                            before: prev.clone(),
                            after: after.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for k in before.values.keys() {
            if !self.values.contains_key(k) {
                delta.removed.push(k.clone());
            }
        }
        delta
    }
}

/// One key's before/after pair inside a [`ContextDelta`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChange {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Keys added, updated, and removed between two context snapshots.
/// `removed` is sorted (BTreeMap iteration order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextDelta {
    pub added: BTreeMap<String, serde_json::Value>,
    pub updated: BTreeMap<String, ContextChange>,
    pub removed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&OutcomeKind::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&OutcomeKind::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
    }

    #[test]
    fn outcome_kind_parse_round_trip() {
        for tag in ["success", "fail", "retry", "partial_success"] {
            assert_eq!(OutcomeKind::parse(tag).unwrap().as_str(), tag);
        }
        assert!(OutcomeKind::parse("skipped").is_none());
        assert!(OutcomeKind::parse("").is_none());
    }

    #[test]
    fn outcome_fail_constructor() {
        let o = Outcome::fail("something broke");
        assert_eq!(o.outcome, OutcomeKind::Fail);
        assert_eq!(o.failure_reason, "something broke");
        assert_eq!(o.schema_version, 1);
    }

    #[test]
    fn outcome_deserializes_with_missing_optional_fields() {
        let o: Outcome =
            serde_json::from_str(r#"{"schema_version":1,"outcome":"success"}"#).unwrap();
        assert_eq!(o.outcome, OutcomeKind::Success);
        assert!(o.suggested_next_ids.is_empty());
        assert!(o.failure_reason.is_empty());
    }

    #[test]
    fn context_set_get_round_trip() {
        let mut ctx = Context::new();
        ctx.set("key", serde_json::json!("hello"));
        assert_eq!(ctx.get_str("key"), Some("hello"));
        assert_eq!(ctx.get_str("missing"), None);
    }

    #[test]
    fn context_merge_preserves_existing_keys() {
        let mut ctx = Context::new();
        ctx.set("keep", serde_json::json!("old"));
        ctx.set("overwrite", serde_json::json!("old"));

        let mut updates = BTreeMap::new();
        updates.insert("overwrite".into(), serde_json::json!("new"));
        updates.insert("added".into(), serde_json::json!("fresh"));
        ctx.merge(&updates);

        assert_eq!(ctx.get_str("keep"), Some("old"));
        assert_eq!(ctx.get_str("overwrite"), Some("new"));
        assert_eq!(ctx.get_str("added"), Some("fresh"));
    }

    #[test]
    fn context_delta_tracks_added_updated_removed() {
        let mut before = Context::new();
        before.set("stable", serde_json::json!(1));
        before.set("changed", serde_json::json!("a"));
        before.set("gone", serde_json::json!(true));

        let mut after = before.clone();
        after.set("changed", serde_json::json!("b"));
        after.set("fresh", serde_json::json!(2));
        after = Context::from_values(
            after
                .values()
                .iter()
                .filter(|(k, _)| k.as_str() != "gone")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let delta = after.delta(&before);
        assert_eq!(delta.added.get("fresh"), Some(&serde_json::json!(2)));
        assert_eq!(
            delta.updated.get("changed").map(|c| &c.after),
            Some(&serde_json::json!("b"))
        );
        assert_eq!(delta.removed, vec!["gone".to_string()]);
        assert!(!delta.added.contains_key("stable"));
    }

    #[test]
    fn context_serializes_transparently() {
        let mut ctx = Context::new();
        ctx.set("a", serde_json::json!(1));
        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"a":1}"#);
        let back: Context = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get("a"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn error_display_no_route() {
        let err = ConveyorError::NoRoute {
            node: "verify".into(),
            outcome: "fail".into(),
        };
        assert_eq!(
            err.to_string(),
            "no route from node verify for outcome fail"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConveyorError = io_err.into();
        assert!(matches!(err, ConveyorError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
