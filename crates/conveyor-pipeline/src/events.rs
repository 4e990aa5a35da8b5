//! Run persistence: append-only event and trace logs, JSON artifacts.
//!
//! `events.jsonl` is the operator-facing record of what happened;
//! `trace.jsonl` is the audit log carrying full context captures. Both are
//! one JSON object per line with `schema_version` and an `at` timestamp
//! stamped into every record.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use conveyor_types::{Context, ContextDelta, Result};

use crate::routing::RouteCandidate;

pub const SCHEMA_VERSION: u32 = 1;

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Convert a DOT attribute value to plain JSON for trace records.
pub fn attr_to_json(val: &conveyor_dot::AttributeValue) -> serde_json::Value {
    match val {
        conveyor_dot::AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        conveyor_dot::AttributeValue::Integer(i) => serde_json::json!(*i),
        conveyor_dot::AttributeValue::Float(f) => serde_json::json!(*f),
        conveyor_dot::AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
        conveyor_dot::AttributeValue::Duration(d) => serde_json::json!(d.as_millis() as u64),
    }
}

pub fn attr_map_to_json(
    attrs: &HashMap<String, conveyor_dot::AttributeValue>,
) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    let mut keys: Vec<_> = attrs.keys().collect();
    keys.sort();
    for k in keys {
        map.insert(k.clone(), attr_to_json(&attrs[k]));
    }
    serde_json::Value::Object(map)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    PipelineStarted {
        run_id: String,
    },
    PipelineCompleted {},
    PipelineFailed {
        error: String,
    },
    StageStarted {
        node_id: String,
    },
    StageCompleted {
        node_id: String,
        outcome: String,
    },
    StageFailed {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StageRetrying {
        node_id: String,
        retry_count: u64,
    },
    GuardrailViolation {
        node_id: String,
        paths: Vec<String>,
    },
    CheckpointSaved {
        last_completed_node: String,
    },
}

// ---------------------------------------------------------------------------
// Trace records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TraceRecord {
    SessionInitialized {
        run_id: String,
        pipeline_path: String,
        workdir: String,
        workspace: String,
        resume: bool,
    },
    PipelineStarted {
        run_id: String,
        start_node: String,
    },
    PipelineCompleted {},
    PipelineFailed {
        error: String,
    },
    NodeInputCaptured {
        node_id: String,
        node_kind: String,
        node_shape: String,
        node_attrs: serde_json::Value,
        context_before: Context,
        workspace: String,
        node_artifact_dir: String,
    },
    NodeOutputCaptured {
        node_id: String,
        outcome: String,
        failure_reason: String,
        context_updates: serde_json::Value,
        context_after: Context,
        context_delta: ContextDelta,
        status_path: String,
    },
    RouteEvaluated {
        from_node: String,
        outcome: String,
        next_node: Option<String>,
        candidates: Vec<RouteCandidate>,
    },
    NodeExecutionErrored {
        node_id: String,
        error: String,
    },
    ResumeLoaded {
        last_completed_node: String,
        last_outcome: String,
        completed_nodes: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Append-only JSONL sinks
// ---------------------------------------------------------------------------

/// One JSONL file opened in append mode per write; records gain
/// `schema_version` and `at` on the way out.
#[derive(Debug, Clone)]
pub struct JsonlLog {
    path: PathBuf,
}

impl JsonlLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &impl Serialize) -> Result<()> {
        let mut value = serde_json::to_value(record)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("schema_version".into(), serde_json::json!(SCHEMA_VERSION));
            obj.insert("at".into(), serde_json::json!(now_rfc3339()));
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(&value)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON artifacts
// ---------------------------------------------------------------------------

/// Pretty-printed JSON with a trailing newline, the format of every
/// non-JSONL artifact in the run directory.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn append_stamps_schema_version_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("events.jsonl"));
        log.append(&Event::PipelineStarted { run_id: "r1".into() })
            .unwrap();
        log.append(&Event::StageStarted {
            node_id: "a".into(),
        })
        .unwrap();

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "PipelineStarted");
        assert_eq!(lines[0]["schema_version"], 1);
        assert!(lines[0]["at"].as_str().unwrap().contains('T'));
        assert_eq!(lines[1]["type"], "StageStarted");
        assert_eq!(lines[1]["node_id"], "a");
    }

    #[test]
    fn append_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("trace.jsonl"));
        for i in 0..3 {
            log.append(&TraceRecord::NodeExecutionErrored {
                node_id: format!("n{i}"),
                error: "boom".into(),
            })
            .unwrap();
        }
        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["node_id"], "n2");
    }

    #[test]
    fn stage_failed_omits_absent_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlLog::new(dir.path().join("events.jsonl"));
        log.append(&Event::StageFailed {
            node_id: "t".into(),
            failure_reason: Some("tool_exit_code_2".into()),
            error: None,
        })
        .unwrap();
        let lines = read_lines(log.path());
        assert_eq!(lines[0]["failure_reason"], "tool_exit_code_2");
        assert!(lines[0].get("error").is_none());
    }

    #[test]
    fn write_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_json(&path, &serde_json::json!({"k": "v"})).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.ends_with('\n'));
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back["k"], "v");
    }

    #[test]
    fn attr_map_to_json_converts_scalars() {
        use conveyor_dot::AttributeValue as A;
        let mut attrs = HashMap::new();
        attrs.insert("s".to_string(), A::String("x".into()));
        attrs.insert("i".to_string(), A::Integer(3));
        attrs.insert("b".to_string(), A::Boolean(true));
        attrs.insert(
            "d".to_string(),
            A::Duration(std::time::Duration::from_secs(2)),
        );
        let v = attr_map_to_json(&attrs);
        assert_eq!(v["s"], "x");
        assert_eq!(v["i"], 3);
        assert_eq!(v["b"], true);
        assert_eq!(v["d"], 2000);
    }
}
