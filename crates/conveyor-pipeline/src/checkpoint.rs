//! Checkpoint save/load for resume.
//!
//! The checkpoint is rewritten after every completed stage; it is the
//! authoritative record a resumed run continues from.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use conveyor_types::{Context, Result};

use crate::events::{read_json, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub last_completed_node: String,
    /// Sorted ids of every node completed so far.
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub context: Context,
}

pub fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    write_json(path, checkpoint)?;
    tracing::debug!(path = %path.display(), last = %checkpoint.last_completed_node, "checkpoint saved");
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut context = Context::new();
        context.set("graph.goal", serde_json::json!("ship it"));
        let mut retry_counts = BTreeMap::new();
        retry_counts.insert("a".to_string(), 2u64);

        let cp = Checkpoint {
            schema_version: 1,
            run_id: "r1".into(),
            last_completed_node: "a".into(),
            completed_nodes: vec!["a".into(), "start".into()],
            retry_counts,
            context,
        };
        save_checkpoint(&path, &cp).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.run_id, "r1");
        assert_eq!(loaded.last_completed_node, "a");
        assert_eq!(loaded.completed_nodes, vec!["a".to_string(), "start".to_string()]);
        assert_eq!(loaded.retry_counts.get("a"), Some(&2));
        assert_eq!(loaded.context.get_str("graph.goal"), Some("ship it"));
    }

    #[test]
    fn load_tolerates_missing_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(
            &path,
            r#"{"schema_version":1,"run_id":"r","last_completed_node":"n","completed_nodes":["n"]}"#,
        )
        .unwrap();
        let cp = load_checkpoint(&path).unwrap();
        assert!(cp.retry_counts.is_empty());
        assert!(cp.context.values().is_empty());
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_checkpoint(&dir.path().join("nope.json")).is_err());
    }
}
