//! Agent capability for Conveyor codergen stages.
//!
//! An agent is anything that can take a prompt and produce a structured
//! response: `run(prompt, node_id, node_artifact_dir, workspace) → response`.
//! Two backends are built in: a no-op stub that always succeeds, and an
//! adapter that drives an external CLI process with its read scope bounded
//! by the hide-and-restore protocol in [`isolation`].

pub mod external;
pub mod isolation;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conveyor_types::Result;

pub use external::{ExternalAgent, ExternalAgentOptions};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Everything an agent invocation gets to see.
#[derive(Debug, Clone, Copy)]
pub struct AgentRequest<'a> {
    pub prompt: &'a str,
    pub node_id: &'a str,
    /// Per-node artifact directory; backends write their logs here.
    pub node_dir: &'a Path,
    /// The run workspace the agent operates on.
    pub workspace: &'a Path,
}

/// Structured response parsed from an agent backend.
///
/// `outcome` must be one of the pipeline outcome tags; the adapter rejects
/// responses without one. `verification_plan` is passed through as raw JSON
/// and validated by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub preferred_next_label: String,
    #[serde(default)]
    pub suggested_next_ids: Vec<String>,
    #[serde(default)]
    pub context_updates: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub verification_plan: Option<serde_json::Value>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub failure_reason: String,
}

// ---------------------------------------------------------------------------
// Agent trait and backends
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, req: AgentRequest<'_>) -> Result<AgentResponse>;
}

/// Always-succeeding placeholder used when no real backend is configured.
pub struct StubAgent;

#[async_trait]
impl Agent for StubAgent {
    async fn run(&self, _req: AgentRequest<'_>) -> Result<AgentResponse> {
        Ok(AgentResponse {
            outcome: "success".into(),
            notes: "stub backend: no external agent configured; defaulting to success".into(),
            ..Default::default()
        })
    }
}
