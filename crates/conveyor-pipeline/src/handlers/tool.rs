//! Tool handler: one shell command relative to the workspace.

use std::path::Path;

use conveyor_types::{ConveyorError, Outcome, Result};

use crate::graph::PipelineNode;
use crate::guardrail::validate_tool_command;

/// Run the node's `tool_command` via `sh -c` with the workspace as working
/// directory. Stdout, stderr, and the exit code are persisted as artifact
/// files. A command rejected by the static filter fails without spawning
/// anything.
pub async fn execute(node: &PipelineNode, node_dir: &Path, workspace: &Path) -> Result<Outcome> {
    let command = node.attr_str("tool_command").ok_or_else(|| {
        ConveyorError::Handler {
            handler: "tool".into(),
            node: node.id.clone(),
            message: "tool_command required".into(),
        }
    })?;

    if let Err(reason) = validate_tool_command(&command) {
        tracing::warn!(node = %node.id, reason = %reason, "tool command rejected");
        return Ok(Outcome::fail(reason));
    }

    tracing::info!(node = %node.id, command = %command, "executing tool command");

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(&command)
        .current_dir(workspace)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let child = cmd.spawn().map_err(|e| ConveyorError::Handler {
        handler: "tool".into(),
        node: node.id.clone(),
        message: format!("failed to spawn command: {}", e),
    })?;

    let output = match node.timeout {
        Some(t) => tokio::time::timeout(t, child.wait_with_output())
            .await
            .map_err(|_| ConveyorError::Handler {
                handler: "tool".into(),
                node: node.id.clone(),
                message: format!("tool command timed out after {}s", t.as_secs()),
            })?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| ConveyorError::Handler {
        handler: "tool".into(),
        node: node.id.clone(),
        message: format!("command execution failed: {}", e),
    })?;

    let exit_code = output.status.code().unwrap_or(-1);
    std::fs::write(node_dir.join("tool.stdout.txt"), &output.stdout)?;
    std::fs::write(node_dir.join("tool.stderr.txt"), &output.stderr)?;
    std::fs::write(node_dir.join("tool.exitcode.txt"), format!("{}\n", exit_code))?;

    tracing::info!(
        node = %node.id,
        exit_code = exit_code,
        stdout_len = output.stdout.len(),
        stderr_len = output.stderr.len(),
        "tool command completed"
    );

    if output.status.success() {
        Ok(Outcome::success())
    } else {
        Ok(Outcome::fail(format!("tool_exit_code_{}", exit_code)))
    }
}
