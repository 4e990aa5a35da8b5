//! External-process agent adapter.
//!
//! Spawns a configured CLI executable, feeds it the prompt on stdin with a
//! "return only JSON" trailer, streams its stdout/stderr into per-node log
//! files while a heartbeat ticker reports liveness, and parses the structured
//! response the process writes to `response.md`. The workspace subtrees the
//! agent must not read are hidden for the duration of the call (see
//! [`crate::isolation`]).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use conveyor_types::{ConveyorError, Result};

use crate::isolation::{hide_paths, strict_scope_blocked, RestoreGuard};
use crate::{Agent, AgentRequest, AgentResponse};

/// JSON shape the external process must write to its output file.
const AGENT_OUTCOME_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "title": "ConveyorAgentOutcome",
  "type": "object",
  "additionalProperties": false,
  "required": ["outcome", "preferred_next_label", "suggested_next_ids", "context_updates", "verification_plan", "notes", "failure_reason"],
  "properties": {
    "outcome": {
      "type": "string",
      "enum": ["success", "fail", "retry", "partial_success"]
    },
    "preferred_next_label": { "type": "string" },
    "suggested_next_ids": {
      "type": "array",
      "items": { "type": "string" }
    },
    "context_updates": {
      "type": "object",
      "properties": {},
      "additionalProperties": false
    },
    "verification_plan": {
      "anyOf": [
        { "type": "null" },
        {
          "type": "object",
          "additionalProperties": false,
          "required": ["files", "commands"],
          "properties": {
            "files": { "type": "array", "items": { "type": "string" } },
            "commands": { "type": "array", "items": { "type": "string" } }
          }
        }
      ]
    },
    "notes": { "type": "string" },
    "failure_reason": { "type": "string" }
  }
}"#;

/// Configuration for one external-agent invocation.
#[derive(Debug, Clone)]
pub struct ExternalAgentOptions {
    /// Executable to spawn. Bare names resolve via PATH; paths are validated
    /// to exist and be executable before spawning.
    pub executable: String,
    /// Working directory for the subprocess, resolved under the workspace.
    pub workdir: PathBuf,
    /// Additional directories the agent may read (strict scope keeps them).
    pub add_dirs: Vec<PathBuf>,
    /// Extra arguments inserted before the adapter-managed ones.
    pub extra_args: Vec<String>,
    /// Workspace-relative subtrees to hide while the agent runs.
    pub block_read_paths: Vec<String>,
    /// Hide every top-level workspace entry outside the agent's declared
    /// scope (workdir, add_dirs, executable).
    pub strict_read_scope: bool,
    pub timeout: Option<Duration>,
    pub heartbeat: Duration,
}

impl ExternalAgentOptions {
    pub fn new(executable: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            workdir: workdir.into(),
            add_dirs: Vec::new(),
            extra_args: Vec::new(),
            block_read_paths: Vec::new(),
            strict_read_scope: false,
            timeout: None,
            heartbeat: Duration::from_secs(15),
        }
    }
}

pub struct ExternalAgent {
    opts: ExternalAgentOptions,
}

impl ExternalAgent {
    pub fn new(opts: ExternalAgentOptions) -> Self {
        Self { opts }
    }
}

/// A path-like executable must exist and carry an execute bit. Bare command
/// names are left to PATH lookup at spawn time.
fn validate_configured_executable(executable: &str) -> Result<()> {
    if executable.trim().is_empty() || !executable.contains('/') {
        return Ok(());
    }
    let meta = match std::fs::metadata(executable) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConveyorError::Other(format!(
                "configured agent executable not found: {} (point agent.path at an existing executable or create it before running)",
                executable
            )));
        }
        Err(e) => {
            return Err(ConveyorError::Other(format!(
                "failed to stat configured agent executable {}: {}",
                executable, e
            )));
        }
    };
    if meta.is_dir() {
        return Err(ConveyorError::Other(format!(
            "configured agent executable is a directory: {}",
            executable
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ConveyorError::Other(format!(
                "configured agent executable is not executable: {}",
                executable
            )));
        }
    }
    Ok(())
}

fn build_exec_args(
    opts: &ExternalAgentOptions,
    schema_path: &Path,
    output_path: &Path,
) -> Vec<String> {
    let mut args = opts.extra_args.clone();
    args.push("exec".into());
    args.push("-C".into());
    args.push(opts.workdir.to_string_lossy().into_owned());
    for d in &opts.add_dirs {
        args.push("--add-dir".into());
        args.push(d.to_string_lossy().into_owned());
    }
    args.push("--output-schema".into());
    args.push(schema_path.to_string_lossy().into_owned());
    args.push("-o".into());
    args.push(output_path.to_string_lossy().into_owned());
    args.push("-".into());
    args
}

#[async_trait]
impl Agent for ExternalAgent {
    async fn run(&self, req: AgentRequest<'_>) -> Result<AgentResponse> {
        let schema_path = req.node_dir.join("agent.output.schema.json");
        let output_path = req.node_dir.join("response.md");
        let stdout_path = req.node_dir.join("agent.stdout.log");
        let stderr_path = req.node_dir.join("agent.stderr.log");
        let args_path = req.node_dir.join("agent.args.txt");

        validate_configured_executable(&self.opts.executable)?;

        std::fs::write(&schema_path, format!("{}\n", AGENT_OUTCOME_SCHEMA))?;
        let args = build_exec_args(&self.opts, &schema_path, &output_path);
        std::fs::write(
            &args_path,
            format!("{} {}\n", self.opts.executable, args.join(" ")),
        )?;

        // Bound the agent's read scope before it starts.
        let mut guard = RestoreGuard::new(hide_paths(
            req.workspace,
            req.node_dir,
            &self.opts.block_read_paths,
        )?);
        if self.opts.strict_read_scope {
            let scoped = strict_scope_blocked(
                req.workspace,
                &self.opts.workdir,
                &self.opts.add_dirs,
                &self.opts.executable,
            )?;
            if !scoped.is_empty() {
                guard.extend(hide_paths(req.workspace, req.node_dir, &scoped)?);
            }
        }

        let result = self
            .run_subprocess(req, &args, &output_path, &stdout_path, &stderr_path)
            .await;

        // Restore on every exit path. A restore failure on the success path
        // outranks the agent result: the workspace is no longer trustworthy.
        match guard.restore() {
            Ok(()) => result,
            Err(restore_err) => match result {
                Ok(_) => Err(restore_err),
                Err(run_err) => {
                    tracing::error!(node = req.node_id, error = %restore_err, "failed to restore hidden paths");
                    Err(run_err)
                }
            },
        }
    }
}

impl ExternalAgent {
    async fn run_subprocess(
        &self,
        req: AgentRequest<'_>,
        args: &[String],
        output_path: &Path,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<AgentResponse> {
        let mut cmd = tokio::process::Command::new(&self.opts.executable);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            ConveyorError::Other(format!(
                "failed to spawn agent executable {}: {}",
                self.opts.executable, e
            ))
        })?;

        tracing::info!(
            node = req.node_id,
            executable = %self.opts.executable,
            workdir = %self.opts.workdir.display(),
            timeout_secs = self.opts.timeout.map(|t| t.as_secs()),
            stdout_log = %stdout_path.display(),
            stderr_log = %stderr_path.display(),
            "agent exec started"
        );

        // Prompt on stdin with a trailer nudging the process toward the schema.
        let mut stdin = child.stdin.take().expect("stdin piped");
        let prompt = format!(
            "{}\n\nReturn only JSON matching the provided schema.",
            req.prompt
        );
        stdin.write_all(prompt.as_bytes()).await?;
        drop(stdin);

        // Drain both streams into their log files incrementally so they can
        // be tailed while the process runs.
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout_file = tokio::fs::File::create(stdout_path).await?;
        let stderr_file = tokio::fs::File::create(stderr_path).await?;
        let log_stream = live_stream_logging_enabled();
        let out_task = tokio::spawn(drain_stream(
            stdout,
            stdout_file,
            "stdout",
            req.node_id.to_string(),
            log_stream,
        ));
        let err_task = tokio::spawn(drain_stream(
            stderr,
            stderr_file,
            "stderr",
            req.node_id.to_string(),
            log_stream,
        ));

        let heartbeat = self.opts.heartbeat;
        let heartbeat_node = req.node_id.to_string();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                tracing::info!(
                    node = %heartbeat_node,
                    heartbeat_secs = heartbeat.as_secs(),
                    "agent exec still running"
                );
            }
        });

        let wait_result = match self.opts.timeout {
            Some(t) => match tokio::time::timeout(t, child.wait()).await {
                Ok(status) => status.map_err(ConveyorError::from),
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    heartbeat_task.abort();
                    let _ = out_task.await;
                    let _ = err_task.await;
                    tracing::error!(
                        node = req.node_id,
                        timeout_secs = t.as_secs(),
                        "agent exec timed out"
                    );
                    return Err(ConveyorError::AgentTimeout {
                        node: req.node_id.to_string(),
                        timeout_secs: t.as_secs(),
                    });
                }
            },
            None => child.wait().await.map_err(ConveyorError::from),
        };

        let out_drained = out_task.await;
        let err_drained = err_task.await;
        heartbeat_task.abort();

        let status = wait_result?;
        out_drained
            .map_err(|e| ConveyorError::Other(format!("stdout drain task failed: {}", e)))??;
        err_drained
            .map_err(|e| ConveyorError::Other(format!("stderr drain task failed: {}", e)))??;

        if !status.success() {
            return Err(ConveyorError::Other(format!(
                "agent exec failed with {} (see {})",
                status,
                stderr_path.display()
            )));
        }
        tracing::info!(
            node = req.node_id,
            response_path = %output_path.display(),
            "agent exec completed"
        );

        let raw = std::fs::read_to_string(output_path).map_err(|e| {
            ConveyorError::Other(format!(
                "agent output missing: {}: {}",
                output_path.display(),
                e
            ))
        })?;
        let parsed: AgentResponse = serde_json::from_str(&raw).map_err(|e| {
            ConveyorError::Other(format!(
                "agent output is not valid JSON ({}): {}",
                output_path.display(),
                e
            ))
        })?;
        if parsed.outcome.trim().is_empty() {
            return Err(ConveyorError::Other(format!(
                "agent output missing outcome: {}",
                output_path.display()
            )));
        }
        Ok(parsed)
    }
}

fn live_stream_logging_enabled() -> bool {
    matches!(
        std::env::var("CONVEYOR_LOG_AGENT_STREAM")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

/// Copy the stream into its log file incrementally; when live logging is
/// on, complete lines are also echoed through tracing.
async fn drain_stream(
    reader: impl tokio::io::AsyncRead + Unpin,
    mut sink: tokio::fs::File,
    stream: &'static str,
    node_id: String,
    log_stream: bool,
) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut reader = reader;
    let mut buf = [0u8; 4096];
    let mut pending = String::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        if log_stream {
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));
            while let Some(pos) = pending.find(['\n', '\r']) {
                let line: String = pending.drain(..=pos).collect();
                let line = line.trim();
                if !line.is_empty() {
                    tracing::info!(node = %node_id, stream = stream, line = %line, "agent stream");
                }
            }
        }
    }
    if log_stream && !pending.trim().is_empty() {
        tracing::info!(node = %node_id, stream = stream, line = %pending.trim(), "agent stream");
    }
    sink.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[cfg(unix)]
    fn write_executable(path: &Path, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, script).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn validate_executable_accepts_bare_names() {
        validate_configured_executable("agent-cli").unwrap();
        validate_configured_executable("").unwrap();
    }

    #[test]
    fn validate_executable_rejects_missing_path() {
        let err = validate_configured_executable("/definitely/not/here").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here"));
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[test]
    fn validate_executable_rejects_non_executable_file() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("plain.txt");
        fs::write(&p, "data").unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(0o644)).unwrap();
        let err = validate_configured_executable(p.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn build_exec_args_shape() {
        let opts = ExternalAgentOptions::new("agent-cli", "/ws");
        let args = build_exec_args(&opts, Path::new("/n/schema.json"), Path::new("/n/out.md"));
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "-C");
        assert_eq!(args[2], "/ws");
        assert!(args.contains(&"--output-schema".to_string()));
        assert_eq!(args.last(), Some(&"-".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_agent_runs_script_and_parses_response() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        fs::create_dir_all(&ws).unwrap();
        fs::create_dir_all(&node_dir).unwrap();

        // A fake agent that consumes stdin and writes a response file to the
        // path given after -o.
        let exe = root.path().join("bin/fake-agent");
        write_executable(
            &exe,
            r#"#!/bin/sh
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
cat > /dev/null
echo "working" >&2
printf '{"outcome":"success","preferred_next_label":"","suggested_next_ids":[],"context_updates":{},"verification_plan":null,"notes":"done","failure_reason":""}' > "$out"
"#,
        );

        let opts = ExternalAgentOptions::new(exe.to_str().unwrap(), ws.clone());
        let agent = ExternalAgent::new(opts);
        let resp = agent
            .run(AgentRequest {
                prompt: "build the thing",
                node_id: "gen",
                node_dir: &node_dir,
                workspace: &ws,
            })
            .await
            .unwrap();

        assert_eq!(resp.outcome, "success");
        assert_eq!(resp.notes, "done");
        assert!(node_dir.join("agent.output.schema.json").exists());
        assert!(node_dir.join("agent.args.txt").exists());
        let stderr_log = fs::read_to_string(node_dir.join("agent.stderr.log")).unwrap();
        assert!(stderr_log.contains("working"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_agent_hides_blocked_paths_during_run() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        fs::create_dir_all(ws.join("scripts/scenarios")).unwrap();
        fs::write(ws.join("scripts/scenarios/case.sh"), "echo hidden").unwrap();
        fs::create_dir_all(&node_dir).unwrap();

        // The fake agent proves the blocked path is invisible while it runs.
        let exe = root.path().join("bin/fake-agent");
        write_executable(
            &exe,
            &format!(
                r#"#!/bin/sh
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
cat > /dev/null
if [ -e "{}" ]; then outcome=fail; else outcome=success; fi
printf '{{"outcome":"%s"}}' "$outcome" > "$out"
"#,
                ws.join("scripts/scenarios").display()
            ),
        );

        let mut opts = ExternalAgentOptions::new(exe.to_str().unwrap(), ws.clone());
        opts.block_read_paths = vec!["scripts/scenarios/".into()];
        let agent = ExternalAgent::new(opts);
        let resp = agent
            .run(AgentRequest {
                prompt: "peek",
                node_id: "gen",
                node_dir: &node_dir,
                workspace: &ws,
            })
            .await
            .unwrap();

        assert_eq!(resp.outcome, "success", "blocked path was visible to the agent");
        // And it is back afterwards.
        assert!(ws.join("scripts/scenarios/case.sh").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_agent_times_out_distinctly() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        fs::create_dir_all(&ws).unwrap();
        fs::create_dir_all(&node_dir).unwrap();

        let exe = root.path().join("bin/slow-agent");
        write_executable(&exe, "#!/bin/sh\ncat > /dev/null\nsleep 30\n");

        let mut opts = ExternalAgentOptions::new(exe.to_str().unwrap(), ws.clone());
        opts.timeout = Some(Duration::from_millis(200));
        let agent = ExternalAgent::new(opts);
        let err = agent
            .run(AgentRequest {
                prompt: "hang",
                node_id: "gen",
                node_dir: &node_dir,
                workspace: &ws,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConveyorError::AgentTimeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_agent_reports_missing_response_file() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        fs::create_dir_all(&ws).unwrap();
        fs::create_dir_all(&node_dir).unwrap();

        let exe = root.path().join("bin/quiet-agent");
        write_executable(&exe, "#!/bin/sh\ncat > /dev/null\nexit 0\n");

        let agent = ExternalAgent::new(ExternalAgentOptions::new(exe.to_str().unwrap(), ws.clone()));
        let err = agent
            .run(AgentRequest {
                prompt: "say nothing",
                node_id: "gen",
                node_dir: &node_dir,
                workspace: &ws,
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("agent output missing"));
        assert!(err.to_string().contains("response.md"));
    }
}
