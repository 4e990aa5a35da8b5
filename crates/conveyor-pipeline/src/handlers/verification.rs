//! Verification handler: deterministic file checks and allowlisted commands.
//!
//! The plan comes from run context (placed there by a codergen stage).
//! Commands are matched against the node's allowlist after normalization
//! and executed WITHOUT a shell: leading env assignments become process
//! environment, the rest is argv.

use std::path::{Path, PathBuf};

use serde::Serialize;

use conveyor_types::{Context, Outcome};

use crate::events::write_json;
use crate::graph::PipelineNode;
use crate::guardrail::validate_tool_command;
use crate::handlers::split_csv;
use crate::plan::parse_plan;

pub const DEFAULT_PLAN_CONTEXT_KEY: &str = "verification.plan";

/// Context key the plan is read from, overridable per node.
pub fn plan_context_key(node: &PipelineNode) -> String {
    node.attr_str("verification.plan_context_key")
        .unwrap_or_else(|| DEFAULT_PLAN_CONTEXT_KEY.to_string())
}

#[derive(Debug, Clone, Serialize)]
struct CommandResult {
    command: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone, Serialize)]
struct VerificationResults {
    checked_files: Vec<String>,
    commands: Vec<CommandResult>,
}

pub async fn execute(
    node: &PipelineNode,
    context: &Context,
    node_dir: &Path,
    workspace: &Path,
) -> conveyor_types::Result<Outcome> {
    let key = plan_context_key(node);
    let raw = match context.get(&key) {
        Some(v) => v,
        None => {
            return Ok(Outcome::fail(format!(
                "verification plan missing in context key: {}",
                key
            )))
        }
    };
    let plan = match parse_plan(raw, Some(workspace)) {
        Ok(p) => p,
        Err(e) => return Ok(Outcome::fail(e)),
    };
    write_json(&node_dir.join("verification.plan.json"), &plan)?;

    let allowed_prefixes = split_csv(
        node.attr_str("verification.allowed_commands")
            .unwrap_or_default()
            .as_str(),
    );
    if allowed_prefixes.is_empty() {
        return Ok(Outcome::fail("verification.allowed_commands is required"));
    }

    for f in &plan.files {
        if !workspace.join(f).exists() {
            return Ok(Outcome::fail(format!("required file missing: {}", f)));
        }
    }

    let working_dir = match resolve_workdir(workspace, node.attr_str("verification.workdir")) {
        Ok(d) => d,
        Err(e) => return Ok(Outcome::fail(e)),
    };

    let mut results = VerificationResults {
        checked_files: plan.files.clone(),
        commands: Vec::with_capacity(plan.commands.len()),
    };
    for command in &plan.commands {
        if let Err(reason) = validate_tool_command(command) {
            return Ok(Outcome::fail(reason));
        }
        if !command_allowed(command, &allowed_prefixes) {
            return Ok(Outcome::fail(format!(
                "verification command not allowed: {}",
                command
            )));
        }
        let parsed = match parse_exec_command(command, &working_dir) {
            Ok(p) => p,
            Err(e) => return Ok(Outcome::fail(e)),
        };

        tracing::info!(node = %node.id, command = %command, "running verification command");
        let mut cmd = tokio::process::Command::new(&parsed.name);
        cmd.args(&parsed.args)
            .current_dir(&working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in &parsed.env {
            cmd.env(k, v);
        }
        let output = cmd.output().await.map_err(|e| {
            conveyor_types::ConveyorError::Handler {
                handler: "verification".into(),
                node: node.id.clone(),
                message: format!("failed to run {}: {}", parsed.name, e),
            }
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        results.commands.push(CommandResult {
            command: command.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
        if exit_code != 0 {
            write_json(&node_dir.join("verification.results.json"), &results)?;
            return Ok(Outcome::fail(format!(
                "verification command failed: {} (exit={})",
                command, exit_code
            )));
        }
    }

    write_json(&node_dir.join("verification.results.json"), &results)?;
    Ok(Outcome::success())
}

/// Resolve `verification.workdir` under the workspace. Absolute paths,
/// parent segments, and missing or non-directory targets are rejected.
fn resolve_workdir(workspace: &Path, configured: Option<String>) -> Result<PathBuf, String> {
    let configured = match configured {
        Some(c) => c,
        None => return Ok(workspace.to_path_buf()),
    };
    if configured.starts_with('/') {
        return Err("verification.workdir must be relative".into());
    }
    for seg in configured.split('/') {
        if seg == ".." {
            return Err("verification.workdir cannot contain parent segment".into());
        }
    }
    let dir = workspace.join(&configured);
    match std::fs::metadata(&dir) {
        Ok(meta) if meta.is_dir() => Ok(dir),
        Ok(_) => Err(format!(
            "verification.workdir is not a directory: {}",
            configured
        )),
        Err(_) => Err(format!("verification.workdir missing: {}", configured)),
    }
}

/// Shell metacharacters that would defeat shell-free execution.
fn has_unsafe_shell_syntax(command: &str) -> bool {
    const UNSAFE: [&str; 10] = ["&&", "||", ";", "|", "`", "$(", ">", "<", "\n", "\r"];
    UNSAFE.iter().any(|t| command.contains(t))
}

/// Normalize a command for allowlist matching, iterating to fixed point:
/// strip wrapping parentheses, leading env assignments, and leading
/// `cd … &&` / `export … &&` wrappers.
pub fn normalize_for_allowlist(command: &str) -> String {
    let mut cmd = command.trim().to_string();
    loop {
        let original = cmd.clone();
        cmd = trim_wrapping_parens(&cmd);
        cmd = strip_leading_env_assignments(&cmd);
        cmd = strip_leading_shell_wrappers(&cmd);
        cmd = cmd.trim().to_string();
        if cmd == original {
            break;
        }
    }
    cmd
}

/// True when the normalized command exactly equals an allowlist entry or
/// begins with entry + single space. Unsafe shell syntax never matches.
pub fn command_allowed(command: &str, allowed_prefixes: &[String]) -> bool {
    if has_unsafe_shell_syntax(command) {
        return false;
    }
    let cmd = normalize_for_allowlist(command);
    allowed_prefixes.iter().any(|p| {
        let p = p.trim();
        !p.is_empty() && (cmd == p || cmd.starts_with(&format!("{} ", p)))
    })
}

fn trim_wrapping_parens(cmd: &str) -> String {
    let mut cmd = cmd.trim();
    while cmd.len() >= 2 && cmd.starts_with('(') && cmd.ends_with(')') {
        let inner = cmd[1..cmd.len() - 1].trim();
        if inner.is_empty() {
            break;
        }
        cmd = inner;
    }
    cmd.to_string()
}

fn is_env_assignment_token(tok: &str) -> bool {
    if tok.is_empty() || tok.starts_with('=') || tok.ends_with('=') {
        return false;
    }
    let Some(eq) = tok.find('=') else {
        return false;
    };
    let key = &tok[..eq];
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn strip_leading_env_assignments(cmd: &str) -> String {
    let fields: Vec<&str> = cmd.split_whitespace().collect();
    let mut i = 0;
    while i < fields.len() && is_env_assignment_token(fields[i]) {
        i += 1;
    }
    if i == 0 {
        cmd.to_string()
    } else {
        fields[i..].join(" ")
    }
}

fn strip_leading_shell_wrappers(cmd: &str) -> String {
    let trimmed = cmd.trim();
    if trimmed.starts_with("export ") || trimmed.starts_with("cd ") {
        if let Some(idx) = trimmed.find("&&") {
            return trimmed[idx + 2..].trim().to_string();
        }
    }
    cmd.to_string()
}

struct ParsedCommand {
    env: Vec<(String, String)>,
    name: String,
    args: Vec<String>,
}

/// Whitespace-split the command into env bindings plus argv. No shell
/// expansion happens apart from `$PWD`/`${PWD}` in env values, which
/// resolve to the verification working directory.
fn parse_exec_command(command: &str, working_dir: &Path) -> Result<ParsedCommand, String> {
    let command = command.trim();
    if command.is_empty() {
        return Err("verification command cannot be empty".into());
    }
    if has_unsafe_shell_syntax(command) {
        return Err("verification command rejected: contains unsafe shell syntax".into());
    }
    let fields: Vec<&str> = command.split_whitespace().collect();
    let mut env = Vec::new();
    let mut i = 0;
    while i < fields.len() && is_env_assignment_token(fields[i]) {
        let eq = fields[i].find('=').expect("assignment token has =");
        let key = fields[i][..eq].to_string();
        let val = expand_env_value(&fields[i][eq + 1..], working_dir);
        env.push((key, val));
        i += 1;
    }
    if i >= fields.len() {
        return Err("verification command missing executable".into());
    }
    Ok(ParsedCommand {
        env,
        name: fields[i].to_string(),
        args: fields[i + 1..].iter().map(|s| s.to_string()).collect(),
    })
}

fn expand_env_value(raw: &str, working_dir: &Path) -> String {
    let mut raw = raw.trim();
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        if (bytes[0] == b'"' && bytes[raw.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[raw.len() - 1] == b'\'')
        {
            raw = &raw[1..raw.len() - 1];
        }
    }
    let wd = working_dir.to_string_lossy();
    raw.replace("${PWD}", &wd).replace("$PWD", &wd)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineGraph;
    use conveyor_types::OutcomeKind;

    fn verify_node(extra_attrs: &str) -> PipelineNode {
        let dot = format!(
            r#"digraph G {{ verify [shape=parallelogram, type=verification{}] }}"#,
            extra_attrs
        );
        PipelineGraph::from_dot(conveyor_dot::parse(&dot).unwrap())
            .node("verify")
            .unwrap()
            .clone()
    }

    fn plan_context(key: &str, plan: serde_json::Value) -> Context {
        let mut ctx = Context::new();
        ctx.set(key, plan);
        ctx
    }

    #[test]
    fn normalization_reaches_fixed_point() {
        assert_eq!(
            normalize_for_allowlist(r#"GOCACHE="$PWD/.gocache" go test ./..."#),
            "go test ./..."
        );
        assert_eq!(normalize_for_allowlist("(go test ./...)"), "go test ./...");
        assert_eq!(
            normalize_for_allowlist("(A=1 B=2 (go vet ./...))"),
            "go vet ./..."
        );
        assert_eq!(normalize_for_allowlist("go build"), "go build");
    }

    #[test]
    fn allowlist_requires_exact_or_prefix_plus_space() {
        let allowed = vec!["go test".to_string()];
        assert!(command_allowed("go test", &allowed));
        assert!(command_allowed("go test ./...", &allowed));
        assert!(command_allowed(r#"GOCACHE="$PWD/.gocache" go test ./..."#, &allowed));
        assert!(!command_allowed("go testx", &allowed));
        assert!(!command_allowed("go vet ./...", &allowed));
    }

    #[test]
    fn unsafe_shell_syntax_never_matches() {
        let allowed = vec!["go test".to_string()];
        for cmd in [
            "go test; rm -rf x",
            "go test && echo ok",
            "go test | tee log",
            "go test > out.txt",
            "go test `id`",
            "go test $(id)",
        ] {
            assert!(!command_allowed(cmd, &allowed), "{cmd} should be rejected");
        }
    }

    #[test]
    fn parse_exec_command_splits_env_and_argv() {
        let parsed =
            parse_exec_command(r#"GOCACHE="$PWD/.gocache" go test ./..."#, Path::new("/wd"))
                .unwrap();
        assert_eq!(parsed.env, vec![("GOCACHE".to_string(), "/wd/.gocache".to_string())]);
        assert_eq!(parsed.name, "go");
        assert_eq!(parsed.args, vec!["test".to_string(), "./...".to_string()]);
    }

    #[test]
    fn parse_exec_command_requires_executable() {
        assert!(parse_exec_command("A=1 B=2", Path::new("/wd")).is_err());
        assert!(parse_exec_command("   ", Path::new("/wd")).is_err());
    }

    #[tokio::test]
    async fn missing_plan_fails() {
        let root = tempfile::tempdir().unwrap();
        let node = verify_node(r#", "verification.allowed_commands"="true""#);
        let out = execute(&node, &Context::new(), root.path(), root.path())
            .await
            .unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out
            .failure_reason
            .contains("verification plan missing in context key: verification.plan"));
    }

    #[tokio::test]
    async fn plan_key_override_is_honored() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(ws.join("main.go"), "package main\n").unwrap();

        let node = verify_node(
            r#", "verification.allowed_commands"="test -f", "verification.plan_context_key"="custom.plan""#,
        );
        let ctx = plan_context(
            "custom.plan",
            serde_json::json!({"files": ["main.go"], "commands": ["test -f main.go"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Success);
    }

    #[tokio::test]
    async fn missing_required_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node(r#", "verification.allowed_commands"="true""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": ["absent.go"], "commands": ["true"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out.failure_reason.contains("required file missing: absent.go"));
    }

    #[tokio::test]
    async fn disallowed_command_fails_before_running() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node(r#", "verification.allowed_commands"="go test""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["echo hi"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out.failure_reason.contains("verification command not allowed: echo hi"));
        assert!(!node_dir.join("verification.results.json").exists());
    }

    #[tokio::test]
    async fn command_with_semicolon_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node(r#", "verification.allowed_commands"="echo""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["echo hi; echo bye"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
    }

    #[tokio::test]
    async fn failing_command_records_results_and_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node(r#", "verification.allowed_commands"="test -f""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["test -f does_not_exist.txt"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out.failure_reason.contains("verification command failed"));
        assert!(out.failure_reason.contains("exit=1"));

        let results: serde_json::Value =
            crate::events::read_json(&node_dir.join("verification.results.json")).unwrap();
        assert_eq!(results["commands"][0]["exit_code"], 1);
    }

    #[tokio::test]
    async fn success_persists_plan_and_results() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(ws.join("main.go"), "package main\n").unwrap();

        let node = verify_node(r#", "verification.allowed_commands"="test -f""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": ["main.go"], "commands": ["test -f main.go"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Success);
        assert!(node_dir.join("verification.plan.json").exists());
        let results: serde_json::Value =
            crate::events::read_json(&node_dir.join("verification.results.json")).unwrap();
        assert_eq!(results["checked_files"][0], "main.go");
        assert_eq!(results["commands"][0]["command"], "test -f main.go");
        assert_eq!(results["commands"][0]["exit_code"], 0);
    }

    #[tokio::test]
    async fn env_prefixed_command_runs_without_shell() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        // `env` prints its bindings; prove the assignment reached the child
        // with $PWD expanded.
        let node = verify_node(r#", "verification.allowed_commands"="env""#);
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["MARKER=\"$PWD/.cache\" env"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Success);
        let results: serde_json::Value =
            crate::events::read_json(&node_dir.join("verification.results.json")).unwrap();
        let stdout = results["commands"][0]["stdout"].as_str().unwrap();
        assert!(stdout.contains(&format!("MARKER={}/.cache", ws.display())));
        // The original command text is preserved in the results
        assert!(results["commands"][0]["command"]
            .as_str()
            .unwrap()
            .contains("$PWD"));
    }

    #[tokio::test]
    async fn configured_workdir_is_used() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(ws.join("agent")).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(ws.join("agent/main.go"), "package main\n").unwrap();

        let node = verify_node(
            r#", "verification.allowed_commands"="test -f", "verification.workdir"="agent""#,
        );
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": ["agent/main.go"], "commands": ["test -f main.go"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Success);
    }

    #[tokio::test]
    async fn missing_workdir_fails() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node(
            r#", "verification.allowed_commands"="true", "verification.workdir"="nope""#,
        );
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["true"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out.failure_reason.contains("verification.workdir missing: nope"));
    }

    #[tokio::test]
    async fn missing_allowlist_attribute_fails() {
        let root = tempfile::tempdir().unwrap();
        let ws = root.path().join("ws");
        let node_dir = root.path().join("node");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&node_dir).unwrap();

        let node = verify_node("");
        let ctx = plan_context(
            DEFAULT_PLAN_CONTEXT_KEY,
            serde_json::json!({"files": [], "commands": ["true"]}),
        );
        let out = execute(&node, &ctx, &node_dir, &ws).await.unwrap();
        assert_eq!(out.outcome, OutcomeKind::Fail);
        assert!(out
            .failure_reason
            .contains("verification.allowed_commands is required"));
    }
}
