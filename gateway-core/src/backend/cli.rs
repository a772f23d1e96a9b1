//! CLI backend (§4.C): executes a provider by spawning a subprocess.
//!
//! Two variants are provided. The plain [`CliBackend`] spawns one child per
//! call, waits to completion or the deadline, and kills the child on
//! timeout. [`InteractiveCliBackend`] instead keeps one long-lived child per
//! backend, serializes calls through a mutex, and reads stdout lines until a
//! sentinel prompt or the deadline.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{clean_cli_output, Backend, BackendResult, FailureKind};
use crate::config::CliProviderConfig;
use crate::error::{Error, Result};
use crate::model::{BackendKind, Request};

/// Sentinels the interactive variant watches for at the start of a stdout
/// line to recognize "the child is done and waiting for its next prompt".
const INTERACTIVE_SENTINELS: &[&str] = &["> ", ">>> "];

/// Resolves `command` to an absolute path via `$PATH`, matching the shell's
/// own lookup rules (first match across `PATH` entries, in order).
fn resolve_command(command: &str) -> Result<std::path::PathBuf> {
    if let Some(path) = which_on_path(command) {
        return Ok(path);
    }
    Err(Error::InvalidArgument(format!("command not found on $PATH: {command}")))
}

fn which_on_path(command: &str) -> Option<std::path::PathBuf> {
    let candidate = std::path::Path::new(command);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(command);
        if full.is_file() {
            return Some(full);
        }
    }
    None
}

/// Builds `first three argv tokens, elided` previews for `cli_executing`
/// events (§4.E, §11): never the full prompt.
pub fn command_preview(argv: &[String]) -> String {
    let preview: Vec<&str> = argv.iter().take(3).map(String::as_str).collect();
    let joined = preview.join(" ");
    if argv.len() > 3 {
        format!("{joined} ...")
    } else {
        joined
    }
}

/// Spawns one child process per call.
pub struct CliBackend {
    provider: String,
    resolved_command: std::path::PathBuf,
    args: Vec<String>,
}

impl CliBackend {
    pub fn new(provider: String, config: CliProviderConfig) -> Result<Self> {
        let resolved_command = resolve_command(&config.command)?;
        Ok(Self { provider, resolved_command, args: config.args })
    }

    fn argv(&self, message: &str) -> Vec<String> {
        let mut argv = vec![self.resolved_command.to_string_lossy().to_string()];
        argv.extend(self.args.iter().cloned());
        argv.push(message.to_string());
        argv
    }
}

#[async_trait]
impl Backend for CliBackend {
    #[tracing::instrument(skip(self, request), fields(provider = %self.provider, request_id = %request.id))]
    async fn execute(&self, request: &Request) -> BackendResult {
        let start = Instant::now();
        let timeout = Duration::from_secs(request.timeout_s);

        let mut cmd = Command::new(&self.resolved_command);
        cmd.args(&self.args).arg(&request.message).stdout(Stdio::piped()).stdin(Stdio::null()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return BackendResult::err(format!("failed to spawn: {e}"), FailureKind::SpawnFailure, elapsed_ms(start)),
        };

        // Hold `child` across the deadline so a timeout can still reach
        // `kill()` on it, rather than consuming it into `wait_with_output`.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let wait_for_exit = async {
            let status = child.wait().await?;
            let mut out = Vec::new();
            let mut err = Vec::new();
            if let Some(s) = stdout.as_mut() {
                use tokio::io::AsyncReadExt;
                let _ = s.read_to_end(&mut out).await;
            }
            if let Some(s) = stderr.as_mut() {
                use tokio::io::AsyncReadExt;
                let _ = s.read_to_end(&mut err).await;
            }
            Ok::<_, std::io::Error>((status, out, err))
        };

        match tokio::time::timeout(timeout, wait_for_exit).await {
            Ok(Ok((status, stdout, stderr))) => {
                let latency = elapsed_ms(start);
                if status.success() {
                    let stdout = String::from_utf8_lossy(&stdout);
                    BackendResult::ok(clean_cli_output(&stdout), latency)
                } else {
                    let stderr = String::from_utf8_lossy(&stderr);
                    BackendResult::err(format!("exit code {:?}: {}", status.code(), stderr.trim()), FailureKind::NonZeroExit, latency)
                }
            }
            Ok(Err(e)) => BackendResult::err(format!("child process I/O error: {e}"), FailureKind::SpawnFailure, elapsed_ms(start)),
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                BackendResult::err(format!("timed out after {}s", request.timeout_s), FailureKind::Timeout, elapsed_ms(start))
            }
        }
    }

    async fn health_check(&self) -> bool {
        which_on_path(&self.resolved_command.to_string_lossy()).is_some() || self.resolved_command.exists()
    }

    async fn shutdown(&self) {}

    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// A long-lived child process owned exclusively by one backend, guarded by
/// a FIFO mutex so concurrent callers are serialized rather than racing on
/// its stdin/stdout.
pub struct InteractiveCliBackend {
    provider: String,
    resolved_command: std::path::PathBuf,
    args: Vec<String>,
    child: Mutex<Child>,
}

impl InteractiveCliBackend {
    pub async fn new(provider: String, config: CliProviderConfig) -> Result<Self> {
        let resolved_command = resolve_command(&config.command)?;
        let child = spawn_interactive(&resolved_command, &config.args)?;
        Ok(Self { provider, resolved_command, args: config.args, child: Mutex::new(child) })
    }
}

fn spawn_interactive(command: &std::path::Path, args: &[String]) -> Result<Child> {
    Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::InvalidArgument(format!("failed to spawn interactive CLI backend: {e}")))
}

#[async_trait]
impl Backend for InteractiveCliBackend {
    #[tracing::instrument(skip(self, request), fields(provider = %self.provider, request_id = %request.id))]
    async fn execute(&self, request: &Request) -> BackendResult {
        let start = Instant::now();
        let timeout = Duration::from_secs(request.timeout_s);
        let mut child = self.child.lock().await;

        let write_and_read = async {
            let stdin = child.stdin.as_mut().ok_or_else(|| "child stdin closed".to_string())?;
            stdin
                .write_all(format!("{}\n", request.message).as_bytes())
                .await
                .map_err(|e| format!("failed to write prompt: {e}"))?;
            stdin.flush().await.map_err(|e| format!("failed to flush prompt: {e}"))?;

            let stdout = child.stdout.as_mut().ok_or_else(|| "child stdout closed".to_string())?;
            let mut reader = BufReader::new(stdout);
            let mut collected = String::new();
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await.map_err(|e| format!("failed to read stdout: {e}"))?;
                if n == 0 {
                    break; // child closed stdout
                }
                if INTERACTIVE_SENTINELS.iter().any(|s| line.starts_with(s)) {
                    break;
                }
                collected.push_str(&line);
            }
            Ok::<String, String>(collected)
        };

        match tokio::time::timeout(timeout, write_and_read).await {
            Ok(Ok(output)) => BackendResult::ok(clean_cli_output(&output), elapsed_ms(start)),
            Ok(Err(e)) => BackendResult::err(e, FailureKind::ProtocolError, elapsed_ms(start)),
            Err(_) => BackendResult::err("interactive CLI backend timed out", FailureKind::Timeout, elapsed_ms(start)),
        }
    }

    async fn health_check(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Grace period then force-kill, matching the interactive variant's
    /// shutdown discipline (§5 CLI subprocess lifecycle).
    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(id) = child.id() {
            tracing::info!(provider = %self.provider, pid = id, "shutting down interactive CLI backend");
        }
        if let Ok(None) = child.try_wait() {
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
            if let Ok(None) = child.try_wait() {
                let _ = child.kill().await;
            }
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CliInteractive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_preview_elides_beyond_three_tokens() {
        let argv = vec!["claude-cli".to_string(), "--model".to_string(), "opus".to_string(), "hello world".to_string()];
        assert_eq!(command_preview(&argv), "claude-cli --model opus ...");
    }

    #[test]
    fn command_preview_no_elision_under_three_tokens() {
        let argv = vec!["cli".to_string(), "arg".to_string()];
        assert_eq!(command_preview(&argv), "cli arg");
    }

    #[test]
    fn resolve_command_finds_absolute_path() {
        assert!(resolve_command("/bin/sh").is_ok() || resolve_command("/usr/bin/sh").is_ok());
    }

    #[test]
    fn resolve_command_rejects_unknown_binary() {
        assert!(resolve_command("definitely-not-a-real-cli-xyz").is_err());
    }
}
