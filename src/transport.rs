//! Boundary to the external transport CLI (`gh codespace ...`).
//!
//! Every interaction with the codespace goes through a [`Transport`]:
//!
//! - **One-shot** ([`Transport::exec`]): run a `gh` subcommand, capture
//!   output, return. Used for listing codespaces, copying scripts, `chmod`.
//! - **Long-running**: [`Transport::forward_command`],
//!   [`Transport::monitor_command`] and [`Transport::interactive_command`]
//!   build commands whose lifetime is owned by the caller.
//!
//! All spawned children set `kill_on_drop(true)` so they cannot outlive the
//! task that owns them.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::forward::{Cancellable, ProcessTunnel, TunnelLauncher};

/// Max output size per stream for [`Transport::exec`] (1 MB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded. A truncation notice is appended to the returned
/// string.
const MAX_EXEC_OUTPUT: usize = 1024 * 1024;

/// Default timeout for one-shot transport commands.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// The external transport program and the codespace it targets.
#[derive(Debug, Clone)]
pub struct Transport {
    program: String,
    codespace: String,
}

/// Successful result of [`Transport::exec`].
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
}

/// Errors from one-shot transport commands.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The program could not be started (e.g. not found, permission denied).
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed { program: String, source: io::Error },
    /// The child started but `wait()` failed.
    #[error("process error: {0}")]
    ProcessFailed(String),
    /// The command ran and exited non-zero.
    #[error("{command} exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
    /// The command exceeded its timeout and was killed.
    #[error("{0} timed out")]
    Timeout(String),
}

impl Transport {
    pub fn new(program: impl Into<String>, codespace: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            codespace: codespace.into(),
        }
    }

    pub fn codespace(&self) -> &str {
        &self.codespace
    }

    /// Run `<program> <args...>` to completion and capture its output.
    ///
    /// Stdout and stderr are read concurrently and each capped at 1 MB. A
    /// non-zero exit is reported as [`TransportError::Failed`] with the
    /// trimmed stderr.
    pub async fn exec<I, S>(&self, args: I, timeout: Duration) -> Result<ExecOutput, TransportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        exec_program(&self.program, args, timeout).await
    }

    /// Copy a local file into the codespace (`gh codespace cp -e`).
    pub async fn copy_to_remote(&self, local: &str, remote: &str) -> Result<(), TransportError> {
        let dest = format!("remote:{remote}");
        self.exec(
            ["codespace", "cp", "-c", &self.codespace, "-e", local, &dest],
            DEFAULT_EXEC_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Run a command inside the codespace over a non-interactive ssh.
    pub async fn remote_run(&self, command: &[&str]) -> Result<ExecOutput, TransportError> {
        let mut args = vec!["codespace", "ssh", "--codespace", &self.codespace, "--"];
        args.extend_from_slice(command);
        self.exec(args, DEFAULT_EXEC_TIMEOUT).await
    }

    /// `gh codespace ports forward <port>:<port> --codespace <name>`.
    pub fn forward_command(&self, port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "codespace",
            "ports",
            "forward",
            &format!("{port}:{port}"),
            "--codespace",
            &self.codespace,
        ]);
        cmd
    }

    /// Long-running remote command whose stdout is the event feed.
    pub fn monitor_command(&self, remote_script: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "codespace",
            "ssh",
            "--codespace",
            &self.codespace,
            "--",
            remote_script,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        cmd
    }

    /// The interactive session: inherits the terminal.
    pub fn interactive_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Run `<program> <args...>` to completion. Shared by [`Transport::exec`] and
/// callers that have no codespace yet (listing, login lookup).
pub async fn exec_program<I, S>(
    program: &str,
    args: I,
    timeout: Duration,
) -> Result<ExecOutput, TransportError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let start = Instant::now();
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    let command_line = format!("{program} {}", args.join(" "));
    debug!("exec: {command_line}");

    let mut child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| TransportError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;

    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(TransportError::ProcessFailed(format!(
            "{command_line}: output pipes not captured"
        )));
    };

    let run = async {
        // Both pipes at once, or a chatty stderr blocks the child.
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, MAX_EXEC_OUTPUT),
        );
        let status = child
            .wait()
            .await
            .map_err(|e| TransportError::ProcessFailed(e.to_string()))?;
        debug!(
            "exec: {command_line} finished with {status} after {}ms",
            start.elapsed().as_millis()
        );

        if !status.success() {
            return Err(TransportError::Failed {
                command: command_line.clone(),
                code: status.code().unwrap_or(-1),
                stderr: stderr_data.trim().to_string(),
            });
        }
        Ok(ExecOutput {
            stdout: stdout_data,
        })
    };

    let outcome = tokio::time::timeout(timeout, run).await;
    outcome.unwrap_or_else(|_| Err(TransportError::Timeout(command_line)))
}

/// Collect up to `limit` bytes of `reader` as lossy UTF-8.
///
/// The remainder is still consumed so the child never sees a closed pipe;
/// when anything was dropped a `[... N more bytes]` marker is appended.
pub async fn read_capped<R>(reader: &mut R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    if let Err(e) = (&mut *reader).take(limit as u64).read_to_end(&mut kept).await {
        debug!("read_capped: {e}");
    }
    let dropped = tokio::io::copy(reader, &mut tokio::io::sink())
        .await
        .unwrap_or(0);

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        text.push_str(&format!("\n[... {dropped} more bytes]"));
    }
    text
}

/// Launches `gh codespace ports forward` children for the forward manager.
pub struct CodespaceForwarder {
    transport: Transport,
}

impl CodespaceForwarder {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

impl TunnelLauncher for CodespaceForwarder {
    fn launch(&self, port: u16) -> io::Result<Box<dyn Cancellable>> {
        debug!(
            "Starting port forwarding for port {port} on codespace {}",
            self.transport.codespace()
        );
        let tunnel = ProcessTunnel::spawn(port, self.transport.forward_command(port))?;
        Ok(Box::new(tunnel))
    }
}

/// Active GitHub login as reported by `gh api user`.
pub async fn current_login(program: &str) -> Result<String, TransportError> {
    let out = exec_program(
        program,
        ["api", "user", "--cache", "1m", "--jq", ".login"],
        Duration::from_secs(30),
    )
    .await?;
    let login = out.stdout.trim().to_string();
    if login.is_empty() {
        return Err(TransportError::ProcessFailed(
            "gh api user returned empty login".to_string(),
        ));
    }
    Ok(login)
}
