//! Per-session log files.
//!
//! The interactive ssh session owns the terminal, so tracing output goes to
//! `<tmp>/gh-ado-codespaces/logs/<session-id>/session.log` instead of stderr.
//! `--logs` lists what earlier sessions left behind.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::util::format_file_size;

const SESSION_LOG_FILE: &str = "session.log";

/// Root of all session log directories.
pub fn log_root() -> PathBuf {
    std::env::temp_dir().join("gh-ado-codespaces").join("logs")
}

/// The log context of one session.
///
/// Holds the background writer's guard: dropping the `SessionLog` flushes
/// pending lines and closes the file.
pub struct SessionLog {
    path: PathBuf,
    guard: Option<WorkerGuard>,
}

impl SessionLog {
    /// Create the session directory under `root` and open its log file.
    pub fn create(root: &Path, session_id: &str) -> io::Result<(Self, File)> {
        let dir = root.join(session_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(SESSION_LOG_FILE);
        let file = File::options().create(true).append(true).open(&path)?;
        Ok((Self { path, guard: None }, file))
    }

    /// Create the session log and route the global tracing subscriber to it.
    ///
    /// `filter` is used unless `RUST_LOG` is set.
    pub fn install(root: &Path, session_id: &str, filter: &str) -> io::Result<Self> {
        let (mut log, file) = Self::create(root, session_id)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(writer)
            .try_init();
        if installed.is_err() {
            // A subscriber is already set (tests, or a second session in-process).
            tracing::debug!("Tracing subscriber already installed");
        }
        log.guard = Some(guard);
        tracing::info!(
            "gh-ado-codespaces v{} session log {}",
            env!("CARGO_PKG_VERSION"),
            log.path.display()
        );
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        tracing::info!("Session log closed");
        // Flushes the writer thread.
        self.guard.take();
    }
}

/// One log file inside a session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A past session directory.
#[derive(Debug, Clone)]
pub struct SessionLogs {
    pub name: String,
    pub codespace: String,
    pub modified: SystemTime,
    pub files: Vec<LogFile>,
}

/// Session directories under `root` that contain `.log` files, newest first.
pub fn list_recent_logs(root: &Path) -> io::Result<Vec<SessionLogs>> {
    let mut sessions = Vec::new();
    for entry in fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((codespace, _)) = name.split_once("_session-") else {
            continue;
        };
        let codespace = codespace.to_string();

        let Ok(children) = fs::read_dir(entry.path()) else {
            continue;
        };
        let mut files: Vec<LogFile> = children
            .filter_map(Result::ok)
            .filter_map(|f| {
                let meta = f.metadata().ok()?;
                let file_name = f.file_name().to_string_lossy().into_owned();
                (meta.is_file() && file_name.ends_with(".log")).then(|| LogFile {
                    name: file_name,
                    path: f.path(),
                    size: meta.len(),
                })
            })
            .collect();
        if files.is_empty() {
            continue;
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        sessions.push(SessionLogs {
            name,
            codespace,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            files,
        });
    }
    sessions.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(sessions)
}

/// Print the `--logs` listing for `root` to `out`.
pub fn print_recent_logs<W: Write>(root: &Path, out: &mut W) -> io::Result<()> {
    if !root.exists() {
        return writeln!(out, "No log directory found at: {}", root.display());
    }
    let sessions = list_recent_logs(root)?;
    if sessions.is_empty() {
        return writeln!(out, "No session log directories found in: {}", root.display());
    }

    writeln!(out, "Recent log sessions in {}:\n", root.display())?;
    for session in sessions {
        let when: DateTime<Local> = session.modified.into();
        writeln!(
            out,
            "Session: {} ({}) - Codespace: {}",
            session.name,
            when.format("%Y-%m-%d %H:%M:%S"),
            session.codespace
        )?;
        for file in &session.files {
            writeln!(
                out,
                "  {:<15} {:>8}  {}",
                file.name,
                format_file_size(file.size),
                file.path.display()
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}
