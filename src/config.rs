//! Configuration loading, defaults and per-account persistence.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `RUST_LOG`, then `GH_ADO_CODESPACES_LOG`
//!    for the log filter
//! 2. **Config file**: path via `--config-file <path>`, else
//!    `$GH_ADO_CODESPACES_CONFIG`, else
//!    `<user config dir>/gh-ado-codespaces/config.toml`
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [transport]
//! program = "gh"
//!
//! [reverse]
//! probe_timeout_ms = 300
//!
//! [[reverse.ports]]
//! port = 1234
//! description = "LM Studio"
//! enabled = true
//! always_forward = false
//!
//! [broker]
//! shutdown_grace_secs = 5
//! enable_notifications = true
//! enable_browser = true
//!
//! [accounts.octocat]
//! azure_subscription = "00000000-0000-0000-0000-000000000000"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::ReverseForwardSpec;
use crate::util::expand_home;

/// Env var naming an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "GH_ADO_CODESPACES_CONFIG";

/// Env var overriding `[logging] level`.
pub const LOG_ENV_VAR: &str = "GH_ADO_CODESPACES_LOG";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reverse: ReverseConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Per-GitHub-login settings, keyed by login.
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// The external transport CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Program used for every codespace operation (default `gh`).
    #[serde(default = "default_program")]
    pub program: String,
}

/// Well-known local services offered to the codespace via reverse tunnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseConfig {
    /// Connect timeout for the local reachability probe (default 300 ms).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Registry table (default: LM Studio, Chrome DevTools, Ollama).
    #[serde(default = "default_reverse_ports")]
    pub ports: Vec<ReverseForwardSpec>,
}

/// Local broker services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Grace period for in-flight requests when a broker stops (default 5 s).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Start the notification relay (default true).
    #[serde(default = "default_true")]
    pub enable_notifications: bool,
    /// Start the URL-open relay (default true).
    #[serde(default = "default_true")]
    pub enable_browser: bool,
}

/// Settings remembered for one GitHub login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Azure subscription passed to the identity provider for this login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_subscription: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_program() -> String {
    "gh".to_string()
}
fn default_probe_timeout_ms() -> u64 {
    300
}
fn default_reverse_ports() -> Vec<ReverseForwardSpec> {
    crate::registry::well_known_ports()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

impl Default for ReverseConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            ports: default_reverse_ports(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
            enable_notifications: true,
            enable_browser: true,
        }
    }
}

/// Errors from reading or writing the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot resolve user config directory")]
    NoConfigDir,
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Config {
    /// Resolve the config file path: explicit path, then env var, then the
    /// user config directory.
    pub fn resolve_path(explicit: Option<&str>) -> Result<PathBuf, ConfigError> {
        if let Some(p) = explicit {
            return Ok(expand_home(p));
        }
        if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
            let p = p.trim();
            if !p.is_empty() {
                return Ok(expand_home(p));
            }
        }
        dirs::config_dir()
            .map(|d| d.join("gh-ado-codespaces").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Read a config file. A missing or blank file yields defaults.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration, falling back to defaults (with a warning on
    /// stderr) when the file cannot be read or parsed.
    pub fn load(explicit: Option<&str>) -> (Self, Option<PathBuf>) {
        let path = match Self::resolve_path(explicit) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Warning: {e}; using default configuration");
                return (Self::default(), None);
            }
        };
        match Self::read(&path) {
            Ok(config) => (config, Some(path)),
            Err(e) => {
                eprintln!("Warning: {e}; using default configuration");
                (Self::default(), Some(path))
            }
        }
    }

    /// Persist the configuration atomically: write `<path>.tmp` with mode
    /// 0600, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let data = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("toml.tmp");
        write_private(&tmp, data.as_bytes()).map_err(|source| ConfigError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Effective tracing filter: `RUST_LOG`, then `GH_ADO_CODESPACES_LOG`,
    /// then `[logging] level`.
    pub fn log_filter(&self) -> String {
        std::env::var("RUST_LOG")
            .or_else(|_| std::env::var(LOG_ENV_VAR))
            .unwrap_or_else(|_| self.logging.level.clone())
    }

    /// Azure subscription remembered for `login`, if any non-blank value is set.
    pub fn azure_subscription_for(&self, login: &str) -> Option<&str> {
        self.accounts
            .get(login)?
            .azure_subscription
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Set (or clear, when blank) the Azure subscription for `login`.
    /// A blank login is ignored.
    pub fn set_azure_subscription(&mut self, login: &str, subscription: &str) {
        let login = login.trim();
        if login.is_empty() {
            return;
        }
        let sub = subscription.trim();
        if sub.is_empty() {
            if let Some(acct) = self.accounts.get_mut(login) {
                acct.azure_subscription = None;
            }
            return;
        }
        self.accounts
            .entry(login.to_string())
            .or_default()
            .azure_subscription = Some(sub.to_string());
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::read(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.transport.program, "gh");
        assert_eq!(cfg.reverse.probe_timeout_ms, 300);
        assert_eq!(cfg.reverse.ports.len(), 3);
        assert_eq!(cfg.broker.shutdown_grace_secs, 5);
        assert!(cfg.broker.enable_browser);
    }

    #[test]
    fn blank_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "  \n").unwrap();
        let cfg = Config::read(&path).unwrap();
        assert!(cfg.accounts.is_empty());
    }

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[transport]
program = "/opt/gh"

[[reverse.ports]]
port = 8000
description = "vLLM"
enabled = true
always_forward = true
"#,
        )
        .unwrap();
        let cfg = Config::read(&path).unwrap();
        assert_eq!(cfg.transport.program, "/opt/gh");
        assert_eq!(cfg.reverse.ports.len(), 1);
        assert_eq!(cfg.reverse.ports[0].port, 8000);
        assert!(cfg.reverse.ports[0].always_forward);
        assert_eq!(cfg.reverse.probe_timeout_ms, 300);
    }

    #[test]
    fn invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging\nlevel=").unwrap();
        assert!(matches!(
            Config::read(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn subscription_set_and_clear() {
        let mut cfg = Config::default();
        cfg.set_azure_subscription("octocat", "  sub-1 ");
        assert_eq!(cfg.azure_subscription_for("octocat"), Some("sub-1"));
        cfg.set_azure_subscription("octocat", "");
        assert_eq!(cfg.azure_subscription_for("octocat"), None);
        cfg.set_azure_subscription("   ", "sub-2");
        assert!(cfg.accounts.get("").is_none());
    }

    #[test]
    fn save_round_trips_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut cfg = Config::default();
        cfg.set_azure_subscription("octocat", "sub-1");
        cfg.save(&path).unwrap();
        assert!(!path.with_extension("toml.tmp").exists());
        let loaded = Config::read(&path).unwrap();
        assert_eq!(loaded.azure_subscription_for("octocat"), Some("sub-1"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn explicit_path_wins() {
        let p = Config::resolve_path(Some("/tmp/x.toml")).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/x.toml"));
    }
}
