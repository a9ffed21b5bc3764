//! Well-known local services exposed to the codespace through reverse tunnels.
//!
//! The registry is evaluated once per session: every enabled entry that is
//! either marked `always_forward` or answers a local TCP connect probe becomes
//! an `-R <port>:localhost:<port>` pair on the interactive ssh command line.
//! No re-probing happens during the session.
//!
//! Registry membership also reserves the port number: the forward-tunnel
//! manager never forwards a remote port that is an enabled entry here, even
//! when the local service was down at probe time.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::debug;

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseForwardSpec {
    pub port: u16,
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Forward even when nothing listens locally.
    #[serde(default)]
    pub always_forward: bool,
}

fn default_enabled() -> bool {
    true
}

impl ReverseForwardSpec {
    pub fn new(port: u16, description: &str) -> Self {
        Self {
            port,
            description: description.to_string(),
            enabled: true,
            always_forward: false,
        }
    }
}

/// Default table: local inference servers and browser debugging.
pub fn well_known_ports() -> Vec<ReverseForwardSpec> {
    vec![
        ReverseForwardSpec::new(1234, "LM Studio"),
        ReverseForwardSpec::new(9222, "Chrome DevTools"),
        ReverseForwardSpec::new(11434, "Ollama"),
    ]
}

/// Read-only registry of reverse-forward candidates.
#[derive(Debug, Clone)]
pub struct ReverseRegistry {
    entries: Vec<ReverseForwardSpec>,
    probe_timeout: Duration,
}

impl Default for ReverseRegistry {
    fn default() -> Self {
        Self::new(well_known_ports(), Duration::from_millis(300))
    }
}

impl ReverseRegistry {
    pub fn new(entries: Vec<ReverseForwardSpec>, probe_timeout: Duration) -> Self {
        Self {
            entries,
            probe_timeout,
        }
    }

    /// Whether `port` is reserved for reverse use (enabled entry), regardless
    /// of whether the local service is currently reachable.
    pub fn is_reverse_forwarded(&self, port: u16) -> bool {
        self.entries.iter().any(|e| e.enabled && e.port == port)
    }

    /// Enabled entries that are always forwarded or reachable on localhost
    /// right now. Probes run concurrently; a failed or timed-out probe means
    /// "not present".
    pub async fn compute_active_set(&self) -> Vec<ReverseForwardSpec> {
        let candidates: Vec<&ReverseForwardSpec> =
            self.entries.iter().filter(|e| e.enabled).collect();
        let probes = candidates.iter().map(|e| async move {
            e.always_forward || probe_local_port(e.port, self.probe_timeout).await
        });
        let reachable = futures::future::join_all(probes).await;

        candidates
            .into_iter()
            .zip(reachable)
            .filter(|(_, ok)| *ok)
            .map(|(e, _)| e.clone())
            .collect()
    }
}

/// Try a TCP connect to `localhost:<port>` within `timeout`.
pub async fn probe_local_port(port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe localhost:{port}: {e}");
            false
        }
        Err(_) => {
            debug!("Probe localhost:{port}: timed out");
            false
        }
    }
}

/// One `-R <port>:localhost:<port>` pair per active entry.
pub fn reverse_forward_args(active: &[ReverseForwardSpec]) -> Vec<String> {
    active
        .iter()
        .flat_map(|e| ["-R".to_string(), format!("{0}:localhost:{0}", e.port)])
        .collect()
}

/// Print the active set to stderr before the interactive session starts.
pub fn announce(active: &[ReverseForwardSpec]) {
    if active.is_empty() {
        return;
    }
    eprintln!("Reverse port forwarding:");
    for e in active {
        let how = if e.always_forward {
            "always forwarded"
        } else {
            "detected locally"
        };
        eprintln!("  • {} (port {}) → {how}", e.description, e.port);
    }
}
