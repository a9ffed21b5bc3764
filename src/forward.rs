//! Forward-tunnel manager: one forwarding child per remote listening port.
//!
//! [`ForwardManager`] is the single owner of the port → tunnel table. It reacts
//! to bound/unbound events from the port monitor by launching or cancelling a
//! tunnel through a [`TunnelLauncher`], and kills every remaining tunnel on
//! [`ForwardManager::shutdown`].
//!
//! ## Invariants
//!
//! - Entries are keyed by port number only; TCP and UDP listeners on the same
//!   port share one entry.
//! - At most one live tunnel per port. Duplicate bound events are no-ops.
//! - Entries are never removed. An unbound port keeps an inactive entry so
//!   repeated unbound events stay no-ops.
//! - Ports reserved by the [`ReverseRegistry`] are never forwarded.
//! - The map lookup and the launch/cancel decision run under one lock, so a
//!   launch never races a cancel for the same port.
//!
//! ## Supervision
//!
//! A tunnel is a [`Cancellable`]: `cancel` requests termination without
//! blocking, `join` resolves once the tunnel is fully reaped. Cancelled tunnels
//! are handed to a [`JoinSet`] owned by the manager and drained on shutdown,
//! so no forwarding child outlives the session.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::registry::ReverseRegistry;
use crate::transport::read_capped;

/// Max stderr kept from a forwarding child for diagnostics.
const MAX_FORWARD_STDERR: usize = 16 * 1024;

/// A running tunnel that can be torn down.
pub trait Cancellable: Send {
    /// Request termination. Must not block.
    fn cancel(&mut self) -> io::Result<()>;

    /// Resolve once the tunnel has been reaped.
    fn join(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Creates a tunnel mapping remote `port` to local `port`.
pub trait TunnelLauncher: Send + Sync {
    fn launch(&self, port: u16) -> io::Result<Box<dyn Cancellable>>;
}

/// Per-port bookkeeping.
struct ForwardEntry {
    active: bool,
    tunnel: Option<Box<dyn Cancellable>>,
}

/// Read-only view of one entry, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStatus {
    pub port: u16,
    pub active: bool,
    pub has_handle: bool,
}

/// Owns every forward tunnel of the session.
pub struct ForwardManager {
    launcher: Arc<dyn TunnelLauncher>,
    registry: Arc<ReverseRegistry>,
    entries: Mutex<HashMap<u16, ForwardEntry>>,
    reapers: Mutex<JoinSet<()>>,
    /// Set under the `entries` lock when shutdown begins; blocks new launches.
    closing: AtomicBool,
    shutdown_done: OnceCell<()>,
}

impl ForwardManager {
    pub fn new(launcher: Arc<dyn TunnelLauncher>, registry: Arc<ReverseRegistry>) -> Self {
        Self {
            launcher,
            registry,
            entries: Mutex::new(HashMap::new()),
            reapers: Mutex::new(JoinSet::new()),
            closing: AtomicBool::new(false),
            shutdown_done: OnceCell::new(),
        }
    }

    /// Remote `port` started listening.
    ///
    /// Launches a tunnel unless one is already active, the port is reserved
    /// for reverse forwarding, or shutdown has begun. A launch failure is
    /// logged and leaves the entry inactive so a later bound event retries.
    pub async fn on_bound(&self, port: u16) {
        if self.registry.is_reverse_forwarded(port) {
            debug!("Port {port} is reserved for reverse forwarding, not forwarding");
            return;
        }

        let mut entries = self.entries.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            debug!("Port {port} bound during shutdown, ignoring");
            return;
        }
        let entry = entries.entry(port).or_insert(ForwardEntry {
            active: false,
            tunnel: None,
        });
        if entry.active {
            debug!("Port {port} already forwarded");
            return;
        }

        info!("Port {port} bound, starting port forwarding");
        match self.launcher.launch(port) {
            Ok(tunnel) => {
                entry.tunnel = Some(tunnel);
                entry.active = true;
            }
            Err(e) => warn!("Failed to start port forwarding for port {port}: {e}"),
        }
    }

    /// Remote `port` stopped listening. Cancels its tunnel if active.
    pub async fn on_unbound(&self, port: u16) {
        let tunnel = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&port) else {
                return;
            };
            if !entry.active {
                return;
            }
            entry.active = false;
            entry.tunnel.take()
        };

        if let Some(tunnel) = tunnel {
            info!("Port {port} unbound, stopping port forwarding");
            self.reap(port, tunnel).await;
        }
    }

    /// Kill every active tunnel and wait for all of them to be reaped.
    ///
    /// Runs its body exactly once; concurrent and repeated callers wait for
    /// the first call to finish.
    pub async fn shutdown(&self) {
        self.shutdown_done
            .get_or_init(|| async {
                let tunnels: Vec<(u16, Box<dyn Cancellable>)> = {
                    let mut entries = self.entries.lock().await;
                    self.closing.store(true, Ordering::SeqCst);
                    info!("Cleaning up {} port forwarding entries", entries.len());
                    entries
                        .iter_mut()
                        .filter(|(_, e)| e.active)
                        .filter_map(|(port, e)| {
                            e.active = false;
                            e.tunnel.take().map(|t| (*port, t))
                        })
                        .collect()
                };

                for (port, tunnel) in tunnels {
                    info!("Terminating port forwarding for port {port}");
                    self.reap(port, tunnel).await;
                }

                let mut reapers = self.reapers.lock().await;
                while reapers.join_next().await.is_some() {}
                debug!("All port forwarding processes reaped");
            })
            .await;
    }

    /// Current table, sorted by port.
    pub async fn snapshot(&self) -> Vec<ForwardStatus> {
        let entries = self.entries.lock().await;
        let mut out: Vec<ForwardStatus> = entries
            .iter()
            .map(|(port, e)| ForwardStatus {
                port: *port,
                active: e.active,
                has_handle: e.tunnel.is_some(),
            })
            .collect();
        out.sort_by_key(|s| s.port);
        out
    }

    async fn reap(&self, port: u16, mut tunnel: Box<dyn Cancellable>) {
        if let Err(e) = tunnel.cancel() {
            warn!("Failed to kill port forwarding for port {port}: {e}");
        }
        let mut reapers = self.reapers.lock().await;
        while reapers.try_join_next().is_some() {}
        reapers.spawn(tunnel.join());
    }
}

/// A forwarding child process supervised by its own task.
///
/// The task owns the [`tokio::process::Child`]: it logs the child's stderr if
/// the child exits on its own, and kills and reaps it when cancelled or when
/// the handle is dropped.
pub struct ProcessTunnel {
    port: u16,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

enum ChildOutcome {
    Exited(io::Result<std::process::ExitStatus>),
    Killed,
}

impl ProcessTunnel {
    /// Spawn `cmd` with stdin/stdout detached and stderr captured.
    pub fn spawn(port: u16, mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!("Port forwarding for port {port} started (pid {pid:?})");

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move { read_capped(&mut stderr, MAX_FORWARD_STDERR).await })
            });

            let outcome = tokio::select! {
                status = child.wait() => ChildOutcome::Exited(status),
                _ = kill_rx => ChildOutcome::Killed,
            };

            match outcome {
                ChildOutcome::Killed => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill port forwarding for port {port}: {e}");
                    } else {
                        info!("Stopped port forwarding for port {port}");
                    }
                    if let Some(t) = stderr_task {
                        t.abort();
                    }
                }
                ChildOutcome::Exited(status) => {
                    let stderr = match stderr_task {
                        Some(t) => t.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    let stderr = stderr.trim();
                    match status {
                        Ok(s) if s.success() => {
                            info!("Port forwarding for port {port} exited");
                        }
                        Ok(s) => warn!("Port forwarding for port {port} failed ({s}): {stderr}"),
                        Err(e) => warn!("Port forwarding for port {port} wait error: {e}"),
                    }
                }
            }
        });

        Ok(Self {
            port,
            pid,
            kill_tx: Some(kill_tx),
            task,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Cancellable for ProcessTunnel {
    fn cancel(&mut self) -> io::Result<()> {
        if let Some(tx) = self.kill_tx.take() {
            // A closed receiver means the child already exited and was reaped.
            if tx.send(()).is_err() {
                debug!("Port forwarding for port {} already exited", self.port);
            }
        }
        Ok(())
    }

    fn join(self: Box<Self>) -> BoxFuture<'static, ()> {
        let port = self.port;
        let task = self.task;
        Box::pin(async move {
            if let Err(e) = task.await {
                warn!("Port forwarding supervisor for port {port} panicked: {e}");
            }
        })
    }
}
