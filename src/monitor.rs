//! Remote port monitor process.
//!
//! Runs `~/port-monitor.sh` over a dedicated `gh codespace ssh` and feeds its
//! stdout into the [`ForwardManager`]. When the feed ends, for any reason,
//! every forward is torn down.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::{run_feed, FeedStats};
use crate::forward::ForwardManager;
use crate::scripts::PORT_MONITOR;
use crate::transport::Transport;

/// Handle to the running monitor.
pub struct PortMonitor {
    cancel: CancellationToken,
    task: JoinHandle<FeedStats>,
}

impl PortMonitor {
    /// Run the installed monitor script in `transport`'s codespace.
    pub fn start(
        transport: &Transport,
        forwards: Arc<ForwardManager>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        info!(
            target: "port_monitor",
            "Starting port monitor for codespace: {}",
            transport.codespace()
        );
        Self::spawn(transport.monitor_command(PORT_MONITOR.remote_path), forwards, cancel)
    }

    /// Run `cmd` as the event source. Its stdout must be the NDJSON feed.
    pub fn spawn(
        mut cmd: Command,
        forwards: Arc<ForwardManager>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("port monitor stdout not captured"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "port_monitor", "Port Monitor Error: {line}");
                }
            });
        }

        let task = tokio::spawn(supervise(child, stdout, forwards, cancel.clone()));
        Ok(Self { cancel, task })
    }

    /// Stop the monitor and wait until every forward is reaped.
    pub async fn stop(self) -> FeedStats {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the monitor to finish on its own.
    pub async fn wait(self) -> FeedStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(target: "port_monitor", "Port monitor task failed: {e}");
                FeedStats::default()
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    forwards: Arc<ForwardManager>,
    cancel: CancellationToken,
) -> FeedStats {
    let stats = run_feed(BufReader::new(stdout), forwards.as_ref(), &cancel).await;

    if cancel.is_cancelled() {
        if let Err(e) = child.kill().await {
            warn!(target: "port_monitor", "Failed to kill port monitor: {e}");
        }
    } else {
        match child.wait().await {
            Ok(status) => warn!(target: "port_monitor", "Port monitor exited ({status})"),
            Err(e) => warn!(target: "port_monitor", "Port monitor wait error: {e}"),
        }
    }

    forwards.shutdown().await;
    info!(
        target: "port_monitor",
        "Port monitor finished: {} port events, {} log lines, {} malformed",
        stats.port_events, stats.log_lines, stats.malformed
    );
    stats
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use crate::forward::{Cancellable, TunnelLauncher};
    use crate::registry::{ReverseForwardSpec, ReverseRegistry};

    #[derive(Default)]
    struct Counts {
        launched: AtomicUsize,
        cancelled: AtomicUsize,
    }

    struct CountingTunnel(Arc<Counts>);

    impl Cancellable for CountingTunnel {
        fn cancel(&mut self) -> io::Result<()> {
            self.0.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn join(self: Box<Self>) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    struct CountingLauncher(Arc<Counts>);

    impl TunnelLauncher for CountingLauncher {
        fn launch(&self, _port: u16) -> io::Result<Box<dyn Cancellable>> {
            self.0.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingTunnel(self.0.clone())))
        }
    }

    fn manager(counts: &Arc<Counts>) -> Arc<ForwardManager> {
        let registry = ReverseRegistry::new(
            vec![ReverseForwardSpec::new(1234, "LM Studio")],
            Duration::from_millis(50),
        );
        Arc::new(ForwardManager::new(
            Arc::new(CountingLauncher(counts.clone())),
            Arc::new(registry),
        ))
    }

    fn feed_command(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[tokio::test]
    async fn feed_drives_forwards_until_stopped() {
        let counts = Arc::new(Counts::default());
        let forwards = manager(&counts);
        let script = r#"
            echo '{"type":"log","message":"starting"}'
            echo '{"type":"port","action":"bound","port":3000,"protocol":"tcp"}'
            echo '{"type":"port","action":"bound","port":1234,"protocol":"tcp"}'
            exec sleep 30
        "#;
        let monitor =
            PortMonitor::spawn(feed_command(script), forwards.clone(), CancellationToken::new())
                .unwrap();

        for _ in 0..100 {
            if counts.launched.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(counts.launched.load(Ordering::SeqCst), 1);

        let stats = tokio::time::timeout(Duration::from_secs(5), monitor.stop())
            .await
            .expect("monitor stop should not hang");
        assert_eq!(stats.port_events, 2);
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);
        assert!(forwards.snapshot().await.iter().all(|s| !s.active));
    }

    #[tokio::test]
    async fn monitor_exit_tears_down_forwards() {
        let counts = Arc::new(Counts::default());
        let forwards = manager(&counts);
        let script = r#"
            echo '{"type":"port","action":"bound","port":8080,"protocol":"tcp"}'
            echo 'ss: not found' >&2
        "#;
        let monitor =
            PortMonitor::spawn(feed_command(script), forwards.clone(), CancellationToken::new())
                .unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(5), monitor.wait())
            .await
            .unwrap();
        assert_eq!(stats.port_events, 1);
        assert_eq!(counts.launched.load(Ordering::SeqCst), 1);
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);
    }
}
