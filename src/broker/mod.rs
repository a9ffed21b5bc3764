//! Local broker services reachable from the codespace through reverse tunnels.
//!
//! Each broker listens on an ephemeral `127.0.0.1` TCP port. The interactive
//! ssh session is launched with `-R <remote-socket>:localhost:<port>`, so the
//! codespace sees a Unix socket whose name follows a fixed glob-able pattern
//! (`/tmp/ado-auth-*.sock`, `/tmp/gh-ado-notification-*.sock`,
//! `/tmp/gh-ado-browser-*.sock`). A fresh UUID per session means concurrent
//! sessions never collide, and remote helpers try every candidate.
//!
//! | Broker | Protocol | Module |
//! |--------|----------|--------|
//! | credential | `\f`-framed JSON | [`credential`] |
//! | notification | HTTP `POST /notify` | [`notify`] |
//! | URL open | HTTP `POST /open?url=` | [`browser`] |
//!
//! Every broker is wrapped in a [`BrokerHandle`] with the same stop
//! discipline: cancel, give in-flight requests a grace period, then abort.

pub mod browser;
pub mod credential;
pub mod frame;
pub mod notify;

use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::SocketForward;

/// Remote socket name prefix of the credential broker.
pub const AUTH_SOCKET_PREFIX: &str = "ado-auth";
/// Remote socket name prefix of the notification broker.
pub const NOTIFICATION_SOCKET_PREFIX: &str = "gh-ado-notification";
/// Remote socket name prefix of the URL-open broker.
pub const BROWSER_SOCKET_PREFIX: &str = "gh-ado-browser";

/// `/tmp/<prefix>-<uuid>.sock`
pub fn remote_socket_path(prefix: &str) -> String {
    format!("/tmp/{prefix}-{}.sock", Uuid::new_v4())
}

/// Bind the local side of a broker.
pub async fn bind_local() -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// A running broker.
pub struct BrokerHandle {
    name: &'static str,
    port: u16,
    socket_path: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BrokerHandle {
    pub fn new(
        name: &'static str,
        port: u16,
        socket_path: String,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            port,
            socket_path,
            cancel,
            task,
        }
    }

    /// Local TCP port the broker accepts on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Remote socket path the reverse tunnel exposes.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// The reverse forward exposing this broker inside the codespace.
    pub fn forward(&self) -> SocketForward {
        SocketForward {
            socket_path: self.socket_path.clone(),
            port: self.port,
        }
    }

    /// Stop accepting, wait up to `grace` for in-flight requests, then abort.
    pub async fn stop(self, grace: Duration) {
        debug!("{} broker: stop requested", self.name);
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} broker task failed: {e}", self.name),
            Err(_) => {
                warn!(
                    "{} broker did not stop within {}s, aborting",
                    self.name,
                    grace.as_secs()
                );
                task.abort();
            }
        }
        remove_socket_file(&self.socket_path);
        info!("{} broker stopped", self.name);
    }
}

/// Remove a leftover socket file. A missing file is not an error.
pub fn remove_socket_file(path: &str) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed socket file {path}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove socket file {path}: {e}"),
    }
}

/// Serve an axum router on `listener` until `cancel` fires.
///
/// In-flight requests finish under axum's graceful shutdown; the caller
/// bounds that with [`BrokerHandle::stop`].
pub fn serve_http(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let app = router.layer(TraceLayer::new_for_http());
    tokio::spawn(async move {
        let shutdown = cancel.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            warn!("{name} HTTP service error: {e}");
        }
        debug!("{name} HTTP service stopped");
    })
}
