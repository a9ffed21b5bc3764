//! Session orchestration.
//!
//! ```text
//! Init ─▶ ServicesStarting ─▶ TransportLaunched ─▶ Running ─▶ Draining ─▶ Terminated
//! ```
//!
//! - **Init**: resolve the codespace, open the session log, check the Azure
//!   CLI. Any failure here is fatal.
//! - **ServicesStarting**: start the brokers (credential is mandatory, the
//!   others best-effort), probe reverse services, install helper scripts.
//! - **TransportLaunched**: spawn `gh codespace ssh` with every forward baked
//!   into its arguments, then start the port monitor.
//! - **Running**: wait for the transport to exit or for SIGINT/SIGTERM.
//! - **Draining**: cancel everything, reap forwards, stop brokers with a
//!   grace period.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::credential::{self, AzureCliProvider, TokenError, TokenProvider};
use crate::broker::notify::{self, DesktopNotifier};
use crate::broker::browser::{self, SystemOpener};
use crate::broker::BrokerHandle;
use crate::cli::{Cli, SocketForward};
use crate::codespace::{self, SelectError};
use crate::config::Config;
use crate::forward::ForwardManager;
use crate::logging::{log_root, SessionLog};
use crate::monitor::PortMonitor;
use crate::registry::{announce, ReverseRegistry};
use crate::scripts::{self, BROWSER_OPENER, PORT_MONITOR};
use crate::transport::{current_login, CodespaceForwarder, Transport};
use crate::util::session_id;

/// Exit code reported when the session ends on a signal.
const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    ServicesStarting,
    TransportLaunched,
    Running,
    Draining,
    Terminated,
}

/// Failures that abort the session before the transport is launched.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Selection(#[from] SelectError),
    #[error("{0}")]
    IdentityProvider(TokenError),
    #[error("failed to start local auth server: {0}")]
    CredentialBind(io::Error),
    #[error("failed to launch {program}: {source}")]
    TransportLaunch { program: String, source: io::Error },
}

/// Why `Running` ended.
#[derive(Debug)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    Signalled(&'static str),
    Cancelled,
}

impl ExitOutcome {
    /// Process exit code to report for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(status) => status.code().unwrap_or(1),
            Self::Signalled(_) | Self::Cancelled => SIGNAL_EXIT_CODE,
        }
    }
}

/// Brokers running for this session.
pub struct Services {
    pub credential: BrokerHandle,
    pub notification: Option<BrokerHandle>,
    pub browser: Option<BrokerHandle>,
}

impl Services {
    /// Reverse forwards for the optional brokers, in launch order.
    pub fn broker_forwards(&self) -> Vec<SocketForward> {
        self.notification
            .iter()
            .chain(self.browser.iter())
            .map(BrokerHandle::forward)
            .collect()
    }

    /// Stop every broker concurrently, each bounded by `grace`.
    pub async fn stop(self, grace: Duration) {
        let Self {
            credential,
            notification,
            browser,
        } = self;
        let stop_optional = |handle: Option<BrokerHandle>| async move {
            if let Some(h) = handle {
                h.stop(grace).await;
            }
        };
        tokio::join!(
            credential.stop(grace),
            stop_optional(notification),
            stop_optional(browser)
        );
    }
}

/// One run of the companion against one codespace.
pub struct Session {
    cli: Cli,
    config: Config,
    phase: Phase,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(cli: Cli, config: Config) -> Self {
        Self {
            cli,
            config,
            phase: Phase::Init,
            cancel: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Token that ends the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(next > self.phase, "phase moved backwards: {:?} -> {next:?}", self.phase);
        debug!("Session phase {:?} -> {next:?}", self.phase);
        self.phase = next;
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.broker.shutdown_grace_secs)
    }

    /// Run the session to completion and return the transport's exit code.
    #[allow(clippy::too_many_lines)]
    pub async fn run(mut self) -> Result<i32, SessionError> {
        let program = self.config.transport.program.clone();

        let codespace = match self.cli.codespace.clone().filter(|c| !c.is_empty()) {
            Some(name) => name,
            None => {
                codespace::select(&program, self.cli.repo.as_deref(), self.cli.repo_owner.as_deref())
                    .await?
            }
        };

        let log = match SessionLog::install(
            &log_root(),
            &session_id(&codespace),
            &self.config.log_filter(),
        ) {
            Ok(log) => {
                eprintln!("Session log: {}", log.path().display());
                Some(log)
            }
            Err(e) => {
                eprintln!("Warning: failed to create session log: {e}");
                None
            }
        };
        info!("Session starting for codespace {codespace}");

        let subscription = self.resolve_subscription(&program).await;
        let provider = AzureCliProvider::detect(subscription)
            .await
            .map_err(SessionError::IdentityProvider)?;

        self.advance(Phase::ServicesStarting);
        let services = self.start_services(Arc::new(provider)).await?;

        let registry = Arc::new(ReverseRegistry::new(
            self.config.reverse.ports.clone(),
            Duration::from_millis(self.config.reverse.probe_timeout_ms),
        ));
        let reverse = registry.compute_active_set().await;
        announce(&reverse);

        let transport = Transport::new(&program, &codespace);
        let installed = match scripts::install(
            &transport,
            &scripts::session_scripts(&self.config.broker),
        )
        .await
        {
            Ok(installed) => installed,
            Err(e) => {
                warn!("{e}");
                eprintln!("Warning: failed to prepare scripts: {e}");
                Vec::new()
            }
        };
        if services.browser.is_some() && installed.contains(&BROWSER_OPENER.remote_path) {
            eprintln!("\nBrowser opener available! To enable browser forwarding, add to your shell config:");
            eprintln!("  export BROWSER=\"$HOME/browser-opener.sh\"\n");
        }

        self.advance(Phase::TransportLaunched);
        let mut args = self.cli.build_gh_flags(&codespace);
        args.extend(self.cli.build_ssh_args(
            &services.credential.forward(),
            &services.broker_forwards(),
            &reverse,
        ));
        debug!("Launching {program} {}", args.join(" "));

        let mut child = match transport.interactive_command(&args).spawn() {
            Ok(child) => child,
            Err(source) => {
                services.stop(self.grace()).await;
                return Err(SessionError::TransportLaunch { program, source });
            }
        };

        let forwards = Arc::new(ForwardManager::new(
            Arc::new(CodespaceForwarder::new(transport.clone())),
            registry,
        ));
        let monitor = if installed.contains(&PORT_MONITOR.remote_path) {
            match PortMonitor::start(&transport, forwards.clone(), self.cancel.child_token()) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("Failed to start port monitor: {e}");
                    None
                }
            }
        } else {
            warn!("Port monitor script not installed, automatic port forwarding disabled");
            None
        };

        self.advance(Phase::Running);
        let outcome = wait_for_exit(&mut child, &self.cancel).await;
        info!("Transport finished: {outcome:?}");

        self.advance(Phase::Draining);
        self.cancel.cancel();
        if !matches!(outcome, ExitOutcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill transport: {e}");
            }
        }
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        forwards.shutdown().await;
        services.stop(self.grace()).await;

        self.advance(Phase::Terminated);
        info!("Session terminated");
        drop(log);
        Ok(outcome.exit_code())
    }

    /// Start the brokers. Only the credential broker is required.
    pub async fn start_services(
        &self,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Services, SessionError> {
        let credential = credential::start(provider, self.cancel.child_token())
            .await
            .map_err(SessionError::CredentialBind)?;

        let notification = if self.config.broker.enable_notifications {
            notify::start(Arc::new(DesktopNotifier), self.cancel.child_token())
                .await
                .map_err(|e| {
                    warn!("Failed to start notification service: {e}");
                    eprintln!("Warning: failed to start notification service: {e}");
                })
                .ok()
        } else {
            None
        };

        let browser = if self.config.broker.enable_browser {
            browser::start(Arc::new(SystemOpener), self.cancel.child_token())
                .await
                .map_err(|e| {
                    warn!("Failed to start browser service: {e}");
                    eprintln!("Warning: failed to start browser service: {e}");
                })
                .ok()
        } else {
            None
        };

        Ok(Services {
            credential,
            notification,
            browser,
        })
    }

    /// Subscription from the command line, else the one stored for the
    /// current GitHub login.
    async fn resolve_subscription(&self, program: &str) -> Option<String> {
        if let Some(sub) = self.cli.azure_subscription() {
            return Some(sub.to_string());
        }
        if self.config.accounts.is_empty() {
            return None;
        }
        match current_login(program).await {
            Ok(login) => {
                let sub = self.config.azure_subscription_for(&login).map(str::to_string);
                if let Some(sub) = &sub {
                    info!(target: "auth", "Using Azure subscription {sub} for login {login}");
                }
                sub
            }
            Err(e) => {
                debug!(target: "auth", "Unable to determine GitHub login: {e}");
                None
            }
        }
    }
}

/// Wait for the transport to exit, a termination signal, or `cancel`.
pub async fn wait_for_exit(child: &mut Child, cancel: &CancellationToken) -> ExitOutcome {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitOutcome::Exited(status),
            Err(e) => {
                warn!("Error waiting for transport: {e}");
                ExitOutcome::Cancelled
            }
        },
        name = shutdown_signal() => {
            info!("Received {name}");
            ExitOutcome::Signalled(name)
        }
        () = cancel.cancelled() => ExitOutcome::Cancelled,
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        "SIGINT"
    }
}
