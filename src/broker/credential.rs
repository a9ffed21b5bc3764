//! Credential broker: hands out Azure DevOps access tokens to the codespace.
//!
//! The remote `ado-auth-helper` dials `/tmp/ado-auth-*.sock`, which the
//! reverse tunnel maps to this broker's local port, and sends framed
//! `getAccessToken` requests. Each request gets exactly one framed response:
//! a token, or an explicit error the helper can tell apart from a dropped
//! connection. A connection may carry any number of requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{
    decode_request, read_frame, write_frame, BrokerRequest, BrokerResponse, FrameError,
    MAX_FRAME_BYTES,
};
use super::{bind_local, remote_socket_path, BrokerHandle, AUTH_SOCKET_PREFIX};
use crate::transport::{exec_program, TransportError};

/// Errors from an identity provider.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The provider cannot be reached at all (CLI missing, not logged in).
    #[error("{0}")]
    Unavailable(String),
    /// The provider answered with a failure.
    #[error("{0}")]
    Failed(String),
    /// The provider answered with something unparseable.
    #[error("unexpected provider output: {0}")]
    Malformed(String),
}

/// Source of access tokens.
pub trait TokenProvider: Send + Sync {
    fn get_token(&self, scopes: Vec<String>) -> BoxFuture<'_, Result<String, TokenError>>;
}

/// Token provider backed by the Azure CLI (`az account get-access-token`).
#[derive(Debug, Clone)]
pub struct AzureCliProvider {
    program: String,
    subscription: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct AzToken {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Shown when `az account show` fails.
const AZ_LOGIN_HINT: &str = "Azure CLI is installed but you are not logged in. Please run:\n\n    \
     az login --scope 499b84ac-1321-427f-aa17-267ca6975798/.default\n\n\
     This will authenticate with the Azure DevOps scope required for this extension.";

impl AzureCliProvider {
    pub fn new(program: impl Into<String>, subscription: Option<String>) -> Self {
        Self {
            program: program.into(),
            subscription,
            timeout: Duration::from_secs(60),
        }
    }

    /// Locate a working Azure CLI and check that the user is logged in.
    ///
    /// On Windows the CLI may be installed as `az.cmd` or `az.exe`, so each
    /// name is tried in turn.
    pub async fn detect(subscription: Option<String>) -> Result<Self, TokenError> {
        let candidates: &[&str] = if cfg!(windows) {
            &["az.cmd", "az.exe", "az"]
        } else {
            &["az"]
        };

        let mut last_err = None;
        for candidate in candidates {
            debug!(target: "auth", "Checking Azure CLI availability with command: {candidate}");
            match exec_program(candidate, ["--version"], Duration::from_secs(30)).await {
                Ok(out) => {
                    let version = out.stdout.lines().next().unwrap_or_default().trim().to_string();
                    info!(target: "auth", "Azure CLI found with command '{candidate}': {version}");
                    let provider = Self::new(*candidate, subscription);
                    provider.check_logged_in().await?;
                    return Ok(provider);
                }
                Err(e) => {
                    debug!(target: "auth", "Command '{candidate} --version' failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        let suggestion = if cfg!(windows) {
            "On Windows, please install Azure CLI from https://aka.ms/installazurecliwindows and restart your command prompt or PowerShell session."
        } else {
            "Please install Azure CLI following the instructions at https://docs.microsoft.com/en-us/cli/azure/install-azure-cli"
        };
        let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(TokenError::Unavailable(format!(
            "Azure CLI is not installed or not in PATH. {suggestion} Last error: {detail}"
        )))
    }

    async fn check_logged_in(&self) -> Result<(), TokenError> {
        match exec_program(&self.program, ["account", "show"], Duration::from_secs(30)).await {
            Ok(_) => {
                info!(target: "auth", "Azure CLI account check successful");
                Ok(())
            }
            Err(e) => {
                warn!(target: "auth", "Azure CLI account check failed: {e}");
                Err(TokenError::Unavailable(AZ_LOGIN_HINT.to_string()))
            }
        }
    }

    fn token_args(&self, scopes: &[String]) -> Vec<String> {
        let mut args: Vec<String> = ["account", "get-access-token", "--output", "json", "--scope"]
            .iter()
            .map(ToString::to_string)
            .collect();
        args.extend(scopes.iter().cloned());
        if let Some(sub) = &self.subscription {
            args.push("--subscription".to_string());
            args.push(sub.clone());
        }
        args
    }
}

impl TokenProvider for AzureCliProvider {
    fn get_token(&self, scopes: Vec<String>) -> BoxFuture<'_, Result<String, TokenError>> {
        Box::pin(async move {
            let args = self.token_args(&scopes);
            let out = exec_program(&self.program, &args, self.timeout)
                .await
                .map_err(|e| match e {
                    TransportError::SpawnFailed { .. } => TokenError::Unavailable(e.to_string()),
                    other => TokenError::Failed(other.to_string()),
                })?;
            let token: AzToken = serde_json::from_str(&out.stdout)
                .map_err(|e| TokenError::Malformed(e.to_string()))?;
            Ok(token.access_token)
        })
    }
}

/// Start the credential broker on an ephemeral local port.
///
/// A bind failure is returned to the caller; the session treats it as fatal.
pub async fn start(
    provider: Arc<dyn TokenProvider>,
    cancel: CancellationToken,
) -> std::io::Result<BrokerHandle> {
    let (listener, port) = bind_local().await?;
    let socket_path = remote_socket_path(AUTH_SOCKET_PREFIX);
    info!(target: "auth", "Local auth server listening on port {port}, socket path {socket_path}");

    let task = tokio::spawn(accept_loop(listener, port, provider, cancel.clone()));
    Ok(BrokerHandle::new("credential", port, socket_path, cancel, task))
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    provider: Arc<dyn TokenProvider>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target: "auth", "Accept loop for port {port} cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(target: "auth", "Accepted connection from {addr} on port {port}");
                    connections.spawn(handle_connection(stream, addr, provider.clone(), cancel.clone()));
                }
                Err(e) => {
                    warn!(target: "auth", "Error accepting on port {port}: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    // In-flight requests finish; BrokerHandle::stop bounds the wait.
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    provider: Arc<dyn TokenProvider>,
    cancel: CancellationToken,
) {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            f = read_frame(&mut rd, MAX_FRAME_BYTES) => f,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!(target: "auth", "Client {addr} closed connection");
                break;
            }
            Err(e @ FrameError::TooLarge(_)) => {
                warn!(target: "auth", "Rejecting frame from {addr}: {e}");
                let _ = write_frame(&mut wr, &BrokerResponse::error(e.to_string())).await;
                break;
            }
            Err(e) => {
                debug!(target: "auth", "Error reading from {addr}: {e}");
                break;
            }
        };

        let response = respond(&body, provider.as_ref(), addr).await;
        if let Err(e) = write_frame(&mut wr, &response).await {
            warn!(target: "auth", "Error writing response to {addr}: {e}");
            break;
        }
    }
    debug!(target: "auth", "Finished handling connection for {addr}");
}

async fn respond(body: &[u8], provider: &dyn TokenProvider, addr: SocketAddr) -> BrokerResponse {
    let request = match decode_request(body) {
        Ok(r) => r,
        Err(e) => {
            warn!(target: "auth", "Bad request from {addr}: {e}");
            return BrokerResponse::error(e.to_string());
        }
    };

    match request {
        BrokerRequest::GetAccessToken { data } => {
            let scopes = data.scope_list();
            debug!(target: "auth", "Token request from {addr}, scopes {scopes:?}");
            match provider.get_token(scopes.clone()).await {
                Ok(token) => {
                    // The token itself is never logged.
                    info!(target: "auth", "Issued token to {addr} (scopes {scopes:?})");
                    BrokerResponse::AccessToken { data: token }
                }
                Err(e) => {
                    warn!(target: "auth", "Error getting token for {addr} (scopes {scopes:?}): {e}");
                    BrokerResponse::error(format!("Failed to get access token: {e}"))
                }
            }
        }
    }
}
