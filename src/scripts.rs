//! Helper scripts installed into the codespace at session start.
//!
//! Scripts are compiled into the binary and copied with `gh codespace cp -e`
//! through a local temp file. A single `chmod +x` then covers everything that
//! was copied.

use std::io::Write;

use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::transport::{Transport, TransportError};

/// A script and where it lives in the codespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteScript {
    /// Remote path, relative to the remote user's home.
    pub remote_path: &'static str,
    pub contents: &'static str,
}

const AUTH_HELPER_SOURCE: &str = include_str!("../scripts/ado-auth-helper");

pub const PORT_MONITOR: RemoteScript = RemoteScript {
    remote_path: "~/port-monitor.sh",
    contents: include_str!("../scripts/port-monitor.sh"),
};

/// Git credential helper for Azure DevOps remotes.
pub const ADO_AUTH_HELPER: RemoteScript = RemoteScript {
    remote_path: "~/ado-auth-helper",
    contents: AUTH_HELPER_SOURCE,
};

/// Same script; accepts an explicit scope when invoked under this name.
pub const AZURE_AUTH_HELPER: RemoteScript = RemoteScript {
    remote_path: "~/azure-auth-helper",
    contents: AUTH_HELPER_SOURCE,
};

pub const NOTIFICATION_SENDER: RemoteScript = RemoteScript {
    remote_path: "~/notification-sender.sh",
    contents: include_str!("../scripts/notification-sender.sh"),
};

pub const BROWSER_OPENER: RemoteScript = RemoteScript {
    remote_path: "~/browser-opener.sh",
    contents: include_str!("../scripts/browser-opener.sh"),
};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to stage script locally: {0}")]
    Stage(#[from] std::io::Error),
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: &'static str,
        source: TransportError,
    },
    #[error("failed to make scripts executable: {0}")]
    Chmod(TransportError),
}

/// Scripts to install for a session with the given broker settings.
pub fn session_scripts(broker: &BrokerConfig) -> Vec<RemoteScript> {
    let mut scripts = vec![PORT_MONITOR, ADO_AUTH_HELPER, AZURE_AUTH_HELPER];
    if broker.enable_notifications {
        scripts.push(NOTIFICATION_SENDER);
    }
    if broker.enable_browser {
        scripts.push(BROWSER_OPENER);
    }
    scripts
}

/// Copy one script into the codespace.
pub async fn upload(transport: &Transport, script: &RemoteScript) -> Result<(), ScriptError> {
    let mut staged = tempfile::Builder::new()
        .prefix("gh-ado-script-")
        .tempfile()?;
    staged.write_all(script.contents.as_bytes())?;
    staged.flush()?;

    let local = staged.path().to_string_lossy().into_owned();
    transport
        .copy_to_remote(&local, script.remote_path)
        .await
        .map_err(|source| ScriptError::Copy {
            path: script.remote_path,
            source,
        })?;
    debug!("Uploaded {}", script.remote_path);
    Ok(())
}

/// Upload every script, then `chmod +x` the ones that made it.
///
/// A failed copy is logged and skipped. Returns the remote paths that are
/// installed and executable.
pub async fn install(
    transport: &Transport,
    scripts: &[RemoteScript],
) -> Result<Vec<&'static str>, ScriptError> {
    let mut installed = Vec::with_capacity(scripts.len());
    for script in scripts {
        match upload(transport, script).await {
            Ok(()) => installed.push(script.remote_path),
            Err(e) => warn!("{e}"),
        }
    }
    if installed.is_empty() {
        return Ok(installed);
    }

    let mut command = vec!["chmod", "+x"];
    command.extend(installed.iter().copied());
    transport
        .remote_run(&command)
        .await
        .map_err(ScriptError::Chmod)?;

    info!(
        "Installed {} helper scripts in {}",
        installed.len(),
        transport.codespace()
    );
    Ok(installed)
}
