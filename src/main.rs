#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gh-ado-codespaces
//!
//! `gh` extension that opens an ssh session into a GitHub Codespace and, for
//! the lifetime of that session, keeps the codespace wired to the workstation:
//!
//! - Azure DevOps / Azure tokens for git and tooling in the codespace, issued
//!   by the local Azure CLI through a reverse-tunnelled socket
//! - every port that starts listening in the codespace is forwarded to the
//!   same local port, and dropped again when it stops listening
//! - local AI services (LM Studio, Ollama, Chrome DevTools) reachable from
//!   the codespace on their usual ports
//! - desktop notifications and browser opening requested from the codespace
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, --logs, subscription persistence
//! cli.rs           clap flags, gh/ssh argument assembly
//! config.rs        TOML + env-var configuration
//! session.rs       phase machine: start, run, drain
//! codespace.rs     codespace listing and selection prompt
//! transport.rs     gh invocations (exec, cp, ports forward, ssh)
//! scripts.rs       helper scripts installed into the codespace
//! monitor.rs       remote port monitor process
//! feed.rs          NDJSON port event decoding
//! forward.rs       ForwardManager: one forwarding child per port
//! registry.rs      reverse-forwarded local services
//! broker/
//!   mod.rs         BrokerHandle, socket naming, HTTP serving
//!   frame.rs       form-feed framed JSON
//!   credential.rs  token broker, Azure CLI provider
//!   notify.rs      POST /notify
//!   browser.rs     POST /open?url=
//! logging.rs       per-session log file, --logs listing
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use gh_ado_codespaces::cli::Cli;
use gh_ado_codespaces::config::Config;
use gh_ado_codespaces::logging::{log_root, print_recent_logs};
use gh_ado_codespaces::session::Session;
use gh_ado_codespaces::transport::current_login;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.logs {
        return match print_recent_logs(&log_root(), &mut std::io::stdout()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error reading log directory: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let (mut config, config_path) = Config::load(cli.config_file.as_deref());

    if let Some(subscription) = cli.azure_subscription() {
        persist_subscription(&mut config, config_path.as_deref(), subscription).await;
    }

    match Session::new(cli, config).run().await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Remember `subscription` for the current GitHub login. Failures are
/// warnings; the override still applies to this session.
async fn persist_subscription(config: &mut Config, path: Option<&Path>, subscription: &str) {
    let login = match current_login(&config.transport.program).await {
        Ok(login) => login,
        Err(e) => {
            eprintln!(
                "Warning: unable to determine GitHub login to store Azure subscription: {e}"
            );
            return;
        }
    };
    let Some(path) = path else {
        eprintln!("Warning: no config file location; Azure subscription not stored");
        return;
    };

    // Re-read so a file that failed to parse is never overwritten with defaults.
    let mut on_disk = match Config::read(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config for persisting Azure subscription: {e}");
            return;
        }
    };
    on_disk.set_azure_subscription(&login, subscription);
    config.set_azure_subscription(&login, subscription);

    match on_disk.save(path) {
        Ok(()) => eprintln!("Stored Azure subscription ID for login '{login}' in config."),
        Err(e) => eprintln!("Warning: failed to save Azure subscription to config: {e}"),
    }
}
