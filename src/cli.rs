//! Command-line surface and `gh` argument assembly.

use clap::Parser;

use crate::registry::{reverse_forward_args, ReverseForwardSpec};

/// SSH into a codespace with Azure DevOps credentials, automatic port
/// forwarding and local notification/browser relays.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "gh-ado-codespaces", version)]
pub struct Cli {
    /// Name of the codespace
    #[arg(short = 'c', long = "codespace")]
    pub codespace: Option<String>,

    /// Write OpenSSH configuration to stdout
    #[arg(long)]
    pub config: bool,

    /// Log debug data to a file
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Path of the file to log to
    #[arg(long)]
    pub debug_file: Option<String>,

    /// List recent log files and exit
    #[arg(long)]
    pub logs: bool,

    /// Azure subscription ID to use for authentication (persisted per GitHub account)
    #[arg(long = "azure-subscription-id", alias = "azure-subscription")]
    pub azure_subscription_id: Option<String>,

    /// Name of the SSH profile to use
    #[arg(long)]
    pub profile: Option<String>,

    /// Filter codespace selection by repository name (user/repo)
    #[arg(short = 'R', long)]
    pub repo: Option<String>,

    /// Filter codespace selection by repository owner (username or org)
    #[arg(long)]
    pub repo_owner: Option<String>,

    /// SSH server port number (0 => pick unused)
    #[arg(long, default_value_t = 0)]
    pub server_port: u16,

    /// Path to TOML config file
    #[arg(long)]
    pub config_file: Option<String>,

    /// Arguments passed through to ssh (flags or a remote command)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub passthrough: Vec<String>,
}

/// A broker endpoint to expose in the codespace: remote socket path and
/// local port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketForward {
    pub socket_path: String,
    pub port: u16,
}

impl Cli {
    /// Trimmed subscription override, if one was given.
    pub fn azure_subscription(&self) -> Option<&str> {
        self.azure_subscription_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `codespace ssh` and the `gh` flags derived from the command line.
    pub fn build_gh_flags(&self, codespace: &str) -> Vec<String> {
        let mut flags = vec!["codespace".to_string(), "ssh".to_string()];
        push_value(&mut flags, "--codespace", Some(codespace));
        if self.config {
            flags.push("--config".to_string());
        }
        if self.debug {
            flags.push("--debug".to_string());
        }
        push_value(&mut flags, "--debug-file", self.debug_file.as_deref());
        push_value(&mut flags, "--profile", self.profile.as_deref());
        push_value(&mut flags, "--repo", self.repo.as_deref());
        push_value(&mut flags, "--repo-owner", self.repo_owner.as_deref());
        if self.server_port != 0 {
            flags.push("--server-port".to_string());
            flags.push(self.server_port.to_string());
        }
        flags
    }

    /// Everything after the `gh` flags: the credential socket forward, the
    /// other broker forwards, the reverse forwards, `-t`, then passthrough.
    pub fn build_ssh_args(
        &self,
        auth: &SocketForward,
        brokers: &[SocketForward],
        reverse: &[ReverseForwardSpec],
    ) -> Vec<String> {
        let mut args = vec!["--".to_string()];
        for fwd in std::iter::once(auth).chain(brokers) {
            args.push("-R".to_string());
            args.push(format!("{}:localhost:{}", fwd.socket_path, fwd.port));
        }
        args.extend(reverse_forward_args(reverse));
        args.push("-t".to_string());
        args.extend(self.passthrough.iter().cloned());
        args
    }
}

fn push_value(flags: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        flags.push(flag.to_string());
        flags.push(v.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gh-ado-codespaces").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn short_and_long_flags() {
        let cli = parse(&["-c", "fuzzy-train", "-d", "-R", "org/repo", "--server-port", "2222"]);
        assert_eq!(cli.codespace.as_deref(), Some("fuzzy-train"));
        assert!(cli.debug);
        assert_eq!(cli.repo.as_deref(), Some("org/repo"));
        assert_eq!(cli.server_port, 2222);
        assert!(cli.passthrough.is_empty());
    }

    #[test]
    fn subscription_alias_is_trimmed() {
        let cli = parse(&["--azure-subscription", "  sub-1 "]);
        assert_eq!(cli.azure_subscription(), Some("sub-1"));
        assert_eq!(parse(&["--azure-subscription-id", " "]).azure_subscription(), None);
    }

    #[test]
    fn passthrough_after_separator() {
        let cli = parse(&["--codespace", "cs", "--", "-L", "8000:localhost:8000", "htop"]);
        assert_eq!(cli.passthrough, vec!["-L", "8000:localhost:8000", "htop"]);
    }

    #[test]
    fn gh_flags_include_only_set_options() {
        let cli = parse(&["--config", "--profile", "p", "--repo-owner", "octo"]);
        assert_eq!(
            cli.build_gh_flags("cs"),
            vec![
                "codespace",
                "ssh",
                "--codespace",
                "cs",
                "--config",
                "--profile",
                "p",
                "--repo-owner",
                "octo"
            ]
        );
        assert_eq!(
            Cli::default().build_gh_flags("cs"),
            vec!["codespace", "ssh", "--codespace", "cs"]
        );
    }

    #[test]
    fn ssh_args_forward_socket_to_local_port() {
        let cli = parse(&["--", "bash", "-l"]);
        let auth = SocketForward {
            socket_path: "/tmp/ado-auth-abc.sock".into(),
            port: 40123,
        };
        let browser = SocketForward {
            socket_path: "/tmp/gh-ado-browser-def.sock".into(),
            port: 40124,
        };
        let args = cli.build_ssh_args(
            &auth,
            &[browser],
            &[ReverseForwardSpec::new(11434, "Ollama")],
        );
        assert_eq!(
            args,
            vec![
                "--",
                "-R",
                "/tmp/ado-auth-abc.sock:localhost:40123",
                "-R",
                "/tmp/gh-ado-browser-def.sock:localhost:40124",
                "-R",
                "11434:localhost:11434",
                "-t",
                "bash",
                "-l"
            ]
        );
        let pair = args
            .windows(2)
            .any(|w| w[0] == "-R" && w[1] == "/tmp/ado-auth-abc.sock:localhost:40123");
        assert!(pair);
    }
}
