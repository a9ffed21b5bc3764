//! Small helpers shared across modules.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Longest sanitized name kept verbatim. Longer names are cut and suffixed
/// with a short hash so distinct codespaces never collide.
const MAX_SAFE_NAME: usize = 50;

/// Resolve a user-supplied path, treating a leading `~` or `~/` as the home
/// directory. `~user` forms are left alone, as is everything when no home
/// directory is known.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some("") => "",
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) if rest.is_empty() => home,
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Make a codespace name safe for use as a directory name.
///
/// Path separators, shell glob characters and whitespace become `-`, leading
/// and trailing dashes are trimmed. Names longer than 50 bytes keep their
/// first 41 bytes plus `-` and 8 hex chars of the SHA-256 of the full name.
pub fn sanitize_for_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '-',
            other => other,
        })
        .collect();
    let trimmed = replaced.trim_matches('-');

    if trimmed.len() <= MAX_SAFE_NAME {
        return trimmed.to_string();
    }

    let digest = Sha256::digest(trimmed.as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    let mut cut = MAX_SAFE_NAME - hash.len() - 1;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}-{hash}", &trimmed[..cut])
}

/// Identifier for one run of the companion, used to name its log directory.
///
/// Format: `<sanitized-codespace>_session-<YYYY-MM-DD_HHMMSS>-pid<PID>`.
pub fn session_id(codespace: &str) -> String {
    let mut safe = sanitize_for_filename(codespace);
    if safe.is_empty() {
        safe = "unknown-codespace".to_string();
    }
    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H%M%S");
    format!("{safe}_session-{timestamp}-pid{}", std::process::id())
}

/// Human-readable byte size: `512 B`, `1.5 KB`, `2.0 MB`.
#[allow(clippy::cast_precision_loss)]
pub fn format_file_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_for_filename("org/repo:main"), "org-repo-main");
        assert_eq!(sanitize_for_filename("  spaced name "), "spaced-name");
        assert_eq!(sanitize_for_filename("a*b?c\"d<e>f|g"), "a-b-c-d-e-f-g");
    }

    #[test]
    fn sanitize_empty() {
        assert_eq!(sanitize_for_filename(""), "");
        assert_eq!(sanitize_for_filename("///"), "");
    }

    #[test]
    fn sanitize_long_name_is_hashed() {
        let long = "x".repeat(80);
        let other = format!("{}y", "x".repeat(79));
        let a = sanitize_for_filename(&long);
        let b = sanitize_for_filename(&other);
        assert_eq!(a.len(), 50);
        assert_ne!(a, b);
        assert!(a.starts_with(&"x".repeat(41)));
    }

    #[test]
    fn session_id_shape() {
        let id = session_id("octo/cat");
        assert!(id.starts_with("octo-cat_session-"));
        assert!(id.ends_with(&format!("-pid{}", std::process::id())));
        assert!(session_id("").starts_with("unknown-codespace_session-"));
    }

    #[test]
    fn file_sizes() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(2 * 1024 * 1024), "2.0 MB");
    }

    #[test]
    fn home_prefix_expands() {
        assert_eq!(expand_home("/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(expand_home("~user/x"), PathBuf::from("~user/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~"), home);
            assert_eq!(expand_home("~/cfg/a.toml"), home.join("cfg/a.toml"));
        }
    }
}
