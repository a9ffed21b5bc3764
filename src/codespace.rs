//! Codespace listing and interactive selection.

use std::cmp::Ordering;
use std::io::Write;

use crossterm::style::{Color, Stylize};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::transport::{exec_program, TransportError, DEFAULT_EXEC_TIMEOUT};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub has_uncommitted_changes: bool,
    #[serde(default)]
    pub has_unpushed_changes: bool,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
}

/// One entry of `gh codespace list --json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codespace {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub git_status: GitStatus,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("error listing codespaces: {0}")]
    List(#[from] TransportError),
    #[error("error parsing codespace list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no codespaces found")]
    Empty,
    #[error("failed to read selection: {0}")]
    Prompt(#[from] std::io::Error),
    #[error("no codespace selected")]
    Cancelled,
}

impl Codespace {
    fn state_rank(&self) -> u8 {
        match self.state.as_str() {
            "Available" => 0,
            "Starting" => 1,
            _ => 99,
        }
    }

    /// `<glyph> <name> - <repo> (+N, uncommitted changes, unpushed changes)`,
    /// colored by state.
    pub fn list_item(&self) -> String {
        let name = if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        };
        let (glyph, color) = match self.state.as_str() {
            "Available" => ("✓", Color::DarkGreen),
            "Starting" => ("…", Color::DarkYellow),
            "Shutdown" => ("⊘", Color::DarkRed),
            _ => ("?", Color::Red),
        };

        let mut indicators = Vec::new();
        if self.git_status.ahead > 0 {
            indicators.push(format!("+{}", self.git_status.ahead));
        }
        if self.git_status.has_uncommitted_changes {
            indicators.push("uncommitted changes".to_string());
        }
        if self.git_status.has_unpushed_changes {
            indicators.push("unpushed changes".to_string());
        }

        let mut suffix = self.repository.clone();
        if !indicators.is_empty() {
            suffix = format!("{suffix} ({})", indicators.join(", "));
        }
        format!("{} {} - {suffix}", glyph.with(color), name.as_str().with(color))
    }
}

/// Available first, then Starting, then everything else; ties by name.
pub fn sort_codespaces(codespaces: &mut [Codespace]) {
    codespaces.sort_by(|a, b| match a.state_rank().cmp(&b.state_rank()) {
        Ordering::Equal => a.name.cmp(&b.name),
        other => other,
    });
}

/// `gh codespace list --json ...`, optionally filtered.
pub async fn fetch(
    program: &str,
    repo: Option<&str>,
    owner: Option<&str>,
) -> Result<Vec<Codespace>, SelectError> {
    let mut args = vec![
        "codespace",
        "list",
        "--json",
        "name,displayName,repository,gitStatus,state",
    ];
    if let Some(repo) = repo {
        args.extend(["--repo", repo]);
    }
    if let Some(owner) = owner {
        args.extend(["--repo-owner", owner]);
    }
    let out = exec_program(program, args, DEFAULT_EXEC_TIMEOUT).await?;
    Ok(serde_json::from_str(&out.stdout)?)
}

/// Show a numbered menu on `out` and read a 1-based choice from `input`.
///
/// Invalid answers re-prompt; EOF cancels. Returns the 0-based index.
pub async fn prompt_choice<R, W>(
    options: &[String],
    input: &mut R,
    out: &mut W,
) -> Result<usize, SelectError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(out, "Select a codespace:")?;
    for (i, option) in options.iter().enumerate() {
        writeln!(out, "  {:>2}) {option}", i + 1)?;
    }

    let mut line = String::new();
    loop {
        write!(out, "Enter number [1-{}]: ", options.len())?;
        out.flush()?;
        line.clear();
        if input.read_line(&mut line).await? == 0 {
            return Err(SelectError::Cancelled);
        }
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
            _ => writeln!(out, "Invalid choice: {}", line.trim())?,
        }
    }
}

/// List codespaces and let the user pick one on the terminal.
pub async fn select(
    program: &str,
    repo: Option<&str>,
    owner: Option<&str>,
) -> Result<String, SelectError> {
    let mut codespaces = fetch(program, repo, owner).await?;
    if codespaces.is_empty() {
        return Err(SelectError::Empty);
    }
    sort_codespaces(&mut codespaces);

    let options: Vec<String> = codespaces.iter().map(Codespace::list_item).collect();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stderr = std::io::stderr();
    let idx = prompt_choice(&options, &mut stdin, &mut stderr).await?;
    Ok(codespaces.swap_remove(idx).name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(name: &str, state: &str) -> Codespace {
        Codespace {
            name: name.into(),
            state: state.into(),
            repository: "org/repo".into(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_gh_list_output() {
        let json = r#"[{"name":"fuzzy-train-123","displayName":"fuzzy train","repository":"org/app",
            "gitStatus":{"ahead":2,"behind":0,"hasUncommittedChanges":true,"hasUnpushedChanges":false,"ref":"main"},
            "state":"Available"}]"#;
        let list: Vec<Codespace> = serde_json::from_str(json).unwrap();
        assert_eq!(list[0].display_name, "fuzzy train");
        assert_eq!(list[0].git_status.ahead, 2);
        assert_eq!(list[0].git_status.git_ref, "main");
    }

    #[test]
    fn sorts_by_state_then_name() {
        let mut list = vec![
            cs("zeta", "Shutdown"),
            cs("beta", "Starting"),
            cs("delta", "Available"),
            cs("alpha", "Available"),
            cs("gamma", "Rebuilding"),
        ];
        sort_codespaces(&mut list);
        let names: Vec<&str> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "delta", "beta", "gamma", "zeta"]);
    }

    #[test]
    fn list_item_shows_glyph_and_git_indicators() {
        let mut c = cs("fuzzy", "Available");
        c.git_status.ahead = 3;
        c.git_status.has_unpushed_changes = true;
        let item = c.list_item();
        assert!(item.contains("✓"));
        assert!(item.contains("fuzzy"));
        assert!(item.ends_with("- org/repo (+3, unpushed changes)"));

        assert!(cs("x", "Shutdown").list_item().contains("⊘"));
        assert!(cs("x", "Weird").list_item().contains('?'));
    }

    #[tokio::test]
    async fn prompt_reprompts_until_valid() {
        let options = vec!["a".to_string(), "b".to_string()];
        let mut input = &b"7\nnope\n2\n"[..];
        let mut out = Vec::new();
        let idx = prompt_choice(&options, &mut input, &mut out).await.unwrap();
        assert_eq!(idx, 1);
        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains(" 1) a"));
        assert!(shown.contains("Invalid choice: 7"));
    }

    #[tokio::test]
    async fn prompt_eof_cancels() {
        let options = vec!["a".to_string()];
        let mut input = &b""[..];
        let mut out = Vec::new();
        assert!(matches!(
            prompt_choice(&options, &mut input, &mut out).await,
            Err(SelectError::Cancelled)
        ));
    }
}
