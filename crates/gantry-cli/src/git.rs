//! Git helpers for filling in the trigger event from the working copy.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

/// `git rev-parse HEAD` in `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    rev_parse(repo_dir, &["rev-parse", "HEAD"])
}

/// Name of the checked-out branch. Fails on a detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Result<String> {
    let name = rev_parse(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if name == "HEAD" {
        bail!("HEAD is detached");
    }
    Ok(name)
}

fn rev_parse(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .context("failed to run git")?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        bail!("git {} returned empty output", args.join(" "));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_repo_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
        assert!(current_branch(dir.path()).is_err());
    }
}
