//! Source retrieval for git-hosted modules

use crate::error::HubError;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Clone `url` into `dest`, or pull if `dest` already holds a checkout
pub async fn clone_or_update(url: &str, dest: &Path) -> Result<(), HubError> {
    if dest.join(".git").exists() {
        info!(url, dest = %dest.display(), "Updating module source");
        run_git(Command::new("git").arg("-C").arg(dest).arg("pull").arg("--ff-only")).await
    } else {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(url, dest = %dest.display(), "Cloning module source");
        run_git(Command::new("git").arg("clone").arg("--depth").arg("1").arg(url).arg(dest)).await
    }
}

async fn run_git(cmd: &mut Command) -> Result<(), HubError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| HubError::Setup(format!("Failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(HubError::Setup(format!("git failed: {}", stderr.trim())));
    }

    debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim(), "git finished");
    Ok(())
}
