//! Local session persistence for the CLI.

use anyhow::{Context, Result};
use std::path::PathBuf;

fn session_path() -> PathBuf {
    verdict_protocol::paths::verdict_home().join("session")
}

pub fn load() -> Option<String> {
    let text = std::fs::read_to_string(session_path()).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn save(session_id: &str) -> Result<()> {
    let path = session_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, session_id)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    restrict_permissions(&path);
    Ok(())
}

pub fn clear() {
    let _ = std::fs::remove_file(session_path());
}

#[cfg(unix)]
fn restrict_permissions(path: &PathBuf) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &PathBuf) {}
