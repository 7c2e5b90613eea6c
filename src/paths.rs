use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const REGISTRY_FILE_NAME: &str = "registry.json";
pub const GATEWAY_FILE_NAME: &str = "gateway.json";
pub const AUTH_FILE_NAME: &str = "auth.json";
pub const STATUS_FILE_NAME: &str = "status.json";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolve the data directory: an explicit non-blank `--data-dir` wins,
/// otherwise ~/.codex-account-orchestrator.
pub fn base_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = data_dir.filter(|d| !d.as_os_str().is_empty()) {
        return Ok(dir.to_path_buf());
    }
    let home = dirs::home_dir().context("Cannot find home directory")?;
    Ok(home.join(".codex-account-orchestrator"))
}

pub fn account_dir(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}

pub fn registry_path(base: &Path) -> PathBuf {
    base.join(REGISTRY_FILE_NAME)
}

pub fn gateway_path(base: &Path) -> PathBuf {
    base.join(GATEWAY_FILE_NAME)
}

pub fn auth_path(account_dir: &Path) -> PathBuf {
    account_dir.join(AUTH_FILE_NAME)
}

pub fn status_path(account_dir: &Path) -> PathBuf {
    account_dir.join(STATUS_FILE_NAME)
}

/// Sibling path an unreadable document is preserved under.
pub fn corrupt_backup_path(path: &Path, stamp_ms: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{stamp_ms}"));
    path.with_file_name(name)
}
