use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{paths, registry};

/// Longest `lastError` text kept in status.json.
const MAX_ERROR_CHARS: usize = 200;

/// Per-account run bookkeeping kept in `<account>/status.json`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AccountStatus {
    pub fn record_success(&mut self) {
        *self = AccountStatus {
            consecutive_failures: Some(0),
            ..AccountStatus::default()
        };
    }

    /// `cooldown_until_ms` is passed only for quota failures.
    pub fn record_failure(&mut self, error: &str, cooldown_until_ms: Option<i64>) {
        self.consecutive_failures = Some(self.consecutive_failures.unwrap_or(0).saturating_add(1));
        self.last_error = Some(error.chars().take(MAX_ERROR_CHARS).collect());
        if cooldown_until_ms.is_some() {
            self.cooldown_until_ms = cooldown_until_ms;
        }
    }
}

/// A missing or unreadable status file is an empty status.
pub fn load(account_dir: &Path) -> Result<AccountStatus> {
    let path = paths::status_path(account_dir);
    let Some(value) = registry::read_json_document(&path)? else {
        return Ok(AccountStatus::default());
    };
    Ok(serde_json::from_value(value).unwrap_or_default())
}

pub fn save(account_dir: &Path, status: &AccountStatus) -> Result<()> {
    let content = serde_json::to_string_pretty(status)? + "\n";
    registry::write_atomic(&paths::status_path(account_dir), &content)
        .with_context(|| format!("Cannot write status for {}", account_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_and_success_resets() {
        let mut s = AccountStatus::default();
        s.record_failure("quota", Some(1_500));
        s.record_failure("quota again", None);
        assert_eq!(s.consecutive_failures, Some(2));
        assert_eq!(s.cooldown_until_ms, Some(1_500));
        assert_eq!(s.last_error.as_deref(), Some("quota again"));

        s.record_success();
        assert_eq!(s, AccountStatus {
            consecutive_failures: Some(0),
            ..AccountStatus::default()
        });
    }

    #[test]
    fn status_file_round_trips_in_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = AccountStatus::default();
        s.record_failure("x".repeat(500).as_str(), Some(900_000));
        save(dir.path(), &s).unwrap();

        let raw = std::fs::read_to_string(paths::status_path(dir.path())).unwrap();
        assert!(raw.contains("\"cooldownUntilMs\": 900000"));

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.last_error.map(|e| e.len()), Some(MAX_ERROR_CHARS));
    }

    #[test]
    fn wrong_shape_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(paths::status_path(dir.path()), r#"{"consecutiveFailures": "many"}"#).unwrap();
        assert_eq!(load(dir.path()).unwrap(), AccountStatus::default());
    }
}
