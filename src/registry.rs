use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashSet,
    fs,
    io::{ErrorKind, Write},
    path::Path,
    sync::LazyLock,
};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{error::CaoError, paths};

static ACCOUNT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid account name regex"));

/// Persisted account bookkeeping: fallback order plus the default account.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    pub default_account: Option<String>,
    pub accounts: Vec<String>,
}

impl Registry {
    /// Build a registry from an arbitrary JSON document, dropping bad names
    /// and repairing the default so both invariants hold.
    pub fn from_value(value: &Value) -> Self {
        let accounts = normalize_account_names(value.get("accounts").unwrap_or(&Value::Null));
        let default_account = value
            .get("default_account")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| accounts.iter().any(|a| a.as_str() == *d))
            .map(String::from)
            .or_else(|| accounts.first().cloned());

        Registry {
            default_account,
            accounts,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.accounts.iter().any(|a| a == name)
    }

    /// Register an account. Returns `false` if it was already present.
    pub fn add(&mut self, raw: &str) -> Result<bool, CaoError> {
        let name = validate_account_name(raw)?;
        if self.contains(&name) {
            return Ok(false);
        }
        self.accounts.push(name.clone());
        if self.default_account.is_none() {
            self.default_account = Some(name);
        }
        Ok(true)
    }

    pub fn set_default(&mut self, raw: &str) -> Result<(), CaoError> {
        let name = raw.trim();
        if !self.contains(name) {
            return Err(CaoError::UnknownAccount(name.to_string()));
        }
        self.default_account = Some(name.to_string());
        Ok(())
    }

    /// Accounts in the order a run should try them: the default first,
    /// then the rest in registration order.
    pub fn ordered_accounts(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.accounts.len());
        if let Some(default) = self.default_account.as_ref().filter(|d| self.contains(d)) {
            ordered.push(default.clone());
        }
        ordered.extend(
            self.accounts
                .iter()
                .filter(|a| Some(*a) != self.default_account.as_ref())
                .cloned(),
        );
        ordered
    }
}

pub fn validate_account_name(raw: &str) -> Result<String, CaoError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !ACCOUNT_NAME_RE.is_match(trimmed) {
        return Err(CaoError::InvalidAccountName(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Keep valid, unique account names in first-seen order.
/// Anything that is not an array of strings contributes nothing.
pub fn normalize_account_names(raw: &Value) -> Vec<String> {
    let Some(entries) = raw.as_array() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    entries
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|name| ACCOUNT_NAME_RE.is_match(name))
        .filter(|name| seen.insert(name.to_string()))
        .map(String::from)
        .collect()
}

pub fn load(base: &Path) -> Result<Registry> {
    let path = paths::registry_path(base);
    Ok(read_json_document(&path)?
        .map(|value| Registry::from_value(&value))
        .unwrap_or_default())
}

pub fn save(base: &Path, registry: &Registry) -> Result<()> {
    fs::create_dir_all(base)
        .with_context(|| format!("Cannot create data directory {}", base.display()))?;
    let content = serde_json::to_string_pretty(registry)? + "\n";
    write_atomic(&paths::registry_path(base), &content)
}

/// Read a JSON document, treating a missing file as `None`.
///
/// A file that exists but does not parse is copied to a
/// `<name>.corrupt-<millis>` sibling and also reported as `None`.
pub fn read_json_document(path: &Path) -> Result<Option<Value>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    // invalid UTF-8 surfaces here as a parse error too
    match serde_json::from_slice::<Value>(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            let backup = paths::corrupt_backup_path(path, Utc::now().timestamp_millis());
            fs::write(&backup, &raw)
                .with_context(|| format!("Cannot back up {} to {}", path.display(), backup.display()))?;
            warn!(path = %path.display(), backup = %backup.display(), error = %err, "invalid JSON document backed up");
            eprintln!(
                "  {} {} was invalid and has been backed up to {}.",
                "Warning:".yellow().bold(),
                path.file_name().unwrap_or_default().to_string_lossy(),
                backup.display()
            );
            Ok(None)
        }
    }
}

/// Atomically write a JSON file: validate → temp file → rename → chmod 600.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    // Validate JSON before touching the real file
    let _: Value = serde_json::from_str(content).context("Refusing to write invalid JSON")?;

    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    {
        let mut f = fs::File::create(&temp_path)
            .with_context(|| format!("Cannot create temp file {}", temp_path.display()))?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Cannot finalize file at {}", path.display()))?;

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    debug!(path = %path.display(), "wrote document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(dir.path()).unwrap(), Registry::default());
    }

    #[test]
    fn normalize_drops_junk_and_duplicates() {
        let raw = json!(["alpha", 3, "  ", "bad name", "beta", "alpha", " gamma ", null, "x/y"]);
        assert_eq!(normalize_account_names(&raw), vec!["alpha", "beta", "gamma"]);
        assert!(normalize_account_names(&json!("alpha")).is_empty());
    }

    #[test]
    fn invalid_default_is_repaired() {
        let reg = Registry::from_value(&json!({"default_account": "ghost", "accounts": ["b", "a"]}));
        assert_eq!(reg.default_account.as_deref(), Some("b"));

        let reg = Registry::from_value(&json!({"default_account": "ghost", "accounts": []}));
        assert_eq!(reg.default_account, None);

        let reg = Registry::from_value(&json!({"accounts": ["a", "b"]}));
        assert_eq!(reg.default_account.as_deref(), Some("a"));
    }

    #[test]
    fn hand_edited_file_is_sanitized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            paths::registry_path(dir.path()),
            r#"{"default_account": "beta", "accounts": ["alpha", "beta", "alpha", "no way"]}"#,
        )
        .unwrap();

        let reg = load(dir.path()).unwrap();
        assert_eq!(reg.accounts, vec!["alpha", "beta"]);
        assert_eq!(reg.default_account.as_deref(), Some("beta"));
    }

    #[test]
    fn corrupt_file_is_backed_up_and_empty_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::registry_path(dir.path());
        fs::write(&path, "{ not json").unwrap();

        let reg = load(dir.path()).unwrap();
        assert_eq!(reg, Registry::default());

        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("registry.json.corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read_to_string(backups[0].path()).unwrap(), "{ not json");
        // original is left in place, untouched
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn non_utf8_file_is_backed_up_and_empty_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = paths::registry_path(dir.path());
        let bytes: &[u8] = b"{\"accounts\": [\"a\xff\"]}";
        fs::write(&path, bytes).unwrap();

        assert_eq!(load(dir.path()).unwrap(), Registry::default());

        let backup = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with("registry.json.corrupt-"))
            .expect("backup written");
        assert_eq!(fs::read(backup.path()).unwrap(), bytes);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry {
            default_account: Some("beta".into()),
            accounts: vec!["alpha".into(), "beta".into()],
        };
        save(dir.path(), &reg).unwrap();
        assert_eq!(load(dir.path()).unwrap(), reg);

        let text = fs::read_to_string(paths::registry_path(dir.path())).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(text.contains("\n  \"accounts\""));
    }

    #[test]
    fn add_is_idempotent_and_keeps_order() {
        let mut reg = Registry::default();
        assert!(reg.add("alpha").unwrap());
        assert!(reg.add("beta").unwrap());
        assert!(!reg.add("alpha").unwrap());
        assert_eq!(reg.accounts, vec!["alpha", "beta"]);
        assert_eq!(reg.default_account.as_deref(), Some("alpha"));
        assert!(matches!(reg.add("no good"), Err(CaoError::InvalidAccountName(_))));
    }

    #[test]
    fn set_default_rejects_unknown_without_mutating() {
        let mut reg = Registry::default();
        reg.add("alpha").unwrap();
        let before = reg.clone();
        assert!(matches!(reg.set_default("ghost"), Err(CaoError::UnknownAccount(_))));
        assert_eq!(reg, before);
    }

    #[test]
    fn ordered_accounts_put_default_first() {
        let reg = Registry {
            default_account: Some("beta".into()),
            accounts: vec!["alpha".into(), "beta".into(), "gamma".into()],
        };
        assert_eq!(reg.ordered_accounts(), vec!["beta", "alpha", "gamma"]);
    }
}
