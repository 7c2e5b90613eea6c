use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde_json::json;
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{
    fallback::{self, FallbackSession, RunSettings},
    gateway,
    health::{self, HealthIssue, HealthOptions, HealthSummary, Severity},
    inspect::{self, AccountInspection},
    paths,
    registry::{self, validate_account_name, Registry},
    runner::CodexRunner,
};

pub const DEFAULT_CONFIG_TOML: &str = "\
# Codex config for this account
cli_auth_credentials_store = \"file\"
preferred_auth_method = \"chatgpt\"
";

// ── Core functions (no stdout, return descriptive string) ─────────────────────

/// Returns the registry, whether the account was new, and a message.
pub(crate) fn core_add(base: &Path, raw: &str) -> Result<(Registry, bool, String)> {
    ensure_base_dir(base)?;
    let mut reg = registry::load(base)?;
    let name = validate_account_name(raw)?;

    let added = reg.add(&name)?;
    prepare_account_dir(base, &name)?;
    if added {
        registry::save(base, &reg)?;
    }

    let msg = if added {
        format!("Added account: {name}")
    } else {
        format!("Account {name} is already registered.")
    };
    Ok((reg, added, msg))
}

pub(crate) fn core_use(base: &Path, raw: &str) -> Result<Registry> {
    ensure_base_dir(base)?;
    let mut reg = registry::load(base)?;
    reg.set_default(raw)?;
    registry::save(base, &reg)?;
    Ok(reg)
}

/// Collect inspections for every registered account, in registry order.
pub(crate) fn core_inspect(base: &Path, reg: &Registry) -> Result<Vec<AccountInspection>> {
    reg.accounts
        .iter()
        .map(|name| inspect::inspect(base, name))
        .collect()
}

// ── Account directory setup ───────────────────────────────────────────────────

pub fn ensure_base_dir(base: &Path) -> Result<()> {
    fs::create_dir_all(base)
        .with_context(|| format!("Cannot create data directory {}", base.display()))?;

    #[cfg(unix)]
    fs::set_permissions(base, fs::Permissions::from_mode(0o700))?;

    Ok(())
}

/// Make sure `<base>/<name>/` and its config.toml exist. An existing
/// config is never overwritten.
pub fn prepare_account_dir(base: &Path, name: &str) -> Result<PathBuf> {
    let dir = paths::account_dir(base, name);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create account directory {}", dir.display()))?;

    #[cfg(unix)]
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;

    let config = dir.join(paths::CONFIG_FILE_NAME);
    if !config.exists() {
        fs::write(&config, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Cannot write {}", config.display()))?;
    }
    Ok(dir)
}

// ── Add account ───────────────────────────────────────────────────────────────

pub fn add(base: &Path, name: &str) -> Result<()> {
    let (reg, added, msg) = core_add(base, name)?;
    let name = validate_account_name(name)?;

    if added {
        println!("  {} {}", "✓".green().bold(), msg);
    } else {
        println!("  {} {}", "·".yellow(), msg);
    }
    println!("  Account directory: {}", paths::account_dir(base, &name).display());
    println!(
        "  Default account: {}",
        reg.default_account.as_deref().unwrap_or("(none)")
    );
    println!("  Run {} to start with fallback.", "cao run -- <codex args>".cyan().bold());
    Ok(())
}

// ── Set default ───────────────────────────────────────────────────────────────

pub fn use_account(base: &Path, name: &str) -> Result<()> {
    let reg = core_use(base, name)?;
    println!(
        "  {} Default account set to: {}",
        "✓".green().bold(),
        reg.default_account.as_deref().unwrap_or("(none)").bold()
    );
    Ok(())
}

// ── List accounts ─────────────────────────────────────────────────────────────

pub fn list(base: &Path) -> Result<()> {
    let reg = registry::load(base)?;

    if reg.accounts.is_empty() {
        println!("\n  {}\n", "No accounts registered.".dimmed());
        println!("  Run {} first.\n", "cao add <name>".cyan().bold());
        return Ok(());
    }

    for name in &reg.accounts {
        if reg.default_account.as_deref() == Some(name.as_str()) {
            println!("{} {}", "*".green().bold(), name.green().bold());
        } else {
            println!("  {name}");
        }
    }
    Ok(())
}

// ── Status / doctor ───────────────────────────────────────────────────────────

pub struct StatusRequest {
    pub options: HealthOptions,
    pub json: bool,
    /// Framed dashboard instead of the compact listing.
    pub pretty: bool,
    /// List every finding and fail when one is an error.
    pub doctor: bool,
}

/// Returns the exit code: 1 in doctor mode when any account has an
/// error-level finding, otherwise 0.
pub fn status(base: &Path, req: StatusRequest) -> Result<i32> {
    let reg = registry::load(base)?;
    let inspections = core_inspect(base, &reg)?;
    let now_ms = Utc::now().timestamp_millis();
    let summary = health::summarize(&inspections, &req.options, now_ms)?;

    if req.json {
        println!("{}", serde_json::to_string_pretty(&status_json(&reg, &inspections, &summary)?)?);
    } else if inspections.is_empty() {
        println!("No accounts registered. Use `cao add <name>` first.");
    } else if req.pretty {
        print!("{}", render_pretty(&reg, &inspections, &summary, now_ms));
    } else {
        print!("{}", render_compact(&reg, &inspections, &summary, req.doctor, now_ms));
    }

    Ok(if req.doctor && summary.error_count > 0 { 1 } else { 0 })
}

fn status_json(
    reg: &Registry,
    inspections: &[AccountInspection],
    summary: &HealthSummary,
) -> Result<serde_json::Value> {
    let accounts = inspections
        .iter()
        .map(|i| {
            let mut v = serde_json::to_value(i)?;
            v["isDefault"] = json!(is_default(reg, &i.name));
            Ok(v)
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(json!({
        "defaultAccount": reg.default_account,
        "accounts": accounts,
        "issues": summary.issues,
        "totals": {
            "ok": summary.ok_count,
            "warnings": summary.warn_count,
            "errors": summary.error_count
        }
    }))
}

fn is_default(reg: &Registry, name: &str) -> bool {
    reg.default_account.as_deref() == Some(name)
}

/// `marker name login expiry`, uncolored so callers can measure it.
fn account_row(reg: &Registry, i: &AccountInspection, now_ms: i64) -> String {
    let marker = if is_default(reg, &i.name) { "*" } else { " " };
    let login = if i.logged_in { "logged in" } else { "not logged in" };
    format!(
        "{marker} {:<16} {:<14} expires: {}",
        i.name,
        login,
        describe_expiry(i.token_details.expires_at_ms, now_ms)
    )
}

fn issue_row(issue: &HealthIssue) -> String {
    let tag = match issue.severity {
        Severity::Error => "error",
        Severity::Warn => "warn",
    };
    format!("{tag:<5} {} [{}] {}", issue.account, issue.code, issue.message)
}

fn totals_row(summary: &HealthSummary) -> String {
    format!(
        "Accounts: {} ok, {} warnings, {} errors",
        summary.ok_count, summary.warn_count, summary.error_count
    )
}

fn paint_issue(row: String, severity: Severity) -> String {
    match severity {
        Severity::Error => row.as_str().red().to_string(),
        Severity::Warn => row.as_str().yellow().to_string(),
    }
}

fn render_compact(
    reg: &Registry,
    inspections: &[AccountInspection],
    summary: &HealthSummary,
    doctor: bool,
    now_ms: i64,
) -> String {
    let mut lines: Vec<String> = inspections
        .iter()
        .map(|i| {
            let row = account_row(reg, i, now_ms);
            if is_default(reg, &i.name) {
                row.as_str().green().to_string()
            } else {
                row
            }
        })
        .collect();

    if doctor {
        lines.push(String::new());
        if summary.issues.is_empty() {
            lines.push(format!("  {}", "No problems found.".green()));
        }
        for issue in &summary.issues {
            lines.push(format!("  {}", paint_issue(issue_row(issue), issue.severity)));
        }
    } else if !summary.issues.is_empty() {
        lines.push(format!("\n  Run {} for details.", "cao status --doctor".cyan().bold()));
    }

    lines.push(String::new());
    lines.push(totals_row(summary));
    lines.join("\n") + "\n"
}

fn render_pretty(
    reg: &Registry,
    inspections: &[AccountInspection],
    summary: &HealthSummary,
    now_ms: i64,
) -> String {
    const TITLE: &str = "CAO Status";

    let accounts: Vec<String> = inspections.iter().map(|i| account_row(reg, i, now_ms)).collect();
    let issues: Vec<(String, Severity)> = summary
        .issues
        .iter()
        .map(|issue| (issue_row(issue), issue.severity))
        .collect();
    let totals = totals_row(summary);

    let width = accounts
        .iter()
        .chain(issues.iter().map(|(row, _)| row))
        .chain([&totals])
        .map(|row| row.chars().count())
        .max()
        .unwrap_or(0)
        .max(TITLE.len());
    // pad before painting: escape codes would skew the width
    let pad = |row: &str| format!("{row:<width$}");
    let rule = "─".repeat(width + 2);

    let mut lines = vec![
        format!("┌{rule}┐"),
        format!("│ {} │", pad(TITLE).as_str().bold()),
        format!("├{rule}┤"),
    ];
    lines.extend(accounts.iter().map(|row| format!("│ {} │", pad(row))));
    if !issues.is_empty() {
        lines.push(format!("├{rule}┤"));
        lines.extend(
            issues
                .into_iter()
                .map(|(row, severity)| format!("│ {} │", paint_issue(pad(&row), severity))),
        );
    }
    lines.push(format!("├{rule}┤"));
    lines.push(format!("│ {} │", pad(&totals)));
    lines.push(format!("└{rule}┘"));
    lines.join("\n") + "\n"
}

fn describe_expiry(expires_at_ms: Option<i64>, now_ms: i64) -> String {
    let Some(ms) = expires_at_ms else {
        return "unknown".into();
    };
    let Some(at) = DateTime::<Utc>::from_timestamp_millis(ms) else {
        return "unknown".into();
    };
    let stamp = at.format("%Y-%m-%d %H:%M UTC");
    let delta_min = (ms - now_ms) / 60_000;
    if delta_min <= 0 {
        format!("{stamp} (expired)")
    } else if delta_min < 120 {
        format!("{stamp} (in {delta_min}m)")
    } else {
        format!("{stamp} (in {}h)", delta_min / 60)
    }
}

// ── Run with fallback ─────────────────────────────────────────────────────────

pub struct RunRequest {
    pub account: Option<String>,
    pub codex: PathBuf,
    pub fallback: bool,
    pub args: Vec<OsString>,
}

/// Returns the exit code the process should end with.
pub fn run(base: &Path, req: RunRequest, cancel: Arc<AtomicBool>) -> Result<i32> {
    ensure_base_dir(base)?;
    let reg = registry::load(base)?;
    let candidates = fallback::resolve_candidates(&reg, req.account.as_deref())?;
    let gateway = gateway::load(base)?;

    let settings = RunSettings {
        fallback: req.fallback,
        cooldown_ms: gateway.cooldown_ms(),
    };
    let mut runner = CodexRunner::new(req.codex, req.args, req.fallback, cancel);
    FallbackSession::new(candidates).run(base, &mut runner, settings)
}

// ── Gateway config ────────────────────────────────────────────────────────────

pub fn gateway_show(base: &Path) -> Result<()> {
    let cfg = gateway::load(base)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
