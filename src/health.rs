use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{error::CaoError, inspect::AccountInspection};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOptions {
    pub expires_within_hours: u32,
    pub max_failures: u32,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            expires_within_hours: 24,
            max_failures: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthIssue {
    pub account: String,
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl HealthIssue {
    fn new(account: &str, severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            account: account.to_string(),
            severity,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub issues: Vec<HealthIssue>,
    pub ok_count: usize,
    pub warn_count: usize,
    pub error_count: usize,
}

type Rule = fn(&AccountInspection, &HealthOptions, i64) -> Option<HealthIssue>;

/// Independent checks applied to a logged-in account, in report order.
const RULES: [Rule; 4] = [token_rule, cooldown_rule, failures_rule, last_error_rule];

/// Evaluate one account at instant `now_ms`. Pure: no I/O, no clock.
pub fn evaluate(
    inspection: &AccountInspection,
    options: &HealthOptions,
    now_ms: i64,
) -> Vec<HealthIssue> {
    if let Some(issue) = login_guard(inspection) {
        return vec![issue];
    }
    RULES
        .iter()
        .filter_map(|rule| rule(inspection, options, now_ms))
        .collect()
}

/// Evaluate a batch of distinct accounts and tally the findings.
pub fn summarize(
    inspections: &[AccountInspection],
    options: &HealthOptions,
    now_ms: i64,
) -> Result<HealthSummary, CaoError> {
    let mut names = HashSet::new();
    if let Some(dup) = inspections.iter().find(|i| !names.insert(i.name.as_str())) {
        return Err(CaoError::DuplicateInspection(dup.name.clone()));
    }

    let issues: Vec<HealthIssue> = inspections
        .iter()
        .flat_map(|i| evaluate(i, options, now_ms))
        .collect();

    let flagged: HashSet<&str> = issues.iter().map(|i| i.account.as_str()).collect();
    let count = |sev: Severity| issues.iter().filter(|i| i.severity == sev).count();

    Ok(HealthSummary {
        ok_count: inspections.len() - flagged.len(),
        warn_count: count(Severity::Warn),
        error_count: count(Severity::Error),
        issues,
    })
}

fn login_guard(inspection: &AccountInspection) -> Option<HealthIssue> {
    (!inspection.logged_in).then(|| {
        HealthIssue::new(
            &inspection.name,
            Severity::Error,
            "not_logged_in",
            "No auth.json found for this account.",
        )
    })
}

fn token_rule(inspection: &AccountInspection, options: &HealthOptions, now_ms: i64) -> Option<HealthIssue> {
    let name = &inspection.name;
    let Some(expires_at) = inspection.token_details.expires_at_ms else {
        return Some(HealthIssue::new(
            name,
            Severity::Warn,
            "token_unknown",
            "Token expiry could not be determined.",
        ));
    };

    if expires_at <= now_ms {
        return Some(HealthIssue::new(name, Severity::Error, "token_expired", "Token is expired."));
    }

    let threshold = i64::from(options.expires_within_hours) * HOUR_MS;
    (expires_at - now_ms <= threshold).then(|| {
        HealthIssue::new(
            name,
            Severity::Warn,
            "token_expiring_soon",
            format!("Token expires within {}h.", options.expires_within_hours),
        )
    })
}

fn cooldown_rule(inspection: &AccountInspection, _: &HealthOptions, now_ms: i64) -> Option<HealthIssue> {
    let until = inspection.status.cooldown_until_ms?;
    (until > now_ms).then(|| {
        HealthIssue::new(
            &inspection.name,
            Severity::Warn,
            "cooldown_active",
            "Account is currently in cooldown.",
        )
    })
}

fn failures_rule(inspection: &AccountInspection, options: &HealthOptions, _: i64) -> Option<HealthIssue> {
    let failures = inspection.status.consecutive_failures?;
    (failures >= options.max_failures).then(|| {
        HealthIssue::new(
            &inspection.name,
            Severity::Warn,
            "failures_high",
            format!("Consecutive failures >= {}.", options.max_failures),
        )
    })
}

fn last_error_rule(inspection: &AccountInspection, _: &HealthOptions, _: i64) -> Option<HealthIssue> {
    let err = inspection.status.last_error.as_deref().filter(|e| !e.is_empty())?;
    Some(HealthIssue::new(
        &inspection.name,
        Severity::Warn,
        "last_error",
        format!("Last error: {err}"),
    ))
}
