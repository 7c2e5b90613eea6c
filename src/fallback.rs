//! The run loop: try each candidate account in turn, moving on only when an
//! attempt fails with something that looks like quota exhaustion.

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::{
    accounts,
    error::CaoError,
    paths, quota,
    registry::{validate_account_name, Registry},
    runner::{AttemptOutcome, AttemptRunner, CANCELLED_EXIT_CODE},
    status,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Attempting(usize),
    /// Quota failure with another candidate left; `next` is its index.
    FailedFallback { next: usize },
    Succeeded,
    /// Non-zero exit that must not trigger a switch.
    FailedTerminal { exit_code: i32 },
    /// Every candidate failed on quota.
    Exhausted { exit_code: i32 },
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::FailedTerminal { .. }
                | SessionState::Exhausted { .. }
                | SessionState::Cancelled
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionState::Succeeded => Some(0),
            SessionState::FailedTerminal { exit_code } | SessionState::Exhausted { exit_code } => {
                Some(*exit_code)
            }
            SessionState::Cancelled => Some(CANCELLED_EXIT_CODE),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub account: String,
    pub exit_code: i32,
    pub quota: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub fallback: bool,
    /// How long a quota-failed account is marked as cooling down.
    pub cooldown_ms: i64,
}

/// One `cao run` invocation over a fixed list of candidates.
#[derive(Debug)]
pub struct FallbackSession {
    candidates: Vec<String>,
    state: SessionState,
    attempts: Vec<AttemptRecord>,
}

/// Candidate accounts for a run. A specific request narrows the list to
/// that one account; the run is refused if it is not registered.
pub fn resolve_candidates(registry: &Registry, requested: Option<&str>) -> Result<Vec<String>, CaoError> {
    if registry.accounts.is_empty() {
        return Err(CaoError::NoAccounts);
    }
    match requested {
        None => Ok(registry.ordered_accounts()),
        Some(raw) => {
            let name = validate_account_name(raw)?;
            if !registry.contains(&name) {
                return Err(CaoError::UnknownAccount(name));
            }
            Ok(vec![name])
        }
    }
}

/// Where an attempt leads. Success and non-quota failures stop before the
/// fallback decision is ever made.
pub fn next_state(index: usize, candidates: usize, outcome: &AttemptOutcome, fallback: bool) -> SessionState {
    if outcome.cancelled {
        return SessionState::Cancelled;
    }
    if outcome.exit_code == 0 {
        return SessionState::Succeeded;
    }
    if !fallback || !quota::is_quota_signal(&outcome.output) {
        return SessionState::FailedTerminal {
            exit_code: outcome.exit_code,
        };
    }
    if index + 1 < candidates {
        SessionState::FailedFallback { next: index + 1 }
    } else {
        SessionState::Exhausted {
            exit_code: outcome.exit_code,
        }
    }
}

impl FallbackSession {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates,
            state: SessionState::Idle,
            attempts: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Drive the session to a terminal state and return its exit code.
    pub fn run<R: AttemptRunner>(&mut self, base: &Path, runner: &mut R, settings: RunSettings) -> Result<i32> {
        if self.candidates.is_empty() {
            return Err(CaoError::NoAccounts.into());
        }

        self.state = SessionState::Attempting(0);
        while let SessionState::Attempting(index) = self.state {
            let name = self.candidates[index].clone();
            let dir = accounts::prepare_account_dir(base, &name)?;

            eprintln!("{} {}", "Using account:".cyan().bold(), name);
            let outcome = runner.run_attempt(&name, &dir)?;
            let next = next_state(index, self.candidates.len(), &outcome, settings.fallback);
            debug!(account = %name, exit_code = outcome.exit_code, state = ?next, "attempt classified");

            let quota = matches!(next, SessionState::FailedFallback { .. } | SessionState::Exhausted { .. });
            if !outcome.cancelled {
                record_status(&dir, &outcome, quota, settings.cooldown_ms);
            }
            self.attempts.push(AttemptRecord {
                account: name,
                exit_code: outcome.exit_code,
                quota,
            });

            self.state = match next {
                SessionState::FailedFallback { next } => {
                    eprintln!(
                        "{} {}",
                        "Quota exhausted. Falling back to:".yellow().bold(),
                        self.candidates[next]
                    );
                    SessionState::Attempting(next)
                }
                SessionState::Exhausted { .. } => {
                    eprintln!("{}", "All accounts exhausted due to quota.".red().bold());
                    next
                }
                SessionState::Cancelled => {
                    eprintln!("{}", "Run cancelled.".yellow());
                    next
                }
                other => other,
            };
        }

        debug_assert!(self.state.is_terminal());
        info!(state = ?self.state, attempts = self.attempts.len(), "run finished");
        Ok(self.state.exit_code().unwrap_or(1))
    }
}

/// Bookkeeping only; a failure here never changes the run's outcome.
fn record_status(dir: &Path, outcome: &AttemptOutcome, quota: bool, cooldown_ms: i64) {
    let result = status::load(dir).and_then(|mut s| {
        if outcome.exit_code == 0 {
            s.record_success();
        } else if quota {
            let until = Utc::now().timestamp_millis().saturating_add(cooldown_ms);
            s.record_failure(&format!("Quota exhausted (exit {})", outcome.exit_code), Some(until));
        } else {
            s.record_failure(&format!("Exited with code {}", outcome.exit_code), None);
        }
        status::save(dir, &s)
    });
    if let Err(e) = result {
        warn!(path = %paths::status_path(dir).display(), error = %e, "could not update account status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned outcomes and remembers which accounts ran.
    struct ScriptedRunner {
        script: VecDeque<(i32, &'static str)>,
        calls: Vec<String>,
    }

    impl ScriptedRunner {
        fn new(script: &[(i32, &'static str)]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                calls: Vec::new(),
            }
        }
    }

    impl AttemptRunner for ScriptedRunner {
        fn run_attempt(&mut self, account: &str, account_dir: &Path) -> Result<AttemptOutcome> {
            assert!(account_dir.is_dir());
            self.calls.push(account.to_string());
            let (exit_code, output) = self.script.pop_front().expect("unexpected attempt");
            Ok(AttemptOutcome {
                exit_code,
                output: output.to_string(),
                cancelled: false,
            })
        }
    }

    fn registry() -> Registry {
        Registry {
            default_account: Some("alpha".into()),
            accounts: vec!["alpha".into(), "beta".into()],
        }
    }

    fn settings(fallback: bool) -> RunSettings {
        RunSettings {
            fallback,
            cooldown_ms: 900_000,
        }
    }

    fn outcome(exit_code: i32, output: &str) -> AttemptOutcome {
        AttemptOutcome {
            exit_code,
            output: output.to_string(),
            cancelled: false,
        }
    }

    #[test]
    fn quota_failure_falls_back_to_next_account() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(&[(1, "Error: quota exceeded"), (0, "done")]);
        let mut session = FallbackSession::new(resolve_candidates(&registry(), None).unwrap());

        let code = session.run(base.path(), &mut runner, settings(true)).unwrap();

        assert_eq!(code, 0);
        assert_eq!(runner.calls, vec!["alpha", "beta"]);
        assert_eq!(session.attempts().len(), 2);
        assert!(session.attempts()[0].quota);
        assert_eq!(session.state(), &SessionState::Succeeded);

        let alpha = status::load(&paths::account_dir(base.path(), "alpha")).unwrap();
        assert_eq!(alpha.consecutive_failures, Some(1));
        assert!(alpha.cooldown_until_ms.is_some());
        let beta = status::load(&paths::account_dir(base.path(), "beta")).unwrap();
        assert_eq!(beta.consecutive_failures, Some(0));
    }

    #[test]
    fn fallback_disabled_stops_after_first_attempt() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(&[(2, "Error: quota exceeded")]);
        let mut session = FallbackSession::new(resolve_candidates(&registry(), None).unwrap());

        let code = session.run(base.path(), &mut runner, settings(false)).unwrap();

        assert_eq!(code, 2);
        assert_eq!(runner.calls, vec!["alpha"]);
        assert_eq!(session.state(), &SessionState::FailedTerminal { exit_code: 2 });
    }

    #[test]
    fn non_quota_failure_is_terminal() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(&[(4, "panic: index out of range")]);
        let mut session = FallbackSession::new(resolve_candidates(&registry(), None).unwrap());

        assert_eq!(session.run(base.path(), &mut runner, settings(true)).unwrap(), 4);
        assert_eq!(runner.calls, vec!["alpha"]);

        let alpha = status::load(&paths::account_dir(base.path(), "alpha")).unwrap();
        assert_eq!(alpha.cooldown_until_ms, None);
        assert_eq!(alpha.last_error.as_deref(), Some("Exited with code 4"));
    }

    #[test]
    fn all_quota_failures_exhaust_with_last_code() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(&[(1, "usage limit reached"), (3, "Insufficient credits")]);
        let mut session = FallbackSession::new(resolve_candidates(&registry(), None).unwrap());

        assert_eq!(session.run(base.path(), &mut runner, settings(true)).unwrap(), 3);
        assert_eq!(session.state(), &SessionState::Exhausted { exit_code: 3 });
        assert_eq!(session.attempts().len(), 2);
    }

    #[test]
    fn default_account_runs_first() {
        let base = tempfile::tempdir().unwrap();
        let mut reg = registry();
        reg.set_default("beta").unwrap();
        let mut runner = ScriptedRunner::new(&[(0, "")]);
        let mut session = FallbackSession::new(resolve_candidates(&reg, None).unwrap());

        session.run(base.path(), &mut runner, settings(true)).unwrap();
        assert_eq!(runner.calls, vec!["beta"]);
    }

    #[test]
    fn requested_account_narrows_candidates() {
        let reg = registry();
        assert_eq!(resolve_candidates(&reg, Some("beta")).unwrap(), vec!["beta"]);
        assert!(matches!(
            resolve_candidates(&reg, Some("ghost")),
            Err(CaoError::UnknownAccount(_))
        ));
        assert!(matches!(
            resolve_candidates(&Registry::default(), None),
            Err(CaoError::NoAccounts)
        ));
    }

    #[test]
    fn narrowed_run_does_not_fall_back() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = ScriptedRunner::new(&[(1, "quota exceeded")]);
        let mut session = FallbackSession::new(resolve_candidates(&registry(), Some("beta")).unwrap());

        assert_eq!(session.run(base.path(), &mut runner, settings(true)).unwrap(), 1);
        assert_eq!(runner.calls, vec!["beta"]);
        assert_eq!(session.state(), &SessionState::Exhausted { exit_code: 1 });
    }

    #[test]
    fn transition_table() {
        assert_eq!(next_state(0, 2, &outcome(0, "quota"), true), SessionState::Succeeded);
        assert_eq!(
            next_state(0, 2, &outcome(1, "quota"), true),
            SessionState::FailedFallback { next: 1 }
        );
        assert_eq!(
            next_state(1, 2, &outcome(1, "quota"), true),
            SessionState::Exhausted { exit_code: 1 }
        );
        assert_eq!(
            next_state(0, 2, &outcome(1, "segfault"), true),
            SessionState::FailedTerminal { exit_code: 1 }
        );

        let mut cancelled = outcome(1, "quota");
        cancelled.cancelled = true;
        assert_eq!(next_state(0, 2, &cancelled, true), SessionState::Cancelled);
    }

    #[test]
    fn terminal_states_carry_exit_codes() {
        assert!(!SessionState::Attempting(0).is_terminal());
        assert_eq!(SessionState::Idle.exit_code(), None);
        assert_eq!(SessionState::Cancelled.exit_code(), Some(CANCELLED_EXIT_CODE));
        assert!(SessionState::Exhausted { exit_code: 9 }.is_terminal());
    }

    #[cfg(unix)]
    #[test]
    fn real_child_switches_account_on_quota() {
        use crate::runner::CodexRunner;
        use std::sync::{atomic::AtomicBool, Arc};

        let base = tempfile::tempdir().unwrap();
        let script = r#"case "$CODEX_HOME" in */alpha) echo "Quota exceeded" >&2; exit 1;; esac; exit 0"#;
        let mut runner = CodexRunner::new(
            "sh".into(),
            vec!["-c".into(), script.into()],
            true,
            Arc::new(AtomicBool::new(false)),
        );
        let mut session = FallbackSession::new(resolve_candidates(&registry(), None).unwrap());

        assert_eq!(session.run(base.path(), &mut runner, settings(true)).unwrap(), 0);
        let ran: Vec<_> = session.attempts().iter().map(|a| a.account.as_str()).collect();
        assert_eq!(ran, vec!["alpha", "beta"]);
    }
}
