use std::path::PathBuf;
use thiserror::Error;

/// Expected failure conditions surfaced to the CLI layer.
#[derive(Debug, Error)]
pub enum CaoError {
    #[error("Unknown account '{0}'. Run `cao list` to see registered accounts.")]
    UnknownAccount(String),

    #[error("Invalid account name '{0}': use letters, digits, '-' or '_'")]
    InvalidAccountName(String),

    #[error("No accounts registered. Use `cao add <name>` first.")]
    NoAccounts,

    /// The same account was handed to one health pass more than once.
    #[error("Account '{0}' appears more than once in a health check")]
    DuplicateInspection(String),

    #[error("Failed to start {}: {source}", .bin.display())]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
