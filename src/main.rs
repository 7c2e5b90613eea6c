mod accounts;
mod capture;
mod error;
mod fallback;
mod gateway;
mod health;
mod inspect;
mod paths;
mod quota;
mod registry;
mod runner;
mod status;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::{
    ffi::OsString,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::{
    accounts::{RunRequest, StatusRequest},
    health::HealthOptions,
};

#[derive(Parser)]
#[command(
    name = "cao",
    version,
    about = "Codex OAuth account fallback orchestrator",
    long_about = "\
Run Codex under several accounts and switch to the next one \
automatically when the current account runs out of quota.\n\
\n\
Each account lives in its own directory under \
~/.codex-account-orchestrator (override with --data-dir) and is \
passed to Codex through CODEX_HOME."
)]
struct Cli {
    /// Custom data directory
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new account and create its config
    Add {
        /// Account name (letters, digits, '-' and '_')
        name: String,
    },

    /// List registered accounts
    #[command(alias = "ls")]
    List,

    /// Set the default account
    Use {
        name: String,
    },

    /// Run codex with quota fallback across accounts
    Run {
        /// Run with a specific account only
        #[arg(long)]
        account: Option<String>,

        /// Path to the codex binary
        #[arg(long, default_value = "codex")]
        codex: PathBuf,

        /// Disable automatic fallback
        #[arg(long)]
        no_fallback: bool,

        /// Arguments passed through to codex (after `--`)
        #[arg(last = true)]
        args: Vec<OsString>,
    },

    /// Show account login, token expiry and health findings
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,

        /// Framed dashboard view
        #[arg(long, conflicts_with = "json")]
        pretty: bool,

        /// List every health finding; exit 1 if any is an error
        #[arg(long)]
        doctor: bool,

        /// Warn when a token expires within this many hours
        #[arg(long, default_value_t = HealthOptions::default().expires_within_hours)]
        expires_within_hours: u32,

        /// Warn once this many runs in a row have failed
        #[arg(long, default_value_t = HealthOptions::default().max_failures)]
        max_failures: u32,
    },

    /// Gateway configuration
    Gateway {
        #[command(subcommand)]
        action: GatewayAction,
    },
}

#[derive(Subcommand)]
enum GatewayAction {
    /// Print the resolved gateway configuration
    Show,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("\n  {} {:#}\n", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let base = paths::base_dir(cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Add { name } => accounts::add(&base, &name)?,
        Commands::List => accounts::list(&base)?,
        Commands::Use { name } => accounts::use_account(&base, &name)?,
        Commands::Run {
            account,
            codex,
            no_fallback,
            args,
        } => {
            let req = RunRequest {
                account,
                codex,
                fallback: !no_fallback,
                args,
            };
            return accounts::run(&base, req, cancel_on_signal());
        }
        Commands::Status {
            json,
            pretty,
            doctor,
            expires_within_hours,
            max_failures,
        } => {
            let req = StatusRequest {
                options: HealthOptions {
                    expires_within_hours,
                    max_failures,
                },
                json,
                pretty,
                doctor,
            };
            return accounts::status(&base, req);
        }
        Commands::Gateway {
            action: GatewayAction::Show,
        } => accounts::gateway_show(&base)?,
    }
    Ok(0)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Flag flipped by Ctrl-C / SIGTERM; the runner kills the active child.
fn cancel_on_signal() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(error = %e, "could not install signal handler");
    }
    cancel
}
