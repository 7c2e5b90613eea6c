use anyhow::Result;
use std::{
    ffi::OsString,
    io::{self, IsTerminal, Read, Write},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{capture::OutputCapture, error::CaoError};

/// Exit code reported for an attempt stopped by Ctrl-C / SIGTERM.
pub const CANCELLED_EXIT_CODE: i32 = 130;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_BUF_SIZE: usize = 8 * 1024;
/// How long to keep draining after the child exits while something it
/// left behind still holds the output pipes.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What one run of the wrapped command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub exit_code: i32,
    /// Tail of the combined stdout/stderr; empty when output was not captured.
    pub output: String,
    pub cancelled: bool,
}

/// Runs the wrapped command once for a given account.
pub trait AttemptRunner {
    fn run_attempt(&mut self, account: &str, account_dir: &Path) -> Result<AttemptOutcome>;
}

/// Spawns the real Codex binary with `CODEX_HOME` pointed at the account.
pub struct CodexRunner {
    pub bin: PathBuf,
    pub args: Vec<OsString>,
    /// Tee output through an [`OutputCapture`] so quota errors can be seen.
    pub capture: bool,
    pub cancel: Arc<AtomicBool>,
}

impl CodexRunner {
    pub fn new(bin: PathBuf, args: Vec<OsString>, capture: bool, cancel: Arc<AtomicBool>) -> Self {
        Self {
            bin,
            args,
            capture,
            cancel,
        }
    }

    /// Start the child. The returned flag is true when it leads its own
    /// process group, so cancellation can reach everything it started.
    fn spawn(&self, account_dir: &Path) -> Result<(Child, bool)> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args)
            .env("CODEX_HOME", account_dir)
            .stdin(Stdio::inherit());
        if self.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        // A background group reading the terminal gets SIGTTIN, so an
        // interactive child stays in our group and receives Ctrl-C directly.
        let own_group = cfg!(unix) && !io::stdin().is_terminal();
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if own_group {
                cmd.process_group(0);
            }
        }

        let child = cmd.spawn().map_err(|source| CaoError::Spawn {
            bin: self.bin.clone(),
            source,
        })?;
        Ok((child, own_group))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Wait for the child, killing it if cancellation is requested.
    fn wait(&self, child: &mut Child, own_group: bool) -> Result<(ExitStatus, bool)> {
        let mut killed = false;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, killed));
            }
            if self.cancelled() && !killed {
                kill(child, own_group);
                killed = true;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl AttemptRunner for CodexRunner {
    fn run_attempt(&mut self, account: &str, account_dir: &Path) -> Result<AttemptOutcome> {
        debug!(account, bin = %self.bin.display(), args = ?self.args, "spawning attempt");
        let (mut child, own_group) = self.spawn(account_dir)?;

        let mut capture = OutputCapture::new();
        let mut killed = false;

        if self.capture {
            let (tx, rx) = mpsc::channel::<Vec<u8>>();
            let readers = [
                child.stdout.take().map(|out| forward(out, io::stdout(), tx.clone())),
                child.stderr.take().map(|err| forward(err, io::stderr(), tx.clone())),
            ];
            drop(tx);

            let mut exited_at: Option<Instant> = None;
            let drained = loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(chunk) => capture.add_chunk(&chunk),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break true,
                }
                if self.cancelled() && !killed {
                    kill(&mut child, own_group);
                    killed = true;
                }
                if exited_at.is_none() && child.try_wait()?.is_some() {
                    exited_at = Some(Instant::now());
                }
                if exited_at.is_some_and(|at| at.elapsed() >= DRAIN_GRACE) {
                    debug!(account, "child exited but its output pipes are still open");
                    break false;
                }
            };

            // Readers still blocked on a pipe held by a leftover process are
            // detached rather than joined.
            if drained {
                for handle in readers.into_iter().flatten() {
                    let _ = handle.join();
                }
            }
        }

        let (status, killed_while_waiting) = self.wait(&mut child, own_group)?;
        let cancelled = killed || killed_while_waiting || self.cancelled();
        let exit_code = if cancelled {
            CANCELLED_EXIT_CODE
        } else {
            status_code(status)
        };

        debug!(account, exit_code, cancelled, lines = capture.line_count(), "attempt finished");
        Ok(AttemptOutcome {
            exit_code,
            output: capture.text(),
            cancelled,
        })
    }
}

/// Copy a child pipe to our own stream as it arrives, handing each chunk
/// to the orchestrator thread as well.
fn forward<R, W>(mut src: R, mut dst: W, tx: mpsc::Sender<Vec<u8>>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "reading child output failed");
                    break;
                }
            };
            let _ = dst.write_all(&buf[..n]);
            let _ = dst.flush();
            if tx.send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    })
}

fn kill(child: &mut Child, own_group: bool) {
    warn!(pid = child.id(), own_group, "cancellation requested, stopping child");
    #[cfg(unix)]
    {
        if own_group {
            // a negative pid signals the whole process group
            let group = format!("-{}", child.id());
            match Command::new("kill")
                .args(["-KILL", "--", &group])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
            {
                Ok(status) if status.success() => return,
                Ok(status) => debug!(%status, "group kill failed, stopping the child only"),
                Err(e) => debug!(error = %e, "kill unavailable, stopping the child only"),
            }
        }
    }
    if let Err(e) = child.kill() {
        debug!(error = %e, "child already exited");
    }
}

fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
