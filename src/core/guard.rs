//! Guard Verifier.
//!
//! Guards are external commands that print a JSON payload
//! `{"status": "pass"|"fail", "violations": [...], "count": N}` on stdout.
//! [`normalize_outcome`] is the only place a guard verdict is decided and it
//! is fail-closed: `Pass` requires exit code 0, a well-formed payload, status
//! `pass`, no violations and a zero count. Everything else is `Fail`.

use crate::core::error::PhasegateError;
use crate::core::output::compact_line;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_CAPTURE_CHARS: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Working directory relative to the project root.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuardStatus {
    Pass,
    Fail,
}

impl GuardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardStatus::Pass => "pass",
            GuardStatus::Fail => "fail",
        }
    }
}

/// Outcome of one guard invocation. Never reinterpreted after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardResult {
    pub guard: String,
    pub status: GuardStatus,
    pub violations: Vec<String>,
    pub count: usize,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timestamp: String,
}

impl GuardResult {
    pub fn passed(&self) -> bool {
        self.status == GuardStatus::Pass
    }

    /// A failing result for a guard that could not be resolved or started.
    pub fn unavailable(guard: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        GuardResult {
            guard: guard.to_string(),
            status: GuardStatus::Fail,
            violations: vec![reason],
            count: 1,
            exit_code: None,
            duration_ms: 0,
            timestamp: time::now_epoch_z(),
        }
    }
}

/// What happened to a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited {
        code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut {
        after: Duration,
    },
    Cancelled,
    SpawnFailed(String),
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { code: Some(0), .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessOutcome::Exited { code, .. } => *code,
            _ => None,
        }
    }

    /// One-line description for evidence and reports.
    pub fn describe(&self) -> String {
        match self {
            ProcessOutcome::Exited {
                code,
                stdout,
                stderr,
            } => {
                let mut text = String::from_utf8_lossy(stderr).to_string();
                if text.trim().is_empty() {
                    text = String::from_utf8_lossy(stdout).to_string();
                }
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                if text.trim().is_empty() {
                    format!("exit {code}")
                } else {
                    format!("exit {code}: {}", compact_line(&text, MAX_CAPTURE_CHARS))
                }
            }
            ProcessOutcome::TimedOut { after } => {
                format!("timed out after {}s", after.as_secs())
            }
            ProcessOutcome::Cancelled => "cancelled".to_string(),
            ProcessOutcome::SpawnFailed(e) => format!("could not start: {e}"),
        }
    }
}

/// Normalized verdict before timestamps are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: GuardStatus,
    pub violations: Vec<String>,
    pub count: usize,
}

impl Verdict {
    fn fail(violations: Vec<String>, declared_count: usize) -> Self {
        let count = declared_count.max(violations.len()).max(1);
        Verdict {
            status: GuardStatus::Fail,
            violations,
            count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuardPayload {
    status: String,
    violations: Vec<serde_json::Value>,
    count: u64,
}

fn parse_payload(stdout: &[u8]) -> Result<GuardPayload, String> {
    let text = std::str::from_utf8(stdout).map_err(|e| format!("stdout is not UTF-8: {e}"))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty output".to_string());
    }
    serde_json::from_str::<GuardPayload>(trimmed).map_err(|e| e.to_string())
}

fn render_violation(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Map a process outcome to a verdict. Pure and deterministic.
pub fn normalize_outcome(outcome: &ProcessOutcome) -> Verdict {
    let (code, stdout) = match outcome {
        ProcessOutcome::Exited { code, stdout, .. } => (*code, stdout),
        other => return Verdict::fail(vec![format!("guard {}", other.describe())], 1),
    };

    let payload = match parse_payload(stdout) {
        Ok(payload) => payload,
        Err(reason) => {
            let message = match code {
                Some(0) => format!("malformed guard payload: {reason}"),
                _ => format!(
                    "guard exited abnormally ({}) with unparsable output: {reason}",
                    outcome.describe()
                ),
            };
            return Verdict::fail(vec![message], 1);
        }
    };

    let mut violations: Vec<String> = payload.violations.iter().map(render_violation).collect();
    let declared = usize::try_from(payload.count).unwrap_or(usize::MAX);

    if code != Some(0) {
        violations.push(format!("guard exited abnormally ({})", outcome.describe()));
        return Verdict::fail(violations, declared);
    }

    match payload.status.as_str() {
        "pass" if violations.is_empty() && declared == 0 => Verdict {
            status: GuardStatus::Pass,
            violations,
            count: 0,
        },
        "pass" => {
            violations.push(format!(
                "inconsistent payload: status pass with {} listed violation(s) and count {}",
                payload.violations.len(),
                payload.count
            ));
            Verdict::fail(violations, declared)
        }
        "fail" => {
            if violations.is_empty() {
                violations.push("guard reported fail without listing violations".to_string());
            }
            Verdict::fail(violations, declared)
        }
        other => Verdict::fail(vec![format!("unknown guard status '{other}'")], 1),
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(
    source: Option<R>,
    stream: Stream,
    tx: mpsc::Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = source {
            let _ = reader.read_to_end(&mut buf);
        }
        let _ = tx.send((stream, buf));
    });
}

enum Drained {
    Complete,
    Expired,
    Cancelled,
}

/// Output of a running child, collected by reader threads.
struct Capture {
    rx: mpsc::Receiver<(Stream, Vec<u8>)>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

impl Capture {
    fn start(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel();
        drain(child.stdout.take(), Stream::Stdout, tx.clone());
        drain(child.stderr.take(), Stream::Stderr, tx);
        Self {
            rx,
            stdout: None,
            stderr: None,
        }
    }

    /// Wait for both pipes to close. A background process that inherited a
    /// pipe keeps it open, so the wait is bounded by `deadline`.
    fn finish_by(&mut self, deadline: Instant, cancel: Option<&AtomicBool>) -> Drained {
        while self.stdout.is_none() || self.stderr.is_none() {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Drained::Cancelled;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Drained::Expired;
            }
            match self.rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
                Ok((Stream::Stdout, buf)) => self.stdout = Some(buf),
                Ok((Stream::Stderr, buf)) => self.stderr = Some(buf),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Drained::Expired,
            }
        }
        Drained::Complete
    }
}

/// Kill the child and everything it started. The child leads its own
/// process group, so stragglers holding the output pipes die with it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        #[allow(clippy::cast_possible_wrap)]
        let group = Pid::from_raw(child.id() as i32);
        let _ = killpg(group, Signal::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run a command to completion, killing it on timeout or when `cancel` is set.
///
/// The timeout covers the whole run including output collection: a command
/// that exits while a background process keeps its stdout open still times
/// out.
pub fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> ProcessOutcome {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::SpawnFailed(e.to_string()),
    };

    let mut capture = Capture::start(&mut child);
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return match capture.finish_by(deadline, cancel) {
                    Drained::Complete => ProcessOutcome::Exited {
                        code: status.code(),
                        stdout: capture.stdout.take().unwrap_or_default(),
                        stderr: capture.stderr.take().unwrap_or_default(),
                    },
                    Drained::Cancelled => {
                        terminate(&mut child);
                        ProcessOutcome::Cancelled
                    }
                    Drained::Expired => {
                        terminate(&mut child);
                        ProcessOutcome::TimedOut { after: timeout }
                    }
                };
            }
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return ProcessOutcome::SpawnFailed(format!("wait failed: {e}"));
            }
        }
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            terminate(&mut child);
            return ProcessOutcome::Cancelled;
        }
        if Instant::now() >= deadline {
            terminate(&mut child);
            return ProcessOutcome::TimedOut { after: timeout };
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run a shell command line (`sh -c`), as used for card acceptance commands.
pub fn run_shell(
    command_line: &str,
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
    cancel: Option<&AtomicBool>,
) -> ProcessOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line).current_dir(cwd);
    for (k, v) in env {
        cmd.env(k, v);
    }
    run_bounded(cmd, timeout, cancel)
}

/// Something that can evaluate a named check. The gate evaluator and the
/// orchestrator only see this seam.
pub trait CheckRunner: Send + Sync {
    fn run_check(&self, guard: &str) -> GuardResult;
}

/// Runs declared guards as external commands.
#[derive(Debug, Clone)]
pub struct GuardVerifier {
    guards: BTreeMap<String, GuardSpec>,
    working_dir: PathBuf,
    default_timeout: Duration,
}

impl GuardVerifier {
    pub fn new(
        guards: impl IntoIterator<Item = GuardSpec>,
        working_dir: &Path,
        default_timeout: Duration,
    ) -> Self {
        Self {
            guards: guards.into_iter().map(|g| (g.name.clone(), g)).collect(),
            working_dir: working_dir.to_path_buf(),
            default_timeout,
        }
    }

    pub fn verify(&self, spec: &GuardSpec) -> GuardResult {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let cwd = match &spec.cwd {
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        };
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args).current_dir(&cwd);

        tracing::debug!(guard = %spec.name, command = %spec.command, "running guard");
        let start = Instant::now();
        let outcome = run_bounded(cmd, timeout, None);
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut verdict = normalize_outcome(&outcome);
        if !matches!(outcome, ProcessOutcome::Exited { .. }) {
            let err = PhasegateError::GuardExecutionError {
                guard: spec.name.clone(),
                reason: outcome.describe(),
            };
            tracing::warn!(error = %err, "guard did not complete");
            verdict.violations = vec![err.to_string()];
        }
        tracing::debug!(
            guard = %spec.name,
            status = verdict.status.as_str(),
            violations = verdict.count,
            "guard finished"
        );

        GuardResult {
            guard: spec.name.clone(),
            status: verdict.status,
            violations: verdict.violations,
            count: verdict.count,
            exit_code: outcome.exit_code(),
            duration_ms,
            timestamp: time::now_epoch_z(),
        }
    }
}

impl CheckRunner for GuardVerifier {
    fn run_check(&self, guard: &str) -> GuardResult {
        match self.guards.get(guard) {
            Some(spec) => self.verify(spec),
            None => {
                let err = PhasegateError::GuardExecutionError {
                    guard: guard.to_string(),
                    reason: "not declared in the plan".to_string(),
                };
                GuardResult::unavailable(guard, err.to_string())
            }
        }
    }
}
