//! Backend dispatch.
//!
//! A backend executes one job inside its workspace. The concrete backend is
//! chosen once per job from `config_resolved.backend` and never re-decided
//! mid-job. `ProcessBackend` runs the resolved argv; `MockBackend` is
//! scripted through the same wire fields, so tests exercise the full
//! protocol path with injected outcomes.

use std::io::{self, BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use relay_protocol::request::JobRequest;

use crate::cancel::StopState;
use crate::paths::JobWorkspace;

/// Backend errors. A backend error is distinct from a nonzero exit: the
/// backend could not run at all.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("backend command is empty")]
    EmptyCommand,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
}

/// Result of a backend run.
#[derive(Debug, Clone, Copy)]
pub struct BackendExit {
    /// Process exit code; -1 when the process died to a signal.
    pub exit_code: i32,
}

/// Execution context handed to a backend.
pub struct ExecContext {
    /// The job's exclusive workspace.
    pub workspace: JobWorkspace,
    /// Sink for backend output lines.
    pub log: Sender<String>,
    /// Stop flag; the backend must terminate promptly once set.
    pub stop: Arc<StopState>,
    /// Grace between SIGTERM and forced kill.
    pub kill_grace: Duration,
}

/// A job execution backend.
pub trait Backend: Send + Sync {
    /// Backend name as recorded in `config_resolved`.
    fn name(&self) -> &str;

    /// Execute the job to completion or until stopped.
    fn execute(&self, request: &JobRequest, ctx: &ExecContext) -> Result<BackendExit, BackendError>;
}

/// Select a backend by its resolved name.
pub fn select_backend(request: &JobRequest) -> Result<Box<dyn Backend>, BackendError> {
    match request.config_resolved.backend.as_str() {
        "process" => Ok(Box::new(ProcessBackend)),
        "mock" => Ok(Box::new(MockBackend::from_argv(&request.config_resolved.argv))),
        other => Err(BackendError::UnknownBackend(other.to_string())),
    }
}

/// Runs the resolved argv as a child process inside the job workspace.
///
/// The child leads its own process group so termination reaches the whole
/// tree: SIGTERM first, SIGKILL after the grace period.
pub struct ProcessBackend;

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn execute(&self, request: &JobRequest, ctx: &ExecContext) -> Result<BackendExit, BackendError> {
        let argv = &request.config_resolved.argv;
        if argv.is_empty() {
            return Err(BackendError::EmptyCommand);
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&ctx.workspace.source_dir)
            .env("RELAY_JOB_ID", &request.job_id)
            .env("RELAY_BUILD_DIR", &ctx.workspace.build_dir)
            .env("RELAY_ARTIFACT_DIR", &ctx.workspace.artifact_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut pumps = Vec::new();
        for stream in [stdout.map(stream_reader), stderr.map(stream_reader)]
            .into_iter()
            .flatten()
        {
            let log = ctx.log.clone();
            pumps.push(thread::spawn(move || pump_lines(stream, log)));
        }

        let mut terminated_at: Option<Instant> = None;
        let exit_code = loop {
            if let Some(status) = child.try_wait()? {
                break status.code().unwrap_or(-1);
            }
            if ctx.stop.is_set() {
                match terminated_at {
                    None => {
                        terminate(&child);
                        terminated_at = Some(Instant::now());
                    }
                    Some(at) if at.elapsed() >= ctx.kill_grace => {
                        force_kill(&mut child);
                        terminated_at = Some(Instant::now() + ctx.kill_grace);
                    }
                    Some(_) => {}
                }
            }
            thread::sleep(Duration::from_millis(50));
        };

        for pump in pumps {
            let _ = pump.join();
        }
        Ok(BackendExit { exit_code })
    }
}

fn stream_reader<R: io::Read + Send + 'static>(stream: R) -> Box<dyn BufRead + Send> {
    Box::new(BufReader::new(stream))
}

fn pump_lines(reader: Box<dyn BufRead + Send>, log: Sender<String>) {
    for line in reader.lines().map_while(Result::ok) {
        if log.send(line).is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn terminate(child: &std::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_child: &std::process::Child) {}

#[cfg(unix)]
fn force_kill(child: &mut std::process::Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    let _ = child.kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut std::process::Child) {
    let _ = child.kill();
}

/// Scripted backend for tests.
///
/// Directives are carried in the resolved argv, one per element:
/// `exit=N`, `sleep_ms=N`, `log=<line>` (repeatable),
/// `artifact=<name>:<content>` (repeatable).
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    pub exit_code: i32,
    pub sleep: Duration,
    pub log_lines: Vec<String>,
    pub artifacts: Vec<(String, String)>,
}

impl MockBackend {
    /// Parse directives from a resolved argv.
    pub fn from_argv(argv: &[String]) -> Self {
        let mut backend = Self::default();
        for arg in argv {
            if let Some(value) = arg.strip_prefix("exit=") {
                backend.exit_code = value.parse().unwrap_or(0);
            } else if let Some(value) = arg.strip_prefix("sleep_ms=") {
                backend.sleep = Duration::from_millis(value.parse().unwrap_or(0));
            } else if let Some(value) = arg.strip_prefix("log=") {
                backend.log_lines.push(value.to_string());
            } else if let Some(value) = arg.strip_prefix("artifact=") {
                if let Some((name, content)) = value.split_once(':') {
                    backend
                        .artifacts
                        .push((name.to_string(), content.to_string()));
                }
            }
        }
        backend
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn execute(&self, _request: &JobRequest, ctx: &ExecContext) -> Result<BackendExit, BackendError> {
        for line in &self.log_lines {
            let _ = ctx.log.send(line.clone());
        }
        for (name, content) in &self.artifacts {
            std::fs::write(ctx.workspace.artifact_dir.join(name), content)?;
        }

        let deadline = Instant::now() + self.sleep;
        while Instant::now() < deadline {
            if ctx.stop.is_set() {
                return Ok(BackendExit { exit_code: 130 });
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(BackendExit {
            exit_code: self.exit_code,
        })
    }
}
