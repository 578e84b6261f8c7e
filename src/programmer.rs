//! ICSP programming through an external command-line tool.
//!
//! The tool is started with an argument vector (no shell), its stdout and
//! stderr are captured together, and the run is bounded by a timeout after
//! which the child is killed. A nonzero exit is a normal outcome returned to
//! the caller; only a failed launch or a timeout are errors.
//!
//! # Example
//!
//! ```rust,ignore
//! let programmer = Programmer::new("/usr/local/bin/p14", Duration::from_secs(120),
//!     Arc::new(TokioProcessRunner));
//! let output = programmer.flash(Path::new("/srv/fw/thule.hex")).await?;
//! if !output.success() {
//!     eprintln!("{}", output.output);
//! }
//! ```

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ProgrammerError;

/// Exit status and combined output of one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; -1 when the process was ended by a signal.
    pub exit_code: i32,
    /// Stdout followed by stderr.
    pub output: String,
}

impl ProcessOutput {
    /// Exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an external program to completion.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args`, killing it after `timeout`.
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProgrammerError>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProgrammerError> {
        let launch_error = |source: std::io::Error| ProgrammerError::Launch {
            tool: program.to_path_buf(),
            source,
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;

        // dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(launch_error)?,
            Err(_) => return Err(ProgrammerError::Timeout(timeout)),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        })
    }
}

/// Canned reply of a [`ScriptedProcessRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// The tool ran and exited.
    Exit {
        /// Exit code.
        code: i32,
        /// Captured output.
        output: String,
    },
    /// The tool could not be started.
    LaunchFailure,
    /// The tool hung until the timeout.
    Timeout,
}

impl ScriptedResponse {
    /// Successful run with the given output.
    pub fn ok(output: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            output: output.into(),
        }
    }

    /// Failed run with the given exit code and output.
    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self::Exit {
            code,
            output: output.into(),
        }
    }
}

/// [`ProcessRunner`] that replays queued responses and records every call.
///
/// Used for simulated fixtures: once the queue is empty every call gets the
/// fallback response. An optional run time makes each call take that long.
pub struct ScriptedProcessRunner {
    queue: Mutex<VecDeque<ScriptedResponse>>,
    fallback: ScriptedResponse,
    run_time: Duration,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProcessRunner {
    /// Runner answering every call with a successful exit.
    pub fn succeeding() -> Self {
        Self::with_fallback(ScriptedResponse::ok("Programming... Done.\n"))
    }

    /// Runner answering with `fallback` once the queue is empty.
    pub fn with_fallback(fallback: ScriptedResponse) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            run_time: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make every call take `run_time`.
    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// Queue a response for the next call.
    pub fn push(&self, response: ScriptedResponse) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Program and arguments of every call so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[OsString],
        timeout: Duration,
    ) -> Result<ProcessOutput, ProgrammerError> {
        let mut call = vec![program.display().to_string()];
        call.extend(args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);

        let response = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if !self.run_time.is_zero() {
            tokio::time::sleep(self.run_time.min(timeout)).await;
        }

        match response {
            ScriptedResponse::Exit { code, output } => Ok(ProcessOutput {
                exit_code: code,
                output,
            }),
            ScriptedResponse::LaunchFailure => Err(ProgrammerError::Launch {
                tool: program.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }),
            ScriptedResponse::Timeout => Err(ProgrammerError::Timeout(timeout)),
        }
    }
}

/// Front end of the ICSP programming tool.
#[derive(Clone)]
pub struct Programmer {
    tool: PathBuf,
    timeout: Duration,
    runner: Arc<dyn ProcessRunner>,
}

impl Programmer {
    /// Create a programmer invoking `tool`.
    pub fn new(tool: impl Into<PathBuf>, timeout: Duration, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            tool: tool.into(),
            timeout,
            runner,
        }
    }

    /// Erase and program `firmware` (`<tool> program <firmware> 1`).
    ///
    /// # Errors
    ///
    /// [`ProgrammerError::Launch`] if the tool cannot be started and
    /// [`ProgrammerError::Timeout`] if it does not finish in time. A nonzero
    /// exit is returned as `Ok`.
    pub async fn flash(&self, firmware: &Path) -> Result<ProcessOutput, ProgrammerError> {
        info!(firmware = %firmware.display(), "flashing");
        let args = [
            OsString::from("program"),
            firmware.as_os_str().to_os_string(),
            OsString::from("1"),
        ];
        self.invoke(&args).await
    }

    /// Erase the device (`<tool> blank`).
    pub async fn erase(&self) -> Result<ProcessOutput, ProgrammerError> {
        info!("erasing");
        self.invoke(&[OsString::from("blank")]).await
    }

    async fn invoke(&self, args: &[OsString]) -> Result<ProcessOutput, ProgrammerError> {
        let result = self.runner.run(&self.tool, args, self.timeout).await;
        match &result {
            Ok(output) if !output.success() => {
                warn!(exit_code = output.exit_code, "programmer reported failure");
            }
            Err(err) => warn!(error = %err, "programmer did not run"),
            Ok(_) => {}
        }
        result
    }
}
