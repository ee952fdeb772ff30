//! # Script Steps & Hooks
//!
//! Scripts run out of process. The core only relies on the outcome shape:
//! captured log lines, a pass flag and an optional error message. A script
//! may bind variables for later steps by printing `::set-var name=value`.

mod lines;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::environment::Variables;
use crate::spec::extension_of;

pub use lines::LineBuffer;

/// Stdout prefix a script uses to bind a variable.
pub const SET_VAR_PREFIX: &str = "::set-var ";

/// Lifecycle point at which a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPhase {
    /// A script listed as a playlist step.
    Step,
    BeforeRequest,
    AfterResponse,
}

impl ScriptPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptPhase::Step => "step",
            ScriptPhase::BeforeRequest => "pre",
            ScriptPhase::AfterResponse => "post",
        }
    }
}

/// Inputs exported to a script process.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub phase: ScriptPhase,
    pub variables: Variables,
    /// Status code and body, for `AfterResponse` hooks.
    pub response: Option<(u16, String)>,
}

impl ScriptContext {
    pub fn new(phase: ScriptPhase, variables: Variables) -> Self {
        Self {
            phase,
            variables,
            response: None,
        }
    }
}

/// What a finished script reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub log: Vec<String>,
    pub passed: bool,
    pub error: Option<String>,
    /// Variables bound with `::set-var`.
    pub variables: Variables,
}

impl ScriptOutcome {
    /// Build an outcome from captured stdout and stderr lines.
    pub fn from_output(stdout: Vec<String>, stderr: Vec<String>, exit_code: Option<i32>) -> Self {
        let failure = match exit_code {
            Some(0) => None,
            Some(code) => Some(format!("script exited with status {code}")),
            None => Some("script terminated by signal".to_string()),
        };
        Self::from_lines(stdout, stderr, failure)
    }

    /// A script killed after `timeout`, keeping what it printed until then.
    pub fn timed_out(stdout: Vec<String>, stderr: Vec<String>, timeout: Duration) -> Self {
        Self::from_lines(stdout, stderr, Some(format!("script timed out after {timeout:?}")))
    }

    fn from_lines(stdout: Vec<String>, stderr: Vec<String>, failure: Option<String>) -> Self {
        let mut outcome = ScriptOutcome::default();
        for line in stdout {
            match line.strip_prefix(SET_VAR_PREFIX).and_then(|binding| binding.split_once('=')) {
                Some((name, value)) if !name.trim().is_empty() => {
                    outcome
                        .variables
                        .insert(name.trim().to_string(), value.trim().to_string());
                }
                _ => outcome.log.push(line),
            }
        }

        outcome.passed = failure.is_none();
        outcome.error = failure.map(|status| match stderr.iter().rev().find(|line| !line.trim().is_empty()) {
            Some(last) => format!("{status}: {}", last.trim()),
            None => status,
        });
        outcome.log.extend(stderr);
        outcome
    }
}

/// Failures that leave no outcome at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("No script runner configured for `.{0}` files")]
    NoRunner(String),

    #[error("Failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed to read script output: {0}")]
    Io(String),
}

impl ScriptError {
    /// The script runtime itself could not be invoked.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, ScriptError::NoRunner(_) | ScriptError::Spawn { .. })
    }
}

#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    async fn run(&self, script: &Path, context: &ScriptContext) -> Result<ScriptOutcome, ScriptError>;
}

/// Default runner command lines, keyed by script extension.
pub fn default_runners() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("fsx".to_string(), vec!["dotnet".to_string(), "fsi".to_string()]),
        ("csx".to_string(), vec!["dotnet".to_string(), "script".to_string()]),
    ])
}

/// Runs each script as `<runner...> <script>` in the script's directory.
pub struct ProcessScriptRuntime {
    runners: BTreeMap<String, Vec<String>>,
    timeout: Duration,
}

impl ProcessScriptRuntime {
    pub fn new(runners: BTreeMap<String, Vec<String>>, timeout: Duration) -> Self {
        Self { runners, timeout }
    }

    fn command(&self, script: &Path, context: &ScriptContext) -> Result<(String, Command), ScriptError> {
        let extension = extension_of(script).unwrap_or_default();
        let (program, args) = self
            .runners
            .get(&extension)
            .and_then(|runner| runner.split_first())
            .ok_or_else(|| ScriptError::NoRunner(extension.clone()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("NAP_SCRIPT_PHASE", context.phase.as_str());
        if let Some(dir) = script.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        for (name, value) in &context.variables {
            command.env(format!("NAP_VAR_{name}"), value);
        }
        if let Some((status, body)) = &context.response {
            command
                .env("NAP_RESPONSE_STATUS", status.to_string())
                .env("NAP_RESPONSE_BODY", body);
        }
        Ok((program.clone(), command))
    }
}

#[async_trait]
impl ScriptRuntime for ProcessScriptRuntime {
    async fn run(&self, script: &Path, context: &ScriptContext) -> Result<ScriptOutcome, ScriptError> {
        // the child runs in the script's directory, so hand it an absolute path
        let script = std::path::absolute(script).unwrap_or_else(|_| script.to_path_buf());
        let script = script.as_path();
        let (program, mut command) = self.command(script, context)?;

        debug!(script = %script.display(), phase = context.phase.as_str(), "starting script");
        let mut child = command.spawn().map_err(|err| ScriptError::Spawn {
            program: program.clone(),
            reason: err.to_string(),
        })?;

        // lines land here as they arrive, so a timeout keeps them
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let completed = tokio::time::timeout(self.timeout, async {
            let (stdout, stderr) = tokio::join!(
                read_lines(stdout, &mut stdout_lines),
                read_lines(stderr, &mut stderr_lines)
            );
            match stdout.and(stderr) {
                Ok(()) => child.wait().await,
                Err(err) => Err(err),
            }
        })
        .await;

        let status = match completed {
            Ok(status) => status.map_err(|err| ScriptError::Io(err.to_string()))?,
            Err(_) => {
                warn!(script = %script.display(), timeout = ?self.timeout, "script timed out");
                let _ = child.kill().await;
                return Ok(ScriptOutcome::timed_out(stdout_lines, stderr_lines, self.timeout));
            }
        };
        debug!(script = %script.display(), status = ?status.code(), "script finished");

        Ok(ScriptOutcome::from_output(stdout_lines, stderr_lines, status.code()))
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: Option<R>, lines: &mut Vec<String>) -> std::io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };

    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        lines.extend(buffer.push(&chunk[..read]));
    }
    lines.extend(buffer.finish());
    Ok(())
}
