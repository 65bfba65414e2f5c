//! External tool invocation.
//!
//! Builders never spawn processes directly; they describe an [`Invocation`]
//! and hand it to a [`ToolInvoker`]. [`ProcessInvoker`] runs real programs,
//! and tests substitute a scripted invoker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use crate::error::BuildError;

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Unit the command runs for, used in error reports.
    pub unit: String,
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// A command for `unit` running `program` in `cwd`.
    pub fn new(unit: &str, program: &str, cwd: impl Into<PathBuf>) -> Self {
        Self {
            unit: unit.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Returns the value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a successful command printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Combined stdout and stderr.
    pub log: String,
}

/// Runs external commands on behalf of builders.
///
/// Implementations are shared across worker threads.
pub trait ToolInvoker: Send + Sync {
    /// Runs `invocation` to completion. A non-zero exit is reported as
    /// [`BuildError::BuildFailed`] with the captured output.
    fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput, BuildError>;
}

/// Runs commands as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl ToolInvoker for ProcessInvoker {
    fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput, BuildError> {
        tracing::debug!(unit = %invocation.unit, command = %invocation, "running tool");
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .output()
            .map_err(|source| BuildError::ToolUnavailable {
                program: invocation.program.clone(),
                source,
            })?;

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(ToolOutput { log })
        } else {
            Err(BuildError::BuildFailed {
                unit: invocation.unit.clone(),
                exit_code: output.status.code(),
                log,
            })
        }
    }
}
