// SPDX-License-Identifier: MIT

//! Command execution engine
//!
//! Spawns external processes, streams their output, infers progress and
//! enforces a soft timeout. Nothing here knows about workflows.

mod capture;
mod engine;
mod scripted;

pub use engine::execute;
pub use scripted::{RecordedCall, ScriptedResponse, ScriptedRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::error::CommandError;
use crate::runtime::progress::{ProgressParser, ProgressReporter};

/// Locale variables forced to UTF-8 unless the command sets them itself
const UTF8_LOCALE_VARS: [&str; 2] = ["LANG", "LC_ALL"];
const UTF8_LOCALE: &str = "en_US.UTF-8";

/// An external command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    executable: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_inherit_env")]
    inherit_env: bool,
}

fn default_inherit_env() -> bool {
    true
}

impl Command {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            inherit_env: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Start from an empty environment instead of the parent's
    pub fn clear_env(mut self) -> Self {
        self.inherit_env = false;
        self
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn inherits_env(&self) -> bool {
        self.inherit_env
    }

    /// Environment passed to the child: the command's own variables plus
    /// UTF-8 locale defaults for anything it did not set.
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        for var in UTF8_LOCALE_VARS {
            env.entry(var.to_string())
                .or_insert_with(|| UTF8_LOCALE.to_string());
        }
        env
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Outcome of one finished execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub duration_ms: u64,
}

impl CommandResult {
    /// Last `max_lines` lines of stderr followed by stdout, for diagnostics
    pub fn output_tail(&self, max_lines: usize) -> String {
        let mut lines: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|l| !l.trim().is_empty())
            .collect();
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        lines.join("\n")
    }
}

/// Per-execution options
#[derive(Clone)]
pub struct ExecOptions {
    /// Deadline for the whole execution; `None` waits forever
    pub timeout: Option<Duration>,
    pub progress_parser: Option<Arc<dyn ProgressParser>>,
    pub progress_reporter: Option<Arc<dyn ProgressReporter>>,
    pub progress_debounce: Duration,
    /// Scale the parser's values are measured on
    pub progress_total: f64,
    /// Every output chunk is also written here
    pub output_file: Option<PathBuf>,
    /// How long to wait for exit after the termination signal
    pub term_grace: Duration,
    /// Send SIGKILL instead of SIGTERM on timeout
    pub force_kill_on_timeout: bool,
    /// Size of the in-memory tail kept for each stream
    pub max_captured_bytes: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(600)),
            progress_parser: None,
            progress_reporter: None,
            progress_debounce: Duration::from_secs(1),
            progress_total: 100.0,
            output_file: None,
            term_grace: Duration::from_secs(2),
            force_kill_on_timeout: false,
            max_captured_bytes: 1024 * 1024,
        }
    }
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("timeout", &self.timeout)
            .field("progress_parser", &self.progress_parser.is_some())
            .field("progress_reporter", &self.progress_reporter.is_some())
            .field("progress_debounce", &self.progress_debounce)
            .field("output_file", &self.output_file)
            .field("term_grace", &self.term_grace)
            .field("force_kill_on_timeout", &self.force_kill_on_timeout)
            .field("max_captured_bytes", &self.max_captured_bytes)
            .finish()
    }
}

/// Runs commands on behalf of leaf nodes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &Command,
        options: &ExecOptions,
    ) -> Result<CommandResult, CommandError>;
}

/// `CommandRunner` backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        command: &Command,
        options: &ExecOptions,
    ) -> Result<CommandResult, CommandError> {
        execute(command, options).await
    }
}
