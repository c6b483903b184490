// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Command, CommandResult, CommandRunner, ExecOptions};
use crate::runtime::error::CommandError;

/// One canned reply
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedResponse {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Timeout {
        elapsed_ms: u64,
    },
    SpawnFailure(String),
}

impl ScriptedResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// A command invocation seen by `ScriptedRunner`
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: Command,
    pub force_kill_on_timeout: bool,
}

#[derive(Default)]
struct Script {
    responses: VecDeque<ScriptedResponse>,
    calls: Vec<RecordedCall>,
}

/// `CommandRunner` that replays queued responses instead of spawning
/// processes. Once the queue is empty every command succeeds with no output,
/// which is what `stepwise step --dry-run` relies on. Clones share the same
/// script.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        let runner = Self::new();
        for response in responses {
            runner.push(response);
        }
        runner
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script().responses.push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script().calls.clone()
    }

    /// Executables invoked so far, in order
    pub fn executables(&self) -> Vec<String> {
        self.script()
            .calls
            .iter()
            .map(|c| c.command.executable().to_string())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.script().responses.len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        command: &Command,
        options: &ExecOptions,
    ) -> Result<CommandResult, CommandError> {
        let response = {
            let mut script = self.script();
            script.calls.push(RecordedCall {
                command: command.clone(),
                force_kill_on_timeout: options.force_kill_on_timeout,
            });
            script.responses.pop_front()
        };
        log::debug!("Scripted run of '{}': {:?}", command, response);

        match response.unwrap_or_else(|| ScriptedResponse::success("")) {
            ScriptedResponse::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandResult {
                exit_code: Some(code),
                signal: None,
                stdout,
                stderr,
                success: code == 0,
                duration_ms: 0,
            }),
            ScriptedResponse::Timeout { elapsed_ms } => {
                Err(CommandError::timeout(command.executable(), elapsed_ms))
            }
            ScriptedResponse::SpawnFailure(message) => Err(CommandError::spawn(
                command.executable(),
                std::io::Error::new(std::io::ErrorKind::NotFound, message),
            )),
        }
    }
}
