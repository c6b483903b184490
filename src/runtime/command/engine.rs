// SPDX-License-Identifier: MIT

//! Process spawning, streamed capture and timeout handling

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::capture::CaptureBuffer;
use super::{Command, CommandResult, ExecOptions};
use crate::runtime::error::CommandError;
use crate::runtime::progress::{ProgressDebouncer, ProgressReport, ProgressTracker};

const READ_CHUNK: usize = 8 * 1024;
/// Upper bound for draining pipes after the child exited. Grandchildren
/// that inherited the pipes can keep them open indefinitely.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);
/// Same, after the child was told to stop
const ABORT_DRAIN_LIMIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    bytes: Vec<u8>,
}

/// Mutable bookkeeping for one execution
struct Session<'a> {
    command: &'a Command,
    options: &'a ExecOptions,
    started: Instant,
    stdout: CaptureBuffer,
    stderr: CaptureBuffer,
    tracker: ProgressTracker,
    debouncer: ProgressDebouncer,
    output_file: Option<File>,
}

impl<'a> Session<'a> {
    async fn on_chunk(&mut self, chunk: Chunk) -> Result<(), CommandError> {
        if let Some(file) = self.output_file.as_mut() {
            file.write_all(&chunk.bytes)
                .await
                .map_err(|e| CommandError::io(self.command.executable(), e))?;
        }

        match chunk.stream {
            Stream::Stdout => {
                self.stdout.push(&chunk.bytes);
                if let Some(parser) = &self.options.progress_parser {
                    self.tracker.observe(parser.as_ref(), self.stdout.as_str());
                }
            }
            Stream::Stderr => self.stderr.push(&chunk.bytes),
        }

        self.maybe_report(Instant::now());
        Ok(())
    }

    fn maybe_report(&mut self, now: Instant) {
        let Some(reporter) = &self.options.progress_reporter else {
            return;
        };
        let state = self.tracker.state();
        if self.debouncer.check(state.current, now) {
            let elapsed_ms = now.duration_since(self.started).as_millis() as u64;
            reporter.report(&ProgressReport::from_state(state, elapsed_ms));
        }
    }

    async fn close_file(&mut self) -> Result<(), CommandError> {
        if let Some(mut file) = self.output_file.take() {
            file.flush()
                .await
                .map_err(|e| CommandError::io(self.command.executable(), e))?;
        }
        Ok(())
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Execute `command`, streaming its output, until it exits or times out.
///
/// A non-zero exit is reported through `CommandResult::success`. A timeout
/// sends a graceful termination signal, waits at most `term_grace` for the
/// child, and returns `CommandError::Timeout`; the child is not guaranteed
/// to be gone at that point.
pub async fn execute(
    command: &Command,
    options: &ExecOptions,
) -> Result<CommandResult, CommandError> {
    let executable = command.executable();
    let started = Instant::now();

    // Open the output file before spawning so a bad path cannot leak a child
    let output_file = match &options.output_file {
        Some(path) => Some(
            File::create(path)
                .await
                .map_err(|e| CommandError::io(executable, e))?,
        ),
        None => None,
    };

    let mut cmd = tokio::process::Command::new(executable);
    cmd.args(command.arguments());
    if !command.inherits_env() {
        cmd.env_clear();
    }
    cmd.envs(command.resolved_env());
    if let Some(dir) = command.working_dir() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    log::debug!("Spawning: {}", command);
    let mut child = cmd
        .spawn()
        .map_err(|e| CommandError::spawn(executable, e))?;

    let (tx, mut rx) = mpsc::channel::<Chunk>(64);
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut session = Session {
        command,
        options,
        started,
        stdout: CaptureBuffer::new(options.max_captured_bytes),
        stderr: CaptureBuffer::new(options.max_captured_bytes),
        tracker: ProgressTracker::new(options.progress_total),
        debouncer: ProgressDebouncer::new(options.progress_debounce, 0.0, started),
        output_file,
    };

    let outcome = run_to_exit(&mut session, &mut child, &mut rx).await;

    let status = match outcome {
        Ok(Some(status)) => status,
        Ok(None) => {
            let elapsed_ms = session.elapsed_ms();
            log::warn!(
                "Command timed out after {}ms, terminating: {}",
                elapsed_ms,
                command
            );
            terminate(&mut child, options).await;
            // Best effort: the timeout is the error that matters here
            let _ = drain(&mut session, &mut rx, ABORT_DRAIN_LIMIT).await;
            release(&mut readers);
            let _ = session.close_file().await;
            return Err(CommandError::timeout(executable, elapsed_ms));
        }
        Err(e) => {
            log::error!("Command failed while running '{}': {}", command, e);
            terminate(&mut child, options).await;
            let _ = drain(&mut session, &mut rx, ABORT_DRAIN_LIMIT).await;
            release(&mut readers);
            let _ = session.close_file().await;
            return Err(e);
        }
    };

    // The child is gone; collect whatever is still buffered in the pipes
    let drained = drain(&mut session, &mut rx, DRAIN_LIMIT).await;
    release(&mut readers);
    if !drained? {
        log::warn!("Output pipes still open after exit of: {}", command);
    }
    session.close_file().await?;

    let duration_ms = session.elapsed_ms();
    let stdout_truncated = session.stdout.truncated();
    let result = CommandResult {
        exit_code: status.code(),
        signal: exit_signal(&status),
        stdout: session.stdout.finish(),
        stderr: session.stderr.finish(),
        success: status.success(),
        duration_ms,
    };

    if stdout_truncated {
        log::debug!("Captured stdout truncated to last {} bytes", options.max_captured_bytes);
    }
    log::info!(
        "Command finished in {}ms (exit {:?}): {}",
        duration_ms,
        result.exit_code,
        command
    );

    Ok(result)
}

/// Pump output until the child exits (`Some(status)`) or the deadline
/// passes (`None`).
async fn run_to_exit(
    session: &mut Session<'_>,
    child: &mut Child,
    rx: &mut mpsc::Receiver<Chunk>,
) -> Result<Option<std::process::ExitStatus>, CommandError> {
    let options = session.options;
    let command = session.command;
    let executable = command.executable();

    let deadline = options
        .timeout
        .map(|t| tokio::time::Instant::from_std(session.started + t));
    let sleep = tokio::time::sleep_until(
        deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)),
    );
    tokio::pin!(sleep);

    let tick_every = options.progress_debounce.max(Duration::from_millis(10));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + tick_every, tick_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut streams_open = true;
    loop {
        tokio::select! {
            chunk = rx.recv(), if streams_open => match chunk {
                Some(chunk) => session.on_chunk(chunk).await?,
                None => streams_open = false,
            },
            status = child.wait() => {
                return status
                    .map(Some)
                    .map_err(|e| CommandError::io(executable, e));
            }
            _ = heartbeat.tick(), if options.progress_reporter.is_some() => {
                session.maybe_report(Instant::now());
            }
            _ = &mut sleep, if deadline.is_some() => return Ok(None),
        }
    }
}

/// Feed chunks still in flight into the session for at most `limit`.
/// Returns false if the pipes were still open when the limit passed.
async fn drain(
    session: &mut Session<'_>,
    rx: &mut mpsc::Receiver<Chunk>,
    limit: Duration,
) -> Result<bool, CommandError> {
    let pumped = tokio::time::timeout(limit, async {
        while let Some(chunk) = rx.recv().await {
            session.on_chunk(chunk).await?;
        }
        Ok::<(), CommandError>(())
    })
    .await;
    match pumped {
        Ok(result) => result.map(|()| true),
        Err(_) => Ok(false),
    }
}

fn spawn_reader<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<Chunk>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Chunk {
                        stream,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Error reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

fn release(readers: &mut Vec<JoinHandle<()>>) {
    for handle in readers.drain(..) {
        handle.abort();
    }
}

/// Ask the child to stop and wait a bounded time for it. Escalation to
/// SIGKILL only happens when the caller asked for it.
async fn terminate(child: &mut Child, options: &ExecOptions) {
    if options.force_kill_on_timeout {
        if let Err(e) = child.start_kill() {
            log::warn!("Failed to kill child: {}", e);
        }
    } else {
        send_term(child).await;
    }

    if tokio::time::timeout(options.term_grace, child.wait())
        .await
        .is_err()
    {
        log::warn!(
            "Child {:?} still running {}ms after termination signal",
            child.id(),
            options.term_grace.as_millis()
        );
    }
}

#[cfg(unix)]
async fn send_term(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let sent = tokio::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = sent {
        log::warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
async fn send_term(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to terminate child: {}", e);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
