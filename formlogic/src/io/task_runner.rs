//! Out-of-process task execution with an at-most-one-response protocol.
//!
//! A [`TaskRunner`] spawns a fresh worker per task, sends one
//! newline-delimited JSON request, and settles on the first event the worker
//! produces. Whatever that event is, the worker is killed exactly once before
//! the result is returned, and a mandatory deadline bounds the wait.
//!
//! The [`WorkerSpawner`]/[`Worker`] pair decouples the state machine from the
//! process plumbing. [`ProcessSpawner`] runs real child processes; tests use
//! scripted workers that never leave the process.

use std::future::Future;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::io::config::TaskConfig;

/// One unit of work for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub payload: Value,
}

/// The only two well-formed answers: `{"resolve": v}` or `{"reject": e}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskResponse {
    Resolve(Value),
    Reject(Value),
}

/// What a worker can report back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// One structured message. Lines that are not JSON arrive as strings.
    Message(Value),
    /// Channel-level failure, such as the worker crashing.
    Error(String),
    /// The worker exited without a message; `None` when killed by a signal.
    Exit(Option<i32>),
}

/// Host-side handle to one running worker.
pub trait Worker: Send {
    fn send(&mut self, request: &TaskRequest) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next event.
    fn recv(&mut self) -> impl Future<Output = WorkerEvent> + Send;

    /// Request termination. Must tolerate a worker that already exited.
    fn kill(&mut self) -> Result<()>;
}

pub trait WorkerSpawner {
    type Worker: Worker;

    fn spawn(&self) -> Result<Self::Worker>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Idle,
    Spawned,
    AwaitingResponse,
    Resolved,
    Rejected,
    Errored,
    TimedOut,
    Terminated,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("task rejected: {0}")]
    Rejected(Value),
    #[error("malformed worker response")]
    Protocol,
    #[error("worker error: {0}")]
    Worker(String),
    #[error("worker exited without responding (exit code {0:?})")]
    Exited(Option<i32>),
    #[error("worker did not respond within {0:?}")]
    TimedOut(Duration),
    #[error("failed to start worker: {0}")]
    Spawn(String),
}

impl TaskError {
    pub fn terminal_state(&self) -> TaskState {
        match self {
            TaskError::Rejected(_) => TaskState::Rejected,
            TaskError::TimedOut(_) => TaskState::TimedOut,
            TaskError::Protocol
            | TaskError::Worker(_)
            | TaskError::Exited(_)
            | TaskError::Spawn(_) => TaskState::Errored,
        }
    }
}

/// Outcome of one task plus every state it passed through.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub result: Result<Value, TaskError>,
    pub states: Vec<TaskState>,
}

impl TaskReport {
    /// The settled state (the one before `Terminated`).
    pub fn outcome(&self) -> TaskState {
        match &self.result {
            Ok(_) => TaskState::Resolved,
            Err(err) => err.terminal_state(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRunner<S> {
    spawner: S,
}

impl<S: WorkerSpawner> TaskRunner<S> {
    pub fn new(spawner: S) -> Self {
        Self { spawner }
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Run `task` in a fresh worker and settle on its first event.
    pub async fn start(&self, task: &str, payload: Value, deadline: Duration) -> Result<Value, TaskError> {
        self.run(task, payload, deadline).await.result
    }

    #[instrument(skip_all, fields(task = %task, deadline_ms = deadline.as_millis() as u64))]
    pub async fn run(&self, task: &str, payload: Value, deadline: Duration) -> TaskReport {
        let mut states = vec![TaskState::Idle];
        let mut worker = match self.spawner.spawn() {
            Ok(worker) => worker,
            Err(err) => {
                let error = TaskError::Spawn(format!("{err:#}"));
                warn!(%error, "worker spawn failed");
                states.push(error.terminal_state());
                states.push(TaskState::Terminated);
                return TaskReport {
                    result: Err(error),
                    states,
                };
            }
        };
        states.push(TaskState::Spawned);

        let request = TaskRequest {
            task: task.to_string(),
            payload,
        };
        let result = match tokio::time::timeout(deadline, exchange(&mut worker, &request, &mut states)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "worker timed out");
                Err(TaskError::TimedOut(deadline))
            }
        };

        if let Err(err) = worker.kill() {
            warn!(err = %format!("{err:#}"), "worker kill failed");
        }
        let outcome = match &result {
            Ok(_) => TaskState::Resolved,
            Err(err) => err.terminal_state(),
        };
        states.push(outcome);
        states.push(TaskState::Terminated);
        info!(?outcome, "task settled");
        TaskReport { result, states }
    }
}

async fn exchange<W: Worker>(
    worker: &mut W,
    request: &TaskRequest,
    states: &mut Vec<TaskState>,
) -> Result<Value, TaskError> {
    worker
        .send(request)
        .await
        .map_err(|err| TaskError::Worker(format!("send request: {err:#}")))?;
    states.push(TaskState::AwaitingResponse);
    settle(worker.recv().await)
}

/// Only the first event counts; anything but a well-formed response is an error.
fn settle(event: WorkerEvent) -> Result<Value, TaskError> {
    match event {
        WorkerEvent::Message(message) => match serde_json::from_value::<TaskResponse>(message) {
            Ok(TaskResponse::Resolve(value)) => Ok(value),
            Ok(TaskResponse::Reject(error)) => Err(TaskError::Rejected(error)),
            Err(err) => {
                debug!(%err, "unrecognized worker message");
                Err(TaskError::Protocol)
            }
        },
        WorkerEvent::Error(message) => Err(TaskError::Worker(message)),
        WorkerEvent::Exit(code) => Err(TaskError::Exited(code)),
    }
}

const DEFAULT_STDERR_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_RESPONSE_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Spawns `program args...` with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    stderr_limit_bytes: usize,
    response_limit_bytes: usize,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stderr_limit_bytes: DEFAULT_STDERR_LIMIT_BYTES,
            response_limit_bytes: DEFAULT_RESPONSE_LIMIT_BYTES,
        }
    }

    pub fn with_stderr_limit(mut self, bytes: usize) -> Self {
        self.stderr_limit_bytes = bytes;
        self
    }

    /// Longest response line accepted before the worker is treated as broken.
    pub fn with_response_limit(mut self, bytes: usize) -> Self {
        self.response_limit_bytes = bytes;
        self
    }

    pub fn from_config(cfg: &TaskConfig) -> Result<Self> {
        let (program, args) = cfg.worker_program()?;
        Ok(Self::new(program, args)
            .with_stderr_limit(cfg.stderr_limit_bytes)
            .with_response_limit(cfg.response_limit_bytes))
    }
}

impl WorkerSpawner for ProcessSpawner {
    type Worker = ProcessWorker;

    fn spawn(&self) -> Result<ProcessWorker> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program.display(), "spawning worker");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn worker {}", self.program.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let limit = self.stderr_limit_bytes;
        let stderr = tokio::spawn(async move { read_stream_limited(stderr, limit).await });
        Ok(ProcessWorker {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            response_limit_bytes: self.response_limit_bytes,
            stderr: Some(stderr),
        })
    }
}

/// A spawned child speaking newline-delimited JSON over stdin/stdout.
#[derive(Debug)]
pub struct ProcessWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    response_limit_bytes: usize,
    stderr: Option<JoinHandle<(Vec<u8>, usize)>>,
}

impl ProcessWorker {
    async fn stderr_text(&mut self) -> String {
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        match handle.await {
            Ok((bytes, truncated)) => {
                let mut text = String::from_utf8_lossy(&bytes).trim().to_string();
                if truncated > 0 {
                    text.push_str(&format!("\n[worker stderr truncated {truncated} bytes]"));
                }
                text
            }
            Err(err) => {
                warn!(%err, "stderr reader failed");
                String::new()
            }
        }
    }

    /// stdout closed: report how the worker ended.
    async fn exit_event(&mut self) -> WorkerEvent {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => return WorkerEvent::Error(format!("wait for worker: {err}")),
        };
        debug!(exit_code = ?status.code(), "worker exited");
        if status.success() {
            return WorkerEvent::Exit(status.code());
        }
        let stderr = self.stderr_text().await;
        if stderr.is_empty() {
            WorkerEvent::Exit(status.code())
        } else {
            WorkerEvent::Error(stderr)
        }
    }
}

impl Worker for ProcessWorker {
    async fn send(&mut self, request: &TaskRequest) -> Result<()> {
        let mut line = serde_json::to_vec(request).context("serialize task request")?;
        line.push(b'\n');
        // Dropping stdin after the write closes the worker's input.
        let mut stdin = self
            .stdin
            .take()
            .ok_or_else(|| anyhow!("request already sent"))?;
        match write_line(&mut stdin, &line).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::BrokenPipe => {
                debug!("worker closed stdin before the request was written");
                Ok(())
            }
            Err(err) => Err(err).context("write task request"),
        }
    }

    async fn recv(&mut self) -> WorkerEvent {
        let limit = self.response_limit_bytes;
        loop {
            match read_line_limited(&mut self.stdout, limit).await {
                Ok(LineRead::Line(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return match serde_json::from_str::<Value>(line) {
                        Ok(message) => WorkerEvent::Message(message),
                        Err(_) => WorkerEvent::Message(Value::String(line.to_string())),
                    };
                }
                Ok(LineRead::TooLong) => {
                    warn!(limit, "worker response line over limit");
                    return WorkerEvent::Error(format!("worker response exceeds {limit} bytes"));
                }
                Ok(LineRead::Eof) => return self.exit_event().await,
                Err(err) => return WorkerEvent::Error(format!("read worker output: {err}")),
            }
        }
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(err).context("kill worker"),
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line(Vec<u8>),
    /// The line grew past the limit before a newline arrived.
    TooLong,
    Eof,
}

/// Read up to the next newline without buffering more than `limit` bytes.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> std::io::Result<LineRead> {
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line(line)
            });
        }
        let newline = available.iter().position(|byte| *byte == b'\n');
        let chunk = match newline {
            Some(end) => &available[..end],
            None => available,
        };
        if line.len() + chunk.len() > limit {
            return Ok(LineRead::TooLong);
        }
        line.extend_from_slice(chunk);
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);
        if newline.is_some() {
            return Ok(LineRead::Line(line));
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    (buf, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedSpawner;
    use serde_json::json;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[test]
    fn responses_use_single_key_objects() {
        assert_eq!(
            serde_json::to_value(TaskResponse::Resolve(json!("ok"))).expect("json"),
            json!({ "resolve": "ok" })
        );
        assert!(serde_json::from_value::<TaskResponse>(json!({ "resolve": 1, "reject": 2 })).is_err());
        assert!(serde_json::from_value::<TaskResponse>(json!({ "done": 1 })).is_err());
    }

    #[tokio::test]
    async fn resolve_settles_and_kills_once() {
        let spawner = ScriptedSpawner::replying(vec![WorkerEvent::Message(json!({ "resolve": "hi" }))]);
        let runner = TaskRunner::new(spawner.clone());
        let report = runner.run("render-template", json!({ "template": "hi" }), DEADLINE).await;
        assert_eq!(report.result, Ok(json!("hi")));
        assert_eq!(
            report.states,
            vec![
                TaskState::Idle,
                TaskState::Spawned,
                TaskState::AwaitingResponse,
                TaskState::Resolved,
                TaskState::Terminated
            ]
        );
        assert_eq!(spawner.kills(), 1);
        assert_eq!(spawner.requests()[0].task, "render-template");
    }

    #[tokio::test]
    async fn only_the_first_message_is_honored() {
        let spawner = ScriptedSpawner::replying(vec![
            WorkerEvent::Message(json!({ "reject": { "message": "no" } })),
            WorkerEvent::Message(json!({ "resolve": "late" })),
            WorkerEvent::Exit(Some(0)),
        ]);
        let runner = TaskRunner::new(spawner.clone());
        let report = runner.run("t", Value::Null, DEADLINE).await;
        assert_eq!(report.result, Err(TaskError::Rejected(json!({ "message": "no" }))));
        assert_eq!(report.outcome(), TaskState::Rejected);
        assert_eq!(spawner.kills(), 1);
    }

    #[tokio::test]
    async fn malformed_messages_are_protocol_errors() {
        for message in [json!({ "value": 1 }), json!("plain text"), json!([1, 2])] {
            let spawner = ScriptedSpawner::replying(vec![WorkerEvent::Message(message)]);
            let result = TaskRunner::new(spawner.clone()).start("t", Value::Null, DEADLINE).await;
            assert_eq!(result, Err(TaskError::Protocol));
            assert_eq!(spawner.kills(), 1);
        }
    }

    #[tokio::test]
    async fn channel_errors_and_silent_exits_settle() {
        let crashed = ScriptedSpawner::replying(vec![WorkerEvent::Error("boom".to_string())]);
        let result = TaskRunner::new(crashed.clone()).start("t", Value::Null, DEADLINE).await;
        assert_eq!(result, Err(TaskError::Worker("boom".to_string())));
        assert_eq!(crashed.kills(), 1);

        let silent = ScriptedSpawner::replying(vec![WorkerEvent::Exit(Some(0))]);
        let report = TaskRunner::new(silent.clone()).run("t", Value::Null, DEADLINE).await;
        assert_eq!(report.result, Err(TaskError::Exited(Some(0))));
        assert_eq!(report.outcome(), TaskState::Errored);
        assert_eq!(silent.kills(), 1);
    }

    #[tokio::test]
    async fn deadline_ends_in_timed_out() {
        let spawner = ScriptedSpawner::hanging();
        let deadline = Duration::from_millis(50);
        let report = TaskRunner::new(spawner.clone()).run("t", Value::Null, deadline).await;
        assert_eq!(report.result, Err(TaskError::TimedOut(deadline)));
        assert_eq!(
            report.states,
            vec![
                TaskState::Idle,
                TaskState::Spawned,
                TaskState::AwaitingResponse,
                TaskState::TimedOut,
                TaskState::Terminated
            ]
        );
        assert_eq!(spawner.kills(), 1);
    }

    #[tokio::test]
    async fn spawn_failure_terminates_without_kill() {
        let spawner = ScriptedSpawner::failing_spawn("no such program");
        let report = TaskRunner::new(spawner.clone()).run("t", Value::Null, DEADLINE).await;
        assert!(matches!(&report.result, Err(TaskError::Spawn(message)) if message.contains("no such program")));
        assert_eq!(
            report.states,
            vec![TaskState::Idle, TaskState::Errored, TaskState::Terminated]
        );
        assert_eq!(spawner.kills(), 0);
    }

    #[tokio::test]
    async fn line_reader_stops_at_limit() {
        let mut input: &[u8] = b"{\"resolve\": 1}\nsecond\n";
        assert_eq!(
            read_line_limited(&mut input, 64).await.expect("read"),
            LineRead::Line(b"{\"resolve\": 1}".to_vec())
        );
        assert_eq!(
            read_line_limited(&mut input, 64).await.expect("read"),
            LineRead::Line(b"second".to_vec())
        );
        assert_eq!(read_line_limited(&mut input, 64).await.expect("read"), LineRead::Eof);

        let mut runaway: &[u8] = &[b'x'; 4096];
        assert_eq!(
            read_line_limited(&mut runaway, 100).await.expect("read"),
            LineRead::TooLong
        );
        let mut unterminated: &[u8] = b"tail";
        assert_eq!(
            read_line_limited(&mut unterminated, 4).await.expect("read"),
            LineRead::Line(b"tail".to_vec())
        );
    }

    #[tokio::test]
    async fn process_spawner_reports_missing_program() {
        let spawner = ProcessSpawner::new("/nonexistent/formlogic-worker", Vec::new());
        let result = TaskRunner::new(spawner).start("t", Value::Null, DEADLINE).await;
        assert!(matches!(result, Err(TaskError::Spawn(_))), "{result:?}");
    }
}
