//! Claude Code child-process manager.
//!
//! One [`ClaudeRunner`] owns at most one agent child process and multiplexes
//! many conversational turns over its lifetime. A background pump task reads
//! the child's stdout continuously and pushes parsed events into a bounded
//! queue; `run` yields queued events to the caller until the turn's RESULT.
//!
//! The pump is load-bearing: `inject` lets collaborators queue extra user
//! messages mid-turn, so the child can keep producing output after the
//! current turn's RESULT. Reading stdout only inside the turn iterator would
//! fill the OS pipe buffer and block the child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tc_domain::{parse_record, AgentEvent, Error, Result};

/// Items flowing through the event queue. Sentinels are internal: the turn
/// iterator translates them into synthetic text, never surfaces them.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Event(AgentEvent),
    /// The child's stdout closed; carries its last stderr and exit code.
    Eof {
        stderr: String,
        exit_code: Option<i32>,
    },
    /// The pump itself failed.
    ReaderError { message: String },
}

/// Queue capacity between the pump and the turn iterator.
const QUEUE_DEPTH: usize = 256;
/// Dead-man's switch: waiting longer than this for a single queue item ends
/// the turn (the child is left alive; it may recover for the next turn).
const EVENT_TIMEOUT: Duration = Duration::from_secs(300);
/// SIGTERM grace before a hard kill on `cancel`.
const TERM_GRACE: Duration = Duration::from_secs(2);
/// Wait after closing stdin on `stop`.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Wait for the pump to acknowledge its cancellation token.
const READER_GRACE: Duration = Duration::from_secs(1);
/// How much of the child's stderr is kept for the death message.
const STDERR_CAP: u64 = 2000;

/// Tools the child may use without prompting when permission skipping is
/// unavailable (running privileged).
const BUILTIN_TOOLS: &[&str] = &[
    "Task",
    "Bash",
    "Glob",
    "Grep",
    "Read",
    "Edit",
    "Write",
    "WebFetch",
    "WebSearch",
    "TodoWrite",
    "NotebookEdit",
];

struct ChildHandles {
    child: Child,
    reader: JoinHandle<()>,
    reader_cancel: CancellationToken,
}

/// Manages the agent child process and its event stream.
pub struct ClaudeRunner {
    work_dir: PathBuf,
    bin: String,
    max_budget: Option<f64>,
    model: Mutex<Option<String>>,
    session_id: Arc<Mutex<Option<String>>>,
    running: Arc<AtomicBool>,
    proc: Arc<Mutex<Option<ChildHandles>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    events_tx: mpsc::Sender<QueueItem>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<QueueItem>>,
    event_timeout: Duration,
}

impl ClaudeRunner {
    pub fn new(work_dir: impl Into<PathBuf>, model: Option<String>, max_budget: Option<f64>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            work_dir: work_dir.into(),
            bin: "claude".into(),
            max_budget,
            model: Mutex::new(model),
            session_id: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            proc: Arc::new(Mutex::new(None)),
            stdin: tokio::sync::Mutex::new(None),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            event_timeout: EVENT_TIMEOUT,
        }
    }

    /// A turn is currently being driven.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Forget the remembered session; the next turn starts a fresh
    /// conversation.
    pub fn clear_session(&self) {
        *self.session_id.lock() = None;
    }

    pub fn model(&self) -> Option<String> {
        self.model.lock().clone()
    }

    #[cfg(test)]
    pub(crate) fn set_session(&self, id: &str) {
        *self.session_id.lock() = Some(id.to_string());
    }

    /// Takes effect when the next child is spawned.
    pub fn set_model(&self, model: Option<String>) {
        *self.model.lock() = model;
    }

    /// Run one turn: ensure a live child, discard stale queue items from a
    /// prior turn, write the prompt, and yield events until (and including)
    /// the first RESULT. Child or pump failure ends the stream after one
    /// synthetic `TextDelta` carrying the error text.
    ///
    /// The stream is single-consumer; a second concurrent `run` blocks until
    /// the first finishes.
    pub fn run(&self, prompt: String) -> impl Stream<Item = AgentEvent> + Send + '_ {
        stream! {
            let mut rx = self.events_rx.lock().await;
            self.running.store(true, Ordering::Release);
            let _turn = TurnGuard(Arc::clone(&self.running));

            drain_pending(&mut rx, &self.events_tx);

            if let Err(e) = self.ensure_child().await {
                tracing::error!(error = %e, "failed to start agent process");
                yield AgentEvent::TextDelta { text: format!("\n❌ Error: {e}") };
                return;
            }
            if let Err(e) = self.send_user_message(&prompt).await {
                tracing::error!(error = %e, "failed to write prompt");
                self.teardown_child().await;
                yield AgentEvent::TextDelta { text: format!("\n❌ Error: {e}") };
                return;
            }

            loop {
                match tokio::time::timeout(self.event_timeout, rx.recv()).await {
                    Err(_) => {
                        tracing::warn!("no event from agent within timeout");
                        yield AgentEvent::TextDelta { text: "❌ Timeout waiting for events".into() };
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(QueueItem::Eof { stderr, exit_code })) => {
                        tracing::info!(?exit_code, "agent process exited");
                        self.reap_exited_child();
                        if !stderr.is_empty() {
                            yield AgentEvent::TextDelta { text: format!("\n❌ Error: {stderr}") };
                        }
                        break;
                    }
                    Ok(Some(QueueItem::ReaderError { message })) => {
                        tracing::error!(message, "stdout pump failed");
                        yield AgentEvent::TextDelta { text: format!("❌ Reader error: {message}") };
                        break;
                    }
                    Ok(Some(QueueItem::Event(event))) => {
                        let done = matches!(event, AgentEvent::Result { .. });
                        yield event;
                        if done {
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Write an extra user message while a turn is in progress; the child
    /// queues it and emits its events after the current turn. Fails when no
    /// child is alive.
    pub async fn inject(&self, prompt: &str) -> Result<()> {
        self.send_user_message(prompt).await
    }

    /// Hard stop: tear down the pump, SIGTERM the child, and kill it after
    /// a short grace. Safe to call whether or not a turn is active.
    pub async fn cancel(&self) {
        self.running.store(false, Ordering::Release);
        *self.stdin.lock().await = None;
        let Some(ChildHandles { mut child, reader, reader_cancel }) = self.proc.lock().take()
        else {
            return;
        };

        // Stop the pump first so the in-flight turn observes its exit
        // before the child starts dying.
        reader_cancel.cancel();
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            abort.abort();
        }

        if let Some(pid) = child.id() {
            // SIGTERM first; tokio's kill() is SIGKILL-only.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
            tracing::warn!("agent ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
        tracing::info!("agent process cancelled");
    }

    /// Graceful stop: close stdin and give the child time to exit on its
    /// own before killing it.
    pub async fn stop(&self) {
        *self.stdin.lock().await = None;
        let Some(ChildHandles { mut child, reader, reader_cancel }) = self.proc.lock().take()
        else {
            return;
        };
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
        reader_cancel.cancel();
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            abort.abort();
        }
    }

    async fn ensure_child(&self) -> Result<()> {
        let respawn = {
            let mut proc = self.proc.lock();
            match proc.as_mut() {
                None => true,
                Some(handles) => match handles.child.try_wait() {
                    Ok(None) => false,
                    status => {
                        tracing::info!(?status, "agent process died, respawning");
                        if let Some(stale) = proc.take() {
                            stale.reader_cancel.cancel();
                            stale.reader.abort();
                        }
                        true
                    }
                },
            }
        };
        if !respawn {
            return Ok(());
        }
        self.spawn_child().await
    }

    async fn spawn_child(&self) -> Result<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.args([
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]);
        if let Some(session_id) = self.session_id.lock().clone() {
            cmd.args(["--resume", &session_id]);
        }
        if let Some(model) = self.model.lock().clone() {
            cmd.args(["--model", &model]);
        }
        if let Some(budget) = self.max_budget {
            cmd.args(["--max-budget-usd", &budget.to_string()]);
        }
        // The agent refuses to skip permission prompts when privileged, so
        // root gets an explicit allowlist instead.
        if unsafe { libc::geteuid() } == 0 {
            cmd.args(["--allowedTools", &allowed_tools(&self.work_dir).join(",")]);
        } else {
            cmd.arg("--dangerously-skip-permissions");
        }
        cmd.current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;
        let stdin = take_pipe(child.stdin.take(), "stdin")?;

        let reader_cancel = CancellationToken::new();
        let reader = tokio::spawn(pump(
            stdout,
            stderr,
            self.events_tx.clone(),
            Arc::clone(&self.session_id),
            Arc::clone(&self.proc),
            reader_cancel.clone(),
        ));

        *self.stdin.lock().await = Some(stdin);
        *self.proc.lock() = Some(ChildHandles {
            child,
            reader,
            reader_cancel,
        });
        tracing::info!(bin = %self.bin, work_dir = %self.work_dir.display(), "agent process started");
        Ok(())
    }

    async fn send_user_message(&self, prompt: &str) -> Result<()> {
        let line = serde_json::to_string(&serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        }))?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(Error::NotRunning)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Drop the child after a failed stdin write. The next turn respawns it
    /// (resuming the remembered session).
    async fn teardown_child(&self) {
        *self.stdin.lock().await = None;
        let handles = self.proc.lock().take();
        if let Some(ChildHandles { mut child, reader, reader_cancel }) = handles {
            reader_cancel.cancel();
            reader.abort();
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Clear the child reference after an EOF sentinel, but only when the
    /// current child really has exited. A stale sentinel preserved across a
    /// drain must not orphan a freshly spawned child.
    fn reap_exited_child(&self) {
        let mut proc = self.proc.lock();
        let exited = proc
            .as_mut()
            .is_some_and(|h| matches!(h.child.try_wait(), Ok(Some(_))));
        if exited {
            if let Some(handles) = proc.take() {
                handles.reader_cancel.cancel();
                handles.reader.abort();
            }
        }
    }
}

/// Resets the running flag when a turn's stream is dropped, consumed or not.
struct TurnGuard(Arc<AtomicBool>);

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| Error::Other(format!("child {name} not captured")))
}

/// Discard queue items left over from a prior turn so they cannot leak into
/// the next turn's display. An EOF sentinel is parked back at the tail: the
/// child's death must survive the drain.
fn drain_pending(rx: &mut mpsc::Receiver<QueueItem>, tx: &mpsc::Sender<QueueItem>) {
    while let Ok(item) = rx.try_recv() {
        if matches!(item, QueueItem::Eof { .. }) {
            let _ = tx.try_send(item);
            break;
        }
        tracing::debug!("discarded stale event from previous turn");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdout pump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Move records from child stdout into the event queue until stdout closes
/// or the cancellation token fires. Exactly one terminal item (`Eof` or
/// `ReaderError`) is enqueued on exit.
async fn pump(
    stdout: ChildStdout,
    stderr: ChildStderr,
    tx: mpsc::Sender<QueueItem>,
    session_id: Arc<Mutex<Option<String>>>,
    proc: Arc<Mutex<Option<ChildHandles>>>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx
                    .send(QueueItem::Eof { stderr: String::new(), exit_code: None })
                    .await;
                return;
            }
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    let _ = tx
                        .send(QueueItem::ReaderError { message: e.to_string() })
                        .await;
                    return;
                }
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item = match serde_json::from_str::<Value>(line) {
            Ok(record) => match parse_record(&record) {
                Some(event) => {
                    if let Some(sid) = event.session_id() {
                        *session_id.lock() = Some(sid.to_string());
                    }
                    QueueItem::Event(event)
                }
                None => continue,
            },
            // Not JSON at all: surface the raw line as prose.
            Err(_) => QueueItem::Event(AgentEvent::TextDelta {
                text: line.to_string(),
            }),
        };
        if tx.send(item).await.is_err() {
            return;
        }
    }

    // stdout closed: the child is gone. Capture its last words.
    let stderr_text = read_stderr_tail(stderr).await;
    let exit_code = proc
        .lock()
        .as_mut()
        .and_then(|h| h.child.try_wait().ok().flatten())
        .and_then(|status| status.code());
    let _ = tx
        .send(QueueItem::Eof {
            stderr: stderr_text,
            exit_code,
        })
        .await;
}

async fn read_stderr_tail(stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    let _ = stderr.take(STDERR_CAP).read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool allowlist
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builtin tools plus every tool server registered in the project's
/// `.mcp.json`, each wrapped with the server prefix.
fn allowed_tools(work_dir: &Path) -> Vec<String> {
    let mut tools: Vec<String> = BUILTIN_TOOLS.iter().map(|t| t.to_string()).collect();
    tools.extend(
        tool_server_names(work_dir)
            .into_iter()
            .map(|name| format!("srv__{name}")),
    );
    tools
}

fn tool_server_names(work_dir: &Path) -> Vec<String> {
    let path = work_dir.join(".mcp.json");
    let Ok(data) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&data) else {
        tracing::warn!(path = %path.display(), "unreadable tool-server registry");
        return Vec::new();
    };
    value
        .get("mcpServers")
        .and_then(Value::as_object)
        .map(|servers| servers.keys().cloned().collect())
        .unwrap_or_default()
}
