//! Persistent Python sandbox child with newline-delimited JSON framing.
//!
//! One sandbox serves one completion. The child keeps a single namespace
//! alive across executions, captures the interpreter's streams per
//! execution, and exposes `llm_query` / `llm_query_batched` callbacks that
//! POST to the paired bridge.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RlmSettings;
use crate::error::Result;
use crate::error::RlmError;
use crate::types::ExecutionResult;
use crate::types::SubCall;

const CALLBACK_ADDR_ENV: &str = "RLM_CALLBACK_ADDR";

/// Interpreter wrapper. Reads one `{"code": ...}` frame per line, executes
/// it in the persistent namespace with stdout/stderr swapped to buffers,
/// and answers with exactly one frame. The callback address arrives through
/// the environment so no code is spliced into the wrapper source.
const PYTHON_SANDBOX_RUNNER: &str = r#"
import io
import json
import os
import sys
import urllib.request

_CALLBACK_ADDR = os.environ["RLM_CALLBACK_ADDR"]
_HOST_STDOUT = sys.stdout


def _call_bridge(path, payload):
    data = json.dumps(payload).encode("utf-8")
    request = urllib.request.Request(
        "http://" + _CALLBACK_ADDR + path,
        data=data,
        headers={"Content-Type": "application/json"},
        method="POST",
    )
    with urllib.request.urlopen(request) as response:
        return json.loads(response.read().decode("utf-8"))


def llm_query(prompt, model=None):
    return _call_bridge("/query", {"prompt": prompt, "model": model})["response"]


def llm_query_batched(prompts, model=None):
    return _call_bridge("/query_batched", {"prompts": prompts, "model": model})["responses"]


def _write_frame(obj):
    _HOST_STDOUT.write(json.dumps(obj, ensure_ascii=False) + "\n")
    _HOST_STDOUT.flush()


_namespace = {
    "llm_query": llm_query,
    "llm_query_batched": llm_query_batched,
    "print": print,
}

while True:
    line = sys.stdin.readline()
    if not line:
        break
    try:
        request = json.loads(line)
        code = request["code"]

        new_stdout = io.StringIO()
        new_stderr = io.StringIO()
        old_stdout = sys.stdout
        old_stderr = sys.stderr
        sys.stdout = new_stdout
        sys.stderr = new_stderr
        try:
            exec(code, _namespace, _namespace)
            stdout = new_stdout.getvalue()
            stderr = new_stderr.getvalue()
        except Exception as exc:
            stdout = new_stdout.getvalue()
            stderr = new_stderr.getvalue() + str(exc)
        finally:
            sys.stdout = old_stdout
            sys.stderr = old_stderr

        _write_frame({"stdout": stdout, "stderr": stderr, "done": True})
    except Exception as exc:
        _write_frame({"error": str(exc), "done": True})
"#;

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct SandboxFrame {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
}

/// Shared buffer of sub-calls pending attribution. The bridge records into
/// it while an execution is in flight; `Sandbox::execute` clears it on
/// entry and drains it on exit, so every sub-call lands on exactly the
/// execution during which it happened.
#[derive(Clone, Default)]
pub struct SubCallSink {
    pending: Arc<Mutex<Vec<SubCall>>>,
}

impl SubCallSink {
    pub async fn record(&self, call: SubCall) {
        self.pending.lock().await.push(call);
    }

    async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    async fn drain(&self) -> Vec<SubCall> {
        std::mem::take(&mut *self.pending.lock().await)
    }
}

pub struct Sandbox {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    temp_dir: Option<TempDir>,
    sink: SubCallSink,
    poisoned: Option<String>,
    closed: bool,
}

impl Sandbox {
    /// Spawns the interpreter child pointed at `callback_addr`. Fails only
    /// on startup problems; once this returns, failures surface through
    /// [`ExecutionResult::stderr`].
    pub async fn start(
        settings: &RlmSettings,
        callback_addr: &str,
        sink: SubCallSink,
    ) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("rlm-sandbox-")
            .tempdir()
            .map_err(RlmError::SandboxStart)?;
        let runner_path = temp_dir.path().join("runner.py");
        std::fs::write(&runner_path, PYTHON_SANDBOX_RUNNER).map_err(RlmError::SandboxStart)?;

        let command_parts = shlex::split(&settings.python_command)
            .filter(|parts| !parts.is_empty())
            .unwrap_or_else(|| vec![settings.python_command.clone()]);
        let mut command = Command::new(&command_parts[0]);
        command
            .args(command_parts.iter().skip(1))
            .arg("-u")
            .arg(&runner_path)
            .env(CALLBACK_ADDR_ENV, callback_addr)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(RlmError::SandboxStart)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            RlmError::SandboxStart(std::io::Error::other("failed to capture sandbox stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RlmError::SandboxStart(std::io::Error::other("failed to capture sandbox stdout"))
        })?;

        tracing::debug!(addr = callback_addr, "sandbox started");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            temp_dir: Some(temp_dir),
            sink,
            poisoned: None,
            closed: false,
        })
    }

    /// Sends one code string and blocks until its single response frame
    /// returns. Never fails on user-code errors; infrastructure failures
    /// populate `stderr` and poison the sandbox for further calls. Not safe
    /// for concurrent calls; callers hold `&mut self` and serialize.
    pub async fn execute(&mut self, code: &str, cancel: &CancellationToken) -> ExecutionResult {
        let start = Instant::now();
        self.sink.clear().await;

        if let Some(reason) = self.poisoned.clone() {
            return self.infrastructure_failure(reason, start).await;
        }

        let mut frame = match serde_json::to_vec(&ExecRequest { code }) {
            Ok(frame) => frame,
            Err(err) => {
                return self
                    .infrastructure_failure(format!("Failed to encode sandbox request: {err}"), start)
                    .await;
            }
        };
        frame.push(b'\n');

        if let Err(err) = self.write_frame(&frame).await {
            let reason = format!("Failed to write to sandbox: {err}");
            self.poisoned = Some(reason.clone());
            return self.infrastructure_failure(reason, start).await;
        }

        let mut line = String::new();
        let read = {
            let read_line = self.stdout.read_line(&mut line);
            tokio::select! {
                _ = cancel.cancelled() => None,
                read = read_line => Some(read),
            }
        };

        match read {
            None => {
                self.child.start_kill().ok();
                let reason = "Sandbox execution cancelled".to_string();
                self.poisoned = Some(reason.clone());
                return self.infrastructure_failure(reason, start).await;
            }
            Some(Ok(0)) => {
                let reason = "Failed to read from sandbox: stream closed".to_string();
                self.poisoned = Some(reason.clone());
                return self.infrastructure_failure(reason, start).await;
            }
            Some(Err(err)) => {
                let reason = format!("Failed to read from sandbox: {err}");
                self.poisoned = Some(reason.clone());
                return self.infrastructure_failure(reason, start).await;
            }
            Some(Ok(_)) => {}
        }

        let frame: SandboxFrame = match serde_json::from_str(line.trim()) {
            Ok(frame) => frame,
            Err(err) => {
                let reason = format!("Failed to parse sandbox response: {err}");
                self.poisoned = Some(reason.clone());
                return self.infrastructure_failure(reason, start).await;
            }
        };

        ExecutionResult {
            stdout: frame.stdout,
            stderr: format!("{}{}", frame.stderr, frame.error),
            execution_time: start.elapsed().as_secs_f64(),
            sub_calls: self.sink.drain().await,
        }
    }

    /// Terminates the child and removes the temp artifacts. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stdin.shutdown().await;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        if let Some(temp_dir) = self.temp_dir.take() {
            let _ = temp_dir.close();
        }
        tracing::debug!("sandbox closed");
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(frame).await?;
        self.stdin.flush().await
    }

    async fn infrastructure_failure(&self, reason: String, start: Instant) -> ExecutionResult {
        tracing::warn!(reason = %reason, "sandbox infrastructure failure");
        ExecutionResult {
            stdout: String::new(),
            stderr: reason,
            execution_time: start.elapsed().as_secs_f64(),
            sub_calls: self.sink.drain().await,
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.child.start_kill().ok();
    }
}
