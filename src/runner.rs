//! Isolated execution of policy-passed candidate code.
//!
//! The candidate runs in a fresh `python3` process, never in-process, so a
//! hang or crash cannot touch the caller: a hard wall-clock timeout forcibly
//! kills the worker, worker-side exceptions are serialized into a structured
//! error channel on stdout, and dropping the in-flight future kills the child
//! (`kill_on_drop`), which is how caller-side cancellation propagates.
//!
//! `execute` never returns an error: every path, including host-side faults
//! like a failed spawn, is folded into an [`ExecutionOutcome`].

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::policy::{self, Policy};

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The worker exceeded the wall-clock budget and was killed.
    Timeout,
    /// The candidate raised during execution.
    RuntimeError,
    /// The runner's pre-flight re-check found a policy violation.
    PolicyRejected,
    /// The candidate never defined the designated entry point.
    EntryPointMissing,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RuntimeError => "runtime error",
            FailureKind::PolicyRejected => "policy rejected",
            FailureKind::EntryPointMissing => "entry point missing",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one isolated execution. The runner never throws across this
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success {
        records: Vec<Value>,
    },
    Failure {
        kind: FailureKind,
        message: String,
        /// Output captured before a timeout kill, for diagnostics only.
        partial_output: Option<String>,
    },
}

impl ExecutionOutcome {
    fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            kind,
            message: message.into(),
            partial_output: None,
        }
    }
}

/// Executes candidate code in a fresh, resource-bounded worker process.
#[derive(Debug, Clone)]
pub struct IsolatedRunner {
    python: PathBuf,
    entry_point: String,
    policy: Policy,
}

/// Worker harness. The candidate source and entry point name are spliced in
/// as Python string literals before the script is written to disk.
const WORKER_TEMPLATE: &str = r#"import json as _json
import sys as _sys

def _fail(kind, message):
    print(_json.dumps({"__error__": {"kind": kind, "message": message}}))
    _sys.exit(1)

_code = @CODE@
_glb = {"__name__": "__fhir_forge_worker__"}
try:
    exec(compile(_code, "<candidate>", "exec"), _glb)
except BaseException as exc:
    _fail("runtime", type(exc).__name__ + ": " + str(exc))

_entry = _glb.get(@ENTRY@)
if not callable(_entry):
    _fail("entry_point_missing", "candidate code does not define " + @ENTRY@ + "()")

try:
    _records = _entry()
except BaseException as exc:
    _fail("runtime", type(exc).__name__ + ": " + str(exc))

if not isinstance(_records, list):
    _records = [_records]
print(_json.dumps(_records, default=str))
"#;

impl IsolatedRunner {
    pub fn new(python: impl Into<PathBuf>, entry_point: impl Into<String>, policy: Policy) -> Self {
        Self {
            python: python.into(),
            entry_point: entry_point.into(),
            policy,
        }
    }

    /// Execute candidate code with a hard wall-clock timeout.
    ///
    /// The caller is expected to have validated the code already; a cheap
    /// static re-check runs anyway so a contract breach surfaces as
    /// `PolicyRejected` instead of a live process.
    pub async fn execute(&self, code: &str, timeout: Duration) -> ExecutionOutcome {
        let violations = policy::validate(code, &self.policy);
        if !violations.is_empty() {
            let detail = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return ExecutionOutcome::failure(FailureKind::PolicyRejected, detail);
        }

        let script = self.render_worker(code);
        let script_file = match write_worker_script(&script) {
            Ok(file) => file,
            Err(err) => {
                warn!("failed to stage worker script: {err}");
                return ExecutionOutcome::failure(
                    FailureKind::RuntimeError,
                    format!("failed to stage worker script: {err}"),
                );
            }
        };

        let mut child = match Command::new(&self.python)
            .arg(script_file.path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return ExecutionOutcome::failure(
                    FailureKind::RuntimeError,
                    format!("failed to start worker '{}': {err}", self.python.display()),
                );
            }
        };

        // Drain both pipes concurrently so a chatty worker can't deadlock on
        // a full pipe buffer, and so partial output survives a timeout kill.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status,
            _ = tokio::time::sleep(timeout) => {
                debug!(timeout_secs = timeout.as_secs_f64(), "worker timed out, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                let partial = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default())
                    .trim()
                    .to_string();
                let _ = stderr_task.await;
                return ExecutionOutcome::Failure {
                    kind: FailureKind::Timeout,
                    message: format!(
                        "execution timed out after {:.0}s; the entry point likely loops or blocks",
                        timeout.as_secs_f64()
                    ),
                    partial_output: (!partial.is_empty()).then_some(partial),
                };
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return ExecutionOutcome::failure(
                    FailureKind::RuntimeError,
                    format!("failed to await worker: {err}"),
                );
            }
        };

        if status.success() {
            parse_success_output(stdout.trim())
        } else {
            parse_failure_output(stdout.trim(), &stderr, status.code())
        }
    }

    fn render_worker(&self, code: &str) -> String {
        WORKER_TEMPLATE
            .replace("@CODE@", &python_string_literal(code))
            .replace("@ENTRY@", &python_string_literal(&self.entry_point))
    }
}

/// Encode text as a Python string literal. JSON string escaping is a strict
/// subset of Python's, so the JSON encoding is reused directly.
fn python_string_literal(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn write_worker_script(script: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("fhir-forge-worker-")
        .suffix(".py")
        .tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Worker exited zero: stdout must hold the JSON record list.
fn parse_success_output(stdout: &str) -> ExecutionOutcome {
    if stdout.is_empty() {
        return ExecutionOutcome::failure(
            FailureKind::RuntimeError,
            "worker produced no output",
        );
    }
    match serde_json::from_str::<Value>(stdout) {
        Ok(Value::Array(records)) => ExecutionOutcome::Success { records },
        Ok(other) => ExecutionOutcome::failure(
            FailureKind::RuntimeError,
            format!(
                "expected a list of records from the entry point, got {}",
                json_kind(&other)
            ),
        ),
        Err(err) => ExecutionOutcome::failure(
            FailureKind::RuntimeError,
            format!("worker output is not valid JSON: {err}"),
        ),
    }
}

/// Worker exited non-zero: prefer the structured `__error__` channel on
/// stdout, fall back to a distilled traceback from stderr.
fn parse_failure_output(stdout: &str, stderr: &str, exit_code: Option<i32>) -> ExecutionOutcome {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout) {
        if let Some(Value::Object(error)) = map.get("__error__") {
            let kind = match error.get("kind").and_then(Value::as_str) {
                Some("entry_point_missing") => FailureKind::EntryPointMissing,
                _ => FailureKind::RuntimeError,
            };
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown worker error")
                .to_string();
            return ExecutionOutcome::failure(kind, message);
        }
    }

    let distilled = distill_traceback(stderr);
    if distilled.is_empty() {
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        return ExecutionOutcome::failure(
            FailureKind::RuntimeError,
            format!("worker exited with status {code} and no diagnostics"),
        );
    }
    ExecutionOutcome::failure(FailureKind::RuntimeError, distilled)
}

/// Pull the useful tail out of a Python traceback.
///
/// Pydantic validation errors end with a "For further information" URL line;
/// walking backwards past those yields the actual error plus a couple of
/// context lines.
fn distill_traceback(stderr: &str) -> String {
    let mut meaningful: Vec<&str> = Vec::new();
    for line in stderr.lines().rev() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("For further information") {
            continue;
        }
        meaningful.push(line);
        if meaningful.len() >= 3 {
            break;
        }
    }
    meaningful.reverse();
    meaningful.join("\n")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
