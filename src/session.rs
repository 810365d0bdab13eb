//! Bounded-retry generation session.
//!
//! The session is the state machine that sequences normalize → validate →
//! execute → inspect, composes failure-specific feedback, asks the oracle for
//! a repaired version, and gives up after a fixed number of oracle calls. It
//! owns its attempt history exclusively, runs strictly sequentially, and
//! always resolves to `Succeeded` or `Exhausted`, never an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::candidate::CandidateCode;
use crate::inspect::{self, InspectionResult};
use crate::normalize;
use crate::oracle::Oracle;
use crate::policy::{self, Policy, PolicyViolation};
use crate::runner::{ExecutionOutcome, FailureKind, IsolatedRunner};
use crate::schema;

/// Everything injected at session construction. The engine is schema-agnostic;
/// these values are what bind it to a concrete domain.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: Policy,
    pub entry_point: String,
    pub discriminator: String,
    pub corrections: HashMap<String, String>,
    /// Total oracle invocations allowed, including the initial generation.
    pub max_attempts: usize,
    pub exec_timeout: Duration,
    pub python: PathBuf,
}

impl SessionConfig {
    /// Defaults for the FHIR R4B domain.
    pub fn fhir() -> Self {
        Self {
            policy: schema::fhir_policy(),
            entry_point: schema::ENTRY_POINT.to_string(),
            discriminator: schema::DISCRIMINATOR_FIELD.to_string(),
            corrections: schema::import_corrections(),
            max_attempts: 3,
            exec_timeout: Duration::from_secs(30),
            python: PathBuf::from("python3"),
        }
    }
}

/// Phase the session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingCode,
    Normalizing,
    Validating,
    Executing,
    Inspecting,
    Succeeded,
    Exhausted,
}

/// Everything known about one attempt, kept for diagnostics and for composing
/// the next feedback prompt. Append-only; never replayed.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub index: usize,
    pub started_at: DateTime<Utc>,
    /// Oracle response exactly as received, pre-extraction.
    pub raw_response: String,
    /// Normalized code that was actually validated and executed.
    pub code: String,
    pub violations: Vec<PolicyViolation>,
    pub execution: Option<ExecutionOutcome>,
    pub inspection: Option<InspectionResult>,
    /// Feedback sent back to the oracle after this attempt, if any.
    pub feedback: Option<String>,
}

impl AttemptRecord {
    /// The most specific failure detail this attempt produced.
    pub fn failure_summary(&self) -> String {
        if !self.violations.is_empty() {
            return self
                .violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
        }
        if let Some(ExecutionOutcome::Failure { kind, message, .. }) = &self.execution {
            return format!("{}: {}", kind.label(), message);
        }
        if let Some(inspection) = &self.inspection {
            if !inspection.passed {
                return inspection
                    .reasons
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
            }
        }
        "no failure recorded".to_string()
    }
}

/// Terminal result of a session.
#[derive(Debug)]
pub enum SessionOutcome {
    Succeeded {
        records: Vec<Value>,
        attempts: Vec<AttemptRecord>,
    },
    Exhausted {
        attempts: Vec<AttemptRecord>,
        /// True when the caller aborted the session.
        cancelled: bool,
        /// Set when the oracle itself failed (transport, auth), which ends the
        /// session without a further attempt.
        oracle_error: Option<String>,
    },
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            SessionOutcome::Succeeded { attempts, .. } => attempts,
            SessionOutcome::Exhausted { attempts, .. } => attempts,
        }
    }

    /// Most informative recent failure, for user-facing reporting.
    pub fn last_error(&self) -> Option<String> {
        match self {
            SessionOutcome::Succeeded { .. } => None,
            SessionOutcome::Exhausted {
                attempts,
                cancelled,
                oracle_error,
            } => {
                if *cancelled {
                    return Some("session cancelled by caller".to_string());
                }
                if let Some(err) = oracle_error {
                    return Some(format!("oracle failed: {err}"));
                }
                attempts.last().map(AttemptRecord::failure_summary)
            }
        }
    }
}

/// Create a linked cancellation pair. Dropping the handle without cancelling
/// leaves the token pending forever, so sessions given an unused token behave
/// exactly like uncancellable ones.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Caller-side handle that aborts a running session.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Session-side token observed between and during blocking steps.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves only if the session is cancelled.
    async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling; stay pending.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One bounded-retry generation session over a given oracle.
pub struct RetrySession<O: Oracle> {
    id: Uuid,
    config: SessionConfig,
    oracle: O,
    runner: IsolatedRunner,
    state: SessionState,
    attempts: Vec<AttemptRecord>,
    oracle_calls: usize,
}

impl<O: Oracle> RetrySession<O> {
    pub fn new(oracle: O, config: SessionConfig) -> Self {
        let runner = IsolatedRunner::new(
            config.python.clone(),
            config.entry_point.clone(),
            config.policy.clone(),
        );
        Self {
            id: Uuid::new_v4(),
            config,
            oracle,
            runner,
            state: SessionState::AwaitingCode,
            attempts: Vec::new(),
            oracle_calls: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to a terminal outcome, uncancellable.
    pub async fn run(self, requirement: &str) -> SessionOutcome {
        let (_handle, token) = cancel_pair();
        self.run_with_cancel(requirement, token).await
    }

    /// Run the session to a terminal outcome. Cancelling the paired handle
    /// aborts the session: an in-flight worker is killed, an in-flight oracle
    /// call is dropped, and the outcome is `Exhausted { cancelled: true }`
    /// without a spurious extra attempt.
    pub async fn run_with_cancel(
        mut self,
        requirement: &str,
        mut cancel: CancelToken,
    ) -> SessionOutcome {
        info!(session = %self.id, max_attempts = self.config.max_attempts, "session started");
        // (prior code, feedback) for the next fix request; None on the first
        // attempt, which always goes through the same pipeline.
        let mut pending_fix: Option<(String, String)> = None;

        loop {
            self.state = SessionState::AwaitingCode;
            if cancel.is_cancelled() {
                return self.exhaust(true, None);
            }

            // None marks cancellation while the oracle call was in flight.
            let step = tokio::select! {
                _ = cancel.cancelled() => None,
                result = async {
                    match &pending_fix {
                        None => self.oracle.generate(requirement).await,
                        Some((code, feedback)) => self.oracle.request_fix(code, feedback).await,
                    }
                } => Some(result),
            };
            let response = match step {
                None => return self.exhaust(true, None),
                Some(Ok(response)) => response,
                Some(Err(err)) => {
                    warn!(session = %self.id, "oracle call failed: {err:#}");
                    return self.exhaust(false, Some(format!("{err:#}")));
                }
            };
            self.oracle_calls += 1;

            let index = self.attempts.len();
            let candidate = CandidateCode::from_response(response, index);

            self.state = SessionState::Normalizing;
            let code = normalize::normalize(&candidate.extracted, &self.config.corrections);
            let mut record = AttemptRecord {
                index: candidate.attempt,
                started_at: Utc::now(),
                raw_response: candidate.raw,
                code: code.clone(),
                violations: Vec::new(),
                execution: None,
                inspection: None,
                feedback: None,
            };

            self.state = SessionState::Validating;
            let violations = policy::validate(&code, &self.config.policy);
            if !violations.is_empty() {
                debug!(session = %self.id, attempt = index, count = violations.len(), "policy violations");
                let feedback = feedback_for_violations(&violations);
                record.violations = violations;
                match self.conclude_attempt(record, code, feedback, &mut pending_fix) {
                    Continuation::Retry => continue,
                    Continuation::Exhausted => return self.exhaust(false, None),
                }
            }

            self.state = SessionState::Executing;
            let executed = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = self.runner.execute(&code, self.config.exec_timeout) => Some(outcome),
            };
            let outcome = match executed {
                None => {
                    // Killing the worker is the runner's job (kill_on_drop);
                    // the attempt is kept without an execution outcome.
                    self.attempts.push(record);
                    return self.exhaust(true, None);
                }
                Some(outcome) => outcome,
            };

            let records = match outcome {
                ExecutionOutcome::Failure { .. } => {
                    let feedback = feedback_for_failure(&outcome, &self.config.entry_point);
                    debug!(session = %self.id, attempt = index, "execution failed");
                    record.execution = Some(outcome);
                    match self.conclude_attempt(record, code, feedback, &mut pending_fix) {
                        Continuation::Retry => continue,
                        Continuation::Exhausted => return self.exhaust(false, None),
                    }
                }
                ExecutionOutcome::Success { records } => {
                    record.execution = Some(ExecutionOutcome::Success {
                        records: records.clone(),
                    });
                    records
                }
            };

            self.state = SessionState::Inspecting;
            let inspection = inspect::inspect(&records, &self.config.discriminator);
            if inspection.passed {
                record.inspection = Some(inspection);
                self.attempts.push(record);
                self.state = SessionState::Succeeded;
                info!(session = %self.id, attempts = self.attempts.len(), records = records.len(), "session succeeded");
                return SessionOutcome::Succeeded {
                    records,
                    attempts: self.attempts,
                };
            }

            let feedback = feedback_for_inspection(&inspection);
            record.inspection = Some(inspection);
            match self.conclude_attempt(record, code, feedback, &mut pending_fix) {
                Continuation::Retry => continue,
                Continuation::Exhausted => return self.exhaust(false, None),
            }
        }
    }

    /// Record a failed attempt and decide whether the budget allows another
    /// oracle call.
    fn conclude_attempt(
        &mut self,
        mut record: AttemptRecord,
        code: String,
        feedback: String,
        pending_fix: &mut Option<(String, String)>,
    ) -> Continuation {
        if self.oracle_calls < self.config.max_attempts {
            record.feedback = Some(feedback.clone());
            self.attempts.push(record);
            *pending_fix = Some((code, feedback));
            Continuation::Retry
        } else {
            self.attempts.push(record);
            Continuation::Exhausted
        }
    }

    fn exhaust(mut self, cancelled: bool, oracle_error: Option<String>) -> SessionOutcome {
        self.state = SessionState::Exhausted;
        if cancelled {
            info!(session = %self.id, "session cancelled");
        } else {
            warn!(session = %self.id, attempts = self.attempts.len(), "session exhausted");
        }
        SessionOutcome::Exhausted {
            attempts: self.attempts,
            cancelled,
            oracle_error,
        }
    }
}

enum Continuation {
    Retry,
    Exhausted,
}

/// Feedback naming each violation kind and its concrete detail.
fn feedback_for_violations(violations: &[PolicyViolation]) -> String {
    let mut lines = vec!["The code violates the static safety policy:".to_string()];
    for violation in violations {
        lines.push(format!("- {}", violation));
    }
    lines.push(
        "Use only the allowed stdlib modules plus fhir.resources, and never call \
         dynamic evaluation or file/process built-ins."
            .to_string(),
    );
    lines.join("\n")
}

/// Feedback specific to the execution failure kind.
fn feedback_for_failure(outcome: &ExecutionOutcome, entry_point: &str) -> String {
    let (kind, message, partial) = match outcome {
        ExecutionOutcome::Failure {
            kind,
            message,
            partial_output,
        } => (kind, message, partial_output),
        ExecutionOutcome::Success { .. } => return String::new(),
    };
    match kind {
        FailureKind::Timeout => {
            let mut text = format!(
                "{message}. Remove unbounded loops and blocking calls; {entry_point}() must \
                 build its records and return promptly."
            );
            if let Some(partial) = partial {
                text.push_str(&format!("\nPartial output before the kill:\n{partial}"));
            }
            text
        }
        FailureKind::RuntimeError => {
            format!("The code raised an error during execution:\n{message}")
        }
        FailureKind::EntryPointMissing => format!(
            "{message}. Define exactly one function {entry_point}() taking no arguments and \
             returning list[dict]."
        ),
        FailureKind::PolicyRejected => format!(
            "The code was rejected by the safety policy at execution time:\n{message}"
        ),
    }
}

/// Feedback naming every failing inspection reason at once.
fn feedback_for_inspection(inspection: &InspectionResult) -> String {
    let mut lines =
        vec!["The code ran, but its output failed structural checks:".to_string()];
    for reason in &inspection.reasons {
        lines.push(format!("- {}", reason));
    }
    lines.join("\n")
}
