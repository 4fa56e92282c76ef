//! Typed error hierarchy for the Crucible orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `ServiceError` — failures of the external generation/apply/review services
//! - `MergeError` — merge-queue and integration-engine failures
//! - `RunError` — run-level orchestration failures

use thiserror::Error;

/// Errors from calls to the external generation, apply, and review services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Service stream reported error: {0}")]
    Stream(String),

    #[error("Service stream ended without a completion event")]
    Incomplete,

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Malformed service payload: {0}")]
    Payload(String),
}

impl ServiceError {
    /// Timeouts and stream/request failures are expected operational outcomes
    /// that the engine retries at a higher level; cancellation and malformed
    /// payloads are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Stream(_) | Self::Request { .. } | Self::Incomplete
        )
    }
}

/// Errors from the merge queue and integration engine.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Ticket {ticket_id}: generation produced no files")]
    EmptyGeneration { ticket_id: String },

    #[error("Ticket {ticket_id}: conflict resolution exhausted after {attempts} attempts")]
    ConflictExhausted { ticket_id: String, attempts: u32 },

    #[error("Ticket {ticket_id}: workspace apply failed after {attempts} attempts: {message}")]
    ApplyExhausted {
        ticket_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Ticket {ticket_id}: final integration gate failed after {attempts} attempts")]
    GateExhausted { ticket_id: String, attempts: u32 },

    #[error("Unknown snapshot version {version}")]
    UnknownVersion { version: u64 },

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Errors from run-level orchestration.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run is already in terminal status {status}")]
    AlreadyTerminal { status: String },

    #[error("Plan validation failed: {0}")]
    InvalidPlan(String),

    #[error("Workspace provider error: {0}")]
    Workspace(#[source] anyhow::Error),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
