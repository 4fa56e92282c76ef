//! Run event stream: the closed set of events a build run emits.
//!
//! Every event carries the run id and a strictly monotonic millisecond
//! timestamp. Fan-out uses a broadcast channel per run, so a slow or dropped
//! subscriber can never block emission or affect other subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ticket::TicketStatus;

/// Severity of a `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Terminal and intermediate run statuses surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations reported with ticket artifacts, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDurations {
    #[serde(default)]
    pub generate_ms: Option<u64>,
    #[serde(default)]
    pub review_ms: Option<u64>,
    #[serde(default)]
    pub merge_ms: Option<u64>,
}

/// Payload of a run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    RunStatus {
        status: RunStatus,
    },
    Log {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticket_id: Option<String>,
    },
    TicketStatus {
        ticket_id: String,
        status: TicketStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_count: Option<u32>,
    },
    TicketWarnings {
        ticket_id: String,
        warnings: Vec<String>,
    },
    TicketArtifacts {
        ticket_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generated_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        applied_files: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_files: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_files: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_version: Option<u64>,
        #[serde(default)]
        durations: StageDurations,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        review_issues_count: Option<usize>,
    },
    RunCompleted {
        status: RunStatus,
    },
}

/// One emitted event: envelope plus payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    /// Milliseconds since the epoch, strictly increasing within a run.
    pub at: i64,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Per-run event bus over a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    run_id: Uuid,
    tx: broadcast::Sender<RunEvent>,
    clock: Arc<AtomicI64>,
}

impl EventBus {
    pub fn new(run_id: Uuid, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            run_id,
            tx,
            clock: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Emission never fails: with no subscribers the event is
    /// dropped, and a lagging subscriber only loses its own backlog.
    pub fn emit(&self, kind: RunEventKind) {
        let event = RunEvent {
            run_id: self.run_id,
            at: self.next_timestamp(),
            kind,
        };
        self.tx.send(event).ok();
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(RunEventKind::Log {
            level,
            message: message.into(),
            ticket_id: None,
        });
    }

    pub fn log_ticket(&self, level: LogLevel, ticket_id: &str, message: impl Into<String>) {
        self.emit(RunEventKind::Log {
            level,
            message: message.into(),
            ticket_id: Some(ticket_id.to_string()),
        });
    }

    pub fn ticket_status(&self, ticket_id: &str, status: TicketStatus) {
        self.emit(RunEventKind::TicketStatus {
            ticket_id: ticket_id.to_string(),
            status,
            progress: None,
            error: None,
            retry_count: None,
        });
    }

    /// Wall-clock now, bumped past the previous emission so timestamps are
    /// strictly monotonic even within one millisecond.
    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now)
    }
}
