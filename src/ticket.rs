//! Ticket model: the unit of requested change flowing through a build run.
//!
//! Tickets are created by the external planner, mutated only by the
//! orchestrator, and terminal at `done`/`failed`/`skipped`. `blocked` is a
//! derived, reversible state.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a ticket within a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Backlog,
    Generating,
    PrReview,
    MergeQueued,
    Rebasing,
    Merging,
    Testing,
    AwaitingInput,
    Done,
    Failed,
    Blocked,
    Skipped,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Generating => "generating",
            Self::PrReview => "pr_review",
            Self::MergeQueued => "merge_queued",
            Self::Rebasing => "rebasing",
            Self::Merging => "merging",
            Self::Testing => "testing",
            Self::AwaitingInput => "awaiting_input",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal statuses never change again. `blocked` is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Statuses that release contention locks held on behalf of the ticket.
    pub fn releases_locks(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Blocked | Self::Skipped)
    }

    /// Statuses meaning the ticket has work somewhere in the pipeline.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Generating | Self::PrReview | Self::MergeQueued | Self::Merging | Self::Testing
        )
    }

    /// A dependency in this status counts as satisfied for its dependents.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "generating" => Ok(Self::Generating),
            "pr_review" => Ok(Self::PrReview),
            "merge_queued" => Ok(Self::MergeQueued),
            "rebasing" => Ok(Self::Rebasing),
            "merging" => Ok(Self::Merging),
            "testing" => Ok(Self::Testing),
            "awaiting_input" => Ok(Self::AwaitingInput),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

/// Category assigned by the planner; drives contention-group derivation and
/// the optional-database dependency rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Styling,
    Page,
    #[default]
    Component,
    Api,
    Database,
    Infra,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Styling => "styling",
            Self::Page => "page",
            Self::Component => "component",
            Self::Api => "api",
            Self::Database => "database",
            Self::Infra => "infra",
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "styling" => Ok(Self::Styling),
            "page" => Ok(Self::Page),
            "component" => Ok(Self::Component),
            "api" => Ok(Self::Api),
            "database" => Ok(Self::Database),
            "infra" => Ok(Self::Infra),
            _ => Err(format!("Invalid ticket type: {}", s)),
        }
    }
}

/// Mutual-exclusion class for ticket generation. Two tickets in the same
/// group never generate concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentionGroup {
    /// All styling tickets share one global lock.
    GlobalStyling,
    /// Tickets touching the same route or layout share a per-route lock.
    Route(String),
}

impl std::fmt::Display for ContentionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GlobalStyling => f.write_str("global_styling"),
            Self::Route(id) => write!(f, "route:{}", id),
        }
    }
}

/// A single unit of requested change with a dependency list and lifecycle
/// status. Field names mirror the planner's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub ticket_type: TicketType,
    /// Route or layout this ticket touches, if any (per-route contention).
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Tie-break for scheduling; ascending order wins.
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub status: TicketStatus,
    /// Snapshot version the last patch was generated against.
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Last known generated patch text, kept for inspection.
    #[serde(default)]
    pub generated_code: Option<String>,
    #[serde(default)]
    pub actual_files: Vec<String>,
    #[serde(default)]
    pub created_files: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Why the ticket is blocked, referencing the blocking ticket. Set only
    /// while `status == blocked`; dependency-caused blocks clear automatically.
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl Ticket {
    pub fn new(id: &str, title: &str, ticket_type: TicketType) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            ticket_type,
            route_id: None,
            dependencies: Vec::new(),
            order: 0,
            status: TicketStatus::Backlog,
            base_version: None,
            generated_code: None,
            actual_files: Vec::new(),
            created_files: Vec::new(),
            modified_files: Vec::new(),
            retry_count: 0,
            warnings: Vec::new(),
            error: None,
            blocked_reason: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_route(mut self, route_id: &str) -> Self {
        self.route_id = Some(route_id.to_string());
        self
    }

    /// The mutual-exclusion group this ticket generates under, if any.
    pub fn contention_group(&self) -> Option<ContentionGroup> {
        if self.ticket_type == TicketType::Styling {
            return Some(ContentionGroup::GlobalStyling);
        }
        self.route_id.as_ref().map(|r| ContentionGroup::Route(r.clone()))
    }

    /// A ticket is eligible for (re)generation in these statuses.
    pub fn is_buildable_status(&self) -> bool {
        matches!(self.status, TicketStatus::Backlog | TicketStatus::Rebasing)
    }
}
