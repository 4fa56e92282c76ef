//! External service contracts: code generation, apply-to-workspace, review.
//!
//! The orchestrator consumes all three as narrow async traits so the HTTP
//! clients in [`http`] and in-process fakes in tests are interchangeable.
//! Generation and apply are incremental event streams; review is a plain
//! request/response.

mod http;

pub use http::{HttpServiceClient, HttpServiceConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::ServiceError;

// ── Code generation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub is_edit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_profile: Option<String>,
}

/// Events on the generation stream. Text accumulates from `stream` chunks
/// until `complete`; `error` fails the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Status { message: String },
    Thinking { text: String },
    ThinkingComplete,
    Stream { text: String },
    Complete { generated_code: String },
    Error { error: String },
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Run one generation request to completion, returning the full generated
    /// text. Cancellation aborts the in-flight call.
    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, ServiceError>;
}

// ── Apply to workspace ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Files rendered as `<file path="...">` text blocks.
    pub files: String,
    #[serde(default)]
    pub is_edit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

impl ApplyRequest {
    pub fn from_files(files: &BTreeMap<String, String>, is_edit: bool, sandbox_id: Option<String>) -> Self {
        let blocks: Vec<String> = files
            .iter()
            .map(|(path, content)| format!("<file path=\"{}\">\n{}\n</file>", path, content))
            .collect();
        Self {
            files: blocks.join("\n"),
            is_edit,
            sandbox_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResults {
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_updated: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyEvent {
    Status { message: String },
    Stream { text: String },
    Complete { results: ApplyResults },
    Error { error: String },
}

#[async_trait]
pub trait ApplyService: Send + Sync {
    async fn apply(
        &self,
        request: ApplyRequest,
        cancel: &CancellationToken,
    ) -> Result<ApplyResults, ServiceError>;
}

// ── Code review ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub ticket_id: String,
    pub ticket_title: String,
    pub files: Vec<ReviewFile>,
}

impl ReviewRequest {
    pub fn from_files(ticket_id: &str, ticket_title: &str, files: &BTreeMap<String, String>) -> Self {
        Self {
            ticket_id: ticket_id.to_string(),
            ticket_title: ticket_title.to_string(),
            files: files
                .iter()
                .map(|(path, content)| ReviewFile {
                    path: path.clone(),
                    content: content.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Security,
    Bug,
    Performance,
    Style,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: IssueSeverity,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ReviewIssue {
    /// Errors always block; warnings block only for security and bug issues.
    /// Everything else is advisory.
    pub fn is_blocking(&self) -> bool {
        match self.severity {
            IssueSeverity::Error => true,
            IssueSeverity::Warning => {
                matches!(self.issue_type, IssueType::Security | IssueType::Bug)
            }
            IssueSeverity::Info => false,
        }
    }

    pub fn describe(&self) -> String {
        let location = match self.line {
            Some(line) => format!("{}:{}", self.file, line),
            None => self.file.clone(),
        };
        format!("[{:?}/{:?}] {}: {}", self.severity, self.issue_type, location, self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewReport {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

impl ReviewReport {
    pub fn blocking_issues(&self) -> Vec<&ReviewIssue> {
        self.issues.iter().filter(|i| i.is_blocking()).collect()
    }

    pub fn is_blocked(&self) -> bool {
        self.issues.iter().any(|i| i.is_blocking())
    }
}

#[async_trait]
pub trait ReviewService: Send + Sync {
    async fn review(
        &self,
        request: ReviewRequest,
        cancel: &CancellationToken,
    ) -> Result<ReviewReport, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(severity: IssueSeverity, issue_type: IssueType) -> ReviewIssue {
        ReviewIssue {
            severity,
            issue_type,
            file: "src/App.tsx".to_string(),
            line: Some(4),
            message: "problem".to_string(),
            suggestion: None,
        }
    }

    #[test]
    fn test_blocking_rule() {
        assert!(issue(IssueSeverity::Error, IssueType::Style).is_blocking());
        assert!(issue(IssueSeverity::Warning, IssueType::Security).is_blocking());
        assert!(issue(IssueSeverity::Warning, IssueType::Bug).is_blocking());
        assert!(!issue(IssueSeverity::Warning, IssueType::Performance).is_blocking());
        assert!(!issue(IssueSeverity::Info, IssueType::Bug).is_blocking());
    }

    #[test]
    fn test_report_blocked() {
        let report = ReviewReport {
            issues: vec![
                issue(IssueSeverity::Info, IssueType::Style),
                issue(IssueSeverity::Warning, IssueType::Bug),
            ],
        };
        assert!(report.is_blocked());
        assert_eq!(report.blocking_issues().len(), 1);
    }

    #[test]
    fn test_generation_event_wire_format() {
        let event: GenerationEvent =
            serde_json::from_str(r#"{"type":"stream","text":"const "}"#).unwrap();
        assert!(matches!(event, GenerationEvent::Stream { .. }));

        let event: GenerationEvent =
            serde_json::from_str(r#"{"type":"thinking_complete"}"#).unwrap();
        assert!(matches!(event, GenerationEvent::ThinkingComplete));
    }

    #[test]
    fn test_apply_request_renders_file_blocks() {
        let files: BTreeMap<String, String> = [("src/a.ts".to_string(), "const a = 1;".to_string())]
            .into_iter()
            .collect();
        let request = ApplyRequest::from_files(&files, true, Some("sb-1".into()));
        assert!(request.files.contains("<file path=\"src/a.ts\">"));
        assert!(request.files.contains("const a = 1;"));
        assert!(request.is_edit);
    }

    #[test]
    fn test_review_issue_type_field_name() {
        let json = r#"{"severity":"warning","type":"bug","file":"a.ts","message":"m"}"#;
        let issue: ReviewIssue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.issue_type, IssueType::Bug);
        assert!(issue.is_blocking());
    }
}
