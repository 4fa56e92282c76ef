//! Review & auto-fix gate: a soft quality gate in front of the merge queue.
//!
//! A review blocks only on error-severity issues or security/bug warnings.
//! Blocked patches get up to two auto-fix rounds; whatever remains degrades
//! to ticket warnings and the patch proceeds. The integration gate is the
//! hard backstop, so throughput wins here.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::patch::{Patch, extract_file_blocks};
use crate::services::{
    GenerationRequest, GenerationService, ReviewIssue, ReviewReport, ReviewRequest, ReviewService,
};
use crate::ticket::Ticket;

/// Auto-fix rounds before residual issues degrade to warnings.
const MAX_FIX_ROUNDS: u32 = 2;

/// What the gate hands back to the dispatch loop.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub patch: Patch,
    /// Residual blocking issues, downgraded to warnings.
    pub warnings: Vec<String>,
    /// Total issues seen on the final review pass.
    pub issues_count: usize,
}

pub struct ReviewGate {
    review: Arc<dyn ReviewService>,
    generation: Arc<dyn GenerationService>,
    model: Option<String>,
}

impl ReviewGate {
    pub fn new(
        review: Arc<dyn ReviewService>,
        generation: Arc<dyn GenerationService>,
        model: Option<String>,
    ) -> Self {
        Self {
            review,
            generation,
            model,
        }
    }

    /// Review a patch, auto-fixing blocking issues within the round budget.
    /// Never fails the ticket: a broken review service degrades to a warning,
    /// and only cancellation propagates as an error.
    pub async fn review_patch(
        &self,
        ticket: &Ticket,
        mut patch: Patch,
        cancel: &CancellationToken,
    ) -> Result<ReviewOutcome, ServiceError> {
        let mut report = match self.request_review(ticket, &patch, cancel).await {
            Ok(report) => report,
            Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
            Err(err) => {
                warn!(ticket = %ticket.id, error = %err, "review service unavailable; proceeding");
                return Ok(ReviewOutcome {
                    patch,
                    warnings: vec![format!("review skipped: {}", err)],
                    issues_count: 0,
                });
            }
        };

        for round in 1..=MAX_FIX_ROUNDS {
            if !report.is_blocked() {
                break;
            }
            debug!(
                ticket = %ticket.id,
                round,
                blocking = report.blocking_issues().len(),
                "attempting review auto-fix"
            );

            match self.attempt_fix(ticket, &patch, &report, cancel).await {
                Ok(Some(fixed_files)) => {
                    patch.merge_files(fixed_files);
                }
                Ok(None) => break,
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(err) => {
                    warn!(ticket = %ticket.id, round, error = %err, "auto-fix round failed");
                    break;
                }
            }

            report = match self.request_review(ticket, &patch, cancel).await {
                Ok(report) => report,
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(_) => break,
            };
        }

        let warnings: Vec<String> = report
            .blocking_issues()
            .iter()
            .map(|issue| issue.describe())
            .collect();

        Ok(ReviewOutcome {
            issues_count: report.issues.len(),
            patch,
            warnings,
        })
    }

    async fn request_review(
        &self,
        ticket: &Ticket,
        patch: &Patch,
        cancel: &CancellationToken,
    ) -> Result<ReviewReport, ServiceError> {
        let request = ReviewRequest::from_files(&ticket.id, &ticket.title, &patch.files);
        self.review.review(request, cancel).await
    }

    /// Ask the generation service for a minimal patch covering only the
    /// blocking issues. Returns `None` when the response contains no files.
    async fn attempt_fix(
        &self,
        ticket: &Ticket,
        patch: &Patch,
        report: &ReviewReport,
        cancel: &CancellationToken,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>, ServiceError> {
        let prompt = build_fix_prompt(ticket, patch, &report.blocking_issues());
        let request = GenerationRequest {
            prompt,
            model: self.model.clone(),
            sandbox_id: None,
            is_edit: true,
            build_profile: None,
        };
        let response = self.generation.generate(request, cancel).await?;
        let files = extract_file_blocks(&response);
        Ok(if files.is_empty() { None } else { Some(files) })
    }
}

fn build_fix_prompt(ticket: &Ticket, patch: &Patch, blocking: &[&ReviewIssue]) -> String {
    let mut prompt = format!(
        "Code review found blocking issues in the change \"{}\". Fix only these \
         issues with the smallest possible edit.\n\n## Issues\n\n",
        ticket.title
    );
    for issue in blocking {
        prompt.push_str(&format!("- {}\n", issue.describe()));
        if let Some(ref suggestion) = issue.suggestion {
            prompt.push_str(&format!("  Suggestion: {}\n", suggestion));
        }
    }

    prompt.push_str("\n## Current files\n\n");
    let mut named: Vec<&str> = blocking.iter().map(|i| i.file.as_str()).collect();
    named.sort_unstable();
    named.dedup();
    for path in named {
        if let Some(content) = patch.files.get(path) {
            prompt.push_str(&format!("<file path=\"{}\">\n{}\n</file>\n", path, content));
        }
    }

    prompt.push_str(
        "\nReturn only the files you change, as complete `<file path=\"...\">` blocks.\n",
    );
    prompt
}
