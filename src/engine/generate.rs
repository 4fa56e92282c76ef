//! Patch generation: prompt assembly and canonicalization of model output.
//!
//! Each dispatched ticket captures the current snapshot version as its base,
//! sends one generation request, and extracts the returned `<file>` blocks
//! into a [`Patch`]. A conventions summary derived from the base snapshot
//! steers the model toward editing existing files instead of duplicating
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CrucibleConfig;
use crate::errors::MergeError;
use crate::patch::{Patch, extract_file_blocks};
use crate::plan::Plan;
use crate::services::{GenerationRequest, GenerationService};
use crate::snapshot::Snapshot;
use crate::ticket::Ticket;

/// Component-file extensions ranked when picking the dominant one.
const COMPONENT_EXTENSIONS: &[&str] = &["tsx", "jsx", "vue", "svelte", "ts", "js"];

/// How many root directories the summary names.
const MAX_ROOT_DIRS: usize = 6;

/// What the base snapshot tells us about the project's conventions.
#[derive(Debug, Clone, Default)]
pub struct ConventionsSummary {
    /// Dominant top-level directories, most populated first.
    pub root_dirs: Vec<String>,
    /// Most common component file extension.
    pub component_extension: Option<String>,
    /// Existing shared UI primitive paths.
    pub ui_primitives: Vec<String>,
}

impl ConventionsSummary {
    /// Derive the summary from a snapshot's file listing.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut dir_counts: HashMap<&str, usize> = HashMap::new();
        let mut ext_counts: HashMap<&str, usize> = HashMap::new();
        let mut ui_primitives = Vec::new();

        for path in snapshot.files().keys() {
            if let Some((root, _rest)) = path.split_once('/') {
                *dir_counts.entry(root).or_insert(0) += 1;
            }
            if let Some((_, ext)) = path.rsplit_once('.')
                && COMPONENT_EXTENSIONS.contains(&ext)
            {
                *ext_counts.entry(ext).or_insert(0) += 1;
            }
            if path.contains("components/ui/") {
                ui_primitives.push(path.clone());
            }
        }

        let mut root_dirs: Vec<(&str, usize)> = dir_counts.into_iter().collect();
        root_dirs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        root_dirs.truncate(MAX_ROOT_DIRS);

        let component_extension = COMPONENT_EXTENSIONS
            .iter()
            .filter_map(|ext| ext_counts.get(ext).map(|count| (*ext, *count)))
            .max_by_key(|(_, count)| *count)
            .map(|(ext, _)| ext.to_string());

        ui_primitives.sort();

        Self {
            root_dirs: root_dirs.into_iter().map(|(d, _)| d.to_string()).collect(),
            component_extension,
            ui_primitives,
        }
    }

    /// Render the summary as a prompt section. Empty when the workspace is.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if !self.root_dirs.is_empty() {
            lines.push(format!("Existing root directories: {}", self.root_dirs.join(", ")));
        }
        if let Some(ref ext) = self.component_extension {
            lines.push(format!("Components use the .{} extension.", ext));
        }
        if !self.ui_primitives.is_empty() {
            lines.push(format!(
                "Shared UI primitives already exist - reuse them instead of creating new ones:\n{}",
                self.ui_primitives
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ));
        }
        lines.join("\n")
    }
}

/// Assemble the generation prompt for one ticket.
pub fn build_generation_prompt(ticket: &Ticket, plan: &Plan, conventions: &ConventionsSummary) -> String {
    let mut prompt = String::new();

    if !plan.blueprint.is_empty() {
        prompt.push_str("## Project blueprint\n\n");
        prompt.push_str(&plan.blueprint);
        prompt.push_str("\n\n");
    }
    if !plan.style.is_empty() {
        prompt.push_str("## Style guide\n\n");
        prompt.push_str(&plan.style);
        prompt.push_str("\n\n");
    }

    let conventions_text = conventions.render();
    if !conventions_text.is_empty() {
        prompt.push_str("## Workspace conventions\n\n");
        prompt.push_str(&conventions_text);
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Task\n\n");
    prompt.push_str(&format!("{}\n\n{}\n\n", ticket.title, ticket.description));
    prompt.push_str(
        "Implement exactly this change. Prefer editing existing files over creating \
         parallel copies. Return every changed or new file as a complete \
         `<file path=\"...\">` block.\n",
    );
    prompt
}

/// Bounded-pool worker body: one generation attempt for one ticket.
pub struct PatchGenerator {
    service: Arc<dyn GenerationService>,
    model: Option<String>,
    sandbox_id: Option<String>,
}

impl PatchGenerator {
    pub fn new(
        service: Arc<dyn GenerationService>,
        config: &CrucibleConfig,
        sandbox_id: Option<String>,
    ) -> Self {
        Self {
            service,
            model: config.model.clone(),
            sandbox_id,
        }
    }

    /// Generate a patch for `ticket` against `base`. Zero extracted files is
    /// a hard failure for this attempt.
    pub async fn generate(
        &self,
        ticket: &Ticket,
        plan: &Plan,
        base: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<Patch, MergeError> {
        let conventions = ConventionsSummary::from_snapshot(base);
        let prompt = build_generation_prompt(ticket, plan, &conventions);

        let request = GenerationRequest {
            prompt,
            model: self.model.clone(),
            sandbox_id: self.sandbox_id.clone(),
            is_edit: base.version() > 0 || !base.is_empty(),
            build_profile: None,
        };

        let generated = self.service.generate(request, cancel).await?;
        let files = extract_file_blocks(&generated);
        debug!(
            ticket = %ticket.id,
            base_version = base.version(),
            files = files.len(),
            "generation completed"
        );

        if files.is_empty() {
            return Err(MergeError::EmptyGeneration {
                ticket_id: ticket.id.clone(),
            });
        }

        Ok(Patch::new(&ticket.id, base.version(), files))
    }
}
