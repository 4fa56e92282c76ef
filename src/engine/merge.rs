//! Merge queue and integration engine: serialized acceptance of virtual
//! branches into the shared workspace.
//!
//! One merge loop per run is the concurrency boundary that makes parallel
//! generation safe. Each dequeued branch is conflict-checked against the
//! current snapshot, rebased or AI-resolved where needed, optimistically
//! applied, gated, and only then accepted as the next snapshot version.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CrucibleConfig, GatingMode};
use crate::errors::{MergeError, ServiceError};
use crate::events::{EventBus, LogLevel};
use crate::heal::{HealHistory, HealStage};
use crate::patch::{FileMergeState, Patch, classify_file, extract_file_blocks, rebase_file};
use crate::sandbox::{WorkspaceProvider, restore_snapshot};
use crate::services::{ApplyRequest, ApplyService, GenerationRequest, GenerationService};
use crate::snapshot::SnapshotStore;

use super::gate::{GateLoopOutcome, IntegrationGate};

/// AI-assisted conflict resolution attempts per ticket.
const MAX_AI_RESOLUTION_ATTEMPTS: u32 = 2;

/// Regenerate/rebase (and apply-reset) budget per ticket.
const MAX_MERGE_RETRIES: u32 = 3;

/// A queued virtual branch with the ticket context the engine needs.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub patch: Patch,
    pub ticket_title: String,
    pub retry_count: u32,
}

/// Per-ticket state the merge loop carries across attempts.
#[derive(Debug, Default)]
pub struct TicketMergeState {
    pub heal: HealHistory,
    pub ai_attempts: u32,
}

/// Terminal outcome of processing one branch.
#[derive(Debug)]
pub enum MergeOutcome {
    /// Accepted; the snapshot advanced to `version`.
    Merged {
        version: u64,
        created_files: Vec<String>,
        modified_files: Vec<String>,
        gate_attempts: u32,
    },
    /// Put the ticket back through generation against the current snapshot.
    Requeue { reason: String },
    /// The ticket is permanently failed.
    Failed { error: MergeError },
    /// The run was cancelled mid-merge.
    Cancelled,
}

/// FIFO queue of virtual branches awaiting serialized acceptance.
#[derive(Debug, Default)]
pub struct MergeQueue {
    entries: Mutex<VecDeque<MergeRequest>>,
    notify: Notify,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: MergeRequest) {
        self.entries.lock().expect("queue lock").push_back(request);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<MergeRequest> {
        self.entries.lock().expect("queue lock").drain(..).collect()
    }

    /// Wait for the next entry; `None` on cancellation.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<MergeRequest> {
        loop {
            if let Some(entry) = self.entries.lock().expect("queue lock").pop_front() {
                return Some(entry);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

pub struct MergeEngine {
    provider: Arc<dyn WorkspaceProvider>,
    generation: Arc<dyn GenerationService>,
    apply: Arc<dyn ApplyService>,
    gate: IntegrationGate,
    store: Arc<RwLock<SnapshotStore>>,
    events: EventBus,
    gating_mode: GatingMode,
    model: Option<String>,
}

impl MergeEngine {
    pub fn new(
        provider: Arc<dyn WorkspaceProvider>,
        generation: Arc<dyn GenerationService>,
        apply: Arc<dyn ApplyService>,
        store: Arc<RwLock<SnapshotStore>>,
        events: EventBus,
        config: &CrucibleConfig,
    ) -> Self {
        let gate = IntegrationGate::new(provider.clone(), generation.clone(), config);
        Self {
            provider,
            generation,
            apply,
            gate,
            store,
            events,
            gating_mode: config.gating_mode,
            model: config.model.clone(),
        }
    }

    pub fn gate(&self) -> &IntegrationGate {
        &self.gate
    }

    /// Process one dequeued branch end to end.
    pub async fn process(
        &self,
        request: MergeRequest,
        state: &mut TicketMergeState,
        cancel: &CancellationToken,
    ) -> MergeOutcome {
        let ticket_id = request.patch.ticket_id.clone();
        self.events.ticket_status(&ticket_id, crate::ticket::TicketStatus::Merging);

        // Per-file three-way classification against the current snapshot.
        let (resolution, main_files) = {
            let store = self.store.read().await;
            let base = match store.get(request.patch.base_version) {
                Ok(snapshot) => snapshot,
                Err(error) => return MergeOutcome::Failed { error },
            };
            let main = store.current();
            let main_files: BTreeMap<String, String> = main.files().clone();
            (classify_patch(&request.patch, base, main), main_files)
        };

        let mut to_apply = resolution.resolved;
        let mut unresolved = resolution.needs_ai;

        // Deterministic rebase resolved what it could; the rest goes to the
        // model, bounded per ticket.
        if !unresolved.is_empty() {
            self.events.log_ticket(
                LogLevel::Info,
                &ticket_id,
                format!("{} file(s) in conflict, attempting resolution", unresolved.len()),
            );

            if state.ai_attempts < MAX_AI_RESOLUTION_ATTEMPTS {
                state.ai_attempts += 1;
                match self
                    .resolve_with_ai(&request, &unresolved, state, cancel)
                    .await
                {
                    Ok(Some(resolved)) => {
                        to_apply.extend(resolved);
                        unresolved.clear();
                    }
                    Ok(None) => {}
                    Err(ServiceError::Cancelled) => return MergeOutcome::Cancelled,
                    Err(err) => {
                        warn!(ticket = %ticket_id, error = %err, "AI conflict resolution failed");
                    }
                }
            }

            if !unresolved.is_empty() {
                return self.requeue_or_fail(
                    &ticket_id,
                    request.retry_count,
                    state,
                    HealStage::MergeConflict,
                    format!("unresolved conflicts in {} file(s)", unresolved.len()),
                );
            }
        }

        // Optimistic apply: the workspace is assumed to equal the current
        // snapshot. Any apply failure resets to that snapshot and retries
        // through the scheduler.
        if !to_apply.is_empty()
            && let Err(err) = self.apply_files(&to_apply, cancel).await
        {
            if matches!(err, ServiceError::Cancelled) {
                return MergeOutcome::Cancelled;
            }
            warn!(ticket = %ticket_id, error = %err, "apply failed, resetting workspace");
            if let Err(reset_err) = restore_snapshot(self.provider.as_ref(), &main_files).await {
                warn!(ticket = %ticket_id, error = %reset_err, "workspace reset failed");
            }
            return self.requeue_or_fail(
                &ticket_id,
                request.retry_count,
                state,
                HealStage::MergeApply,
                format!("apply failed: {}", err),
            );
        }

        let touched: Vec<String> = to_apply.keys().cloned().collect();

        // Online gating: never accepted until the gate passes; the heal loop
        // is unbounded and only cancellation exits it.
        let mut healed_files = Vec::new();
        let mut gate_attempts = 0;
        if self.gating_mode == GatingMode::Online {
            self.events.ticket_status(&ticket_id, crate::ticket::TicketStatus::Testing);
            match self
                .gate
                .run_until_pass(&ticket_id, &touched, &mut state.heal, None, cancel)
                .await
            {
                GateLoopOutcome::Passed { healed_files: healed, attempts } => {
                    healed_files = healed;
                    gate_attempts = attempts;
                }
                GateLoopOutcome::Cancelled => return MergeOutcome::Cancelled,
                GateLoopOutcome::Exhausted { .. } => unreachable!("online gate is unbounded"),
            }
        }

        // Accept: advance the snapshot by re-reading only what this merge and
        // its healing touched.
        let mut changed: BTreeMap<String, String> = BTreeMap::new();
        for path in touched.iter().chain(healed_files.iter()) {
            match self.provider.read_file(path).await {
                Ok(content) => {
                    changed.insert(path.clone(), content);
                }
                Err(err) => {
                    debug!(path = %path, error = %err, "touched file unreadable at accept time");
                }
            }
        }

        let (version, created_files, modified_files) = {
            let mut store = self.store.write().await;
            let previous = store.current();
            let mut created = Vec::new();
            let mut modified = Vec::new();
            for path in changed.keys() {
                if previous.contains(path) {
                    modified.push(path.clone());
                } else {
                    created.push(path.clone());
                }
            }
            (store.advance(changed), created, modified)
        };

        info!(ticket = %ticket_id, version, "merge accepted");
        MergeOutcome::Merged {
            version,
            created_files,
            modified_files,
            gate_attempts,
        }
    }

    fn requeue_or_fail(
        &self,
        ticket_id: &str,
        retry_count: u32,
        state: &mut TicketMergeState,
        stage: HealStage,
        message: String,
    ) -> MergeOutcome {
        state.heal.record(stage, retry_count + 1, &message);
        if retry_count >= MAX_MERGE_RETRIES {
            let error = match stage {
                HealStage::MergeApply => MergeError::ApplyExhausted {
                    ticket_id: ticket_id.to_string(),
                    attempts: retry_count,
                    message,
                },
                _ => MergeError::ConflictExhausted {
                    ticket_id: ticket_id.to_string(),
                    attempts: retry_count,
                },
            };
            return MergeOutcome::Failed { error };
        }
        MergeOutcome::Requeue { reason: message }
    }

    /// Ask the generation service for full replacement content for exactly
    /// the conflicting files. Accepted only if every requested file comes
    /// back.
    async fn resolve_with_ai(
        &self,
        request: &MergeRequest,
        conflicts: &BTreeMap<String, ConflictContext>,
        state: &TicketMergeState,
        cancel: &CancellationToken,
    ) -> Result<Option<BTreeMap<String, String>>, ServiceError> {
        let prompt = build_resolution_prompt(&request.ticket_title, conflicts, &state.heal);
        let generation_request = GenerationRequest {
            prompt,
            model: self.model.clone(),
            sandbox_id: None,
            is_edit: true,
            build_profile: None,
        };
        let response = self.generation.generate(generation_request, cancel).await?;
        let files = extract_file_blocks(&response);

        let all_returned = conflicts.keys().all(|path| files.contains_key(path));
        if !all_returned {
            debug!(
                ticket = %request.patch.ticket_id,
                returned = files.len(),
                requested = conflicts.len(),
                "resolution response incomplete, falling through"
            );
            return Ok(None);
        }

        // Keep only the files that were asked for.
        Ok(Some(
            files
                .into_iter()
                .filter(|(path, _)| conflicts.contains_key(path))
                .collect(),
        ))
    }

    async fn apply_files(
        &self,
        files: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let sandbox_id = self
            .provider
            .sandbox_info()
            .await
            .ok()
            .map(|info| info.sandbox_id);
        let request = ApplyRequest::from_files(files, true, sandbox_id);
        self.apply.apply(request, cancel).await?;
        Ok(())
    }
}

/// Context handed to AI resolution for one conflicting file.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub base: Option<String>,
    pub main: Option<String>,
    pub patch: String,
    /// Why the deterministic rebase could not settle this file.
    pub note: &'static str,
}

struct PatchResolution {
    /// Content ready to apply, keyed by path.
    resolved: BTreeMap<String, String>,
    /// Files needing AI resolution, with full three-way context.
    needs_ai: BTreeMap<String, ConflictContext>,
}

/// Classify every patched file and run the deterministic rebase on clean
/// conflicts. Ambiguous existence is escalated, never guessed.
fn classify_patch(
    patch: &Patch,
    base: &crate::snapshot::Snapshot,
    main: &crate::snapshot::Snapshot,
) -> PatchResolution {
    let mut resolved = BTreeMap::new();
    let mut needs_ai = BTreeMap::new();

    for (path, content) in &patch.files {
        let base_content = base.get(path);
        let main_content = main.get(path);

        match classify_file(base_content, main_content, content) {
            FileMergeState::CleanBase => {
                resolved.insert(path.clone(), content.clone());
            }
            // Content already current: nothing to write.
            FileMergeState::AlreadyApplied | FileMergeState::Untouched => {}
            FileMergeState::Conflicting => {
                let (base_text, main_text) = (
                    base_content.expect("conflicting implies base exists"),
                    main_content.expect("conflicting implies main exists"),
                );
                match rebase_file(base_text, main_text, content) {
                    Some(rebased) => {
                        resolved.insert(path.clone(), rebased);
                    }
                    None => {
                        needs_ai.insert(
                            path.clone(),
                            ConflictContext {
                                base: Some(base_text.to_string()),
                                main: Some(main_text.to_string()),
                                patch: content.clone(),
                                note: "text rebase could not apply cleanly",
                            },
                        );
                    }
                }
            }
            FileMergeState::Ambiguous => {
                needs_ai.insert(
                    path.clone(),
                    ConflictContext {
                        base: base_content.map(String::from),
                        main: main_content.map(String::from),
                        patch: content.clone(),
                        note: "file exists in some states but not others",
                    },
                );
            }
        }
    }

    PatchResolution { resolved, needs_ai }
}

fn build_resolution_prompt(
    ticket_title: &str,
    conflicts: &BTreeMap<String, ConflictContext>,
    heal: &HealHistory,
) -> String {
    let mut prompt = format!(
        "The change \"{}\" conflicts with work merged underneath it. For each file \
         below, produce the full merged content that preserves both the intent of \
         the change and everything already on the current version.\n\n",
        ticket_title
    );

    if !heal.is_empty() {
        prompt.push_str("## Previous attempts\n\n");
        prompt.push_str(&heal.summarize(5));
        prompt.push_str("\n\n");
    }

    for (path, context) in conflicts {
        prompt.push_str(&format!("## {}\n\n({})\n\n", path, context.note));
        match &context.base {
            Some(base) => prompt.push_str(&format!(
                "### Common base\n<file path=\"{}\">\n{}\n</file>\n\n",
                path, base
            )),
            None => prompt.push_str("### Common base\n(file did not exist)\n\n"),
        }
        match &context.main {
            Some(main) => prompt.push_str(&format!(
                "### Current version\n<file path=\"{}\">\n{}\n</file>\n\n",
                path, main
            )),
            None => prompt.push_str("### Current version\n(file does not exist)\n\n"),
        }
        prompt.push_str(&format!(
            "### This change wants\n<file path=\"{}\">\n{}\n</file>\n\n",
            path, context.patch
        ));
    }

    prompt.push_str(
        "Return every file listed above, each as one complete `<file path=\"...\">` block.\n",
    );
    prompt
}
