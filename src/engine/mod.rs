//! The build-run engine: scheduling, worker pools, and the serialized merge
//! loop behind one dispatch loop per run.
//!
//! ## Architecture
//!
//! A run owns one integration workspace for its lifetime. The dispatch loop
//! pulls buildable tickets from the [`scheduler`], fans generation out to a
//! bounded pool, funnels finished patches through the soft [`review`] gate,
//! and hands them to the single [`merge`] loop, which is the only writer of
//! the workspace and the snapshot store. The [`gate`] validates every
//! accepted merge (or one final pass in deferred mode), and [`flow`] keeps
//! generation from outrunning merging.

pub mod flow;
pub mod gate;
pub mod generate;
pub mod lifecycle;
pub mod merge;
pub mod review;
pub mod scheduler;

pub use gate::{GateLoopOutcome, IntegrationGate};
pub use lifecycle::{GateOutcome, RunController};
pub use merge::{MergeEngine, MergeOutcome, MergeQueue, MergeRequest, TicketMergeState};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CrucibleConfig, GatingMode};
use crate::errors::{MergeError, RunError, ServiceError};
use crate::events::{EventBus, LogLevel, RunEvent, RunEventKind, RunStatus, StageDurations};
use crate::heal::HealHistory;
use crate::patch::Patch;
use crate::plan::Plan;
use crate::sandbox::{WorkspaceProvider, capture_snapshot};
use crate::services::{ApplyService, GenerationService, ReviewService};
use crate::snapshot::SnapshotStore;
use crate::ticket::{Ticket, TicketStatus};

use flow::FlowControl;
use generate::PatchGenerator;
use review::{ReviewGate, ReviewOutcome};
use scheduler::Scheduler;

/// The three external services a run consumes.
#[derive(Clone)]
pub struct Services {
    pub generation: Arc<dyn GenerationService>,
    pub apply: Arc<dyn ApplyService>,
    pub review: Arc<dyn ReviewService>,
}

/// What a finished run reports back.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub final_version: u64,
    pub ticket_statuses: BTreeMap<String, TicketStatus>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn done_count(&self) -> usize {
        self.ticket_statuses
            .values()
            .filter(|s| **s == TicketStatus::Done)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.ticket_statuses
            .values()
            .filter(|s| **s == TicketStatus::Failed)
            .count()
    }
}

/// Handle returned when a run is launched.
pub struct RunStarted {
    pub run_id: Uuid,
    pub events: broadcast::Receiver<RunEvent>,
    pub handle: JoinHandle<Result<RunSummary, RunError>>,
}

/// Explicit service object owning the live-run map. No process-wide globals:
/// construct one and inject it where needed.
#[derive(Default)]
pub struct BuildOrchestrator {
    runs: std::sync::Mutex<HashMap<Uuid, Arc<RunController>>>,
}

impl BuildOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch a run on its own task. The returned handle resolves to the run
    /// summary; events stream on the returned receiver immediately.
    pub fn start_run(
        self: &Arc<Self>,
        plan: Plan,
        provider: Arc<dyn WorkspaceProvider>,
        services: Services,
        config: CrucibleConfig,
    ) -> Result<RunStarted, RunError> {
        plan.validate()?;

        let run_id = Uuid::new_v4();
        let events = EventBus::new(run_id, config.event_capacity);
        let receiver = events.subscribe();
        let controller = Arc::new(RunController::new(events));
        self.runs
            .lock()
            .expect("runs lock")
            .insert(run_id, controller.clone());

        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = execute_run(controller, plan, provider, services, config).await;
            orchestrator.runs.lock().expect("runs lock").remove(&run_id);
            result
        });

        Ok(RunStarted {
            run_id,
            events: receiver,
            handle,
        })
    }

    pub fn pause(&self, run_id: Uuid) -> Result<(), RunError> {
        self.with_run(run_id, |controller| controller.pause())
    }

    pub fn resume(&self, run_id: Uuid) -> Result<(), RunError> {
        self.with_run(run_id, |controller| controller.resume())
    }

    pub fn cancel(&self, run_id: Uuid) -> Result<(), RunError> {
        self.with_run(run_id, |controller| controller.cancel())
    }

    pub fn subscribe(&self, run_id: Uuid) -> Result<broadcast::Receiver<RunEvent>, RunError> {
        let runs = self.runs.lock().expect("runs lock");
        runs.get(&run_id)
            .map(|controller| controller.events().subscribe())
            .ok_or_else(|| RunError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.lock().expect("runs lock").keys().copied().collect()
    }

    fn with_run(&self, run_id: Uuid, f: impl FnOnce(&RunController)) -> Result<(), RunError> {
        let runs = self.runs.lock().expect("runs lock");
        match runs.get(&run_id) {
            Some(controller) => {
                f(controller);
                Ok(())
            }
            None => Err(RunError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }
}

/// Messages the worker pools and the merge loop send back to the dispatch
/// loop.
enum StageMsg {
    GenerationDone {
        ticket_id: String,
        result: Result<Patch, MergeError>,
        elapsed_ms: u64,
    },
    ReviewDone {
        ticket_id: String,
        result: Result<ReviewOutcome, ServiceError>,
        elapsed_ms: u64,
    },
    MergeDone {
        ticket_id: String,
        outcome: MergeOutcome,
    },
}

/// Execute one run to completion. This is the dispatch loop the architecture
/// section describes; everything else hangs off it.
async fn execute_run(
    controller: Arc<RunController>,
    plan: Plan,
    provider: Arc<dyn WorkspaceProvider>,
    services: Services,
    config: CrucibleConfig,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let events = controller.events().clone();
    let run_id = events.run_id();

    events.emit(RunEventKind::RunStarted);

    // Cancelled before anything ran: still emit exactly one terminal event.
    if controller.is_cancelled() {
        controller.set_status(RunStatus::Cancelled);
        events.emit(RunEventKind::RunCompleted {
            status: RunStatus::Cancelled,
        });
        return Ok(RunSummary {
            run_id,
            status: RunStatus::Cancelled,
            final_version: 0,
            ticket_statuses: plan.tickets.iter().map(|t| (t.id.clone(), t.status)).collect(),
            duration: started.elapsed(),
        });
    }

    controller.set_status(RunStatus::Running);

    // Version 0 is the live workspace at run start.
    let initial_tree = capture_snapshot(provider.as_ref())
        .await
        .map_err(RunError::Workspace)?;
    events.log(
        LogLevel::Info,
        format!("captured workspace snapshot v0 ({} files)", initial_tree.len()),
    );
    let store = Arc::new(RwLock::new(SnapshotStore::new(initial_tree)));

    let sandbox_id = provider
        .sandbox_info()
        .await
        .ok()
        .map(|info| info.sandbox_id);

    let mut tickets: BTreeMap<String, Ticket> = plan
        .tickets
        .iter()
        .cloned()
        .map(|t| (t.id.clone(), t))
        .collect();
    let plan = Arc::new(plan);

    let mut scheduler = Scheduler::new(plan.data_mode);
    let mut flow = FlowControl::new(config.buffer_cap, config.buffer_ceiling, config.stall_window);

    let generator = Arc::new(PatchGenerator::new(
        services.generation.clone(),
        &config,
        sandbox_id,
    ));
    let review_gate = Arc::new(ReviewGate::new(
        services.review.clone(),
        services.generation.clone(),
        config.model.clone(),
    ));
    let engine = Arc::new(MergeEngine::new(
        provider.clone(),
        services.generation.clone(),
        services.apply.clone(),
        store.clone(),
        events.clone(),
        &config,
    ));

    let merge_queue = Arc::new(MergeQueue::new());
    let cancel = controller.cancel_token();
    // Stops the merge loop on normal completion without cancelling the run
    // token (the deferred gate still needs it live).
    let merge_stop = cancel.child_token();
    let (result_tx, mut result_rx) = mpsc::channel::<StageMsg>(64);

    let merge_task = tokio::spawn(merge_loop(
        engine.clone(),
        merge_queue.clone(),
        controller.clone(),
        merge_stop.clone(),
        result_tx.clone(),
    ));

    let gen_semaphore = Arc::new(Semaphore::new(config.generation_concurrency));
    let review_semaphore = Arc::new(Semaphore::new(config.review_concurrency));

    // Tickets anywhere in the pipeline (generating through merging).
    let mut in_flight: HashSet<String> = HashSet::new();
    // Patches produced but not yet merged: the adaptive-flow buffer.
    let mut buffered: usize = 0;
    // Union of files every accepted merge touched, for the deferred gate.
    let mut run_touched: HashSet<String> = HashSet::new();
    let mut generating: usize = 0;
    let mut cancelled = false;

    loop {
        if controller.wait_if_paused().await == GateOutcome::Cancelled {
            cancelled = true;
            break;
        }

        // Dependency-driven blocked propagation, both directions.
        for change in scheduler.propagate_blocked(&tickets) {
            if let Some(ticket) = tickets.get_mut(&change.ticket_id) {
                ticket.status = change.status;
                ticket.blocked_reason = change.reason.clone();
                if change.status == TicketStatus::Blocked {
                    scheduler.locks_mut().release_for(&ticket.id);
                }
                events.emit(RunEventKind::TicketStatus {
                    ticket_id: ticket.id.clone(),
                    status: ticket.status,
                    progress: None,
                    error: change.reason.clone(),
                    retry_count: None,
                });
            }
        }

        // Fill the generation pool while flow control admits more work.
        {
            let version = store.read().await.current_version();
            let now = Instant::now();
            flow.observe_version(version, now);

            while generating < config.generation_concurrency && flow.admits(buffered, now) {
                let Some(ticket_id) = scheduler.next_buildable(&tickets, &in_flight) else {
                    break;
                };
                let Ok(permit) = gen_semaphore.clone().try_acquire_owned() else {
                    break;
                };

                let ticket = tickets.get_mut(&ticket_id).expect("scheduled ticket exists");
                ticket.status = TicketStatus::Generating;
                ticket.base_version = Some(version);
                events.ticket_status(&ticket_id, TicketStatus::Generating);

                in_flight.insert(ticket_id.clone());
                generating += 1;

                let base = store.read().await.current().clone();
                let worker_ticket = ticket.clone();
                let generator = generator.clone();
                let plan = plan.clone();
                let tx = result_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let start = Instant::now();
                    let result = generator.generate(&worker_ticket, &plan, &base, &cancel).await;
                    tx.send(StageMsg::GenerationDone {
                        ticket_id: worker_ticket.id,
                        result,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    })
                    .await
                    .ok();
                });
            }
        }

        // Nothing running and nothing schedulable: the run has converged.
        if in_flight.is_empty() {
            let buildable_exists = {
                let probe = scheduler.next_buildable(&tickets, &in_flight);
                if let Some(ref id) = probe {
                    // Probe must not hold the lock it just acquired.
                    scheduler.locks_mut().release_for(id);
                }
                probe.is_some()
            };
            if !buildable_exists {
                break;
            }
            continue;
        }

        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            msg = result_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match msg {
            StageMsg::GenerationDone {
                ticket_id,
                result,
                elapsed_ms,
            } => {
                generating -= 1;
                // Lock tenure ends when the generation attempt resolves.
                scheduler.locks_mut().release_for(&ticket_id);

                match result {
                    Ok(patch) => {
                        let ticket = tickets.get_mut(&ticket_id).expect("ticket exists");
                        ticket.generated_code = Some(render_patch_text(&patch));
                        ticket.actual_files = patch.applied_files.clone();
                        events.emit(RunEventKind::TicketArtifacts {
                            ticket_id: ticket_id.clone(),
                            generated_code: ticket.generated_code.clone(),
                            applied_files: Some(patch.applied_files.clone()),
                            created_files: None,
                            modified_files: None,
                            base_version: Some(patch.base_version),
                            durations: StageDurations {
                                generate_ms: Some(elapsed_ms),
                                review_ms: None,
                                merge_ms: None,
                            },
                            review_issues_count: None,
                        });

                        buffered += 1;
                        if config.review_enabled {
                            ticket.status = TicketStatus::PrReview;
                            events.ticket_status(&ticket_id, TicketStatus::PrReview);

                            let worker_ticket = ticket.clone();
                            let review_gate = review_gate.clone();
                            let semaphore = review_semaphore.clone();
                            let tx = result_tx.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                // Waiting for a permit is the review queue.
                                let _permit = semaphore.acquire_owned().await;
                                let start = Instant::now();
                                let result =
                                    review_gate.review_patch(&worker_ticket, patch, &cancel).await;
                                tx.send(StageMsg::ReviewDone {
                                    ticket_id: worker_ticket.id,
                                    result,
                                    elapsed_ms: start.elapsed().as_millis() as u64,
                                })
                                .await
                                .ok();
                            });
                        } else {
                            enqueue_merge(&events, &merge_queue, &mut tickets, &ticket_id, patch);
                        }
                    }
                    Err(MergeError::Service(ServiceError::Cancelled)) => {
                        // Swept up by cancellation cleanup below.
                        in_flight.remove(&ticket_id);
                    }
                    Err(err) => {
                        in_flight.remove(&ticket_id);
                        fail_or_retry_generation(&events, &mut tickets, &ticket_id, err);
                    }
                }
            }

            StageMsg::ReviewDone {
                ticket_id,
                result,
                elapsed_ms,
            } => match result {
                Ok(outcome) => {
                    let ticket = tickets.get_mut(&ticket_id).expect("ticket exists");
                    if !outcome.warnings.is_empty() {
                        ticket.warnings.extend(outcome.warnings.clone());
                        events.emit(RunEventKind::TicketWarnings {
                            ticket_id: ticket_id.clone(),
                            warnings: outcome.warnings.clone(),
                        });
                    }
                    events.emit(RunEventKind::TicketArtifacts {
                        ticket_id: ticket_id.clone(),
                        generated_code: None,
                        applied_files: None,
                        created_files: None,
                        modified_files: None,
                        base_version: None,
                        durations: StageDurations {
                            generate_ms: None,
                            review_ms: Some(elapsed_ms),
                            merge_ms: None,
                        },
                        review_issues_count: Some(outcome.issues_count),
                    });
                    enqueue_merge(&events, &merge_queue, &mut tickets, &ticket_id, outcome.patch);
                }
                Err(_) => {
                    // Only cancellation escapes the soft gate.
                    buffered -= 1;
                    in_flight.remove(&ticket_id);
                }
            },

            StageMsg::MergeDone { ticket_id, outcome } => {
                buffered -= 1;
                in_flight.remove(&ticket_id);
                match outcome {
                    MergeOutcome::Merged {
                        version,
                        created_files,
                        modified_files,
                        gate_attempts: _,
                    } => {
                        flow.observe_version(version, Instant::now());
                        run_touched.extend(created_files.iter().cloned());
                        run_touched.extend(modified_files.iter().cloned());

                        let ticket = tickets.get_mut(&ticket_id).expect("ticket exists");
                        ticket.status = TicketStatus::Done;
                        ticket.created_files = created_files.clone();
                        ticket.modified_files = modified_files.clone();
                        events.emit(RunEventKind::TicketArtifacts {
                            ticket_id: ticket_id.clone(),
                            generated_code: None,
                            applied_files: None,
                            created_files: Some(created_files),
                            modified_files: Some(modified_files),
                            base_version: None,
                            durations: StageDurations::default(),
                            review_issues_count: None,
                        });
                        events.ticket_status(&ticket_id, TicketStatus::Done);
                        events.log_ticket(
                            LogLevel::Info,
                            &ticket_id,
                            format!("merged as snapshot v{}", version),
                        );
                    }
                    MergeOutcome::Requeue { reason } => {
                        let ticket = tickets.get_mut(&ticket_id).expect("ticket exists");
                        ticket.retry_count += 1;
                        ticket.status = TicketStatus::Rebasing;
                        events.emit(RunEventKind::TicketStatus {
                            ticket_id: ticket_id.clone(),
                            status: TicketStatus::Rebasing,
                            progress: None,
                            error: Some(reason),
                            retry_count: Some(ticket.retry_count),
                        });
                    }
                    MergeOutcome::Failed { error } => {
                        let ticket = tickets.get_mut(&ticket_id).expect("ticket exists");
                        ticket.status = TicketStatus::Failed;
                        ticket.error = Some(error.to_string());
                        events.emit(RunEventKind::TicketStatus {
                            ticket_id: ticket_id.clone(),
                            status: TicketStatus::Failed,
                            progress: None,
                            error: Some(error.to_string()),
                            retry_count: Some(ticket.retry_count),
                        });
                    }
                    MergeOutcome::Cancelled => {
                        cancelled = true;
                        break;
                    }
                }
            }
        }
    }

    let cancelled = cancelled || controller.is_cancelled();

    // Stop the merge loop and release anything still queued.
    merge_stop.cancel();
    let drained = merge_queue.drain();
    merge_task.await.ok();

    if cancelled {
        // Every in-progress ticket returns to the backlog so a future run can
        // resume it; locks and queues are cleared.
        for request in drained {
            in_flight.remove(&request.patch.ticket_id);
        }
        for ticket in tickets.values_mut() {
            if ticket.status.is_in_flight() || ticket.status == TicketStatus::Rebasing {
                ticket.status = TicketStatus::Backlog;
                events.ticket_status(&ticket.id, TicketStatus::Backlog);
            }
        }
        scheduler.locks_mut().clear();

        controller.set_status(RunStatus::Cancelled);
        events.emit(RunEventKind::RunCompleted {
            status: RunStatus::Cancelled,
        });
        let final_version = store.read().await.current_version();
        info!(run = %run_id, "run cancelled");
        return Ok(RunSummary {
            run_id,
            status: RunStatus::Cancelled,
            final_version,
            ticket_statuses: tickets.iter().map(|(id, t)| (id.clone(), t.status)).collect(),
            duration: started.elapsed(),
        });
    }

    // Deferred mode: every merge was accepted eagerly; run one bounded gate
    // over the final workspace now.
    let mut run_status = RunStatus::Completed;
    if config.gating_mode == GatingMode::Deferred && !run_touched.is_empty() {
        events.log(LogLevel::Info, "running deferred integration gate");
        let touched: Vec<String> = run_touched.into_iter().collect();
        let mut heal_history = HealHistory::new();
        match engine
            .gate()
            .run_until_pass(
                "final",
                &touched,
                &mut heal_history,
                Some(config.final_gate_attempts),
                &controller.cancel_token(),
            )
            .await
        {
            GateLoopOutcome::Passed { healed_files, .. } => {
                if !healed_files.is_empty() {
                    let mut changed = BTreeMap::new();
                    for path in &healed_files {
                        if let Ok(content) = provider.read_file(path).await {
                            changed.insert(path.clone(), content);
                        }
                    }
                    let version = store.write().await.advance(changed);
                    events.log(
                        LogLevel::Info,
                        format!("deferred gate healing accepted as v{}", version),
                    );
                }
            }
            GateLoopOutcome::Exhausted { attempts, failure } => {
                warn!(run = %run_id, attempts, "deferred gate exhausted");
                events.log(
                    LogLevel::Error,
                    format!("deferred gate failed after {} attempts: {}", attempts, failure),
                );
                run_status = RunStatus::Failed;
            }
            GateLoopOutcome::Cancelled => {
                run_status = RunStatus::Cancelled;
            }
        }
    }

    controller.set_status(run_status);
    events.emit(RunEventKind::RunCompleted { status: run_status });

    let final_version = store.read().await.current_version();
    info!(run = %run_id, status = %run_status, final_version, "run finished");
    Ok(RunSummary {
        run_id,
        status: run_status,
        final_version,
        ticket_statuses: tickets.iter().map(|(id, t)| (id.clone(), t.status)).collect(),
        duration: started.elapsed(),
    })
}

/// The single serialized acceptance loop. Per-ticket merge state (heal
/// history, AI-resolution budget) lives here, across requeues.
async fn merge_loop(
    engine: Arc<MergeEngine>,
    queue: Arc<MergeQueue>,
    controller: Arc<RunController>,
    stop: CancellationToken,
    tx: mpsc::Sender<StageMsg>,
) {
    let cancel = controller.cancel_token();
    let mut states: HashMap<String, TicketMergeState> = HashMap::new();

    while let Some(request) = queue.pop(&stop).await {
        if controller.wait_if_paused().await == GateOutcome::Cancelled {
            break;
        }
        let ticket_id = request.patch.ticket_id.clone();
        let state = states.entry(ticket_id.clone()).or_default();
        let outcome = engine.process(request, state, &cancel).await;
        if tx.send(StageMsg::MergeDone { ticket_id, outcome }).await.is_err() {
            break;
        }
    }
}

fn enqueue_merge(
    events: &EventBus,
    queue: &MergeQueue,
    tickets: &mut BTreeMap<String, Ticket>,
    ticket_id: &str,
    patch: Patch,
) {
    let ticket = tickets.get_mut(ticket_id).expect("ticket exists");
    ticket.status = TicketStatus::MergeQueued;
    events.ticket_status(ticket_id, TicketStatus::MergeQueued);
    queue.push(MergeRequest {
        ticket_title: ticket.title.clone(),
        retry_count: ticket.retry_count,
        patch,
    });
}

/// Generation failures retry through the backlog while the ticket has retry
/// budget left; otherwise the ticket fails.
fn fail_or_retry_generation(
    events: &EventBus,
    tickets: &mut BTreeMap<String, Ticket>,
    ticket_id: &str,
    err: MergeError,
) {
    const MAX_GENERATION_RETRIES: u32 = 3;

    let ticket = tickets.get_mut(ticket_id).expect("ticket exists");
    let recoverable = matches!(
        &err,
        MergeError::Service(service_err) if service_err.is_recoverable()
    );

    if recoverable && ticket.retry_count < MAX_GENERATION_RETRIES {
        ticket.retry_count += 1;
        ticket.status = TicketStatus::Backlog;
        events.emit(RunEventKind::TicketStatus {
            ticket_id: ticket_id.to_string(),
            status: TicketStatus::Backlog,
            progress: None,
            error: Some(err.to_string()),
            retry_count: Some(ticket.retry_count),
        });
    } else {
        ticket.status = TicketStatus::Failed;
        ticket.error = Some(err.to_string());
        events.emit(RunEventKind::TicketStatus {
            ticket_id: ticket_id.to_string(),
            status: TicketStatus::Failed,
            progress: None,
            error: Some(err.to_string()),
            retry_count: Some(ticket.retry_count),
        });
    }
}

/// Render a patch back to the text-block form observers expect in
/// `generated_code`.
fn render_patch_text(patch: &Patch) -> String {
    patch
        .files
        .iter()
        .map(|(path, content)| format!("<file path=\"{}\">\n{}\n</file>", path, content))
        .collect::<Vec<_>>()
        .join("\n")
}
