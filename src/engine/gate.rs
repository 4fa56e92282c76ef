//! Integration gate: build + runtime check with targeted auto-healing.
//!
//! The gate is the hard backstop behind the soft review gate. A failed gate
//! extracts candidate file paths from the error text, asks the generation
//! service for a minimal fix to exactly those files, applies it, and retries.
//! In online mode the loop never gives up on its own; only cancellation stops
//! it. Deferred mode runs one bounded gate at the end of the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CrucibleConfig;
use crate::heal::{HealHistory, HealStage};
use crate::patch::extract_file_blocks;
use crate::retry::{backoff_delay, sleep_cancellable};
use crate::sandbox::{WorkspaceProvider, is_dependency_path};
use crate::services::{GenerationRequest, GenerationService};

/// Delay base between gate attempts.
const HEAL_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Outcome of a single gate check.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub passed: bool,
    pub failure: Option<String>,
}

impl GateReport {
    fn pass() -> Self {
        Self {
            passed: true,
            failure: None,
        }
    }

    fn fail(message: String) -> Self {
        Self {
            passed: false,
            failure: Some(message),
        }
    }
}

/// Terminal outcome of the gate loop.
#[derive(Debug)]
pub enum GateLoopOutcome {
    /// The gate passed. Carries every file path touched by healing.
    Passed { healed_files: Vec<String>, attempts: u32 },
    /// The run was cancelled mid-loop.
    Cancelled,
    /// Bounded mode only: the attempt budget ran out.
    Exhausted { attempts: u32, failure: String },
}

pub struct IntegrationGate {
    provider: Arc<dyn WorkspaceProvider>,
    generation: Arc<dyn GenerationService>,
    build_command: String,
    console_check_command: Option<String>,
    build_timeout: Duration,
    console_check_timeout: Duration,
    model: Option<String>,
}

impl IntegrationGate {
    pub fn new(
        provider: Arc<dyn WorkspaceProvider>,
        generation: Arc<dyn GenerationService>,
        config: &CrucibleConfig,
    ) -> Self {
        Self {
            provider,
            generation,
            build_command: config.build_command.clone(),
            console_check_command: config.console_check_command.clone(),
            build_timeout: config.build_timeout,
            console_check_timeout: config.console_check_timeout,
            model: config.model.clone(),
        }
    }

    /// One gate check: the build must succeed, then the best-effort runtime
    /// console check must not report errors. The console check being unable
    /// to run at all is ignored; an explicit failure result is fatal.
    pub async fn check(&self) -> GateReport {
        let build = tokio::time::timeout(
            self.build_timeout,
            self.provider.run_command(&self.build_command),
        )
        .await;

        match build {
            Err(_) => {
                return GateReport::fail(format!(
                    "build timed out after {}s",
                    self.build_timeout.as_secs()
                ));
            }
            Ok(Err(err)) => return GateReport::fail(format!("build could not run: {:#}", err)),
            Ok(Ok(output)) if !output.success => {
                return GateReport::fail(output.combined());
            }
            Ok(Ok(_)) => {}
        }

        if let Some(ref command) = self.console_check_command {
            match tokio::time::timeout(self.console_check_timeout, self.provider.run_command(command))
                .await
            {
                Ok(Ok(output)) if !output.success => {
                    return GateReport::fail(format!("runtime check reported errors: {}", output.combined()));
                }
                Ok(Ok(_)) => {}
                // Endpoint unavailable or timed out: best effort, ignored.
                Ok(Err(err)) => debug!(error = %err, "console check unavailable; ignoring"),
                Err(_) => debug!("console check timed out; ignoring"),
            }
        }

        GateReport::pass()
    }

    /// Run the gate until it passes. `max_attempts` of `None` is the online
    /// mode: a truly unbounded loop that only cancellation exits.
    pub async fn run_until_pass(
        &self,
        ticket_id: &str,
        touched_files: &[String],
        heal_history: &mut HealHistory,
        max_attempts: Option<u32>,
        cancel: &CancellationToken,
    ) -> GateLoopOutcome {
        let mut healed_files: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return GateLoopOutcome::Cancelled;
            }

            let report = self.check().await;
            if report.passed {
                info!(ticket = ticket_id, attempt, "integration gate passed");
                return GateLoopOutcome::Passed {
                    healed_files,
                    attempts: attempt,
                };
            }

            let failure = report.failure.unwrap_or_else(|| "unknown gate failure".to_string());
            warn!(ticket = ticket_id, attempt, "integration gate failed");

            if let Some(budget) = max_attempts
                && attempt >= budget
            {
                return GateLoopOutcome::Exhausted {
                    attempts: attempt,
                    failure,
                };
            }

            let seen_before = heal_history.has_seen(HealStage::IntegrationGate, &failure);
            heal_history.record(HealStage::IntegrationGate, attempt, &failure);

            match self
                .heal(ticket_id, &failure, touched_files, heal_history, seen_before, cancel)
                .await
            {
                Ok(written) => {
                    for path in written {
                        if !healed_files.contains(&path) {
                            healed_files.push(path);
                        }
                    }
                }
                Err(err) => {
                    warn!(ticket = ticket_id, attempt, error = %err, "heal attempt failed");
                }
            }

            if !sleep_cancellable(backoff_delay(HEAL_BACKOFF_BASE, attempt.min(5)), cancel).await {
                return GateLoopOutcome::Cancelled;
            }
        }
    }

    /// One targeted heal: read the candidate files, ask for a minimal fix,
    /// write whatever comes back.
    async fn heal(
        &self,
        ticket_id: &str,
        failure: &str,
        touched_files: &[String],
        heal_history: &HealHistory,
        seen_before: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<String>> {
        let mut candidates = extract_candidate_paths(failure);
        if candidates.is_empty() {
            candidates = touched_files.to_vec();
        }

        let mut current: BTreeMap<String, String> = BTreeMap::new();
        for path in &candidates {
            if let Ok(content) = self.provider.read_file(path).await {
                current.insert(path.clone(), content);
            }
        }

        let prompt = build_heal_prompt(failure, &current, heal_history, seen_before);
        let request = GenerationRequest {
            prompt,
            model: self.model.clone(),
            sandbox_id: None,
            is_edit: true,
            build_profile: None,
        };
        let response = self.generation.generate(request, cancel).await?;
        let fixes = extract_file_blocks(&response);

        let mut written = Vec::new();
        for (path, content) in fixes {
            self.provider.write_file(&path, &content).await?;
            debug!(ticket = ticket_id, path = %path, "applied heal fix");
            written.push(path);
        }
        Ok(written)
    }
}

static CANDIDATE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9_@][A-Za-z0-9_@./-]*\.(?:tsx|ts|jsx|js|css|json)").unwrap()
});

/// Candidate file paths mentioned in gate failure text: project-relative
/// source paths, dependency directories excluded.
pub fn extract_candidate_paths(failure: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for m in CANDIDATE_PATH.find_iter(failure) {
        let path = m.as_str().trim_start_matches("./").to_string();
        if is_dependency_path(&path) {
            continue;
        }
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

fn build_heal_prompt(
    failure: &str,
    current_files: &BTreeMap<String, String>,
    heal_history: &HealHistory,
    seen_before: bool,
) -> String {
    let mut prompt = String::from(
        "The integration build for this workspace is failing. Produce the minimal \
         fix, touching only the files below.\n\n## Failure\n\n",
    );
    prompt.push_str(failure);
    prompt.push_str("\n\n");

    if seen_before {
        prompt.push_str(
            "This exact failure has been seen before and the previous fix did not \
             hold. Take a different approach this time.\n\n",
        );
    }
    if !heal_history.is_empty() {
        prompt.push_str("## Previous fix attempts\n\n");
        prompt.push_str(&heal_history.summarize(5));
        prompt.push_str("\n\n");
    }

    prompt.push_str("## Current files\n\n");
    for (path, content) in current_files {
        prompt.push_str(&format!("<file path=\"{}\">\n{}\n</file>\n", path, content));
    }
    prompt.push_str(
        "\nReturn only the files you change, as complete `<file path=\"...\">` blocks.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CommandOutput, SandboxInfo};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_extract_paths_from_compiler_output() {
        let failure = "ERROR in ./src/App.tsx:12:3\nModule not found";
        assert_eq!(extract_candidate_paths(failure), vec!["src/App.tsx"]);
    }

    #[test]
    fn test_extract_excludes_dependency_dirs() {
        let failure = "error in node_modules/react/index.js and src/pages/Home.jsx";
        assert_eq!(extract_candidate_paths(failure), vec!["src/pages/Home.jsx"]);
    }

    #[test]
    fn test_extract_dedupes_and_keeps_order() {
        let failure = "src/a.css broke src/b.json then src/a.css again";
        assert_eq!(extract_candidate_paths(failure), vec!["src/a.css", "src/b.json"]);
    }

    #[test]
    fn test_extract_nothing_from_generic_text() {
        assert!(extract_candidate_paths("segmentation fault").is_empty());
    }

    /// Workspace double: scripted command results, in-memory files.
    struct FakeWorkspace {
        files: Mutex<BTreeMap<String, String>>,
        command_results: Mutex<Vec<anyhow::Result<CommandOutput>>>,
    }

    impl FakeWorkspace {
        fn new(command_results: Vec<anyhow::Result<CommandOutput>>) -> Self {
            Self {
                files: Mutex::new(BTreeMap::new()),
                command_results: Mutex::new(command_results),
            }
        }
    }

    fn ok_output() -> anyhow::Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
        })
    }

    fn fail_output(stderr: &str) -> anyhow::Result<CommandOutput> {
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
            success: false,
        })
    }

    #[async_trait]
    impl WorkspaceProvider for FakeWorkspace {
        async fn list_files(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.files.lock().unwrap().keys().cloned().collect())
        }
        async fn read_file(&self, path: &str) -> anyhow::Result<String> {
            self.files
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such file: {}", path))
        }
        async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_string());
            Ok(())
        }
        async fn delete_path(&self, path: &str) -> anyhow::Result<()> {
            self.files.lock().unwrap().remove(path);
            Ok(())
        }
        async fn run_command(&self, _command: &str) -> anyhow::Result<CommandOutput> {
            let mut results = self.command_results.lock().unwrap();
            if results.is_empty() {
                ok_output()
            } else {
                results.remove(0)
            }
        }
        async fn install_packages(&self, _packages: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn sandbox_info(&self) -> anyhow::Result<SandboxInfo> {
            Ok(SandboxInfo {
                sandbox_id: "fake".to_string(),
                preview_url: None,
            })
        }
    }

    struct ScriptedGeneration {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationService for ScriptedGeneration {
        async fn generate(
            &self,
            _request: GenerationRequest,
            _cancel: &CancellationToken,
        ) -> Result<String, crate::errors::ServiceError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn gate_with(
        command_results: Vec<anyhow::Result<CommandOutput>>,
        fixes: Vec<&str>,
    ) -> (IntegrationGate, Arc<FakeWorkspace>) {
        let provider = Arc::new(FakeWorkspace::new(command_results));
        let generation = Arc::new(ScriptedGeneration {
            responses: Mutex::new(fixes.into_iter().map(String::from).collect()),
        });
        let config = CrucibleConfig::default();
        (
            IntegrationGate::new(provider.clone(), generation, &config),
            provider,
        )
    }

    #[tokio::test]
    async fn test_passing_build_passes_gate() {
        let (gate, _) = gate_with(vec![ok_output()], vec![]);
        let report = gate.check().await;
        assert!(report.passed);
    }

    #[tokio::test]
    async fn test_failing_build_fails_gate() {
        let (gate, _) = gate_with(vec![fail_output("Type error in src/App.tsx:3:1")], vec![]);
        let report = gate.check().await;
        assert!(!report.passed);
        assert!(report.failure.unwrap().contains("src/App.tsx"));
    }

    #[tokio::test]
    async fn test_console_check_unavailable_is_ignored() {
        let (mut gate, _) = gate_with(
            vec![ok_output(), Err(anyhow::anyhow!("endpoint unreachable"))],
            vec![],
        );
        gate.console_check_command = Some("check-console".to_string());
        let report = gate.check().await;
        assert!(report.passed);
    }

    #[tokio::test]
    async fn test_console_check_explicit_failure_is_fatal() {
        let (mut gate, _) = gate_with(
            vec![ok_output(), fail_output("ReferenceError: x is not defined")],
            vec![],
        );
        gate.console_check_command = Some("check-console".to_string());
        let report = gate.check().await;
        assert!(!report.passed);
        assert!(report.failure.unwrap().contains("ReferenceError"));
    }

    #[tokio::test]
    async fn test_heal_loop_fixes_and_passes() {
        let (gate, provider) = gate_with(
            vec![fail_output("Unexpected token in src/App.tsx:1:1"), ok_output()],
            vec!["<file path=\"src/App.tsx\">fixed</file>"],
        );
        provider.write_file("src/App.tsx", "broken").await.unwrap();

        let mut history = HealHistory::new();
        let outcome = gate
            .run_until_pass("t-1", &[], &mut history, None, &CancellationToken::new())
            .await;

        match outcome {
            GateLoopOutcome::Passed { healed_files, attempts } => {
                assert_eq!(healed_files, vec!["src/App.tsx"]);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(provider.read_file("src/App.tsx").await.unwrap(), "fixed");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_gate_exhausts() {
        let (gate, _) = gate_with(
            vec![
                fail_output("broken in src/a.ts"),
                fail_output("still broken in src/a.ts"),
            ],
            vec!["", ""],
        );
        let mut history = HealHistory::new();
        let outcome = gate
            .run_until_pass("t-1", &[], &mut history, Some(2), &CancellationToken::new())
            .await;

        match outcome {
            GateLoopOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_unbounded_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (gate, _) = gate_with(vec![fail_output("broken")], vec![]);
        let mut history = HealHistory::new();
        let outcome = gate
            .run_until_pass("t-1", &[], &mut history, None, &cancel)
            .await;
        assert!(matches!(outcome, GateLoopOutcome::Cancelled));
    }

    #[test]
    fn test_heal_prompt_flags_repeat_failures() {
        let mut history = HealHistory::new();
        history.record(HealStage::IntegrationGate, 1, "broken thing");
        let prompt = build_heal_prompt("broken thing", &BTreeMap::new(), &history, true);
        assert!(prompt.contains("different approach"));
        assert!(prompt.contains("Previous fix attempts"));
    }
}
