//! Runtime configuration for a build run.
//!
//! Resolution order: built-in defaults, then `crucible.toml`, then
//! `CRUCIBLE_*` environment variables, then CLI flags. Every concurrency and
//! timeout knob is clamped to a sane range at resolution time.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Requested generation concurrency before the hard cap is applied.
const DEFAULT_GENERATION_TARGET: usize = 10;
/// Hard cap protecting the serialized merge stage downstream.
const GENERATION_HARD_CAP: usize = 6;
/// Review pool never exceeds this, nor the generation pool size.
const REVIEW_HARD_CAP: usize = 2;

/// When every merge must pass the gate, or all merges are accepted and one
/// bounded gate runs at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GatingMode {
    #[default]
    Online,
    Deferred,
}

impl std::fmt::Display for GatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Deferred => f.write_str("deferred"),
        }
    }
}

/// Fully resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct CrucibleConfig {
    /// Effective generation pool size (after the hard cap).
    pub generation_concurrency: usize,
    /// Effective review pool size.
    pub review_concurrency: usize,
    /// Whether the review gate runs at all.
    pub review_enabled: bool,
    /// Base cap on buffered-but-unmerged patches.
    pub buffer_cap: usize,
    /// Ceiling the cap may be raised to while the merge stage stalls.
    pub buffer_ceiling: usize,
    /// No version advance for this long (with work queued) counts as a stall.
    pub stall_window: Duration,
    pub gating_mode: GatingMode,
    /// Attempt budget for the deferred-mode final gate.
    pub final_gate_attempts: u32,
    pub generate_timeout: Duration,
    pub apply_timeout: Duration,
    pub review_timeout: Duration,
    pub build_timeout: Duration,
    pub console_check_timeout: Duration,
    /// Shell command that must succeed for the gate to pass.
    pub build_command: String,
    /// Optional runtime console check; unavailable is ignored, explicit
    /// failure is fatal to the gate.
    pub console_check_command: Option<String>,
    /// Model identifier forwarded to the generation service.
    pub model: Option<String>,
    /// Base URL of the generation/apply/review services.
    pub services_base_url: String,
    /// Event bus channel capacity.
    pub event_capacity: usize,
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            generation_concurrency: DEFAULT_GENERATION_TARGET.min(GENERATION_HARD_CAP),
            review_concurrency: REVIEW_HARD_CAP,
            review_enabled: true,
            buffer_cap: 8,
            buffer_ceiling: 16,
            stall_window: Duration::from_secs(90),
            gating_mode: GatingMode::Online,
            final_gate_attempts: 3,
            generate_timeout: Duration::from_secs(300),
            apply_timeout: Duration::from_secs(120),
            review_timeout: Duration::from_secs(90),
            build_timeout: Duration::from_secs(600),
            console_check_timeout: Duration::from_secs(30),
            build_command: "npm run build".to_string(),
            console_check_command: None,
            model: None,
            services_base_url: "http://localhost:4000".to_string(),
            event_capacity: 1024,
        }
    }
}

/// Raw TOML structure for `crucible.toml`.
#[derive(Debug, Default, Deserialize)]
struct CrucibleToml {
    run: Option<RunSection>,
    timeouts: Option<TimeoutSection>,
    services: Option<ServiceSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RunSection {
    generation_concurrency: Option<usize>,
    review_enabled: Option<bool>,
    buffer_cap: Option<usize>,
    buffer_ceiling: Option<usize>,
    stall_window_secs: Option<u64>,
    gating_mode: Option<GatingMode>,
    final_gate_attempts: Option<u32>,
    build_command: Option<String>,
    console_check_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutSection {
    generate_secs: Option<u64>,
    apply_secs: Option<u64>,
    review_secs: Option<u64>,
    build_secs: Option<u64>,
    console_check_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSection {
    base_url: Option<String>,
    model: Option<String>,
}

impl CrucibleConfig {
    /// Load configuration from `crucible.toml` in the project directory (if
    /// present), then apply environment overrides and clamp.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join("crucible.toml");
        let toml_config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            CrucibleToml::default()
        };

        let mut config = Self::default();
        config.apply_toml(toml_config);
        config.apply_env(&std::env::vars().collect());
        Ok(config.clamped())
    }

    fn apply_toml(&mut self, toml: CrucibleToml) {
        if let Some(run) = toml.run {
            if let Some(v) = run.generation_concurrency {
                self.generation_concurrency = v;
            }
            if let Some(v) = run.review_enabled {
                self.review_enabled = v;
            }
            if let Some(v) = run.buffer_cap {
                self.buffer_cap = v;
            }
            if let Some(v) = run.buffer_ceiling {
                self.buffer_ceiling = v;
            }
            if let Some(v) = run.stall_window_secs {
                self.stall_window = Duration::from_secs(v);
            }
            if let Some(v) = run.gating_mode {
                self.gating_mode = v;
            }
            if let Some(v) = run.final_gate_attempts {
                self.final_gate_attempts = v;
            }
            if let Some(v) = run.build_command {
                self.build_command = v;
            }
            if let Some(v) = run.console_check_command {
                self.console_check_command = Some(v);
            }
        }
        if let Some(timeouts) = toml.timeouts {
            if let Some(v) = timeouts.generate_secs {
                self.generate_timeout = Duration::from_secs(v);
            }
            if let Some(v) = timeouts.apply_secs {
                self.apply_timeout = Duration::from_secs(v);
            }
            if let Some(v) = timeouts.review_secs {
                self.review_timeout = Duration::from_secs(v);
            }
            if let Some(v) = timeouts.build_secs {
                self.build_timeout = Duration::from_secs(v);
            }
            if let Some(v) = timeouts.console_check_secs {
                self.console_check_timeout = Duration::from_secs(v);
            }
        }
        if let Some(services) = toml.services {
            if let Some(v) = services.base_url {
                self.services_base_url = v;
            }
            if let Some(v) = services.model {
                self.model = Some(v);
            }
        }
    }

    /// Environment overrides, exposed for tests with an explicit map.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) {
        if let Some(v) = vars.get("CRUCIBLE_GENERATION_CONCURRENCY")
            && let Ok(n) = v.parse()
        {
            self.generation_concurrency = n;
        }
        if let Some(v) = vars.get("CRUCIBLE_GATING_MODE") {
            match v.as_str() {
                "online" => self.gating_mode = GatingMode::Online,
                "deferred" => self.gating_mode = GatingMode::Deferred,
                _ => {}
            }
        }
        if let Some(v) = vars.get("CRUCIBLE_SERVICES_URL") {
            self.services_base_url = v.clone();
        }
        if let Some(v) = vars.get("CRUCIBLE_MODEL") {
            self.model = Some(v.clone());
        }
        if let Some(v) = vars.get("CRUCIBLE_BUILD_COMMAND") {
            self.build_command = v.clone();
        }
    }

    /// Clamp every knob into its sane range. Applied once after resolution.
    pub fn clamped(mut self) -> Self {
        self.generation_concurrency = self.generation_concurrency.clamp(1, GENERATION_HARD_CAP);
        self.review_concurrency = self
            .review_concurrency
            .clamp(1, REVIEW_HARD_CAP)
            .min(self.generation_concurrency);
        self.buffer_cap = self.buffer_cap.clamp(1, 64);
        self.buffer_ceiling = self.buffer_ceiling.clamp(self.buffer_cap, 64);
        self.stall_window = clamp_duration(self.stall_window, 10, 600);
        self.final_gate_attempts = self.final_gate_attempts.clamp(1, 10);
        self.generate_timeout = clamp_duration(self.generate_timeout, 30, 1800);
        self.apply_timeout = clamp_duration(self.apply_timeout, 10, 600);
        self.review_timeout = clamp_duration(self.review_timeout, 10, 600);
        self.build_timeout = clamp_duration(self.build_timeout, 30, 3600);
        self.console_check_timeout = clamp_duration(self.console_check_timeout, 5, 300);
        self
    }

    pub fn with_generation_concurrency(mut self, requested: usize) -> Self {
        self.generation_concurrency = requested;
        self.clamped()
    }

    pub fn with_gating_mode(mut self, mode: GatingMode) -> Self {
        self.gating_mode = mode;
        self
    }

    pub fn with_review_enabled(mut self, enabled: bool) -> Self {
        self.review_enabled = enabled;
        self
    }

    pub fn with_build_command(mut self, command: &str) -> Self {
        self.build_command = command.to_string();
        self
    }
}

fn clamp_duration(value: Duration, min_secs: u64, max_secs: u64) -> Duration {
    Duration::from_secs(value.as_secs().clamp(min_secs, max_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_respect_hard_caps() {
        let config = CrucibleConfig::default();
        assert_eq!(config.generation_concurrency, 6);
        assert_eq!(config.review_concurrency, 2);
        assert_eq!(config.gating_mode, GatingMode::Online);
    }

    #[test]
    fn test_requested_concurrency_is_capped() {
        let config = CrucibleConfig::default().with_generation_concurrency(32);
        assert_eq!(config.generation_concurrency, 6);

        let config = CrucibleConfig::default().with_generation_concurrency(0);
        assert_eq!(config.generation_concurrency, 1);
    }

    #[test]
    fn test_review_pool_never_exceeds_generation_pool() {
        let config = CrucibleConfig::default().with_generation_concurrency(1);
        assert_eq!(config.review_concurrency, 1);
    }

    #[test]
    fn test_timeouts_are_clamped() {
        let mut config = CrucibleConfig::default();
        config.generate_timeout = Duration::from_secs(1);
        config.build_timeout = Duration::from_secs(999_999);
        let config = config.clamped();
        assert_eq!(config.generate_timeout, Duration::from_secs(30));
        assert_eq!(config.build_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_buffer_ceiling_at_least_cap() {
        let mut config = CrucibleConfig::default();
        config.buffer_cap = 12;
        config.buffer_ceiling = 4;
        let config = config.clamped();
        assert!(config.buffer_ceiling >= config.buffer_cap);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("crucible.toml"),
            r#"
[run]
generation_concurrency = 3
gating_mode = "deferred"
build_command = "pnpm build"

[timeouts]
build_secs = 120

[services]
base_url = "http://svc:9999"
model = "sonnet"
"#,
        )
        .unwrap();

        let config = CrucibleConfig::load(dir.path()).unwrap();
        assert_eq!(config.generation_concurrency, 3);
        assert_eq!(config.gating_mode, GatingMode::Deferred);
        assert_eq!(config.build_command, "pnpm build");
        assert_eq!(config.build_timeout, Duration::from_secs(120));
        assert_eq!(config.services_base_url, "http://svc:9999");
        assert_eq!(config.model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_missing_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = CrucibleConfig::load(dir.path()).unwrap();
        assert_eq!(config.generation_concurrency, 6);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CrucibleConfig::default();
        let vars: HashMap<String, String> = [
            ("CRUCIBLE_GENERATION_CONCURRENCY".to_string(), "2".to_string()),
            ("CRUCIBLE_GATING_MODE".to_string(), "deferred".to_string()),
        ]
        .into_iter()
        .collect();
        config.apply_env(&vars);
        let config = config.clamped();
        assert_eq!(config.generation_concurrency, 2);
        assert_eq!(config.gating_mode, GatingMode::Deferred);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("crucible.toml"), "not toml {{{").unwrap();
        assert!(CrucibleConfig::load(dir.path()).is_err());
    }
}
