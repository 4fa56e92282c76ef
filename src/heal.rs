//! Heal records: per-ticket failure history used to steer retry prompts.
//!
//! Failure text is fingerprinted with hashes and numbers stripped, so the
//! heal loop can recognize "same failure again" and vary its approach instead
//! of repeating a fix verbatim.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How many heal records are retained per ticket.
const HISTORY_CAP: usize = 20;

/// Pipeline stage where a healed failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStage {
    PrReview,
    MergeConflict,
    MergeApply,
    IntegrationGate,
    Build,
}

impl HealStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrReview => "pr_review",
            Self::MergeConflict => "merge_conflict",
            Self::MergeApply => "merge_apply",
            Self::IntegrationGate => "integration_gate",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for HealStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pr_review" => Ok(Self::PrReview),
            "merge_conflict" => Ok(Self::MergeConflict),
            "merge_apply" => Ok(Self::MergeApply),
            "integration_gate" => Ok(Self::IntegrationGate),
            "build" => Ok(Self::Build),
            _ => Err(format!("Invalid heal stage: {}", s)),
        }
    }
}

/// One logged failure plus the attempt context it occurred in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealRecord {
    pub stage: HealStage,
    pub attempt: u32,
    pub fingerprint: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Bounded rolling history of heal records for one ticket.
#[derive(Debug, Clone, Default)]
pub struct HealHistory {
    records: VecDeque<HealRecord>,
}

impl HealHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, stage: HealStage, attempt: u32, message: &str) -> &HealRecord {
        if self.records.len() == HISTORY_CAP {
            self.records.pop_front();
        }
        self.records.push_back(HealRecord {
            stage,
            attempt,
            fingerprint: fingerprint(message),
            message: message.to_string(),
            at: Utc::now(),
        });
        self.records.back().expect("just pushed")
    }

    /// Whether the same normalized failure has been seen before at this stage.
    pub fn has_seen(&self, stage: HealStage, message: &str) -> bool {
        let fp = fingerprint(message);
        self.records
            .iter()
            .any(|r| r.stage == stage && r.fingerprint == fp)
    }

    pub fn records(&self) -> impl Iterator<Item = &HealRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render the history for inclusion in a retry prompt: one line per
    /// record, newest last.
    pub fn summarize(&self, limit: usize) -> String {
        let skip = self.records.len().saturating_sub(limit);
        self.records
            .iter()
            .skip(skip)
            .map(|r| {
                let mut message = r.message.replace('\n', " ");
                if message.len() > 200 {
                    message.truncate(message.floor_char_boundary(200));
                }
                format!("[{} attempt {}] {}", r.stage, r.attempt, message)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

static HEX_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{7,}\b").unwrap());
static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static WS_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalized digest of failure text: hex hashes and numbers collapse to
/// placeholders so rebuilt artifacts and shifting line numbers produce the
/// same fingerprint.
pub fn fingerprint(text: &str) -> String {
    let normalized = HEX_RUN.replace_all(text, "#");
    let normalized = DIGIT_RUN.replace_all(&normalized, "N");
    let normalized = WS_RUN.replace_all(&normalized, " ");
    let digest = Sha256::digest(normalized.trim().to_lowercase().as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_line_numbers() {
        let a = fingerprint("TypeError at src/App.tsx:12:3");
        let b = fingerprint("TypeError at src/App.tsx:47:19");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_ignores_build_hashes() {
        let a = fingerprint("chunk main.a1b2c3d4e5f6.js failed");
        let b = fingerprint("chunk main.ffe9d8c7b6a5.js failed");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_real_differences() {
        let a = fingerprint("Cannot find module './Button'");
        let b = fingerprint("Cannot find module './Card'");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_collapses_whitespace() {
        assert_eq!(fingerprint("error  here"), fingerprint("error\n\there"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = HealHistory::new();
        for i in 0..(HISTORY_CAP + 5) {
            history.record(HealStage::Build, i as u32, &format!("failure {}", i));
        }
        assert_eq!(history.len(), HISTORY_CAP);
        // Oldest entries dropped
        assert_eq!(history.records().next().unwrap().attempt, 5);
    }

    #[test]
    fn test_has_seen_matches_stage_and_fingerprint() {
        let mut history = HealHistory::new();
        history.record(HealStage::IntegrationGate, 1, "Module not found: ./x at line 10");
        assert!(history.has_seen(HealStage::IntegrationGate, "Module not found: ./x at line 99"));
        assert!(!history.has_seen(HealStage::Build, "Module not found: ./x at line 10"));
        assert!(!history.has_seen(HealStage::IntegrationGate, "totally different"));
    }

    #[test]
    fn test_summarize_limits_and_flattens() {
        let mut history = HealHistory::new();
        history.record(HealStage::Build, 1, "first\nfailure");
        history.record(HealStage::Build, 2, "second failure");
        let summary = history.summarize(1);
        assert!(summary.contains("second failure"));
        assert!(!summary.contains("first"));
        assert!(!summary.contains('\n'));
    }

    #[test]
    fn test_heal_stage_roundtrip() {
        for s in &["pr_review", "merge_conflict", "merge_apply", "integration_gate", "build"] {
            let parsed: HealStage = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<HealStage>().is_err());
    }
}
