//! Build plan: the planner's output consumed by the orchestrator.
//!
//! A plan carries the project blueprint, the style guide, the data mode, and
//! the ticket list. Validation rejects unknown dependency ids and dependency
//! cycles before a run starts.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::RunError;
use crate::ticket::Ticket;

/// How database-backed features are treated during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    /// Databases are mocked; an `awaiting_input` database dependency is
    /// treated as satisfied for its dependents.
    #[default]
    Mocked,
    /// Databases are real; unfinished database dependencies block.
    Live,
}

/// A build plan produced by the external planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Project blueprint fed into every generation prompt.
    #[serde(default)]
    pub blueprint: String,
    /// Style guide fed into every generation prompt.
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub data_mode: DataMode,
    pub tickets: Vec<Ticket>,
}

impl Plan {
    /// Load and validate a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file {}", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject duplicate ticket ids, unknown dependencies, and dependency cycles.
    pub fn validate(&self) -> Result<(), RunError> {
        let mut ids = HashSet::new();
        for ticket in &self.tickets {
            if !ids.insert(ticket.id.as_str()) {
                return Err(RunError::InvalidPlan(format!(
                    "duplicate ticket id {}",
                    ticket.id
                )));
            }
        }
        for ticket in &self.tickets {
            for dep in &ticket.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(RunError::InvalidPlan(format!(
                        "ticket {} depends on unknown ticket {}",
                        ticket.id, dep
                    )));
                }
            }
        }
        self.check_cycles()?;
        Ok(())
    }

    fn check_cycles(&self) -> Result<(), RunError> {
        let deps: HashMap<&str, &Vec<String>> = self
            .tickets
            .iter()
            .map(|t| (t.id.as_str(), &t.dependencies))
            .collect();

        // Iterative DFS with a three-color marking.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in deps.keys().copied() {
            if marks.contains_key(start) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::InProgress);
            while let Some((node, next_child)) = stack.pop() {
                let children = deps.get(node).copied().map(|v| v.as_slice()).unwrap_or(&[]);
                if next_child < children.len() {
                    stack.push((node, next_child + 1));
                    let child = children[next_child].as_str();
                    match marks.get(child) {
                        Some(Mark::InProgress) => {
                            return Err(RunError::InvalidPlan(format!(
                                "dependency cycle involving tickets {} and {}",
                                node, child
                            )));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::InProgress);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    marks.insert(node, Mark::Done);
                }
            }
        }
        Ok(())
    }

    /// Dependency levels: tickets in level N only depend on tickets in earlier
    /// levels. Used by `validate` reporting, not by scheduling.
    pub fn dependency_levels(&self) -> Vec<Vec<String>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut levels = Vec::new();
        loop {
            let mut level: Vec<String> = self
                .tickets
                .iter()
                .filter(|t| {
                    !placed.contains(t.id.as_str())
                        && t.dependencies.iter().all(|d| placed.contains(d.as_str()))
                })
                .map(|t| t.id.clone())
                .collect();
            if level.is_empty() {
                break;
            }
            level.sort();
            for id in &level {
                // Re-borrow from tickets to get a 'plan-lifetime str
                if let Some(t) = self.tickets.iter().find(|t| &t.id == id) {
                    placed.insert(t.id.as_str());
                }
            }
            levels.push(level);
        }
        levels
    }
}
