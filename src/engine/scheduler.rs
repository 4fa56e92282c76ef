//! Ticket scheduler: buildable selection, contention locks, blocked
//! propagation.
//!
//! The scheduler never runs work itself; the dispatch loop asks it which
//! ticket may generate next given dependency state and the contention-lock
//! table. Contention skips are deferrals, not failures: the ticket stays in
//! the backlog and is reconsidered on the next pass.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::plan::DataMode;
use crate::ticket::{ContentionGroup, Ticket, TicketStatus, TicketType};

/// Lock manager keyed by contention group. A group is held by at most one
/// ticket at a time; acquisition is re-entrant for the holder.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<ContentionGroup, String>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&mut self, group: &ContentionGroup, ticket_id: &str) -> bool {
        match self.locks.get(group) {
            Some(holder) => holder == ticket_id,
            None => {
                self.locks.insert(group.clone(), ticket_id.to_string());
                true
            }
        }
    }

    pub fn holder(&self, group: &ContentionGroup) -> Option<&str> {
        self.locks.get(group).map(String::as_str)
    }

    pub fn release_for(&mut self, ticket_id: &str) {
        self.locks.retain(|_, holder| holder != ticket_id);
    }

    pub fn clear(&mut self) {
        self.locks.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// A status change the scheduler wants applied, so the caller can mutate the
/// ticket and emit the matching event in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub ticket_id: String,
    pub status: TicketStatus,
    pub reason: Option<String>,
}

/// Scheduling policy for one run.
#[derive(Debug)]
pub struct Scheduler {
    locks: LockTable,
    data_mode: DataMode,
}

impl Scheduler {
    pub fn new(data_mode: DataMode) -> Self {
        Self {
            locks: LockTable::new(),
            data_mode,
        }
    }

    pub fn locks_mut(&mut self) -> &mut LockTable {
        &mut self.locks
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Pick the next ticket eligible for generation and acquire its
    /// contention lock. Ascending `order` (then id) wins; contention-held
    /// tickets are skipped, not blocked.
    pub fn next_buildable(
        &mut self,
        tickets: &BTreeMap<String, Ticket>,
        in_flight: &HashSet<String>,
    ) -> Option<String> {
        let mut candidates: Vec<&Ticket> = tickets
            .values()
            .filter(|t| t.is_buildable_status() && !in_flight.contains(&t.id))
            .filter(|t| self.dependencies_satisfied(tickets, t))
            .collect();
        candidates.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        for ticket in candidates {
            match ticket.contention_group() {
                Some(group) => {
                    if self.locks.try_acquire(&group, &ticket.id) {
                        return Some(ticket.id.clone());
                    }
                    // Held by someone else: defer to the next pass.
                }
                None => return Some(ticket.id.clone()),
            }
        }
        None
    }

    /// Every dependency is done/skipped, or optional under the data mode.
    pub fn dependencies_satisfied(&self, tickets: &BTreeMap<String, Ticket>, ticket: &Ticket) -> bool {
        ticket.dependencies.iter().all(|dep_id| {
            tickets
                .get(dep_id)
                .is_some_and(|dep| self.dependency_satisfied(dep))
        })
    }

    fn dependency_satisfied(&self, dep: &Ticket) -> bool {
        if dep.status.satisfies_dependents() {
            return true;
        }
        self.is_optional_dependency(dep)
    }

    /// A database ticket stuck awaiting input is optional when the plan mocks
    /// its data layer.
    fn is_optional_dependency(&self, dep: &Ticket) -> bool {
        self.data_mode == DataMode::Mocked
            && dep.ticket_type == TicketType::Database
            && dep.status == TicketStatus::AwaitingInput
    }

    fn dependency_blocks(&self, dep: &Ticket) -> bool {
        if self.is_optional_dependency(dep) {
            return false;
        }
        matches!(
            dep.status,
            TicketStatus::Failed | TicketStatus::Blocked | TicketStatus::AwaitingInput
        )
    }

    /// Compute blocked/unblocked transitions. Tickets with a failing blocker
    /// move to `blocked`; tickets previously blocked *by a dependency* whose
    /// blockers have all recovered return to `backlog`.
    pub fn propagate_blocked(&self, tickets: &BTreeMap<String, Ticket>) -> Vec<StatusChange> {
        let mut changes = Vec::new();

        for ticket in tickets.values() {
            let blocker = ticket
                .dependencies
                .iter()
                .filter_map(|id| tickets.get(id))
                .find(|dep| self.dependency_blocks(dep));

            match (&ticket.status, blocker) {
                (TicketStatus::Backlog | TicketStatus::Rebasing, Some(dep)) => {
                    changes.push(StatusChange {
                        ticket_id: ticket.id.clone(),
                        status: TicketStatus::Blocked,
                        reason: Some(dependency_block_reason(dep)),
                    });
                }
                (TicketStatus::Blocked, None) => {
                    // Only dependency-caused blocks auto-recover.
                    if ticket
                        .blocked_reason
                        .as_deref()
                        .is_some_and(is_dependency_block_reason)
                    {
                        changes.push(StatusChange {
                            ticket_id: ticket.id.clone(),
                            status: TicketStatus::Backlog,
                            reason: None,
                        });
                    }
                }
                _ => {}
            }
        }

        changes
    }
}

fn dependency_block_reason(dep: &Ticket) -> String {
    format!("dependency {} is {}", dep.id, dep.status)
}

fn is_dependency_block_reason(reason: &str) -> bool {
    reason.starts_with("dependency ")
}
