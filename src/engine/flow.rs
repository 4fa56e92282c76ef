//! Adaptive flow control between generation and the serialized merge stage.
//!
//! The further a patch's base lags behind the current snapshot, the likelier
//! it is to conflict, so the scheduler caps buffered-but-unmerged patches.
//! When the merge stage stalls with work queued, the cap is raised to a hard
//! ceiling so generation doesn't starve; it reverts the instant a version
//! advance is observed.

use std::time::{Duration, Instant};

/// Tracks merge progress and computes the effective buffer cap.
#[derive(Debug)]
pub struct FlowControl {
    base_cap: usize,
    ceiling: usize,
    stall_window: Duration,
    last_version: u64,
    last_advance: Instant,
    raised: bool,
}

impl FlowControl {
    pub fn new(base_cap: usize, ceiling: usize, stall_window: Duration) -> Self {
        Self {
            base_cap,
            ceiling: ceiling.max(base_cap),
            stall_window,
            last_version: 0,
            last_advance: Instant::now(),
            raised: false,
        }
    }

    /// Feed the currently observed snapshot version.
    pub fn observe_version(&mut self, version: u64, now: Instant) {
        if version > self.last_version {
            self.last_version = version;
            self.last_advance = now;
            self.raised = false;
        }
    }

    /// Effective cap given how many patches are buffered right now.
    pub fn effective_cap(&mut self, buffered: usize, now: Instant) -> usize {
        if !self.raised
            && buffered > 0
            && now.duration_since(self.last_advance) >= self.stall_window
        {
            self.raised = true;
        }
        if self.raised { self.ceiling } else { self.base_cap }
    }

    /// Whether another patch may enter the pipeline.
    pub fn admits(&mut self, buffered: usize, now: Instant) -> bool {
        buffered < self.effective_cap(buffered, now)
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowControl {
        FlowControl::new(4, 8, Duration::from_secs(60))
    }

    #[test]
    fn test_base_cap_applies_initially() {
        let mut flow = flow();
        let now = Instant::now();
        assert!(flow.admits(3, now));
        assert!(!flow.admits(4, now));
    }

    #[test]
    fn test_stall_raises_cap_to_ceiling() {
        let mut flow = flow();
        let now = Instant::now();
        let later = now + Duration::from_secs(61);

        assert_eq!(flow.effective_cap(4, later), 8);
        assert!(flow.is_raised());
        assert!(flow.admits(7, later));
        assert!(!flow.admits(8, later));
    }

    #[test]
    fn test_stall_requires_queued_work() {
        let mut flow = flow();
        let later = Instant::now() + Duration::from_secs(120);
        // Nothing buffered: an idle pipeline is not a stall
        assert_eq!(flow.effective_cap(0, later), 4);
        assert!(!flow.is_raised());
    }

    #[test]
    fn test_version_advance_reverts_cap() {
        let mut flow = flow();
        let now = Instant::now();
        let later = now + Duration::from_secs(61);
        assert_eq!(flow.effective_cap(4, later), 8);

        flow.observe_version(1, later);
        assert!(!flow.is_raised());
        assert_eq!(flow.effective_cap(4, later), 4);
    }

    #[test]
    fn test_stale_version_does_not_reset_stall_clock() {
        let mut flow = flow();
        let now = Instant::now();
        flow.observe_version(2, now);
        let later = now + Duration::from_secs(61);
        // Re-observing the same version is not progress
        flow.observe_version(2, later);
        assert_eq!(flow.effective_cap(4, later), 8);
    }

    #[test]
    fn test_ceiling_never_below_cap() {
        let mut flow = FlowControl::new(10, 2, Duration::from_secs(1));
        let later = Instant::now() + Duration::from_secs(2);
        assert!(flow.effective_cap(5, later) >= 10);
    }
}
