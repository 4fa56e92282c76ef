//! Run lifecycle controller: status machine, pause gate, cancellation.
//!
//! `queued → running ⇄ paused → {completed | failed | cancelled}`. Pause is
//! cooperative: every loop about to start new work awaits the gate first.
//! Cancel is terminal and idempotent; the shared token aborts every in-flight
//! external call.

use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{EventBus, RunEventKind, RunStatus};

/// Why a pause wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Not paused, or resumed; proceed with new work.
    Proceed,
    /// The run was cancelled while waiting.
    Cancelled,
}

/// Shared controller for one run's lifecycle.
#[derive(Debug)]
pub struct RunController {
    status: Mutex<RunStatus>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    events: EventBus,
}

impl RunController {
    pub fn new(events: EventBus) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            status: Mutex::new(RunStatus::Queued),
            paused,
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.events.run_id()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock().expect("status lock")
    }

    /// Transition the run status and notify observers. Terminal statuses are
    /// sticky; only `cancel` may override a non-terminal status at any time.
    pub fn set_status(&self, next: RunStatus) {
        let mut status = self.status.lock().expect("status lock");
        if status.is_terminal() {
            return;
        }
        if *status == next {
            return;
        }
        *status = next;
        drop(status);
        self.events.emit(RunEventKind::RunStatus { status: next });
    }

    /// Pause the run: loops finish the work they hold, then wait at the gate.
    pub fn pause(&self) {
        if self.status() != RunStatus::Running {
            return;
        }
        self.set_status(RunStatus::Paused);
        self.paused.send_replace(true);
    }

    /// Lift the pause gate and release all waiters.
    pub fn resume(&self) {
        if self.status() != RunStatus::Paused {
            return;
        }
        self.set_status(RunStatus::Running);
        self.paused.send_replace(false);
    }

    /// Cancel the run. Idempotent; also unblocks every pause waiter.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.paused.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token threaded into every outbound service call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait for the pause gate to lift. Returns immediately when not paused.
    pub async fn wait_if_paused(&self) -> GateOutcome {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return GateOutcome::Cancelled;
            }
            if !*rx.borrow_and_update() {
                return GateOutcome::Proceed;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return GateOutcome::Cancelled,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return GateOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller() -> RunController {
        RunController::new(EventBus::new(Uuid::new_v4(), 64))
    }

    #[tokio::test]
    async fn test_gate_passes_when_not_paused() {
        let ctl = controller();
        assert_eq!(ctl.wait_if_paused().await, GateOutcome::Proceed);
    }

    #[tokio::test]
    async fn test_pause_blocks_until_resume() {
        let ctl = Arc::new(controller());
        ctl.set_status(RunStatus::Running);
        ctl.pause();
        assert_eq!(ctl.status(), RunStatus::Paused);

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_if_paused().await })
        };
        // The waiter must still be parked after a short delay
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ctl.resume();
        assert_eq!(waiter.await.unwrap(), GateOutcome::Proceed);
        assert_eq!(ctl.status(), RunStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pause_waiters() {
        let ctl = Arc::new(controller());
        ctl.set_status(RunStatus::Running);
        ctl.pause();

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_if_paused().await })
        };
        ctl.cancel();
        assert_eq!(waiter.await.unwrap(), GateOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let ctl = controller();
        ctl.cancel();
        ctl.cancel();
        assert!(ctl.is_cancelled());
    }

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let ctl = controller();
        ctl.set_status(RunStatus::Running);
        ctl.set_status(RunStatus::Completed);
        ctl.set_status(RunStatus::Running);
        assert_eq!(ctl.status(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_status_transitions_emit_events() {
        let ctl = controller();
        let mut rx = ctl.events().subscribe();
        ctl.set_status(RunStatus::Running);

        let event = rx.recv().await.unwrap();
        match event.kind {
            RunEventKind::RunStatus { status } => assert_eq!(status, RunStatus::Running),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pause_only_applies_while_running() {
        let ctl = controller();
        // Still queued: pause is a no-op
        ctl.pause();
        assert_eq!(ctl.status(), RunStatus::Queued);
        assert!(!ctl.is_paused());
    }
}
