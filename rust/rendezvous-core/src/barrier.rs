// rust/rendezvous-core/src/barrier.rs

//! Counting barrier used to park a rank until its RPC handlers have run.
//!
//! The monitor is a latch with an explicit phase. A round starts with
//! [`BarrierMonitor::reset`], handlers call [`BarrierMonitor::signal`], and
//! the owner blocks in [`BarrierMonitor::wait`] until the expected number of
//! signals has arrived or the monitor is stopped.
//!
//! ```text
//! Initialized --reset--> Waiting --signal x N--> Signaled
//!      |                    |                       |
//!      +-------stop---------+---------stop----------+--> Stopped
//! ```

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RendezvousError, Result};

/// Lifecycle phase of a [`BarrierMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierPhase {
    #[default]
    Initialized,
    Waiting,
    Signaled,
    Stopped,
}

/// What a barrier round is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Waiting for senders to finish pushing variables.
    Send,
    /// Waiting for a variable batch to be received.
    Receive,
}

/// Snapshot of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarrierState {
    pub target: usize,
    pub count: usize,
    pub phase: BarrierPhase,
    pub kind: Option<BarrierKind>,
}

/// Why [`BarrierMonitor::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRelease {
    /// All expected signals arrived.
    Signaled,
    /// The monitor was stopped first.
    Stopped,
}

/// Phase-tagged counting latch.
///
/// One monitor belongs to one rendezvous call; share it with handlers
/// through an `Arc`.
#[derive(Debug)]
pub struct BarrierMonitor {
    state: watch::Sender<BarrierState>,
}

impl Default for BarrierMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrierMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BarrierState::default());
        Self { state }
    }

    pub fn state(&self) -> BarrierState {
        *self.state.borrow()
    }

    pub fn phase(&self) -> BarrierPhase {
        self.state.borrow().phase
    }

    /// Starts a round expecting `expected` signals.
    ///
    /// Re-issuing the exact same reset before any signal arrived is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::State`] if `expected` is zero or the
    /// monitor is still waiting on a different round.
    pub fn reset(&self, expected: usize, kind: BarrierKind) -> Result<()> {
        if expected == 0 {
            return Err(RendezvousError::state(
                self.phase(),
                "expected signal count must be greater than 0",
            ));
        }

        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.phase == BarrierPhase::Waiting {
                let same_round =
                    state.target == expected && state.kind == Some(kind) && state.count == 0;
                if !same_round {
                    outcome = Err(RendezvousError::state(
                        state.phase,
                        format!(
                            "cannot reset to {} {:?} signal(s) while {}/{} {:?} signal(s) are pending",
                            expected,
                            kind,
                            state.count,
                            state.target,
                            state.kind
                        ),
                    ));
                }
                return false;
            }

            *state = BarrierState {
                target: expected,
                count: 0,
                phase: BarrierPhase::Waiting,
                kind: Some(kind),
            };
            true
        });

        if outcome.is_ok() {
            tracing::debug!(expected, ?kind, "barrier reset");
        }
        outcome
    }

    /// Records one signal, releasing waiters once the target is reached.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::State`] unless the monitor is `Waiting`.
    pub fn signal(&self) -> Result<BarrierState> {
        let mut outcome = Err(RendezvousError::state(
            BarrierPhase::Initialized,
            "signal on an uninitialized barrier",
        ));
        self.state.send_if_modified(|state| match state.phase {
            BarrierPhase::Waiting => {
                state.count += 1;
                if state.count >= state.target {
                    state.phase = BarrierPhase::Signaled;
                }
                outcome = Ok(*state);
                true
            }
            phase => {
                outcome = Err(RendezvousError::state(
                    phase,
                    "signal received outside of a waiting round",
                ));
                false
            }
        });

        if let Ok(state) = &outcome {
            tracing::debug!(count = state.count, target = state.target, "barrier signaled");
        }
        outcome
    }

    /// Blocks until the round completes or the monitor is stopped.
    ///
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`RendezvousError::State`] if the monitor was never reset and
    /// [`RendezvousError::Timeout`] if `timeout` elapses first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<BarrierRelease> {
        let mut rx = self.state.subscribe();
        let current = *rx.borrow();
        if current.phase == BarrierPhase::Initialized {
            return Err(RendezvousError::state(
                current.phase,
                "wait on a barrier that was never reset",
            ));
        }

        let released = rx.wait_for(|state| {
            matches!(state.phase, BarrierPhase::Signaled | BarrierPhase::Stopped)
        });

        let phase = match timeout {
            Some(limit) => match tokio::time::timeout(limit, released).await {
                Ok(result) => result.map(|state| state.phase),
                Err(_) => {
                    return Err(RendezvousError::timeout(
                        format!(
                            "waiting for {} {:?} barrier signal(s)",
                            current.target,
                            current.kind
                        ),
                        limit,
                    ));
                }
            },
            None => released.await.map(|state| state.phase),
        }
        .map_err(|_| RendezvousError::state(current.phase, "barrier dropped while waiting"))?;

        Ok(match phase {
            BarrierPhase::Stopped => BarrierRelease::Stopped,
            _ => BarrierRelease::Signaled,
        })
    }

    /// Moves to `Stopped` and releases every waiter. Idempotent.
    pub fn stop(&self) {
        let stopped = self.state.send_if_modified(|state| {
            if state.phase == BarrierPhase::Stopped {
                return false;
            }
            state.phase = BarrierPhase::Stopped;
            true
        });
        if stopped {
            tracing::debug!("barrier stopped");
        }
    }
}
